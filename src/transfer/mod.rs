//! Transfer layer: sink (payload masuk) dan source (payload keluar).
//!
//! Receiver dan sender sama-sama memilih antara memory buffer dan file,
//! independen satu sama lain: pesan yang dikirim dari file boleh diterima
//! ke buffer, dan sebaliknya. File di-stream chunk demi chunk - pesan
//! besar tidak pernah dimaterialisasi penuh di memory.

mod sink;
mod source;

pub use sink::{Delivery, Payload, PayloadKind};
pub(crate) use source::Source;
