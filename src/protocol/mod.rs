//! Protocol layer: wire framing untuk pesan length-delimited.
//!
//! Prinsip desain:
//! - Fixed-size header: posisi resume saat partial I/O selalu jelas
//! - Payload opaque: transport tidak tahu isi pesan, hanya panjangnya

mod frame;

pub use frame::{FrameHeader, HEADER_SIZE, MAGIC, MAX_FRAME_LEN, VERSION};
