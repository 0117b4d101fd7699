//! Courier - Message-Oriented TCP Transport
//!
//! Transport pesan length-delimited di atas TCP non-blocking:
//! - Payload dikirim dari memory atau di-stream langsung dari file
//! - Receiver memilih tujuan (memory/file) per pesan, independen dari sender
//! - Satu thread melayani banyak koneksi lewat [`PollSet`]
//!
//! Semua operasi non-blocking; satu-satunya titik blocking adalah
//! [`Connection::wait`] / [`PollSet::wait`], keduanya dengan absolute
//! deadline. Progress I/O terjadi lewat [`Connection::drive`] yang dipanggil
//! caller setiap kali readiness dilaporkan.

pub mod error;
pub mod network;
pub mod protocol;
pub mod transfer;

pub use error::{Result, TransportError};
pub use network::{Connection, Listener, PollSet, Progress, WaitStatus};
pub use protocol::{FrameHeader, HEADER_SIZE};
pub use transfer::{Delivery, Payload, PayloadKind};
