//! Error taxonomy untuk transport layer.
//!
//! `WouldBlock` bukan failure - itu outcome normal dari non-blocking I/O
//! yang harus di-check caller, sama seperti `io::ErrorKind::WouldBlock`.
//! `Closed` bersifat terminal per koneksi: tidak ada retry internal.

use std::io;

use thiserror::Error;

/// Result alias untuk seluruh crate.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Semua kondisi gagal (dan non-gagal yang expected) dari transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Operasi akan block; coba lagi setelah readiness dilaporkan.
    #[error("operation would block")]
    WouldBlock,

    /// API misuse oleh caller (arm saat masih armed, send saat closed).
    #[error("invalid connection state: {0}")]
    InvalidState(&'static str),

    /// Resolusi alamat atau connect gagal.
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    /// Bind/listen gagal.
    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),

    /// Peer menutup koneksi (EOF/reset). Terminal untuk koneksi ini.
    #[error("connection closed by peer")]
    Closed,

    /// Koneksi sudah terdaftar di sebuah poll set.
    #[error("connection already registered with a poll set")]
    AlreadyRegistered,

    /// Koneksi tidak terdaftar di poll set ini.
    #[error("connection not registered with this poll set")]
    NotRegistered,

    /// Frame header rusak: magic/versi salah atau panjang di luar batas.
    #[error("malformed frame header")]
    BadFrame,

    /// OS-level error yang tidak terklasifikasi.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// `true` jika error ini adalah `WouldBlock` (expected, bukan failure).
    #[inline(always)]
    pub fn is_would_block(&self) -> bool {
        matches!(self, TransportError::WouldBlock)
    }
}
