//! Payload source: asal byte untuk satu pesan keluar di queue.

use std::fs::File;
use std::io::{self, Read};

/// Ukuran stage buffer untuk streaming file ke socket
const STAGE_SIZE: usize = 64 * 1024; // 64KB

/// Asal payload sebuah pesan outbound.
///
/// `Buffer` menguras `Vec` lewat cursor. `File` membaca ke stage buffer
/// pre-allocated lalu menulisnya ke socket; byte yang sudah terbaca dari
/// file tapi belum terkirim (partial write) tetap tinggal di stage sampai
/// socket menerimanya.
pub(crate) enum Source {
    Buffer {
        data: Vec<u8>,
        pos: usize,
    },
    File {
        file: File,
        /// Bytes file yang belum masuk stage
        remaining: u64,
        stage: Box<[u8]>,
        stage_pos: usize,
        stage_len: usize,
    },
}

impl Source {
    /// Source dari memory buffer. Return (panjang payload, source).
    pub(crate) fn from_vec(data: Vec<u8>) -> (u64, Self) {
        let len = data.len() as u64;
        (len, Source::Buffer { data, pos: 0 })
    }

    /// Source dari file. Panjang payload ditetapkan dari metadata saat
    /// enqueue; file yang berubah ukuran selama pengiriman di luar kontrak.
    pub(crate) fn from_file(file: File) -> io::Result<(u64, Self)> {
        let remaining = file.metadata()?.len();
        Ok((
            remaining,
            Source::File {
                file,
                remaining,
                stage: vec![0u8; STAGE_SIZE].into_boxed_slice(),
                stage_pos: 0,
                stage_len: 0,
            },
        ))
    }

    /// Slice byte berikutnya yang siap ditulis ke socket, refill stage dari
    /// file bila perlu. `None` = source sudah habis.
    pub(crate) fn pending(&mut self) -> io::Result<Option<&[u8]>> {
        match self {
            Source::Buffer { data, pos } => {
                if *pos >= data.len() {
                    Ok(None)
                } else {
                    Ok(Some(&data[*pos..]))
                }
            }
            Source::File {
                file,
                remaining,
                stage,
                stage_pos,
                stage_len,
            } => {
                if *stage_pos >= *stage_len {
                    if *remaining == 0 {
                        return Ok(None);
                    }
                    let want = (*remaining).min(stage.len() as u64) as usize;
                    let n = file.read(&mut stage[..want])?;
                    if n == 0 {
                        // File menyusut di bawah ukuran saat enqueue
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "file source truncated during send",
                        ));
                    }
                    *remaining -= n as u64;
                    *stage_pos = 0;
                    *stage_len = n;
                }
                Ok(Some(&stage[*stage_pos..*stage_len]))
            }
        }
    }

    /// Tandai `n` bytes hasil `pending()` sudah diterima socket.
    pub(crate) fn advance(&mut self, n: usize) {
        match self {
            Source::Buffer { pos, .. } => *pos += n,
            Source::File { stage_pos, .. } => *stage_pos += n,
        }
    }
}
