//! Poll set: readiness fan-in untuk banyak koneksi sekaligus.
//!
//! Satu thread manager bisa menunggu N koneksi worker dengan satu wait
//! call. Poll set hanya melaporkan readiness - ia tidak pernah men-drive
//! member; urutan dan fairness antar koneksi yang siap sepenuhnya di
//! tangan caller.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::{Result, TransportError};

use super::connection::Connection;

const EVENTS_CAPACITY: usize = 1024;

struct Member {
    fd: RawFd,
    /// Hint dari Connection: delivery pending / koneksi berakhir.
    /// Perlu karena mio edge-triggered - pesan yang selesai lewat pump
    /// oportunistik tidak meninggalkan event socket, tapi member tetap
    /// harus dilaporkan siap.
    attention: Arc<AtomicBool>,
    /// Hint dari Connection: writability masih relevan (handshake atau
    /// outbound pending). Tanpa ini, interest WRITABLE permanen membuat
    /// setiap socket sehat terlapor siap terus-menerus.
    wants_write: Arc<AtomicBool>,
    /// Interest yang sedang terdaftar di registry
    interest: Interest,
    /// Readiness terakhir yang diamati wait()
    ready: bool,
}

fn desired_interest(wants_write: bool) -> Interest {
    if wants_write {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

/// Registry koneksi untuk satu wait call lintas banyak peer.
///
/// Poll set tidak memiliki koneksinya: registrasi memakai raw fd, dan
/// drop poll set tidak menutup member. Koneksi harus di-[`remove`] dulu
/// sebelum di-drop atau didaftarkan ke poll set lain.
///
/// [`remove`]: PollSet::remove
pub struct PollSet {
    poll: Poll,
    events: Events,
    members: HashMap<Token, Member>,
    next_token: usize,
}

impl PollSet {
    /// Registry kosong.
    pub fn new() -> Result<Self> {
        Ok(Self {
            poll: Poll::new().map_err(TransportError::Io)?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            members: HashMap::new(),
            next_token: 0,
        })
    }

    /// Daftarkan koneksi. [`TransportError::AlreadyRegistered`] jika
    /// sudah terdaftar di poll set manapun.
    pub fn add(&mut self, conn: &mut Connection) -> Result<()> {
        if conn.token.is_some() {
            return Err(TransportError::AlreadyRegistered);
        }
        let token = Token(self.next_token);
        self.next_token += 1;

        let fd = conn.raw_fd();
        let wants_write = conn.wants_write_flag();
        let interest = desired_interest(wants_write.load(Ordering::Acquire));
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, interest)
            .map_err(TransportError::Io)?;

        self.members.insert(
            token,
            Member {
                fd,
                attention: conn.attention_flag(),
                wants_write,
                interest,
                ready: false,
            },
        );
        conn.token = Some(token);
        Ok(())
    }

    /// Cabut registrasi koneksi.
    /// [`TransportError::NotRegistered`] jika bukan member poll set ini.
    pub fn remove(&mut self, conn: &mut Connection) -> Result<()> {
        let token = match conn.token {
            Some(t) => t,
            None => return Err(TransportError::NotRegistered),
        };
        let member = match self.members.remove(&token) {
            Some(m) => m,
            // Token milik poll set lain
            None => return Err(TransportError::NotRegistered),
        };
        self.poll
            .registry()
            .deregister(&mut SourceFd(&member.fd))
            .map_err(TransportError::Io)?;
        conn.token = None;
        Ok(())
    }

    /// Block sampai minimal satu member siap atau `deadline` lewat.
    /// Return jumlah member yang siap (0 = timeout). Deadline di masa
    /// lalu = non-blocking poll. Setelah wait, caller memeriksa member
    /// lewat [`PollSet::is_ready`] dan men-drive yang dipilihnya.
    pub fn wait(&mut self, deadline: Instant) -> Result<usize> {
        for member in self.members.values_mut() {
            member.ready = false;
        }

        loop {
            // Selaraskan interest dengan kebutuhan member saat ini;
            // reregister juga me-rearm edge yang mungkin sudah lewat
            let mut hinted = false;
            for (token, member) in self.members.iter_mut() {
                let desired = desired_interest(member.wants_write.load(Ordering::Acquire));
                if desired != member.interest {
                    self.poll
                        .registry()
                        .reregister(&mut SourceFd(&member.fd), *token, desired)
                        .map_err(TransportError::Io)?;
                    member.interest = desired;
                }
                // Member dengan attention pending langsung dihitung siap:
                // event socket-nya mungkin sudah terkonsumsi pump sebelumnya
                if member.attention.load(Ordering::Acquire) {
                    member.ready = true;
                    hinted = true;
                }
            }

            let timeout = if hinted {
                Duration::ZERO
            } else {
                deadline.saturating_duration_since(Instant::now())
            };

            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Io(e)),
            }

            for event in self.events.iter() {
                if let Some(member) = self.members.get_mut(&event.token()) {
                    member.ready = true;
                }
            }

            let ready = self.members.values().filter(|m| m.ready).count();
            if ready > 0 || Instant::now() >= deadline {
                return Ok(ready);
            }
        }
    }

    /// Readiness `conn` yang diamati pada wait terakhir.
    pub fn is_ready(&self, conn: &Connection) -> bool {
        conn.token
            .and_then(|t| self.members.get(&t))
            .map(|m| m.ready)
            .unwrap_or(false)
    }

    /// Jumlah member terdaftar.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// `true` jika tidak ada member.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
