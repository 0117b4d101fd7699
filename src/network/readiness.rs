//! Single-fd readiness wait dengan absolute deadline.
//!
//! Memakai poll(2) level-triggered langsung pada satu fd: tidak perlu
//! registry, dan tidak bentrok dengan registrasi mio yang mungkin sedang
//! dipegang sebuah [`PollSet`](super::PollSet) untuk koneksi yang sama
//! (satu mio source hanya boleh terdaftar di satu registry).
//!
//! Deadline bersifat absolut: timeout dihitung ulang dari deadline yang
//! sama setiap retry (EINTR), jadi wait berulang mengetat seiring waktu
//! dan tidak pernah drift.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Instant;

/// Hasil sebuah wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Fd siap dibaca/ditulis (atau error/hangup terlapor - caller akan
    /// menemukannya saat drive).
    Ready,
    /// Deadline lewat tanpa readiness.
    TimedOut,
}

/// Block sampai `fd` readable (plus writable jika `want_write`) atau
/// `deadline` lewat. Deadline di masa lalu = non-blocking poll.
pub(crate) fn wait_fd(fd: RawFd, want_write: bool, deadline: Instant) -> io::Result<WaitStatus> {
    let mut events = libc::POLLIN;
    if want_write {
        events |= libc::POLLOUT;
    }

    loop {
        let now = Instant::now();
        let timeout_ms: libc::c_int = if deadline <= now {
            0
        } else {
            // Truncation ke bawah tidak apa-apa: loop re-check deadline
            deadline
                .duration_since(now)
                .as_millis()
                .min(libc::c_int::MAX as u128) as libc::c_int
        };

        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue; // EINTR: ulangi terhadap deadline absolut yang sama
            }
            return Err(err);
        }
        if rc > 0 {
            return Ok(WaitStatus::Ready);
        }
        if Instant::now() >= deadline {
            return Ok(WaitStatus::TimedOut);
        }
    }
}
