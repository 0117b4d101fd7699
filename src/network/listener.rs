//! Listener: socket bound + listening yang memproduksi Connection.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::time::Instant;

use mio::net::TcpListener;

use crate::error::{Result, TransportError};

use super::connection::Connection;
use super::readiness::{wait_fd, WaitStatus};

/// Sisi server: terima koneksi masuk satu per satu lewat
/// [`Listener::accept`]. Socket non-blocking sejak bind.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Bind dan listen di `addr:port`. Port 0 = ephemeral (lihat
    /// [`Listener::local_addr`]).
    pub fn bind(addr: &str, port: u16) -> Result<Self> {
        let target: SocketAddr = (addr, port)
            .to_socket_addrs()
            .map_err(TransportError::Bind)?
            .next()
            .ok_or_else(|| {
                TransportError::Bind(io::Error::new(
                    io::ErrorKind::NotFound,
                    "address did not resolve",
                ))
            })?;

        let inner = TcpListener::bind(target).map_err(TransportError::Bind)?;
        Ok(Self { inner })
    }

    /// Alamat lokal tempat listener terikat.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Terima satu koneksi pending. [`TransportError::WouldBlock`] jika
    /// belum ada client - wait dulu readability lewat [`Listener::wait`].
    pub fn accept(&self) -> Result<Connection> {
        loop {
            match self.inner.accept() {
                Ok((stream, _addr)) => return Ok(Connection::accepted(stream)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(TransportError::WouldBlock)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    /// Block sampai ada koneksi pending atau `deadline` lewat.
    pub fn wait(&self, deadline: Instant) -> Result<WaitStatus> {
        wait_fd(self.inner.as_raw_fd(), false, deadline).map_err(TransportError::Io)
    }
}
