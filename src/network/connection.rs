//! Connection: state machine non-blocking untuk send/receive pesan.
//!
//! Satu connection memegang:
//! - outbound queue (FIFO) - urutan enqueue adalah urutan kirim
//! - satu read state di wire (header/body) plus sink yang di-arm receiver
//! - slot untuk satu delivery yang sudah selesai
//!
//! Semua I/O non-blocking. Progress terjadi lewat [`Connection::drive`]
//! yang dipanggil caller setelah [`Connection::wait`] /
//! [`PollSet::wait`](super::PollSet::wait) melaporkan readiness, atau
//! langsung dalam tight loop.
//!
//! Catatan edge-triggered: socket yang sudah ready tidak akan melapor
//! ulang lewat mio, jadi `send_*` dan `recv_into_*` langsung mencoba
//! flush/baca setelah mengubah state. Satu-satunya titik berhenti pump
//! adalah selesai, menunggu sink, atau WouldBlock.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use mio::net::TcpStream;
use mio::Token;

use crate::error::{Result, TransportError};
use crate::protocol::{FrameHeader, HEADER_SIZE};
use crate::transfer::{Delivery, Payload, Source};

use super::readiness::{wait_fd, WaitStatus};

/// Ukuran scratch buffer untuk streaming payload masuk
const READ_CHUNK_SIZE: usize = 64 * 1024; // 64KB

/// Socket buffer size (SO_SNDBUF/SO_RCVBUF) - tuned untuk transfer file
const SOCKET_BUF_SIZE: libc::c_int = 256 * 1024; // 256KB

/// Fase hidup sebuah koneksi.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    /// Handshake TCP belum selesai; terlihat lewat writability
    Connecting,
    Connected,
    /// Terminal - tidak ada reconnect otomatis
    Closed,
}

/// Hasil satu langkah [`Connection::drive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Tidak ada yang bisa maju (WouldBlock di semua arah).
    Idle,
    /// Minimal satu pesan outbound selesai terkirim.
    Sent,
    /// Satu pesan inbound selesai - ambil lewat [`Connection::recv`].
    Received,
    /// Koneksi berakhir (EOF/reset dari peer, atau sudah ditutup).
    Closed,
}

/// Pesan outbound yang menunggu di queue. Hanya head queue yang boleh
/// dalam keadaan terkirim sebagian.
struct Outbound {
    header: [u8; HEADER_SIZE],
    header_pos: usize,
    source: Source,
}

impl Outbound {
    fn new(payload_len: u64, source: Source) -> Self {
        Self {
            header: FrameHeader::new(payload_len).encode(),
            header_pos: 0,
            source,
        }
    }
}

/// Posisi read state machine di wire.
enum ReadState {
    /// Mengumpulkan header - bisa tiba terpotong lintas beberapa read
    Header { buf: [u8; HEADER_SIZE], filled: usize },
    /// Streaming payload ke sink yang di-arm
    Body { remaining: u64, total: u64 },
}

impl ReadState {
    fn fresh() -> Self {
        ReadState::Header {
            buf: [0u8; HEADER_SIZE],
            filled: 0,
        }
    }
}

/// Hasil satu langkah write pump.
#[derive(Debug, PartialEq, Eq)]
enum SendStep {
    /// Pesan di head queue selesai terkirim seluruhnya
    Done,
    /// Socket WouldBlock; resume dari offset yang tercatat
    Blocked,
}

/// Hasil satu langkah read pump.
#[derive(Debug, PartialEq, Eq)]
enum RecvStep {
    /// Socket WouldBlock
    Blocked,
    /// Header lengkap tapi receiver belum arm sink; payload dibiarkan
    /// di kernel buffer sampai receiver memutuskan tujuannya
    NeedSink,
    /// Satu pesan selesai (panjang payload terlampir)
    Completed(u64),
    /// Peer menutup koneksi
    Eof,
}

/// Satu ujung koneksi transport.
///
/// Dibuat lewat [`Connection::connect`] (client) atau
/// [`Listener::accept`](super::Listener::accept) (server). State internal
/// hanya dimutasi lewat `&mut self` - kepemilikan single-threaded per
/// koneksi; koordinasi lintas thread adalah urusan caller.
pub struct Connection {
    stream: TcpStream,
    state: ConnState,
    send_queue: VecDeque<Outbound>,
    read_state: ReadState,
    sink: Option<Payload>,
    delivery: Option<Delivery>,
    scratch: Box<[u8]>,
    /// Error dari pump oportunistik (enqueue/arm), dilaporkan di drive berikut
    pending_error: Option<TransportError>,
    /// Penutupan datang dari transport (EOF/reset/error), bukan dari
    /// close() milik caller - menentukan error untuk operasi berikutnya
    closed_by_peer: bool,
    /// Hint untuk PollSet: delivery pending atau koneksi berakhir
    attention: Arc<AtomicBool>,
    /// Hint untuk PollSet: masih ada alasan menunggu writability
    /// (handshake berjalan atau outbound queue belum kosong)
    wants_write: Arc<AtomicBool>,
    /// Token registrasi di PollSet (None = tidak terdaftar)
    pub(crate) token: Option<Token>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("send_queue_len", &self.send_queue.len())
            .field("closed_by_peer", &self.closed_by_peer)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Mulai koneksi non-blocking ke `addr:port`.
    ///
    /// Socket langsung non-blocking; selesainya handshake TCP diamati
    /// lewat writability pada drive/wait berikutnya.
    pub fn connect(addr: &str, port: u16) -> Result<Self> {
        let target: SocketAddr = (addr, port)
            .to_socket_addrs()
            .map_err(TransportError::Connect)?
            .next()
            .ok_or_else(|| {
                TransportError::Connect(io::Error::new(
                    io::ErrorKind::NotFound,
                    "address did not resolve",
                ))
            })?;

        let stream = TcpStream::connect(target).map_err(TransportError::Connect)?;
        Ok(Self::from_stream(stream, ConnState::Connecting))
    }

    /// Bungkus socket hasil accept (handshake sudah selesai).
    pub(crate) fn accepted(stream: TcpStream) -> Self {
        Self::from_stream(stream, ConnState::Connected)
    }

    fn from_stream(stream: TcpStream, state: ConnState) -> Self {
        tune_socket(&stream);
        Self {
            stream,
            state,
            send_queue: VecDeque::new(),
            read_state: ReadState::fresh(),
            sink: None,
            delivery: None,
            scratch: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
            pending_error: None,
            closed_by_peer: false,
            attention: Arc::new(AtomicBool::new(false)),
            wants_write: Arc::new(AtomicBool::new(state == ConnState::Connecting)),
            token: None,
        }
    }

    /// Alamat peer (gagal selama handshake belum selesai).
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// `true` setelah handshake selesai diamati (dan belum closed).
    #[inline(always)]
    pub fn is_connected(&self) -> bool {
        self.state == ConnState::Connected
    }

    /// `true` setelah koneksi berakhir (peer menutup atau `close`).
    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Enqueue pesan dari memory buffer. Tidak pernah block; transfer
    /// berjalan lazy saat socket writable.
    pub fn send_bytes(&mut self, data: Vec<u8>) -> Result<()> {
        self.check_open("send on closed connection")?;
        let (len, source) = Source::from_vec(data);
        self.enqueue(len, source)
    }

    /// Enqueue pesan yang payload-nya di-stream dari `file`. Panjang
    /// ditetapkan dari metadata file saat enqueue; file ditutup saat
    /// pesan selesai terkirim dan di-drop dari queue.
    pub fn send_file(&mut self, file: File) -> Result<()> {
        self.check_open("send on closed connection")?;
        let (len, source) = Source::from_file(file)?;
        self.enqueue(len, source)
    }

    fn enqueue(&mut self, len: u64, source: Source) -> Result<()> {
        self.send_queue.push_back(Outbound::new(len, source));
        self.opportunistic_pump();
        self.sync_flags();
        Ok(())
    }

    /// Arm receive berikutnya ke memory buffer. Buffer dikembalikan
    /// (berikut isi pesan) lewat [`Connection::recv`].
    pub fn recv_into_buffer(&mut self, buf: Vec<u8>) -> Result<()> {
        self.arm(Payload::Buffer(buf))
    }

    /// Arm receive berikutnya langsung ke `file` - payload ditulis chunk
    /// demi chunk begitu tiba, tanpa staging pesan penuh di memory.
    pub fn recv_into_file(&mut self, file: File) -> Result<()> {
        self.arm(Payload::File(file))
    }

    fn arm(&mut self, sink: Payload) -> Result<()> {
        self.check_open("receive on closed connection")?;
        if self.sink.is_some() {
            return Err(TransportError::InvalidState("a receive is already armed"));
        }
        if self.delivery.is_some() {
            return Err(TransportError::InvalidState(
                "previous delivery not collected",
            ));
        }
        self.sink = Some(sink);
        self.opportunistic_pump();
        self.sync_flags();
        Ok(())
    }

    /// Pump langsung setelah enqueue/arm. Error disimpan dan dilaporkan
    /// di drive berikutnya, seperti error yang terdeteksi saat wait.
    fn opportunistic_pump(&mut self) {
        if self.state != ConnState::Connected {
            return;
        }
        if let Err(err) = self.pump() {
            self.pending_error = Some(err);
        }
    }

    /// Ambil delivery yang sudah selesai (kind mencerminkan sink yang
    /// di-arm receiver, bukan source milik sender).
    pub fn recv(&mut self) -> Option<Delivery> {
        let delivery = self.delivery.take();
        self.sync_flags();
        delivery
    }

    /// Majukan I/O sejauh yang diterima OS tanpa block: selesaikan
    /// handshake, flush outbound queue, baca inbound ke sink.
    pub fn drive(&mut self) -> Result<Progress> {
        if let Some(err) = self.pending_error.take() {
            return Err(err);
        }
        if self.state == ConnState::Closed {
            return Ok(Progress::Closed);
        }
        if self.state == ConnState::Connecting && !self.try_finish_connect()? {
            return Ok(Progress::Idle);
        }
        self.pump()
    }

    /// Block sampai koneksi ini siap di-drive atau `deadline` lewat.
    ///
    /// Langsung `Ready` jika ada delivery yang belum diambil atau koneksi
    /// sudah berakhir. Deadline absolut: wait berulang dengan deadline
    /// yang sama mengetat, tidak drift.
    pub fn wait(&self, deadline: Instant) -> Result<WaitStatus> {
        if self.delivery.is_some() || self.pending_error.is_some() || self.state == ConnState::Closed
        {
            return Ok(WaitStatus::Ready);
        }
        let want_write = self.state == ConnState::Connecting || !self.send_queue.is_empty();
        wait_fd(self.stream.as_raw_fd(), want_write, deadline).map_err(TransportError::Io)
    }

    /// Tutup koneksi: outbound yang belum terkirim dibuang, receive yang
    /// sedang berjalan ditinggalkan. Idempotent. Delivery yang sudah
    /// selesai tetap bisa diambil lewat [`Connection::recv`].
    pub fn close(&mut self) {
        self.pending_error = None;
        self.close_internal();
    }

    /// Cek apakah handshake non-blocking connect sudah selesai.
    fn try_finish_connect(&mut self) -> Result<bool> {
        // mio: kegagalan connect muncul lewat take_error, sukses lewat
        // peer_addr yang berhenti mengembalikan NotConnected
        if let Some(err) = self.stream.take_error().map_err(TransportError::Io)? {
            self.closed_by_peer = true;
            self.close_internal();
            return Err(TransportError::Connect(err));
        }
        match self.stream.peer_addr() {
            Ok(_) => {
                self.state = ConnState::Connected;
                Ok(true)
            }
            Err(e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(false)
            }
            Err(e) => {
                self.closed_by_peer = true;
                self.close_internal();
                Err(TransportError::Connect(e))
            }
        }
    }

    fn pump(&mut self) -> Result<Progress> {
        let result = self.pump_inner();
        self.sync_flags();
        result
    }

    fn pump_inner(&mut self) -> Result<Progress> {
        let sent = self.pump_send()?;
        let received = self.pump_recv()?;

        Ok(if received {
            Progress::Received
        } else if self.state == ConnState::Closed {
            Progress::Closed
        } else if sent {
            Progress::Sent
        } else {
            Progress::Idle
        })
    }

    /// Flush outbound queue sejauh yang diterima socket.
    /// `true` = minimal satu pesan selesai terkirim.
    fn pump_send(&mut self) -> Result<bool> {
        if self.state != ConnState::Connected {
            return Ok(false);
        }
        let mut completed = false;
        loop {
            let Some(head) = self.send_queue.front_mut() else {
                break;
            };
            match advance_send(&mut self.stream, head) {
                Ok(SendStep::Done) => {
                    self.send_queue.pop_front();
                    completed = true;
                }
                Ok(SendStep::Blocked) => break,
                Err(e) => return self.fail_io(e).map(|_| completed),
            }
        }
        Ok(completed)
    }

    /// Majukan read state machine sejauh data yang tersedia.
    /// `true` = satu pesan selesai diterima (slot delivery terisi).
    fn pump_recv(&mut self) -> Result<bool> {
        if self.state != ConnState::Connected {
            return Ok(false);
        }
        let mut completed = false;
        loop {
            match advance_recv(
                &mut self.stream,
                &mut self.read_state,
                &mut self.sink,
                &mut self.scratch,
            ) {
                Ok(RecvStep::Completed(len)) => {
                    if let Some(payload) = self.sink.take() {
                        self.delivery = Some(Delivery { payload, len });
                        completed = true;
                    }
                    // Header pesan berikut boleh mulai terkumpul; body-nya
                    // akan menunggu sink di-arm lagi
                }
                Ok(RecvStep::Blocked) | Ok(RecvStep::NeedSink) => break,
                Ok(RecvStep::Eof) => {
                    self.closed_by_peer = true;
                    self.close_internal();
                    break;
                }
                Err(TransportError::Io(e)) => return self.fail_io(e).map(|_| completed),
                Err(e) => {
                    // BadFrame: wire tidak bisa dipercaya lagi
                    self.closed_by_peer = true;
                    self.close_internal();
                    return Err(e);
                }
            }
        }
        Ok(completed)
    }

    /// EOF/reset dari peer menjadi transisi Closed biasa; error OS lain
    /// tetap menutup koneksi tapi dilaporkan sebagai error.
    fn fail_io(&mut self, err: io::Error) -> Result<()> {
        self.closed_by_peer = true;
        self.close_internal();
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Ok(()),
            _ => Err(TransportError::Io(err)),
        }
    }

    fn close_internal(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closed;
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.send_queue.clear();
        self.sink = None;
        self.read_state = ReadState::fresh();
        self.sync_flags();
    }

    /// Operasi pada koneksi yang berakhir: [`TransportError::Closed`]
    /// jika transport yang menutup (caller mungkin belum tahu),
    /// [`TransportError::InvalidState`] jika caller sendiri yang menutup.
    fn check_open(&self, what: &'static str) -> Result<()> {
        match self.state {
            ConnState::Closed if self.closed_by_peer => Err(TransportError::Closed),
            ConnState::Closed => Err(TransportError::InvalidState(what)),
            _ => Ok(()),
        }
    }

    /// Publikasikan state yang dibaca PollSet tanpa akses ke struct ini:
    /// attention (delivery pending / berakhir) dan kebutuhan writability.
    fn sync_flags(&self) {
        let ready = self.delivery.is_some()
            || self.pending_error.is_some()
            || self.state == ConnState::Closed;
        self.attention.store(ready, Ordering::Release);

        let wants_write = match self.state {
            ConnState::Connecting => true,
            ConnState::Connected => !self.send_queue.is_empty(),
            ConnState::Closed => false,
        };
        self.wants_write.store(wants_write, Ordering::Release);
    }

    /// Raw fd untuk registrasi SourceFd di PollSet.
    pub(crate) fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Flag attention yang di-share ke PollSet saat registrasi.
    pub(crate) fn attention_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.attention)
    }

    /// Flag kebutuhan writability yang di-share ke PollSet.
    pub(crate) fn wants_write_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.wants_write)
    }
}

/// Socket tuning: TCP_NODELAY plus SO_SNDBUF/SO_RCVBUF untuk throughput
/// transfer file. Kegagalan di sini diabaikan - tidak semua platform
/// mengizinkan semua opsi.
fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);

    let fd = stream.as_raw_fd();
    unsafe {
        let optval: libc::c_int = SOCKET_BUF_SIZE;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// Majukan pesan di head queue: header dulu sampai utuh, lalu payload
/// dari source. Berhenti hanya saat selesai atau WouldBlock, supaya
/// edge-triggered readiness tidak pernah tertinggal.
///
/// Generic atas `Write` supaya bisa diuji dengan mock tanpa socket.
fn advance_send<W: Write>(io: &mut W, out: &mut Outbound) -> io::Result<SendStep> {
    while out.header_pos < HEADER_SIZE {
        match io.write(&out.header[out.header_pos..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted zero bytes",
                ))
            }
            Ok(n) => out.header_pos += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(SendStep::Blocked),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    loop {
        let written = {
            let chunk = match out.source.pending()? {
                None => return Ok(SendStep::Done),
                Some(c) => c,
            };
            match io.write(chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted zero bytes",
                    ))
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(SendStep::Blocked),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        out.source.advance(written);
    }
}

/// Majukan read state machine: kumpulkan header lintas read, lalu stream
/// payload ke sink. Payload tidak dikonsumsi selama sink belum di-arm -
/// receiver yang memutuskan memory vs file, bukan transport.
///
/// Generic atas `Read` supaya bisa diuji dengan mock tanpa socket.
fn advance_recv<R: Read>(
    io: &mut R,
    state: &mut ReadState,
    sink: &mut Option<Payload>,
    scratch: &mut [u8],
) -> Result<RecvStep> {
    loop {
        match state {
            ReadState::Header { buf, filled } => {
                match io.read(&mut buf[*filled..]) {
                    Ok(0) => return Ok(RecvStep::Eof),
                    Ok(n) => {
                        *filled += n;
                        if *filled == HEADER_SIZE {
                            let header = FrameHeader::decode(buf)?;
                            *state = ReadState::Body {
                                remaining: header.payload_len,
                                total: header.payload_len,
                            };
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(RecvStep::Blocked)
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(TransportError::Io(e)),
                }
            }
            ReadState::Body { remaining, total } => {
                let Some(dst) = sink.as_mut() else {
                    return Ok(RecvStep::NeedSink);
                };
                if *remaining == 0 {
                    let len = *total;
                    *state = ReadState::fresh();
                    return Ok(RecvStep::Completed(len));
                }
                let want = (*remaining).min(scratch.len() as u64) as usize;
                match io.read(&mut scratch[..want]) {
                    Ok(0) => return Ok(RecvStep::Eof),
                    Ok(n) => {
                        dst.write_chunk(&scratch[..n])
                            .map_err(TransportError::Io)?;
                        *remaining -= n as u64;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(RecvStep::Blocked)
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(TransportError::Io(e)),
                }
            }
        }
    }
}
