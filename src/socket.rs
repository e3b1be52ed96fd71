//! Blocking server socket and buffer-stitching reads
//!
//! One `ServerSocket` per worker: it owns the listener for its port and
//! at most one live connection at a time. Reads are non-coalescing; the
//! stitching loops live in `read_at_least` / `read_at_most` so the state
//! machine can reason about exactly how many bytes it holds.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use crate::protocol::ErrorKind;

const ACCEPT_POLL_MILLIS: u64 = 5;

fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        let fd = stream.as_raw_fd();
        unsafe {
            let keepalive: libc::c_int = 1;
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                &keepalive as *const _ as *const libc::c_void,
                std::mem::size_of_val(&keepalive) as libc::socklen_t,
            );
        }
    }
}

/// True for bind errors that retrying cannot fix.
fn is_fatal_bind_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::PermissionDenied
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::InvalidInput
    )
}

pub struct ServerSocket {
    host: String,
    port: u16,
    listener: Option<TcpListener>,
    stream: Option<TcpStream>,
    peer_ip: Option<String>,
    non_retryable_err: ErrorKind,
}

impl ServerSocket {
    pub fn new(host: &str, port: u16) -> Self {
        ServerSocket {
            host: host.to_string(),
            port,
            listener: None,
            stream: None,
            peer_ip: None,
            non_retryable_err: ErrorKind::Ok,
        }
    }

    /// Bind and listen. Idempotent once bound. The caller decides whether
    /// a failure is worth retrying via [`ServerSocket::is_fatal`].
    pub fn listen(&mut self) -> io::Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }
        let listener = TcpListener::bind((self.host.as_str(), self.port))?;
        // port 0 means "pick one"; record what the OS chose
        self.port = listener.local_addr()?.port();
        self.listener = Some(listener);
        Ok(())
    }

    pub fn is_fatal(e: &io::Error) -> bool {
        is_fatal_bind_error(e)
    }

    /// Accept one connection, waiting at most `timeout_millis`.
    pub fn accept_next_connection(&mut self, timeout_millis: u64) -> io::Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not listening"))?;
        listener.set_nonblocking(true)?;
        let deadline = Instant::now() + Duration::from_millis(timeout_millis);
        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    stream.set_nonblocking(false)?;
                    tune_socket(&stream);
                    self.peer_ip = Some(addr.ip().to_string());
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "accept timed out"));
                    }
                    let remaining = deadline - now;
                    std::thread::sleep(remaining.min(Duration::from_millis(ACCEPT_POLL_MILLIS)));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.non_retryable_err = ErrorKind::ConnError;
                    return Err(e);
                }
            }
        }
    }

    /// Socket-level condition that reconnecting cannot repair.
    pub fn non_retryable_err_code(&self) -> ErrorKind {
        self.non_retryable_err
    }

    /// Apply per-stream timeouts (derived from the sender's announced
    /// settings). Zero or negative values leave the stream unbounded.
    pub fn set_stream_timeouts(&mut self, read_millis: i32, write_millis: i32) {
        if let Some(stream) = &self.stream {
            if read_millis > 0 {
                let _ = stream.set_read_timeout(Some(Duration::from_millis(read_millis as u64)));
            }
            if write_millis > 0 {
                let _ = stream.set_write_timeout(Some(Duration::from_millis(write_millis as u64)));
            }
        }
    }

    /// Single read. `Ok(0)` is EOF.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.stream {
            Some(stream) => stream.read(buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no connection")),
        }
    }

    /// Write the whole buffer, returning how many bytes actually went
    /// out. A result smaller than `buf.len()` means the connection broke
    /// mid-write; the caller reconnects rather than retrying in place.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let stream = match &mut self.stream {
            Some(stream) => stream,
            None => return Err(io::Error::new(io::ErrorKind::NotConnected, "no connection")),
        };
        let mut written = 0;
        while written < buf.len() {
            match stream.write(&buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    if written > 0 {
                        break;
                    }
                    return Err(e);
                }
            }
        }
        Ok(written)
    }

    pub fn close_connection(&mut self) {
        self.peer_ip = None;
        self.stream = None;
    }

    pub fn close_all(&mut self) {
        self.close_connection();
        self.listener = None;
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn peer_ip(&self) -> Option<&str> {
        self.peer_ip.as_deref()
    }
}

/// Keep reading until at least `at_least` bytes are held (starting from
/// `already`, appending at `buf[len..]`) or the stream ends. An error
/// with nothing held surfaces the error; an error after some bytes
/// returns what is held and lets the caller judge sufficiency.
pub fn read_at_least(
    s: &mut ServerSocket,
    buf: &mut [u8],
    at_least: usize,
    already: usize,
) -> io::Result<usize> {
    debug_assert!(at_least > 0);
    debug_assert!(at_least <= buf.len());
    debug_assert!(already <= buf.len());
    let mut len = already;
    while len < at_least {
        match s.read(&mut buf[len..]) {
            Ok(0) => return Ok(len),
            Ok(n) => len += n,
            Err(e) => {
                if len > 0 {
                    return Ok(len);
                }
                return Err(e);
            }
        }
    }
    Ok(len)
}

/// One read capped at `min(buf.len(), at_most)`. `Ok(0)` is EOF.
pub fn read_at_most(s: &mut ServerSocket, buf: &mut [u8], at_most: usize) -> io::Result<usize> {
    let target = at_most.min(buf.len());
    s.read(&mut buf[..target])
}
