//! Framed packet exchange over a byte stream.
//!
//! [`FrameTransport`] turns logical payloads into sequenced physical packets
//! and back. Every read and write runs against a deadline: before each
//! syscall the socket timeout is set to the time left, and each wake-up
//! (timeout, `WouldBlock`, `Interrupted`) re-checks the deadline. A transport
//! failure of any kind is fatal; the caller must drop the transport.

use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use sqlwire_core::error::{ConnectionError, ConnectionErrorKind};
use sqlwire_core::{Error, Result};
use tracing::trace;

use crate::protocol::messages::parse_err_packet;
use crate::protocol::{MAX_PACKET_SIZE, Packet, PacketHeader};

/// Receive limit until configured otherwise; matches the default
/// `max_packet_size` announced in the handshake.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 64 * 1024 * 1024;

/// A bidirectional byte stream the engine can run the protocol over.
pub trait NetStream: Read + Write + Send + fmt::Debug {
    /// Bound the next blocking read. `None` blocks indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Bound the next blocking write. `None` blocks indefinitely.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// True for transports that never leave the host (Unix sockets).
    fn is_local(&self) -> bool {
        false
    }

    /// True once traffic is encrypted.
    fn is_encrypted(&self) -> bool {
        false
    }
}

impl NetStream for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }
}

#[cfg(unix)]
impl NetStream for std::os::unix::net::UnixStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_write_timeout(self, timeout)
    }

    fn is_local(&self) -> bool {
        true
    }
}

/// Open a TCP connection, trying each resolved address until the deadline.
pub fn connect_tcp(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let deadline = Instant::now() + timeout;
    let addrs = addr.to_socket_addrs().map_err(|e| {
        io_error(
            ConnectionErrorKind::Connect,
            format!("Failed to resolve {}", addr),
            e,
        )
    })?;

    let mut last_err = None;
    for sock_addr in addrs {
        let Some(left) = time_left(deadline) else {
            break;
        };
        match TcpStream::connect_timeout(&sock_addr, left) {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }

    match last_err {
        Some(e) => {
            let kind = match e.kind() {
                ErrorKind::ConnectionRefused => ConnectionErrorKind::Refused,
                ErrorKind::TimedOut | ErrorKind::WouldBlock => ConnectionErrorKind::ConnectTimeout,
                _ => ConnectionErrorKind::Connect,
            };
            Err(io_error(kind, format!("Failed to connect to {}", addr), e))
        }
        None if Instant::now() >= deadline => Err(Error::connection(
            ConnectionErrorKind::ConnectTimeout,
            format!("Timed out connecting to {}", addr),
        )),
        None => Err(Error::connection(
            ConnectionErrorKind::Connect,
            format!("No addresses resolved for {}", addr),
        )),
    }
}

/// Open a Unix-domain socket connection.
///
/// std offers no timed connect for Unix sockets; the socket timeouts are
/// set to what is left of `timeout` as soon as the connect returns.
#[cfg(unix)]
pub fn connect_unix(
    path: &std::path::Path,
    timeout: Duration,
) -> Result<std::os::unix::net::UnixStream> {
    let deadline = Instant::now() + timeout;
    let stream = std::os::unix::net::UnixStream::connect(path).map_err(|e| {
        let kind = if e.kind() == ErrorKind::ConnectionRefused {
            ConnectionErrorKind::Refused
        } else {
            ConnectionErrorKind::Connect
        };
        io_error(kind, format!("Failed to connect to {}", path.display()), e)
    })?;

    let Some(left) = time_left(deadline) else {
        return Err(Error::connection(
            ConnectionErrorKind::ConnectTimeout,
            format!("Timed out connecting to {}", path.display()),
        ));
    };
    for result in [
        stream.set_read_timeout(Some(left)),
        stream.set_write_timeout(Some(left)),
    ] {
        result.map_err(|e| {
            io_error(
                ConnectionErrorKind::Connect,
                format!("Failed to configure {}", path.display()),
                e,
            )
        })?;
    }
    Ok(stream)
}

/// Sequenced, chunked packet exchange with deadline-bounded I/O.
pub struct FrameTransport {
    stream: Box<dyn NetStream>,
    sequence_id: u8,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    /// Overall deadline while connecting; overrides per-call timeouts
    connect_deadline: Option<Instant>,
    /// Upper bound on a reassembled logical packet
    max_packet_size: usize,
}

impl FrameTransport {
    pub fn new(stream: Box<dyn NetStream>) -> Self {
        Self {
            stream,
            sequence_id: 0,
            read_timeout: None,
            write_timeout: None,
            connect_deadline: None,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// Refuse logical packets larger than `size` bytes.
    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size;
    }

    pub fn with_timeouts(mut self, read: Option<Duration>, write: Option<Duration>) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    /// Bound all I/O by a single instant (used during the handshake).
    pub fn set_connect_deadline(&mut self, deadline: Option<Instant>) {
        self.connect_deadline = deadline;
    }

    pub fn connect_deadline(&self) -> Option<Instant> {
        self.connect_deadline
    }

    /// Start a new command: the next packet carries sequence id 0.
    pub fn reset_sequence(&mut self) {
        self.sequence_id = 0;
    }

    pub fn sequence_id(&self) -> u8 {
        self.sequence_id
    }

    pub fn is_local(&self) -> bool {
        self.stream.is_local()
    }

    pub fn is_encrypted(&self) -> bool {
        self.stream.is_encrypted()
    }

    /// Whether secrets may travel in the clear on this transport.
    pub fn is_secure(&self) -> bool {
        self.is_encrypted() || self.is_local()
    }

    /// Replace the underlying stream (TLS upgrade), keeping the sequence.
    pub fn upgrade<F>(self, wrap: F) -> Result<Self>
    where
        F: FnOnce(Box<dyn NetStream>, Option<Instant>) -> Result<Box<dyn NetStream>>,
    {
        let stream = wrap(self.stream, self.connect_deadline)?;
        Ok(Self { stream, ..self })
    }

    /// Send one logical payload, splitting it into physical packets.
    ///
    /// A payload whose length is a multiple of the maximum chunk size
    /// (including the empty payload) ends with an empty packet.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        let deadline = self.deadline(self.write_timeout);
        let mut buf = Vec::with_capacity(payload.len() + 4 * (payload.len() / MAX_PACKET_SIZE + 1));

        let mut last_len = MAX_PACKET_SIZE;
        for chunk in payload.chunks(MAX_PACKET_SIZE) {
            self.push_chunk(&mut buf, chunk);
            last_len = chunk.len();
        }
        if last_len == MAX_PACKET_SIZE {
            self.push_chunk(&mut buf, &[]);
        }

        self.write_all(&buf, deadline)
    }

    fn push_chunk(&mut self, buf: &mut Vec<u8>, chunk: &[u8]) {
        let header = PacketHeader {
            payload_length: chunk.len() as u32,
            sequence_id: self.sequence_id,
        };
        trace!(len = chunk.len(), seq = self.sequence_id, "send packet");
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(chunk);
        self.sequence_id = self.sequence_id.wrapping_add(1);
    }

    /// Receive one logical packet, raising server error packets as errors.
    pub fn receive(&mut self) -> Result<Packet> {
        let deadline = self.deadline(self.read_timeout);
        let mut payload = Vec::new();

        loop {
            let mut header_buf = [0u8; 4];
            self.read_exact(&mut header_buf, deadline)?;
            let header = PacketHeader::from_bytes(&header_buf);

            if header.sequence_id != self.sequence_id {
                return Err(Error::protocol(format!(
                    "packet sequence mismatch: expected {}, got {}",
                    self.sequence_id, header.sequence_id
                )));
            }
            self.sequence_id = self.sequence_id.wrapping_add(1);

            let len = header.payload_length as usize;
            trace!(len, seq = header.sequence_id, "recv packet");
            let start = payload.len();
            if start + len > self.max_packet_size {
                return Err(Error::protocol(format!(
                    "packet of at least {} bytes exceeds the {} byte limit",
                    start + len,
                    self.max_packet_size
                )));
            }
            payload.resize(start + len, 0);
            self.read_exact(&mut payload[start..], deadline)?;

            if len < MAX_PACKET_SIZE {
                break;
            }
        }

        if payload.first() == Some(&0xFF) {
            return Err(Error::Server(parse_err_packet(&payload)?));
        }
        Ok(Packet::new(payload))
    }

    fn deadline(&self, timeout: Option<Duration>) -> Option<Instant> {
        self.connect_deadline
            .or_else(|| timeout.map(|t| Instant::now() + t))
    }

    fn timeout_kind(&self, read: bool) -> ConnectionErrorKind {
        match (self.connect_deadline.is_some(), read) {
            (true, _) => ConnectionErrorKind::ConnectTimeout,
            (false, true) => ConnectionErrorKind::ReadTimeout,
            (false, false) => ConnectionErrorKind::WriteTimeout,
        }
    }

    fn read_exact(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let left = self.remaining(deadline, true)?;
            self.stream
                .set_read_timeout(left)
                .map_err(|e| io_error(ConnectionErrorKind::Disconnected, "socket error", e))?;
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(Error::connection(
                        ConnectionErrorKind::Disconnected,
                        "Lost connection to MySQL server during query",
                    ));
                }
                Ok(n) => filled += n,
                Err(e) if is_retryable(&e) => {}
                Err(e) => {
                    return Err(io_error(
                        ConnectionErrorKind::Disconnected,
                        "Lost connection to MySQL server during query",
                        e,
                    ));
                }
            }
        }
        Ok(())
    }

    fn write_all(&mut self, mut buf: &[u8], deadline: Option<Instant>) -> Result<()> {
        while !buf.is_empty() {
            let left = self.remaining(deadline, false)?;
            self.stream
                .set_write_timeout(left)
                .map_err(|e| io_error(ConnectionErrorKind::Disconnected, "socket error", e))?;
            match self.stream.write(buf) {
                Ok(0) => {
                    return Err(Error::connection(
                        ConnectionErrorKind::Disconnected,
                        "MySQL server has gone away",
                    ));
                }
                Ok(n) => buf = &buf[n..],
                Err(e) if is_retryable(&e) => {}
                Err(e) => {
                    return Err(io_error(
                        ConnectionErrorKind::Disconnected,
                        "MySQL server has gone away",
                        e,
                    ));
                }
            }
        }

        loop {
            let left = self.remaining(deadline, false)?;
            self.stream
                .set_write_timeout(left)
                .map_err(|e| io_error(ConnectionErrorKind::Disconnected, "socket error", e))?;
            match self.stream.flush() {
                Ok(()) => return Ok(()),
                Err(e) if is_retryable(&e) => {}
                Err(e) => {
                    return Err(io_error(
                        ConnectionErrorKind::Disconnected,
                        "MySQL server has gone away",
                        e,
                    ));
                }
            }
        }
    }

    /// Time left until `deadline`, or a timeout error once it has passed.
    fn remaining(&self, deadline: Option<Instant>, read: bool) -> Result<Option<Duration>> {
        match deadline {
            None => Ok(None),
            Some(deadline) => match time_left(deadline) {
                Some(left) => Ok(Some(left)),
                None => Err(Error::connection(
                    self.timeout_kind(read),
                    if read {
                        "Timed out reading from MySQL server"
                    } else {
                        "Timed out writing to MySQL server"
                    },
                )),
            },
        }
    }
}

impl fmt::Debug for FrameTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameTransport")
            .field("stream", &self.stream)
            .field("sequence_id", &self.sequence_id)
            .finish_non_exhaustive()
    }
}

/// Non-zero time left before `deadline`.
pub(crate) fn time_left(deadline: Instant) -> Option<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    (!left.is_zero()).then_some(left)
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

pub(crate) fn io_error(
    kind: ConnectionErrorKind,
    message: impl Into<String>,
    source: io::Error,
) -> Error {
    Error::Connection(ConnectionError {
        kind,
        message: format!("{}: {}", message.into(), source),
        source: Some(Box::new(source)),
    })
}
