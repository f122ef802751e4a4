//! Error types shared by every SQLWire driver.
//!
//! Errors fall into four families, each with different consequences for the
//! connection that raised them:
//!
//! - [`ConnectionError`]: transport failures (connect, timeouts, lost socket,
//!   TLS, authentication). Fatal; the connection must be discarded.
//! - [`ProtocolError`]: the byte stream violated the wire protocol. Fatal.
//! - [`ServerError`]: the server rejected a command. The connection stays
//!   usable.
//! - [`ClientError`]: the caller misused the API. Reported before anything is
//!   written to the wire.

use std::fmt;

/// The error type for all SQLWire operations.
#[derive(Debug)]
pub enum Error {
    /// Transport or authentication failure
    Connection(ConnectionError),
    /// Wire protocol violation
    Protocol(ProtocolError),
    /// Error packet sent by the server
    Server(ServerError),
    /// API misuse detected on the client side
    Client(ClientError),
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the connection that produced this error is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Protocol(_))
    }

    /// The server error payload, if this is a server error.
    pub fn as_server_error(&self) -> Option<&ServerError> {
        match self {
            Error::Server(e) => Some(e),
            _ => None,
        }
    }

    /// The client error kind, if this is a client error.
    pub fn client_kind(&self) -> Option<ClientErrorKind> {
        match self {
            Error::Client(e) => Some(e.kind),
            _ => None,
        }
    }

    /// The connection error kind, if this is a connection error.
    pub fn connection_kind(&self) -> Option<ConnectionErrorKind> {
        match self {
            Error::Connection(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Shorthand for a [`ProtocolError`] without raw data.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            message: message.into(),
            raw_data: None,
            source: None,
        })
    }

    /// Shorthand for a [`ClientError`].
    pub fn client(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Error::Client(ClientError {
            kind,
            message: message.into(),
        })
    }

    /// Shorthand for a [`ConnectionError`] without a source.
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "connection error: {}", e),
            Error::Protocol(e) => write!(f, "protocol error: {}", e),
            Error::Server(e) => write!(f, "server error: {}", e),
            Error::Client(e) => write!(f, "client error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|s| s as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|s| s as &(dyn std::error::Error + 'static)),
            Error::Server(_) | Error::Client(_) => None,
        }
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

// ==================== Connection errors ====================

/// Failure of the underlying transport or of authentication.
#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Could not establish the socket
    Connect,
    /// The server actively refused the connection
    Refused,
    /// Connecting or handshaking exceeded the connect timeout
    ConnectTimeout,
    /// A read did not complete before the read timeout
    ReadTimeout,
    /// A write did not complete before the write timeout
    WriteTimeout,
    /// The socket was closed or reset mid-conversation
    Disconnected,
    /// TLS negotiation failed or TLS was required but unavailable
    Ssl,
    /// The server rejected the credentials
    Authentication,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.message, self.kind)
    }
}

// ==================== Protocol errors ====================

/// The peer sent bytes that do not follow the wire protocol.
#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

// ==================== Server errors ====================

/// An error packet returned by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Server error number
    pub errno: u16,
    /// Five character SQLSTATE; empty for pre-4.1 error packets
    pub sqlstate: String,
    /// Human readable message
    pub message: String,
    /// Classification derived from `errno`
    pub kind: ServerErrorKind,
}

impl ServerError {
    /// Build a server error, classifying it from its errno.
    pub fn new(errno: u16, sqlstate: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            errno,
            sqlstate: sqlstate.into(),
            message: message.into(),
            kind: ServerErrorKind::from_errno(errno),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sqlstate.is_empty() {
            write!(f, "{} ({})", self.message, self.errno)
        } else {
            write!(f, "{} ({}, {})", self.message, self.errno, self.sqlstate)
        }
    }
}

/// Specific subkinds for well-known server error numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    AccessDenied,
    TooManyConnections,
    NoDatabaseSelected,
    BadDatabase,
    TableExists,
    BadTable,
    NoSuchTable,
    BadField,
    BadNull,
    ParseError,
    DuplicateEntry,
    ForeignKey,
    LockWaitTimeout,
    Deadlock,
    NoSuchThread,
    QueryInterrupted,
    UnknownStatement,
    WrongArguments,
    NotAllowedCommand,
    ServerShutdown,
    ServerGone,
    ServerLost,
    SecureTransportRequired,
    Other,
}

impl ServerErrorKind {
    /// Map a server errno to its subkind.
    pub const fn from_errno(errno: u16) -> Self {
        match errno {
            1044 | 1045 | 1227 => Self::AccessDenied,
            1040 => Self::TooManyConnections,
            1046 => Self::NoDatabaseSelected,
            1049 => Self::BadDatabase,
            1050 => Self::TableExists,
            1051 => Self::BadTable,
            1146 => Self::NoSuchTable,
            1054 => Self::BadField,
            1048 => Self::BadNull,
            1064 => Self::ParseError,
            1062 | 1586 => Self::DuplicateEntry,
            1216 | 1217 | 1451 | 1452 => Self::ForeignKey,
            1205 => Self::LockWaitTimeout,
            1213 => Self::Deadlock,
            1094 => Self::NoSuchThread,
            1317 => Self::QueryInterrupted,
            1243 => Self::UnknownStatement,
            1210 => Self::WrongArguments,
            1148 => Self::NotAllowedCommand,
            1053 => Self::ServerShutdown,
            2006 => Self::ServerGone,
            2013 => Self::ServerLost,
            3159 => Self::SecureTransportRequired,
            _ => Self::Other,
        }
    }
}

// ==================== Client errors ====================

/// Misuse of the API, detected before touching the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientError {
    pub kind: ClientErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    /// Command issued in a state that does not accept it
    CommandsOutOfSync,
    /// Wrong number of parameters for a prepared statement
    ParamCountMismatch,
    /// The server asked for something this client refuses to do
    Unsupported,
    /// LOAD DATA LOCAL INFILE refused by the local policy
    LocalInfileRejected,
    /// Integer outside every wire integer width
    ValueTooLarge,
    /// Value kind that cannot be bound as a parameter
    UnsupportedValue,
    /// Bytes not representable in the connection charset
    Charset,
    /// Column data that does not parse as its declared type
    Conversion,
    /// The connection has already been closed
    NotConnected,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_table() {
        assert_eq!(ServerErrorKind::from_errno(1054), ServerErrorKind::BadField);
        assert_eq!(ServerErrorKind::from_errno(1064), ServerErrorKind::ParseError);
        assert_eq!(ServerErrorKind::from_errno(2006), ServerErrorKind::ServerGone);
        assert_eq!(ServerErrorKind::from_errno(1062), ServerErrorKind::DuplicateEntry);
        assert_eq!(ServerErrorKind::from_errno(9999), ServerErrorKind::Other);
    }

    #[test]
    fn test_fatality() {
        assert!(Error::protocol("bad sequence").is_fatal());
        assert!(Error::connection(ConnectionErrorKind::ReadTimeout, "read timeout").is_fatal());
        assert!(!Error::Server(ServerError::new(1064, "42000", "syntax")).is_fatal());
        assert!(!Error::client(ClientErrorKind::CommandsOutOfSync, "out of sync").is_fatal());
    }

    #[test]
    fn test_display() {
        let err = Error::Server(ServerError::new(1146, "42S02", "Table 't' doesn't exist"));
        assert_eq!(
            err.to_string(),
            "server error: Table 't' doesn't exist (1146, 42S02)"
        );

        let legacy = ServerError::new(1045, "", "Access denied");
        assert_eq!(legacy.to_string(), "Access denied (1045)");
        assert_eq!(legacy.kind, ServerErrorKind::AccessDenied);
    }
}
