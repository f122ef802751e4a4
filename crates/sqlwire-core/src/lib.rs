//! Core types for SQLWire.
//!
//! `sqlwire-core` is the vocabulary shared by the wire protocol drivers. It
//! holds no I/O of its own.
//!
//! # Contents
//!
//! - [`Error`]: the error hierarchy, split into connection, protocol, server
//!   and client failures so callers can tell a dead connection from a
//!   rejected statement.
//! - [`Value`]: values decoded from result rows, including the temporal
//!   companions [`DateTime`] and [`TimeSpan`].
//! - [`Param`]: the closed set of kinds a caller may bind to a prepared
//!   statement.
//! - [`Row`]: a decoded row with shared column names.

pub mod error;
pub mod row;
pub mod value;

pub use error::{
    ClientError, ClientErrorKind, ConnectionError, ConnectionErrorKind, Error, ProtocolError,
    Result, ServerError, ServerErrorKind,
};
pub use row::Row;
pub use value::{DateTime, Param, TimeSpan, Value};
