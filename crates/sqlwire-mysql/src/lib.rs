//! MySQL driver for SQLWire.
//!
//! This crate implements the MySQL client/server protocol from scratch over
//! blocking std sockets. It provides:
//!
//! - Packet framing with sequence ids and 16MB chunking
//! - The handshake, optional TLS upgrade (`tls` feature) and pluggable
//!   authentication (native password, caching_sha2, sha256, clear text)
//! - Text and prepared-statement (binary) queries, multi-result iteration
//! - LOAD DATA LOCAL INFILE through an injectable, policy-checked source
//! - A connection state machine that rejects out-of-order commands
//!
//! # Example
//!
//! ```no_run
//! use sqlwire_mysql::{MySqlConfig, MySqlConnection};
//!
//! # fn main() -> sqlwire_core::Result<()> {
//! let config = MySqlConfig::new()
//!     .host("127.0.0.1")
//!     .user("app")
//!     .password("secret")
//!     .database("shop");
//! let mut conn = MySqlConnection::connect(config)?;
//!
//! let result = conn.query("SELECT id, name FROM items")?;
//! for row in &result.rows {
//!     println!("{:?}", row.values());
//! }
//!
//! let stmt = conn.prepare("SELECT name FROM items WHERE id = ?")?;
//! let one = conn.execute(&stmt, &[sqlwire_core::Param::Int(1)])?;
//! conn.close_statement(stmt)?;
//! # let _ = one;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod charset;
pub mod config;
pub mod connection;
pub mod infile;
pub mod protocol;
pub mod shared;
pub mod statement;
pub mod tls;
pub mod transport;
pub mod types;

pub use charset::Charset;
pub use config::{MySqlConfig, SslMode, TlsConfig};
pub use connection::{ConnectionState, MySqlConnection, ResultSet};
pub use infile::{FsInfileSource, LocalInfileSource};
pub use shared::SharedConnection;
pub use statement::Statement;
pub use types::{Field, FieldType};
