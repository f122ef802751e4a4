//! Shared, lock-guarded connection handle.

use std::sync::{Arc, Mutex, MutexGuard};

use sqlwire_core::{ClientErrorKind, Error, Result};

use crate::config::MySqlConfig;
use crate::connection::MySqlConnection;

/// Cloneable handle to one connection.
///
/// The protocol is strictly request/response, so callers on different
/// threads take turns through [`SharedConnection::lock`]; a command and its
/// whole response run under a single guard.
pub struct SharedConnection {
    inner: Arc<Mutex<MySqlConnection>>,
}

impl SharedConnection {
    pub fn new(conn: MySqlConnection) -> Self {
        Self {
            inner: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn connect(config: MySqlConfig) -> Result<Self> {
        MySqlConnection::connect(config).map(Self::new)
    }

    /// Wait for exclusive access to the connection.
    pub fn lock(&self) -> Result<MutexGuard<'_, MySqlConnection>> {
        self.inner.lock().map_err(|_| {
            Error::client(
                ClientErrorKind::NotConnected,
                "connection lock poisoned by a panicking thread",
            )
        })
    }
}

impl Clone for SharedConnection {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for SharedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConnection")
            .field("inner", &"Arc<Mutex<MySqlConnection>>")
            .finish()
    }
}
