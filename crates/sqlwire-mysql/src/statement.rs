//! Prepared statement handles.
//!
//! A [`Statement`] is closed explicitly with
//! [`MySqlConnection::close_statement`](crate::MySqlConnection::close_statement).
//! A handle dropped without that call pushes its id onto the connection's
//! [`CloseQueue`]; the connection sends the pending COM_STMT_CLOSE commands
//! the next time it is idle, never in the middle of a result stream.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::types::Field;

/// Statement ids waiting for COM_STMT_CLOSE.
#[derive(Debug, Clone, Default)]
pub struct CloseQueue(Arc<Mutex<Vec<u32>>>);

impl CloseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, statement_id: u32) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(statement_id);
    }

    /// Take every pending id.
    pub fn drain(&self) -> Vec<u32> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A server-side prepared statement.
#[derive(Debug)]
pub struct Statement {
    id: u32,
    params: Vec<Field>,
    param_count: usize,
    fields: Vec<Field>,
    close_queue: CloseQueue,
    closed: bool,
}

impl Statement {
    pub(crate) fn new(
        id: u32,
        param_count: usize,
        params: Vec<Field>,
        fields: Vec<Field>,
        close_queue: CloseQueue,
    ) -> Self {
        Self {
            id,
            params,
            param_count,
            fields,
            close_queue,
            closed: false,
        }
    }

    /// Server-assigned statement id.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }

    /// Parameter descriptors reported at prepare time.
    pub fn params(&self) -> &[Field] {
        &self.params
    }

    /// Result columns reported at prepare time.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// The server no longer knows this id; nothing to release on drop.
    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        if !self.closed {
            debug!(statement_id = self.id, "deferring statement close");
            self.close_queue.push(self.id);
        }
    }
}
