//! Record of every call the store received, in arrival order.

use std::sync::{Arc, Mutex};

use serde_json::Value;

/// Path the call arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Direct,
    /// Staged on the transaction with this id
    Transaction(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Create,
    Delete,
    Get,
    Set,
    Update,
    Documents,
    DocumentRefs,
    Commit,
    Rollback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub mode: Mode,
    pub op: Op,
    /// Document or collection path; empty for commit and rollback
    pub target: String,
    /// Payload of create and set
    pub data: Option<Value>,
}

impl Call {
    pub fn new(mode: Mode, op: Op, target: impl Into<String>) -> Self {
        Self {
            mode,
            op,
            target: target.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Shared, append-only call log
#[derive(Debug, Clone, Default)]
pub struct Journal {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Journal {
    pub(crate) fn record(&self, call: Call) {
        tracing::trace!(mode = ?call.mode, op = ?call.op, target = %call.target, "store call");
        self.lock().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().clone()
    }

    /// Drain the journal.
    pub fn take(&self) -> Vec<Call> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Call>> {
        // A panic while holding the lock cannot leave the log half-written.
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
