//! State shared by coordinator and participant transactions

use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::gate::{GateGuard, TransactionGate};
use crate::error::{Result, TransactionError};
use crate::transaction_log::TransactionLogEntry;
use crate::types::{to_epoch_millis, TransactionId, TransactionStatus};

/// Identity, status and gate of a live transaction.
///
/// The status is only changed through [`TransactionNode::change_status`](super::TransactionNode::change_status),
/// which persists the new status before applying it here.
#[derive(Debug)]
pub struct TransactionCore {
    id: TransactionId,
    /// Owner session; `None` for transactions rebuilt from the log
    session_token: Option<String>,
    status: RwLock<TransactionStatus>,
    last_accessed: Mutex<SystemTime>,
    gate: TransactionGate,
}

impl TransactionCore {
    /// A transaction opened by a client, in `NEW`
    pub fn new(id: TransactionId, session_token: impl Into<String>) -> Self {
        Self {
            id,
            session_token: Some(session_token.into()),
            status: RwLock::new(TransactionStatus::New),
            last_accessed: Mutex::new(SystemTime::now()),
            gate: TransactionGate::new(),
        }
    }

    /// A transaction rebuilt from its log entry. It has no owner and its last access is the
    /// epoch, so the next sweep sees it as timed out.
    pub fn recovered(id: TransactionId, status: TransactionStatus) -> Self {
        Self {
            id,
            session_token: None,
            status: RwLock::new(status),
            last_accessed: Mutex::new(UNIX_EPOCH),
            gate: TransactionGate::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }

    pub fn status(&self) -> TransactionStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_status(&self, status: TransactionStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn last_accessed(&self) -> SystemTime {
        *self.last_accessed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_accessed_millis(&self) -> u64 {
        to_epoch_millis(self.last_accessed())
    }

    pub fn touch(&self) {
        *self.last_accessed.lock().unwrap_or_else(PoisonError::into_inner) = SystemTime::now();
    }

    /// Time since the last access; zero if the clock went backwards
    pub fn idle_time(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.last_accessed())
            .unwrap_or(Duration::ZERO)
    }

    /// Whether a unit of work currently holds the gate
    pub fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }

    /// Run `action` holding the gate, failing with a usage error if it is busy
    pub fn with_lock_or_fail<R>(&self, touch: bool, action: impl FnOnce() -> Result<R>) -> Result<R> {
        match self.gate.try_enter() {
            Some(guard) => self.run_locked(guard, touch, action),
            None => Err(TransactionError::transaction_busy(self.id)),
        }
    }

    /// Run `action` holding the gate; if it is busy, log and return `None`
    pub fn with_lock_or_skip<R>(
        &self,
        touch: bool,
        action: impl FnOnce() -> Result<R>,
    ) -> Result<Option<R>> {
        match self.gate.try_enter() {
            Some(guard) => self.run_locked(guard, touch, action).map(Some),
            None => {
                log::info!(
                    "Cannot execute a new action on transaction '{}' as it is still busy executing a previous action",
                    self.id
                );
                Ok(None)
            }
        }
    }

    /// Run `action` holding the gate, waiting up to `timeout` for it to become free
    pub fn with_lock_or_wait<R>(
        &self,
        timeout: Duration,
        touch: bool,
        action: impl FnOnce() -> Result<R>,
    ) -> Result<R> {
        match self.gate.enter_within(timeout) {
            Some(guard) => self.run_locked(guard, touch, action),
            None => Err(TransactionError::Usage(format!(
                "Cannot execute a new action on transaction '{}' as it is still busy executing a previous action. Waited {:?}.",
                self.id, timeout
            ))),
        }
    }

    /// Run an operation holding the gate. Operations wait up to `timeout` for each other;
    /// while a locking step holds the gate the operation fails with a usage error.
    pub fn with_operation_lock<R>(
        &self,
        timeout: Duration,
        touch: bool,
        action: impl FnOnce() -> Result<R>,
    ) -> Result<R> {
        match self.gate.enter_operation(timeout) {
            Some(guard) => self.run_locked(guard, touch, action),
            None => Err(TransactionError::transaction_busy(self.id)),
        }
    }

    fn run_locked<R>(
        &self,
        _guard: GateGuard<'_>,
        touch: bool,
        action: impl FnOnce() -> Result<R>,
    ) -> Result<R> {
        if touch {
            self.touch();
        }
        let result = action();
        if touch {
            self.touch();
        }
        result
    }
}

/// A transaction type a [`TransactionNode`](super::TransactionNode) can register, log and recover
pub trait NodeTransaction: Send + Sync + Sized + 'static {
    fn core(&self) -> &TransactionCore;

    /// Log entry describing this transaction as if it were in `status`
    fn to_log_entry(&self, status: TransactionStatus) -> TransactionLogEntry;

    /// Rebuild a transaction from a persisted entry
    fn from_log_entry(entry: &TransactionLogEntry) -> Result<Self>;
}
