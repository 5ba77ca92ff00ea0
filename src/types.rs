//! Core protocol types: transaction ids, the status state machine and timestamps

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Transaction ID (128-bit random identifier)
pub type TransactionId = uuid::Uuid;

/// Values passed to and returned from operations
pub use serde_json::Value;

/// Status of a transaction, shared by coordinator and participant transactions.
///
/// The happy path runs top to bottom; `RollbackStarted` can be reached from any
/// non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    New,
    BeginStarted,
    BeginFinished,
    PrepareStarted,
    PrepareFinished,
    CommitStarted,
    CommitFinished,
    RollbackStarted,
    RollbackFinished,
}

impl TransactionStatus {
    /// All statuses in declaration order
    pub const ALL: [TransactionStatus; 9] = [
        TransactionStatus::New,
        TransactionStatus::BeginStarted,
        TransactionStatus::BeginFinished,
        TransactionStatus::PrepareStarted,
        TransactionStatus::PrepareFinished,
        TransactionStatus::CommitStarted,
        TransactionStatus::CommitFinished,
        TransactionStatus::RollbackStarted,
        TransactionStatus::RollbackFinished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::New => "NEW",
            TransactionStatus::BeginStarted => "BEGIN_STARTED",
            TransactionStatus::BeginFinished => "BEGIN_FINISHED",
            TransactionStatus::PrepareStarted => "PREPARE_STARTED",
            TransactionStatus::PrepareFinished => "PREPARE_FINISHED",
            TransactionStatus::CommitStarted => "COMMIT_STARTED",
            TransactionStatus::CommitFinished => "COMMIT_FINISHED",
            TransactionStatus::RollbackStarted => "ROLLBACK_STARTED",
            TransactionStatus::RollbackFinished => "ROLLBACK_FINISHED",
        }
    }

    /// Terminal statuses remove the transaction from the log and the registry
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::CommitFinished | TransactionStatus::RollbackFinished
        )
    }

    /// A step was started but never finished, i.e. the previous attempt crashed or failed midway
    pub fn is_unfinished_step(&self) -> bool {
        matches!(
            self,
            TransactionStatus::BeginStarted
                | TransactionStatus::PrepareStarted
                | TransactionStatus::RollbackStarted
        )
    }

    /// Log entries in these statuses carry nothing worth recovering
    pub fn needs_recovery(&self) -> bool {
        !matches!(
            self,
            TransactionStatus::New
                | TransactionStatus::CommitFinished
                | TransactionStatus::RollbackFinished
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Convert a wall clock time to milliseconds since the Unix epoch
pub fn to_epoch_millis(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_millis() as u64,
        Err(_) => 0,
    }
}

/// Convert milliseconds since the Unix epoch back to a wall clock time
pub fn from_epoch_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}
