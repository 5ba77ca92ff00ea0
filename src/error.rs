//! Error types for twophase
//!
//! Defines a unified error type shared by the coordinator, the participants and the
//! transaction log. Errors fall into three groups:
//! - usage errors (bad identifiers, unknown transaction, wrong status, limits, access)
//! - operation errors raised by the business operation executor
//! - protocol and infrastructure errors (log writes, participants, local resources)

use std::io;

use thiserror::Error;

use crate::types::{TransactionId, TransactionStatus};

/// Unified error type for transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    /// The caller used the API incorrectly; never retried automatically
    #[error("{0}")]
    Usage(String),

    /// A business operation failed; the transaction is still usable
    #[error("{message}")]
    Operation { message: String },

    /// The transaction log could not be written, read or cleaned up
    #[error("{0}")]
    Log(String),

    /// The local transactional resource failed
    #[error("{0}")]
    Resource(String),

    /// A call into a participant failed while driving the protocol
    #[error("{message}")]
    Participant {
        message: String,
        #[source]
        source: Box<TransactionError>,
    },

    /// A node was constructed with invalid settings
    #[error("{0}")]
    Config(String),

    /// The per-transaction worker could not run an action
    #[error("{0}")]
    Worker(String),

    /// I/O error (log files)
    #[error(transparent)]
    Io(#[from] io::Error),

    /// JSON encoding or decoding error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TransactionError {
    /// Create an operation error with the given message
    pub fn operation(message: impl Into<String>) -> Self {
        TransactionError::Operation {
            message: message.into(),
        }
    }

    /// Wrap an error raised while talking to a participant
    pub fn participant(message: impl Into<String>, source: TransactionError) -> Self {
        TransactionError::Participant {
            message: message.into(),
            source: Box::new(source),
        }
    }

    pub fn transaction_not_found(transaction_id: TransactionId) -> Self {
        TransactionError::Usage(format!(
            "Transaction '{}' does not exist.",
            transaction_id
        ))
    }

    pub fn transaction_busy(transaction_id: TransactionId) -> Self {
        TransactionError::Usage(format!(
            "Cannot execute a new action on transaction '{}' as it is still busy executing a previous action.",
            transaction_id
        ))
    }

    pub fn access_denied(transaction_id: TransactionId) -> Self {
        TransactionError::Usage(format!(
            "Access denied to transaction '{}'",
            transaction_id
        ))
    }

    /// Create the error reported when a transaction is not in any of the expected statuses
    pub fn unexpected_status(
        transaction_id: TransactionId,
        actual: TransactionStatus,
        expected: &[TransactionStatus],
    ) -> Self {
        let expected: Vec<&str> = expected.iter().map(|s| s.as_str()).collect();
        TransactionError::Usage(format!(
            "Transaction '{}' unexpected status '{}'. Expected statuses '[{}]'.",
            transaction_id,
            actual,
            expected.join(", ")
        ))
    }

    /// Usage errors are reported to the caller as-is and logged at info level
    pub fn is_usage(&self) -> bool {
        matches!(self, TransactionError::Usage(_))
    }

    /// Operation errors come from the business logic, not from the protocol.
    /// A participant wrapper keeps the classification of its cause.
    pub fn is_operation(&self) -> bool {
        match self {
            TransactionError::Operation { .. } => true,
            TransactionError::Participant { source, .. } => source.is_operation(),
            _ => false,
        }
    }
}

/// Result type alias for transaction operations
pub type Result<T> = std::result::Result<T, TransactionError>;
