//! Client-side session over a coordinator
//!
//! A [`TransactionSession`] tracks the one transaction a client session may have open.
//! Service calls go through a [`ServiceInvoker`]: a [`DirectInvoker`] always runs the
//! operation locally outside any transaction, a [`TransactionalInvoker`] routes it through
//! the coordinator while the session has an open transaction.

use std::sync::{Arc, Mutex, PoisonError};

use uuid::Uuid;

use crate::api::{OperationExecutor, TransactionCoordinator};
use crate::error::{Result, TransactionError};
use crate::types::{TransactionId, Value};

/// A client session bound to one coordinator
pub struct TransactionSession {
    coordinator: Arc<dyn TransactionCoordinator>,
    session_token: String,
    interactive_session_key: String,
    active: Mutex<Option<TransactionId>>,
}

impl TransactionSession {
    pub fn new(
        coordinator: Arc<dyn TransactionCoordinator>,
        session_token: impl Into<String>,
        interactive_session_key: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            session_token: session_token.into(),
            interactive_session_key: interactive_session_key.into(),
            active: Mutex::new(None),
        }
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    /// Id of the open transaction, if any
    pub fn active_transaction(&self) -> Option<TransactionId> {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin a new transaction under a fresh random id
    pub fn begin(&self) -> Result<TransactionId> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(transaction_id) = *active {
            return Err(TransactionError::Usage(format!(
                "Cannot begin a new transaction as transaction '{}' is still active in this session",
                transaction_id
            )));
        }

        let transaction_id = Uuid::new_v4();
        self.coordinator.begin_transaction(
            transaction_id,
            &self.session_token,
            &self.interactive_session_key,
        )?;
        *active = Some(transaction_id);
        Ok(transaction_id)
    }

    /// Run an operation at a participant inside the open transaction
    pub fn execute(&self, participant_id: &str, operation: &str, arguments: &[Value]) -> Result<Value> {
        let transaction_id = self.require_active()?;
        self.coordinator.execute_operation(
            transaction_id,
            &self.session_token,
            &self.interactive_session_key,
            participant_id,
            operation,
            arguments,
        )
    }

    /// Commit the open transaction. The session is free again afterwards, whatever the outcome.
    pub fn commit(&self) -> Result<()> {
        let transaction_id = self.take_active()?;
        self.coordinator.commit_transaction(
            transaction_id,
            &self.session_token,
            &self.interactive_session_key,
        )
    }

    /// Roll back the open transaction. The session is free again afterwards, whatever the outcome.
    pub fn rollback(&self) -> Result<()> {
        let transaction_id = self.take_active()?;
        self.coordinator.rollback_transaction(
            transaction_id,
            &self.session_token,
            &self.interactive_session_key,
        )
    }

    fn require_active(&self) -> Result<TransactionId> {
        self.active_transaction().ok_or_else(no_active_transaction)
    }

    fn take_active(&self) -> Result<TransactionId> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(no_active_transaction)
    }
}

fn no_active_transaction() -> TransactionError {
    TransactionError::Usage("There is no active transaction in this session".to_string())
}

/// Runs a named service operation
pub trait ServiceInvoker: Send + Sync {
    fn invoke(&self, operation: &str, arguments: &[Value]) -> Result<Value>;
}

/// Calls the executor directly, outside any transaction
pub struct DirectInvoker {
    executor: Arc<dyn OperationExecutor>,
    session_token: String,
}

impl DirectInvoker {
    pub fn new(executor: Arc<dyn OperationExecutor>, session_token: impl Into<String>) -> Self {
        Self {
            executor,
            session_token: session_token.into(),
        }
    }
}

impl ServiceInvoker for DirectInvoker {
    fn invoke(&self, operation: &str, arguments: &[Value]) -> Result<Value> {
        self.executor
            .execute(&self.session_token, None, operation, arguments)
    }
}

/// Routes calls to one participant through the coordinator while the session has an open
/// transaction; falls back to direct calls otherwise
pub struct TransactionalInvoker {
    session: Arc<TransactionSession>,
    participant_id: String,
    direct: DirectInvoker,
}

impl TransactionalInvoker {
    pub fn new(
        session: Arc<TransactionSession>,
        participant_id: impl Into<String>,
        direct: DirectInvoker,
    ) -> Self {
        Self {
            session,
            participant_id: participant_id.into(),
            direct,
        }
    }
}

impl ServiceInvoker for TransactionalInvoker {
    fn invoke(&self, operation: &str, arguments: &[Value]) -> Result<Value> {
        match self.session.active_transaction() {
            Some(_) => self.session.execute(&self.participant_id, operation, arguments),
            None => self.direct.invoke(operation, arguments),
        }
    }
}
