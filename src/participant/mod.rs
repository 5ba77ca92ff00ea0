//! Participant node: drives one local resource on behalf of a coordinator
//!
//! A participant transaction is either two-phase (begun with the coordinator key, committed
//! only after a successful prepare) or one-phase (begun without a key by a local client and
//! committed directly). Resource and executor calls of a transaction run on its own worker
//! thread; status changes run on the calling thread while it holds the transaction's gate.

pub mod worker;

#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

pub use worker::TransactionWorker;

use crate::api::{
    OperationExecutor, ResourceTransactionProvider, SessionTokenProvider, TransactionParticipant,
};
use crate::config::TransactionConfig;
use crate::error::{Result, TransactionError};
use crate::node::{AbandonedTransactionHandler, NodeTransaction, TransactionCore, TransactionNode};
use crate::transaction_log::{FileTransactionLog, TransactionLogEntry, TransactionLogStore};
use crate::types::{TransactionId, TransactionStatus, Value};

/// Transaction as seen by a participant
pub struct ParticipantTransaction<H> {
    core: TransactionCore,
    two_phase: bool,
    /// Local resource transaction; `None` before begin and after a restart
    resource_handle: Mutex<Option<H>>,
    worker: TransactionWorker,
}

impl<H: Clone> ParticipantTransaction<H> {
    fn new(transaction_id: TransactionId, session_token: &str, two_phase: bool) -> Self {
        Self {
            core: TransactionCore::new(transaction_id, session_token),
            two_phase,
            resource_handle: Mutex::new(None),
            worker: TransactionWorker::new(transaction_id),
        }
    }

    pub fn is_two_phase(&self) -> bool {
        self.two_phase
    }

    pub fn resource_handle(&self) -> Option<H> {
        self.resource_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_resource_handle(&self, handle: H) {
        *self
            .resource_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }
}

impl<H: Clone + Send + Sync + 'static> NodeTransaction for ParticipantTransaction<H> {
    fn core(&self) -> &TransactionCore {
        &self.core
    }

    fn to_log_entry(&self, status: TransactionStatus) -> TransactionLogEntry {
        TransactionLogEntry {
            transaction_id: self.core.id(),
            transaction_status: status,
            two_phase_transaction: self.two_phase,
            last_accessed: self.core.last_accessed_millis(),
            participant_ids: None,
        }
    }

    fn from_log_entry(entry: &TransactionLogEntry) -> Result<Self> {
        Ok(Self {
            core: TransactionCore::recovered(entry.transaction_id, entry.transaction_status),
            two_phase: entry.two_phase_transaction,
            resource_handle: Mutex::new(None),
            worker: TransactionWorker::new(entry.transaction_id),
        })
    }
}

type Transaction<R> = ParticipantTransaction<<R as ResourceTransactionProvider>::Handle>;

/// Participant node wrapping a local resource `R` and an operation executor `E`
pub struct Participant<R: ResourceTransactionProvider, E: OperationExecutor> {
    participant_id: String,
    node: TransactionNode<Transaction<R>>,
    resource: Arc<R>,
    executor: Arc<E>,
}

impl<R, E> Participant<R, E>
where
    R: ResourceTransactionProvider,
    E: OperationExecutor,
{
    pub fn new(
        participant_id: impl Into<String>,
        config: TransactionConfig,
        session_tokens: Arc<dyn SessionTokenProvider>,
        resource: Arc<R>,
        executor: Arc<E>,
        log: Arc<dyn TransactionLogStore>,
    ) -> Result<Self> {
        let participant_id = participant_id.into();
        if participant_id.trim().is_empty() {
            return Err(TransactionError::Config(
                "Participant id cannot be empty".to_string(),
            ));
        }

        let node = TransactionNode::new(
            format!("participant '{}'", participant_id),
            config,
            session_tokens,
            log,
        )?;

        Ok(Self {
            participant_id,
            node,
            resource,
            executor,
        })
    }

    /// Create a participant logging to `<config.log_folder>/participant-<id>`
    pub fn with_file_log(
        participant_id: impl Into<String>,
        config: TransactionConfig,
        session_tokens: Arc<dyn SessionTokenProvider>,
        resource: Arc<R>,
        executor: Arc<E>,
    ) -> Result<Self> {
        let participant_id = participant_id.into();
        let log = FileTransactionLog::open(
            Path::new(&config.log_folder),
            &format!("participant-{}", participant_id),
        )?;
        Self::new(participant_id, config, session_tokens, resource, executor, Arc::new(log))
    }

    pub fn node(&self) -> &TransactionNode<Transaction<R>> {
        &self.node
    }

    pub fn resource(&self) -> &Arc<R> {
        &self.resource
    }

    /// Register transactions left in the log by a previous process
    pub fn recover(&self) -> Result<()> {
        self.node.recover_from_log()
    }

    /// Finish transactions that failed midway or were abandoned
    pub fn sweep(&self) {
        self.node.finish_failed_or_abandoned(self);
    }

    pub fn transaction_status(&self, transaction_id: TransactionId) -> Option<TransactionStatus> {
        self.node.transaction_status(transaction_id)
    }

    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.node.transaction_ids()
    }

    // ---- Steps, called with the transaction's gate held ----

    fn begin_locked(&self, transaction: &Transaction<R>) -> Result<()> {
        let transaction_id = transaction.core.id();
        log::info!("[{}] Begin transaction '{}' started", self.node.name(), transaction_id);

        self.node.change_status(transaction, TransactionStatus::BeginStarted)?;

        let resource = Arc::clone(&self.resource);
        let handle = transaction
            .worker
            .run(move || resource.begin(transaction_id))?;
        transaction.set_resource_handle(handle);

        self.node.change_status(transaction, TransactionStatus::BeginFinished)?;

        log::info!(
            "[{}] Begin transaction '{}' finished successfully",
            self.node.name(),
            transaction_id
        );
        Ok(())
    }

    fn execute_locked(
        &self,
        transaction: &Transaction<R>,
        session_token: &str,
        operation: &str,
        arguments: &[Value],
    ) -> Result<Value> {
        self.node.check_access(transaction, session_token)?;
        self.node
            .check_status(transaction, &[TransactionStatus::BeginFinished])?;

        let transaction_id = transaction.core.id();
        log::info!(
            "[{}] Transaction '{}' execute operation '{}' started",
            self.node.name(),
            transaction_id,
            operation
        );

        let executor = Arc::clone(&self.executor);
        let session_token = session_token.to_string();
        let operation_name = operation.to_string();
        let arguments = arguments.to_vec();
        let outcome = transaction.worker.run(move || {
            Ok(executor.execute(&session_token, Some(transaction_id), &operation_name, &arguments))
        })?;

        let value = outcome.map_err(|e| TransactionError::operation(e.to_string()))?;

        log::info!(
            "[{}] Transaction '{}' execute operation '{}' finished successfully",
            self.node.name(),
            transaction_id,
            operation
        );
        Ok(value)
    }

    fn prepare_locked(&self, transaction: &Transaction<R>) -> Result<()> {
        let transaction_id = transaction.core.id();
        self.node
            .check_status(transaction, &[TransactionStatus::BeginFinished])?;

        if !transaction.two_phase {
            return Err(TransactionError::Usage(format!(
                "Transaction '{}' was started without transaction coordinator key, therefore calling prepare is not allowed.",
                transaction_id
            )));
        }

        log::info!("[{}] Prepare transaction '{}' started", self.node.name(), transaction_id);

        self.node.change_status(transaction, TransactionStatus::PrepareStarted)?;

        let resource = Arc::clone(&self.resource);
        let handle = transaction.resource_handle();
        transaction
            .worker
            .run(move || resource.prepare(transaction_id, handle.as_ref()))?;

        self.node.change_status(transaction, TransactionStatus::PrepareFinished)?;

        log::info!(
            "[{}] Prepare transaction '{}' finished successfully",
            self.node.name(),
            transaction_id
        );
        Ok(())
    }

    fn commit_locked(&self, transaction: &Transaction<R>) -> Result<()> {
        let transaction_id = transaction.core.id();
        let two_phase = transaction.two_phase;

        if two_phase {
            self.node.check_status(
                transaction,
                &[TransactionStatus::PrepareFinished, TransactionStatus::CommitStarted],
            )?;
        } else {
            self.node
                .check_status(transaction, &[TransactionStatus::BeginFinished])?;
        }

        log::info!("[{}] Commit transaction '{}' started", self.node.name(), transaction_id);

        self.node.change_status(transaction, TransactionStatus::CommitStarted)?;

        let resource = Arc::clone(&self.resource);
        let handle = transaction.resource_handle();
        let committed = transaction
            .worker
            .run(move || resource.commit(transaction_id, handle.as_ref(), two_phase));

        if let Err(commit_error) = committed {
            // Two-phase outcomes belong to the coordinator
            if !two_phase {
                if let Err(rollback_error) = self.rollback_locked(transaction) {
                    log::warn!(
                        "[{}] Transaction '{}' rollback failed: {}",
                        self.node.name(),
                        transaction_id,
                        rollback_error
                    );
                }
            }
            return Err(commit_error);
        }

        self.node.change_status(transaction, TransactionStatus::CommitFinished)?;
        transaction.worker.close();

        log::info!(
            "[{}] Commit transaction '{}' finished successfully",
            self.node.name(),
            transaction_id
        );
        Ok(())
    }

    fn rollback_locked(&self, transaction: &Transaction<R>) -> Result<()> {
        let transaction_id = transaction.core.id();
        let two_phase = transaction.two_phase;

        if transaction.core.status() == TransactionStatus::RollbackFinished {
            log::info!(
                "[{}] Transaction '{}' has been already rolled back before",
                self.node.name(),
                transaction_id
            );
            return Ok(());
        }

        if two_phase {
            self.node.check_status(
                transaction,
                &[
                    TransactionStatus::New,
                    TransactionStatus::BeginStarted,
                    TransactionStatus::BeginFinished,
                    TransactionStatus::PrepareStarted,
                    TransactionStatus::PrepareFinished,
                    TransactionStatus::RollbackStarted,
                ],
            )?;
        } else {
            self.node.check_status(
                transaction,
                &[
                    TransactionStatus::New,
                    TransactionStatus::BeginStarted,
                    TransactionStatus::BeginFinished,
                    TransactionStatus::CommitStarted,
                    TransactionStatus::RollbackStarted,
                ],
            )?;
        }

        log::info!("[{}] Rollback transaction '{}' started", self.node.name(), transaction_id);

        self.node.change_status(transaction, TransactionStatus::RollbackStarted)?;

        if let Some(handle) = transaction.resource_handle() {
            let resource = Arc::clone(&self.resource);
            transaction
                .worker
                .run(move || resource.rollback(transaction_id, &handle, two_phase))?;
        }

        self.node.change_status(transaction, TransactionStatus::RollbackFinished)?;
        transaction.worker.close();

        log::info!(
            "[{}] Rollback transaction '{}' finished successfully",
            self.node.name(),
            transaction_id
        );
        Ok(())
    }

    // ---- Public calls, unlogged ----

    fn begin(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        coordinator_key: Option<&str>,
    ) -> Result<()> {
        self.node.check_transaction_id(transaction_id)?;
        self.node.check_session_token(session_token)?;
        self.node.check_interactive_session_key(interactive_session_key)?;
        if let Some(coordinator_key) = coordinator_key {
            self.node.check_coordinator_key(coordinator_key)?;
        }

        let transaction = Arc::new(ParticipantTransaction::new(
            transaction_id,
            session_token,
            coordinator_key.is_some(),
        ));
        self.node.register(Arc::clone(&transaction))?;

        transaction.core.with_lock_or_fail(true, || {
            self.begin_locked(&transaction).map_err(|begin_error| {
                if transaction.core.status() == TransactionStatus::New {
                    // BEGIN_STARTED was never written; nothing to roll back
                    if let Err(delete_error) = self.node.transaction_log().delete(transaction_id) {
                        log::warn!(
                            "[{}] Could not delete transaction '{}': {}",
                            self.node.name(),
                            transaction_id,
                            delete_error
                        );
                    }
                    self.node.remove(transaction_id);
                } else if let Err(rollback_error) = self.rollback_locked(&transaction) {
                    log::warn!(
                        "[{}] Transaction '{}' rollback failed: {}",
                        self.node.name(),
                        transaction_id,
                        rollback_error
                    );
                }
                begin_error
            })
        })
    }

    fn execute(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        operation: &str,
        arguments: &[Value],
    ) -> Result<Value> {
        self.node.check_transaction_id(transaction_id)?;
        self.node.check_session_token(session_token)?;
        self.node.check_interactive_session_key(interactive_session_key)?;
        self.node.check_operation_name(operation)?;

        let transaction = self.node.require_transaction(transaction_id)?;
        let timeout = self.node.config().transaction_timeout();
        transaction.core.with_operation_lock(timeout, true, || {
            self.execute_locked(&transaction, session_token, operation, arguments)
        })
    }

    fn prepare(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<()> {
        self.node.check_transaction_id(transaction_id)?;
        self.node.check_session_token(session_token)?;
        self.node.check_interactive_session_key(interactive_session_key)?;
        self.node.check_coordinator_key(coordinator_key)?;

        let transaction = self.node.require_transaction(transaction_id)?;
        transaction.core.with_lock_or_fail(true, || {
            self.node.check_access(&transaction, session_token)?;
            self.prepare_locked(&transaction)
        })
    }

    fn commit(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()> {
        self.node.check_transaction_id(transaction_id)?;
        self.node.check_session_token(session_token)?;
        self.node.check_interactive_session_key(interactive_session_key)?;

        let transaction = match self.node.get_transaction(transaction_id) {
            Some(transaction) => transaction,
            None => {
                return self
                    .node
                    .check_recently_committed(transaction_id, Some(session_token))
            }
        };

        transaction.core.with_lock_or_fail(true, || {
            self.node.check_access(&transaction, session_token)?;
            self.commit_locked(&transaction)
        })
    }

    fn rollback(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()> {
        self.node.check_transaction_id(transaction_id)?;
        self.node.check_session_token(session_token)?;
        self.node.check_interactive_session_key(interactive_session_key)?;

        let transaction = match self.node.get_transaction(transaction_id) {
            Some(transaction) => transaction,
            None => return Ok(()),
        };

        transaction.core.with_lock_or_fail(true, || {
            self.node.check_access(&transaction, session_token)?;
            self.rollback_locked(&transaction)
        })
    }

    fn recover_pending(
        &self,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<Vec<TransactionId>> {
        self.node.check_interactive_session_key(interactive_session_key)?;
        self.node.check_coordinator_key(coordinator_key)?;

        log::info!(
            "[{}] Started recovering transactions (triggered by the coordinator)",
            self.node.name()
        );

        self.node.recover_from_log()?;

        let mut pending = Vec::new();
        for transaction_id in self.node.transaction_ids() {
            let transaction = match self.node.get_transaction(transaction_id) {
                Some(transaction) if transaction.two_phase => transaction,
                _ => continue,
            };
            match transaction.core.status() {
                TransactionStatus::PrepareFinished => pending.push(transaction_id),
                // A busy commit is still in progress and not up for recovery
                TransactionStatus::CommitStarted if !transaction.core.is_busy() => {
                    pending.push(transaction_id)
                }
                _ => {}
            }
        }

        log::info!(
            "[{}] Finished recovering transactions (triggered by the coordinator), {} pending",
            self.node.name(),
            pending.len()
        );
        Ok(pending)
    }

    fn commit_recovered(
        &self,
        transaction_id: TransactionId,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<()> {
        self.node.check_transaction_id(transaction_id)?;
        self.node.check_interactive_session_key(interactive_session_key)?;
        self.node.check_coordinator_key(coordinator_key)?;

        let transaction = match self.node.get_transaction(transaction_id) {
            Some(transaction) => transaction,
            None => return self.node.check_recently_committed(transaction_id, None),
        };

        transaction.core.with_lock_or_wait(
            self.node.config().transaction_timeout(),
            true,
            || self.commit_locked(&transaction),
        )
    }

    fn rollback_recovered(
        &self,
        transaction_id: TransactionId,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<()> {
        self.node.check_transaction_id(transaction_id)?;
        self.node.check_interactive_session_key(interactive_session_key)?;
        self.node.check_coordinator_key(coordinator_key)?;

        let transaction = match self.node.get_transaction(transaction_id) {
            Some(transaction) => transaction,
            None => return Ok(()),
        };

        transaction.core.with_lock_or_wait(
            self.node.config().transaction_timeout(),
            true,
            || self.rollback_locked(&transaction),
        )
    }
}

impl<R, E> AbandonedTransactionHandler<Transaction<R>> for Participant<R, E>
where
    R: ResourceTransactionProvider,
    E: OperationExecutor,
{
    fn is_coordinator(&self) -> bool {
        false
    }

    fn finish_via_commit(&self, transaction: &Transaction<R>) -> Result<()> {
        if transaction.core.status() == TransactionStatus::CommitStarted {
            self.commit_locked(transaction)?;
        }
        Ok(())
    }

    fn finish_via_rollback(&self, transaction: &Transaction<R>) -> Result<()> {
        self.rollback_locked(transaction)
    }
}

impl<R, E> TransactionParticipant for Participant<R, E>
where
    R: ResourceTransactionProvider,
    E: OperationExecutor,
{
    fn participant_id(&self) -> &str {
        &self.participant_id
    }

    fn begin_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        coordinator_key: Option<&str>,
    ) -> Result<()> {
        self.begin(transaction_id, session_token, interactive_session_key, coordinator_key)
            .map_err(|e| {
                self.node
                    .log_failure(&format!("Begin transaction '{}' failed.", transaction_id), e)
            })
    }

    fn execute_operation(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        operation: &str,
        arguments: &[Value],
    ) -> Result<Value> {
        self.execute(transaction_id, session_token, interactive_session_key, operation, arguments)
            .map_err(|e| {
                self.node.log_failure(
                    &format!(
                        "Transaction '{}' execute operation '{}' failed.",
                        transaction_id, operation
                    ),
                    e,
                )
            })
    }

    fn prepare_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<()> {
        self.prepare(transaction_id, session_token, interactive_session_key, coordinator_key)
            .map_err(|e| {
                self.node
                    .log_failure(&format!("Prepare transaction '{}' failed.", transaction_id), e)
            })
    }

    fn commit_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()> {
        self.commit(transaction_id, session_token, interactive_session_key)
            .map_err(|e| {
                self.node
                    .log_failure(&format!("Commit transaction '{}' failed.", transaction_id), e)
            })
    }

    fn rollback_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()> {
        self.rollback(transaction_id, session_token, interactive_session_key)
            .map_err(|e| {
                self.node
                    .log_failure(&format!("Rollback transaction '{}' failed.", transaction_id), e)
            })
    }

    fn recover_transactions(
        &self,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<Vec<TransactionId>> {
        self.recover_pending(interactive_session_key, coordinator_key)
            .map_err(|e| self.node.log_failure("Recover transactions failed.", e))
    }

    fn commit_recovered_transaction(
        &self,
        transaction_id: TransactionId,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<()> {
        self.commit_recovered(transaction_id, interactive_session_key, coordinator_key)
            .map_err(|e| {
                self.node
                    .log_failure(&format!("Commit transaction '{}' failed.", transaction_id), e)
            })
    }

    fn rollback_recovered_transaction(
        &self,
        transaction_id: TransactionId,
        interactive_session_key: &str,
        coordinator_key: &str,
    ) -> Result<()> {
        self.rollback_recovered(transaction_id, interactive_session_key, coordinator_key)
            .map_err(|e| {
                self.node
                    .log_failure(&format!("Rollback transaction '{}' failed.", transaction_id), e)
            })
    }
}
