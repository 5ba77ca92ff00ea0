//! Coordinator node: runs the two-phase commit protocol across participants
//!
//! A client begins a transaction here and names a participant with every operation. The
//! first operation for a participant begins the transaction there (with the coordinator
//! key, so it is two-phase) and marks the participant as touched. Commit prepares every
//! touched participant in configured order and then commits them; participants that were
//! never touched are left alone.
//!
//! ## Failure handling
//!
//! - A prepare failure rolls back all touched participants at once and is returned
//! - A commit or rollback failure is logged and left in `COMMIT_STARTED` / `ROLLBACK_STARTED`
//!   for [`Coordinator::sweep`] to retry
//! - During a sweep, commit asks each participant which of its transactions are still
//!   pending and only commits where the transaction is listed


use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use crate::api::{SessionTokenProvider, TransactionCoordinator, TransactionParticipant};
use crate::config::TransactionConfig;
use crate::error::{Result, TransactionError};
use crate::node::{AbandonedTransactionHandler, NodeTransaction, TransactionCore, TransactionNode};
use crate::transaction_log::{FileTransactionLog, TransactionLogEntry, TransactionLogStore};
use crate::types::{TransactionId, TransactionStatus, Value};

/// Transaction as seen by the coordinator
pub struct CoordinatorTransaction {
    core: TransactionCore,
    /// Participants that received at least one operation
    participant_ids: Mutex<BTreeSet<String>>,
}

impl CoordinatorTransaction {
    fn new(transaction_id: TransactionId, session_token: &str) -> Self {
        Self {
            core: TransactionCore::new(transaction_id, session_token),
            participant_ids: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn participant_ids(&self) -> BTreeSet<String> {
        self.participant_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_touched(&self, participant_id: &str) -> bool {
        self.participant_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(participant_id)
    }

    fn mark_touched(&self, participant_id: &str) {
        self.participant_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(participant_id.to_string());
    }
}

impl NodeTransaction for CoordinatorTransaction {
    fn core(&self) -> &TransactionCore {
        &self.core
    }

    fn to_log_entry(&self, status: TransactionStatus) -> TransactionLogEntry {
        TransactionLogEntry {
            transaction_id: self.core.id(),
            transaction_status: status,
            two_phase_transaction: true,
            last_accessed: self.core.last_accessed_millis(),
            participant_ids: Some(self.participant_ids()),
        }
    }

    fn from_log_entry(entry: &TransactionLogEntry) -> Result<Self> {
        Ok(Self {
            core: TransactionCore::recovered(entry.transaction_id, entry.transaction_status),
            participant_ids: Mutex::new(entry.participant_ids.clone().unwrap_or_default()),
        })
    }
}

/// Who is driving a commit or rollback
#[derive(Debug, Clone, Copy)]
enum Driver<'a> {
    /// A live client call; participants see the client's session
    Client { session_token: &'a str },
    /// The sweep, finishing a transaction after a failure or restart
    Recovery,
}

/// Coordinator node over a fixed, ordered list of participants
pub struct Coordinator {
    node: TransactionNode<CoordinatorTransaction>,
    participants: Vec<Arc<dyn TransactionParticipant>>,
}

impl Coordinator {
    pub fn new(
        config: TransactionConfig,
        session_tokens: Arc<dyn SessionTokenProvider>,
        participants: Vec<Arc<dyn TransactionParticipant>>,
        log: Arc<dyn TransactionLogStore>,
    ) -> Result<Self> {
        if participants.is_empty() {
            return Err(TransactionError::Config(
                "Participants cannot be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for participant in &participants {
            if !seen.insert(participant.participant_id().to_string()) {
                return Err(TransactionError::Config(format!(
                    "Duplicate participant id '{}'",
                    participant.participant_id()
                )));
            }
        }

        let node = TransactionNode::new("coordinator", config, session_tokens, log)?;
        Ok(Self { node, participants })
    }

    /// Create a coordinator logging to `<config.log_folder>/coordinator`
    pub fn with_file_log(
        config: TransactionConfig,
        session_tokens: Arc<dyn SessionTokenProvider>,
        participants: Vec<Arc<dyn TransactionParticipant>>,
    ) -> Result<Self> {
        let log = FileTransactionLog::open(&config.log_folder, "coordinator")?;
        Self::new(config, session_tokens, participants, Arc::new(log))
    }

    pub fn node(&self) -> &TransactionNode<CoordinatorTransaction> {
        &self.node
    }

    pub fn participants(&self) -> &[Arc<dyn TransactionParticipant>] {
        &self.participants
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

    /// Participants touched by a live transaction
    pub fn touched_participants(&self, transaction_id: TransactionId) -> Option<BTreeSet<String>> {
        self.node
            .get_transaction(transaction_id)
            .map(|t| t.participant_ids())
    }

    fn participant(&self, participant_id: &str) -> Result<&Arc<dyn TransactionParticipant>> {
        if participant_id.is_empty() {
            return Err(TransactionError::Usage(
                "Participant id cannot be empty".to_string(),
            ));
        }
        self.participants
            .iter()
            .find(|p| p.participant_id() == participant_id)
            .ok_or_else(|| {
                TransactionError::Usage(format!(
                    "Unknown participant with id '{}'",
                    participant_id
                ))
            })
    }

    fn interactive_session_key(&self) -> &str {
        &self.node.config().interactive_session_key
    }

    fn coordinator_key(&self) -> &str {
        &self.node.config().coordinator_key
    }

    /// Touched participants in configured order; the rest are logged as skipped
    fn touched<'a>(
        &'a self,
        transaction: &CoordinatorTransaction,
        step: &str,
    ) -> Vec<&'a Arc<dyn TransactionParticipant>> {
        let touched = transaction.participant_ids();
        self.participants
            .iter()
            .filter(|p| {
                let keep = touched.contains(p.participant_id());
                if !keep {
                    log::info!(
                        "Skipping {} of transaction '{}' for participant '{}' as no operations were executed on that participant",
                        step,
                        transaction.core.id(),
                        p.participant_id()
                    );
                }
                keep
            })
            .collect()
    }

    // ---- Steps, called with the transaction's gate held ----

    fn begin_locked(&self, transaction: &CoordinatorTransaction) -> Result<()> {
        self.node.change_status(transaction, TransactionStatus::BeginStarted)?;
        log::info!("Begin transaction '{}'", transaction.core.id());
        self.node.change_status(transaction, TransactionStatus::BeginFinished)
    }

    fn execute_locked(
        &self,
        transaction: &CoordinatorTransaction,
        session_token: &str,
        participant: &Arc<dyn TransactionParticipant>,
        operation: &str,
        arguments: &[Value],
    ) -> Result<Value> {
        let transaction_id = transaction.core.id();
        let participant_id = participant.participant_id();

        self.node.check_access(transaction, session_token)?;
        self.node
            .check_status(transaction, &[TransactionStatus::BeginFinished])?;

        log::info!(
            "Transaction '{}' execute operation '{}' for participant '{}' started",
            transaction_id,
            operation,
            participant_id
        );

        if !transaction.is_touched(participant_id) {
            log::info!(
                "Begin transaction '{}' for participant '{}'",
                transaction_id,
                participant_id
            );
            participant
                .begin_transaction(
                    transaction_id,
                    session_token,
                    self.interactive_session_key(),
                    Some(self.coordinator_key()),
                )
                .map_err(|e| {
                    TransactionError::participant(
                        format!(
                            "Begin transaction '{}' failed for participant '{}'.",
                            transaction_id, participant_id
                        ),
                        e,
                    )
                })?;

            // Touched even if the log write fails, so a rollback still reaches it
            transaction.mark_touched(participant_id);
            self.node
                .change_status(transaction, TransactionStatus::BeginFinished)?;
        }

        // Operation failures do not roll back; the client decides
        let result = participant
            .execute_operation(
                transaction_id,
                session_token,
                self.interactive_session_key(),
                operation,
                arguments,
            )
            .map_err(|e| {
                let message = format!(
                    "Transaction '{}' execute operation '{}' for participant '{}' failed with error: {}",
                    transaction_id, operation, participant_id, e
                );
                if e.is_operation() {
                    TransactionError::operation(message)
                } else {
                    TransactionError::participant(message, e)
                }
            })?;

        log::info!(
            "Transaction '{}' execute operation '{}' for participant '{}' finished successfully",
            transaction_id,
            operation,
            participant_id
        );
        Ok(result)
    }

    fn prepare_locked(&self, transaction: &CoordinatorTransaction, session_token: &str) -> Result<()> {
        let transaction_id = transaction.core.id();
        log::info!("Prepare transaction '{}' started", transaction_id);

        self.node
            .change_status(transaction, TransactionStatus::PrepareStarted)?;

        for participant in self.touched(transaction, "prepare") {
            log::info!(
                "Prepare transaction '{}' for participant '{}'",
                transaction_id,
                participant.participant_id()
            );

            let prepared = participant.prepare_transaction(
                transaction_id,
                session_token,
                self.interactive_session_key(),
                self.coordinator_key(),
            );

            if let Err(prepare_error) = prepared {
                if let Err(rollback_error) =
                    self.rollback_locked(transaction, Driver::Client { session_token })
                {
                    log::warn!(
                        "Rollback transaction '{}' failed: {}",
                        transaction_id,
                        rollback_error
                    );
                }

                return Err(TransactionError::participant(
                    format!(
                        "Prepare transaction '{}' failed for participant '{}'. The transaction was rolled back.",
                        transaction_id,
                        participant.participant_id()
                    ),
                    prepare_error,
                ));
            }
        }

        self.node
            .change_status(transaction, TransactionStatus::PrepareFinished)?;

        log::info!("Prepare transaction '{}' finished successfully", transaction_id);
        Ok(())
    }

    fn commit_prepared_locked(&self, transaction: &CoordinatorTransaction, driver: Driver<'_>) -> Result<()> {
        let transaction_id = transaction.core.id();
        log::info!("Commit prepared transaction '{}' started", transaction_id);

        self.node
            .change_status(transaction, TransactionStatus::CommitStarted)?;

        let mut first_error = None;

        for participant in self.touched(transaction, "commit") {
            let committed = match driver {
                Driver::Client { session_token } => {
                    log::info!(
                        "Commit prepared transaction '{}' for participant '{}'",
                        transaction_id,
                        participant.participant_id()
                    );
                    participant.commit_transaction(
                        transaction_id,
                        session_token,
                        self.interactive_session_key(),
                    )
                }
                Driver::Recovery => self.commit_recovered_at(participant, transaction_id),
            };

            if let Err(e) = committed {
                if first_error.is_none() {
                    first_error = Some(TransactionError::participant(
                        format!(
                            "Commit prepared transaction '{}' failed for participant '{}'.",
                            transaction_id,
                            participant.participant_id()
                        ),
                        e,
                    ));
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        self.node
            .change_status(transaction, TransactionStatus::CommitFinished)?;
        log::info!(
            "Commit prepared transaction '{}' finished successfully",
            transaction_id
        );
        Ok(())
    }

    /// Commit at a participant only if it still lists the transaction as pending.
    /// The list is fetched again on every call.
    fn commit_recovered_at(
        &self,
        participant: &Arc<dyn TransactionParticipant>,
        transaction_id: TransactionId,
    ) -> Result<()> {
        let pending =
            participant.recover_transactions(self.interactive_session_key(), self.coordinator_key())?;

        if pending.contains(&transaction_id) {
            log::info!(
                "Commit prepared transaction '{}' for participant '{}'",
                transaction_id,
                participant.participant_id()
            );
            participant.commit_recovered_transaction(
                transaction_id,
                self.interactive_session_key(),
                self.coordinator_key(),
            )
        } else {
            log::info!(
                "Skipping commit of prepared transaction '{}' for participant '{}'. The transaction has been already committed at that participant before",
                transaction_id,
                participant.participant_id()
            );
            Ok(())
        }
    }

    fn rollback_locked(&self, transaction: &CoordinatorTransaction, driver: Driver<'_>) -> Result<()> {
        let transaction_id = transaction.core.id();
        if transaction.core.status() == TransactionStatus::RollbackFinished {
            return Ok(());
        }
        // Never undo a decided commit
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
        log::info!("Rollback transaction '{}' started", transaction_id);

        self.node
            .change_status(transaction, TransactionStatus::RollbackStarted)?;

        let mut first_error = None;

        for participant in self.touched(transaction, "rollback") {
            log::info!(
                "Rollback transaction '{}' for participant '{}'",
                transaction_id,
                participant.participant_id()
            );

            // Participants that no longer know the transaction treat a recovery rollback as a no-op
            let rolled_back = match driver {
                Driver::Client { session_token } => participant.rollback_transaction(
                    transaction_id,
                    session_token,
                    self.interactive_session_key(),
                ),
                Driver::Recovery => participant.rollback_recovered_transaction(
                    transaction_id,
                    self.interactive_session_key(),
                    self.coordinator_key(),
                ),
            };

            if let Err(e) = rolled_back {
                if first_error.is_none() {
                    first_error = Some(TransactionError::participant(
                        format!(
                            "Rollback transaction '{}' failed for participant '{}'.",
                            transaction_id,
                            participant.participant_id()
                        ),
                        e,
                    ));
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        self.node
            .change_status(transaction, TransactionStatus::RollbackFinished)?;
        log::info!("Rollback transaction '{}' finished successfully", transaction_id);
        Ok(())
    }

    // ---- Public calls, unlogged ----

    fn begin(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()> {
        self.node.check_transaction_id(transaction_id)?;
        self.node.check_session_token(session_token)?;
        self.node.check_interactive_session_key(interactive_session_key)?;

        let transaction = Arc::new(CoordinatorTransaction::new(transaction_id, session_token));
        self.node.register(Arc::clone(&transaction))?;

        transaction.core.with_lock_or_fail(true, || {
            self.begin_locked(&transaction).map_err(|begin_error| {
                // No partial state survives a failed begin
                if let Err(delete_error) = self.node.transaction_log().delete(transaction_id) {
                    log::warn!(
                        "Could not delete transaction '{}': {}",
                        transaction_id,
                        delete_error
                    );
                }
                self.node.remove(transaction_id);
                begin_error
            })
        })
    }

    fn execute(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
        participant_id: &str,
        operation: &str,
        arguments: &[Value],
    ) -> Result<Value> {
        self.node.check_transaction_id(transaction_id)?;
        self.node.check_session_token(session_token)?;
        self.node.check_interactive_session_key(interactive_session_key)?;
        let participant = self.participant(participant_id)?;
        self.node.check_operation_name(operation)?;

        let transaction = self.node.require_transaction(transaction_id)?;
        let timeout = self.node.config().transaction_timeout();
        transaction.core.with_operation_lock(timeout, true, || {
            self.execute_locked(&transaction, session_token, participant, operation, arguments)
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
            self.node
                .check_status(&transaction, &[TransactionStatus::BeginFinished])?;

            log::info!("Commit transaction '{}' started", transaction_id);

            self.prepare_locked(&transaction, session_token)?;

            // Nothing the client can do about a failed commit; the sweep retries it
            match self.commit_prepared_locked(&transaction, Driver::Client { session_token }) {
                Ok(()) => log::info!("Commit transaction '{}' finished successfully", transaction_id),
                Err(e) => log::error!(
                    "Commit transaction '{}' failed. It will be automatically retried by the coordinator: {}",
                    transaction_id,
                    e
                ),
            }
            Ok(())
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
            self.node.check_status(
                &transaction,
                &[
                    TransactionStatus::BeginStarted,
                    TransactionStatus::BeginFinished,
                    TransactionStatus::PrepareStarted,
                    TransactionStatus::PrepareFinished,
                    TransactionStatus::RollbackStarted,
                    TransactionStatus::RollbackFinished,
                ],
            )?;

            if let Err(e) = self.rollback_locked(&transaction, Driver::Client { session_token }) {
                log::error!(
                    "Rollback transaction '{}' failed. It will be automatically retried by the coordinator: {}",
                    transaction_id,
                    e
                );
            }
            Ok(())
        })
    }
}

impl AbandonedTransactionHandler<CoordinatorTransaction> for Coordinator {
    fn is_coordinator(&self) -> bool {
        true
    }

    fn finish_via_commit(&self, transaction: &CoordinatorTransaction) -> Result<()> {
        self.commit_prepared_locked(transaction, Driver::Recovery)
    }

    fn finish_via_rollback(&self, transaction: &CoordinatorTransaction) -> Result<()> {
        self.rollback_locked(transaction, Driver::Recovery)
    }
}

impl TransactionCoordinator for Coordinator {
    fn begin_transaction(
        &self,
        transaction_id: TransactionId,
        session_token: &str,
        interactive_session_key: &str,
    ) -> Result<()> {
        self.begin(transaction_id, session_token, interactive_session_key)
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
        participant_id: &str,
        operation: &str,
        arguments: &[Value],
    ) -> Result<Value> {
        self.execute(
            transaction_id,
            session_token,
            interactive_session_key,
            participant_id,
            operation,
            arguments,
        )
        .map_err(|e| {
            self.node.log_failure(
                &format!(
                    "Transaction '{}' execute operation '{}' for participant '{}' failed.",
                    transaction_id, operation, participant_id
                ),
                e,
            )
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
}
