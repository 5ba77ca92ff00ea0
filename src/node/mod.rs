//! Behaviour shared by coordinator and participant nodes
//!
//! A node owns the registry of live transactions and is the only place where a
//! transaction's status changes. Every non-terminal change is written to the node's
//! transaction log before it is applied in memory; a terminal change deletes the log
//! entry and drops the transaction from the registry.
//!
//! ## Background processing
//!
//! Two entry points are driven by the host application on whatever schedule it likes:
//! - [`TransactionNode::recover_from_log`] registers transactions left in the log by a
//!   previous process
//! - [`TransactionNode::finish_failed_or_abandoned`] rolls back or re-commits transactions
//!   that crashed mid-step or were abandoned by their client
//!
//! Both are safe to run repeatedly and concurrently with client traffic.

pub mod gate;
pub mod transaction;


use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

pub use transaction::{NodeTransaction, TransactionCore};

use crate::api::SessionTokenProvider;
use crate::config::TransactionConfig;
use crate::error::{Result, TransactionError};
use crate::transaction_log::TransactionLogStore;
use crate::types::{TransactionId, TransactionStatus};

/// Node-specific ways of finishing a failed or abandoned transaction
pub trait AbandonedTransactionHandler<T> {
    /// Only the coordinator retries commit for `PREPARE_FINISHED` transactions
    fn is_coordinator(&self) -> bool;

    fn finish_via_commit(&self, transaction: &T) -> Result<()>;

    fn finish_via_rollback(&self, transaction: &T) -> Result<()>;
}

/// A transaction that reached a terminal status on this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedTransaction {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub session_token: Option<String>,
}

/// Registry, log-backed status changes, recovery and sweep for one node
pub struct TransactionNode<T: NodeTransaction> {
    /// Used in log messages ("coordinator", "participant 'db'")
    name: String,
    config: TransactionConfig,
    session_tokens: Arc<dyn SessionTokenProvider>,
    log: Arc<dyn TransactionLogStore>,
    transactions: RwLock<HashMap<TransactionId, Arc<T>>>,
    /// Recently finished transactions, oldest first; bounded by the transaction count limit
    finished: Mutex<VecDeque<FinishedTransaction>>,
}

impl<T: NodeTransaction> TransactionNode<T> {
    pub fn new(
        name: impl Into<String>,
        config: TransactionConfig,
        session_tokens: Arc<dyn SessionTokenProvider>,
        log: Arc<dyn TransactionLogStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            config,
            session_tokens,
            log,
            transactions: RwLock::new(HashMap::new()),
            finished: Mutex::new(VecDeque::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn transaction_log(&self) -> &Arc<dyn TransactionLogStore> {
        &self.log
    }

    // ---- Registry ----

    pub fn get_transaction(&self, transaction_id: TransactionId) -> Option<Arc<T>> {
        self.transactions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&transaction_id)
            .cloned()
    }

    /// Look up a live transaction, failing with a usage error if it is unknown
    pub fn require_transaction(&self, transaction_id: TransactionId) -> Result<Arc<T>> {
        self.get_transaction(transaction_id)
            .ok_or_else(|| TransactionError::transaction_not_found(transaction_id))
    }

    /// Add a new transaction to the registry.
    ///
    /// Duplicate id, capacity and one-per-session checks happen under the same write
    /// lock as the insert. Transactions without a session token skip the session check.
    pub fn register(&self, transaction: Arc<T>) -> Result<()> {
        let core = transaction.core();
        let mut transactions = self
            .transactions
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if transactions.contains_key(&core.id()) {
            return Err(TransactionError::Usage(format!(
                "Transaction '{}' already exists.",
                core.id()
            )));
        }

        if transactions.len() >= self.config.transaction_count_limit {
            return Err(TransactionError::Usage(format!(
                "Cannot create transaction '{}' because the transaction count limit has been reached. Number of existing transactions: {}",
                core.id(),
                transactions.len()
            )));
        }

        if let Some(session_token) = core.session_token() {
            let existing = transactions
                .values()
                .find(|t| t.core().session_token() == Some(session_token));
            if let Some(existing) = existing {
                return Err(TransactionError::Usage(format!(
                    "Cannot create more than one transaction for the same session token. Transaction that could not be created: '{}'. The already existing and still active transaction: '{}'.",
                    core.id(),
                    existing.core().id()
                )));
            }
        }

        transactions.insert(core.id(), transaction);
        Ok(())
    }

    /// Drop a transaction from the registry without touching the log
    pub fn remove(&self, transaction_id: TransactionId) -> Option<Arc<T>> {
        self.transactions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&transaction_id)
    }

    // ---- Status ----

    /// Move a transaction to `new_status`.
    ///
    /// Non-terminal: the new status is logged first and applied only if the write
    /// succeeded. Terminal: the log entry is deleted and the transaction leaves the registry.
    pub fn change_status(&self, transaction: &T, new_status: TransactionStatus) -> Result<()> {
        let core = transaction.core();

        if new_status.is_terminal() {
            self.log.delete(core.id())?;
            core.set_status(new_status);
            // Recorded before the registry drops it; recovery checks both
            self.remember_finished(core, new_status);
            self.remove(core.id());
        } else {
            let entry = transaction.to_log_entry(new_status);
            self.log.put(&entry)?;
            core.set_status(new_status);
        }

        log::debug!(
            "[{}] Transaction '{}' changed status to '{}'",
            self.name,
            core.id(),
            new_status
        );
        Ok(())
    }

    fn remember_finished(&self, core: &TransactionCore, status: TransactionStatus) {
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        finished.retain(|f| f.transaction_id != core.id());
        finished.push_back(FinishedTransaction {
            transaction_id: core.id(),
            status,
            session_token: core.session_token().map(str::to_string),
        });
        while finished.len() > self.config.transaction_count_limit {
            finished.pop_front();
        }
    }

    /// Terminal outcome of a transaction this node finished recently
    pub fn finished_transaction(&self, transaction_id: TransactionId) -> Option<FinishedTransaction> {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|f| f.transaction_id == transaction_id)
            .cloned()
    }

    /// Answer a commit for a transaction that is no longer live. A transaction this node
    /// committed recently is accepted again as a no-op; anything else is an error.
    /// `session_token` is `None` for calls authenticated by the coordinator key.
    pub fn check_recently_committed(
        &self,
        transaction_id: TransactionId,
        session_token: Option<&str>,
    ) -> Result<()> {
        let finished = self
            .finished_transaction(transaction_id)
            .ok_or_else(|| TransactionError::transaction_not_found(transaction_id))?;

        if let Some(session_token) = session_token {
            self.check_owner(transaction_id, finished.session_token.as_deref(), session_token)?;
        }

        if finished.status == TransactionStatus::CommitFinished {
            log::info!(
                "[{}] Transaction '{}' has been already committed before",
                self.name,
                transaction_id
            );
            Ok(())
        } else {
            Err(TransactionError::Usage(format!(
                "Transaction '{}' has been already rolled back.",
                transaction_id
            )))
        }
    }

    // ---- Recovery ----

    /// Register every transaction the log says is still in flight.
    ///
    /// One-phase entries and entries in `NEW`, `COMMIT_FINISHED` or `ROLLBACK_FINISHED`
    /// carry nothing to recover and are deleted. Already registered transactions are kept.
    pub fn recover_from_log(&self) -> Result<()> {
        log::info!("[{}] Started recovering transactions from transaction log", self.name);

        let result = self.recover_entries();
        match &result {
            Ok(recovered) => log::info!(
                "[{}] Finished recovering transactions from transaction log ({} recovered)",
                self.name,
                recovered
            ),
            Err(e) => log::error!(
                "[{}] Recovering transactions from transaction log has failed: {}",
                self.name,
                e
            ),
        }
        result.map(|_| ())
    }

    fn recover_entries(&self) -> Result<usize> {
        let mut recovered = 0;

        for entry in self.log.list_all()? {
            if !entry.two_phase_transaction || !entry.transaction_status.needs_recovery() {
                log::info!(
                    "[{}] Nothing to recover for {} transaction '{}' found in the transaction log with last status '{}'",
                    self.name,
                    if entry.two_phase_transaction { "two-phase" } else { "one-phase" },
                    entry.transaction_id,
                    entry.transaction_status
                );
                // The entry of a transaction still live in this process stays
                if self.get_transaction(entry.transaction_id).is_none() {
                    self.log.delete(entry.transaction_id)?;
                }
                continue;
            }

            let mut transactions = self
                .transactions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if transactions.contains_key(&entry.transaction_id) {
                continue;
            }
            // Finished after the log was listed
            if self.finished_transaction(entry.transaction_id).is_some() {
                continue;
            }

            let transaction = T::from_log_entry(&entry)?;
            transactions.insert(entry.transaction_id, Arc::new(transaction));
            recovered += 1;

            log::info!(
                "[{}] Recovered transaction '{}' found in the transaction log with last status '{}'",
                self.name,
                entry.transaction_id,
                entry.transaction_status
            );
        }

        Ok(recovered)
    }

    // ---- Sweep ----

    /// Roll back or re-commit transactions that failed midway or were abandoned.
    ///
    /// Busy transactions are skipped. A failure on one transaction is logged and does not
    /// stop the sweep.
    pub fn finish_failed_or_abandoned<H>(&self, handler: &H)
    where
        H: AbandonedTransactionHandler<T>,
    {
        log::info!("[{}] Started processing of failed or abandoned transactions", self.name);

        let snapshot: Vec<Arc<T>> = self
            .transactions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for transaction in snapshot {
            let core = transaction.core();
            let status = core.status();
            log::info!(
                "[{}] Checking transaction '{}' with last status '{}'",
                self.name,
                core.id(),
                status
            );

            if let Err(e) = self.finish_one(handler, &transaction, status) {
                log::warn!(
                    "[{}] Finishing failed or abandoned transaction '{}' with last status '{}' has failed: {}",
                    self.name,
                    core.id(),
                    core.status(),
                    e
                );
            }
        }

        log::info!("[{}] Finished processing of failed or abandoned transactions", self.name);
    }

    fn finish_one<H>(&self, handler: &H, transaction: &T, status: TransactionStatus) -> Result<()>
    where
        H: AbandonedTransactionHandler<T>,
    {
        let core = transaction.core();
        match status {
            // A step crashed or failed midway; no need to wait for the timeout
            status if status.is_unfinished_step() => {
                self.finish_unchanged(transaction, status, || handler.finish_via_rollback(transaction))?;
            }
            TransactionStatus::New | TransactionStatus::BeginFinished => {
                let timeout = self.config.transaction_timeout();
                let idle = core.idle_time();
                if idle > timeout {
                    log::info!(
                        "[{}] Transaction '{}' has timed out. It was idle for {}s",
                        self.name,
                        core.id(),
                        idle.as_secs()
                    );
                    self.finish_unchanged(transaction, status, || {
                        // A client call may have landed before the gate was taken
                        if core.idle_time() > timeout {
                            handler.finish_via_rollback(transaction)
                        } else {
                            Ok(())
                        }
                    })?;
                } else {
                    log::info!(
                        "[{}] Transaction '{}' hasn't timed out yet. It will time out in {}s",
                        self.name,
                        core.id(),
                        (timeout - idle).as_secs()
                    );
                }
            }
            // Participants wait for the coordinator's decision
            TransactionStatus::PrepareFinished => {
                if handler.is_coordinator() {
                    self.finish_unchanged(transaction, status, || handler.finish_via_commit(transaction))?;
                }
            }
            TransactionStatus::CommitStarted => {
                self.finish_unchanged(transaction, status, || handler.finish_via_commit(transaction))?;
            }
            // Terminal
            _ => {}
        }
        Ok(())
    }

    /// Run `finish` holding the gate, but only if the transaction is still registered and
    /// still in the `seen` status the decision was based on
    fn finish_unchanged(
        &self,
        transaction: &T,
        seen: TransactionStatus,
        finish: impl FnOnce() -> Result<()>,
    ) -> Result<()> {
        let core = transaction.core();
        core.with_lock_or_skip(false, || {
            let registered = self
                .get_transaction(core.id())
                .map_or(false, |live| std::ptr::eq(Arc::as_ptr(&live), transaction));
            let current = core.status();
            if !registered || current != seen {
                log::info!(
                    "[{}] Transaction '{}' moved from '{}' to '{}' before it could be finished. Leaving it.",
                    self.name,
                    core.id(),
                    seen,
                    current
                );
                return Ok(());
            }
            finish()
        })?;
        Ok(())
    }

    // ---- Checks ----

    pub fn check_transaction_id(&self, transaction_id: TransactionId) -> Result<()> {
        if transaction_id.is_nil() {
            return Err(TransactionError::Usage(
                "Transaction id cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn check_session_token(&self, session_token: &str) -> Result<()> {
        if session_token.is_empty() {
            return Err(TransactionError::Usage(
                "Session token cannot be empty".to_string(),
            ));
        }
        if !self.session_tokens.is_valid(session_token) {
            return Err(TransactionError::Usage("Invalid session token".to_string()));
        }
        Ok(())
    }

    pub fn check_interactive_session_key(&self, interactive_session_key: &str) -> Result<()> {
        if interactive_session_key.is_empty() {
            return Err(TransactionError::Usage(
                "Interactive session key cannot be empty".to_string(),
            ));
        }
        if interactive_session_key != self.config.interactive_session_key {
            return Err(TransactionError::Usage(
                "Invalid interactive session key".to_string(),
            ));
        }
        Ok(())
    }

    pub fn check_coordinator_key(&self, coordinator_key: &str) -> Result<()> {
        if coordinator_key.is_empty() {
            return Err(TransactionError::Usage(
                "Transaction coordinator key cannot be empty".to_string(),
            ));
        }
        if coordinator_key != self.config.coordinator_key {
            return Err(TransactionError::Usage(
                "Invalid transaction coordinator key".to_string(),
            ));
        }
        Ok(())
    }

    pub fn check_operation_name(&self, operation: &str) -> Result<()> {
        if operation.trim().is_empty() {
            return Err(TransactionError::Usage(
                "Operation name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn check_status(&self, transaction: &T, expected: &[TransactionStatus]) -> Result<()> {
        let core = transaction.core();
        let status = core.status();
        if expected.contains(&status) {
            Ok(())
        } else {
            Err(TransactionError::unexpected_status(core.id(), status, expected))
        }
    }

    /// The owner session and admins may act on a transaction
    pub fn check_access(&self, transaction: &T, session_token: &str) -> Result<()> {
        let core = transaction.core();
        self.check_owner(core.id(), core.session_token(), session_token)
    }

    pub fn check_owner(
        &self,
        transaction_id: TransactionId,
        owner: Option<&str>,
        session_token: &str,
    ) -> Result<()> {
        if self.session_tokens.is_admin_or_system(session_token) || owner == Some(session_token) {
            Ok(())
        } else {
            Err(TransactionError::access_denied(transaction_id))
        }
    }

    /// Log a failed public call and hand the error back.
    /// Usage and operation errors are expected and logged at info level.
    pub fn log_failure(&self, message: &str, error: TransactionError) -> TransactionError {
        if error.is_usage() || error.is_operation() {
            log::info!("[{}] {} {}", self.name, message, error);
        } else {
            log::error!("[{}] {} {}", self.name, message, error);
        }
        error
    }

    // ---- Introspection ----

    pub fn transaction_status(&self, transaction_id: TransactionId) -> Option<TransactionStatus> {
        self.get_transaction(transaction_id).map(|t| t.core().status())
    }

    /// Ids of all live transactions, sorted
    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        let mut ids: Vec<TransactionId> = self
            .transactions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
