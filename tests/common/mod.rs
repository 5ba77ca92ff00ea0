//! Shared fixtures for the integration suites: a coordinator wired to in-memory
//! participants whose stores record calls and can be told to fail.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use twophase::{
    Coordinator, MemoryStore, OperationExecutor, Participant, ResourceTransactionProvider, Result,
    SessionTokenProvider, TransactionConfig, TransactionError, TransactionId,
    TransactionParticipant, Value,
};

pub const INTERACTIVE: &str = "interactive-key";
pub const COORDINATOR: &str = "coordinator-key";

/// Any token but "expired" is valid; "admin" may act on every transaction
pub struct Sessions;

impl SessionTokenProvider for Sessions {
    fn is_valid(&self, session_token: &str) -> bool {
        session_token != "expired"
    }

    fn is_admin_or_system(&self, session_token: &str) -> bool {
        session_token == "admin"
    }
}

/// Memory store that records resource calls, can fail prepare or commit, and tracks how
/// many operations run at once. The `slow` operation sleeps for `SLOW_OPERATION`.
#[derive(Default)]
pub struct RecordingStore {
    pub inner: MemoryStore,
    pub fail_prepare: AtomicBool,
    pub fail_commit: AtomicBool,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

pub const SLOW_OPERATION: Duration = Duration::from_millis(400);

impl RecordingStore {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn check(&self, call: &str, fail: &AtomicBool) -> Result<()> {
        self.record(call);
        if fail.load(Ordering::SeqCst) {
            return Err(TransactionError::Resource(format!("{} refused", call)));
        }
        Ok(())
    }
}

impl ResourceTransactionProvider for RecordingStore {
    type Handle = TransactionId;

    fn begin(&self, transaction_id: TransactionId) -> Result<TransactionId> {
        self.record("begin");
        self.inner.begin(transaction_id)
    }

    fn prepare(&self, transaction_id: TransactionId, handle: Option<&TransactionId>) -> Result<()> {
        self.check("prepare", &self.fail_prepare)?;
        self.inner.prepare(transaction_id, handle)
    }

    fn commit(
        &self,
        transaction_id: TransactionId,
        handle: Option<&TransactionId>,
        two_phase: bool,
    ) -> Result<()> {
        self.check("commit", &self.fail_commit)?;
        self.inner.commit(transaction_id, handle, two_phase)
    }

    fn rollback(&self, transaction_id: TransactionId, handle: &TransactionId, two_phase: bool) -> Result<()> {
        self.record("rollback");
        self.inner.rollback(transaction_id, handle, two_phase)
    }
}

impl OperationExecutor for RecordingStore {
    fn execute(
        &self,
        session_token: &str,
        transaction_id: Option<TransactionId>,
        operation: &str,
        arguments: &[Value],
    ) -> Result<Value> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let result = if operation == "slow" {
            thread::sleep(SLOW_OPERATION);
            Ok(Value::Null)
        } else {
            self.inner.execute(session_token, transaction_id, operation, arguments)
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub type TestParticipant = Participant<RecordingStore, RecordingStore>;

/// A coordinator over participants named by `ids`, all logging under one folder
pub struct Cluster {
    pub coordinator: Arc<Coordinator>,
    pub participants: Vec<Arc<TestParticipant>>,
    pub stores: Vec<Arc<RecordingStore>>,
}

impl Cluster {
    pub fn start(config: TransactionConfig, ids: &[&str]) -> Self {
        let stores = ids.iter().map(|_| Arc::new(RecordingStore::default())).collect();
        Self::restart(config, ids, stores)
    }

    /// Build fresh nodes over existing stores, as after a process restart
    pub fn restart(config: TransactionConfig, ids: &[&str], stores: Vec<Arc<RecordingStore>>) -> Self {
        let participants: Vec<Arc<TestParticipant>> = ids
            .iter()
            .zip(&stores)
            .map(|(id, store)| {
                Arc::new(
                    Participant::with_file_log(
                        *id,
                        config.clone(),
                        Arc::new(Sessions),
                        Arc::clone(store),
                        Arc::clone(store),
                    )
                    .unwrap(),
                )
            })
            .collect();

        let coordinator = Coordinator::with_file_log(
            config,
            Arc::new(Sessions),
            participants
                .iter()
                .map(|p| Arc::clone(p) as Arc<dyn TransactionParticipant>)
                .collect(),
        )
        .unwrap();

        Self {
            coordinator: Arc::new(coordinator),
            participants,
            stores,
        }
    }

    pub fn store(&self, index: usize) -> &RecordingStore {
        &self.stores[index]
    }

    pub fn put(&self, id: TransactionId, participant: &str, key: &str, value: Value) -> Result<Value> {
        use twophase::TransactionCoordinator;
        self.coordinator.execute_operation(
            id,
            "user",
            INTERACTIVE,
            participant,
            "put",
            &[Value::String(key.to_string()), value],
        )
    }

    /// Recovery and sweep on every node, participants first
    pub fn maintain(&self) {
        for participant in &self.participants {
            participant.recover().unwrap();
            participant.sweep();
        }
        self.coordinator.recover().unwrap();
        self.coordinator.sweep();
    }
}

pub fn config(dir: &Path) -> TransactionConfig {
    TransactionConfig {
        transaction_timeout_secs: 1,
        log_folder: dir.to_path_buf(),
        ..TransactionConfig::new(COORDINATOR, INTERACTIVE)
    }
}
