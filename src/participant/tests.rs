use super::*;
use crate::memory::MemoryStore;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use uuid::Uuid;

const INTERACTIVE: &str = "interactive-key";
const COORDINATOR: &str = "coordinator-key";

struct Sessions;

impl SessionTokenProvider for Sessions {
    fn is_valid(&self, session_token: &str) -> bool {
        session_token != "expired"
    }

    fn is_admin_or_system(&self, session_token: &str) -> bool {
        session_token == "admin"
    }
}

/// Memory store that records resource calls and can be told to fail them
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_begin: AtomicBool,
    fail_prepare: AtomicBool,
    fail_commit: AtomicBool,
    calls: Mutex<Vec<String>>,
    threads: Mutex<Vec<String>>,
}

impl FlakyStore {
    fn record(&self, call: &str, fail: &AtomicBool) -> Result<()> {
        self.calls.lock().unwrap().push(call.to_string());
        self.threads
            .lock()
            .unwrap()
            .push(thread::current().name().unwrap_or("").to_string());
        if fail.load(Ordering::SeqCst) {
            return Err(TransactionError::Resource(format!("{} failed", call)));
        }
        Ok(())
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ResourceTransactionProvider for FlakyStore {
    type Handle = TransactionId;

    fn begin(&self, transaction_id: TransactionId) -> Result<TransactionId> {
        self.record("begin", &self.fail_begin)?;
        self.inner.begin(transaction_id)
    }

    fn prepare(&self, transaction_id: TransactionId, handle: Option<&TransactionId>) -> Result<()> {
        self.record("prepare", &self.fail_prepare)?;
        self.inner.prepare(transaction_id, handle)
    }

    fn commit(&self, transaction_id: TransactionId, handle: Option<&TransactionId>, two_phase: bool) -> Result<()> {
        self.record("commit", &self.fail_commit)?;
        self.inner.commit(transaction_id, handle, two_phase)
    }

    fn rollback(&self, transaction_id: TransactionId, handle: &TransactionId, two_phase: bool) -> Result<()> {
        self.record("rollback", &AtomicBool::new(false))?;
        self.inner.rollback(transaction_id, handle, two_phase)
    }
}

impl OperationExecutor for FlakyStore {
    fn execute(
        &self,
        session_token: &str,
        transaction_id: Option<TransactionId>,
        operation: &str,
        arguments: &[Value],
    ) -> Result<Value> {
        self.inner.execute(session_token, transaction_id, operation, arguments)
    }
}

/// Log store that refuses every write
struct FullDisk;

impl TransactionLogStore for FullDisk {
    fn put(&self, _entry: &TransactionLogEntry) -> Result<()> {
        Err(TransactionError::Log("disk full".into()))
    }

    fn delete(&self, _transaction_id: TransactionId) -> Result<()> {
        Err(TransactionError::Log("disk full".into()))
    }

    fn list_all(&self) -> Result<Vec<TransactionLogEntry>> {
        Ok(Vec::new())
    }
}

type TestParticipant = Participant<FlakyStore, FlakyStore>;

fn config(dir: &TempDir) -> TransactionConfig {
    TransactionConfig {
        transaction_timeout_secs: 1,
        log_folder: dir.path().to_path_buf(),
        ..TransactionConfig::new(COORDINATOR, INTERACTIVE)
    }
}

fn participant(dir: &TempDir) -> (TestParticipant, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore::default());
    let participant = Participant::with_file_log(
        "db",
        config(dir),
        Arc::new(Sessions),
        Arc::clone(&store),
        Arc::clone(&store),
    )
    .unwrap();
    (participant, store)
}

fn put(p: &TestParticipant, id: TransactionId, key: &str, value: Value) -> Result<Value> {
    p.execute_operation(id, "user", INTERACTIVE, "put", &[json!(key), value])
}

#[test]
fn test_empty_participant_id_rejected() {
    let dir = tempdir().unwrap();
    let store = Arc::new(FlakyStore::default());
    let log = Arc::new(FileTransactionLog::open(dir.path(), "p").unwrap());
    let result = Participant::new(" ", config(&dir), Arc::new(Sessions), store.clone(), store, log);
    assert!(matches!(result, Err(TransactionError::Config(_))));
}

#[test]
fn test_one_phase_commit() {
    let dir = tempdir().unwrap();
    let (p, store) = participant(&dir);
    let id = Uuid::new_v4();

    p.begin_transaction(id, "user", INTERACTIVE, None).unwrap();
    assert_eq!(p.transaction_status(id), Some(TransactionStatus::BeginFinished));
    put(&p, id, "k", json!("v")).unwrap();
    assert_eq!(store.inner.get("k"), None);

    p.commit_transaction(id, "user", INTERACTIVE).unwrap();
    assert_eq!(store.inner.get("k"), Some(json!("v")));
    assert_eq!(p.transaction_status(id), None);
    assert_eq!(store.calls(), vec!["begin", "commit"]);
    assert!(p.node().transaction_log().list_all().unwrap().is_empty());

    // Every resource call ran on the transaction's own thread
    let expected = format!("transaction-{}", id);
    assert!(store.threads.lock().unwrap().iter().all(|name| *name == expected));
}

#[test]
fn test_two_phase_commit() {
    let dir = tempdir().unwrap();
    let (p, store) = participant(&dir);
    let id = Uuid::new_v4();

    p.begin_transaction(id, "user", INTERACTIVE, Some(COORDINATOR)).unwrap();
    put(&p, id, "k", json!(1)).unwrap();

    // Commit before prepare is a usage error for a two-phase transaction
    let err = p.commit_transaction(id, "user", INTERACTIVE).unwrap_err();
    assert!(err.is_usage());

    p.prepare_transaction(id, "user", INTERACTIVE, COORDINATOR).unwrap();
    assert_eq!(p.transaction_status(id), Some(TransactionStatus::PrepareFinished));
    let logged = p.node().transaction_log().list_all().unwrap();
    assert_eq!(logged[0].transaction_status, TransactionStatus::PrepareFinished);
    assert!(logged[0].two_phase_transaction);

    p.commit_transaction(id, "user", INTERACTIVE).unwrap();
    assert_eq!(store.inner.get("k"), Some(json!(1)));
    assert_eq!(store.calls(), vec!["begin", "prepare", "commit"]);
}

#[test]
fn test_prepare_requires_two_phase_and_key() {
    let dir = tempdir().unwrap();
    let (p, _) = participant(&dir);
    let id = Uuid::new_v4();

    p.begin_transaction(id, "user", INTERACTIVE, None).unwrap();
    let err = p
        .prepare_transaction(id, "user", INTERACTIVE, COORDINATOR)
        .unwrap_err();
    assert!(err.to_string().contains("without transaction coordinator key"));

    let err = p.prepare_transaction(id, "user", INTERACTIVE, "forged").unwrap_err();
    assert!(err.to_string().contains("Invalid transaction coordinator key"));

    let err = p
        .begin_transaction(Uuid::new_v4(), "other", INTERACTIVE, Some("forged"))
        .unwrap_err();
    assert!(err.is_usage());
}

#[test]
fn test_begin_failure_rolls_back_and_removes() {
    let dir = tempdir().unwrap();
    let (p, store) = participant(&dir);
    store.fail_begin.store(true, Ordering::SeqCst);
    let id = Uuid::new_v4();

    let err = p.begin_transaction(id, "user", INTERACTIVE, Some(COORDINATOR)).unwrap_err();
    assert!(matches!(err, TransactionError::Resource(_)));
    assert_eq!(p.transaction_status(id), None);
    assert!(p.node().transaction_log().list_all().unwrap().is_empty());
    // No handle, so the resource never saw a rollback
    assert_eq!(store.calls(), vec!["begin"]);

    // The session is free again
    store.fail_begin.store(false, Ordering::SeqCst);
    p.begin_transaction(Uuid::new_v4(), "user", INTERACTIVE, None).unwrap();
}

#[test]
fn test_begin_log_failure_leaves_nothing_behind() {
    let dir = tempdir().unwrap();
    let store = Arc::new(FlakyStore::default());
    let p = Participant::new(
        "db",
        config(&dir),
        Arc::new(Sessions),
        Arc::clone(&store),
        Arc::clone(&store),
        Arc::new(FullDisk),
    )
    .unwrap();
    let id = Uuid::new_v4();

    let err = p.begin_transaction(id, "user", INTERACTIVE, Some(COORDINATOR)).unwrap_err();
    assert!(matches!(err, TransactionError::Log(_)));
    assert_eq!(p.transaction_status(id), None);
    assert!(p.transaction_ids().is_empty());
    assert!(store.calls().is_empty());

    // Nothing left registered for the session, so the next begin fails for the same reason
    let err = p.begin_transaction(Uuid::new_v4(), "user", INTERACTIVE, None).unwrap_err();
    assert!(matches!(err, TransactionError::Log(_)));
    assert!(p.transaction_ids().is_empty());
}

#[test]
fn test_concurrent_operations_are_queued() {
    let dir = tempdir().unwrap();
    let (p, store) = participant(&dir);
    let id = Uuid::new_v4();
    p.begin_transaction(id, "user", INTERACTIVE, None).unwrap();

    thread::scope(|scope| {
        for i in 0..4 {
            let p = &p;
            scope.spawn(move || put(p, id, &format!("k{}", i), json!(i)).unwrap());
        }
    });

    p.commit_transaction(id, "user", INTERACTIVE).unwrap();
    for i in 0..4 {
        assert_eq!(store.inner.get(&format!("k{}", i)), Some(json!(i)));
    }
}

#[test]
fn test_operation_error_keeps_transaction_usable() {
    let dir = tempdir().unwrap();
    let (p, _) = participant(&dir);
    let id = Uuid::new_v4();
    p.begin_transaction(id, "user", INTERACTIVE, None).unwrap();

    let err = p
        .execute_operation(id, "user", INTERACTIVE, "explode", &[])
        .unwrap_err();
    assert!(err.is_operation());
    assert!(err.to_string().contains("Unknown operation 'explode'"));

    assert_eq!(p.transaction_status(id), Some(TransactionStatus::BeginFinished));
    put(&p, id, "k", json!(1)).unwrap();
}

#[test]
fn test_one_phase_commit_failure_rolls_back() {
    let dir = tempdir().unwrap();
    let (p, store) = participant(&dir);
    store.fail_commit.store(true, Ordering::SeqCst);
    let id = Uuid::new_v4();

    p.begin_transaction(id, "user", INTERACTIVE, None).unwrap();
    put(&p, id, "k", json!(1)).unwrap();
    assert!(p.commit_transaction(id, "user", INTERACTIVE).is_err());

    assert_eq!(store.calls(), vec!["begin", "commit", "rollback"]);
    assert_eq!(p.transaction_status(id), None);
    assert!(store.inner.snapshot().is_empty());
}

#[test]
fn test_two_phase_commit_failure_waits_for_sweep() {
    let dir = tempdir().unwrap();
    let (p, store) = participant(&dir);
    let id = Uuid::new_v4();

    p.begin_transaction(id, "user", INTERACTIVE, Some(COORDINATOR)).unwrap();
    put(&p, id, "k", json!(1)).unwrap();
    p.prepare_transaction(id, "user", INTERACTIVE, COORDINATOR).unwrap();

    store.fail_commit.store(true, Ordering::SeqCst);
    assert!(p.commit_transaction(id, "user", INTERACTIVE).is_err());
    assert_eq!(p.transaction_status(id), Some(TransactionStatus::CommitStarted));
    assert!(!store.calls().contains(&"rollback".to_string()));

    store.fail_commit.store(false, Ordering::SeqCst);
    p.sweep();
    assert_eq!(p.transaction_status(id), None);
    assert_eq!(store.inner.get("k"), Some(json!(1)));
}

#[test]
fn test_commit_and_rollback_are_idempotent() {
    let dir = tempdir().unwrap();
    let (p, store) = participant(&dir);

    let committed = Uuid::new_v4();
    p.begin_transaction(committed, "user", INTERACTIVE, None).unwrap();
    p.commit_transaction(committed, "user", INTERACTIVE).unwrap();
    p.commit_transaction(committed, "user", INTERACTIVE).unwrap();
    assert_eq!(store.calls(), vec!["begin", "commit"]);

    // Only the owner may ask
    let err = p.commit_transaction(committed, "intruder", INTERACTIVE).unwrap_err();
    assert!(err.to_string().starts_with("Access denied"));

    let rolled_back = Uuid::new_v4();
    p.begin_transaction(rolled_back, "user", INTERACTIVE, None).unwrap();
    p.rollback_transaction(rolled_back, "user", INTERACTIVE).unwrap();
    p.rollback_transaction(rolled_back, "user", INTERACTIVE).unwrap();
    assert_eq!(store.calls(), vec!["begin", "commit", "begin", "rollback"]);

    // Committing a rolled back transaction is reported
    assert!(p.commit_transaction(rolled_back, "user", INTERACTIVE).is_err());

    // Never seen at all
    let err = p.commit_transaction(Uuid::new_v4(), "user", INTERACTIVE).unwrap_err();
    assert!(err.to_string().contains("does not exist"));
}

#[test]
fn test_access_control() {
    let dir = tempdir().unwrap();
    let (p, _) = participant(&dir);
    let id = Uuid::new_v4();
    p.begin_transaction(id, "user", INTERACTIVE, None).unwrap();

    let err = put_as(&p, id, "intruder").unwrap_err();
    assert!(err.to_string().starts_with("Access denied"));
    put_as(&p, id, "admin").unwrap();

    assert!(p.begin_transaction(Uuid::new_v4(), "expired", INTERACTIVE, None).is_err());
    assert!(p.begin_transaction(Uuid::new_v4(), "other", "wrong-key", None).is_err());
}

fn put_as(p: &TestParticipant, id: TransactionId, session_token: &str) -> Result<Value> {
    p.execute_operation(id, session_token, INTERACTIVE, "put", &[json!("k"), json!(1)])
}

#[test]
fn test_recover_after_restart() {
    let dir = tempdir().unwrap();
    let prepared = Uuid::new_v4();
    let open = Uuid::new_v4();
    {
        let (p, _) = participant(&dir);
        p.begin_transaction(prepared, "u1", INTERACTIVE, Some(COORDINATOR)).unwrap();
        p.prepare_transaction(prepared, "u1", INTERACTIVE, COORDINATOR).unwrap();
        p.begin_transaction(open, "u2", INTERACTIVE, Some(COORDINATOR)).unwrap();
        p.begin_transaction(Uuid::new_v4(), "u3", INTERACTIVE, None).unwrap();
    }

    let (p, store) = participant(&dir);
    let pending = p.recover_transactions(INTERACTIVE, COORDINATOR).unwrap();
    assert_eq!(pending, vec![prepared]);
    // One-phase transactions are not recovered
    assert_eq!(p.transaction_ids().len(), 2);

    assert!(p.recover_transactions(INTERACTIVE, "forged").is_err());

    p.commit_recovered_transaction(prepared, INTERACTIVE, COORDINATOR).unwrap();
    assert_eq!(p.transaction_status(prepared), None);
    // Recovered transactions have no handle; rollback never reaches the resource
    p.rollback_recovered_transaction(open, INTERACTIVE, COORDINATOR).unwrap();
    assert_eq!(p.transaction_status(open), None);
    assert_eq!(store.calls(), vec!["commit"]);

    // Unknown ids
    p.rollback_recovered_transaction(Uuid::new_v4(), INTERACTIVE, COORDINATOR).unwrap();
    assert!(p
        .commit_recovered_transaction(Uuid::new_v4(), INTERACTIVE, COORDINATOR)
        .is_err());
}

#[test]
fn test_sweep_leaves_prepared_and_rolls_back_idle() {
    let dir = tempdir().unwrap();
    let (p, store) = participant(&dir);
    let prepared = Uuid::new_v4();
    let idle = Uuid::new_v4();

    p.begin_transaction(prepared, "u1", INTERACTIVE, Some(COORDINATOR)).unwrap();
    p.prepare_transaction(prepared, "u1", INTERACTIVE, COORDINATOR).unwrap();
    p.begin_transaction(idle, "u2", INTERACTIVE, None).unwrap();

    thread::sleep(Duration::from_millis(1100));
    p.sweep();

    assert_eq!(p.transaction_status(prepared), Some(TransactionStatus::PrepareFinished));
    assert_eq!(p.transaction_status(idle), None);
    assert!(store.calls().contains(&"rollback".to_string()));
}
