//! In-memory transactional key/value store
//!
//! Serves both as the local resource of a participant and as its operation executor.
//! Writes made inside a transaction are staged per transaction and only become visible on
//! commit. Prepare freezes the staged writes; rollback discards them. Calls made outside a
//! transaction apply immediately.
//!
//! Operations:
//! - `get [key]` returns the value or `null`
//! - `put [key, value]` returns the previous value or `null`
//! - `delete [key]` returns whether the key existed
//! - `keys []` returns the sorted list of keys

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use crate::api::{OperationExecutor, ResourceTransactionProvider};
use crate::error::{Result, TransactionError};
use crate::types::{TransactionId, Value};

#[derive(Debug, Default)]
struct StagedWrites {
    /// `None` marks a delete
    writes: BTreeMap<String, Option<Value>>,
    prepared: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    committed: BTreeMap<String, Value>,
    staged: HashMap<TransactionId, StagedWrites>,
}

/// Key/value store with per-transaction staging
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed value of `key`
    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().committed.get(key).cloned()
    }

    /// All committed entries
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.lock().committed.clone()
    }

    /// Transactions with staged writes, sorted
    pub fn open_transactions(&self) -> Vec<TransactionId> {
        let mut ids: Vec<TransactionId> = self.lock().staged.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_prepared(&self, transaction_id: TransactionId) -> bool {
        self.lock()
            .staged
            .get(&transaction_id)
            .map(|s| s.prepared)
            .unwrap_or(false)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn key_argument(operation: &str, arguments: &[Value]) -> Result<String> {
    match arguments.first() {
        Some(Value::String(key)) if !key.is_empty() => Ok(key.clone()),
        _ => Err(TransactionError::operation(format!(
            "Operation '{}' expects a non-empty string key as its first argument",
            operation
        ))),
    }
}

fn inactive(transaction_id: TransactionId) -> TransactionError {
    TransactionError::Resource(format!(
        "Transaction '{}' is not active in the memory store",
        transaction_id
    ))
}

impl MemoryState {
    fn read(&self, transaction_id: Option<TransactionId>, key: &str) -> Option<Value> {
        if let Some(staged) = transaction_id.and_then(|id| self.staged.get(&id)) {
            if let Some(write) = staged.writes.get(key) {
                return write.clone();
            }
        }
        self.committed.get(key).cloned()
    }

    fn write(
        &mut self,
        transaction_id: Option<TransactionId>,
        key: String,
        value: Option<Value>,
    ) -> Result<Option<Value>> {
        let previous = self.read(transaction_id, &key);
        match transaction_id {
            Some(id) => {
                let staged = self.staged.get_mut(&id).ok_or_else(|| inactive(id))?;
                if staged.prepared {
                    return Err(TransactionError::operation(format!(
                        "Transaction '{}' is prepared and cannot be modified",
                        id
                    )));
                }
                staged.writes.insert(key, value);
            }
            None => match value {
                Some(value) => {
                    self.committed.insert(key, value);
                }
                None => {
                    self.committed.remove(&key);
                }
            },
        }
        Ok(previous)
    }

    fn keys(&self, transaction_id: Option<TransactionId>) -> Vec<String> {
        let mut visible: BTreeMap<&str, bool> =
            self.committed.keys().map(|k| (k.as_str(), true)).collect();
        if let Some(staged) = transaction_id.and_then(|id| self.staged.get(&id)) {
            for (key, write) in &staged.writes {
                visible.insert(key.as_str(), write.is_some());
            }
        }
        visible
            .into_iter()
            .filter(|(_, present)| *present)
            .map(|(key, _)| key.to_string())
            .collect()
    }
}

impl ResourceTransactionProvider for MemoryStore {
    type Handle = TransactionId;

    fn begin(&self, transaction_id: TransactionId) -> Result<TransactionId> {
        let mut state = self.lock();
        if state.staged.contains_key(&transaction_id) {
            return Err(TransactionError::Resource(format!(
                "Transaction '{}' is already active in the memory store",
                transaction_id
            )));
        }
        state.staged.insert(transaction_id, StagedWrites::default());
        Ok(transaction_id)
    }

    fn prepare(&self, transaction_id: TransactionId, _handle: Option<&TransactionId>) -> Result<()> {
        let mut state = self.lock();
        let staged = state
            .staged
            .get_mut(&transaction_id)
            .ok_or_else(|| inactive(transaction_id))?;
        staged.prepared = true;
        Ok(())
    }

    fn commit(
        &self,
        transaction_id: TransactionId,
        _handle: Option<&TransactionId>,
        _two_phase: bool,
    ) -> Result<()> {
        let mut state = self.lock();
        // Nothing staged means it was committed already
        if let Some(staged) = state.staged.remove(&transaction_id) {
            for (key, write) in staged.writes {
                match write {
                    Some(value) => {
                        state.committed.insert(key, value);
                    }
                    None => {
                        state.committed.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn rollback(
        &self,
        transaction_id: TransactionId,
        _handle: &TransactionId,
        _two_phase: bool,
    ) -> Result<()> {
        self.lock().staged.remove(&transaction_id);
        Ok(())
    }
}

impl OperationExecutor for MemoryStore {
    fn execute(
        &self,
        _session_token: &str,
        transaction_id: Option<TransactionId>,
        operation: &str,
        arguments: &[Value],
    ) -> Result<Value> {
        let mut state = self.lock();
        if let Some(id) = transaction_id {
            if !state.staged.contains_key(&id) {
                return Err(inactive(id));
            }
        }

        match operation {
            "get" => {
                let key = key_argument(operation, arguments)?;
                Ok(state.read(transaction_id, &key).unwrap_or(Value::Null))
            }
            "put" => {
                let key = key_argument(operation, arguments)?;
                let value = arguments.get(1).cloned().ok_or_else(|| {
                    TransactionError::operation("Operation 'put' expects a value as its second argument")
                })?;
                let previous = state.write(transaction_id, key, Some(value))?;
                Ok(previous.unwrap_or(Value::Null))
            }
            "delete" => {
                let key = key_argument(operation, arguments)?;
                let previous = state.write(transaction_id, key, None)?;
                Ok(Value::Bool(previous.is_some()))
            }
            "keys" => Ok(Value::Array(
                state
                    .keys(transaction_id)
                    .into_iter()
                    .map(Value::String)
                    .collect(),
            )),
            other => Err(TransactionError::operation(format!(
                "Unknown operation '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn exec(store: &MemoryStore, tx: Option<TransactionId>, op: &str, args: Vec<Value>) -> Result<Value> {
        store.execute("token", tx, op, &args)
    }

    #[test]
    fn test_direct_calls_apply_immediately() {
        let store = MemoryStore::new();
        assert_eq!(exec(&store, None, "put", vec![json!("a"), json!(1)]).unwrap(), Value::Null);
        assert_eq!(exec(&store, None, "put", vec![json!("a"), json!(2)]).unwrap(), json!(1));
        assert_eq!(store.get("a"), Some(json!(2)));
        assert_eq!(exec(&store, None, "delete", vec![json!("a")]).unwrap(), json!(true));
        assert_eq!(exec(&store, None, "delete", vec![json!("a")]).unwrap(), json!(false));
    }

    #[test]
    fn test_staged_writes_visible_only_after_commit() {
        let store = MemoryStore::new();
        exec(&store, None, "put", vec![json!("keep"), json!("old")]).unwrap();

        let id = Uuid::new_v4();
        let handle = store.begin(id).unwrap();
        exec(&store, Some(id), "put", vec![json!("new"), json!(1)]).unwrap();
        exec(&store, Some(id), "delete", vec![json!("keep")]).unwrap();

        // Inside the transaction
        assert_eq!(exec(&store, Some(id), "get", vec![json!("new")]).unwrap(), json!(1));
        assert_eq!(exec(&store, Some(id), "keys", vec![]).unwrap(), json!(["new"]));
        // Outside
        assert_eq!(store.get("new"), None);
        assert_eq!(exec(&store, None, "keys", vec![]).unwrap(), json!(["keep"]));

        store.prepare(id, Some(&handle)).unwrap();
        store.commit(id, Some(&handle), true).unwrap();
        assert_eq!(store.get("new"), Some(json!(1)));
        assert_eq!(store.get("keep"), None);
        assert!(store.open_transactions().is_empty());

        // Repeat commit is a no-op
        store.commit(id, None, true).unwrap();
    }

    #[test]
    fn test_rollback_discards() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let handle = store.begin(id).unwrap();
        exec(&store, Some(id), "put", vec![json!("x"), json!(true)]).unwrap();
        store.rollback(id, &handle, false).unwrap();
        assert!(store.snapshot().is_empty());
        assert!(exec(&store, Some(id), "get", vec![json!("x")]).is_err());
    }

    #[test]
    fn test_prepared_transaction_is_frozen() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.begin(id).unwrap();
        store.prepare(id, None).unwrap();
        assert!(store.is_prepared(id));

        let err = exec(&store, Some(id), "put", vec![json!("x"), json!(1)]).unwrap_err();
        assert!(err.is_operation());
    }

    #[test]
    fn test_bad_operations() {
        let store = MemoryStore::new();
        assert!(exec(&store, None, "explode", vec![]).unwrap_err().is_operation());
        assert!(exec(&store, None, "get", vec![json!(5)]).unwrap_err().is_operation());
        assert!(exec(&store, None, "put", vec![json!("k")]).unwrap_err().is_operation());
        assert!(store.prepare(Uuid::new_v4(), None).is_err());
    }
}
