//! Durable transaction status snapshots used for crash recovery
//!
//! Every node keeps one entry per active transaction. An entry reflects the last status
//! the node persisted before acting on it; a missing entry means there is nothing to
//! recover (the transaction never started or has already finished).
//!
//! [`FileTransactionLog`] stores each entry as a pretty-printed JSON file named by the
//! transaction id so the log stays human-inspectable:
//!
//! ```text
//! <root>/coordinator/0b6f3b4e-2d8c-4c1e-9f5e-6a0d9f1c2b7a
//! <root>/participant-db/0b6f3b4e-2d8c-4c1e-9f5e-6a0d9f1c2b7a
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{Result, TransactionError};
use crate::types::{TransactionId, TransactionStatus};

/// On-disk projection of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLogEntry {
    pub transaction_id: TransactionId,
    pub transaction_status: TransactionStatus,
    pub two_phase_transaction: bool,
    /// Last access time (Unix epoch millis)
    pub last_accessed: u64,
    /// Touched participants; only written by the coordinator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_ids: Option<BTreeSet<String>>,
}

/// Durable keyed storage of transaction log entries
pub trait TransactionLogStore: Send + Sync {
    /// Persist or overwrite the entry for its transaction id
    fn put(&self, entry: &TransactionLogEntry) -> Result<()>;

    /// Remove the entry; removing an entry that does not exist is not an error
    fn delete(&self, transaction_id: TransactionId) -> Result<()>;

    /// Every currently persisted entry
    fn list_all(&self) -> Result<Vec<TransactionLogEntry>>;
}

/// Folder-backed transaction log, one JSON file per transaction
pub struct FileTransactionLog {
    folder: PathBuf,
    entries: RwLock<HashMap<TransactionId, TransactionLogEntry>>,
}

impl FileTransactionLog {
    /// Open (creating if needed) `<root_folder>/<sub_folder>` and load the entries left there
    /// by a previous process
    pub fn open(root_folder: impl AsRef<Path>, sub_folder: &str) -> Result<Self> {
        let root_folder = root_folder.as_ref();
        if sub_folder.is_empty() {
            return Err(TransactionError::Config(
                "Transaction log sub-folder cannot be empty".to_string(),
            ));
        }

        create_or_check_folder(root_folder)?;
        let folder = root_folder.join(sub_folder);
        create_or_check_folder(&folder)?;

        let entries = load_entries(&folder)?;
        log::info!(
            "Loaded {} transaction log entries from '{}'",
            entries.len(),
            folder.display()
        );

        Ok(Self {
            folder,
            entries: RwLock::new(entries),
        })
    }

    /// Folder holding the entry files
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    fn entry_path(&self, transaction_id: TransactionId) -> PathBuf {
        self.folder.join(transaction_id.to_string())
    }

    fn write_entry(&self, entry: &TransactionLogEntry) -> Result<()> {
        let path = self.entry_path(entry.transaction_id);
        if path.exists() && !path.is_file() {
            return Err(TransactionError::Log(format!(
                "Transaction log path '{}' is not a regular file",
                path.display()
            )));
        }

        // Write to a temp file in the same folder, then rename over the entry
        let temp = NamedTempFile::new_in(&self.folder)?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, entry)?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| TransactionError::Io(e.error))?;
        Ok(())
    }
}

impl TransactionLogStore for FileTransactionLog {
    fn put(&self, entry: &TransactionLogEntry) -> Result<()> {
        self.write_entry(entry).map_err(|e| {
            TransactionError::Log(format!(
                "Could not log transaction '{}' with status '{}' into '{}': {}",
                entry.transaction_id,
                entry.transaction_status,
                self.entry_path(entry.transaction_id).display(),
                e
            ))
        })?;

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.transaction_id, entry.clone());

        log::info!(
            "Logged transaction '{}' with status '{}'",
            entry.transaction_id,
            entry.transaction_status
        );
        Ok(())
    }

    fn delete(&self, transaction_id: TransactionId) -> Result<()> {
        let path = self.entry_path(transaction_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                log::info!(
                    "Deleted transaction '{}' log stored in '{}'",
                    transaction_id,
                    path.display()
                );
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(TransactionError::Log(format!(
                    "Could not delete transaction '{}' log stored in '{}': {}",
                    transaction_id,
                    path.display(),
                    e
                )));
            }
        }

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&transaction_id);
        Ok(())
    }

    fn list_all(&self) -> Result<Vec<TransactionLogEntry>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<TransactionLogEntry> = entries.values().cloned().collect();
        list.sort_by_key(|e| e.transaction_id);
        Ok(list)
    }
}

fn create_or_check_folder(folder: &Path) -> Result<()> {
    if folder.exists() {
        if !folder.is_dir() {
            return Err(TransactionError::Log(format!(
                "Transaction log folder '{}' is not a directory",
                folder.display()
            )));
        }
        return Ok(());
    }
    fs::create_dir_all(folder).map_err(|e| {
        TransactionError::Log(format!(
            "Could not create transaction log folder '{}': {}",
            folder.display(),
            e
        ))
    })
}

fn load_entries(folder: &Path) -> Result<HashMap<TransactionId, TransactionLogEntry>> {
    let mut entries = HashMap::new();

    for dir_entry in fs::read_dir(folder)? {
        let path = dir_entry?.path();
        if path.is_dir() {
            log::info!(
                "Ignoring directory '{}' in transaction log folder",
                path.display()
            );
            continue;
        }

        let is_transaction_file = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| TransactionId::parse_str(name).is_ok())
            .unwrap_or(false);
        if !is_transaction_file {
            log::info!(
                "Ignoring file '{}'. File name in UUID format is expected for a transaction file",
                path.display()
            );
            continue;
        }

        let content = fs::read_to_string(&path)?;
        let entry: TransactionLogEntry = serde_json::from_str(&content).map_err(|e| {
            TransactionError::Log(format!(
                "Could not load transaction from file '{}': {}",
                path.display(),
                e
            ))
        })?;
        entries.insert(entry.transaction_id, entry);
    }

    Ok(entries)
}
