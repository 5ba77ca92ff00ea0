//! Configuration shared by coordinator and participant nodes

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransactionError};

/// Settings for a transaction node.
///
/// Both keys are shared secrets: the interactive session key identifies legitimate
/// interactive clients, the coordinator key lets a participant authenticate its coordinator.
///
/// # Presets
///
/// - [`TransactionConfig::default()`] - one hour timeout, 10 concurrent transactions
/// - [`TransactionConfig::short_lived()`] - short timeout for tests and demos
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub coordinator_key: String,
    pub interactive_session_key: String,
    /// Idle time after which a transaction counts as abandoned (seconds)
    pub transaction_timeout_secs: u64,
    /// Maximum number of live transactions on one node
    pub transaction_count_limit: usize,
    /// Root folder holding the per-node transaction log folders
    pub log_folder: PathBuf,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            coordinator_key: String::new(),
            interactive_session_key: String::new(),
            transaction_timeout_secs: 3600, // 1 hour
            transaction_count_limit: 10,
            log_folder: PathBuf::from("transaction-logs"),
        }
    }
}

impl TransactionConfig {
    /// Create a config with the two shared keys and default limits
    pub fn new(coordinator_key: impl Into<String>, interactive_session_key: impl Into<String>) -> Self {
        Self {
            coordinator_key: coordinator_key.into(),
            interactive_session_key: interactive_session_key.into(),
            ..Default::default()
        }
    }

    /// Create a config with a short timeout so abandoned transactions are swept quickly
    pub fn short_lived(
        coordinator_key: impl Into<String>,
        interactive_session_key: impl Into<String>,
    ) -> Self {
        Self {
            transaction_timeout_secs: 5,
            ..Self::new(coordinator_key, interactive_session_key)
        }
    }

    /// Load a JSON config file; missing fields take their default values
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            TransactionError::Config(format!(
                "Cannot read configuration file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: TransactionConfig = serde_json::from_str(&content).map_err(|e| {
            TransactionError::Config(format!(
                "Invalid configuration file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check that keys are set and limits are strictly positive
    pub fn validate(&self) -> Result<()> {
        if self.coordinator_key.trim().is_empty() {
            return Err(TransactionError::Config(
                "Coordinator key cannot be empty".to_string(),
            ));
        }
        if self.interactive_session_key.trim().is_empty() {
            return Err(TransactionError::Config(
                "Interactive session key cannot be empty".to_string(),
            ));
        }
        if self.transaction_timeout_secs == 0 {
            return Err(TransactionError::Config(format!(
                "Transaction timeout must be greater than 0 seconds, was {}",
                self.transaction_timeout_secs
            )));
        }
        if self.transaction_count_limit == 0 {
            return Err(TransactionError::Config(format!(
                "Transaction count limit must be greater than 0, was {}",
                self.transaction_count_limit
            )));
        }
        Ok(())
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_secs)
    }
}
