//! Engine configuration.
//!
//! Stored as YAML in `.trellis/config.yaml`:
//!
//! ```yaml
//! id-prefix: task
//! position-increment: 1000
//! transaction-timeout-ms: 5000
//! delete-policy: reject
//! ```
//!
//! Missing keys fall back to their defaults.

use crate::error::{Error, Result};
use crate::position::{DEFAULT_INCREMENT, MIN_INCREMENT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

/// Default task ID prefix
pub const DEFAULT_PREFIX: &str = "task";

/// Default bound on waiting for a job lock
pub const DEFAULT_TRANSACTION_TIMEOUT_MS: u64 = 5000;

/// Minimum prefix length
pub const MIN_PREFIX_LENGTH: usize = 2;

/// Maximum prefix length
pub const MAX_PREFIX_LENGTH: usize = 20;

/// What deleting a task that still has children does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Refuse with `HasChildren`
    #[default]
    Reject,
    /// Remove the whole subtree in the same commit
    Cascade,
}

/// Tunables of the task engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EngineConfig {
    /// Task ID prefix (e.g., "task" for "task-a3f8")
    pub id_prefix: String,

    /// Spacing between fresh sibling keys
    pub position_increment: i64,

    /// How long a mutation waits for its job's lock
    pub transaction_timeout_ms: u64,

    /// Handling of deletes of tasks with children
    pub delete_policy: DeletePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl EngineConfig {
    /// Default configuration with the given ID prefix.
    pub fn new(prefix: &str) -> Self {
        Self {
            id_prefix: prefix.to_string(),
            position_increment: DEFAULT_INCREMENT,
            transaction_timeout_ms: DEFAULT_TRANSACTION_TIMEOUT_MS,
            delete_policy: DeletePolicy::default(),
        }
    }

    /// The transaction timeout as a `Duration`.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    /// Check every field.
    ///
    /// # Errors
    ///
    /// `Error::Config` naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        validate_prefix(&self.id_prefix)?;
        if self.position_increment < MIN_INCREMENT {
            return Err(Error::Config(format!(
                "position-increment must be at least {MIN_INCREMENT}, got {}",
                self.position_increment
            )));
        }
        if self.transaction_timeout_ms == 0 {
            return Err(Error::Config(
                "transaction-timeout-ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Load and validate configuration from a file
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        let config: Self =
            serde_yaml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_yaml::to_string(self).map_err(|e| Error::Config(format!("YAML error: {e}")))?;
        fs::write(path, content).await?;
        Ok(())
    }
}

/// Validate task ID prefix format.
///
/// Requirements:
/// - 2-20 characters
/// - Alphanumeric only (letters and digits)
///
/// Expects pre-trimmed input.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.len() < MIN_PREFIX_LENGTH {
        return Err(Error::Config(format!(
            "Prefix must be at least {MIN_PREFIX_LENGTH} characters"
        )));
    }

    if prefix.len() > MAX_PREFIX_LENGTH {
        return Err(Error::Config(format!(
            "Prefix cannot exceed {MAX_PREFIX_LENGTH} characters"
        )));
    }

    if !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::Config(
            "Prefix must contain only alphanumeric characters".to_string(),
        ));
    }

    Ok(())
}
