//! Implementation of the `init` command.
//!
//! Creates the `.trellis/` directory with an engine configuration and an
//! empty task file.

use crate::config::{DEFAULT_PREFIX, EngineConfig, validate_prefix};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Name of the trellis directory
pub const TRELLIS_DIR_NAME: &str = ".trellis";

/// Name of the configuration file
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Name of the task data file
pub const TASKS_FILE_NAME: &str = "tasks.jsonl";

/// Name of the gitignore file within .trellis
pub const GITIGNORE_FILE_NAME: &str = ".gitignore";

/// Maximum directory depth to traverse when searching for the trellis root
pub const MAX_TRAVERSAL_DEPTH: usize = 256;

/// Result of the init command
#[derive(Debug)]
pub struct InitResult {
    /// Path to the created trellis directory
    pub trellis_dir: PathBuf,
    /// Path to the created config file
    pub config_file: PathBuf,
    /// Path to the created task file
    pub tasks_file: PathBuf,
    /// The prefix used for task IDs
    pub prefix: String,
}

/// Initialize a new trellis repository in `base_dir`.
///
/// # Errors
///
/// Returns an error if:
/// - `.trellis/` already exists
/// - The prefix is invalid
/// - File system operations fail
pub async fn init(base_dir: &Path, prefix: Option<&str>) -> Result<InitResult> {
    let prefix = prefix.unwrap_or(DEFAULT_PREFIX).trim();
    validate_prefix(prefix)?;

    let trellis_dir = base_dir.join(TRELLIS_DIR_NAME);
    if trellis_dir.exists() {
        return Err(Error::Config(format!(
            "Trellis is already initialized in this directory. Found existing '{TRELLIS_DIR_NAME}'"
        )));
    }

    fs::create_dir_all(&trellis_dir).await?;

    let config_file = trellis_dir.join(CONFIG_FILE_NAME);
    EngineConfig::new(prefix).save(&config_file).await?;

    let tasks_file = trellis_dir.join(TASKS_FILE_NAME);
    fs::write(&tasks_file, "").await?;

    let gitignore_content = "\
# The tasks.jsonl file should be tracked for collaboration
*.tmp
";
    fs::write(trellis_dir.join(GITIGNORE_FILE_NAME), gitignore_content).await?;

    Ok(InitResult {
        trellis_dir,
        config_file,
        tasks_file,
        prefix: prefix.to_string(),
    })
}

/// Returns `true` if `.trellis/` exists in `base_dir`.
pub fn is_initialized(base_dir: &Path) -> bool {
    base_dir.join(TRELLIS_DIR_NAME).exists()
}

/// Find the directory containing `.trellis/`, searching upward from `start_dir`.
///
/// Gives up at the filesystem root or after [`MAX_TRAVERSAL_DEPTH`] levels.
pub fn find_trellis_root(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir.to_path_buf();
    let mut depth = 0;

    loop {
        if current.join(TRELLIS_DIR_NAME).exists() {
            return Some(current);
        }

        depth += 1;
        if depth > MAX_TRAVERSAL_DEPTH || !current.pop() {
            return None;
        }
    }
}
