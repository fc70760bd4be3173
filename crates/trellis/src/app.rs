//! Application context for CLI command execution.
//!
//! # Example
//!
//! ```no_run
//! use trellis::app::App;
//! use std::path::Path;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let app = App::from_directory(Path::new(".")).await?;
//!     println!("{} jobs", app.engine().jobs().await?.len());
//!     Ok(())
//! }
//! ```

use crate::commands::init::{CONFIG_FILE_NAME, TASKS_FILE_NAME, TRELLIS_DIR_NAME, find_trellis_root};
use crate::config::EngineConfig;
use crate::engine::TaskEngine;
use crate::error::{Error, Result};
use crate::storage::{StoreBackend, create_store};
use std::path::{Path, PathBuf};

/// Loaded configuration, store and engine for one trellis directory.
#[derive(Debug)]
pub struct App {
    engine: TaskEngine,
    trellis_dir: PathBuf,
}

impl App {
    /// Create an App from the given working directory.
    ///
    /// Searches upward for `.trellis/`, loads its configuration and task file.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No trellis repository is found in the directory tree
    /// - Configuration cannot be loaded or is invalid
    /// - The task file cannot be read
    pub async fn from_directory(working_dir: &Path) -> Result<Self> {
        let root_dir = find_trellis_root(working_dir).ok_or_else(|| {
            Error::Config("Not a trellis repository (run 'trellis init' first)".to_string())
        })?;

        let trellis_dir = root_dir.join(TRELLIS_DIR_NAME);
        let config = EngineConfig::load(&trellis_dir.join(CONFIG_FILE_NAME)).await?;

        let backend = StoreBackend::Jsonl(trellis_dir.join(TASKS_FILE_NAME));
        let store = create_store(backend, config.lock_timeout(), config.position_increment).await?;

        Ok(Self {
            engine: TaskEngine::new(store, config),
            trellis_dir,
        })
    }

    /// The task engine.
    pub fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    /// Path to the `.trellis` directory.
    pub fn trellis_dir(&self) -> &Path {
        &self.trellis_dir
    }

    /// Write the task file. Call after every successful mutation.
    pub async fn save(&self) -> Result<()> {
        self.engine.save().await
    }
}
