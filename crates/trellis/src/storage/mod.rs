//! Transactional storage boundary.
//!
//! The engine never writes rows directly. It opens a [`JobTransaction`] on one
//! job through [`TaskStore::begin`], which holds that job's write lock until
//! the transaction is committed or dropped. All reads the engine needs for a
//! mutation (sibling lists, versions, the parent graph) come from the rows the
//! transaction exposes, and all writes go through a single
//! [`JobTransaction::commit`] carrying a [`ChangeSet`].
//!
//! Backends:
//!
//! - **In-memory**: per-job `tokio::sync::Mutex` around the rows, so writers
//!   to different jobs never wait for each other
//! - **JSONL**: the in-memory backend loaded from and saved to a JSON Lines file
//!
//! # Lock Ordering
//!
//! Implementations keep a task-to-job index next to the per-job rows. The
//! index lock is never held while waiting on a job lock; a commit that already
//! holds a job lock may take the index lock, then the job listing, briefly.
//!
//! # Example
//!
//! ```no_run
//! use trellis::domain::JobId;
//! use trellis::position::DEFAULT_INCREMENT;
//! use trellis::storage::{create_store, StoreBackend};
//! use std::time::Duration;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let store = create_store(StoreBackend::InMemory, Duration::from_secs(5), DEFAULT_INCREMENT).await?;
//!     store.ensure_job(&JobId::new("j1")).await?;
//!
//!     let txn = store.begin(&JobId::new("j1")).await?;
//!     println!("job version {}", txn.job_version());
//!     Ok(())
//! }
//! ```

use crate::domain::{JobId, TaskId, TaskNode};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod in_memory;
pub mod jsonl;

pub use in_memory::InMemoryStore;
pub use jsonl::{LoadWarning, load_from_jsonl, save_to_jsonl};

/// A stored row that changed in a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowUpdate {
    /// The row as it should be stored
    pub node: TaskNode,
    /// Version the row must still have for the write to apply
    pub prior_version: u64,
}

/// A stored row removed in a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDelete {
    /// The removed task
    pub id: TaskId,
    /// Version the row must still have for the delete to apply
    pub prior_version: u64,
}

/// Every write of one transaction, applied atomically by
/// [`JobTransaction::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    /// The job being written
    pub job_id: JobId,
    /// Job version the changes were computed against
    pub base_job_version: u64,
    /// Job version to store on commit
    pub new_job_version: u64,
    /// New rows
    pub inserts: Vec<TaskNode>,
    /// Changed rows, compare-and-set on `prior_version`
    pub updates: Vec<RowUpdate>,
    /// Removed rows, compare-and-set on `prior_version`
    pub deletes: Vec<RowDelete>,
}

impl ChangeSet {
    /// Returns `true` if committing would write nothing.
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.deletes.is_empty()
            && self.base_job_version == self.new_job_version
    }

    /// Updated rows whose version moved, in first-touch order.
    pub fn bumped(&self) -> impl Iterator<Item = &TaskNode> {
        self.updates
            .iter()
            .filter(|u| u.node.version != u.prior_version)
            .map(|u| &u.node)
    }

    /// The stored form of `id` after commit, if this change set writes it.
    pub fn written(&self, id: &TaskId) -> Option<&TaskNode> {
        self.updates
            .iter()
            .map(|u| &u.node)
            .chain(self.inserts.iter())
            .find(|n| &n.id == id)
    }
}

/// All rows of one job, as exported for persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExport {
    /// The job
    pub job_id: JobId,
    /// Current job version
    pub job_version: u64,
    /// Every task of the job, sorted by id
    pub tasks: Vec<TaskNode>,
}

/// A write transaction on one job.
///
/// Holds the job's lock for its whole lifetime. Dropping it without calling
/// [`commit`](JobTransaction::commit) discards every change: nothing is
/// written until commit.
#[async_trait]
pub trait JobTransaction: Send {
    /// The locked job.
    fn job_id(&self) -> &JobId;

    /// Job version as stored when the lock was acquired.
    fn job_version(&self) -> u64;

    /// Every row of the job, as stored when the lock was acquired.
    fn nodes(&self) -> Vec<TaskNode>;

    /// Apply `changes` atomically and release the lock.
    ///
    /// Every update and delete is a compare-and-set on its `prior_version`,
    /// and `base_job_version` must match the stored job version. Since the
    /// lock has been held since the rows were read, a failed check means the
    /// engine computed the change set from the wrong rows.
    ///
    /// # Errors
    ///
    /// - `InvariantViolation` if a compare-and-set fails, an insert reuses an
    ///   existing id, or the change set names another job
    /// - `Storage` for backend failures; nothing is applied
    async fn commit(self: Box<Self>, changes: ChangeSet) -> Result<()>;
}

/// Transactional task storage.
///
/// Implementations must be `Send + Sync`; the engine shares one store between
/// concurrent callers.
///
/// # Method Categories
///
/// - **Transactions**: `begin`
/// - **Jobs**: `ensure_job`, `jobs`
/// - **Reads**: `job_of`, `get`, `export_job`, `task_count`
/// - **Persistence**: `export_all`, `save`
#[async_trait]
pub trait TaskStore: Send + Sync {
    // ========== Transactions ==========

    /// Lock `job_id` for writing.
    ///
    /// Waits for other writers of the same job, never for writers of other jobs.
    ///
    /// # Errors
    ///
    /// - `JobNotFound` if the job does not exist
    /// - `TransactionTimeout` if the lock is not acquired within the store's timeout
    async fn begin(&self, job_id: &JobId) -> Result<Box<dyn JobTransaction>>;

    // ========== Jobs ==========

    /// Register an empty job at version 0 unless it already exists.
    ///
    /// A registered job can be passed to [`begin`](Self::begin) but is not
    /// listed or exported until a transaction on it commits. Returns `true`
    /// if the job was registered by this call.
    async fn ensure_job(&self, job_id: &JobId) -> Result<bool>;

    /// Every job with at least one commit, sorted.
    async fn jobs(&self) -> Result<Vec<JobId>>;

    // ========== Reads ==========

    /// The job a task belongs to, without taking any job lock.
    async fn job_of(&self, task_id: &TaskId) -> Result<Option<JobId>>;

    /// Read one task (waits for a concurrent writer of its job).
    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskNode>>;

    /// Read every row of one job.
    ///
    /// # Errors
    ///
    /// `JobNotFound` if the job does not exist or has never committed.
    async fn export_job(&self, job_id: &JobId) -> Result<JobExport>;

    /// Number of tasks across all jobs.
    async fn task_count(&self) -> Result<usize>;

    // ========== Persistence ==========

    /// Every job with its rows, sorted by job id.
    async fn export_all(&self) -> Result<Vec<JobExport>>;

    /// Persist the current state. A no-op for purely in-memory stores.
    async fn save(&self) -> Result<()>;
}

/// Storage backend selection.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    /// Ephemeral in-memory store
    InMemory,

    /// In-memory store persisted to a JSONL file
    Jsonl(PathBuf),
}

impl StoreBackend {
    /// Path of the data file, if the backend has one.
    pub fn data_path(&self) -> Option<&Path> {
        match self {
            StoreBackend::Jsonl(path) => Some(path),
            StoreBackend::InMemory => None,
        }
    }
}

/// JSONL-backed store: an in-memory store whose `save()` writes the file.
struct JsonlBackedStore {
    inner: InMemoryStore,
    path: PathBuf,
}

#[async_trait]
impl TaskStore for JsonlBackedStore {
    async fn begin(&self, job_id: &JobId) -> Result<Box<dyn JobTransaction>> {
        self.inner.begin(job_id).await
    }

    async fn ensure_job(&self, job_id: &JobId) -> Result<bool> {
        self.inner.ensure_job(job_id).await
    }

    async fn jobs(&self) -> Result<Vec<JobId>> {
        self.inner.jobs().await
    }

    async fn job_of(&self, task_id: &TaskId) -> Result<Option<JobId>> {
        self.inner.job_of(task_id).await
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskNode>> {
        self.inner.get(task_id).await
    }

    async fn export_job(&self, job_id: &JobId) -> Result<JobExport> {
        self.inner.export_job(job_id).await
    }

    async fn task_count(&self) -> Result<usize> {
        self.inner.task_count().await
    }

    async fn export_all(&self) -> Result<Vec<JobExport>> {
        self.inner.export_all().await
    }

    async fn save(&self) -> Result<()> {
        save_to_jsonl(&self.inner, &self.path).await
    }
}

/// Create a store for the given backend.
///
/// `lock_timeout` bounds how long [`TaskStore::begin`] waits for a job lock.
/// `position_increment` is the key spacing used when loading repairs
/// duplicate sibling positions. A JSONL file that does not exist yet yields an empty store; load warnings
/// are logged and the store stays usable.
///
/// # Errors
///
/// - `Error::Io` if the data file cannot be read
pub async fn create_store(
    backend: StoreBackend,
    lock_timeout: Duration,
    position_increment: i64,
) -> Result<Box<dyn TaskStore>> {
    match backend {
        StoreBackend::InMemory => Ok(Box::new(InMemoryStore::new(lock_timeout))),
        StoreBackend::Jsonl(path) => {
            let inner = if path.exists() {
                let (store, warnings) =
                    load_from_jsonl(&path, lock_timeout, position_increment).await?;
                for warning in &warnings {
                    tracing::warn!(%warning, "JSONL load warning");
                }
                store
            } else {
                InMemoryStore::new(lock_timeout)
            };
            Ok(Box::new(JsonlBackedStore { inner, path }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::DEFAULT_INCREMENT;
    use crate::tree::tests::node;
    use tempfile::TempDir;

    #[test]
    fn test_change_set_helpers() {
        let mut moved = node("a", None, 1500);
        moved.version = 3;
        let cache_only = node("p", None, 1000);

        let changes = ChangeSet {
            job_id: JobId::new("j1"),
            base_job_version: 4,
            new_job_version: 5,
            inserts: vec![node("n", None, 9000)],
            updates: vec![
                RowUpdate {
                    node: moved,
                    prior_version: 2,
                },
                RowUpdate {
                    node: cache_only,
                    prior_version: 0,
                },
            ],
            deletes: vec![],
        };

        assert!(!changes.is_empty());
        let bumped: Vec<&str> = changes.bumped().map(|n| n.id.as_str()).collect();
        assert_eq!(bumped, vec!["a"]);
        assert!(changes.written(&TaskId::new("n")).is_some());
        assert!(changes.written(&TaskId::new("zz")).is_none());
    }

    #[tokio::test]
    async fn test_jsonl_store_starts_empty_and_saves() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tasks.jsonl");

        let backend = StoreBackend::Jsonl(path.clone());
        let store = create_store(backend.clone(), Duration::from_secs(1), DEFAULT_INCREMENT)
            .await
            .unwrap();
        assert!(store.jobs().await.unwrap().is_empty());

        // Registered but never committed: not persisted.
        store.ensure_job(&JobId::new("empty")).await.unwrap();
        store.ensure_job(&JobId::new("j1")).await.unwrap();
        let txn = store.begin(&JobId::new("j1")).await.unwrap();
        txn.commit(ChangeSet {
            job_id: JobId::new("j1"),
            base_job_version: 0,
            new_job_version: 1,
            inserts: vec![node("a", None, 1000)],
            updates: vec![],
            deletes: vec![],
        })
        .await
        .unwrap();
        store.save().await.unwrap();
        assert!(path.exists());

        let reopened = create_store(backend, Duration::from_secs(1), DEFAULT_INCREMENT)
            .await
            .unwrap();
        assert_eq!(reopened.jobs().await.unwrap(), vec![JobId::new("j1")]);
    }

    #[test]
    fn test_backend_data_path() {
        assert!(StoreBackend::InMemory.data_path().is_none());
        let backend = StoreBackend::Jsonl(PathBuf::from("x.jsonl"));
        assert_eq!(backend.data_path(), Some(Path::new("x.jsonl")));
    }
}
