//! In-memory storage backend with per-job locking.
//!
//! Data lives in RAM and is lost when the process exits unless it is written
//! out with [`save_to_jsonl`](super::save_to_jsonl).
//!
//! # Architecture
//!
//! - `jobs`: `RwLock<HashMap<JobId, Arc<Mutex<JobRows>>>>`. The outer lock is
//!   only held long enough to clone a job's handle; the inner `tokio::sync::Mutex`
//!   is the job's write lock and is held by a [`JobTransaction`] from `begin`
//!   to `commit`/drop
//! - `index`: `RwLock<HashMap<TaskId, JobId>>`, answering "which job owns this
//!   task" without touching any job lock
//! - `listed`: `RwLock<HashSet<JobId>>`, the jobs with at least one commit.
//!   A job registered by `ensure_job` can be locked right away but is not
//!   listed or exported until its first commit, so a rejected first write
//!   leaves no trace
//!
//! Waiting for a job lock is bounded by the store's lock timeout and surfaces
//! as [`Error::TransactionTimeout`].

use super::{ChangeSet, JobExport, JobTransaction, TaskStore};
use crate::config::DEFAULT_TRANSACTION_TIMEOUT_MS;
use crate::domain::{JobId, TaskId, TaskNode};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard, RwLock};
use tracing::debug;

/// Rows and version of one job.
#[derive(Debug, Default)]
pub(crate) struct JobRows {
    job_version: u64,
    tasks: HashMap<TaskId, TaskNode>,
}

type JobHandle = Arc<Mutex<JobRows>>;

/// Thread-safe in-memory task store.
///
/// Cloning is cheap and yields a handle to the same data.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    jobs: Arc<RwLock<HashMap<JobId, JobHandle>>>,
    index: Arc<RwLock<HashMap<TaskId, JobId>>>,
    listed: Arc<RwLock<HashSet<JobId>>>,
    lock_timeout: Duration,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_TRANSACTION_TIMEOUT_MS))
    }
}

impl InMemoryStore {
    /// Create an empty store whose transactions wait at most `lock_timeout`.
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            index: Arc::new(RwLock::new(HashMap::new())),
            listed: Arc::new(RwLock::new(HashSet::new())),
            lock_timeout,
        }
    }

    /// Build a store from exported jobs.
    ///
    /// The caller is responsible for the rows being consistent; the JSONL
    /// loader repairs them before calling this.
    pub(crate) fn from_exports(exports: Vec<JobExport>, lock_timeout: Duration) -> Self {
        let mut jobs = HashMap::new();
        let mut index = HashMap::new();
        let mut listed = HashSet::new();

        for export in exports {
            let tasks: HashMap<TaskId, TaskNode> = export
                .tasks
                .into_iter()
                .map(|task| (task.id.clone(), task))
                .collect();
            for id in tasks.keys() {
                index.insert(id.clone(), export.job_id.clone());
            }
            let rows = JobRows {
                job_version: export.job_version,
                tasks,
            };
            listed.insert(export.job_id.clone());
            jobs.insert(export.job_id, Arc::new(Mutex::new(rows)));
        }

        Self {
            jobs: Arc::new(RwLock::new(jobs)),
            index: Arc::new(RwLock::new(index)),
            listed: Arc::new(RwLock::new(listed)),
            lock_timeout,
        }
    }

    /// How long `begin` waits for a job lock.
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    async fn handle(&self, job_id: &JobId) -> Result<JobHandle> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| Error::JobNotFound(job_id.clone()))
    }

    fn timed_out(&self, job_id: &JobId) -> Error {
        Error::TransactionTimeout {
            job: job_id.clone(),
            waited: self.lock_timeout,
        }
    }

    async fn lock<'a>(&self, job_id: &JobId, handle: &'a JobHandle) -> Result<MutexGuard<'a, JobRows>> {
        tokio::time::timeout(self.lock_timeout, handle.lock())
            .await
            .map_err(|_| self.timed_out(job_id))
    }
}

fn export(job_id: &JobId, rows: &JobRows) -> JobExport {
    let mut tasks: Vec<TaskNode> = rows.tasks.values().cloned().collect();
    tasks.sort_by(|a, b| a.id.cmp(&b.id));
    JobExport {
        job_id: job_id.clone(),
        job_version: rows.job_version,
        tasks,
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn begin(&self, job_id: &JobId) -> Result<Box<dyn JobTransaction>> {
        let handle = self.handle(job_id).await?;
        let guard = tokio::time::timeout(self.lock_timeout, handle.lock_owned())
            .await
            .map_err(|_| self.timed_out(job_id))?;

        debug!(job = %job_id, job_version = guard.job_version, "Transaction started");

        Ok(Box::new(InMemoryTransaction {
            job_id: job_id.clone(),
            guard,
            index: Arc::clone(&self.index),
            listed: Arc::clone(&self.listed),
        }))
    }

    async fn ensure_job(&self, job_id: &JobId) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(job_id) {
            return Ok(false);
        }
        jobs.insert(job_id.clone(), Arc::new(Mutex::new(JobRows::default())));
        debug!(job = %job_id, "Job registered");
        Ok(true)
    }

    async fn jobs(&self) -> Result<Vec<JobId>> {
        let mut jobs: Vec<JobId> = self.listed.read().await.iter().cloned().collect();
        jobs.sort();
        Ok(jobs)
    }

    async fn job_of(&self, task_id: &TaskId) -> Result<Option<JobId>> {
        Ok(self.index.read().await.get(task_id).cloned())
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<TaskNode>> {
        let Some(job_id) = self.job_of(task_id).await? else {
            return Ok(None);
        };
        let handle = self.handle(&job_id).await?;
        let rows = self.lock(&job_id, &handle).await?;
        Ok(rows.tasks.get(task_id).cloned())
    }

    async fn export_job(&self, job_id: &JobId) -> Result<JobExport> {
        if !self.listed.read().await.contains(job_id) {
            return Err(Error::JobNotFound(job_id.clone()));
        }
        let handle = self.handle(job_id).await?;
        let rows = self.lock(job_id, &handle).await?;
        Ok(export(job_id, &rows))
    }

    async fn task_count(&self) -> Result<usize> {
        Ok(self.index.read().await.len())
    }

    async fn export_all(&self) -> Result<Vec<JobExport>> {
        let mut exports = Vec::new();
        for job_id in self.jobs().await? {
            exports.push(self.export_job(&job_id).await?);
        }
        Ok(exports)
    }

    async fn save(&self) -> Result<()> {
        Ok(())
    }
}

/// A write transaction holding one job's lock.
struct InMemoryTransaction {
    job_id: JobId,
    guard: OwnedMutexGuard<JobRows>,
    index: Arc<RwLock<HashMap<TaskId, JobId>>>,
    listed: Arc<RwLock<HashSet<JobId>>>,
}

impl InMemoryTransaction {
    fn check(&self, changes: &ChangeSet) -> Result<()> {
        let rows = &*self.guard;
        let violation = |msg: String| Err(Error::InvariantViolation(msg));

        if changes.job_id != self.job_id {
            return violation(format!(
                "change set for job {} committed on job {}",
                changes.job_id, self.job_id
            ));
        }
        if changes.base_job_version != rows.job_version {
            return violation(format!(
                "job {} is at version {}, change set computed against {}",
                self.job_id, rows.job_version, changes.base_job_version
            ));
        }

        let prior = changes
            .updates
            .iter()
            .map(|u| (&u.node.id, u.prior_version))
            .chain(changes.deletes.iter().map(|d| (&d.id, d.prior_version)));
        for (id, expected) in prior {
            match rows.tasks.get(id) {
                Some(stored) if stored.version == expected => {}
                Some(stored) => {
                    return violation(format!(
                        "compare-and-set on {id} failed: stored version {}, expected {expected}",
                        stored.version
                    ));
                }
                None => return violation(format!("write to missing row {id}")),
            }
        }

        for node in changes.updates.iter().map(|u| &u.node).chain(&changes.inserts) {
            if node.job_id != self.job_id {
                return violation(format!("row {} names job {}", node.id, node.job_id));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl JobTransaction for InMemoryTransaction {
    fn job_id(&self) -> &JobId {
        &self.job_id
    }

    fn job_version(&self) -> u64 {
        self.guard.job_version
    }

    fn nodes(&self) -> Vec<TaskNode> {
        self.guard.tasks.values().cloned().collect()
    }

    async fn commit(self: Box<Self>, changes: ChangeSet) -> Result<()> {
        self.check(&changes)?;

        let InMemoryTransaction {
            job_id,
            mut guard,
            index,
            listed,
        } = *self;
        let mut index = index.write().await;

        if let Some(existing) = changes.inserts.iter().find(|n| index.contains_key(&n.id)) {
            return Err(Error::InvariantViolation(format!(
                "task id {} is already in use",
                existing.id
            )));
        }

        for delete in &changes.deletes {
            guard.tasks.remove(&delete.id);
            index.remove(&delete.id);
        }
        for update in changes.updates {
            guard.tasks.insert(update.node.id.clone(), update.node);
        }
        for insert in changes.inserts {
            index.insert(insert.id.clone(), job_id.clone());
            guard.tasks.insert(insert.id.clone(), insert);
        }
        guard.job_version = changes.new_job_version;
        if listed.write().await.insert(job_id.clone()) {
            debug!(job = %job_id, "Job listed");
        }

        debug!(
            job = %job_id,
            job_version = guard.job_version,
            "Transaction committed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{RowDelete, RowUpdate};
    use crate::tree::tests::node;

    fn store() -> InMemoryStore {
        InMemoryStore::new(Duration::from_millis(50))
    }

    fn insert_only(job: &str, base: u64, nodes: Vec<TaskNode>) -> ChangeSet {
        ChangeSet {
            job_id: JobId::new(job),
            base_job_version: base,
            new_job_version: base + 1,
            inserts: nodes,
            updates: vec![],
            deletes: vec![],
        }
    }

    async fn seeded() -> InMemoryStore {
        let store = store();
        store.ensure_job(&JobId::new("j1")).await.unwrap();
        let txn = store.begin(&JobId::new("j1")).await.unwrap();
        txn.commit(insert_only(
            "j1",
            0,
            vec![node("a", None, 1000), node("b", None, 2000)],
        ))
        .await
        .unwrap();
        store
    }

    #[tokio::test]
    async fn test_begin_unknown_job() {
        let err = store().begin(&JobId::new("nope")).await.err().unwrap();
        assert!(matches!(err, Error::JobNotFound(_)));
    }

    #[tokio::test]
    async fn test_ensure_job_is_idempotent() {
        let store = store();
        assert!(store.ensure_job(&JobId::new("j1")).await.unwrap());
        assert!(!store.ensure_job(&JobId::new("j1")).await.unwrap());
        assert!(store.begin(&JobId::new("j1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_job_listed_after_first_commit() {
        let store = store();
        let j1 = JobId::new("j1");
        store.ensure_job(&j1).await.unwrap();

        // Dropped without commit: still unlisted.
        drop(store.begin(&j1).await.unwrap());
        assert!(store.jobs().await.unwrap().is_empty());
        assert!(matches!(
            store.export_job(&j1).await.unwrap_err(),
            Error::JobNotFound(_)
        ));
        assert!(store.export_all().await.unwrap().is_empty());

        let txn = store.begin(&j1).await.unwrap();
        txn.commit(insert_only("j1", 0, vec![node("a", None, 1000)]))
            .await
            .unwrap();

        assert_eq!(store.jobs().await.unwrap(), vec![j1.clone()]);
        assert_eq!(store.export_job(&j1).await.unwrap().job_version, 1);
    }

    #[tokio::test]
    async fn test_commit_applies_and_indexes() {
        let store = seeded().await;

        assert_eq!(store.task_count().await.unwrap(), 2);
        assert_eq!(
            store.job_of(&TaskId::new("a")).await.unwrap(),
            Some(JobId::new("j1"))
        );
        let export = store.export_job(&JobId::new("j1")).await.unwrap();
        assert_eq!(export.job_version, 1);
        assert_eq!(export.tasks.len(), 2);
    }

    #[tokio::test]
    async fn test_drop_without_commit_discards() {
        let store = seeded().await;
        {
            let txn = store.begin(&JobId::new("j1")).await.unwrap();
            assert_eq!(txn.nodes().len(), 2);
        }
        let txn = store.begin(&JobId::new("j1")).await.unwrap();
        assert_eq!(txn.job_version(), 1);
    }

    #[tokio::test]
    async fn test_second_writer_times_out() {
        let store = seeded().await;
        let _held = store.begin(&JobId::new("j1")).await.unwrap();

        let err = store.begin(&JobId::new("j1")).await.err().unwrap();
        assert!(matches!(err, Error::TransactionTimeout { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_other_job_not_blocked() {
        let store = seeded().await;
        store.ensure_job(&JobId::new("j2")).await.unwrap();
        let _held = store.begin(&JobId::new("j1")).await.unwrap();

        assert!(store.begin(&JobId::new("j2")).await.is_ok());
        assert_eq!(
            store.job_of(&TaskId::new("a")).await.unwrap(),
            Some(JobId::new("j1"))
        );
    }

    #[tokio::test]
    async fn test_failed_compare_and_set_writes_nothing() {
        let store = seeded().await;
        let txn = store.begin(&JobId::new("j1")).await.unwrap();

        let mut a = node("a", None, 500);
        a.version = 1;
        let mut b = node("b", None, 600);
        b.version = 8;
        let changes = ChangeSet {
            job_id: JobId::new("j1"),
            base_job_version: 1,
            new_job_version: 2,
            inserts: vec![],
            updates: vec![
                RowUpdate {
                    node: a,
                    prior_version: 0,
                },
                RowUpdate {
                    node: b,
                    prior_version: 7,
                },
            ],
            deletes: vec![],
        };

        let err = txn.commit(changes).await.unwrap_err();
        assert!(err.is_fatal());

        let a = store.get(&TaskId::new("a")).await.unwrap().unwrap();
        assert_eq!(a.position.get(), 1000);
        assert_eq!(a.version, 0);
    }

    #[tokio::test]
    async fn test_delete_removes_from_index() {
        let store = seeded().await;
        let txn = store.begin(&JobId::new("j1")).await.unwrap();
        let changes = ChangeSet {
            job_id: JobId::new("j1"),
            base_job_version: 1,
            new_job_version: 2,
            inserts: vec![],
            updates: vec![],
            deletes: vec![RowDelete {
                id: TaskId::new("a"),
                prior_version: 0,
            }],
        };
        txn.commit(changes).await.unwrap();

        assert_eq!(store.job_of(&TaskId::new("a")).await.unwrap(), None);
        assert_eq!(store.task_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_rejects_id_used_by_other_job() {
        let store = seeded().await;
        store.ensure_job(&JobId::new("j2")).await.unwrap();

        let mut dup = node("a", None, 1000);
        dup.job_id = JobId::new("j2");
        let txn = store.begin(&JobId::new("j2")).await.unwrap();
        let err = txn.commit(insert_only("j2", 0, vec![dup])).await.unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(
            store.job_of(&TaskId::new("a")).await.unwrap(),
            Some(JobId::new("j1"))
        );
    }
}
