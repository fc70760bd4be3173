//! The operation-level API.
//!
//! [`TaskEngine`] is what a transport layer (HTTP controller, CLI, ...) calls.
//! Each method maps 1:1 onto one operation and runs to completion inside a
//! single store transaction on one job.
//!
//! Mutations return `Result<Outcome<_>>` / `Result<BatchOutcome>`:
//!
//! - `Err(_)` for structural, transient and fatal errors (see [`Error`])
//! - `Ok(Outcome::Conflict(_))` when the caller's version was stale, with a
//!   snapshot to rebase on
//! - `Ok(Outcome::Committed(_))` otherwise
//!
//! # Example
//!
//! ```
//! use trellis::config::EngineConfig;
//! use trellis::domain::{JobId, NewTask, Outcome, PositionTarget, TaskId};
//! use trellis::engine::TaskEngine;
//! use trellis::storage::InMemoryStore;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> trellis::error::Result<()> {
//!     let engine = TaskEngine::new(Box::new(InMemoryStore::default()), EngineConfig::default());
//!     let job = JobId::new("j1");
//!
//!     let a = engine.create_task(&job, None, &PositionTarget::Last, NewTask::titled("A")).await?;
//!     let b = engine.create_task(&job, None, &PositionTarget::Last, NewTask::titled("B")).await?;
//!
//!     let outcome = engine
//!         .move_task(&a.id, a.version, &PositionTarget::After(b.id.clone()), None)
//!         .await?;
//!     let Outcome::Committed(moved) = outcome else {
//!         panic!("nobody else is writing");
//!     };
//!     assert_eq!(moved.new_version, 1);
//!
//!     let order: Vec<TaskId> = engine.children(&job, None).await?.into_iter().map(|t| t.id).collect();
//!     assert_eq!(order, vec![b.id, a.id]);
//!     Ok(())
//! }
//! ```

use crate::batch::{BatchRequest, BatchTransactor};
use crate::clock::{Clock, SystemClock};
use crate::concurrency::{Applied, Attempt, ConcurrencyController, MutationState, resolve_parent};
use crate::config::{DeletePolicy, EngineConfig};
use crate::domain::{
    BatchOutcome, DeleteSuccess, JobId, JobSnapshot, MoveOp, MoveSuccess, NewTask, Outcome,
    PositionTarget, PositionValue, TaskId, TaskNode, TaskStatus, TaskUpdate, TouchedNode,
    validate_title,
};
use crate::error::{Error, Result};
use crate::id_generation::{HashIdGenerator, IdGenerator, IdSeed};
use crate::integrity::{self, ParentRef, Violation};
use crate::position::PositionEngine;
use crate::storage::{ChangeSet, TaskStore};
use crate::tree::{JobTree, Touch};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, error, info};

/// How many generated IDs may collide with stored ones before giving up.
const MAX_ID_ATTEMPTS: usize = 8;

/// Hierarchical task ordering with optimistic concurrency control.
pub struct TaskEngine {
    store: Box<dyn TaskStore>,
    config: EngineConfig,
    positions: PositionEngine,
    ids: Mutex<Box<dyn IdGenerator>>,
    clock: Box<dyn Clock>,
}

impl std::fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("config", &self.config)
            .field("store", &"<dyn TaskStore>")
            .finish_non_exhaustive()
    }
}

impl TaskEngine {
    /// Create an engine over `store` with hash IDs and the system clock.
    pub fn new(store: Box<dyn TaskStore>, config: EngineConfig) -> Self {
        Self {
            positions: PositionEngine::new(config.position_increment),
            ids: Mutex::new(Box::new(HashIdGenerator::new(config.id_prefix.clone()))),
            clock: Box::new(SystemClock),
            store,
            config,
        }
    }

    /// Replace the ID generator.
    #[must_use]
    pub fn with_id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Mutex::new(Box::new(ids));
        self
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &dyn TaskStore {
        self.store.as_ref()
    }

    /// The active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Persist the store (a no-op for in-memory stores).
    pub async fn save(&self) -> Result<()> {
        self.store.save().await
    }

    fn controller(&self) -> ConcurrencyController<'_> {
        ConcurrencyController::new(self.store.as_ref(), self.clock.as_ref())
    }

    // ========== Creation ==========

    /// Create a task in `job_id` under `parent_id` (root if `None`) at `target`.
    ///
    /// The job is created by its first successful create; a rejected create
    /// on an unknown job leaves no job behind. The new task starts at
    /// version 0 and the job version advances by one.
    ///
    /// # Errors
    ///
    /// - `Validation` if `fields` are invalid
    /// - `TaskNotFound` if the parent does not exist
    /// - `CrossJobReparent` if the parent belongs to another job
    /// - `UnknownReferenceSibling` if `target` names a task outside the scope
    pub async fn create_task(
        &self,
        job_id: &JobId,
        parent_id: Option<&TaskId>,
        target: &PositionTarget,
        fields: NewTask,
    ) -> Result<TaskNode> {
        fields.validate().map_err(Error::Validation)?;

        let fresh_job = self.store.ensure_job(job_id).await?;
        let txn = self.store.begin(job_id).await?;
        let mut tree = JobTree::new(job_id.clone(), txn.job_version(), txn.nodes())?;

        let id = self.allocate_id(&tree, &fields, parent_id).await?;
        let mut attempt = Attempt::propose(&id);

        let parent = match resolve_parent(self.store.as_ref(), &tree, parent_id).await? {
            ParentRef::Root => None,
            ParentRef::Local(parent) => Some(parent),
            ParentRef::Foreign { job, .. } => {
                return Err(Error::CrossJobReparent {
                    task: id,
                    task_job: job_id.clone(),
                    parent_job: job,
                });
            }
        };

        let now = self.clock.now();
        let node = TaskNode {
            id: id.clone(),
            job_id: job_id.clone(),
            parent_id: parent,
            position: PositionValue::new(0),
            status: fields.status,
            title: fields.title,
            assignee: fields.assignee,
            version: 0,
            subtree_count: 0,
            reordered_at: now,
            created_at: now,
            updated_at: now,
        };
        tree.insert(&self.positions, node, target)?;
        attempt.advance(MutationState::Validated)?;

        let changes = tree.into_change_set(now);
        let created = written(&changes, &id)?.clone();
        txn.commit(changes).await?;
        attempt.advance(MutationState::Committed)?;

        if fresh_job {
            info!(job = %job_id, "Created job");
        }
        debug!(task = %id, job = %job_id, position = %created.position, "Created task");
        Ok(created)
    }

    async fn allocate_id(
        &self,
        tree: &JobTree,
        fields: &NewTask,
        parent_id: Option<&TaskId>,
    ) -> Result<TaskId> {
        let database_size = self.store.task_count().await?;
        let seed = IdSeed {
            title: &fields.title,
            job_id: tree.job_id(),
            parent_id,
            database_size,
        };

        for _ in 0..MAX_ID_ATTEMPTS {
            let id = {
                let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
                ids.generate(&seed)
                    .map_err(|e| Error::Storage(format!("ID generation failed: {e}")))?
            };
            if !tree.contains(&id) && self.store.job_of(&id).await?.is_none() {
                return Ok(id);
            }
            debug!(task = %id, "Generated ID already stored, retrying");
            self.ids
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .register_id(&id);
        }

        Err(Error::Storage(format!(
            "no unused task ID after {MAX_ID_ATTEMPTS} attempts"
        )))
    }

    // ========== Single-task mutations ==========

    /// Move a task to `target`, optionally under a new parent.
    ///
    /// `new_parent`: `None` keeps the parent, `Some(None)` moves to the job root.
    ///
    /// # Errors
    ///
    /// - `TaskNotFound` if the task or the new parent does not exist
    /// - `Cycle` if the new parent is the task or one of its descendants
    /// - `CrossJobReparent` if the new parent belongs to another job
    /// - `UnknownReferenceSibling` if `target` names a task outside the destination scope
    pub async fn move_task(
        &self,
        task_id: &TaskId,
        expected_version: u64,
        target: &PositionTarget,
        new_parent: Option<Option<&TaskId>>,
    ) -> Result<Outcome<MoveSuccess>> {
        let positions = &self.positions;
        let outcome = self
            .controller()
            .mutate(task_id, expected_version, new_parent, |tree, parent| {
                tree.move_node(positions, task_id, target, parent)
            })
            .await?;

        map_committed(outcome, |Applied { value, changes }| {
            let node = written(&changes, task_id)?;
            let renumbered = value
                .iter()
                .map(|r| {
                    written(&changes, &r.id).map(|n| TouchedNode {
                        id: n.id.clone(),
                        new_version: n.version,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            Ok(MoveSuccess {
                task_id: task_id.clone(),
                new_version: node.version,
                reordered_at: node.reordered_at,
                parent_id: node.parent_id.clone(),
                position: node.position,
                job_version: changes.new_job_version,
                renumbered,
            })
        })
    }

    /// Apply every field of `update` as one mutation with one version bump.
    ///
    /// A parent change without a target appends to the new scope. A status
    /// change counts as a reorder for `reordered_at` but leaves the job
    /// version alone unless the update also moves the task.
    ///
    /// # Errors
    ///
    /// - `Validation` for an empty update or invalid title
    /// - the errors of [`move_task`](Self::move_task) for structural updates
    pub async fn update_task(
        &self,
        task_id: &TaskId,
        expected_version: u64,
        update: TaskUpdate,
    ) -> Result<Outcome<TaskNode>> {
        if update.is_empty() {
            return Err(Error::Validation("update changes nothing".to_string()));
        }
        if let Some(title) = &update.title {
            validate_title(title).map_err(Error::Validation)?;
        }

        let TaskUpdate {
            title,
            assignee,
            status,
            parent,
            target,
        } = update;
        let target = target.or_else(|| parent.as_ref().map(|_| PositionTarget::Last));
        let new_parent = parent.as_ref().map(Option::as_ref);
        let positions = &self.positions;

        let outcome = self
            .controller()
            .mutate(task_id, expected_version, new_parent, move |tree, parent| {
                if let Some(target) = &target {
                    tree.move_node(positions, task_id, target, parent)?;
                }
                if title.is_some() || assignee.is_some() {
                    tree.modify(task_id, Touch::Field, |node| {
                        if let Some(title) = title {
                            node.title = title;
                        }
                        if let Some(assignee) = assignee {
                            node.assignee = assignee;
                        }
                    })?;
                }
                if let Some(status) = status {
                    tree.modify(task_id, Touch::Reordered, |node| node.status = status)?;
                }
                Ok(())
            })
            .await?;

        map_committed(outcome, |Applied { changes, .. }| {
            written(&changes, task_id).cloned()
        })
    }

    /// Change a task's status.
    ///
    /// # Errors
    ///
    /// `TaskNotFound` if the task does not exist.
    pub async fn set_status(
        &self,
        task_id: &TaskId,
        expected_version: u64,
        status: TaskStatus,
    ) -> Result<Outcome<TaskNode>> {
        let update = TaskUpdate {
            status: Some(status),
            ..Default::default()
        };
        self.update_task(task_id, expected_version, update).await
    }

    /// Delete a task according to the configured [`DeletePolicy`].
    ///
    /// # Errors
    ///
    /// - `TaskNotFound` if the task does not exist
    /// - `HasChildren` under [`DeletePolicy::Reject`] if the task has children
    pub async fn delete_task(
        &self,
        task_id: &TaskId,
        expected_version: u64,
    ) -> Result<Outcome<DeleteSuccess>> {
        let policy = self.config.delete_policy;
        let outcome = self
            .controller()
            .mutate(task_id, expected_version, None, |tree, _| {
                let child_count = tree.children(Some(task_id)).len();
                if child_count > 0 && policy == DeletePolicy::Reject {
                    return Err(Error::HasChildren {
                        task: task_id.clone(),
                        child_count,
                    });
                }
                tree.remove_subtree(task_id)
            })
            .await?;

        map_committed(outcome, |Applied { value, changes }| {
            info!(task = %task_id, removed = value.len(), "Deleted task");
            Ok(DeleteSuccess {
                removed: value,
                job_version: changes.new_job_version,
            })
        })
    }

    // ========== Batch ==========

    /// Apply `operations` to `job_id` atomically.
    ///
    /// # Errors
    ///
    /// See [`BatchTransactor::apply`].
    pub async fn batch_move(
        &self,
        job_id: &JobId,
        expected_job_version: Option<u64>,
        operations: Vec<MoveOp>,
    ) -> Result<BatchOutcome> {
        let request = BatchRequest {
            job_id: job_id.clone(),
            expected_job_version,
            operations,
        };
        self.apply_batch(&request).await
    }

    /// Apply a prepared [`BatchRequest`].
    ///
    /// # Errors
    ///
    /// See [`BatchTransactor::apply`].
    pub async fn apply_batch(&self, request: &BatchRequest) -> Result<BatchOutcome> {
        BatchTransactor::new(self.store.as_ref(), self.clock.as_ref(), &self.positions)
            .apply(request)
            .await
    }

    // ========== Reads ==========

    /// Look up a task.
    pub async fn get_task(&self, task_id: &TaskId) -> Result<Option<TaskNode>> {
        self.store.get(task_id).await
    }

    async fn read_tree(&self, job_id: &JobId) -> Result<JobTree> {
        let export = self.store.export_job(job_id).await?;
        JobTree::new(export.job_id, export.job_version, export.tasks)
    }

    /// Children of `parent` (roots if `None`) in position order.
    ///
    /// # Errors
    ///
    /// - `JobNotFound` if the job does not exist
    /// - `TaskNotFound` if `parent` is not in the job
    pub async fn children(&self, job_id: &JobId, parent: Option<&TaskId>) -> Result<Vec<TaskNode>> {
        let tree = self.read_tree(job_id).await?;
        if let Some(parent) = parent {
            if !tree.contains(parent) {
                return Err(Error::TaskNotFound(parent.clone()));
            }
        }
        Ok(tree.children(parent).into_iter().cloned().collect())
    }

    /// Every task of a job in depth-first order.
    ///
    /// # Errors
    ///
    /// `JobNotFound` if the job does not exist.
    pub async fn tasks(&self, job_id: &JobId) -> Result<Vec<TaskNode>> {
        let tree = self.read_tree(job_id).await?;
        Ok(tree.pre_order().into_iter().cloned().collect())
    }

    /// Current state of every task in a job, with the job version.
    ///
    /// # Errors
    ///
    /// `JobNotFound` if the job does not exist.
    pub async fn job_snapshot(&self, job_id: &JobId) -> Result<JobSnapshot> {
        Ok(self.read_tree(job_id).await?.snapshot())
    }

    /// Check every tree invariant of a job.
    ///
    /// # Errors
    ///
    /// `JobNotFound` if the job does not exist.
    pub async fn verify_job(&self, job_id: &JobId) -> Result<Vec<Violation>> {
        let violations = integrity::verify(&self.read_tree(job_id).await?);
        for violation in &violations {
            error!(job = %job_id, %violation, "Invariant violation");
        }
        Ok(violations)
    }

    /// Every known job.
    pub async fn jobs(&self) -> Result<Vec<JobId>> {
        self.store.jobs().await
    }
}

fn written<'c>(changes: &'c ChangeSet, id: &TaskId) -> Result<&'c TaskNode> {
    changes.written(id).ok_or_else(|| {
        Error::InvariantViolation(format!("committed change set does not contain {id}"))
    })
}

fn map_committed<A, T>(outcome: Outcome<A>, f: impl FnOnce(A) -> Result<T>) -> Result<Outcome<T>> {
    match outcome {
        Outcome::Committed(applied) => f(applied).map(Outcome::Committed),
        Outcome::Conflict(stale) => Ok(Outcome::Conflict(stale)),
    }
}
