//! Concurrency controller for single-task mutations.
//!
//! Every mutation names the version the caller last observed. The controller
//! opens a transaction on the task's job, compares that version with the
//! stored one (exact equality), lets the caller's closure change a
//! [`JobTree`] working copy, and commits the resulting change set. A
//! mismatch never writes anything and returns [`Outcome::Conflict`] with the
//! current sibling scopes, so the caller can rebase without another read.
//!
//! ```text
//! Proposed ──▶ Validated ──▶ Committed
//!     │            │
//!     └────────────┴──▶ Conflicted
//! ```
//!
//! The version check runs before validation. A stale caller gets a conflict
//! even when its request would also be structurally illegal against the
//! current tree, since it has not seen that tree yet.

use crate::clock::Clock;
use crate::domain::{JobId, Outcome, SiblingSnapshot, StaleVersion, TaskId};
use crate::error::{Error, Result};
use crate::integrity::ParentRef;
use crate::storage::{ChangeSet, TaskStore};
use crate::tree::JobTree;
use std::fmt;
use tracing::{debug, error, warn};

/// Where a mutation attempt is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    /// Received with the caller's expected version
    Proposed,
    /// Integrity guard and position engine accepted it
    Validated,
    /// Written; versions bumped
    Committed,
    /// The expected version was stale; nothing written
    Conflicted,
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MutationState::Proposed => "proposed",
            MutationState::Validated => "validated",
            MutationState::Committed => "committed",
            MutationState::Conflicted => "conflicted",
        };
        write!(f, "{s}")
    }
}

/// Tracks one mutation attempt through [`MutationState`].
#[derive(Debug)]
pub struct Attempt {
    subject: String,
    state: MutationState,
}

impl Attempt {
    /// Start tracking an attempt on `subject` (a task or job id).
    pub fn propose(subject: impl fmt::Display) -> Self {
        let subject = subject.to_string();
        debug!(subject = %subject, state = %MutationState::Proposed, "Mutation proposed");
        Self {
            subject,
            state: MutationState::Proposed,
        }
    }

    /// The current state.
    pub fn state(&self) -> MutationState {
        self.state
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` for a transition the state machine does not allow.
    pub fn advance(&mut self, next: MutationState) -> Result<()> {
        use MutationState::{Committed, Conflicted, Proposed, Validated};

        let legal = matches!(
            (self.state, next),
            (Proposed, Validated | Conflicted) | (Validated, Committed | Conflicted)
        );
        if !legal {
            error!(subject = %self.subject, from = %self.state, to = %next, "Illegal mutation transition");
            return Err(Error::InvariantViolation(format!(
                "mutation of {} cannot go from {} to {next}",
                self.subject, self.state
            )));
        }

        self.state = next;
        match next {
            Conflicted => warn!(subject = %self.subject, "Mutation conflicted"),
            _ => debug!(subject = %self.subject, state = %next, "Mutation advanced"),
        }
        Ok(())
    }
}

/// A committed mutation: what the closure returned plus what was written.
#[derive(Debug)]
pub struct Applied<R> {
    /// The closure's result
    pub value: R,
    /// The committed change set
    pub changes: ChangeSet,
}

/// Resolve a proposed parent against the working copy and the store index.
///
/// Parents outside the job are looked up by id only; their job is never locked.
///
/// # Errors
///
/// `TaskNotFound` if the parent exists nowhere.
pub async fn resolve_parent(
    store: &dyn TaskStore,
    tree: &JobTree,
    parent: Option<&TaskId>,
) -> Result<ParentRef> {
    let Some(parent) = parent else {
        return Ok(ParentRef::Root);
    };
    if tree.contains(parent) {
        return Ok(ParentRef::Local(parent.clone()));
    }
    match store.job_of(parent).await? {
        Some(job) => Ok(ParentRef::Foreign {
            id: parent.clone(),
            job,
        }),
        None => Err(Error::TaskNotFound(parent.clone())),
    }
}

/// The task's current scope, plus the requested destination scope if it differs.
pub fn sibling_snapshot(
    tree: &JobTree,
    task_id: &TaskId,
    destination: Option<Option<&TaskId>>,
) -> SiblingSnapshot {
    let current = tree.get(task_id).and_then(|n| n.parent_id.as_ref());
    let mut scopes = vec![tree.scope_snapshot(current)];

    if let Some(destination) = destination {
        let known = destination.is_none_or(|p| tree.contains(p));
        if destination != current && known {
            scopes.push(tree.scope_snapshot(destination));
        }
    }

    SiblingSnapshot {
        job_id: tree.job_id().clone(),
        job_version: tree.job_version(),
        scopes,
    }
}

/// Runs single-task mutations under optimistic version checks.
pub struct ConcurrencyController<'a> {
    store: &'a dyn TaskStore,
    clock: &'a dyn Clock,
}

impl<'a> ConcurrencyController<'a> {
    /// Create a controller over `store`, stamping commits with `clock`.
    pub fn new(store: &'a dyn TaskStore, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    /// The job a task belongs to.
    ///
    /// # Errors
    ///
    /// `TaskNotFound` if no job owns the task.
    pub async fn job_of(&self, task_id: &TaskId) -> Result<JobId> {
        self.store
            .job_of(task_id)
            .await?
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))
    }

    /// Mutate `task_id` if it is still at `expected_version`.
    ///
    /// `new_parent` is `None` to keep the parent, `Some(None)` for the job
    /// root. It is resolved and handed to `apply` as a [`ParentRef`], and
    /// also selects the destination scope reported on conflict.
    ///
    /// `apply` runs on the working copy while the job is locked. If it fails
    /// the transaction is dropped and nothing is written.
    ///
    /// # Errors
    ///
    /// - `TaskNotFound` if the task does not exist
    /// - whatever `apply` or the integrity/position checks inside it return
    /// - `TransactionTimeout` if the job lock cannot be acquired in time
    pub async fn mutate<R, F>(
        &self,
        task_id: &TaskId,
        expected_version: u64,
        new_parent: Option<Option<&TaskId>>,
        apply: F,
    ) -> Result<Outcome<Applied<R>>>
    where
        R: Send,
        F: FnOnce(&mut JobTree, Option<&ParentRef>) -> Result<R> + Send,
    {
        let mut attempt = Attempt::propose(task_id);
        let job_id = self.job_of(task_id).await?;
        let txn = self.store.begin(&job_id).await?;
        let mut tree = JobTree::new(job_id, txn.job_version(), txn.nodes())?;

        let current_version = tree
            .get(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?
            .version;
        if current_version != expected_version {
            attempt.advance(MutationState::Conflicted)?;
            warn!(
                task = %task_id,
                expected_version,
                current_version,
                "Stale version"
            );
            let snapshot = sibling_snapshot(&tree, task_id, new_parent);
            return Ok(Outcome::Conflict(Box::new(StaleVersion {
                task_id: task_id.clone(),
                expected_version,
                current_version,
                snapshot,
            })));
        }

        let parent = match new_parent {
            Some(parent) => Some(resolve_parent(self.store, &tree, parent).await?),
            None => None,
        };
        let value = apply(&mut tree, parent.as_ref())?;
        attempt.advance(MutationState::Validated)?;

        let changes = tree.into_change_set(self.clock.now());
        txn.commit(changes.clone()).await?;
        attempt.advance(MutationState::Committed)?;

        Ok(Outcome::Committed(Applied { value, changes }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::{PositionTarget, TaskNode};
    use crate::position::PositionEngine;
    use crate::storage::{InMemoryStore, JobTransaction};
    use crate::tree::tests::node;
    use std::time::Duration;

    async fn seeded(rows: Vec<TaskNode>) -> InMemoryStore {
        let store = InMemoryStore::new(Duration::from_millis(100));
        store.ensure_job(&JobId::new("j1")).await.unwrap();
        let txn: Box<dyn JobTransaction> = store.begin(&JobId::new("j1")).await.unwrap();
        txn.commit(ChangeSet {
            job_id: JobId::new("j1"),
            base_job_version: 0,
            new_job_version: 1,
            inserts: rows,
            updates: vec![],
            deletes: vec![],
        })
        .await
        .unwrap();
        store
    }

    #[test]
    fn test_state_machine_transitions() {
        let mut attempt = Attempt::propose("t");
        assert!(attempt.advance(MutationState::Committed).is_err());
        attempt.advance(MutationState::Validated).unwrap();
        attempt.advance(MutationState::Committed).unwrap();
        assert_eq!(attempt.state(), MutationState::Committed);
        assert!(attempt.advance(MutationState::Conflicted).is_err());
    }

    #[tokio::test]
    async fn test_stale_version_conflicts_without_calling_apply() {
        let store = seeded(vec![node("a", None, 1000), node("b", None, 2000)]).await;
        let clock = ManualClock::default();
        let controller = ConcurrencyController::new(&store, &clock);

        let outcome = controller
            .mutate(&TaskId::new("a"), 3, None, |_, _| -> Result<()> {
                panic!("apply must not run on a stale version")
            })
            .await
            .unwrap();

        let stale = outcome.conflict().unwrap();
        assert_eq!(stale.current_version, 0);
        assert_eq!(stale.snapshot.scopes.len(), 1);
        assert_eq!(stale.snapshot.scopes[0].siblings.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_apply_writes_nothing() {
        let store = seeded(vec![node("a", None, 1000), node("b", None, 2000)]).await;
        let clock = ManualClock::default();
        let controller = ConcurrencyController::new(&store, &clock);
        let engine = PositionEngine::default();

        let err = controller
            .mutate(&TaskId::new("a"), 0, None, |tree, _| {
                tree.move_node(&engine, &TaskId::new("a"), &PositionTarget::Last, None)?;
                Err::<(), _>(Error::Validation("late failure".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        let a = store.get(&TaskId::new("a")).await.unwrap().unwrap();
        assert_eq!((a.position.get(), a.version), (1000, 0));
    }

    #[tokio::test]
    async fn test_foreign_parent_resolution() {
        let store = seeded(vec![node("a", None, 1000)]).await;
        store.ensure_job(&JobId::new("j2")).await.unwrap();
        let mut z = node("z", None, 1000);
        z.job_id = JobId::new("j2");
        let txn = store.begin(&JobId::new("j2")).await.unwrap();
        txn.commit(ChangeSet {
            job_id: JobId::new("j2"),
            base_job_version: 0,
            new_job_version: 1,
            inserts: vec![z],
            updates: vec![],
            deletes: vec![],
        })
        .await
        .unwrap();

        let export = store.export_job(&JobId::new("j1")).await.unwrap();
        let tree = JobTree::new(JobId::new("j1"), 1, export.tasks).unwrap();

        assert_eq!(
            resolve_parent(&store, &tree, Some(&TaskId::new("z"))).await.unwrap(),
            ParentRef::Foreign {
                id: TaskId::new("z"),
                job: JobId::new("j2")
            }
        );
        assert_eq!(resolve_parent(&store, &tree, None).await.unwrap(), ParentRef::Root);
        assert!(matches!(
            resolve_parent(&store, &tree, Some(&TaskId::new("ghost"))).await,
            Err(Error::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_snapshot_includes_destination_scope() {
        let tree = crate::tree::tests::build_tree(vec![
            node("a", None, 1000),
            node("b", None, 2000),
            node("b1", Some("b"), 1000),
        ]);
        let b = TaskId::new("b");

        let snapshot = sibling_snapshot(&tree, &TaskId::new("a"), Some(Some(&b)));
        assert_eq!(snapshot.scopes.len(), 2);
        assert_eq!(snapshot.scopes[1].parent_id, Some(b.clone()));

        let same_scope = sibling_snapshot(&tree, &TaskId::new("a"), Some(None));
        assert_eq!(same_scope.scopes.len(), 1);
    }
}
