//! Batch reorder transactor.
//!
//! Applies an ordered list of [`MoveOp`]s to one job as a single
//! all-or-nothing commit, optionally gated by the job version the caller
//! loaded.
//!
//! Preconditions are checked against the pre-batch state before anything is
//! applied: the job version, then each operation's task (it must belong to
//! the job) and expected version, in operation order. A stale version
//! returns [`BatchOutcome::Conflict`] with a snapshot of the whole job.
//!
//! Operations are then applied one after another to the same working copy,
//! so each sees the sibling lists as left by the ones before it. The first
//! integrity or position error drops the working copy and is returned; no
//! operation of the batch is written.

use crate::clock::Clock;
use crate::concurrency::{Attempt, MutationState, resolve_parent};
use crate::domain::{
    BatchConflict, BatchConflictReason, BatchOutcome, BatchSuccess, JobId, MoveOp, TouchedNode,
};
use crate::error::{Error, Result};
use crate::position::PositionEngine;
use crate::storage::TaskStore;
use crate::tree::JobTree;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// A batch of moves against one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// The job every operation targets
    pub job_id: JobId,

    /// Job version the caller loaded; unchecked when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_job_version: Option<u64>,

    /// Moves, applied in order
    pub operations: Vec<MoveOp>,
}

/// Applies [`BatchRequest`]s atomically.
pub struct BatchTransactor<'a> {
    store: &'a dyn TaskStore,
    clock: &'a dyn Clock,
    positions: &'a PositionEngine,
}

impl<'a> BatchTransactor<'a> {
    /// Create a transactor over `store`.
    pub fn new(
        store: &'a dyn TaskStore,
        clock: &'a dyn Clock,
        positions: &'a PositionEngine,
    ) -> Self {
        Self {
            store,
            clock,
            positions,
        }
    }

    /// Apply every operation of `request` or none of them.
    ///
    /// # Errors
    ///
    /// - `Validation` for an empty batch
    /// - `JobNotFound`, `TaskNotFound`, `TaskNotInJob` for unknown targets
    /// - `Cycle`, `CrossJobReparent`, `UnknownReferenceSibling` from any operation
    /// - `TransactionTimeout` if the job lock cannot be acquired in time
    pub async fn apply(&self, request: &BatchRequest) -> Result<BatchOutcome> {
        if request.operations.is_empty() {
            return Err(Error::Validation("batch has no operations".to_string()));
        }

        let job_id = &request.job_id;
        let mut attempt = Attempt::propose(job_id);
        let txn = self.store.begin(job_id).await?;
        let mut tree = JobTree::new(job_id.clone(), txn.job_version(), txn.nodes())?;

        if let Some(reason) = self.precondition_failure(&tree, request).await? {
            attempt.advance(MutationState::Conflicted)?;
            warn!(job = %job_id, ?reason, "Batch rejected as stale");
            return Ok(BatchOutcome::Conflict(Box::new(BatchConflict {
                reason,
                snapshot: tree.snapshot(),
            })));
        }

        for (index, op) in request.operations.iter().enumerate() {
            let parent = match &op.new_parent {
                Some(parent) => Some(resolve_parent(self.store, &tree, parent.as_ref()).await?),
                None => None,
            };
            let moved = tree.move_node(self.positions, &op.task_id, &op.target, parent.as_ref());
            if let Err(e) = moved {
                debug!(
                    job = %job_id,
                    op = index,
                    task = %op.task_id,
                    error = %e,
                    "Batch operation rejected"
                );
                return Err(e);
            }
        }
        attempt.advance(MutationState::Validated)?;

        let changes = tree.into_change_set(self.clock.now());
        let touched: Vec<TouchedNode> = changes
            .bumped()
            .map(|node| TouchedNode {
                id: node.id.clone(),
                new_version: node.version,
            })
            .collect();
        let new_job_version = changes.new_job_version;

        txn.commit(changes).await?;
        attempt.advance(MutationState::Committed)?;

        info!(
            job = %job_id,
            operations = request.operations.len(),
            touched = touched.len(),
            job_version = new_job_version,
            "Batch committed"
        );

        Ok(BatchOutcome::Committed(BatchSuccess {
            new_job_version,
            touched,
        }))
    }

    /// The first stale precondition, checked against the pre-batch state.
    async fn precondition_failure(
        &self,
        tree: &JobTree,
        request: &BatchRequest,
    ) -> Result<Option<BatchConflictReason>> {
        if let Some(expected) = request.expected_job_version {
            if expected != tree.job_version() {
                return Ok(Some(BatchConflictReason::JobVersion {
                    expected,
                    current: tree.job_version(),
                }));
            }
        }

        for op in &request.operations {
            let Some(node) = tree.get(&op.task_id) else {
                return Err(match self.store.job_of(&op.task_id).await? {
                    Some(_) => Error::TaskNotInJob {
                        task: op.task_id.clone(),
                        job: request.job_id.clone(),
                    },
                    None => Error::TaskNotFound(op.task_id.clone()),
                });
            };
            if let Some(expected) = op.expected_version {
                if expected != node.version {
                    return Ok(Some(BatchConflictReason::TaskVersion {
                        task_id: op.task_id.clone(),
                        expected,
                        current: node.version,
                    }));
                }
            }
        }

        Ok(None)
    }
}
