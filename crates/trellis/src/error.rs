//! Error types for trellis operations.
//!
//! Concurrency conflicts are not part of this enum: a stale
//! version is an expected outcome of every mutating call and is returned as
//! the `Conflict` arm of [`Outcome`](crate::domain::Outcome) or
//! [`BatchOutcome`](crate::domain::BatchOutcome), together with a snapshot.

use crate::domain::{JobId, TaskId};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// The error type for trellis operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Reparenting would make a task its own ancestor.
    #[error("Cannot move {task} under {proposed_parent}: it would create a cycle")]
    Cycle {
        /// The task being moved
        task: TaskId,
        /// The proposed new parent (the task itself or one of its descendants)
        proposed_parent: TaskId,
    },

    /// The proposed parent belongs to a different job.
    #[error("Cannot move {task} (job {task_job}) under a task of job {parent_job}")]
    CrossJobReparent {
        /// The task being moved
        task: TaskId,
        /// The job the task belongs to
        task_job: JobId,
        /// The job the proposed parent belongs to
        parent_job: JobId,
    },

    /// A `Before`/`After` target names a task that is not in the sibling scope.
    #[error("Reference sibling {sibling} is not a child of {}", parent_label(.parent.as_ref()))]
    UnknownReferenceSibling {
        /// The referenced sibling
        sibling: TaskId,
        /// The scope that was searched
        parent: Option<TaskId>,
    },

    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// A batch operation names a task that belongs to another job.
    #[error("Task {task} does not belong to job {job}")]
    TaskNotInJob {
        /// The offending task
        task: TaskId,
        /// The job the batch targets
        job: JobId,
    },

    /// Delete rejected because the task still has children.
    #[error("Cannot delete {task}: it has {child_count} child task(s)")]
    HasChildren {
        /// The task that was to be deleted
        task: TaskId,
        /// Number of direct children
        child_count: usize,
    },

    /// Input failed validation (empty title, empty batch, ...).
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The job's lock could not be acquired within the configured timeout.
    #[error("Transaction on job {job} timed out after {waited:?}")]
    TransactionTimeout {
        /// The job whose transaction timed out
        job: JobId,
        /// How long the caller waited
        waited: Duration,
    },

    /// Storage backend failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A tree invariant was found broken. This is a bug, never a retryable state.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

fn parent_label(parent: Option<&TaskId>) -> String {
    parent.map_or_else(|| "the job root".to_string(), ToString::to_string)
}

impl Error {
    /// Returns `true` for requests that can never succeed against the current tree shape.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::Cycle { .. }
                | Error::CrossJobReparent { .. }
                | Error::UnknownReferenceSibling { .. }
                | Error::TaskNotFound(_)
                | Error::JobNotFound(_)
                | Error::TaskNotInJob { .. }
                | Error::HasChildren { .. }
                | Error::Validation(_)
        )
    }

    /// Returns `true` when nothing can be assumed about stored state and the
    /// caller should re-read before retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::TransactionTimeout { .. } | Error::Storage(_) | Error::Io(_)
        )
    }

    /// Returns `true` for conditions that indicate a bug or corrupted data.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InvariantViolation(_))
    }
}

/// A specialized Result type for trellis operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_sibling_message_names_scope() {
        let root = Error::UnknownReferenceSibling {
            sibling: TaskId::new("t-1"),
            parent: None,
        };
        assert!(root.to_string().contains("the job root"));

        let nested = Error::UnknownReferenceSibling {
            sibling: TaskId::new("t-1"),
            parent: Some(TaskId::new("t-9")),
        };
        assert!(nested.to_string().contains("t-9"));
    }

    #[test]
    fn test_classification() {
        let cycle = Error::Cycle {
            task: TaskId::new("a"),
            proposed_parent: TaskId::new("b"),
        };
        assert!(cycle.is_structural());
        assert!(!cycle.is_transient());

        let timeout = Error::TransactionTimeout {
            job: JobId::new("j"),
            waited: Duration::from_millis(10),
        };
        assert!(timeout.is_transient());
        assert!(!timeout.is_structural());

        assert!(Error::InvariantViolation("x".into()).is_fatal());
    }
}
