//! Domain types for hierarchical task ordering.
//!
//! This module contains the persisted [`TaskNode`], the identifiers and keys it
//! is built from, the operation inputs accepted by the engine, and the outcome
//! and snapshot types it returns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum task title length in characters
pub const MAX_TITLE_LENGTH: usize = 200;

/// Unique identifier for a task
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a new task ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of the job that owns a task tree
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Create a new job ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Sparse ordering key among siblings.
///
/// Keys are spaced by the configured increment so most insertions find a free
/// midpoint; when two neighbours are adjacent integers the position engine
/// renumbers a local run of siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionValue(pub i64);

impl PositionValue {
    /// Wrap a raw key
    pub fn new(key: i64) -> Self {
        Self(key)
    }

    /// The raw key
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for PositionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where to place a task within its (new) sibling scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionTarget {
    /// Before every sibling
    First,
    /// After every sibling
    Last,
    /// Immediately before the given sibling
    Before(TaskId),
    /// Immediately after the given sibling
    After(TaskId),
    /// Legacy 1-based index into the current sibling order; out of range clamps
    Index(usize),
}

impl fmt::Display for PositionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionTarget::First => write!(f, "first"),
            PositionTarget::Last => write!(f, "last"),
            PositionTarget::Before(id) => write!(f, "before {id}"),
            PositionTarget::After(id) => write!(f, "after {id}"),
            PositionTarget::Index(n) => write!(f, "index {n}"),
        }
    }
}

/// Lifecycle state of a task.
///
/// Opaque to ordering; a change only counts as a touch for `reordered_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not started
    #[default]
    New,
    /// Being worked on
    InProgress,
    /// Temporarily halted
    Paused,
    /// Done
    Completed,
    /// Abandoned
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::New => "new",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A persisted work item in a job's task tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNode {
    /// Stable identifier, never reused
    pub id: TaskId,

    /// Owning job; never reassigned
    pub job_id: JobId,

    /// Parent task in the same job, `None` for roots
    pub parent_id: Option<TaskId>,

    /// Sort key among siblings sharing `(job_id, parent_id)`
    pub position: PositionValue,

    /// Lifecycle state
    pub status: TaskStatus,

    /// Task title
    pub title: String,

    /// Assignee (optional)
    pub assignee: Option<String>,

    /// Optimistic concurrency counter, +1 per committed mutation
    pub version: u64,

    /// Cached number of transitive descendants
    pub subtree_count: u64,

    /// Last time position, parent or status changed
    pub reordered_at: DateTime<Utc>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
}

impl TaskNode {
    /// The concurrency-relevant view of this node.
    pub fn state(&self) -> NodeState {
        NodeState {
            id: self.id.clone(),
            parent_id: self.parent_id.clone(),
            position: self.position,
            version: self.version,
        }
    }
}

/// Validate a task title.
pub fn validate_title(title: &str) -> Result<(), String> {
    if title.trim().is_empty() {
        return Err("Title cannot be empty".to_string());
    }
    if title.chars().count() > MAX_TITLE_LENGTH {
        return Err(format!(
            "Title cannot exceed {MAX_TITLE_LENGTH} characters"
        ));
    }
    Ok(())
}

/// Data for creating a new task
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    /// Task title
    pub title: String,

    /// Initial status
    pub status: TaskStatus,

    /// Assignee (optional)
    pub assignee: Option<String>,
}

impl NewTask {
    /// A `New` task with the given title and no assignee.
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Validate the new task data.
    pub fn validate(&self) -> Result<(), String> {
        validate_title(&self.title)
    }
}

/// A single-task mutation; every present field is applied in one commit.
///
/// `parent` follows the `Option<Option<_>>` convention: `None` leaves the
/// parent alone, `Some(None)` moves the task to the job root.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    /// New title
    pub title: Option<String>,

    /// New assignee (`Some(None)` clears it)
    pub assignee: Option<Option<String>>,

    /// New status
    pub status: Option<TaskStatus>,

    /// New parent (`Some(None)` for root)
    pub parent: Option<Option<TaskId>>,

    /// New place among siblings; defaults to `Last` when only the parent changes
    pub target: Option<PositionTarget>,
}

impl TaskUpdate {
    /// Returns `true` if the update changes position or parent.
    pub fn is_structural(&self) -> bool {
        self.parent.is_some() || self.target.is_some()
    }

    /// Returns `true` if the update changes nothing.
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.assignee.is_none()
            && self.status.is_none()
            && !self.is_structural()
    }
}

/// One operation of a batch reorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveOp {
    /// Task to move
    pub task_id: TaskId,

    /// Version the caller last observed; unchecked when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,

    /// Place among the (new) siblings
    pub target: PositionTarget,

    /// New parent (`Some(None)` for root, absent to keep)
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "double_option"
    )]
    pub new_parent: Option<Option<TaskId>>,
}

impl MoveOp {
    /// Reposition within the current scope.
    pub fn reposition(task_id: TaskId, target: PositionTarget) -> Self {
        Self {
            task_id,
            expected_version: None,
            target,
            new_parent: None,
        }
    }

    /// Reparent under `parent` (`None` for root) at `target`.
    pub fn reparent(task_id: TaskId, parent: Option<TaskId>, target: PositionTarget) -> Self {
        Self {
            task_id,
            expected_version: None,
            target,
            new_parent: Some(parent),
        }
    }

    /// Require the task to still be at `version`.
    #[must_use]
    pub fn expecting(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Distinguishes an absent `new_parent` from an explicit `null` (root).
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T: Serialize, S: Serializer>(
        value: &Option<Option<T>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, T: Deserialize<'de>, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Option<T>>, D::Error> {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

/// Concurrency-relevant view of a node, as returned in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    /// Task ID
    pub id: TaskId,
    /// Parent ID
    pub parent_id: Option<TaskId>,
    /// Sort key
    pub position: PositionValue,
    /// Current version
    pub version: u64,
}

/// The ordered siblings of one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSnapshot {
    /// The scope's parent (`None` for the job root)
    pub parent_id: Option<TaskId>,
    /// Siblings in position order
    pub siblings: Vec<NodeState>,
}

/// Current state of the scopes a single-task mutation touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiblingSnapshot {
    /// Owning job
    pub job_id: JobId,
    /// Job version at the time of the snapshot
    pub job_version: u64,
    /// The task's own scope first, then the requested destination scope if different
    pub scopes: Vec<ScopeSnapshot>,
}

impl SiblingSnapshot {
    /// Find a node anywhere in the snapshot.
    pub fn node(&self, id: &TaskId) -> Option<&NodeState> {
        self.scopes
            .iter()
            .flat_map(|scope| scope.siblings.iter())
            .find(|node| &node.id == id)
    }
}

/// Full state of every task in a job, in depth-first tree order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// The job
    pub job_id: JobId,
    /// Current job version
    pub job_version: u64,
    /// Every task, parents before children, siblings in position order
    pub tasks: Vec<NodeState>,
}

impl JobSnapshot {
    /// Find a node in the snapshot.
    pub fn node(&self, id: &TaskId) -> Option<&NodeState> {
        self.tasks.iter().find(|node| &node.id == id)
    }
}

/// A single-task mutation lost the race.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleVersion {
    /// Task whose version did not match
    pub task_id: TaskId,
    /// Version the caller supplied
    pub expected_version: u64,
    /// Version currently stored
    pub current_version: u64,
    /// Fresh state for rebasing
    pub snapshot: SiblingSnapshot,
}

/// Result of a single-task mutation.
#[must_use = "a conflict must be handled by rebasing on the returned snapshot"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The mutation was committed
    Committed(T),
    /// The caller's version was stale; nothing was written
    Conflict(Box<StaleVersion>),
}

impl<T> Outcome<T> {
    /// Returns `true` for a conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Outcome::Conflict(_))
    }

    /// The committed value, if any.
    pub fn committed(&self) -> Option<&T> {
        match self {
            Outcome::Committed(value) => Some(value),
            Outcome::Conflict(_) => None,
        }
    }

    /// The conflict report, if any.
    pub fn conflict(&self) -> Option<&StaleVersion> {
        match self {
            Outcome::Committed(_) => None,
            Outcome::Conflict(stale) => Some(stale),
        }
    }
}

/// Returned by a committed move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveSuccess {
    /// The moved task
    pub task_id: TaskId,
    /// Its version after the commit
    pub new_version: u64,
    /// Commit timestamp
    pub reordered_at: DateTime<Utc>,
    /// Its new parent
    pub parent_id: Option<TaskId>,
    /// Its new key
    pub position: PositionValue,
    /// Job version after the commit
    pub job_version: u64,
    /// Siblings whose keys were respaced to make room, with their new versions
    pub renumbered: Vec<TouchedNode>,
}

/// Returned by a committed delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSuccess {
    /// Every removed task, the requested one first
    pub removed: Vec<TaskId>,
    /// Job version after the commit
    pub job_version: u64,
}

/// A node whose version changed in a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TouchedNode {
    /// Task ID
    pub id: TaskId,
    /// Version after the commit
    pub new_version: u64,
}

/// Returned by a committed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSuccess {
    /// Job version after the commit
    pub new_job_version: u64,
    /// Every node whose version was bumped, in first-touch order
    pub touched: Vec<TouchedNode>,
}

/// Why a batch was rejected as stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchConflictReason {
    /// The job changed since the caller loaded it
    JobVersion {
        /// Supplied job version
        expected: u64,
        /// Stored job version
        current: u64,
    },
    /// One task changed since the caller loaded it
    TaskVersion {
        /// The stale task
        task_id: TaskId,
        /// Supplied version
        expected: u64,
        /// Stored version
        current: u64,
    },
}

/// A batch lost the race; carries the whole job for rebasing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConflict {
    /// First mismatch found
    pub reason: BatchConflictReason,
    /// Every task of the job with its current version
    pub snapshot: JobSnapshot,
}

/// Result of a batch reorder.
#[must_use = "a conflict must be handled by rebasing on the returned snapshot"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every operation was committed
    Committed(BatchSuccess),
    /// Nothing was written
    Conflict(Box<BatchConflict>),
}

impl BatchOutcome {
    /// Returns `true` for a conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, BatchOutcome::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty("", false)]
    #[case::blank("   ", false)]
    #[case::ok("Write report", true)]
    #[case::max(&"x".repeat(MAX_TITLE_LENGTH), true)]
    #[case::too_long(&"x".repeat(MAX_TITLE_LENGTH + 1), false)]
    fn test_validate_title(#[case] title: &str, #[case] valid: bool) {
        assert_eq!(validate_title(title).is_ok(), valid);
    }

    #[test]
    fn test_move_op_parent_serde_distinguishes_root_from_absent() {
        let keep: MoveOp =
            serde_json::from_str(r#"{"task_id":"a","target":"last"}"#).unwrap();
        assert_eq!(keep.new_parent, None);

        let root: MoveOp =
            serde_json::from_str(r#"{"task_id":"a","target":"first","new_parent":null}"#)
                .unwrap();
        assert_eq!(root.new_parent, Some(None));

        let under: MoveOp = serde_json::from_str(
            r#"{"task_id":"a","target":{"after":"b"},"new_parent":"p","expected_version":3}"#,
        )
        .unwrap();
        assert_eq!(under.new_parent, Some(Some(TaskId::new("p"))));
        assert_eq!(under.target, PositionTarget::After(TaskId::new("b")));
        assert_eq!(under.expected_version, Some(3));
    }

    #[test]
    fn test_task_update_classification() {
        assert!(TaskUpdate::default().is_empty());

        let status_only = TaskUpdate {
            status: Some(TaskStatus::Paused),
            ..Default::default()
        };
        assert!(!status_only.is_empty());
        assert!(!status_only.is_structural());

        let move_only = TaskUpdate {
            target: Some(PositionTarget::First),
            ..Default::default()
        };
        assert!(move_only.is_structural());
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(TaskStatus::default(), TaskStatus::New);
    }
}
