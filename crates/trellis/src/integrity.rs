//! Tree integrity guard.
//!
//! Decides whether a reparent is legal and what it does to the cached
//! `subtree_count`s, before anything is written. Also provides a full-job
//! verifier used by tests, the `verify` command and the JSONL loader.
//!
//! Everything here reads a [`JobTree`] and returns a decision; nothing writes.

use crate::domain::{JobId, TaskId};
use crate::error::{Error, Result};
use crate::tree::JobTree;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// A proposed parent, resolved against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentRef {
    /// Move to the job root
    Root,
    /// A task of the same job
    Local(TaskId),
    /// A task that exists but belongs to another job
    Foreign {
        /// The proposed parent
        id: TaskId,
        /// The job it belongs to
        job: JobId,
    },
}

/// A validated reparent and the count adjustments it requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reparent {
    /// The task being moved
    pub task_id: TaskId,
    /// Its parent before the move
    pub old_parent: Option<TaskId>,
    /// Its parent after the move
    pub new_parent: Option<TaskId>,
    /// The task plus its descendants
    pub moved: u64,
    /// Net `subtree_count` change per ancestor; ancestors shared by both
    /// chains cancel out and are omitted
    pub count_deltas: Vec<(TaskId, i64)>,
}

/// Validate moving `task_id` under `parent`.
///
/// # Errors
///
/// - `TaskNotFound` if the task or a local parent is unknown
/// - `CrossJobReparent` if the parent belongs to another job
/// - `Cycle` if the parent is the task itself or one of its descendants
pub fn check_reparent(tree: &JobTree, task_id: &TaskId, parent: &ParentRef) -> Result<Reparent> {
    let node = tree
        .get(task_id)
        .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;

    let new_parent = match parent {
        ParentRef::Root => None,
        ParentRef::Foreign { job, .. } => {
            return Err(Error::CrossJobReparent {
                task: task_id.clone(),
                task_job: node.job_id.clone(),
                parent_job: job.clone(),
            });
        }
        ParentRef::Local(parent_id) => {
            let parent_node = tree
                .get(parent_id)
                .ok_or_else(|| Error::TaskNotFound(parent_id.clone()))?;
            if parent_node.job_id != node.job_id {
                return Err(Error::CrossJobReparent {
                    task: task_id.clone(),
                    task_job: node.job_id.clone(),
                    parent_job: parent_node.job_id.clone(),
                });
            }
            if tree.is_self_or_ancestor(task_id, parent_id) {
                return Err(Error::Cycle {
                    task: task_id.clone(),
                    proposed_parent: parent_id.clone(),
                });
            }
            Some(parent_id.clone())
        }
    };

    let moved = node.subtree_count + 1;
    let old_parent = node.parent_id.clone();
    let count_deltas = if old_parent == new_parent {
        Vec::new()
    } else {
        count_deltas(tree, old_parent.as_ref(), new_parent.as_ref(), moved)?
    };

    Ok(Reparent {
        task_id: task_id.clone(),
        old_parent,
        new_parent,
        moved,
        count_deltas,
    })
}

fn chain(tree: &JobTree, start: Option<&TaskId>) -> Result<Vec<TaskId>> {
    match start {
        None => Ok(Vec::new()),
        Some(id) => {
            let mut chain = vec![id.clone()];
            chain.extend(tree.ancestors(id)?);
            Ok(chain)
        }
    }
}

fn count_deltas(
    tree: &JobTree,
    old_parent: Option<&TaskId>,
    new_parent: Option<&TaskId>,
    moved: u64,
) -> Result<Vec<(TaskId, i64)>> {
    let moved = i64::try_from(moved)
        .map_err(|_| Error::InvariantViolation(format!("subtree of {moved} nodes")))?;
    let mut order = Vec::new();
    let mut deltas: HashMap<TaskId, i64> = HashMap::new();

    for ancestor in chain(tree, old_parent)? {
        order.push(ancestor.clone());
        *deltas.entry(ancestor).or_default() -= moved;
    }
    for ancestor in chain(tree, new_parent)? {
        if !deltas.contains_key(&ancestor) {
            order.push(ancestor.clone());
        }
        *deltas.entry(ancestor).or_default() += moved;
    }

    Ok(order
        .into_iter()
        .filter_map(|id| {
            let delta = deltas[&id];
            (delta != 0).then_some((id, delta))
        })
        .collect())
}

/// A broken tree invariant found by [`verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// The parent graph has a cycle through this task
    Cycle {
        /// A task on the cycle
        task: TaskId,
    },
    /// Two siblings share a key
    DuplicatePosition {
        /// The scope
        parent: Option<TaskId>,
        /// The shared key
        position: i64,
    },
    /// Cached descendant count differs from the real one
    SubtreeCount {
        /// The task
        task: TaskId,
        /// Cached value
        cached: u64,
        /// Real value
        actual: u64,
    },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Cycle { task } => write!(f, "{task} is on a parent cycle"),
            Violation::DuplicatePosition { parent, position } => match parent {
                Some(parent) => write!(f, "duplicate position {position} under {parent}"),
                None => write!(f, "duplicate position {position} at the root"),
            },
            Violation::SubtreeCount {
                task,
                cached,
                actual,
            } => write!(f, "{task} caches subtree_count {cached}, actual {actual}"),
        }
    }
}

/// Count the real descendants of every task by walking parent chains.
///
/// Tasks on a cycle still get a count for the part of the chain before it
/// repeats; [`verify`] reports the cycle itself.
pub fn actual_subtree_counts(tree: &JobTree) -> HashMap<TaskId, u64> {
    let mut counts: HashMap<TaskId, u64> = tree.nodes().map(|n| (n.id.clone(), 0)).collect();

    for node in tree.nodes() {
        let mut seen = HashSet::new();
        let mut current = node.parent_id.clone();
        while let Some(parent) = current {
            if !seen.insert(parent.clone()) {
                break;
            }
            let Some(count) = counts.get_mut(&parent) else {
                break;
            };
            *count += 1;
            current = tree.get(&parent).and_then(|p| p.parent_id.clone());
        }
    }

    counts
}

/// Check every invariant of a job's tree.
///
/// Returns all violations found; an empty vector means the tree is sound.
pub fn verify(tree: &JobTree) -> Vec<Violation> {
    let mut violations = Vec::new();

    let mut cyclic: Vec<TaskId> = tree
        .nodes()
        .filter(|n| tree.ancestors(&n.id).is_err())
        .filter(|n| {
            n.parent_id
                .as_ref()
                .is_some_and(|p| tree.contains(p) && tree.is_self_or_ancestor(&n.id, p))
        })
        .map(|n| n.id.clone())
        .collect();
    cyclic.sort();
    violations.extend(cyclic.into_iter().map(|task| Violation::Cycle { task }));

    let mut scopes: HashMap<Option<&TaskId>, Vec<i64>> = HashMap::new();
    for node in tree.nodes() {
        scopes
            .entry(node.parent_id.as_ref())
            .or_default()
            .push(node.position.get());
    }
    let mut duplicates = Vec::new();
    for (parent, mut keys) in scopes {
        keys.sort_unstable();
        keys.dedup_by(|a, b| {
            if a == b {
                duplicates.push(Violation::DuplicatePosition {
                    parent: parent.cloned(),
                    position: *a,
                });
            }
            a == b
        });
    }
    duplicates.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
    duplicates.dedup();
    violations.extend(duplicates);

    let actual = actual_subtree_counts(tree);
    let mut counts: Vec<Violation> = tree
        .nodes()
        .filter_map(|n| {
            let real = actual.get(&n.id).copied().unwrap_or_default();
            (real != n.subtree_count).then(|| Violation::SubtreeCount {
                task: n.id.clone(),
                cached: n.subtree_count,
                actual: real,
            })
        })
        .collect();
    counts.sort_by(|a, b| a.to_string().cmp(&b.to_string()));
    violations.extend(counts);

    violations
}
