//! In-transaction working copy of one job's task tree.
//!
//! A [`JobTree`] is built from the rows a [`JobTransaction`](crate::storage::JobTransaction)
//! read under the job's lock. Operations mutate the copy freely; nothing
//! reaches storage until [`JobTree::into_change_set`] is committed, so
//! returning early on any error leaves stored state untouched.
//!
//! # Graph Representation
//!
//! The parent relation is mirrored in a petgraph `StableDiGraph` with edges
//! directed **child -> parent**. A path from `x` to `y` therefore means `y`
//! is an ancestor of `x`. `StableDiGraph` keeps node indices valid across
//! deletes, so `node_map` never needs rebuilding.
//!
//! # Version Bookkeeping
//!
//! Every node records the strongest [`Touch`] it received. On commit each
//! node touched by a real mutation gets exactly `original + 1`, however many
//! operations touched it; cache-only touches (`subtree_count`) keep the
//! version.

use crate::domain::{
    JobId, JobSnapshot, NodeState, PositionTarget, PositionValue, ScopeSnapshot, TaskId, TaskNode,
};
use crate::error::{Error, Result};
use crate::integrity::{self, ParentRef};
use crate::position::{PositionEngine, Renumbering, Sibling};
use crate::storage::{ChangeSet, RowDelete, RowUpdate};
use chrono::{DateTime, Utc};
use petgraph::algo;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::HashMap;

/// How strongly a node was modified in the current transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Touch {
    /// Only the `subtree_count` cache changed; no version bump
    Cache,
    /// Title or assignee changed
    Field,
    /// Position, parent or status changed; also refreshes `reordered_at`
    Reordered,
}

/// Mutable copy of one job's tree, valid for the lifetime of one transaction.
#[derive(Debug, Clone)]
pub struct JobTree {
    job_id: JobId,
    job_version: u64,
    nodes: HashMap<TaskId, TaskNode>,
    graph: StableDiGraph<TaskId, ()>,
    node_map: HashMap<TaskId, NodeIndex>,
    original_versions: HashMap<TaskId, u64>,
    touches: HashMap<TaskId, Touch>,
    touch_order: Vec<TaskId>,
    inserted: Vec<TaskId>,
    removed: Vec<(TaskId, u64)>,
    structure_changed: bool,
}

impl JobTree {
    /// Build the working copy from stored rows.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` if a row belongs to another job or names a parent
    /// that is not among `rows`.
    pub fn new(
        job_id: JobId,
        job_version: u64,
        rows: impl IntoIterator<Item = TaskNode>,
    ) -> Result<Self> {
        let mut tree = Self {
            job_id,
            job_version,
            nodes: HashMap::new(),
            graph: StableDiGraph::new(),
            node_map: HashMap::new(),
            original_versions: HashMap::new(),
            touches: HashMap::new(),
            touch_order: Vec::new(),
            inserted: Vec::new(),
            removed: Vec::new(),
            structure_changed: false,
        };

        for row in rows {
            if row.job_id != tree.job_id {
                return Err(Error::InvariantViolation(format!(
                    "task {} of job {} loaded into job {}",
                    row.id, row.job_id, tree.job_id
                )));
            }
            let index = tree.graph.add_node(row.id.clone());
            tree.node_map.insert(row.id.clone(), index);
            tree.original_versions.insert(row.id.clone(), row.version);
            tree.nodes.insert(row.id.clone(), row);
        }

        let edges: Vec<(TaskId, TaskId)> = tree
            .nodes
            .values()
            .filter_map(|n| n.parent_id.clone().map(|p| (n.id.clone(), p)))
            .collect();
        for (child, parent) in edges {
            let Some(&parent_index) = tree.node_map.get(&parent) else {
                return Err(Error::InvariantViolation(format!(
                    "task {child} names missing parent {parent}"
                )));
            };
            tree.graph.add_edge(tree.node_map[&child], parent_index, ());
        }

        Ok(tree)
    }

    /// The job this tree belongs to.
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Job version as read at transaction start.
    pub fn job_version(&self) -> u64 {
        self.job_version
    }

    /// Number of tasks in the job.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the job has no tasks.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a task.
    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    /// Returns `true` if the task is in this job.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Iterate over every task, in no particular order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.values()
    }

    /// Version of a task as stored before this transaction.
    pub fn original_version(&self, id: &TaskId) -> Option<u64> {
        self.original_versions.get(id).copied()
    }

    /// Children of `parent` (`None` for roots) in position order.
    pub fn children(&self, parent: Option<&TaskId>) -> Vec<&TaskNode> {
        let mut children: Vec<&TaskNode> = match parent {
            None => self.nodes.values().filter(|n| n.parent_id.is_none()).collect(),
            Some(parent) => match self.node_map.get(parent) {
                Some(&index) => self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .filter_map(|child| self.nodes.get(&self.graph[child]))
                    .collect(),
                None => Vec::new(),
            },
        };
        children.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        children
    }

    /// Siblings in scope `parent`, optionally leaving one task out.
    pub fn siblings(&self, parent: Option<&TaskId>, exclude: Option<&TaskId>) -> Vec<Sibling> {
        self.children(parent)
            .into_iter()
            .filter(|n| Some(&n.id) != exclude)
            .map(|n| Sibling::new(n.id.clone(), n.position))
            .collect()
    }

    /// Ancestors of `id`, nearest first.
    ///
    /// # Errors
    ///
    /// `TaskNotFound` for an unknown task, `InvariantViolation` if the parent
    /// chain loops.
    pub fn ancestors(&self, id: &TaskId) -> Result<Vec<TaskId>> {
        let mut current = self
            .nodes
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        let mut chain = Vec::new();

        while let Some(parent_id) = &current.parent_id {
            if chain.len() >= self.nodes.len() {
                return Err(Error::InvariantViolation(format!(
                    "parent chain of {id} does not terminate"
                )));
            }
            chain.push(parent_id.clone());
            current = self.nodes.get(parent_id).ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "task {} names missing parent {parent_id}",
                    current.id
                ))
            })?;
        }

        Ok(chain)
    }

    /// Returns `true` if `ancestor` is `id` itself or lies on its parent chain.
    pub fn is_self_or_ancestor(&self, ancestor: &TaskId, id: &TaskId) -> bool {
        match (self.node_map.get(id), self.node_map.get(ancestor)) {
            (Some(&from), Some(&to)) => algo::has_path_connecting(&self.graph, from, to, None),
            _ => false,
        }
    }

    /// Returns `true` if the parent graph contains a cycle.
    pub fn has_cycle(&self) -> bool {
        algo::is_cyclic_directed(&self.graph)
    }

    /// Every descendant of `id`, parents before children.
    pub fn descendants(&self, id: &TaskId) -> Vec<TaskId> {
        let mut result = Vec::new();
        let mut stack: Vec<TaskId> = self
            .children(Some(id))
            .into_iter()
            .rev()
            .map(|n| n.id.clone())
            .collect();

        while let Some(next) = stack.pop() {
            stack.extend(self.children(Some(&next)).into_iter().rev().map(|n| n.id.clone()));
            result.push(next);
        }

        result
    }

    /// Every task in depth-first order, siblings by position.
    pub fn pre_order(&self) -> Vec<&TaskNode> {
        let mut result = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<&TaskNode> = self.children(None).into_iter().rev().collect();

        while let Some(node) = stack.pop() {
            if result.len() > self.nodes.len() {
                break;
            }
            stack.extend(self.children(Some(&node.id)).into_iter().rev());
            result.push(node);
        }

        result
    }

    /// Current state of one sibling scope.
    pub fn scope_snapshot(&self, parent: Option<&TaskId>) -> ScopeSnapshot {
        ScopeSnapshot {
            parent_id: parent.cloned(),
            siblings: self.children(parent).into_iter().map(TaskNode::state).collect(),
        }
    }

    /// Current state of the whole job.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id.clone(),
            job_version: self.job_version,
            tasks: self
                .pre_order()
                .into_iter()
                .map(TaskNode::state)
                .collect::<Vec<NodeState>>(),
        }
    }

    // ========== Mutations ==========

    fn node_mut(&mut self, id: &TaskId) -> Result<&mut TaskNode> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    /// Record that `id` was modified at least as strongly as `touch`.
    pub fn touch(&mut self, id: &TaskId, touch: Touch) {
        match self.touches.get_mut(id) {
            Some(existing) => *existing = (*existing).max(touch),
            None => {
                self.touches.insert(id.clone(), touch);
                self.touch_order.push(id.clone());
            }
        }
    }

    /// Apply `f` to a task and record the touch.
    pub fn modify(
        &mut self,
        id: &TaskId,
        touch: Touch,
        f: impl FnOnce(&mut TaskNode),
    ) -> Result<()> {
        f(self.node_mut(id)?);
        self.touch(id, touch);
        Ok(())
    }

    fn set_position(&mut self, id: &TaskId, position: PositionValue) -> Result<()> {
        self.modify(id, Touch::Reordered, |node| node.position = position)?;
        self.structure_changed = true;
        Ok(())
    }

    fn set_parent(&mut self, id: &TaskId, parent: Option<TaskId>) -> Result<()> {
        let child_index = *self
            .node_map
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        let old_edges: Vec<_> = self
            .graph
            .edges_directed(child_index, Direction::Outgoing)
            .map(|e| e.id())
            .collect();
        for edge in old_edges {
            self.graph.remove_edge(edge);
        }
        if let Some(parent_id) = &parent {
            let parent_index = *self
                .node_map
                .get(parent_id)
                .ok_or_else(|| Error::TaskNotFound(parent_id.clone()))?;
            self.graph.add_edge(child_index, parent_index, ());
        }

        self.modify(id, Touch::Reordered, |node| node.parent_id = parent)?;
        self.structure_changed = true;
        Ok(())
    }

    fn add_subtree_count(&mut self, id: &TaskId, delta: i64) -> Result<()> {
        let node = self.node_mut(id)?;
        let updated = i64::try_from(node.subtree_count)
            .ok()
            .and_then(|count| count.checked_add(delta))
            .and_then(|count| u64::try_from(count).ok())
            .ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "subtree_count of {id} would become negative ({} {delta:+})",
                    node.subtree_count
                ))
            })?;
        node.subtree_count = updated;
        self.touch(id, Touch::Cache);
        Ok(())
    }

    fn apply_renumbering(&mut self, renumbered: &[Renumbering]) -> Result<()> {
        for r in renumbered {
            self.set_position(&r.id, r.to)?;
        }
        Ok(())
    }

    /// Move `id` to `target`, optionally under a new parent.
    ///
    /// Validation (integrity guard, then position engine) completes before
    /// the first write to the working copy, so an error leaves it unchanged.
    /// Returns the siblings renumbered to make room.
    pub fn move_node(
        &mut self,
        positions: &PositionEngine,
        id: &TaskId,
        target: &PositionTarget,
        new_parent: Option<&ParentRef>,
    ) -> Result<Vec<Renumbering>> {
        let current_parent = self
            .get(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?
            .parent_id
            .clone();

        let reparent = match new_parent {
            Some(parent) => Some(integrity::check_reparent(self, id, parent)?),
            None => None,
        };
        let destination = reparent
            .as_ref()
            .map_or(current_parent, |r| r.new_parent.clone());

        let siblings = self.siblings(destination.as_ref(), Some(id));
        let placement = positions.place(&siblings, target, destination.as_ref())?;

        if let Some(reparent) = reparent {
            self.set_parent(id, reparent.new_parent.clone())?;
            for (ancestor, delta) in &reparent.count_deltas {
                self.add_subtree_count(ancestor, *delta)?;
            }
        }
        self.apply_renumbering(&placement.renumbered)?;
        self.set_position(id, placement.position)?;

        Ok(placement.renumbered)
    }

    /// Insert a new task at `target` under `parent`.
    ///
    /// `node.position`, `node.subtree_count` and `node.version` are overwritten.
    pub fn insert(
        &mut self,
        positions: &PositionEngine,
        mut node: TaskNode,
        target: &PositionTarget,
    ) -> Result<Vec<Renumbering>> {
        if self.nodes.contains_key(&node.id) {
            return Err(Error::InvariantViolation(format!(
                "task id {} already exists",
                node.id
            )));
        }
        if let Some(parent) = &node.parent_id {
            if !self.nodes.contains_key(parent) {
                return Err(Error::TaskNotFound(parent.clone()));
            }
        }

        let siblings = self.siblings(node.parent_id.as_ref(), None);
        let placement = positions.place(&siblings, target, node.parent_id.as_ref())?;
        let ancestors = match &node.parent_id {
            Some(parent) => {
                let mut chain = vec![parent.clone()];
                chain.extend(self.ancestors(parent)?);
                chain
            }
            None => Vec::new(),
        };

        self.apply_renumbering(&placement.renumbered)?;

        node.position = placement.position;
        node.subtree_count = 0;
        node.version = 0;
        let id = node.id.clone();
        let index = self.graph.add_node(id.clone());
        self.node_map.insert(id.clone(), index);
        if let Some(parent) = &node.parent_id {
            self.graph.add_edge(index, self.node_map[parent], ());
        }
        self.nodes.insert(id.clone(), node);
        self.inserted.push(id);
        self.structure_changed = true;

        for ancestor in &ancestors {
            self.add_subtree_count(ancestor, 1)?;
        }

        Ok(placement.renumbered)
    }

    /// Remove `id` and its whole subtree; returns removed ids, `id` first.
    ///
    /// Callers enforce the delete policy before calling.
    pub fn remove_subtree(&mut self, id: &TaskId) -> Result<Vec<TaskId>> {
        let ancestors = self.ancestors(id)?;
        let mut removed = vec![id.clone()];
        removed.extend(self.descendants(id));
        let count = i64::try_from(removed.len()).unwrap_or(i64::MAX);

        for ancestor in &ancestors {
            self.add_subtree_count(ancestor, -count)?;
        }

        for task in &removed {
            if let Some(index) = self.node_map.remove(task) {
                self.graph.remove_node(index);
            }
            self.nodes.remove(task);
            self.touches.remove(task);
            self.touch_order.retain(|t| t != task);
            self.inserted.retain(|t| t != task);
            if let Some(version) = self.original_versions.get(task) {
                self.removed.push((task.clone(), *version));
            }
        }
        self.structure_changed = true;

        Ok(removed)
    }

    /// Turn the accumulated modifications into a storage change set.
    ///
    /// Touched rows get `version = original + 1` (cache-only touches keep
    /// theirs) and `updated_at = now`; reordered rows also get
    /// `reordered_at = now`. The job version advances by one if any
    /// position, parent, insert or delete happened.
    pub fn into_change_set(self, now: DateTime<Utc>) -> ChangeSet {
        let mut nodes = self.nodes;
        let mut updates = Vec::new();

        for id in &self.touch_order {
            if self.inserted.contains(id) {
                continue;
            }
            let (Some(mut node), Some(&prior_version)) =
                (nodes.remove(id), self.original_versions.get(id))
            else {
                continue;
            };
            let touch = self.touches[id];
            if touch >= Touch::Field {
                node.version = prior_version + 1;
                node.updated_at = now;
            }
            if touch == Touch::Reordered {
                node.reordered_at = now;
            }
            updates.push(RowUpdate { node, prior_version });
        }

        let inserts = self
            .inserted
            .iter()
            .filter_map(|id| nodes.remove(id))
            .collect();

        let deletes = self
            .removed
            .into_iter()
            .map(|(id, prior_version)| RowDelete { id, prior_version })
            .collect();

        ChangeSet {
            job_id: self.job_id,
            base_job_version: self.job_version,
            new_job_version: self.job_version + u64::from(self.structure_changed),
            inserts,
            updates,
            deletes,
        }
    }
}
