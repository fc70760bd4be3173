//! Position engine: sparse sibling keys with local renumbering.
//!
//! Siblings are ordered by an `i64` key spaced `increment` apart. Inserting
//! between two siblings takes the integer midpoint of their keys, so a gap of
//! `increment` absorbs roughly `log2(increment)` insertions at the same spot.
//! When two neighbours become adjacent integers the engine renumbers the
//! contiguous run starting at the right neighbour, spacing it `increment`
//! apart, and stops as soon as the next untouched sibling is already beyond
//! the run. If a key would leave the `i64` range the whole scope is respaced
//! around zero instead.
//!
//! The engine is pure: it sees a slice of siblings and returns the key for the
//! inserted node plus every key it had to change. Applying those changes
//! (and bumping versions) is the caller's job.
//!
//! # Example
//!
//! ```
//! use trellis::domain::{PositionTarget, PositionValue, TaskId};
//! use trellis::position::{PositionEngine, Sibling};
//!
//! let engine = PositionEngine::new(1000);
//! let siblings = vec![
//!     Sibling::new(TaskId::new("a"), PositionValue::new(1000)),
//!     Sibling::new(TaskId::new("b"), PositionValue::new(2000)),
//! ];
//!
//! let placement = engine
//!     .place(&siblings, &PositionTarget::After(TaskId::new("a")), None)
//!     .unwrap();
//! assert_eq!(placement.position, PositionValue::new(1500));
//! assert!(placement.renumbered.is_empty());
//! ```

use crate::domain::{PositionTarget, PositionValue, TaskId};
use crate::error::{Error, Result};
use tracing::{debug, info};

/// Default spacing between sibling keys.
pub const DEFAULT_INCREMENT: i64 = 1000;

/// Smallest increment that still leaves a midpoint between fresh keys.
pub const MIN_INCREMENT: i64 = 2;

/// A sibling as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sibling {
    /// Sibling ID
    pub id: TaskId,
    /// Its current key
    pub position: PositionValue,
}

impl Sibling {
    /// Create a sibling entry
    pub fn new(id: TaskId, position: PositionValue) -> Self {
        Self { id, position }
    }
}

/// A key reassigned to make room for an insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Renumbering {
    /// The respaced sibling
    pub id: TaskId,
    /// Key before the pass
    pub from: PositionValue,
    /// Key after the pass
    pub to: PositionValue,
}

/// The computed key for an inserted or moved node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Key for the inserted node
    pub position: PositionValue,
    /// Sibling keys changed to make room; empty in the common case
    pub renumbered: Vec<Renumbering>,
}

/// Computes sibling keys for `First`/`Last`/`Before`/`After`/`Index` targets.
#[derive(Debug, Clone, Copy)]
pub struct PositionEngine {
    increment: i64,
}

impl Default for PositionEngine {
    fn default() -> Self {
        Self::new(DEFAULT_INCREMENT)
    }
}

impl PositionEngine {
    /// Create an engine with the given key spacing (raised to [`MIN_INCREMENT`]).
    pub fn new(increment: i64) -> Self {
        Self {
            increment: increment.max(MIN_INCREMENT),
        }
    }

    /// The key spacing.
    pub fn increment(&self) -> i64 {
        self.increment
    }

    /// Key for the first child of an empty scope.
    pub fn initial(&self) -> PositionValue {
        PositionValue(self.increment)
    }

    /// Fresh keys for a scope of `count` siblings: `increment`, `2 * increment`, ...
    ///
    /// # Errors
    ///
    /// `InvariantViolation` if the last key would leave the `i64` range.
    pub fn spaced(&self, count: usize) -> Result<Vec<PositionValue>> {
        (1..=count)
            .map(|rank| {
                i64::try_from(rank)
                    .ok()
                    .and_then(|rank| rank.checked_mul(self.increment))
                    .map(PositionValue)
                    .ok_or_else(|| {
                        Error::InvariantViolation(format!(
                            "cannot space {count} siblings with increment {}",
                            self.increment
                        ))
                    })
            })
            .collect()
    }

    /// Resolve `target` to an insertion slot in `0..=siblings.len()`.
    ///
    /// `siblings` must be in position order and must not contain the node
    /// being placed. `parent` only labels the error.
    ///
    /// # Errors
    ///
    /// `UnknownReferenceSibling` when `Before`/`After` names a task not in `siblings`.
    pub fn resolve_slot(
        &self,
        siblings: &[Sibling],
        target: &PositionTarget,
        parent: Option<&TaskId>,
    ) -> Result<usize> {
        let find = |id: &TaskId| {
            siblings
                .iter()
                .position(|s| &s.id == id)
                .ok_or_else(|| Error::UnknownReferenceSibling {
                    sibling: id.clone(),
                    parent: parent.cloned(),
                })
        };

        Ok(match target {
            PositionTarget::First => 0,
            PositionTarget::Last => siblings.len(),
            PositionTarget::Before(id) => find(id)?,
            PositionTarget::After(id) => find(id)? + 1,
            // 1-based; clamp rather than fail so a stale index still lands
            PositionTarget::Index(n) => n.saturating_sub(1).min(siblings.len()),
        })
    }

    /// Compute the key for a node placed at `target`.
    ///
    /// # Errors
    ///
    /// - `UnknownReferenceSibling` for a reference outside the scope
    /// - `InvariantViolation` if `siblings` are not strictly ordered, or the
    ///   scope is too large to respace within the key range
    pub fn place(
        &self,
        siblings: &[Sibling],
        target: &PositionTarget,
        parent: Option<&TaskId>,
    ) -> Result<Placement> {
        let slot = self.resolve_slot(siblings, target, parent)?;
        self.place_at(siblings, slot)
    }

    /// Compute the key for a node inserted at `slot`.
    pub fn place_at(&self, siblings: &[Sibling], slot: usize) -> Result<Placement> {
        if slot > siblings.len() {
            return Err(Error::InvariantViolation(format!(
                "slot {slot} is outside a scope of {} siblings",
                siblings.len()
            )));
        }
        if siblings
            .windows(2)
            .any(|pair| pair[0].position >= pair[1].position)
        {
            return Err(Error::InvariantViolation(
                "sibling positions are not strictly increasing".to_string(),
            ));
        }

        let mut keys: Vec<i64> = siblings.iter().map(|s| s.position.get()).collect();

        if let Some(key) = self.free_key(&keys, slot) {
            return Ok(Placement {
                position: PositionValue(key),
                renumbered: Vec::new(),
            });
        }

        // No room at the slot: respace, then retry the original insertion.
        let respaced = match self.local_run(&keys, slot) {
            Some(run) => {
                info!(
                    slot,
                    run_len = run.len(),
                    "Sibling keys exhausted, renumbering local run"
                );
                run
            }
            None => {
                info!(
                    slot,
                    siblings = keys.len(),
                    "Key range exhausted, renumbering whole scope"
                );
                self.full_respace(keys.len(), slot)?
            }
        };

        for &(index, key) in &respaced {
            keys[index] = key;
        }

        let key = self.free_key(&keys, slot).ok_or_else(|| {
            Error::InvariantViolation(format!("no free key at slot {slot} after renumbering"))
        })?;

        let renumbered = respaced
            .into_iter()
            .filter(|&(index, key)| siblings[index].position.get() != key)
            .map(|(index, key)| Renumbering {
                id: siblings[index].id.clone(),
                from: siblings[index].position,
                to: PositionValue(key),
            })
            .collect::<Vec<_>>();

        debug!(key, renumbered = renumbered.len(), "Placed after renumbering");

        Ok(Placement {
            position: PositionValue(key),
            renumbered,
        })
    }

    /// A key strictly between the neighbours of `slot`, if one exists.
    fn free_key(&self, keys: &[i64], slot: usize) -> Option<i64> {
        let before = slot.checked_sub(1).map(|i| keys[i]);
        let after = keys.get(slot).copied();

        match (before, after) {
            (None, None) => Some(self.increment),
            (None, Some(next)) => next.checked_sub(self.increment),
            (Some(prev), None) => prev.checked_add(self.increment),
            (Some(prev), Some(next)) => {
                let gap = i128::from(next) - i128::from(prev);
                if gap < 2 {
                    return None;
                }
                i64::try_from(i128::from(prev) + gap / 2).ok()
            }
        }
    }

    /// Respace the run starting at `slot` so that `keys[slot - 1] + increment` is free.
    ///
    /// Returns `(index, new_key)` pairs, or `None` when the slot is at an edge
    /// of the scope or the run would leave the key range.
    fn local_run(&self, keys: &[i64], slot: usize) -> Option<Vec<(usize, i64)>> {
        if slot == 0 || slot >= keys.len() {
            return None;
        }

        let base = keys[slot - 1];
        let mut next_key = base.checked_add(self.increment.checked_mul(2)?)?;
        let mut run = Vec::new();

        for (index, &old) in keys.iter().enumerate().skip(slot) {
            if old > run.last().map_or(base, |&(_, key)| key) && index > slot {
                break;
            }
            run.push((index, next_key));
            next_key = next_key.checked_add(self.increment)?;
        }

        Some(run)
    }

    /// Respace every sibling around zero, leaving `slot` free.
    fn full_respace(&self, len: usize, slot: usize) -> Result<Vec<(usize, i64)>> {
        let half = i128::try_from((len + 1) / 2).unwrap_or(i128::MAX);
        let step = i128::from(self.increment);

        (0..len)
            .map(|index| {
                let rank = if index < slot { index } else { index + 1 };
                let rank = i128::try_from(rank).unwrap_or(i128::MAX);
                let key = (rank - half)
                    .checked_mul(step)
                    .and_then(|k| i64::try_from(k).ok())
                    .ok_or_else(|| {
                        Error::InvariantViolation(format!(
                            "cannot respace {len} siblings with increment {}",
                            self.increment
                        ))
                    })?;
                Ok((index, key))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn scope(keys: &[i64]) -> Vec<Sibling> {
        keys.iter()
            .enumerate()
            .map(|(i, &k)| Sibling::new(TaskId::new(format!("t{i}")), PositionValue(k)))
            .collect()
    }

    #[rstest]
    #[case::first(PositionTarget::First, 0)]
    #[case::last(PositionTarget::Last, 3)]
    #[case::before_middle(PositionTarget::Before(TaskId::new("t1")), 1)]
    #[case::after_middle(PositionTarget::After(TaskId::new("t1")), 2)]
    #[case::after_last(PositionTarget::After(TaskId::new("t2")), 3)]
    #[case::index_one(PositionTarget::Index(1), 0)]
    #[case::index_two(PositionTarget::Index(2), 1)]
    #[case::index_zero_clamps(PositionTarget::Index(0), 0)]
    #[case::index_past_end_clamps(PositionTarget::Index(99), 3)]
    fn test_resolve_slot(#[case] target: PositionTarget, #[case] expected: usize) {
        let engine = PositionEngine::default();
        let siblings = scope(&[1000, 2000, 3000]);
        assert_eq!(engine.resolve_slot(&siblings, &target, None).unwrap(), expected);
    }

    #[test]
    fn test_unknown_reference_sibling() {
        let engine = PositionEngine::default();
        let siblings = scope(&[1000, 2000]);
        let parent = TaskId::new("p");

        let err = engine
            .place(&siblings, &PositionTarget::Before(TaskId::new("ghost")), Some(&parent))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownReferenceSibling { sibling, parent: Some(p) }
                if sibling.as_str() == "ghost" && p.as_str() == "p"
        ));
    }

    #[rstest]
    #[case::empty(&[], PositionTarget::Last, 1000)]
    #[case::first(&[1000, 2000], PositionTarget::First, 0)]
    #[case::last(&[1000, 2000], PositionTarget::Last, 3000)]
    #[case::between(&[1000, 2000], PositionTarget::Index(2), 1500)]
    #[case::odd_gap(&[1000, 1003], PositionTarget::Index(2), 1001)]
    fn test_place_without_renumbering(
        #[case] keys: &[i64],
        #[case] target: PositionTarget,
        #[case] expected: i64,
    ) {
        let engine = PositionEngine::default();
        let placement = engine.place(&scope(keys), &target, None).unwrap();
        assert_eq!(placement.position, PositionValue(expected));
        assert!(placement.renumbered.is_empty());
    }

    #[test]
    fn test_local_renumbering_stops_at_first_gap() {
        let engine = PositionEngine::new(10);
        // t0=100, t1=101 adjacent, t2=102 adjacent, t3=500 far away
        let siblings = scope(&[100, 101, 102, 500]);

        let placement = engine.place_at(&siblings, 1).unwrap();

        assert_eq!(placement.position, PositionValue(110));
        assert_eq!(
            placement.renumbered,
            vec![
                Renumbering {
                    id: TaskId::new("t1"),
                    from: PositionValue(101),
                    to: PositionValue(120),
                },
                Renumbering {
                    id: TaskId::new("t2"),
                    from: PositionValue(102),
                    to: PositionValue(130),
                },
            ]
        );
    }

    #[test]
    fn test_renumbering_at_top_of_range_respaces_scope() {
        let engine = PositionEngine::new(1000);
        let siblings = scope(&[i64::MAX - 1, i64::MAX]);

        let placement = engine.place(&siblings, &PositionTarget::Last, None).unwrap();

        assert_eq!(placement.renumbered.len(), 2);
        let new_keys: Vec<i64> = placement.renumbered.iter().map(|r| r.to.get()).collect();
        assert!(new_keys[0] < new_keys[1]);
        assert!(new_keys[1] < placement.position.get());
    }

    #[test]
    fn test_renumbering_at_bottom_of_range_respaces_scope() {
        let engine = PositionEngine::new(1000);
        let siblings = scope(&[i64::MIN, i64::MIN + 1]);

        let placement = engine.place(&siblings, &PositionTarget::First, None).unwrap();

        assert_eq!(placement.renumbered.len(), 2);
        assert!(placement.position.get() < placement.renumbered[0].to.get());
    }

    #[test]
    fn test_rejects_unordered_input() {
        let engine = PositionEngine::default();
        let err = engine.place_at(&scope(&[2000, 1000]), 1).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_repeated_insertion_at_same_spot_stays_ordered() {
        let engine = PositionEngine::new(1000);
        let mut siblings = scope(&[1000, 2000]);
        let mut renumber_passes = 0;

        for i in 0..1000 {
            let placement = engine.place_at(&siblings, 1).unwrap();
            if !placement.renumbered.is_empty() {
                renumber_passes += 1;
            }
            for r in &placement.renumbered {
                let s = siblings.iter_mut().find(|s| s.id == r.id).unwrap();
                s.position = r.to;
            }
            siblings.insert(1, Sibling::new(TaskId::new(format!("n{i}")), placement.position));
            assert!(siblings.windows(2).all(|w| w[0].position < w[1].position));
        }

        assert!(renumber_passes > 0);
        assert_eq!(siblings.first().unwrap().id, TaskId::new("t0"));
        assert_eq!(siblings.last().unwrap().id, TaskId::new("t1"));
        assert_eq!(siblings[1].id, TaskId::new("n999"));
    }

    proptest! {
        #[test]
        fn prop_placement_lands_strictly_between_neighbours(
            raw in proptest::collection::btree_set(-10_000i64..10_000, 0..20),
            slot_seed in 0usize..32,
            increment in 2i64..2000,
        ) {
            let keys: Vec<i64> = raw.into_iter().collect();
            let siblings = scope(&keys);
            let slot = slot_seed % (siblings.len() + 1);
            let engine = PositionEngine::new(increment);

            let placement = engine.place_at(&siblings, slot).unwrap();

            let mut after: Vec<(TaskId, i64)> = siblings
                .iter()
                .map(|s| {
                    let key = placement
                        .renumbered
                        .iter()
                        .find(|r| r.id == s.id)
                        .map_or(s.position.get(), |r| r.to.get());
                    (s.id.clone(), key)
                })
                .collect();
            after.insert(slot, (TaskId::new("new"), placement.position.get()));

            // Strictly increasing, and the original relative order is kept.
            prop_assert!(after.windows(2).all(|w| w[0].1 < w[1].1));
            let order: Vec<&TaskId> = after
                .iter()
                .map(|(id, _)| id)
                .filter(|id| id.as_str() != "new")
                .collect();
            let original: Vec<&TaskId> = siblings.iter().map(|s| &s.id).collect();
            prop_assert_eq!(order, original);
        }
    }
}
