//! Key-state allocation of keyed operators.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::{Error, Result};

/// A key group: the unit of keyed-state ownership.
pub type KeyGroup = u32;

/// Index of a parallel task instance of an operator.
pub type TaskIndex = usize;

/// Mapping from task index to the key groups that task owns.
///
/// Within a task the key groups are kept sorted. The allocation does not
/// enforce that task key sets are disjoint or cover the key space; use
/// [`KeyStateAllocation::validate_partition`] where that matters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStateAllocation(BTreeMap<TaskIndex, Vec<KeyGroup>>);

impl KeyStateAllocation {
    /// Create an empty allocation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an allocation from explicit per-task key sets.
    pub fn from_tasks<I, K>(tasks: I) -> Self
    where
        I: IntoIterator<Item = (TaskIndex, K)>,
        K: IntoIterator<Item = KeyGroup>,
    {
        let mut allocation = Self::new();
        for (task, keys) in tasks {
            allocation.set_task_keys(task, keys);
        }
        allocation
    }

    /// Contiguous ranges over `num_key_groups`, the default assignment of a
    /// freshly deployed keyed operator.
    pub fn contiguous(parallelism: usize, num_key_groups: u32) -> Self {
        let mut allocation = Self::new();
        if parallelism == 0 {
            return allocation;
        }
        let max = num_key_groups as usize;
        for task in 0..parallelism {
            let start = (task * max).div_ceil(parallelism);
            let end = ((task + 1) * max).div_ceil(parallelism);
            allocation.set_task_keys(task, (start as u32)..(end as u32));
        }
        allocation
    }

    /// Round-robin assignment of `num_key_groups` over `parallelism` tasks.
    pub fn round_robin(parallelism: usize, num_key_groups: u32) -> Self {
        let mut tasks: BTreeMap<TaskIndex, Vec<KeyGroup>> = BTreeMap::new();
        if parallelism == 0 {
            return Self::new();
        }
        for key in 0..num_key_groups {
            tasks.entry(key as usize % parallelism).or_default().push(key);
        }
        Self(tasks)
    }

    /// Replace the key set of one task.
    pub fn set_task_keys(&mut self, task: TaskIndex, keys: impl IntoIterator<Item = KeyGroup>) {
        let mut keys: Vec<KeyGroup> = keys.into_iter().collect();
        keys.sort_unstable();
        keys.dedup();
        self.0.insert(task, keys);
    }

    /// Key groups owned by `task`, if the task exists.
    pub fn keys_of(&self, task: TaskIndex) -> Option<&[KeyGroup]> {
        self.0.get(&task).map(Vec::as_slice)
    }

    /// Number of tasks in the allocation.
    pub fn parallelism(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate `(task, keys)` in task order.
    pub fn iter(&self) -> impl Iterator<Item = (TaskIndex, &[KeyGroup])> {
        self.0.iter().map(|(task, keys)| (*task, keys.as_slice()))
    }

    /// All key groups of all tasks, sorted and deduplicated.
    pub fn key_space(&self) -> BTreeSet<KeyGroup> {
        self.0.values().flatten().copied().collect()
    }

    /// Task owning `key`, if any.
    pub fn owner_of(&self, key: KeyGroup) -> Option<TaskIndex> {
        self.0
            .iter()
            .find(|(_, keys)| keys.binary_search(&key).is_ok())
            .map(|(task, _)| *task)
    }

    /// Check that task indices are dense (`0..parallelism`), that no key group
    /// is owned twice and that the union of key sets equals `key_space`.
    pub fn validate_partition(&self, key_space: &BTreeSet<KeyGroup>) -> Result<()> {
        for (expected, task) in self.0.keys().enumerate() {
            if *task != expected {
                return Err(Error::InvalidAllocation(format!(
                    "task indices must be dense, missing task {}",
                    expected
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for (task, keys) in &self.0 {
            for key in keys {
                if !seen.insert(*key) {
                    return Err(Error::InvalidAllocation(format!(
                        "key group {} is assigned twice (again to task {})",
                        key, task
                    )));
                }
            }
        }

        if &seen != key_space {
            let missing: Vec<_> = key_space.difference(&seen).copied().collect();
            let foreign: Vec<_> = seen.difference(key_space).copied().collect();
            return Err(Error::InvalidAllocation(format!(
                "key groups do not match the operator key space (missing {:?}, foreign {:?})",
                missing, foreign
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_covers_key_space() {
        let allocation = KeyStateAllocation::contiguous(3, 10);
        assert_eq!(allocation.parallelism(), 3);
        assert_eq!(allocation.keys_of(0), Some(&[0, 1, 2, 3][..]));
        assert_eq!(allocation.keys_of(1), Some(&[4, 5, 6][..]));
        assert_eq!(allocation.keys_of(2), Some(&[7, 8, 9][..]));
        assert_eq!(allocation.key_space(), (0..10).collect());
    }

    #[test]
    fn test_round_robin() {
        let allocation = KeyStateAllocation::round_robin(2, 5);
        assert_eq!(allocation.keys_of(0), Some(&[0, 2, 4][..]));
        assert_eq!(allocation.keys_of(1), Some(&[1, 3][..]));
        assert_eq!(allocation.owner_of(3), Some(1));
        assert_eq!(allocation.owner_of(9), None);
    }

    #[test]
    fn test_task_keys_are_sorted() {
        let allocation = KeyStateAllocation::from_tasks([(0, vec![5, 1, 3, 1])]);
        assert_eq!(allocation.keys_of(0), Some(&[1, 3, 5][..]));
    }

    #[test]
    fn test_validate_partition() {
        let space: BTreeSet<KeyGroup> = (0..10).collect();

        let ok = KeyStateAllocation::from_tasks([(0, 0..7), (1, 7..10)]);
        assert!(ok.validate_partition(&space).is_ok());

        let overlapping = KeyStateAllocation::from_tasks([(0, 0..7), (1, 6..10)]);
        assert!(matches!(
            overlapping.validate_partition(&space),
            Err(Error::InvalidAllocation(_))
        ));

        let incomplete = KeyStateAllocation::from_tasks([(0, 0..5), (1, 6..10)]);
        assert!(incomplete.validate_partition(&space).is_err());

        let sparse = KeyStateAllocation::from_tasks([(0, 0..5), (2, 5..10)]);
        assert!(sparse.validate_partition(&space).is_err());
    }
}
