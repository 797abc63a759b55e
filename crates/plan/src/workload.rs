//! Workload assignment of a keyed operator across its parallel tasks.
//!
//! Key groups moved between tasks are generally not contiguous. The runtime
//! therefore works on an *aligned* key-group order: the key groups of task 0,
//! then those of task 1, and so on, each task's keys sorted. Every task owns a
//! contiguous slice of that order, its [`AlignedKeyGroupRange`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::keys::{KeyGroup, KeyStateAllocation, TaskIndex};
use crate::{Error, Result};

/// A contiguous half-open range of key groups `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyGroupRange {
    pub start: KeyGroup,
    pub end: KeyGroup,
}

impl KeyGroupRange {
    pub fn new(start: KeyGroup, end: KeyGroup) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, key: KeyGroup) -> bool {
        key >= self.start && key < self.end
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The slice of the aligned key-group order owned by one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignedKeyGroupRange {
    /// Start position in the aligned order.
    pub start: usize,
    /// End position (exclusive) in the aligned order.
    pub end: usize,
    key_groups: Vec<KeyGroup>,
}

impl AlignedKeyGroupRange {
    fn new(start: usize, key_groups: Vec<KeyGroup>) -> Self {
        Self {
            start,
            end: start + key_groups.len(),
            key_groups,
        }
    }

    /// Key groups covered by this range, sorted.
    pub fn key_groups(&self) -> &[KeyGroup] {
        &self.key_groups
    }

    pub fn contains(&self, key: KeyGroup) -> bool {
        self.key_groups.binary_search(&key).is_ok()
    }

    pub fn len(&self) -> usize {
        self.key_groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_groups.is_empty()
    }

    /// The equivalent plain range, when the key groups happen to be contiguous.
    pub fn as_contiguous(&self) -> Option<KeyGroupRange> {
        let first = *self.key_groups.first()?;
        let last = *self.key_groups.last()?;
        if (last - first) as usize + 1 == self.key_groups.len() {
            Some(KeyGroupRange::new(first, last + 1))
        } else {
            None
        }
    }
}

/// Old and new key-state allocation of one operator, projected onto aligned
/// ranges with a per-task "modified" flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorWorkloadsAssignment {
    old: KeyStateAllocation,
    new: KeyStateAllocation,
    ranges: Vec<AlignedKeyGroupRange>,
    modified: Vec<bool>,
    owners: BTreeMap<KeyGroup, TaskIndex>,
}

impl OperatorWorkloadsAssignment {
    /// Assignment moving an operator from `old` to `new`.
    ///
    /// The tasks of `new` must be numbered `0..parallelism` and must not share
    /// key groups. A task is modified when its key set differs from the one it
    /// had under `old`, including tasks that did not exist before.
    pub fn new(old: KeyStateAllocation, new: KeyStateAllocation) -> Result<Self> {
        let mut ranges = Vec::with_capacity(new.parallelism());
        let mut modified = Vec::with_capacity(new.parallelism());
        let mut owners = BTreeMap::new();
        let mut offset = 0;

        for (expected, (task, keys)) in new.iter().enumerate() {
            if task != expected {
                return Err(Error::InvalidAllocation(format!(
                    "task indices must be dense, missing task {}",
                    expected
                )));
            }
            for key in keys {
                if let Some(previous) = owners.insert(*key, task) {
                    return Err(Error::InvalidAllocation(format!(
                        "key group {} assigned to both task {} and task {}",
                        key, previous, task
                    )));
                }
            }
            modified.push(old.keys_of(task) != Some(keys));
            let range = AlignedKeyGroupRange::new(offset, keys.to_vec());
            offset = range.end;
            ranges.push(range);
        }

        Ok(Self {
            old,
            new,
            ranges,
            modified,
            owners,
        })
    }

    /// Assignment of an operator that is not being changed.
    pub fn unchanged(allocation: KeyStateAllocation) -> Result<Self> {
        Self::new(allocation.clone(), allocation)
    }

    /// Parallelism after the change.
    pub fn parallelism(&self) -> usize {
        self.ranges.len()
    }

    /// Parallelism before the change.
    pub fn old_parallelism(&self) -> usize {
        self.old.parallelism()
    }

    pub fn is_scale_out(&self) -> bool {
        self.parallelism() > self.old_parallelism()
    }

    pub fn is_scale_in(&self) -> bool {
        self.parallelism() < self.old_parallelism()
    }

    /// Whether the key set of `task` changes. Unknown tasks are unmodified.
    pub fn is_task_modified(&self, task: TaskIndex) -> bool {
        self.modified.get(task).copied().unwrap_or(false)
    }

    /// Indices of the tasks whose key set changes.
    pub fn modified_tasks(&self) -> impl Iterator<Item = TaskIndex> + '_ {
        self.modified
            .iter()
            .enumerate()
            .filter(|(_, modified)| **modified)
            .map(|(task, _)| task)
    }

    /// Whether any key group moves at all.
    pub fn is_remapping(&self) -> bool {
        self.modified.iter().any(|m| *m) || self.is_scale_in()
    }

    /// Aligned range of `task` under the new allocation.
    pub fn aligned_key_group_range(&self, task: TaskIndex) -> Option<&AlignedKeyGroupRange> {
        self.ranges.get(task)
    }

    pub fn aligned_key_group_ranges(&self) -> &[AlignedKeyGroupRange] {
        &self.ranges
    }

    /// Task owning `key` under the new allocation.
    pub fn owner_of(&self, key: KeyGroup) -> Option<TaskIndex> {
        self.owners.get(&key).copied()
    }

    pub fn old_allocation(&self) -> &KeyStateAllocation {
        &self.old
    }

    pub fn new_allocation(&self) -> &KeyStateAllocation {
        &self.new
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebalance_marks_both_tasks_modified() {
        let old = KeyStateAllocation::from_tasks([(0, 0..5), (1, 5..10)]);
        let new = KeyStateAllocation::from_tasks([(0, 0..7), (1, 7..10)]);
        let assignment = OperatorWorkloadsAssignment::new(old, new).unwrap();

        assert_eq!(assignment.parallelism(), 2);
        assert!(assignment.is_task_modified(0));
        assert!(assignment.is_task_modified(1));
        assert!(assignment.is_remapping());

        let first = assignment.aligned_key_group_range(0).unwrap();
        assert_eq!((first.start, first.end), (0, 7));
        assert_eq!(first.as_contiguous(), Some(KeyGroupRange::new(0, 7)));
        let second = assignment.aligned_key_group_range(1).unwrap();
        assert_eq!((second.start, second.end), (7, 10));
        assert_eq!(assignment.owner_of(6), Some(0));
    }

    #[test]
    fn test_scale_out_adds_new_task() {
        let old = KeyStateAllocation::contiguous(1, 128);
        let new = KeyStateAllocation::contiguous(2, 128);
        let assignment = OperatorWorkloadsAssignment::new(old, new).unwrap();

        assert!(assignment.is_scale_out());
        assert_eq!(assignment.modified_tasks().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(
            assignment.aligned_key_group_range(1).unwrap().as_contiguous(),
            Some(KeyGroupRange::new(64, 128))
        );
    }

    #[test]
    fn test_untouched_task_not_modified() {
        let old = KeyStateAllocation::from_tasks([(0, 0..4), (1, 4..8), (2, 8..12)]);
        let new = KeyStateAllocation::from_tasks([
            (0, vec![0, 1, 2, 3]),
            (1, vec![4, 5, 6, 8]),
            (2, vec![7, 9, 10, 11]),
        ]);
        let assignment = OperatorWorkloadsAssignment::new(old, new).unwrap();

        assert!(!assignment.is_task_modified(0));
        assert!(assignment.is_task_modified(1));
        assert!(assignment.is_task_modified(2));
        assert!(!assignment.is_task_modified(7));

        let range = assignment.aligned_key_group_range(2).unwrap();
        assert_eq!((range.start, range.end), (8, 12));
        assert_eq!(range.as_contiguous(), None);
        assert!(range.contains(7));
        assert!(!range.contains(8));
    }

    #[test]
    fn test_scale_in_is_remapping() {
        let old = KeyStateAllocation::contiguous(2, 16);
        let new = KeyStateAllocation::contiguous(1, 16);
        let assignment = OperatorWorkloadsAssignment::new(old, new).unwrap();
        assert!(assignment.is_scale_in());
        assert!(assignment.is_remapping());
        assert_eq!(assignment.old_parallelism(), 2);
    }

    #[test]
    fn test_rejects_shared_key_groups() {
        let old = KeyStateAllocation::contiguous(2, 8);
        let new = KeyStateAllocation::from_tasks([(0, 0..5), (1, 4..8)]);
        assert!(matches!(
            OperatorWorkloadsAssignment::new(old, new),
            Err(Error::InvalidAllocation(_))
        ));
    }

    #[test]
    fn test_unchanged_assignment() {
        let assignment =
            OperatorWorkloadsAssignment::unchanged(KeyStateAllocation::contiguous(4, 128)).unwrap();
        assert_eq!(assignment.modified_tasks().count(), 0);
        assert!(!assignment.is_remapping());
    }
}
