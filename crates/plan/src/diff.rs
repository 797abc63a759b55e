//! Pending changes of a reconfiguration, per operator.
//!
//! Each phase of a rescale consumes the entries it is responsible for. An
//! operator whose entry set becomes empty has nothing left to wait for and
//! its tasks may resume.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::keys::KeyStateAllocation;
use crate::logic::Udf;
use crate::operator::OperatorId;
use crate::workload::OperatorWorkloadsAssignment;

/// Kind of change pending on an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Udf,
    KeyMapping,
    KeyStateAllocation,
    Parallelism,
}

/// A pending change together with the data the phase needs to apply it.
#[derive(Debug, Clone)]
pub enum DiffPayload {
    /// The function tasks must switch to.
    Udf(Udf),
    /// New routing toward the rescaled child.
    KeyMapping(KeyStateAllocation),
    /// Key groups move between tasks of this operator.
    KeyStateAllocation(Arc<OperatorWorkloadsAssignment>),
    /// Number of task instances changes.
    Parallelism { old: usize, new: usize },
}

impl DiffPayload {
    pub fn kind(&self) -> ChangeKind {
        match self {
            DiffPayload::Udf(_) => ChangeKind::Udf,
            DiffPayload::KeyMapping(_) => ChangeKind::KeyMapping,
            DiffPayload::KeyStateAllocation(_) => ChangeKind::KeyStateAllocation,
            DiffPayload::Parallelism { .. } => ChangeKind::Parallelism,
        }
    }
}

/// Pending changes of one operator.
#[derive(Debug, Clone, Default)]
pub struct OperatorDiff(BTreeMap<ChangeKind, DiffPayload>);

impl OperatorDiff {
    pub fn insert(&mut self, payload: DiffPayload) -> Option<DiffPayload> {
        self.0.insert(payload.kind(), payload)
    }

    pub fn remove(&mut self, kind: ChangeKind) -> Option<DiffPayload> {
        self.0.remove(&kind)
    }

    pub fn get(&self, kind: ChangeKind) -> Option<&DiffPayload> {
        self.0.get(&kind)
    }

    pub fn contains(&self, kind: ChangeKind) -> bool {
        self.0.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = ChangeKind> + '_ {
        self.0.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Pending changes of a whole reconfiguration.
#[derive(Debug, Clone, Default)]
pub struct Diff(BTreeMap<OperatorId, OperatorDiff>);

impl Diff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pending change on `operator`.
    pub fn insert(&mut self, operator: OperatorId, payload: DiffPayload) -> &mut Self {
        self.0.entry(operator).or_default().insert(payload);
        self
    }

    /// Consume the `kind` entry of `operator`.
    pub fn remove(&mut self, operator: OperatorId, kind: ChangeKind) -> Option<DiffPayload> {
        self.0.get_mut(&operator)?.remove(kind)
    }

    pub fn get(&self, operator: OperatorId) -> Option<&OperatorDiff> {
        self.0.get(&operator)
    }

    /// Whether `operator` has nothing pending (also true when it never had).
    pub fn is_settled(&self, operator: OperatorId) -> bool {
        self.0.get(&operator).map_or(true, OperatorDiff::is_empty)
    }

    /// Whether every operator is settled.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(OperatorDiff::is_empty)
    }

    pub fn operators(&self) -> impl Iterator<Item = OperatorId> + '_ {
        self.0.keys().copied()
    }

    /// The workload assignment pending on `operator`, if any.
    pub fn workloads(&self, operator: OperatorId) -> Option<&Arc<OperatorWorkloadsAssignment>> {
        match self.0.get(&operator)?.get(ChangeKind::KeyStateAllocation)? {
            DiffPayload::KeyStateAllocation(assignment) => Some(assignment),
            _ => None,
        }
    }

    /// Consume the workload assignment pending on `operator`.
    pub fn take_workloads(&mut self, operator: OperatorId) -> Option<Arc<OperatorWorkloadsAssignment>> {
        match self.remove(operator, ChangeKind::KeyStateAllocation)? {
            DiffPayload::KeyStateAllocation(assignment) => Some(assignment),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_settles_when_entries_consumed() {
        let assignment = OperatorWorkloadsAssignment::new(
            KeyStateAllocation::contiguous(2, 10),
            KeyStateAllocation::from_tasks([(0, 0..7), (1, 7..10)]),
        )
        .unwrap();

        let mut diff = Diff::new();
        diff.insert(2, DiffPayload::KeyStateAllocation(Arc::new(assignment)))
            .insert(1, DiffPayload::KeyMapping(KeyStateAllocation::contiguous(2, 10)));

        assert!(!diff.is_settled(1));
        assert!(diff.is_settled(7));
        assert!(diff.workloads(2).is_some());

        assert!(diff.remove(1, ChangeKind::KeyMapping).is_some());
        assert!(diff.is_settled(1));
        assert!(!diff.is_empty());

        assert!(diff.take_workloads(2).is_some());
        assert!(diff.take_workloads(2).is_none());
        assert!(diff.is_empty());
    }

    #[test]
    fn test_insert_replaces_same_kind() {
        let mut diff = Diff::new();
        diff.insert(3, DiffPayload::Parallelism { old: 1, new: 2 });
        diff.insert(3, DiffPayload::Parallelism { old: 1, new: 4 });
        let kinds: Vec<_> = diff.get(3).unwrap().kinds().collect();
        assert_eq!(kinds, vec![ChangeKind::Parallelism]);
        assert!(matches!(
            diff.remove(3, ChangeKind::Parallelism),
            Some(DiffPayload::Parallelism { new: 4, .. })
        ));
    }
}
