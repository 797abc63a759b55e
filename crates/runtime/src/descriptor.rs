//! Messages exchanged with task executors.

use gearshift_plan::{AlignedKeyGroupRange, KeyGroup, Udf};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::ids::{ExecutionAttemptId, JobVertexId, OperatorUid, RescaleId};

/// What a rescale RPC asks a task to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RescaleOptions {
    /// Source only: start producing into partitions tagged with the new
    /// rescale id, nothing else.
    PrepareOnly,
    /// Regenerate produced partitions.
    PartitionsOnly,
    /// Re-read input gates from the descriptor.
    GatesOnly,
    /// Adopt the descriptor's key-group range.
    KeyGroupRangeOnly,
    /// Adopt the descriptor's key-group range and restore state.
    StateOnly,
}

/// Inter-task synchronization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncFlag {
    /// Pause at the next rescale-point barrier.
    NeedSync,
    /// Leave the paused state.
    NeedResume,
}

/// Plain RPC acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledge;

/// Keyed state of one operator instance, per key group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedStateSnapshot(BTreeMap<KeyGroup, Vec<u8>>);

impl KeyedStateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key_group: KeyGroup, value: Vec<u8>) {
        self.0.insert(key_group, value);
    }

    pub fn get(&self, key_group: KeyGroup) -> Option<&[u8]> {
        self.0.get(&key_group).map(Vec::as_slice)
    }

    pub fn get_mut(&mut self, key_group: KeyGroup) -> Option<&mut Vec<u8>> {
        self.0.get_mut(&key_group)
    }

    pub fn key_groups(&self) -> impl Iterator<Item = KeyGroup> + '_ {
        self.0.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge `other` into `self`; entries of `other` win.
    pub fn extend(&mut self, other: &KeyedStateSnapshot) {
        self.0
            .extend(other.0.iter().map(|(key, value)| (*key, value.clone())));
    }

    /// Entries whose key group lies inside `range`.
    pub fn restrict(&self, range: &AlignedKeyGroupRange) -> KeyedStateSnapshot {
        KeyedStateSnapshot(
            self.0
                .iter()
                .filter(|(key, _)| range.contains(**key))
                .map(|(key, value)| (*key, value.clone()))
                .collect(),
        )
    }

    /// Drop entries outside `range`.
    pub fn retain_range(&mut self, range: &AlignedKeyGroupRange) {
        self.0.retain(|key, _| range.contains(*key));
    }
}

/// State a task must restore, per hosted operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskRestore {
    pub states: HashMap<OperatorUid, KeyedStateSnapshot>,
}

/// An operator hosted by a task, with its current function.
#[derive(Debug, Clone)]
pub struct OperatorDeployment {
    pub uid: OperatorUid,
    pub name: String,
    pub udf: Option<Udf>,
}

/// Input gate of a task: the producer it reads and the partition version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputGateDescriptor {
    pub upstream: JobVertexId,
    pub partition_rescale_id: RescaleId,
}

/// Everything a task executor needs to run, or re-configure, a task.
#[derive(Debug, Clone)]
pub struct TaskDeploymentDescriptor {
    pub job_vertex_id: JobVertexId,
    pub task_name: String,
    pub subtask_index: usize,
    pub parallelism: usize,
    pub attempt_id: ExecutionAttemptId,
    pub is_source: bool,
    pub operators: Vec<OperatorDeployment>,
    pub key_group_range: Option<AlignedKeyGroupRange>,
    pub restore: Option<TaskRestore>,
    pub produced_partition_rescale_id: RescaleId,
    pub input_gates: Vec<InputGateDescriptor>,
}

/// Back-pressure sample of one task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskBackPressure {
    pub attempt_id: ExecutionAttemptId,
    pub request_id: u64,
    /// Fraction of time the task was blocked on output, `0.0..=1.0`.
    pub ratio: f64,
}
