//! Redistribution of collected keyed state onto task instances.

use gearshift_plan::OperatorWorkloadsAssignment;
use gearshift_runtime::{ExecutionJobVertex, KeyedStateSnapshot, OperatorState, OperatorUid, TaskRestore};
use std::collections::HashMap;
use tracing::debug;

use crate::{Error, Result};

/// Hands every modified task of a job vertex the state of the key groups it
/// owns under the new assignment.
pub struct StateAssignmentOperation<'a> {
    job_vertex: &'a ExecutionJobVertex,
    states: &'a HashMap<OperatorUid, OperatorState>,
    assignment: &'a OperatorWorkloadsAssignment,
}

impl<'a> StateAssignmentOperation<'a> {
    pub fn new(
        job_vertex: &'a ExecutionJobVertex,
        states: &'a HashMap<OperatorUid, OperatorState>,
        assignment: &'a OperatorWorkloadsAssignment,
    ) -> Self {
        Self {
            job_vertex,
            states,
            assignment,
        }
    }

    /// Set the restore and key-group range of every modified task. Returns
    /// the number of tasks assigned.
    pub fn assign_states(&self) -> Result<usize> {
        let parallelism = self.job_vertex.parallelism();
        if self.assignment.parallelism() != parallelism {
            return Err(Error::ProtocolViolation(format!(
                "assignment for {} tasks, job vertex '{}' has {}",
                self.assignment.parallelism(),
                self.job_vertex.name(),
                parallelism
            )));
        }

        // Every subtask's key groups, per hosted operator.
        let merged: Vec<(OperatorUid, KeyedStateSnapshot)> = self
            .job_vertex
            .job_vertex()
            .operators
            .iter()
            .map(|uid| {
                let state = self.states.get(uid).map(OperatorState::merged).unwrap_or_default();
                (*uid, state)
            })
            .collect();

        let mut assigned = 0;
        for task in self.assignment.modified_tasks() {
            let (Some(vertex), Some(range)) = (
                self.job_vertex.task_vertex(task),
                self.assignment.aligned_key_group_range(task),
            ) else {
                return Err(Error::Lookup(format!(
                    "task {} of job vertex '{}' has no vertex or range",
                    task,
                    self.job_vertex.name()
                )));
            };
            let restore = TaskRestore {
                states: merged
                    .iter()
                    .map(|(uid, state)| (*uid, state.restrict(range)))
                    .collect(),
            };
            debug!(
                job_vertex = %self.job_vertex.name(),
                task,
                key_groups = range.len(),
                "State assigned"
            );
            vertex.assign_key_group_range(range.clone());
            vertex.set_restore(restore);
            assigned += 1;
        }
        Ok(assigned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cluster, COUNTER};
    use gearshift_plan::KeyStateAllocation;
    use std::collections::BTreeMap;

    fn snapshot(key_groups: impl IntoIterator<Item = u32>) -> KeyedStateSnapshot {
        let mut snapshot = KeyedStateSnapshot::new();
        for kg in key_groups {
            snapshot.insert(kg, vec![kg as u8]);
        }
        snapshot
    }

    #[tokio::test]
    async fn test_modified_tasks_receive_their_key_groups() {
        let cluster = cluster(3, 9).await;
        let uid = cluster.counter_uid();
        let states = HashMap::from([(
            uid,
            OperatorState {
                subtask_states: BTreeMap::from([
                    (0, snapshot(0..3)),
                    (1, snapshot(3..6)),
                    (2, snapshot(6..9)),
                ]),
            },
        )]);
        let assignment = OperatorWorkloadsAssignment::new(
            KeyStateAllocation::contiguous(3, 9),
            KeyStateAllocation::from_tasks([(0, 0..3), (1, 3..5), (2, 5..9)]),
        )
        .unwrap();
        let job_vertex = cluster.coordinator.base().job_vertex_of(COUNTER).unwrap();

        let assigned = StateAssignmentOperation::new(&job_vertex, &states, &assignment)
            .assign_states()
            .unwrap();

        assert_eq!(assigned, 2);
        let vertices = job_vertex.task_vertices();
        assert!(vertices[0].pending_restore().is_none());
        let mut seen = Vec::new();
        for (task, expected) in [(1, 3..5), (2, 5..9)] {
            let restore = vertices[task].pending_restore().unwrap();
            let key_groups: Vec<_> = restore.states[&uid].key_groups().collect();
            assert_eq!(key_groups, expected.clone().collect::<Vec<_>>());
            assert!(key_groups.iter().all(|kg| vertices[task].key_group_range().unwrap().contains(*kg)));
            seen.extend(key_groups);
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, (3..9).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_parallelism_mismatch_is_rejected() {
        let cluster = cluster(2, 10).await;
        let assignment = OperatorWorkloadsAssignment::new(
            KeyStateAllocation::contiguous(2, 10),
            KeyStateAllocation::contiguous(3, 10),
        )
        .unwrap();
        let job_vertex = cluster.coordinator.base().job_vertex_of(COUNTER).unwrap();
        let states = HashMap::new();
        let err = StateAssignmentOperation::new(&job_vertex, &states, &assignment)
            .assign_states()
            .unwrap_err();
        assert!(err.is_protocol_violation());
    }
}
