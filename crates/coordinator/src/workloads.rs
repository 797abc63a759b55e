//! Current and proposed key-group workloads per operator.

use gearshift_plan::{ExecutionPlan, KeyStateAllocation, OperatorId, OperatorWorkloadsAssignment};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::Result;

/// Tracks the workloads assignment in effect for every keyed operator.
///
/// Keyed operators start with an unchanged assignment of their initial
/// allocation. A proposal is computed against the assignment in effect and
/// stays pending until [`commit`](Self::commit) records it, once the tasks
/// own the new key groups.
#[derive(Debug, Default)]
pub struct WorkloadsAssignmentHandler {
    assignments: RwLock<HashMap<OperatorId, Arc<OperatorWorkloadsAssignment>>>,
    pending: RwLock<HashMap<OperatorId, Arc<OperatorWorkloadsAssignment>>>,
}

impl WorkloadsAssignmentHandler {
    pub fn new(plan: &ExecutionPlan) -> Result<Self> {
        let mut assignments = HashMap::new();
        for descriptor in plan.operators() {
            let allocation = if descriptor.is_stateful() {
                Some(descriptor.key_state_allocation().clone())
            } else {
                // Stateless but keyed: the routing its parent keeps toward it.
                plan.parents(descriptor.id())
                    .find_map(|p| plan.operator(p)?.key_mapping_to(descriptor.id()).cloned())
            };
            if let Some(allocation) = allocation {
                assignments.insert(
                    descriptor.id(),
                    Arc::new(OperatorWorkloadsAssignment::unchanged(allocation)?),
                );
            }
        }
        Ok(Self {
            assignments: RwLock::new(assignments),
            pending: RwLock::new(HashMap::new()),
        })
    }

    /// Assignment in effect for `operator`.
    pub fn held(&self, operator: OperatorId) -> Option<Arc<OperatorWorkloadsAssignment>> {
        self.assignments.read().get(&operator).cloned()
    }

    /// Allocation currently in effect for `operator`.
    pub fn current_allocation(&self, operator: OperatorId) -> Option<KeyStateAllocation> {
        self.held(operator).map(|a| a.new_allocation().clone())
    }

    /// Proposal of `operator` not committed yet.
    pub fn pending(&self, operator: OperatorId) -> Option<Arc<OperatorWorkloadsAssignment>> {
        self.pending.read().get(&operator).cloned()
    }

    /// Propose a move of `operator` from its current allocation to `allocation`.
    /// A later proposal for the same operator replaces this one.
    pub fn propose(
        &self,
        operator: OperatorId,
        allocation: KeyStateAllocation,
    ) -> Result<Arc<OperatorWorkloadsAssignment>> {
        let old = self.current_allocation(operator).unwrap_or_default();
        if !old.is_empty() {
            allocation.validate_partition(&old.key_space())?;
        }
        let assignment = Arc::new(OperatorWorkloadsAssignment::new(old, allocation)?);
        debug!(
            operator,
            old_parallelism = assignment.old_parallelism(),
            new_parallelism = assignment.parallelism(),
            modified = assignment.modified_tasks().count(),
            "Workloads assignment proposed"
        );
        self.pending.write().insert(operator, assignment.clone());
        Ok(assignment)
    }

    /// Put `assignment` in effect for `operator`, dropping its proposal.
    pub fn commit(&self, operator: OperatorId, assignment: Arc<OperatorWorkloadsAssignment>) {
        self.pending.write().remove(&operator);
        debug!(operator, parallelism = assignment.parallelism(), "Workloads assignment committed");
        self.assignments.write().insert(operator, assignment);
    }

    /// Drop every proposal not committed yet.
    pub fn discard_pending(&self) {
        let mut pending = self.pending.write();
        if !pending.is_empty() {
            debug!(operators = pending.len(), "Pending workloads assignments discarded");
            pending.clear();
        }
    }
}
