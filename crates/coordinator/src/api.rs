//! Reconfigurations offered to controllers.
//!
//! Every call claims the single-writer gate of the committed plan, runs a
//! fixed sequence of primitive operations and releases the gate, notifying
//! the controller that asked. The committed plan is replaced only when the
//! whole sequence succeeded.

use futures::future::BoxFuture;
use gearshift_plan::{
    ChangeKind, ControlPolicy, Diff, DiffPayload, ExecutionPlan, ExecutionPlanWithLock,
    KeyStateAllocation, OperatorId, Udf,
};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

use crate::primitive::{PrimitiveOperation, Subtasks};
use crate::reconfigure::ReconfigureCoordinator;
use crate::{Error, Result};

/// Controller-facing entry point for reconfigurations.
pub struct ReconfigurationApi {
    plan: Arc<ExecutionPlanWithLock>,
    coordinator: Arc<ReconfigureCoordinator>,
}

impl ReconfigurationApi {
    pub fn new(coordinator: Arc<ReconfigureCoordinator>) -> Self {
        Self {
            plan: Arc::new(ExecutionPlanWithLock::new(coordinator.held_execution_plan_copy())),
            coordinator,
        }
    }

    /// A copy of the committed plan to propose changes on.
    pub fn job_execution_plan(&self) -> ExecutionPlan {
        self.plan.copy()
    }

    pub fn plan_lock(&self) -> &Arc<ExecutionPlanWithLock> {
        &self.plan
    }

    pub fn coordinator(&self) -> &Arc<ReconfigureCoordinator> {
        &self.coordinator
    }

    async fn run(
        &self,
        policy: Option<Arc<dyn ControlPolicy>>,
        operation: impl Future<Output = Result<()>>,
    ) -> Result<()> {
        self.plan.set_state_updating_flag(policy)?;
        let result = operation.await;
        match &result {
            Ok(()) => self.plan.commit(self.coordinator.held_execution_plan_copy()),
            Err(_) => self.coordinator.workloads().discard_pending(),
        }
        let failure = result
            .as_ref()
            .err()
            .map(|e| e as &(dyn std::error::Error + Send + Sync + 'static));
        self.plan.notify_update_finished(failure)?;
        result
    }

    /// Move key groups of `operator` between its tasks without changing its
    /// parallelism. Stateful operators migrate their state; stateless ones
    /// only change the routing of their parent.
    pub async fn rebalance(
        &self,
        operator: OperatorId,
        allocation: KeyStateAllocation,
        stateful: bool,
        policy: Option<Arc<dyn ControlPolicy>>,
    ) -> Result<()> {
        self.run(policy, async {
            let (parents, parallelism) = self.check_keyed(operator, &allocation, stateful)?;
            if allocation.parallelism() != parallelism {
                return Err(Error::Plan(gearshift_plan::Error::InvalidAllocation(format!(
                    "rebalance of operator {} keeps {} tasks, allocation has {}",
                    operator,
                    parallelism,
                    allocation.parallelism()
                ))));
            }
            let c = &self.coordinator;
            let assignment = c.workloads().propose(operator, allocation.clone())?;
            info!(
                operator,
                stateful,
                modified = assignment.modified_tasks().count(),
                "Rebalancing"
            );

            let mut diff = Diff::new();
            let mut tasks: Vec<(OperatorId, Subtasks)> = parents.iter().map(|p| (*p, Subtasks::All)).collect();
            for parent in &parents {
                diff.insert(*parent, DiffPayload::KeyMapping(allocation.clone()));
            }
            if stateful {
                diff.insert(operator, DiffPayload::KeyStateAllocation(assignment));
                tasks.push((operator, Subtasks::All));
            }

            let diff = c.synchronize_pause_tasks(tasks, diff).await?;
            let diff = c.update_upstream_key_mapping(operator, diff).await?;
            if stateful {
                c.update_state(operator, diff).await?;
            }
            c.resume_tasks().await
        })
        .await
    }

    /// Change the parallelism of a stateful operator to
    /// `allocation.parallelism()`, moving key groups per `allocation`.
    pub async fn rescale(
        &self,
        operator: OperatorId,
        allocation: KeyStateAllocation,
        policy: Option<Arc<dyn ControlPolicy>>,
    ) -> Result<()> {
        self.run(policy, async {
            let (parents, old_parallelism) = self.check_keyed(operator, &allocation, true)?;
            let new_parallelism = allocation.parallelism();
            if new_parallelism == old_parallelism {
                return Err(Error::ProtocolViolation(format!(
                    "operator {} already runs {} tasks, rebalance instead",
                    operator, old_parallelism
                )));
            }
            let c = &self.coordinator;
            let assignment = c.workloads().propose(operator, allocation.clone())?;
            info!(operator, old_parallelism, new_parallelism, "Rescaling");

            let mut diff = Diff::new();
            diff.insert(operator, DiffPayload::KeyStateAllocation(assignment))
                .insert(
                    operator,
                    DiffPayload::Parallelism {
                        old: old_parallelism,
                        new: new_parallelism,
                    },
                );
            let mut tasks: Vec<(OperatorId, Subtasks)> = parents.iter().map(|p| (*p, Subtasks::All)).collect();
            for parent in &parents {
                diff.insert(*parent, DiffPayload::KeyMapping(allocation.clone()));
            }
            tasks.push((operator, Subtasks::All));

            let diff = c.synchronize_pause_tasks(tasks, diff).await?;
            let diff = c.prepare_rescale(operator, diff).await?;
            let diff = c.update_upstream_key_mapping(operator, diff).await?;
            c.update_state(operator, diff).await?;
            c.update_task_resources(operator, old_parallelism).await?;
            c.resume_tasks().await
        })
        .await
    }

    /// Swap the function of `operator` on its running tasks.
    pub async fn update_function(
        &self,
        operator: OperatorId,
        udf: Udf,
        policy: Option<Arc<dyn ControlPolicy>>,
    ) -> Result<()> {
        self.run(policy, async {
            let mut proposed = self.coordinator.held_execution_plan_copy();
            proposed.set_udf(operator, udf.clone())?;
            self.swap_function(operator, &proposed, udf).await
        })
        .await
    }

    /// Set a control attribute of `operator` and ship the reconfigured
    /// function to its tasks.
    pub async fn update_control_attribute(
        &self,
        operator: OperatorId,
        name: &str,
        value: Value,
        policy: Option<Arc<dyn ControlPolicy>>,
    ) -> Result<()> {
        self.run(policy, async {
            let mut proposed = self.coordinator.held_execution_plan_copy();
            proposed.set_control_attribute(operator, name, value)?;
            let udf = proposed
                .descriptor(operator)?
                .udf()
                .cloned()
                .ok_or_else(|| Error::ProtocolViolation(format!("operator {} has no function", operator)))?;
            self.swap_function(operator, &proposed, udf).await
        })
        .await
    }

    async fn swap_function(&self, operator: OperatorId, proposed: &ExecutionPlan, udf: Udf) -> Result<()> {
        let c = &self.coordinator;
        let changes = c.held_execution_plan_copy().diff(proposed);
        if !changes.get(&operator).is_some_and(|kinds| kinds.contains(&ChangeKind::Udf)) {
            info!(operator, "Function unchanged");
        }
        c.prepare_execution_plan(proposed).await?;

        let mut diff = Diff::new();
        diff.insert(operator, DiffPayload::Udf(udf));
        let diff = c
            .synchronize_pause_tasks(vec![(operator, Subtasks::All)], diff)
            .await?;
        c.update_function(operator, diff).await?;
        c.resume_tasks().await
    }

    /// Pause `operator` at a rescale point and resume it.
    pub async fn no_op(&self, operator: OperatorId, policy: Option<Arc<dyn ControlPolicy>>) -> Result<()> {
        self.run(policy, async {
            let c = &self.coordinator;
            c.synchronize_pause_tasks(vec![(operator, Subtasks::All)], Diff::new())
                .await?;
            c.resume_tasks().await
        })
        .await
    }

    /// Run a custom sequence of primitive operations under the plan gate.
    pub async fn call_customize_operations<F>(&self, policy: Option<Arc<dyn ControlPolicy>>, operations: F) -> Result<()>
    where
        F: FnOnce(Arc<ReconfigureCoordinator>) -> BoxFuture<'static, Result<()>>,
    {
        let coordinator = self.coordinator.clone();
        self.run(policy, operations(coordinator)).await
    }

    /// Parents of a single-input keyed operator and its parallelism, after
    /// checking that `allocation` covers exactly its key groups.
    fn check_keyed(
        &self,
        operator: OperatorId,
        allocation: &KeyStateAllocation,
        stateful: bool,
    ) -> Result<(Vec<OperatorId>, usize)> {
        let held = self.coordinator.held_execution_plan_copy();
        let descriptor = held.descriptor(operator)?;
        if stateful && !descriptor.is_stateful() {
            return Err(gearshift_plan::Error::Stateless(operator).into());
        }
        let parents: Vec<OperatorId> = held.parents(operator).collect();
        if parents.len() > 1 {
            return Err(gearshift_plan::Error::MultipleInputs(operator).into());
        }

        let current = self
            .coordinator
            .workloads()
            .current_allocation(operator)
            .ok_or_else(|| Error::Lookup(format!("operator {} is not keyed", operator)))?;
        allocation.validate_partition(&current.key_space())?;
        Ok((parents, descriptor.parallelism()))
    }
}
