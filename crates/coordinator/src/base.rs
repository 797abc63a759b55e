//! State and lookups shared by every coordinator.

use gearshift_plan::{same_udf, ExecutionPlan, OperatorId, Udf};
use gearshift_runtime::{ExecutionGraph, ExecutionJobVertex, JobGraph, JobVertexId, OperatorUid};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::{Error, Result};

/// Holds the coordinator's copy of the plan next to the execution graph it
/// describes, and translates between the two.
pub struct AbstractCoordinator {
    execution_graph: Arc<ExecutionGraph>,
    held: RwLock<ExecutionPlan>,
    operator_ids: HashMap<OperatorId, OperatorUid>,
}

impl AbstractCoordinator {
    /// Fails if an operator of `plan` has no deployment counterpart.
    pub fn new(
        plan: ExecutionPlan,
        operator_ids: HashMap<OperatorId, OperatorUid>,
        execution_graph: Arc<ExecutionGraph>,
    ) -> Result<Self> {
        let job_graph = execution_graph.job_graph();
        for id in plan.operator_ids() {
            let uid = operator_ids
                .get(&id)
                .ok_or_else(|| Error::Lookup(format!("operator {} has no deployment operator", id)))?;
            if job_graph.vertex_of_operator(*uid).is_none() {
                return Err(Error::Lookup(format!(
                    "deployment operator {} of operator {} is not in the job graph",
                    uid, id
                )));
            }
        }
        Ok(Self {
            execution_graph,
            held: RwLock::new(plan),
            operator_ids,
        })
    }

    pub fn execution_graph(&self) -> &Arc<ExecutionGraph> {
        &self.execution_graph
    }

    pub fn job_graph(&self) -> &Arc<JobGraph> {
        self.execution_graph.job_graph()
    }

    /// An independent copy of the held plan.
    pub fn held_execution_plan_copy(&self) -> ExecutionPlan {
        self.held.read().copy()
    }

    pub(crate) fn with_held_plan<R>(&self, f: impl FnOnce(&ExecutionPlan) -> R) -> R {
        f(&self.held.read())
    }

    pub(crate) fn update_held_plan<R>(
        &self,
        f: impl FnOnce(&mut ExecutionPlan) -> gearshift_plan::Result<R>,
    ) -> Result<R> {
        Ok(f(&mut self.held.write())?)
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub fn operator_uid(&self, operator: OperatorId) -> Result<OperatorUid> {
        self.operator_ids
            .get(&operator)
            .copied()
            .ok_or_else(|| Error::Lookup(format!("unknown operator {}", operator)))
    }

    /// Job vertex hosting `operator`, if any.
    pub fn raw_vertex_id_to_job_vertex_id(&self, operator: OperatorId) -> Option<JobVertexId> {
        let uid = self.operator_ids.get(&operator)?;
        self.job_graph().vertex_of_operator(*uid).map(|v| v.id)
    }

    pub fn job_vertex_of(&self, operator: OperatorId) -> Result<Arc<ExecutionJobVertex>> {
        self.raw_vertex_id_to_job_vertex_id(operator)
            .and_then(|id| self.execution_graph.job_vertex(id))
            .ok_or_else(|| Error::Lookup(format!("operator {} has no job vertex", operator)))
    }

    // ========================================================================
    // Plan preparation
    // ========================================================================

    /// Bring function changes of `proposed` into the held plan and the job
    /// graph. Nothing is sent to tasks.
    ///
    /// Functions are compared by identity. Staged control-attribute values
    /// are pushed into the held operator's attributes.
    pub fn prepare_execution_plan(&self, proposed: &ExecutionPlan) -> Result<()> {
        for next in proposed.operators() {
            let id = next.id();
            let held_udf = self.with_held_plan(|plan| plan.descriptor(id).map(|d| d.udf().cloned()))?;

            if let Some(udf) = next.udf() {
                let changed = held_udf.as_ref().map_or(true, |held| !same_udf(held, udf));
                if changed {
                    self.apply_udf(id, udf.clone())?;
                }
            }

            let staged = next.application_logic().staged_attributes();
            if !staged.is_empty() {
                let applied = self.update_held_plan(|plan| {
                    for (name, value) in staged {
                        plan.set_control_attribute(id, name, value.clone())?;
                    }
                    plan.apply_control_attributes(id)
                })?;
                info!(operator = id, attributes = ?applied, "Control attributes applied");
            }
        }
        Ok(())
    }

    /// Install `udf` as the function of `operator` in the held plan and the
    /// job graph.
    pub(crate) fn apply_udf(&self, operator: OperatorId, udf: Udf) -> Result<()> {
        let uid = self.operator_uid(operator)?;
        self.update_held_plan(|plan| plan.set_udf(operator, udf.clone()))?;
        self.job_graph().update_operator(uid, udf.clone())?;
        info!(operator, udf = udf.name(), "Function updated");
        Ok(())
    }
}
