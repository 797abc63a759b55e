//! The primitive operations a reconfiguration is composed of.

use async_trait::async_trait;
use gearshift_plan::{Diff, ExecutionPlan, OperatorId};
use std::fmt;

use crate::Result;

/// Which task instances of an operator an operation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subtasks {
    All,
    Only(usize),
}

impl fmt::Display for Subtasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subtasks::All => f.write_str("*"),
            Subtasks::Only(index) => write!(f, "{}", index),
        }
    }
}

/// Operators and the task instances of each an operation applies to.
pub type TaskList = Vec<(OperatorId, Subtasks)>;

/// Every operation takes the pending [`Diff`] and returns what is left of
/// it. An operator whose diff is empty has nothing pending and may resume.
///
/// Operations must be awaited one after the other.
#[async_trait]
pub trait PrimitiveOperation: Send + Sync {
    /// Bring function and control-attribute changes of `proposed` into the
    /// held plan. Nothing is sent to tasks.
    async fn prepare_execution_plan(&self, proposed: &ExecutionPlan) -> Result<()>;

    /// Pause the listed tasks at a rescale point and collect their state.
    ///
    /// Resolves once every paused task has acknowledged the rescale point,
    /// or fails when the synchronization times out or aborts.
    async fn synchronize_pause_tasks(&self, tasks: TaskList, diff: Diff) -> Result<Diff>;

    /// Resume every task still paused by the current synchronization.
    async fn resume_tasks(&self) -> Result<()>;

    /// Route the parents of `destination` by its new key allocation.
    async fn update_upstream_key_mapping(&self, destination: OperatorId, diff: Diff) -> Result<Diff>;

    /// Move keyed state of `operator` to its new owners.
    async fn update_state(&self, operator: OperatorId, diff: Diff) -> Result<Diff>;

    /// Ship the current function of `operator` to its running tasks.
    async fn update_function(&self, operator: OperatorId, diff: Diff) -> Result<Diff>;

    /// Deploy or cancel tasks so `operator` runs at its new parallelism.
    async fn update_task_resources(&self, operator: OperatorId, old_parallelism: usize) -> Result<()>;

    /// Deploy the task instances created by the last rescale of `operator`.
    async fn deploy_tasks(&self, operator: OperatorId, old_parallelism: usize) -> Result<()>;

    /// Cancel the removed task instances of `operator` from `offset` on.
    async fn cancel_tasks(&self, operator: OperatorId, offset: usize) -> Result<()>;

    /// Resize the held plan and the execution graph to the new parallelism
    /// pending in the diff. Tasks are not touched.
    async fn prepare_rescale(&self, operator: OperatorId, diff: Diff) -> Result<Diff>;
}
