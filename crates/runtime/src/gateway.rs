//! Remote control of the tasks running on one worker.

use async_trait::async_trait;
use std::time::Duration;

use crate::checkpoint::CheckpointType;
use crate::descriptor::{
    Acknowledge, InputGateDescriptor, RescaleOptions, SyncFlag, TaskBackPressure,
    TaskDeploymentDescriptor,
};
use crate::ids::{AllocationId, CheckpointId, ExecutionAttemptId, JobVertexId, OperatorUid, RescaleId};
use crate::Result;

/// Gateway to a worker's task executor.
///
/// Request/response calls are async and bounded by the given timeout;
/// checkpoint notifications are fire-and-forget.
#[async_trait]
pub trait TaskManagerGateway: Send + Sync {
    /// Address of the worker, for logs and errors.
    fn address(&self) -> &str;

    async fn submit_task(
        &self,
        tdd: TaskDeploymentDescriptor,
        timeout: Duration,
    ) -> Result<Acknowledge>;

    async fn rescale_task(
        &self,
        attempt: ExecutionAttemptId,
        tdd: TaskDeploymentDescriptor,
        options: RescaleOptions,
        timeout: Duration,
    ) -> Result<Acknowledge>;

    async fn prepare_for_sync(
        &self,
        attempt: ExecutionAttemptId,
        flag: SyncFlag,
        rescale_id: RescaleId,
        timeout: Duration,
    ) -> Result<Acknowledge>;

    /// Swap the function of one hosted operator for the one in `tdd`.
    async fn update_operator(
        &self,
        attempt: ExecutionAttemptId,
        tdd: TaskDeploymentDescriptor,
        operator: OperatorUid,
        timeout: Duration,
    ) -> Result<Acknowledge>;

    async fn cancel_task(&self, attempt: ExecutionAttemptId, timeout: Duration) -> Result<Acknowledge>;

    /// Point input gates of a task at the partition versions in `partitions`.
    async fn update_partitions(
        &self,
        attempt: ExecutionAttemptId,
        partitions: Vec<InputGateDescriptor>,
        timeout: Duration,
    ) -> Result<Acknowledge>;

    fn release_partitions(&self, partitions: &[(JobVertexId, RescaleId)]);

    async fn request_task_back_pressure(
        &self,
        attempt: ExecutionAttemptId,
        request_id: u64,
        timeout: Duration,
    ) -> Result<TaskBackPressure>;

    fn trigger_checkpoint(
        &self,
        attempt: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        timestamp: u64,
        kind: CheckpointType,
    );

    fn notify_checkpoint_complete(
        &self,
        attempt: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        timestamp: u64,
    );

    async fn free_slot(
        &self,
        allocation: AllocationId,
        cause: String,
        timeout: Duration,
    ) -> Result<Acknowledge>;
}
