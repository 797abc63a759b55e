//! Gearshift runtime model.
//!
//! The deployment-side world the reconfiguration coordinator drives:
//!
//! - [`JobGraph`]: deployment graph of job vertices and their operators.
//! - [`ExecutionGraph`]: per-vertex task instances and their current
//!   execution attempts.
//! - [`TaskManagerGateway`]: remote control of deployed tasks.
//! - [`CheckpointCoordinator`]: checkpoint scheduling, rescale points and
//!   acknowledgement routing.
//! - [`SlotPool`]: task slots offered by workers.
//! - [`LocalTaskExecutor`]: an in-process worker implementing the gateway.

pub mod checkpoint;
pub mod descriptor;
pub mod execution;
pub mod executor;
pub mod gateway;
pub mod graph;
pub mod ids;
pub mod job_graph;
pub mod pause;
pub mod slot_pool;

pub use checkpoint::{
    CheckpointConfig, CheckpointCoordinator, CheckpointResponder, CheckpointType,
    CompletedCheckpoint, OperatorState, PendingCheckpoint, RescalepointAcknowledgeListener,
    TaskStateSnapshot,
};
pub use descriptor::{
    Acknowledge, InputGateDescriptor, KeyedStateSnapshot, OperatorDeployment, RescaleOptions,
    SyncFlag, TaskBackPressure, TaskDeploymentDescriptor, TaskRestore,
};
pub use execution::{Execution, ExecutionJobVertex, ExecutionState, ExecutionVertex, RescaleCandidates};
pub use executor::{LocalTaskExecutor, RpcKind, RpcRecord, TaskState, TaskStatus};
pub use gateway::TaskManagerGateway;
pub use graph::ExecutionGraph;
pub use ids::{AllocationId, CheckpointId, ExecutionAttemptId, JobVertexId, OperatorUid, RescaleId};
pub use job_graph::{JobGraph, JobVertex};
pub use pause::{PauseController, PauseState};
pub use slot_pool::{LogicalSlot, SlotPool, WorkerInfo};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("RPC to {address} failed: {message}")]
    Rpc { address: String, message: String },

    #[error("Task {0} not found")]
    TaskNotFound(ExecutionAttemptId),

    #[error("No available slot for {0}")]
    NoAvailableSlot(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Invalid job graph: {0}")]
    InvalidJobGraph(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Wall-clock milliseconds since the epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
