//! Gearshift reconfiguration coordinator.
//!
//! Changes a running job without stopping it: tasks affected by a change are
//! paused at a rescale point, routing and key ownership are remapped, keyed
//! state is moved to its new owners, functions are swapped, and tasks resume
//! operator by operator as soon as nothing is pending for them.
//!
//! - [`ReconfigureCoordinator`] implements the [`PrimitiveOperation`]s.
//! - [`ReconfigurationApi`] composes them for controllers behind the
//!   single-writer plan gate.
//! - [`JobBuilder`] builds matching logical plan and deployment graph.

pub mod api;
pub mod base;
pub mod config;
pub mod job;
pub mod phase;
pub mod primitive;
pub mod reconfigure;
pub mod state_assignment;
pub mod synchronize;
pub mod workloads;

#[cfg(test)]
mod testing;

pub use api::ReconfigurationApi;
pub use base::AbstractCoordinator;
pub use config::CoordinatorConfig;
pub use job::{JobBuilder, StreamJob};
pub use phase::{PhaseTracker, RescalePhase};
pub use primitive::{PrimitiveOperation, Subtasks, TaskList};
pub use reconfigure::ReconfigureCoordinator;
pub use synchronize::SynchronizeOperation;
pub use workloads::WorkloadsAssignmentHandler;

use std::time::Duration;

/// Result type for coordinator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while reconfiguring a job.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Lookup failed: {0}")]
    Lookup(String),

    #[error("Synchronization timed out after {timeout:?}, {pending} task(s) did not acknowledge")]
    SyncTimeout { timeout: Duration, pending: usize },

    #[error("Synchronization aborted: {0}")]
    SyncAborted(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Plan(#[from] gearshift_plan::Error),

    #[error(transparent)]
    Runtime(#[from] gearshift_runtime::Error),
}

impl Error {
    /// Whether the caller broke the operation contract, as opposed to a
    /// failure while executing it.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::ProtocolViolation(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Config(e.to_string())
    }
}
