//! Gearshift execution plan.
//!
//! This crate holds the logical view of a running streaming job that the
//! reconfiguration coordinator and the controllers reason about:
//!
//! - [`ExecutionPlan`]: an arena of [`OperatorDescriptor`]s with id-based
//!   parent/child adjacency.
//! - [`KeyStateAllocation`]: which key groups each parallel task of a keyed
//!   operator owns.
//! - [`OperatorWorkloadsAssignment`]: old/new allocation pair projected onto
//!   aligned key-group ranges, with per-task "modified" flags.
//! - [`ApplicationLogic`]: the user function plus its typed control attributes.
//! - [`Diff`]: the per-operator set of pending changes a rescale works through.
//! - [`ExecutionPlanWithLock`]: the single-writer gate around the committed plan.

pub mod diff;
pub mod keys;
pub mod lock;
pub mod logic;
pub mod operator;
pub mod plan;
pub mod workload;

pub use diff::{ChangeKind, Diff, DiffPayload, OperatorDiff};
pub use keys::{KeyGroup, KeyStateAllocation, TaskIndex};
pub use lock::{ControlPolicy, ExecutionPlanWithLock};
pub use logic::{same_udf, ApplicationLogic, ControlAttribute, Udf, UserFunction};
pub use operator::{OperatorDescriptor, OperatorId};
pub use plan::{ExecutionPlan, ExecutionPlanBuilder};
pub use workload::{AlignedKeyGroupRange, KeyGroupRange, OperatorWorkloadsAssignment};

/// Default number of key groups (maximum parallelism) of a keyed operator.
pub const DEFAULT_MAX_PARALLELISM: u32 = 128;

/// Result type for plan operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building or editing an execution plan.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unknown operator: {0}")]
    UnknownOperator(OperatorId),

    #[error("Edge {from} -> {to} does not start or end at operator {operator}")]
    EdgeMismatch {
        operator: OperatorId,
        from: OperatorId,
        to: OperatorId,
    },

    #[error("Operator {child} is not a child of operator {parent}")]
    UnknownEdge { parent: OperatorId, child: OperatorId },

    #[error("Operator graph contains a cycle through operator {0}")]
    Cycle(OperatorId),

    #[error("Operator {0} is stateless, it has no key set to change")]
    Stateless(OperatorId),

    #[error("Operator {0} has more than one input, multi-input key remapping is not supported")]
    MultipleInputs(OperatorId),

    #[error("Invalid key state allocation: {0}")]
    InvalidAllocation(String),

    #[error("Operator {operator} has no control attribute named '{name}'")]
    UnknownAttribute { operator: OperatorId, name: String },

    #[error("Attribute error: {0}")]
    Attribute(String),

    #[error("Another update has not finished yet")]
    UpdateInProgress,

    #[error("There is no update in progress")]
    NoUpdateInProgress,
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Attribute(e.to_string())
    }
}
