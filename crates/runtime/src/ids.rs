//! Identifiers of deployment entities.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", &self.0.simple().to_string()[..8])
            }
        }
    };
}

uuid_id!(
    /// A job vertex of the deployment graph.
    JobVertexId
);
uuid_id!(
    /// Stable deployment identity of an operator, used to key its state.
    OperatorUid
);
uuid_id!(
    /// One execution attempt of a task instance.
    ExecutionAttemptId
);
uuid_id!(
    /// A slot allocation on a worker.
    AllocationId
);

/// Checkpoint sequence number.
pub type CheckpointId = u64;

/// Version tag of regenerated partitions and the gates reading them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RescaleId(u64);

static NEXT_RESCALE_ID: AtomicU64 = AtomicU64::new(1);

impl RescaleId {
    /// Tag of partitions created at initial deployment.
    pub const DEFAULT: RescaleId = RescaleId(0);

    pub fn generate_next() -> Self {
        Self(NEXT_RESCALE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RescaleId {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for RescaleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}
