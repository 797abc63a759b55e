//! Operator descriptors: one node of the execution plan.

use std::collections::BTreeMap;
use std::fmt;

use crate::keys::KeyStateAllocation;
use crate::logic::{ApplicationLogic, Udf};

/// Logical identifier of an operator in the execution plan.
pub type OperatorId = u32;

/// Logical description of one operator.
///
/// Descriptors are owned by an [`ExecutionPlan`](crate::ExecutionPlan); edges
/// live in the plan's adjacency indexes, not in the descriptor. All mutation
/// goes through the plan so that parent/child key mappings stay consistent.
#[derive(Debug, Clone)]
pub struct OperatorDescriptor {
    id: OperatorId,
    name: String,
    parallelism: usize,
    stateful: bool,
    key_state_allocation: KeyStateAllocation,
    key_mapping: BTreeMap<OperatorId, KeyStateAllocation>,
    logic: ApplicationLogic,
}

impl OperatorDescriptor {
    pub(crate) fn new(
        id: OperatorId,
        name: impl Into<String>,
        parallelism: usize,
        logic: ApplicationLogic,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            parallelism,
            stateful: false,
            key_state_allocation: KeyStateAllocation::new(),
            key_mapping: BTreeMap::new(),
            logic,
        }
    }

    pub fn id(&self) -> OperatorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// An operator is stateful when it owns a non-empty key-state allocation.
    pub fn is_stateful(&self) -> bool {
        self.stateful
    }

    pub fn key_state_allocation(&self) -> &KeyStateAllocation {
        &self.key_state_allocation
    }

    /// Routing of this operator's output, per child.
    pub fn key_mapping(&self) -> &BTreeMap<OperatorId, KeyStateAllocation> {
        &self.key_mapping
    }

    pub fn key_mapping_to(&self, child: OperatorId) -> Option<&KeyStateAllocation> {
        self.key_mapping.get(&child)
    }

    pub fn application_logic(&self) -> &ApplicationLogic {
        &self.logic
    }

    pub fn udf(&self) -> Option<&Udf> {
        self.logic.udf()
    }

    pub(crate) fn logic_mut(&mut self) -> &mut ApplicationLogic {
        &mut self.logic
    }

    pub(crate) fn set_parallelism(&mut self, parallelism: usize) {
        self.parallelism = parallelism;
    }

    pub(crate) fn set_key_state_allocation(&mut self, allocation: KeyStateAllocation) {
        self.stateful = !allocation.is_empty();
        self.key_state_allocation = allocation;
    }

    pub(crate) fn set_key_mapping(&mut self, child: OperatorId, allocation: KeyStateAllocation) {
        self.key_mapping.insert(child, allocation);
    }
}

impl fmt::Display for OperatorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}] parallelism={} stateful={}",
            self.name, self.id, self.parallelism, self.stateful
        )?;
        if let Some(udf) = self.udf() {
            write!(f, " udf={}", udf.name())?;
        }
        for (task, keys) in self.key_state_allocation.iter() {
            write!(f, " task{}={:?}", task, keys)?;
        }
        Ok(())
    }
}
