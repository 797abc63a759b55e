//! The execution plan: an arena of operator descriptors with id adjacency.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::diff::ChangeKind;
use crate::keys::KeyStateAllocation;
use crate::logic::{same_udf, ApplicationLogic, Udf};
use crate::operator::{OperatorDescriptor, OperatorId};
use crate::{Error, Result};

/// Logical view of a running job.
///
/// Operators are stored by id; the `parents` and `children` indexes hold the
/// edges. Cloning (or [`ExecutionPlan::copy`]) yields an independent plan that
/// still shares user-function instances with the original, so function
/// identity survives the copy.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    operators: BTreeMap<OperatorId, OperatorDescriptor>,
    parents: BTreeMap<OperatorId, BTreeSet<OperatorId>>,
    children: BTreeMap<OperatorId, BTreeSet<OperatorId>>,
    version: u64,
}

impl ExecutionPlan {
    pub fn builder() -> ExecutionPlanBuilder {
        ExecutionPlanBuilder::new()
    }

    /// Independent copy for a controller to edit.
    pub fn copy(&self) -> ExecutionPlan {
        self.clone()
    }

    /// Incremented on every mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn operator(&self, id: OperatorId) -> Option<&OperatorDescriptor> {
        self.operators.get(&id)
    }

    /// Like [`ExecutionPlan::operator`] but failing on unknown ids.
    pub fn descriptor(&self, id: OperatorId) -> Result<&OperatorDescriptor> {
        self.operators.get(&id).ok_or(Error::UnknownOperator(id))
    }

    fn descriptor_mut(&mut self, id: OperatorId) -> Result<&mut OperatorDescriptor> {
        self.operators.get_mut(&id).ok_or(Error::UnknownOperator(id))
    }

    /// All operators in id order.
    pub fn operators(&self) -> impl Iterator<Item = &OperatorDescriptor> {
        self.operators.values()
    }

    pub fn operator_ids(&self) -> impl Iterator<Item = OperatorId> + '_ {
        self.operators.keys().copied()
    }

    pub fn contains(&self, id: OperatorId) -> bool {
        self.operators.contains_key(&id)
    }

    pub fn parents(&self, id: OperatorId) -> impl Iterator<Item = OperatorId> + '_ {
        self.parents.get(&id).into_iter().flatten().copied()
    }

    pub fn children(&self, id: OperatorId) -> impl Iterator<Item = OperatorId> + '_ {
        self.children.get(&id).into_iter().flatten().copied()
    }

    pub fn num_parents(&self, id: OperatorId) -> usize {
        self.parents.get(&id).map_or(0, BTreeSet::len)
    }

    /// Operators without parents.
    pub fn sources(&self) -> impl Iterator<Item = &OperatorDescriptor> {
        self.operators
            .values()
            .filter(|op| self.num_parents(op.id()) == 0)
    }

    pub fn is_source(&self, id: OperatorId) -> bool {
        self.contains(id) && self.num_parents(id) == 0
    }

    fn require_edge(&self, parent: OperatorId, child: OperatorId) -> Result<()> {
        self.descriptor(parent)?;
        self.descriptor(child)?;
        if self.children.get(&parent).is_some_and(|c| c.contains(&child)) {
            Ok(())
        } else {
            Err(Error::UnknownEdge { parent, child })
        }
    }

    // ========================================================================
    // Coordinator-side setters
    // ========================================================================

    /// Replace the key-state allocation of `id` and mirror it into the key
    /// mapping every parent keeps toward `id`.
    pub fn set_key_state_allocation(
        &mut self,
        id: OperatorId,
        allocation: KeyStateAllocation,
    ) -> Result<()> {
        self.descriptor(id)?;
        let parents: Vec<OperatorId> = self.parents(id).collect();
        for parent in parents {
            self.descriptor_mut(parent)?
                .set_key_mapping(id, allocation.clone());
        }
        self.descriptor_mut(id)?.set_key_state_allocation(allocation);
        self.version += 1;
        Ok(())
    }

    /// Replace the routing of `id` toward `child`. A stateful child takes the
    /// same allocation as its own key state.
    pub fn set_key_mapping(
        &mut self,
        id: OperatorId,
        child: OperatorId,
        allocation: KeyStateAllocation,
    ) -> Result<()> {
        self.require_edge(id, child)?;
        self.descriptor_mut(id)?
            .set_key_mapping(child, allocation.clone());
        let child_descriptor = self.descriptor_mut(child)?;
        if child_descriptor.is_stateful() {
            child_descriptor.set_key_state_allocation(allocation);
        }
        self.version += 1;
        Ok(())
    }

    pub fn set_parallelism(&mut self, id: OperatorId, parallelism: usize) -> Result<()> {
        self.descriptor_mut(id)?.set_parallelism(parallelism);
        self.version += 1;
        Ok(())
    }

    pub fn set_udf(&mut self, id: OperatorId, udf: Udf) -> Result<()> {
        self.descriptor_mut(id)?.logic_mut().set_udf(udf);
        self.version += 1;
        Ok(())
    }

    /// Push staged control-attribute values of `id` into the operator.
    pub fn apply_control_attributes(&mut self, id: OperatorId) -> Result<Vec<String>> {
        let applied = self.descriptor_mut(id)?.logic_mut().apply_staged()?;
        if !applied.is_empty() {
            self.version += 1;
        }
        Ok(applied)
    }

    // ========================================================================
    // Controller-side setters
    // ========================================================================

    /// Propose a new key set for a stateful, single-input operator.
    pub fn set_key_set(&mut self, id: OperatorId, allocation: KeyStateAllocation) -> Result<()> {
        if !self.descriptor(id)?.is_stateful() {
            return Err(Error::Stateless(id));
        }
        if self.num_parents(id) > 1 {
            return Err(Error::MultipleInputs(id));
        }
        self.set_key_state_allocation(id, allocation)
    }

    /// Propose a new routing from `id` to a single-input `child`.
    pub fn set_key_mapping_to(
        &mut self,
        id: OperatorId,
        child: OperatorId,
        allocation: KeyStateAllocation,
    ) -> Result<()> {
        self.require_edge(id, child)?;
        if self.num_parents(child) > 1 {
            return Err(Error::MultipleInputs(child));
        }
        self.set_key_mapping(id, child, allocation)
    }

    /// Stage a control-attribute value on `id`.
    pub fn set_control_attribute(&mut self, id: OperatorId, name: &str, value: Value) -> Result<()> {
        if !self.descriptor_mut(id)?.logic_mut().stage_attribute(name, value) {
            return Err(Error::UnknownAttribute {
                operator: id,
                name: name.to_string(),
            });
        }
        self.version += 1;
        Ok(())
    }

    /// What changed per operator between `self` and `proposed`.
    ///
    /// Functions compare by identity; staged attribute values count as a
    /// function change. Operators absent from `proposed` are ignored.
    pub fn diff(&self, proposed: &ExecutionPlan) -> BTreeMap<OperatorId, BTreeSet<ChangeKind>> {
        let mut changes = BTreeMap::new();
        for held in self.operators.values() {
            let Some(next) = proposed.operator(held.id()) else {
                continue;
            };
            let mut kinds = BTreeSet::new();

            let udf_changed = match (held.udf(), next.udf()) {
                (Some(a), Some(b)) => !same_udf(a, b),
                (None, None) => false,
                _ => true,
            };
            if udf_changed || !next.application_logic().staged_attributes().is_empty() {
                kinds.insert(ChangeKind::Udf);
            }
            if held.key_mapping() != next.key_mapping() {
                kinds.insert(ChangeKind::KeyMapping);
            }
            if held.key_state_allocation() != next.key_state_allocation() {
                kinds.insert(ChangeKind::KeyStateAllocation);
            }
            if held.parallelism() != next.parallelism() {
                kinds.insert(ChangeKind::Parallelism);
            }

            if !kinds.is_empty() {
                changes.insert(held.id(), kinds);
            }
        }
        changes
    }
}

/// Builder for [`ExecutionPlan`].
#[derive(Debug, Default)]
pub struct ExecutionPlanBuilder {
    operators: BTreeMap<OperatorId, OperatorDescriptor>,
    edges: BTreeSet<(OperatorId, OperatorId)>,
    allocations: Vec<(OperatorId, KeyStateAllocation)>,
}

impl ExecutionPlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operator.
    pub fn add_operator(
        &mut self,
        id: OperatorId,
        name: impl Into<String>,
        parallelism: usize,
        logic: ApplicationLogic,
    ) -> &mut Self {
        self.operators
            .insert(id, OperatorDescriptor::new(id, name, parallelism, logic));
        self
    }

    /// Register outgoing edges of `operator`. Every edge must start at it.
    pub fn add_children(
        &mut self,
        operator: OperatorId,
        edges: &[(OperatorId, OperatorId)],
    ) -> Result<&mut Self> {
        for &(from, to) in edges {
            if from != operator {
                return Err(Error::EdgeMismatch { operator, from, to });
            }
            self.edges.insert((from, to));
        }
        Ok(self)
    }

    /// Register incoming edges of `operator`. Every edge must end at it.
    pub fn add_parent(
        &mut self,
        operator: OperatorId,
        edges: &[(OperatorId, OperatorId)],
    ) -> Result<&mut Self> {
        for &(from, to) in edges {
            if to != operator {
                return Err(Error::EdgeMismatch { operator, from, to });
            }
            self.edges.insert((from, to));
        }
        Ok(self)
    }

    /// Add the edge `from -> to`.
    pub fn connect(&mut self, from: OperatorId, to: OperatorId) -> &mut Self {
        self.edges.insert((from, to));
        self
    }

    /// Initial key-state allocation of a keyed operator.
    pub fn key_state_allocation(
        &mut self,
        id: OperatorId,
        allocation: KeyStateAllocation,
    ) -> &mut Self {
        self.allocations.push((id, allocation));
        self
    }

    /// Validate edges and acyclicity, then apply the initial allocations.
    pub fn build(self) -> Result<ExecutionPlan> {
        let mut plan = ExecutionPlan {
            operators: self.operators,
            ..Default::default()
        };

        for &(from, to) in &self.edges {
            plan.descriptor(from)?;
            plan.descriptor(to)?;
            plan.children.entry(from).or_default().insert(to);
            plan.parents.entry(to).or_default().insert(from);
        }

        // Kahn's algorithm; whatever is left unvisited sits on a cycle.
        let mut in_degree: BTreeMap<OperatorId, usize> = plan
            .operator_ids()
            .map(|id| (id, plan.num_parents(id)))
            .collect();
        let mut ready: VecDeque<OperatorId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = ready.pop_front() {
            visited += 1;
            for child in plan.children(id) {
                if let Some(degree) = in_degree.get_mut(&child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(child);
                    }
                }
            }
        }
        if visited != plan.operators.len() {
            if let Some((id, _)) = in_degree.iter().find(|(_, degree)| **degree > 0) {
                return Err(Error::Cycle(*id));
            }
        }

        for (id, allocation) in self.allocations {
            plan.set_key_state_allocation(id, allocation)?;
        }
        plan.version = 0;
        Ok(plan)
    }
}
