//! Building a job: the logical plan and the deployment graph side by side.
//!
//! Every plan operator runs as its own job vertex. The builder keeps both
//! views consistent (parallelism, edges, initial key groups and functions)
//! and records which deployment operator backs each plan operator.

use gearshift_plan::{
    ApplicationLogic, ExecutionPlan, KeyStateAllocation, OperatorId, DEFAULT_MAX_PARALLELISM,
};
use gearshift_runtime::{JobGraph, JobVertex, JobVertexId, OperatorUid};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::info;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
enum Keying {
    /// Keyed input, state owned per key group.
    Stateful(u32),
    /// Keyed input, no state.
    KeyedBy(u32),
}

impl Keying {
    fn num_key_groups(self) -> u32 {
        match self {
            Keying::Stateful(n) | Keying::KeyedBy(n) => n,
        }
    }
}

struct OperatorSpec {
    name: String,
    parallelism: usize,
    logic: ApplicationLogic,
    keying: Option<Keying>,
}

/// A built job, ready to be scheduled and coordinated.
pub struct StreamJob {
    pub plan: ExecutionPlan,
    pub job_graph: Arc<JobGraph>,
    /// Deployment operator of every plan operator.
    pub operator_ids: HashMap<OperatorId, OperatorUid>,
}

impl StreamJob {
    pub fn operator_uid(&self, id: OperatorId) -> Option<OperatorUid> {
        self.operator_ids.get(&id).copied()
    }
}

/// Builder for [`StreamJob`].
pub struct JobBuilder {
    name: String,
    operators: BTreeMap<OperatorId, OperatorSpec>,
    edges: Vec<(OperatorId, OperatorId)>,
}

impl JobBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operators: BTreeMap::new(),
            edges: Vec::new(),
        }
    }

    /// Add an operator.
    pub fn operator(
        mut self,
        id: OperatorId,
        name: impl Into<String>,
        parallelism: usize,
        logic: ApplicationLogic,
    ) -> Self {
        self.operators.insert(
            id,
            OperatorSpec {
                name: name.into(),
                parallelism,
                logic,
                keying: None,
            },
        );
        self
    }

    /// Mark `id` as keyed and stateful over `num_key_groups` key groups,
    /// split contiguously across its tasks.
    pub fn stateful(mut self, id: OperatorId, num_key_groups: u32) -> Self {
        if let Some(spec) = self.operators.get_mut(&id) {
            spec.keying = Some(Keying::Stateful(num_key_groups));
        }
        self
    }

    /// Mark `id` as keyed without state: only its inputs are routed by key.
    pub fn key_by(mut self, id: OperatorId, num_key_groups: u32) -> Self {
        if let Some(spec) = self.operators.get_mut(&id) {
            spec.keying = Some(Keying::KeyedBy(num_key_groups));
        }
        self
    }

    pub fn edge(mut self, from: OperatorId, to: OperatorId) -> Self {
        self.edges.push((from, to));
        self
    }

    pub fn build(self) -> Result<StreamJob> {
        let mut builder = ExecutionPlan::builder();
        for (id, spec) in &self.operators {
            builder.add_operator(*id, spec.name.clone(), spec.parallelism, spec.logic.clone());
            if let Some(Keying::Stateful(n)) = spec.keying {
                builder.key_state_allocation(*id, KeyStateAllocation::contiguous(spec.parallelism, n));
            }
        }
        for &(from, to) in &self.edges {
            builder.connect(from, to);
        }
        let mut plan = builder.build()?;

        for (id, spec) in &self.operators {
            if let Some(Keying::KeyedBy(n)) = spec.keying {
                let parents: Vec<OperatorId> = plan.parents(*id).collect();
                for parent in parents {
                    plan.set_key_mapping(parent, *id, KeyStateAllocation::contiguous(spec.parallelism, n))?;
                }
            }
        }

        let mut job_graph = JobGraph::new(self.name.clone());
        let mut operator_ids = HashMap::new();
        let mut vertex_ids: HashMap<OperatorId, JobVertexId> = HashMap::new();

        for id in topological_order(&plan) {
            let spec = self
                .operators
                .get(&id)
                .ok_or_else(|| Error::Lookup(format!("operator {} was never declared", id)))?;
            let uid = OperatorUid::generate();
            job_graph.register_operator(uid, spec.name.clone(), spec.logic.udf().cloned());

            let mut vertex = JobVertex::new(spec.name.clone())
                .with_operator(uid)
                .with_parallelism(spec.parallelism);
            for parent in plan.parents(id) {
                let input = vertex_ids
                    .get(&parent)
                    .ok_or_else(|| Error::Lookup(format!("parent {} of {} not placed", parent, id)))?;
                vertex = vertex.with_input(*input);
            }
            if let Some(keying) = spec.keying {
                let n = keying.num_key_groups();
                vertex = vertex
                    .with_max_parallelism(n)
                    .with_key_state_allocation(KeyStateAllocation::contiguous(spec.parallelism, n));
            } else {
                vertex = vertex.with_max_parallelism(DEFAULT_MAX_PARALLELISM);
            }

            vertex_ids.insert(id, vertex.id);
            operator_ids.insert(id, uid);
            job_graph.add_vertex(vertex);
        }
        job_graph.validate()?;

        info!(
            job = %self.name,
            operators = operator_ids.len(),
            edges = self.edges.len(),
            "Job built"
        );
        Ok(StreamJob {
            plan,
            job_graph: Arc::new(job_graph),
            operator_ids,
        })
    }
}

/// Operators of an acyclic plan, every operator after its parents.
fn topological_order(plan: &ExecutionPlan) -> Vec<OperatorId> {
    let mut in_degree: BTreeMap<OperatorId, usize> = plan
        .operator_ids()
        .map(|id| (id, plan.num_parents(id)))
        .collect();
    let mut ready: VecDeque<OperatorId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(in_degree.len());
    while let Some(id) = ready.pop_front() {
        order.push(id);
        for child in plan.children(id) {
            if let Some(degree) = in_degree.get_mut(&child) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(child);
                }
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logic() -> ApplicationLogic {
        ApplicationLogic::default()
    }

    #[test]
    fn test_build_keeps_both_views_consistent() {
        let (source, counter, sink) = (1, 2, 3);
        let job = JobBuilder::new("count")
            .operator(sink, "sink", 1, logic())
            .operator(counter, "counter", 2, logic())
            .operator(source, "source", 1, logic())
            .stateful(counter, 16)
            .edge(source, counter)
            .edge(counter, sink)
            .build()
            .unwrap();

        let vertices = job.job_graph.vertices();
        assert_eq!(vertices.len(), 3);
        assert_eq!(vertices[0].name, "source");
        assert_eq!(vertices[1].inputs, vec![vertices[0].id]);
        assert_eq!(vertices[1].max_parallelism, 16);

        let descriptor = job.plan.descriptor(counter).unwrap();
        assert!(descriptor.is_stateful());
        assert_eq!(
            job.plan.descriptor(source).unwrap().key_mapping_to(counter),
            Some(descriptor.key_state_allocation())
        );
        assert_eq!(
            vertices[1].key_state_allocation.as_ref(),
            Some(descriptor.key_state_allocation())
        );
        let uid = job.operator_uid(counter).unwrap();
        assert_eq!(job.job_graph.vertex_of_operator(uid).unwrap().name, "counter");
    }

    #[test]
    fn test_key_by_routes_without_state() {
        let (source, mapper) = (1, 2);
        let job = JobBuilder::new("route")
            .operator(source, "source", 1, logic())
            .operator(mapper, "mapper", 3, logic())
            .key_by(mapper, 12)
            .edge(source, mapper)
            .build()
            .unwrap();

        assert!(!job.plan.descriptor(mapper).unwrap().is_stateful());
        let routing = job.plan.descriptor(source).unwrap().key_mapping_to(mapper).unwrap();
        assert_eq!(routing.parallelism(), 3);
        assert_eq!(routing.keys_of(2), Some(&[8, 9, 10, 11][..]));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let result = JobBuilder::new("loop")
            .operator(1, "a", 1, logic())
            .operator(2, "b", 1, logic())
            .edge(1, 2)
            .edge(2, 1)
            .build();
        assert!(matches!(result, Err(Error::Plan(gearshift_plan::Error::Cycle(_)))));
    }
}
