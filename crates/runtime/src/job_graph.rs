//! Deployment job graph.
//!
//! Each job vertex is a unit of deployment: it hosts one or more operators
//! (a chain) and runs as `parallelism` task instances. The graph also keeps
//! the current function of every operator, which is what task deployment
//! descriptors ship to workers.

use gearshift_plan::{KeyStateAllocation, Udf, DEFAULT_MAX_PARALLELISM};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use crate::ids::{JobVertexId, OperatorUid};
use crate::{Error, Result};

/// A job vertex of the deployment graph.
#[derive(Debug, Clone)]
pub struct JobVertex {
    pub id: JobVertexId,
    /// Display name.
    pub name: String,
    /// Operators chained into this vertex, head first.
    pub operators: Vec<OperatorUid>,
    /// Initial number of task instances.
    pub parallelism: usize,
    /// Number of key groups of keyed state.
    pub max_parallelism: u32,
    /// Upstream job vertices.
    pub inputs: Vec<JobVertexId>,
    /// Initial key groups per task, for keyed vertices.
    pub key_state_allocation: Option<KeyStateAllocation>,
}

impl JobVertex {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: JobVertexId::generate(),
            name: name.into(),
            operators: Vec::new(),
            parallelism: 1,
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            inputs: Vec::new(),
            key_state_allocation: None,
        }
    }

    /// Chain an operator into this vertex.
    pub fn with_operator(mut self, uid: OperatorUid) -> Self {
        self.operators.push(uid);
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_max_parallelism(mut self, max_parallelism: u32) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    pub fn with_input(mut self, upstream: JobVertexId) -> Self {
        self.inputs.push(upstream);
        self
    }

    pub fn with_key_state_allocation(mut self, allocation: KeyStateAllocation) -> Self {
        self.key_state_allocation = Some(allocation);
        self
    }

    pub fn is_source(&self) -> bool {
        self.inputs.is_empty()
    }
}

#[derive(Debug, Clone)]
struct OperatorConfig {
    name: String,
    udf: Option<Udf>,
}

/// The deployment graph of a job.
#[derive(Debug)]
pub struct JobGraph {
    pub name: String,
    vertices: Vec<JobVertex>,
    operators: RwLock<HashMap<OperatorUid, OperatorConfig>>,
}

impl JobGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vertices: Vec::new(),
            operators: RwLock::new(HashMap::new()),
        }
    }

    /// Add a vertex. Vertices must be added producers first.
    pub fn add_vertex(&mut self, vertex: JobVertex) -> &mut Self {
        self.vertices.push(vertex);
        self
    }

    /// Register an operator's name and initial function.
    pub fn register_operator(&self, uid: OperatorUid, name: impl Into<String>, udf: Option<Udf>) {
        self.operators.write().insert(
            uid,
            OperatorConfig {
                name: name.into(),
                udf,
            },
        );
    }

    /// Replace the function of an operator. Fails for unknown operators.
    pub fn update_operator(&self, uid: OperatorUid, udf: Udf) -> Result<()> {
        let mut operators = self.operators.write();
        let config = operators
            .get_mut(&uid)
            .ok_or_else(|| Error::InvalidJobGraph(format!("unknown operator {}", uid)))?;
        config.udf = Some(udf);
        Ok(())
    }

    pub fn operator_udf(&self, uid: OperatorUid) -> Option<Udf> {
        self.operators.read().get(&uid).and_then(|c| c.udf.clone())
    }

    pub fn operator_name(&self, uid: OperatorUid) -> Option<String> {
        self.operators.read().get(&uid).map(|c| c.name.clone())
    }

    pub fn vertices(&self) -> &[JobVertex] {
        &self.vertices
    }

    pub fn vertex(&self, id: JobVertexId) -> Option<&JobVertex> {
        self.vertices.iter().find(|v| v.id == id)
    }

    /// Job vertex hosting `uid`.
    pub fn vertex_of_operator(&self, uid: OperatorUid) -> Option<&JobVertex> {
        self.vertices.iter().find(|v| v.operators.contains(&uid))
    }

    /// Validate the graph structure.
    pub fn validate(&self) -> Result<()> {
        let mut seen_vertices = HashSet::new();
        let mut seen_operators = HashSet::new();
        let operators = self.operators.read();

        for vertex in &self.vertices {
            for input in &vertex.inputs {
                if !seen_vertices.contains(input) {
                    return Err(Error::InvalidJobGraph(format!(
                        "input {} of vertex '{}' is unknown or added after it",
                        input, vertex.name
                    )));
                }
            }
            if vertex.operators.is_empty() {
                return Err(Error::InvalidJobGraph(format!(
                    "vertex '{}' hosts no operator",
                    vertex.name
                )));
            }
            for uid in &vertex.operators {
                if !seen_operators.insert(*uid) {
                    return Err(Error::InvalidJobGraph(format!(
                        "operator {} is hosted twice",
                        uid
                    )));
                }
                if !operators.contains_key(uid) {
                    return Err(Error::InvalidJobGraph(format!(
                        "operator {} of vertex '{}' is not registered",
                        uid, vertex.name
                    )));
                }
            }
            if vertex.parallelism == 0 {
                return Err(Error::InvalidJobGraph(format!(
                    "vertex '{}' has parallelism 0",
                    vertex.name
                )));
            }
            seen_vertices.insert(vertex.id);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with(source_op: OperatorUid, sink_op: OperatorUid) -> (JobGraph, JobVertexId) {
        let mut graph = JobGraph::new("test");
        graph.register_operator(source_op, "source", None);
        graph.register_operator(sink_op, "sink", None);
        let source = JobVertex::new("source").with_operator(source_op);
        let source_id = source.id;
        graph
            .add_vertex(source)
            .add_vertex(JobVertex::new("sink").with_operator(sink_op).with_input(source_id));
        (graph, source_id)
    }

    #[test]
    fn test_validate_ok() {
        let (source_op, sink_op) = (OperatorUid::generate(), OperatorUid::generate());
        let (graph, source_id) = graph_with(source_op, sink_op);
        assert!(graph.validate().is_ok());
        assert_eq!(graph.vertex_of_operator(source_op).map(|v| v.id), Some(source_id));
        assert!(graph.vertex(source_id).unwrap().is_source());
        assert_eq!(graph.operator_name(sink_op).as_deref(), Some("sink"));
    }

    #[test]
    fn test_validate_rejects_unknown_input() {
        let uid = OperatorUid::generate();
        let mut graph = JobGraph::new("test");
        graph.register_operator(uid, "map", None);
        graph.add_vertex(
            JobVertex::new("map")
                .with_operator(uid)
                .with_input(JobVertexId::generate()),
        );
        assert!(matches!(graph.validate(), Err(Error::InvalidJobGraph(_))));
    }

    #[test]
    fn test_update_unknown_operator_fails() {
        #[derive(Debug)]
        struct Noop;
        impl gearshift_plan::UserFunction for Noop {
            fn name(&self) -> &str {
                "noop"
            }
        }

        let graph = JobGraph::new("test");
        let udf: Udf = std::sync::Arc::new(Noop);
        assert!(graph.update_operator(OperatorUid::generate(), udf).is_err());
    }
}
