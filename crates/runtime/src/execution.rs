//! Execution vertices: the task instances of a job vertex.

use dashmap::DashMap;
use gearshift_plan::{AlignedKeyGroupRange, OperatorWorkloadsAssignment};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::descriptor::{
    Acknowledge, InputGateDescriptor, OperatorDeployment, RescaleOptions, SyncFlag,
    TaskBackPressure, TaskDeploymentDescriptor, TaskRestore,
};
use crate::gateway::TaskManagerGateway;
use crate::ids::{ExecutionAttemptId, JobVertexId, OperatorUid, RescaleId};
use crate::job_graph::{JobGraph, JobVertex};
use crate::slot_pool::{LogicalSlot, SlotPool};
use crate::{Error, Result};

/// Lifecycle of an execution attempt as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionState {
    Created,
    Scheduled,
    Deploying,
    Running,
    Canceling,
    Canceled,
    Failed,
}

/// One execution attempt of a task instance.
#[derive(Debug, Clone)]
pub struct Execution {
    pub attempt_id: ExecutionAttemptId,
    pub state: ExecutionState,
    pub slot: Option<LogicalSlot>,
}

/// Shared by every vertex of an execution graph.
pub(crate) struct DeploymentContext {
    pub job_graph: Arc<JobGraph>,
    /// Current partition version produced by each job vertex.
    pub partitions: DashMap<JobVertexId, RescaleId>,
    pub slot_pool: Arc<SlotPool>,
    pub rpc_timeout: Duration,
}

#[derive(Debug)]
struct VertexInner {
    parallelism: usize,
    key_group_range: Option<AlignedKeyGroupRange>,
    restore: Option<TaskRestore>,
    rescale_id: RescaleId,
    execution: Option<Execution>,
}

/// One parallel instance of a job vertex.
pub struct ExecutionVertex {
    job_vertex_id: JobVertexId,
    subtask_index: usize,
    context: Arc<DeploymentContext>,
    inner: Mutex<VertexInner>,
}

impl ExecutionVertex {
    fn new(
        job_vertex_id: JobVertexId,
        subtask_index: usize,
        parallelism: usize,
        key_group_range: Option<AlignedKeyGroupRange>,
        context: Arc<DeploymentContext>,
    ) -> Self {
        Self {
            job_vertex_id,
            subtask_index,
            context,
            inner: Mutex::new(VertexInner {
                parallelism,
                key_group_range,
                restore: None,
                rescale_id: RescaleId::DEFAULT,
                execution: None,
            }),
        }
    }

    pub fn job_vertex_id(&self) -> JobVertexId {
        self.job_vertex_id
    }

    pub fn subtask_index(&self) -> usize {
        self.subtask_index
    }

    pub fn task_name(&self) -> String {
        let name = self
            .context
            .job_graph
            .vertex(self.job_vertex_id)
            .map(|v| v.name.as_str())
            .unwrap_or("unknown");
        format!("{} ({}/{})", name, self.subtask_index + 1, self.inner.lock().parallelism)
    }

    pub fn current_execution(&self) -> Option<Execution> {
        self.inner.lock().execution.clone()
    }

    pub fn attempt_id(&self) -> Option<ExecutionAttemptId> {
        self.inner.lock().execution.as_ref().map(|e| e.attempt_id)
    }

    pub fn execution_state(&self) -> Option<ExecutionState> {
        self.inner.lock().execution.as_ref().map(|e| e.state)
    }

    pub fn is_running(&self) -> bool {
        self.execution_state() == Some(ExecutionState::Running)
    }

    pub fn key_group_range(&self) -> Option<AlignedKeyGroupRange> {
        self.inner.lock().key_group_range.clone()
    }

    /// Set the key-group range a not yet running task will be deployed with.
    pub fn assign_key_group_range(&self, range: AlignedKeyGroupRange) {
        self.inner.lock().key_group_range = Some(range);
    }

    /// Set the state the task restores on its next deployment or state update.
    pub fn set_restore(&self, restore: TaskRestore) {
        self.inner.lock().restore = Some(restore);
    }

    pub fn pending_restore(&self) -> Option<TaskRestore> {
        self.inner.lock().restore.clone()
    }

    pub fn rescale_id(&self) -> RescaleId {
        self.inner.lock().rescale_id
    }

    fn set_parallelism(&self, parallelism: usize) {
        self.inner.lock().parallelism = parallelism;
    }

    /// Tag the partitions this task produces with `rescale_id`.
    pub fn update_produced_partitions(&self, rescale_id: RescaleId) {
        self.inner.lock().rescale_id = rescale_id;
        self.context.partitions.insert(self.job_vertex_id, rescale_id);
    }

    fn assigned_slot(&self) -> Result<(ExecutionAttemptId, Arc<dyn TaskManagerGateway>)> {
        let inner = self.inner.lock();
        match &inner.execution {
            Some(Execution {
                attempt_id,
                slot: Some(slot),
                ..
            }) => Ok((*attempt_id, slot.gateway.clone())),
            _ => Err(Error::IllegalState(format!(
                "subtask {} of {} has no deployed execution",
                self.subtask_index, self.job_vertex_id
            ))),
        }
    }

    fn set_execution_state(&self, attempt: ExecutionAttemptId, state: ExecutionState) {
        let mut inner = self.inner.lock();
        if let Some(execution) = inner.execution.as_mut() {
            if execution.attempt_id == attempt {
                execution.state = state;
            }
        }
    }

    /// Deployment descriptor reflecting the vertex's current configuration.
    pub fn task_deployment_descriptor(&self) -> Result<TaskDeploymentDescriptor> {
        let job_graph = &self.context.job_graph;
        let job_vertex = job_graph
            .vertex(self.job_vertex_id)
            .ok_or_else(|| Error::InvalidJobGraph(format!("unknown job vertex {}", self.job_vertex_id)))?;
        let operators = job_vertex
            .operators
            .iter()
            .map(|uid| OperatorDeployment {
                uid: *uid,
                name: job_graph.operator_name(*uid).unwrap_or_default(),
                udf: job_graph.operator_udf(*uid),
            })
            .collect();
        let input_gates = job_vertex
            .inputs
            .iter()
            .map(|upstream| InputGateDescriptor {
                upstream: *upstream,
                partition_rescale_id: self
                    .context
                    .partitions
                    .get(upstream)
                    .map(|r| *r)
                    .unwrap_or_default(),
            })
            .collect();

        let inner = self.inner.lock();
        let attempt_id = inner
            .execution
            .as_ref()
            .map(|e| e.attempt_id)
            .ok_or_else(|| Error::IllegalState("no execution attempt".to_string()))?;
        Ok(TaskDeploymentDescriptor {
            job_vertex_id: self.job_vertex_id,
            task_name: job_vertex.name.clone(),
            subtask_index: self.subtask_index,
            parallelism: inner.parallelism,
            attempt_id,
            is_source: job_vertex.is_source(),
            operators,
            key_group_range: inner.key_group_range.clone(),
            restore: inner.restore.clone(),
            produced_partition_rescale_id: inner.rescale_id,
            input_gates,
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create a new execution attempt and give it a slot.
    pub fn allocate_and_assign_slot(&self, rescale_id: RescaleId) -> Result<ExecutionAttemptId> {
        let attempt_id = ExecutionAttemptId::generate();
        let slot = self.context.slot_pool.allocate_slot(attempt_id)?;
        let mut inner = self.inner.lock();
        inner.rescale_id = rescale_id;
        inner.execution = Some(Execution {
            attempt_id,
            state: ExecutionState::Scheduled,
            slot: Some(slot),
        });
        Ok(attempt_id)
    }

    /// Deploy the current attempt to its slot.
    pub async fn deploy(&self) -> Result<Acknowledge> {
        let (attempt, gateway) = self.assigned_slot()?;
        let tdd = self.task_deployment_descriptor()?;
        self.set_execution_state(attempt, ExecutionState::Deploying);

        match gateway.submit_task(tdd, self.context.rpc_timeout).await {
            Ok(ack) => {
                self.set_execution_state(attempt, ExecutionState::Running);
                self.inner.lock().restore = None;
                Ok(ack)
            }
            Err(e) => {
                warn!(attempt = %attempt, error = %e, "Deployment failed");
                self.set_execution_state(attempt, ExecutionState::Failed);
                self.release_slot(attempt);
                Err(e)
            }
        }
    }

    /// Cancel the current attempt, release its partitions and its slot.
    pub async fn cancel(&self) -> Result<Acknowledge> {
        let (attempt, gateway) = self.assigned_slot()?;
        self.set_execution_state(attempt, ExecutionState::Canceling);
        let ack = gateway.cancel_task(attempt, self.context.rpc_timeout).await?;
        self.set_execution_state(attempt, ExecutionState::Canceled);

        gateway.release_partitions(&[(self.job_vertex_id, self.rescale_id())]);
        if let Some(slot) = self.current_execution().and_then(|e| e.slot) {
            gateway
                .free_slot(slot.allocation_id, "task canceled".to_string(), self.context.rpc_timeout)
                .await?;
        }
        self.release_slot(attempt);
        info!(attempt = %attempt, subtask = self.subtask_index, "Execution canceled");
        Ok(ack)
    }

    fn release_slot(&self, attempt: ExecutionAttemptId) {
        let slot = self
            .inner
            .lock()
            .execution
            .as_mut()
            .and_then(|e| e.slot.take());
        if let Some(slot) = slot {
            self.context.slot_pool.release_slot(&slot, attempt);
        }
    }

    // ========================================================================
    // Reconfiguration RPCs
    // ========================================================================

    /// Ask the running task to apply part of its descriptor. A range given
    /// here is recorded on the vertex first.
    pub async fn schedule_rescale(
        &self,
        options: RescaleOptions,
        range: Option<AlignedKeyGroupRange>,
    ) -> Result<Acknowledge> {
        if let Some(range) = range {
            self.assign_key_group_range(range);
        }
        let (attempt, gateway) = self.assigned_slot()?;
        let tdd = self.task_deployment_descriptor()?;
        debug!(attempt = %attempt, ?options, "Scheduling rescale");
        let ack = gateway
            .rescale_task(attempt, tdd, options, self.context.rpc_timeout)
            .await?;
        if options == RescaleOptions::StateOnly {
            self.inner.lock().restore = None;
        }
        Ok(ack)
    }

    pub async fn schedule_for_inter_task_sync(&self, flag: SyncFlag, rescale_id: RescaleId) -> Result<Acknowledge> {
        let (attempt, gateway) = self.assigned_slot()?;
        gateway
            .prepare_for_sync(attempt, flag, rescale_id, self.context.rpc_timeout)
            .await
    }

    /// Ship the operator's current function to the running task.
    pub async fn schedule_operator_update(&self, operator: OperatorUid) -> Result<Acknowledge> {
        let (attempt, gateway) = self.assigned_slot()?;
        let tdd = self.task_deployment_descriptor()?;
        gateway
            .update_operator(attempt, tdd, operator, self.context.rpc_timeout)
            .await
    }

    /// Point the task's input gates at the partition versions its producers
    /// currently write.
    pub async fn schedule_partition_update(&self) -> Result<Acknowledge> {
        let (attempt, gateway) = self.assigned_slot()?;
        let gates = self.task_deployment_descriptor()?.input_gates;
        gateway
            .update_partitions(attempt, gates, self.context.rpc_timeout)
            .await
    }

    pub async fn request_back_pressure(&self, request_id: u64) -> Result<TaskBackPressure> {
        let (attempt, gateway) = self.assigned_slot()?;
        gateway
            .request_task_back_pressure(attempt, request_id, self.context.rpc_timeout)
            .await
    }
}

/// Task vertices created or removed by a parallelism change.
#[derive(Default)]
pub struct RescaleCandidates {
    pub created: Vec<Arc<ExecutionVertex>>,
    pub removed: Vec<Arc<ExecutionVertex>>,
}

/// All task instances of one job vertex.
pub struct ExecutionJobVertex {
    job_vertex: JobVertex,
    context: Arc<DeploymentContext>,
    task_vertices: RwLock<Vec<Arc<ExecutionVertex>>>,
}

impl ExecutionJobVertex {
    pub(crate) fn new(job_vertex: JobVertex, context: Arc<DeploymentContext>) -> Result<Self> {
        let ranges = match &job_vertex.key_state_allocation {
            Some(allocation) => OperatorWorkloadsAssignment::unchanged(allocation.clone())
                .map_err(|e| Error::InvalidJobGraph(e.to_string()))?
                .aligned_key_group_ranges()
                .to_vec(),
            None => Vec::new(),
        };
        let task_vertices = (0..job_vertex.parallelism)
            .map(|index| {
                Arc::new(ExecutionVertex::new(
                    job_vertex.id,
                    index,
                    job_vertex.parallelism,
                    ranges.get(index).cloned(),
                    context.clone(),
                ))
            })
            .collect();

        Ok(Self {
            job_vertex,
            context,
            task_vertices: RwLock::new(task_vertices),
        })
    }

    pub fn id(&self) -> JobVertexId {
        self.job_vertex.id
    }

    pub fn name(&self) -> &str {
        &self.job_vertex.name
    }

    pub fn job_vertex(&self) -> &JobVertex {
        &self.job_vertex
    }

    /// A vertex without inputs.
    pub fn is_source(&self) -> bool {
        self.job_vertex.is_source()
    }

    pub fn parallelism(&self) -> usize {
        self.task_vertices.read().len()
    }

    pub fn task_vertices(&self) -> Vec<Arc<ExecutionVertex>> {
        self.task_vertices.read().clone()
    }

    pub fn task_vertex(&self, index: usize) -> Option<Arc<ExecutionVertex>> {
        self.task_vertices.read().get(index).cloned()
    }

    /// Resize to `new_parallelism`. New vertices are created without an
    /// execution; removed vertices keep theirs so they can be canceled.
    pub fn rescale(&self, new_parallelism: usize) -> RescaleCandidates {
        let mut vertices = self.task_vertices.write();
        let old_parallelism = vertices.len();
        let mut candidates = RescaleCandidates::default();

        if new_parallelism > old_parallelism {
            for index in old_parallelism..new_parallelism {
                let vertex = Arc::new(ExecutionVertex::new(
                    self.job_vertex.id,
                    index,
                    new_parallelism,
                    None,
                    self.context.clone(),
                ));
                candidates.created.push(vertex.clone());
                vertices.push(vertex);
            }
        } else {
            candidates.removed = vertices.split_off(new_parallelism);
        }
        for vertex in vertices.iter() {
            vertex.set_parallelism(new_parallelism);
        }

        info!(
            job_vertex = %self.job_vertex.name,
            old_parallelism,
            new_parallelism,
            created = candidates.created.len(),
            removed = candidates.removed.len(),
            "Job vertex rescaled"
        );
        candidates
    }
}
