//! The execution graph of a running job.

use dashmap::DashMap;
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::checkpoint::CheckpointCoordinator;
use crate::execution::{DeploymentContext, ExecutionJobVertex};
use crate::gateway::TaskManagerGateway;
use crate::ids::{ExecutionAttemptId, JobVertexId, RescaleId};
use crate::job_graph::JobGraph;
use crate::slot_pool::SlotPool;
use crate::Result;

/// Job vertices of a job with their task instances.
pub struct ExecutionGraph {
    job_graph: Arc<JobGraph>,
    job_vertices: Vec<Arc<ExecutionJobVertex>>,
    checkpoints: Arc<CheckpointCoordinator>,
    context: Arc<DeploymentContext>,
}

impl ExecutionGraph {
    pub fn new(
        job_graph: Arc<JobGraph>,
        slot_pool: Arc<SlotPool>,
        checkpoints: Arc<CheckpointCoordinator>,
        rpc_timeout: Duration,
    ) -> Result<Self> {
        job_graph.validate()?;
        let context = Arc::new(DeploymentContext {
            job_graph: job_graph.clone(),
            partitions: DashMap::new(),
            slot_pool,
            rpc_timeout,
        });
        let job_vertices = job_graph
            .vertices()
            .iter()
            .map(|v| ExecutionJobVertex::new(v.clone(), context.clone()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            job_graph,
            job_vertices,
            checkpoints,
            context,
        })
    }

    pub fn job_graph(&self) -> &Arc<JobGraph> {
        &self.job_graph
    }

    pub fn job_vertex(&self, id: JobVertexId) -> Option<Arc<ExecutionJobVertex>> {
        self.job_vertices.iter().find(|v| v.id() == id).cloned()
    }

    /// Job vertices, producers first.
    pub fn job_vertices(&self) -> &[Arc<ExecutionJobVertex>] {
        &self.job_vertices
    }

    /// Job vertices reading from `id`.
    pub fn consumers_of(&self, id: JobVertexId) -> Vec<Arc<ExecutionJobVertex>> {
        self.job_vertices
            .iter()
            .filter(|v| v.job_vertex().inputs.contains(&id))
            .cloned()
            .collect()
    }

    pub fn checkpoint_coordinator(&self) -> &Arc<CheckpointCoordinator> {
        &self.checkpoints
    }

    pub fn slot_pool(&self) -> &Arc<SlotPool> {
        &self.context.slot_pool
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.context.rpc_timeout
    }

    /// Deploy every task, register them for checkpoints and start the
    /// checkpoint scheduler.
    pub async fn schedule(&self) -> Result<()> {
        let mut registered: Vec<(ExecutionAttemptId, Arc<dyn TaskManagerGateway>)> = Vec::new();

        for job_vertex in &self.job_vertices {
            let vertices = job_vertex.task_vertices();
            for vertex in &vertices {
                vertex.allocate_and_assign_slot(RescaleId::DEFAULT)?;
            }
            try_join_all(vertices.iter().map(|v| v.deploy())).await?;

            for vertex in &vertices {
                if let Some(execution) = vertex.current_execution() {
                    if let Some(slot) = execution.slot {
                        registered.push((execution.attempt_id, slot.gateway));
                    }
                }
            }
            info!(job_vertex = %job_vertex.name(), parallelism = vertices.len(), "Job vertex deployed");
        }

        self.checkpoints.add_vertices(registered);
        self.checkpoints.start_checkpoint_scheduler();
        info!(job = %self.job_graph.name, "Job scheduled");
        Ok(())
    }

    /// Whether every task instance is running.
    pub fn is_running(&self) -> bool {
        self.job_vertices
            .iter()
            .flat_map(|v| v.task_vertices())
            .all(|v| v.is_running())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointConfig, PendingCheckpoint, RescalepointAcknowledgeListener};
    use crate::descriptor::RescaleOptions;
    use crate::execution::ExecutionState;
    use crate::executor::{LocalTaskExecutor, RpcKind, TaskState};
    use crate::ids::{CheckpointId, OperatorUid};
    use crate::job_graph::JobVertex;
    use gearshift_plan::KeyStateAllocation;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Cluster {
        graph: ExecutionGraph,
        executors: Vec<Arc<LocalTaskExecutor>>,
        source: JobVertexId,
        counter: JobVertexId,
        counter_op: OperatorUid,
    }

    impl Cluster {
        fn executor_of(&self, attempt: ExecutionAttemptId) -> Arc<LocalTaskExecutor> {
            self.executors
                .iter()
                .find(|e| e.task(attempt).is_some())
                .cloned()
                .unwrap()
        }
    }

    fn cluster(config: CheckpointConfig, slots: usize) -> Cluster {
        let checkpoints = CheckpointCoordinator::new(config);
        let pool = Arc::new(SlotPool::default());
        let executors: Vec<_> = (0..2)
            .map(|i| Arc::new(LocalTaskExecutor::new(format!("worker-{}", i), checkpoints.responder())))
            .collect();
        for executor in &executors {
            pool.register_worker(executor.worker_id().to_string(), executor.clone(), slots);
        }

        let (source_op, counter_op) = (OperatorUid::generate(), OperatorUid::generate());
        let mut job_graph = JobGraph::new("count");
        job_graph.register_operator(source_op, "source", None);
        job_graph.register_operator(counter_op, "counter", None);
        let source = JobVertex::new("source").with_operator(source_op);
        let counter = JobVertex::new("counter")
            .with_operator(counter_op)
            .with_parallelism(2)
            .with_input(source.id)
            .with_key_state_allocation(KeyStateAllocation::contiguous(2, 8));
        let (source_id, counter_id) = (source.id, counter.id);
        job_graph.add_vertex(source).add_vertex(counter);

        let graph = ExecutionGraph::new(Arc::new(job_graph), pool, checkpoints, Duration::from_secs(1)).unwrap();
        Cluster {
            graph,
            executors,
            source: source_id,
            counter: counter_id,
            counter_op,
        }
    }

    #[derive(Default)]
    struct Listener {
        checkpoint_id: AtomicU64,
        acks: Mutex<Vec<ExecutionAttemptId>>,
    }

    impl RescalepointAcknowledgeListener for Listener {
        fn set_checkpoint_id(&self, checkpoint_id: CheckpointId) {
            self.checkpoint_id.store(checkpoint_id, Ordering::SeqCst);
        }

        fn on_rescalepoint_acknowledge(&self, attempt: ExecutionAttemptId, _checkpoint: &PendingCheckpoint) {
            self.acks.lock().push(attempt);
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_schedule_deploys_all_tasks() {
        let cluster = cluster(CheckpointConfig::default(), 4);
        cluster.graph.schedule().await.unwrap();

        assert!(cluster.graph.is_running());
        assert_eq!(cluster.graph.checkpoint_coordinator().num_registered_tasks(), 3);
        assert_eq!(cluster.graph.slot_pool().total_available_slots(), 5);
        assert_eq!(cluster.graph.consumers_of(cluster.source).len(), 1);

        let counter = cluster.graph.job_vertex(cluster.counter).unwrap();
        let second = counter.task_vertex(1).unwrap();
        let range = second.key_group_range().unwrap();
        assert_eq!(range.key_groups(), &[4, 5, 6, 7]);
        let executor = cluster.executor_of(second.attempt_id().unwrap());
        assert_eq!(executor.task(second.attempt_id().unwrap()).unwrap().key_group_range(), Some(range));
    }

    #[tokio::test]
    async fn test_deploy_fails_without_slots() {
        let cluster = cluster(CheckpointConfig::default(), 1);
        assert!(matches!(
            cluster.graph.schedule().await,
            Err(crate::Error::NoAvailableSlot(_))
        ));
    }

    #[tokio::test]
    async fn test_rescale_point_pauses_requested_tasks() {
        let cluster = cluster(CheckpointConfig::default(), 4);
        cluster.graph.schedule().await.unwrap();
        let checkpoints = cluster.graph.checkpoint_coordinator().clone();
        let listener = Arc::new(Listener::default());
        checkpoints.set_rescalepoint_acknowledge_listener(listener.clone());

        let counter = cluster.graph.job_vertex(cluster.counter).unwrap();
        let first = counter.task_vertex(0).unwrap();
        let attempt = first.attempt_id().unwrap();
        let executor = cluster.executor_of(attempt);
        executor.process_record(attempt, 1).unwrap();
        executor.process_record(attempt, 1).unwrap();

        first
            .schedule_for_inter_task_sync(crate::SyncFlag::NeedSync, RescaleId::generate_next())
            .await
            .unwrap();
        let checkpoint_id = checkpoints.trigger_rescale_point().unwrap();
        assert_eq!(listener.checkpoint_id.load(Ordering::SeqCst), checkpoint_id);
        settle().await;

        assert_eq!(listener.acks.lock().len(), 3);
        assert_eq!(executor.task(attempt).unwrap().get_state(), TaskState::Paused);
        assert_eq!(executor.process_record(attempt, 1).unwrap(), false);

        let completed = checkpoints.latest_completed_checkpoint().unwrap();
        assert_eq!(completed.checkpoint_id, checkpoint_id);
        let state = completed.operator_states[&cluster.counter_op].merged();
        assert_eq!(state.get(1), Some(&2u64.to_le_bytes()[..]));
        assert!(executor.rpc_count(RpcKind::NotifyCheckpointComplete, Some(attempt)) >= 1);

        first
            .schedule_for_inter_task_sync(crate::SyncFlag::NeedResume, RescaleId::DEFAULT)
            .await
            .unwrap();
        assert_eq!(executor.task(attempt).unwrap().get_state(), TaskState::Running);
    }

    #[tokio::test]
    async fn test_removed_task_does_not_block_checkpoint() {
        let cluster = cluster(CheckpointConfig::default(), 4);
        cluster.graph.schedule().await.unwrap();
        let checkpoints = cluster.graph.checkpoint_coordinator().clone();
        for executor in &cluster.executors {
            executor.set_drop_checkpoint_acks(true);
        }
        checkpoints.trigger_checkpoint(crate::CheckpointType::Periodic).unwrap();
        assert_eq!(checkpoints.num_pending_checkpoints(), 1);

        for job_vertex in cluster.graph.job_vertices() {
            for vertex in job_vertex.task_vertices() {
                checkpoints.remove_task(vertex.attempt_id().unwrap());
            }
        }
        assert_eq!(checkpoints.num_pending_checkpoints(), 0);
        assert!(checkpoints.latest_completed_checkpoint().is_some());
    }

    #[tokio::test]
    async fn test_aborted_rescale_point_is_dropped() {
        let cluster = cluster(CheckpointConfig::default(), 4);
        cluster.graph.schedule().await.unwrap();
        let checkpoints = cluster.graph.checkpoint_coordinator().clone();
        for executor in &cluster.executors {
            executor.set_drop_checkpoint_acks(true);
        }
        let checkpoint_id = checkpoints.trigger_rescale_point().unwrap();
        assert_eq!(checkpoints.num_pending_checkpoints(), 1);

        assert!(checkpoints.abort_pending(checkpoint_id));
        assert!(!checkpoints.abort_pending(checkpoint_id));
        assert_eq!(checkpoints.num_pending_checkpoints(), 0);
        assert!(checkpoints.latest_completed_checkpoint().is_none());
    }

    #[tokio::test]
    async fn test_scheduler_start_stop() {
        let cluster = cluster(
            CheckpointConfig::default().with_interval(Duration::from_secs(3600)),
            4,
        );
        cluster.graph.schedule().await.unwrap();
        let checkpoints = cluster.graph.checkpoint_coordinator();
        assert!(checkpoints.is_scheduler_running());
        checkpoints.stop_checkpoint_scheduler();
        assert!(!checkpoints.is_scheduler_running());
        checkpoints.start_checkpoint_scheduler();
        assert!(checkpoints.is_scheduler_running());
        checkpoints.stop_checkpoint_scheduler();
    }

    #[tokio::test]
    async fn test_rescale_creates_and_removes_candidates() {
        let cluster = cluster(CheckpointConfig::default(), 4);
        cluster.graph.schedule().await.unwrap();
        let counter = cluster.graph.job_vertex(cluster.counter).unwrap();

        let grown = counter.rescale(3);
        assert_eq!(grown.created.len(), 1);
        assert_eq!(counter.parallelism(), 3);
        let fresh = &grown.created[0];
        assert_eq!(fresh.subtask_index(), 2);
        assert_eq!(fresh.execution_state(), None);

        fresh.allocate_and_assign_slot(RescaleId::generate_next()).unwrap();
        fresh.deploy().await.unwrap();
        assert!(fresh.is_running());

        let shrunk = counter.rescale(1);
        assert_eq!(shrunk.removed.len(), 2);
        for vertex in &shrunk.removed {
            vertex.cancel().await.unwrap();
            assert_eq!(vertex.execution_state(), Some(ExecutionState::Canceled));
        }
        let executor = cluster.executor_of(fresh.attempt_id().unwrap());
        assert!(!executor.released_partitions().is_empty());
        assert_eq!(cluster.graph.slot_pool().total_available_slots(), 6);
    }

    #[tokio::test]
    async fn test_partition_and_gate_versions() {
        let cluster = cluster(CheckpointConfig::default(), 4);
        cluster.graph.schedule().await.unwrap();
        let source = cluster.graph.job_vertex(cluster.source).unwrap().task_vertex(0).unwrap();
        let counter = cluster.graph.job_vertex(cluster.counter).unwrap().task_vertex(0).unwrap();

        let rescale_id = RescaleId::generate_next();
        source.update_produced_partitions(rescale_id);
        source.schedule_rescale(RescaleOptions::PrepareOnly, None).await.unwrap();
        let source_executor = cluster.executor_of(source.attempt_id().unwrap());
        assert_eq!(
            source_executor.task(source.attempt_id().unwrap()).unwrap().produced_partition(),
            rescale_id
        );

        counter.schedule_rescale(RescaleOptions::GatesOnly, None).await.unwrap();
        let counter_attempt = counter.attempt_id().unwrap();
        let gates = cluster.executor_of(counter_attempt).task(counter_attempt).unwrap().input_gates();
        assert_eq!(gates.len(), 1);
        assert_eq!(gates[0].partition_rescale_id, rescale_id);
    }

    #[tokio::test]
    async fn test_partition_update_reaches_input_gates() {
        let cluster = cluster(CheckpointConfig::default(), 4);
        cluster.graph.schedule().await.unwrap();
        let source = cluster.graph.job_vertex(cluster.source).unwrap().task_vertex(0).unwrap();
        let counter = cluster.graph.job_vertex(cluster.counter).unwrap().task_vertex(1).unwrap();
        let attempt = counter.attempt_id().unwrap();
        let executor = cluster.executor_of(attempt);

        let rescale_id = RescaleId::generate_next();
        source.update_produced_partitions(rescale_id);
        counter.schedule_partition_update().await.unwrap();

        assert_eq!(executor.rpc_count(RpcKind::UpdatePartitions, Some(attempt)), 1);
        let gates = executor.task(attempt).unwrap().input_gates();
        assert_eq!(gates[0].upstream, cluster.source);
        assert_eq!(gates[0].partition_rescale_id, rescale_id);

        let stray = crate::descriptor::InputGateDescriptor {
            upstream: cluster.counter,
            partition_rescale_id: rescale_id,
        };
        assert!(matches!(
            executor.update_partitions(attempt, vec![stray], Duration::from_secs(1)).await,
            Err(crate::Error::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_back_pressure_follows_pause() {
        let cluster = cluster(CheckpointConfig::default(), 4);
        cluster.graph.schedule().await.unwrap();
        let counter = cluster.graph.job_vertex(cluster.counter).unwrap().task_vertex(0).unwrap();
        let attempt = counter.attempt_id().unwrap();
        let executor = cluster.executor_of(attempt);

        let sample = counter.request_back_pressure(7).await.unwrap();
        assert_eq!(sample.attempt_id, attempt);
        assert_eq!(sample.request_id, 7);
        assert_eq!(sample.ratio, 0.0);

        counter
            .schedule_for_inter_task_sync(crate::SyncFlag::NeedSync, RescaleId::generate_next())
            .await
            .unwrap();
        executor.task(attempt).unwrap().pause_controller().ack_if_pause();
        assert_eq!(counter.request_back_pressure(8).await.unwrap().ratio, 1.0);
        assert_eq!(executor.rpc_count(RpcKind::BackPressure, Some(attempt)), 2);
    }
}
