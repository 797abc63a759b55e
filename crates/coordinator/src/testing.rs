//! In-process cluster running `source -> counter (keyed) -> sink` for tests.

use gearshift_plan::{ApplicationLogic, ControlAttribute, KeyGroup, OperatorId, Udf, UserFunction};
use gearshift_runtime::{
    CheckpointCoordinator, ExecutionAttemptId, ExecutionGraph, ExecutionVertex, LocalTaskExecutor,
    OperatorUid, RpcKind, SlotPool, TaskState, TaskStatus,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::base::AbstractCoordinator;
use crate::config::CoordinatorConfig;
use crate::job::JobBuilder;
use crate::reconfigure::ReconfigureCoordinator;

pub(crate) const SOURCE: OperatorId = 1;
pub(crate) const COUNTER: OperatorId = 2;
pub(crate) const SINK: OperatorId = 3;

#[derive(Debug)]
pub(crate) struct NamedFunction(pub String);

impl UserFunction for NamedFunction {
    fn name(&self) -> &str {
        &self.0
    }
}

pub(crate) fn udf(name: &str) -> Udf {
    Arc::new(NamedFunction(name.to_string()))
}

pub(crate) struct TestCluster {
    pub coordinator: Arc<ReconfigureCoordinator>,
    pub graph: Arc<ExecutionGraph>,
    pub executors: Vec<Arc<LocalTaskExecutor>>,
    /// Value behind the counter's `threshold` control attribute.
    pub threshold: Arc<AtomicU64>,
}

pub(crate) async fn cluster(parallelism: usize, key_groups: u32) -> TestCluster {
    cluster_with(parallelism, key_groups, CoordinatorConfig::default()).await
}

pub(crate) async fn cluster_with(parallelism: usize, key_groups: u32, config: CoordinatorConfig) -> TestCluster {
    let checkpoints = CheckpointCoordinator::new(config.checkpoint.clone());
    let pool = Arc::new(SlotPool::default());
    let executors: Vec<_> = (0..2)
        .map(|i| Arc::new(LocalTaskExecutor::new(format!("worker-{}", i), checkpoints.responder())))
        .collect();
    for executor in &executors {
        pool.register_worker(executor.worker_id().to_string(), executor.clone(), 8);
    }

    let threshold = Arc::new(AtomicU64::new(10));
    let (get, set) = (threshold.clone(), threshold.clone());
    let counter_logic = ApplicationLogic::new(udf("count-v1")).with_attribute(ControlAttribute::new(
        "threshold",
        move || get.load(Ordering::SeqCst),
        move |value: u64| set.store(value, Ordering::SeqCst),
    ));

    let job = JobBuilder::new("word-count")
        .operator(SOURCE, "source", 1, ApplicationLogic::new(udf("source")))
        .operator(COUNTER, "counter", parallelism, counter_logic)
        .operator(SINK, "sink", 1, ApplicationLogic::new(udf("sink")))
        .stateful(COUNTER, key_groups)
        .edge(SOURCE, COUNTER)
        .edge(COUNTER, SINK)
        .build()
        .unwrap();

    let graph = Arc::new(
        ExecutionGraph::new(job.job_graph.clone(), pool, checkpoints, config.rpc_timeout()).unwrap(),
    );
    graph.schedule().await.unwrap();

    let base = AbstractCoordinator::new(job.plan, job.operator_ids, graph.clone()).unwrap();
    let coordinator = Arc::new(ReconfigureCoordinator::new(base, config).unwrap());
    TestCluster {
        coordinator,
        graph,
        executors,
        threshold,
    }
}

/// Let spawned acknowledgement tasks run.
pub(crate) async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

impl TestCluster {
    pub fn vertices(&self, operator: OperatorId) -> Vec<Arc<ExecutionVertex>> {
        self.coordinator
            .base()
            .job_vertex_of(operator)
            .unwrap()
            .task_vertices()
    }

    pub fn counter_uid(&self) -> OperatorUid {
        self.coordinator.base().operator_uid(COUNTER).unwrap()
    }

    pub fn attempt(&self, operator: OperatorId, subtask: usize) -> ExecutionAttemptId {
        self.vertices(operator)[subtask].attempt_id().unwrap()
    }

    pub fn executor_of(&self, attempt: ExecutionAttemptId) -> Arc<LocalTaskExecutor> {
        self.executors
            .iter()
            .find(|e| e.task(attempt).is_some())
            .cloned()
            .unwrap()
    }

    pub fn task(&self, operator: OperatorId, subtask: usize) -> Arc<TaskStatus> {
        let attempt = self.attempt(operator, subtask);
        self.executor_of(attempt).task(attempt).unwrap()
    }

    pub fn task_state(&self, operator: OperatorId, subtask: usize) -> TaskState {
        self.task(operator, subtask).get_state()
    }

    /// Subtask of the counter whose deployed range holds `key_group`.
    pub fn owner(&self, key_group: KeyGroup) -> Option<usize> {
        (0..self.vertices(COUNTER).len()).find(|subtask| {
            self.task(COUNTER, *subtask)
                .key_group_range()
                .is_some_and(|r| r.contains(key_group))
        })
    }

    /// Route `n` records of `key_group` to the counter task owning it.
    pub fn feed(&self, key_group: KeyGroup, n: u64) {
        let subtask = self.owner(key_group).unwrap();
        let attempt = self.attempt(COUNTER, subtask);
        let executor = self.executor_of(attempt);
        for _ in 0..n {
            assert!(executor.process_record(attempt, key_group).unwrap());
        }
    }

    /// Count of `key_group` held by the task owning it.
    pub fn count(&self, key_group: KeyGroup) -> u64 {
        let subtask = self.owner(key_group).unwrap();
        let attempt = self.attempt(COUNTER, subtask);
        self.executor_of(attempt).count_of(attempt, key_group).unwrap_or(0)
    }

    /// Key groups with state in a counter task.
    pub fn state_key_groups(&self, subtask: usize) -> Vec<KeyGroup> {
        self.task(COUNTER, subtask)
            .keyed_state(self.counter_uid())
            .key_groups()
            .collect()
    }

    pub fn rpc_count(&self, kind: RpcKind, attempt: Option<ExecutionAttemptId>) -> usize {
        self.executors.iter().map(|e| e.rpc_count(kind, attempt)).sum()
    }

    pub fn set_drop_checkpoint_acks(&self, drop: bool) {
        self.executors.iter().for_each(|e| e.set_drop_checkpoint_acks(drop));
    }

    pub fn set_fail_rpcs(&self, fail: bool) {
        self.executors.iter().for_each(|e| e.set_fail_rpcs(fail));
    }
}
