//! The demo job: `source -> word-count (keyed) -> sink` on in-process workers.

use anyhow::{Context, Result};
use gearshift_coordinator::{
    AbstractCoordinator, CoordinatorConfig, JobBuilder, ReconfigurationApi, ReconfigureCoordinator,
};
use gearshift_plan::{ApplicationLogic, ControlAttribute, KeyGroup, OperatorId, Udf, UserFunction};
use gearshift_runtime::{CheckpointCoordinator, ExecutionAttemptId, ExecutionGraph, LocalTaskExecutor, SlotPool};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub const SOURCE: OperatorId = 1;
pub const WORD_COUNT: OperatorId = 2;
pub const SINK: OperatorId = 3;

#[derive(Debug)]
pub struct NamedFunction {
    name: String,
}

impl NamedFunction {
    pub fn udf(name: impl Into<String>) -> Udf {
        Arc::new(Self { name: name.into() })
    }

    /// A version of the word-count function.
    pub fn word_count(version: u32) -> Udf {
        Self::udf(format!("word-count-v{}", version))
    }
}

impl UserFunction for NamedFunction {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Shape of the demo cluster.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub workers: usize,
    pub slots: usize,
    pub parallelism: usize,
    pub key_groups: u32,
}

pub struct DemoCluster {
    pub api: Arc<ReconfigurationApi>,
    pub graph: Arc<ExecutionGraph>,
    executors: Vec<Arc<LocalTaskExecutor>>,
    key_groups: u32,
    /// Backs the word-count `min_count` control attribute.
    min_count: Arc<AtomicU64>,
}

impl DemoCluster {
    /// Deploy the job and put a coordinator in front of it.
    pub async fn start(settings: &ClusterSettings, config: CoordinatorConfig) -> Result<Self> {
        let checkpoints = CheckpointCoordinator::new(config.checkpoint.clone());
        let pool = Arc::new(SlotPool::default());
        let executors: Vec<_> = (0..settings.workers)
            .map(|i| Arc::new(LocalTaskExecutor::new(format!("worker-{}", i), checkpoints.responder())))
            .collect();
        for executor in &executors {
            pool.register_worker(executor.worker_id().to_string(), executor.clone(), settings.slots);
        }

        let min_count = Arc::new(AtomicU64::new(1));
        let (get, set) = (min_count.clone(), min_count.clone());
        let word_count = ApplicationLogic::new(NamedFunction::word_count(1)).with_attribute(ControlAttribute::new(
            "min_count",
            move || get.load(Ordering::SeqCst),
            move |value: u64| set.store(value, Ordering::SeqCst),
        ));

        let job = JobBuilder::new("word-count")
            .operator(SOURCE, "source", 1, ApplicationLogic::new(NamedFunction::udf("lines")))
            .operator(WORD_COUNT, "word-count", settings.parallelism, word_count)
            .operator(SINK, "sink", 1, ApplicationLogic::new(NamedFunction::udf("print")))
            .stateful(WORD_COUNT, settings.key_groups)
            .edge(SOURCE, WORD_COUNT)
            .edge(WORD_COUNT, SINK)
            .build()?;

        let graph = Arc::new(ExecutionGraph::new(
            job.job_graph.clone(),
            pool,
            checkpoints,
            config.rpc_timeout(),
        )?);
        graph.schedule().await?;

        let base = AbstractCoordinator::new(job.plan, job.operator_ids, graph.clone())?;
        let coordinator = Arc::new(ReconfigureCoordinator::new(base, config)?);
        info!(
            workers = settings.workers,
            parallelism = settings.parallelism,
            key_groups = settings.key_groups,
            "Demo job running"
        );

        Ok(Self {
            api: Arc::new(ReconfigurationApi::new(coordinator)),
            graph,
            executors,
            key_groups: settings.key_groups,
            min_count,
        })
    }

    pub fn key_groups(&self) -> u32 {
        self.key_groups
    }

    pub fn min_count(&self) -> u64 {
        self.min_count.load(Ordering::SeqCst)
    }

    pub fn parallelism(&self) -> Result<usize> {
        Ok(self.api.job_execution_plan().descriptor(WORD_COUNT)?.parallelism())
    }

    pub fn key_group_of(&self, word: &str) -> KeyGroup {
        let mut hasher = DefaultHasher::new();
        word.hash(&mut hasher);
        (hasher.finish() % u64::from(self.key_groups)) as KeyGroup
    }

    /// The running word-count task that owns `key_group`, and its worker.
    fn owner(&self, key_group: KeyGroup) -> Result<Option<(ExecutionAttemptId, Arc<LocalTaskExecutor>)>> {
        let job_vertex = self.api.coordinator().base().job_vertex_of(WORD_COUNT)?;
        for vertex in job_vertex.task_vertices() {
            let Some(attempt) = vertex.attempt_id().filter(|_| vertex.is_running()) else {
                continue;
            };
            for executor in &self.executors {
                let Some(task) = executor.task(attempt) else {
                    continue;
                };
                if task.key_group_range().is_some_and(|r| r.contains(key_group)) {
                    return Ok(Some((attempt, executor.clone())));
                }
            }
        }
        Ok(None)
    }

    /// Route every word to its owner. Returns how many were consumed; words
    /// reaching a paused task are dropped.
    pub fn feed<'a>(&self, words: impl IntoIterator<Item = &'a str>) -> Result<usize> {
        let mut consumed = 0;
        for word in words {
            let key_group = self.key_group_of(word);
            let Some((attempt, executor)) = self.owner(key_group)? else {
                debug!(word, key_group, "No running owner");
                continue;
            };
            if executor.process_record(attempt, key_group)? {
                consumed += 1;
            }
        }
        Ok(consumed)
    }

    /// Sum of every key group's count, read from its current owner.
    pub fn total_count(&self) -> Result<u64> {
        let mut total = 0;
        for key_group in 0..self.key_groups {
            if let Some((attempt, executor)) = self.owner(key_group)? {
                total += executor.count_of(attempt, key_group).unwrap_or(0);
            }
        }
        Ok(total)
    }

    /// Log where the word-count state lives.
    pub fn report(&self) -> Result<()> {
        let coordinator = self.api.coordinator();
        let uid = coordinator.base().operator_uid(WORD_COUNT)?;
        let job_vertex = coordinator.base().job_vertex_of(WORD_COUNT)?;
        for vertex in job_vertex.task_vertices() {
            let attempt = vertex
                .attempt_id()
                .with_context(|| format!("{} has no execution", vertex.task_name()))?;
            let Some(task) = self.executors.iter().find_map(|e| e.task(attempt)) else {
                continue;
            };
            info!(
                task = %vertex.task_name(),
                state = ?task.get_state(),
                key_groups = task.key_group_range().map(|r| r.len()).unwrap_or(0),
                keys_with_state = task.keyed_state(uid).len(),
                "Word-count task"
            );
        }
        info!(
            phase = %coordinator.phase(),
            total = self.total_count()?,
            min_count = self.min_count(),
            "Job state"
        );
        Ok(())
    }
}
