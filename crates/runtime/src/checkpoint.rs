//! Checkpoint coordination.
//!
//! Besides periodic checkpoints, the coordinator triggers *rescale points*:
//! barriers injected on demand so that tasks asked to pause stop exactly at a
//! consistent cut and report their state. Acknowledgements of a rescale point
//! are forwarded to a registered [`RescalepointAcknowledgeListener`].

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::descriptor::KeyedStateSnapshot;
use crate::gateway::TaskManagerGateway;
use crate::ids::{CheckpointId, ExecutionAttemptId, OperatorUid};
use crate::{now_millis, Error, Result};

/// Checkpointing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Interval of periodic checkpoints; `None` disables them.
    pub interval_ms: Option<u64>,
    /// Number of completed checkpoints to retain.
    pub num_retained: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_ms: None,
            num_retained: 3,
        }
    }
}

impl CheckpointConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn is_periodic(&self) -> bool {
        self.interval_ms.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointType {
    Periodic,
    RescalePoint,
}

/// State a task reports when acknowledging a checkpoint.
#[derive(Debug, Clone, Default)]
pub struct TaskStateSnapshot {
    pub subtask_index: usize,
    pub states: HashMap<OperatorUid, KeyedStateSnapshot>,
}

/// State of one operator across its subtasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorState {
    pub subtask_states: BTreeMap<usize, KeyedStateSnapshot>,
}

impl OperatorState {
    /// Union of every subtask's key groups.
    pub fn merged(&self) -> KeyedStateSnapshot {
        let mut merged = KeyedStateSnapshot::new();
        for state in self.subtask_states.values() {
            merged.extend(state);
        }
        merged
    }
}

/// A triggered checkpoint still waiting for acknowledgements.
#[derive(Debug)]
pub struct PendingCheckpoint {
    pub checkpoint_id: CheckpointId,
    pub timestamp: u64,
    pub kind: CheckpointType,
    not_yet_acknowledged: HashSet<ExecutionAttemptId>,
    operator_states: HashMap<OperatorUid, OperatorState>,
}

impl PendingCheckpoint {
    pub fn is_fully_acknowledged(&self) -> bool {
        self.not_yet_acknowledged.is_empty()
    }

    pub fn num_pending_tasks(&self) -> usize {
        self.not_yet_acknowledged.len()
    }

    /// States reported so far.
    pub fn operator_states(&self) -> &HashMap<OperatorUid, OperatorState> {
        &self.operator_states
    }
}

/// A checkpoint every task acknowledged.
#[derive(Debug, Clone)]
pub struct CompletedCheckpoint {
    pub checkpoint_id: CheckpointId,
    pub timestamp: u64,
    pub kind: CheckpointType,
    pub operator_states: HashMap<OperatorUid, OperatorState>,
}

/// Receives acknowledgements of rescale points.
pub trait RescalepointAcknowledgeListener: Send + Sync {
    /// Id of the rescale point just triggered; called before any task is
    /// asked to take it.
    fn set_checkpoint_id(&self, checkpoint_id: CheckpointId);

    /// One task acknowledged `checkpoint`. The pending checkpoint holds every
    /// state reported so far.
    fn on_rescalepoint_acknowledge(&self, attempt: ExecutionAttemptId, checkpoint: &PendingCheckpoint);
}

/// Checkpoint coordinator of one job.
pub struct CheckpointCoordinator {
    config: CheckpointConfig,
    next_checkpoint_id: AtomicU64,
    tasks: DashMap<ExecutionAttemptId, Arc<dyn TaskManagerGateway>>,
    pending: Mutex<BTreeMap<CheckpointId, PendingCheckpoint>>,
    completed: Mutex<VecDeque<CompletedCheckpoint>>,
    listener: RwLock<Option<Arc<dyn RescalepointAcknowledgeListener>>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl CheckpointCoordinator {
    pub fn new(config: CheckpointConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            next_checkpoint_id: AtomicU64::new(1),
            tasks: DashMap::new(),
            pending: Mutex::new(BTreeMap::new()),
            completed: Mutex::new(VecDeque::new()),
            listener: RwLock::new(None),
            scheduler: Mutex::new(None),
        })
    }

    /// Handle for task executors to acknowledge checkpoints with.
    pub fn responder(self: &Arc<Self>) -> CheckpointResponder {
        CheckpointResponder {
            coordinator: Arc::downgrade(self),
        }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn is_periodic_checkpointing_configured(&self) -> bool {
        self.config.is_periodic()
    }

    // ========================================================================
    // Scheduler
    // ========================================================================

    /// Start periodic checkpoints. No-op when not configured or running.
    pub fn start_checkpoint_scheduler(self: &Arc<Self>) {
        let Some(interval_ms) = self.config.interval_ms else {
            return;
        };
        let mut scheduler = self.scheduler.lock();
        if scheduler.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let coordinator = Arc::downgrade(self);
        *scheduler = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                if let Err(e) = coordinator.trigger_checkpoint(CheckpointType::Periodic) {
                    debug!(error = %e, "Periodic checkpoint not triggered");
                }
            }
        }));
        info!(interval_ms, "Checkpoint scheduler started");
    }

    /// Stop periodic checkpoints and abort pending periodic ones.
    pub fn stop_checkpoint_scheduler(&self) {
        if let Some(handle) = self.scheduler.lock().take() {
            handle.abort();
            info!("Checkpoint scheduler stopped");
        }
        self.pending
            .lock()
            .retain(|_, pending| pending.kind != CheckpointType::Periodic);
    }

    pub fn is_scheduler_running(&self) -> bool {
        self.scheduler
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Register tasks that must take part in future checkpoints.
    pub fn add_vertices<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = (ExecutionAttemptId, Arc<dyn TaskManagerGateway>)>,
    {
        for (attempt, gateway) in tasks {
            self.tasks.insert(attempt, gateway);
        }
    }

    /// Stop expecting `attempt` in checkpoints, pending ones included.
    pub fn remove_task(&self, attempt: ExecutionAttemptId) {
        self.tasks.remove(&attempt);
        let completed: Vec<CheckpointId> = {
            let mut pending = self.pending.lock();
            pending
                .values_mut()
                .filter_map(|checkpoint| {
                    (checkpoint.not_yet_acknowledged.remove(&attempt)
                        && checkpoint.is_fully_acknowledged())
                    .then_some(checkpoint.checkpoint_id)
                })
                .collect()
        };
        for checkpoint_id in completed {
            self.complete_checkpoint(checkpoint_id);
        }
    }

    pub fn num_registered_tasks(&self) -> usize {
        self.tasks.len()
    }

    // ========================================================================
    // Triggering
    // ========================================================================

    pub fn set_rescalepoint_acknowledge_listener(&self, listener: Arc<dyn RescalepointAcknowledgeListener>) {
        *self.listener.write() = Some(listener);
    }

    pub fn clear_rescalepoint_acknowledge_listener(&self) {
        *self.listener.write() = None;
    }

    /// Inject a rescale-point barrier into every registered task.
    pub fn trigger_rescale_point(&self) -> Result<CheckpointId> {
        self.trigger_checkpoint(CheckpointType::RescalePoint)
    }

    /// Trigger a checkpoint of the given kind on every registered task.
    pub fn trigger_checkpoint(&self, kind: CheckpointType) -> Result<CheckpointId> {
        let tasks: Vec<(ExecutionAttemptId, Arc<dyn TaskManagerGateway>)> = self
            .tasks
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        if tasks.is_empty() {
            return Err(Error::Checkpoint("no task registered".to_string()));
        }

        let checkpoint_id = self.next_checkpoint_id.fetch_add(1, Ordering::SeqCst);
        let timestamp = now_millis();
        self.pending.lock().insert(
            checkpoint_id,
            PendingCheckpoint {
                checkpoint_id,
                timestamp,
                kind,
                not_yet_acknowledged: tasks.iter().map(|(attempt, _)| *attempt).collect(),
                operator_states: HashMap::new(),
            },
        );

        if kind == CheckpointType::RescalePoint {
            if let Some(listener) = self.listener.read().clone() {
                listener.set_checkpoint_id(checkpoint_id);
            }
        }

        info!(checkpoint_id, ?kind, tasks = tasks.len(), "Triggering checkpoint");
        for (attempt, gateway) in tasks {
            gateway.trigger_checkpoint(attempt, checkpoint_id, timestamp, kind);
        }
        Ok(checkpoint_id)
    }

    // ========================================================================
    // Acknowledgement
    // ========================================================================

    /// Record the acknowledgement of `attempt`.
    pub fn acknowledge_task(
        &self,
        attempt: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        snapshot: TaskStateSnapshot,
    ) -> Result<()> {
        let fully_acknowledged = {
            let mut pending = self.pending.lock();
            let checkpoint = pending.get_mut(&checkpoint_id).ok_or_else(|| {
                Error::Checkpoint(format!("checkpoint {} is not pending", checkpoint_id))
            })?;

            if !checkpoint.not_yet_acknowledged.remove(&attempt) {
                warn!(checkpoint_id, attempt = %attempt, "Duplicate or unexpected acknowledgement");
                return Ok(());
            }
            for (uid, state) in snapshot.states {
                checkpoint
                    .operator_states
                    .entry(uid)
                    .or_default()
                    .subtask_states
                    .insert(snapshot.subtask_index, state);
            }
            debug!(
                checkpoint_id,
                attempt = %attempt,
                remaining = checkpoint.num_pending_tasks(),
                "Checkpoint acknowledged"
            );

            if checkpoint.kind == CheckpointType::RescalePoint {
                if let Some(listener) = self.listener.read().clone() {
                    listener.on_rescalepoint_acknowledge(attempt, checkpoint);
                }
            }
            checkpoint.is_fully_acknowledged()
        };

        if fully_acknowledged {
            self.complete_checkpoint(checkpoint_id);
        }
        Ok(())
    }

    fn complete_checkpoint(&self, checkpoint_id: CheckpointId) {
        let Some(checkpoint) = self.pending.lock().remove(&checkpoint_id) else {
            return;
        };
        let completed = CompletedCheckpoint {
            checkpoint_id,
            timestamp: checkpoint.timestamp,
            kind: checkpoint.kind,
            operator_states: checkpoint.operator_states,
        };
        {
            let mut retained = self.completed.lock();
            retained.push_back(completed);
            while retained.len() > self.config.num_retained.max(1) {
                retained.pop_front();
            }
        }
        info!(checkpoint_id, kind = ?checkpoint.kind, "Checkpoint completed");

        for entry in self.tasks.iter() {
            entry
                .value()
                .notify_checkpoint_complete(*entry.key(), checkpoint_id, checkpoint.timestamp);
        }
    }

    /// Drop a pending checkpoint that will never complete. Late
    /// acknowledgements for it are rejected.
    pub fn abort_pending(&self, checkpoint_id: CheckpointId) -> bool {
        let aborted = self.pending.lock().remove(&checkpoint_id);
        if let Some(checkpoint) = &aborted {
            info!(
                checkpoint_id,
                kind = ?checkpoint.kind,
                missing = checkpoint.num_pending_tasks(),
                "Checkpoint aborted"
            );
        }
        aborted.is_some()
    }

    pub fn num_pending_checkpoints(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn latest_completed_checkpoint(&self) -> Option<CompletedCheckpoint> {
        self.completed.lock().back().cloned()
    }
}

/// Acknowledgement channel from task executors back to the coordinator.
#[derive(Clone)]
pub struct CheckpointResponder {
    coordinator: Weak<CheckpointCoordinator>,
}

impl CheckpointResponder {
    pub fn acknowledge(
        &self,
        attempt: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        snapshot: TaskStateSnapshot,
    ) {
        match self.coordinator.upgrade() {
            Some(coordinator) => {
                if let Err(e) = coordinator.acknowledge_task(attempt, checkpoint_id, snapshot) {
                    debug!(checkpoint_id, attempt = %attempt, error = %e, "Acknowledgement dropped");
                }
            }
            None => warn!(checkpoint_id, "Checkpoint coordinator is gone"),
        }
    }
}
