//! In-process task executor.
//!
//! Hosts tasks in memory and implements [`TaskManagerGateway`] against them.
//! Each task keeps keyed state per key group and per hosted operator; records
//! are counted per key group, which makes state movement easy to observe.
//! Every RPC is logged so callers can inspect what a worker was told to do.

use async_trait::async_trait;
use dashmap::DashMap;
use gearshift_plan::{AlignedKeyGroupRange, KeyGroup};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointResponder, CheckpointType, TaskStateSnapshot};
use crate::descriptor::{
    Acknowledge, InputGateDescriptor, KeyedStateSnapshot, RescaleOptions, SyncFlag,
    TaskBackPressure, TaskDeploymentDescriptor,
};
use crate::gateway::TaskManagerGateway;
use crate::ids::{AllocationId, CheckpointId, ExecutionAttemptId, JobVertexId, OperatorUid, RescaleId};
use crate::pause::PauseController;
use crate::{Error, Result};

/// Lifecycle of a hosted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Paused,
    Canceled,
}

/// Kind of RPC a worker received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcKind {
    Submit,
    Rescale(RescaleOptions),
    Sync(SyncFlag),
    UpdateOperator,
    Cancel,
    UpdatePartitions,
    ReleasePartitions,
    BackPressure,
    TriggerCheckpoint,
    NotifyCheckpointComplete,
    FreeSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcRecord {
    pub attempt: Option<ExecutionAttemptId>,
    pub kind: RpcKind,
}

/// Status of one hosted task.
#[derive(Debug)]
pub struct TaskStatus {
    canceled: AtomicBool,
    descriptor: RwLock<TaskDeploymentDescriptor>,
    keyed_state: RwLock<HashMap<OperatorUid, KeyedStateSnapshot>>,
    pause: PauseController,
    pub records_processed: AtomicI64,
    pub operator_updates: AtomicU64,
    pub started_at: Instant,
}

impl TaskStatus {
    fn new(tdd: TaskDeploymentDescriptor) -> Self {
        let keyed_state = tdd
            .restore
            .as_ref()
            .map(|restore| restore.states.clone())
            .unwrap_or_default();
        Self {
            canceled: AtomicBool::new(false),
            descriptor: RwLock::new(tdd),
            keyed_state: RwLock::new(keyed_state),
            pause: PauseController::new(),
            records_processed: AtomicI64::new(0),
            operator_updates: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn get_state(&self) -> TaskState {
        if self.canceled.load(Ordering::Acquire) {
            TaskState::Canceled
        } else if self.pause.is_paused() {
            TaskState::Paused
        } else {
            TaskState::Running
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.get_state() == TaskState::Canceled
    }

    pub fn pause_controller(&self) -> &PauseController {
        &self.pause
    }

    pub fn subtask_index(&self) -> usize {
        self.descriptor.read().subtask_index
    }

    pub fn job_vertex_id(&self) -> JobVertexId {
        self.descriptor.read().job_vertex_id
    }

    pub fn key_group_range(&self) -> Option<AlignedKeyGroupRange> {
        self.descriptor.read().key_group_range.clone()
    }

    pub fn produced_partition(&self) -> RescaleId {
        self.descriptor.read().produced_partition_rescale_id
    }

    pub fn input_gates(&self) -> Vec<InputGateDescriptor> {
        self.descriptor.read().input_gates.clone()
    }

    /// Name of the function currently run for `uid`.
    pub fn udf_name(&self, uid: OperatorUid) -> Option<String> {
        self.descriptor
            .read()
            .operators
            .iter()
            .find(|op| op.uid == uid)
            .and_then(|op| op.udf.as_ref().map(|udf| udf.name().to_string()))
    }

    fn head_operator(&self) -> Option<OperatorUid> {
        self.descriptor.read().operators.first().map(|op| op.uid)
    }

    /// Keyed state of `uid`.
    pub fn keyed_state(&self, uid: OperatorUid) -> KeyedStateSnapshot {
        self.keyed_state.read().get(&uid).cloned().unwrap_or_default()
    }

    fn snapshot(&self) -> TaskStateSnapshot {
        TaskStateSnapshot {
            subtask_index: self.subtask_index(),
            states: self.keyed_state.read().clone(),
        }
    }
}

/// Worker hosting tasks in the current process.
pub struct LocalTaskExecutor {
    worker_id: String,
    tasks: DashMap<ExecutionAttemptId, Arc<TaskStatus>>,
    responder: CheckpointResponder,
    rpc_log: Mutex<Vec<RpcRecord>>,
    released_partitions: Mutex<Vec<(JobVertexId, RescaleId)>>,
    fail_rpcs: AtomicBool,
    drop_checkpoint_acks: AtomicBool,
}

impl LocalTaskExecutor {
    pub fn new(worker_id: impl Into<String>, responder: CheckpointResponder) -> Self {
        Self {
            worker_id: worker_id.into(),
            tasks: DashMap::new(),
            responder,
            rpc_log: Mutex::new(Vec::new()),
            released_partitions: Mutex::new(Vec::new()),
            fail_rpcs: AtomicBool::new(false),
            drop_checkpoint_acks: AtomicBool::new(false),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn task(&self, attempt: ExecutionAttemptId) -> Option<Arc<TaskStatus>> {
        self.tasks.get(&attempt).map(|t| t.clone())
    }

    fn running_task(&self, attempt: ExecutionAttemptId) -> Result<Arc<TaskStatus>> {
        match self.task(attempt) {
            Some(task) if !task.is_cancelled() => Ok(task),
            _ => Err(Error::TaskNotFound(attempt)),
        }
    }

    /// Number of tasks that are not canceled.
    pub fn num_active_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_cancelled()).count()
    }

    // ========================================================================
    // Data path
    // ========================================================================

    /// Feed one record of `key_group` to a task.
    ///
    /// Returns `Ok(false)` if the task is paused and did not consume the
    /// record. Records for key groups the task does not own are rejected.
    pub fn process_record(&self, attempt: ExecutionAttemptId, key_group: KeyGroup) -> Result<bool> {
        let task = self.running_task(attempt)?;
        if task.pause.is_paused() {
            return Ok(false);
        }
        if let Some(range) = task.key_group_range() {
            if !range.contains(key_group) {
                return Err(Error::IllegalState(format!(
                    "task {} received key group {} it does not own",
                    attempt, key_group
                )));
            }
        }
        if let Some(uid) = task.head_operator() {
            let mut states = task.keyed_state.write();
            let state = states.entry(uid).or_default();
            let count = state.get(key_group).map(decode_count).unwrap_or(0) + 1;
            state.insert(key_group, count.to_le_bytes().to_vec());
        }
        task.records_processed.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Record count of `key_group` in the head operator's state.
    pub fn count_of(&self, attempt: ExecutionAttemptId, key_group: KeyGroup) -> Option<u64> {
        let task = self.task(attempt)?;
        let uid = task.head_operator()?;
        let state = task.keyed_state(uid);
        state.get(key_group).map(decode_count)
    }

    // ========================================================================
    // Inspection and fault injection
    // ========================================================================

    pub fn rpc_log(&self) -> Vec<RpcRecord> {
        self.rpc_log.lock().clone()
    }

    /// Number of logged RPCs of `kind`, optionally for one attempt.
    pub fn rpc_count(&self, kind: RpcKind, attempt: Option<ExecutionAttemptId>) -> usize {
        self.rpc_log
            .lock()
            .iter()
            .filter(|r| r.kind == kind && (attempt.is_none() || r.attempt == attempt))
            .count()
    }

    pub fn released_partitions(&self) -> Vec<(JobVertexId, RescaleId)> {
        self.released_partitions.lock().clone()
    }

    /// Make every request/response RPC fail.
    pub fn set_fail_rpcs(&self, fail: bool) {
        self.fail_rpcs.store(fail, Ordering::SeqCst);
    }

    /// Take checkpoints without acknowledging them.
    pub fn set_drop_checkpoint_acks(&self, drop: bool) {
        self.drop_checkpoint_acks.store(drop, Ordering::SeqCst);
    }

    fn record(&self, attempt: Option<ExecutionAttemptId>, kind: RpcKind) -> Result<()> {
        self.rpc_log.lock().push(RpcRecord { attempt, kind });
        if self.fail_rpcs.load(Ordering::SeqCst) {
            return Err(Error::Rpc {
                address: self.worker_id.clone(),
                message: format!("{:?} rejected", kind),
            });
        }
        Ok(())
    }
}

fn decode_count(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[..len].copy_from_slice(&bytes[..len]);
    u64::from_le_bytes(buf)
}

#[async_trait]
impl TaskManagerGateway for LocalTaskExecutor {
    fn address(&self) -> &str {
        &self.worker_id
    }

    async fn submit_task(
        &self,
        tdd: TaskDeploymentDescriptor,
        _timeout: Duration,
    ) -> Result<Acknowledge> {
        let attempt = tdd.attempt_id;
        self.record(Some(attempt), RpcKind::Submit)?;
        if self.tasks.contains_key(&attempt) {
            return Err(Error::IllegalState(format!("task {} already exists", attempt)));
        }

        info!(
            worker_id = %self.worker_id,
            attempt = %attempt,
            task = %tdd.task_name,
            subtask = tdd.subtask_index,
            parallelism = tdd.parallelism,
            restored = tdd.restore.is_some(),
            "Deploying task"
        );
        self.tasks.insert(attempt, Arc::new(TaskStatus::new(tdd)));
        Ok(Acknowledge)
    }

    async fn rescale_task(
        &self,
        attempt: ExecutionAttemptId,
        tdd: TaskDeploymentDescriptor,
        options: RescaleOptions,
        _timeout: Duration,
    ) -> Result<Acknowledge> {
        self.record(Some(attempt), RpcKind::Rescale(options))?;
        let task = self.running_task(attempt)?;
        debug!(worker_id = %self.worker_id, attempt = %attempt, ?options, "Rescaling task");

        let mut descriptor = task.descriptor.write();
        match options {
            RescaleOptions::PrepareOnly | RescaleOptions::PartitionsOnly => {
                descriptor.produced_partition_rescale_id = tdd.produced_partition_rescale_id;
            }
            RescaleOptions::GatesOnly => {
                descriptor.input_gates = tdd.input_gates;
            }
            RescaleOptions::KeyGroupRangeOnly => {
                descriptor.key_group_range = tdd.key_group_range;
            }
            RescaleOptions::StateOnly => {
                let mut states = task.keyed_state.write();
                match tdd.restore {
                    Some(restore) => *states = restore.states,
                    None => {
                        if let Some(range) = &tdd.key_group_range {
                            states.values_mut().for_each(|s| s.retain_range(range));
                        }
                    }
                }
                descriptor.key_group_range = tdd.key_group_range;
            }
        }
        descriptor.parallelism = tdd.parallelism;
        Ok(Acknowledge)
    }

    async fn prepare_for_sync(
        &self,
        attempt: ExecutionAttemptId,
        flag: SyncFlag,
        rescale_id: RescaleId,
        _timeout: Duration,
    ) -> Result<Acknowledge> {
        self.record(Some(attempt), RpcKind::Sync(flag))?;
        let task = self.running_task(attempt)?;
        match flag {
            SyncFlag::NeedSync => task.pause.request_pause(),
            SyncFlag::NeedResume => {
                task.pause.resume();
            }
        }
        debug!(worker_id = %self.worker_id, attempt = %attempt, ?flag, rescale_id = %rescale_id, "Sync request");
        Ok(Acknowledge)
    }

    async fn update_operator(
        &self,
        attempt: ExecutionAttemptId,
        tdd: TaskDeploymentDescriptor,
        operator: OperatorUid,
        _timeout: Duration,
    ) -> Result<Acknowledge> {
        self.record(Some(attempt), RpcKind::UpdateOperator)?;
        let task = self.running_task(attempt)?;
        let update = tdd
            .operators
            .into_iter()
            .find(|op| op.uid == operator)
            .ok_or_else(|| Error::IllegalState(format!("operator {} not in descriptor", operator)))?;

        let mut descriptor = task.descriptor.write();
        let hosted = descriptor
            .operators
            .iter_mut()
            .find(|op| op.uid == operator)
            .ok_or_else(|| Error::IllegalState(format!("operator {} not hosted by {}", operator, attempt)))?;
        info!(
            attempt = %attempt,
            operator = %operator,
            udf = update.udf.as_ref().map(|u| u.name()).unwrap_or("-"),
            "Operator updated"
        );
        *hosted = update;
        task.operator_updates.fetch_add(1, Ordering::Relaxed);
        Ok(Acknowledge)
    }

    async fn cancel_task(&self, attempt: ExecutionAttemptId, _timeout: Duration) -> Result<Acknowledge> {
        self.record(Some(attempt), RpcKind::Cancel)?;
        let task = self.task(attempt).ok_or(Error::TaskNotFound(attempt))?;
        task.canceled.store(true, Ordering::Release);
        info!(worker_id = %self.worker_id, attempt = %attempt, "Task canceled");
        Ok(Acknowledge)
    }

    async fn update_partitions(
        &self,
        attempt: ExecutionAttemptId,
        partitions: Vec<InputGateDescriptor>,
        _timeout: Duration,
    ) -> Result<Acknowledge> {
        self.record(Some(attempt), RpcKind::UpdatePartitions)?;
        let task = self.running_task(attempt)?;
        let mut descriptor = task.descriptor.write();
        for partition in partitions {
            let gate = descriptor
                .input_gates
                .iter_mut()
                .find(|g| g.upstream == partition.upstream)
                .ok_or_else(|| {
                    Error::IllegalState(format!("task {} does not read {}", attempt, partition.upstream))
                })?;
            gate.partition_rescale_id = partition.partition_rescale_id;
        }
        debug!(worker_id = %self.worker_id, attempt = %attempt, "Partitions updated");
        Ok(Acknowledge)
    }

    fn release_partitions(&self, partitions: &[(JobVertexId, RescaleId)]) {
        self.rpc_log.lock().push(RpcRecord {
            attempt: None,
            kind: RpcKind::ReleasePartitions,
        });
        self.released_partitions.lock().extend_from_slice(partitions);
    }

    async fn request_task_back_pressure(
        &self,
        attempt: ExecutionAttemptId,
        request_id: u64,
        _timeout: Duration,
    ) -> Result<TaskBackPressure> {
        self.record(Some(attempt), RpcKind::BackPressure)?;
        let task = self.running_task(attempt)?;
        Ok(TaskBackPressure {
            attempt_id: attempt,
            request_id,
            ratio: if task.pause.is_paused() { 1.0 } else { 0.0 },
        })
    }

    fn trigger_checkpoint(
        &self,
        attempt: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        _timestamp: u64,
        kind: CheckpointType,
    ) {
        self.rpc_log.lock().push(RpcRecord {
            attempt: Some(attempt),
            kind: RpcKind::TriggerCheckpoint,
        });
        let Ok(task) = self.running_task(attempt) else {
            warn!(worker_id = %self.worker_id, attempt = %attempt, checkpoint_id, "Checkpoint for unknown task");
            return;
        };

        let snapshot = task.snapshot();
        if kind == CheckpointType::RescalePoint && task.pause.ack_if_pause() {
            debug!(attempt = %attempt, checkpoint_id, "Task paused at rescale point");
        }
        if self.drop_checkpoint_acks.load(Ordering::SeqCst) {
            return;
        }

        let responder = self.responder.clone();
        tokio::spawn(async move {
            responder.acknowledge(attempt, checkpoint_id, snapshot);
        });
    }

    fn notify_checkpoint_complete(
        &self,
        attempt: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        _timestamp: u64,
    ) {
        self.rpc_log.lock().push(RpcRecord {
            attempt: Some(attempt),
            kind: RpcKind::NotifyCheckpointComplete,
        });
        debug!(attempt = %attempt, checkpoint_id, "Checkpoint complete");
    }

    async fn free_slot(
        &self,
        allocation: AllocationId,
        cause: String,
        _timeout: Duration,
    ) -> Result<Acknowledge> {
        self.record(None, RpcKind::FreeSlot)?;
        debug!(worker_id = %self.worker_id, allocation = %allocation, cause = %cause, "Slot freed");
        Ok(Acknowledge)
    }
}
