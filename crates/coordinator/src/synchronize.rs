//! Pausing tasks at a rescale point and collecting their state.
//!
//! A synchronization pauses the tasks it is given and injects a rescale-point
//! barrier. Sources are not paused; their partitions move to a fresh rescale
//! id so downstream gates can be switched over once they resume. Checkpoint
//! acknowledgements arrive as messages on a channel drained by one collector
//! task, which publishes the collected state when the last waited-for task
//! has acknowledged.

use futures::future::{join_all, try_join_all, BoxFuture};
use futures::FutureExt;
use gearshift_plan::OperatorId;
use gearshift_runtime::{
    CheckpointCoordinator, CheckpointId, ExecutionAttemptId, ExecutionJobVertex, ExecutionVertex,
    OperatorState, OperatorUid, PendingCheckpoint, RescaleId, RescaleOptions,
    RescalepointAcknowledgeListener, SyncFlag,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::base::AbstractCoordinator;
use crate::primitive::{Subtasks, TaskList};
use crate::{Error, Result};

/// Operator state collected at the rescale point, per deployment operator.
pub type CollectedState = Arc<HashMap<OperatorUid, OperatorState>>;

#[derive(Debug, Clone)]
enum SyncStatus {
    Pending,
    Completed(CollectedState),
    Failed(String),
}

struct AckEvent {
    attempt: ExecutionAttemptId,
    states: HashMap<OperatorUid, OperatorState>,
}

type RpcFuture<'a> = BoxFuture<'a, gearshift_runtime::Result<gearshift_runtime::Acknowledge>>;

/// One synchronization of a rescale.
pub struct SynchronizeOperation {
    rescale_id: RescaleId,
    tasks: TaskList,
    not_yet_acknowledged: Mutex<HashSet<ExecutionAttemptId>>,
    /// Tasks this operation paused and has not resumed, with the rescale id
    /// their partitions were tagged with when paused.
    paused: Mutex<BTreeMap<(OperatorId, usize), RescaleId>>,
    checkpoint_id: AtomicU64,
    ack_tx: mpsc::UnboundedSender<AckEvent>,
    ack_rx: Mutex<Option<mpsc::UnboundedReceiver<AckEvent>>>,
    status: watch::Sender<SyncStatus>,
}

impl SynchronizeOperation {
    pub(crate) fn new(tasks: TaskList) -> Arc<Self> {
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(SyncStatus::Pending);
        Arc::new(Self {
            rescale_id: RescaleId::generate_next(),
            tasks,
            not_yet_acknowledged: Mutex::new(HashSet::new()),
            paused: Mutex::new(BTreeMap::new()),
            checkpoint_id: AtomicU64::new(0),
            ack_tx,
            ack_rx: Mutex::new(Some(ack_rx)),
            status,
        })
    }

    pub fn rescale_id(&self) -> RescaleId {
        self.rescale_id
    }

    /// Whether the state collection finished, successfully or not.
    pub fn is_resolved(&self) -> bool {
        !matches!(*self.status.borrow(), SyncStatus::Pending)
    }

    pub fn is_completed(&self) -> bool {
        matches!(*self.status.borrow(), SyncStatus::Completed(_))
    }

    /// Tasks paused by this operation and not resumed yet.
    pub fn paused_tasks(&self) -> Vec<(OperatorId, usize)> {
        self.paused.lock().keys().copied().collect()
    }

    pub fn num_pending_acknowledgements(&self) -> usize {
        self.not_yet_acknowledged.lock().len()
    }

    /// Take over the tasks `previous` left paused.
    pub(crate) fn inherit_paused(&self, previous: &SynchronizeOperation) {
        let inherited = std::mem::take(&mut *previous.paused.lock());
        if !inherited.is_empty() {
            debug!(tasks = inherited.len(), "Inheriting paused tasks");
        }
        let mut paused = self.paused.lock();
        for (task, rescale_id) in inherited {
            paused.entry(task).or_insert(rescale_id);
        }
    }

    /// Stop tracking a task that no longer exists.
    pub(crate) fn forget(&self, operator: OperatorId, subtask: usize) {
        self.paused.lock().remove(&(operator, subtask));
    }

    // ========================================================================
    // Synchronization
    // ========================================================================

    /// Pause the tasks, inject the rescale point and wait until every paused
    /// task has acknowledged it, at most `timeout`.
    pub(crate) async fn sync(
        self: &Arc<Self>,
        base: &AbstractCoordinator,
        timeout: Option<Duration>,
    ) -> Result<CollectedState> {
        let checkpoints = base.execution_graph().checkpoint_coordinator().clone();

        let mut resolved = Vec::with_capacity(self.tasks.len());
        for &(operator, subtasks) in &self.tasks {
            let job_vertex = base.job_vertex_of(operator)?;
            let vertices = select(&job_vertex, operator, subtasks)?;
            resolved.push((operator, job_vertex, vertices));
        }

        let mut prepares: Vec<RpcFuture<'_>> = Vec::new();
        for (operator, job_vertex, vertices) in &resolved {
            for vertex in vertices {
                let Some(attempt) = vertex.attempt_id().filter(|_| vertex.is_running()) else {
                    continue;
                };
                self.not_yet_acknowledged.lock().insert(attempt);
                if job_vertex.is_source() {
                    vertex.update_produced_partitions(self.rescale_id);
                    prepares.push(vertex.schedule_rescale(RescaleOptions::PrepareOnly, None).boxed());
                } else {
                    prepares.push(
                        vertex
                            .schedule_for_inter_task_sync(SyncFlag::NeedSync, self.rescale_id)
                            .boxed(),
                    );
                }
                self.paused
                    .lock()
                    .insert((*operator, vertex.subtask_index()), self.rescale_id);
            }
        }

        if let Err(e) = try_join_all(prepares).await {
            warn!(rescale_id = %self.rescale_id, error = %e, "Preparing tasks for synchronization failed");
            self.abort(base, &checkpoints, e.to_string()).await;
            return Err(e.into());
        }

        if self.not_yet_acknowledged.lock().is_empty() {
            info!(rescale_id = %self.rescale_id, "Nothing to synchronize");
            let states: CollectedState = Arc::new(HashMap::new());
            self.status.send_replace(SyncStatus::Completed(states.clone()));
            return Ok(states);
        }

        checkpoints.stop_checkpoint_scheduler();
        self.spawn_collector(checkpoints.clone())?;
        checkpoints.set_rescalepoint_acknowledge_listener(self.clone());
        let checkpoint_id = match checkpoints.trigger_rescale_point() {
            Ok(id) => id,
            Err(e) => {
                self.abort(base, &checkpoints, e.to_string()).await;
                return Err(e.into());
            }
        };
        info!(
            rescale_id = %self.rescale_id,
            checkpoint_id,
            tasks = self.num_pending_acknowledgements(),
            "Rescale point triggered"
        );

        let Some(timeout) = timeout else {
            return self.wait_finished().await;
        };
        match tokio::time::timeout(timeout, self.wait_finished()).await {
            Ok(result) => result,
            Err(_) => {
                let pending = self.num_pending_acknowledgements();
                warn!(rescale_id = %self.rescale_id, pending, ?timeout, "Synchronization timed out");
                self.abort(base, &checkpoints, "timed out".to_string()).await;
                Err(Error::SyncTimeout { timeout, pending })
            }
        }
    }

    /// Wait for the collected state.
    pub(crate) async fn wait_finished(&self) -> Result<CollectedState> {
        let mut status = self.status.subscribe();
        let resolved = status
            .wait_for(|s| !matches!(s, SyncStatus::Pending))
            .await
            .map_err(|_| Error::SyncAborted("status channel closed".to_string()))?;
        match &*resolved {
            SyncStatus::Completed(states) => Ok(states.clone()),
            SyncStatus::Failed(reason) => Err(Error::SyncAborted(reason.clone())),
            SyncStatus::Pending => Err(Error::SyncAborted("still pending".to_string())),
        }
    }

    /// Give up: fail waiters, drop the rescale point, resume what was paused
    /// and restore periodic checkpointing.
    async fn abort(&self, base: &AbstractCoordinator, checkpoints: &Arc<CheckpointCoordinator>, reason: String) {
        self.status.send_replace(SyncStatus::Failed(reason));
        checkpoints.clear_rescalepoint_acknowledge_listener();
        let checkpoint_id = self.checkpoint_id.load(Ordering::SeqCst);
        if checkpoint_id != 0 {
            checkpoints.abort_pending(checkpoint_id);
        }
        if let Err(e) = self.resume_all(base).await {
            warn!(rescale_id = %self.rescale_id, error = %e, "Resuming after aborted synchronization failed");
        }
        if checkpoints.is_periodic_checkpointing_configured() {
            checkpoints.start_checkpoint_scheduler();
        }
    }

    fn spawn_collector(self: &Arc<Self>, checkpoints: Arc<CheckpointCoordinator>) -> Result<()> {
        let mut acks = self
            .ack_rx
            .lock()
            .take()
            .ok_or_else(|| Error::ProtocolViolation("synchronization already started".to_string()))?;
        let mut status = self.status.subscribe();
        let this = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = acks.recv() => {
                        let Some(event) = event else { break };
                        let finished = {
                            let mut pending = this.not_yet_acknowledged.lock();
                            if !pending.remove(&event.attempt) {
                                continue;
                            }
                            pending.is_empty()
                        };
                        debug!(rescale_id = %this.rescale_id, attempt = %event.attempt, "Rescale point acknowledged");
                        if finished {
                            checkpoints.clear_rescalepoint_acknowledge_listener();
                            if checkpoints.is_periodic_checkpointing_configured() {
                                checkpoints.start_checkpoint_scheduler();
                            }
                            info!(rescale_id = %this.rescale_id, operators = event.states.len(), "Synchronization completed");
                            this.status.send_replace(SyncStatus::Completed(Arc::new(event.states)));
                            break;
                        }
                    }
                    changed = status.changed() => {
                        if changed.is_err() || this.is_resolved() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    // ========================================================================
    // Resumption
    // ========================================================================

    /// Resume listed tasks that are still paused. Tasks resumed before are
    /// skipped, so no RPC is sent twice. Subtasks split off by a scale-in are
    /// left paused until they are canceled. A task whose resume RPC fails
    /// stays tracked so a later resume reaches it again.
    pub(crate) async fn resume_tasks(&self, base: &AbstractCoordinator, tasks: &[(OperatorId, Subtasks)]) -> Result<()> {
        let mut selected = Vec::with_capacity(tasks.len());
        for &(operator, subtasks) in tasks {
            let job_vertex = base.job_vertex_of(operator)?;
            let vertices = match subtasks {
                Subtasks::All => job_vertex.task_vertices(),
                Subtasks::Only(index) => match job_vertex.task_vertex(index) {
                    Some(vertex) => vec![vertex],
                    None => {
                        debug!(operator, subtask = index, "Subtask split off, left to cancellation");
                        continue;
                    }
                },
            };
            selected.push((operator, subtasks, job_vertex, vertices));
        }

        let mut resumes: Vec<((OperatorId, usize), RescaleId, RpcFuture<'static>)> = Vec::new();
        let mut sources: BTreeMap<OperatorId, (Arc<ExecutionJobVertex>, Vec<RescaleId>)> = BTreeMap::new();
        for (operator, subtasks, job_vertex, vertices) in selected {
            let resumed: Vec<(Arc<ExecutionVertex>, RescaleId)> = {
                let mut paused = self.paused.lock();
                vertices
                    .into_iter()
                    .filter_map(|v| {
                        let rescale_id = paused.remove(&(operator, v.subtask_index()))?;
                        Some((v, rescale_id))
                    })
                    .collect()
            };
            if resumed.is_empty() {
                debug!(operator, subtasks = %subtasks, "Tasks already resumed");
                continue;
            }

            if job_vertex.is_source() {
                let entry = sources
                    .entry(operator)
                    .or_insert_with(|| (job_vertex.clone(), Vec::new()));
                entry.1.extend(resumed.into_iter().map(|(v, id)| {
                    debug!(operator, subtask = v.subtask_index(), "Source resumed");
                    id
                }));
                continue;
            }
            for (vertex, paused_as) in resumed {
                if !vertex.is_running() {
                    continue;
                }
                let key = (operator, vertex.subtask_index());
                let rescale_id = self.rescale_id;
                let rpc = async move {
                    vertex
                        .schedule_for_inter_task_sync(SyncFlag::NeedResume, rescale_id)
                        .await
                }
                .boxed();
                resumes.push((key, paused_as, rpc));
            }
        }

        let mut gates: Vec<RpcFuture<'static>> = Vec::new();
        for (operator, (job_vertex, rescale_ids)) in sources {
            self.resume_source_stream_task(base, operator, &job_vertex, &rescale_ids, &mut gates);
        }

        let count = resumes.len() + gates.len();
        let (keys, rpcs): (Vec<_>, Vec<_>) = resumes.into_iter().map(|(key, id, rpc)| ((key, id), rpc)).unzip();
        let mut failure = None;
        for ((key, paused_as), result) in keys.into_iter().zip(join_all(rpcs).await) {
            if let Err(e) = result {
                warn!(operator = key.0, subtask = key.1, error = %e, "Resuming task failed");
                self.paused.lock().entry(key).or_insert(paused_as);
                failure.get_or_insert(e);
            }
        }
        if let Some(e) = failure {
            return Err(e.into());
        }
        try_join_all(gates).await?;
        if count > 0 {
            debug!(rescale_id = %self.rescale_id, rpcs = count, "Tasks resumed");
        }
        Ok(())
    }

    /// Resume everything this operation still holds paused.
    pub(crate) async fn resume_all(&self, base: &AbstractCoordinator) -> Result<()> {
        let tasks: Vec<(OperatorId, Subtasks)> = self
            .paused_tasks()
            .into_iter()
            .map(|(operator, subtask)| (operator, Subtasks::Only(subtask)))
            .collect();
        self.resume_tasks(base, &tasks).await
    }

    /// Switch the consumers of a resumed source over to the partitions it
    /// produces since it was paused. Skipped when the source has been
    /// prepared again since.
    fn resume_source_stream_task(
        &self,
        base: &AbstractCoordinator,
        operator: OperatorId,
        job_vertex: &ExecutionJobVertex,
        rescale_ids: &[RescaleId],
        rpcs: &mut Vec<RpcFuture<'static>>,
    ) {
        let current: Vec<RescaleId> = job_vertex.task_vertices().iter().map(|v| v.rescale_id()).collect();
        if rescale_ids.iter().any(|id| !current.contains(id)) {
            debug!(operator, "Source partitions superseded, gates left as they are");
            return;
        }
        for consumer in base.execution_graph().consumers_of(job_vertex.id()) {
            for vertex in consumer.task_vertices() {
                if !vertex.is_running() {
                    continue;
                }
                rpcs.push(
                    async move { vertex.schedule_rescale(RescaleOptions::GatesOnly, None).await }.boxed(),
                );
            }
        }
    }
}

impl RescalepointAcknowledgeListener for SynchronizeOperation {
    fn set_checkpoint_id(&self, checkpoint_id: CheckpointId) {
        self.checkpoint_id.store(checkpoint_id, Ordering::SeqCst);
    }

    fn on_rescalepoint_acknowledge(&self, attempt: ExecutionAttemptId, checkpoint: &PendingCheckpoint) {
        if checkpoint.checkpoint_id != self.checkpoint_id.load(Ordering::SeqCst) {
            return;
        }
        let event = AckEvent {
            attempt,
            states: checkpoint.operator_states().clone(),
        };
        if self.ack_tx.send(event).is_err() {
            debug!(attempt = %attempt, "Acknowledgement after synchronization ended");
        }
    }
}

fn select(
    job_vertex: &ExecutionJobVertex,
    operator: OperatorId,
    subtasks: Subtasks,
) -> Result<Vec<Arc<ExecutionVertex>>> {
    match subtasks {
        Subtasks::All => Ok(job_vertex.task_vertices()),
        Subtasks::Only(index) => job_vertex
            .task_vertex(index)
            .map(|v| vec![v])
            .ok_or_else(|| Error::ProtocolViolation(format!("operator {} has no subtask {}", operator, index))),
    }
}
