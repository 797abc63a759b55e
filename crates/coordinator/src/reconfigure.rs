//! The reconfiguration coordinator.

use async_trait::async_trait;
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use gearshift_plan::{ChangeKind, Diff, DiffPayload, ExecutionPlan, OperatorId};
use gearshift_runtime::{Acknowledge, ExecutionAttemptId, RescaleCandidates, RescaleId, RescaleOptions};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::base::AbstractCoordinator;
use crate::config::CoordinatorConfig;
use crate::phase::{PhaseTracker, RescalePhase};
use crate::primitive::{PrimitiveOperation, Subtasks, TaskList};
use crate::state_assignment::StateAssignmentOperation;
use crate::synchronize::SynchronizeOperation;
use crate::workloads::WorkloadsAssignmentHandler;
use crate::{Error, Result};

type RpcFuture = BoxFuture<'static, gearshift_runtime::Result<Acknowledge>>;

/// Carries out primitive operations against a running job.
pub struct ReconfigureCoordinator {
    base: AbstractCoordinator,
    config: CoordinatorConfig,
    workloads: WorkloadsAssignmentHandler,
    phase: PhaseTracker,
    current_sync: Mutex<Option<Arc<SynchronizeOperation>>>,
    candidates: Mutex<HashMap<OperatorId, RescaleCandidates>>,
}

impl ReconfigureCoordinator {
    pub fn new(base: AbstractCoordinator, config: CoordinatorConfig) -> Result<Self> {
        let workloads = base.with_held_plan(WorkloadsAssignmentHandler::new)?;
        Ok(Self {
            base,
            config,
            workloads,
            phase: PhaseTracker::new(),
            current_sync: Mutex::new(None),
            candidates: Mutex::new(HashMap::new()),
        })
    }

    pub fn base(&self) -> &AbstractCoordinator {
        &self.base
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn workloads(&self) -> &WorkloadsAssignmentHandler {
        &self.workloads
    }

    pub fn phase(&self) -> RescalePhase {
        self.phase.current()
    }

    pub fn held_execution_plan_copy(&self) -> ExecutionPlan {
        self.base.held_execution_plan_copy()
    }

    /// The synchronization of the rescale in progress, if any.
    pub fn current_sync(&self) -> Option<Arc<SynchronizeOperation>> {
        self.current_sync.lock().clone()
    }

    /// Record the outcome of an operation; failures move to `ERRORED`.
    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!(phase = %self.phase.current(), error = %e, "Reconfiguration step failed");
            self.phase.fail();
        }
        result
    }

    /// Wait for the paused tasks' state if a synchronization is in flight.
    async fn wait_for_pause(&self) -> Result<()> {
        if let Some(sync) = self.current_sync() {
            if !sync.is_resolved() {
                sync.wait_finished().await?;
            }
        }
        Ok(())
    }

    /// Resume `operator` if nothing is pending for it.
    async fn resume_if_settled(&self, operator: OperatorId, diff: &Diff) -> Result<()> {
        if !diff.is_settled(operator) {
            return Ok(());
        }
        if let Some(sync) = self.current_sync() {
            sync.resume_tasks(&self.base, &[(operator, Subtasks::All)]).await?;
        }
        Ok(())
    }

    /// Tag the partitions `source` produces with `rescale_id` and point the
    /// gates of its consumers at them.
    fn update_partition_and_downstream_gates(&self, source: OperatorId, rescale_id: RescaleId) -> Result<Vec<RpcFuture>> {
        let mut rpcs: Vec<RpcFuture> = Vec::new();
        for vertex in self.base.job_vertex_of(source)?.task_vertices() {
            if !vertex.is_running() {
                continue;
            }
            vertex.update_produced_partitions(rescale_id);
            rpcs.push(async move { vertex.schedule_rescale(RescaleOptions::PartitionsOnly, None).await }.boxed());
        }

        let children: Vec<OperatorId> = self.base.with_held_plan(|plan| plan.children(source).collect());
        for child in children {
            for vertex in self.base.job_vertex_of(child)?.task_vertices() {
                if !vertex.is_running() {
                    continue;
                }
                rpcs.push(async move { vertex.schedule_rescale(RescaleOptions::GatesOnly, None).await }.boxed());
            }
        }
        Ok(rpcs)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    async fn do_synchronize(&self, tasks: TaskList, diff: Diff) -> Result<Diff> {
        let sync = {
            let mut current = self.current_sync.lock();
            if let Some(previous) = current.as_ref() {
                if !previous.is_resolved() {
                    return Err(Error::ProtocolViolation(
                        "a synchronization is already in flight".to_string(),
                    ));
                }
            }
            self.phase.advance(RescalePhase::Pausing)?;
            let sync = SynchronizeOperation::new(tasks);
            if let Some(previous) = current.as_ref() {
                sync.inherit_paused(previous);
            }
            *current = Some(sync.clone());
            sync
        };
        info!(rescale_id = %sync.rescale_id(), "Synchronizing tasks");

        match sync.sync(&self.base, self.config.sync_timeout()).await {
            Ok(states) => {
                debug!(rescale_id = %sync.rescale_id(), operators = states.len(), "State collected");
                Ok(diff)
            }
            Err(e) => {
                if sync.paused_tasks().is_empty() {
                    *self.current_sync.lock() = None;
                }
                Err(e)
            }
        }
    }

    async fn do_resume(&self) -> Result<()> {
        let sync = self
            .current_sync()
            .ok_or_else(|| Error::ProtocolViolation("no synchronization to resume".to_string()))?;
        self.phase.advance(RescalePhase::Resuming)?;
        sync.resume_all(&self.base).await?;
        *self.current_sync.lock() = None;
        self.phase.advance(RescalePhase::Idle)?;
        info!(rescale_id = %sync.rescale_id(), "Rescale finished");
        Ok(())
    }

    async fn do_update_upstream_key_mapping(&self, destination: OperatorId, mut diff: Diff) -> Result<Diff> {
        self.phase.advance(RescalePhase::Remapping)?;
        self.wait_for_pause().await?;

        let (parents, stateful) = self.base.with_held_plan(|plan| {
            plan.descriptor(destination)
                .map(|d| (plan.parents(destination).collect::<Vec<_>>(), d.is_stateful()))
        })?;
        let assignment = diff
            .workloads(destination)
            .cloned()
            .or_else(|| self.workloads.pending(destination))
            .or_else(|| self.workloads.held(destination))
            .ok_or_else(|| Error::Lookup(format!("no workloads assignment for operator {}", destination)))?;

        let rescale_id = RescaleId::generate_next();
        let mut rpcs = Vec::new();
        for parent in &parents {
            rpcs.extend(self.update_partition_and_downstream_gates(*parent, rescale_id)?);
        }
        for vertex in self.base.job_vertex_of(destination)?.task_vertices() {
            let Some(range) = assignment.aligned_key_group_range(vertex.subtask_index()).cloned() else {
                continue;
            };
            if vertex.is_running() {
                rpcs.push(
                    async move { vertex.schedule_rescale(RescaleOptions::KeyGroupRangeOnly, Some(range)).await }
                        .boxed(),
                );
            } else {
                vertex.assign_key_group_range(range);
            }
        }
        try_join_all(rpcs).await?;

        // Stateful operators take the allocation once their state moved.
        if !stateful {
            let allocation = assignment.new_allocation().clone();
            self.base.update_held_plan(|plan| {
                for parent in &parents {
                    plan.set_key_mapping(*parent, destination, allocation.clone())?;
                }
                Ok(())
            })?;
            self.workloads.commit(destination, assignment);
        }
        info!(
            operator = destination,
            rescale_id = %rescale_id,
            parents = parents.len(),
            "Upstream key mapping updated"
        );

        for parent in parents {
            diff.remove(parent, ChangeKind::KeyMapping);
            self.resume_if_settled(parent, &diff).await?;
        }
        Ok(diff)
    }

    async fn do_update_state(&self, operator: OperatorId, mut diff: Diff) -> Result<Diff> {
        let sync = self.current_sync().ok_or_else(|| {
            Error::ProtocolViolation(format!("state of operator {} updated without synchronization", operator))
        })?;
        self.phase.advance(RescalePhase::ReassigningState)?;

        let job_vertex = self.base.job_vertex_of(operator)?;
        let assignment = diff.take_workloads(operator);
        let settled = diff.is_settled(operator);

        let Some(assignment) = assignment else {
            if settled {
                sync.resume_tasks(&self.base, &[(operator, Subtasks::All)]).await?;
            }
            return Ok(diff);
        };

        if settled {
            let unmodified: Vec<(OperatorId, Subtasks)> = (0..assignment.parallelism())
                .filter(|task| !assignment.is_task_modified(*task))
                .map(|task| (operator, Subtasks::Only(task)))
                .collect();
            sync.resume_tasks(&self.base, &unmodified).await?;
        }

        let states = sync.wait_finished().await?;
        let assigned = StateAssignmentOperation::new(&job_vertex, &states, &assignment).assign_states()?;

        let mut updates = Vec::new();
        for task in assignment.modified_tasks() {
            let Some(vertex) = job_vertex.task_vertex(task) else {
                continue;
            };
            // Tasks not running yet pick up their restore on deployment.
            if !vertex.is_running() {
                continue;
            }
            let sync = sync.clone();
            let base = &self.base;
            updates.push(async move {
                vertex.schedule_rescale(RescaleOptions::StateOnly, None).await?;
                if settled {
                    sync.resume_tasks(base, &[(operator, Subtasks::Only(task))]).await?;
                }
                Ok::<_, Error>(())
            });
        }
        try_join_all(updates).await?;

        let stateful = self.base.with_held_plan(|plan| plan.descriptor(operator).map(|d| d.is_stateful()))?;
        if stateful {
            let allocation = assignment.new_allocation().clone();
            self.base
                .update_held_plan(|plan| plan.set_key_state_allocation(operator, allocation))?;
        }
        self.workloads.commit(operator, assignment);
        info!(operator, tasks = assigned, "State reassigned");
        Ok(diff)
    }

    async fn do_update_function(&self, operator: OperatorId, mut diff: Diff) -> Result<Diff> {
        self.phase.advance(RescalePhase::UpdatingFunction)?;
        self.wait_for_pause().await?;

        let uid = self.base.operator_uid(operator)?;
        if let Some(DiffPayload::Udf(udf)) = diff.get(operator).and_then(|d| d.get(ChangeKind::Udf)).cloned() {
            self.base.apply_udf(operator, udf)?;
        }

        let updates: Vec<RpcFuture> = self
            .base
            .job_vertex_of(operator)?
            .task_vertices()
            .into_iter()
            .filter(|v| v.is_running())
            .map(|vertex| async move { vertex.schedule_operator_update(uid).await }.boxed())
            .collect();
        let count = updates.len();
        try_join_all(updates).await?;
        info!(operator, tasks = count, "Function shipped to tasks");

        diff.remove(operator, ChangeKind::Udf);
        self.resume_if_settled(operator, &diff).await?;
        Ok(diff)
    }

    async fn do_deploy_tasks(&self, operator: OperatorId, old_parallelism: usize) -> Result<()> {
        let created = self
            .candidates
            .lock()
            .get_mut(&operator)
            .map(|c| std::mem::take(&mut c.created))
            .unwrap_or_default();
        if created.is_empty() {
            return Err(Error::ProtocolViolation(format!(
                "no new task of operator {} to deploy",
                operator
            )));
        }

        let rescale_id = RescaleId::generate_next();
        for vertex in &created {
            vertex.allocate_and_assign_slot(rescale_id)?;
        }
        try_join_all(created.iter().map(|v| v.deploy())).await?;

        let checkpoints = self.base.execution_graph().checkpoint_coordinator();
        checkpoints.stop_checkpoint_scheduler();
        checkpoints.add_vertices(created.iter().filter_map(|v| {
            let execution = v.current_execution()?;
            Some((execution.attempt_id, execution.slot?.gateway))
        }));
        if checkpoints.is_periodic_checkpointing_configured() {
            checkpoints.start_checkpoint_scheduler();
        }

        info!(
            operator,
            old_parallelism,
            new_parallelism = old_parallelism + created.len(),
            "Tasks deployed"
        );
        Ok(())
    }

    async fn do_cancel_tasks(&self, operator: OperatorId, offset: usize) -> Result<()> {
        let removed = {
            let mut candidates = self.candidates.lock();
            let Some(entry) = candidates.get_mut(&operator) else {
                return Err(Error::ProtocolViolation(format!(
                    "operator {} has no task to cancel",
                    operator
                )));
            };
            let (cancel, keep) = std::mem::take(&mut entry.removed)
                .into_iter()
                .partition::<Vec<_>, _>(|v| v.subtask_index() >= offset);
            entry.removed = keep;
            cancel
        };
        if removed.is_empty() {
            return Err(Error::ProtocolViolation(format!(
                "operator {} has no task to cancel from subtask {}",
                operator, offset
            )));
        }

        let attempts: Vec<Option<ExecutionAttemptId>> = removed.iter().map(|v| v.attempt_id()).collect();
        try_join_all(removed.iter().map(|v| v.cancel())).await?;

        let checkpoints = self.base.execution_graph().checkpoint_coordinator();
        let sync = self.current_sync();
        for (vertex, attempt) in removed.iter().zip(attempts) {
            if let Some(attempt) = attempt {
                checkpoints.remove_task(attempt);
            }
            if let Some(sync) = &sync {
                sync.forget(operator, vertex.subtask_index());
            }
        }
        info!(operator, canceled = removed.len(), "Tasks canceled");
        Ok(())
    }

    async fn do_update_task_resources(&self, operator: OperatorId, old_parallelism: usize) -> Result<()> {
        let new_parallelism = self.base.job_vertex_of(operator)?.parallelism();
        match new_parallelism.cmp(&old_parallelism) {
            std::cmp::Ordering::Less => self.do_cancel_tasks(operator, 0).await,
            std::cmp::Ordering::Greater => self.do_deploy_tasks(operator, old_parallelism).await,
            std::cmp::Ordering::Equal => Err(Error::ProtocolViolation(format!(
                "parallelism of operator {} did not change",
                operator
            ))),
        }
    }

    async fn do_prepare_rescale(&self, operator: OperatorId, mut diff: Diff) -> Result<Diff> {
        self.phase.advance(RescalePhase::Remapping)?;
        let (old, new) = match diff.remove(operator, ChangeKind::Parallelism) {
            Some(DiffPayload::Parallelism { old, new }) => (old, new),
            _ => {
                return Err(Error::ProtocolViolation(format!(
                    "no parallelism change pending for operator {}",
                    operator
                )))
            }
        };
        let job_vertex = self.base.job_vertex_of(operator)?;
        if job_vertex.parallelism() != old {
            return Err(Error::ProtocolViolation(format!(
                "operator {} runs {} tasks, change expects {}",
                operator,
                job_vertex.parallelism(),
                old
            )));
        }
        if new == 0 {
            return Err(Error::ProtocolViolation(format!("operator {} cannot scale to zero", operator)));
        }

        self.base.update_held_plan(|plan| plan.set_parallelism(operator, new))?;
        let candidates = job_vertex.rescale(new);
        self.candidates.lock().insert(operator, candidates);
        Ok(diff)
    }
}

#[async_trait]
impl PrimitiveOperation for ReconfigureCoordinator {
    async fn prepare_execution_plan(&self, proposed: &ExecutionPlan) -> Result<()> {
        self.track(self.base.prepare_execution_plan(proposed))
    }

    async fn synchronize_pause_tasks(&self, tasks: TaskList, diff: Diff) -> Result<Diff> {
        let result = self.do_synchronize(tasks, diff).await;
        self.track(result)
    }

    async fn resume_tasks(&self) -> Result<()> {
        let result = self.do_resume().await;
        self.track(result)
    }

    async fn update_upstream_key_mapping(&self, destination: OperatorId, diff: Diff) -> Result<Diff> {
        let result = self.do_update_upstream_key_mapping(destination, diff).await;
        self.track(result)
    }

    async fn update_state(&self, operator: OperatorId, diff: Diff) -> Result<Diff> {
        let result = self.do_update_state(operator, diff).await;
        self.track(result)
    }

    async fn update_function(&self, operator: OperatorId, diff: Diff) -> Result<Diff> {
        let result = self.do_update_function(operator, diff).await;
        self.track(result)
    }

    async fn update_task_resources(&self, operator: OperatorId, old_parallelism: usize) -> Result<()> {
        let result = self.do_update_task_resources(operator, old_parallelism).await;
        self.track(result)
    }

    async fn deploy_tasks(&self, operator: OperatorId, old_parallelism: usize) -> Result<()> {
        let result = self.do_deploy_tasks(operator, old_parallelism).await;
        self.track(result)
    }

    async fn cancel_tasks(&self, operator: OperatorId, offset: usize) -> Result<()> {
        let result = self.do_cancel_tasks(operator, offset).await;
        self.track(result)
    }

    async fn prepare_rescale(&self, operator: OperatorId, diff: Diff) -> Result<Diff> {
        let result = self.do_prepare_rescale(operator, diff).await;
        self.track(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cluster, cluster_with, settle, udf, COUNTER, SOURCE};
    use gearshift_plan::KeyStateAllocation;
    use gearshift_runtime::{CheckpointConfig, RpcKind, SyncFlag, TaskState};
    use std::time::Duration;

    fn all(operator: OperatorId) -> (OperatorId, Subtasks) {
        (operator, Subtasks::All)
    }

    #[tokio::test]
    async fn test_update_state_requires_sync() {
        let cluster = cluster(2, 10).await;
        let err = cluster
            .coordinator
            .update_state(COUNTER, Diff::new())
            .await
            .unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(cluster.coordinator.phase(), RescalePhase::Idle);
    }

    #[tokio::test]
    async fn test_resume_without_sync_is_rejected() {
        let cluster = cluster(2, 10).await;
        assert!(cluster
            .coordinator
            .resume_tasks()
            .await
            .unwrap_err()
            .is_protocol_violation());
    }

    #[tokio::test]
    async fn test_standalone_update_function() {
        let cluster = cluster(2, 10).await;
        let c = &cluster.coordinator;
        let mut diff = Diff::new();
        diff.insert(COUNTER, DiffPayload::Udf(udf("count-v3")));

        let diff = c.update_function(COUNTER, diff).await.unwrap();

        assert!(diff.is_settled(COUNTER));
        assert_eq!(c.phase(), RescalePhase::Idle);
        assert_eq!(cluster.rpc_count(RpcKind::UpdateOperator, None), 2);
        assert_eq!(cluster.rpc_count(RpcKind::Sync(SyncFlag::NeedResume), None), 0);
        let uid = cluster.counter_uid();
        assert_eq!(cluster.task(COUNTER, 1).udf_name(uid).as_deref(), Some("count-v3"));
    }

    #[tokio::test]
    async fn test_resume_is_idempotent() {
        let cluster = cluster(2, 10).await;
        let c = &cluster.coordinator;
        c.synchronize_pause_tasks(vec![all(COUNTER)], Diff::new())
            .await
            .unwrap();
        assert_eq!(cluster.task_state(COUNTER, 0), TaskState::Paused);

        let sync = c.current_sync().unwrap();
        sync.resume_tasks(c.base(), &[all(COUNTER)]).await.unwrap();
        sync.resume_tasks(c.base(), &[all(COUNTER)]).await.unwrap();
        sync.resume_tasks(c.base(), &[(COUNTER, Subtasks::Only(1))]).await.unwrap();
        c.resume_tasks().await.unwrap();

        assert_eq!(cluster.rpc_count(RpcKind::Sync(SyncFlag::NeedResume), None), 2);
        assert_eq!(cluster.task_state(COUNTER, 0), TaskState::Running);
        assert_eq!(c.phase(), RescalePhase::Idle);
    }

    #[tokio::test]
    async fn test_second_sync_while_first_in_flight() {
        let cluster = cluster_with(2, 10, CoordinatorConfig::default().with_sync_timeout(None)).await;
        cluster.set_drop_checkpoint_acks(true);
        let c = cluster.coordinator.clone();
        let first = tokio::spawn(async move {
            c.synchronize_pause_tasks(vec![(COUNTER, Subtasks::All)], Diff::new())
                .await
        });
        settle().await;
        assert!(!cluster.coordinator.current_sync().unwrap().is_resolved());

        let err = cluster
            .coordinator
            .synchronize_pause_tasks(vec![all(SOURCE)], Diff::new())
            .await
            .unwrap_err();
        assert!(err.is_protocol_violation());
        first.abort();
    }

    #[tokio::test]
    async fn test_sync_timeout_resumes_tasks() {
        let config = CoordinatorConfig::default()
            .with_sync_timeout(Some(Duration::from_millis(50)))
            .with_checkpoint(CheckpointConfig::default().with_interval(Duration::from_secs(60)));
        let cluster = cluster_with(2, 10, config).await;
        let checkpoints = cluster.graph.checkpoint_coordinator().clone();
        assert!(checkpoints.is_scheduler_running());
        cluster.set_drop_checkpoint_acks(true);

        let err = cluster
            .coordinator
            .synchronize_pause_tasks(vec![all(COUNTER)], Diff::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SyncTimeout { pending: 2, .. }));
        assert_eq!(cluster.coordinator.phase(), RescalePhase::Errored);
        assert_eq!(cluster.task_state(COUNTER, 0), TaskState::Running);
        assert_eq!(cluster.task_state(COUNTER, 1), TaskState::Running);
        assert!(checkpoints.is_scheduler_running());
        assert_eq!(checkpoints.num_pending_checkpoints(), 0);
        assert!(cluster.coordinator.current_sync().is_none());

        // A fresh synchronization recovers from ERRORED.
        cluster.set_drop_checkpoint_acks(false);
        cluster
            .coordinator
            .synchronize_pause_tasks(vec![all(COUNTER)], Diff::new())
            .await
            .unwrap();
        cluster.coordinator.resume_tasks().await.unwrap();
        assert_eq!(cluster.coordinator.phase(), RescalePhase::Idle);
    }

    #[tokio::test]
    async fn test_failed_prepare_aborts_sync() {
        let cluster = cluster(2, 10).await;
        cluster.set_fail_rpcs(true);

        let err = cluster
            .coordinator
            .synchronize_pause_tasks(vec![all(COUNTER)], Diff::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Runtime(gearshift_runtime::Error::Rpc { .. })));
        assert_eq!(cluster.coordinator.phase(), RescalePhase::Errored);
        assert!(cluster.coordinator.current_sync().is_none());
        assert_eq!(cluster.task_state(COUNTER, 0), TaskState::Running);

        cluster.set_fail_rpcs(false);
        cluster
            .coordinator
            .synchronize_pause_tasks(vec![all(COUNTER)], Diff::new())
            .await
            .unwrap();
        cluster.coordinator.resume_tasks().await.unwrap();
    }

    #[tokio::test]
    async fn test_operators_resume_as_they_settle() {
        let cluster = cluster(3, 9).await;
        let c = &cluster.coordinator;
        for key in 0..9 {
            cluster.feed(key, u64::from(key) + 1);
        }

        // Task 0 keeps its keys, tasks 1 and 2 trade key group 5.
        let assignment = c
            .workloads()
            .propose(COUNTER, KeyStateAllocation::from_tasks([(0, 0..3), (1, 3..5), (2, 5..9)]))
            .unwrap();
        let mut diff = Diff::new();
        diff.insert(SOURCE, DiffPayload::KeyMapping(assignment.new_allocation().clone()))
            .insert(COUNTER, DiffPayload::KeyStateAllocation(assignment.clone()));

        let diff = c
            .synchronize_pause_tasks(vec![all(SOURCE), all(COUNTER)], diff)
            .await
            .unwrap();
        let sync = c.current_sync().unwrap();
        assert_eq!(sync.paused_tasks().len(), 4);

        let diff = c.update_upstream_key_mapping(COUNTER, diff).await.unwrap();
        assert!(diff.is_settled(SOURCE));
        assert!(!sync.paused_tasks().contains(&(SOURCE, 0)));
        assert_eq!(cluster.task_state(COUNTER, 0), TaskState::Paused);
        assert_eq!(c.phase(), RescalePhase::Remapping);

        let diff = c.update_state(COUNTER, diff).await.unwrap();
        assert!(diff.is_empty());
        assert!(sync.paused_tasks().is_empty());
        for subtask in 0..3 {
            assert_eq!(cluster.task_state(COUNTER, subtask), TaskState::Running);
        }
        // The unmodified task got no state.
        let untouched = cluster.attempt(COUNTER, 0);
        assert_eq!(cluster.rpc_count(RpcKind::Rescale(RescaleOptions::StateOnly), Some(untouched)), 0);
        assert_eq!(cluster.owner(5), Some(2));
        assert_eq!(cluster.count(5), 6);

        let resumes = cluster.rpc_count(RpcKind::Sync(SyncFlag::NeedResume), None);
        c.resume_tasks().await.unwrap();
        assert_eq!(cluster.rpc_count(RpcKind::Sync(SyncFlag::NeedResume), None), resumes);
        assert_eq!(c.phase(), RescalePhase::Idle);
    }

    #[tokio::test]
    async fn test_resume_after_prepared_scale_in() {
        let cluster = cluster(2, 10).await;
        let c = &cluster.coordinator;
        c.synchronize_pause_tasks(vec![all(COUNTER)], Diff::new())
            .await
            .unwrap();
        let sync = c.current_sync().unwrap();
        let mut diff = Diff::new();
        diff.insert(COUNTER, DiffPayload::Parallelism { old: 2, new: 1 });
        c.prepare_rescale(COUNTER, diff).await.unwrap();

        c.resume_tasks().await.unwrap();

        assert_eq!(cluster.task_state(COUNTER, 0), TaskState::Running);
        assert_eq!(sync.paused_tasks(), vec![(COUNTER, 1)]);
        assert_eq!(c.phase(), RescalePhase::Idle);
    }

    #[tokio::test]
    async fn test_failed_resume_keeps_tasks_tracked() {
        let cluster = cluster(2, 10).await;
        let c = &cluster.coordinator;
        c.synchronize_pause_tasks(vec![all(COUNTER)], Diff::new())
            .await
            .unwrap();
        let sync = c.current_sync().unwrap();

        cluster.set_fail_rpcs(true);
        assert!(c.resume_tasks().await.is_err());
        assert_eq!(sync.paused_tasks(), vec![(COUNTER, 0), (COUNTER, 1)]);
        assert_eq!(c.phase(), RescalePhase::Errored);

        cluster.set_fail_rpcs(false);
        c.resume_tasks().await.unwrap();
        assert!(sync.paused_tasks().is_empty());
        assert_eq!(cluster.task_state(COUNTER, 0), TaskState::Running);
        assert_eq!(cluster.task_state(COUNTER, 1), TaskState::Running);
        assert_eq!(c.phase(), RescalePhase::Idle);
    }

    #[tokio::test]
    async fn test_resources_need_a_parallelism_change() {
        let cluster = cluster(2, 10).await;
        let c = &cluster.coordinator;
        assert!(c.update_task_resources(COUNTER, 2).await.unwrap_err().is_protocol_violation());
        assert!(c.deploy_tasks(COUNTER, 2).await.unwrap_err().is_protocol_violation());
        assert!(c.cancel_tasks(COUNTER, 0).await.unwrap_err().is_protocol_violation());
        assert!(c
            .prepare_rescale(COUNTER, Diff::new())
            .await
            .unwrap_err()
            .is_protocol_violation());
    }

    #[tokio::test]
    async fn test_prepare_rescale_resizes_plan_and_graph() {
        let cluster = cluster(2, 10).await;
        let c = &cluster.coordinator;
        let mut diff = Diff::new();
        diff.insert(COUNTER, DiffPayload::Parallelism { old: 2, new: 3 });
        c.synchronize_pause_tasks(vec![all(COUNTER)], Diff::new())
            .await
            .unwrap();

        let diff = c.prepare_rescale(COUNTER, diff).await.unwrap();

        assert!(diff.is_settled(COUNTER));
        assert_eq!(cluster.vertices(COUNTER).len(), 3);
        assert!(!cluster.vertices(COUNTER)[2].is_running());
        assert_eq!(c.held_execution_plan_copy().descriptor(COUNTER).unwrap().parallelism(), 3);

        c.deploy_tasks(COUNTER, 2).await.unwrap();
        assert!(cluster.vertices(COUNTER)[2].is_running());
        c.resume_tasks().await.unwrap();
    }
}
