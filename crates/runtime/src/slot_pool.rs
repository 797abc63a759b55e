//! Task slots offered by registered workers.

use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::gateway::TaskManagerGateway;
use crate::ids::{AllocationId, ExecutionAttemptId};
use crate::{Error, Result};

/// Information about a registered worker.
#[derive(Clone)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub gateway: Arc<dyn TaskManagerGateway>,
    pub total_slots: usize,
    pub used_slots: usize,
    pub last_heartbeat: Instant,
    pub assigned_tasks: HashSet<ExecutionAttemptId>,
}

impl WorkerInfo {
    pub fn new(worker_id: String, gateway: Arc<dyn TaskManagerGateway>, slots: usize) -> Self {
        Self {
            worker_id,
            gateway,
            total_slots: slots,
            used_slots: 0,
            last_heartbeat: Instant::now(),
            assigned_tasks: HashSet::new(),
        }
    }

    pub fn available_slots(&self) -> usize {
        self.total_slots.saturating_sub(self.used_slots)
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        self.last_heartbeat.elapsed() < timeout
    }
}

/// A slot handed to one execution attempt.
#[derive(Clone)]
pub struct LogicalSlot {
    pub allocation_id: AllocationId,
    pub worker_id: String,
    pub gateway: Arc<dyn TaskManagerGateway>,
}

impl fmt::Debug for LogicalSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalSlot")
            .field("allocation_id", &self.allocation_id)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

/// Slots of all registered workers.
pub struct SlotPool {
    workers: DashMap<String, WorkerInfo>,
    worker_timeout: Duration,
}

impl SlotPool {
    pub fn new(worker_timeout: Duration) -> Self {
        Self {
            workers: DashMap::new(),
            worker_timeout,
        }
    }

    /// Register a worker and its slots.
    pub fn register_worker(&self, worker_id: impl Into<String>, gateway: Arc<dyn TaskManagerGateway>, slots: usize) {
        let worker_id = worker_id.into();
        info!(worker_id = %worker_id, slots, "Worker registered");
        self.workers
            .insert(worker_id.clone(), WorkerInfo::new(worker_id, gateway, slots));
    }

    /// Unregister a worker, returning the attempts it was running.
    pub fn unregister_worker(&self, worker_id: &str) -> Vec<ExecutionAttemptId> {
        self.workers
            .remove(worker_id)
            .map(|(_, worker)| worker.assigned_tasks.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn heartbeat(&self, worker_id: &str) {
        if let Some(mut worker) = self.workers.get_mut(worker_id) {
            worker.last_heartbeat = Instant::now();
        }
    }

    /// Available slots across live workers.
    pub fn total_available_slots(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.is_alive(self.worker_timeout))
            .map(|w| w.available_slots())
            .sum()
    }

    /// Live worker with the most free slots.
    pub fn find_worker_with_slots(&self) -> Option<String> {
        self.workers
            .iter()
            .filter(|w| w.is_alive(self.worker_timeout) && w.available_slots() > 0)
            .max_by(|a, b| {
                a.available_slots()
                    .cmp(&b.available_slots())
                    .then_with(|| b.worker_id.cmp(&a.worker_id))
            })
            .map(|w| w.worker_id.clone())
    }

    /// Allocate a slot for `attempt` on the least loaded live worker.
    pub fn allocate_slot(&self, attempt: ExecutionAttemptId) -> Result<LogicalSlot> {
        let worker_id = self
            .find_worker_with_slots()
            .ok_or_else(|| Error::NoAvailableSlot(attempt.to_string()))?;

        let mut worker = self
            .workers
            .get_mut(&worker_id)
            .ok_or_else(|| Error::NoAvailableSlot(attempt.to_string()))?;
        if worker.available_slots() == 0 {
            return Err(Error::NoAvailableSlot(attempt.to_string()));
        }
        worker.used_slots += 1;
        worker.assigned_tasks.insert(attempt);
        debug!(worker_id = %worker_id, attempt = %attempt, "Slot allocated");

        Ok(LogicalSlot {
            allocation_id: AllocationId::generate(),
            worker_id,
            gateway: worker.gateway.clone(),
        })
    }

    /// Return the slot held by `attempt`.
    pub fn release_slot(&self, slot: &LogicalSlot, attempt: ExecutionAttemptId) {
        match self.workers.get_mut(&slot.worker_id) {
            Some(mut worker) => {
                if worker.assigned_tasks.remove(&attempt) {
                    worker.used_slots = worker.used_slots.saturating_sub(1);
                }
            }
            None => warn!(worker_id = %slot.worker_id, "Releasing slot of unknown worker"),
        }
    }
}

impl Default for SlotPool {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointConfig, CheckpointCoordinator};
    use crate::executor::LocalTaskExecutor;

    fn pool_with(slots: &[usize]) -> SlotPool {
        let checkpoints = CheckpointCoordinator::new(CheckpointConfig::default());
        let pool = SlotPool::default();
        for (i, n) in slots.iter().enumerate() {
            let id = format!("worker-{}", i);
            pool.register_worker(id.clone(), Arc::new(LocalTaskExecutor::new(id, checkpoints.responder())), *n);
        }
        pool
    }

    #[test]
    fn test_allocate_prefers_least_loaded_worker() {
        let pool = pool_with(&[1, 3]);
        let slot = pool.allocate_slot(ExecutionAttemptId::generate()).unwrap();
        assert_eq!(slot.worker_id, "worker-1");
        assert_eq!(pool.total_available_slots(), 3);
    }

    #[test]
    fn test_allocate_and_release() {
        let pool = pool_with(&[1]);
        let attempt = ExecutionAttemptId::generate();
        let slot = pool.allocate_slot(attempt).unwrap();
        assert!(matches!(
            pool.allocate_slot(ExecutionAttemptId::generate()),
            Err(Error::NoAvailableSlot(_))
        ));

        pool.release_slot(&slot, attempt);
        pool.release_slot(&slot, attempt);
        assert_eq!(pool.total_available_slots(), 1);
    }

    #[test]
    fn test_unregister_returns_assigned_tasks() {
        let pool = pool_with(&[2]);
        let attempt = ExecutionAttemptId::generate();
        pool.allocate_slot(attempt).unwrap();
        assert_eq!(pool.unregister_worker("worker-0"), vec![attempt]);
        assert_eq!(pool.total_available_slots(), 0);
    }
}
