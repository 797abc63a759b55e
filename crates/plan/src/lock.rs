//! Single-writer gate around the committed execution plan.

use parking_lot::{Mutex, RwLock};
use std::error::Error as StdError;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::plan::ExecutionPlan;
use crate::{Error, Result};

const COMMITTED: u8 = 1;
const STAGED: u8 = 0;

/// Callback interface of a controller waiting on a reconfiguration.
pub trait ControlPolicy: Send + Sync {
    /// Called exactly once per staged update, with the failure if it failed.
    fn on_change_completed(&self, failure: Option<&(dyn StdError + Send + Sync + 'static)>);
}

/// The committed plan guarded by an atomic `COMMITTED`/`STAGED` flag.
///
/// At most one update is staged at a time; a second attempt fails fast
/// instead of waiting.
pub struct ExecutionPlanWithLock {
    state: AtomicU8,
    plan: RwLock<ExecutionPlan>,
    waiting: Mutex<Option<Arc<dyn ControlPolicy>>>,
}

impl ExecutionPlanWithLock {
    pub fn new(plan: ExecutionPlan) -> Self {
        Self {
            state: AtomicU8::new(COMMITTED),
            plan: RwLock::new(plan),
            waiting: Mutex::new(None),
        }
    }

    /// Stage an update. Fails with [`Error::UpdateInProgress`] if another one
    /// is staged.
    pub fn set_state_updating_flag(&self, waiting: Option<Arc<dyn ControlPolicy>>) -> Result<()> {
        // The policy is in place before a finishing call can observe STAGED.
        let mut slot = self.waiting.lock();
        self.state
            .compare_exchange(COMMITTED, STAGED, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::UpdateInProgress)?;
        *slot = waiting;
        debug!("Execution plan update staged");
        Ok(())
    }

    /// Release the gate and notify the waiting controller. Fails with
    /// [`Error::NoUpdateInProgress`] if nothing was staged.
    pub fn notify_update_finished(
        &self,
        failure: Option<&(dyn StdError + Send + Sync + 'static)>,
    ) -> Result<()> {
        let waiting = {
            let mut slot = self.waiting.lock();
            self.state
                .compare_exchange(STAGED, COMMITTED, Ordering::AcqRel, Ordering::Acquire)
                .map_err(|_| Error::NoUpdateInProgress)?;
            slot.take()
        };
        debug!(failed = failure.is_some(), "Execution plan update finished");
        if let Some(policy) = waiting {
            policy.on_change_completed(failure);
        }
        Ok(())
    }

    pub fn is_staged(&self) -> bool {
        self.state.load(Ordering::Acquire) == STAGED
    }

    /// Copy of the committed plan.
    pub fn copy(&self) -> ExecutionPlan {
        self.plan.read().copy()
    }

    /// Run `f` against the committed plan.
    pub fn read<R>(&self, f: impl FnOnce(&ExecutionPlan) -> R) -> R {
        f(&self.plan.read())
    }

    /// Replace the committed plan.
    pub fn commit(&self, plan: ExecutionPlan) {
        *self.plan.write() = plan;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        completed: AtomicUsize,
        failed: AtomicUsize,
    }

    impl ControlPolicy for Recorder {
        fn on_change_completed(&self, failure: Option<&(dyn StdError + Send + Sync + 'static)>) {
            self.completed.fetch_add(1, Ordering::SeqCst);
            if failure.is_some() {
                self.failed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_single_writer() {
        let lock = ExecutionPlanWithLock::new(ExecutionPlan::default());
        lock.set_state_updating_flag(None).unwrap();
        assert!(lock.is_staged());
        assert!(matches!(
            lock.set_state_updating_flag(None),
            Err(Error::UpdateInProgress)
        ));

        lock.notify_update_finished(None).unwrap();
        assert!(!lock.is_staged());
        assert!(lock.set_state_updating_flag(None).is_ok());
    }

    #[test]
    fn test_finish_without_update_fails() {
        let lock = ExecutionPlanWithLock::new(ExecutionPlan::default());
        assert!(matches!(
            lock.notify_update_finished(None),
            Err(Error::NoUpdateInProgress)
        ));
    }

    #[test]
    fn test_waiting_policy_notified_once() {
        let lock = ExecutionPlanWithLock::new(ExecutionPlan::default());
        let recorder = Arc::new(Recorder::default());

        lock.set_state_updating_flag(Some(recorder.clone())).unwrap();
        let failure = Error::Stateless(4);
        lock.notify_update_finished(Some(&failure)).unwrap();
        assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.failed.load(Ordering::SeqCst), 1);

        lock.set_state_updating_flag(None).unwrap();
        lock.notify_update_finished(None).unwrap();
        assert_eq!(recorder.completed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_racing_finish_still_notifies() {
        let lock = Arc::new(ExecutionPlanWithLock::new(ExecutionPlan::default()));
        let recorder = Arc::new(Recorder::default());
        let rounds = 200;

        let finisher = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                for _ in 0..rounds {
                    while lock.notify_update_finished(None).is_err() {
                        std::hint::spin_loop();
                    }
                }
            })
        };
        for _ in 0..rounds {
            while lock.set_state_updating_flag(Some(recorder.clone())).is_err() {
                std::hint::spin_loop();
            }
        }
        finisher.join().unwrap();

        assert!(!lock.is_staged());
        assert_eq!(recorder.completed.load(Ordering::SeqCst), rounds);
    }
}
