//! Phase tracking of a rescale.
//!
//! ```text
//! IDLE -> PAUSING -> { REMAPPING | REASSIGNING_STATE | UPDATING_FUNCTION }* -> RESUMING -> IDLE
//!            any active phase -> ERRORED -> { RESUMING | PAUSING }
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RescalePhase {
    Idle,
    Pausing,
    Remapping,
    ReassigningState,
    UpdatingFunction,
    Resuming,
    Errored,
}

impl RescalePhase {
    fn is_work(self) -> bool {
        matches!(
            self,
            RescalePhase::Remapping | RescalePhase::ReassigningState | RescalePhase::UpdatingFunction
        )
    }
}

impl fmt::Display for RescalePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RescalePhase::Idle => "IDLE",
            RescalePhase::Pausing => "PAUSING",
            RescalePhase::Remapping => "REMAPPING",
            RescalePhase::ReassigningState => "REASSIGNING_STATE",
            RescalePhase::UpdatingFunction => "UPDATING_FUNCTION",
            RescalePhase::Resuming => "RESUMING",
            RescalePhase::Errored => "ERRORED",
        };
        f.write_str(name)
    }
}

/// Current phase of the coordinator.
#[derive(Debug)]
pub struct PhaseTracker {
    phase: Mutex<RescalePhase>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(RescalePhase::Idle),
        }
    }

    pub fn current(&self) -> RescalePhase {
        *self.phase.lock()
    }

    /// Move to `to` and return the phase actually entered.
    ///
    /// Work phases requested while idle run outside any rescale and leave the
    /// tracker idle.
    pub fn advance(&self, to: RescalePhase) -> Result<RescalePhase> {
        use RescalePhase::*;

        let mut phase = self.phase.lock();
        let from = *phase;
        let next = match (from, to) {
            (_, Errored) => Errored,
            (Resuming, Pausing) => return Err(illegal(from, to)),
            (_, Pausing) => Pausing,
            (Idle, work) if work.is_work() => Idle,
            (Pausing, work) if work.is_work() => work,
            (current, work) if current.is_work() && work.is_work() => work,
            (Idle, Resuming) | (Resuming, Resuming) => return Err(illegal(from, to)),
            (_, Resuming) => Resuming,
            (Resuming, Idle) | (Idle, Idle) => Idle,
            _ => return Err(illegal(from, to)),
        };
        if next != from {
            debug!(from = %from, to = %next, "Rescale phase changed");
        }
        *phase = next;
        Ok(next)
    }

    /// Enter `ERRORED`.
    pub fn fail(&self) {
        let mut phase = self.phase.lock();
        if *phase != RescalePhase::Idle {
            warn!(from = %*phase, "Rescale phase failed");
            *phase = RescalePhase::Errored;
        }
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn illegal(from: RescalePhase, to: RescalePhase) -> Error {
    Error::ProtocolViolation(format!("cannot move from {} to {}", from, to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use RescalePhase::*;

    #[test]
    fn test_full_cycle() {
        let tracker = PhaseTracker::new();
        for phase in [Pausing, Remapping, ReassigningState, UpdatingFunction, Remapping, Resuming, Idle] {
            assert_eq!(tracker.advance(phase).unwrap(), phase);
        }
    }

    #[test]
    fn test_standalone_work_stays_idle() {
        let tracker = PhaseTracker::new();
        assert_eq!(tracker.advance(UpdatingFunction).unwrap(), Idle);
        assert_eq!(tracker.current(), Idle);
        tracker.fail();
        assert_eq!(tracker.current(), Idle);
    }

    #[test]
    fn test_illegal_transitions() {
        let tracker = PhaseTracker::new();
        assert!(tracker.advance(Resuming).unwrap_err().is_protocol_violation());

        tracker.advance(Pausing).unwrap();
        tracker.advance(Resuming).unwrap();
        assert!(tracker.advance(Pausing).is_err());
        assert!(tracker.advance(Remapping).is_err());
    }

    #[test]
    fn test_errored_recovers_by_resume_or_new_pause() {
        let tracker = PhaseTracker::new();
        tracker.advance(Pausing).unwrap();
        tracker.fail();
        assert_eq!(tracker.current(), Errored);
        assert!(tracker.advance(Remapping).is_err());
        assert_eq!(tracker.advance(Pausing).unwrap(), Pausing);
        tracker.fail();
        assert_eq!(tracker.advance(Resuming).unwrap(), Resuming);
        assert_eq!(tracker.advance(Idle).unwrap(), Idle);
    }
}
