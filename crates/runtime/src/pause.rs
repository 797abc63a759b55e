//! Per-task pause control.
//!
//! A pause is requested ahead of time and takes effect when the task reaches
//! the next rescale-point barrier, so the task stops on a consistent cut.

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseState {
    Running,
    /// Will pause at the next barrier.
    PauseRequested,
    Paused,
}

#[derive(Debug)]
pub struct PauseController {
    state: Mutex<PauseState>,
}

impl PauseController {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PauseState::Running),
        }
    }

    pub fn state(&self) -> PauseState {
        *self.state.lock()
    }

    pub fn is_paused(&self) -> bool {
        self.state() == PauseState::Paused
    }

    pub fn request_pause(&self) {
        let mut state = self.state.lock();
        if *state == PauseState::Running {
            *state = PauseState::PauseRequested;
        }
    }

    /// Called at a barrier: enter `Paused` if a pause was requested.
    pub fn ack_if_pause(&self) -> bool {
        let mut state = self.state.lock();
        if *state == PauseState::PauseRequested {
            *state = PauseState::Paused;
            true
        } else {
            false
        }
    }

    /// Leave the paused (or pause-requested) state. Returns whether anything
    /// changed.
    pub fn resume(&self) -> bool {
        let mut state = self.state.lock();
        let changed = *state != PauseState::Running;
        *state = PauseState::Running;
        changed
    }
}

impl Default for PauseController {
    fn default() -> Self {
        Self::new()
    }
}
