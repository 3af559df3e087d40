//! Shared simulation clock.

use std::sync::Mutex;

use crate::{SimTime, SystemMode};

/// Process-wide simulation clock.
///
/// Tracks the current step, the wall-clock length of one step and the grid
/// operating mode. One instance is constructed at startup and shared by the
/// session layer (registration responses), the control cycle (batch headers,
/// price intervals) and the simulation loop (advancing).
pub struct SystemClock {
    state: Mutex<ClockState>,
}

struct ClockState {
    time: SimTime,
    mode: SystemMode,
    step_seconds: u32,
}

impl SystemClock {
    pub fn new(step_seconds: u32, mode: SystemMode) -> Self {
        SystemClock {
            state: Mutex::new(ClockState {
                time: 0,
                mode,
                step_seconds,
            }),
        }
    }

    /// Current simulation step.
    pub fn time(&self) -> SimTime {
        self.state.lock().unwrap().time
    }

    pub fn mode(&self) -> SystemMode {
        self.state.lock().unwrap().mode
    }

    /// Wall-clock seconds represented by one simulation step.
    pub fn step_seconds(&self) -> u32 {
        self.state.lock().unwrap().step_seconds
    }

    /// Moves the clock forward by one step and returns the new time.
    pub fn advance(&self) -> SimTime {
        let mut state = self.state.lock().unwrap();
        state.time += 1;
        trace!("clock advanced to step {}", state.time);
        state.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_one_step_at_a_time() {
        let clock = SystemClock::new(60, SystemMode::Normal);
        assert_eq!(clock.time(), 0);
        assert_eq!(clock.advance(), 1);
        assert_eq!(clock.advance(), 2);
        assert_eq!(clock.time(), 2);
        assert_eq!(clock.step_seconds(), 60);
    }
}
