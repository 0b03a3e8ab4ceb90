//! Virtual clock for discrete-event simulation.
//!
//! The [`SimClock`] tracks simulation time independently of wall-clock time,
//! advancing only when events are processed. Time is kept in microseconds,
//! the unit of every cost-model coefficient.

use infersim_routing::Clock;
use serde::{Deserialize, Serialize};

/// Virtual simulation clock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimClock {
    /// Current simulation time in microseconds.
    current_us: u64,
}

impl SimClock {
    /// Create a new clock starting at time zero.
    pub fn new() -> Self {
        Self { current_us: 0 }
    }

    /// Current time in microseconds.
    pub fn now_us(&self) -> u64 {
        self.current_us
    }

    /// Advance the clock to a specific time in microseconds.
    ///
    /// # Panics
    ///
    /// Panics in debug mode if `us` is in the past.
    pub fn advance_to_us(&mut self, us: u64) {
        debug_assert!(
            us >= self.current_us,
            "Cannot move clock backwards: current={}us, target={}us",
            self.current_us,
            us,
        );
        self.current_us = us;
    }
}

impl Clock for SimClock {
    fn now_us(&self) -> u64 {
        self.current_us
    }
}
