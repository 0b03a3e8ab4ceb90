//! Round-robin routing policy.
//!
//! Ignores instance state entirely: the k-th routed request goes to instance
//! `k mod n`. Useful as a fairness baseline.

use crate::traits::*;

/// Round-robin router over a counter of routed requests.
pub struct RoundRobin {
    counter: u64,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self { counter: 0 }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingPolicy for RoundRobin {
    fn route(
        &mut self,
        _request: &RequestInfo<'_>,
        snapshots: &[RoutingSnapshot],
        _clock: &dyn Clock,
    ) -> Option<RoutingDecision> {
        if snapshots.is_empty() {
            return None;
        }
        let idx = (self.counter % snapshots.len() as u64) as usize;
        self.counter += 1;
        Some(RoutingDecision::to(snapshots[idx].id))
    }

    fn name(&self) -> &str {
        "round_robin"
    }
}
