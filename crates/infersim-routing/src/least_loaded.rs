//! Least-loaded routing policy.
//!
//! Routes to the instance with the smallest effective load
//! (`queue_depth + batch_size + pending_requests`). Counting pending requests
//! keeps a burst of arrivals at the same timestamp from all landing on the
//! same instance before any of them has reached its queue.

use crate::traits::*;

pub struct LeastLoaded;

impl LeastLoaded {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LeastLoaded {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingPolicy for LeastLoaded {
    fn route(
        &mut self,
        _request: &RequestInfo<'_>,
        snapshots: &[RoutingSnapshot],
        _clock: &dyn Clock,
    ) -> Option<RoutingDecision> {
        least_loaded_index(snapshots).map(|i| RoutingDecision::to(snapshots[i].id))
    }

    fn name(&self) -> &str {
        "least_loaded"
    }
}
