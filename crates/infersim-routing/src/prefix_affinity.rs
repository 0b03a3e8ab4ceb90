//! Prefix-affinity routing policy.
//!
//! A named preset of [`WeightedScoring`]: `prefix-affinity:3,queue-depth:2`.
//! The resident prefix pulls requests toward the instance that already holds
//! their blocks, and the queue-depth score keeps a hot instance from
//! absorbing every request that shares a prompt.

use crate::scorers::WeightProfile;
use crate::traits::*;
use crate::weighted_scoring::WeightedScoring;
use std::collections::HashMap;

pub struct PrefixAffinity {
    inner: WeightedScoring,
}

impl PrefixAffinity {
    pub fn new() -> Self {
        Self {
            inner: WeightedScoring::new(WeightProfile::prefix_affinity()),
        }
    }

    pub fn profile(&self) -> &WeightProfile {
        self.inner.profile()
    }
}

impl Default for PrefixAffinity {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingPolicy for PrefixAffinity {
    fn route(
        &mut self,
        request: &RequestInfo<'_>,
        snapshots: &[RoutingSnapshot],
        clock: &dyn Clock,
    ) -> Option<RoutingDecision> {
        self.inner.route(request, snapshots, clock)
    }

    fn name(&self) -> &str {
        "prefix_affinity"
    }

    fn custom_metrics(&self) -> HashMap<String, f64> {
        self.inner.custom_metrics()
    }
}
