//! Weighted multi-scorer routing policy.
//!
//! Every configured scorer produces a `[0, 1]` score per instance. The
//! composite is the normalized weighted sum and the instance with the highest
//! composite wins. Ties go to the lowest instance index.

use crate::scorers::WeightProfile;
use crate::traits::*;
use std::collections::HashMap;

pub struct WeightedScoring {
    profile: WeightProfile,
}

impl WeightedScoring {
    pub fn new(profile: WeightProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &WeightProfile {
        &self.profile
    }
}

impl Default for WeightedScoring {
    fn default() -> Self {
        Self::new(WeightProfile::default())
    }
}

impl RoutingPolicy for WeightedScoring {
    fn route(
        &mut self,
        request: &RequestInfo<'_>,
        snapshots: &[RoutingSnapshot],
        _clock: &dyn Clock,
    ) -> Option<RoutingDecision> {
        let scores = self.profile.composite(request, snapshots);
        argmax_lowest_index(&scores).map(|i| RoutingDecision::to(snapshots[i].id))
    }

    fn name(&self) -> &str {
        "weighted_scoring"
    }

    fn custom_metrics(&self) -> HashMap<String, f64> {
        self.profile
            .entries()
            .iter()
            .map(|e| (format!("weight_{}", e.kind), e.weight))
            .collect()
    }
}
