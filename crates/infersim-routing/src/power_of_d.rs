//! Power-of-d-choices routing policy.
//!
//! Samples `d` distinct instances uniformly at random and routes to the least
//! loaded of the sample. The sampler is a seeded ChaCha8 stream, so a run is
//! reproducible for a fixed seed.

use crate::traits::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

pub struct PowerOfD {
    d: usize,
    rng: ChaCha8Rng,
}

impl PowerOfD {
    pub fn new(d: usize, seed: u64) -> Self {
        Self {
            d: d.max(1),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn d(&self) -> usize {
        self.d
    }
}

impl RoutingPolicy for PowerOfD {
    fn route(
        &mut self,
        _request: &RequestInfo<'_>,
        snapshots: &[RoutingSnapshot],
        _clock: &dyn Clock,
    ) -> Option<RoutingDecision> {
        if snapshots.is_empty() {
            return None;
        }
        let amount = self.d.min(snapshots.len());
        let mut sample =
            rand::seq::index::sample(&mut self.rng, snapshots.len(), amount).into_vec();
        // Ascending order makes ties within the sample resolve to the lowest index.
        sample.sort_unstable();

        let mut best = sample[0];
        for &i in &sample[1..] {
            if snapshots[i].effective_load() < snapshots[best].effective_load() {
                best = i;
            }
        }
        Some(RoutingDecision::to(snapshots[best].id))
    }

    fn name(&self) -> &str {
        "power_of_d"
    }
}
