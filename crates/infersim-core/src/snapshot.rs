//! Routing snapshots with staleness semantics.
//!
//! Immediate fields (queue depth, batch size, pending requests, pending
//! transfer latency, prefix match) are read from the instance on every call.
//! Periodic fields (KV utilization, free blocks, hit rate, thrashing rate)
//! come from a cached copy that the engine refreshes every
//! `refresh_interval_us`. An interval of 0 reads them live as well.

use crate::instance::Instance;
use infersim_routing::RoutingSnapshot;
use serde::{Deserialize, Serialize};

/// `[observability]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Refresh period of Periodic snapshot fields.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_us: u64,
    /// Upper bound on Periodic staleness; must be at least the refresh interval.
    #[serde(default = "default_max_staleness")]
    pub max_staleness_us: u64,
}

fn default_refresh_interval() -> u64 {
    1_000
}
fn default_max_staleness() -> u64 {
    5_000
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            refresh_interval_us: default_refresh_interval(),
            max_staleness_us: default_max_staleness(),
        }
    }
}

/// Builds per-decision snapshots from live instance state plus the cached
/// Periodic fields.
#[derive(Debug, Clone)]
pub struct SnapshotProvider {
    refresh_interval_us: u64,
    periodic: Vec<RoutingSnapshot>,
    refreshes: u64,
}

impl SnapshotProvider {
    pub fn new(refresh_interval_us: u64, instances: &[Instance]) -> Self {
        let mut provider = Self {
            refresh_interval_us,
            periodic: instances.iter().map(|i| RoutingSnapshot::new(i.id)).collect(),
            refreshes: 0,
        };
        provider.refresh(instances, 0);
        provider
    }

    pub fn refresh_interval_us(&self) -> u64 {
        self.refresh_interval_us
    }

    /// Periodic fields are read live.
    pub fn is_immediate(&self) -> bool {
        self.refresh_interval_us == 0
    }

    pub fn refreshes(&self) -> u64 {
        self.refreshes
    }

    /// Recopy the Periodic fields of every instance.
    pub fn refresh(&mut self, instances: &[Instance], now_us: u64) {
        for (snap, inst) in self.periodic.iter_mut().zip(instances) {
            inst.fill_periodic(snap, now_us);
        }
        self.refreshes += 1;
    }

    /// Time of the refresh after `now_us`, if refreshes are periodic.
    pub fn next_refresh_us(&self, now_us: u64) -> Option<u64> {
        (!self.is_immediate()).then(|| now_us + self.refresh_interval_us)
    }

    /// Age of the oldest cached Periodic field.
    pub fn staleness_us(&self, now_us: u64) -> u64 {
        if self.is_immediate() {
            return 0;
        }
        self.periodic
            .iter()
            .map(|s| now_us.saturating_sub(s.periodic_as_of_us))
            .max()
            .unwrap_or(0)
    }

    /// One snapshot per instance, in id order, for a request whose prompt
    /// hashes to `block_hashes`.
    pub fn snapshots(
        &self,
        instances: &[Instance],
        now_us: u64,
        block_hashes: &[u64],
    ) -> Vec<RoutingSnapshot> {
        instances
            .iter()
            .map(|inst| {
                let mut snap = inst.snapshot(now_us);
                snap.prefix_match_blocks = inst.cache.match_length(block_hashes);
                if !self.is_immediate() {
                    if let Some(cached) = self.periodic.get(inst.id as usize) {
                        copy_periodic(&mut snap, cached);
                    }
                }
                snap
            })
            .collect()
    }
}

fn copy_periodic(dst: &mut RoutingSnapshot, src: &RoutingSnapshot) {
    dst.kv_utilization = src.kv_utilization;
    dst.free_kv_blocks = src.free_kv_blocks;
    dst.total_kv_blocks = src.total_kv_blocks;
    dst.cache_hit_rate = src.cache_hit_rate;
    dst.kv_thrashing_rate = src.kv_thrashing_rate;
    dst.periodic_as_of_us = src.periodic_as_of_us;
}
