//! Routing policy trait definitions.
//!
//! All routing policies implement the [`RoutingPolicy`] trait, which receives
//! a borrowed view of the incoming request plus one [`RoutingSnapshot`] per
//! instance and returns a [`RoutingDecision`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Instance identifier. Instances are numbered `0..n` and snapshots are always
/// passed in ascending id order, so an instance's id is also its index.
pub type InstanceId = u32;

/// Service-level class attached to every request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum SloClass {
    Critical,
    #[default]
    Standard,
    Batch,
    Sheddable,
}

impl SloClass {
    pub const ALL: [SloClass; 4] = [
        SloClass::Critical,
        SloClass::Standard,
        SloClass::Batch,
        SloClass::Sheddable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SloClass::Critical => "critical",
            SloClass::Standard => "standard",
            SloClass::Batch => "batch",
            SloClass::Sheddable => "sheddable",
        }
    }

    /// Only `sheddable` requests may be rejected by SLO-gated admission.
    pub fn is_sheddable(&self) -> bool {
        matches!(self, SloClass::Sheddable)
    }
}

impl fmt::Display for SloClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SloClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(SloClass::Critical),
            "standard" | "" => Ok(SloClass::Standard),
            "batch" => Ok(SloClass::Batch),
            "sheddable" => Ok(SloClass::Sheddable),
            other => Err(format!("unknown SLO class: {}", other)),
        }
    }
}

/// How a snapshot field is refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Freshness {
    /// Recomputed synchronously for every routing decision.
    Immediate,
    /// Cached and refreshed on a fixed interval.
    Periodic,
}

/// The individual signals carried by a [`RoutingSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalField {
    QueueDepth,
    BatchSize,
    PendingRequests,
    PendingTransferLatency,
    PrefixMatch,
    KvUtilization,
    FreeKvBlocks,
    CacheHitRate,
    KvThrashingRate,
}

impl SignalField {
    pub const ALL: [SignalField; 9] = [
        SignalField::QueueDepth,
        SignalField::BatchSize,
        SignalField::PendingRequests,
        SignalField::PendingTransferLatency,
        SignalField::PrefixMatch,
        SignalField::KvUtilization,
        SignalField::FreeKvBlocks,
        SignalField::CacheHitRate,
        SignalField::KvThrashingRate,
    ];

    /// Freshness class of this field.
    pub fn freshness(&self) -> Freshness {
        match self {
            SignalField::QueueDepth
            | SignalField::BatchSize
            | SignalField::PendingRequests
            | SignalField::PendingTransferLatency
            | SignalField::PrefixMatch => Freshness::Immediate,
            SignalField::KvUtilization
            | SignalField::FreeKvBlocks
            | SignalField::CacheHitRate
            | SignalField::KvThrashingRate => Freshness::Periodic,
        }
    }
}

/// Read-only, point-in-time view of one instance, built per routing decision.
///
/// Policies receive snapshots by shared reference for the duration of a single
/// `route` call and cannot keep them beyond it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingSnapshot {
    pub id: InstanceId,
    // --- Immediate ---
    /// Requests waiting in the instance's queue.
    pub queue_depth: u32,
    /// Requests in the running batch.
    pub batch_size: u32,
    /// Requests routed to this instance that have not reached its queue yet.
    pub pending_requests: u32,
    /// Summed remaining in-flight delay of pending requests, in microseconds.
    pub pending_transfer_latency_us: u64,
    /// Leading blocks of the current request already resident on this instance.
    pub prefix_match_blocks: u32,
    // --- Periodic ---
    /// Fraction of KV blocks held by running requests.
    pub kv_utilization: f64,
    pub free_kv_blocks: u64,
    pub total_kv_blocks: u64,
    /// Block-level prefix cache hit rate.
    pub cache_hit_rate: f64,
    /// Evicted blocks per inserted block.
    pub kv_thrashing_rate: f64,
    /// Simulation time at which the Periodic fields were last refreshed.
    pub periodic_as_of_us: u64,
}

impl RoutingSnapshot {
    pub fn new(id: InstanceId) -> Self {
        Self {
            id,
            queue_depth: 0,
            batch_size: 0,
            pending_requests: 0,
            pending_transfer_latency_us: 0,
            prefix_match_blocks: 0,
            kv_utilization: 0.0,
            free_kv_blocks: 0,
            total_kv_blocks: 0,
            cache_hit_rate: 0.0,
            kv_thrashing_rate: 0.0,
            periodic_as_of_us: 0,
        }
    }

    /// `queue_depth + batch_size + pending_requests`.
    pub fn effective_load(&self) -> u64 {
        self.queue_depth as u64 + self.batch_size as u64 + self.pending_requests as u64
    }

    /// Free KV blocks as a fraction of capacity (0.0 when capacity is unknown).
    pub fn free_block_ratio(&self) -> f64 {
        if self.total_kv_blocks == 0 {
            return 0.0;
        }
        self.free_kv_blocks as f64 / self.total_kv_blocks as f64
    }
}

/// Decision returned by a routing policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    /// Destination instance.
    pub instance: InstanceId,
    /// Initial scheduling priority. `0.0` lets the instance compute its own.
    pub priority_hint: f64,
}

impl RoutingDecision {
    pub fn to(instance: InstanceId) -> Self {
        Self {
            instance,
            priority_hint: 0.0,
        }
    }

    pub fn with_priority(mut self, priority_hint: f64) -> Self {
        self.priority_hint = priority_hint;
        self
    }
}

/// Information about an incoming request, borrowed from the simulator's request.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    pub id: u64,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub slo_class: SloClass,
    pub session_id: Option<&'a str>,
    /// Chained block hashes of the prompt (empty in token-count mode).
    pub block_hashes: &'a [u64],
}

/// Virtual simulation clock interface for policies.
pub trait Clock {
    fn now_us(&self) -> u64;
}

/// Outcome notifications delivered to a policy's feedback observer.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingFeedback {
    /// The request passed admission and was routed.
    Routed {
        instance: InstanceId,
        slo_class: SloClass,
    },
    /// The request was rejected by admission control before routing.
    Rejected { slo_class: SloClass },
    /// The request finished on an instance.
    Completed {
        instance: InstanceId,
        slo_class: SloClass,
        ttft_us: u64,
        within_slo: bool,
    },
    /// A running request was preempted on an instance.
    Preempted { instance: InstanceId },
}

/// The core routing policy trait.
///
/// The simulator calls [`RoutingPolicy::route`] for each admitted request and
/// [`RoutingPolicy::observe`] at defined feedback points. Policies with adaptive
/// state mutate it only from `observe`.
pub trait RoutingPolicy: Send + Sync {
    /// Pick a destination. Returns `None` only when `snapshots` is empty.
    fn route(
        &mut self,
        request: &RequestInfo<'_>,
        snapshots: &[RoutingSnapshot],
        clock: &dyn Clock,
    ) -> Option<RoutingDecision>;

    /// Feedback observer hook.
    fn observe(&mut self, _feedback: &RoutingFeedback) {}

    /// Human-readable name for reports.
    fn name(&self) -> &str;

    /// Optional: policy-specific metrics to include in output.
    fn custom_metrics(&self) -> HashMap<String, f64> {
        HashMap::new()
    }
}

/// Index of the largest value; the lowest index wins ties.
pub fn argmax_lowest_index(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v > b => best = Some((i, v)),
            None => best = Some((i, v)),
            _ => {}
        }
    }
    best.map(|(i, _)| i)
}

/// Snapshot with the smallest effective load; the lowest index wins ties.
pub fn least_loaded_index(snapshots: &[RoutingSnapshot]) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (i, snap) in snapshots.iter().enumerate() {
        let load = snap.effective_load();
        match best {
            Some((_, b)) if load < b => best = Some((i, load)),
            None => best = Some((i, load)),
            _ => {}
        }
    }
    best.map(|(i, _)| i)
}
