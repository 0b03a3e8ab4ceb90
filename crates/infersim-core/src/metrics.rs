//! Request outcomes and run-level aggregation.
//!
//! The engine emits one [`RequestOutcome`] per request that finishes or is
//! shed into a [`MetricsSink`]. [`MetricsCollector`] is the built-in sink; it
//! aggregates goodput per SLO class, shed counts by reason, latency
//! percentiles, and per-instance fairness into a [`SimulationMetrics`].

use crate::instance::InstanceStats;
use infersim_routing::{InstanceId, SloClass};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Why a request was shed. Each reason is counted separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShedReason {
    /// Rejected by admission control before routing.
    Admission,
    /// The instance's KV cache could not hold it, even after preemption.
    CapacityFault,
    /// Still waiting when its TTFT budget ran out.
    DeadlineExpired,
    /// The routing policy returned no decision or an unknown instance.
    Unroutable,
}

impl ShedReason {
    pub const ALL: [ShedReason; 4] = [
        ShedReason::Admission,
        ShedReason::CapacityFault,
        ShedReason::DeadlineExpired,
        ShedReason::Unroutable,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    CompletedWithinSlo,
    CompletedLate,
    Shed { reason: ShedReason },
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        !matches!(self, Outcome::Shed { .. })
    }
}

/// One record per request leaving the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub request_id: u64,
    pub slo_class: SloClass,
    /// Absent when shed before routing.
    pub instance: Option<InstanceId>,
    pub arrival_us: u64,
    pub ttft_us: Option<u64>,
    /// Arrival to last token.
    pub e2e_us: Option<u64>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub preemptions: u32,
    pub outcome: Outcome,
}

/// Receives request outcomes as the simulation produces them.
pub trait MetricsSink {
    fn record(&mut self, outcome: RequestOutcome);
}

impl MetricsSink for Vec<RequestOutcome> {
    fn record(&mut self, outcome: RequestOutcome) {
        self.push(outcome);
    }
}

/// Nearest-rank summary of a latency distribution, in milliseconds. All
/// zero for an empty distribution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl Percentiles {
    pub fn from_values(values: &[f64]) -> Self {
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let (Some(&min), Some(&max)) = (sorted.first(), sorted.last()) else {
            return Self::default();
        };
        let last = sorted.len() - 1;
        let rank = |q: f64| sorted[(q * last as f64).round() as usize];
        Self {
            p50: rank(0.50),
            p90: rank(0.90),
            p95: rank(0.95),
            p99: rank(0.99),
            min,
            max,
            mean: sorted.iter().sum::<f64>() / sorted.len() as f64,
        }
    }
}

/// Per-SLO-class accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub total: u64,
    pub within_slo: u64,
    pub late: u64,
    pub shed: u64,
    /// `within_slo / total`.
    pub goodput: f64,
    pub ttft_ms: Percentiles,
}

/// Aggregated metrics for an entire simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationMetrics {
    pub policy: String,
    /// Simulated time at which the run ended.
    pub duration_us: u64,
    pub total_requests: u64,
    pub completed_requests: u64,
    pub within_slo_requests: u64,
    /// Still queued or running when the horizon stopped the run.
    pub unfinished_requests: u64,
    /// Fraction of requests completed within their SLO; unfinished requests
    /// count against it.
    pub goodput: f64,
    pub shed_by_reason: BTreeMap<String, u64>,
    pub per_class: BTreeMap<String, ClassMetrics>,

    // Latency
    pub ttft_ms: Percentiles,
    pub e2e_ms: Percentiles,

    // Throughput
    pub requests_per_sec: f64,
    pub tokens_per_sec: f64,

    // KV
    pub preemptions: u64,
    pub kv_allocation_failures: u64,
    pub cache_hit_rate: f64,
    pub thrashing_rate: f64,

    // Fairness
    pub per_instance_requests: Vec<u64>,
    pub load_cv: f64,
    pub jains_fairness_index: f64,
    pub per_instance: Vec<InstanceStats>,

    pub custom_metrics: BTreeMap<String, f64>,
}

impl SimulationMetrics {
    pub fn shed(&self, reason: ShedReason) -> u64 {
        self.shed_by_reason
            .get(shed_key(reason))
            .copied()
            .unwrap_or(0)
    }

    pub fn class(&self, class: SloClass) -> Option<&ClassMetrics> {
        self.per_class.get(class.as_str())
    }
}

fn shed_key(reason: ShedReason) -> &'static str {
    match reason {
        ShedReason::Admission => "admission",
        ShedReason::CapacityFault => "capacity_fault",
        ShedReason::DeadlineExpired => "deadline_expired",
        ShedReason::Unroutable => "unroutable",
    }
}

/// Sink that keeps every outcome and aggregates at the end of a run.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    records: Vec<RequestOutcome>,
    /// Records to discard from the start (warmup), in arrival order.
    warmup_count: u64,
}

impl MetricsSink for MetricsCollector {
    fn record(&mut self, outcome: RequestOutcome) {
        self.records.push(outcome);
    }
}

impl MetricsCollector {
    pub fn new(warmup_count: u64) -> Self {
        Self {
            records: Vec::new(),
            warmup_count,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records in emission order, warmup included.
    pub fn all_records(&self) -> &[RequestOutcome] {
        &self.records
    }

    /// Records that survive the warmup cut: the first `warmup_count`
    /// requests by arrival are dropped.
    pub fn records(&self) -> Vec<&RequestOutcome> {
        let mut sorted: Vec<&RequestOutcome> = self.records.iter().collect();
        sorted.sort_by_key(|r| (r.arrival_us, r.request_id));
        sorted
            .into_iter()
            .skip(self.warmup_count as usize)
            .collect()
    }

    /// Aggregate all metrics into a summary. `unfinished` requests were never
    /// recorded but still count in the goodput denominator.
    ///
    /// If `warmup_requests` swallows every record the summary is empty and
    /// a warning is logged.
    pub fn aggregate(
        &self,
        policy: &str,
        duration_us: u64,
        instances: &[InstanceStats],
        unfinished: u64,
        custom_metrics: HashMap<String, f64>,
    ) -> SimulationMetrics {
        let records = self.records();
        if records.is_empty() && !self.records.is_empty() {
            warn!(
                warmup = self.warmup_count,
                recorded = self.records.len(),
                "warmup_requests covers every request; all metrics will be zero"
            );
        }

        let total = records.len() as u64;
        let completed: Vec<&&RequestOutcome> =
            records.iter().filter(|r| r.outcome.is_completed()).collect();
        let within = records
            .iter()
            .filter(|r| r.outcome == Outcome::CompletedWithinSlo)
            .count() as u64;

        let mut shed_by_reason = BTreeMap::new();
        for reason in ShedReason::ALL {
            shed_by_reason.insert(shed_key(reason).to_string(), 0u64);
        }
        for r in &records {
            if let Outcome::Shed { reason } = r.outcome {
                *shed_by_reason.entry(shed_key(reason).to_string()).or_insert(0) += 1;
            }
        }

        let mut per_class = BTreeMap::new();
        for class in SloClass::ALL {
            let of_class: Vec<&&RequestOutcome> =
                records.iter().filter(|r| r.slo_class == class).collect();
            if of_class.is_empty() {
                continue;
            }
            let n = of_class.len() as u64;
            let within_slo = of_class
                .iter()
                .filter(|r| r.outcome == Outcome::CompletedWithinSlo)
                .count() as u64;
            let late = of_class
                .iter()
                .filter(|r| r.outcome == Outcome::CompletedLate)
                .count() as u64;
            let ttft: Vec<f64> = of_class
                .iter()
                .filter_map(|r| r.ttft_us)
                .map(us_to_ms)
                .collect();
            per_class.insert(
                class.as_str().to_string(),
                ClassMetrics {
                    total: n,
                    within_slo,
                    late,
                    shed: n - within_slo - late,
                    goodput: within_slo as f64 / n as f64,
                    ttft_ms: Percentiles::from_values(&ttft),
                },
            );
        }

        let ttft: Vec<f64> = completed
            .iter()
            .filter_map(|r| r.ttft_us)
            .map(us_to_ms)
            .collect();
        let e2e: Vec<f64> = completed
            .iter()
            .filter_map(|r| r.e2e_us)
            .map(us_to_ms)
            .collect();

        let duration_sec = duration_us as f64 / 1e6;
        let tokens: u64 = completed
            .iter()
            .map(|r| r.input_tokens as u64 + r.output_tokens as u64)
            .sum();

        let per_instance_requests: Vec<u64> = instances.iter().map(|s| s.routed).collect();
        let routed_total: u64 = per_instance_requests.iter().sum();
        let cache_hit_rate = if routed_total > 0 {
            instances
                .iter()
                .map(|s| s.cache_hit_rate * s.routed as f64)
                .sum::<f64>()
                / routed_total as f64
        } else {
            0.0
        };
        let thrashing_rate = if instances.is_empty() {
            0.0
        } else {
            instances.iter().map(|s| s.thrashing_rate).sum::<f64>() / instances.len() as f64
        };

        SimulationMetrics {
            policy: policy.to_string(),
            duration_us,
            total_requests: total,
            completed_requests: completed.len() as u64,
            within_slo_requests: within,
            unfinished_requests: unfinished,
            goodput: if total + unfinished > 0 {
                within as f64 / (total + unfinished) as f64
            } else {
                0.0
            },
            shed_by_reason,
            per_class,
            ttft_ms: Percentiles::from_values(&ttft),
            e2e_ms: Percentiles::from_values(&e2e),
            requests_per_sec: if duration_sec > 0.0 {
                completed.len() as f64 / duration_sec
            } else {
                0.0
            },
            tokens_per_sec: if duration_sec > 0.0 {
                tokens as f64 / duration_sec
            } else {
                0.0
            },
            preemptions: instances.iter().map(|s| s.preemptions).sum(),
            kv_allocation_failures: instances.iter().map(|s| s.kv_allocation_failures).sum(),
            cache_hit_rate,
            thrashing_rate,
            load_cv: coefficient_of_variation(&per_instance_requests),
            jains_fairness_index: jains_fairness_index(&per_instance_requests),
            per_instance_requests,
            per_instance: instances.to_vec(),
            custom_metrics: custom_metrics.into_iter().collect(),
        }
    }
}

fn us_to_ms(us: u64) -> f64 {
    us as f64 / 1000.0
}

fn mean(values: &[u64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<u64>() as f64 / values.len() as f64
    }
}

/// Population variance of per-instance counts.
pub fn variance(values: &[u64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|&v| (v as f64 - m).powi(2)).sum::<f64>() / values.len() as f64
}

/// Standard deviation over mean; 0 for an idle cluster.
pub fn coefficient_of_variation(values: &[u64]) -> f64 {
    match mean(values) {
        m if m > 0.0 => variance(values).sqrt() / m,
        _ => 0.0,
    }
}

/// Jain's index `(Σx)² / (n·Σx²)`: 1.0 is a perfectly even split, `1/n`
/// puts everything on one instance. An idle cluster counts as even.
pub fn jains_fairness_index(values: &[u64]) -> f64 {
    let (sum, sum_sq) = values.iter().fold((0.0, 0.0), |(s, sq), &v| {
        let v = v as f64;
        (s + v, sq + v * v)
    });
    if sum_sq == 0.0 {
        1.0
    } else {
        sum * sum / (values.len() as f64 * sum_sq)
    }
}

/// Format metrics as a pretty-printed table string.
pub fn format_table(metrics: &SimulationMetrics) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "\n{:=<70}\n",
        format!("  {} Results  ", metrics.policy)
    ));
    out.push_str(&format!(
        "  Duration: {:.1}s | Requests: {} | Goodput: {:.1}%\n",
        metrics.duration_us as f64 / 1e6,
        metrics.total_requests,
        metrics.goodput * 100.0
    ));
    out.push_str(&format!(
        "  Shed: admission={} capacity_fault={} deadline_expired={} unroutable={}\n",
        metrics.shed(ShedReason::Admission),
        metrics.shed(ShedReason::CapacityFault),
        metrics.shed(ShedReason::DeadlineExpired),
        metrics.shed(ShedReason::Unroutable),
    ));
    out.push_str(&format!("{:-<70}\n", "  Latency  "));
    out.push_str(&format!(
        "  TTFT (ms)       P50={:>8.1}  P90={:>8.1}  P99={:>8.1}\n",
        metrics.ttft_ms.p50, metrics.ttft_ms.p90, metrics.ttft_ms.p99
    ));
    out.push_str(&format!(
        "  E2E (ms)        P50={:>8.1}  P90={:>8.1}  P99={:>8.1}\n",
        metrics.e2e_ms.p50, metrics.e2e_ms.p90, metrics.e2e_ms.p99
    ));
    out.push_str(&format!("{:-<70}\n", "  SLO classes  "));
    for (class, m) in &metrics.per_class {
        out.push_str(&format!(
            "  {:<10} n={:<6} goodput={:>5.1}%  late={:<5} shed={:<5} TTFT p99={:.1}ms\n",
            class,
            m.total,
            m.goodput * 100.0,
            m.late,
            m.shed,
            m.ttft_ms.p99
        ));
    }
    out.push_str(&format!("{:-<70}\n", "  Throughput  "));
    out.push_str(&format!(
        "  Requests/sec: {:.1}  Tokens/sec: {:.0}\n",
        metrics.requests_per_sec, metrics.tokens_per_sec,
    ));
    out.push_str(&format!("{:-<70}\n", "  KV cache  "));
    out.push_str(&format!(
        "  Hit rate: {:.1}%  Thrashing: {:.3}  Preemptions: {}  Alloc failures: {}\n",
        metrics.cache_hit_rate * 100.0,
        metrics.thrashing_rate,
        metrics.preemptions,
        metrics.kv_allocation_failures,
    ));
    out.push_str(&format!("{:-<70}\n", "  Fairness  "));
    out.push_str(&format!(
        "  Load CV: {:.3}  Jain's index: {:.4}  Per instance: {:?}\n",
        metrics.load_cv, metrics.jains_fairness_index, metrics.per_instance_requests,
    ));
    if !metrics.custom_metrics.is_empty() {
        out.push_str(&format!("{:-<70}\n", "  Policy  "));
        for (k, v) in &metrics.custom_metrics {
            out.push_str(&format!("  {}: {:.4}\n", k, v));
        }
    }
    out.push_str(&format!("{:=<70}\n", ""));
    out
}

/// Format a comparison table of multiple policy results.
pub fn format_comparison_table(results: &[SimulationMetrics]) -> String {
    if results.is_empty() {
        return String::from("No results to compare.\n");
    }

    let mut out = String::new();
    out.push_str(&format!("\n{:=<96}\n", "  Policy Comparison  "));
    out.push_str(&format!(
        "{:<28} {:>8} {:>8} {:>8} {:>8} {:>8} {:>7} {:>7} {:>8}\n",
        "Policy", "TTFT p50", "TTFT p99", "E2E p99", "Goodput", "Cache%", "Shed", "Preempt", "Jain's"
    ));
    out.push_str(&format!("{:-<96}\n", ""));

    for m in results {
        let shed: u64 = m.shed_by_reason.values().sum();
        out.push_str(&format!(
            "{:<28} {:>8.1} {:>8.1} {:>8.1} {:>7.1}% {:>7.1}% {:>7} {:>7} {:>8.4}\n",
            m.policy,
            m.ttft_ms.p50,
            m.ttft_ms.p99,
            m.e2e_ms.p99,
            m.goodput * 100.0,
            m.cache_hit_rate * 100.0,
            shed,
            m.preemptions,
            m.jains_fairness_index,
        ));
    }
    out.push_str(&format!("{:=<96}\n", ""));
    out
}
