//! Per-signal scorers and weight profiles.
//!
//! Each [`ScorerKind`] reads exactly one signal from the snapshots and returns
//! one score in `[0, 1]` per instance. Scores are combined only by
//! [`WeightProfile::composite`], as a weighted sum.
//!
//! Profiles are written as `"name:weight,name:weight"`. A weight of zero drops
//! the scorer from the profile entirely.

use crate::traits::{Freshness, RequestInfo, RoutingSnapshot, SignalField};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScorerConfigError {
    #[error("unknown scorer: {0:?}")]
    UnknownScorer(String),
    #[error("duplicate scorer: {0:?}")]
    DuplicateScorer(String),
    #[error("malformed scorer entry {0:?}, expected name:weight")]
    Malformed(String),
    #[error("scorer {name:?} has invalid weight {weight}")]
    InvalidWeight { name: String, weight: f64 },
    #[error("at least one scorer needs a positive weight")]
    NoPositiveWeight,
}

/// The built-in scorers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScorerKind {
    /// Matched leading blocks / request blocks.
    PrefixAffinity,
    /// Min-max normalized inverse effective load.
    QueueDepth,
    /// `1 - kv_utilization`.
    KvUtilization,
    /// `1 / (1 + effective_load)`.
    LoadBalance,
}

impl ScorerKind {
    pub const ALL: [ScorerKind; 4] = [
        ScorerKind::PrefixAffinity,
        ScorerKind::QueueDepth,
        ScorerKind::KvUtilization,
        ScorerKind::LoadBalance,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ScorerKind::PrefixAffinity => "prefix-affinity",
            ScorerKind::QueueDepth => "queue-depth",
            ScorerKind::KvUtilization => "kv-utilization",
            ScorerKind::LoadBalance => "load-balance",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// The snapshot fields this scorer reads.
    pub fn signals(&self) -> &'static [SignalField] {
        match self {
            ScorerKind::PrefixAffinity => &[SignalField::PrefixMatch],
            ScorerKind::QueueDepth | ScorerKind::LoadBalance => &[
                SignalField::QueueDepth,
                SignalField::BatchSize,
                SignalField::PendingRequests,
            ],
            ScorerKind::KvUtilization => &[SignalField::KvUtilization],
        }
    }

    /// `Periodic` if any field this scorer reads is periodically refreshed.
    pub fn freshness(&self) -> Freshness {
        if self
            .signals()
            .iter()
            .any(|s| s.freshness() == Freshness::Periodic)
        {
            Freshness::Periodic
        } else {
            Freshness::Immediate
        }
    }

    /// Score every instance. The result is parallel to `snapshots`.
    pub fn score(&self, request: &RequestInfo<'_>, snapshots: &[RoutingSnapshot]) -> Vec<f64> {
        let raw: Vec<f64> = match self {
            ScorerKind::PrefixAffinity => {
                let total = request.block_hashes.len();
                snapshots
                    .iter()
                    .map(|s| {
                        if total == 0 {
                            0.0
                        } else {
                            s.prefix_match_blocks as f64 / total as f64
                        }
                    })
                    .collect()
            }
            ScorerKind::QueueDepth => {
                let loads: Vec<u64> = snapshots.iter().map(|s| s.effective_load()).collect();
                let min = loads.iter().copied().min().unwrap_or(0);
                let max = loads.iter().copied().max().unwrap_or(0);
                loads
                    .iter()
                    .map(|&l| {
                        if max == min {
                            1.0
                        } else {
                            (max - l) as f64 / (max - min) as f64
                        }
                    })
                    .collect()
            }
            ScorerKind::KvUtilization => snapshots.iter().map(|s| 1.0 - s.kv_utilization).collect(),
            ScorerKind::LoadBalance => snapshots
                .iter()
                .map(|s| 1.0 / (1.0 + s.effective_load() as f64))
                .collect(),
        };
        raw.into_iter().map(clamp_score).collect()
    }
}

impl fmt::Display for ScorerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn clamp_score(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// One `(scorer, weight)` entry as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScorerWeight {
    pub kind: ScorerKind,
    pub weight: f64,
}

/// Parse `"name:weight,name:weight"` into raw entries, in written order.
pub fn parse_scorer_configs(s: &str) -> Result<Vec<ScorerWeight>, ScorerConfigError> {
    let mut out: Vec<ScorerWeight> = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, weight) = part
            .split_once(':')
            .ok_or_else(|| ScorerConfigError::Malformed(part.to_string()))?;
        let name = name.trim();
        let kind = ScorerKind::from_name(name)
            .ok_or_else(|| ScorerConfigError::UnknownScorer(name.to_string()))?;
        let weight: f64 = weight
            .trim()
            .parse()
            .map_err(|_| ScorerConfigError::Malformed(part.to_string()))?;
        if !weight.is_finite() || weight < 0.0 {
            return Err(ScorerConfigError::InvalidWeight {
                name: name.to_string(),
                weight,
            });
        }
        if out.iter().any(|e| e.kind == kind) {
            return Err(ScorerConfigError::DuplicateScorer(name.to_string()));
        }
        out.push(ScorerWeight { kind, weight });
    }
    Ok(out)
}

/// A normalized set of scorers with positive weights.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightProfile {
    /// Raw weights as configured, zero-weight entries removed.
    raw: Vec<ScorerWeight>,
    /// Weights normalized to sum to 1.
    normalized: Vec<ScorerWeight>,
}

impl WeightProfile {
    pub fn parse(s: &str) -> Result<Self, ScorerConfigError> {
        Self::from_weights(parse_scorer_configs(s)?)
    }

    pub fn from_weights(entries: Vec<ScorerWeight>) -> Result<Self, ScorerConfigError> {
        for e in &entries {
            if !e.weight.is_finite() || e.weight < 0.0 {
                return Err(ScorerConfigError::InvalidWeight {
                    name: e.kind.name().to_string(),
                    weight: e.weight,
                });
            }
        }
        let raw: Vec<ScorerWeight> = entries.into_iter().filter(|e| e.weight > 0.0).collect();
        if raw.is_empty() {
            return Err(ScorerConfigError::NoPositiveWeight);
        }
        Ok(Self::normalize(raw))
    }

    /// `raw` must be non-empty with positive, finite weights.
    fn normalize(raw: Vec<ScorerWeight>) -> Self {
        let total: f64 = raw.iter().map(|e| e.weight).sum();
        let normalized = raw
            .iter()
            .map(|e| ScorerWeight {
                kind: e.kind,
                weight: e.weight / total,
            })
            .collect();
        Self { raw, normalized }
    }

    /// `prefix-affinity:3,queue-depth:2`
    pub fn prefix_affinity() -> Self {
        Self::normalize(vec![
            ScorerWeight {
                kind: ScorerKind::PrefixAffinity,
                weight: 3.0,
            },
            ScorerWeight {
                kind: ScorerKind::QueueDepth,
                weight: 2.0,
            },
        ])
    }

    /// Raw configured weight of a scorer (0.0 if excluded).
    pub fn raw_weight(&self, kind: ScorerKind) -> f64 {
        self.raw
            .iter()
            .find(|e| e.kind == kind)
            .map_or(0.0, |e| e.weight)
    }

    /// Normalized weight of a scorer (0.0 if excluded).
    pub fn weight(&self, kind: ScorerKind) -> f64 {
        self.normalized
            .iter()
            .find(|e| e.kind == kind)
            .map_or(0.0, |e| e.weight)
    }

    pub fn contains(&self, kind: ScorerKind) -> bool {
        self.raw.iter().any(|e| e.kind == kind)
    }

    pub fn entries(&self) -> &[ScorerWeight] {
        &self.normalized
    }

    /// Rebuild with new raw weights for the given scorers; other entries keep theirs.
    pub fn with_raw_weights(&self, updates: &[ScorerWeight]) -> Result<Self, ScorerConfigError> {
        let mut entries = self.raw.clone();
        for u in updates {
            match entries.iter_mut().find(|e| e.kind == u.kind) {
                Some(e) => e.weight = u.weight,
                None => entries.push(*u),
            }
        }
        Self::from_weights(entries)
    }

    /// True when no included scorer reads a Periodic signal.
    pub fn uses_only_immediate(&self) -> bool {
        self.raw
            .iter()
            .all(|e| e.kind.freshness() == Freshness::Immediate)
    }

    /// `Σ weight_i * score_i` per instance, parallel to `snapshots`.
    pub fn composite(&self, request: &RequestInfo<'_>, snapshots: &[RoutingSnapshot]) -> Vec<f64> {
        let mut totals = vec![0.0; snapshots.len()];
        for entry in &self.normalized {
            let scores = entry.kind.score(request, snapshots);
            for (t, s) in totals.iter_mut().zip(scores) {
                *t += entry.weight * s;
            }
        }
        totals
    }
}

impl fmt::Display for WeightProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .raw
            .iter()
            .map(|e| format!("{}:{}", e.kind, e.weight))
            .collect();
        f.write_str(&parts.join(","))
    }
}

/// `prefix-affinity:3,queue-depth:2,kv-utilization:2`
pub const DEFAULT_PROFILE: &str = "prefix-affinity:3,queue-depth:2,kv-utilization:2";

impl Default for WeightProfile {
    fn default() -> Self {
        let entries = vec![
            ScorerWeight {
                kind: ScorerKind::PrefixAffinity,
                weight: 3.0,
            },
            ScorerWeight {
                kind: ScorerKind::QueueDepth,
                weight: 2.0,
            },
            ScorerWeight {
                kind: ScorerKind::KvUtilization,
                weight: 2.0,
            },
        ];
        Self::normalize(entries)
    }
}
