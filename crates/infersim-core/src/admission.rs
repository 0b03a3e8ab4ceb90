//! Admission control.
//!
//! Runs once per arrival, before routing, against the same snapshots the
//! router sees. A rejection is a normal outcome recorded as an admission
//! shed, never an error.

use crate::request::Request;
use infersim_routing::RoutingSnapshot;
use serde::{Deserialize, Serialize};

/// `[admission]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default = "default_policy")]
    pub policy: String,
    /// `slo_gated`: shed sheddable requests while the deepest queue exceeds this.
    #[serde(default = "default_queue_threshold")]
    pub queue_threshold: u32,
    /// `token_bucket`: bucket size, in input tokens.
    #[serde(default = "default_bucket_capacity")]
    pub token_bucket_capacity: f64,
    /// `token_bucket`: input tokens added per second.
    #[serde(default = "default_refill_rate")]
    pub token_bucket_refill_rate: f64,
}

fn default_policy() -> String {
    "always_admit".to_string()
}
fn default_queue_threshold() -> u32 {
    5
}
fn default_bucket_capacity() -> f64 {
    100_000.0
}
fn default_refill_rate() -> f64 {
    50_000.0
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            queue_threshold: default_queue_threshold(),
            token_bucket_capacity: default_bucket_capacity(),
            token_bucket_refill_rate: default_refill_rate(),
        }
    }
}

pub const ADMISSION_POLICIES: [&str; 3] = ["always_admit", "slo_gated", "token_bucket"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admit,
    Reject(&'static str),
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admit)
    }
}

/// The admission gate in front of the router.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionControl {
    AlwaysAdmit,
    /// Sheds `sheddable` requests iff the deepest wait queue is strictly
    /// above `threshold`. Other classes always pass.
    SloGated { threshold: u32 },
    /// Rate limit on input tokens.
    TokenBucket {
        capacity: f64,
        refill_per_sec: f64,
        tokens: f64,
        last_refill_us: u64,
    },
}

impl AdmissionControl {
    pub fn from_config(config: &AdmissionConfig) -> Result<Self, String> {
        match config.policy.as_str() {
            "always_admit" => Ok(AdmissionControl::AlwaysAdmit),
            "slo_gated" => Ok(AdmissionControl::SloGated {
                threshold: config.queue_threshold,
            }),
            "token_bucket" => Ok(AdmissionControl::token_bucket(
                config.token_bucket_capacity,
                config.token_bucket_refill_rate,
            )),
            other => Err(format!("unknown admission policy: {}", other)),
        }
    }

    pub fn token_bucket(capacity: f64, refill_per_sec: f64) -> Self {
        AdmissionControl::TokenBucket {
            capacity,
            refill_per_sec,
            tokens: capacity,
            last_refill_us: 0,
        }
    }

    pub fn admit(
        &mut self,
        request: &Request,
        snapshots: &[RoutingSnapshot],
        now_us: u64,
    ) -> AdmissionDecision {
        match self {
            AdmissionControl::AlwaysAdmit => AdmissionDecision::Admit,
            AdmissionControl::SloGated { threshold } => {
                if !request.slo_class.is_sheddable() {
                    return AdmissionDecision::Admit;
                }
                let max_queue = snapshots.iter().map(|s| s.queue_depth).max().unwrap_or(0);
                if max_queue > *threshold {
                    AdmissionDecision::Reject("queue depth above threshold")
                } else {
                    AdmissionDecision::Admit
                }
            }
            AdmissionControl::TokenBucket {
                capacity,
                refill_per_sec,
                tokens,
                last_refill_us,
            } => {
                if now_us > *last_refill_us {
                    let elapsed = (now_us - *last_refill_us) as f64;
                    *tokens = (*tokens + elapsed * *refill_per_sec / 1e6).min(*capacity);
                    *last_refill_us = now_us;
                }
                let cost = request.input_len() as f64;
                if *tokens >= cost {
                    *tokens -= cost;
                    AdmissionDecision::Admit
                } else {
                    AdmissionDecision::Reject("insufficient tokens")
                }
            }
        }
    }
}
