//! Routing policies for the inference cluster simulator.
//!
//! This crate provides the [`RoutingPolicy`] trait, the per-instance
//! [`RoutingSnapshot`] policies read, the composable scorers, and the
//! built-in policies:
//!
//! | Policy | Strategy | Signals |
//! |--------|----------|---------|
//! | [`RoundRobin`] | `k mod n` | none |
//! | [`LeastLoaded`] | Min effective load | Immediate |
//! | [`WeightedScoring`] | Weighted scorer composite | per scorer |
//! | [`PrefixAffinity`] | `prefix-affinity:3,queue-depth:2` preset | Immediate |
//! | [`AdaptiveWeightedScoring`] | Class profiles, KV pressure, rejection feedback | per scorer |
//! | [`PowerOfD`] | Least loaded of `d` random samples | Immediate |
//! | [`ConsistentHash`] | Session-sticky hash ring | none |

pub mod adaptive;
pub mod config;
pub mod consistent_hash;
pub mod least_loaded;
pub mod power_of_d;
pub mod prefix_affinity;
pub mod round_robin;
pub mod scorers;
pub mod traits;
pub mod weighted_scoring;

pub use adaptive::AdaptiveWeightedScoring;
pub use config::{AdaptiveConfig, KvPressureTrigger, RoutingConfig};
pub use consistent_hash::ConsistentHash;
pub use least_loaded::LeastLoaded;
pub use power_of_d::PowerOfD;
pub use prefix_affinity::PrefixAffinity;
pub use round_robin::RoundRobin;
pub use scorers::{
    parse_scorer_configs, ScorerConfigError, ScorerKind, ScorerWeight, WeightProfile,
};
pub use traits::*;
pub use weighted_scoring::WeightedScoring;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PolicyError {
    #[error("unknown routing policy: {0:?}")]
    UnknownPolicy(String),
    #[error("unknown SLO class in class profile: {0:?}")]
    UnknownSloClass(String),
    #[error("invalid adaptive routing config: {0}")]
    InvalidAdaptive(String),
    #[error(transparent)]
    Scorer(#[from] ScorerConfigError),
}

/// Create a routing policy by name.
///
/// `seed` feeds the policies that sample randomly.
pub fn policy_by_name(
    name: &str,
    config: &RoutingConfig,
    seed: u64,
) -> Result<Box<dyn RoutingPolicy>, PolicyError> {
    let policy: Box<dyn RoutingPolicy> = match name {
        "round_robin" => Box::new(RoundRobin::new()),
        "least_loaded" => Box::new(LeastLoaded::new()),
        "weighted_scoring" => Box::new(WeightedScoring::new(config.base_profile()?)),
        "prefix_affinity" => Box::new(PrefixAffinity::new()),
        "adaptive_weighted_scoring" => Box::new(AdaptiveWeightedScoring::from_config(config)?),
        "power_of_d" => Box::new(PowerOfD::new(config.d_choices, seed)),
        "consistent_hash" => Box::new(ConsistentHash::new(config.virtual_nodes)),
        other => return Err(PolicyError::UnknownPolicy(other.to_string())),
    };
    Ok(policy)
}

/// Create the policy named by `config.policy`.
pub fn policy_from_config(
    config: &RoutingConfig,
    seed: u64,
) -> Result<Box<dyn RoutingPolicy>, PolicyError> {
    policy_by_name(&config.policy, config, seed)
}

/// List all available built-in policy names.
pub fn available_policies() -> Vec<&'static str> {
    vec![
        "round_robin",
        "least_loaded",
        "weighted_scoring",
        "prefix_affinity",
        "adaptive_weighted_scoring",
        "power_of_d",
        "consistent_hash",
    ]
}
