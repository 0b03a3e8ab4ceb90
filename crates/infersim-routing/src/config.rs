//! Routing configuration, embedded as the `[routing]` table of a simulation config.

use crate::scorers::{WeightProfile, DEFAULT_PROFILE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `[routing]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingConfig {
    /// Policy name, see [`crate::available_policies`].
    #[serde(default = "default_policy")]
    pub policy: String,
    /// Weight profile for `weighted_scoring`, and the base profile for
    /// `adaptive_weighted_scoring`.
    #[serde(default = "default_scorers")]
    pub scorers: String,
    /// Sample size for `power_of_d`.
    #[serde(default = "default_d_choices")]
    pub d_choices: usize,
    /// Ring points per instance for `consistent_hash`.
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: u32,
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
}

fn default_policy() -> String {
    "weighted_scoring".to_string()
}
fn default_scorers() -> String {
    DEFAULT_PROFILE.to_string()
}
fn default_d_choices() -> usize {
    2
}
fn default_virtual_nodes() -> u32 {
    64
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            policy: default_policy(),
            scorers: default_scorers(),
            d_choices: default_d_choices(),
            virtual_nodes: default_virtual_nodes(),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

/// Signal that switches the adaptive policy into its pressure profile.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "signal", rename_all = "kebab-case")]
pub enum KvPressureTrigger {
    /// Cluster-wide free blocks / total blocks drops below `below`.
    FreeBlockRatio { below: f64 },
    /// The highest per-instance thrashing rate exceeds `above`.
    ThrashingRate { above: f64 },
}

impl Default for KvPressureTrigger {
    fn default() -> Self {
        KvPressureTrigger::FreeBlockRatio { below: 0.1 }
    }
}

impl KvPressureTrigger {
    pub fn threshold(&self) -> f64 {
        match *self {
            KvPressureTrigger::FreeBlockRatio { below } => below,
            KvPressureTrigger::ThrashingRate { above } => above,
        }
    }
}

/// `[routing.adaptive]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdaptiveConfig {
    /// Per-SLO-class weight profiles, keyed by class name. Classes without an
    /// entry use `routing.scorers`.
    #[serde(default)]
    pub class_profiles: BTreeMap<String, String>,
    /// Profile used while the KV pressure trigger is active.
    #[serde(default = "default_pressure_profile")]
    pub pressure_profile: String,
    #[serde(default)]
    pub pressure_trigger: KvPressureTrigger,
    /// Enables epoch-based weight adjustment from rejection feedback.
    #[serde(default = "default_true")]
    pub feedback: bool,
    /// Decisions per adjustment epoch.
    #[serde(default = "default_epoch_size")]
    pub epoch_size: u32,
    /// Rejection rate above which prefix affinity is traded for load spreading.
    #[serde(default = "default_high_rejection")]
    pub high_rejection_rate: f64,
    /// Rejection rate below which the weights relax back toward neutral.
    #[serde(default = "default_low_rejection")]
    pub low_rejection_rate: f64,
    /// Multiplicative step size per epoch.
    #[serde(default = "default_step")]
    pub step: f64,
}

fn default_pressure_profile() -> String {
    "prefix-affinity:2,queue-depth:3".to_string()
}
fn default_true() -> bool {
    true
}
fn default_epoch_size() -> u32 {
    100
}
fn default_high_rejection() -> f64 {
    0.10
}
fn default_low_rejection() -> f64 {
    0.02
}
fn default_step() -> f64 {
    0.5
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            class_profiles: BTreeMap::new(),
            pressure_profile: default_pressure_profile(),
            pressure_trigger: KvPressureTrigger::default(),
            feedback: default_true(),
            epoch_size: default_epoch_size(),
            high_rejection_rate: default_high_rejection(),
            low_rejection_rate: default_low_rejection(),
            step: default_step(),
        }
    }
}

impl RoutingConfig {
    /// Parse the base profile.
    pub fn base_profile(&self) -> Result<WeightProfile, crate::ScorerConfigError> {
        WeightProfile::parse(&self.scorers)
    }
}
