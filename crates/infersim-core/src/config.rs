//! TOML configuration.
//!
//! Every option has a documented default. Omitting a cost-model coefficient
//! means its reference value, and omitting `beta3` means `beta3 = 0`.
//! A configuration that fails validation never starts a simulation.

use crate::admission::{AdmissionConfig, AdmissionControl};
use crate::cost_model::CostModel;
use crate::request::SloClass;
use crate::scheduler::{PriorityPolicy, QueueOrdering};
use crate::snapshot::ObservabilityConfig;
use crate::workload::WorkloadConfig;
use infersim_routing::{available_policies, policy_from_config, PolicyError, RoutingConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Validation(String),
    #[error("Invalid routing configuration: {0}")]
    Policy(#[from] PolicyError),
}

/// Top-level simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub simulation: SimulationSection,
    pub cluster: ClusterSection,
    #[serde(default)]
    pub cost_model: CostModel,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub slo: SloSection,
    #[serde(default)]
    pub workload: WorkloadConfig,
}

/// `[simulation]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationSection {
    #[serde(default = "default_sim_name")]
    pub name: String,
    /// Seeds the workload generator and randomized routing policies.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Stop processing events after this simulated time.
    #[serde(default)]
    pub horizon_us: Option<u64>,
    /// Number of earliest-arriving requests to discard from metrics.
    #[serde(default)]
    pub warmup_requests: u64,
}

fn default_sim_name() -> String {
    "simulation".to_string()
}
fn default_seed() -> u64 {
    42
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            name: default_sim_name(),
            seed: default_seed(),
            horizon_us: None,
            warmup_requests: 0,
        }
    }
}

/// `[cluster]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
    pub num_instances: u32,
    /// KV cache blocks per instance.
    #[serde(default = "default_total_kv_blocks")]
    pub total_kv_blocks: u64,
    /// Tokens per KV cache block.
    #[serde(default = "default_kv_block_size")]
    pub kv_block_size: u32,
    #[serde(default = "default_max_running_requests")]
    pub max_running_requests: u32,
    /// Token budget of one step (prefill chunks plus decode tokens).
    #[serde(default = "default_max_scheduled_tokens")]
    pub max_scheduled_tokens: u32,
}

fn default_total_kv_blocks() -> u64 {
    2048
}
fn default_kv_block_size() -> u32 {
    16
}
fn default_max_running_requests() -> u32 {
    256
}
fn default_max_scheduled_tokens() -> u32 {
    2048
}

impl ClusterSection {
    pub fn with_instances(num_instances: u32) -> Self {
        Self {
            num_instances,
            total_kv_blocks: default_total_kv_blocks(),
            kv_block_size: default_kv_block_size(),
            max_running_requests: default_max_running_requests(),
            max_scheduled_tokens: default_max_scheduled_tokens(),
        }
    }
}

/// `[scheduler]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default)]
    pub ordering: QueueOrdering,
    #[serde(default)]
    pub priority_policy: PriorityPolicy,
    /// Priority gained (or lost) per microsecond of waiting.
    #[serde(default = "default_age_weight")]
    pub age_weight: f64,
    /// Shed requests still waiting when their TTFT budget expires.
    #[serde(default)]
    pub abandon_on_deadline: bool,
}

fn default_age_weight() -> f64 {
    1e-6
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            ordering: QueueOrdering::default(),
            priority_policy: PriorityPolicy::default(),
            age_weight: default_age_weight(),
            abandon_on_deadline: false,
        }
    }
}

/// `[slo]`: TTFT budgets per class, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloSection {
    #[serde(default = "default_critical_ttft")]
    pub critical_ttft_ms: f64,
    #[serde(default = "default_standard_ttft")]
    pub standard_ttft_ms: f64,
    #[serde(default = "default_batch_ttft")]
    pub batch_ttft_ms: f64,
    #[serde(default = "default_sheddable_ttft")]
    pub sheddable_ttft_ms: f64,
}

fn default_critical_ttft() -> f64 {
    50.0
}
fn default_standard_ttft() -> f64 {
    200.0
}
fn default_batch_ttft() -> f64 {
    5_000.0
}
fn default_sheddable_ttft() -> f64 {
    500.0
}

impl Default for SloSection {
    fn default() -> Self {
        Self {
            critical_ttft_ms: default_critical_ttft(),
            standard_ttft_ms: default_standard_ttft(),
            batch_ttft_ms: default_batch_ttft(),
            sheddable_ttft_ms: default_sheddable_ttft(),
        }
    }
}

impl SloSection {
    /// TTFT budget of `class` in microseconds.
    pub fn ttft_budget_us(&self, class: SloClass) -> u64 {
        let ms = match class {
            SloClass::Critical => self.critical_ttft_ms,
            SloClass::Standard => self.standard_ttft_ms,
            SloClass::Batch => self.batch_ttft_ms,
            SloClass::Sheddable => self.sheddable_ttft_ms,
        };
        (ms * 1000.0).round() as u64
    }
}

impl SimConfig {
    /// Default configuration for a cluster of `num_instances`.
    pub fn with_instances(num_instances: u32) -> Self {
        Self {
            simulation: SimulationSection::default(),
            cluster: ClusterSection::with_instances(num_instances),
            cost_model: CostModel::default(),
            scheduler: SchedulerSection::default(),
            admission: AdmissionConfig::default(),
            routing: RoutingConfig::default(),
            observability: ObservabilityConfig::default(),
            slo: SloSection::default(),
            workload: WorkloadConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        let config: SimConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate ranges and names. Also builds the routing policy once so that
    /// scorer strings and adaptive profiles are checked up front.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.cluster;
        if c.num_instances == 0 {
            return invalid("num_instances must be > 0");
        }
        if c.total_kv_blocks == 0 {
            return invalid("total_kv_blocks must be > 0");
        }
        if c.kv_block_size == 0 {
            return invalid("kv_block_size must be > 0");
        }
        if c.max_running_requests == 0 {
            return invalid("max_running_requests must be > 0");
        }
        if c.max_scheduled_tokens == 0 {
            return invalid("max_scheduled_tokens must be > 0");
        }

        let bad = self.cost_model.invalid_coefficients();
        if let Some((name, value)) = bad.first() {
            return Err(ConfigError::Validation(format!(
                "cost_model.{} must be finite and >= 0, got {}",
                name, value
            )));
        }

        let age = self.scheduler.age_weight;
        if !age.is_finite() || age < 0.0 {
            return Err(ConfigError::Validation(format!(
                "scheduler.age_weight must be finite and >= 0, got {}",
                age
            )));
        }

        AdmissionControl::from_config(&self.admission).map_err(ConfigError::Validation)?;
        let a = &self.admission;
        if a.policy == "token_bucket"
            && !(a.token_bucket_capacity > 0.0 && a.token_bucket_refill_rate >= 0.0)
        {
            return invalid("token bucket capacity must be > 0 and refill rate >= 0");
        }

        if !available_policies().contains(&self.routing.policy.as_str()) {
            return Err(PolicyError::UnknownPolicy(self.routing.policy.clone()).into());
        }
        policy_from_config(&self.routing, self.simulation.seed)?;

        let o = &self.observability;
        if o.refresh_interval_us > o.max_staleness_us {
            return Err(ConfigError::Validation(format!(
                "observability.refresh_interval_us ({}) exceeds max_staleness_us ({})",
                o.refresh_interval_us, o.max_staleness_us
            )));
        }

        for class in SloClass::ALL {
            if self.slo.ttft_budget_us(class) == 0 {
                return Err(ConfigError::Validation(format!(
                    "slo TTFT budget for {} must be > 0",
                    class
                )));
            }
        }

        self.workload.validate().map_err(ConfigError::Validation)?;
        Ok(())
    }
}

fn invalid(msg: &str) -> Result<(), ConfigError> {
    Err(ConfigError::Validation(msg.to_string()))
}
