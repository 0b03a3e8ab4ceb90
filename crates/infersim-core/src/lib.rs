//! InferSim: discrete-event simulator for routing and scheduling on LLM
//! inference clusters.
//!
//! Requests from a synthetic or recorded workload pass through admission
//! control, are routed to one of N simulated instances by a policy from
//! `infersim-routing`, and are executed in batched steps whose duration
//! comes from a linear cost model. Each instance owns a block-level prefix
//! cache; routing sees instance state only through snapshots whose fields
//! may be stale.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐     ┌───────────┐     ┌──────────────┐
//! │ Workload │────▶│  Engine   │────▶│ MetricsSink  │
//! │ (JSONL / │     │ (Events)  │     │  (outcomes)  │
//! │ synthetic)     └─────┬─────┘     └──────────────┘
//! └──────────┘           │
//!                ┌───────┴───────┐     ┌──────────────┐
//!                │  Admission →  │◀────│  Snapshot    │
//!                │    Routing    │     │  Provider    │
//!                └───────┬───────┘     └──────────────┘
//!                        │
//!          ┌─────────────┼─────────────┐
//!          ▼             ▼             ▼
//!    ┌──────────┐  ┌──────────┐  ┌──────────┐
//!    │Instance 0│  │Instance 1│  │Instance N│
//!    │ Prefix $ │  │ Prefix $ │  │ Prefix $ │
//!    │Scheduler │  │Scheduler │  │Scheduler │
//!    └──────────┘  └──────────┘  └──────────┘
//! ```

pub mod admission;
pub mod clock;
pub mod config;
pub mod cost_model;
pub mod engine;
pub mod instance;
pub mod metrics;
pub mod prefix_cache;
pub mod request;
pub mod scheduler;
pub mod snapshot;
pub mod workload;

// Re-export key types for convenience.
pub use admission::{AdmissionConfig, AdmissionControl, AdmissionDecision};
pub use clock::SimClock;
pub use config::{ConfigError, SimConfig};
pub use cost_model::CostModel;
pub use engine::{SimEvent, SimulationEngine};
pub use instance::{Instance, InstanceStats};
pub use metrics::{
    MetricsCollector, MetricsSink, Outcome, RequestOutcome, ShedReason, SimulationMetrics,
};
pub use prefix_cache::{compute_block_hashes, CacheError, PrefixCacheIndex};
pub use request::{ActiveRequest, PromptTokens, Request, SloClass};
pub use scheduler::{PriorityPolicy, QueueOrdering, Scheduler};
pub use snapshot::{ObservabilityConfig, SnapshotProvider};
pub use workload::{
    build_workload, load_jsonl, save_jsonl, SyntheticWorkload, TraceError, Workload,
    WorkloadConfig,
};

use infersim_routing::{policy_by_name, policy_from_config, RoutingPolicy};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error("simulation replica panicked")]
    ReplicaPanicked,
}

impl From<infersim_routing::PolicyError> for SimError {
    fn from(e: infersim_routing::PolicyError) -> Self {
        SimError::Config(ConfigError::Policy(e))
    }
}

/// Run a complete simulation of `workload` routed by `policy`.
pub fn run_simulation(
    config: SimConfig,
    workload: Workload,
    policy: Box<dyn RoutingPolicy>,
) -> Result<SimulationMetrics, ConfigError> {
    let mut engine = SimulationEngine::new(config, policy)?;
    engine.set_workload(workload);
    Ok(engine.run())
}

/// Run the workload and policy described by `config` alone.
pub fn run_from_config(config: SimConfig) -> Result<SimulationMetrics, SimError> {
    let seed = config.simulation.seed;
    let workload = build_workload(&config.workload, seed)?;
    let policy = policy_from_config(&config.routing, seed)?;
    Ok(run_simulation(config, workload, policy)?)
}

/// Run each named policy on the same requests and config.
pub fn compare_policies(
    config: &SimConfig,
    requests: &[Request],
    policy_names: &[&str],
) -> Result<Vec<SimulationMetrics>, SimError> {
    policy_names
        .iter()
        .map(|name| {
            let policy = policy_by_name(name, &config.routing, config.simulation.seed)?;
            let workload: Workload = Box::new(requests.to_vec().into_iter());
            Ok(run_simulation(config.clone(), workload, policy)?)
        })
        .collect()
}

/// Run independent replicas of `config`, one per seed, in parallel. Each
/// replica regenerates its workload and policy from its own seed, so results
/// match sequential runs with the same seeds.
pub fn run_replicas(config: &SimConfig, seeds: &[u64]) -> Result<Vec<SimulationMetrics>, SimError> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = seeds
            .iter()
            .map(|&seed| {
                let mut replica = config.clone();
                replica.simulation.seed = seed;
                scope.spawn(move || run_from_config(replica))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| SimError::ReplicaPanicked).and_then(|r| r))
            .collect()
    })
}
