//! InferSim CLI. Compare routing and scheduling policies on a simulated
//! inference cluster.

use clap::{Parser, Subcommand};
use infersim_core::config::SimConfig;
use infersim_core::metrics::{self, RequestOutcome};
use infersim_core::workload::{self, Workload, WorkloadConfig};
use infersim_core::{Request, SimulationEngine};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "infersim",
    about = "Simulate routing and scheduling on an LLM inference cluster",
    version
)]
struct Cli {
    /// Emit logs as JSON lines instead of text.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one simulation.
    Run {
        /// Path to TOML configuration file.
        #[arg(short, long)]
        config: PathBuf,
        /// JSONL trace; overrides the configured workload.
        #[arg(short, long)]
        trace: Option<PathBuf>,
        /// Routing policy; overrides `routing.policy`.
        #[arg(short, long)]
        policy: Option<String>,
        /// Write the summary as JSON.
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Write one JSONL record per request outcome.
        #[arg(long)]
        outcomes: Option<PathBuf>,
    },
    /// Compare several routing policies on the same requests.
    Compare {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        trace: Option<PathBuf>,
        /// Comma-separated policy names; all built-in policies if omitted.
        #[arg(short = 'P', long, value_delimiter = ',')]
        policies: Vec<String>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run independent replicas of one configuration in parallel.
    Replicas {
        #[arg(short, long)]
        config: PathBuf,
        /// Comma-separated seeds, one replica each.
        #[arg(long, value_delimiter = ',', required = true)]
        seeds: Vec<u64>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate a synthetic JSONL trace.
    GenTrace {
        /// Take the `[workload]` section from this config.
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(long)]
        num_requests: Option<u64>,
        /// Mean arrival rate (requests/sec).
        #[arg(long)]
        rate: Option<f64>,
        #[arg(long, default_value = "42")]
        seed: u64,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// List available routing policies.
    ListPolicies,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match cli.command {
        Commands::Run {
            config,
            trace,
            policy,
            output,
            outcomes,
        } => {
            let mut sim_config = load_config(&config);
            if let Some(name) = policy {
                sim_config.routing.policy = name;
            }
            let seed = sim_config.simulation.seed;
            let workload = load_workload(&sim_config, trace.as_deref());
            let policy = infersim_routing::policy_from_config(&sim_config.routing, seed)
                .unwrap_or_else(|e| fail("Error building policy", e));

            let mut engine = SimulationEngine::new(sim_config, policy)
                .unwrap_or_else(|e| fail("Invalid configuration", e));
            engine.set_workload(workload);
            let result = engine.run();
            println!("{}", metrics::format_table(&result));

            if let Some(path) = outcomes {
                write_outcomes(engine.metrics.all_records(), &path);
            }
            if let Some(path) = output {
                write_json(&result, &path);
            }
        }
        Commands::Compare {
            config,
            trace,
            policies,
            output,
        } => {
            let sim_config = load_config(&config);
            let requests: Vec<Request> =
                load_workload(&sim_config, trace.as_deref()).collect();
            let names: Vec<&str> = if policies.is_empty() {
                infersim_routing::available_policies()
            } else {
                policies.iter().map(|s| s.as_str()).collect()
            };
            info!(requests = requests.len(), policies = names.len(), "comparing policies");

            let results = infersim_core::compare_policies(&sim_config, &requests, &names)
                .unwrap_or_else(|e| fail("Comparison failed", e));
            println!("{}", metrics::format_comparison_table(&results));
            for result in &results {
                println!("{}", metrics::format_table(result));
            }
            if let Some(path) = output {
                write_json(&results, &path);
            }
        }
        Commands::Replicas {
            config,
            seeds,
            output,
        } => {
            let sim_config = load_config(&config);
            let results = infersim_core::run_replicas(&sim_config, &seeds)
                .unwrap_or_else(|e| fail("Replica run failed", e));
            for (seed, result) in seeds.iter().zip(&results) {
                println!(
                    "seed {:>6}: goodput {:>5.1}%  TTFT p99 {:>8.1}ms  preemptions {}",
                    seed,
                    result.goodput * 100.0,
                    result.ttft_ms.p99,
                    result.preemptions
                );
            }
            if let Some(path) = output {
                write_json(&results, &path);
            }
        }
        Commands::GenTrace {
            config,
            num_requests,
            rate,
            seed,
            output,
        } => {
            let mut wl = match config {
                Some(path) => load_config(&path).workload,
                None => WorkloadConfig::default(),
            };
            wl.source = "synthetic".to_string();
            if let Some(n) = num_requests {
                wl.num_requests = n;
            }
            if let Some(r) = rate {
                wl.rate = r;
            }
            if let Err(e) = wl.validate() {
                fail("Invalid workload", e);
            }

            let requests: Vec<Request> = workload::SyntheticWorkload::new(wl, seed).collect();
            workload::save_jsonl(&requests, &output)
                .unwrap_or_else(|e| fail("Error writing trace", e));
            println!(
                "Generated {} requests to {}",
                requests.len(),
                output.display()
            );
        }
        Commands::ListPolicies => {
            println!("Available routing policies:");
            for name in infersim_routing::available_policies() {
                println!("  - {}", name);
            }
        }
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn fail(context: &str, err: impl std::fmt::Display) -> ! {
    eprintln!("{}: {}", context, err);
    std::process::exit(1);
}

fn load_config(path: &Path) -> SimConfig {
    SimConfig::from_file(path).unwrap_or_else(|e| fail("Error loading config", e))
}

fn load_workload(config: &SimConfig, trace: Option<&Path>) -> Workload {
    match trace {
        Some(path) => {
            let requests =
                workload::load_jsonl(path).unwrap_or_else(|e| fail("Error loading trace", e));
            Box::new(requests.into_iter())
        }
        None => workload::build_workload(&config.workload, config.simulation.seed)
            .unwrap_or_else(|e| fail("Error building workload", e)),
    }
}

fn write_json<T: Serialize + ?Sized>(value: &T, path: &Path) {
    let json =
        serde_json::to_string_pretty(value).unwrap_or_else(|e| fail("Error encoding results", e));
    std::fs::write(path, json).unwrap_or_else(|e| fail("Error writing output", e));
    println!("Results written to {}", path.display());
}

fn write_outcomes(records: &[RequestOutcome], path: &Path) {
    let mut lines = String::new();
    for record in records {
        let line =
            serde_json::to_string(record).unwrap_or_else(|e| fail("Error encoding outcome", e));
        lines.push_str(&line);
        lines.push('\n');
    }
    std::fs::write(path, lines).unwrap_or_else(|e| fail("Error writing outcomes", e));
    println!("{} outcomes written to {}", records.len(), path.display());
}
