//! Workload sources.
//!
//! - **Synthetic**: a lazy, seeded generator with Poisson arrivals, shared
//!   system-prompt groups, an SLO-class mix and optional sessions.
//! - **JSONL**: one [`Request`] per line. `id` may be omitted, in which case
//!   the line order assigns it.
//!
//! Either source is consumed by the engine as a plain
//! `Iterator<Item = Request>` in arrival order. A generator is not
//! restartable: every replica builds a fresh one from its own seed.

use crate::request::{PromptTokens, Request, SloClass};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Failed to read trace file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse JSON at line {line}: {source}")]
    JsonParse {
        line: usize,
        source: serde_json::Error,
    },
    #[error("Failed to write trace record: {0}")]
    JsonWrite(serde_json::Error),
    #[error("Unsupported workload source: {0}")]
    UnsupportedSource(String),
    #[error("Missing trace path for the jsonl workload source")]
    MissingPath,
}

/// Relative weights of the SLO classes in a synthetic workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloMix {
    #[serde(default)]
    pub critical: f64,
    #[serde(default)]
    pub standard: f64,
    #[serde(default)]
    pub batch: f64,
    #[serde(default)]
    pub sheddable: f64,
}

impl Default for SloMix {
    fn default() -> Self {
        Self {
            critical: 0.1,
            standard: 0.6,
            batch: 0.1,
            sheddable: 0.2,
        }
    }
}

impl SloMix {
    fn weights(&self) -> [(SloClass, f64); 4] {
        [
            (SloClass::Critical, self.critical),
            (SloClass::Standard, self.standard),
            (SloClass::Batch, self.batch),
            (SloClass::Sheddable, self.sheddable),
        ]
    }

    fn total(&self) -> f64 {
        self.weights().iter().map(|(_, w)| w).sum()
    }

    fn sample(&self, rng: &mut ChaCha8Rng) -> SloClass {
        let total = self.total();
        if total <= 0.0 {
            return SloClass::Standard;
        }
        let mut x = rng.gen::<f64>() * total;
        for (class, w) in self.weights() {
            if x < w {
                return class;
            }
            x -= w;
        }
        SloClass::Standard
    }
}

/// `[workload]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    /// `synthetic` or `jsonl`.
    #[serde(default = "default_source")]
    pub source: String,
    /// Trace file for the `jsonl` source.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_num_requests")]
    pub num_requests: u64,
    /// Mean arrival rate, requests per second.
    #[serde(default = "default_rate")]
    pub rate: f64,
    #[serde(default = "default_prompt_mean")]
    pub prompt_tokens_mean: f64,
    #[serde(default = "default_prompt_std")]
    pub prompt_tokens_std: f64,
    #[serde(default = "default_output_mean")]
    pub output_tokens_mean: f64,
    #[serde(default = "default_output_std")]
    pub output_tokens_std: f64,
    /// Distinct shared prefixes (system prompts).
    #[serde(default = "default_prefix_groups")]
    pub num_prefix_groups: u32,
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u32,
    /// Fraction of requests that start with a shared prefix.
    #[serde(default = "default_prefix_fraction")]
    pub prefix_fraction: f64,
    /// Number of sessions; 0 disables session ids.
    #[serde(default)]
    pub num_sessions: u32,
    #[serde(default)]
    pub slo_mix: SloMix,
    /// Emit token ids; `false` emits bare token counts (no cache matching).
    #[serde(default = "default_token_ids")]
    pub token_ids: bool,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: u32,
}

fn default_source() -> String {
    "synthetic".to_string()
}
fn default_num_requests() -> u64 {
    1_000
}
fn default_rate() -> f64 {
    50.0
}
fn default_prompt_mean() -> f64 {
    512.0
}
fn default_prompt_std() -> f64 {
    128.0
}
fn default_output_mean() -> f64 {
    128.0
}
fn default_output_std() -> f64 {
    32.0
}
fn default_prefix_groups() -> u32 {
    8
}
fn default_prefix_len() -> u32 {
    256
}
fn default_prefix_fraction() -> f64 {
    0.7
}
fn default_token_ids() -> bool {
    true
}
fn default_vocab_size() -> u32 {
    32_000
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            path: None,
            num_requests: default_num_requests(),
            rate: default_rate(),
            prompt_tokens_mean: default_prompt_mean(),
            prompt_tokens_std: default_prompt_std(),
            output_tokens_mean: default_output_mean(),
            output_tokens_std: default_output_std(),
            num_prefix_groups: default_prefix_groups(),
            prefix_len: default_prefix_len(),
            prefix_fraction: default_prefix_fraction(),
            num_sessions: 0,
            slo_mix: SloMix::default(),
            token_ids: default_token_ids(),
            vocab_size: default_vocab_size(),
        }
    }
}

impl WorkloadConfig {
    pub fn validate(&self) -> Result<(), String> {
        match self.source.as_str() {
            "synthetic" => {}
            "jsonl" => {
                if self.path.is_none() {
                    return Err("workload.path is required for the jsonl source".to_string());
                }
            }
            other => return Err(format!("unknown workload source: {}", other)),
        }
        if !(self.rate.is_finite() && self.rate > 0.0) {
            return Err(format!("workload.rate must be > 0, got {}", self.rate));
        }
        if !(0.0..=1.0).contains(&self.prefix_fraction) {
            return Err(format!(
                "workload.prefix_fraction must be in [0, 1], got {}",
                self.prefix_fraction
            ));
        }
        let mix = self.slo_mix.weights();
        if mix.iter().any(|(_, w)| !w.is_finite() || *w < 0.0) || self.slo_mix.total() <= 0.0 {
            return Err(
                "workload.slo_mix weights must be non-negative with a positive sum".to_string(),
            );
        }
        if self.vocab_size == 0 {
            return Err("workload.vocab_size must be > 0".to_string());
        }
        Ok(())
    }
}

/// Lazy synthetic request stream.
#[derive(Debug, Clone)]
pub struct SyntheticWorkload {
    config: WorkloadConfig,
    rng: ChaCha8Rng,
    prefixes: Vec<Vec<u32>>,
    next_id: u64,
    clock_us: f64,
}

impl SyntheticWorkload {
    pub fn new(config: WorkloadConfig, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let vocab = config.vocab_size.max(1);
        let prefixes = (0..config.num_prefix_groups)
            .map(|_| {
                (0..config.prefix_len)
                    .map(|_| rng.gen_range(0..vocab))
                    .collect()
            })
            .collect();
        Self {
            config,
            rng,
            prefixes,
            next_id: 0,
            clock_us: 0.0,
        }
    }

    /// Uniform sample in `mean ± std`, at least 1.
    fn sample_len(&mut self, mean: f64, std: f64) -> u32 {
        let v = mean + (self.rng.gen::<f64>() * 2.0 - 1.0) * std;
        v.max(1.0).round() as u32
    }

    /// Exponential inter-arrival gap for a Poisson process.
    fn sample_gap_us(&mut self) -> f64 {
        let u: f64 = self.rng.gen();
        -(1.0 - u).ln() / self.config.rate * 1e6
    }
}

impl Iterator for SyntheticWorkload {
    type Item = Request;

    fn next(&mut self) -> Option<Request> {
        if self.next_id >= self.config.num_requests {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.clock_us += self.sample_gap_us();

        let cfg = &self.config;
        let (prompt_mean, prompt_std) = (cfg.prompt_tokens_mean, cfg.prompt_tokens_std);
        let (output_mean, output_std) = (cfg.output_tokens_mean, cfg.output_tokens_std);
        let num_sessions = cfg.num_sessions;
        let groups = self.prefixes.len();
        let prefix_fraction = cfg.prefix_fraction;

        let mut prompt_len = self.sample_len(prompt_mean, prompt_std);
        let output_len = self.sample_len(output_mean, output_std);
        let slo_class = self.config.slo_mix.sample(&mut self.rng);

        let session = (num_sessions > 0).then(|| self.rng.gen_range(0..num_sessions));
        let group = match session {
            Some(s) if groups > 0 => Some(s as usize % groups),
            _ if groups > 0 && self.rng.gen::<f64>() < prefix_fraction => {
                Some(self.rng.gen_range(0..groups))
            }
            _ => None,
        };

        let prompt = if self.config.token_ids {
            let mut tokens = Vec::with_capacity(prompt_len as usize);
            if let Some(g) = group {
                tokens.extend_from_slice(&self.prefixes[g]);
            }
            let vocab = self.config.vocab_size.max(1);
            let suffix = (prompt_len as usize).saturating_sub(tokens.len()).max(1);
            tokens.extend((0..suffix).map(|_| self.rng.gen_range(0..vocab)));
            PromptTokens::Ids(tokens)
        } else {
            if group.is_some() {
                prompt_len = prompt_len.max(self.config.prefix_len + 1);
            }
            PromptTokens::Count(prompt_len)
        };

        Some(Request {
            id,
            arrival_us: self.clock_us.round() as u64,
            prompt,
            output_len,
            slo_class,
            session_id: session.map(|s| format!("session-{}", s)),
        })
    }
}

/// A JSONL trace line. `id` defaults to the record's position.
#[derive(Debug, Clone, Deserialize)]
struct TraceRecord {
    id: Option<u64>,
    arrival_us: u64,
    prompt: PromptTokens,
    output_len: u32,
    #[serde(default)]
    slo_class: SloClass,
    #[serde(default)]
    session_id: Option<String>,
}

/// Parse JSONL from any reader. Blank lines and `#` comments are skipped;
/// the result is sorted by arrival time.
pub fn parse_jsonl<R: Read>(reader: BufReader<R>) -> Result<Vec<Request>, TraceError> {
    let mut requests = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let record: TraceRecord =
            serde_json::from_str(trimmed).map_err(|e| TraceError::JsonParse {
                line: line_num + 1,
                source: e,
            })?;
        let id = record.id.unwrap_or(requests.len() as u64);
        requests.push(Request {
            id,
            arrival_us: record.arrival_us,
            prompt: record.prompt,
            output_len: record.output_len,
            slo_class: record.slo_class,
            session_id: record.session_id,
        });
    }

    requests.sort_by_key(|r| (r.arrival_us, r.id));
    Ok(requests)
}

pub fn load_jsonl(path: &Path) -> Result<Vec<Request>, TraceError> {
    let file = std::fs::File::open(path)?;
    parse_jsonl(BufReader::new(file))
}

/// Write requests as JSONL, one object per line.
pub fn write_jsonl<W: Write>(requests: &[Request], mut writer: W) -> Result<(), TraceError> {
    for req in requests {
        serde_json::to_writer(&mut writer, req).map_err(TraceError::JsonWrite)?;
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn save_jsonl(requests: &[Request], path: &Path) -> Result<(), TraceError> {
    let file = std::fs::File::create(path)?;
    write_jsonl(requests, std::io::BufWriter::new(file))
}

pub type Workload = Box<dyn Iterator<Item = Request> + Send>;

/// Build the request stream described by `config`.
pub fn build_workload(config: &WorkloadConfig, seed: u64) -> Result<Workload, TraceError> {
    match config.source.as_str() {
        "synthetic" => Ok(Box::new(SyntheticWorkload::new(config.clone(), seed))),
        "jsonl" => {
            let path = config.path.as_deref().ok_or(TraceError::MissingPath)?;
            Ok(Box::new(load_jsonl(path)?.into_iter()))
        }
        other => Err(TraceError::UnsupportedSource(other.to_string())),
    }
}
