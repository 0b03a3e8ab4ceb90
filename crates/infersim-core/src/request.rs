//! Request model.
//!
//! A [`Request`] is what the workload produces: arrival time, prompt content
//! (or just its length), output length, SLO class and optional session id.
//! An [`ActiveRequest`] wraps it with the per-instance execution state the
//! scheduler mutates while it waits, runs, or is preempted.

use infersim_routing::InstanceId;
pub use infersim_routing::SloClass;
use serde::{Deserialize, Serialize};

/// Prompt content. Token ids enable content-addressed prefix caching;
/// a bare count runs the request without any cache matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptTokens {
    Ids(Vec<u32>),
    Count(u32),
}

impl PromptTokens {
    pub fn len(&self) -> u32 {
        match self {
            PromptTokens::Ids(ids) => ids.len() as u32,
            PromptTokens::Count(n) => *n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Option<&[u32]> {
        match self {
            PromptTokens::Ids(ids) => Some(ids),
            PromptTokens::Count(_) => None,
        }
    }
}

/// A single inference request flowing through the simulated cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    /// Arrival time in simulation microseconds.
    pub arrival_us: u64,
    pub prompt: PromptTokens,
    /// Number of tokens to generate (at least one is always produced).
    pub output_len: u32,
    #[serde(default)]
    pub slo_class: SloClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Request {
    pub fn input_len(&self) -> u32 {
        self.prompt.len()
    }

    /// Output length with the one-token floor applied.
    pub fn target_output(&self) -> u32 {
        self.output_len.max(1)
    }
}

/// Execution state of a request on one instance.
#[derive(Debug, Clone)]
pub struct ActiveRequest {
    pub request: Request,
    pub instance: InstanceId,
    /// Chained hashes of the prompt's full blocks, computed once on arrival.
    pub block_hashes: Vec<u64>,
    /// Current scheduling priority; higher runs first.
    pub priority: f64,
    /// Non-zero priority seeded by the router.
    pub priority_hint: f64,
    pub enqueued_us: u64,
    /// Tokens the current admission must prefill: the prompt, plus any output
    /// generated before a preemption discarded its KV state.
    pub prefill_len: u32,
    /// Tokens of `prefill_len` already computed (cache hits included).
    pub prefilled: u32,
    pub generated: u32,
    pub first_token_us: Option<u64>,
    pub preemptions: u32,
    /// Whether `block_hashes` are pinned in the instance's cache.
    pub kv_held: bool,
    /// Unhashed blocks reserved in the instance's cache.
    pub anonymous_blocks: u64,
    /// Step sequence number of the latest admission into the running batch.
    pub admitted_seq: u64,
    // --- Current step plan ---
    pub scheduled_prefill: u32,
    pub scheduled_decode: bool,
}

impl ActiveRequest {
    pub fn new(
        request: Request,
        instance: InstanceId,
        block_hashes: Vec<u64>,
        priority_hint: f64,
    ) -> Self {
        let prefill_len = request.input_len();
        Self {
            request,
            instance,
            block_hashes,
            priority: priority_hint,
            priority_hint,
            enqueued_us: 0,
            prefill_len,
            prefilled: 0,
            generated: 0,
            first_token_us: None,
            preemptions: 0,
            kv_held: false,
            anonymous_blocks: 0,
            admitted_seq: 0,
            scheduled_prefill: 0,
            scheduled_decode: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.request.id
    }

    pub fn remaining_prefill(&self) -> u32 {
        self.prefill_len.saturating_sub(self.prefilled)
    }

    /// Tokens whose KV state the request holds or will hold after this step.
    pub fn context_len(&self) -> u32 {
        self.request.input_len() + self.generated
    }

    pub fn is_prefilling(&self) -> bool {
        self.remaining_prefill() > 0
    }

    pub fn is_complete(&self) -> bool {
        self.generated >= self.request.target_output()
    }

    /// Blocks currently reserved for this request.
    pub fn held_blocks(&self) -> u64 {
        if self.kv_held {
            self.block_hashes.len() as u64 + self.anonymous_blocks
        } else {
            0
        }
    }

    /// Time to first token, once the first token has been produced.
    pub fn ttft_us(&self) -> Option<u64> {
        self.first_token_us
            .map(|t| t.saturating_sub(self.request.arrival_us))
    }

    /// Drop all execution progress that lived in KV memory.
    pub fn reset_for_recompute(&mut self) {
        self.prefill_len = self.request.input_len() + self.generated;
        self.prefilled = 0;
        self.kv_held = false;
        self.anonymous_blocks = 0;
        self.scheduled_prefill = 0;
        self.scheduled_decode = false;
    }
}
