//! Analytic step-time model.
//!
//! A closed-form linear approximation of instance compute, in microseconds:
//!
//! - `step_time = beta0 + beta1 * miss_tokens + beta2 * decode_tokens + beta3 * decode_tokens^2`
//! - `queue_delay = alpha0 + alpha1 * input_len`
//! - `output_processing = alpha2`
//! - `cache_saving = beta1 * matched_tokens`
//!
//! Prefill is linear in cache-miss tokens (compute bound) while each decode
//! token costs a small constant (memory bound). Every function is pure and
//! nothing here divides by a coefficient.

use serde::{Deserialize, Serialize};

/// Cost model coefficients (`[cost_model]`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// Fixed per-step overhead (μs).
    #[serde(default = "default_beta0")]
    pub beta0: f64,
    /// Per prefill (cache-miss) token (μs).
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    /// Per decode token (μs).
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    /// Quadratic decode term. Zero unless explicitly configured.
    #[serde(default)]
    pub beta3: f64,
    /// Fixed routing-to-queue delay (μs).
    #[serde(default = "default_alpha0")]
    pub alpha0: f64,
    /// Per input token queueing delay (μs).
    #[serde(default = "default_alpha1")]
    pub alpha1: f64,
    /// Output processing after the first token is produced (μs).
    #[serde(default = "default_alpha2")]
    pub alpha2: f64,
}

fn default_beta0() -> f64 {
    6910.42
}
fn default_beta1() -> f64 {
    17.67
}
fn default_beta2() -> f64 {
    2.84
}
fn default_alpha0() -> f64 {
    1601.35
}
fn default_alpha1() -> f64 {
    3.51
}
fn default_alpha2() -> f64 {
    1805.54
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            beta0: default_beta0(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            beta3: 0.0,
            alpha0: default_alpha0(),
            alpha1: default_alpha1(),
            alpha2: default_alpha2(),
        }
    }
}

impl CostModel {
    /// Duration of one step that prefills `cache_miss_tokens` and decodes
    /// `decode_tokens`, in fractional microseconds.
    pub fn step_time(&self, cache_miss_tokens: u32, decode_tokens: u32) -> f64 {
        let miss = cache_miss_tokens as f64;
        let decode = decode_tokens as f64;
        self.beta0 + self.beta1 * miss + self.beta2 * decode + self.beta3 * decode * decode
    }

    /// [`step_time`](Self::step_time) rounded to whole microseconds, never zero.
    pub fn step_time_us(&self, cache_miss_tokens: u32, decode_tokens: u32) -> u64 {
        to_us(self.step_time(cache_miss_tokens, decode_tokens)).max(1)
    }

    /// Delay between routing and arrival in the instance's wait queue.
    pub fn queue_delay(&self, input_len: u32) -> f64 {
        self.alpha0 + self.alpha1 * input_len as f64
    }

    pub fn queue_delay_us(&self, input_len: u32) -> u64 {
        to_us(self.queue_delay(input_len))
    }

    /// Per-request output processing time, added to the first token.
    pub fn output_processing(&self) -> f64 {
        self.alpha2
    }

    pub fn output_processing_us(&self) -> u64 {
        to_us(self.alpha2)
    }

    /// Prefill time avoided by `matched_tokens` resident tokens.
    pub fn cache_saving(&self, matched_tokens: u32) -> f64 {
        self.beta1 * matched_tokens as f64
    }

    /// Sequential service time of one request: a full prefill step followed by
    /// one single-token decode step per remaining output token.
    pub fn service_time(&self, prompt_len: f64, output_len: f64) -> f64 {
        let prefill = self.beta0 + self.beta1 * prompt_len;
        let decode_steps = (output_len - 1.0).max(0.0);
        let decode_step = self.beta0 + self.beta2 + self.beta3;
        prefill + decode_steps * decode_step
    }

    /// Requests per second one instance sustains serving requests one at a
    /// time. Returns `f64::INFINITY` for a zero service time.
    pub fn effective_capacity(&self, avg_prompt_len: f64, avg_output_len: f64) -> f64 {
        let service_us = self.service_time(avg_prompt_len, avg_output_len);
        if service_us <= 0.0 {
            return f64::INFINITY;
        }
        1_000_000.0 / service_us
    }

    /// Names and values of coefficients that are negative or not finite.
    pub fn invalid_coefficients(&self) -> Vec<(&'static str, f64)> {
        [
            ("beta0", self.beta0),
            ("beta1", self.beta1),
            ("beta2", self.beta2),
            ("beta3", self.beta3),
            ("alpha0", self.alpha0),
            ("alpha1", self.alpha1),
            ("alpha2", self.alpha2),
        ]
        .into_iter()
        .filter(|(_, v)| !v.is_finite() || *v < 0.0)
        .collect()
    }
}

fn to_us(v: f64) -> u64 {
    if v.is_finite() && v > 0.0 {
        v.round() as u64
    } else {
        0
    }
}
