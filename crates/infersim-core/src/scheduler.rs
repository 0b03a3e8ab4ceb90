//! Per-instance step formation.
//!
//! Each step the [`Scheduler`]:
//!
//! 1. recomputes priorities and orders the wait queue,
//! 2. continues running requests: a chunk of remaining prefill, or one decode
//!    token (growing the KV reservation at block boundaries),
//! 3. admits waiting requests from the head of the queue while the running
//!    limit, the token budget and the KV cache allow.
//!
//! A KV capacity fault triggers exactly one preemption of the lowest-priority
//! running request before the fault is final for that step. A preempted
//! request releases its blocks, forgets its KV progress, and goes back to the
//! head of the wait queue. No new request is admitted in a step that
//! preempted.

use crate::cost_model::CostModel;
use crate::instance::Instance;
use crate::request::{ActiveRequest, SloClass};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Wait-queue ordering policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrdering {
    /// Queue order: arrivals at the tail, preempted requests at the head.
    #[default]
    Fcfs,
    /// Descending priority, then arrival order.
    PriorityFcfs,
    /// Preempted requests first, then ascending estimated service time, then
    /// arrival order.
    Sjf,
    /// Preempted requests first, then ascending priority. A pathological
    /// baseline.
    ReversePriority,
}

impl QueueOrdering {
    pub const ALL: [QueueOrdering; 4] = [
        QueueOrdering::Fcfs,
        QueueOrdering::PriorityFcfs,
        QueueOrdering::Sjf,
        QueueOrdering::ReversePriority,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueOrdering::Fcfs => "fcfs",
            QueueOrdering::PriorityFcfs => "priority_fcfs",
            QueueOrdering::Sjf => "sjf",
            QueueOrdering::ReversePriority => "reverse_priority",
        }
    }

    /// Reorder `queue` in place. Sorting is stable.
    pub fn sort(&self, queue: &mut VecDeque<ActiveRequest>, cost: &CostModel) {
        match self {
            QueueOrdering::Fcfs => {}
            QueueOrdering::PriorityFcfs => queue
                .make_contiguous()
                .sort_by(|a, b| cmp_f64(b.priority, a.priority).then_with(|| by_arrival(a, b))),
            QueueOrdering::Sjf => queue.make_contiguous().sort_by(|a, b| {
                preempted_first(a, b)
                    .then_with(|| cmp_f64(estimated_service(a, cost), estimated_service(b, cost)))
                    .then_with(|| by_arrival(a, b))
            }),
            QueueOrdering::ReversePriority => queue.make_contiguous().sort_by(|a, b| {
                preempted_first(a, b)
                    .then_with(|| cmp_f64(a.priority, b.priority))
                    .then_with(|| by_arrival(a, b))
            }),
        }
    }
}

impl fmt::Display for QueueOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueOrdering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|o| o.as_str() == s)
            .ok_or_else(|| format!("unknown queue ordering: {}", s))
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// A preempted request stays ahead of requests that have not run yet.
fn preempted_first(a: &ActiveRequest, b: &ActiveRequest) -> Ordering {
    (b.preemptions > 0).cmp(&(a.preemptions > 0))
}

fn by_arrival(a: &ActiveRequest, b: &ActiveRequest) -> Ordering {
    a.request
        .arrival_us
        .cmp(&b.request.arrival_us)
        .then_with(|| a.id().cmp(&b.id()))
}

/// Remaining prefill plus remaining decode, priced by the cost model.
fn estimated_service(r: &ActiveRequest, cost: &CostModel) -> f64 {
    let remaining_output = r.request.target_output().saturating_sub(r.generated);
    cost.service_time(r.remaining_prefill() as f64, remaining_output as f64)
}

/// Base priority per SLO class.
pub fn base_priority(class: SloClass) -> f64 {
    match class {
        SloClass::Critical => 4.0,
        SloClass::Standard => 3.0,
        SloClass::Batch => 2.0,
        SloClass::Sheddable => 1.0,
    }
}

/// How a waiting or running request's priority is computed each step.
///
/// A non-zero routing hint replaces the class base (or the constant zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriorityPolicy {
    #[default]
    Constant,
    /// `base[class] + age_weight * wait_us`
    SloBased,
    /// `base[class] - age_weight * wait_us`; newer requests win.
    InvertedSlo,
}

impl PriorityPolicy {
    pub const ALL: [PriorityPolicy; 3] = [
        PriorityPolicy::Constant,
        PriorityPolicy::SloBased,
        PriorityPolicy::InvertedSlo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityPolicy::Constant => "constant",
            PriorityPolicy::SloBased => "slo_based",
            PriorityPolicy::InvertedSlo => "inverted_slo",
        }
    }

    pub fn compute(&self, request: &ActiveRequest, age_weight: f64, now_us: u64) -> f64 {
        let hinted = (request.priority_hint != 0.0).then_some(request.priority_hint);
        let wait = now_us.saturating_sub(request.request.arrival_us) as f64;
        match self {
            PriorityPolicy::Constant => hinted.unwrap_or(0.0),
            PriorityPolicy::SloBased => {
                hinted.unwrap_or_else(|| base_priority(request.request.slo_class))
                    + age_weight * wait
            }
            PriorityPolicy::InvertedSlo => {
                hinted.unwrap_or_else(|| base_priority(request.request.slo_class))
                    - age_weight * wait
            }
        }
    }
}

impl FromStr for PriorityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown priority policy: {}", s))
    }
}

/// Result of forming one step.
#[derive(Debug, Default)]
pub struct StepBatch {
    /// Prefill tokens computed this step (cache misses only).
    pub prefill_tokens: u32,
    /// Requests decoding one token this step.
    pub decode_tokens: u32,
    /// Ids of requests admitted from the wait queue.
    pub admitted: Vec<u64>,
    /// Ids of requests preempted back to the wait queue.
    pub preempted: Vec<u64>,
    /// Requests dropped because the cache could not hold them.
    pub capacity_shed: Vec<ActiveRequest>,
}

impl StepBatch {
    pub fn is_empty(&self) -> bool {
        self.prefill_tokens == 0 && self.decode_tokens == 0
    }
}

/// Step-formation settings shared by every instance.
#[derive(Debug, Clone)]
pub struct Scheduler {
    pub ordering: QueueOrdering,
    pub priority: PriorityPolicy,
    pub age_weight: f64,
    pub max_running_requests: u32,
    pub max_scheduled_tokens: u32,
    cost: CostModel,
    step_seq: u64,
}

impl Scheduler {
    pub fn new(
        ordering: QueueOrdering,
        priority: PriorityPolicy,
        age_weight: f64,
        max_running_requests: u32,
        max_scheduled_tokens: u32,
        cost: CostModel,
    ) -> Self {
        Self {
            ordering,
            priority,
            age_weight,
            max_running_requests,
            max_scheduled_tokens,
            cost,
            step_seq: 0,
        }
    }

    /// Form the next step on `inst`.
    pub fn schedule(&mut self, inst: &mut Instance, now_us: u64) -> StepBatch {
        self.step_seq += 1;
        let mut batch = StepBatch::default();
        let mut budget = self.max_scheduled_tokens;

        for r in inst.running.iter_mut().chain(inst.wait_queue.iter_mut()) {
            r.priority = self.priority.compute(r, self.age_weight, now_us);
            r.scheduled_prefill = 0;
            r.scheduled_decode = false;
        }
        self.ordering.sort(&mut inst.wait_queue, &self.cost);

        self.continue_running(inst, &mut budget, &mut batch);
        if batch.preempted.is_empty() {
            self.admit_waiting(inst, &mut budget, &mut batch);
        }

        for r in &inst.running {
            batch.prefill_tokens += r.scheduled_prefill;
            if r.scheduled_decode {
                batch.decode_tokens += 1;
            }
        }
        if !batch.is_empty() {
            debug!(
                instance = inst.id,
                prefill = batch.prefill_tokens,
                decode = batch.decode_tokens,
                admitted = batch.admitted.len(),
                preempted = batch.preempted.len(),
                "step formed"
            );
        }
        batch
    }

    fn continue_running(&self, inst: &mut Instance, budget: &mut u32, batch: &mut StepBatch) {
        let mut i = 0;
        while i < inst.running.len() && *budget > 0 {
            if inst.running[i].is_prefilling() {
                let chunk = inst.running[i].remaining_prefill().min(*budget);
                inst.running[i].scheduled_prefill = chunk;
                *budget -= chunk;
                i += 1;
                continue;
            }

            let required = inst
                .cache
                .blocks_for_tokens(inst.running[i].context_len());
            let held = inst.running[i].held_blocks();
            if required > held {
                let need = required - held;
                if inst.cache.grow(need).is_err() {
                    inst.kv_allocation_failures += 1;
                    let me = inst.running[i].id();
                    let v = victim_index(&inst.running);
                    let victim = inst.running[v].id();
                    *budget += preempt_at(inst, v, batch);
                    if victim == me {
                        continue;
                    }
                    if v < i {
                        i -= 1;
                    }
                    if inst.cache.grow(need).is_err() {
                        let mut shed = inst.running.remove(i);
                        warn!(
                            instance = inst.id,
                            request = shed.id(),
                            "KV capacity fault persists after preemption, shedding"
                        );
                        inst.release_kv(&mut shed);
                        inst.capacity_sheds += 1;
                        batch.capacity_shed.push(shed);
                        continue;
                    }
                }
                inst.running[i].anonymous_blocks += need;
            }
            inst.running[i].scheduled_decode = true;
            *budget -= 1;
            i += 1;
        }
    }

    fn admit_waiting(&mut self, inst: &mut Instance, budget: &mut u32, batch: &mut StepBatch) {
        while (inst.running.len() as u32) < self.max_running_requests && *budget > 0 {
            let Some(head) = inst.wait_queue.pop_front() else {
                break;
            };
            let blocks = inst.cache.blocks_for_tokens(head.prefill_len);

            let update = match inst.cache.update_cache(&head.block_hashes, blocks) {
                Ok(update) => update,
                Err(fault) => {
                    inst.kv_allocation_failures += 1;
                    if inst.running.is_empty() {
                        warn!(
                            instance = inst.id,
                            request = head.id(),
                            error = %fault,
                            "request does not fit in an empty instance, shedding"
                        );
                        inst.capacity_sheds += 1;
                        batch.capacity_shed.push(head);
                        continue;
                    }
                    let v = victim_index(&inst.running);
                    if head.priority <= inst.running[v].priority {
                        inst.wait_queue.push_front(head);
                        break;
                    }
                    *budget += preempt_at(inst, v, batch);
                    match inst.cache.update_cache(&head.block_hashes, blocks) {
                        Ok(update) => {
                            self.start(inst, head, blocks, update.matched_blocks, budget, batch);
                        }
                        Err(_) => inst.wait_queue.push_front(head),
                    }
                    break;
                }
            };
            self.start(inst, head, blocks, update.matched_blocks, budget, batch);
        }
    }

    /// Move an admitted request into the running batch and plan its first chunk.
    fn start(
        &self,
        inst: &mut Instance,
        mut r: ActiveRequest,
        blocks: u64,
        matched_blocks: u32,
        budget: &mut u32,
        batch: &mut StepBatch,
    ) {
        r.kv_held = true;
        r.anonymous_blocks = blocks.saturating_sub(r.block_hashes.len() as u64);
        let matched_tokens = matched_blocks.saturating_mul(inst.cache.block_size());
        // At least one token is always computed so the step produces a token.
        r.prefilled = matched_tokens.min(r.prefill_len.saturating_sub(1));
        r.admitted_seq = self.step_seq;

        if r.is_prefilling() {
            let chunk = r.remaining_prefill().min(*budget);
            r.scheduled_prefill = chunk;
            *budget -= chunk;
        } else {
            r.scheduled_decode = true;
            *budget -= 1;
        }
        batch.admitted.push(r.id());
        inst.running.push(r);
    }
}

/// Lowest-priority running request; ties go to the most recently admitted,
/// then to the later position in the batch.
pub fn victim_index(running: &[ActiveRequest]) -> usize {
    let mut best = 0;
    for (i, r) in running.iter().enumerate().skip(1) {
        let b = &running[best];
        let lower = r.priority < b.priority
            || (r.priority == b.priority && r.admitted_seq >= b.admitted_seq);
        if lower {
            best = i;
        }
    }
    best
}

/// Preempt `running[idx]`: release its blocks and return it to the head of
/// the wait queue. Returns the token budget it had been planned to use.
fn preempt_at(inst: &mut Instance, idx: usize, batch: &mut StepBatch) -> u32 {
    let mut victim = inst.running.remove(idx);
    let refund = victim.scheduled_prefill + u32::from(victim.scheduled_decode);
    inst.release_kv(&mut victim);
    victim.reset_for_recompute();
    victim.preemptions += 1;
    inst.preemptions += 1;
    warn!(
        instance = inst.id,
        request = victim.id(),
        priority = victim.priority,
        "preempting running request"
    );
    batch.preempted.push(victim.id());
    inst.prepend_front(victim);
    refund
}
