//! Simulated inference instance.
//!
//! An [`Instance`] owns its wait queue, running batch and [`PrefixCacheIndex`].
//! Only the instance's [`Scheduler`](crate::scheduler::Scheduler) and the
//! engine's step-completion handling mutate it.

use crate::prefix_cache::PrefixCacheIndex;
use crate::request::ActiveRequest;
use infersim_routing::{InstanceId, RoutingSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A routed request still in flight to the instance's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingArrival {
    pub request_id: u64,
    pub lands_at_us: u64,
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub id: InstanceId,
    pub cache: PrefixCacheIndex,
    pub wait_queue: VecDeque<ActiveRequest>,
    pub running: Vec<ActiveRequest>,
    pub pending: Vec<PendingArrival>,
    /// A step is in progress.
    pub busy: bool,
    // --- Counters ---
    pub routed: u64,
    pub completed: u64,
    pub preemptions: u64,
    pub kv_allocation_failures: u64,
    pub capacity_sheds: u64,
    pub steps: u64,
    pub busy_time_us: u64,
}

impl Instance {
    pub fn new(id: InstanceId, total_kv_blocks: u64, kv_block_size: u32) -> Self {
        Self {
            id,
            cache: PrefixCacheIndex::new(total_kv_blocks, kv_block_size),
            wait_queue: VecDeque::new(),
            running: Vec::new(),
            pending: Vec::new(),
            busy: false,
            routed: 0,
            completed: 0,
            preemptions: 0,
            kv_allocation_failures: 0,
            capacity_sheds: 0,
            steps: 0,
            busy_time_us: 0,
        }
    }

    pub fn add_pending(&mut self, request_id: u64, lands_at_us: u64) {
        self.routed += 1;
        self.pending.push(PendingArrival {
            request_id,
            lands_at_us,
        });
    }

    /// Move a pending request into the wait queue (at the tail).
    pub fn enqueue(&mut self, mut request: ActiveRequest, now_us: u64) {
        let id = request.id();
        self.pending.retain(|p| p.request_id != id);
        request.enqueued_us = now_us;
        self.wait_queue.push_back(request);
    }

    /// Return a preempted request to the head of the wait queue.
    pub fn prepend_front(&mut self, request: ActiveRequest) {
        self.wait_queue.push_front(request);
    }

    /// Remove a request from the wait queue, if it is still waiting.
    pub fn remove_waiting(&mut self, request_id: u64) -> Option<ActiveRequest> {
        let pos = self.wait_queue.iter().position(|r| r.id() == request_id)?;
        self.wait_queue.remove(pos)
    }

    /// Release a request's KV blocks back to the cache.
    pub fn release_kv(&mut self, request: &mut ActiveRequest) {
        if request.kv_held {
            self.cache
                .release(&request.block_hashes, request.anonymous_blocks);
            request.kv_held = false;
            request.anonymous_blocks = 0;
        }
    }

    /// Apply the progress planned for the step that just ended at `end_us`.
    /// Finished requests release their blocks and are returned.
    pub fn finish_step(&mut self, end_us: u64, output_processing_us: u64) -> Vec<ActiveRequest> {
        for r in self.running.iter_mut() {
            let mut produced = false;
            if r.scheduled_prefill > 0 {
                r.prefilled += r.scheduled_prefill;
                produced = !r.is_prefilling();
            }
            if r.scheduled_decode {
                produced = true;
            }
            if produced {
                r.generated += 1;
                if r.first_token_us.is_none() {
                    r.first_token_us = Some(end_us + output_processing_us);
                }
            }
            r.scheduled_prefill = 0;
            r.scheduled_decode = false;
        }

        let mut finished = Vec::new();
        let mut i = 0;
        while i < self.running.len() {
            if self.running[i].is_complete() {
                let mut r = self.running.remove(i);
                self.release_kv(&mut r);
                finished.push(r);
            } else {
                i += 1;
            }
        }
        self.completed += finished.len() as u64;
        finished
    }

    pub fn has_work(&self) -> bool {
        !self.running.is_empty() || !self.wait_queue.is_empty()
    }

    pub fn queue_depth(&self) -> u32 {
        self.wait_queue.len() as u32
    }

    pub fn batch_size(&self) -> u32 {
        self.running.len() as u32
    }

    /// Summed remaining in-flight delay of pending requests.
    pub fn pending_transfer_latency_us(&self, now_us: u64) -> u64 {
        self.pending
            .iter()
            .map(|p| p.lands_at_us.saturating_sub(now_us))
            .sum()
    }

    /// A snapshot with every field read live. The snapshot provider overrides
    /// the periodic fields with its cached copy.
    pub fn snapshot(&self, now_us: u64) -> RoutingSnapshot {
        let mut snap = RoutingSnapshot::new(self.id);
        snap.queue_depth = self.queue_depth();
        snap.batch_size = self.batch_size();
        snap.pending_requests = self.pending.len() as u32;
        snap.pending_transfer_latency_us = self.pending_transfer_latency_us(now_us);
        self.fill_periodic(&mut snap, now_us);
        snap
    }

    /// Write the periodically refreshed fields into `snap`.
    pub fn fill_periodic(&self, snap: &mut RoutingSnapshot, now_us: u64) {
        snap.kv_utilization = self.cache.utilization();
        snap.free_kv_blocks = self.cache.free_blocks();
        snap.total_kv_blocks = self.cache.total_blocks();
        snap.cache_hit_rate = self.cache.hit_rate();
        snap.kv_thrashing_rate = self.cache.thrashing_rate();
        snap.periodic_as_of_us = now_us;
    }

    pub fn stats(&self) -> InstanceStats {
        InstanceStats {
            id: self.id,
            routed: self.routed,
            completed: self.completed,
            preemptions: self.preemptions,
            kv_allocation_failures: self.kv_allocation_failures,
            capacity_sheds: self.capacity_sheds,
            steps: self.steps,
            busy_time_us: self.busy_time_us,
            cache_hit_rate: self.cache.hit_rate(),
            evictions: self.cache.evictions(),
            thrashing_rate: self.cache.thrashing_rate(),
        }
    }
}

/// Per-instance counters for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStats {
    pub id: InstanceId,
    pub routed: u64,
    pub completed: u64,
    pub preemptions: u64,
    pub kv_allocation_failures: u64,
    pub capacity_sheds: u64,
    pub steps: u64,
    pub busy_time_us: u64,
    pub cache_hit_rate: f64,
    pub evictions: u64,
    pub thrashing_rate: f64,
}
