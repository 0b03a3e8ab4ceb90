//! Discrete-event simulation engine.
//!
//! The engine keeps a min-heap of [`TimedEvent`]s ordered by
//! `(time, event class, sequence)`. Events at the same instant run in a fixed
//! order: arrivals (at the router or at an instance queue) first, then step
//! completions and deadline expiries, then snapshot refreshes, and FIFO
//! within a class. Replaying a seed therefore replays every decision.
//!
//! Request lifecycle:
//!
//! ```text
//! Arrival ──admission──▶ route ──queue_delay──▶ Enqueue ──▶ Waiting
//!    │ reject                                               │  ▲
//!    ▼                                                      ▼  │ preempt
//!  Shed(admission)                         StepComplete ◀─ Running
//!                                                │
//!                                     Completed (within SLO | late)
//! ```

use crate::admission::{AdmissionControl, AdmissionDecision};
use crate::clock::SimClock;
use crate::config::{ConfigError, SimConfig};
use crate::cost_model::CostModel;
use crate::instance::Instance;
use crate::metrics::{
    MetricsCollector, MetricsSink, Outcome, RequestOutcome, ShedReason, SimulationMetrics,
};
use crate::prefix_cache::compute_block_hashes;
use crate::request::{ActiveRequest, Request};
use crate::scheduler::Scheduler;
use crate::snapshot::SnapshotProvider;
use crate::workload::Workload;
use infersim_routing::{InstanceId, RequestInfo, RoutingFeedback, RoutingPolicy};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tracing::{debug, info, warn};

/// Events in the discrete-event simulation.
#[derive(Debug, Clone)]
pub enum SimEvent {
    /// A request reaches the router.
    Arrival(Request),
    /// A routed request lands in its instance's wait queue.
    Enqueue(ActiveRequest),
    /// The step running on an instance finishes.
    StepComplete { instance: InstanceId },
    /// A request's TTFT budget runs out.
    DeadlineExpiry {
        instance: InstanceId,
        request_id: u64,
    },
    /// Recopy the Periodic snapshot fields.
    SnapshotRefresh,
}

impl SimEvent {
    /// Processing order among events at the same instant.
    pub fn class(&self) -> u8 {
        match self {
            SimEvent::Arrival(_) | SimEvent::Enqueue(_) => 0,
            SimEvent::StepComplete { .. } | SimEvent::DeadlineExpiry { .. } => 1,
            SimEvent::SnapshotRefresh => 2,
        }
    }
}

/// A timestamped event for the priority queue.
#[derive(Debug, Clone)]
pub struct TimedEvent {
    pub time_us: u64,
    pub sequence: u64,
    pub event: SimEvent,
}

impl TimedEvent {
    fn key(&self) -> (u64, u8, u64) {
        (self.time_us, self.event.class(), self.sequence)
    }
}

impl PartialEq for TimedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for TimedEvent {}

impl PartialOrd for TimedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want min-heap
        other.key().cmp(&self.key())
    }
}

/// The main simulation engine.
pub struct SimulationEngine {
    pub clock: SimClock,
    event_queue: BinaryHeap<TimedEvent>,
    sequence: u64,
    pub instances: Vec<Instance>,
    pub metrics: MetricsCollector,
    sinks: Vec<Box<dyn MetricsSink + Send>>,
    policy: Box<dyn RoutingPolicy>,
    admission: AdmissionControl,
    scheduler: Scheduler,
    snapshots: SnapshotProvider,
    cost: CostModel,
    workload: Option<Workload>,
    pub events_processed: u64,
    config: SimConfig,
}

impl SimulationEngine {
    /// Build an engine for `config` that routes with `policy`.
    pub fn new(config: SimConfig, policy: Box<dyn RoutingPolicy>) -> Result<Self, ConfigError> {
        config.validate()?;
        let admission =
            AdmissionControl::from_config(&config.admission).map_err(ConfigError::Validation)?;
        let cluster = &config.cluster;
        let instances: Vec<Instance> = (0..cluster.num_instances)
            .map(|id| Instance::new(id, cluster.total_kv_blocks, cluster.kv_block_size))
            .collect();
        let scheduler = Scheduler::new(
            config.scheduler.ordering,
            config.scheduler.priority_policy,
            config.scheduler.age_weight,
            cluster.max_running_requests,
            cluster.max_scheduled_tokens,
            config.cost_model,
        );
        let snapshots =
            SnapshotProvider::new(config.observability.refresh_interval_us, &instances);

        Ok(Self {
            clock: SimClock::new(),
            event_queue: BinaryHeap::new(),
            sequence: 0,
            instances,
            metrics: MetricsCollector::new(config.simulation.warmup_requests),
            sinks: Vec::new(),
            policy,
            admission,
            scheduler,
            snapshots,
            cost: config.cost_model,
            workload: None,
            events_processed: 0,
            config,
        })
    }

    /// Stream outcomes to an additional sink as they are produced.
    pub fn add_sink(&mut self, sink: Box<dyn MetricsSink + Send>) {
        self.sinks.push(sink);
    }

    /// Pull arrivals lazily from `workload`, which must yield requests in
    /// arrival order.
    pub fn set_workload(&mut self, workload: Workload) {
        self.workload = Some(workload);
    }

    /// Use a fixed list of requests as the workload.
    pub fn load_requests(&mut self, mut requests: Vec<Request>) {
        requests.sort_by_key(|r| (r.arrival_us, r.id));
        self.set_workload(Box::new(requests.into_iter()));
    }

    pub fn schedule_event(&mut self, time_us: u64, event: SimEvent) {
        self.event_queue.push(TimedEvent {
            time_us,
            sequence: self.sequence,
            event,
        });
        self.sequence += 1;
    }

    pub fn pending_events(&self) -> usize {
        self.event_queue.len()
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }

    /// Run until the event queue drains or the horizon passes.
    pub fn run(&mut self) -> SimulationMetrics {
        self.pull_next_arrival();
        if let Some(t) = self.snapshots.next_refresh_us(self.clock.now_us()) {
            self.schedule_event(t, SimEvent::SnapshotRefresh);
        }
        let horizon = self.config.simulation.horizon_us;

        // Events past the horizon stay queued so in-flight work is counted.
        while let Some(next) = self.event_queue.peek() {
            if horizon.is_some_and(|h| next.time_us > h) {
                break;
            }
            let Some(timed) = self.event_queue.pop() else {
                break;
            };
            self.clock.advance_to_us(timed.time_us);
            self.process_event(timed.event);
            self.events_processed += 1;
        }

        let unfinished = self.unfinished_requests();
        if unfinished > 0 {
            warn!(unfinished, "horizon reached with requests still in flight");
        }
        let stats: Vec<_> = self.instances.iter().map(|i| i.stats()).collect();
        let metrics = self.metrics.aggregate(
            self.policy.name(),
            self.clock.now_us(),
            &stats,
            unfinished,
            self.policy.custom_metrics(),
        );
        info!(
            policy = %metrics.policy,
            requests = metrics.total_requests,
            goodput = metrics.goodput,
            preemptions = metrics.preemptions,
            events = self.events_processed,
            "simulation finished"
        );
        metrics
    }

    /// Requests that were routed but had not finished when the run stopped.
    pub fn unfinished_requests(&self) -> u64 {
        let in_instances: usize = self
            .instances
            .iter()
            .map(|i| i.wait_queue.len() + i.running.len())
            .sum();
        let in_transit = self
            .event_queue
            .iter()
            .filter(|e| matches!(e.event, SimEvent::Enqueue(_)))
            .count();
        (in_instances + in_transit) as u64
    }

    fn process_event(&mut self, event: SimEvent) {
        match event {
            SimEvent::Arrival(request) => self.handle_arrival(request),
            SimEvent::Enqueue(request) => self.handle_enqueue(request),
            SimEvent::StepComplete { instance } => self.handle_step_complete(instance),
            SimEvent::DeadlineExpiry {
                instance,
                request_id,
            } => self.handle_deadline(instance, request_id),
            SimEvent::SnapshotRefresh => self.handle_refresh(),
        }
    }

    fn pull_next_arrival(&mut self) {
        let Some(request) = self.workload.as_mut().and_then(|w| w.next()) else {
            return;
        };
        let at = request.arrival_us.max(self.clock.now_us());
        self.schedule_event(at, SimEvent::Arrival(request));
    }

    /// Admission, then routing. Admitted requests become pending on their
    /// instance until they land after the queueing delay.
    fn handle_arrival(&mut self, request: Request) {
        self.pull_next_arrival();
        let now = self.clock.now_us();

        let hashes = match request.prompt.ids() {
            Some(ids) => compute_block_hashes(ids, self.config.cluster.kv_block_size),
            None => Vec::new(),
        };
        let snapshots = self.snapshots.snapshots(&self.instances, now, &hashes);

        if let AdmissionDecision::Reject(reason) = self.admission.admit(&request, &snapshots, now)
        {
            debug!(request = request.id, class = %request.slo_class, reason, "admission rejected");
            self.policy.observe(&RoutingFeedback::Rejected {
                slo_class: request.slo_class,
            });
            self.record_shed(&request, None, 0, ShedReason::Admission);
            return;
        }

        let info = RequestInfo {
            id: request.id,
            input_tokens: request.input_len(),
            output_tokens: request.target_output(),
            slo_class: request.slo_class,
            session_id: request.session_id.as_deref(),
            block_hashes: &hashes,
        };
        let decision = self.policy.route(&info, &snapshots, &self.clock);
        let Some(decision) = decision.filter(|d| (d.instance as usize) < self.instances.len())
        else {
            warn!(request = request.id, policy = self.policy.name(), "no valid routing decision");
            self.record_shed(&request, None, 0, ShedReason::Unroutable);
            return;
        };
        let instance = decision.instance;
        debug!(
            request = request.id,
            instance,
            prefix_match = snapshots[instance as usize].prefix_match_blocks,
            priority_hint = decision.priority_hint,
            "routed"
        );
        self.policy.observe(&RoutingFeedback::Routed {
            instance,
            slo_class: request.slo_class,
        });

        let lands_at = now + self.cost.queue_delay_us(request.input_len());
        self.instances[instance as usize].add_pending(request.id, lands_at);
        let active = ActiveRequest::new(request, instance, hashes, decision.priority_hint);
        self.schedule_event(lands_at, SimEvent::Enqueue(active));
    }

    fn handle_enqueue(&mut self, request: ActiveRequest) {
        let now = self.clock.now_us();
        let idx = request.instance as usize;
        let id = request.id();
        let deadline =
            request.request.arrival_us + self.config.slo.ttft_budget_us(request.request.slo_class);
        self.instances[idx].enqueue(request, now);

        if self.config.scheduler.abandon_on_deadline {
            self.schedule_event(
                deadline.max(now),
                SimEvent::DeadlineExpiry {
                    instance: idx as InstanceId,
                    request_id: id,
                },
            );
        }
        if !self.instances[idx].busy {
            self.start_step(idx);
        }
    }

    /// Form and launch the next step on instance `idx`, or mark it idle.
    fn start_step(&mut self, idx: usize) {
        let now = self.clock.now_us();
        loop {
            let batch = self.scheduler.schedule(&mut self.instances[idx], now);
            let instance = self.instances[idx].id;
            for _ in &batch.preempted {
                self.policy.observe(&RoutingFeedback::Preempted { instance });
            }
            let progressed = !batch.preempted.is_empty() || !batch.capacity_shed.is_empty();
            for shed in &batch.capacity_shed {
                self.record_shed(
                    &shed.request,
                    Some(instance),
                    shed.preemptions,
                    ShedReason::CapacityFault,
                );
            }

            if !batch.is_empty() {
                let duration = self
                    .cost
                    .step_time_us(batch.prefill_tokens, batch.decode_tokens);
                let inst = &mut self.instances[idx];
                inst.busy = true;
                inst.steps += 1;
                inst.busy_time_us += duration;
                self.schedule_event(now + duration, SimEvent::StepComplete { instance });
                return;
            }
            // A step that only preempted or shed leaves the queue to re-form.
            if !(progressed && self.instances[idx].has_work()) {
                self.instances[idx].busy = false;
                return;
            }
        }
    }

    fn handle_step_complete(&mut self, instance: InstanceId) {
        let now = self.clock.now_us();
        let idx = instance as usize;
        let output_processing = self.cost.output_processing_us();
        let finished = self.instances[idx].finish_step(now, output_processing);

        for r in finished {
            let ttft = r.ttft_us().unwrap_or(0);
            let within_slo = ttft <= self.config.slo.ttft_budget_us(r.request.slo_class);
            self.policy.observe(&RoutingFeedback::Completed {
                instance,
                slo_class: r.request.slo_class,
                ttft_us: ttft,
                within_slo,
            });
            let outcome = if within_slo {
                Outcome::CompletedWithinSlo
            } else {
                Outcome::CompletedLate
            };
            let e2e = (now + output_processing).saturating_sub(r.request.arrival_us);
            self.record(RequestOutcome {
                request_id: r.id(),
                slo_class: r.request.slo_class,
                instance: Some(instance),
                arrival_us: r.request.arrival_us,
                ttft_us: Some(ttft),
                e2e_us: Some(e2e),
                input_tokens: r.request.input_len(),
                output_tokens: r.generated,
                preemptions: r.preemptions,
                outcome,
            });
        }

        self.start_step(idx);
    }

    /// Shed a request still waiting for its first token.
    fn handle_deadline(&mut self, instance: InstanceId, request_id: u64) {
        let inst = &mut self.instances[instance as usize];
        let expired = inst
            .wait_queue
            .iter()
            .any(|r| r.id() == request_id && r.first_token_us.is_none());
        if !expired {
            return;
        }
        if let Some(r) = inst.remove_waiting(request_id) {
            debug!(request = request_id, instance, "TTFT deadline expired while waiting");
            self.record_shed(
                &r.request,
                Some(instance),
                r.preemptions,
                ShedReason::DeadlineExpired,
            );
        }
    }

    fn handle_refresh(&mut self) {
        let now = self.clock.now_us();
        self.snapshots.refresh(&self.instances, now);
        // Refreshes only continue while something else is scheduled.
        if !self.event_queue.is_empty() {
            if let Some(t) = self.snapshots.next_refresh_us(now) {
                self.schedule_event(t, SimEvent::SnapshotRefresh);
            }
        }
    }

    fn record_shed(
        &mut self,
        request: &Request,
        instance: Option<InstanceId>,
        preemptions: u32,
        reason: ShedReason,
    ) {
        self.record(RequestOutcome {
            request_id: request.id,
            slo_class: request.slo_class,
            instance,
            arrival_us: request.arrival_us,
            ttft_us: None,
            e2e_us: None,
            input_tokens: request.input_len(),
            output_tokens: 0,
            preemptions,
            outcome: Outcome::Shed { reason },
        });
    }

    fn record(&mut self, outcome: RequestOutcome) {
        for sink in self.sinks.iter_mut() {
            sink.record(outcome.clone());
        }
        self.metrics.record(outcome);
    }
}
