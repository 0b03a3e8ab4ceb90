/// Integration tests for the simulation engine.
use infersim_core::config::SimConfig;
use infersim_core::cost_model::CostModel;
use infersim_core::metrics::{Outcome, ShedReason};
use infersim_core::request::{PromptTokens, Request, SloClass};
use infersim_core::{SimulationEngine, SimulationMetrics};
use infersim_routing::*;

fn production_config() -> SimConfig {
    SimConfig::from_str(
        r#"
[simulation]
name = "integration-test"
seed = 42

[cluster]
num_instances = 1
total_kv_blocks = 2048
kv_block_size = 16

[cost_model]
beta0 = 6910.42
beta1 = 17.67
beta2 = 2.84
alpha0 = 1601.35
alpha1 = 3.51
alpha2 = 1805.54

[observability]
refresh_interval_us = 0
max_staleness_us = 0
"#,
    )
    .unwrap()
}

fn counted(id: u64, arrival_us: u64, prompt: u32, output_len: u32, class: SloClass) -> Request {
    Request {
        id,
        arrival_us,
        prompt: PromptTokens::Count(prompt),
        output_len,
        slo_class: class,
        session_id: None,
    }
}

fn run(config: SimConfig, requests: Vec<Request>) -> (SimulationMetrics, SimulationEngine) {
    let mut engine = SimulationEngine::new(config, Box::new(RoundRobin::new())).unwrap();
    engine.load_requests(requests);
    let metrics = engine.run();
    (metrics, engine)
}

#[test]
fn test_step_time_cost_scenarios() {
    let cost = production_config().cost_model;
    let full = cost.step_time(512, 128);
    assert!((full - 16_320.98).abs() < 1e-6, "got {}", full);

    let saving = cost.cache_saving(256);
    assert!((saving - 4_523.52).abs() < 1e-6);

    let with_hit = cost.step_time(256, 128);
    assert!((with_hit - 11_797.46).abs() < 1e-6);
    assert!((full - with_hit - saving).abs() < 1e-6);

    // Omitting beta3 means no quadratic term.
    assert_eq!(cost.beta3, 0.0);
    assert_eq!(cost, CostModel::default());
}

#[test]
fn test_single_request_latency_matches_cost_model() {
    let config = production_config();
    let cost = config.cost_model;
    let (metrics, engine) = run(config, vec![counted(0, 0, 512, 128, SloClass::Batch)]);

    let record = &engine.metrics.all_records()[0];
    let prefill_end = cost.queue_delay_us(512) + cost.step_time_us(512, 0);
    let expected_ttft = prefill_end + cost.output_processing_us();
    let expected_e2e = prefill_end + 127 * cost.step_time_us(0, 1) + cost.output_processing_us();
    assert_eq!(record.ttft_us, Some(expected_ttft));
    assert_eq!(record.e2e_us, Some(expected_e2e));
    assert_eq!(record.output_tokens, 128);
    assert_eq!(metrics.completed_requests, 1);
    assert_eq!(engine.instances[0].steps, 128);
}

#[test]
fn test_cached_prefix_shortens_prefill() {
    let config = production_config();
    let cost = config.cost_model;
    let shared: Vec<u32> = (0..256).collect();
    let prompt = |suffix_base: u32| {
        let mut t = shared.clone();
        t.extend(suffix_base..suffix_base + 256);
        PromptTokens::Ids(t)
    };
    let requests = vec![
        Request {
            id: 0,
            arrival_us: 0,
            prompt: prompt(10_000),
            output_len: 1,
            slo_class: SloClass::Standard,
            session_id: None,
        },
        Request {
            id: 1,
            arrival_us: 1_000_000,
            prompt: prompt(20_000),
            output_len: 1,
            slo_class: SloClass::Standard,
            session_id: None,
        },
    ];
    let (_, engine) = run(config, requests);
    let records = engine.metrics.all_records();
    let miss = cost.queue_delay_us(512) + cost.step_time_us(512, 0) + cost.output_processing_us();
    let hit = cost.queue_delay_us(512) + cost.step_time_us(256, 0) + cost.output_processing_us();
    assert_eq!(records[0].ttft_us, Some(miss));
    assert_eq!(records[1].ttft_us, Some(hit));
    assert!(engine.instances[0].stats().cache_hit_rate > 0.0);
}

#[test]
fn test_replay_is_deterministic() {
    let mut config = SimConfig::with_instances(4);
    config.workload.num_requests = 200;
    config.workload.rate = 100.0;
    config.workload.num_sessions = 16;
    config.routing.policy = "power_of_d".to_string();

    let records = |config: SimConfig| {
        let seed = config.simulation.seed;
        let policy = policy_from_config(&config.routing, seed).unwrap();
        let workload = infersim_core::build_workload(&config.workload, seed).unwrap();
        let mut engine = SimulationEngine::new(config, policy).unwrap();
        engine.set_workload(workload);
        engine.run();
        engine.metrics.all_records().to_vec()
    };
    let a = records(config.clone());
    let b = records(config.clone());
    assert_eq!(a.len(), 200);
    assert_eq!(a, b);

    config.simulation.seed = 7;
    assert_ne!(records(config), a, "a different seed changes the run");
}

#[test]
fn test_goodput_counts_late_completions_against_slo() {
    let mut config = production_config();
    config.cluster.max_running_requests = 1;
    // Budget fits one request's prefill but not a wait behind another.
    config.slo.standard_ttft_ms = 20.0;
    let requests = vec![
        counted(0, 0, 128, 4, SloClass::Standard),
        counted(1, 0, 128, 4, SloClass::Standard),
    ];
    let (metrics, _) = run(config, requests);
    assert_eq!(metrics.completed_requests, 2);
    assert_eq!(metrics.within_slo_requests, 1);
    assert!((metrics.goodput - 0.5).abs() < 1e-12);
    let standard = metrics.class(SloClass::Standard).unwrap();
    assert_eq!(standard.late, 1);
}

#[test]
fn test_slo_gated_admission_sheds_only_sheddable() {
    let mut config = production_config();
    config.cluster.max_running_requests = 2;
    config.admission.policy = "slo_gated".to_string();
    config.admission.queue_threshold = 5;

    let mut requests: Vec<Request> = (0..30)
        .map(|i| counted(i, 0, 128, 8, SloClass::Standard))
        .collect();
    for i in 0..20 {
        let class = if i % 2 == 0 {
            SloClass::Sheddable
        } else {
            SloClass::Critical
        };
        requests.push(counted(30 + i, 50_000, 128, 8, class));
    }
    let (metrics, engine) = run(config, requests);

    assert_eq!(metrics.shed(ShedReason::Admission), 10);
    for r in engine.metrics.all_records() {
        if r.outcome == (Outcome::Shed { reason: ShedReason::Admission }) {
            assert_eq!(r.slo_class, SloClass::Sheddable);
            assert_eq!(r.instance, None);
        }
    }
    assert_eq!(metrics.class(SloClass::Critical).unwrap().shed, 0);
}

#[test]
fn test_token_bucket_limits_input_tokens() {
    let mut config = production_config();
    config.admission.policy = "token_bucket".to_string();
    config.admission.token_bucket_capacity = 1_000.0;
    config.admission.token_bucket_refill_rate = 1.0;
    let requests = (0..20)
        .map(|i| counted(i, 0, 128, 2, SloClass::Standard))
        .collect();
    let (metrics, _) = run(config, requests);
    assert_eq!(metrics.total_requests, 20);
    assert_eq!(metrics.shed(ShedReason::Admission), 13);
    assert_eq!(metrics.completed_requests, 7);
}

#[test]
fn test_capacity_fault_is_distinct_from_admission() {
    let mut config = production_config();
    config.cluster.total_kv_blocks = 8;
    let requests = vec![
        counted(0, 0, 1_024, 4, SloClass::Standard),
        counted(1, 0, 64, 4, SloClass::Standard),
    ];
    let (metrics, engine) = run(config, requests);
    assert_eq!(metrics.shed(ShedReason::CapacityFault), 1);
    assert_eq!(metrics.shed(ShedReason::Admission), 0);
    assert_eq!(metrics.completed_requests, 1);
    // The small request lands first and runs; the large one is shed once the
    // instance is empty and it still does not fit.
    let shed = engine
        .metrics
        .all_records()
        .iter()
        .find(|r| !r.outcome.is_completed())
        .unwrap();
    assert_eq!(shed.request_id, 0);
    assert_eq!(shed.instance, Some(0));
    assert_eq!(engine.instances[0].capacity_sheds, 1);
}

/// Names an instance one past the end of the cluster.
struct OutOfRange;

impl RoutingPolicy for OutOfRange {
    fn route(
        &mut self,
        _request: &RequestInfo<'_>,
        snapshots: &[RoutingSnapshot],
        _clock: &dyn Clock,
    ) -> Option<RoutingDecision> {
        Some(RoutingDecision::to(snapshots.len() as InstanceId))
    }

    fn name(&self) -> &str {
        "out_of_range"
    }
}

#[test]
fn test_invalid_routing_decision_is_unroutable_not_admission() {
    let mut engine = SimulationEngine::new(production_config(), Box::new(OutOfRange)).unwrap();
    engine.load_requests(
        (0..4)
            .map(|i| counted(i, i * 1_000, 64, 2, SloClass::Standard))
            .collect(),
    );
    let metrics = engine.run();
    assert_eq!(metrics.shed(ShedReason::Unroutable), 4);
    assert_eq!(metrics.shed(ShedReason::Admission), 0);
    assert_eq!(metrics.completed_requests, 0);
    assert!(engine.metrics.all_records().iter().all(|r| r.instance.is_none()));
}

#[test]
fn test_memory_pressure_is_observable() {
    let mut config = production_config();
    config.cluster.total_kv_blocks = 40;
    let requests = (0..12)
        .map(|i| counted(i, i * 100, 100, 60, SloClass::Standard))
        .collect();
    let (metrics, engine) = run(config, requests);
    assert_eq!(metrics.completed_requests, 12);
    assert!(metrics.preemptions > 0);
    assert!(metrics.kv_allocation_failures >= metrics.preemptions);
    let preempted: u32 = engine.metrics.all_records().iter().map(|r| r.preemptions).sum();
    assert_eq!(preempted as u64, metrics.preemptions);
    assert_eq!(engine.instances[0].cache.used_blocks(), 0);
}

#[test]
fn test_warmup_excludes_earliest_requests() {
    let mut config = production_config();
    config.simulation.warmup_requests = 3;
    let requests = (0..10)
        .map(|i| counted(i, i * 100_000, 64, 2, SloClass::Standard))
        .collect();
    let (metrics, engine) = run(config, requests);
    assert_eq!(engine.metrics.len(), 10);
    assert_eq!(metrics.total_requests, 7);
    assert!(engine.metrics.records().iter().all(|r| r.request_id >= 3));
}

#[test]
fn test_invalid_config_aborts_before_run() {
    let mut config = production_config();
    config.cost_model.beta1 = -1.0;
    let err = SimulationEngine::new(config, Box::new(RoundRobin::new())).err().unwrap();
    assert!(err.to_string().contains("beta1"));

    let mut config = production_config();
    config.routing.scorers = "prefix-affinity:x".to_string();
    assert!(SimulationEngine::new(config, Box::new(RoundRobin::new())).is_err());
}

#[test]
fn test_run_simulation_with_every_ordering() {
    for ordering in ["fcfs", "priority_fcfs", "sjf", "reverse_priority"] {
        let mut config = SimConfig::with_instances(2);
        config.scheduler.ordering = ordering.parse().unwrap();
        config.scheduler.priority_policy = "slo_based".parse().unwrap();
        config.workload.num_requests = 60;
        let metrics = infersim_core::run_from_config(config).unwrap();
        assert_eq!(metrics.total_requests, 60, "ordering {}", ordering);
        assert!(metrics.goodput > 0.0, "ordering {}", ordering);
    }
}
