/// Integration tests for routing policies inside the simulation.
use infersim_core::config::SimConfig;
use infersim_core::request::{PromptTokens, Request, SloClass};
use infersim_core::workload::{SyntheticWorkload, WorkloadConfig};
use infersim_core::{SimClock, SimulationEngine};
use infersim_routing::*;

fn cluster(num_instances: u32) -> SimConfig {
    let mut config = SimConfig::with_instances(num_instances);
    config.cluster.total_kv_blocks = 4096;
    config
}

fn uniform_requests(n: u64, gap_us: u64) -> Vec<Request> {
    (0..n)
        .map(|i| Request {
            id: i,
            arrival_us: i * gap_us,
            prompt: PromptTokens::Count(256),
            output_len: 32,
            slo_class: SloClass::Standard,
            session_id: None,
        })
        .collect()
}

fn shared_prefix_requests(n: u64, seed: u64) -> Vec<Request> {
    let config = WorkloadConfig {
        num_requests: n,
        rate: 400.0,
        num_prefix_groups: 4,
        prefix_len: 256,
        prefix_fraction: 0.9,
        ..WorkloadConfig::default()
    };
    SyntheticWorkload::new(config, seed).collect()
}

/// `(request id, instance)` for every request, sorted by id.
fn assignments(
    config: SimConfig,
    requests: Vec<Request>,
    policy: Box<dyn RoutingPolicy>,
) -> Vec<(u64, Option<InstanceId>)> {
    let mut engine = SimulationEngine::new(config, policy).unwrap();
    engine.load_requests(requests);
    engine.run();
    let mut out: Vec<_> = engine
        .metrics
        .all_records()
        .iter()
        .map(|r| (r.request_id, r.instance))
        .collect();
    out.sort();
    out
}

fn weighted(profile: &str) -> Box<dyn RoutingPolicy> {
    Box::new(WeightedScoring::new(WeightProfile::parse(profile).unwrap()))
}

#[test]
fn test_round_robin_assigns_k_per_instance_in_cyclic_order() {
    let n = 4;
    let k = 25;
    let requests = uniform_requests(n as u64 * k, 1_000);
    let result = assignments(cluster(n), requests, Box::new(RoundRobin::new()));
    for (id, instance) in &result {
        assert_eq!(*instance, Some((*id % n as u64) as InstanceId));
    }

    let mut engine = SimulationEngine::new(cluster(n), Box::new(RoundRobin::new())).unwrap();
    engine.load_requests(uniform_requests(n as u64 * k, 1_000));
    let metrics = engine.run();
    assert_eq!(metrics.per_instance_requests, vec![k; n as usize]);
    assert_eq!(metrics.load_cv, 0.0, "round robin has zero variance");
    assert_eq!(infersim_core::metrics::variance(&metrics.per_instance_requests), 0.0);
}

#[test]
fn test_affinity_self_corrects_without_cache_matches() {
    // Token-count prompts never match any cached block.
    let requests = uniform_requests(200, 1_000);
    let with_affinity = assignments(
        cluster(4),
        requests.clone(),
        weighted("prefix-affinity:3,queue-depth:2"),
    );
    let load_only = assignments(cluster(4), requests, weighted("queue-depth:2"));
    assert_eq!(with_affinity, load_only);
}

#[test]
fn test_least_loaded_ties_go_to_lowest_index() {
    let clock = SimClock::new();
    let hashes: Vec<u64> = Vec::new();
    let request = RequestInfo {
        id: 0,
        input_tokens: 128,
        output_tokens: 16,
        slo_class: SloClass::Standard,
        session_id: None,
        block_hashes: &hashes,
    };
    let mut policy = LeastLoaded::new();
    for load in [0u32, 3, 17] {
        let snapshots: Vec<RoutingSnapshot> = (0..5)
            .map(|id| {
                let mut s = RoutingSnapshot::new(id);
                s.queue_depth = load;
                s
            })
            .collect();
        let decision = policy.route(&request, &snapshots, &clock).unwrap();
        assert_eq!(decision.instance, 0, "equal load {} must pick instance 0", load);
    }

    // Idle cluster in a full run: every request sees all-zero load.
    let requests = uniform_requests(5, 1_000_000);
    let result = assignments(cluster(3), requests, Box::new(LeastLoaded::new()));
    assert!(result.iter().all(|(_, i)| *i == Some(0)));
}

#[test]
fn test_load_scorer_keeps_balance_bounded() {
    // Arrivals faster than service so load is never zero everywhere.
    let mut engine = SimulationEngine::new(cluster(4), weighted("queue-depth:1")).unwrap();
    engine.load_requests(uniform_requests(200, 2_000));
    let metrics = engine.run();
    let var = infersim_core::metrics::variance(&metrics.per_instance_requests);
    assert!(var >= 0.0);
    assert!(
        metrics.jains_fairness_index > 0.95,
        "load scorer should spread requests: {:?}",
        metrics.per_instance_requests
    );
}

#[test]
fn test_immediate_only_profile_ignores_refresh_interval() {
    let profile = "prefix-affinity:3,queue-depth:2";
    assert!(WeightProfile::parse(profile).unwrap().uses_only_immediate());

    let requests = shared_prefix_requests(300, 11);
    let runs: Vec<_> = [0u64, 1_000, 50_000]
        .into_iter()
        .map(|interval| {
            let mut config = cluster(4);
            config.observability.refresh_interval_us = interval;
            config.observability.max_staleness_us = interval.max(5_000);
            assignments(config, requests.clone(), weighted(profile))
        })
        .collect();
    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[0], runs[2]);
}

/// Two prefixes in the pattern A A B B A A B B ..., one request per second so
/// the cluster is idle at every decision.
fn paired_prefix_requests(n: u64) -> Vec<Request> {
    (0..n)
        .map(|i| {
            let base = if (i / 2) % 2 == 0 { 0 } else { 10_000 };
            let mut tokens: Vec<u32> = (base..base + 256).collect();
            let suffix = 100_000 + i as u32 * 1_000;
            tokens.extend(suffix..suffix + 64);
            Request {
                id: i,
                arrival_us: i * 1_000_000,
                prompt: PromptTokens::Ids(tokens),
                output_len: 4,
                slo_class: SloClass::Standard,
                session_id: None,
            }
        })
        .collect()
}

#[test]
fn test_prefix_affinity_concentrates_shared_prefixes() {
    let requests = paired_prefix_requests(40);
    let mut affinity =
        SimulationEngine::new(cluster(2), weighted("prefix-affinity:3,queue-depth:2")).unwrap();
    affinity.load_requests(requests.clone());
    let with_affinity = affinity.run();

    // Round robin sends each prefix to both instances.
    let mut rr = SimulationEngine::new(cluster(2), Box::new(RoundRobin::new())).unwrap();
    rr.load_requests(requests);
    let round_robin = rr.run();

    assert!(
        with_affinity.cache_hit_rate > round_robin.cache_hit_rate,
        "affinity {} vs round robin {}",
        with_affinity.cache_hit_rate,
        round_robin.cache_hit_rate
    );
}

#[test]
fn test_every_policy_completes_a_run() {
    let requests = shared_prefix_requests(80, 3);
    let config = cluster(4);
    for name in available_policies() {
        let policy = policy_by_name(name, &config.routing, 42).unwrap();
        let mut engine = SimulationEngine::new(config.clone(), policy).unwrap();
        engine.load_requests(requests.clone());
        let metrics = engine.run();
        assert_eq!(metrics.policy, name);
        assert_eq!(metrics.total_requests, 80, "policy {}", name);
        assert!(metrics.completed_requests > 0, "policy {}", name);
    }
}

#[test]
fn test_adaptive_policy_reports_its_state() {
    let config = cluster(4);
    let policy = policy_by_name("adaptive_weighted_scoring", &config.routing, 42).unwrap();
    let mut engine = SimulationEngine::new(config, policy).unwrap();
    engine.load_requests(shared_prefix_requests(50, 9));
    let metrics = engine.run();
    assert!(metrics.custom_metrics.contains_key("affinity_scale"));
    assert!(metrics.custom_metrics.contains_key("load_scale"));
}
