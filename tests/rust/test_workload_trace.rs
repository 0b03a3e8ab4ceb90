/// Integration tests for workload sources and JSONL traces.
use infersim_core::prefix_cache::compute_block_hashes;
use infersim_core::request::{PromptTokens, Request, SloClass};
use infersim_core::workload::{
    build_workload, load_jsonl, parse_jsonl, save_jsonl, SyntheticWorkload, TraceError,
    WorkloadConfig,
};
use std::io::BufReader;

#[test]
fn test_parse_mixed_trace() {
    let data = r#"
# recorded 2026-03-02
{"id": 7, "arrival_us": 5000, "prompt": [1, 2, 3, 4], "output_len": 8, "slo_class": "sheddable"}
{"arrival_us": 1000, "prompt": 512, "output_len": 64, "session_id": "chat-1"}
{"id": 3, "arrival_us": 1000, "prompt": 16, "output_len": 1, "slo_class": "batch"}
"#;
    let requests = parse_jsonl(BufReader::new(data.as_bytes())).unwrap();
    assert_eq!(requests.len(), 3);

    // Sorted by arrival, ties by id.
    let order: Vec<(u64, u64)> = requests.iter().map(|r| (r.arrival_us, r.id)).collect();
    assert_eq!(order, vec![(1_000, 1), (1_000, 3), (5_000, 7)]);

    let counted = &requests[0];
    assert_eq!(counted.prompt, PromptTokens::Count(512));
    assert_eq!(counted.slo_class, SloClass::Standard);
    assert_eq!(counted.session_id.as_deref(), Some("chat-1"));

    let with_ids = &requests[2];
    assert_eq!(with_ids.prompt.ids(), Some(&[1u32, 2, 3, 4][..]));
    assert_eq!(with_ids.slo_class, SloClass::Sheddable);
}

#[test]
fn test_unknown_slo_class_is_a_parse_error() {
    let data = concat!(
        "{\"arrival_us\": 0, \"prompt\": 8, \"output_len\": 1}\n",
        "\n",
        "{\"arrival_us\": 1, \"prompt\": 8, \"output_len\": 1, \"slo_class\": \"gold\"}\n",
    );
    match parse_jsonl(BufReader::new(data.as_bytes())) {
        Err(TraceError::JsonParse { line, .. }) => assert_eq!(line, 3),
        other => panic!("expected a parse error, got {:?}", other.map(|r| r.len())),
    }
}

#[test]
fn test_write_and_read_trace() {
    let tmp_path = std::env::temp_dir().join("infersim_test_trace.jsonl");

    let requests = vec![
        Request {
            id: 0,
            arrival_us: 0,
            prompt: PromptTokens::Ids((0..40).collect()),
            output_len: 16,
            slo_class: SloClass::Critical,
            session_id: Some("s-0".to_string()),
        },
        Request {
            id: 1,
            arrival_us: 2_500,
            prompt: PromptTokens::Count(900),
            output_len: 128,
            slo_class: SloClass::Batch,
            session_id: None,
        },
    ];

    save_jsonl(&requests, &tmp_path).unwrap();
    let loaded = load_jsonl(&tmp_path).unwrap();
    assert_eq!(loaded, requests);

    std::fs::remove_file(&tmp_path).ok();
}

#[test]
fn test_synthetic_workload_is_seeded() {
    let config = WorkloadConfig {
        num_requests: 500,
        rate: 200.0,
        num_sessions: 10,
        ..WorkloadConfig::default()
    };
    let a: Vec<Request> = SyntheticWorkload::new(config.clone(), 1).collect();
    let b: Vec<Request> = SyntheticWorkload::new(config.clone(), 1).collect();
    let c: Vec<Request> = SyntheticWorkload::new(config, 2).collect();
    assert_eq!(a.len(), 500);
    assert_eq!(a, b);
    assert_ne!(a, c);

    assert!(a.windows(2).all(|w| w[0].arrival_us <= w[1].arrival_us));
    assert!(a.iter().enumerate().all(|(i, r)| r.id == i as u64));
    assert!(a.iter().all(|r| r.output_len >= 1 && r.input_len() >= 1));

    // 500 requests at 200/s span roughly 2.5 s.
    let span_s = a.last().unwrap().arrival_us as f64 / 1e6;
    assert!(span_s > 1.5 && span_s < 3.5, "span {} s", span_s);
}

#[test]
fn test_sessions_share_prefix_blocks() {
    let config = WorkloadConfig {
        num_requests: 200,
        num_sessions: 6,
        num_prefix_groups: 3,
        prefix_len: 64,
        prompt_tokens_mean: 200.0,
        prompt_tokens_std: 20.0,
        ..WorkloadConfig::default()
    };
    let requests: Vec<Request> = SyntheticWorkload::new(config, 5).collect();

    let prefix_blocks = |r: &Request| {
        let ids = r.prompt.ids().unwrap();
        compute_block_hashes(ids, 16)[..4].to_vec()
    };
    let by_session = |name: &str| -> Vec<&Request> {
        requests
            .iter()
            .filter(|r| r.session_id.as_deref() == Some(name))
            .collect()
    };

    // Sessions 0 and 3 map to the same group.
    let first = by_session("session-0");
    let same_group = by_session("session-3");
    let other_group = by_session("session-1");
    assert!(!first.is_empty() && !same_group.is_empty() && !other_group.is_empty());

    let expected = prefix_blocks(first[0]);
    assert!(first.iter().all(|r| prefix_blocks(r) == expected));
    assert!(same_group.iter().all(|r| prefix_blocks(r) == expected));
    assert!(other_group.iter().all(|r| prefix_blocks(r) != expected));
}

#[test]
fn test_token_counts_only_workload() {
    let config = WorkloadConfig {
        num_requests: 50,
        token_ids: false,
        prefix_fraction: 1.0,
        prefix_len: 128,
        prompt_tokens_mean: 64.0,
        prompt_tokens_std: 0.0,
        ..WorkloadConfig::default()
    };
    for r in SyntheticWorkload::new(config, 3) {
        assert!(r.prompt.ids().is_none());
        assert!(r.input_len() > 128, "prefix group members cover the prefix");
    }
}

#[test]
fn test_build_workload_sources() {
    let config = WorkloadConfig {
        num_requests: 25,
        ..WorkloadConfig::default()
    };
    assert_eq!(build_workload(&config, 9).unwrap().count(), 25);

    let missing = WorkloadConfig {
        source: "jsonl".to_string(),
        ..WorkloadConfig::default()
    };
    assert!(matches!(build_workload(&missing, 9), Err(TraceError::MissingPath)));

    let unknown = WorkloadConfig {
        source: "parquet".to_string(),
        ..WorkloadConfig::default()
    };
    match build_workload(&unknown, 9) {
        Err(TraceError::UnsupportedSource(name)) => assert_eq!(name, "parquet"),
        other => panic!("expected an unsupported source error, got {}", other.is_ok()),
    }

    let absent = WorkloadConfig {
        source: "jsonl".to_string(),
        path: Some(std::env::temp_dir().join("infersim_no_such_trace.jsonl")),
        ..WorkloadConfig::default()
    };
    assert!(matches!(build_workload(&absent, 9), Err(TraceError::Io(_))));
}

#[test]
fn test_jsonl_workload_feeds_a_run() {
    let tmp_path = std::env::temp_dir().join("infersim_test_run_trace.jsonl");
    let generated: Vec<Request> = SyntheticWorkload::new(
        WorkloadConfig {
            num_requests: 40,
            ..WorkloadConfig::default()
        },
        17,
    )
    .collect();
    save_jsonl(&generated, &tmp_path).unwrap();

    let mut config = infersim_core::SimConfig::with_instances(2);
    config.workload.source = "jsonl".to_string();
    config.workload.path = Some(tmp_path.clone());
    let metrics = infersim_core::run_from_config(config).unwrap();
    assert_eq!(metrics.total_requests, 40);

    std::fs::remove_file(&tmp_path).ok();
}
