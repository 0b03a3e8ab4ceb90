/// Integration tests for step formation, preemption and recompute on a
/// single instance.
use infersim_core::cost_model::CostModel;
use infersim_core::instance::Instance;
use infersim_core::prefix_cache::compute_block_hashes;
use infersim_core::request::{ActiveRequest, PromptTokens, Request, SloClass};
use infersim_core::scheduler::{PriorityPolicy, QueueOrdering, Scheduler};

fn request(
    id: u64,
    arrival_us: u64,
    prompt: PromptTokens,
    output_len: u32,
    class: SloClass,
) -> Request {
    Request {
        id,
        arrival_us,
        prompt,
        output_len,
        slo_class: class,
        session_id: None,
    }
}

fn counted(
    id: u64,
    arrival_us: u64,
    prompt: u32,
    output_len: u32,
    class: SloClass,
) -> ActiveRequest {
    ActiveRequest::new(
        request(id, arrival_us, PromptTokens::Count(prompt), output_len, class),
        0,
        Vec::new(),
        0.0,
    )
}

fn with_ids(id: u64, arrival_us: u64, tokens: Vec<u32>, output_len: u32) -> ActiveRequest {
    let hashes = compute_block_hashes(&tokens, 16);
    ActiveRequest::new(
        request(id, arrival_us, PromptTokens::Ids(tokens), output_len, SloClass::Standard),
        0,
        hashes,
        0.0,
    )
}

fn slo_scheduler(ordering: QueueOrdering) -> Scheduler {
    Scheduler::new(
        ordering,
        PriorityPolicy::SloBased,
        0.0,
        256,
        2048,
        CostModel::default(),
    )
}

fn assert_accounting(inst: &Instance) {
    let cache = &inst.cache;
    assert_eq!(
        cache.free_blocks() + cache.pinned_blocks() + cache.anonymous_blocks(),
        cache.total_blocks()
    );
    assert!(inst.wait_queue.iter().all(|r| !r.kv_held), "waiting requests hold no KV");
}

#[test]
fn test_higher_priority_arrival_preempts_on_admission() {
    let mut sched = slo_scheduler(QueueOrdering::PriorityFcfs);
    let mut inst = Instance::new(0, 4, 16);
    inst.enqueue(counted(1, 0, 48, 4, SloClass::Batch), 0);
    let batch = sched.schedule(&mut inst, 0);
    assert_eq!(batch.admitted, vec![1]);
    inst.finish_step(1_000, 0);

    inst.enqueue(counted(2, 500, 32, 4, SloClass::Critical), 1_000);
    let batch = sched.schedule(&mut inst, 1_000);
    assert_eq!(batch.preempted, vec![1]);
    assert_eq!(batch.admitted, vec![2]);
    assert_eq!(inst.running.len(), 1);
    assert_eq!(inst.wait_queue[0].id(), 1);
    assert_eq!(inst.wait_queue[0].preemptions, 1);
    assert_eq!(inst.preemptions, 1);
    assert_accounting(&inst);
}

#[test]
fn test_preempted_request_stays_ahead_of_later_arrivals() {
    for ordering in QueueOrdering::ALL {
        let mut sched = slo_scheduler(ordering);
        let mut inst = Instance::new(0, 4, 16);
        inst.enqueue(counted(1, 0, 48, 4, SloClass::Batch), 0);
        sched.schedule(&mut inst, 0);
        inst.finish_step(1_000, 0);
        inst.enqueue(counted(2, 500, 32, 8, SloClass::Critical), 1_000);
        sched.schedule(&mut inst, 1_000);

        // Same class as the victim, arrived later, and shorter.
        inst.enqueue(counted(3, 900, 16, 4, SloClass::Batch), 1_500);
        sched.schedule(&mut inst, 2_000);
        let order: Vec<u64> = inst.wait_queue.iter().map(|r| r.id()).collect();
        assert_eq!(order.first(), Some(&1), "{}: queue {:?}", ordering, order);
    }
}

#[test]
fn test_recompute_after_preemption_includes_generated_tokens() {
    let mut sched = slo_scheduler(QueueOrdering::Fcfs);
    let mut inst = Instance::new(0, 4, 16);
    inst.enqueue(counted(1, 0, 32, 40, SloClass::Batch), 0);
    sched.schedule(&mut inst, 0);
    inst.finish_step(100, 0);
    for t in 1..5 {
        sched.schedule(&mut inst, t * 100);
        inst.finish_step(t * 100 + 50, 0);
    }
    assert_eq!(inst.running[0].generated, 5);

    inst.enqueue(counted(2, 10, 48, 4, SloClass::Critical), 600);
    let batch = sched.schedule(&mut inst, 600);
    assert_eq!(batch.preempted, vec![1]);
    let victim = &inst.wait_queue[0];
    assert_eq!(victim.prefill_len, 37);
    assert_eq!(victim.prefilled, 0);
    assert!(victim.first_token_us.is_some(), "first token time survives preemption");
}

#[test]
fn test_prefix_hit_skips_cached_prefill() {
    let mut sched = slo_scheduler(QueueOrdering::Fcfs);
    let mut inst = Instance::new(0, 32, 16);
    let shared: Vec<u32> = (0..64).collect();

    inst.enqueue(with_ids(1, 0, shared.clone(), 1), 0);
    let batch = sched.schedule(&mut inst, 0);
    assert_eq!(batch.prefill_tokens, 64);
    let done = inst.finish_step(1_000, 0);
    assert_eq!(done.len(), 1);
    assert_eq!(inst.cache.cached_blocks(), 4);

    let mut longer = shared.clone();
    longer.extend(500..532);
    inst.enqueue(with_ids(2, 1_000, longer, 1), 1_000);
    let batch = sched.schedule(&mut inst, 1_000);
    assert_eq!(batch.prefill_tokens, 32, "only the new blocks are computed");

    inst.finish_step(2_000, 0);
    inst.enqueue(with_ids(3, 2_000, shared, 1), 2_000);
    let batch = sched.schedule(&mut inst, 2_000);
    assert_eq!(batch.prefill_tokens, 1, "a full hit still computes one token");
}

#[test]
fn test_memory_pressure_run_drains_without_corruption() {
    let mut sched = slo_scheduler(QueueOrdering::Fcfs);
    let mut inst = Instance::new(0, 10, 16);
    for id in 0..6 {
        inst.enqueue(counted(id, id, 40, 20, SloClass::Standard), 0);
    }

    let mut now = 0;
    let mut completed = 0;
    let mut shed = 0;
    let mut steps = 0;
    while inst.has_work() {
        steps += 1;
        assert!(steps < 10_000, "run did not drain");
        let batch = sched.schedule(&mut inst, now);
        shed += batch.capacity_shed.len();
        assert_accounting(&inst);
        let held: u64 = inst.running.iter().map(|r| r.held_blocks()).sum();
        assert_eq!(held, inst.cache.used_blocks());
        now += 1_000;
        completed += inst.finish_step(now, 0).len();
        assert_accounting(&inst);
    }

    assert_eq!(completed + shed, 6);
    assert_eq!(shed, 0, "every request fits an empty instance");
    assert!(inst.preemptions > 0, "decode growth under pressure must preempt");
    assert_eq!(inst.cache.used_blocks(), 0);
}

#[test]
fn test_reverse_priority_runs_lowest_first() {
    let mut sched = Scheduler::new(
        QueueOrdering::ReversePriority,
        PriorityPolicy::SloBased,
        0.0,
        1,
        2048,
        CostModel::default(),
    );
    let mut inst = Instance::new(0, 100, 16);
    inst.enqueue(counted(1, 0, 16, 1, SloClass::Critical), 0);
    inst.enqueue(counted(2, 1, 16, 1, SloClass::Sheddable), 0);
    let batch = sched.schedule(&mut inst, 0);
    assert_eq!(batch.admitted, vec![2]);
}
