/// Integration tests for the prefix cache index.
use infersim_core::prefix_cache::{compute_block_hashes, CacheError, PrefixCacheIndex};

fn tokens(range: std::ops::Range<u32>) -> Vec<u32> {
    range.collect()
}

#[test]
fn test_hashes_identical_across_instances() {
    let t = tokens(0..100);
    let a = PrefixCacheIndex::new(64, 16);
    let b = PrefixCacheIndex::new(8, 16);
    assert_eq!(a.compute_block_hashes(&t), b.compute_block_hashes(&t));
    assert_eq!(a.compute_block_hashes(&t), compute_block_hashes(&t, 16));
    // 100 tokens is 6 full blocks; the partial tail is not hashed.
    assert_eq!(compute_block_hashes(&t, 16).len(), 6);
}

#[test]
fn test_edit_invalidates_later_blocks_only() {
    let original = tokens(0..64);
    let mut edited = original.clone();
    edited[20] = 9_999; // inside block 1

    let h1 = compute_block_hashes(&original, 16);
    let h2 = compute_block_hashes(&edited, 16);
    assert_eq!(h1[0], h2[0]);
    for i in 1..4 {
        assert_ne!(h1[i], h2[i], "block {} should differ after an edit in block 1", i);
    }
}

#[test]
fn test_same_block_content_at_different_depth_differs() {
    // Block content [0..16) at depth 0 and again at depth 1.
    let mut t = tokens(0..16);
    t.extend(0..16);
    let h = compute_block_hashes(&t, 16);
    assert_ne!(h[0], h[1]);
}

#[test]
fn test_match_length_is_prefix_contiguous_and_read_only() {
    let mut cache = PrefixCacheIndex::new(100, 16);
    let shared = tokens(0..64);
    let hashes = cache.compute_block_hashes(&shared);
    cache.update_cache(&hashes, 4).unwrap();

    let mut query = shared.clone();
    query.extend(1_000..1_032);
    let qh = cache.compute_block_hashes(&query);
    let before = cache.stats();
    assert_eq!(cache.match_length(&qh), 4);
    assert_eq!(cache.stats(), before, "match_length must not mutate");

    // A gap breaks the run even if a later block is resident.
    let gapped = vec![12345, hashes[1], hashes[2]];
    assert_eq!(cache.match_length(&gapped), 0);
    assert!(cache.match_length(&qh) as usize <= qh.len());
}

#[test]
fn test_block_accounting_invariant_through_lifecycle() {
    let mut cache = PrefixCacheIndex::new(20, 16);
    let check = |c: &PrefixCacheIndex| {
        assert_eq!(
            c.free_blocks() + c.pinned_blocks() + c.anonymous_blocks(),
            c.total_blocks()
        );
    };

    let a = cache.compute_block_hashes(&tokens(0..80));
    let b = cache.compute_block_hashes(&tokens(500..580));
    cache.update_cache(&a, 7).unwrap();
    check(&cache);
    cache.update_cache(&b, 6).unwrap();
    check(&cache);
    cache.grow(2).unwrap();
    check(&cache);
    cache.release(&a, 2);
    check(&cache);
    assert_eq!(cache.cached_blocks(), 5);
    cache.release(&b, 1);
    check(&cache);
    assert_eq!(cache.used_blocks(), 2);
}

#[test]
fn test_lru_eviction_order_is_observable() {
    let mut cache = PrefixCacheIndex::new(6, 16);
    let a = cache.compute_block_hashes(&tokens(0..32));
    let b = cache.compute_block_hashes(&tokens(100..132));
    let c = cache.compute_block_hashes(&tokens(200..232));

    cache.update_cache(&a, 2).unwrap();
    cache.release(&a, 0);
    cache.update_cache(&b, 2).unwrap();
    cache.release(&b, 0);
    // Deepest block of each chain becomes cached first.
    assert_eq!(cache.lru_order(), vec![a[1], a[0], b[1], b[0]]);

    // Touch `a` again so `b` becomes least recent.
    cache.update_cache(&a, 2).unwrap();
    cache.release(&a, 0);
    assert_eq!(cache.lru_order(), vec![b[1], b[0], a[1], a[0]]);

    // Four more blocks: two unallocated, two evicted from `b`.
    let update = cache.update_cache(&c, 4).unwrap();
    assert_eq!(update.evicted_blocks, 2);
    assert!(!cache.contains(b[0]) && !cache.contains(b[1]));
    assert!(cache.contains(a[0]) && cache.contains(a[1]));
    assert_eq!(cache.evictions(), 2);
}

#[test]
fn test_capacity_fault_leaves_state_unchanged() {
    let mut cache = PrefixCacheIndex::new(4, 16);
    let a = cache.compute_block_hashes(&tokens(0..48));
    cache.update_cache(&a, 3).unwrap();
    let before = cache.stats();
    let order = cache.lru_order();

    let b = cache.compute_block_hashes(&tokens(100..132));
    let err = cache.update_cache(&b, 2).unwrap_err();
    assert_eq!(
        err,
        CacheError::CapacityFault {
            needed: 2,
            available: 1
        }
    );
    assert_eq!(cache.stats(), before);
    assert_eq!(cache.lru_order(), order);
    assert!(cache.grow(2).is_err());
    assert_eq!(cache.free_blocks(), 1);
}

#[test]
fn test_shared_prefix_pinned_once() {
    let mut cache = PrefixCacheIndex::new(10, 16);
    let h = cache.compute_block_hashes(&tokens(0..64));
    cache.update_cache(&h, 4).unwrap();
    let second = cache.update_cache(&h, 5).unwrap();
    assert_eq!(second.matched_blocks, 4);
    assert_eq!(second.inserted_blocks, 0);
    // 4 shared pinned blocks plus one anonymous block for the second user.
    assert_eq!(cache.used_blocks(), 5);

    cache.release(&h, 0);
    assert_eq!(cache.cached_blocks(), 0, "still pinned by the other user");
    cache.release(&h, 1);
    assert_eq!(cache.cached_blocks(), 4);
    assert!((cache.hit_rate() - 0.5).abs() < 1e-12);
}

#[test]
fn test_thrashing_rate_counts_evictions_per_insert() {
    let mut cache = PrefixCacheIndex::new(2, 16);
    for i in 0..5u32 {
        let h = cache.compute_block_hashes(&tokens(i * 1_000..i * 1_000 + 32));
        cache.update_cache(&h, 2).unwrap();
        cache.release(&h, 0);
    }
    // 10 inserted, every batch after the first evicts 2.
    assert_eq!(cache.evictions(), 8);
    assert!((cache.thrashing_rate() - 0.8).abs() < 1e-12);
}
