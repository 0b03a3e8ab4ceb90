//! Content-addressed prefix cache index with LRU eviction.
//!
//! Models the paged KV cache of one instance. Full prompt blocks are addressed
//! by a chained hash: block `k`'s hash covers block `k - 1`'s hash and the
//! token ids of block `k`, so identical content hashes identically on every
//! instance and any edit invalidates all later blocks.
//!
//! Blocks are in one of three states:
//! - **pinned**: hashed blocks referenced by at least one running request,
//! - **cached**: hashed blocks nobody references, kept for reuse and evicted
//!   least-recently-used first,
//! - **anonymous**: unhashed blocks owned by a running request (partial
//!   prompt blocks, decode output, token-count-only prompts).
//!
//! Cached blocks count as free capacity, the way a paged allocator treats
//! its reusable free queue. `free + pinned + anonymous == total` always.

use bytemuck::cast_slice;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("KV capacity fault: need {needed} blocks, {available} available after eviction")]
    CapacityFault { needed: u64, available: u64 },
}

/// Chained block hashes for every full block of `tokens`. A trailing partial
/// block is not hashed.
pub fn compute_block_hashes(tokens: &[u32], block_size: u32) -> Vec<u64> {
    if block_size == 0 {
        return Vec::new();
    }
    let mut parent: Option<u64> = None;
    tokens
        .chunks_exact(block_size as usize)
        .map(|chunk| {
            let block = xxh3_64(cast_slice(chunk));
            let seq = match parent {
                Some(p) => xxh3_64(cast_slice(&[p, block])),
                None => block,
            };
            parent = Some(seq);
            seq
        })
        .collect()
}

#[derive(Debug, Clone)]
struct BlockEntry {
    ref_count: u32,
    /// Access tick; the key in `lru` while `ref_count == 0`.
    last_access: u64,
}

/// Outcome of a successful [`PrefixCacheIndex::update_cache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheUpdate {
    /// Leading blocks that were already resident.
    pub matched_blocks: u32,
    /// Hashed blocks newly inserted.
    pub inserted_blocks: u32,
    /// Cached blocks evicted to make room.
    pub evicted_blocks: u32,
}

/// Statistics snapshot for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefixCacheStats {
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub pinned_blocks: u64,
    pub cached_blocks: u64,
    pub anonymous_blocks: u64,
    pub utilization: f64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub thrashing_rate: f64,
}

/// Block index for a single instance.
#[derive(Debug, Clone)]
pub struct PrefixCacheIndex {
    block_size: u32,
    total_blocks: u64,
    entries: HashMap<u64, BlockEntry>,
    /// Unreferenced entries by access tick, least recent first.
    lru: BTreeMap<u64, u64>,
    anonymous_blocks: u64,
    tick: u64,
    // --- Counters ---
    lookup_blocks: u64,
    hit_blocks: u64,
    inserted_total: u64,
    evicted_total: u64,
}

impl PrefixCacheIndex {
    pub fn new(total_blocks: u64, block_size: u32) -> Self {
        Self {
            block_size,
            total_blocks,
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            anonymous_blocks: 0,
            tick: 0,
            lookup_blocks: 0,
            hit_blocks: 0,
            inserted_total: 0,
            evicted_total: 0,
        }
    }

    /// Tokens per block.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn compute_block_hashes(&self, tokens: &[u32]) -> Vec<u64> {
        compute_block_hashes(tokens, self.block_size)
    }

    /// Blocks needed to hold `tokens` tokens.
    pub fn blocks_for_tokens(&self, tokens: u32) -> u64 {
        if self.block_size == 0 {
            return 0;
        }
        (tokens as u64).div_ceil(self.block_size as u64)
    }

    /// Longest run of leading hashes resident on this instance. Read-only.
    pub fn match_length(&self, hashes: &[u64]) -> u32 {
        hashes
            .iter()
            .take_while(|h| self.entries.contains_key(h))
            .count() as u32
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.entries.contains_key(&hash)
    }

    /// Pin a request's blocks: refresh and pin resident hashes, insert missing
    /// ones, and reserve `blocks_used - hashes.len()` anonymous blocks.
    ///
    /// All or nothing: on [`CacheError::CapacityFault`] nothing has changed.
    pub fn update_cache(
        &mut self,
        hashes: &[u64],
        blocks_used: u64,
    ) -> Result<CacheUpdate, CacheError> {
        let blocks_used = blocks_used.max(hashes.len() as u64);
        let anonymous = blocks_used - hashes.len() as u64;
        let unique = distinct(hashes);

        let mut missing = 0u64;
        let mut resident_unpinned = 0u64;
        for h in &unique {
            match self.entries.get(h) {
                Some(e) if e.ref_count == 0 => resident_unpinned += 1,
                Some(_) => {}
                None => missing += 1,
            }
        }
        let needed = missing + anonymous;
        let available = self.free_blocks() - resident_unpinned;
        if needed > available {
            return Err(CacheError::CapacityFault { needed, available });
        }

        let matched = self.match_length(hashes);
        self.lookup_blocks += hashes.len() as u64;
        self.hit_blocks += matched as u64;

        for h in &unique {
            if let Some(entry) = self.entries.get_mut(h) {
                if entry.ref_count == 0 {
                    self.lru.remove(&entry.last_access);
                }
                entry.ref_count += 1;
                self.tick += 1;
                entry.last_access = self.tick;
            }
        }

        let evicted = self.make_room(needed);
        for &h in &unique {
            if !self.entries.contains_key(&h) {
                self.tick += 1;
                self.entries.insert(
                    h,
                    BlockEntry {
                        ref_count: 1,
                        last_access: self.tick,
                    },
                );
                self.inserted_total += 1;
            }
        }
        self.anonymous_blocks += anonymous;

        Ok(CacheUpdate {
            matched_blocks: matched,
            inserted_blocks: missing as u32,
            evicted_blocks: evicted as u32,
        })
    }

    /// Reserve `n` more anonymous blocks, evicting cached blocks as needed.
    pub fn grow(&mut self, n: u64) -> Result<u64, CacheError> {
        let available = self.free_blocks();
        if n > available {
            return Err(CacheError::CapacityFault {
                needed: n,
                available,
            });
        }
        let evicted = self.make_room(n);
        self.anonymous_blocks += n;
        Ok(evicted)
    }

    /// Drop a request's references. Hashed blocks whose last reference goes
    /// away become cached, deepest block first so eviction takes the tail of
    /// a chain before its prefix.
    pub fn release(&mut self, hashes: &[u64], anonymous_blocks: u64) {
        for h in distinct(hashes).iter().rev() {
            if let Some(entry) = self.entries.get_mut(h) {
                if entry.ref_count == 0 {
                    continue;
                }
                entry.ref_count -= 1;
                if entry.ref_count == 0 {
                    self.tick += 1;
                    entry.last_access = self.tick;
                    self.lru.insert(self.tick, *h);
                }
            }
        }
        self.anonymous_blocks = self.anonymous_blocks.saturating_sub(anonymous_blocks);
    }

    /// Evict cached blocks until `needed` blocks are unallocated.
    fn make_room(&mut self, needed: u64) -> u64 {
        let mut evicted = 0;
        while self.unallocated_blocks() < needed {
            let Some((_, hash)) = self.lru.pop_first() else {
                break;
            };
            self.entries.remove(&hash);
            evicted += 1;
        }
        self.evicted_total += evicted;
        evicted
    }

    fn unallocated_blocks(&self) -> u64 {
        self.total_blocks
            .saturating_sub(self.entries.len() as u64 + self.anonymous_blocks)
    }

    // --- Accounting ---

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Blocks held by running requests.
    pub fn used_blocks(&self) -> u64 {
        self.pinned_blocks() + self.anonymous_blocks
    }

    /// Unallocated plus evictable cached blocks.
    pub fn free_blocks(&self) -> u64 {
        self.total_blocks.saturating_sub(self.used_blocks())
    }

    pub fn pinned_blocks(&self) -> u64 {
        (self.entries.len() - self.lru.len()) as u64
    }

    pub fn cached_blocks(&self) -> u64 {
        self.lru.len() as u64
    }

    pub fn anonymous_blocks(&self) -> u64 {
        self.anonymous_blocks
    }

    pub fn utilization(&self) -> f64 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        self.used_blocks() as f64 / self.total_blocks as f64
    }

    /// Fraction of looked-up blocks that were resident.
    pub fn hit_rate(&self) -> f64 {
        if self.lookup_blocks == 0 {
            return 0.0;
        }
        self.hit_blocks as f64 / self.lookup_blocks as f64
    }

    pub fn evictions(&self) -> u64 {
        self.evicted_total
    }

    /// Evicted blocks per inserted block.
    pub fn thrashing_rate(&self) -> f64 {
        if self.inserted_total == 0 {
            return 0.0;
        }
        self.evicted_total as f64 / self.inserted_total as f64
    }

    /// Cached block hashes in eviction order, least recently used first.
    pub fn lru_order(&self) -> Vec<u64> {
        self.lru.values().copied().collect()
    }

    pub fn stats(&self) -> PrefixCacheStats {
        PrefixCacheStats {
            total_blocks: self.total_blocks,
            free_blocks: self.free_blocks(),
            pinned_blocks: self.pinned_blocks(),
            cached_blocks: self.cached_blocks(),
            anonymous_blocks: self.anonymous_blocks,
            utilization: self.utilization(),
            hit_rate: self.hit_rate(),
            evictions: self.evicted_total,
            thrashing_rate: self.thrashing_rate(),
        }
    }
}

/// `hashes` with repeats removed, first occurrence kept. Each distinct block
/// is pinned and charged once.
fn distinct(hashes: &[u64]) -> Vec<u64> {
    let mut seen = HashSet::with_capacity(hashes.len());
    hashes.iter().copied().filter(|h| seen.insert(*h)).collect()
}
