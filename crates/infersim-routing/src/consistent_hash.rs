//! Consistent-hash routing policy.
//!
//! Each instance owns `virtual_nodes` points on a 64-bit xxh3 ring. A request
//! is keyed by its session id when it has one, else by its first block hash,
//! else by its request id, and goes to the first ring point at or after the
//! key's hash. Sessions therefore stick to one instance regardless of load.

use crate::traits::*;
use xxhash_rust::xxh3::xxh3_64;

pub struct ConsistentHash {
    virtual_nodes: u32,
    /// Sorted `(point, instance)` pairs.
    ring: Vec<(u64, InstanceId)>,
    /// Instance ids the ring was built for.
    members: Vec<InstanceId>,
}

impl ConsistentHash {
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            ring: Vec::new(),
            members: Vec::new(),
        }
    }

    fn rebuild(&mut self, snapshots: &[RoutingSnapshot]) {
        self.members = snapshots.iter().map(|s| s.id).collect();
        self.ring.clear();
        for &id in &self.members {
            for v in 0..self.virtual_nodes {
                let point = xxh3_64(format!("instance-{}#{}", id, v).as_bytes());
                self.ring.push((point, id));
            }
        }
        self.ring.sort_unstable();
    }

    fn key(request: &RequestInfo<'_>) -> u64 {
        if let Some(session) = request.session_id {
            xxh3_64(session.as_bytes())
        } else if let Some(&first) = request.block_hashes.first() {
            first
        } else {
            xxh3_64(&request.id.to_le_bytes())
        }
    }
}

impl RoutingPolicy for ConsistentHash {
    fn route(
        &mut self,
        request: &RequestInfo<'_>,
        snapshots: &[RoutingSnapshot],
        _clock: &dyn Clock,
    ) -> Option<RoutingDecision> {
        if snapshots.is_empty() {
            return None;
        }
        if !snapshots.iter().map(|s| s.id).eq(self.members.iter().copied()) {
            self.rebuild(snapshots);
        }
        let key = Self::key(request);
        let pos = self.ring.partition_point(|&(p, _)| p < key);
        let (_, id) = self.ring.get(pos).or_else(|| self.ring.first())?;
        Some(RoutingDecision::to(*id))
    }

    fn name(&self) -> &str {
        "consistent_hash"
    }
}
