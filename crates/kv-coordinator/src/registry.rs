//! Slave registry: an ordered table of replicas placed on a consistent
//! hash ring, re-architected from the original doubly-linked ring of raw
//! cross-pointers into a sorted `Vec` indexed by id, with neighbors found
//! by index arithmetic modulo the slave count.

use std::sync::RwLock;

use kv_error::{Error, Kind};

/// The ring hash: seed 1125899906842597, multiplier 31, unsigned 64-bit.
/// Used both to place a key on the ring and to assign a slave's id.
pub fn hash64(s: &str) -> u64 {
    let mut hash: u64 = 1125899906842597;
    for b in s.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(b as u64);
    }
    hash
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveHandle {
    pub id: u64,
    pub host: String,
    pub port: u16,
}

impl SlaveHandle {
    fn ring_id(host: &str, port: u16) -> u64 {
        hash64(&format!("{port}:{host}"))
    }
}

pub struct Registry {
    capacity: usize,
    slaves: RwLock<Vec<SlaveHandle>>,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Registry {
            capacity,
            slaves: RwLock::new(Vec::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slaves.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a slave, keeping the table sorted ascending by id.
    /// Registering the same `(host, port)` twice is idempotent success.
    pub fn register(&self, host: impl Into<String>, port: u16) -> Result<u64, Error> {
        let host = host.into();
        let id = SlaveHandle::ring_id(&host, port);
        let mut slaves = self.slaves.write().unwrap();

        if let Some(existing) = slaves.iter().find(|s| s.id == id) {
            return Ok(existing.id);
        }
        if slaves.len() >= self.capacity {
            return Err(Kind::Generic.into());
        }

        let pos = slaves.partition_point(|s| s.id < id);
        slaves.insert(pos, SlaveHandle { id, host, port });
        Ok(id)
    }

    /// The first slave whose id is strictly greater than `hash64(key)`,
    /// wrapping to the smallest id.
    pub fn primary(&self, key: &str) -> Option<SlaveHandle> {
        let slaves = self.slaves.read().unwrap();
        if slaves.is_empty() {
            return None;
        }
        let target = hash64(key);
        let pos = slaves.partition_point(|s| s.id <= target);
        let idx = if pos == slaves.len() { 0 } else { pos };
        Some(slaves[idx].clone())
    }

    /// The slave immediately following `id` in ring order, wrapping at
    /// the end. `None` if `id` is not currently registered.
    pub fn successor(&self, id: u64) -> Option<SlaveHandle> {
        let slaves = self.slaves.read().unwrap();
        if slaves.is_empty() {
            return None;
        }
        let idx = slaves.iter().position(|s| s.id == id)?;
        Some(slaves[(idx + 1) % slaves.len()].clone())
    }

    /// The primary for `key` followed by `redundancy - 1` successors, all
    /// distinct. `redundancy` is clamped to both the configured slave
    /// capacity and the number of currently registered slaves (a ring
    /// shorter than the requested redundancy cannot produce distinct
    /// replicas beyond its own size).
    pub fn replicas_for(&self, key: &str, redundancy: usize) -> Vec<SlaveHandle> {
        let slaves = self.slaves.read().unwrap();
        if slaves.is_empty() {
            return Vec::new();
        }
        let redundancy = redundancy.min(self.capacity).min(slaves.len());
        let target = hash64(key);
        let pos = slaves.partition_point(|s| s.id <= target);
        let start = if pos == slaves.len() { 0 } else { pos };
        (0..redundancy)
            .map(|i| slaves[(start + i) % slaves.len()].clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn register_is_idempotent_on_duplicate_id() {
        let registry = Registry::new(2);
        let id1 = registry.register("localhost", 9000).unwrap();
        let id2 = registry.register("localhost", 9000).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn register_fails_past_capacity() {
        let registry = Registry::new(1);
        registry.register("localhost", 9000).unwrap();
        let err = registry.register("localhost", 9001).unwrap_err();
        assert_eq!(err.kind(), Kind::Generic);
    }

    #[test]
    fn primary_is_deterministic() {
        let registry = Registry::new(4);
        registry.register("localhost", 9000).unwrap();
        registry.register("localhost", 9001).unwrap();
        registry.register("localhost", 9002).unwrap();

        let a = registry.primary("some-key");
        let b = registry.primary("some-key");
        assert_eq!(a, b);
    }

    #[test]
    fn successor_wraps_at_the_end() {
        let registry = Registry::new(4);
        let mut ids = Vec::new();
        for port in [9000, 9001, 9002] {
            ids.push(registry.register("localhost", port).unwrap());
        }
        ids.sort_unstable();

        assert_eq!(registry.successor(ids[0]).unwrap().id, ids[1]);
        assert_eq!(registry.successor(ids[1]).unwrap().id, ids[2]);
        assert_eq!(registry.successor(ids[2]).unwrap().id, ids[0]);
    }

    #[test]
    fn replicas_for_are_distinct_and_bounded_by_ring_size() {
        let registry = Registry::new(4);
        registry.register("localhost", 9000).unwrap();
        registry.register("localhost", 9001).unwrap();

        let replicas = registry.replicas_for("k", 5);
        assert_eq!(replicas.len(), 2);
        assert_ne!(replicas[0].id, replicas[1].id);
    }

    #[test]
    fn replicas_for_starts_at_the_primary() {
        let registry = Registry::new(4);
        registry.register("localhost", 9000).unwrap();
        registry.register("localhost", 9001).unwrap();
        registry.register("localhost", 9002).unwrap();

        let primary = registry.primary("k").unwrap();
        let replicas = registry.replicas_for("k", 2);
        assert_eq!(replicas[0], primary);
        assert_eq!(replicas[1], registry.successor(primary.id).unwrap());
    }
}
