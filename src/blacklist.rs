//! Peers that recently failed a metadata fetch, kept long enough to stop
//! re-dialing them on every replayed announcement.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Bounded, time-expiring set of peer addresses. Membership is advisory:
/// a racy miss only costs one extra failed fetch, but `has` never reports
/// an address that was not `add`ed within the last ttl.
pub struct Blacklist {
    map: DashMap<String, Instant>,
    ttl: Duration,
    capacity: usize,
}

impl Blacklist {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            map: DashMap::new(),
            ttl,
            capacity,
        }
    }

    pub fn has(&self, addr: &str) -> bool {
        self.map
            .get(addr)
            .is_some_and(|expiry| Instant::now() < *expiry)
    }

    pub fn add(&self, addr: String) {
        if !self.map.contains_key(&addr) && self.map.len() >= self.capacity {
            self.evict_earliest();
        }
        self.map.insert(addr, Instant::now() + self.ttl);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn evict_earliest(&self) {
        let earliest = self
            .map
            .iter()
            .min_by_key(|e| *e.value())
            .map(|e| e.key().clone());
        if let Some(key) = earliest {
            self.map.remove(&key);
        }
    }
}
