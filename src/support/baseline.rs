use std::time::{Duration, Instant};

use dashmap::DashMap;

const DEFAULT_CAPACITY: usize = 10_000;
const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// CPU counters captured at job start, held in memory until the matching
/// end event consumes them.
#[derive(Debug, Clone, Copy)]
pub struct CpuBaseline {
    pub user_micros: i64,
    pub sys_micros: i64,
    stored_at: Instant,
}

/// Process-local baseline store keyed by correlation uuid. Baselines whose
/// end event never arrives (crashed worker, missed event) would otherwise
/// accumulate forever, so the map is capacity-bounded with TTL eviction.
/// Losing a baseline only loses the CPU delta for that run, never
/// correctness.
pub struct BaselineStore {
    entries: DashMap<String, CpuBaseline>,
    ttl: Duration,
    capacity: usize,
}

impl Default for BaselineStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl BaselineStore {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        BaselineStore {
            entries: DashMap::new(),
            ttl,
            capacity,
        }
    }

    pub fn set(&self, uuid: &str, user_micros: i64, sys_micros: i64) {
        if self.entries.len() >= self.capacity {
            self.sweep_expired();
        }
        // Still full after the sweep: drop the new baseline rather than grow
        // without bound.
        if self.entries.len() >= self.capacity {
            return;
        }
        self.entries.insert(
            uuid.to_string(),
            CpuBaseline {
                user_micros,
                sys_micros,
                stored_at: Instant::now(),
            },
        );
    }

    /// Consume the baseline for this uuid. Expired entries are treated as
    /// already gone.
    pub fn take(&self, uuid: &str) -> Option<CpuBaseline> {
        let (_, baseline) = self.entries.remove(uuid)?;
        if baseline.stored_at.elapsed() > self.ttl {
            return None;
        }
        Some(baseline)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep_expired(&self) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, baseline| baseline.stored_at.elapsed() <= ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_consumes_the_entry() {
        let store = BaselineStore::default();
        store.set("u1", 100, 50);
        let baseline = store.take("u1").expect("baseline present");
        assert_eq!(baseline.user_micros, 100);
        assert_eq!(baseline.sys_micros, 50);
        assert!(store.take("u1").is_none());
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let store = BaselineStore::new(16, Duration::from_millis(0));
        store.set("u1", 100, 50);
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.take("u1").is_none());
    }

    #[test]
    fn capacity_sweep_evicts_expired_before_dropping_new() {
        let store = BaselineStore::new(2, Duration::from_millis(0));
        store.set("a", 1, 1);
        store.set("b", 2, 2);
        std::thread::sleep(Duration::from_millis(5));
        // Both entries are expired; inserting sweeps them out first.
        store.set("c", 3, 3);
        assert_eq!(store.len(), 1);
        assert!(store.take("c").is_none()); // ttl 0 expires immediately
    }
}
