use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::event::LogEvent;

/// Fetches a snapshot of one pulled atom on demand.
pub trait AtomPuller: Send + Sync {
    fn pull(&self) -> Vec<LogEvent>;
}

struct CachedPull {
    pulled_at_ns: i64,
    events: Vec<LogEvent>,
}

/// Registry of pullers with a shared snapshot cache.
///
/// Pulled atoms are expensive to produce, so snapshots are cached and the
/// processor clears the cache on a fixed cadence from the event path.
pub struct PullerManager {
    pullers: Mutex<HashMap<i32, Box<dyn AtomPuller>>>,
    cache: Mutex<HashMap<i32, CachedPull>>,
    cache_ttl_ns: i64,
}

impl PullerManager {
    pub fn new(cache_ttl_ns: i64) -> Self {
        Self {
            pullers: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            cache_ttl_ns,
        }
    }

    pub fn register_puller(&self, atom_id: i32, puller: Box<dyn AtomPuller>) {
        self.pullers.lock().insert(atom_id, puller);
    }

    /// Pulls an atom snapshot, serving from cache when fresh.
    pub fn pull(&self, atom_id: i32, now_ns: i64) -> Option<Vec<LogEvent>> {
        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.get(&atom_id) {
                if now_ns - cached.pulled_at_ns < self.cache_ttl_ns {
                    return Some(cached.events.clone());
                }
            }
        }

        let events = {
            let pullers = self.pullers.lock();
            pullers.get(&atom_id).map(|p| p.pull())?
        };
        self.cache.lock().insert(
            atom_id,
            CachedPull {
                pulled_at_ns: now_ns,
                events: events.clone(),
            },
        );
        Some(events)
    }

    /// Drops cache entries older than the cache TTL.
    pub fn clear_cache_if_necessary(&self, now_ns: i64) {
        let mut cache = self.cache.lock();
        cache.retain(|_, cached| now_ns - cached.pulled_at_ns < self.cache_ttl_ns);
    }

    /// Drops every cached snapshot unconditionally.
    pub fn force_clear_cache(&self) {
        self.cache.lock().clear();
        debug!("puller cache cleared");
    }

    /// Platform pull alarm fired: refresh every registered puller's cache.
    pub fn on_alarm_fired(&self, timestamp_ns: i64) {
        let atom_ids: Vec<i32> = self.pullers.lock().keys().copied().collect();
        for atom_id in atom_ids {
            self.cache.lock().remove(&atom_id);
            self.pull(atom_id, timestamp_ns);
        }
    }

    pub fn cached_count(&self) -> usize {
        self.cache.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingPuller {
        pulls: Arc<AtomicUsize>,
    }

    impl AtomPuller for CountingPuller {
        fn pull(&self) -> Vec<LogEvent> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            vec![LogEvent::new(10, 0)]
        }
    }

    fn counting_manager(cache_ttl_ns: i64) -> (PullerManager, Arc<AtomicUsize>) {
        let pulls = Arc::new(AtomicUsize::new(0));
        let manager = PullerManager::new(cache_ttl_ns);
        manager.register_puller(
            10,
            Box::new(CountingPuller {
                pulls: Arc::clone(&pulls),
            }),
        );
        (manager, pulls)
    }

    #[test]
    fn test_pull_caches_snapshot() {
        let (manager, pulls) = counting_manager(1_000);

        assert!(manager.pull(10, 0).is_some());
        assert!(manager.pull(10, 500).is_some());
        assert_eq!(pulls.load(Ordering::SeqCst), 1);

        // Cache expired: pulls again.
        assert!(manager.pull(10, 2_000).is_some());
        assert_eq!(pulls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregistered_atom_returns_none() {
        let manager = PullerManager::new(1_000);
        assert!(manager.pull(99, 0).is_none());
    }

    #[test]
    fn test_force_clear_cache() {
        let (manager, pulls) = counting_manager(1_000_000);
        manager.pull(10, 0);
        manager.force_clear_cache();
        assert_eq!(manager.cached_count(), 0);

        manager.pull(10, 1);
        assert_eq!(pulls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_clear_cache_if_necessary_respects_ttl() {
        let (manager, _) = counting_manager(1_000);
        manager.pull(10, 0);

        manager.clear_cache_if_necessary(500);
        assert_eq!(manager.cached_count(), 1);

        manager.clear_cache_if_necessary(1_500);
        assert_eq!(manager.cached_count(), 0);
    }

    #[test]
    fn test_alarm_refreshes_registered_pullers() {
        let (manager, pulls) = counting_manager(1_000_000);
        manager.pull(10, 0);
        manager.on_alarm_fired(100);
        assert_eq!(pulls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.cached_count(), 1);
    }
}
