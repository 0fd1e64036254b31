use hashbrown::HashMap;
use std::time::Duration;

use clock::Time;

use crate::replica::ReplicaId;

/// A TTL-bounded per-replica load snapshot.
///
/// Not self-locking: callers embed a `QueueLenCache` inside whatever mutex
/// already guards their routing state (spec.md §5: cache updates are
/// serialized with router mutations through the *same* lock, not an
/// independent one). There is no background expiry task — staleness is
/// checked lazily on [`QueueLenCache::get`].
#[derive(Debug, Clone)]
pub struct QueueLenCache {
    entries: HashMap<ReplicaId, (u32, Time)>,
    staleness: Duration,
}

impl QueueLenCache {
    /// Create an empty cache; entries older than `staleness` read as unknown.
    pub fn new(staleness: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            staleness,
        }
    }

    /// The current load for `id`, or `None` if never recorded or stale.
    pub fn get(&self, id: &ReplicaId, now: Time) -> Option<u32> {
        let (load, last_updated) = self.entries.get(id)?;
        if now.duration_since(*last_updated) > self.staleness {
            return None;
        }
        Some(*load)
    }

    /// Record a fresh load observation for `id`.
    ///
    /// Updates are monotone in time (each call should carry a `now` no
    /// earlier than the previous one for the same `id`) but not in value:
    /// `load` may be higher or lower than what was previously recorded.
    pub fn update(&mut self, id: ReplicaId, load: u32, now: Time) {
        self.entries.insert(id, (load, now));
    }

    /// Drop any cached entry for `id`.
    pub fn invalidate(&mut self, id: &ReplicaId) {
        self.entries.remove(id);
    }

    /// Decrement `id`'s cached load by one, clamped at zero.
    ///
    /// If no entry exists, this is a no-op (the caller is expected to log);
    /// spec.md §4.5 `on_request_completed`: "if no entry exists, log and
    /// return."
    pub fn decrement(&mut self, id: &ReplicaId, now: Time) -> bool {
        match self.entries.get_mut(id) {
            Some((load, last_updated)) => {
                *load = load.saturating_sub(1);
                *last_updated = now;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ReplicaId {
        ReplicaId::new(s)
    }

    #[test]
    fn unknown_replica_reads_as_unknown() {
        let cache = QueueLenCache::new(Duration::from_secs(60));
        assert_eq!(cache.get(&id("a"), Time::from_timestamp_nanos(0)), None);
    }

    #[test]
    fn stale_entry_reads_as_unknown() {
        let mut cache = QueueLenCache::new(Duration::from_secs(10));
        cache.update(id("a"), 5, Time::from_timestamp_nanos(0));
        let later = Time::from_timestamp_nanos(20_000_000_000);
        assert_eq!(cache.get(&id("a"), later), None);
    }

    #[test]
    fn fresh_entry_reads_back() {
        let mut cache = QueueLenCache::new(Duration::from_secs(10));
        cache.update(id("a"), 5, Time::from_timestamp_nanos(0));
        assert_eq!(cache.get(&id("a"), Time::from_timestamp_nanos(1)), Some(5));
    }

    #[test]
    fn invalidate_drops_entry() {
        let mut cache = QueueLenCache::new(Duration::from_secs(10));
        cache.update(id("a"), 5, Time::from_timestamp_nanos(0));
        cache.invalidate(&id("a"));
        assert_eq!(cache.get(&id("a"), Time::from_timestamp_nanos(0)), None);
    }

    // P6
    #[test]
    fn decrement_clamps_at_zero() {
        let mut cache = QueueLenCache::new(Duration::from_secs(10));
        cache.update(id("a"), 0, Time::from_timestamp_nanos(0));
        assert!(cache.decrement(&id("a"), Time::from_timestamp_nanos(1)));
        assert_eq!(cache.get(&id("a"), Time::from_timestamp_nanos(1)), Some(0));
    }

    #[test]
    fn decrement_missing_entry_returns_false() {
        let mut cache = QueueLenCache::new(Duration::from_secs(10));
        assert!(!cache.decrement(&id("a"), Time::from_timestamp_nanos(0)));
    }
}
