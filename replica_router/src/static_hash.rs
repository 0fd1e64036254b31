use std::sync::Arc;

use clock::TimeProvider;
use fingerprint::{extract_cache_key, hash_key};
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;

use crate::config::RouterConfig;
use crate::queue_len_cache::QueueLenCache;
use crate::replica::{PendingRequest, ReplicaHandle, ReplicaId};
use crate::router::ReplicaRouter;

/// Deterministic modulo-of-hash replica selection (spec.md §4.4).
///
/// Identical payloads always land on the same candidate index, but unlike
/// [`crate::chwbl::ChwblRouter`] the mapping shifts for *every* key whenever
/// the candidate count changes — there is no ring to bound the churn. It
/// exists for workloads that want pure determinism over churn-stability.
#[derive(Debug)]
pub struct StaticHashRouter {
    config: RouterConfig,
    time_provider: Arc<dyn TimeProvider>,
    cache: Mutex<QueueLenCache>,
    known_replicas: Mutex<Vec<ReplicaId>>,
}

impl StaticHashRouter {
    /// Build a new static-hash router.
    pub fn new(config: RouterConfig, time_provider: Arc<dyn TimeProvider>) -> Self {
        let cache = Mutex::new(QueueLenCache::new(config.queue_len_staleness));
        Self {
            config,
            time_provider,
            cache,
            known_replicas: Mutex::new(Vec::new()),
        }
    }
}

impl<R: ReplicaHandle> ReplicaRouter<R> for StaticHashRouter {
    fn update_replicas(&self, replicas: &[R]) {
        let ids: Vec<ReplicaId> = replicas.iter().map(|r| r.replica_id().clone()).collect();
        info!(total = ids.len(), "StaticHashRouter: updated replicas");
        *self.known_replicas.lock() = ids;
    }

    fn choose_replicas(&self, candidates: &[R], pending: Option<&PendingRequest>) -> Vec<Vec<R>> {
        if candidates.is_empty() {
            warn!("StaticHashRouter: no candidate replicas available");
            return vec![vec![]];
        }

        let Some(pending) = pending else {
            return vec![candidates.to_vec()];
        };

        let cache_key = extract_cache_key(
            &pending.args,
            &pending.metadata.request_id,
            self.config.max_user_messages_for_cache,
        );
        let h = hash_key(&cache_key);
        let idx = (h % candidates.len() as u64) as usize;
        let selected = &candidates[idx];
        debug!(
            replica_id = %selected.replica_id(),
            idx,
            candidates = candidates.len(),
            "StaticHashRouter: selected replica"
        );
        vec![vec![selected.clone()]]
    }

    fn on_replica_actor_died(&self, id: &ReplicaId) {
        self.known_replicas.lock().retain(|r| r != id);
        self.cache.lock().invalidate(id);
        warn!(%id, "StaticHashRouter: replica died");
    }

    fn on_replica_actor_unavailable(&self, id: &ReplicaId) {
        self.cache.lock().invalidate(id);
        warn!(%id, "StaticHashRouter: replica unavailable");
    }

    fn on_new_queue_len_info(&self, id: &ReplicaId, n: u32) {
        let now = self.time_provider.now();
        self.cache.lock().update(id.clone(), n, now);
    }

    fn on_request_completed(&self, id: &ReplicaId) {
        let now = self.time_provider.now();
        if !self.cache.lock().decrement(id, now) {
            debug!(%id, "StaticHashRouter: completion for replica with no cached load");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock::{MockProvider, Time};
    use serde_json::json;

    #[derive(Debug, Clone)]
    struct TestReplica(ReplicaId);
    impl ReplicaHandle for TestReplica {
        fn replica_id(&self) -> &ReplicaId {
            &self.0
        }
    }

    fn replicas(names: &[&str]) -> Vec<TestReplica> {
        names
            .iter()
            .map(|n| TestReplica(ReplicaId::new(*n)))
            .collect()
    }

    fn router() -> StaticHashRouter {
        StaticHashRouter::new(
            RouterConfig::default(),
            Arc::new(MockProvider::new(Time::from_timestamp_nanos(0))),
        )
    }

    #[test]
    fn empty_candidates_yields_empty_group() {
        let r = router();
        let result: Vec<Vec<TestReplica>> = ReplicaRouter::choose_replicas(&r, &[], None);
        assert_eq!(result, vec![Vec::<TestReplica>::new()]);
    }

    #[test]
    fn no_pending_request_returns_all_candidates_as_one_group() {
        let r = router();
        let cands = replicas(&["a", "b", "c"]);
        let result = ReplicaRouter::choose_replicas(&r, &cands, None);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].len(), 3);
    }

    // S4
    #[test]
    fn same_payload_always_selects_same_replica() {
        let r = router();
        let cands = replicas(&["a", "b", "c"]);
        let pending = PendingRequest::new(json!({"x": 1}), "req-1");

        let first = ReplicaRouter::choose_replicas(&r, &cands, Some(&pending));
        let second = ReplicaRouter::choose_replicas(&r, &cands, Some(&pending));
        assert_eq!(
            first[0][0].replica_id(),
            second[0][0].replica_id(),
            "selection must be deterministic for equal inputs"
        );
    }
}
