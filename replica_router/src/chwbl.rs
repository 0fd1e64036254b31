use std::sync::Arc;

use clock::TimeProvider;
use fingerprint::{extract_cache_key, hash_key};
use hashbrown::{HashMap, HashSet};
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;

use crate::config::RouterConfig;
use crate::hash_ring::HashRing;
use crate::queue_len_cache::QueueLenCache;
use crate::replica::{PendingRequest, ReplicaHandle, ReplicaId};
use crate::router::ReplicaRouter;

struct ChwblState<R> {
    ring: HashRing,
    replicas: HashMap<ReplicaId, R>,
    queue_len: QueueLenCache,
}

/// Consistent hashing with bounded loads (spec.md §4.5).
///
/// Co-locates a chat conversation's turns on the same replica via the ring,
/// while rejecting a replica whose load would exceed `load_factor` times the
/// mean candidate load. Ring mutations, load-cache mutations, and a routing
/// decision's load snapshot all happen under one [`parking_lot::Mutex`]
/// (spec.md §5: "Router state mutations must not suspend between read and
/// write"), so nothing can observe a half-updated ring or a load snapshot
/// interleaved with a concurrent `on_request_completed`.
pub struct ChwblRouter<R: ReplicaHandle> {
    state: Mutex<ChwblState<R>>,
    config: RouterConfig,
    time_provider: Arc<dyn TimeProvider>,
}

impl<R: ReplicaHandle> std::fmt::Debug for ChwblRouter<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChwblRouter")
            .field("config", &self.config)
            .finish()
    }
}

impl<R: ReplicaHandle> ChwblRouter<R> {
    /// Build a new CHWBL router.
    pub fn new(config: RouterConfig, time_provider: Arc<dyn TimeProvider>) -> Self {
        let queue_len = QueueLenCache::new(config.queue_len_staleness);
        Self {
            state: Mutex::new(ChwblState {
                ring: HashRing::new(),
                replicas: HashMap::new(),
                queue_len,
            }),
            config,
            time_provider,
        }
    }

    /// Number of points currently on the ring (for tests/introspection).
    pub fn ring_len(&self) -> usize {
        self.state.lock().ring.len()
    }
}

impl<R: ReplicaHandle> ReplicaRouter<R> for ChwblRouter<R> {
    fn update_replicas(&self, replicas: &[R]) {
        let mut state = self.state.lock();

        let old_ids: HashSet<ReplicaId> = state.replicas.keys().cloned().collect();
        let new_ids: HashSet<ReplicaId> =
            replicas.iter().map(|r| r.replica_id().clone()).collect();

        for id in old_ids.difference(&new_ids) {
            state.ring.remove_replica(id);
            state.replicas.remove(id);
        }

        for r in replicas {
            if !state.replicas.contains_key(r.replica_id()) {
                state
                    .ring
                    .add_replica(r.replica_id(), self.config.virtual_nodes_per_replica);
            }
            state.replicas.insert(r.replica_id().clone(), r.clone());
        }

        info!(
            total = state.replicas.len(),
            ring_points = state.ring.len(),
            "ChwblRouter: updated replicas"
        );
    }

    fn choose_replicas(&self, candidates: &[R], pending: Option<&PendingRequest>) -> Vec<Vec<R>> {
        if candidates.is_empty() {
            warn!("ChwblRouter: no candidate replicas available");
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

        let state = self.state.lock();
        if state.ring.is_empty() {
            return vec![candidates.to_vec()];
        }

        let candidate_map: HashMap<ReplicaId, &R> = candidates
            .iter()
            .map(|r| (r.replica_id().clone(), r))
            .collect();

        let now = self.time_provider.now();
        let loads: HashMap<ReplicaId, u32> = candidate_map
            .keys()
            .map(|id| (id.clone(), state.queue_len.get(id, now).unwrap_or(0)))
            .collect();

        let total_load: u64 = loads.values().map(|&l| l as u64).sum();
        let avg = (total_load as f64 + 1.0) / candidate_map.len() as f64;
        let threshold = avg * self.config.load_factor;

        let mut under = Vec::new();
        let mut over = Vec::new();
        let mut checked: HashSet<ReplicaId> = HashSet::new();

        for (_point, replica_id) in state.ring.walk_from(h) {
            if checked.len() >= candidate_map.len() {
                break;
            }
            if checked.contains(replica_id) {
                continue;
            }
            let Some(&r) = candidate_map.get(replica_id) else {
                continue;
            };
            checked.insert(replica_id.clone());

            let load = loads.get(replica_id).copied().unwrap_or(0);
            if (load as f64 + 1.0) <= threshold {
                debug!(%replica_id, load, threshold, "ChwblRouter: under threshold");
                under.push(r.clone());
            } else {
                debug!(%replica_id, load, threshold, "ChwblRouter: over threshold");
                over.push(r.clone());
            }
        }

        // Candidates never encountered on the ring (step 7): appended after
        // the ring-discovered over-threshold group so the ring order among
        // under-threshold candidates (P5) is never disturbed.
        for (id, r) in candidate_map.iter() {
            if !checked.contains(id) {
                over.push((*r).clone());
            }
        }

        let mut result = Vec::with_capacity(2);
        if !under.is_empty() {
            result.push(under);
        }
        if !over.is_empty() {
            result.push(over);
        }
        // Every candidate appears in exactly one group (step 9's default
        // guarantee falls out for free: if `under` is empty, `over`'s first
        // entry, still in ring order, is that default).
        result
    }

    fn on_replica_actor_died(&self, id: &ReplicaId) {
        let mut state = self.state.lock();
        state.ring.remove_replica(id);
        state.replicas.remove(id);
        warn!(%id, "ChwblRouter: replica died");
    }

    fn on_replica_actor_unavailable(&self, id: &ReplicaId) {
        let mut state = self.state.lock();
        state.queue_len.invalidate(id);
        warn!(%id, "ChwblRouter: replica unavailable, invalidated load cache");
    }

    fn on_new_queue_len_info(&self, id: &ReplicaId, n: u32) {
        let now = self.time_provider.now();
        let mut state = self.state.lock();
        state.queue_len.update(id.clone(), n, now);
    }

    fn on_request_completed(&self, id: &ReplicaId) {
        let now = self.time_provider.now();
        let mut state = self.state.lock();
        if !state.queue_len.decrement(id, now) {
            debug!(%id, "ChwblRouter: completion for replica with no cached load");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock::{MockProvider, Time};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq)]
    struct TestReplica(ReplicaId);
    impl ReplicaHandle for TestReplica {
        fn replica_id(&self) -> &ReplicaId {
            &self.0
        }
    }

    fn replica(name: &str) -> TestReplica {
        TestReplica(ReplicaId::new(name))
    }

    fn router() -> ChwblRouter<TestReplica> {
        ChwblRouter::new(
            RouterConfig::default(),
            Arc::new(MockProvider::new(Time::from_timestamp_nanos(0))),
        )
    }

    #[test]
    fn empty_candidates_yields_empty_group() {
        let r = router();
        let result = ReplicaRouter::choose_replicas(&r, &[], None);
        assert_eq!(result, vec![Vec::<TestReplica>::new()]);
    }

    #[test]
    fn no_ring_state_returns_candidates_as_single_group() {
        let r = router();
        let cands = vec![replica("a"), replica("b")];
        let pending = PendingRequest::new(json!({"messages": []}), "req-1");
        let result = ReplicaRouter::choose_replicas(&r, &cands, Some(&pending));
        assert_eq!(result, vec![cands]);
    }

    // S6
    #[test]
    fn single_replica_always_returned_regardless_of_load() {
        let r = router();
        let a = replica("a");
        ReplicaRouter::update_replicas(&r, &[a.clone()]);
        // Push load far above any sane threshold.
        for _ in 0..50 {
            ReplicaRouter::on_new_queue_len_info(&r, a.replica_id(), 1000);
        }
        let pending = PendingRequest::new(
            json!({"messages": [{"role": "user", "content": "hi"}]}),
            "req-1",
        );
        let result = ReplicaRouter::choose_replicas(&r, &[a.clone()], Some(&pending));
        assert_eq!(result, vec![vec![a]]);
    }

    // P1
    #[test]
    fn choose_replicas_is_deterministic() {
        let r = router();
        let cands = vec![replica("a"), replica("b"), replica("c")];
        ReplicaRouter::update_replicas(&r, &cands);
        let pending = PendingRequest::new(
            json!({"messages": [{"role": "user", "content": "same conversation"}]}),
            "req-1",
        );
        let first = ReplicaRouter::choose_replicas(&r, &cands, Some(&pending));
        let second = ReplicaRouter::choose_replicas(&r, &cands, Some(&pending));
        assert_eq!(first, second);
    }

    // S5 / P5
    #[test]
    fn skewed_load_demotes_overloaded_replica() {
        let r = router();
        let cands = vec![replica("a"), replica("b"), replica("c")];
        ReplicaRouter::update_replicas(&r, &cands);

        // Find a payload whose cache key hashes to a point whose first ring
        // match is replica "a", then load "a" up heavily.
        let mut chosen_payload = None;
        for i in 0..500 {
            let payload = json!({"messages": [{"role": "user", "content": format!("msg-{i}")}]});
            let pending = PendingRequest::new(payload.clone(), "probe");
            let res = ReplicaRouter::choose_replicas(&r, &cands, Some(&pending));
            if res[0][0] == replica("a") {
                chosen_payload = Some(payload);
                break;
            }
        }
        let payload = chosen_payload.expect("some payload should hash to replica a first");

        ReplicaRouter::on_new_queue_len_info(&r, &ReplicaId::new("a"), 10);
        let pending = PendingRequest::new(payload, "req-1");
        let result = ReplicaRouter::choose_replicas(&r, &cands, Some(&pending));

        // "a" must not be the first *under-threshold* element.
        let under = &result[0];
        assert!(
            under.is_empty() || under[0] != replica("a"),
            "overloaded replica 'a' should not be the first under-threshold pick"
        );
    }

    #[test]
    fn removed_replica_is_skipped_on_walk() {
        let r = router();
        let cands = vec![replica("a"), replica("b")];
        ReplicaRouter::update_replicas(&r, &cands);
        ReplicaRouter::on_replica_actor_died(&r, &ReplicaId::new("a"));

        let remaining = vec![replica("b")];
        let pending = PendingRequest::new(
            json!({"messages": [{"role": "user", "content": "hi"}]}),
            "req-1",
        );
        let result = ReplicaRouter::choose_replicas(&r, &remaining, Some(&pending));
        let all: Vec<&TestReplica> = result.iter().flatten().collect();
        assert_eq!(all, vec![&replica("b")]);
    }

    // P6
    #[test]
    fn on_request_completed_clamps_at_zero() {
        let r = router();
        let a = replica("a");
        ReplicaRouter::update_replicas(&r, &[a.clone()]);
        ReplicaRouter::on_new_queue_len_info(&r, a.replica_id(), 0);
        ReplicaRouter::on_request_completed(&r, a.replica_id());
        // No panic, and the cached value stays at zero.
        let state = r.state.lock();
        assert_eq!(state.queue_len.get(a.replica_id(), Time::from_timestamp_nanos(0)), Some(0));
    }

    #[test]
    fn unavailable_invalidates_cache_without_removing_from_ring() {
        let r = router();
        let a = replica("a");
        ReplicaRouter::update_replicas(&r, &[a.clone()]);
        ReplicaRouter::on_new_queue_len_info(&r, a.replica_id(), 7);
        ReplicaRouter::on_replica_actor_unavailable(&r, a.replica_id());

        let state = r.state.lock();
        assert_eq!(state.queue_len.get(a.replica_id(), Time::from_timestamp_nanos(0)), None);
        assert!(state.replicas.contains_key(a.replica_id()));
    }
}
