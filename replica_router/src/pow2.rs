use std::sync::Arc;

use clock::TimeProvider;
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use rand::seq::index::sample;
use rand::thread_rng;

use crate::config::RouterConfig;
use crate::queue_len_cache::QueueLenCache;
use crate::replica::{PendingRequest, ReplicaHandle, ReplicaId};
use crate::router::ReplicaRouter;

/// The pre-existing default policy (spec.md §1: "power-of-two-choices
/// (default, delegated)"). Not one of this subsystem's hard parts — the
/// original defers entirely to Ray Serve's built-in scheduler. This is the
/// textbook "power of two choices" algorithm: sample two candidates at
/// random and keep the less-loaded one, so `RouterPolicy` (spec.md §4)
/// never has to match on an unimplemented variant.
#[derive(Debug)]
pub struct Pow2Router {
    time_provider: Arc<dyn TimeProvider>,
    cache: Mutex<QueueLenCache>,
    known_replicas: Mutex<Vec<ReplicaId>>,
}

impl Pow2Router {
    /// Build a new power-of-two-choices router.
    pub fn new(config: RouterConfig, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            time_provider,
            cache: Mutex::new(QueueLenCache::new(config.queue_len_staleness)),
            known_replicas: Mutex::new(Vec::new()),
        }
    }
}

impl<R: ReplicaHandle> ReplicaRouter<R> for Pow2Router {
    fn update_replicas(&self, replicas: &[R]) {
        let ids: Vec<ReplicaId> = replicas.iter().map(|r| r.replica_id().clone()).collect();
        info!(total = ids.len(), "Pow2Router: updated replicas");
        *self.known_replicas.lock() = ids;
    }

    fn choose_replicas(&self, candidates: &[R], pending: Option<&PendingRequest>) -> Vec<Vec<R>> {
        if candidates.is_empty() {
            warn!("Pow2Router: no candidate replicas available");
            return vec![vec![]];
        }
        if pending.is_none() {
            return vec![candidates.to_vec()];
        }
        if candidates.len() == 1 {
            return vec![vec![candidates[0].clone()]];
        }

        let now = self.time_provider.now();
        let cache = self.cache.lock();
        let load_of = |r: &R| cache.get(r.replica_id(), now).unwrap_or(0);

        let picks = sample(&mut thread_rng(), candidates.len(), 2).into_vec();
        let (i, j) = (picks[0], picks[1]);
        let (winner_idx, loser_idx) = if load_of(&candidates[i]) <= load_of(&candidates[j]) {
            (i, j)
        } else {
            (j, i)
        };

        debug!(
            winner = %candidates[winner_idx].replica_id(),
            loser = %candidates[loser_idx].replica_id(),
            "Pow2Router: sampled two candidates"
        );

        let mut rest = Vec::with_capacity(candidates.len() - 1);
        for (idx, r) in candidates.iter().enumerate() {
            if idx != winner_idx {
                rest.push(r.clone());
            }
        }

        vec![vec![candidates[winner_idx].clone()], rest]
    }

    fn on_replica_actor_died(&self, id: &ReplicaId) {
        self.known_replicas.lock().retain(|r| r != id);
        self.cache.lock().invalidate(id);
        warn!(%id, "Pow2Router: replica died");
    }

    fn on_replica_actor_unavailable(&self, id: &ReplicaId) {
        self.cache.lock().invalidate(id);
        warn!(%id, "Pow2Router: replica unavailable");
    }

    fn on_new_queue_len_info(&self, id: &ReplicaId, n: u32) {
        let now = self.time_provider.now();
        self.cache.lock().update(id.clone(), n, now);
    }

    fn on_request_completed(&self, id: &ReplicaId) {
        let now = self.time_provider.now();
        if !self.cache.lock().decrement(id, now) {
            debug!(%id, "Pow2Router: completion for replica with no cached load");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock::{MockProvider, Time};

    #[derive(Debug, Clone)]
    struct TestReplica(ReplicaId);
    impl ReplicaHandle for TestReplica {
        fn replica_id(&self) -> &ReplicaId {
            &self.0
        }
    }

    fn router() -> Pow2Router {
        Pow2Router::new(
            RouterConfig::default(),
            Arc::new(MockProvider::new(Time::from_timestamp_nanos(0))),
        )
    }

    #[test]
    fn single_candidate_is_always_chosen() {
        let r = router();
        let a = TestReplica(ReplicaId::new("a"));
        let pending = PendingRequest::new(serde_json::json!({}), "req-1");
        let result = ReplicaRouter::choose_replicas(&r, &[a.clone()], Some(&pending));
        assert_eq!(result, vec![vec![a]]);
    }

    #[test]
    fn picks_the_less_loaded_of_two() {
        let r = router();
        let a = TestReplica(ReplicaId::new("a"));
        let b = TestReplica(ReplicaId::new("b"));
        ReplicaRouter::on_new_queue_len_info(&r, a.replica_id(), 100);
        ReplicaRouter::on_new_queue_len_info(&r, b.replica_id(), 0);

        let pending = PendingRequest::new(serde_json::json!({}), "req-1");
        for _ in 0..20 {
            let result = ReplicaRouter::choose_replicas(&r, &[a.clone(), b.clone()], Some(&pending));
            assert_eq!(result[0][0].replica_id(), b.replica_id());
        }
    }
}
