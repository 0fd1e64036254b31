use std::fmt::Debug;

use crate::replica::{PendingRequest, ReplicaHandle, ReplicaId};

/// The router interface consumed by the dispatch front-end (spec.md §6).
///
/// Every method is infallible: routine conditions (empty candidates, no
/// pending request, a single replica, every replica over threshold) are
/// expressed in the return value, never as an error (spec.md §7
/// "Propagation policy": "router never raises for routine conditions").
pub trait ReplicaRouter<R: ReplicaHandle>: Debug + Send + Sync {
    /// Reconcile routing state with the current replica set.
    ///
    /// Readers observe either the old or the new state, never a
    /// half-modified one (spec.md §5).
    fn update_replicas(&self, replicas: &[R]);

    /// Choose a priority-ordered list of candidate groups for `pending`.
    ///
    /// Each inner `Vec` holds replicas of equal priority; the dispatcher
    /// tries groups in order, and within a group may try members in any
    /// order. An empty outer `Vec` (`vec![]`) never occurs; an empty
    /// candidate set yields `vec![vec![]]`.
    fn choose_replicas(&self, candidates: &[R], pending: Option<&PendingRequest>) -> Vec<Vec<R>>;

    /// A replica has died: remove it from routing state entirely.
    fn on_replica_actor_died(&self, id: &ReplicaId);

    /// A replica is temporarily unavailable: invalidate its load cache entry
    /// but keep it in routing state (soft demotion, not removal).
    fn on_replica_actor_unavailable(&self, id: &ReplicaId);

    /// Record a fresh queue-length observation for `id`.
    fn on_new_queue_len_info(&self, id: &ReplicaId, n: u32);

    /// A request against `id` completed: decrement its cached load.
    fn on_request_completed(&self, id: &ReplicaId);
}
