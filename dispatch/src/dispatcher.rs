use std::collections::HashMap;
use std::sync::Arc;

use clock::TimeProvider;
use engine_pool::{PoolError, RerankRequest, RerankResponse};
use observability_deps::tracing::{debug, warn};
use parking_lot::Mutex;
use replica_router::{PendingRequest, ReplicaHandle, ReplicaId, ReplicaRouter, RouterConfig, RouterKind, RouterPolicy};

use crate::error::DispatchError;
use crate::request_kind::RequestKind;
use crate::target::DispatchTarget;

/// Ties a [`replica_router::ReplicaRouter`] to a set of serving targets
/// (spec.md §2's "glue / dispatch front-end" row): accepts a payload, asks
/// the router which replicas to try and in what order, calls each in turn,
/// and reports outcomes back to the router.
#[derive(Debug)]
pub struct Dispatcher<R: DispatchTarget> {
    router: RouterPolicy<R>,
    replicas: Mutex<HashMap<ReplicaId, R>>,
}

impl<R: DispatchTarget> Dispatcher<R> {
    /// Build a dispatcher running `kind`'s routing policy, with no replicas
    /// registered yet.
    pub fn new(kind: RouterKind, config: RouterConfig, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            router: RouterPolicy::new(kind, config, time_provider),
            replicas: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or replace) a serving target and reconcile the router's ring.
    pub fn register_replica(&self, replica: R) {
        let current = {
            let mut replicas = self.replicas.lock();
            replicas.insert(replica.replica_id().clone(), replica);
            replicas.values().cloned().collect::<Vec<_>>()
        };
        self.router.update_replicas(&current);
    }

    /// Remove a replica that has died: drop it from the ring and routing state.
    pub fn remove_replica(&self, id: &ReplicaId) {
        let current = {
            let mut replicas = self.replicas.lock();
            replicas.remove(id);
            replicas.values().cloned().collect::<Vec<_>>()
        };
        self.router.update_replicas(&current);
        self.router.on_replica_actor_died(id);
    }

    /// Mark a replica as temporarily unavailable (soft demotion, not removal).
    pub fn mark_replica_unavailable(&self, id: &ReplicaId) {
        self.router.on_replica_actor_unavailable(id);
    }

    /// Record a fresh queue-length observation for `id`.
    pub fn report_queue_len(&self, id: &ReplicaId, n: u32) {
        self.router.on_new_queue_len_info(id, n);
    }

    /// Run a generation request (spec.md §6 `generate`).
    pub async fn generate(
        &self,
        payload: serde_json::Value,
        request_id: impl Into<String>,
    ) -> Result<serde_json::Value, DispatchError> {
        if !payload.is_object() {
            return Err(DispatchError::invalid_request("payload must be a JSON object"));
        }
        let pending = PendingRequest::new(payload.clone(), request_id);
        self.try_replicas(RequestKind::Generate, &pending, move |replica| {
            let payload = payload.clone();
            async move { replica.generate(payload).await }
        })
        .await
    }

    /// Run an embeddings request (spec.md §6 `generate_embeddings`).
    pub async fn generate_embeddings(
        &self,
        payload: serde_json::Value,
        request_id: impl Into<String>,
    ) -> Result<serde_json::Value, DispatchError> {
        if !payload.is_object() {
            return Err(DispatchError::invalid_request("payload must be a JSON object"));
        }
        let pending = PendingRequest::new(payload.clone(), request_id);
        self.try_replicas(RequestKind::Embeddings, &pending, move |replica| {
            let payload = payload.clone();
            async move { replica.generate_embeddings(payload).await }
        })
        .await
    }

    /// Run a rerank request (spec.md §6 `rerank`).
    pub async fn rerank(
        &self,
        request: RerankRequest,
        request_id: impl Into<String>,
    ) -> Result<RerankResponse, DispatchError> {
        if request.query.is_empty() || request.documents.is_empty() {
            return Err(DispatchError::invalid_request("rerank requires a query and at least one document"));
        }
        // Rerank payloads aren't chat-shaped, so the cache-key extractor
        // falls back to this object's repr; routing is still deterministic
        // per (query, documents), just without conversation affinity.
        let surrogate = serde_json::json!({ "rerank_query": request.query });
        let pending = PendingRequest::new(surrogate, request_id);
        self.try_replicas(RequestKind::Rerank, &pending, move |replica| {
            let request = request.clone();
            async move { replica.rerank(request).await }
        })
        .await
    }

    /// The model(s) served by the first known replica, or an empty list if
    /// none are registered yet (spec.md §6 `show_available_models`).
    pub fn show_available_models(&self) -> serde_json::Value {
        let replicas = self.replicas.lock();
        match replicas.values().next() {
            Some(replica) => replica.show_available_models(),
            None => serde_json::json!({ "object": "list", "data": [] }),
        }
    }

    /// Aggregate readiness across every known replica (spec.md §6 `check_health`).
    pub fn check_health(&self) -> serde_json::Value {
        let replicas = self.replicas.lock();
        let per_replica: HashMap<String, serde_json::Value> = replicas
            .iter()
            .map(|(id, r)| (id.as_str().to_string(), r.check_health()))
            .collect();
        let ready = per_replica.values().any(|h| h.get("ready").and_then(|v| v.as_bool()).unwrap_or(false));
        serde_json::json!({
            "status": if ready { "ok" } else { "not_ready" },
            "ready": ready,
            "instances": per_replica,
        })
    }

    /// Per-replica detail (spec.md §6 `get_stats`).
    pub fn get_stats(&self) -> serde_json::Value {
        let replicas = self.replicas.lock();
        let per_replica: HashMap<String, serde_json::Value> =
            replicas.iter().map(|(id, r)| (id.as_str().to_string(), r.get_stats())).collect();
        serde_json::json!(per_replica)
    }

    async fn try_replicas<F, Fut, T>(&self, kind: RequestKind, pending: &PendingRequest, call: F) -> Result<T, DispatchError>
    where
        F: Fn(R) -> Fut,
        Fut: std::future::Future<Output = Result<T, PoolError>>,
    {
        let candidates: Vec<R> = self.replicas.lock().values().cloned().collect();
        if candidates.is_empty() {
            return Err(DispatchError::service_unavailable("no replicas registered"));
        }

        let groups = self.router.choose_replicas(&candidates, Some(pending));
        let mut last_err: Option<DispatchError> = None;

        for group in &groups {
            for replica in group {
                debug!(kind = kind.label(), replica = %replica.replica_id(), "dispatch: trying replica");
                match call(replica.clone()).await {
                    Ok(value) => {
                        self.router.on_request_completed(replica.replica_id());
                        return Ok(value);
                    }
                    Err(e) => {
                        warn!(kind = kind.label(), replica = %replica.replica_id(), error = %e, "dispatch: replica call failed");
                        if matches!(e, PoolError::ServiceUnavailable(_)) {
                            self.router.on_replica_actor_unavailable(replica.replica_id());
                        }
                        last_err = Some(e.into());
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| DispatchError::service_unavailable("no replica satisfied the request")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use clock::{MockProvider, Time};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Clone)]
    struct FakeReplica {
        id: ReplicaId,
        fail: Arc<AtomicBool>,
    }

    impl ReplicaHandle for FakeReplica {
        fn replica_id(&self) -> &ReplicaId {
            &self.id
        }
    }

    #[async_trait]
    impl DispatchTarget for FakeReplica {
        async fn generate(&self, payload: serde_json::Value) -> Result<serde_json::Value, PoolError> {
            if self.fail.load(Ordering::SeqCst) {
                Err(PoolError::ServiceUnavailable("offline".to_string()))
            } else {
                Ok(payload)
            }
        }

        async fn generate_embeddings(&self, payload: serde_json::Value) -> Result<serde_json::Value, PoolError> {
            Ok(payload)
        }

        async fn rerank(&self, request: RerankRequest) -> Result<RerankResponse, PoolError> {
            Ok(RerankResponse {
                results: request
                    .documents
                    .iter()
                    .enumerate()
                    .map(|(index, _)| engine_pool::RerankResult {
                        index,
                        relevance_score: 1.0,
                    })
                    .collect(),
            })
        }

        fn show_available_models(&self) -> serde_json::Value {
            serde_json::json!({ "object": "list", "data": [{"id": self.id.as_str()}] })
        }

        fn check_health(&self) -> serde_json::Value {
            serde_json::json!({ "ready": !self.fail.load(Ordering::SeqCst) })
        }

        fn get_stats(&self) -> serde_json::Value {
            serde_json::json!({})
        }
    }

    fn dispatcher() -> Dispatcher<FakeReplica> {
        Dispatcher::new(
            RouterKind::StaticHash,
            RouterConfig::default(),
            Arc::new(MockProvider::new(Time::from_timestamp_nanos(0))),
        )
    }

    #[tokio::test]
    async fn generate_routes_to_the_only_replica() {
        let d = dispatcher();
        d.register_replica(FakeReplica {
            id: ReplicaId::new("a"),
            fail: Arc::new(AtomicBool::new(false)),
        });

        let result = d.generate(serde_json::json!({"hello": "world"}), "req-1").await.unwrap();
        assert_eq!(result, serde_json::json!({"hello": "world"}));
    }

    #[tokio::test]
    async fn non_object_payload_is_rejected() {
        let d = dispatcher();
        d.register_replica(FakeReplica {
            id: ReplicaId::new("a"),
            fail: Arc::new(AtomicBool::new(false)),
        });

        let err = d.generate(serde_json::json!("not an object"), "req-1").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn no_replicas_is_service_unavailable() {
        let d = dispatcher();
        let err = d.generate(serde_json::json!({}), "req-1").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ServiceUnavailable);
    }

    #[tokio::test]
    async fn rerank_rejects_empty_documents() {
        let d = dispatcher();
        let err = d
            .rerank(
                RerankRequest {
                    query: "q".to_string(),
                    documents: vec![],
                    top_n: None,
                },
                "req-1",
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn rerank_scores_every_document() {
        let d = dispatcher();
        d.register_replica(FakeReplica {
            id: ReplicaId::new("a"),
            fail: Arc::new(AtomicBool::new(false)),
        });

        let response = d
            .rerank(
                RerankRequest {
                    query: "q".to_string(),
                    documents: vec!["a".to_string(), "b".to_string()],
                    top_n: None,
                },
                "req-1",
            )
            .await
            .unwrap();
        assert_eq!(response.results.len(), 2);
    }
}
