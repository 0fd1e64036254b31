use async_trait::async_trait;
use engine_pool::{PoolError, PoolManager, RerankRequest, RerankResponse};
use replica_router::ReplicaHandle;

/// What the dispatch front-end needs from a routable serving target, beyond
/// [`ReplicaHandle`]'s bare identity.
///
/// Kept as a trait (rather than depending on `engine_pool::PoolManager`
/// directly) so the router ↔ dispatcher ↔ pool-manager dependency stays
/// one-way (spec.md §9 "cyclic graph"): `dispatch` is the only crate that
/// knows both `replica_router` and `engine_pool` exist.
#[async_trait]
pub trait DispatchTarget: ReplicaHandle {
    /// See [`PoolManager::generate`].
    async fn generate(&self, payload: serde_json::Value) -> Result<serde_json::Value, PoolError>;
    /// See [`PoolManager::generate_embeddings`].
    async fn generate_embeddings(&self, payload: serde_json::Value) -> Result<serde_json::Value, PoolError>;
    /// See [`PoolManager::rerank`].
    async fn rerank(&self, request: RerankRequest) -> Result<RerankResponse, PoolError>;
    /// See [`PoolManager::show_available_models`], pre-serialized.
    fn show_available_models(&self) -> serde_json::Value;
    /// See [`PoolManager::check_health`], pre-serialized.
    fn check_health(&self) -> serde_json::Value;
    /// See [`PoolManager::get_stats`], pre-serialized.
    fn get_stats(&self) -> serde_json::Value;
}

#[async_trait]
impl DispatchTarget for PoolManager {
    async fn generate(&self, payload: serde_json::Value) -> Result<serde_json::Value, PoolError> {
        PoolManager::generate(self, payload).await
    }

    async fn generate_embeddings(&self, payload: serde_json::Value) -> Result<serde_json::Value, PoolError> {
        PoolManager::generate_embeddings(self, payload).await
    }

    async fn rerank(&self, request: RerankRequest) -> Result<RerankResponse, PoolError> {
        PoolManager::rerank(self, request).await
    }

    fn show_available_models(&self) -> serde_json::Value {
        serde_json::to_value(PoolManager::show_available_models(self)).expect("ModelListResponse is always serializable")
    }

    fn check_health(&self) -> serde_json::Value {
        serde_json::to_value(PoolManager::check_health(self)).expect("HealthStatus is always serializable")
    }

    fn get_stats(&self) -> serde_json::Value {
        serde_json::to_value(PoolManager::get_stats(self)).expect("PoolStats is always serializable")
    }
}
