use async_trait::async_trait;
use clock::Time;
use replica_router::ReplicaId;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::error::PoolError;
use crate::stage::Stage;

/// A single scored document, as produced by [`EngineRuntime::rerank`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RerankResult {
    /// Index of the document in the original `documents` list.
    pub index: usize,
    /// The relevance score assigned by the engine, descending order in the response.
    pub relevance_score: f64,
}

/// A rerank request: a query scored against a list of candidate documents
/// (supplemented from the original's score-every-document-then-sort-by-`top_n`
/// shape; spec.md names `rerank` as an interface operation but leaves its
/// payload shape to the implementer).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RerankRequest {
    /// The query text.
    pub query: String,
    /// Candidate documents to score against `query`.
    pub documents: Vec<String>,
    /// If set, only the top `top_n` results (by descending score) are returned.
    pub top_n: Option<usize>,
}

/// The response to a [`RerankRequest`]: results sorted descending by score,
/// truncated to `top_n` if requested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RerankResponse {
    /// Scored results, descending by `relevance_score`.
    pub results: Vec<RerankResult>,
}

/// The contract an embedded inference engine must satisfy.
///
/// Everything else about the engine (tensor math, batching, tokenization) is
/// external (spec.md §1); [`crate::pool_manager::PoolManager`] depends only on
/// this trait, so recycle/activate logic never needs to know what kind of
/// model is behind it.
#[async_trait]
pub trait EngineRuntime: Debug + Send + Sync + 'static {
    /// Construct the tokenizer/preprocessor. Must not allocate GPU memory.
    async fn init_stage1(&self) -> Result<(), PoolError>;

    /// Load model weights and construct serving components.
    async fn init_stage2(&self) -> Result<(), PoolError>;

    /// Tear down model executor and background loops, release GPU memory.
    async fn shutdown(&self);

    /// Run a text/chat generation request.
    async fn generate(&self, payload: serde_json::Value) -> Result<serde_json::Value, PoolError>;

    /// Run an embeddings request.
    async fn embed(&self, payload: serde_json::Value) -> Result<serde_json::Value, PoolError>;

    /// Run a rerank request.
    async fn rerank(&self, request: RerankRequest) -> Result<RerankResponse, PoolError>;
}

/// Builds fresh [`EngineRuntime`] instances from fixed, boot-time engine-args
/// (spec.md §4.7 "per-model engine-args (built once at boot)").
///
/// [`crate::pool_manager::PoolManager`] holds one factory and calls
/// [`EngineFactory::build`] once per spawned engine — at bootstrap, and again
/// whenever recycling needs a replacement standby.
pub trait EngineFactory: Debug + Send + Sync + 'static {
    /// Construct a new, `Uninitialized` runtime instance.
    fn build(&self) -> std::sync::Arc<dyn EngineRuntime>;
}

/// Lifecycle timestamps and counters tracked for one engine (spec.md §3).
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    /// When the engine reached `Stage1Ready`.
    pub stage1_ready_at: Option<Time>,
    /// When the engine reached `Stage2Active`.
    pub stage2_active_at: Option<Time>,
    /// When the engine entered `Stage2Cooldown`.
    pub cooldown_start_at: Option<Time>,
    /// Total requests served since construction.
    pub total_requests: u64,
    /// The most recent request dispatch time, if any.
    pub last_request_at: Option<Time>,
}

impl EngineMetrics {
    /// The instant cooldown eligibility is measured from: the later of the
    /// last request and the activation time, so an engine that reached
    /// `Stage2Active` but never served a request still waits a full
    /// `cooldown_delay` from activation (spec.md §4.7).
    pub fn cooldown_clock_start(&self) -> Option<Time> {
        match (self.last_request_at, self.stage2_active_at) {
            (Some(last), Some(active)) => Some(if last.timestamp_nanos() > active.timestamp_nanos() {
                last
            } else {
                active
            }),
            (Some(last), None) => Some(last),
            (None, Some(active)) => Some(active),
            (None, None) => None,
        }
    }
}

/// One staged engine instance: lifecycle state plus the runtime it wraps.
#[derive(Debug)]
pub struct Engine {
    /// This engine's stable identity within the pool.
    pub id: ReplicaId,
    /// The inference-engine contract this instance drives.
    pub runtime: std::sync::Arc<dyn EngineRuntime>,
    /// Current lifecycle stage.
    pub stage: Stage,
    /// The GPU slot this engine occupies, once allocated.
    pub gpu_id: Option<usize>,
    /// In-flight request count; a dispatch target only while this is tracked
    /// by the pool manager's guard.
    pub active_requests: u32,
    /// Lifecycle timestamps and counters.
    pub metrics: EngineMetrics,
}

impl Engine {
    /// Construct a new engine, `Uninitialized`, with no GPU slot.
    pub fn new(id: ReplicaId, runtime: std::sync::Arc<dyn EngineRuntime>) -> Self {
        Self {
            id,
            runtime,
            stage: Stage::Uninitialized,
            gpu_id: None,
            active_requests: 0,
            metrics: EngineMetrics::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock::Time;

    #[test]
    fn cooldown_clock_prefers_the_later_timestamp() {
        let mut m = EngineMetrics {
            stage2_active_at: Some(Time::from_timestamp_nanos(10)),
            last_request_at: Some(Time::from_timestamp_nanos(5)),
            ..Default::default()
        };
        assert_eq!(m.cooldown_clock_start(), Some(Time::from_timestamp_nanos(10)));

        m.last_request_at = Some(Time::from_timestamp_nanos(20));
        assert_eq!(m.cooldown_clock_start(), Some(Time::from_timestamp_nanos(20)));
    }

    #[test]
    fn cooldown_clock_is_none_before_activation() {
        assert_eq!(EngineMetrics::default().cooldown_clock_start(), None);
    }
}
