use std::collections::BTreeMap;
use std::sync::Arc;

use clock::TimeProvider;
use hashbrown::{HashMap, HashSet};
use metric::{Attributes, Registry, U64Counter, U64Gauge};
use observability_deps::tracing::{info, warn};
use parking_lot::Mutex;
use replica_router::ReplicaId;
use serde::Serialize;

use crate::config::PoolManagerConfig;
use crate::engine::{Engine, EngineFactory, EngineRuntime, RerankRequest, RerankResponse};
use crate::error::PoolError;
use crate::gpu_slots::GpuSlots;
use crate::stage::Stage;

struct PoolState {
    instances: HashMap<ReplicaId, Engine>,
    slots: GpuSlots,
    next_id: u64,
}

struct PoolMetrics {
    activations: U64Counter,
    activation_failures: U64Counter,
    recycles: U64Counter,
    active_instances: U64Gauge,
}

impl PoolMetrics {
    fn new(registry: &Registry) -> Self {
        Self {
            activations: registry
                .register_metric::<U64Counter>("engine_pool_activations", "stage1->stage2 activations")
                .recorder(Attributes::new()),
            activation_failures: registry
                .register_metric::<U64Counter>("engine_pool_activation_failures", "failed stage1->stage2 activations")
                .recorder(Attributes::new()),
            recycles: registry
                .register_metric::<U64Counter>("engine_pool_recycles", "engine recycle operations")
                .recorder(Attributes::new()),
            active_instances: registry
                .register_metric::<U64Gauge>("engine_pool_active_instances", "engines currently in Stage2Active")
                .recorder(Attributes::new()),
        }
    }
}

struct Inner {
    model_id: String,
    node_id: ReplicaId,
    created_at: clock::Time,
    config: PoolManagerConfig,
    time_provider: Arc<dyn TimeProvider>,
    factory: Arc<dyn EngineFactory>,
    state: Mutex<PoolState>,
    metrics: PoolMetrics,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("model_id", &self.model_id)
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish()
    }
}

/// Owns a set of staged engines on a fixed number of GPU slots and drives
/// their lifecycle, GPU-slot accounting, and request dispatch (spec.md §4.7).
///
/// Implements [`replica_router::ReplicaHandle`] so that a `dispatch`
/// front-end fronting several `PoolManager`s (one per cluster node, say) can
/// treat each as a router-visible replica for conversation-affinity routing
/// across nodes, while internally each `PoolManager` performs its own
/// stage-preference engine selection across the engines it owns.
#[derive(Debug, Clone)]
pub struct PoolManager {
    inner: Arc<Inner>,
}

/// A single model entry as returned by [`PoolManager::show_available_models`].
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    /// The model identifier.
    pub id: String,
    /// Always `"model"`.
    pub object: &'static str,
    /// Unix timestamp of pool-manager construction.
    pub created: i64,
    /// Always `"engine_pool"`; there is no external model registry here.
    pub owned_by: &'static str,
}

/// The response to [`PoolManager::show_available_models`].
#[derive(Debug, Clone, Serialize)]
pub struct ModelListResponse {
    /// Always `"list"`.
    pub object: &'static str,
    /// The (single-element, in this design) list of served models.
    pub data: Vec<ModelInfo>,
}

/// The response to [`PoolManager::check_health`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// A short human-readable status string.
    pub status: String,
    /// Whether at least one engine can currently serve a request.
    pub ready: bool,
    /// Total tracked engine instances, any stage.
    pub instances: usize,
}

/// Per-engine detail within [`PoolStats`].
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStats {
    /// The engine's current lifecycle stage.
    pub stage: String,
    /// GPU slot index, if allocated.
    pub gpu_id: Option<usize>,
    /// When the engine reached `Stage1Ready`, RFC3339.
    pub stage1_time: Option<String>,
    /// When the engine reached `Stage2Active`, RFC3339.
    pub stage2_time: Option<String>,
    /// Total requests served.
    pub total_requests: u64,
    /// Requests currently in flight.
    pub active_requests: u32,
}

/// The response to [`PoolManager::get_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Engines in `Stage2Active`.
    pub active_instances: usize,
    /// Engines in `Stage1Ready`.
    pub stage1_ready_instances: usize,
    /// Engines in `Stage2Cooldown`.
    pub cooldown_instances: usize,
    /// GPU slots with no owner at all.
    pub available_gpus: usize,
    /// Mean seconds from `Stage1Ready` to `Stage2Active`, across engines that
    /// have completed activation. Zero if none have.
    pub avg_activation_time_secs: f64,
    /// Configured cooldown delay, seconds.
    pub cooldown_delay_secs: f64,
    /// Configured recycle delay, seconds.
    pub recycle_delay_secs: f64,
    /// Per-engine detail, keyed by replica id.
    pub instances: BTreeMap<String, InstanceStats>,
}

/// Decrements an engine's `active_requests` on every exit path — success,
/// error, or the future being dropped under cancellation (teacher idiom:
/// `tracker::TrackedFutureExt`'s always-runs-on-drop bookkeeping).
struct ActiveRequestGuard {
    inner: Arc<Inner>,
    id: ReplicaId,
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if let Some(engine) = state.instances.get_mut(&self.id) {
            engine.active_requests = engine.active_requests.saturating_sub(1);
        }
    }
}

enum Pick {
    Ready(ReplicaId),
    Stage1(ReplicaId),
    None,
}

fn pick_engine(instances: &HashMap<ReplicaId, Engine>) -> Pick {
    if let Some((id, _)) = instances
        .iter()
        .filter(|(_, e)| e.stage == Stage::Stage2Active)
        .min_by_key(|(_, e)| e.active_requests)
    {
        return Pick::Ready(id.clone());
    }
    if let Some((id, _)) = instances
        .iter()
        .filter(|(_, e)| e.stage == Stage::Stage2Cooldown)
        .min_by_key(|(_, e)| e.active_requests)
    {
        return Pick::Ready(id.clone());
    }
    if let Some((id, _)) = instances.iter().find(|(_, e)| e.stage == Stage::Stage1Ready) {
        return Pick::Stage1(id.clone());
    }
    Pick::None
}

impl PoolManager {
    /// Construct an empty pool manager. Call [`PoolManager::bootstrap`] to
    /// populate it with `config.total_slots` stage1-ready engines.
    pub fn new(
        model_id: impl Into<String>,
        node_id: ReplicaId,
        config: PoolManagerConfig,
        time_provider: Arc<dyn TimeProvider>,
        metrics: &Registry,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        let created_at = time_provider.now();
        let total_slots = config.total_slots;
        Self {
            inner: Arc::new(Inner {
                model_id: model_id.into(),
                node_id,
                created_at,
                config,
                time_provider,
                factory,
                state: Mutex::new(PoolState {
                    instances: HashMap::new(),
                    slots: GpuSlots::new(total_slots),
                    next_id: 0,
                }),
                metrics: PoolMetrics::new(metrics),
            }),
        }
    }

    /// Spawn one stage1-ready engine per configured slot.
    pub async fn bootstrap(&self) -> Result<(), PoolError> {
        for _ in 0..self.inner.config.total_slots {
            self.spawn_engine(self.inner.factory.build()).await?;
        }
        Ok(())
    }

    /// Create a new engine, allocate it a GPU slot (sharing a cooldown
    /// engine's slot if no unowned slot remains), and drive it to
    /// `Stage1Ready`.
    pub async fn spawn_engine(&self, runtime: Arc<dyn EngineRuntime>) -> Result<ReplicaId, PoolError> {
        let id = {
            let mut state = self.inner.state.lock();
            let n = state.next_id;
            state.next_id += 1;
            ReplicaId::new(format!("{}-{n}", self.inner.model_id))
        };

        let slot = {
            let mut state = self.inner.state.lock();
            let cooldown_ids: HashSet<ReplicaId> = state
                .instances
                .iter()
                .filter(|(_, e)| e.stage == Stage::Stage2Cooldown)
                .map(|(id, _)| id.clone())
                .collect();
            state.slots.allocate(id.clone(), true, |candidate| cooldown_ids.contains(candidate))
        };
        let slot = slot.ok_or_else(|| PoolError::ServiceUnavailable("no gpu slot available".to_string()))?;

        {
            let mut state = self.inner.state.lock();
            let mut engine = Engine::new(id.clone(), runtime.clone());
            engine.gpu_id = Some(slot);
            state.instances.insert(id.clone(), engine);
        }

        match runtime.init_stage1().await {
            Ok(()) => {
                let now = self.inner.time_provider.now();
                let mut state = self.inner.state.lock();
                if let Some(engine) = state.instances.get_mut(&id) {
                    engine.stage = Stage::Stage1Ready;
                    engine.metrics.stage1_ready_at = Some(now);
                }
                info!(%id, slot, "engine_pool: engine reached stage1");
                Ok(id)
            }
            Err(e) => {
                let mut state = self.inner.state.lock();
                if let Some(engine) = state.instances.get_mut(&id) {
                    engine.stage = Stage::Error;
                }
                warn!(%id, error = %e, "engine_pool: stage1 init failed");
                Err(PoolError::Internal(format!("stage1 init failed: {e}")))
            }
        }
    }

    async fn activate_engine(&self, id: &ReplicaId) -> Result<(), PoolError> {
        let runtime = {
            let state = self.inner.state.lock();
            state.instances.get(id).map(|e| e.runtime.clone())
        };
        let runtime = runtime.ok_or_else(|| PoolError::ServiceUnavailable("engine not found".to_string()))?;

        match runtime.init_stage2().await {
            Ok(()) => {
                let now = self.inner.time_provider.now();
                let mut state = self.inner.state.lock();
                if let Some(engine) = state.instances.get_mut(id) {
                    engine.stage = Stage::Stage2Active;
                    engine.metrics.stage2_active_at = Some(now);
                }
                self.inner.metrics.activations.inc(1);
                self.inner.metrics.active_instances.inc(1);
                info!(%id, "engine_pool: activated engine");
                Ok(())
            }
            Err(e) => {
                let mut state = self.inner.state.lock();
                if let Some(engine) = state.instances.get_mut(id) {
                    engine.stage = Stage::Error;
                }
                self.inner.metrics.activation_failures.inc(1);
                warn!(%id, error = %e, "engine_pool: activation failed");
                Err(PoolError::ServiceUnavailable(format!("activation failed: {e}")))
            }
        }
    }

    async fn select_for_dispatch(&self) -> Result<ReplicaId, PoolError> {
        loop {
            let pick = {
                let state = self.inner.state.lock();
                pick_engine(&state.instances)
            };
            match pick {
                Pick::Ready(id) => return Ok(id),
                Pick::Stage1(id) => self.activate_engine(&id).await?,
                Pick::None => return Err(PoolError::ServiceUnavailable("no engine available".to_string())),
            }
        }
    }

    fn begin_request(&self, id: &ReplicaId) -> ActiveRequestGuard {
        let now = self.inner.time_provider.now();
        {
            let mut state = self.inner.state.lock();
            if let Some(engine) = state.instances.get_mut(id) {
                engine.active_requests += 1;
                engine.metrics.total_requests += 1;
                engine.metrics.last_request_at = Some(now);
            }
        }
        ActiveRequestGuard {
            inner: self.inner.clone(),
            id: id.clone(),
        }
    }

    async fn dispatch<F, Fut, T>(&self, call: F) -> Result<T, PoolError>
    where
        F: FnOnce(Arc<dyn EngineRuntime>) -> Fut,
        Fut: std::future::Future<Output = Result<T, PoolError>>,
    {
        let id = self.select_for_dispatch().await?;
        let runtime = {
            let state = self.inner.state.lock();
            state.instances.get(&id).map(|e| e.runtime.clone())
        };
        let runtime = runtime.ok_or_else(|| PoolError::ServiceUnavailable("engine removed before dispatch".to_string()))?;

        let _guard = self.begin_request(&id);
        call(runtime).await
    }

    /// Run a generation request against the best-available engine (spec.md §4.7).
    pub async fn generate(&self, payload: serde_json::Value) -> Result<serde_json::Value, PoolError> {
        self.dispatch(|runtime| async move { runtime.generate(payload).await }).await
    }

    /// Run an embeddings request against the best-available engine.
    pub async fn generate_embeddings(&self, payload: serde_json::Value) -> Result<serde_json::Value, PoolError> {
        self.dispatch(|runtime| async move { runtime.embed(payload).await }).await
    }

    /// Run a rerank request against the best-available engine.
    pub async fn rerank(&self, request: RerankRequest) -> Result<RerankResponse, PoolError> {
        self.dispatch(|runtime| async move { runtime.rerank(request).await }).await
    }

    /// The model this pool manager serves (spec.md §6 `show_available_models`).
    pub fn show_available_models(&self) -> ModelListResponse {
        ModelListResponse {
            object: "list",
            data: vec![ModelInfo {
                id: self.inner.model_id.clone(),
                object: "model",
                created: self.inner.created_at.timestamp_nanos() / 1_000_000_000,
                owned_by: "engine_pool",
            }],
        }
    }

    /// A coarse health summary (spec.md §6 `check_health`).
    pub fn check_health(&self) -> HealthStatus {
        let state = self.inner.state.lock();
        let ready = state
            .instances
            .values()
            .any(|e| matches!(e.stage, Stage::Stage2Active | Stage::Stage2Cooldown));
        let status = if ready {
            "ok"
        } else if state.instances.is_empty() {
            "no_instances"
        } else {
            "not_ready"
        };
        HealthStatus {
            status: status.to_string(),
            ready,
            instances: state.instances.len(),
        }
    }

    /// A detailed per-engine snapshot (spec.md §6 `get_stats`).
    pub fn get_stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let mut active = 0;
        let mut stage1 = 0;
        let mut cooldown = 0;
        let mut activation_secs_sum = 0.0;
        let mut activation_secs_count = 0u32;
        let mut instances = BTreeMap::new();

        for (id, engine) in state.instances.iter() {
            match engine.stage {
                Stage::Stage2Active => active += 1,
                Stage::Stage1Ready => stage1 += 1,
                Stage::Stage2Cooldown => cooldown += 1,
                Stage::Uninitialized | Stage::Error => {}
            }
            if let (Some(ready_at), Some(active_at)) = (engine.metrics.stage1_ready_at, engine.metrics.stage2_active_at) {
                activation_secs_sum += active_at.duration_since(ready_at).as_secs_f64();
                activation_secs_count += 1;
            }
            instances.insert(
                id.as_str().to_string(),
                InstanceStats {
                    stage: format!("{:?}", engine.stage),
                    gpu_id: engine.gpu_id,
                    stage1_time: engine.metrics.stage1_ready_at.map(|t| t.to_string()),
                    stage2_time: engine.metrics.stage2_active_at.map(|t| t.to_string()),
                    total_requests: engine.metrics.total_requests,
                    active_requests: engine.active_requests,
                },
            );
        }

        PoolStats {
            active_instances: active,
            stage1_ready_instances: stage1,
            cooldown_instances: cooldown,
            available_gpus: state.slots.available(),
            avg_activation_time_secs: if activation_secs_count > 0 {
                activation_secs_sum / activation_secs_count as f64
            } else {
                0.0
            },
            cooldown_delay_secs: self.inner.config.cooldown_delay.as_secs_f64(),
            recycle_delay_secs: self.inner.config.recycle_delay.as_secs_f64(),
            instances,
        }
    }

    /// One sweep of the periodic lifecycle loop (spec.md §4.7): promote idle
    /// active engines into cooldown, then recycle idle cooldown engines (and
    /// force-recycle anything in `Error`).
    pub async fn lifecycle_tick(&self) {
        let now = self.inner.time_provider.now();
        let mut to_recycle = Vec::new();

        {
            let mut state = self.inner.state.lock();
            for (id, engine) in state.instances.iter_mut() {
                if engine.stage == Stage::Stage2Active && engine.active_requests == 0 {
                    if let Some(start) = engine.metrics.cooldown_clock_start() {
                        if now.duration_since(start) > self.inner.config.cooldown_delay {
                            engine.stage = Stage::Stage2Cooldown;
                            engine.metrics.cooldown_start_at = Some(now);
                            self.inner.metrics.active_instances.dec(1);
                            info!(%id, "engine_pool: entering cooldown");
                        }
                    }
                }
            }
            for (id, engine) in state.instances.iter() {
                if engine.stage == Stage::Error {
                    to_recycle.push(id.clone());
                    continue;
                }
                if engine.stage == Stage::Stage2Cooldown && engine.active_requests == 0 {
                    if let Some(start) = engine.metrics.cooldown_start_at {
                        if now.duration_since(start) > self.inner.config.recycle_delay {
                            to_recycle.push(id.clone());
                        }
                    }
                }
            }
        }

        for id in to_recycle {
            self.recycle_engine(&id).await;
        }
    }

    /// Recycle procedure (spec.md §4.7): shut the engine down, release or
    /// transfer its GPU slot, drop it from the instance map, and — if no
    /// standby was waiting to take the slot over — spawn a replacement.
    async fn recycle_engine(&self, id: &ReplicaId) {
        let runtime = {
            let state = self.inner.state.lock();
            state.instances.get(id).map(|e| e.runtime.clone())
        };
        let Some(runtime) = runtime else {
            return;
        };
        runtime.shutdown().await;

        let (slot, had_standby) = {
            let mut state = self.inner.state.lock();
            let slot = state.instances.get(id).and_then(|e| e.gpu_id);
            let had_standby = slot
                .and_then(|s| state.slots.owner(s))
                .map(|o| o.sharing.is_some())
                .unwrap_or(false);
            if let Some(slot) = slot {
                state.slots.recycle_primary(slot);
            }
            state.instances.remove(id);
            (slot, had_standby)
        };

        self.inner.metrics.recycles.inc(1);
        info!(%id, slot = ?slot, had_standby, "engine_pool: recycled engine");

        if !had_standby {
            if let Err(e) = self.spawn_engine(self.inner.factory.build()).await {
                warn!(error = %e, "engine_pool: failed to spawn replacement after recycle");
            }
        }
    }
}

impl replica_router::ReplicaHandle for PoolManager {
    fn replica_id(&self) -> &ReplicaId {
        &self.inner.node_id
    }
}

/// Drives `pool`'s lifecycle loop until `shutdown` is cancelled (spec.md
/// §4.7 "periodic lifecycle loop"). Intended to be spawned as its own task
/// for the lifetime of the process, one per `PoolManager`.
pub async fn run_lifecycle_loop(pool: PoolManager, shutdown: tokio_util::sync::CancellationToken) {
    loop {
        if shutdown.is_cancelled() {
            info!("engine_pool: lifecycle loop shutdown");
            return;
        }

        pool.lifecycle_tick().await;

        tokio::select! {
            _ = tokio::time::sleep(pool.inner.config.lifecycle_tick_interval) => {},
            _ = shutdown.cancelled() => {},
        }
    }
}
