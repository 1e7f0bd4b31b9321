// src/session.rs
//
// =============================================================================
// SALUS: RUNTIME & FRONT-END
// =============================================================================
//
// The wiring center.
//
// Responsibilities:
// 1. Hold the process-wide pieces (platform, monitor, regulator, lane
//    manager, engine) in one explicit Runtime value. No singletons; tests
//    construct private runtimes.
// 2. Translate front-end requests (seven types, dispatched by name) into
//    engine operations: admission with resource-map inflation, graph
//    registration with dedup, iteration scheduling, teardown.
// 3. Bridge the async front-end boundary onto the threaded engine with
//    oneshot completions.

use crate::core::{
    env_flag, DeviceSpec, ResourceTag, Resources, Result, SchedulingParam, Status, CPU0,
    ENV_ENABLE_SIEXECUTOR, ENV_ENABLE_STATIC_STREAM,
};
use crate::device::{AllocAttributes, ComputeDevice, Platform, PlatformConfig, PerOpAllocator};
use crate::engine::{
    ExecutionContext, ExecutionEngine, IterationContext, IterationTask, PagingCallbacks,
    PAGING_TARGET,
};
use crate::executor::{ExecutorParams, ExecutorState, PressureCallback};
use crate::graph::{build_graph_view, GraphDef, GraphView};
use crate::lanes::{LaneHolder, LaneLayout, LaneMgr};
use crate::monitor::{platform_limits, AllocationRegulator, ResourceContext, ResourceMonitor};
use crate::ops::{CostCache, OpRegistry, Rendezvous};
use crate::paging::ActiveBuffers;
use crate::tensor::{DataType, Shape, Tensor};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Persistent reservations are padded against fragmentation; totals get a
/// smaller safety margin. Both cap at the GPU's total memory.
const PERSISTENT_INFLATION: f64 = 1.10;
const TOTAL_INFLATION: f64 = 1.05;

const DEFAULT_PRIORITY: u64 = 20;

// ============================================================================
// 1. WIRE TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SalusOptions {
    /// Recognised keys: `MEMORY:GPU<i>.persistent`, `MEMORY:GPU<i>.temporary`,
    /// `TIME:TOTAL.persistent`, `SCHED:PRIORITY.persistent`.
    #[serde(default)]
    pub resource_map: HashMap<String, f64>,
    #[serde(default)]
    pub is_inference: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    #[serde(default)]
    pub salus_options: SalusOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TensorData {
    pub dtype: DataType,
    pub shape: Vec<usize>,
    #[serde(default)]
    pub f32s: Vec<f32>,
    #[serde(default)]
    pub i64s: Vec<i64>,
    #[serde(default)]
    pub bools: Vec<bool>,
}

impl TensorData {
    pub fn from_tensor(t: &Tensor) -> Self {
        let mut data = TensorData {
            dtype: t.dtype(),
            shape: t.shape().0.clone(),
            ..Default::default()
        };
        match t.dtype() {
            DataType::F32 => data.f32s = t.read_f32(),
            DataType::I64 => data.i64s = t.read_i64(),
            DataType::Bool => data.bools = t.read_bool(),
        }
        data
    }

    fn materialize(&self, alloc: &Arc<PerOpAllocator>) -> Result<Tensor> {
        let t = Tensor::allocate(
            alloc,
            self.dtype,
            Shape(self.shape.clone()),
            AllocAttributes { on_host: true },
        )?;
        match self.dtype {
            DataType::F32 => t.write_f32(&self.f32s)?,
            DataType::I64 => t.write_i64(&self.i64s)?,
            DataType::Bool => t.write_bool(&self.bools)?,
        }
        Ok(t)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub graph: Option<GraphDef>,
    #[serde(default)]
    pub config: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_handle: String,
    pub graph_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendSessionRequest {
    pub session_handle: String,
    pub graph: GraphDef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendSessionResponse {
    pub graph_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialRunSetupRequest {
    pub session_handle: String,
    #[serde(default)]
    pub feeds: Vec<String>,
    #[serde(default)]
    pub fetches: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialRunSetupResponse {
    pub partial_handle: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStepRequest {
    pub session_handle: String,
    #[serde(default)]
    pub graph_id: Option<u64>,
    #[serde(default)]
    pub partial_handle: Option<String>,
    #[serde(default)]
    pub feeds: HashMap<String, TensorData>,
    #[serde(default)]
    pub fetches: Vec<String>,
    /// The job's main training iteration. Defaults to true.
    #[serde(default = "default_expensive")]
    pub is_expensive: bool,
}

fn default_expensive() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStepResponse {
    pub fetched: HashMap<String, TensorData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    pub session_handle: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub memory: u64,
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDevicesResponse {
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

// ============================================================================
// 2. THE FRONTEND SERVICE
// ============================================================================

#[async_trait]
pub trait Frontend: Send + Sync {
    async fn create_session(&self, req: CreateSessionRequest) -> Result<CreateSessionResponse>;
    async fn extend_session(&self, req: ExtendSessionRequest) -> Result<ExtendSessionResponse>;
    async fn partial_run_setup(
        &self,
        req: PartialRunSetupRequest,
    ) -> Result<PartialRunSetupResponse>;
    async fn run_step(&self, req: RunStepRequest) -> Result<RunStepResponse>;
    async fn close_session(&self, req: CloseSessionRequest) -> Result<Ack>;
    async fn list_devices(&self) -> Result<ListDevicesResponse>;
    async fn reset(&self) -> Result<Ack>;
}

// ============================================================================
// 3. SESSION STATE
// ============================================================================

struct SessionState {
    handle: String,
    ectx: Arc<ExecutionContext>,
    allocator: Arc<PerOpAllocator>,
    rendezvous: Arc<Rendezvous>,
    variables: crate::ops::VarStore,
    active_buffers: Arc<ActiveBuffers>,
    cost_cache: Arc<CostCache>,
    graphs: Mutex<HashMap<u64, Arc<GraphView>>>,
    graphs_by_print: Mutex<HashMap<String, u64>>,
    next_graph_id: AtomicU64,
    next_step_id: AtomicU64,
    outstanding_steps: AtomicI64,
    is_inference: bool,
    /// Fixed stream when static stream pinning is on.
    pinned_stream: Option<u64>,
    created_at: DateTime<Utc>,
    had_success: AtomicBool,
    closing: AtomicBool,
}

impl SessionState {
    fn register_graph(&self, def: &GraphDef, registry: &OpRegistry) -> Result<u64> {
        let print = def.fingerprint();
        if let Some(&id) = self.graphs_by_print.lock().get(&print) {
            log::debug!("⚡ Graph cache hit for session {}: graph {}", self.handle, id);
            return Ok(id);
        }
        let view = Arc::new(build_graph_view(def, registry)?);
        let id = self.next_graph_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.graphs.lock().insert(id, view);
        self.graphs_by_print.lock().insert(print, id);
        Ok(id)
    }

    fn graph(&self, id: u64) -> Result<Arc<GraphView>> {
        self.graphs
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("unknown graph {}", id)))
    }
}

struct PartialRun {
    session_handle: String,
    fetches: Vec<String>,
}

// ============================================================================
// 4. THE RUNTIME
// ============================================================================

#[derive(Clone, Default)]
pub struct RuntimeConfig {
    pub platform: PlatformConfig,
    pub param: SchedulingParam,
}

pub struct Runtime {
    pub platform: Platform,
    pub monitor: Arc<ResourceMonitor>,
    pub regulator: Arc<AllocationRegulator>,
    pub lane_mgr: Arc<LaneMgr>,
    pub engine: Arc<ExecutionEngine>,
    pub registry: Arc<OpRegistry>,

    sessions: Mutex<HashMap<String, Arc<SessionState>>>,
    partial_runs: Mutex<HashMap<String, PartialRun>>,
    si_mode: bool,
    static_stream: bool,
    stream_rr: AtomicU64,
    hostname: String,
}

impl Runtime {
    pub fn boot(config: RuntimeConfig) -> Arc<Self> {
        let platform = Platform::detect(&config.platform);
        let limits = platform_limits(platform.cpu.total_memory(), &platform.gpu_memories());

        let monitor = Arc::new(ResourceMonitor::new(limits.clone()));
        let regulator = Arc::new(AllocationRegulator::new(limits));
        let lane_mgr = LaneMgr::new(platform.gpus.clone(), platform.cpu.clone());
        let engine = ExecutionEngine::new(
            config.param.clone(),
            monitor.clone(),
            regulator.clone(),
            lane_mgr.clone(),
        );
        engine.start_scheduler();

        Arc::new(Self {
            platform,
            monitor,
            regulator,
            lane_mgr,
            engine,
            registry: OpRegistry::with_builtins(),
            sessions: Mutex::new(HashMap::new()),
            partial_runs: Mutex::new(HashMap::new()),
            si_mode: env_flag(ENV_ENABLE_SIEXECUTOR),
            static_stream: env_flag(ENV_ENABLE_STATIC_STREAM),
            stream_rr: AtomicU64::new(0),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "localhost".into()),
        })
    }

    pub fn shutdown(&self) {
        self.engine.stop_scheduler();
        self.engine.pool().shutdown();
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    /// The interrupt path: queued iterations complete as cancelled, the
    /// rendezvous aborts so pending Recvs unblock, in-flight kernels finish
    /// on their own.
    pub fn force_close_session(&self, handle: &str) -> Result<()> {
        let session = self.session(handle)?;
        session.closing.store(true, Ordering::SeqCst);
        session.ectx.force_close();
        self.sessions.lock().remove(handle);
        self.partial_runs.lock().retain(|_, pr| pr.session_handle != handle);
        let ticket = session.ectx.item().ticket();
        session.active_buffers.remove_ticket(ticket);
        if ticket != 0 {
            self.monitor.free_staging(ticket);
        }
        self.regulator.finish_job(session.ectx.job_ticket());
        Ok(())
    }

    fn session(&self, handle: &str) -> Result<Arc<SessionState>> {
        self.sessions
            .lock()
            .get(handle)
            .cloned()
            .ok_or_else(|| Status::not_found(format!("unknown session {}", handle)))
    }

    // ------------------------------------------------------------------------
    // Resource map handling
    // ------------------------------------------------------------------------

    /// Parses the client resource map into a lane layout plus scheduling
    /// hints, applying the inflation factors.
    fn parse_resource_map(
        &self,
        opts: &SalusOptions,
    ) -> Result<(LaneLayout, Resources, u64, u64)> {
        let mut persistent: HashMap<usize, u64> = HashMap::new();
        let mut temporary: HashMap<usize, u64> = HashMap::new();
        let mut time_hint_ms = 0u64;
        let mut priority = DEFAULT_PRIORITY;

        for (key, &value) in &opts.resource_map {
            let (tag_part, kind) = match key.rsplit_once('.') {
                Some(parts) => parts,
                None => {
                    return Err(Status::invalid_argument(format!(
                        "malformed resource key: {}",
                        key
                    )))
                }
            };

            if tag_part == "TIME:TOTAL" {
                if kind == "persistent" {
                    time_hint_ms = (value * 1000.0) as u64;
                }
                continue;
            }
            if tag_part == "SCHED:PRIORITY" {
                if kind == "persistent" {
                    priority = value as u64;
                }
                continue;
            }

            let tag: ResourceTag = tag_part.parse()?;
            if tag.ty != crate::core::ResourceType::Memory || !tag.device.is_gpu() {
                continue;
            }
            let gpu = tag.device.index;
            match kind {
                "persistent" => {
                    persistent.insert(gpu, value as u64);
                }
                "temporary" => {
                    temporary.insert(gpu, value as u64);
                }
                other => {
                    return Err(Status::invalid_argument(format!(
                        "unknown resource sub-key: {}",
                        other
                    )))
                }
            }
        }

        let mut gpus: Vec<usize> =
            persistent.keys().chain(temporary.keys()).copied().collect();
        gpus.sort_unstable();
        gpus.dedup();

        let mut layout = LaneLayout::default();
        let mut session_res = Resources::new();
        for gpu in gpus {
            if gpu >= self.lane_mgr.num_gpus() {
                return Err(Status::invalid_argument(format!(
                    "resource map names GPU{} but only {} present",
                    gpu,
                    self.lane_mgr.num_gpus()
                )));
            }
            let gpu_total = self.lane_mgr.total_memory_for_gpu(gpu);
            let p = persistent.get(&gpu).copied().unwrap_or(0);
            let t = temporary.get(&gpu).copied().unwrap_or(0);

            let p_inflated = ((p as f64 * PERSISTENT_INFLATION) as u64).min(gpu_total);
            let total =
                (((p as f64 + t as f64) * TOTAL_INFLATION) as u64).min(gpu_total);
            let total = total.max(p_inflated);

            layout.persistent.push(p_inflated);
            layout.memory_limits.push(total);
            session_res.set(ResourceTag::memory(DeviceSpec::gpu(gpu)), total);
            session_res.set(ResourceTag::gpu_stream(DeviceSpec::gpu(gpu)), 1);
        }

        Ok((layout, session_res, time_hint_ms, priority))
    }

    /// Lane admission, resolved through a oneshot because grants may fire
    /// later, when some other session frees memory.
    async fn admit(
        &self,
        layout: LaneLayout,
        is_inference: bool,
    ) -> Result<Vec<LaneHolder>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.lane_mgr.request_lanes(
            layout,
            is_inference,
            Box::new(move |holders| {
                let _ = tx.send(holders);
            }),
        )?;
        rx.await
            .map_err(|_| Status::internal("lane manager dropped the admission request"))
    }
}

// ============================================================================
// 5. THE ITERATION TASK
// ============================================================================

struct StepTask {
    graph_id: u64,
    is_expensive: bool,
    state: Arc<ExecutorState>,
    result_tx: Mutex<Option<tokio::sync::oneshot::Sender<Result<HashMap<String, Tensor>>>>>,
    session: Arc<SessionState>,
    pool: Arc<crate::engine::ThreadPool>,
}

impl IterationTask for StepTask {
    fn graph_id(&self) -> u64 {
        self.graph_id
    }

    fn is_expensive(&self) -> bool {
        self.is_expensive
    }

    fn cancel(&self) {
        self.state.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    fn run_async(self: Box<Self>, ictx: IterationContext) {
        let result_tx = self.result_tx.lock().take();
        let session = self.session.clone();
        let engine_done = ictx.done;
        let state = self.state.clone();
        // Keep kernels off the scheduling thread.
        self.pool.spawn(move || {
            state.run_async(Box::new(move |result| {
                if result.is_ok() && !session.had_success.swap(true, Ordering::SeqCst) {
                    // First good iteration opens the lane for sharing.
                    session.ectx.drop_exclusive_mode();
                }
                session.outstanding_steps.fetch_sub(1, Ordering::SeqCst);
                engine_done();
                if let Some(tx) = result_tx {
                    let _ = tx.send(result);
                }
            }));
        });
    }
}

// ============================================================================
// 6. FRONTEND IMPLEMENTATION
// ============================================================================

#[async_trait]
impl Frontend for Runtime {
    async fn create_session(&self, req: CreateSessionRequest) -> Result<CreateSessionResponse> {
        let opts = &req.config.salus_options;
        let (layout, session_res, time_hint_ms, priority) = self.parse_resource_map(opts)?;

        // Session-lifetime hold. Failing here is an admission failure: the
        // session is never created.
        let ectx = self.engine.make_context();
        if !self.regulator.begin_allocation(ectx.job_ticket(), &session_res) {
            self.engine.force_close(ectx.session_id());
            return Err(Status::resource_exhausted(format!(
                "requested resources exceed capacity: {}",
                session_res
            )));
        }

        let holders = if layout.memory_limits.is_empty() {
            Vec::new()
        } else {
            self.admit(layout, opts.is_inference).await?
        };

        // Commit the ticket used for every tensor this session allocates.
        let (device, lane_alloc, gpu_spec) = match holders.first() {
            Some(h) => {
                ectx.set_lane(h);
                let gpu = self.lane_mgr.gpu_device(h.gpu_index());
                (
                    gpu.clone() as crate::device::DeviceRef,
                    Some(h.allocator()),
                    gpu.spec(),
                )
            }
            None => (
                self.platform.cpu.clone() as crate::device::DeviceRef,
                None,
                CPU0,
            ),
        };

        let ticket = match ectx.make_resource_context(gpu_spec, &session_res) {
            Ok(rctx) => rctx.ticket(),
            Err(missing) => {
                self.regulator.end_allocation(ectx.job_ticket(), &session_res);
                self.engine.force_close(ectx.session_id());
                return Err(Status::resource_exhausted(format!(
                    "missing resources at admission: {}",
                    missing
                )));
            }
        };

        let allocator = PerOpAllocator::new(
            device,
            lane_alloc,
            self.platform.cpu.clone(),
            ResourceContext::new(self.monitor.clone(), ticket, gpu_spec),
            ResourceContext::new(self.monitor.clone(), ticket, CPU0),
        );

        let handle = format!("salus-{}", Uuid::new_v4());
        let pinned_stream = if self.static_stream {
            let base = holders.first().map(|h| h.base_stream()).unwrap_or(0);
            Some(base + self.stream_rr.fetch_add(1, Ordering::SeqCst) % crate::monitor::GPU_STREAMS)
        } else {
            None
        };

        ectx.set_session_handle(&handle);
        ectx.set_ticket(ticket);
        ectx.set_expected_running_time(time_hint_ms);
        ectx.set_priority(priority);
        ectx.take_holds(holders);

        let session = Arc::new(SessionState {
            handle: handle.clone(),
            ectx,
            allocator,
            rendezvous: Arc::new(Rendezvous::new()),
            variables: Arc::new(Mutex::new(HashMap::new())),
            active_buffers: Arc::new(ActiveBuffers::new()),
            cost_cache: Arc::new(CostCache::new()),
            graphs: Mutex::new(HashMap::new()),
            graphs_by_print: Mutex::new(HashMap::new()),
            next_graph_id: AtomicU64::new(0),
            next_step_id: AtomicU64::new(0),
            outstanding_steps: AtomicI64::new(0),
            is_inference: opts.is_inference,
            pinned_stream,
            created_at: Utc::now(),
            had_success: AtomicBool::new(false),
            closing: AtomicBool::new(false),
        });

        // Paging: volunteer whole alias sets of the victim ticket onto the
        // target device the engine chose.
        {
            let active = session.active_buffers.clone();
            let cpu = self.platform.cpu.clone();
            session.ectx.register_paging_callbacks(PagingCallbacks {
                volunteer: Box::new(move |victim_ticket, target_rctx| {
                    let target_alloc = PerOpAllocator::new(
                        cpu.clone() as crate::device::DeviceRef,
                        None,
                        cpu.clone(),
                        target_rctx.clone(),
                        target_rctx,
                    );
                    match active.page_out(victim_ticket, &target_alloc) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            log::error!("Paging volunteer failed: {}", e);
                            0
                        }
                    }
                }),
            });
        }
        {
            let rendezvous = session.rendezvous.clone();
            session.ectx.set_interrupt_callback(move || {
                rendezvous.abort(Status::cancelled("session closed"));
            });
        }
        {
            // External allocator evictions invalidate the affected entries.
            let active = session.active_buffers.clone();
            session.allocator.set_eviction_listener(Box::new(move |ticket, buffer| {
                active.evicted(ticket, buffer);
            }));
        }

        let graph_id = match &req.graph {
            Some(def) => Some(session.register_graph(def, &self.registry)?),
            None => None,
        };

        if let Some(stream) = session.pinned_stream {
            log::info!("Session {} pinned to stream {}", handle, stream);
        }
        log::info!(
            "✅ Session {} created (ticket {}, lane {}, priority {})",
            handle,
            ticket,
            session.ectx.item().lane_id(),
            priority
        );

        self.sessions.lock().insert(handle.clone(), session);
        Ok(CreateSessionResponse { session_handle: handle, graph_id })
    }

    async fn extend_session(&self, req: ExtendSessionRequest) -> Result<ExtendSessionResponse> {
        let session = self.session(&req.session_handle)?;
        let graph_id = session.register_graph(&req.graph, &self.registry)?;
        Ok(ExtendSessionResponse { graph_id })
    }

    async fn partial_run_setup(
        &self,
        req: PartialRunSetupRequest,
    ) -> Result<PartialRunSetupResponse> {
        self.session(&req.session_handle)?;
        let partial_handle = format!("partial-{}", Uuid::new_v4());
        self.partial_runs.lock().insert(
            partial_handle.clone(),
            PartialRun { session_handle: req.session_handle, fetches: req.fetches },
        );
        Ok(PartialRunSetupResponse { partial_handle })
    }

    async fn run_step(&self, req: RunStepRequest) -> Result<RunStepResponse> {
        let mut fetches = req.fetches.clone();
        let session_handle = match &req.partial_handle {
            Some(ph) => {
                let partials = self.partial_runs.lock();
                let pr = partials
                    .get(ph)
                    .ok_or_else(|| Status::not_found(format!("unknown partial run {}", ph)))?;
                if fetches.is_empty() {
                    fetches = pr.fetches.clone();
                }
                pr.session_handle.clone()
            }
            None => req.session_handle.clone(),
        };

        let session = self.session(&session_handle)?;
        if session.closing.load(Ordering::SeqCst) {
            return Err(Status::failed_precondition("session is closing"));
        }

        let graph_id = req.graph_id.unwrap_or(1);
        let gview = session.graph(graph_id)?;

        let mut feeds = HashMap::new();
        for (name, data) in &req.feeds {
            feeds.insert(name.clone(), data.materialize(&session.allocator)?);
        }

        let step_id = session.next_step_id.fetch_add(1, Ordering::SeqCst) + 1;
        let engine = self.engine.clone();
        let session_id = session.ectx.session_id();
        let pressure_cb: PressureCallback = Arc::new(move |spec: DeviceSpec| {
            engine.do_paging(session_id, spec, PAGING_TARGET)
        });

        let state = ExecutorState::new(ExecutorParams {
            gview,
            step_id,
            allocator: session.allocator.clone(),
            rendezvous: session.rendezvous.clone(),
            variables: session.variables.clone(),
            active_buffers: session.active_buffers.clone(),
            cost_cache: session.cost_cache.clone(),
            pool: self.engine.pool().clone(),
            pressure_cb: Some(pressure_cb),
            max_failures: self.engine.scheduling_param().max_failures,
            si_mode: self.si_mode,
            is_inference: session.is_inference,
            feeds: Mutex::new(feeds),
            fetches: fetches.clone(),
        });

        let (tx, rx) = tokio::sync::oneshot::channel();
        session.outstanding_steps.fetch_add(1, Ordering::SeqCst);
        session.ectx.schedule_iteration(Box::new(StepTask {
            graph_id,
            is_expensive: req.is_expensive,
            state,
            result_tx: Mutex::new(Some(tx)),
            session: session.clone(),
            pool: self.engine.pool().clone(),
        }));

        let results = rx
            .await
            .map_err(|_| Status::internal("iteration dropped without completing"))??;

        let fetched = results
            .iter()
            .map(|(name, t)| (name.clone(), TensorData::from_tensor(t)))
            .collect();
        Ok(RunStepResponse { fetched })
    }

    async fn close_session(&self, req: CloseSessionRequest) -> Result<Ack> {
        let session = self.session(&req.session_handle)?;
        session.closing.store(true, Ordering::SeqCst);

        // Drain: let in-flight steps finish before freeing anything.
        while session.outstanding_steps.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let ticket = session.ectx.item().ticket();
        self.sessions.lock().remove(&req.session_handle);
        self.partial_runs.lock().retain(|_, pr| pr.session_handle != req.session_handle);

        // Graphs and variables die with the session; their buffers return
        // through the allocator grants.
        session.graphs.lock().clear();
        session.variables.lock().clear();
        session.active_buffers.remove_ticket(ticket);
        session.rendezvous.abort(Status::cancelled("session closed"));
        session.ectx.finish(|| {});

        let alive = Utc::now().signed_duration_since(session.created_at);
        log::info!(
            "🏁 Session {} closed (ticket {}, alive {:.1}s)",
            req.session_handle,
            ticket,
            alive.num_milliseconds() as f64 / 1000.0
        );
        Ok(Ack { ok: true })
    }

    async fn list_devices(&self) -> Result<ListDevicesResponse> {
        let mut devices = vec![DeviceInfo {
            name: CPU0.full_name(),
            memory: self.platform.cpu.total_memory(),
            hostname: self.hostname.clone(),
        }];
        for gpu in &self.platform.gpus {
            devices.push(DeviceInfo {
                name: gpu.spec().full_name(),
                memory: gpu.total_memory(),
                hostname: self.hostname.clone(),
            });
        }
        Ok(ListDevicesResponse { devices })
    }

    async fn reset(&self) -> Result<Ack> {
        let handles: Vec<String> = self.sessions.lock().keys().cloned().collect();
        for handle in handles {
            self.close_session(CloseSessionRequest { session_handle: handle }).await?;
        }
        Ok(Ack { ok: true })
    }
}

// ============================================================================
// 7. DISPATCH BY NAME
// ============================================================================

impl Runtime {
    /// The request router the transport layer calls into.
    pub async fn dispatch(&self, request: &str, body: Value) -> Result<Value> {
        fn enc<T: Serialize>(v: T) -> Result<Value> {
            serde_json::to_value(v).map_err(|e| Status::internal(e.to_string()))
        }
        fn dec<T: for<'de> Deserialize<'de>>(v: Value) -> Result<T> {
            serde_json::from_value(v).map_err(|e| Status::invalid_argument(e.to_string()))
        }

        match request {
            "CreateSession" => enc(self.create_session(dec(body)?).await?),
            "ExtendSession" => enc(self.extend_session(dec(body)?).await?),
            "PartialRunSetup" => enc(self.partial_run_setup(dec(body)?).await?),
            "RunStep" => enc(self.run_step(dec(body)?).await?),
            "CloseSession" => enc(self.close_session(dec(body)?).await?),
            "ListDevices" => enc(self.list_devices().await?),
            "Reset" => enc(self.reset().await?),
            other => Err(Status::not_found(format!("unknown request type: {}", other))),
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Runtime({} GPUs, {} sessions, pool={})",
            self.platform.gpus.len(),
            self.sessions.lock().len(),
            self.engine.pool().size()
        )
    }
}
