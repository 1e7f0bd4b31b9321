// src/lanes.rs
//
// =============================================================================
// SALUS: LANE MANAGER
// =============================================================================
//
// The Tetris board.
//
// Responsibilities:
// 1. Carve each GPU into memory-bounded lanes sized to the admitted jobs.
// 2. Best-fit each entry of a job's layout onto a lane, opening new lanes
//    while capacity allows and sharing existing ones otherwise.
// 3. Hand out lane holds; releasing a hold restores lane occupancy and
//    re-examines the pending request list.
//
// Lane invariant, at every instant:
//     available + Σ(hold.persistent) + max(hold.peak ∪ {0}) == total

use crate::core::{
    env_flag, fmt_bytes, Result, Status, ENV_DISABLE_LANEMGR, ENV_DISABLE_SHARED_LANE,
};
use crate::device::{ComputeDevice, CpuDevice, GpuDevice, LaneAllocator};

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_LANE_ID: AtomicU64 = AtomicU64::new(0);

// ============================================================================
// 1. LANES
// ============================================================================

struct LaneInner {
    available: u64,
    /// Multiset of active peak reservations; shared lanes only reserve the
    /// worst peak once.
    peaks: BTreeMap<u64, usize>,
}

pub struct GpuLane {
    id: u64,
    gpu_index: usize,
    total: u64,
    base_stream: u64,
    is_inference: bool,
    allocator: Arc<LaneAllocator>,
    inner: Mutex<LaneInner>,
}

impl GpuLane {
    fn new(gpu: Arc<GpuDevice>, memory: u64, base_stream: u64, is_inference: bool) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_LANE_ID.fetch_add(1, Ordering::Relaxed) + 1,
            gpu_index: gpu.index(),
            total: memory,
            base_stream,
            is_inference,
            allocator: Arc::new(LaneAllocator::new(gpu, memory)),
            inner: Mutex::new(LaneInner { available: memory, peaks: BTreeMap::new() }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn gpu_index(&self) -> usize {
        self.gpu_index
    }

    pub fn total_memory(&self) -> u64 {
        self.total
    }

    pub fn available_memory(&self) -> u64 {
        self.inner.lock().available
    }

    pub fn base_stream(&self) -> u64 {
        self.base_stream
    }

    pub fn is_inference(&self) -> bool {
        self.is_inference
    }

    pub fn allocator(&self) -> Arc<LaneAllocator> {
        self.allocator.clone()
    }

    pub fn num_holds(&self) -> usize {
        self.inner.lock().peaks.values().sum()
    }

    /// Admits a job if `persistent` plus the worst peak (including this
    /// job's) still fits. Shared lanes never overcommit their peak envelope.
    fn try_fit(&self, persistent: u64, peak: u64) -> bool {
        let mut inner = self.inner.lock();
        let observed_max = inner.peaks.keys().next_back().copied().unwrap_or(0);
        let max_peak = peak.max(observed_max);
        if persistent + max_peak <= inner.available {
            inner.available -= persistent;
            *inner.peaks.entry(peak).or_insert(0) += 1;
            true
        } else {
            false
        }
    }

    fn remove_hold(&self, persistent: u64, peak: u64) {
        let mut inner = self.inner.lock();
        inner.available += persistent;
        assert!(inner.available <= self.total, "lane over-release on lane {}", self.id);
        match inner.peaks.get_mut(&peak) {
            Some(n) if *n > 1 => *n -= 1,
            Some(_) => {
                inner.peaks.remove(&peak);
            }
            None => panic!("removing unknown peak {} from lane {}", peak, self.id),
        }
    }
}

/// A job's reservation of lane memory. Dropping it releases the hold and
/// lets the manager retry queued requests.
pub struct LaneHolder {
    lane: Arc<GpuLane>,
    mgr: Arc<LaneMgr>,
    persistent: u64,
    peak: u64,
    /// Suppressed for holds torn down mid-admission, where nothing changed.
    notify: AtomicBool,
}

impl LaneHolder {
    pub fn lane_id(&self) -> u64 {
        self.lane.id()
    }

    pub fn gpu_index(&self) -> usize {
        self.lane.gpu_index()
    }

    pub fn total_memory(&self) -> u64 {
        self.lane.total_memory()
    }

    pub fn available_memory(&self) -> u64 {
        self.lane.available_memory()
    }

    pub fn base_stream(&self) -> u64 {
        self.lane.base_stream()
    }

    pub fn allocator(&self) -> Arc<LaneAllocator> {
        self.lane.allocator()
    }

    fn quiet(&self) {
        self.notify.store(false, Ordering::Relaxed);
    }
}

impl Drop for LaneHolder {
    fn drop(&mut self) {
        self.lane.remove_hold(self.persistent, self.peak);
        if self.notify.load(Ordering::Relaxed) {
            self.mgr.lane_released(&self.lane);
        } else {
            self.mgr.forget_lane_if_idle(&self.lane);
        }
    }
}

// ============================================================================
// 2. THE MANAGER
// ============================================================================

/// One job's placement demand: per admitted GPU, a total memory limit and
/// the persistent share of it.
#[derive(Debug, Clone, Default)]
pub struct LaneLayout {
    pub memory_limits: Vec<u64>,
    pub persistent: Vec<u64>,
}

pub type LaneCallback = Box<dyn FnOnce(Vec<LaneHolder>) + Send>;

struct LaneRequest {
    layout: LaneLayout,
    is_inference: bool,
    cb: LaneCallback,
}

struct GpuControlBlock {
    device: Arc<GpuDevice>,
    inner: Mutex<GcbInner>,
}

struct GcbInner {
    available: u64,
    next_stream: u64,
    /// Kept sorted ascending by available memory at insertion time.
    lanes: Vec<Arc<GpuLane>>,
}

pub struct LaneMgr {
    disabled: bool,
    no_shared_lane: bool,
    gpus: Vec<GpuControlBlock>,
    cpu: Arc<CpuDevice>,
    pending: Mutex<Vec<LaneRequest>>,
    single_lane_ready: AtomicBool,
    me: Weak<LaneMgr>,
}

impl LaneMgr {
    pub fn new(gpus: Vec<Arc<GpuDevice>>, cpu: Arc<CpuDevice>) -> Arc<Self> {
        assert!(!gpus.is_empty(), "at least one GPU must be present");
        let blocks = gpus
            .into_iter()
            .map(|device| {
                let available = device.total_memory();
                GpuControlBlock {
                    device,
                    inner: Mutex::new(GcbInner { available, next_stream: 0, lanes: Vec::new() }),
                }
            })
            .collect();

        Arc::new_cyclic(|me| Self {
            disabled: env_flag(ENV_DISABLE_LANEMGR),
            no_shared_lane: env_flag(ENV_DISABLE_SHARED_LANE),
            gpus: blocks,
            cpu,
            pending: Mutex::new(Vec::new()),
            single_lane_ready: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    fn arc(&self) -> Arc<LaneMgr> {
        self.me.upgrade().expect("lane manager alive")
    }

    pub fn num_gpus(&self) -> usize {
        self.gpus.len()
    }

    pub fn total_memory_for_gpu(&self, index: usize) -> u64 {
        self.gpus[index].device.total_memory()
    }

    /// Memory not yet carved into lanes on `index`.
    pub fn available_memory_for_gpu(&self, index: usize) -> u64 {
        self.gpus[index].inner.lock().available
    }

    pub fn num_lanes_on_gpu(&self, index: usize) -> usize {
        self.gpus[index].inner.lock().lanes.len()
    }

    pub fn cpu_device(&self) -> Arc<CpuDevice> {
        self.cpu.clone()
    }

    pub fn gpu_device(&self, index: usize) -> Arc<GpuDevice> {
        self.gpus[index].device.clone()
    }

    /// Queues a placement request. The callback fires (possibly inline) once
    /// every layout entry obtained a lane.
    pub fn request_lanes(
        &self,
        layout: LaneLayout,
        is_inference: bool,
        cb: LaneCallback,
    ) -> Result<()> {
        if layout.memory_limits.len() != layout.persistent.len() {
            return Err(Status::invalid_argument("layout vectors must have equal length"));
        }
        if layout.memory_limits.len() > self.gpus.len() {
            return Err(Status::invalid_argument(format!(
                "requested {} GPUs but only {} present",
                layout.memory_limits.len(),
                self.gpus.len()
            )));
        }
        for (i, (&limit, &persistent)) in
            layout.memory_limits.iter().zip(layout.persistent.iter()).enumerate()
        {
            if persistent > limit {
                return Err(Status::invalid_argument(format!(
                    "entry {}: persistent {} exceeds memory limit {}",
                    i,
                    fmt_bytes(persistent),
                    fmt_bytes(limit)
                )));
            }
        }

        if self.disabled {
            self.ensure_single_lane();
        }

        self.pending.lock().push(LaneRequest { layout, is_inference, cb });
        self.process_requests();
        Ok(())
    }

    /// Single-lane mode: the first request carves one lane covering all of
    /// GPU 0 and every job shares it.
    fn ensure_single_lane(&self) {
        if self.single_lane_ready.swap(true, Ordering::SeqCst) {
            return;
        }
        let gcb = &self.gpus[0];
        let mut inner = gcb.inner.lock();
        let memory = inner.available;
        inner.available = 0;
        let lane = GpuLane::new(gcb.device.clone(), memory, inner.next_stream, false);
        inner.next_stream += 1;
        inner.lanes.push(lane);
        log::info!("Lane manager disabled; opened one lane covering {}", fmt_bytes(memory));
    }

    /// Walks the pending list and satisfies whatever fits now. Callbacks run
    /// after the list lock is released.
    fn process_requests(&self) {
        let mut granted: Vec<(LaneCallback, Vec<LaneHolder>)> = Vec::new();
        {
            let mut pending = self.pending.lock();
            pending.retain_mut(|req| {
                match self.try_satisfy(req) {
                    Some(holders) => {
                        // retain_mut needs the callback out; swap a no-op in.
                        let cb = std::mem::replace(&mut req.cb, Box::new(|_| {}));
                        granted.push((cb, holders));
                        false
                    }
                    None => true,
                }
            });
        }

        for (cb, holders) in granted {
            cb(holders);
        }
    }

    fn try_satisfy(&self, req: &LaneRequest) -> Option<Vec<LaneHolder>> {
        // Greedy: place the largest entries first to reduce fragmentation.
        let n = req.layout.memory_limits.len();
        let mut indices: Vec<usize> = (0..n).collect();
        indices.sort_by(|&a, &b| {
            let key_a = (req.layout.memory_limits[a], req.layout.persistent[a]);
            let key_b = (req.layout.memory_limits[b], req.layout.persistent[b]);
            key_b.cmp(&key_a)
        });

        let mut holders = Vec::with_capacity(n);
        for idx in indices {
            let memory = req.layout.memory_limits[idx];
            let persistent = req.layout.persistent[idx];
            let mut found = None;
            for gcb in &self.gpus {
                if let Some(h) = self.best_fit_for(gcb, memory, persistent, req.is_inference) {
                    found = Some(h);
                    break;
                }
            }
            match found {
                Some(h) => holders.push(h),
                None => {
                    // Roll back quietly: lane state returns to exactly what
                    // it was, so no re-processing is due.
                    for h in &holders {
                        h.quiet();
                    }
                    return None;
                }
            }
        }
        Some(holders)
    }

    fn best_fit_for(
        &self,
        gcb: &GpuControlBlock,
        memory: u64,
        persistent: u64,
        is_inference: bool,
    ) -> Option<LaneHolder> {
        let peak = memory - persistent;

        let mut inner = gcb.inner.lock();
        log::debug!(
            "Checking to create lane for memory size {} available now {}",
            fmt_bytes(memory),
            fmt_bytes(inner.available)
        );

        // Prefer a fresh lane while uncarved memory allows.
        if !self.disabled && inner.available >= memory {
            inner.available -= memory;
            let lane = GpuLane::new(gcb.device.clone(), memory, inner.next_stream, is_inference);
            inner.next_stream += 1;

            let pos = inner
                .lanes
                .iter()
                .position(|l| l.available_memory() > lane.available_memory())
                .unwrap_or(inner.lanes.len());
            inner.lanes.insert(pos, lane.clone());

            let fitted = lane.try_fit(persistent, peak);
            assert!(fitted, "fresh lane must admit its requester");
            log::info!(
                "Opened lane {} on GPU {} with {} (stream {})",
                lane.id(),
                gcb.device.index(),
                fmt_bytes(memory),
                lane.base_stream()
            );
            return Some(self.make_holder(lane, persistent, peak));
        }

        // Shared execution: first existing lane the request fits into.
        if !self.no_shared_lane {
            for lane in &inner.lanes {
                if lane.try_fit(persistent, peak) {
                    return Some(self.make_holder(lane.clone(), persistent, peak));
                }
            }
        }
        None
    }

    fn make_holder(&self, lane: Arc<GpuLane>, persistent: u64, peak: u64) -> LaneHolder {
        LaneHolder {
            lane,
            mgr: self.arc(),
            persistent,
            peak,
            notify: AtomicBool::new(true),
        }
    }

    /// A hold was released: garbage-collect the lane if it is idle, then
    /// give queued requests another chance.
    fn lane_released(&self, lane: &Arc<GpuLane>) {
        self.forget_lane_if_idle(lane);
        self.process_requests();
    }

    fn forget_lane_if_idle(&self, lane: &Arc<GpuLane>) {
        if self.disabled {
            return;
        }
        let gcb = &self.gpus[lane.gpu_index()];
        let mut inner = gcb.inner.lock();
        if lane.num_holds() > 0 {
            return;
        }
        // Only the manager's list and our caller may still reference it.
        if Arc::strong_count(lane) > 2 {
            return;
        }
        let before = inner.lanes.len();
        inner.lanes.retain(|l| !Arc::ptr_eq(l, lane));
        if inner.lanes.len() < before {
            let restored = lane.available_memory();
            assert_eq!(restored, lane.total_memory(), "destroying lane with live holds");
            inner.available += restored;
            assert!(inner.available <= gcb.device.total_memory());
            log::info!(
                "Destroyed lane {} on GPU {}; {} returned",
                lane.id(),
                gcb.device.index(),
                fmt_bytes(restored)
            );
        }
    }
}
