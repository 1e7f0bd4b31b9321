// src/device.rs
//
// =============================================================================
// SALUS: DEVICE SUBSTRATE
// =============================================================================
//
// The Hardware Ports.
//
// Responsibilities:
// 1. Model CPU and GPU devices behind one trait: capacity, reservation, sync.
// 2. Enforce lane budgets through a dedicated lane allocator.
// 3. Route every tensor allocation through a per-ticket forwarding allocator
//    so the resource monitor stays authoritative.
//
// The device layer is simulated: buffers live in host memory, but every pool
// enforces real capacity limits, so exhaustion and paging behave as on
// hardware.

use crate::core::{
    env_flag, env_u64, fmt_bytes, DeviceSpec, Result, Status, ENV_ALLOCATOR_SMALL_OPT,
    ENV_CUDA_HOST_MEM_LIMIT_MB, GIB, KIB, MIB,
};
use crate::monitor::ResourceContext;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

/// Memory the runtime leaves to the driver when reading a GPU's capacity.
pub const GPU_MEMORY_HEADROOM: u64 = 300 * MIB;

/// Configured ceiling on usable per-GPU memory.
pub const DEFAULT_GPU_MEMORY_CAP: u64 = 15 * GIB;

/// Simulated device readout when none is configured.
const DEFAULT_GPU_REPORTED: u64 = 16 * GIB;

const DEFAULT_PINNED_HOST_LIMIT_MB: u64 = 1 << 16; // 64 GiB

/// Allocations below this size are rounded to pool chunks when the
/// small-allocation optimisation is enabled.
const SMALL_ALLOC_THRESHOLD: u64 = 4 * KIB;
const SMALL_ALLOC_CHUNK: u64 = 256;

// ============================================================================
// 1. MEMORY POOLS
// ============================================================================

/// A bounded byte pool. Reservation is the only operation that can fail.
pub struct MemPool {
    capacity: u64,
    used: Mutex<u64>,
    small_opt: bool,
}

impl MemPool {
    pub fn new(capacity: u64) -> Self {
        Self { capacity, used: Mutex::new(0), small_opt: env_flag(ENV_ALLOCATOR_SMALL_OPT) }
    }

    fn rounded(&self, bytes: u64) -> u64 {
        if self.small_opt && bytes < SMALL_ALLOC_THRESHOLD {
            bytes.div_ceil(SMALL_ALLOC_CHUNK) * SMALL_ALLOC_CHUNK
        } else {
            bytes
        }
    }

    pub fn try_reserve(&self, bytes: u64) -> Result<u64> {
        let b = self.rounded(bytes);
        let mut used = self.used.lock();
        if *used + b > self.capacity {
            return Err(Status::resource_exhausted(format!(
                "pool exhausted: want {}, used {} of {}",
                fmt_bytes(b),
                fmt_bytes(*used),
                fmt_bytes(self.capacity)
            )));
        }
        *used += b;
        Ok(b)
    }

    /// Releases a reservation previously returned by `try_reserve`.
    pub fn release(&self, reserved: u64) {
        let mut used = self.used.lock();
        assert!(*used >= reserved, "pool over-release: {} < {}", *used, reserved);
        *used -= reserved;
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        *self.used.lock()
    }
}

// ============================================================================
// 2. THE DEVICE TRAIT
// ============================================================================

pub trait ComputeDevice: Send + Sync {
    fn spec(&self) -> DeviceSpec;

    fn total_memory(&self) -> u64;

    fn available_memory(&self) -> u64;

    /// Reserves physical bytes on the device. Returns the rounded amount.
    fn try_reserve(&self, bytes: u64) -> Result<u64>;

    fn release(&self, reserved: u64);

    /// Drains outstanding device work.
    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> String {
        self.spec().full_name()
    }
}

pub type DeviceRef = Arc<dyn ComputeDevice>;

// ============================================================================
// 3. CPU DEVICE
// ============================================================================

pub struct CpuDevice {
    spec: DeviceSpec,
    pool: MemPool,
    /// Page-locked staging memory for DMA transfers, capped separately.
    pinned_pool: MemPool,
}

impl CpuDevice {
    pub fn new(memory: u64) -> Self {
        let pinned_cap = env_u64(ENV_CUDA_HOST_MEM_LIMIT_MB, DEFAULT_PINNED_HOST_LIMIT_MB) * MIB;
        Self {
            spec: crate::core::CPU0,
            pool: MemPool::new(memory),
            pinned_pool: MemPool::new(pinned_cap),
        }
    }

    pub fn pinned_pool(&self) -> &MemPool {
        &self.pinned_pool
    }
}

impl ComputeDevice for CpuDevice {
    fn spec(&self) -> DeviceSpec {
        self.spec
    }

    fn total_memory(&self) -> u64 {
        self.pool.capacity()
    }

    fn available_memory(&self) -> u64 {
        self.pool.capacity() - self.pool.used()
    }

    fn try_reserve(&self, bytes: u64) -> Result<u64> {
        self.pool.try_reserve(bytes)
    }

    fn release(&self, reserved: u64) {
        self.pool.release(reserved)
    }
}

// ============================================================================
// 4. GPU DEVICE
// ============================================================================

pub struct GpuDevice {
    index: usize,
    spec: DeviceSpec,
    pool: MemPool,
    streams: u64,
}

impl GpuDevice {
    pub fn new(index: usize, memory: u64) -> Self {
        Self {
            index,
            spec: DeviceSpec::gpu(index),
            pool: MemPool::new(memory),
            streams: crate::monitor::GPU_STREAMS,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn streams(&self) -> u64 {
        self.streams
    }
}

impl ComputeDevice for GpuDevice {
    fn spec(&self) -> DeviceSpec {
        self.spec
    }

    fn total_memory(&self) -> u64 {
        self.pool.capacity()
    }

    fn available_memory(&self) -> u64 {
        self.pool.capacity() - self.pool.used()
    }

    fn try_reserve(&self, bytes: u64) -> Result<u64> {
        self.pool.try_reserve(bytes)
    }

    fn release(&self, reserved: u64) {
        self.pool.release(reserved)
    }
}

// ============================================================================
// 5. PLATFORM (Detection)
// ============================================================================

#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub gpu_count: usize,
    /// Configured ceiling on usable GPU memory.
    pub gpu_memory_cap: u64,
    /// Simulated device readout; headroom is subtracted from this.
    pub gpu_reported_memory: Option<u64>,
    pub cpu_memory: Option<u64>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            gpu_count: 1,
            gpu_memory_cap: DEFAULT_GPU_MEMORY_CAP,
            gpu_reported_memory: None,
            cpu_memory: None,
        }
    }
}

pub struct Platform {
    pub cpu: Arc<CpuDevice>,
    pub gpus: Vec<Arc<GpuDevice>>,
}

impl Platform {
    /// Seeds devices from the config: per-GPU usable memory is the device
    /// readout minus driver headroom, capped by the configured ceiling.
    pub fn detect(config: &PlatformConfig) -> Self {
        let cpu_memory = config.cpu_memory.unwrap_or_else(|| {
            let mut sys = System::new_with_specifics(
                RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
            );
            sys.refresh_memory();
            let host = sys.total_memory();
            if host == 0 {
                crate::monitor::DEFAULT_CPU_MEMORY
            } else {
                host.min(crate::monitor::DEFAULT_CPU_MEMORY)
            }
        });

        let reported = config.gpu_reported_memory.unwrap_or(DEFAULT_GPU_REPORTED);
        let usable = reported.saturating_sub(GPU_MEMORY_HEADROOM).min(config.gpu_memory_cap);

        let gpus: Vec<Arc<GpuDevice>> =
            (0..config.gpu_count).map(|i| Arc::new(GpuDevice::new(i, usable))).collect();

        log::info!(
            "Platform: {} GPU(s) x {} usable, CPU memory {}",
            gpus.len(),
            fmt_bytes(usable),
            fmt_bytes(cpu_memory)
        );

        Self { cpu: Arc::new(CpuDevice::new(cpu_memory)), gpus }
    }

    pub fn device(&self, spec: DeviceSpec) -> Option<DeviceRef> {
        match spec.kind {
            crate::core::DeviceKind::Cpu if spec.index == 0 => Some(self.cpu.clone()),
            crate::core::DeviceKind::Gpu => {
                self.gpus.get(spec.index).map(|g| g.clone() as DeviceRef)
            }
            _ => None,
        }
    }

    pub fn gpu_memories(&self) -> Vec<u64> {
        self.gpus.iter().map(|g| g.total_memory()).collect()
    }
}

// ============================================================================
// 6. LANE ALLOCATOR (Budget Slice)
// ============================================================================

/// The allocator backing one lane: a slice of a GPU's memory sized at
/// admission. The budget is an envelope, not a wall: transient peaks may
/// spill into whatever physical memory other lanes left free, and it is
/// physical exhaustion that surfaces as resource-exhausted and triggers
/// paging.
pub struct LaneAllocator {
    gpu: Arc<GpuDevice>,
    budget: MemPool,
    overflow: Mutex<u64>,
}

impl LaneAllocator {
    pub fn new(gpu: Arc<GpuDevice>, capacity: u64) -> Self {
        Self { gpu, budget: MemPool::new(capacity), overflow: Mutex::new(0) }
    }

    pub fn gpu(&self) -> &Arc<GpuDevice> {
        &self.gpu
    }

    /// Returns (reserved bytes, came-from-overflow).
    pub fn try_reserve(&self, bytes: u64) -> Result<(u64, bool)> {
        match self.budget.try_reserve(bytes) {
            Ok(reserved) => {
                // Lanes partition the GPU, so within the budget the physical
                // reserve cannot fail unless accounting diverged.
                if let Err(e) = self.gpu.try_reserve(reserved) {
                    self.budget.release(reserved);
                    return Err(Status::internal(format!(
                        "lane/GPU accounting diverged: {}",
                        e
                    )));
                }
                Ok((reserved, false))
            }
            Err(_) => {
                // Over-budget peak: take from free physical memory if any.
                let reserved = self.gpu.try_reserve(bytes)?;
                *self.overflow.lock() += reserved;
                log::debug!(
                    "Lane on {} overflowed its budget by {} (peak spill)",
                    self.gpu.spec(),
                    fmt_bytes(reserved)
                );
                Ok((reserved, true))
            }
        }
    }

    pub fn release(&self, reserved: u64, from_overflow: bool) {
        if from_overflow {
            let mut overflow = self.overflow.lock();
            assert!(*overflow >= reserved, "lane overflow over-release");
            *overflow -= reserved;
        } else {
            self.budget.release(reserved);
        }
        self.gpu.release(reserved);
    }

    pub fn budget_used(&self) -> u64 {
        self.budget.used()
    }

    pub fn budget_capacity(&self) -> u64 {
        self.budget.capacity()
    }
}

// ============================================================================
// 7. PER-TICKET FORWARDING ALLOCATOR
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocAttributes {
    /// Allocate in (pinned) host memory even for a GPU op.
    pub on_host: bool,
}

/// Notification that a raw buffer was evicted underneath the runtime.
pub type EvictionListener = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Forwards allocations to the right pool while charging the owning ticket
/// through the resource monitor. Buffers keep the allocator alive via their
/// grant handle, so accounting survives session teardown ordering.
pub struct PerOpAllocator {
    device: DeviceRef,
    lane: Option<Arc<LaneAllocator>>,
    host: Arc<CpuDevice>,
    rctx: ResourceContext,
    host_rctx: ResourceContext,
    live: AtomicU64,
    evict_listener: Mutex<Option<EvictionListener>>,
    /// Grants keep the allocator alive through this handle, so accounting
    /// survives any teardown ordering.
    me: std::sync::Weak<PerOpAllocator>,
}

impl PerOpAllocator {
    pub fn new(
        device: DeviceRef,
        lane: Option<Arc<LaneAllocator>>,
        host: Arc<CpuDevice>,
        rctx: ResourceContext,
        host_rctx: ResourceContext,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            device,
            lane,
            host,
            rctx,
            host_rctx,
            live: AtomicU64::new(0),
            evict_listener: Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn ticket(&self) -> u64 {
        self.rctx.ticket()
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn resource_context(&self) -> &ResourceContext {
        &self.rctx
    }

    pub fn live_allocations(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }

    pub fn set_eviction_listener(&self, listener: EvictionListener) {
        *self.evict_listener.lock() = Some(listener);
    }

    /// Called by the allocator substrate when a raw address disappears
    /// underneath us (e.g. an external evicting allocator).
    pub fn notify_evicted(&self, buffer_id: u64) {
        if let Some(cb) = self.evict_listener.lock().as_ref() {
            cb(self.ticket(), buffer_id);
        }
    }

    /// Reserves `bytes` for the ticket: monitor first, then the physical
    /// pool (lane budget for GPU placements). Both must agree or the
    /// reservation is rolled back.
    pub fn allocate(&self, bytes: u64, attrs: AllocAttributes) -> Result<AllocationGrant> {
        let on_host = attrs.on_host || !self.device.spec().is_gpu();
        // Host staging for a GPU-bound session lives in page-locked memory
        // so the DMA path stays zero-copy; plain host placements use the
        // pageable pool.
        let pinned = on_host && self.device.spec().is_gpu();
        let (rctx, reserved) = if on_host {
            self.host_rctx.alloc_memory(bytes)?;
            let pool_reserve = if pinned {
                self.host.pinned_pool().try_reserve(bytes)
            } else {
                self.host.try_reserve(bytes)
            };
            match pool_reserve {
                Ok(r) => (&self.host_rctx, (r, false)),
                Err(e) => {
                    self.host_rctx.free_memory(bytes);
                    return Err(e);
                }
            }
        } else {
            self.rctx.alloc_memory(bytes)?;
            let phys = match &self.lane {
                Some(lane) => lane.try_reserve(bytes),
                None => self.device.try_reserve(bytes).map(|r| (r, false)),
            };
            match phys {
                Ok(r) => (&self.rctx, r),
                Err(e) => {
                    self.rctx.free_memory(bytes);
                    return Err(e);
                }
            }
        };

        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(AllocationGrant {
            allocator: self.me.upgrade().expect("allocator alive"),
            spec: rctx.spec(),
            bytes,
            reserved: reserved.0,
            lane_overflow: reserved.1,
            on_host,
            pinned,
        })
    }

    fn deallocate(&self, grant: &AllocationGrant) {
        if grant.on_host {
            if grant.pinned {
                self.host.pinned_pool().release(grant.reserved);
            } else {
                self.host.release(grant.reserved);
            }
            self.host_rctx.free_memory(grant.bytes);
        } else {
            match &self.lane {
                Some(lane) => lane.release(grant.reserved, grant.lane_overflow),
                None => self.device.release(grant.reserved),
            }
            self.rctx.free_memory(grant.bytes);
        }
        let prev = self.live.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "allocation refcount underflow for ticket {}", self.ticket());
    }
}

/// RAII record of one allocation; dropping it releases pool bytes and
/// monitor accounting together.
pub struct AllocationGrant {
    allocator: Arc<PerOpAllocator>,
    spec: DeviceSpec,
    bytes: u64,
    reserved: u64,
    lane_overflow: bool,
    on_host: bool,
    pinned: bool,
}

impl AllocationGrant {
    pub fn spec(&self) -> DeviceSpec {
        self.spec
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn ticket(&self) -> u64 {
        if self.on_host {
            self.allocator.host_rctx.ticket()
        } else {
            self.allocator.rctx.ticket()
        }
    }

    pub fn allocator(&self) -> &Arc<PerOpAllocator> {
        &self.allocator
    }
}

impl Drop for AllocationGrant {
    fn drop(&mut self) {
        self.allocator.deallocate(self);
    }
}
