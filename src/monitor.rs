// src/monitor.rs
//
// =============================================================================
// SALUS: RESOURCE MONITOR & ALLOCATION REGULATOR
// =============================================================================
//
// The Inventory.
//
// Responsibilities:
// 1. Track system-wide remaining capacity per (type, device) tag.
// 2. Track per-ticket staging (pre-reserved) and in-use accounts.
// 3. Provide atomic reserve / commit / release under one coarse lock.
// 4. Sort paging victims by GPU memory usage for the scheduler.
//
// Accounting invariant, at every instant:
//     limits + Σ(staging) + Σ(in_use) == platform_limits

use crate::core::{fmt_bytes, DeviceSpec, ResourceTag, Resources, Result, Status};

use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

/// Streams a single GPU exposes for concurrent kernel queues.
pub const GPU_STREAMS: u64 = 80;

/// Default CPU memory cap when detection is unavailable.
pub const DEFAULT_CPU_MEMORY: u64 = 50 * crate::core::GIB;

/// Seeds the hardware caps: CPU memory plus per-GPU memory, streams and the
/// exclusivity token.
pub fn platform_limits(cpu_memory: u64, gpu_memories: &[u64]) -> Resources {
    let mut limits = Resources::new();
    limits.set(ResourceTag::memory(crate::core::CPU0), cpu_memory);
    for (i, &mem) in gpu_memories.iter().enumerate() {
        let gpu = DeviceSpec::gpu(i);
        limits.set(ResourceTag::memory(gpu), mem);
        limits.set(ResourceTag::gpu_stream(gpu), GPU_STREAMS);
        limits.set(ResourceTag::exclusive(gpu), 1);
    }
    limits
}

// ============================================================================
// 1. THE MONITOR (Three Accounts)
// ============================================================================

struct MonitorInner {
    /// Remaining system-wide capacity.
    limits: Resources,
    /// Per-ticket pre-reserved resources not yet committed.
    staging: HashMap<u64, Resources>,
    /// Per-ticket committed resources.
    in_use: HashMap<u64, Resources>,
    next_ticket: u64,
}

pub struct ResourceMonitor {
    platform: Resources,
    inner: Mutex<MonitorInner>,
}

impl ResourceMonitor {
    pub fn new(limits: Resources) -> Self {
        Self {
            platform: limits.clone(),
            inner: Mutex::new(MonitorInner {
                limits,
                staging: HashMap::new(),
                in_use: HashMap::new(),
                next_ticket: 0,
            }),
        }
    }

    /// Caps the seeded limits by `cap` for every tag present in both.
    pub fn with_cap(limits: Resources, cap: &Resources) -> Self {
        let mut capped = limits;
        let tags: Vec<ResourceTag> = capped.iter().map(|(t, _)| *t).collect();
        for tag in tags {
            let cur = capped.get(&tag);
            let c = cap.get(&tag);
            if c > 0 && c < cur {
                capped.set(tag, c);
            }
        }
        Self::new(capped)
    }

    /// The limits this monitor was constructed with.
    pub fn platform(&self) -> &Resources {
        &self.platform
    }

    /// Snapshot of the current system-wide remaining capacity.
    pub fn available(&self) -> Resources {
        self.inner.lock().limits.clone()
    }

    /// Reserves `req` for a fresh ticket. On failure returns the missing
    /// subset and leaves every account untouched.
    pub fn pre_allocate(&self, req: &Resources) -> Result<u64, Resources> {
        let mut inner = self.inner.lock();
        if !inner.limits.contains(req) {
            let mut missing = req.clone();
            missing.subtract_clamped(&inner.limits);
            return Err(missing);
        }

        inner.next_ticket += 1;
        let ticket = inner.next_ticket;
        inner.limits.subtract(req);
        inner.staging.insert(ticket, req.clone());
        Ok(ticket)
    }

    /// Commits `res` against `ticket`: staging first (partial satisfaction
    /// allowed), then global limits for the residual.
    pub fn allocate(&self, ticket: u64, res: &Resources) -> bool {
        if ticket == 0 {
            log::error!("Invalid ticket 0 for allocate");
            return false;
        }
        self.inner.lock().allocate(ticket, res)
    }

    /// Returns all remaining staged resources to the global limits.
    pub fn free_staging(&self, ticket: u64) {
        if ticket == 0 {
            log::error!("Invalid ticket 0 for free_staging");
            return;
        }
        let mut inner = self.inner.lock();
        match inner.staging.remove(&ticket) {
            Some(staged) => {
                inner.limits.merge(&staged);
            }
            None => log::error!("Unknown ticket for free_staging: {}", ticket),
        }
    }

    /// Returns `res` to the global limits and debits the ticket's in-use
    /// account. True iff the account became empty and was dropped.
    pub fn free(&self, ticket: u64, res: &Resources) -> bool {
        self.inner.lock().free(ticket, res)
    }

    /// Runs several mutations under a single lock acquisition. Used by the
    /// paging path to reconcile a migration without torn state.
    pub fn lock(&self) -> LockedProxy<'_> {
        LockedProxy { guard: self.inner.lock() }
    }

    pub fn query_usage(&self, ticket: u64) -> Option<Resources> {
        self.inner.lock().in_use.get(&ticket).cloned()
    }

    pub fn query_staging(&self, ticket: u64) -> Option<Resources> {
        self.inner.lock().staging.get(&ticket).cloned()
    }

    pub fn has_usage(&self, ticket: u64) -> bool {
        self.inner.lock().in_use.contains_key(&ticket)
    }

    /// Candidates sorted by decreasing memory in-use on `device`.
    /// Tickets with no usage there are filtered out.
    pub fn sort_victims(&self, candidates: &HashSet<u64>, device: DeviceSpec) -> Vec<(u64, u64)> {
        let tag = ResourceTag::memory(device);
        let mut usages: Vec<(u64, u64)> = Vec::with_capacity(candidates.len());
        {
            let inner = self.inner.lock();
            for &ticket in candidates {
                let Some(usage) = inner.in_use.get(&ticket) else { continue };
                let bytes = usage.get(&tag);
                if bytes > 0 {
                    usages.push((bytes, ticket));
                }
            }
        }
        usages.sort_unstable_by(|a, b| b.cmp(a));
        usages
    }

    /// Multi-line dump of all three accounts, for diagnostics.
    pub fn dump(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::from("ResourceMonitor:\n");
        let _ = writeln!(out, "    Available: {}", inner.limits);

        let mut total = Resources::new();
        for staged in inner.staging.values() {
            total.merge(staged);
        }
        let _ = writeln!(out, "    Staging {} tickets, in total: {}", inner.staging.len(), total);

        let mut total = Resources::new();
        for used in inner.in_use.values() {
            total.merge(used);
        }
        let _ = writeln!(out, "    In use {} tickets, in total: {}", inner.in_use.len(), total);
        out
    }
}

impl MonitorInner {
    fn allocate(&mut self, ticket: u64, res: &Resources) -> bool {
        let mut remaining = res.clone();
        if let Some(staged) = self.staging.get_mut(&ticket) {
            // Fully satisfied from the pre-reservation.
            if staged.contains(&remaining) {
                staged.subtract(&remaining);
                self.in_use.entry(ticket).or_default().merge(res);
                return true;
            }
            // Partially satisfied; compute the residual to take globally.
            remaining.subtract_clamped(staged);
        }

        if !self.limits.contains(&remaining) {
            return false;
        }

        if let Some(staged) = self.staging.get_mut(&ticket) {
            let mut from_staging = res.clone();
            from_staging.subtract(&remaining);
            assert!(staged.contains(&from_staging), "staging account out of sync");
            staged.subtract(&from_staging);
        }

        self.limits.subtract(&remaining);
        self.in_use.entry(ticket).or_default().merge(res);
        true
    }

    fn free(&mut self, ticket: u64, res: &Resources) -> bool {
        // Ticket 0 would desynchronise the monitor from physical usage.
        assert_ne!(ticket, 0, "cannot free against ticket 0");

        self.limits.merge(res);

        let used = self
            .in_use
            .get_mut(&ticket)
            .unwrap_or_else(|| panic!("free for unknown ticket {}", ticket));
        used.subtract(res);
        if used.is_empty() {
            self.in_use.remove(&ticket);
            return true;
        }
        false
    }
}

/// Several monitor mutations under one lock acquisition.
pub struct LockedProxy<'a> {
    guard: MutexGuard<'a, MonitorInner>,
}

impl LockedProxy<'_> {
    pub fn allocate(&mut self, ticket: u64, res: &Resources) -> bool {
        if ticket == 0 {
            log::error!("Invalid ticket 0 for allocate");
            return false;
        }
        self.guard.allocate(ticket, res)
    }

    pub fn free(&mut self, ticket: u64, res: &Resources) -> bool {
        self.guard.free(ticket, res)
    }

    pub fn query_staging(&self, ticket: u64) -> Option<Resources> {
        self.guard.staging.get(&ticket).cloned()
    }

    pub fn query_usage(&self, ticket: u64) -> Option<Resources> {
        self.guard.in_use.get(&ticket).cloned()
    }
}

// ============================================================================
// 2. RESOURCE CONTEXT (Commit Handle)
// ============================================================================

/// Ties an allocation ticket to a device. Allocators route every byte they
/// hand out through one of these so the monitor stays authoritative.
#[derive(Clone)]
pub struct ResourceContext {
    monitor: Arc<ResourceMonitor>,
    ticket: u64,
    spec: DeviceSpec,
}

impl ResourceContext {
    pub fn new(monitor: Arc<ResourceMonitor>, ticket: u64, spec: DeviceSpec) -> Self {
        Self { monitor, ticket, spec }
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn spec(&self) -> DeviceSpec {
        self.spec
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn alloc_memory(&self, bytes: u64) -> Result<()> {
        let res = Resources::single(ResourceTag::memory(self.spec), bytes);
        if self.monitor.allocate(self.ticket, &res) {
            Ok(())
        } else {
            Err(Status::resource_exhausted(format!(
                "ticket {} cannot allocate {} on {}",
                self.ticket,
                fmt_bytes(bytes),
                self.spec
            )))
        }
    }

    pub fn free_memory(&self, bytes: u64) {
        let res = Resources::single(ResourceTag::memory(self.spec), bytes);
        self.monitor.free(self.ticket, &res);
    }
}

impl std::fmt::Debug for ResourceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResourceContext(ticket={}, spec={})", self.ticket, self.spec)
    }
}

// ============================================================================
// 3. ALLOCATION REGULATOR (Session-Lifetime Holds)
// ============================================================================

/// Ticket naming a session-lifetime allocation hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobTicket(pub u64);

struct RegulatorInner {
    limits: Resources,
    jobs: HashMap<JobTicket, Resources>,
    next: u64,
}

/// Grants coarse session-lifetime holds, a separate account layered above
/// the monitor's per-iteration commits.
pub struct AllocationRegulator {
    inner: Mutex<RegulatorInner>,
}

impl AllocationRegulator {
    pub fn new(limits: Resources) -> Self {
        Self {
            inner: Mutex::new(RegulatorInner { limits, jobs: HashMap::new(), next: 0 }),
        }
    }

    pub fn register_job(&self) -> JobTicket {
        let mut inner = self.inner.lock();
        inner.next += 1;
        let t = JobTicket(inner.next);
        inner.jobs.insert(t, Resources::new());
        t
    }

    pub fn begin_allocation(&self, ticket: JobTicket, res: &Resources) -> bool {
        let mut inner = self.inner.lock();
        if !inner.limits.contains(res) {
            return false;
        }
        inner.limits.subtract(res);
        inner.jobs.entry(ticket).or_default().merge(res);

        log::debug!("Start session allocation hold: ticket={}, res={}", ticket.0, res);
        true
    }

    pub fn end_allocation(&self, ticket: JobTicket, res: &Resources) {
        let mut inner = self.inner.lock();
        // finish_job may have run already; tolerate the race.
        let Some(inuse) = inner.jobs.get_mut(&ticket) else { return };
        let released = inuse.subtract_bounded(res);
        inner.limits.merge(&released);

        log::debug!("End session allocation hold: ticket={}, released={}", ticket.0, released);
    }

    pub fn finish_job(&self, ticket: JobTicket) {
        let mut inner = self.inner.lock();
        if let Some(inuse) = inner.jobs.remove(&ticket) {
            inner.limits.merge(&inuse);
        }
    }

    pub fn available(&self) -> Resources {
        self.inner.lock().limits.clone()
    }
}
