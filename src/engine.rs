// src/engine.rs
//
// =============================================================================
// SALUS: EXECUTION ENGINE
// =============================================================================
//
// The Local Scheduler.
//
// Responsibilities:
// 1. Own the execution contexts of every registered job.
// 2. Keep one FIFO iteration queue per active lane.
// 3. Run the scheduling thread: wake on work, round-robin over lane queues,
//    gate expensive iterations and exclusive-mode sessions, honour the
//    head-of-line waiting limit.
// 4. Relieve memory pressure by volunteering other sessions' tensors for
//    paging, largest GPU user first.

use crate::core::{DeviceSpec, Resources, SchedulingParam, CPU0};
use crate::lanes::{LaneHolder, LaneMgr};
use crate::monitor::{AllocationRegulator, JobTicket, ResourceContext, ResourceMonitor};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

// ============================================================================
// 1. SMALL CONCURRENCY UTILITIES
// ============================================================================

/// One-to-many wakeup flag with timeout support.
pub struct Notification {
    flag: Mutex<bool>,
    cv: Condvar,
}

impl Default for Notification {
    fn default() -> Self {
        Self::new()
    }
}

impl Notification {
    pub fn new() -> Self {
        Self { flag: Mutex::new(false), cv: Condvar::new() }
    }

    pub fn notify(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.cv.notify_all();
    }

    /// Waits until notified or the timeout elapses. Returns true when the
    /// wakeup was a real notification.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut flag = self.flag.lock();
        if !*flag {
            self.cv.wait_for(&mut flag, timeout);
        }
        let fired = *flag;
        *flag = false;
        fired
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Fixed worker pool for kernel execution.
pub struct ThreadPool {
    tx: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
    size: usize,
}

impl ThreadPool {
    pub fn new(size: usize) -> Arc<Self> {
        let size = size.max(1);
        let (tx, rx): (Sender<Job>, Receiver<Job>) = unbounded();
        let mut handles = Vec::with_capacity(size);
        for i in 0..size {
            let rx = rx.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("salus-worker-{}", i))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn worker thread"),
            );
        }
        Arc::new(Self { tx: Mutex::new(Some(tx)), handles: Mutex::new(handles), size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(Box::new(job));
        }
    }

    /// Closes the queue and joins every worker.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        for h in self.handles.lock().drain(..) {
            let _ = h.join();
        }
    }
}

// ============================================================================
// 2. SESSIONS & ITERATION TASKS
// ============================================================================

/// How a session volunteers tensors when another job needs its memory:
/// given the victim ticket and a resource context on the target device,
/// returns bytes freed.
pub struct PagingCallbacks {
    pub volunteer: Box<dyn Fn(u64, ResourceContext) -> u64 + Send + Sync>,
}

type InterruptCallback = Box<dyn FnOnce() + Send>;

/// Engine-side state of one registered job.
pub struct SessionItem {
    pub id: u64,
    handle: Mutex<String>,
    lane_id: AtomicU64,
    gpu_index: AtomicU64,
    /// Sessions start exclusive; dropped after the first good iteration.
    exclusive: AtomicBool,
    expected_runtime_ms: AtomicU64,
    priority: AtomicU64,
    num_expensive_running: AtomicI64,
    cancelled: AtomicBool,
    paging_cb: Mutex<Option<PagingCallbacks>>,
    interrupt_cb: Mutex<Option<InterruptCallback>>,
    /// Allocation ticket charged for this session's tensors.
    ticket: AtomicU64,
    user_data: Mutex<Option<Box<dyn std::any::Any + Send>>>,
    holds: Mutex<Vec<LaneHolder>>,
}

impl SessionItem {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            handle: Mutex::new(String::new()),
            lane_id: AtomicU64::new(0),
            gpu_index: AtomicU64::new(0),
            exclusive: AtomicBool::new(true),
            expected_runtime_ms: AtomicU64::new(0),
            priority: AtomicU64::new(20),
            num_expensive_running: AtomicI64::new(0),
            cancelled: AtomicBool::new(false),
            paging_cb: Mutex::new(None),
            interrupt_cb: Mutex::new(None),
            ticket: AtomicU64::new(0),
            user_data: Mutex::new(None),
            holds: Mutex::new(Vec::new()),
        })
    }

    pub fn handle(&self) -> String {
        self.handle.lock().clone()
    }

    pub fn lane_id(&self) -> u64 {
        self.lane_id.load(Ordering::SeqCst)
    }

    pub fn gpu_index(&self) -> usize {
        self.gpu_index.load(Ordering::SeqCst) as usize
    }

    pub fn ticket(&self) -> u64 {
        self.ticket.load(Ordering::SeqCst)
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn priority(&self) -> u64 {
        self.priority.load(Ordering::SeqCst)
    }

    pub fn expected_runtime_ms(&self) -> u64 {
        self.expected_runtime_ms.load(Ordering::SeqCst)
    }
}

/// One runnable iteration, bound to an execution context.
pub trait IterationTask: Send {
    fn graph_id(&self) -> u64;

    /// The job's main training iteration, gated one-at-a-time per session.
    fn is_expensive(&self) -> bool;

    fn cancel(&self);

    fn is_cancelled(&self) -> bool;

    /// Hand the iteration to the dataflow executor. Must not block the
    /// scheduling thread; completion is signalled through `ictx.done`.
    fn run_async(self: Box<Self>, ictx: IterationContext);
}

/// Carried into `run_async`; `done` must be called exactly once.
pub struct IterationContext {
    pub graph_id: u64,
    pub lane_id: u64,
    pub done: Box<dyn FnOnce() + Send>,
}

struct IterationItem {
    session: Weak<SessionItem>,
    task: Box<dyn IterationTask>,
}

struct LaneQueue {
    id: u64,
    queue: VecDeque<IterationItem>,
    sessions: HashSet<u64>,
    last_seen: Instant,
    num_expensive_running: Arc<AtomicI64>,
    /// Session currently holding the lane's exclusivity token.
    exclusive_owner: Option<u64>,
}

// ============================================================================
// 3. THE ENGINE
// ============================================================================

struct EngineInner {
    queues: BTreeMap<u64, LaneQueue>,
    sessions: HashMap<u64, Arc<SessionItem>>,
}

pub struct ExecutionEngine {
    pool: Arc<ThreadPool>,
    monitor: Arc<ResourceMonitor>,
    regulator: Arc<AllocationRegulator>,
    lane_mgr: Arc<LaneMgr>,
    param: SchedulingParam,

    inner: Mutex<EngineInner>,
    note_has_work: Arc<Notification>,
    interrupting: AtomicBool,
    sched_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    next_session_id: AtomicU64,
    me: Weak<ExecutionEngine>,
}

impl ExecutionEngine {
    pub fn new(
        param: SchedulingParam,
        monitor: Arc<ResourceMonitor>,
        regulator: Arc<AllocationRegulator>,
        lane_mgr: Arc<LaneMgr>,
    ) -> Arc<Self> {
        // workers == 0 means "size to the machine".
        let workers = if param.workers == 0 { num_cpus::get() } else { param.workers };
        let pool = ThreadPool::new(workers);
        Arc::new_cyclic(|me| Self {
            pool,
            monitor,
            regulator,
            lane_mgr,
            param,
            inner: Mutex::new(EngineInner { queues: BTreeMap::new(), sessions: HashMap::new() }),
            note_has_work: Arc::new(Notification::new()),
            interrupting: AtomicBool::new(false),
            sched_thread: Mutex::new(None),
            next_session_id: AtomicU64::new(0),
            me: me.clone(),
        })
    }

    fn arc(&self) -> Arc<ExecutionEngine> {
        self.me.upgrade().expect("engine alive")
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn regulator(&self) -> &Arc<AllocationRegulator> {
        &self.regulator
    }

    pub fn lane_mgr(&self) -> &Arc<LaneMgr> {
        &self.lane_mgr
    }

    pub fn scheduling_param(&self) -> &SchedulingParam {
        &self.param
    }

    pub fn start_scheduler(&self) {
        let mut guard = self.sched_thread.lock();
        if guard.is_some() {
            return;
        }
        let engine = self.arc();
        *guard = Some(
            std::thread::Builder::new()
                .name("salus-sched".into())
                .spawn(move || engine.schedule_loop())
                .expect("failed to spawn scheduler thread"),
        );
        log::info!("🛡️ Scheduler active ({} workers)", self.pool.size());
    }

    pub fn stop_scheduler(&self) {
        self.interrupting.store(true, Ordering::SeqCst);
        self.note_has_work.notify();
        if let Some(h) = self.sched_thread.lock().take() {
            let _ = h.join();
        }
    }

    /// Registers a job and returns its execution context.
    pub fn make_context(&self) -> Arc<ExecutionContext> {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        let item = SessionItem::new(id);
        self.inner.lock().sessions.insert(id, item.clone());
        let job_ticket = self.regulator.register_job();
        Arc::new(ExecutionContext { engine: self.arc(), item, job_ticket })
    }

    fn remove_session(&self, id: u64) {
        let mut inner = self.inner.lock();
        inner.sessions.remove(&id);
        for q in inner.queues.values_mut() {
            q.sessions.remove(&id);
        }
        inner.queues.retain(|_, q| !q.queue.is_empty() || !q.sessions.is_empty());
    }

    // ------------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------------

    fn schedule_iteration(&self, session: &Arc<SessionItem>, task: Box<dyn IterationTask>) {
        let lane_id = session.lane_id();
        {
            let mut inner = self.inner.lock();
            let q = inner.queues.entry(lane_id).or_insert_with(|| LaneQueue {
                id: lane_id,
                queue: VecDeque::new(),
                sessions: HashSet::new(),
                last_seen: Instant::now(),
                num_expensive_running: Arc::new(AtomicI64::new(0)),
                exclusive_owner: None,
            });
            q.sessions.insert(session.id);
            q.queue.push_back(IterationItem { session: Arc::downgrade(session), task });
        }
        self.note_has_work.notify();
    }

    /// Tears the session out of the scheduler: queued iterations complete
    /// as cancelled, then the interrupt callback fires.
    pub fn force_close(&self, session_id: u64) {
        let (cancelled_items, session) = {
            let mut inner = self.inner.lock();
            let session = inner.sessions.get(&session_id).cloned();
            let mut items = Vec::new();
            for q in inner.queues.values_mut() {
                let mut remaining = VecDeque::new();
                while let Some(item) = q.queue.pop_front() {
                    let belongs = item
                        .session
                        .upgrade()
                        .map(|s| s.id == session_id)
                        .unwrap_or(false);
                    if belongs {
                        items.push(item);
                    } else {
                        remaining.push_back(item);
                    }
                }
                q.queue = remaining;
            }
            inner.sessions.remove(&session_id);
            (items, session)
        };

        if let Some(session) = &session {
            session.cancelled.store(true, Ordering::SeqCst);
            log::info!("⛔ Force close session {} ({})", session_id, session.handle());
        }

        // Cancelled iterations still run their completion path so the
        // front-end observes a cancelled status.
        for item in cancelled_items {
            item.task.cancel();
            let lane_id = item.session.upgrade().map(|s| s.lane_id()).unwrap_or(0);
            item.task.run_async(IterationContext {
                graph_id: 0,
                lane_id,
                done: Box::new(|| {}),
            });
        }

        if let Some(session) = session {
            if let Some(cb) = session.interrupt_cb.lock().take() {
                cb();
            }
        }
        self.note_has_work.notify();
    }

    // ------------------------------------------------------------------------
    // Scheduling thread
    // ------------------------------------------------------------------------

    const BACKOFF_FLOOR: Duration = Duration::from_micros(1);
    const BACKOFF_CAP: Duration = Duration::from_millis(10);

    fn schedule_loop(self: Arc<Self>) {
        let mut backoff = Self::BACKOFF_FLOOR;
        while !self.interrupting.load(Ordering::SeqCst) {
            let (scheduled, pending) = self.schedule_pass();

            if scheduled > 0 {
                backoff = Self::BACKOFF_FLOOR;
                continue;
            }

            if pending == 0 {
                self.note_has_work.wait_timeout(Self::BACKOFF_CAP);
                backoff = Self::BACKOFF_FLOOR;
            } else {
                // Work exists but nothing was runnable; back off, bounded by
                // the smallest running iteration's expected runtime.
                let mut sleep = backoff;
                if self.param.work_conservative {
                    if let Some(ms) = self.smallest_running_expectation() {
                        sleep = sleep.min(Duration::from_millis(ms.max(1)));
                    }
                }
                if self.note_has_work.wait_timeout(sleep) {
                    backoff = Self::BACKOFF_FLOOR;
                } else {
                    backoff = (backoff * 2).min(Self::BACKOFF_CAP);
                }
            }
        }
        log::info!("👋 Scheduler stopped");
    }

    fn smallest_running_expectation(&self) -> Option<u64> {
        let inner = self.inner.lock();
        inner
            .sessions
            .values()
            .filter(|s| s.num_expensive_running.load(Ordering::SeqCst) > 0)
            .map(|s| s.expected_runtime_ms())
            .filter(|&ms| ms > 0)
            .min()
    }

    /// One round-robin pass over all lane queues. Returns (scheduled, still
    /// pending).
    fn schedule_pass(&self) -> (usize, usize) {
        struct Staged {
            task: Box<dyn IterationTask>,
            session: Arc<SessionItem>,
            lane_counter: Arc<AtomicI64>,
            lane_id: u64,
        }

        let mut staged: Vec<Staged> = Vec::new();
        let pending;
        {
            let mut inner = self.inner.lock();
            let session_table: HashMap<u64, Arc<SessionItem>> = inner.sessions.clone();

            for q in inner.queues.values_mut() {
                q.last_seen = Instant::now();

                // The exclusivity token self-heals: a vanished or now-shared
                // owner releases it.
                if let Some(owner) = q.exclusive_owner {
                    let still_holds = session_table
                        .get(&owner)
                        .map(|s| s.is_exclusive())
                        .unwrap_or(false);
                    if !still_holds {
                        q.exclusive_owner = None;
                    }
                }

                let mut hol_waiting = 0usize;
                let mut kept: VecDeque<IterationItem> = VecDeque::new();
                while let Some(item) = q.queue.pop_front() {
                    let Some(session) = item.session.upgrade() else {
                        // Session died; drop its work on the floor.
                        continue;
                    };

                    if item.task.is_cancelled() || session.is_cancelled() {
                        item.task.cancel();
                        staged.push(Staged {
                            task: item.task,
                            session: session.clone(),
                            lane_counter: q.num_expensive_running.clone(),
                            lane_id: q.id,
                        });
                        continue;
                    }

                    // Exclusive mode: only the token holder may start
                    // iterations on this lane.
                    let blocked_exclusive = match q.exclusive_owner {
                        Some(owner) => owner != session.id,
                        None => false,
                    };
                    // Expensive gating: one main iteration per session.
                    let blocked_expensive = item.task.is_expensive()
                        && session.num_expensive_running.load(Ordering::SeqCst) > 0;

                    if blocked_exclusive || blocked_expensive {
                        hol_waiting += 1;
                        kept.push_back(item);
                        if hol_waiting > self.param.max_hol_waiting {
                            break;
                        }
                        continue;
                    }

                    // First iteration of an exclusive session claims the
                    // token; it is released by drop_exclusive_mode.
                    if q.exclusive_owner.is_none() && session.is_exclusive() {
                        q.exclusive_owner = Some(session.id);
                    }

                    staged.push(Staged {
                        task: item.task,
                        session,
                        lane_counter: q.num_expensive_running.clone(),
                        lane_id: q.id,
                    });
                }
                // Preserve FIFO order for everything not staged.
                while let Some(item) = q.queue.pop_front() {
                    kept.push_back(item);
                }
                q.queue = kept;
            }

            pending = inner.queues.values().map(|q| q.queue.len()).sum();
        }

        let scheduled = staged.len();
        for s in staged {
            let expensive = s.task.is_expensive() && !s.task.is_cancelled();
            if expensive {
                s.session.num_expensive_running.fetch_add(1, Ordering::SeqCst);
                s.lane_counter.fetch_add(1, Ordering::SeqCst);
            }
            let session = s.session.clone();
            let lane_counter = s.lane_counter.clone();
            let note = self.note_has_work.clone();
            let graph_id = s.task.graph_id();
            s.task.run_async(IterationContext {
                graph_id,
                lane_id: s.lane_id,
                done: Box::new(move || {
                    if expensive {
                        session.num_expensive_running.fetch_sub(1, Ordering::SeqCst);
                        lane_counter.fetch_sub(1, Ordering::SeqCst);
                    }
                    note.notify();
                }),
            });
        }
        (scheduled, pending)
    }

    // ------------------------------------------------------------------------
    // Paging
    // ------------------------------------------------------------------------

    /// Finds the heaviest co-resident tickets on `spec` and asks them to
    /// volunteer tensors onto `target`. Returns true when bytes moved.
    pub fn do_paging(&self, requester: u64, spec: DeviceSpec, target: DeviceSpec) -> bool {
        let candidates: Vec<(u64, Arc<SessionItem>)> = {
            let inner = self.inner.lock();
            inner
                .sessions
                .values()
                .filter(|s| s.id != requester)
                .filter(|s| s.ticket() != 0)
                .filter(|s| s.paging_cb.lock().is_some())
                .map(|s| (s.ticket(), s.clone()))
                .collect()
        };
        if candidates.is_empty() {
            log::warn!("No paging candidates for pressure on {}", spec);
            return false;
        }

        let tickets: HashSet<u64> = candidates.iter().map(|(t, _)| *t).collect();
        let victims = self.monitor.sort_victims(&tickets, spec);
        let by_ticket: HashMap<u64, Arc<SessionItem>> = candidates.into_iter().collect();

        for (bytes_in_use, ticket) in victims {
            let Some(session) = by_ticket.get(&ticket) else { continue };
            let Ok(target_ticket) = self.monitor.pre_allocate(&Resources::new()) else {
                continue;
            };
            let rctx = ResourceContext::new(self.monitor.clone(), target_ticket, target);

            let freed = {
                let cb = session.paging_cb.lock();
                match cb.as_ref() {
                    Some(pcb) => (pcb.volunteer)(ticket, rctx),
                    None => 0,
                }
            };

            // One consistent snapshot of both accounts for the log.
            {
                let proxy = self.monitor.lock();
                let old_usage = proxy.query_usage(ticket).unwrap_or_default();
                let new_usage = proxy.query_usage(target_ticket).unwrap_or_default();
                log::info!(
                    "Paging victim ticket {} ({} in use on {}): freed {} bytes; now old={}, target={}",
                    ticket,
                    bytes_in_use,
                    spec,
                    freed,
                    old_usage,
                    new_usage
                );
            }

            if freed > 0 {
                return true;
            }
            self.monitor.free_staging(target_ticket);
        }
        false
    }
}

// ============================================================================
// 4. EXECUTION CONTEXT (Per-Job Facade)
// ============================================================================

pub struct ExecutionContext {
    engine: Arc<ExecutionEngine>,
    item: Arc<SessionItem>,
    job_ticket: JobTicket,
}

impl ExecutionContext {
    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn item(&self) -> &Arc<SessionItem> {
        &self.item
    }

    pub fn job_ticket(&self) -> JobTicket {
        self.job_ticket
    }

    pub fn session_id(&self) -> u64 {
        self.item.id
    }

    pub fn schedule_iteration(&self, task: Box<dyn IterationTask>) {
        self.engine.schedule_iteration(&self.item, task);
    }

    pub fn register_paging_callbacks(&self, pcb: PagingCallbacks) {
        *self.item.paging_cb.lock() = Some(pcb);
    }

    pub fn set_interrupt_callback(&self, cb: impl FnOnce() + Send + 'static) {
        *self.item.interrupt_cb.lock() = Some(Box::new(cb));
    }

    pub fn set_session_handle(&self, handle: &str) {
        *self.item.handle.lock() = handle.to_string();
    }

    pub fn set_user_data(&self, data: Box<dyn std::any::Any + Send>) {
        *self.item.user_data.lock() = Some(data);
    }

    pub fn set_ticket(&self, ticket: u64) {
        self.item.ticket.store(ticket, Ordering::SeqCst);
    }

    pub fn set_lane(&self, holder: &LaneHolder) {
        self.item.lane_id.store(holder.lane_id(), Ordering::SeqCst);
        self.item.gpu_index.store(holder.gpu_index() as u64, Ordering::SeqCst);
    }

    /// Direct lane assignment for laneless (CPU-only) sessions.
    pub fn set_lane_id(&self, lane_id: u64) {
        self.item.lane_id.store(lane_id, Ordering::SeqCst);
    }

    pub fn take_holds(&self, holds: Vec<LaneHolder>) {
        *self.item.holds.lock() = holds;
    }

    pub fn set_expected_running_time(&self, ms: u64) {
        self.item.expected_runtime_ms.store(ms, Ordering::SeqCst);
    }

    pub fn set_priority(&self, priority: u64) {
        self.item.priority.store(priority, Ordering::SeqCst);
    }

    /// Sharing opt-in after the first successful iteration.
    pub fn drop_exclusive_mode(&self) {
        self.item.exclusive.store(false, Ordering::SeqCst);
        self.engine.note_has_work.notify();
    }

    /// Resource context charging `res` against this session on `spec`.
    /// On failure reports the missing subset.
    pub fn make_resource_context(
        &self,
        spec: DeviceSpec,
        res: &Resources,
    ) -> Result<ResourceContext, Resources> {
        let ticket = self.engine.monitor.pre_allocate(res)?;
        self.item.ticket.store(ticket, Ordering::SeqCst);
        Ok(ResourceContext::new(self.engine.monitor.clone(), ticket, spec))
    }

    /// Drains this session's queue, then releases tickets and lane holds.
    pub fn finish(&self, cb: impl FnOnce() + Send + 'static) {
        let ticket = self.item.ticket();
        if ticket != 0 {
            self.engine.monitor.free_staging(ticket);
        }
        self.engine.regulator.finish_job(self.job_ticket);
        self.engine.remove_session(self.item.id);
        self.item.holds.lock().clear();
        cb();
    }

    pub fn force_close(&self) {
        self.engine.force_close(self.item.id);
        self.item.holds.lock().clear();
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.engine.remove_session(self.item.id);
    }
}

/// Default paging target: host memory is the only device with guaranteed
/// headroom.
pub const PAGING_TARGET: DeviceSpec = CPU0;
