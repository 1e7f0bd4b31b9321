// src/executor.rs
//
// =============================================================================
// SALUS: PER-ITERATION DATAFLOW EXECUTOR
// =============================================================================
//
// Runs one iteration's graph to completion: pending-count scheduling, loop
// frames, dead propagation, device placement and paging integration.
//
// Execution model:
// - A node becomes ready when its pending count reaches zero; ready nodes
//   run inline on the current worker (cheap ops) or are dispatched to the
//   worker pool (expensive ops).
// - Control flow executes through frames: Enter crosses into a child frame,
//   Exit back to the parent, NextIteration into the next iteration of the
//   same frame, bounded by the frame's parallel-iteration window.
// - A kernel failing with resource-exhausted retries after asking the
//   engine to page other tickets out, up to max_failures.
//
// Lock discipline: at most one frame lock is held at a time; buffer-tree
// registration nests under the frame lock (frame -> buffer-tree).

use crate::core::{DeviceSpec, ResourceTag, Resources, Result, Status};
use crate::device::PerOpAllocator;
use crate::engine::ThreadPool;
use crate::graph::{FrameInfo, GraphView, NodeClass, NodeItem};
use crate::ops::{CostCache, OpKernelContext, OutputValue, Rendezvous};
use crate::paging::{ActiveBuffers, TensorBufferTree};
use crate::tensor::{move_entry_tensor, Entry, EntryRef, EntryValue, Tensor};

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};

/// Asks the engine to relieve memory pressure on a device. Returns true if
/// any bytes were reclaimed.
pub type PressureCallback = Arc<dyn Fn(DeviceSpec) -> bool + Send + Sync>;

pub type ExecutorDone = Box<dyn FnOnce(Result<HashMap<String, Tensor>>) + Send>;

// ============================================================================
// 1. PARAMETERS & STATE
// ============================================================================

pub struct ExecutorParams {
    pub gview: Arc<GraphView>,
    pub step_id: u64,
    /// Forwarding allocator bound to the session's lane device and ticket.
    pub allocator: Arc<PerOpAllocator>,
    pub rendezvous: Arc<Rendezvous>,
    pub variables: crate::ops::VarStore,
    pub active_buffers: Arc<ActiveBuffers>,
    pub cost_cache: Arc<CostCache>,
    pub pool: Arc<ThreadPool>,
    pub pressure_cb: Option<PressureCallback>,
    pub max_failures: u32,
    /// Single-stream mode: every ready node runs inline, in order.
    pub si_mode: bool,
    /// Inference iterations skip the final device sync.
    pub is_inference: bool,
    /// Cleared at completion so fed tensors release with the iteration.
    pub feeds: Mutex<HashMap<String, Tensor>>,
    pub fetches: Vec<String>,
}

#[derive(Clone)]
struct TaggedNode {
    node: usize,
    frame: Arc<FrameState>,
    iter: u64,
    is_dead: bool,
}

struct PendingState {
    pending: i32,
    dead_count: i32,
    /// A node fires exactly once per iteration; Merge inputs keep arriving
    /// after readiness and must not re-trigger it.
    started: bool,
}

struct IterationState {
    id: u64,
    input_tensors: Vec<EntryRef>,
    pending: HashMap<usize, PendingState>,
    outstanding_ops: usize,
    outstanding_frames: usize,
}

impl IterationState {
    fn new(id: u64, info: &FrameInfo) -> Self {
        let input_tensors =
            (0..info.total_inputs).map(|_| Arc::new(Mutex::new(Entry::default()))).collect();
        let pending = info
            .pending_init
            .iter()
            .map(|(&node, &init)| {
                (node, PendingState { pending: init, dead_count: 0, started: false })
            })
            .collect();
        Self { id, input_tensors, pending, outstanding_ops: 0, outstanding_frames: 0 }
    }
}

struct FrameInner {
    /// Active window; front is the oldest live iteration.
    iterations: VecDeque<IterationState>,
    front_id: u64,
    /// Total iterations started; the id the next iteration will get.
    iteration_count: u64,
    /// NextIteration values waiting for window space.
    next_iter_roots: Vec<(usize, Option<Entry>)>,
    /// Constant-Enter values broadcast to all current and future iterations.
    loop_invariants: Vec<(usize, Option<Entry>, bool)>,
    /// Exit nodes whose dead value is withheld until the frame finishes.
    dead_exits: Vec<usize>,
    /// Exit nodes that already delivered a live value to the parent.
    exits_delivered: Vec<usize>,
    /// Enter arrivals this dynamic frame still waits for.
    pending_enters: usize,
    completed: bool,
}

struct FrameState {
    /// Index into GraphView::frames.
    info: usize,
    /// Dynamic name: `parent_name + ";" + parent_iter + ";" + static_name`.
    name: String,
    parent: Option<(Arc<FrameState>, u64)>,
    max_parallel: usize,
    inner: Mutex<FrameInner>,
}

impl FrameState {
    fn new(
        info_idx: usize,
        info: &FrameInfo,
        name: String,
        parent: Option<(Arc<FrameState>, u64)>,
    ) -> Arc<Self> {
        let mut inner = FrameInner {
            iterations: VecDeque::new(),
            front_id: 0,
            iteration_count: 0,
            next_iter_roots: Vec::new(),
            loop_invariants: Vec::new(),
            dead_exits: Vec::new(),
            exits_delivered: Vec::new(),
            pending_enters: info.enter_count,
            completed: false,
        };
        inner.iterations.push_back(IterationState::new(0, info));
        inner.iteration_count = 1;
        Arc::new(Self {
            info: info_idx,
            name,
            parent,
            max_parallel: info.max_parallel_iterations,
            inner: Mutex::new(inner),
        })
    }
}

pub struct ExecutorState {
    params: ExecutorParams,
    root_frame: Arc<FrameState>,
    /// Dynamic frames by name.
    frames: Mutex<HashMap<String, Arc<FrameState>>>,
    outstanding_ops: AtomicI64,
    cancelled: AtomicBool,
    first_error: Mutex<Option<Status>>,
    oom_failures: Mutex<HashMap<usize, u32>>,
    fetch_results: Mutex<HashMap<String, Tensor>>,
    done: Mutex<Option<ExecutorDone>>,
    /// Self-handle for work handed to the pool and async completions.
    me: Weak<ExecutorState>,
}

// ============================================================================
// 2. LIFECYCLE
// ============================================================================

impl ExecutorState {
    pub fn new(params: ExecutorParams) -> Arc<Self> {
        let gview = params.gview.clone();
        let root_idx = gview
            .frame_index(crate::graph::ROOT_FRAME)
            .expect("graph view always has a root frame");
        let root_frame =
            FrameState::new(root_idx, &gview.frames[root_idx], String::new(), None);

        Arc::new_cyclic(|me| Self {
            params,
            root_frame,
            frames: Mutex::new(HashMap::new()),
            outstanding_ops: AtomicI64::new(0),
            cancelled: AtomicBool::new(false),
            first_error: Mutex::new(None),
            oom_failures: Mutex::new(HashMap::new()),
            fetch_results: Mutex::new(HashMap::new()),
            done: Mutex::new(None),
            me: me.clone(),
        })
    }

    fn gview(&self) -> &GraphView {
        &self.params.gview
    }

    fn arc(&self) -> Arc<ExecutorState> {
        self.me.upgrade().expect("executor state alive while running")
    }

    /// Starts the iteration; `done` fires exactly once with the fetched
    /// tensors or the first error.
    pub fn run_async(&self, done: ExecutorDone) {
        *self.done.lock() = Some(done);

        self.prefetch_recv_shapes();

        // Seed the ready queue with the graph roots in iteration 0.
        let roots: Vec<TaggedNode> = self
            .gview()
            .roots
            .iter()
            .map(|&id| TaggedNode {
                node: id,
                frame: self.root_frame.clone(),
                iter: 0,
                is_dead: false,
            })
            .collect();

        {
            let mut inner = self.root_frame.inner.lock();
            let iter = inner.iterations.front_mut().expect("iteration 0 exists");
            iter.outstanding_ops += roots.len();
        }
        self.outstanding_ops.fetch_add(roots.len() as i64, Ordering::SeqCst);

        if roots.is_empty() {
            self.finish();
            return;
        }
        self.run_ready(roots);
    }

    /// Cooperative cancellation: already-running kernels finish but their
    /// outputs are discarded.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.record_error(Status::cancelled("iteration cancelled"));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Records the first error and cancels descendants: nothing propagates
    /// once the iteration is failing.
    fn record_error(&self, status: Status) {
        {
            let mut err = self.first_error.lock();
            if err.is_none() {
                *err = Some(status);
            }
        }
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// For senders that already terminated, the rendezvous knows delivered
    /// shapes; record them so allocation estimates stay accurate.
    fn prefetch_recv_shapes(&self) {
        for &id in &self.gview().recv_nodes {
            let item = &self.gview().nodes[id];
            let Some(key) = item.attrs.get("tensor_name").and_then(|v| v.as_str()) else {
                continue;
            };
            if let Some((dtype, shape)) = self.params.rendezvous.delivered_shape(key) {
                let bytes = (shape.num_elements() * dtype.size_of()) as u64;
                let spec = self.params.allocator.device().spec();
                self.params
                    .cost_cache
                    .update(&item.name, Resources::single(ResourceTag::memory(spec), bytes));
                log::debug!("Prefetched recv shape for {}: {} ({} bytes)", item.name, shape, bytes);
            }
        }
    }

    fn finish(&self) {
        let Some(done) = self.done.lock().take() else { return };

        let err = self.first_error.lock().clone();
        let result = match err {
            Some(e) => Err(e),
            None => {
                // Drain outstanding device work; inference skips the sync.
                let sync = if self.params.is_inference {
                    Ok(())
                } else {
                    self.params.allocator.device().sync()
                };
                match sync {
                    Ok(()) => Ok(std::mem::take(&mut *self.fetch_results.lock())),
                    Err(e) => Err(e),
                }
            }
        };

        // Release iteration-held tensor references, then drop alias sets
        // that no longer have live entries.
        self.params.feeds.lock().clear();
        self.params.active_buffers.prune_dead();

        done(result);
    }
}

// ============================================================================
// 3. DISPATCH
// ============================================================================

impl ExecutorState {
    /// Drains `ready`: cheap nodes run inline on this thread through a local
    /// worklist, expensive ones go to the pool. In single-stream mode
    /// everything stays inline.
    fn run_ready(&self, ready: Vec<TaggedNode>) {
        let mut inline: VecDeque<TaggedNode> = VecDeque::new();
        self.dispatch(ready, &mut inline);
        while let Some(tagged) = inline.pop_front() {
            let more = self.process(tagged);
            self.dispatch(more, &mut inline);
        }
    }

    fn dispatch(&self, ready: Vec<TaggedNode>, inline: &mut VecDeque<TaggedNode>) {
        for tagged in ready {
            let expensive = self.gview().nodes[tagged.node].is_expensive;
            if self.params.si_mode || !expensive || tagged.is_dead {
                inline.push_back(tagged);
            } else {
                let state = self.arc();
                self.params.pool.spawn(move || {
                    state.run_ready(vec![tagged]);
                });
            }
        }
    }

    /// Executes one tagged node. Returns the nodes it made ready; async
    /// kernels return empty and continue through their completion callback.
    fn process(&self, tagged: TaggedNode) -> Vec<TaggedNode> {
        let item = &self.gview().nodes[tagged.node];

        if tagged.is_dead || self.is_cancelled() {
            let n_out = item.output_dtypes.len();
            let outputs: Vec<Option<Entry>> = (0..n_out).map(|_| None).collect();
            return self.node_done(&tagged, outputs);
        }

        // Feeds bypass the placeholder kernel entirely.
        if item.op == "Placeholder" {
            let fed = self.params.feeds.lock().get(&item.name).cloned();
            return match fed {
                Some(t) => {
                    let entry = Entry {
                        value: EntryValue::Val(t.clone()),
                        alloc_ticket: t.buffer().ticket(),
                        device: None,
                        ..Default::default()
                    };
                    self.node_done(&tagged, vec![Some(entry)])
                }
                None => {
                    self.record_error(Status::invalid_argument(format!(
                        "placeholder {} was not fed",
                        item.name
                    )));
                    self.node_done(&tagged, vec![None])
                }
            };
        }

        // --- Prepare ---
        let prepared = match self.prepare_inputs(&tagged, item) {
            Ok(p) => p,
            Err(e) => {
                self.record_error(e);
                let outputs = (0..item.output_dtypes.len()).map(|_| None).collect();
                return self.node_done(&tagged, outputs);
            }
        };

        // Keep touched alias sets resident for the kernel's duration.
        let pinned: Vec<Arc<TensorBufferTree>> = prepared.trees.clone();
        for tree in &pinned {
            tree.pin();
        }

        let ctx = OpKernelContext {
            node_name: item.name.clone(),
            inputs: prepared.values,
            input_slots: prepared.slots,
            outputs: (0..item.output_dtypes.len()).map(|_| None).collect(),
            output_attrs: item.output_attrs.clone(),
            allocator: self.params.allocator.clone(),
            rendezvous: self.params.rendezvous.clone(),
            variables: self.params.variables.clone(),
            step_id: self.params.step_id,
        };

        if item.kernel.is_async() {
            let state = self.arc();
            let tagged2 = tagged.clone();
            item.kernel.compute_async(
                ctx,
                Box::new(move |ctx, status| {
                    for tree in &pinned {
                        tree.unpin();
                    }
                    let ready = state.after_compute(&tagged2, ctx, status);
                    state.run_ready(ready);
                }),
            );
            Vec::new()
        } else {
            let mut ctx = ctx;
            let status = item.kernel.compute(&mut ctx);
            for tree in &pinned {
                tree.unpin();
            }
            self.after_compute(&tagged, ctx, status)
        }
    }
}

struct PreparedInputs {
    values: Vec<Tensor>,
    slots: Vec<Option<crate::tensor::TensorSlot>>,
    trees: Vec<Arc<TensorBufferTree>>,
}

// ============================================================================
// 4. INPUT PREPARATION
// ============================================================================

impl ExecutorState {
    fn prepare_inputs(
        &self,
        tagged: &TaggedNode,
        item: &NodeItem,
    ) -> Result<PreparedInputs> {
        // Snapshot the entry refs under the frame lock, then work on them
        // without holding it.
        let entry_refs: Vec<EntryRef> = {
            let inner = tagged.frame.inner.lock();
            let iter = tagged
                .iter
                .checked_sub(inner.front_id)
                .and_then(|idx| inner.iterations.get(idx as usize))
                .ok_or_else(|| Status::internal("iteration vanished before prepare"))?;
            iter.input_tensors[item.input_start..item.input_start + item.num_inputs].to_vec()
        };

        let mut values = Vec::with_capacity(entry_refs.len());
        let mut slots = Vec::with_capacity(entry_refs.len());
        let mut trees = Vec::new();
        let target_spec = self.params.allocator.device().spec();

        for entry_ref in &entry_refs {
            // Re-fault: a paged-out alias set must come back before use.
            let tree = entry_ref.lock().tree.clone();
            if let Some(tree) = &tree {
                if tree.is_paged_out() {
                    self.params.active_buffers.page_in(tree, &self.params.allocator)?;
                }
            }

            let mut entry = entry_ref.lock();
            if !entry.has_value() {
                if item.class.is_merge() {
                    // Merge takes whichever data input arrived live.
                    continue;
                }
                return Err(Status::invalid_argument(format!(
                    "empty input while preparing {}",
                    item.name
                )));
            }

            match &entry.value {
                EntryValue::Ref(slot) => {
                    if item.op == "Assign" && slots.is_empty() {
                        // The mutated operand stays a reference.
                        slots.push(Some(slot.clone()));
                        values.push(slot.lock().clone());
                    } else {
                        entry.dereference()?;
                        let t = entry.ref_or_val()?;
                        slots.push(None);
                        values.push(t);
                    }
                }
                EntryValue::Val(_) => {
                    let t = entry.ref_or_val()?;
                    // Cross-device input: move through the DMA path and
                    // retarget the entry atomically under its lock.
                    if !item.output_attrs.first().map(|a| a.on_host).unwrap_or(false)
                        && t.device() != target_spec
                    {
                        move_entry_tensor(&mut entry, &self.params.allocator, Default::default())?;
                        drop(entry);
                        self.params.active_buffers.register_entry(entry_ref);
                        entry = entry_ref.lock();
                    }
                    slots.push(None);
                    values.push(entry.ref_or_val()?);
                }
                EntryValue::Empty => unreachable!("checked above"),
            }

            if let Some(tree) = entry.tree.clone() {
                if !trees.iter().any(|t: &Arc<TensorBufferTree>| Arc::ptr_eq(t, &tree)) {
                    trees.push(tree);
                }
            }
        }

        if item.class.is_merge() && values.is_empty() {
            return Err(Status::internal(format!(
                "live merge {} prepared without a live input",
                item.name
            )));
        }

        Ok(PreparedInputs { values, slots, trees })
    }
}

// ============================================================================
// 5. OUTPUT PROCESSING & COMPLETION
// ============================================================================

impl ExecutorState {
    fn after_compute(
        &self,
        tagged: &TaggedNode,
        ctx: OpKernelContext,
        status: Result<()>,
    ) -> Vec<TaggedNode> {
        let item = &self.gview().nodes[tagged.node];

        if let Err(e) = status {
            if e.is_resource_exhausted() && !item.has_ref_input {
                if let Some(retry) = self.try_oom_retry(tagged, item) {
                    return retry;
                }
            }
            self.record_error(e);
            let outputs = (0..item.output_dtypes.len()).map(|_| None).collect();
            return self.node_done(tagged, outputs);
        }

        match self.process_outputs(tagged, item, ctx) {
            Ok(outputs) => self.node_done(tagged, outputs),
            Err(e) => {
                self.record_error(e);
                let outputs = (0..item.output_dtypes.len()).map(|_| None).collect();
                self.node_done(tagged, outputs)
            }
        }
    }

    /// Transient OOM: ask the engine to page other tickets out, then requeue
    /// this node. Fatal once the retry budget is spent.
    fn try_oom_retry(
        &self,
        tagged: &TaggedNode,
        item: &NodeItem,
    ) -> Option<Vec<TaggedNode>> {
        {
            let mut failures = self.oom_failures.lock();
            let count = failures.entry(tagged.node).or_insert(0);
            if *count >= self.params.max_failures {
                log::error!(
                    "Node {} exhausted {} paging retries; giving up",
                    item.name,
                    self.params.max_failures
                );
                return None;
            }
            *count += 1;
        }

        let spec = self.params.allocator.device().spec();
        let freed = match &self.params.pressure_cb {
            Some(cb) => cb(spec),
            None => false,
        };
        log::info!(
            "Node {} hit memory pressure on {}; paging {}",
            item.name,
            spec,
            if freed { "freed space, retrying" } else { "freed nothing, retrying anyway" }
        );
        Some(vec![tagged.clone()])
    }

    fn process_outputs(
        &self,
        tagged: &TaggedNode,
        item: &NodeItem,
        ctx: OpKernelContext,
    ) -> Result<Vec<Option<Entry>>> {
        let device = self.params.allocator.device().clone();
        let mut outputs: Vec<Option<Entry>> = Vec::with_capacity(item.output_dtypes.len());
        let mut out_bytes = 0u64;

        for (slot, out) in ctx.outputs.into_iter().enumerate() {
            match out {
                None => outputs.push(None),
                Some(OutputValue::Val(t)) => {
                    if t.dtype() != item.output_dtypes[slot] {
                        return Err(Status::internal(format!(
                            "{} produced {:?} on output {}, declared {:?}",
                            item.name,
                            t.dtype(),
                            slot,
                            item.output_dtypes[slot]
                        )));
                    }
                    out_bytes += t.num_bytes() as u64;
                    // The allocator records which ticket backed the buffer.
                    let ticket = t.buffer().ticket();
                    outputs.push(Some(Entry {
                        value: EntryValue::Val(t),
                        alloc_attr: item.output_attrs[slot],
                        alloc_ticket: ticket,
                        device: Some(device.clone()),
                        tree: None,
                    }));
                }
                Some(OutputValue::Ref(r)) => {
                    let ticket = r.lock().buffer().ticket();
                    outputs.push(Some(Entry {
                        value: EntryValue::Ref(r),
                        alloc_attr: item.output_attrs[slot],
                        alloc_ticket: ticket,
                        device: Some(device.clone()),
                        tree: None,
                    }));
                }
            }
        }

        if out_bytes > 0 {
            self.params.cost_cache.update(
                &item.name,
                Resources::single(ResourceTag::memory(device.spec()), out_bytes),
            );
        }

        // Fetch capture happens before values are consumed downstream.
        if self.params.fetches.iter().any(|f| f == &item.name) {
            if let Some(Some(entry)) = outputs.first() {
                if let Ok(t) = entry.ref_or_val() {
                    self.fetch_results.lock().insert(item.name.clone(), t);
                }
            }
        }

        // Completed nodes release their input references.
        if item.num_inputs > 0 {
            let inner = tagged.frame.inner.lock();
            let iter = tagged
                .iter
                .checked_sub(inner.front_id)
                .and_then(|idx| inner.iterations.get(idx as usize));
            if let Some(iter) = iter {
                for entry_ref in
                    &iter.input_tensors[item.input_start..item.input_start + item.num_inputs]
                {
                    entry_ref.lock().clear_val();
                }
            }
        }

        Ok(outputs)
    }

    /// Propagates outputs, decrements the source iteration, cascades frame
    /// cleanup, and updates the global op counter. Returns newly ready nodes.
    fn node_done(&self, tagged: &TaggedNode, outputs: Vec<Option<Entry>>) -> Vec<TaggedNode> {
        let mut ready = Vec::new();
        if !self.is_cancelled() {
            self.propagate_outputs(tagged, outputs, &mut ready);
        }

        // Source-iteration bookkeeping after propagation.
        self.decrement_outstanding(&tagged.frame, tagged.iter, &mut ready);

        self.outstanding_ops.fetch_add(ready.len() as i64, Ordering::SeqCst);
        let left = self.outstanding_ops.fetch_sub(1, Ordering::SeqCst) - 1;
        if left == 0 {
            self.finish();
        }
        ready
    }
}

// ============================================================================
// 6. PROPAGATION & FRAMES
// ============================================================================

impl ExecutorState {
    fn propagate_outputs(
        &self,
        tagged: &TaggedNode,
        mut outputs: Vec<Option<Entry>>,
        ready: &mut Vec<TaggedNode>,
    ) {
        let item = &self.gview().nodes[tagged.node];

        match item.class.clone() {
            NodeClass::Enter { frame_name, is_constant } => {
                let child = self.get_or_create_child(&tagged.frame, tagged.iter, &frame_name);
                let out = outputs.pop().flatten();
                let dead = tagged.is_dead || out.is_none();

                let mut inner = child.inner.lock();
                inner.pending_enters = inner.pending_enters.saturating_sub(1);

                if is_constant {
                    // Broadcast to every live iteration now, and remember the
                    // value for iterations created later.
                    let ids: Vec<u64> = inner.iterations.iter().map(|it| it.id).collect();
                    for id in ids {
                        let mut outs = vec![out.clone()];
                        self.activate_nodes(&child, &mut inner, id, item, &mut outs, dead, ready);
                    }
                    inner.loop_invariants.push((tagged.node, out, dead));
                } else {
                    // Plain Enter values always land in iteration 0, which
                    // cannot retire before the last Enter arrives.
                    let mut outs = vec![out];
                    self.activate_nodes(&child, &mut inner, 0, item, &mut outs, dead, ready);
                }

                // The last Enter may complete iteration 0 with no op running.
                drop(inner);
                self.check_frame_progress(&child, ready);
            }

            NodeClass::Exit => {
                let (parent, parent_iter) =
                    tagged.frame.parent.clone().expect("Exit outside any frame");
                let dead = tagged.is_dead || outputs.iter().all(|o| o.is_none());
                if dead {
                    // Withheld until the final iteration so downstream
                    // consumers observe exactly the right deadness.
                    let mut inner = tagged.frame.inner.lock();
                    if !inner.dead_exits.contains(&tagged.node) {
                        inner.dead_exits.push(tagged.node);
                    }
                } else {
                    tagged.frame.inner.lock().exits_delivered.push(tagged.node);
                    let mut inner = parent.inner.lock();
                    self.activate_nodes(&parent, &mut inner, parent_iter, item, &mut outputs, false, ready);
                }
            }

            NodeClass::NextIteration => {
                if tagged.is_dead || outputs.iter().all(|o| o.is_none()) {
                    // Deadness stops at the loop boundary.
                    return;
                }
                let out = outputs.pop().flatten();
                let frame = &tagged.frame;
                let mut inner = frame.inner.lock();
                let next = tagged.iter + 1;

                if next < inner.iteration_count {
                    let mut outs = vec![out];
                    self.activate_nodes(frame, &mut inner, next, item, &mut outs, false, ready);
                } else if inner.iterations.len() < frame.max_parallel {
                    debug_assert_eq!(next, inner.iteration_count);
                    self.create_iteration(frame, &mut inner, ready);
                    let mut outs = vec![out];
                    self.activate_nodes(frame, &mut inner, next, item, &mut outs, false, ready);
                } else {
                    // Window full: park the value as a root of the deferred
                    // iteration.
                    inner.next_iter_roots.push((tagged.node, out));
                }
            }

            _ => {
                let frame = tagged.frame.clone();
                let mut inner = frame.inner.lock();
                self.activate_nodes(&frame, &mut inner, tagged.iter, item, &mut outputs, tagged.is_dead, ready);
            }
        }
    }

    /// Delivers `outputs` along the source's fused edges inside one locked
    /// frame iteration, updating pending counts and collecting ready nodes.
    #[allow(clippy::too_many_arguments)]
    fn activate_nodes(
        &self,
        frame: &Arc<FrameState>,
        inner: &mut FrameInner,
        iter_id: u64,
        src_item: &NodeItem,
        outputs: &mut [Option<Entry>],
        src_dead: bool,
        ready: &mut Vec<TaggedNode>,
    ) {
        let gview = self.params.gview.clone();
        let iter = iter_id
            .checked_sub(inner.front_id)
            .and_then(|idx| inner.iterations.get_mut(idx as usize));
        let Some(iter) = iter else {
            log::error!("activation into vanished iteration {} of frame '{}'", iter_id, frame.name);
            return;
        };

        for edge in &src_item.out_edges {
            let dst_item = &gview.nodes[edge.dst];
            let out = outputs.get_mut(edge.src_slot).and_then(|o| {
                if edge.is_last {
                    o.take()
                } else {
                    o.clone()
                }
            });
            // A control edge carries no value; only the source's own
            // deadness travels along it.
            let edge_dead = src_dead || (edge.dst_slot.is_some() && out.is_none());

            let mut to_deliver: Option<(usize, Entry)> = None;
            let mut became_ready = false;
            let mut ready_dead = false;
            {
                let pend = iter
                    .pending
                    .get_mut(&edge.dst)
                    .unwrap_or_else(|| panic!("node {} missing from frame pending", dst_item.name));

                if dst_item.class.is_merge() {
                    match edge.dst_slot {
                        None => {
                            // Control input: worth two ticks.
                            pend.pending -= 2;
                        }
                        Some(slot) => {
                            if !edge_dead {
                                if pend.pending & 1 == 1 {
                                    // First live data input provides the value.
                                    pend.pending &= !1;
                                    if let Some(entry) = out {
                                        to_deliver = Some((slot, entry));
                                    }
                                }
                            } else {
                                pend.dead_count += 1;
                            }
                        }
                    }
                    if !pend.started && pend.pending == 0 {
                        became_ready = true;
                    } else if !pend.started
                        && pend.pending == 1
                        && pend.dead_count as usize == dst_item.num_inputs
                    {
                        became_ready = true;
                        ready_dead = true;
                    }
                } else {
                    pend.pending -= 1;
                    if edge_dead {
                        pend.dead_count += 1;
                    } else if let (Some(slot), Some(entry)) = (edge.dst_slot, out) {
                        to_deliver = Some((slot, entry));
                    }
                    if pend.pending == 0 {
                        became_ready = true;
                        ready_dead = pend.dead_count > 0;
                    }
                }

                if became_ready {
                    pend.started = true;
                }
            }

            if let Some((slot, entry)) = to_deliver {
                deliver(iter, dst_item, slot, entry, &self.params.active_buffers);
            }

            if became_ready {
                iter.outstanding_ops += 1;
                ready.push(TaggedNode {
                    node: edge.dst,
                    frame: frame.clone(),
                    iter: iter_id,
                    is_dead: ready_dead,
                });
            }
        }
    }

    fn get_or_create_child(
        &self,
        parent: &Arc<FrameState>,
        parent_iter: u64,
        static_name: &str,
    ) -> Arc<FrameState> {
        let dynamic_name = format!("{};{};{}", parent.name, parent_iter, static_name);

        let mut frames = self.frames.lock();
        if let Some(f) = frames.get(&dynamic_name) {
            return f.clone();
        }

        let gview = self.gview();
        let info_idx = gview
            .frame_index(static_name)
            .unwrap_or_else(|| panic!("unknown frame {}", static_name));
        let child = FrameState::new(
            info_idx,
            &gview.frames[info_idx],
            dynamic_name.clone(),
            Some((parent.clone(), parent_iter)),
        );

        {
            let mut inner = parent.inner.lock();
            let iter = parent_iter
                .checked_sub(inner.front_id)
                .and_then(|idx| inner.iterations.get_mut(idx as usize));
            if let Some(iter) = iter {
                iter.outstanding_frames += 1;
            }
        }

        log::debug!("Created frame '{}'", dynamic_name);
        frames.insert(dynamic_name, child.clone());
        child
    }

    fn create_iteration(
        &self,
        frame: &Arc<FrameState>,
        inner: &mut FrameInner,
        ready: &mut Vec<TaggedNode>,
    ) {
        let info = &self.gview().frames[frame.info];
        let id = inner.iteration_count;
        inner.iterations.push_back(IterationState::new(id, info));
        inner.iteration_count += 1;

        // Loop invariants flow into every new iteration.
        let gview = self.params.gview.clone();
        let invariants = inner.loop_invariants.clone();
        for (enter_node, out, dead) in invariants {
            let enter_item = &gview.nodes[enter_node];
            let mut outs = vec![out];
            self.activate_nodes(frame, inner, id, enter_item, &mut outs, dead, ready);
        }
    }

    /// Retires finished iterations from the front of the window, pulls
    /// deferred next-iteration roots in, and completes the frame when
    /// nothing can arrive any more.
    fn decrement_outstanding(
        &self,
        frame: &Arc<FrameState>,
        iter_id: u64,
        ready: &mut Vec<TaggedNode>,
    ) {
        {
            let mut inner = frame.inner.lock();
            let iter = iter_id
                .checked_sub(inner.front_id)
                .and_then(|idx| inner.iterations.get_mut(idx as usize));
            if let Some(iter) = iter {
                assert!(iter.outstanding_ops > 0, "op underflow in frame '{}'", frame.name);
                iter.outstanding_ops -= 1;
            }
        }
        self.check_frame_progress(frame, ready);
    }

    fn check_frame_progress(&self, frame: &Arc<FrameState>, ready: &mut Vec<TaggedNode>) {
        // Completion may cascade through ancestors; walk iteratively.
        let mut current = frame.clone();
        loop {
            let mut finished: Option<(Arc<FrameState>, u64, Vec<usize>)> = None;
            {
                let mut inner = current.inner.lock();

                // Retire done iterations in FIFO order.
                loop {
                    let done = match inner.iterations.front() {
                        Some(it) => {
                            it.outstanding_ops == 0
                                && it.outstanding_frames == 0
                                && (it.id > 0 || inner.pending_enters == 0)
                        }
                        None => false,
                    };
                    if !done {
                        break;
                    }
                    let retired = inner.iterations.pop_front().unwrap();
                    inner.front_id = retired.id + 1;
                    log::trace!("Retired iteration {} of frame '{}'", retired.id, current.name);

                    // Window space freed: start the deferred iteration.
                    if !inner.next_iter_roots.is_empty()
                        && inner.iterations.len() < current.max_parallel
                    {
                        self.create_iteration(&current, &mut inner, ready);
                        let gview = self.params.gview.clone();
                        let roots = std::mem::take(&mut inner.next_iter_roots);
                        let target = inner.iteration_count - 1;
                        for (node, out) in roots {
                            let item = &gview.nodes[node];
                            let mut outs = vec![out];
                            self.activate_nodes(&current, &mut inner, target, item, &mut outs, false, ready);
                        }
                    }
                }

                let frame_done = !inner.completed
                    && inner.iterations.is_empty()
                    && inner.next_iter_roots.is_empty()
                    && inner.pending_enters == 0;
                if frame_done {
                    inner.completed = true;
                    // Each Exit surfaces exactly once: dead only if it never
                    // produced a live value in any iteration.
                    let delivered = std::mem::take(&mut inner.exits_delivered);
                    let dead_exits: Vec<usize> = std::mem::take(&mut inner.dead_exits)
                        .into_iter()
                        .filter(|n| !delivered.contains(n))
                        .collect();
                    if let Some((parent, parent_iter)) = current.parent.clone() {
                        finished = Some((parent, parent_iter, dead_exits));
                    }
                }
            }

            let Some((parent, parent_iter, dead_exits)) = finished else { break };

            // Drop the dynamic frame and tell the parent.
            self.frames.lock().remove(&current.name);
            log::debug!("Frame '{}' completed", current.name);

            {
                let gview = self.params.gview.clone();
                let mut inner = parent.inner.lock();
                // Buffered dead Exits surface only now.
                for node in dead_exits {
                    let item = &gview.nodes[node];
                    let mut outs: Vec<Option<Entry>> =
                        (0..item.output_dtypes.len()).map(|_| None).collect();
                    self.activate_nodes(&parent, &mut inner, parent_iter, item, &mut outs, true, ready);
                }
                let iter = parent_iter
                    .checked_sub(inner.front_id)
                    .and_then(|idx| inner.iterations.get_mut(idx as usize));
                if let Some(iter) = iter {
                    assert!(iter.outstanding_frames > 0, "frame underflow in '{}'", parent.name);
                    iter.outstanding_frames -= 1;
                }
            }
            current = parent;
        }
    }
}

fn deliver(
    iter: &mut IterationState,
    dst_item: &NodeItem,
    slot: usize,
    entry: Entry,
    active_buffers: &Arc<ActiveBuffers>,
) {
    let entry_ref = &iter.input_tensors[dst_item.input_start + slot];
    *entry_ref.lock() = entry;
    // Deferred tree insertion: a value joins its alias set when it is
    // activated into a consumer, not when it is produced.
    active_buffers.register_entry(entry_ref);
}
