// src/ops.rs
//
// =============================================================================
// SALUS: OP KERNELS & RENDEZVOUS
// =============================================================================
//
// The Hexagonal Port.
//
// Responsibilities:
// 1. Define the `OpKernel` contract the executor drives nodes through.
// 2. Dispatch op names to concrete kernels (The Factory).
// 3. Provide the in-process rendezvous that Send/Recv pairs exchange
//    tensors through, including abort on session teardown.
// 4. Remember per-op resource usage so future requests can be pre-estimated.
//
// Kernels allocate exclusively through the context's forwarding allocator,
// which is how lane budgets and the resource monitor see every byte.

use crate::core::{Resources, Result, Status};
use crate::device::{AllocAttributes, PerOpAllocator};
use crate::tensor::{DataType, Shape, Tensor, TensorSlot};

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

// ============================================================================
// 1. THE KERNEL CONTRACT
// ============================================================================

/// A computed output: by value, or a reference into persistent state.
pub enum OutputValue {
    Val(Tensor),
    Ref(TensorSlot),
}

/// Session-lifetime variable state, shared across a session's graphs by
/// node name.
pub type VarStore = Arc<Mutex<HashMap<String, TensorSlot>>>;

/// Everything a kernel sees for one invocation. Owns its data so async
/// kernels can carry the context across the completion notification.
pub struct OpKernelContext {
    pub node_name: String,
    /// Prepared value snapshots, one per data input.
    pub inputs: Vec<Tensor>,
    /// Reference slots for ops that mutate their inputs (e.g. Assign).
    pub input_slots: Vec<Option<TensorSlot>>,
    pub outputs: Vec<Option<OutputValue>>,
    pub output_attrs: Vec<AllocAttributes>,
    pub allocator: Arc<PerOpAllocator>,
    pub rendezvous: Arc<Rendezvous>,
    pub variables: VarStore,
    pub step_id: u64,
}

impl OpKernelContext {
    pub fn input(&self, i: usize) -> Result<&Tensor> {
        self.inputs
            .get(i)
            .ok_or_else(|| Status::invalid_argument(format!("missing input {}", i)))
    }

    /// Allocates output `slot` through the forwarding allocator. This is the
    /// path that can fail with resource-exhausted under lane pressure.
    pub fn alloc_output(&mut self, slot: usize, dtype: DataType, shape: Shape) -> Result<Tensor> {
        let attrs = self.output_attrs.get(slot).copied().unwrap_or_default();
        let t = Tensor::allocate(&self.allocator, dtype, shape, attrs)?;
        self.outputs[slot] = Some(OutputValue::Val(t.clone()));
        Ok(t)
    }

    pub fn set_output(&mut self, slot: usize, tensor: Tensor) {
        self.outputs[slot] = Some(OutputValue::Val(tensor));
    }

    pub fn set_output_ref(&mut self, slot: usize, r: TensorSlot) {
        self.outputs[slot] = Some(OutputValue::Ref(r));
    }
}

pub type KernelDone = Box<dyn FnOnce(OpKernelContext, Result<()>) + Send>;

pub trait OpKernel: Send + Sync {
    fn output_dtypes(&self) -> Vec<DataType>;

    fn is_expensive(&self) -> bool {
        false
    }

    fn produces_ref_outputs(&self) -> bool {
        false
    }

    fn is_async(&self) -> bool {
        false
    }

    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()>;

    /// Async kernels emit a completion notification instead of returning.
    /// The default just runs the sync path inline.
    fn compute_async(&self, mut ctx: OpKernelContext, done: KernelDone) {
        let status = self.compute(&mut ctx);
        done(ctx, status);
    }
}

pub type KernelRef = Arc<dyn OpKernel>;

// ============================================================================
// 2. ATTRIBUTE HELPERS
// ============================================================================

fn attr_dtype(attrs: &HashMap<String, Value>) -> DataType {
    let name = attrs
        .get("dtype")
        .or_else(|| attrs.get("T"))
        .and_then(|v| v.as_str())
        .unwrap_or("f32");
    match name {
        "i64" => DataType::I64,
        "bool" => DataType::Bool,
        _ => DataType::F32,
    }
}

fn attr_shape(attrs: &HashMap<String, Value>) -> Shape {
    let dims = attrs
        .get("shape")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|d| d.as_u64()).map(|d| d as usize).collect())
        .unwrap_or_default();
    Shape(dims)
}

fn attr_string(attrs: &HashMap<String, Value>, key: &str) -> Result<String> {
    attrs
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| Status::invalid_argument(format!("missing string attr {}", key)))
}

// ============================================================================
// 3. THE REGISTRY (Factory)
// ============================================================================

type Factory = Box<dyn Fn(&HashMap<String, Value>) -> Result<KernelRef> + Send + Sync>;

pub struct OpRegistry {
    factories: HashMap<String, Factory>,
}

impl OpRegistry {
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    pub fn register<F>(&mut self, op: &str, factory: F)
    where
        F: Fn(&HashMap<String, Value>) -> Result<KernelRef> + Send + Sync + 'static,
    {
        self.factories.insert(op.to_string(), Box::new(factory));
    }

    pub fn create(&self, op: &str, attrs: &HashMap<String, Value>) -> Result<KernelRef> {
        match self.factories.get(op) {
            Some(f) => f(attrs),
            None => Err(Status::not_found(format!("no kernel registered for op {}", op))),
        }
    }

    /// The standard op set.
    pub fn with_builtins() -> Arc<Self> {
        let mut reg = Self::new();

        reg.register("NoOp", |_| Ok(Arc::new(NoOp) as KernelRef));
        reg.register("Const", |attrs| {
            Ok(Arc::new(ConstOp {
                dtype: attr_dtype(attrs),
                shape: attr_shape(attrs),
                value: attrs.get("value").cloned().unwrap_or(Value::Null),
            }) as KernelRef)
        });
        reg.register("Placeholder", |attrs| {
            Ok(Arc::new(PlaceholderOp { dtype: attr_dtype(attrs) }) as KernelRef)
        });
        reg.register("Identity", |attrs| {
            Ok(Arc::new(PassThrough { dtype: attr_dtype(attrs) }) as KernelRef)
        });
        for op in ["Enter", "Exit", "NextIteration", "Merge", "LoopCond"] {
            reg.register(op, |attrs| {
                Ok(Arc::new(PassThrough { dtype: attr_dtype(attrs) }) as KernelRef)
            });
        }
        reg.register("Switch", |attrs| {
            Ok(Arc::new(SwitchOp { dtype: attr_dtype(attrs) }) as KernelRef)
        });
        for (op, f) in
            [("Add", BinaryFn::Add), ("Sub", BinaryFn::Sub), ("Mul", BinaryFn::Mul)]
        {
            reg.register(op, move |_| Ok(Arc::new(BinaryOp { f }) as KernelRef));
        }
        reg.register("Less", |_| Ok(Arc::new(LessOp) as KernelRef));
        reg.register("MatMul", |_| Ok(Arc::new(MatMulOp) as KernelRef));
        reg.register("Fill", |attrs| {
            Ok(Arc::new(FillOp {
                dtype: attr_dtype(attrs),
                shape: attr_shape(attrs),
                value: attrs.get("value").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32,
            }) as KernelRef)
        });
        reg.register("Slice", |attrs| {
            Ok(Arc::new(SliceOp {
                dtype: attr_dtype(attrs),
                begin: attrs.get("begin").and_then(|v| v.as_u64()).unwrap_or(0) as usize,
                size: attrs.get("size").and_then(|v| v.as_u64()).unwrap_or(1) as usize,
            }) as KernelRef)
        });
        reg.register("Variable", |attrs| {
            Ok(Arc::new(VariableOp {
                dtype: attr_dtype(attrs),
                shape: attr_shape(attrs),
            }) as KernelRef)
        });
        reg.register("Assign", |attrs| {
            Ok(Arc::new(AssignOp { dtype: attr_dtype(attrs) }) as KernelRef)
        });
        reg.register("Send", |attrs| {
            Ok(Arc::new(SendOp { key: attr_string(attrs, "tensor_name")? }) as KernelRef)
        });
        reg.register("Recv", |attrs| {
            Ok(Arc::new(RecvOp {
                key: attr_string(attrs, "tensor_name")?,
                dtype: attr_dtype(attrs),
            }) as KernelRef)
        });

        Arc::new(reg)
    }
}

impl Default for OpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// 4. BUILTIN KERNELS
// ============================================================================

struct NoOp;

impl OpKernel for NoOp {
    fn output_dtypes(&self) -> Vec<DataType> {
        vec![]
    }

    fn compute(&self, _ctx: &mut OpKernelContext) -> Result<()> {
        Ok(())
    }
}

struct ConstOp {
    dtype: DataType,
    shape: Shape,
    value: Value,
}

impl OpKernel for ConstOp {
    fn output_dtypes(&self) -> Vec<DataType> {
        vec![self.dtype]
    }

    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        let shape = if self.shape.0.is_empty() && self.value.is_array() {
            Shape::vector(self.value.as_array().map(|a| a.len()).unwrap_or(0))
        } else {
            self.shape.clone()
        };
        let t = ctx.alloc_output(0, self.dtype, shape.clone())?;
        let n = shape.num_elements();
        match self.dtype {
            DataType::F32 => {
                let vals = broadcast_f64(&self.value, n);
                t.write_f32(&vals.iter().map(|&v| v as f32).collect::<Vec<_>>())?;
            }
            DataType::I64 => {
                let vals = broadcast_f64(&self.value, n);
                t.write_i64(&vals.iter().map(|&v| v as i64).collect::<Vec<_>>())?;
            }
            DataType::Bool => {
                let v = self.value.as_bool().unwrap_or(false);
                t.write_bool(&vec![v; n.max(1)])?;
            }
        }
        Ok(())
    }
}

fn broadcast_f64(value: &Value, n: usize) -> Vec<f64> {
    match value {
        Value::Array(a) => a.iter().filter_map(|v| v.as_f64()).collect(),
        v => vec![v.as_f64().unwrap_or(0.0); n.max(1)],
    }
}

struct PlaceholderOp {
    dtype: DataType,
}

impl OpKernel for PlaceholderOp {
    fn output_dtypes(&self) -> Vec<DataType> {
        vec![self.dtype]
    }

    fn compute(&self, _ctx: &mut OpKernelContext) -> Result<()> {
        // Feeds are injected by the executor before roots run.
        Err(Status::invalid_argument("placeholder was not fed"))
    }
}

/// Identity-shaped forwarding. Control-flow routing around these nodes is
/// the executor's business, not the kernel's.
struct PassThrough {
    dtype: DataType,
}

impl OpKernel for PassThrough {
    fn output_dtypes(&self) -> Vec<DataType> {
        vec![self.dtype]
    }

    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        let t = ctx.input(0)?.clone();
        ctx.set_output(0, t);
        Ok(())
    }
}

struct SwitchOp {
    dtype: DataType,
}

impl OpKernel for SwitchOp {
    fn output_dtypes(&self) -> Vec<DataType> {
        // Output 0: predicate false; output 1: predicate true.
        vec![self.dtype, self.dtype]
    }

    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        let data = ctx.input(0)?.clone();
        let pred = ctx.input(1)?.scalar_bool()?;
        let slot = if pred { 1 } else { 0 };
        ctx.set_output(slot, data);
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum BinaryFn {
    Add,
    Sub,
    Mul,
}

struct BinaryOp {
    f: BinaryFn,
}

impl OpKernel for BinaryOp {
    fn output_dtypes(&self) -> Vec<DataType> {
        vec![DataType::F32]
    }

    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        let a = ctx.input(0)?.clone();
        let b = ctx.input(1)?.clone();
        if a.shape() != b.shape() && b.shape().num_elements() != 1 {
            return Err(Status::invalid_argument(format!(
                "shape mismatch: {} vs {}",
                a.shape(),
                b.shape()
            )));
        }
        let out = ctx.alloc_output(0, DataType::F32, a.shape().clone())?;
        let xs = a.read_f32();
        let ys = b.read_f32();
        let vals: Vec<f32> = xs
            .iter()
            .enumerate()
            .map(|(i, &x)| {
                let y = if ys.len() == 1 { ys[0] } else { ys[i] };
                match self.f {
                    BinaryFn::Add => x + y,
                    BinaryFn::Sub => x - y,
                    BinaryFn::Mul => x * y,
                }
            })
            .collect();
        out.write_f32(&vals)
    }
}

struct LessOp;

impl OpKernel for LessOp {
    fn output_dtypes(&self) -> Vec<DataType> {
        vec![DataType::Bool]
    }

    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        let a = ctx.input(0)?.scalar_f32()?;
        let b = ctx.input(1)?.scalar_f32()?;
        let out = ctx.alloc_output(0, DataType::Bool, Shape::scalar())?;
        out.write_bool(&[a < b])
    }
}

struct MatMulOp;

impl OpKernel for MatMulOp {
    fn output_dtypes(&self) -> Vec<DataType> {
        vec![DataType::F32]
    }

    fn is_expensive(&self) -> bool {
        true
    }

    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        let a = ctx.input(0)?.clone();
        let b = ctx.input(1)?.clone();
        let (m, k) = match a.shape().0[..] {
            [m, k] => (m, k),
            _ => return Err(Status::invalid_argument("MatMul lhs must be rank 2")),
        };
        let (k2, n) = match b.shape().0[..] {
            [k2, n] => (k2, n),
            _ => return Err(Status::invalid_argument("MatMul rhs must be rank 2")),
        };
        if k != k2 {
            return Err(Status::invalid_argument(format!(
                "MatMul inner dims differ: {} vs {}",
                k, k2
            )));
        }
        let out = ctx.alloc_output(0, DataType::F32, Shape(vec![m, n]))?;
        let xs = a.read_f32();
        let ys = b.read_f32();
        let mut vals = vec![0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0f32;
                for l in 0..k {
                    acc += xs[i * k + l] * ys[l * n + j];
                }
                vals[i * n + j] = acc;
            }
        }
        out.write_f32(&vals)
    }
}

/// Allocation-heavy op: materialises a tensor of the attr-given shape. The
/// workhorse for exercising lane pressure.
struct FillOp {
    dtype: DataType,
    shape: Shape,
    value: f32,
}

impl OpKernel for FillOp {
    fn output_dtypes(&self) -> Vec<DataType> {
        vec![self.dtype]
    }

    fn is_expensive(&self) -> bool {
        true
    }

    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        let t = ctx.alloc_output(0, self.dtype, self.shape.clone())?;
        if self.dtype == DataType::F32 && self.value != 0.0 {
            t.write_f32(&vec![self.value; self.shape.num_elements()])?;
        }
        Ok(())
    }
}

/// Contiguous element view of the input, backed by a sub-buffer of the
/// input's root. Keeps the alias set non-trivial.
struct SliceOp {
    dtype: DataType,
    begin: usize,
    size: usize,
}

impl OpKernel for SliceOp {
    fn output_dtypes(&self) -> Vec<DataType> {
        vec![self.dtype]
    }

    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        let input = ctx.input(0)?.clone();
        if self.begin + self.size > input.shape().num_elements() {
            return Err(Status::out_of_range(format!(
                "slice [{}, {}) of tensor {}",
                self.begin,
                self.begin + self.size,
                input.shape()
            )));
        }
        let view = input.slice(self.begin, self.size)?;
        ctx.set_output(0, view);
        Ok(())
    }
}

/// Session-persistent mutable state, looked up by node name in the
/// session's variable store. The backing tensor is allocated on first use
/// and survives across iterations and graphs until the session closes.
struct VariableOp {
    dtype: DataType,
    shape: Shape,
}

impl OpKernel for VariableOp {
    fn output_dtypes(&self) -> Vec<DataType> {
        vec![self.dtype]
    }

    fn produces_ref_outputs(&self) -> bool {
        true
    }

    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        let slot = {
            let mut store = ctx.variables.lock();
            match store.get(&ctx.node_name) {
                Some(slot) => slot.clone(),
                None => {
                    let t = Tensor::allocate(
                        &ctx.allocator,
                        self.dtype,
                        self.shape.clone(),
                        ctx.output_attrs.first().copied().unwrap_or_default(),
                    )?;
                    let slot: TensorSlot = Arc::new(Mutex::new(t));
                    store.insert(ctx.node_name.clone(), slot.clone());
                    slot
                }
            }
        };
        ctx.set_output_ref(0, slot);
        Ok(())
    }
}

/// In-place update of a Variable's tensor through its reference slot.
struct AssignOp {
    dtype: DataType,
}

impl OpKernel for AssignOp {
    fn output_dtypes(&self) -> Vec<DataType> {
        vec![self.dtype]
    }

    fn produces_ref_outputs(&self) -> bool {
        true
    }

    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        let slot = ctx
            .input_slots
            .first()
            .and_then(|s| s.clone())
            .ok_or_else(|| Status::invalid_argument("Assign input 0 must be a reference"))?;
        let value = ctx.input(1)?.clone();
        {
            let target = slot.lock();
            if target.dtype() != value.dtype() {
                return Err(Status::invalid_argument("Assign dtype mismatch"));
            }
            target.buffer().write(&value.buffer().read())?;
        }
        ctx.set_output_ref(0, slot);
        Ok(())
    }
}

struct SendOp {
    key: String,
}

impl OpKernel for SendOp {
    fn output_dtypes(&self) -> Vec<DataType> {
        vec![]
    }

    fn compute(&self, ctx: &mut OpKernelContext) -> Result<()> {
        let t = ctx.input(0)?.clone();
        let key = format!("{};{}", self.key, ctx.step_id);
        ctx.rendezvous.send(&key, t)
    }
}

struct RecvOp {
    key: String,
    dtype: DataType,
}

impl OpKernel for RecvOp {
    fn output_dtypes(&self) -> Vec<DataType> {
        vec![self.dtype]
    }

    fn is_async(&self) -> bool {
        true
    }

    fn compute(&self, _ctx: &mut OpKernelContext) -> Result<()> {
        Err(Status::internal("Recv must run through compute_async"))
    }

    fn compute_async(&self, mut ctx: OpKernelContext, done: KernelDone) {
        let key = format!("{};{}", self.key, ctx.step_id);
        let rendezvous = ctx.rendezvous.clone();
        rendezvous.recv_async(
            &key,
            Box::new(move |result| match result {
                Ok(tensor) => {
                    ctx.set_output(0, tensor);
                    done(ctx, Ok(()));
                }
                Err(e) => done(ctx, Err(e)),
            }),
        );
    }
}

// ============================================================================
// 5. RENDEZVOUS
// ============================================================================

type RecvCallback = Box<dyn FnOnce(Result<Tensor>) + Send>;

#[derive(Default)]
struct RendezvousInner {
    items: HashMap<String, VecDeque<Tensor>>,
    waiters: HashMap<String, VecDeque<RecvCallback>>,
    delivered: HashMap<String, (DataType, Shape)>,
    aborted: Option<Status>,
}

/// The channel Send/Recv nodes exchange tensors through. Abort unblocks
/// every pending Recv with a cancelled status.
pub struct Rendezvous {
    inner: Mutex<RendezvousInner>,
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

impl Rendezvous {
    pub fn new() -> Self {
        Self { inner: Mutex::new(RendezvousInner::default()) }
    }

    pub fn send(&self, key: &str, tensor: Tensor) -> Result<()> {
        let waiter = {
            let mut inner = self.inner.lock();
            if let Some(aborted) = &inner.aborted {
                return Err(aborted.clone());
            }
            inner.delivered.insert(key_base(key), (tensor.dtype(), tensor.shape().clone()));
            match inner.waiters.get_mut(key).and_then(|q| q.pop_front()) {
                Some(w) => Some((w, tensor)),
                None => {
                    inner.items.entry(key.to_string()).or_default().push_back(tensor);
                    None
                }
            }
        };
        if let Some((w, tensor)) = waiter {
            w(Ok(tensor));
        }
        Ok(())
    }

    pub fn recv_async(&self, key: &str, cb: RecvCallback) {
        let mut cb = Some(cb);
        let immediate = {
            let mut inner = self.inner.lock();
            if let Some(aborted) = &inner.aborted {
                Some(Err(aborted.clone()))
            } else {
                match inner.items.get_mut(key).and_then(|q| q.pop_front()) {
                    Some(t) => Some(Ok(t)),
                    None => {
                        inner.waiters.entry(key.to_string()).or_default().push_back(
                            cb.take().expect("callback consumed twice"),
                        );
                        None
                    }
                }
            }
        };
        if let Some(result) = immediate {
            (cb.take().expect("callback consumed twice"))(result);
        }
    }

    /// Shape of an already-delivered tensor for `key`, if any. Used to
    /// prefetch recv shapes when the sender has terminated.
    pub fn delivered_shape(&self, key: &str) -> Option<(DataType, Shape)> {
        self.inner.lock().delivered.get(&key_base(key)).cloned()
    }

    pub fn abort(&self, status: Status) {
        let waiters: Vec<RecvCallback> = {
            let mut inner = self.inner.lock();
            inner.aborted = Some(status.clone());
            inner.waiters.drain().flat_map(|(_, q)| q).collect()
        };
        for w in waiters {
            w(Err(status.clone()));
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().aborted.is_some()
    }
}

fn key_base(key: &str) -> String {
    key.split(';').next().unwrap_or(key).to_string()
}

// ============================================================================
// 6. COST CACHE
// ============================================================================

/// Known succeeded per-node resource usage; consulted to pre-estimate
/// requests before a kernel launches.
#[derive(Default)]
pub struct CostCache {
    inner: Mutex<HashMap<String, Resources>>,
}

impl CostCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, node_name: &str, usage: Resources) {
        self.inner.lock().insert(node_name.to_string(), usage);
    }

    pub fn lookup(&self, node_name: &str) -> Option<Resources> {
        self.inner.lock().get(node_name).cloned()
    }
}
