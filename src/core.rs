// src/core.rs
//
// =============================================================================
// SALUS: CORE SCHEMA AUTHORITY
// =============================================================================
//
// The shared vocabulary of the runtime.
// This file defines the strict data contracts between the scheduling layers
// (engine, lanes, monitor) and the execution layer (executor, devices).
//
// Design Principles:
// 1. Typed tags: resource accounting is keyed by (type, device) pairs.
// 2. Zero-free maps: amounts never linger at zero after a mutation.
// 3. Status-as-value: every fallible path returns `Result<T, Status>`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// 1. BYTE UNITS
// ============================================================================

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Human-readable byte counts for log lines.
pub fn fmt_bytes(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{:.2}GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2}MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2}KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{}B", bytes)
    }
}

// ============================================================================
// 2. DEVICES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "CPU"),
            DeviceKind::Gpu => write!(f, "GPU"),
        }
    }
}

/// A concrete device slot, e.g. `GPU:0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub kind: DeviceKind,
    pub index: usize,
}

impl DeviceSpec {
    pub const fn cpu(index: usize) -> Self {
        Self { kind: DeviceKind::Cpu, index }
    }

    pub const fn gpu(index: usize) -> Self {
        Self { kind: DeviceKind::Gpu, index }
    }

    pub fn is_gpu(&self) -> bool {
        self.kind == DeviceKind::Gpu
    }

    /// The fully qualified device name exposed to clients.
    pub fn full_name(&self) -> String {
        format!("/job:salus/replica:0/task:0/device:{}:{}", self.kind, self.index)
    }
}

pub const CPU0: DeviceSpec = DeviceSpec::cpu(0);
pub const GPU0: DeviceSpec = DeviceSpec::gpu(0);

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.index)
    }
}

impl FromStr for DeviceSpec {
    type Err = Status;

    /// Accepts both `GPU:0` and the compact `GPU0` used in resource maps.
    fn from_str(s: &str) -> Result<Self, Status> {
        let (kind_str, idx_str) = match s.find(':') {
            Some(pos) => (&s[..pos], &s[pos + 1..]),
            None => {
                let split = s.find(|c: char| c.is_ascii_digit()).unwrap_or(s.len());
                (&s[..split], &s[split..])
            }
        };

        let kind = match kind_str.to_ascii_uppercase().as_str() {
            "CPU" => DeviceKind::Cpu,
            "GPU" => DeviceKind::Gpu,
            other => {
                return Err(Status::invalid_argument(format!("unknown device kind: {}", other)))
            }
        };

        let index = if idx_str.is_empty() {
            0
        } else {
            idx_str
                .parse::<usize>()
                .map_err(|_| Status::invalid_argument(format!("bad device index: {}", s)))?
        };

        Ok(Self { kind, index })
    }
}

// ============================================================================
// 3. RESOURCE TAGS & MAPS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Compute,
    Memory,
    GpuStream,
    Exclusive,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceType::Compute => "COMPUTE",
            ResourceType::Memory => "MEMORY",
            ResourceType::GpuStream => "GPU_STREAM",
            ResourceType::Exclusive => "EXCLUSIVE",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ResourceType {
    type Err = Status;

    fn from_str(s: &str) -> Result<Self, Status> {
        match s {
            "COMPUTE" => Ok(ResourceType::Compute),
            "MEMORY" => Ok(ResourceType::Memory),
            "GPU_STREAM" => Ok(ResourceType::GpuStream),
            "EXCLUSIVE" => Ok(ResourceType::Exclusive),
            other => Err(Status::invalid_argument(format!("unknown resource type: {}", other))),
        }
    }
}

/// The unit of accounting: a resource type on a concrete device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceTag {
    pub ty: ResourceType,
    pub device: DeviceSpec,
}

impl ResourceTag {
    pub const fn new(ty: ResourceType, device: DeviceSpec) -> Self {
        Self { ty, device }
    }

    pub const fn memory(device: DeviceSpec) -> Self {
        Self { ty: ResourceType::Memory, device }
    }

    pub const fn gpu_stream(device: DeviceSpec) -> Self {
        Self { ty: ResourceType::GpuStream, device }
    }

    pub const fn exclusive(device: DeviceSpec) -> Self {
        Self { ty: ResourceType::Exclusive, device }
    }
}

impl fmt::Display for ResourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.ty, self.device.kind, self.device.index)
    }
}

impl FromStr for ResourceTag {
    type Err = Status;

    /// Parses the wire form `MEMORY:GPU0`. A bare type maps to CPU:0.
    fn from_str(s: &str) -> Result<Self, Status> {
        match s.find(':') {
            None => Ok(Self { ty: s.parse()?, device: CPU0 }),
            Some(pos) => {
                let ty = s[..pos].parse()?;
                let rest = &s[pos + 1..];
                let device = if rest.is_empty() { CPU0 } else { rest.parse()? };
                Ok(Self { ty, device })
            }
        }
    }
}

/// A finite mapping from tag to non-negative amount.
///
/// Invariant: zero-valued entries are removed after every mutation, so
/// `iter()` only ever yields strictly positive amounts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources(BTreeMap<ResourceTag, u64>);

impl Resources {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn single(tag: ResourceTag, amount: u64) -> Self {
        let mut r = Self::new();
        r.set(tag, amount);
        r
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, tag: &ResourceTag) -> u64 {
        self.0.get(tag).copied().unwrap_or(0)
    }

    pub fn set(&mut self, tag: ResourceTag, amount: u64) {
        if amount == 0 {
            self.0.remove(&tag);
        } else {
            self.0.insert(tag, amount);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceTag, &u64)> {
        self.0.iter()
    }

    /// True iff for every tag in `req` the value here is at least as large.
    /// Missing tags count as zero and fail unless `req`'s value is zero too.
    pub fn contains(&self, req: &Resources) -> bool {
        req.iter().all(|(tag, &val)| self.get(tag) >= val)
    }

    pub fn merge(&mut self, rhs: &Resources) -> &mut Self {
        for (tag, &val) in rhs.iter() {
            let e = self.0.entry(*tag).or_insert(0);
            *e += val;
        }
        self.remove_zeros()
    }

    /// Subtracts `rhs`. The caller must have checked dominance; underflow is
    /// a programming bug.
    pub fn subtract(&mut self, rhs: &Resources) -> &mut Self {
        for (tag, &val) in rhs.iter() {
            let have = self.get(tag);
            assert!(have >= val, "resource underflow on {}: {} < {}", tag, have, val);
            self.set(*tag, have - val);
        }
        self
    }

    /// Subtracts `rhs` but only for tags already present, clamping at zero.
    /// Used to compute missing subsets without introducing negative amounts.
    pub fn subtract_clamped(&mut self, rhs: &Resources) -> &mut Self {
        for (tag, &val) in rhs.iter() {
            if let Some(have) = self.0.get(tag).copied() {
                self.set(*tag, have.saturating_sub(val));
            }
        }
        self
    }

    /// Takes up to `rhs` from self, returning what was actually taken.
    pub fn subtract_bounded(&mut self, rhs: &Resources) -> Resources {
        let mut taken = Resources::new();
        for (tag, &val) in rhs.iter() {
            let have = self.get(tag);
            if have == 0 {
                continue;
            }
            let v = val.min(have);
            self.set(*tag, have - v);
            taken.set(*tag, v);
        }
        taken
    }

    pub fn scale(&mut self, factor: f64) -> &mut Self {
        for val in self.0.values_mut() {
            *val = (*val as f64 * factor) as u64;
        }
        self.remove_zeros()
    }

    fn remove_zeros(&mut self) -> &mut Self {
        self.0.retain(|_, v| *v > 0);
        self
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (tag, val)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match tag.ty {
                ResourceType::Memory => write!(f, "{}={}", tag, fmt_bytes(*val))?,
                _ => write!(f, "{}={}", tag, val)?,
            }
        }
        write!(f, "}}")
    }
}

impl FromIterator<(ResourceTag, u64)> for Resources {
    fn from_iter<T: IntoIterator<Item = (ResourceTag, u64)>>(iter: T) -> Self {
        let mut r = Resources::new();
        for (tag, val) in iter {
            r.set(tag, r.get(&tag) + val);
        }
        r
    }
}

// ============================================================================
// 4. STATUS (The Error Contract)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Code {
    InvalidArgument,
    ResourceExhausted,
    Cancelled,
    FailedPrecondition,
    NotFound,
    OutOfRange,
    Internal,
    Unknown,
}

/// The error value carried through every fallible runtime path.
/// Request handlers translate this into the response envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::new(Code::OutOfRange, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Code::Unknown, message)
    }

    pub fn is_resource_exhausted(&self) -> bool {
        self.code == Code::ResourceExhausted
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == Code::Cancelled
    }
}

pub type Result<T, E = Status> = std::result::Result<T, E>;

// ============================================================================
// 5. SCHEDULING PARAMETERS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingParam {
    /// Maximum head-of-line waiting tasks allowed before the scheduler
    /// refuses to look at later tasks in the same queue.
    pub max_hol_waiting: usize,

    /// Whether to be work conservative (sleep proportionally to the
    /// smallest running iteration when nothing was scheduled).
    pub work_conservative: bool,

    /// Scheduling policy name. Only "fair" is recognised today.
    pub scheduler: String,

    /// Kernel worker pool size.
    pub workers: usize,

    /// Paging retries per op before an OOM becomes fatal.
    pub max_failures: u32,
}

impl Default for SchedulingParam {
    fn default() -> Self {
        Self {
            max_hol_waiting: 50,
            work_conservative: true,
            scheduler: "fair".into(),
            workers: 4,
            max_failures: 2,
        }
    }
}

// ============================================================================
// 6. ENVIRONMENT SWITCHES
// ============================================================================

/// Reads a boolean kill-switch. Anything but "", "0", "false", "no", "off"
/// counts as set.
pub fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.trim().to_ascii_lowercase();
            !(v.is_empty() || v == "0" || v == "false" || v == "no" || v == "off")
        }
        Err(_) => false,
    }
}

pub fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub const ENV_DISABLE_LANEMGR: &str = "SALUS_DISABLE_LANEMGR";
pub const ENV_DISABLE_SHARED_LANE: &str = "SALUS_DISABLE_SHARED_LANE";
pub const ENV_ENABLE_SIEXECUTOR: &str = "SALUS_ENABLE_SIEXECUTOR";
pub const ENV_ENABLE_STATIC_STREAM: &str = "SALUS_ENABLE_STATIC_STREAM";
pub const ENV_ALLOCATOR_SMALL_OPT: &str = "SALUS_ALLOCATOR_SMALL_OPT";
pub const ENV_CUDA_HOST_MEM_LIMIT_MB: &str = "TF_CUDA_HOST_MEM_LIMIT_IN_MB";
