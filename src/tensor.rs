// src/tensor.rs
//
// =============================================================================
// SALUS: TENSORS & ENTRIES
// =============================================================================
//
// The value plane.
//
// A TensorBuffer is refcounted backing storage: either a root owning an
// allocation grant, or a sub-buffer viewing a byte range of a root. A Tensor
// is a typed, shaped view over one buffer. An Entry is the slot a value
// occupies while flowing along a graph edge: by-value, by-reference (shared
// mutable, guarded), or empty.
//
// Buffers sharing a root form an alias set; the paging subsystem moves whole
// alias sets between devices (see paging.rs).

use crate::core::{DeviceSpec, Result, Status};
use crate::device::{AllocAttributes, AllocationGrant, DeviceRef, PerOpAllocator};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// ============================================================================
// 1. DTYPES & SHAPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DataType {
    #[default]
    F32,
    I64,
    Bool,
}

impl DataType {
    pub fn size_of(&self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::I64 => 8,
            DataType::Bool => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape(pub Vec<usize>);

impl Shape {
    pub fn scalar() -> Self {
        Shape(vec![])
    }

    pub fn vector(n: usize) -> Self {
        Shape(vec![n])
    }

    pub fn num_elements(&self) -> usize {
        self.0.iter().product()
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

// ============================================================================
// 2. BUFFERS
// ============================================================================

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

pub type BufferId = u64;

enum BufferKind {
    Root {
        data: Mutex<Vec<u8>>,
        // Dropping the grant returns the bytes to the pool and the monitor.
        grant: AllocationGrant,
    },
    Sub {
        parent: Arc<TensorBuffer>,
        offset: usize,
        len: usize,
    },
}

pub struct TensorBuffer {
    id: BufferId,
    kind: BufferKind,
}

impl TensorBuffer {
    /// Allocates a zeroed root buffer through the forwarding allocator.
    pub fn allocate(
        alloc: &Arc<PerOpAllocator>,
        bytes: usize,
        attrs: AllocAttributes,
    ) -> Result<Arc<Self>> {
        let grant = alloc.allocate(bytes as u64, attrs)?;
        Ok(Arc::new(Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            kind: BufferKind::Root { data: Mutex::new(vec![0u8; bytes]), grant },
        }))
    }

    /// A view over `len` bytes of a root buffer starting at `offset`.
    pub fn sub(base: &Arc<TensorBuffer>, offset: usize, len: usize) -> Result<Arc<Self>> {
        let root = TensorBuffer::root_of(base);
        if offset + len > root.size() {
            return Err(Status::out_of_range(format!(
                "sub-buffer [{}, {}) outside root of {} bytes",
                offset,
                offset + len,
                root.size()
            )));
        }
        Ok(Arc::new(Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            kind: BufferKind::Sub { parent: root, offset, len },
        }))
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn is_root(&self) -> bool {
        matches!(self.kind, BufferKind::Root { .. })
    }

    /// The root of a buffer's alias set (the buffer itself, for roots).
    pub fn root_of(buf: &Arc<TensorBuffer>) -> Arc<TensorBuffer> {
        match &buf.kind {
            BufferKind::Root { .. } => buf.clone(),
            BufferKind::Sub { parent, .. } => parent.clone(),
        }
    }

    pub fn sub_range(&self) -> Option<(usize, usize)> {
        match &self.kind {
            BufferKind::Root { .. } => None,
            BufferKind::Sub { offset, len, .. } => Some((*offset, *len)),
        }
    }

    pub fn size(&self) -> usize {
        match &self.kind {
            BufferKind::Root { data, .. } => data.lock().len(),
            BufferKind::Sub { len, .. } => *len,
        }
    }

    pub fn device(&self) -> DeviceSpec {
        match &self.kind {
            BufferKind::Root { grant, .. } => grant.spec(),
            BufferKind::Sub { parent, .. } => parent.device(),
        }
    }

    /// The ticket the root allocation was charged to.
    pub fn ticket(&self) -> u64 {
        match &self.kind {
            BufferKind::Root { grant, .. } => grant.ticket(),
            BufferKind::Sub { parent, .. } => parent.ticket(),
        }
    }

    pub fn read(&self) -> Vec<u8> {
        match &self.kind {
            BufferKind::Root { data, .. } => data.lock().clone(),
            BufferKind::Sub { parent, offset, len } => {
                let data = match &parent.kind {
                    BufferKind::Root { data, .. } => data,
                    BufferKind::Sub { .. } => unreachable!("sub-buffer of a sub-buffer"),
                };
                data.lock()[*offset..*offset + *len].to_vec()
            }
        }
    }

    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.size() {
            return Err(Status::invalid_argument(format!(
                "write of {} bytes into buffer of {}",
                bytes.len(),
                self.size()
            )));
        }
        match &self.kind {
            BufferKind::Root { data, .. } => data.lock().copy_from_slice(bytes),
            BufferKind::Sub { parent, offset, .. } => {
                let data = match &parent.kind {
                    BufferKind::Root { data, .. } => data,
                    BufferKind::Sub { .. } => unreachable!("sub-buffer of a sub-buffer"),
                };
                data.lock()[*offset..*offset + bytes.len()].copy_from_slice(bytes);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TensorBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TensorBuffer(id={}, {} bytes on {}, {})",
            self.id,
            self.size(),
            self.device(),
            if self.is_root() { "root" } else { "sub" }
        )
    }
}

// ============================================================================
// 3. TENSORS
// ============================================================================

#[derive(Clone)]
pub struct Tensor {
    dtype: DataType,
    shape: Shape,
    buffer: Arc<TensorBuffer>,
}

impl Tensor {
    /// Allocates a zeroed tensor through `alloc`.
    pub fn allocate(
        alloc: &Arc<PerOpAllocator>,
        dtype: DataType,
        shape: Shape,
        attrs: AllocAttributes,
    ) -> Result<Self> {
        let bytes = shape.num_elements() * dtype.size_of();
        let buffer = TensorBuffer::allocate(alloc, bytes, attrs)?;
        Ok(Self { dtype, shape, buffer })
    }

    /// Rewraps `self` onto a different buffer; shape and dtype carry over.
    /// The buffer must cover at least the tensor's bytes.
    pub fn with_buffer(&self, buffer: Arc<TensorBuffer>) -> Result<Self> {
        let need = self.shape.num_elements() * self.dtype.size_of();
        if buffer.size() < need {
            return Err(Status::internal(format!(
                "buffer of {} bytes too small for tensor of {}",
                buffer.size(),
                need
            )));
        }
        Ok(Self { dtype: self.dtype, shape: self.shape.clone(), buffer })
    }

    /// A typed view over a contiguous element range, backed by a sub-buffer
    /// of this tensor's root.
    pub fn slice(&self, start_elem: usize, num_elems: usize) -> Result<Tensor> {
        let esz = self.dtype.size_of();
        let base = self.buffer.sub_range().map(|(off, _)| off).unwrap_or(0);
        let sub =
            TensorBuffer::sub(&self.buffer, base + start_elem * esz, num_elems * esz)?;
        Ok(Tensor { dtype: self.dtype, shape: Shape::vector(num_elems), buffer: sub })
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn buffer(&self) -> &Arc<TensorBuffer> {
        &self.buffer
    }

    pub fn device(&self) -> DeviceSpec {
        self.buffer.device()
    }

    pub fn num_bytes(&self) -> usize {
        self.shape.num_elements() * self.dtype.size_of()
    }

    pub fn read_f32(&self) -> Vec<f32> {
        assert_eq!(self.dtype, DataType::F32);
        self.buffer
            .read()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn write_f32(&self, vals: &[f32]) -> Result<()> {
        assert_eq!(self.dtype, DataType::F32);
        let bytes: Vec<u8> = vals.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.buffer.write(&bytes)
    }

    pub fn read_i64(&self) -> Vec<i64> {
        assert_eq!(self.dtype, DataType::I64);
        self.buffer
            .read()
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    pub fn write_i64(&self, vals: &[i64]) -> Result<()> {
        assert_eq!(self.dtype, DataType::I64);
        let bytes: Vec<u8> = vals.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.buffer.write(&bytes)
    }

    pub fn read_bool(&self) -> Vec<bool> {
        assert_eq!(self.dtype, DataType::Bool);
        self.buffer.read().iter().map(|&b| b != 0).collect()
    }

    pub fn write_bool(&self, vals: &[bool]) -> Result<()> {
        assert_eq!(self.dtype, DataType::Bool);
        let bytes: Vec<u8> = vals.iter().map(|&b| b as u8).collect();
        self.buffer.write(&bytes)
    }

    pub fn scalar_f32(&self) -> Result<f32> {
        let v = self.read_f32();
        v.first().copied().ok_or_else(|| Status::invalid_argument("empty tensor"))
    }

    pub fn scalar_bool(&self) -> Result<bool> {
        let v = self.read_bool();
        v.first().copied().ok_or_else(|| Status::invalid_argument("empty tensor"))
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor({:?}{} on {}, buf={})",
            self.dtype,
            self.shape,
            self.device(),
            self.buffer.id()
        )
    }
}

// ============================================================================
// 4. ENTRIES
// ============================================================================

/// Shared handle to a mutable tensor slot (variables).
pub type TensorSlot = Arc<Mutex<Tensor>>;

#[derive(Default, Clone)]
pub enum EntryValue {
    #[default]
    Empty,
    /// Pass-by-value.
    Val(Tensor),
    /// Pass-by-reference; mutation goes through the slot's own lock.
    Ref(TensorSlot),
}

/// One tensor slot on a graph edge.
#[derive(Clone)]
pub struct Entry {
    pub value: EntryValue,
    pub alloc_attr: AllocAttributes,
    /// Ticket the backing buffer was charged to.
    pub alloc_ticket: u64,
    pub device: Option<DeviceRef>,
    /// Alias set this entry's buffer belongs to, once activated.
    pub tree: Option<Arc<crate::paging::TensorBufferTree>>,
}

pub type EntryRef = Arc<Mutex<Entry>>;

impl Default for Entry {
    fn default() -> Self {
        Self {
            value: EntryValue::Empty,
            alloc_attr: AllocAttributes::default(),
            alloc_ticket: 0,
            device: None,
            tree: None,
        }
    }
}

impl Entry {
    pub fn has_value(&self) -> bool {
        !matches!(self.value, EntryValue::Empty)
    }

    pub fn is_ref(&self) -> bool {
        matches!(self.value, EntryValue::Ref(_))
    }

    /// Releases the tensor, the device reference and the tree link.
    pub fn clear_val(&mut self) {
        self.value = EntryValue::Empty;
        self.device = None;
        self.tree = None;
    }

    /// A snapshot of the current tensor, dereferencing under the slot lock.
    pub fn ref_or_val(&self) -> Result<Tensor> {
        match &self.value {
            EntryValue::Empty => Err(Status::invalid_argument("entry holds no value")),
            EntryValue::Val(t) => Ok(t.clone()),
            EntryValue::Ref(slot) => Ok(slot.lock().clone()),
        }
    }

    /// Converts a reference entry into a by-value entry.
    pub fn dereference(&mut self) -> Result<()> {
        if let EntryValue::Ref(slot) = &self.value {
            let t = slot.lock().clone();
            self.value = EntryValue::Val(t);
        }
        Ok(())
    }
}

// ============================================================================
// 5. DMA MOVE
// ============================================================================

/// Copies the entry's tensor onto the allocator's device and retargets the
/// entry (device, attrs, ticket) in one step. The caller re-links the buffer
/// tree afterwards.
pub fn move_entry_tensor(
    entry: &mut Entry,
    dst_alloc: &Arc<PerOpAllocator>,
    attrs: AllocAttributes,
) -> Result<()> {
    let src = entry.ref_or_val()?;
    let bytes = src.buffer().read();

    let copy = Tensor::allocate(dst_alloc, src.dtype(), src.shape().clone(), attrs)?;
    copy.buffer().write(&bytes)?;

    log::debug!(
        "DMA copy buf {} ({} -> {}), {} bytes",
        src.buffer().id(),
        src.device(),
        copy.device(),
        bytes.len()
    );

    let ticket = copy.buffer().ticket();
    match &entry.value {
        EntryValue::Ref(slot) => {
            *slot.lock() = copy;
        }
        _ => {
            entry.value = EntryValue::Val(copy);
        }
    }
    entry.alloc_attr = attrs;
    entry.alloc_ticket = ticket;
    entry.device = Some(dst_alloc.device().clone());
    entry.tree = None;
    Ok(())
}
