// src/paging.rs
//
// =============================================================================
// SALUS: BUFFER TREES & PAGING
// =============================================================================
//
// The pressure valve.
//
// Responsibilities:
// 1. Track, per allocation ticket, which live entries alias which backing
//    buffer (one tree per root buffer, with sub-buffer fan-out).
// 2. On memory pressure, evacuate a ticket's complete alias sets to another
//    device, rewriting every entry that references any buffer in the set.
// 3. Page trees back in on demand (double-checked, serialised per tree).
//
// Lock order: active_buffers -> tree -> entry. Never inverted.

use crate::core::{fmt_bytes, Result};
use crate::device::{AllocAttributes, DeviceRef, PerOpAllocator};
use crate::tensor::{BufferId, Entry, EntryRef, EntryValue, TensorBuffer};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

// ============================================================================
// 1. THE TREE
// ============================================================================

struct SubRecord {
    buffer: Weak<TensorBuffer>,
    entries: Vec<Weak<Mutex<Entry>>>,
}

pub struct TreeInner {
    ticket: u64,
    root: Option<Arc<TensorBuffer>>,
    /// Entries referencing the root buffer directly.
    roots: Vec<Weak<Mutex<Entry>>>,
    /// Entries referencing a sub-buffer, keyed by the sub's id.
    subs: HashMap<BufferId, SubRecord>,
    paged_out: bool,
}

/// One alias set: a root buffer, its sub-buffer views, and every entry
/// referencing either. The unit of paging.
pub struct TensorBufferTree {
    inner: Mutex<TreeInner>,
    /// Kernels currently reading this set; paging skips pinned trees so a
    /// running kernel never sees its buffers move.
    pins: AtomicUsize,
}

impl TensorBufferTree {
    fn new(ticket: u64, root: Arc<TensorBuffer>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(TreeInner {
                ticket,
                root: Some(root),
                roots: Vec::new(),
                subs: HashMap::new(),
                paged_out: false,
            }),
            pins: AtomicUsize::new(0),
        })
    }

    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unpin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "tree pin underflow");
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::SeqCst) > 0
    }

    pub fn ticket(&self) -> u64 {
        self.inner.lock().ticket
    }

    pub fn is_paged_out(&self) -> bool {
        self.inner.lock().paged_out
    }

    pub fn root_id(&self) -> Option<BufferId> {
        self.inner.lock().root.as_ref().map(|b| b.id())
    }

    /// Count of live entries still linked to this tree.
    pub fn live_entries(&self) -> usize {
        let inner = self.inner.lock();
        inner.roots.iter().filter(|w| w.upgrade().is_some()).count()
            + inner
                .subs
                .values()
                .flat_map(|r| r.entries.iter())
                .filter(|w| w.upgrade().is_some())
                .count()
    }
}

// ============================================================================
// 2. ACTIVE BUFFERS (Ticket Multimap)
// ============================================================================

#[derive(Default)]
struct ActiveInner {
    by_ticket: HashMap<u64, Vec<Arc<TensorBufferTree>>>,
    by_root: HashMap<BufferId, Arc<TensorBufferTree>>,
}

/// The executor-wide registry of live alias sets.
pub struct ActiveBuffers {
    inner: Mutex<ActiveInner>,
}

impl Default for ActiveBuffers {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveBuffers {
    pub fn new() -> Self {
        Self { inner: Mutex::new(ActiveInner::default()) }
    }

    /// Links an activated entry into the tree of its buffer's root,
    /// creating the tree on first sight. Sets the entry's back-pointer.
    /// The caller must not hold the entry's lock.
    pub fn register_entry(&self, entry_ref: &EntryRef) {
        // Snapshot outside the registry lock to keep the lock order.
        let (buffer, ticket) = {
            let entry = entry_ref.lock();
            let Ok(tensor) = entry.ref_or_val() else { return };
            (tensor.buffer().clone(), entry.alloc_ticket)
        };
        if ticket == 0 {
            // Nothing to page for unaccounted tensors (e.g. feeds).
            return;
        }

        let root = TensorBuffer::root_of(&buffer);
        let tree = {
            let mut inner = self.inner.lock();
            match inner.by_root.get(&root.id()) {
                Some(tree) => tree.clone(),
                None => {
                    let tree = TensorBufferTree::new(ticket, root.clone());
                    inner.by_root.insert(root.id(), tree.clone());
                    inner.by_ticket.entry(ticket).or_default().push(tree.clone());
                    tree
                }
            }
        };

        {
            let mut ti = tree.inner.lock();
            if buffer.is_root() {
                ti.roots.push(Arc::downgrade(entry_ref));
            } else {
                let rec = ti.subs.entry(buffer.id()).or_insert_with(|| SubRecord {
                    buffer: Arc::downgrade(&buffer),
                    entries: Vec::new(),
                });
                rec.entries.push(Arc::downgrade(entry_ref));
            }
        }
        entry_ref.lock().tree = Some(tree);
    }

    /// Trees currently recorded for `ticket`.
    pub fn trees_for(&self, ticket: u64) -> Vec<Arc<TensorBufferTree>> {
        self.inner.lock().by_ticket.get(&ticket).cloned().unwrap_or_default()
    }

    /// Forgets trees with no live entries left; their buffers are released
    /// by the last tensor reference.
    pub fn prune_dead(&self) {
        let mut inner = self.inner.lock();
        let mut dead_roots = Vec::new();
        for (ticket, trees) in inner.by_ticket.iter_mut() {
            trees.retain(|tree| {
                if tree.live_entries() > 0 {
                    true
                } else {
                    if let Some(id) = tree.root_id() {
                        dead_roots.push(id);
                    }
                    log::trace!("Unlinking empty buffer tree of ticket {}", ticket);
                    false
                }
            });
        }
        inner.by_ticket.retain(|_, trees| !trees.is_empty());
        for id in dead_roots {
            inner.by_root.remove(&id);
        }
    }

    /// Drops a ticket's trees entirely (session teardown).
    pub fn remove_ticket(&self, ticket: u64) {
        let mut inner = self.inner.lock();
        if let Some(trees) = inner.by_ticket.remove(&ticket) {
            for tree in trees {
                if let Some(id) = tree.root_id() {
                    inner.by_root.remove(&id);
                }
            }
        }
    }

    /// Invalidates every entry whose backing root equals `buffer_id`; the
    /// allocator substrate reported the raw address gone.
    pub fn evicted(&self, ticket: u64, buffer_id: BufferId) {
        let tree = {
            let mut inner = self.inner.lock();
            let Some(tree) = inner.by_root.remove(&buffer_id) else { return };
            if let Some(list) = inner.by_ticket.get_mut(&ticket) {
                list.retain(|t| !Arc::ptr_eq(t, &tree));
            }
            tree
        };

        let mut ti = tree.inner.lock();
        log::warn!("Buffer {} of ticket {} evicted externally; dropping entries", buffer_id, ticket);
        let roots_drained: Vec<_> = ti.roots.drain(..).collect();
        for weak in roots_drained.into_iter().chain(ti.subs.drain().flat_map(|(_, r)| r.entries)) {
            if let Some(e) = weak.upgrade() {
                e.lock().clear_val();
            }
        }
        ti.root = None;
    }

    // ------------------------------------------------------------------------
    // Page-out
    // ------------------------------------------------------------------------

    /// Evacuates every unpaged tree of `ticket` onto the target allocator's
    /// device. Returns total bytes reclaimed on the source device.
    pub fn page_out(&self, ticket: u64, target: &Arc<PerOpAllocator>) -> Result<u64> {
        // Detach candidate trees under the registry lock, then migrate them
        // one by one, locking in a fixed order (ascending root id).
        let mut trees: Vec<Arc<TensorBufferTree>> = {
            let mut inner = self.inner.lock();
            let Some(list) = inner.by_ticket.get_mut(&ticket) else { return Ok(0) };
            let mut picked = Vec::new();
            list.retain(|tree| {
                let ti = tree.inner.lock();
                let eligible = !ti.paged_out && ti.root.is_some() && !tree.is_pinned();
                drop(ti);
                if eligible {
                    picked.push(tree.clone());
                    false
                } else {
                    true
                }
            });
            for tree in &picked {
                if let Some(id) = tree.root_id() {
                    inner.by_root.remove(&id);
                }
            }
            picked
        };
        trees.sort_by_key(|t| t.root_id().unwrap_or(u64::MAX));

        let new_ticket = target.ticket();
        let mut reclaimed = 0u64;
        let mut migrated = Vec::with_capacity(trees.len());
        for tree in trees {
            let mut ti = tree.inner.lock();
            match migrate_tree(&mut ti, target) {
                Ok(bytes) => {
                    ti.paged_out = true;
                    ti.ticket = new_ticket;
                    reclaimed += bytes;
                    drop(ti);
                    migrated.push(tree);
                }
                Err(e) => {
                    log::error!("Error when paging tree of ticket {}: {}", ticket, e);
                    drop(ti);
                    // Put it back untouched so later attempts can retry.
                    migrated.push(tree);
                }
            }
        }

        let mut inner = self.inner.lock();
        for tree in migrated {
            let t = tree.ticket();
            if let Some(id) = tree.root_id() {
                inner.by_root.insert(id, tree.clone());
            }
            inner.by_ticket.entry(t).or_default().push(tree);
        }

        log::info!(
            "Paged out {} from ticket {} to {}",
            fmt_bytes(reclaimed),
            ticket,
            target.device().spec()
        );
        Ok(reclaimed)
    }

    // ------------------------------------------------------------------------
    // Page-in (re-fault)
    // ------------------------------------------------------------------------

    /// Brings a paged-out tree back onto `home`'s device. Double-checked:
    /// returns immediately when another thread faulted it in first.
    pub fn page_in(&self, tree: &Arc<TensorBufferTree>, home: &Arc<PerOpAllocator>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut ti = tree.inner.lock();
        if !ti.paged_out {
            return Ok(0);
        }

        let old_ticket = ti.ticket;
        let old_root = ti.root.as_ref().map(|b| b.id());
        let bytes = migrate_tree(&mut ti, home)?;
        ti.paged_out = false;
        ti.ticket = home.ticket();
        let new_root = ti.root.as_ref().map(|b| b.id());
        let new_ticket = ti.ticket;
        drop(ti);

        // Re-key the registry for the new ticket and root.
        if let Some(id) = old_root {
            inner.by_root.remove(&id);
        }
        if let Some(list) = inner.by_ticket.get_mut(&old_ticket) {
            list.retain(|t| !Arc::ptr_eq(t, tree));
        }
        if let Some(id) = new_root {
            inner.by_root.insert(id, tree.clone());
        }
        inner.by_ticket.entry(new_ticket).or_default().push(tree.clone());

        log::debug!("Paged in {} for ticket {}", fmt_bytes(bytes), new_ticket);
        Ok(bytes)
    }
}

// ============================================================================
// 3. MIGRATION
// ============================================================================

/// Moves one whole alias set onto `target`'s device: the root buffer is
/// copied once, root entries are retargeted to the copy, and each sub-buffer
/// is re-derived on the new root before its entries are retargeted.
fn migrate_tree(ti: &mut TreeInner, target: &Arc<PerOpAllocator>) -> Result<u64> {
    let Some(old_root) = ti.root.clone() else {
        return Ok(0);
    };
    let size = old_root.size();
    let attrs = AllocAttributes { on_host: !target.device().spec().is_gpu() };
    let device: DeviceRef = target.device().clone();

    let new_root = TensorBuffer::allocate(target, size, attrs)?;
    new_root.write(&old_root.read())?;

    let new_ticket = target.ticket();

    // Entries may share a Ref slot; only the first sighting rewrites it.
    let mut moved_slots: Vec<*const ()> = Vec::new();

    let mut live_roots = Vec::with_capacity(ti.roots.len());
    for weak in ti.roots.drain(..) {
        let Some(entry_ref) = weak.upgrade() else { continue };
        retarget_entry(&entry_ref, &new_root, new_ticket, attrs, &device, &mut moved_slots)?;
        live_roots.push(weak);
    }
    ti.roots = live_roots;

    let mut new_subs = HashMap::with_capacity(ti.subs.len());
    for (_, rec) in ti.subs.drain() {
        let Some(old_sub) = rec.buffer.upgrade() else { continue };
        let Some((offset, len)) = old_sub.sub_range() else { continue };
        let new_sub = TensorBuffer::sub(&new_root, offset, len)?;

        let mut live = Vec::with_capacity(rec.entries.len());
        for weak in rec.entries {
            let Some(entry_ref) = weak.upgrade() else { continue };
            retarget_entry(&entry_ref, &new_sub, new_ticket, attrs, &device, &mut moved_slots)?;
            live.push(weak);
        }
        if !live.is_empty() {
            new_subs.insert(
                new_sub.id(),
                SubRecord { buffer: Arc::downgrade(&new_sub), entries: live },
            );
        }
    }
    ti.subs = new_subs;
    ti.root = Some(new_root);

    // The old root drops here; its grant returns the source bytes.
    Ok(size as u64)
}

fn retarget_entry(
    entry_ref: &EntryRef,
    buffer: &Arc<TensorBuffer>,
    ticket: u64,
    attrs: AllocAttributes,
    device: &DeviceRef,
    moved_slots: &mut Vec<*const ()>,
) -> Result<()> {
    let mut entry = entry_ref.lock();
    match &entry.value {
        EntryValue::Empty => return Ok(()),
        EntryValue::Val(t) => {
            let t = t.with_buffer(buffer.clone())?;
            entry.value = EntryValue::Val(t);
        }
        EntryValue::Ref(slot) => {
            let ptr = Arc::as_ptr(slot) as *const ();
            if !moved_slots.contains(&ptr) {
                let mut guard = slot.lock();
                *guard = guard.with_buffer(buffer.clone())?;
                moved_slots.push(ptr);
            }
        }
    }
    entry.alloc_ticket = ticket;
    entry.alloc_attr = attrs;
    entry.device = Some(device.clone());
    Ok(())
}
