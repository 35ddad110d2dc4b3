//! Heaps.
//!
//! A heap is an ordered list of arenas that is collected as a unit. Only the
//! newest arena is bump-allocated from; older arenas (chained to-space or
//! emergency arenas) keep whatever they hold until the next collection.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::arena::{Arena, ArenaInfo};
use crate::collector;
use crate::error::{fatal, FatalError};
use crate::header::{alloc_len_for, flags, AllocHeader, ScanDescriptor, FORCED_ALIGNMENT};
use crate::layout::ScanLayout;
use crate::metrics::CollectionMetrics;
use crate::roots::{RootId, RootRegistry};
use crate::runtime::Shared;

/// Options for [`Runtime::new_heap`](crate::Runtime::new_heap).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapOptions {
    /// User bytes of the first arena. Defaults to the runtime's
    /// `initial_arena_bytes`.
    pub initial_bytes: Option<usize>,
    /// Never collect; grow by appending arenas instead.
    pub pinned: bool,
    /// Invisible to pointer classification unless it is the heap being
    /// collected.
    pub private: bool,
    /// Neither its roots nor its objects are traced when another heap is
    /// collected.
    pub no_trace: bool,
    /// Collecting this heap ignores every other heap's roots and objects.
    pub local_collects: bool,
}

impl HeapOptions {
    /// Sets [`initial_bytes`](Self::initial_bytes).
    #[must_use]
    pub const fn with_initial_bytes(mut self, bytes: usize) -> Self {
        self.initial_bytes = Some(bytes);
        self
    }

    /// Sets [`pinned`](Self::pinned).
    #[must_use]
    pub const fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    /// Sets [`private`](Self::private).
    #[must_use]
    pub const fn private(mut self) -> Self {
        self.private = true;
        self
    }

    /// Sets [`no_trace`](Self::no_trace).
    #[must_use]
    pub const fn no_trace(mut self) -> Self {
        self.no_trace = true;
        self
    }

    /// Sets [`local_collects`](Self::local_collects).
    #[must_use]
    pub const fn local_collects(mut self) -> Self {
        self.local_collects = true;
        self
    }
}

/// Snapshot of a heap's space usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes handed out, headers included.
    pub used: usize,
    /// Bytes still available in the arena allocations bump from.
    pub available: usize,
    /// User bytes across every arena.
    pub total: usize,
    /// Bytes mapped for the heap, guard and accounting pages included.
    pub mapped: usize,
    /// Number of arenas.
    pub arenas: usize,
    /// Completed collections.
    pub collections: usize,
    /// Allocations copied in by the last collection plus those made since.
    pub live_allocations: usize,
}

pub(crate) struct HeapInner {
    pub(crate) id: u32,
    pub(crate) name: String,
    pub(crate) initial_bytes: usize,
    pinned: AtomicBool,
    pub(crate) private: bool,
    pub(crate) no_trace: bool,
    pub(crate) local_collects: bool,
    pub(crate) expand: AtomicBool,
    pub(crate) arenas: RwLock<Vec<Arena>>,
    pub(crate) roots: RootRegistry,
    /// Header addresses of allocations awaiting finalization.
    pub(crate) finalizers: Mutex<Vec<usize>>,
    alloc_count: AtomicUsize,
    total_alloc_count: AtomicUsize,
    inherit_count: AtomicUsize,
    num_collects: AtomicUsize,
    survivor_bytes: AtomicUsize,
    deleted: AtomicBool,
}

impl HeapInner {
    pub(crate) fn new(id: u32, name: &str, options: HeapOptions, default_bytes: usize) -> Self {
        let initial_bytes = options.initial_bytes.unwrap_or(default_bytes);
        let first = Arena::map(initial_bytes, id, false);
        Self {
            id,
            name: name.to_owned(),
            initial_bytes,
            pinned: AtomicBool::new(options.pinned),
            private: options.private,
            no_trace: options.no_trace,
            local_collects: options.local_collects,
            expand: AtomicBool::new(false),
            arenas: RwLock::new(vec![first]),
            roots: RootRegistry::new(),
            finalizers: Mutex::new(Vec::new()),
            alloc_count: AtomicUsize::new(0),
            total_alloc_count: AtomicUsize::new(0),
            inherit_count: AtomicUsize::new(0),
            num_collects: AtomicUsize::new(0),
            survivor_bytes: AtomicUsize::new(0),
            deleted: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::SeqCst)
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub(crate) fn collections(&self) -> usize {
        self.num_collects.load(Ordering::SeqCst)
    }

    /// Bytes copied in by the last collection.
    pub(crate) fn survivor_bytes(&self) -> usize {
        self.survivor_bytes.load(Ordering::SeqCst)
    }

    fn bump(&self, len: usize) -> Option<NonNull<AllocHeader>> {
        self.arenas.read().last()?.try_bump(len)
    }

    /// Appends an arena with room for `len` bytes unless the newest one
    /// already has it.
    pub(crate) fn grow(&self, len: usize, min_bytes: usize, expand_factor: f64, emergency: bool) {
        let mut arenas = self.arenas.write();
        if arenas.last().is_some_and(|a| a.available() >= len) {
            return;
        }
        let mut bytes = len.max(min_bytes);
        if self.expand.swap(false, Ordering::SeqCst) {
            bytes = scale(bytes, expand_factor);
        }
        arenas.push(Arena::map(bytes, self.id, emergency));
    }

    /// Swaps in the arenas a collection filled, returning the old ones.
    pub(crate) fn install(&self, to_space: Vec<Arena>) -> Vec<Arena> {
        std::mem::replace(&mut *self.arenas.write(), to_space)
    }

    pub(crate) fn finish_collection(&self, copied: usize, survivor_bytes: usize) {
        self.inherit_count.store(copied, Ordering::SeqCst);
        self.alloc_count.store(0, Ordering::SeqCst);
        self.survivor_bytes.store(survivor_bytes, Ordering::SeqCst);
        self.num_collects.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn used_bytes(&self) -> usize {
        self.arenas.read().iter().map(Arena::used).sum()
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.arenas.read().iter().any(|a| a.contains(addr))
    }

    /// Whether `addr` lies in the issued part of one of this heap's arenas.
    pub(crate) fn issued_contains(&self, addr: usize) -> bool {
        self.arenas
            .read()
            .iter()
            .any(|a| addr >= a.start() && addr < a.next_alloc())
    }

    pub(crate) fn stats(&self) -> HeapStats {
        let arenas = self.arenas.read();
        let used = arenas.iter().map(Arena::used).sum();
        HeapStats {
            used,
            available: arenas.last().map_or(0, Arena::available),
            total: arenas.iter().map(Arena::capacity).sum(),
            mapped: arenas.iter().map(Arena::mapped_len).sum(),
            arenas: arenas.len(),
            collections: self.collections(),
            live_allocations: self.inherit_count.load(Ordering::SeqCst)
                + self.alloc_count.load(Ordering::SeqCst),
        }
    }

    /// Unmaps every arena. Later allocations abort.
    pub(crate) fn delete(&self) {
        self.deleted.store(true, Ordering::SeqCst);
        self.finalizers.lock().clear();
        let arenas = std::mem::take(&mut *self.arenas.write());
        drop(arenas);
    }
}

impl std::fmt::Debug for HeapInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapInner")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("arenas", &self.arenas.read().len())
            .field("collections", &self.collections())
            .finish_non_exhaustive()
    }
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub(crate) fn scale(bytes: usize, factor: f64) -> usize {
    let scaled = (bytes as f64 * factor).ceil();
    if scaled >= usize::MAX as f64 {
        usize::MAX / 2
    } else {
        (scaled as usize).max(bytes)
    }
}

/// A handle to one heap of a [`Runtime`](crate::Runtime).
///
/// Cloning is cheap; every clone refers to the same heap.
#[derive(Clone)]
pub struct Heap {
    pub(crate) shared: Arc<Shared>,
    pub(crate) inner: Arc<HeapInner>,
}

impl Heap {
    pub(crate) const fn new(shared: Arc<Shared>, inner: Arc<HeapInner>) -> Self {
        Self { shared, inner }
    }

    /// The heap's id, unique within its runtime while the heap lives.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// The heap's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Allocates `len` zeroed bytes.
    ///
    /// The words selected by `scan` are traced at collection time. With
    /// `finalize`, the runtime's finalizer callback sees the allocation once
    /// it is found unreachable.
    ///
    /// Never returns null. Allocation checks in with the pause coordinator
    /// first, so the calling thread may park here while another thread
    /// collects.
    ///
    /// # Panics
    ///
    /// Never; unrecoverable conditions abort the process.
    #[must_use]
    pub fn alloc(&self, len: usize, scan: ScanDescriptor, finalize: bool) -> NonNull<u8> {
        let extra = if finalize { flags::FINALIZE } else { 0 };
        self.alloc_with_flags(len, scan, extra)
    }

    /// Allocates zeroed storage for a `T`, scanned as `T`'s layout describes.
    ///
    /// Aborts if `T` needs more than 16-byte alignment.
    #[must_use]
    pub fn alloc_typed<T: ScanLayout>(&self) -> NonNull<T> {
        if std::mem::align_of::<T>() > FORCED_ALIGNMENT {
            fatal(FatalError::UnsupportedAlignment {
                align: std::mem::align_of::<T>(),
            });
        }
        let scan = self.shared.types.descriptor_of::<T>();
        self.alloc_with_flags(std::mem::size_of::<T>(), scan, flags::OBJECT)
            .cast()
    }

    pub(crate) fn alloc_with_flags(&self, len: usize, scan: ScanDescriptor, extra: u8) -> NonNull<u8> {
        let coordinator = &self.shared.coordinator;
        coordinator.register_current_thread();
        coordinator.checkin();

        let inner = &self.inner;
        if inner.is_deleted() {
            fatal(FatalError::HeapDeleted { id: inner.id });
        }
        let Some(total) = alloc_len_for(len) else {
            fatal(FatalError::AllocationTooLarge { requested: len });
        };

        let mut collected = false;
        loop {
            if let Some(hdr) = inner.bump(total) {
                return self.stamp(hdr, total, len, scan, extra);
            }
            if collected
                || inner.is_pinned()
                || self.shared.is_collecting()
                || coordinator.owned_by_current_thread()
            {
                inner.grow(
                    total,
                    self.shared.config.min_emergency_arena_bytes,
                    self.shared.config.expand_factor,
                    true,
                );
                continue;
            }
            collector::collect(&self.shared, inner, total, Some(inner.collections()));
            collected = true;
        }
    }

    fn stamp(
        &self,
        hdr: NonNull<AllocHeader>,
        total: usize,
        len: usize,
        scan: ScanDescriptor,
        extra: u8,
    ) -> NonNull<u8> {
        // SAFETY: `hdr` is a fresh, 16-aligned bump of `total` bytes.
        unsafe { AllocHeader::stamp(hdr.as_ptr(), self.shared.guard, total, len, scan, extra) };
        if extra & flags::FINALIZE != 0 {
            self.inner.finalizers.lock().push(hdr.as_ptr() as usize);
        }
        self.inner.alloc_count.fetch_add(1, Ordering::SeqCst);
        self.inner.total_alloc_count.fetch_add(1, Ordering::SeqCst);
        // SAFETY: the header was just written; its data region is non-null.
        unsafe { NonNull::new_unchecked(hdr.as_ref().data()) }
    }

    /// Registers `words` words at `ptr` as a root of this heap.
    ///
    /// # Safety
    ///
    /// The range must stay valid, word aligned and writable until removed.
    /// Words pointing at moved allocations are rewritten by collections.
    pub unsafe fn register_root(&self, ptr: *mut usize, words: usize) -> RootId {
        // SAFETY: forwarded to the caller.
        unsafe { self.inner.roots.register(ptr, words) }
    }

    /// Removes the root registered at `ptr`.
    pub fn remove_root(&self, ptr: *const usize) -> bool {
        self.inner.roots.remove(ptr)
    }

    /// Excludes (or re-includes) a root without removing it.
    pub fn set_root_active(&self, id: RootId, active: bool) {
        self.inner.roots.set_active(id, active);
    }

    /// The heap's root registry.
    #[must_use]
    pub fn roots(&self) -> &RootRegistry {
        &self.inner.roots
    }

    /// Pins or unpins the heap. A pinned heap grows instead of collecting.
    pub fn set_pinned(&self, pinned: bool) {
        self.inner.pinned.store(pinned, Ordering::SeqCst);
    }

    /// Whether the heap is pinned.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.inner.is_pinned()
    }

    /// Whether the heap is hidden from other heaps' collections.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.inner.private
    }

    /// Used, available and total bytes plus counters.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.inner.stats()
    }

    /// Allocations ever made in this heap.
    #[must_use]
    pub fn total_allocations(&self) -> usize {
        self.inner.total_alloc_count.load(Ordering::SeqCst)
    }

    /// What the accounting page of each arena records, oldest first.
    #[must_use]
    pub fn arena_infos(&self) -> Vec<ArenaInfo> {
        self.inner.arenas.read().iter().map(Arena::info).collect()
    }

    /// Whether `ptr` lies inside one of the heap's arenas.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.inner.contains(ptr as usize)
    }

    /// Calls `f` with every allocation in address order, arena by arena.
    ///
    /// The world is stopped for the duration of the walk. `f` must not
    /// allocate in this heap.
    pub fn for_each_allocation(&self, mut f: impl FnMut(&AllocHeader)) {
        let coordinator = &self.shared.coordinator;
        self.shared.pause();
        for arena in self.inner.arenas.read().iter() {
            // SAFETY: headers in the issued part stay valid while the arena
            // is alive and the world is stopped.
            arena.for_each_header(self.shared.guard, |hdr| f(unsafe { hdr.as_ref() }));
        }
        coordinator.restart_the_world();
    }

    /// Collects this heap now. Returns `None` if the heap is pinned.
    pub fn collect(&self) -> Option<CollectionMetrics> {
        collector::collect(&self.shared, &self.inner, 0, None)
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("stats", &self.inner.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GcConfig, Runtime};

    fn runtime() -> Runtime {
        Runtime::new(
            GcConfig::default()
                .with_initial_arena_bytes(64 * 1024)
                .with_min_emergency_arena_bytes(16 * 1024)
                .with_scan_thread_stacks(false),
        )
        .unwrap()
    }

    #[test]
    fn options_builders() {
        let options = HeapOptions::default()
            .with_initial_bytes(4096)
            .pinned()
            .private()
            .no_trace()
            .local_collects();
        assert_eq!(options.initial_bytes, Some(4096));
        assert!(options.pinned && options.private && options.no_trace && options.local_collects);
    }

    #[test]
    fn scale_never_shrinks() {
        assert_eq!(scale(100, 2.0), 200);
        assert_eq!(scale(100, 1.0), 100);
        assert_eq!(scale(3, 1.5), 5);
        assert!(scale(usize::MAX, 2.0) > 0);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn alloc_is_zeroed_aligned_and_counted() {
        let rt = runtime();
        let heap = rt.default_heap();
        let before = heap.stats();

        let p = heap.alloc(40, ScanDescriptor::All, false);
        assert_eq!(p.as_ptr() as usize % FORCED_ALIGNMENT, 0);
        for i in 0..40 {
            assert_eq!(unsafe { *p.as_ptr().add(i) }, 0);
        }

        let after = heap.stats();
        assert_eq!(after.used - before.used, alloc_len_for(40).unwrap());
        assert_eq!(after.live_allocations, before.live_allocations + 1);
        assert_eq!(heap.total_allocations(), 1);
        assert!(heap.contains(p.as_ptr()));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn pinned_heap_grows_instead_of_collecting() {
        let rt = runtime();
        let heap = rt.new_heap("pinned", HeapOptions::default().with_initial_bytes(4096).pinned());

        for _ in 0..200 {
            let _ = heap.alloc(100, ScanDescriptor::None, false);
        }
        let stats = heap.stats();
        assert!(stats.arenas > 1);
        assert_eq!(stats.mapped, stats.total + stats.arenas * 3 * sys_alloc::page_size());
        assert_eq!(stats.collections, 0);
        assert_eq!(stats.live_allocations, 200);
        assert!(heap.collect().is_none());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn walk_sees_every_allocation() {
        let rt = runtime();
        let heap = rt.new_heap("walk", HeapOptions::default().pinned());
        let sizes = [8usize, 24, 0, 100];
        for &size in &sizes {
            let _ = heap.alloc(size, ScanDescriptor::None, false);
        }
        let mut seen = Vec::new();
        heap.for_each_allocation(|hdr| seen.push(hdr.request_len()));
        assert_eq!(seen, sizes);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn typed_allocation_uses_cached_descriptor() {
        let rt = runtime();
        let heap = rt.default_heap();
        let p = heap.alloc_typed::<[u64; 4]>();
        let hdr = rt.header_of(p.as_ptr().cast());
        let hdr = unsafe { hdr.as_ref() };
        assert!(hdr.is_object());
        assert_eq!(hdr.scan(), ScanDescriptor::None);
        assert_eq!(hdr.request_len(), 32);

        let q = heap.alloc_typed::<[*mut u8; 2]>();
        let hdr = unsafe { rt.header_of(q.as_ptr().cast()).as_ref() };
        assert_eq!(hdr.scan(), ScanDescriptor::Prefix(2));
    }
}
