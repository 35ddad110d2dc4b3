//! The runtime: heaps, the guard, type descriptors and the pause coordinator
//! they share.

use std::hash::BuildHasher;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, LazyLock};

use parking_lot::{Mutex, RwLock};

use crate::classify::{AllocationHandle, Classify, GuardedClassifier};
use crate::collector::Phase;
use crate::config::{ConfigError, GcConfig};
use crate::error::{fatal, FatalError};
use crate::header::{flags, AllocHeader, MapId, ScanDescriptor, HEADER_SIZE};
use crate::heap::{Heap, HeapInner, HeapOptions};
use crate::layout::{PointerMap, ScanLayout, TypeRegistry};
use crate::metrics::CollectionMetrics;
use crate::pause::{current_thread_id, PauseCoordinator, ThreadRecord};
use crate::roots::{RootId, RootRegistry};
use crate::tracing::internal::{log_heap_created, log_heap_deleted, log_pause_unacknowledged};

/// Id of the heap every runtime starts with.
pub const DEFAULT_HEAP_ID: u32 = 0;

/// Callback invoked with the data pointer of each unreachable allocation
/// made with `finalize = true`.
pub type Finalizer = fn(NonNull<u8>);

pub(crate) struct Shared {
    pub(crate) config: GcConfig,
    pub(crate) guard: u64,
    pub(crate) coordinator: Arc<PauseCoordinator>,
    heaps: RwLock<Vec<Option<Arc<HeapInner>>>>,
    pub(crate) bootstrap_roots: RootRegistry,
    pub(crate) types: TypeRegistry,
    pub(crate) collecting: AtomicBool,
    phase: AtomicU8,
    pub(crate) finalizer: RwLock<Option<Finalizer>>,
    hash_lock: Mutex<()>,
    pub(crate) last_metrics: Mutex<Option<CollectionMetrics>>,
}

impl Shared {
    pub(crate) fn live_heaps(&self) -> Vec<Arc<HeapInner>> {
        self.heaps.read().iter().flatten().cloned().collect()
    }

    pub(crate) fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::SeqCst)
    }

    /// Stops the world and gives other threads `ack_timeout` to park.
    /// Returns the threads that did not.
    pub(crate) fn pause(&self) -> Vec<u64> {
        self.coordinator.stop_the_world();
        let stragglers = self.coordinator.await_acknowledgement(self.config.ack_timeout);
        if !stragglers.is_empty() {
            log_pause_unacknowledged(&stragglers);
        }
        stragglers
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn heap_containing(&self, addr: usize) -> Option<Arc<HeapInner>> {
        self.heaps
            .read()
            .iter()
            .flatten()
            .find(|h| h.contains(addr))
            .cloned()
    }
}

/// A random guard word. The high bit keeps it from looking like a user-space
/// address and the low bit from looking aligned.
fn random_guard() -> u64 {
    let seed = std::collections::hash_map::RandomState::new();
    let local = 0u8;
    let entropy = seed.hash_one((current_thread_id(), std::ptr::addr_of!(local) as usize));
    entropy | (1 << 63) | 1
}

fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// An allocator instance: a set of heaps collected under one pause
/// coordinator.
///
/// Cloning is cheap. [`Runtime::global`] is the process-wide instance; other
/// runtimes are mostly useful for isolation in tests.
///
/// # Example
///
/// ```
/// use guarded_gc::{GcConfig, Runtime, ScanDescriptor};
///
/// let rt = Runtime::new(GcConfig::default().with_scan_thread_stacks(false)).unwrap();
/// let heap = rt.default_heap();
///
/// let mut root = heap.alloc(16, ScanDescriptor::None, false).as_ptr() as usize;
/// unsafe { heap.register_root(&raw mut root, 1) };
/// heap.collect();
/// assert!(rt.is_live_pointer(root));
/// heap.remove_root(&raw const root);
/// ```
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Runtime {
    /// A runtime with its own pause coordinator.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field of `config`.
    pub fn new(config: GcConfig) -> Result<Self, ConfigError> {
        let coordinator = PauseCoordinator::new(&config);
        Self::with_coordinator(config, coordinator)
    }

    /// A runtime whose pauses go through `coordinator`.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field of `config`.
    pub fn with_coordinator(
        config: GcConfig,
        coordinator: Arc<PauseCoordinator>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_parts(config, coordinator))
    }

    fn from_parts(config: GcConfig, coordinator: Arc<PauseCoordinator>) -> Self {
        let default = HeapInner::new(
            DEFAULT_HEAP_ID,
            "default",
            HeapOptions::default(),
            config.initial_arena_bytes,
        );
        log_heap_created(DEFAULT_HEAP_ID, "default");
        Self {
            shared: Arc::new(Shared {
                config,
                guard: random_guard(),
                coordinator,
                heaps: RwLock::new(vec![Some(Arc::new(default))]),
                bootstrap_roots: RootRegistry::new(),
                types: TypeRegistry::new(),
                collecting: AtomicBool::new(false),
                phase: AtomicU8::new(Phase::Idle as u8),
                finalizer: RwLock::new(None),
                hash_lock: Mutex::new(()),
                last_metrics: Mutex::new(None),
            }),
        }
    }

    /// The process-wide runtime, using the default configuration and the
    /// global pause coordinator.
    #[must_use]
    pub fn global() -> &'static Self {
        static GLOBAL: LazyLock<Runtime> = LazyLock::new(|| {
            Runtime::from_parts(GcConfig::default(), Arc::clone(PauseCoordinator::global()))
        });
        &GLOBAL
    }

    /// The configuration the runtime was built with.
    #[must_use]
    pub fn config(&self) -> &GcConfig {
        &self.shared.config
    }

    /// The guard word stamped into every header.
    #[must_use]
    pub fn guard(&self) -> u64 {
        self.shared.guard
    }

    /// The pause coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &Arc<PauseCoordinator> {
        &self.shared.coordinator
    }

    /// The current collection phase, `Idle` outside collections.
    #[must_use]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.shared.phase.load(Ordering::SeqCst))
    }

    // Heaps

    /// Creates a heap and maps its first arena.
    #[allow(clippy::cast_possible_truncation)]
    pub fn new_heap(&self, name: &str, options: HeapOptions) -> Heap {
        let mut heaps = self.shared.heaps.write();
        let index = heaps
            .iter()
            .skip(1)
            .position(Option::is_none)
            .map_or(heaps.len(), |i| i + 1);
        let id = index as u32;
        let inner = Arc::new(HeapInner::new(
            id,
            name,
            options,
            self.shared.config.initial_arena_bytes,
        ));
        if index == heaps.len() {
            heaps.push(Some(Arc::clone(&inner)));
        } else {
            heaps[index] = Some(Arc::clone(&inner));
        }
        drop(heaps);
        log_heap_created(id, name);
        Heap::new(Arc::clone(&self.shared), inner)
    }

    /// Unmaps every arena of `heap` and frees its id.
    ///
    /// Returns `false` for the default heap and for heaps of other runtimes.
    /// Pointers into the heap are dangling afterwards; allocating from it
    /// aborts.
    pub fn delete_heap(&self, heap: &Heap) -> bool {
        if heap.id() == DEFAULT_HEAP_ID || !Arc::ptr_eq(&heap.shared, &self.shared) {
            return false;
        }
        let coordinator = &self.shared.coordinator;
        self.shared.pause();
        let removed = {
            let mut heaps = self.shared.heaps.write();
            match heaps.get_mut(heap.id() as usize) {
                Some(slot) if slot.as_ref().is_some_and(|h| Arc::ptr_eq(h, &heap.inner)) => {
                    *slot = None;
                    true
                }
                _ => false,
            }
        };
        if removed {
            heap.inner.delete();
            log_heap_deleted(heap.id());
        }
        coordinator.restart_the_world();
        removed
    }

    /// The heap every runtime starts with.
    #[must_use]
    pub fn default_heap(&self) -> Heap {
        match self.heap(DEFAULT_HEAP_ID) {
            Some(heap) => heap,
            None => fatal(FatalError::HeapDeleted {
                id: DEFAULT_HEAP_ID,
            }),
        }
    }

    /// The live heap with `id`.
    #[must_use]
    pub fn heap(&self, id: u32) -> Option<Heap> {
        let inner = self.shared.heaps.read().get(id as usize)?.clone()?;
        Some(Heap::new(Arc::clone(&self.shared), inner))
    }

    /// Every live heap, by id.
    #[must_use]
    pub fn heaps(&self) -> Vec<Heap> {
        self.shared
            .live_heaps()
            .into_iter()
            .map(|inner| Heap::new(Arc::clone(&self.shared), inner))
            .collect()
    }

    /// The heap whose arenas contain `ptr`.
    #[must_use]
    pub fn find_heap(&self, ptr: *const u8) -> Option<Heap> {
        self.shared
            .heap_containing(ptr as usize)
            .map(|inner| Heap::new(Arc::clone(&self.shared), inner))
    }

    /// Collects `heap`. Equivalent to [`Heap::collect`].
    pub fn collect(&self, heap: &Heap) -> Option<CollectionMetrics> {
        heap.collect()
    }

    /// Collects the default heap.
    pub fn collect_default(&self) -> Option<CollectionMetrics> {
        self.default_heap().collect()
    }

    /// Statistics of the most recent collection in this runtime.
    #[must_use]
    pub fn last_collection_metrics(&self) -> Option<CollectionMetrics> {
        *self.shared.last_metrics.lock()
    }

    // Pauses

    /// Registers the calling thread with the coordinator. Idempotent.
    pub fn register_current_thread(&self) -> Arc<ThreadRecord> {
        self.shared.coordinator.register_current_thread()
    }

    /// See [`PauseCoordinator::stop_the_world`].
    pub fn stop_the_world(&self) {
        self.shared.coordinator.stop_the_world();
    }

    /// See [`PauseCoordinator::restart_the_world`].
    pub fn restart_the_world(&self) {
        self.shared.coordinator.restart_the_world();
    }

    /// See [`PauseCoordinator::checkin`].
    pub fn checkin(&self) {
        self.shared.coordinator.checkin();
    }

    /// See [`PauseCoordinator::suspend`].
    #[inline(always)]
    pub fn suspend(&self) {
        self.shared.coordinator.suspend();
    }

    /// See [`PauseCoordinator::resume`].
    pub fn resume(&self) {
        self.shared.coordinator.resume();
    }

    /// See [`PauseCoordinator::blocking`].
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        self.shared.coordinator.blocking(f)
    }

    /// Allocates `len` zeroed bytes that are never scanned.
    ///
    /// While the caller holds the pause the bytes come from the scratch pool
    /// and die when the outermost pause ends; otherwise they are an ordinary
    /// allocation in the default heap.
    #[must_use]
    pub fn pause_alloc(&self, len: usize) -> NonNull<u8> {
        let coordinator = &self.shared.coordinator;
        if coordinator.owned_by_current_thread() {
            coordinator.scratch().alloc(len)
        } else {
            self.default_heap().alloc(len, ScanDescriptor::None, false)
        }
    }

    // Roots and types

    /// Adds a range traced before any heap root, in every collection.
    ///
    /// # Safety
    ///
    /// As for [`Heap::register_root`].
    pub unsafe fn register_bootstrap_root(&self, ptr: *mut usize, words: usize) -> RootId {
        // SAFETY: forwarded to the caller.
        unsafe { self.shared.bootstrap_roots.register(ptr, words) }
    }

    /// Removes a bootstrap root registered at `ptr`.
    pub fn remove_bootstrap_root(&self, ptr: *const usize) -> bool {
        self.shared.bootstrap_roots.remove(ptr)
    }

    /// The cached scan descriptor for `T`.
    #[must_use]
    pub fn descriptor_of<T: ScanLayout>(&self) -> ScanDescriptor {
        self.shared.types.descriptor_of::<T>()
    }

    /// The cheapest descriptor equivalent to `map`, registering the map if
    /// a bitmap is needed.
    pub fn register_pointer_map(&self, map: PointerMap) -> ScanDescriptor {
        self.shared.types.descriptor_for(map)
    }

    /// A registered pointer map.
    #[must_use]
    pub fn pointer_map(&self, id: MapId) -> Option<Arc<PointerMap>> {
        self.shared.types.map(id)
    }

    // Allocation introspection

    /// The header of the allocation whose data starts at `ptr`.
    ///
    /// Aborts if `ptr` is outside every heap or the guard before it is wrong.
    #[must_use]
    pub fn header_of(&self, ptr: *const u8) -> NonNull<AllocHeader> {
        let addr = ptr as usize;
        let Some(heap) = self
            .shared
            .heap_containing(addr.wrapping_sub(HEADER_SIZE))
        else {
            fatal(FatalError::NotAnAllocation { addr });
        };
        if !heap.issued_contains(addr.wrapping_sub(HEADER_SIZE)) {
            fatal(FatalError::NotAnAllocation { addr });
        }
        // SAFETY: the header position lies in issued arena memory.
        match unsafe { AllocHeader::from_data(ptr, self.shared.guard) } {
            Ok(hdr) => hdr,
            Err(found) => fatal(FatalError::CorruptGuard {
                addr: addr - HEADER_SIZE,
                found,
            }),
        }
    }

    /// The allocation `addr` points into, if any non-private heap has one
    /// there. Only meaningful while no other thread allocates.
    #[must_use]
    pub fn find_allocation(&self, addr: usize) -> Option<AllocationHandle> {
        let mut classifier = GuardedClassifier::new(self.shared.guard);
        for heap in self.shared.live_heaps() {
            if !heap.private {
                classifier.add_heap(&heap, false);
            }
        }
        classifier.seal().classify(addr)
    }

    /// Whether `addr` lies in the issued part of a currently mapped arena.
    #[must_use]
    pub fn is_live_pointer(&self, addr: usize) -> bool {
        self.shared
            .heaps
            .read()
            .iter()
            .flatten()
            .any(|h| h.issued_contains(addr))
    }

    /// A hash of the allocation at `ptr` that survives relocation.
    ///
    /// Computed from the address on first use and cached in the header.
    #[must_use]
    pub fn identity_hash(&self, ptr: *const u8) -> u64 {
        let hdr = self.header_of(ptr);
        let _lock = self.shared.hash_lock.lock();
        // SAFETY: `header_of` validated the guard, and the hash slot is only
        // written under `hash_lock` or by a collection, which cannot run
        // while this thread is outside a safe point.
        let hdr = unsafe { &mut *hdr.as_ptr() };
        if let Some(hash) = hdr.cached_hash() {
            return hash;
        }
        let hash = mix64(ptr as u64 ^ self.shared.guard);
        hdr.cache_hash(hash);
        hash
    }

    /// Sets (or clears) the callback for unreachable finalizable allocations.
    ///
    /// The callback runs during a collection with the world stopped, while
    /// the dead allocation is still readable.
    pub fn set_finalizer(&self, finalizer: Option<Finalizer>) {
        *self.shared.finalizer.write() = finalizer;
    }

    /// Allocates `new_len` bytes in the heap holding `ptr` and copies the
    /// first `min(old, new)` bytes over.
    ///
    /// The new allocation keeps the old one's descriptor and takes over its
    /// finalizer registration. The old allocation is left for the collector.
    #[must_use]
    pub fn resize(&self, ptr: NonNull<u8>, new_len: usize) -> NonNull<u8> {
        let hdr = self.header_of(ptr.as_ptr());
        let Some(heap) = self.find_heap(ptr.as_ptr()) else {
            fatal(FatalError::NotAnAllocation {
                addr: ptr.as_ptr() as usize,
            });
        };
        // SAFETY: validated by `header_of`.
        let (scan, extra) = unsafe {
            let hdr = hdr.as_ref();
            let mut extra = 0;
            if hdr.wants_finalizer() {
                extra |= flags::FINALIZE;
            }
            if hdr.is_object() {
                extra |= flags::OBJECT;
            }
            (hdr.scan(), extra)
        };

        // The allocation below may collect; keep the old pointer current.
        let mut slot = ptr.as_ptr() as usize;
        // SAFETY: `slot` outlives the registration, which is removed below.
        let root = unsafe { heap.inner.roots.register(&raw mut slot, 1) };
        let new = heap.alloc_with_flags(new_len, scan, extra);
        heap.inner.roots.remove_id(root);
        // SAFETY: `slot` is a live local.
        let old = unsafe { std::ptr::read_volatile(&raw const slot) } as *const u8;

        let old_hdr = self.header_of(old);
        // SAFETY: validated by `header_of`.
        let old_len = unsafe { old_hdr.as_ref().request_len() };
        if extra & flags::FINALIZE != 0 {
            let old_addr = old_hdr.as_ptr() as usize;
            heap.inner.finalizers.lock().retain(|&a| a != old_addr);
        }
        // SAFETY: both regions are live allocations of at least the copied
        // length and never overlap.
        unsafe { std::ptr::copy_nonoverlapping(old, new.as_ptr(), old_len.min(new_len)) };
        new
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("guard", &format_args!("{:#018x}", self.shared.guard))
            .field("heaps", &self.shared.live_heaps().len())
            .field("phase", &self.phase())
            .field("coordinator", &self.shared.coordinator)
            .finish_non_exhaustive()
    }
}
