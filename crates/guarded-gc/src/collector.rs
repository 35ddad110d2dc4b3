//! The copying collector.
//!
//! One cycle runs on the thread that asked for it, with the world stopped:
//!
//! ```text
//! Idle -> Setup -> TraceTypes -> TraceRoots -> TraceStacks -> Finalize -> Idle
//! ```
//!
//! Every word the tracer visits is classified; words that address an object
//! of the collected heap are rewritten to the object's to-space copy, which is
//! stamped the first time the object is reached. Objects of other heaps are
//! marked and scanned in place, and unmarked again during `Finalize`. Each
//! trace phase drains the work list before the next one starts.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::arena::Arena;
use crate::classify::{Classify, GuardedClassifier};
use crate::error::{fatal, FatalError};
use crate::header::{rewrite_pointer, AllocHeader, ScanDescriptor};
use crate::heap::{scale, HeapInner};
use crate::layout::PointerMap;
use crate::metrics::{global_metrics, CollectionMetrics, PhaseTimer};
use crate::runtime::Shared;
use crate::stack;
use crate::tracing::internal::{
    log_collection_skipped, log_phase_end, log_phase_start, next_gc_id, trace_gc_collection,
    trace_phase,
};
use crate::worklist::WorkList;

/// Where a collection is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Phase {
    /// No collection is running.
    Idle = 0,
    /// Snapshotting arenas and mapping to-space.
    Setup = 1,
    /// Tracing bootstrap roots.
    TraceTypes = 2,
    /// Tracing registered heap roots.
    TraceRoots = 3,
    /// Tracing thread stacks.
    TraceStacks = 4,
    /// Installing to-space, finalizing and unmapping from-space.
    Finalize = 5,
}

impl Phase {
    /// Slot of this phase in a [`PhaseTimer`]. `Idle` is not timed.
    #[must_use]
    pub const fn timer_index(self) -> Option<usize> {
        match self {
            Self::Idle => None,
            Self::Setup => Some(0),
            Self::TraceTypes => Some(1),
            Self::TraceRoots => Some(2),
            Self::TraceStacks => Some(3),
            Self::Finalize => Some(4),
        }
    }

    pub(crate) const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Setup,
            2 => Self::TraceTypes,
            3 => Self::TraceRoots,
            4 => Self::TraceStacks,
            5 => Self::Finalize,
            _ => Self::Idle,
        }
    }
}

/// Collects `heap`, stopping the world for the duration.
///
/// `request` is the allocation that triggered the collection, if any; the
/// newest arena is guaranteed to fit it afterwards. With `seen`, the
/// collection is skipped when the heap's collection count no longer matches,
/// because another thread collected it while this one waited for the pause.
pub(crate) fn collect(
    shared: &Shared,
    heap: &HeapInner,
    request: usize,
    seen: Option<usize>,
) -> Option<CollectionMetrics> {
    if heap.is_deleted() {
        fatal(FatalError::HeapDeleted { id: heap.id });
    }
    if heap.is_pinned() {
        log_collection_skipped(heap.id, "pinned");
        return None;
    }

    let stragglers = shared.pause();
    let metrics = stack::with_spilled_registers(|sp| {
        if let Some(me) = shared.coordinator.current() {
            me.record_stack_top(sp);
        }
        if seen.is_some_and(|n| n != heap.collections()) {
            log_collection_skipped(heap.id, "already collected");
            return None;
        }
        if shared.collecting.swap(true, Ordering::SeqCst) {
            log_collection_skipped(heap.id, "collection running");
            return None;
        }
        let metrics = run_collection(shared, heap, request, stragglers);
        shared.collecting.store(false, Ordering::SeqCst);
        Some(metrics)
    });
    shared.coordinator.restart_the_world();
    metrics
}

// Kept out of line so the collector's own locals sit below the recorded
// stack top and are never scanned.
#[inline(never)]
fn run_collection(
    shared: &Shared,
    heap: &HeapInner,
    request: usize,
    stragglers: Vec<u64>,
) -> CollectionMetrics {
    let gc_id = next_gc_id();
    let _span = trace_gc_collection(gc_id, &heap.name, heap.id);
    let start = Instant::now();

    let mut collection = Collection::setup(shared, heap, request, stragglers);
    collection.run_phase(Phase::TraceTypes, Collection::trace_types);
    collection.run_phase(Phase::TraceRoots, Collection::trace_roots);
    collection.run_phase(Phase::TraceStacks, Collection::trace_stacks);
    let metrics = collection.finalize(request, start);

    shared.set_phase(Phase::Idle);
    metrics
}

/// Which data words of one object are candidates.
enum Candidates {
    All,
    Nothing,
    Prefix(usize),
    Map(Arc<PointerMap>),
}

impl Candidates {
    fn new(scan: ScanDescriptor, maps: &[Arc<PointerMap>]) -> Self {
        match scan {
            ScanDescriptor::All => Self::All,
            ScanDescriptor::None | ScanDescriptor::Prefix(0) => Self::Nothing,
            ScanDescriptor::Prefix(n) => Self::Prefix(n as usize),
            // An unknown map scans everything.
            ScanDescriptor::Map(id) => maps
                .get(id.index())
                .map_or(Self::All, |map| Self::Map(Arc::clone(map))),
        }
    }

    fn includes(&self, index: usize) -> bool {
        match self {
            Self::All => true,
            Self::Nothing => false,
            Self::Prefix(n) => index < *n,
            Self::Map(map) => map.is_pointer(index),
        }
    }
}

struct Collection<'a> {
    shared: &'a Shared,
    heap: &'a HeapInner,
    classifier: GuardedClassifier,
    maps: Vec<Arc<PointerMap>>,
    to_space: Vec<Arena>,
    chunk_bytes: usize,
    scan_list: WorkList<'a>,
    cleanup_list: WorkList<'a>,
    timer: PhaseTimer,
    stragglers: Vec<u64>,
    bytes_before: usize,
    copied: usize,
    cross_heap: usize,
}

impl<'a> Collection<'a> {
    fn setup(
        shared: &'a Shared,
        heap: &'a HeapInner,
        request: usize,
        stragglers: Vec<u64>,
    ) -> Self {
        let mut timer = PhaseTimer::new();
        timer.start(Phase::Setup);
        shared.set_phase(Phase::Setup);
        let _span = trace_phase(Phase::Setup);
        let bytes_before = heap.used_bytes();
        log_phase_start(Phase::Setup, bytes_before);

        let mut classifier = GuardedClassifier::new(shared.guard);
        classifier.add_heap(heap, true);
        if !heap.local_collects {
            for other in shared.live_heaps() {
                if other.id != heap.id && !other.private && !other.no_trace {
                    classifier.add_heap(&other, false);
                }
            }
        }
        let classifier = classifier.seal();

        let config = &shared.config;
        let mut estimate = scale(heap.survivor_bytes(), config.growth_factor);
        if heap.expand.swap(false, Ordering::SeqCst) {
            estimate = scale(estimate, config.expand_factor);
        }
        let chunk_bytes = estimate.max(heap.initial_bytes).saturating_add(request);
        let to_space = vec![Arena::map(chunk_bytes, heap.id, false)];

        let pool = shared.coordinator.scratch();
        let collection = Self {
            shared,
            heap,
            classifier,
            maps: shared.types.maps(),
            to_space,
            chunk_bytes,
            scan_list: WorkList::new(pool),
            cleanup_list: WorkList::new(pool),
            timer,
            stragglers,
            bytes_before,
            copied: 0,
            cross_heap: 0,
        };
        log_phase_end(Phase::Setup, 0);
        collection
    }

    fn run_phase(&mut self, phase: Phase, body: fn(&mut Self)) {
        self.shared.set_phase(phase);
        self.timer.start(phase);
        let _span = trace_phase(phase);
        log_phase_start(phase, self.bytes_before);
        let reached_before = self.copied + self.cross_heap;

        body(self);
        self.drain();
        debug_assert!(self.scan_list.is_empty());

        log_phase_end(phase, self.copied + self.cross_heap - reached_before);
    }

    fn trace_types(&mut self) {
        let shared = self.shared;
        shared
            .bootstrap_roots
            .for_each_active(|ptr, words| self.visit_range(ptr, words));
    }

    fn trace_roots(&mut self) {
        let heap = self.heap;
        if heap.local_collects {
            heap.roots
                .for_each_active(|ptr, words| self.visit_range(ptr, words));
            return;
        }
        for other in self.shared.live_heaps() {
            if other.id != heap.id && other.no_trace {
                continue;
            }
            other
                .roots
                .for_each_active(|ptr, words| self.visit_range(ptr, words));
        }
    }

    fn trace_stacks(&mut self) {
        if !self.shared.config.scan_thread_stacks {
            return;
        }
        for thread in self.shared.coordinator.threads() {
            // A thread that never parked has no trustworthy stack top.
            if self.stragglers.contains(&thread.id()) {
                continue;
            }
            if let Some((low, high)) = thread.live_stack() {
                // SAFETY: the thread is parked, suspended or is this thread
                // below the recorded top, so the range is a live stack.
                unsafe { stack::for_each_word(low, high, |slot| self.visit_slot(slot)) };
            }
        }
    }

    fn visit_range(&mut self, ptr: *mut usize, words: usize) {
        for i in 0..words {
            self.visit_slot(ptr.wrapping_add(i));
        }
    }

    fn visit_slot(&mut self, slot: *mut usize) {
        // SAFETY: slots come from root ranges, live stacks or object data.
        let word = unsafe { slot.read() };
        if let Some(moved) = self.relocate(word) {
            if moved != word {
                // SAFETY: as above; all of them are writable.
                unsafe { slot.write(moved) };
            }
        }
    }

    /// The rewritten value of `word`, or `None` if it stays as it is.
    fn relocate(&mut self, word: usize) -> Option<usize> {
        let handle = self.classifier.classify(word)?;
        let from = handle.header();
        // SAFETY: classified headers are stamped and the world is stopped.
        let hdr = unsafe { &mut *from.as_ptr() };

        if hdr.is_traced() {
            if !handle.in_collected_heap() {
                return None;
            }
            return hdr.forwarding().map(|to| rewrite_pointer(word, from, to));
        }

        hdr.set_traced();
        if !handle.in_collected_heap() {
            self.cross_heap += 1;
            self.cleanup_list.enqueue(from);
            if hdr.ptr_scan() {
                self.scan_list.enqueue(from);
            }
            return None;
        }

        let to = self.reserve(hdr.alloc_len());
        // SAFETY: `to` is a fresh to-space region of `alloc_len` bytes.
        unsafe { hdr.forward_to(to) };
        self.copied += 1;
        self.scan_list.enqueue(from);
        Some(rewrite_pointer(word, from, to))
    }

    fn reserve(&mut self, len: usize) -> NonNull<AllocHeader> {
        loop {
            if let Some(at) = self.to_space.last().and_then(|a| a.try_bump(len)) {
                return at;
            }
            self.to_space
                .push(Arena::map(len.max(self.chunk_bytes), self.heap.id, false));
        }
    }

    fn drain(&mut self) {
        while let Some(hdr) = self.scan_list.dequeue() {
            self.scan_one(hdr);
        }
    }

    /// Visits the candidate words of one object and, if it moved, copies
    /// every data word into the copy as it goes.
    fn scan_one(&mut self, from: NonNull<AllocHeader>) {
        // SAFETY: work list entries are stamped headers.
        let (words, scan, data, dest) = unsafe {
            let hdr = from.as_ref();
            (
                hdr.data_words(),
                hdr.scan(),
                hdr.data().cast::<usize>(),
                hdr.forwarding().map(|to| to.as_ref().data().cast::<usize>()),
            )
        };
        let candidates = Candidates::new(scan, &self.maps);

        for i in 0..words {
            let src = data.wrapping_add(i);
            if candidates.includes(i) {
                self.visit_slot(src);
            }
            if let Some(dest) = dest {
                // SAFETY: both regions span `words` words.
                unsafe { dest.add(i).write(src.read()) };
            }
        }
    }

    fn finalize(mut self, request: usize, start: Instant) -> CollectionMetrics {
        let phase = Phase::Finalize;
        self.shared.set_phase(phase);
        self.timer.start(phase);
        let _span = trace_phase(phase);
        log_phase_start(phase, self.bytes_before);

        debug_assert_eq!(self.cleanup_list.len(), self.cross_heap);
        while let Some(hdr) = self.cleanup_list.dequeue() {
            // SAFETY: cleanup entries are stamped headers of live heaps.
            unsafe { (*hdr.as_ptr()).clear_traced() };
        }

        if request > 0 && !self.to_space.last().is_some_and(|a| a.available() >= request) {
            self.to_space
                .push(Arena::map(request.max(self.chunk_bytes), self.heap.id, false));
        }

        let to_space = std::mem::take(&mut self.to_space);
        let survivor_bytes: usize = to_space.iter().map(Arena::used).sum();
        let to_capacity: usize = to_space.iter().map(Arena::capacity).sum();
        let old = self.heap.install(to_space);

        let finalized = self.run_finalizers();
        drop(old);

        self.heap.finish_collection(self.copied, survivor_bytes);
        let low_percent = usize::from(self.shared.config.low_occupancy_percent);
        let expand_next = survivor_bytes * 100 < to_capacity * low_percent;
        self.heap.expand.store(expand_next, Ordering::SeqCst);

        log_phase_end(phase, finalized);
        self.timer.end();

        let mut metrics = CollectionMetrics {
            heap_id: self.heap.id,
            duration: start.elapsed(),
            bytes_before: self.bytes_before,
            bytes_after: survivor_bytes,
            to_space_bytes: to_capacity,
            objects_copied: self.copied,
            cross_heap_traced: self.cross_heap,
            finalized,
            expand_next,
            ..CollectionMetrics::new()
        };
        self.timer.fill(&mut metrics);
        global_metrics().record(&metrics);
        *self.shared.last_metrics.lock() = Some(metrics);
        metrics
    }

    /// Moves surviving finalizer entries to their copies and hands the rest
    /// to the runtime's callback. The from-space is still mapped.
    fn run_finalizers(&self) -> usize {
        let pending = std::mem::take(&mut *self.heap.finalizers.lock());
        if pending.is_empty() {
            return 0;
        }
        let callback = *self.shared.finalizer.read();
        let mut survivors = Vec::with_capacity(pending.len());
        let mut finalized = 0;

        for addr in pending {
            // SAFETY: entries are headers of from-space allocations, which
            // stay mapped until the caller drops the old arenas.
            let hdr = unsafe { &*(addr as *const AllocHeader) };
            if let Some(to) = hdr.forwarding() {
                survivors.push(to.as_ptr() as usize);
                continue;
            }
            finalized += 1;
            if let (Some(callback), Some(data)) = (callback, NonNull::new(hdr.data())) {
                callback(data);
            }
        }

        self.heap.finalizers.lock().extend(survivors);
        finalized
    }
}
