//! Collector tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for collections, pauses and arena management. Without it
//! every hook compiles to nothing.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    use crate::collector::Phase;
    use crate::error::FatalError;

    /// Stable identifier for a collection.
    ///
    /// Correlates every event emitted by one cycle. Starts at 1 and is
    /// monotonically increasing for the life of the process.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering a whole collection of one heap.
    pub fn trace_gc_collection(gc_id: GcId, heap: &str, heap_id: u32) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_collect", gc_id = gc_id.0, heap, heap_id).entered()
    }

    /// Span covering one collection phase.
    pub fn trace_phase(phase: Phase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    pub fn log_phase_start(phase: Phase, bytes_before: usize) {
        tracing::debug!(phase = ?phase, bytes_before, "phase_start");
    }

    pub fn log_phase_end(phase: Phase, objects: usize) {
        tracing::debug!(phase = ?phase, objects, "phase_end");
    }

    pub fn log_collection_skipped(heap_id: u32, reason: &'static str) {
        tracing::debug!(heap_id, reason, "collection_skipped");
    }

    pub fn log_stop_the_world(thread: u64, nesting: u32) {
        tracing::trace!(thread, nesting, "stop_the_world");
    }

    pub fn log_restart_the_world(thread: u64, nesting: u32) {
        tracing::trace!(thread, nesting, "restart_the_world");
    }

    pub fn log_checkin_park(thread: u64) {
        tracing::trace!(thread, "checkin_park");
    }

    pub fn log_pause_unacknowledged(threads: &[u64]) {
        tracing::warn!(threads = ?threads, "pause_unacknowledged");
    }

    pub fn log_arena_mapped(heap_id: u32, user_bytes: usize, emergency: bool) {
        tracing::debug!(heap_id, user_bytes, emergency, "arena_mapped");
    }

    pub fn log_heap_created(heap_id: u32, name: &str) {
        tracing::debug!(heap_id, name, "heap_created");
    }

    pub fn log_heap_deleted(heap_id: u32) {
        tracing::debug!(heap_id, "heap_deleted");
    }

    pub fn log_fatal(err: &FatalError) {
        tracing::error!(error = %err, "fatal");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
pub mod internal {
    use crate::collector::Phase;
    use crate::error::FatalError;

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub guard standing in for an entered span.
    pub struct NoSpan;

    pub fn next_gc_id() -> GcId {
        GcId(0)
    }

    pub fn trace_gc_collection(_gc_id: GcId, _heap: &str, _heap_id: u32) -> NoSpan {
        NoSpan
    }

    pub fn trace_phase(_phase: Phase) -> NoSpan {
        NoSpan
    }

    pub fn log_phase_start(_phase: Phase, _bytes_before: usize) {}

    pub fn log_phase_end(_phase: Phase, _objects: usize) {}

    pub fn log_collection_skipped(_heap_id: u32, _reason: &'static str) {}

    pub fn log_stop_the_world(_thread: u64, _nesting: u32) {}

    pub fn log_restart_the_world(_thread: u64, _nesting: u32) {}

    pub fn log_checkin_park(_thread: u64) {}

    pub fn log_pause_unacknowledged(_threads: &[u64]) {}

    pub fn log_arena_mapped(_heap_id: u32, _user_bytes: usize, _emergency: bool) {}

    pub fn log_heap_created(_heap_id: u32, _name: &str) {}

    pub fn log_heap_deleted(_heap_id: u32) {}

    pub fn log_fatal(_err: &FatalError) {}
}

pub use internal::GcId;
