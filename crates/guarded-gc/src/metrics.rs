//! Collection metrics and statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::collector::Phase;

/// Statistics from one collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionMetrics {
    /// Id of the heap that was collected.
    pub heap_id: u32,
    /// Wall time from SETUP to the end of FINALIZE.
    pub duration: Duration,
    /// Duration of SETUP.
    pub setup_duration: Duration,
    /// Duration of TRACE_TYPES.
    pub trace_types_duration: Duration,
    /// Duration of TRACE_ROOTS.
    pub trace_roots_duration: Duration,
    /// Duration of TRACE_STACKS.
    pub trace_stacks_duration: Duration,
    /// Duration of FINALIZE.
    pub finalize_duration: Duration,
    /// Bytes issued in the from-space before the cycle.
    pub bytes_before: usize,
    /// Bytes issued in the to-space after the cycle.
    pub bytes_after: usize,
    /// Size of the to-space arena.
    pub to_space_bytes: usize,
    /// Objects copied into to-space.
    pub objects_copied: usize,
    /// Objects outside the collected heap that were traced.
    pub cross_heap_traced: usize,
    /// Finalizers run for unreached objects.
    pub finalized: usize,
    /// Whether the heap was flagged to expand on its next growth.
    pub expand_next: bool,
}

impl Default for CollectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectionMetrics {
    /// Metrics with every field zeroed.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heap_id: 0,
            duration: Duration::ZERO,
            setup_duration: Duration::ZERO,
            trace_types_duration: Duration::ZERO,
            trace_roots_duration: Duration::ZERO,
            trace_stacks_duration: Duration::ZERO,
            finalize_duration: Duration::ZERO,
            bytes_before: 0,
            bytes_after: 0,
            to_space_bytes: 0,
            objects_copied: 0,
            cross_heap_traced: 0,
            finalized: 0,
            expand_next: false,
        }
    }

    /// Bytes no longer in use after the cycle.
    #[must_use]
    pub const fn bytes_reclaimed(&self) -> usize {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Times collection phases.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    durations: [Duration; 5],
    current: Option<(Phase, Instant)>,
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTimer {
    /// A timer with nothing recorded.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            durations: [Duration::ZERO; 5],
            current: None,
        }
    }

    /// Starts timing `phase`, ending whatever phase was running.
    pub fn start(&mut self, phase: Phase) {
        self.end();
        self.current = Some((phase, Instant::now()));
    }

    /// Ends the running phase, if any.
    pub fn end(&mut self) {
        if let Some((phase, start)) = self.current.take() {
            if let Some(slot) = phase.timer_index().and_then(|i| self.durations.get_mut(i)) {
                *slot += start.elapsed();
            }
        }
    }

    /// Time recorded for `phase`.
    #[must_use]
    pub fn duration(&self, phase: Phase) -> Duration {
        phase
            .timer_index()
            .and_then(|i| self.durations.get(i).copied())
            .unwrap_or_default()
    }

    /// Copies the recorded phase durations into `metrics`.
    pub fn fill(&self, metrics: &mut CollectionMetrics) {
        metrics.setup_duration = self.duration(Phase::Setup);
        metrics.trace_types_duration = self.duration(Phase::TraceTypes);
        metrics.trace_roots_duration = self.duration(Phase::TraceRoots);
        metrics.trace_stacks_duration = self.duration(Phase::TraceStacks);
        metrics.finalize_duration = self.duration(Phase::Finalize);
    }
}

/// Process-level cumulative collection statistics.
///
/// # Example
///
/// ```
/// let metrics = guarded_gc::global_metrics();
/// println!("collections: {}", metrics.collections());
/// ```
#[derive(Debug)]
pub struct GlobalMetrics {
    collections: AtomicUsize,
    bytes_reclaimed: AtomicUsize,
    objects_copied: AtomicUsize,
    finalized: AtomicUsize,
    pause_ns: AtomicU64,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMetrics {
    /// Counters initialized to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            bytes_reclaimed: AtomicUsize::new(0),
            objects_copied: AtomicUsize::new(0),
            finalized: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
        }
    }

    /// Collections completed since process start.
    #[must_use]
    pub fn collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Bytes released by unmapping from-space arenas, net of survivors.
    #[must_use]
    pub fn bytes_reclaimed(&self) -> usize {
        self.bytes_reclaimed.load(Ordering::Relaxed)
    }

    /// Objects copied into to-space across all collections.
    #[must_use]
    pub fn objects_copied(&self) -> usize {
        self.objects_copied.load(Ordering::Relaxed)
    }

    /// Finalizers run across all collections.
    #[must_use]
    pub fn finalized(&self) -> usize {
        self.finalized.load(Ordering::Relaxed)
    }

    /// Total time spent inside collection cycles.
    #[must_use]
    pub fn total_pause_time(&self) -> Duration {
        Duration::from_nanos(self.pause_ns.load(Ordering::Relaxed))
    }

    pub(crate) fn record(&self, metrics: &CollectionMetrics) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        self.bytes_reclaimed
            .fetch_add(metrics.bytes_reclaimed(), Ordering::Relaxed);
        self.objects_copied
            .fetch_add(metrics.objects_copied, Ordering::Relaxed);
        self.finalized.fetch_add(metrics.finalized, Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation)]
        self.pause_ns
            .fetch_add(metrics.duration.as_nanos() as u64, Ordering::Relaxed);
    }
}

static GLOBAL_METRICS: GlobalMetrics = GlobalMetrics::new();

/// Cumulative statistics for every runtime in the process.
#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}
