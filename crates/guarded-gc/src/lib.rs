//! An arena allocator with a guarded, semi-conservative copying collector.
//!
//! `guarded-gc` hands out raw, zeroed memory from bump-allocated arenas and
//! reclaims it by copying whatever is still reachable into a fresh arena and
//! unmapping the old ones. Pointers are found by scanning words: a word is
//! treated as a pointer only if it lands inside an arena and walking back
//! from it reaches a header carrying the runtime's random guard word.
//!
//! # Features
//!
//! - **Guard-paged arenas**: every arena sits between two inaccessible pages,
//!   with a read-only accounting page in front
//! - **Copying collection**: survivors are compacted into to-space and every
//!   reference to them, interior pointers included, is rewritten
//! - **Scan descriptors**: allocations can limit which words are scanned
//!   (`All`, `None`, a pointer prefix, or a per-type bitmap from
//!   `#[derive(Scan)]`)
//! - **Stop-the-world coordination**: threads check in at safe points and
//!   park while another thread collects
//! - **Scratch allocation**: memory for the duration of a pause, never
//!   collected, released when the pause ends
//!
//! # Quick Start
//!
//! ```
//! use guarded_gc::{GcConfig, Runtime, ScanDescriptor};
//!
//! let rt = Runtime::new(GcConfig::default()).unwrap();
//! let heap = rt.default_heap();
//!
//! // Two words, both scanned.
//! let node = heap.alloc(16, ScanDescriptor::All, false);
//! let mut root = node.as_ptr() as usize;
//! unsafe { heap.register_root(&raw mut root, 1) };
//!
//! let metrics = heap.collect().unwrap();
//! assert!(metrics.objects_copied >= 1);
//! assert!(rt.is_live_pointer(root));
//! ```
//!
//! # Threads
//!
//! Every thread that touches a heap is registered with the runtime's
//! [`PauseCoordinator`] on first use. A registered thread must reach a safe
//! point ([`Runtime::checkin`], or any allocation) regularly, and must wrap
//! blocking calls in [`Runtime::blocking`], or a pause requested by another
//! thread will wait for it.
//!
//! Pointers held only in registers across a collection are not updated;
//! keep them in memory (a root, or a stack slot) instead.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod arena;
mod classify;
mod collector;
mod config;
mod error;
mod header;
mod heap;
mod layout;
mod metrics;
mod owner;
mod pause;
mod roots;
mod runtime;
mod scratch;
mod stack;
mod tracing;
mod worklist;

pub use arena::ArenaInfo;
pub use classify::{AllocationHandle, Classify, GuardedClassifier};
pub use collector::Phase;
pub use config::{ConfigError, GcConfig};
pub use error::FatalError;
pub use header::{
    alloc_len_for, AllocHeader, HashSlot, MapId, ScanDescriptor, FORCED_ALIGNMENT, HEADER_SIZE,
    WORD,
};
pub use heap::{Heap, HeapOptions, HeapStats};
pub use layout::{PointerMap, ScanLayout};
pub use metrics::{global_metrics, CollectionMetrics, GlobalMetrics, PhaseTimer};
pub use owner::{OwnerSlot, ThreadFlags, NO_OWNER};
pub use pause::{current_thread_id, PauseCoordinator, ThreadRecord};
pub use roots::{RootId, RootRegistry};
pub use runtime::{Finalizer, Runtime, DEFAULT_HEAP_ID};
pub use scratch::ScratchPool;
pub use stack::StackBounds;
pub use crate::tracing::GcId;

// Re-export derive macro when feature is enabled
#[cfg(feature = "derive")]
pub use guarded_gc_derive::Scan;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    /// Clear CPU registers to prevent stale pointer values from being
    /// scanned.
    ///
    /// # Safety
    ///
    /// This function clears callee-saved registers (R12-R15 on `x86_64`).
    /// It should only be called when those registers don't contain values
    /// needed by the calling code.
    pub unsafe fn clear_registers() {
        // SAFETY: Caller guarantees that callee-saved registers don't contain
        // values needed by the calling code.
        unsafe { crate::stack::clear_registers() };
    }

    /// Zero a stretch of dead stack below the caller.
    pub fn scrub_stack() {
        crate::stack::scrub_stack();
    }

    /// Bounds of the calling thread's stack, if the platform reports them.
    #[must_use]
    pub fn current_stack_bounds() -> Option<crate::StackBounds> {
        crate::stack::current_stack_bounds()
    }
}
