//! Pointer classification.
//!
//! A scanned word is only treated as a pointer if it falls inside the issued
//! part of an arena the collection can see, and walking back from it in
//! 16-byte steps reaches a header carrying the runtime's guard whose extent
//! covers the word. A guard match whose fields do not form a consistent
//! header is user data, and the walk continues past it. Anything else is
//! data.

use std::ptr::NonNull;

use crate::header::{AllocHeader, FORCED_ALIGNMENT};
use crate::heap::HeapInner;

/// Decides whether a raw word addresses a live allocation.
pub trait Classify {
    /// The allocation `word` points into, or `None` if it is data.
    fn classify(&self, word: usize) -> Option<AllocationHandle>;
}

/// An allocation found by a [`Classify`] implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationHandle {
    header: NonNull<AllocHeader>,
    heap_id: u32,
    collected: bool,
}

impl AllocationHandle {
    /// The allocation's header.
    #[must_use]
    pub const fn header(&self) -> NonNull<AllocHeader> {
        self.header
    }

    /// Start of the allocation's data region.
    #[must_use]
    pub fn data(&self) -> NonNull<u8> {
        // SAFETY: a handle is only built from a header with a matching guard.
        unsafe { NonNull::new_unchecked(self.header.as_ref().data()) }
    }

    /// Id of the heap holding the allocation.
    #[must_use]
    pub const fn heap_id(&self) -> u32 {
        self.heap_id
    }

    /// Whether the allocation belongs to the heap being collected.
    #[must_use]
    pub const fn in_collected_heap(&self) -> bool {
        self.collected
    }
}

#[derive(Debug, Clone, Copy)]
struct Range {
    start: usize,
    end: usize,
    heap_id: u32,
    collected: bool,
}

/// Classifies against a snapshot of arena ranges, sorted by address.
#[derive(Debug)]
pub struct GuardedClassifier {
    guard: u64,
    ranges: Vec<Range>,
}

impl GuardedClassifier {
    pub(crate) const fn new(guard: u64) -> Self {
        Self {
            guard,
            ranges: Vec::new(),
        }
    }

    /// Adds the issued part of every arena of `heap`.
    pub(crate) fn add_heap(&mut self, heap: &HeapInner, collected: bool) {
        for arena in heap.arenas.read().iter() {
            let end = arena.next_alloc();
            if end > arena.start() {
                self.ranges.push(Range {
                    start: arena.start(),
                    end,
                    heap_id: heap.id,
                    collected,
                });
            }
        }
    }

    pub(crate) fn seal(mut self) -> Self {
        self.ranges.sort_unstable_by_key(|r| r.start);
        self
    }

    fn range_of(&self, addr: usize) -> Option<&Range> {
        let idx = self.ranges.partition_point(|r| r.start <= addr);
        let range = self.ranges.get(idx.checked_sub(1)?)?;
        (addr < range.end).then_some(range)
    }

    /// Number of arena ranges in the snapshot.
    #[must_use]
    pub fn ranges(&self) -> usize {
        self.ranges.len()
    }
}

impl Classify for GuardedClassifier {
    fn classify(&self, word: usize) -> Option<AllocationHandle> {
        let range = self.range_of(word)?;
        let mut at = word & !(FORCED_ALIGNMENT - 1);
        loop {
            // SAFETY: `range.start <= at < range.end`, which is issued arena
            // memory and stays mapped for the life of the snapshot.
            let found = unsafe { (at as *const u64).read() };
            // SAFETY: the issued range stays readable for the snapshot.
            if found == self.guard
                && unsafe { AllocHeader::is_plausible(at as *const AllocHeader, word, range.end) }
            {
                let header = NonNull::new(at as *mut AllocHeader)?;
                return Some(AllocationHandle {
                    header,
                    heap_id: range.heap_id,
                    collected: range.collected,
                });
            }
            if at <= range.start {
                return None;
            }
            at -= FORCED_ALIGNMENT;
        }
    }
}
