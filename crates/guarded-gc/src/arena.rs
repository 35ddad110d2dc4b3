//! Guard-paged arenas.
//!
//! ```text
//! | accounting page | guard page | user data ........ | guard page |
//!                                ^start               ^end
//! ```
//!
//! The accounting page records which heap owns the arena and is read-only
//! once written. Both guard pages are inaccessible. Allocation is a bump of
//! `next_alloc` under the arena's own lock.

use std::ptr::NonNull;

use parking_lot::Mutex;
use sys_alloc::{Mmap, MmapOptions, Protection};

use crate::error::{fatal, FatalError};
use crate::header::{AllocHeader, FORCED_ALIGNMENT};

/// Written to the accounting page of every arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ArenaInfo {
    /// Id of the owning heap.
    pub heap_id: u32,
    /// Whether the arena was appended without a collection.
    pub emergency: bool,
    /// First user byte.
    pub start: usize,
    /// One past the last user byte.
    pub end: usize,
}

/// One contiguous mapping backing allocations of a single heap.
pub struct Arena {
    map: Mmap,
    start: usize,
    end: usize,
    next_alloc: Mutex<usize>,
}

impl Arena {
    /// Maps an arena with at least `user_bytes` of allocatable space.
    ///
    /// Aborts the process if the mapping or its protection fails.
    pub(crate) fn map(user_bytes: usize, heap_id: u32, emergency: bool) -> Self {
        let page = sys_alloc::page_size();
        let user = sys_alloc::round_to_pages(user_bytes.max(1));
        let total = user + 3 * page;

        // SAFETY: the mapping is owned by the returned arena and every
        // pointer handed out from it is bounded by that arena's lifetime.
        let map = match unsafe { MmapOptions::new().len(total).no_reserve(true).map_anon() } {
            Ok(map) => map,
            Err(source) => fatal(FatalError::MapFailed {
                bytes: total,
                source,
            }),
        };

        let base = map.ptr() as usize;
        let start = base + 2 * page;
        let end = start + user;
        let info = ArenaInfo {
            heap_id,
            emergency,
            start,
            end,
        };
        // SAFETY: the accounting page is the first page of a fresh RW mapping.
        unsafe { map.ptr().cast::<ArenaInfo>().write(info) };

        for (offset, prot) in [
            (0, Protection::Read),
            (page, Protection::NoAccess),
            (2 * page + user, Protection::NoAccess),
        ] {
            if let Err(source) = map.protect(offset, page, prot) {
                fatal(FatalError::ProtectFailed {
                    addr: base + offset,
                    source,
                });
            }
        }

        crate::tracing::internal::log_arena_mapped(heap_id, user, emergency);

        Self {
            map,
            start,
            end,
            next_alloc: Mutex::new(start),
        }
    }

    /// What the accounting page says about this arena.
    #[must_use]
    pub fn info(&self) -> ArenaInfo {
        // SAFETY: the accounting page stays mapped read-only for the arena's
        // lifetime and was initialized in `map`.
        unsafe { self.map.ptr().cast::<ArenaInfo>().read() }
    }

    /// First user byte.
    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// User bytes in the arena.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.end - self.start
    }

    /// Bytes mapped for the arena, guard and accounting pages included.
    #[must_use]
    pub fn mapped_len(&self) -> usize {
        self.map.len()
    }

    /// The bump pointer.
    #[must_use]
    pub fn next_alloc(&self) -> usize {
        *self.next_alloc.lock()
    }

    /// Bytes handed out so far.
    #[must_use]
    pub fn used(&self) -> usize {
        self.next_alloc() - self.start
    }

    /// Bytes still available.
    #[must_use]
    pub fn available(&self) -> usize {
        self.end - self.next_alloc()
    }

    /// Whether `addr` lies in the user region.
    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Reserves `len` bytes, or `None` if the arena cannot fit them.
    pub(crate) fn try_bump(&self, len: usize) -> Option<NonNull<AllocHeader>> {
        debug_assert_eq!(len % FORCED_ALIGNMENT, 0);
        let mut next = self.next_alloc.lock();
        let at = *next;
        let new_next = at.checked_add(len)?;
        if new_next > self.end {
            return None;
        }
        *next = new_next;
        NonNull::new(at as *mut AllocHeader)
    }

    /// Visits every issued allocation, in address order.
    ///
    /// Aborts if a header along the way lacks `guard`.
    pub(crate) fn for_each_header(&self, guard: u64, mut f: impl FnMut(NonNull<AllocHeader>)) {
        let limit = self.next_alloc();
        let mut at = self.start;
        while at < limit {
            // SAFETY: `at` lies in the issued part of the arena, and every
            // issued region starts with a header.
            let found = unsafe { (at as *const u64).read() };
            if found != guard {
                fatal(FatalError::CorruptGuard { addr: at, found });
            }
            let Some(hdr) = NonNull::new(at as *mut AllocHeader) else {
                break;
            };
            // SAFETY: the guard matched, so this is a stamped header.
            let next = unsafe { hdr.as_ref().next_addr() };
            f(hdr);
            at = next;
        }
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .field("next_alloc", &format_args!("{:#x}", self.next_alloc()))
            .finish_non_exhaustive()
    }
}
