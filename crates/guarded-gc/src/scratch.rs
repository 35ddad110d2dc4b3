//! The scratch allocator.
//!
//! A pool of mapped page sets that is never collected and never scanned.
//! Collector bookkeeping and allocations made while the world is stopped come
//! from here. Nothing is freed individually: the pool is abandoned wholesale
//! when the outermost pause ends.

use std::ptr::NonNull;

use parking_lot::Mutex;
use sys_alloc::{Mmap, MmapOptions};

use crate::error::{fatal, FatalError};
use crate::header::FORCED_ALIGNMENT;

#[derive(Default)]
struct PageSets {
    sets: Vec<Mmap>,
    next_alloc: usize,
    end: usize,
}

/// Bump allocator over page sets of at least `min_pageset_bytes`.
pub struct ScratchPool {
    min_pageset_bytes: usize,
    inner: Mutex<PageSets>,
}

impl ScratchPool {
    /// An empty pool. Nothing is mapped until the first allocation.
    #[must_use]
    pub fn new(min_pageset_bytes: usize) -> Self {
        Self {
            min_pageset_bytes,
            inner: Mutex::new(PageSets::default()),
        }
    }

    /// Returns `len` zeroed bytes aligned to 16.
    ///
    /// The memory stays valid until the next [`abandon`](Self::abandon).
    /// Aborts the process if a new page set cannot be mapped.
    pub fn alloc(&self, len: usize) -> NonNull<u8> {
        let len = len.max(1).next_multiple_of(FORCED_ALIGNMENT);
        let mut inner = self.inner.lock();

        if inner.end - inner.next_alloc < len {
            let bytes = sys_alloc::round_to_pages(len.max(self.min_pageset_bytes));
            // SAFETY: the mapping is kept in `sets` until `abandon`, which is
            // the documented end of validity for everything handed out.
            let map = match unsafe { MmapOptions::new().len(bytes).map_anon() } {
                Ok(map) => map,
                Err(source) => fatal(FatalError::MapFailed { bytes, source }),
            };
            inner.next_alloc = map.ptr() as usize;
            inner.end = inner.next_alloc + bytes;
            inner.sets.push(map);
        }

        let at = inner.next_alloc;
        inner.next_alloc += len;
        // SAFETY: `at` lies inside a live mapping, which is never null.
        unsafe { NonNull::new_unchecked(at as *mut u8) }
    }

    /// Unmaps every page set.
    pub fn abandon(&self) {
        let sets = {
            let mut inner = self.inner.lock();
            inner.next_alloc = 0;
            inner.end = 0;
            std::mem::take(&mut inner.sets)
        };
        drop(sets);
    }

    /// Bytes currently mapped.
    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        self.inner.lock().sets.iter().map(Mmap::len).sum()
    }

    /// Whether `addr` lies in a page set of this pool.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.inner.lock().sets.iter().any(|set| {
            let start = set.ptr() as usize;
            addr >= start && addr < start + set.len()
        })
    }
}

impl std::fmt::Debug for ScratchPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchPool")
            .field("min_pageset_bytes", &self.min_pageset_bytes)
            .field("mapped_bytes", &self.mapped_bytes())
            .finish()
    }
}
