//! Work lists for the tracer.
//!
//! A FIFO of header pointers stored in page-sized scratch buffers. The first
//! word of each page links to the next page; the rest holds entries. Pages
//! are never returned: they die with the scratch pool at the end of the pause.

use std::ptr::NonNull;

use crate::header::{AllocHeader, WORD};
use crate::scratch::ScratchPool;

/// A queue of allocations awaiting a visit.
pub(crate) struct WorkList<'p> {
    pool: &'p ScratchPool,
    slots: usize,
    read_page: *mut usize,
    read_index: usize,
    write_page: *mut usize,
    write_index: usize,
    len: usize,
}

impl<'p> WorkList<'p> {
    pub(crate) fn new(pool: &'p ScratchPool) -> Self {
        let slots = sys_alloc::page_size() / WORD - 1;
        let page = Self::fresh_page(pool);
        Self {
            pool,
            slots,
            read_page: page,
            read_index: 0,
            write_page: page,
            write_index: 0,
            len: 0,
        }
    }

    fn fresh_page(pool: &ScratchPool) -> *mut usize {
        pool.alloc(sys_alloc::page_size()).as_ptr().cast::<usize>()
    }

    pub(crate) fn enqueue(&mut self, hdr: NonNull<AllocHeader>) {
        if self.write_index == self.slots {
            let page = Self::fresh_page(self.pool);
            // SAFETY: slot 0 of a live page is its link word.
            unsafe { self.write_page.write(page as usize) };
            self.write_page = page;
            self.write_index = 0;
        }
        // SAFETY: `write_index < slots`, so the entry lies inside the page.
        unsafe {
            self.write_page
                .add(1 + self.write_index)
                .write(hdr.as_ptr() as usize);
        }
        self.write_index += 1;
        self.len += 1;
    }

    pub(crate) fn dequeue(&mut self) -> Option<NonNull<AllocHeader>> {
        if self.len == 0 {
            return None;
        }
        if self.read_index == self.slots {
            // SAFETY: the writer linked a successor before filling past this
            // page, and `len > 0` means it did.
            let next = unsafe { self.read_page.read() } as *mut usize;
            if next.is_null() {
                return None;
            }
            self.read_page = next;
            self.read_index = 0;
        }
        // SAFETY: entries before `write_index` on the write page, and every
        // entry of earlier pages, were written by `enqueue`.
        let entry = unsafe { self.read_page.add(1 + self.read_index).read() };
        self.read_index += 1;
        self.len -= 1;
        NonNull::new(entry as *mut AllocHeader)
    }

    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for WorkList<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkList")
            .field("len", &self.len)
            .field("slots", &self.slots)
            .field("read_page", &self.read_page)
            .finish_non_exhaustive()
    }
}
