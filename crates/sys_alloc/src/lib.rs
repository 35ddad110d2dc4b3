//! Virtual-memory primitives for the arena allocator.
//!
//! Anonymous mappings, page-size queries and page protection changes. Every
//! arena and scratch page set in `guarded-gc` is backed by an [`Mmap`].

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the page size.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Rounds `len` up to a whole number of pages.
#[must_use]
pub fn round_to_pages(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page) * page
}

/// Access rights applied to a page range with [`Mmap::protect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    /// Any access faults. Used for guard pages.
    NoAccess,
    /// Read-only.
    Read,
    /// Read and write. The state of a fresh mapping.
    ReadWrite,
}

/// A handle to a memory mapped region.
///
/// The region is automatically unmapped when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the memory mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the memory mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping is zero-length.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Changes the access rights of `[offset, offset + len)`.
    ///
    /// Both `offset` and `len` must be multiples of [`page_size`] and the range
    /// must lie inside the mapping.
    pub fn protect(&self, offset: usize, len: usize, prot: Protection) -> io::Result<()> {
        let page = page_size();
        if offset % page != 0 || len % page != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "protection range must be page aligned",
            ));
        }
        if offset.checked_add(len).is_none_or(|end| end > self.len()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "protection range exceeds mapping",
            ));
        }
        if len == 0 {
            return Ok(());
        }
        // SAFETY: the range was checked to be page aligned and inside the mapping.
        unsafe { self.inner.protect(offset, len, prot) }
    }
}

impl std::fmt::Debug for Mmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmap")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone, Default)]
pub struct MmapOptions {
    len: usize,
    no_reserve: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0).
    /// You must set a length before mapping.
    pub const fn new() -> Self {
        Self {
            len: 0,
            no_reserve: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets whether to skip reserving swap space (on supported platforms).
    ///
    /// On Linux, this adds `MAP_NORESERVE`.
    #[must_use]
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates an anonymous, zero-filled, read/write memory map.
    ///
    /// # Safety
    ///
    /// The returned mapping owns its memory. Raw pointers derived from
    /// [`Mmap::ptr`] must not be used after the `Mmap` is dropped.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        let inner = unsafe { os::MmapInner::map_anon(self.len, self.no_reserve)? };

        Ok(Mmap { inner })
    }
}
