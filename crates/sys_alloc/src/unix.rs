use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Protection;

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            #[allow(clippy::cast_sign_loss)]
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

const fn prot_flags(prot: Protection) -> libc::c_int {
    match prot {
        Protection::NoAccess => libc::PROT_NONE,
        Protection::Read => libc::PROT_READ,
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    }
}

pub struct MmapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MmapInner {
    /// Creates a new anonymous read/write mapping.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap`.
    pub unsafe fn map_anon(len: usize, no_reserve: bool) -> io::Result<Self> {
        let no_reserve = if no_reserve { MAP_NORESERVE } else { 0 };
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | no_reserve;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                prot_flags(Protection::ReadWrite),
                flags,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        Ok(Self { ptr, len })
    }

    /// # Safety
    ///
    /// `[offset, offset + len)` must be page aligned and inside the mapping.
    pub unsafe fn protect(&self, offset: usize, len: usize, prot: Protection) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) };
        let ret = unsafe { libc::mprotect(addr.cast::<libc::c_void>(), len, prot_flags(prot)) };
        if ret == 0 {
            Ok(())
        } else {
            Err(Error::last_os_error())
        }
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
