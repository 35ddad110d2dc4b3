use std::io::{self, Error};
use std::mem;
use std::ptr;

use crate::Protection;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system allocation granularity.
///
/// On Windows, `VirtualAlloc` address must be aligned to this value (typically 64KB),
/// which is often larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    #[cfg(miri)]
    {
        65536
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

#[cfg(not(miri))]
const fn page_flags(prot: Protection) -> PAGE_PROTECTION_FLAGS {
    match prot {
        Protection::NoAccess => PAGE_NOACCESS,
        Protection::Read => PAGE_READONLY,
        Protection::ReadWrite => PAGE_READWRITE,
    }
}

pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MmapInner {
    /// Creates a new anonymous read/write mapping.
    pub unsafe fn map_anon(len: usize, _no_reserve: bool) -> io::Result<Self> {
        #[cfg(miri)]
        {
            use std::alloc::{alloc_zeroed, Layout};
            // Miri doesn't support VirtualAlloc.
            let layout = Layout::from_size_align(len, allocation_granularity())
                .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err(Error::from(io::ErrorKind::OutOfMemory));
            }
            Ok(Self {
                ptr: ptr.cast::<std::ffi::c_void>(),
                len,
            })
        }
        #[cfg(not(miri))]
        {
            let ptr = unsafe {
                VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
            };

            if ptr.is_null() {
                return Err(Error::last_os_error());
            }

            Ok(Self { ptr, len })
        }
    }

    /// # Safety
    ///
    /// `[offset, offset + len)` must be page aligned and inside the mapping.
    pub unsafe fn protect(&self, offset: usize, len: usize, prot: Protection) -> io::Result<()> {
        #[cfg(miri)]
        {
            let _ = (offset, len, prot);
            Ok(())
        }
        #[cfg(not(miri))]
        {
            let addr = unsafe { self.ptr.cast::<u8>().add(offset) };
            let mut old: PAGE_PROTECTION_FLAGS = 0;
            let ok = unsafe {
                VirtualProtect(addr.cast::<std::ffi::c_void>(), len, page_flags(prot), &mut old)
            };
            if ok == 0 {
                Err(Error::last_os_error())
            } else {
                Ok(())
            }
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
                #[cfg(miri)]
                {
                    use std::alloc::{dealloc, Layout};
                    if let Ok(layout) = Layout::from_size_align(self.len, allocation_granularity())
                    {
                        dealloc(self.ptr.cast::<u8>(), layout);
                    }
                }
                #[cfg(not(miri))]
                {
                    // MEM_RELEASE requires dwSize to be 0
                    VirtualFree(self.ptr, 0, MEM_RELEASE);
                }
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
