//! Thread stack bounds and register spilling.
//!
//! A parked thread's stack is scanned from the address recorded when it
//! parked up to its base. Parking happens inside [`with_spilled_registers`],
//! so callee-saved registers that held pointers sit in that frame's memory
//! for the duration of the park.

/// Bounds of a thread's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// The base of the stack (highest address, exclusive).
    pub base: usize,
    /// The lowest address the stack may grow to.
    pub limit: usize,
}

/// Retrieve the stack bounds for the current thread.
#[cfg(miri)]
pub fn current_stack_bounds() -> Option<StackBounds> {
    // Miri does not support stack scanning or direct access to the stack bounds.
    None
}

/// Retrieve the stack bounds for the current thread.
#[cfg(all(any(target_os = "linux", target_os = "android"), not(miri)))]
pub fn current_stack_bounds() -> Option<StackBounds> {
    use libc::{
        pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
        pthread_self,
    };

    unsafe {
        let mut attr: pthread_attr_t = std::mem::zeroed();
        if pthread_getattr_np(pthread_self(), &raw mut attr) != 0 {
            return None;
        }

        let mut stackaddr: *mut libc::c_void = std::ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let ret = pthread_attr_getstack(&raw const attr, &raw mut stackaddr, &raw mut stacksize);
        pthread_attr_destroy(&raw mut attr);
        if ret != 0 {
            return None;
        }

        Some(StackBounds {
            base: stackaddr as usize + stacksize,
            limit: stackaddr as usize,
        })
    }
}

/// Retrieve the stack bounds for the current thread.
#[cfg(all(target_vendor = "apple", not(miri)))]
pub fn current_stack_bounds() -> Option<StackBounds> {
    unsafe {
        let thread = libc::pthread_self();
        let base = libc::pthread_get_stackaddr_np(thread) as usize;
        let size = libc::pthread_get_stacksize_np(thread);
        Some(StackBounds {
            base,
            limit: base - size,
        })
    }
}

/// Retrieve the stack bounds for the current thread.
#[cfg(all(windows, not(miri)))]
pub fn current_stack_bounds() -> Option<StackBounds> {
    use windows_sys::Win32::System::Threading::GetCurrentThreadStackLimits;

    let mut low: usize = 0;
    let mut high: usize = 0;
    unsafe { GetCurrentThreadStackLimits(&mut low, &mut high) };
    Some(StackBounds {
        base: high,
        limit: low,
    })
}

/// Retrieve the stack bounds for the current thread (unsupported platform).
#[cfg(all(
    not(any(target_os = "linux", target_os = "android", target_vendor = "apple", windows)),
    not(miri)
))]
pub fn current_stack_bounds() -> Option<StackBounds> {
    None
}

/// Spill callee-saved registers into this frame, then run `f` with the
/// lowest address that must be scanned.
///
/// Everything from that address up to the stack base, the spilled registers
/// included, stays live while `f` runs.
#[inline(never)]
pub fn with_spilled_registers<R>(f: impl FnOnce(usize) -> R) -> R {
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    let mut regs = [0usize; 6];
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    unsafe {
        std::arch::asm!(
            "mov {0}, rbx",
            "mov {1}, rbp",
            "mov {2}, r12",
            "mov {3}, r13",
            "mov {4}, r14",
            "mov {5}, r15",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            out(reg) regs[4],
            out(reg) regs[5],
        );
    }

    #[cfg(all(target_arch = "aarch64", not(miri)))]
    let mut regs = [0usize; 11];
    #[cfg(all(target_arch = "aarch64", not(miri)))]
    unsafe {
        std::arch::asm!(
            "mov {0}, x19",
            "mov {1}, x20",
            "mov {2}, x21",
            "mov {3}, x22",
            "mov {4}, x23",
            "mov {5}, x24",
            "mov {6}, x25",
            "mov {7}, x26",
            "mov {8}, x27",
            "mov {9}, x28",
            "mov {10}, x29",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            out(reg) regs[4],
            out(reg) regs[5],
            out(reg) regs[6],
            out(reg) regs[7],
            out(reg) regs[8],
            out(reg) regs[9],
            out(reg) regs[10],
        );
    }

    #[cfg(any(not(any(target_arch = "x86_64", target_arch = "aarch64")), miri))]
    let regs = [0usize; 32];

    let regs = std::hint::black_box(&regs);
    let sp = regs.as_ptr() as usize;
    let result = f(sp);
    std::hint::black_box(regs);
    result
}

/// Calls `visit` with every word-aligned slot in `[low, high)`.
///
/// # Safety
///
/// The whole range must be mapped and readable for the duration of the call.
pub unsafe fn for_each_word(low: usize, high: usize, mut visit: impl FnMut(*mut usize)) {
    let mut current = low.next_multiple_of(std::mem::align_of::<usize>());
    while current + std::mem::size_of::<usize>() <= high {
        visit(current as *mut usize);
        current += std::mem::size_of::<usize>();
    }
}

/// Clear CPU registers to prevent stale pointer values from lingering.
///
/// # Safety
///
/// Clobbers callee-saved registers (R12-R15 on `x86_64`); the caller must
/// not rely on them.
#[cfg(any(test, feature = "test-util"))]
#[inline(never)]
pub unsafe fn clear_registers() {
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    unsafe {
        std::arch::asm!(
            "xor r12, r12",
            "xor r13, r13",
            "xor r14, r14",
            "xor r15, r15",
            out("r12") _,
            out("r13") _,
            out("r14") _,
            out("r15") _,
        );
    }
    #[cfg(any(not(target_arch = "x86_64"), miri))]
    std::hint::black_box(());
}

/// Overwrite a stretch of dead stack below the caller with zeros.
#[cfg(any(test, feature = "test-util"))]
#[inline(never)]
pub fn scrub_stack() {
    let buf = [0usize; 2048];
    std::hint::black_box(&buf);
}
