//! Fatal conditions.
//!
//! Heap integrity cannot be trusted after any of these, so they are reported
//! and the process aborts. Nothing here is returned to callers.

use std::fmt;
use std::io;

/// An unrecoverable allocator or collector failure.
#[derive(Debug)]
pub enum FatalError {
    /// The OS refused a mapping.
    MapFailed {
        /// Bytes requested, including guard and accounting pages.
        bytes: usize,
        /// The OS error.
        source: io::Error,
    },
    /// A guard or accounting page could not be protected.
    ProtectFailed {
        /// Start of the page range.
        addr: usize,
        /// The OS error.
        source: io::Error,
    },
    /// A pause was released by a thread that does not own it.
    OwnershipViolation {
        /// Thread id recorded in the owner slot.
        owner: u64,
        /// Thread id of the caller.
        caller: u64,
    },
    /// The word before an allocation's data was not the guard.
    CorruptGuard {
        /// Address the header was expected at.
        addr: usize,
        /// The word found there.
        found: u64,
    },
    /// A request too large for an allocation header.
    AllocationTooLarge {
        /// Requested data bytes.
        requested: usize,
    },
    /// A type whose alignment exceeds the forced allocation alignment.
    UnsupportedAlignment {
        /// The type's alignment.
        align: usize,
    },
    /// A pointer that is not inside any heap's arenas.
    NotAnAllocation {
        /// The pointer.
        addr: usize,
    },
    /// An operation on a heap that was already deleted.
    HeapDeleted {
        /// The heap's id.
        id: u32,
    },
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MapFailed { bytes, source } => {
                write!(f, "could not map {bytes} bytes: {source}")
            }
            Self::ProtectFailed { addr, source } => {
                write!(f, "could not protect pages at {addr:#x}: {source}")
            }
            Self::OwnershipViolation { owner, caller } => write!(
                f,
                "thread {caller} released a pause owned by thread {owner}"
            ),
            Self::CorruptGuard { addr, found } => write!(
                f,
                "corrupt allocation guard at {addr:#x} (found {found:#018x})"
            ),
            Self::AllocationTooLarge { requested } => {
                write!(f, "allocation of {requested} bytes exceeds the header limit")
            }
            Self::UnsupportedAlignment { align } => {
                write!(f, "alignment {align} exceeds the forced allocation alignment")
            }
            Self::NotAnAllocation { addr } => {
                write!(f, "{addr:#x} is not inside any heap")
            }
            Self::HeapDeleted { id } => write!(f, "heap {id} was deleted"),
        }
    }
}

impl std::error::Error for FatalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::MapFailed { source, .. } | Self::ProtectFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Reports `err` and aborts the process.
#[cold]
#[inline(never)]
pub fn fatal(err: FatalError) -> ! {
    crate::tracing::internal::log_fatal(&err);
    eprintln!("[guarded-gc] fatal: {err}");
    std::process::abort()
}
