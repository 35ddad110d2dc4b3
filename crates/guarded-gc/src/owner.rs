//! The lock-free half of the pause protocol.
//!
//! [`OwnerSlot`] says which thread holds the pause and how deeply it is
//! nested; [`ThreadFlags`] is the per-thread word the owner uses to ask a
//! thread to park. Neither waits: spinning, sleeping and waking are up to
//! the [`PauseCoordinator`](crate::PauseCoordinator).
//!
//! Built with `--cfg loom`, both use loom's atomics.

#[cfg(loom)]
use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

/// Owner slot value while no thread holds the pause.
pub const NO_OWNER: u64 = 0;

pub(crate) const GIL: u32 = 1 << 0;
pub(crate) const BLOCKING: u32 = 1 << 1;
pub(crate) const SUSPENDED: u32 = 1 << 2;

/// Which thread holds the pause, and how many times it has entered it.
#[derive(Debug)]
pub struct OwnerSlot {
    owner: CachePadded<AtomicU64>,
    nesting: AtomicU32,
}

impl Default for OwnerSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnerSlot {
    /// A free slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            owner: CachePadded::new(AtomicU64::new(NO_OWNER)),
            nesting: AtomicU32::new(0),
        }
    }

    /// The holder, or [`NO_OWNER`].
    #[must_use]
    pub fn owner(&self) -> u64 {
        self.owner.load(Ordering::SeqCst)
    }

    /// Unreleased entries by the holder.
    #[must_use]
    pub fn nesting(&self) -> u32 {
        self.nesting.load(Ordering::SeqCst)
    }

    /// One more level for `me`, if `me` already holds the slot. Returns the
    /// new depth.
    pub fn reenter(&self, me: u64) -> Option<u32> {
        (self.owner() == me).then(|| self.nesting.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Claims a free slot for `me` at depth one.
    pub fn try_claim(&self, me: u64) -> bool {
        debug_assert_ne!(me, NO_OWNER);
        let claimed = self
            .owner
            .compare_exchange(NO_OWNER, me, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if claimed {
            self.nesting.store(1, Ordering::SeqCst);
        }
        claimed
    }

    /// Drops one level held by `me` and returns the remaining depth.
    ///
    /// # Errors
    ///
    /// The actual holder, when `me` does not hold the slot.
    pub fn leave(&self, me: u64) -> Result<u32, u64> {
        let owner = self.owner();
        if owner != me {
            return Err(owner);
        }
        Ok(self.nesting.fetch_sub(1, Ordering::SeqCst) - 1)
    }

    /// Frees the slot once `me` has left its last level.
    ///
    /// # Errors
    ///
    /// The actual holder, when `me` does not hold the slot.
    pub fn vacate(&self, me: u64) -> Result<(), u64> {
        self.owner
            .compare_exchange(me, NO_OWNER, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
    }
}

/// Per-thread flags word: `GIL` (asked to park), `BLOCKING` (parked) and
/// `SUSPENDED` (inside a suspend bracket or contending for the slot).
#[derive(Debug, Default)]
pub struct ThreadFlags(AtomicU32);

impl ThreadFlags {
    /// No bits set.
    #[must_use]
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Current bits.
    #[must_use]
    pub fn bits(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    /// Asks the thread to park at its next checkin.
    pub fn request_park(&self) {
        self.0.fetch_or(GIL, Ordering::SeqCst);
    }

    /// Whether a park has been requested and not yet released.
    #[must_use]
    pub fn park_requested(&self) -> bool {
        self.bits() & GIL != 0
    }

    /// Lifts a park request, letting a parked thread go.
    pub fn release(&self) {
        self.0.fetch_and(!(GIL | BLOCKING), Ordering::SeqCst);
    }

    /// Whether the thread has promised not to touch the heap.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.bits() & (BLOCKING | SUSPENDED) != 0
    }

    /// Marks the thread parked.
    pub fn set_blocking(&self) {
        self.0.fetch_or(BLOCKING, Ordering::SeqCst);
    }

    /// Clears the parked mark.
    pub fn clear_blocking(&self) {
        self.0.fetch_and(!BLOCKING, Ordering::SeqCst);
    }

    /// Marks the thread suspended.
    pub fn set_suspended(&self) {
        self.0.fetch_or(SUSPENDED, Ordering::SeqCst);
    }

    /// Clears the suspended mark.
    pub fn clear_suspended(&self) {
        self.0.fetch_and(!SUSPENDED, Ordering::SeqCst);
    }

    /// Drops every bit, once the thread itself owns the pause.
    pub fn clear_for_owner(&self) {
        self.0.fetch_and(!(SUSPENDED | GIL | BLOCKING), Ordering::SeqCst);
    }
}
