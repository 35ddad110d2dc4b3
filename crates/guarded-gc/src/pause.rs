//! The stop-the-world pause coordinator.
//!
//! One owner slot plus, per registered thread, a flags word:
//!
//! - `GIL`: set by the owner on every other thread; the thread must park at
//!   its next [`checkin`](PauseCoordinator::checkin).
//! - `BLOCKING`: the thread is parked and will not touch the heap.
//! - `SUSPENDED`: the thread is inside a [`suspend`](PauseCoordinator::suspend)
//!   bracket, or contending for the owner slot, and will not touch the heap.
//!
//! The owner slot and the flags words live in [`crate::owner`] and are only
//! ever touched with sequentially consistent atomics. No lock guarding heap
//! data is held while a thread parks.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};

use crate::config::GcConfig;
use crate::error::{fatal, FatalError};
use crate::owner::{OwnerSlot, ThreadFlags, NO_OWNER};
use crate::scratch::ScratchPool;
use crate::stack::{self, StackBounds};
use crate::tracing::internal::{log_checkin_park, log_restart_the_world, log_stop_the_world};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_COORDINATOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: Cell<u64> = const { Cell::new(NO_OWNER) };
    static STACK_BOUNDS: Cell<Option<Option<StackBounds>>> = const { Cell::new(None) };
    static REGISTRATIONS: RefCell<Vec<Registration>> = const { RefCell::new(Vec::new()) };
}

/// Process-unique id of the calling thread. Never [`NO_OWNER`].
#[must_use]
pub fn current_thread_id() -> u64 {
    THREAD_ID
        .try_with(|id| {
            if id.get() == NO_OWNER {
                id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
            }
            id.get()
        })
        .unwrap_or(u64::MAX)
}

fn current_bounds() -> Option<StackBounds> {
    STACK_BOUNDS
        .try_with(|cached| {
            cached.get().unwrap_or_else(|| {
                let bounds = stack::current_stack_bounds();
                cached.set(Some(bounds));
                bounds
            })
        })
        .ok()
        .flatten()
}

/// A thread known to a coordinator.
#[derive(Debug)]
pub struct ThreadRecord {
    id: u64,
    flags: ThreadFlags,
    bounds: Option<StackBounds>,
    stack_top: AtomicUsize,
}

impl ThreadRecord {
    fn new(id: u64, bounds: Option<StackBounds>) -> Self {
        Self {
            id,
            flags: ThreadFlags::new(),
            bounds,
            stack_top: AtomicUsize::new(0),
        }
    }

    /// The thread's id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Stack bounds recorded at registration.
    #[must_use]
    pub const fn bounds(&self) -> Option<StackBounds> {
        self.bounds
    }

    /// Current flag bits.
    #[must_use]
    pub fn flags(&self) -> u32 {
        self.flags.bits()
    }

    /// Whether the thread has promised not to touch the heap.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.flags.is_quiescent()
    }

    pub(crate) fn record_stack_top(&self, sp: usize) {
        self.stack_top.store(sp, Ordering::SeqCst);
    }

    /// The live part of the stack as of the thread's last park, suspend or
    /// collection, as `(low, high)`.
    #[must_use]
    pub fn live_stack(&self) -> Option<(usize, usize)> {
        let bounds = self.bounds?;
        let top = self.stack_top.load(Ordering::SeqCst);
        (top > bounds.limit && top < bounds.base).then_some((top, bounds.base))
    }
}

struct Registration {
    coordinator_id: u64,
    coordinator: Weak<PauseCoordinator>,
    record: Arc<ThreadRecord>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.deregister(&self.record);
        }
    }
}

/// Cooperative stop-the-world protocol.
///
/// The process normally uses one coordinator ([`PauseCoordinator::global`]);
/// independent coordinators can be created for isolated runtimes.
pub struct PauseCoordinator {
    id: u64,
    slot: OwnerSlot,
    threads: Mutex<Vec<Arc<ThreadRecord>>>,
    release_lock: Mutex<()>,
    released: Condvar,
    scratch: ScratchPool,
    checkin_wait: Duration,
}

impl PauseCoordinator {
    /// A coordinator with no registered threads.
    #[must_use]
    pub fn new(config: &GcConfig) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_COORDINATOR_ID.fetch_add(1, Ordering::Relaxed),
            slot: OwnerSlot::new(),
            threads: Mutex::new(Vec::new()),
            release_lock: Mutex::new(()),
            released: Condvar::new(),
            scratch: ScratchPool::new(config.scratch_pageset_bytes),
            checkin_wait: config.checkin_wait,
        })
    }

    /// The process-wide coordinator.
    #[must_use]
    pub fn global() -> &'static Arc<Self> {
        static GLOBAL: LazyLock<Arc<PauseCoordinator>> =
            LazyLock::new(|| PauseCoordinator::new(&GcConfig::default()));
        &GLOBAL
    }

    /// The calling thread's record, if it is registered here.
    #[must_use]
    pub fn current(&self) -> Option<Arc<ThreadRecord>> {
        REGISTRATIONS
            .try_with(|regs| {
                regs.borrow()
                    .iter()
                    .find(|r| r.coordinator_id == self.id)
                    .map(|r| Arc::clone(&r.record))
            })
            .ok()
            .flatten()
    }

    /// Registers the calling thread, recording its stack bounds. Idempotent.
    ///
    /// The registration ends when the thread exits. A thread registering
    /// while a pause is active waits for the pause to end.
    pub fn register_current_thread(self: &Arc<Self>) -> Arc<ThreadRecord> {
        if let Some(record) = self.current() {
            return record;
        }

        let id = current_thread_id();
        let record = Arc::new(ThreadRecord::new(id, current_bounds()));
        self.threads.lock().push(Arc::clone(&record));
        let registration = Registration {
            coordinator_id: self.id,
            coordinator: Arc::downgrade(self),
            record: Arc::clone(&record),
        };
        // Only fails during thread teardown, when the registration's own
        // drop removes the record again.
        let _ = REGISTRATIONS.try_with(|regs| regs.borrow_mut().push(registration));

        let owner = self.slot.owner();
        if owner != NO_OWNER && owner != id {
            self.wait_while_owned(&record);
        }
        record
    }

    fn deregister(&self, record: &ThreadRecord) {
        self.park_if_requested(record);
        record.flags.set_suspended();
        self.threads.lock().retain(|t| t.id != record.id);
    }

    /// Snapshot of every registered thread.
    #[must_use]
    pub fn threads(&self) -> Vec<Arc<ThreadRecord>> {
        self.threads.lock().clone()
    }

    /// Id of the thread holding the pause, or [`NO_OWNER`].
    #[must_use]
    pub fn owner(&self) -> u64 {
        self.slot.owner()
    }

    /// Whether any thread holds the pause.
    #[must_use]
    pub fn is_world_stopped(&self) -> bool {
        self.owner() != NO_OWNER
    }

    /// Whether the calling thread holds the pause.
    #[must_use]
    pub fn owned_by_current_thread(&self) -> bool {
        self.owner() == current_thread_id()
    }

    /// How many unreleased `stop_the_world` calls the owner has made.
    #[must_use]
    pub fn nesting(&self) -> u32 {
        self.slot.nesting()
    }

    /// The scratch allocator, valid for use while the caller holds the pause.
    #[must_use]
    pub const fn scratch(&self) -> &ScratchPool {
        &self.scratch
    }

    /// Pauses every other registered thread.
    ///
    /// Returns once the calling thread owns the pause and every other
    /// registered thread has been asked to park. It does not wait for them
    /// to do so: a thread cannot get past its next checkin while the pause
    /// lasts. Use [`await_acknowledgement`](Self::await_acknowledgement) to
    /// wait for threads to actually park. Nested calls by the owner only
    /// bump the nesting count.
    pub fn stop_the_world(self: &Arc<Self>) {
        let me = self.register_current_thread();

        if let Some(nesting) = self.slot.reenter(me.id) {
            log_stop_the_world(me.id, nesting);
            return;
        }

        stack::with_spilled_registers(|sp| {
            me.record_stack_top(sp);
            me.flags.set_suspended();
            let backoff = Backoff::new();
            while !self.slot.try_claim(me.id) {
                if backoff.is_completed() {
                    self.wait_for_release(|| self.slot.owner() != NO_OWNER);
                } else {
                    backoff.snooze();
                }
            }
            me.flags.clear_for_owner();
        });

        for thread in self.threads.lock().iter() {
            if thread.id != me.id {
                thread.flags.request_park();
            }
        }
        log_stop_the_world(me.id, 1);
    }

    /// Waits at most `timeout` for every other registered thread to be
    /// parked or suspended.
    ///
    /// Returns the ids of threads that still had not acknowledged the pause
    /// when the time ran out; empty means the world is quiescent. A thread
    /// stuck in a call outside a [`blocking`](Self::blocking) bracket shows
    /// up here instead of holding the caller forever.
    pub fn await_acknowledgement(&self, timeout: Duration) -> Vec<u64> {
        let me = current_thread_id();
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        loop {
            let pending: Vec<u64> = self
                .threads
                .lock()
                .iter()
                .filter(|t| t.id != me && !t.is_quiescent())
                .map(|t| t.id)
                .collect();
            if pending.is_empty() || Instant::now() >= deadline {
                return pending;
            }
            if backoff.is_completed() {
                std::thread::sleep(self.checkin_wait);
            } else {
                backoff.snooze();
            }
        }
    }

    /// Releases one level of the pause. At the outermost level, every other
    /// thread is released, the scratch pool is abandoned and parked threads
    /// are woken.
    ///
    /// Aborts the process if the caller does not own the pause.
    pub fn restart_the_world(&self) {
        let me = current_thread_id();
        let remaining = match self.slot.leave(me) {
            Ok(remaining) => remaining,
            Err(owner) => fatal(FatalError::OwnershipViolation { owner, caller: me }),
        };
        log_restart_the_world(me, remaining);
        if remaining > 0 {
            return;
        }

        for thread in self.threads.lock().iter() {
            if thread.id != me {
                thread.flags.release();
            }
        }
        self.scratch.abandon();

        if let Err(owner) = self.slot.vacate(me) {
            fatal(FatalError::OwnershipViolation { owner, caller: me });
        }

        let _guard = self.release_lock.lock();
        self.released.notify_all();
    }

    /// A safe point. Parks the calling thread if a pause has been requested.
    pub fn checkin(&self) {
        if let Some(me) = self.current() {
            self.park_if_requested(&me);
        }
    }

    fn park_if_requested(&self, me: &ThreadRecord) {
        if !me.flags.park_requested() {
            return;
        }
        if self.slot.owner() == me.id {
            return;
        }
        log_checkin_park(me.id);

        stack::with_spilled_registers(|sp| {
            me.record_stack_top(sp);
            me.flags.set_blocking();
            while me.flags.park_requested() {
                self.wait_for_release(|| me.flags.park_requested());
                // A new pause may have started after the last one cleared
                // our bits.
                if me.flags.park_requested() {
                    me.flags.set_blocking();
                }
            }
            me.flags.clear_blocking();
        });
    }

    fn wait_while_owned(&self, me: &ThreadRecord) {
        stack::with_spilled_registers(|sp| {
            me.record_stack_top(sp);
            me.flags.set_blocking();
            loop {
                let owner = self.slot.owner();
                if owner == NO_OWNER || owner == me.id {
                    break;
                }
                self.wait_for_release(|| self.slot.owner() == owner);
                me.flags.set_blocking();
            }
            me.flags.clear_blocking();
        });
        self.park_if_requested(me);
    }

    fn wait_for_release(&self, still_waiting: impl Fn() -> bool) {
        let mut guard = self.release_lock.lock();
        if still_waiting() {
            self.released.wait_for(&mut guard, self.checkin_wait);
        }
    }

    /// Marks the calling thread as not touching the heap until
    /// [`resume`](Self::resume).
    ///
    /// Prefer [`blocking`](Self::blocking), which also keeps callee-saved
    /// registers visible to the collector for the duration.
    #[inline(always)]
    pub fn suspend(&self) {
        let marker = 0usize;
        self.suspend_at(std::ptr::addr_of!(marker) as usize);
    }

    fn suspend_at(&self, sp: usize) {
        let Some(me) = self.current() else {
            return;
        };
        if self.slot.owner() == me.id {
            return;
        }
        me.record_stack_top(sp);
        me.flags.set_suspended();
    }

    /// Ends a [`suspend`](Self::suspend) bracket and honors any pause
    /// requested meanwhile.
    pub fn resume(&self) {
        if let Some(me) = self.current() {
            me.flags.clear_suspended();
        }
        self.checkin();
    }

    /// Runs `f` inside a suspend bracket.
    ///
    /// `f` must not touch any collected heap.
    pub fn blocking<R>(&self, f: impl FnOnce() -> R) -> R {
        stack::with_spilled_registers(|sp| {
            self.suspend_at(sp);
            let result = f();
            self.resume();
            result
        })
    }
}

impl std::fmt::Debug for PauseCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PauseCoordinator")
            .field("id", &self.id)
            .field("owner", &self.owner())
            .field("nesting", &self.nesting())
            .field("threads", &self.threads.lock().len())
            .finish_non_exhaustive()
    }
}
