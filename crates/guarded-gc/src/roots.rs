//! Root registration.
//!
//! A root is a `{pointer, word count}` range whose words are scanned as
//! candidate pointers at every collection. The registry is append-only:
//! removing a root zeroes its entry in place and the entry is never handed
//! out again, so a [`RootId`] names the same root for the registry's life.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;

/// Index of a registered root. Stale after removal, but never reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootId(usize);

#[derive(Debug, Default)]
struct RootEntry {
    ptr: AtomicUsize,
    words: AtomicUsize,
    inactive: AtomicBool,
}

/// Growable array of root ranges.
#[derive(Debug, Default)]
pub struct RootRegistry {
    entries: RwLock<Vec<RootEntry>>,
}

impl RootRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the `words`-long range starting at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be word aligned and the range must stay readable and
    /// writable until [`remove`](Self::remove) is called for it. The
    /// collector rewrites words that point at moved allocations.
    pub unsafe fn register(&self, ptr: *mut usize, words: usize) -> RootId {
        let addr = ptr as usize;
        debug_assert_eq!(addr % std::mem::align_of::<usize>(), 0);
        let mut entries = self.entries.write();
        entries.push(RootEntry {
            ptr: AtomicUsize::new(addr),
            words: AtomicUsize::new(words),
            inactive: AtomicBool::new(false),
        });
        RootId(entries.len() - 1)
    }

    /// Zeroes the first entry starting at `ptr`. Returns whether one existed.
    pub fn remove(&self, ptr: *const usize) -> bool {
        let addr = ptr as usize;
        if addr == 0 {
            return false;
        }
        self.entries
            .read()
            .iter()
            .find(|e| e.ptr.load(Ordering::SeqCst) == addr)
            .is_some_and(|e| {
                Self::clear(e);
                true
            })
    }

    /// Zeroes the entry `id`.
    pub fn remove_id(&self, id: RootId) {
        if let Some(entry) = self.entries.read().get(id.0) {
            Self::clear(entry);
        }
    }

    fn clear(entry: &RootEntry) {
        entry.ptr.store(0, Ordering::SeqCst);
        entry.words.store(0, Ordering::SeqCst);
    }

    /// Excludes (or re-includes) a root without removing it.
    pub fn set_active(&self, id: RootId, active: bool) {
        if let Some(entry) = self.entries.read().get(id.0) {
            entry.inactive.store(!active, Ordering::SeqCst);
        }
    }

    /// Calls `f(ptr, words)` for every active, non-removed root.
    pub fn for_each_active(&self, mut f: impl FnMut(*mut usize, usize)) {
        for entry in self.entries.read().iter() {
            if entry.inactive.load(Ordering::SeqCst) {
                continue;
            }
            let ptr = entry.ptr.load(Ordering::SeqCst);
            let words = entry.words.load(Ordering::SeqCst);
            if ptr != 0 && words != 0 {
                f(ptr as *mut usize, words);
            }
        }
    }

    /// Number of active, non-removed roots.
    #[must_use]
    pub fn active_count(&self) -> usize {
        let mut count = 0;
        self.for_each_active(|_, _| count += 1);
        count
    }

    /// Number of entries, removed ones included.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.entries.read().len()
    }
}
