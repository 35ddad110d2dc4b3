//! Allocation headers.
//!
//! Every allocation is preceded by an [`AllocHeader`]. The guard word is the
//! only way to find an allocation's start from an interior pointer, so it is
//! checked wherever a header is read from an untrusted address.

use std::mem::{align_of, size_of};
use std::ptr::NonNull;

/// Alignment of every header and every data region.
pub const FORCED_ALIGNMENT: usize = 16;

/// Bytes occupied by a header. Data starts this far past the header.
pub const HEADER_SIZE: usize = size_of::<AllocHeader>();

/// Size of one scanned word.
pub const WORD: usize = size_of::<usize>();

/// Index of a registered [`PointerMap`](crate::PointerMap).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MapId(pub(crate) u32);

impl MapId {
    /// Position in the runtime's map table.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which data words of an allocation may hold pointers.
///
/// Candidate words are still validated one by one; a descriptor only narrows
/// which words are looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(C, u32)]
pub enum ScanDescriptor {
    /// Every data word is a candidate.
    #[default]
    All,
    /// Nothing is scanned; the object is copied verbatim.
    None,
    /// The first `n` words are candidates, the remainder is raw payload.
    Prefix(u32),
    /// A registered per-type bitmap selects candidate words.
    Map(MapId),
}

impl ScanDescriptor {
    /// Whether any word of an object with this descriptor is scanned.
    #[must_use]
    pub const fn scans_pointers(self) -> bool {
        !matches!(self, Self::None | Self::Prefix(0))
    }
}

/// The header slot shared by the identity hash and, during a collection,
/// the forwarding address.
///
/// A header is only ever `Forwarded` after its object was copied into
/// to-space; by then the old header is garbage apart from this slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C, u64)]
pub enum HashSlot {
    /// No hash has been requested.
    #[default]
    Empty,
    /// A cached identity hash.
    Cached(u64),
    /// The object's new header in to-space.
    Forwarded(NonNull<AllocHeader>),
}

pub(crate) mod flags {
    /// At least one data word is a pointer candidate.
    pub const PTR_SCAN: u8 = 1 << 0;
    /// Listed in the heap's finalizer list.
    pub const FINALIZE: u8 = 1 << 1;
    /// Reached during the current collection.
    pub const TRACED: u8 = 1 << 2;
    /// Copied into to-space.
    pub const MOVED: u8 = 1 << 3;
    /// Allocated through `alloc_typed`.
    pub const OBJECT: u8 = 1 << 4;
    pub const ALL: u8 = PTR_SCAN | FINALIZE | TRACED | MOVED | OBJECT;
}

/// Metadata immediately preceding every allocation.
#[derive(Debug)]
#[repr(C, align(16))]
pub struct AllocHeader {
    guard: u64,
    alloc_len: u32,
    request_len: u32,
    scan: ScanDescriptor,
    flags: u8,
    slot: HashSlot,
}

const _: () = assert!(HEADER_SIZE == 48);
const _: () = assert!(HEADER_SIZE % FORCED_ALIGNMENT == 0);
const _: () = assert!(align_of::<AllocHeader>() == FORCED_ALIGNMENT);

/// Total bytes (header included) consumed by a request of `request` data
/// bytes, or `None` if it does not fit a header.
#[must_use]
pub const fn alloc_len_for(request: usize) -> Option<usize> {
    let Some(raw) = request.checked_add(HEADER_SIZE + FORCED_ALIGNMENT - 1) else {
        return None;
    };
    let len = raw & !(FORCED_ALIGNMENT - 1);
    if len > u32::MAX as usize {
        None
    } else {
        Some(len)
    }
}

impl AllocHeader {
    /// Writes a fresh header at `at`.
    ///
    /// # Safety
    ///
    /// `at` must be 16-byte aligned and valid for writes of `alloc_len` bytes.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) unsafe fn stamp(
        at: *mut Self,
        guard: u64,
        alloc_len: usize,
        request_len: usize,
        scan: ScanDescriptor,
        extra_flags: u8,
    ) {
        debug_assert!(alloc_len <= u32::MAX as usize);
        debug_assert_eq!(at as usize % FORCED_ALIGNMENT, 0);
        let mut flags = extra_flags & (flags::FINALIZE | flags::OBJECT);
        if scan.scans_pointers() {
            flags |= flags::PTR_SCAN;
        }
        unsafe {
            at.write(Self {
                guard,
                alloc_len: alloc_len as u32,
                request_len: request_len as u32,
                scan,
                flags,
                slot: HashSlot::Empty,
            });
        }
    }

    /// Header of the allocation whose data starts at `data`, if the guard
    /// there matches.
    ///
    /// # Safety
    ///
    /// `data - HEADER_SIZE` must be readable.
    pub(crate) unsafe fn from_data(data: *const u8, guard: u64) -> Result<NonNull<Self>, u64> {
        let at = data.wrapping_sub(HEADER_SIZE).cast::<Self>().cast_mut();
        let found = unsafe { at.cast::<u64>().read() };
        if found == guard {
            // SAFETY: `data` is non-null, so neither is a header below it that
            // holds the guard.
            Ok(unsafe { NonNull::new_unchecked(at) })
        } else {
            Err(found)
        }
    }

    /// Whether `at`, a 16-aligned address whose first word is the guard,
    /// holds a consistent header that covers `word` and ends by `limit`.
    ///
    /// Fields are read through raw pointers, so user data that happens to
    /// start with the guard is never viewed as a header.
    ///
    /// # Safety
    ///
    /// `[at, limit)` must be readable.
    pub(crate) unsafe fn is_plausible(at: *const Self, word: usize, limit: usize) -> bool {
        let start = at as usize;
        if start.checked_add(HEADER_SIZE).is_none_or(|end| end > limit) {
            return false;
        }
        let (alloc_len, request_len, scan_tag, flag_bits, slot_tag) = unsafe {
            (
                (&raw const (*at).alloc_len).read() as usize,
                (&raw const (*at).request_len).read() as usize,
                (&raw const (*at).scan).cast::<u32>().read(),
                (&raw const (*at).flags).read(),
                (&raw const (*at).slot).cast::<u64>().read(),
            )
        };
        alloc_len_for(request_len) == Some(alloc_len)
            && scan_tag <= 3
            && flag_bits & !flags::ALL == 0
            && slot_tag <= 2
            && word >= start
            && start
                .checked_add(alloc_len)
                .is_some_and(|end| word < end && end <= limit)
    }

    /// The guard word.
    #[must_use]
    pub const fn guard(&self) -> u64 {
        self.guard
    }

    /// Total bytes, header included.
    #[must_use]
    pub const fn alloc_len(&self) -> usize {
        self.alloc_len as usize
    }

    /// Data bytes originally requested.
    #[must_use]
    pub const fn request_len(&self) -> usize {
        self.request_len as usize
    }

    /// Bytes available in the data region (request rounded up).
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.alloc_len as usize - HEADER_SIZE
    }

    /// Number of whole words in the data region.
    #[must_use]
    pub const fn data_words(&self) -> usize {
        self.capacity() / WORD
    }

    /// The scan descriptor.
    #[must_use]
    pub const fn scan(&self) -> ScanDescriptor {
        self.scan
    }

    /// Start of the data region.
    #[must_use]
    pub fn data(&self) -> *mut u8 {
        std::ptr::from_ref(self).cast::<u8>().cast_mut().wrapping_add(HEADER_SIZE)
    }

    /// Address one past the end of this allocation, where the next header of
    /// the same arena starts.
    #[must_use]
    pub fn next_addr(&self) -> usize {
        std::ptr::from_ref(self) as usize + self.alloc_len as usize
    }

    /// Whether `addr` falls inside this allocation (header included).
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let start = std::ptr::from_ref(self) as usize;
        addr >= start && addr < start + self.alloc_len as usize
    }

    /// Whether any data word is scanned.
    #[must_use]
    pub const fn ptr_scan(&self) -> bool {
        self.flags & flags::PTR_SCAN != 0
    }

    /// Whether a finalizer is registered.
    #[must_use]
    pub const fn wants_finalizer(&self) -> bool {
        self.flags & flags::FINALIZE != 0
    }

    /// Whether the allocation was made through `alloc_typed`.
    #[must_use]
    pub const fn is_object(&self) -> bool {
        self.flags & flags::OBJECT != 0
    }

    /// Whether the current collection has reached this allocation.
    #[must_use]
    pub const fn is_traced(&self) -> bool {
        self.flags & flags::TRACED != 0
    }

    pub(crate) fn set_traced(&mut self) {
        self.flags |= flags::TRACED;
    }

    pub(crate) fn clear_traced(&mut self) {
        self.flags &= !flags::TRACED;
    }

    /// The identity-hash / forwarding slot.
    #[must_use]
    pub const fn slot(&self) -> HashSlot {
        self.slot
    }

    /// Where the object was copied to, if it has moved.
    #[must_use]
    pub const fn forwarding(&self) -> Option<NonNull<Self>> {
        match self.slot {
            HashSlot::Forwarded(to) => Some(to),
            HashSlot::Empty | HashSlot::Cached(_) => None,
        }
    }

    /// The cached identity hash, if one was computed.
    #[must_use]
    pub const fn cached_hash(&self) -> Option<u64> {
        match self.slot {
            HashSlot::Cached(hash) => Some(hash),
            HashSlot::Empty | HashSlot::Forwarded(_) => None,
        }
    }

    pub(crate) fn cache_hash(&mut self, hash: u64) {
        debug_assert!(self.forwarding().is_none());
        self.slot = HashSlot::Cached(hash);
    }

    /// Stamps a copy of this header at `to` and forwards this header there.
    ///
    /// The copy keeps the length, descriptor, finalizer/object flags and any
    /// cached hash. Its data region is left for the scanner to fill.
    ///
    /// # Safety
    ///
    /// `to` must be a 16-byte aligned, writable to-space region of at least
    /// `self.alloc_len()` bytes.
    pub(crate) unsafe fn forward_to(&mut self, to: NonNull<Self>) {
        unsafe {
            to.as_ptr().write(Self {
                guard: self.guard,
                alloc_len: self.alloc_len,
                request_len: self.request_len,
                scan: self.scan,
                flags: self.flags & !(flags::TRACED | flags::MOVED),
                slot: match self.slot {
                    HashSlot::Cached(hash) => HashSlot::Cached(hash),
                    HashSlot::Empty | HashSlot::Forwarded(_) => HashSlot::Empty,
                },
            });
        }
        self.flags |= flags::MOVED;
        self.slot = HashSlot::Forwarded(to);
    }
}

/// Rewrites a pointer into a moved allocation so it addresses the same
/// offset of the copy.
#[must_use]
pub fn rewrite_pointer(word: usize, from: NonNull<AllocHeader>, to: NonNull<AllocHeader>) -> usize {
    to.as_ptr() as usize + (word - from.as_ptr() as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUARD: u64 = 0x5a5a_1234_abcd_0001;

    #[repr(C, align(16))]
    struct Block([u8; 256]);

    fn block() -> Box<Block> {
        Box::new(Block([0; 256]))
    }

    #[test]
    fn alloc_len_rounds_to_alignment() {
        assert_eq!(alloc_len_for(0), Some(HEADER_SIZE));
        assert_eq!(alloc_len_for(1), Some(HEADER_SIZE + 16));
        assert_eq!(alloc_len_for(16), Some(HEADER_SIZE + 16));
        assert_eq!(alloc_len_for(17), Some(HEADER_SIZE + 32));
        assert_eq!(alloc_len_for(usize::MAX), None);
        assert_eq!(alloc_len_for(u32::MAX as usize), None);
    }

    #[test]
    fn descriptor_pointer_scanning() {
        assert!(ScanDescriptor::All.scans_pointers());
        assert!(ScanDescriptor::Prefix(2).scans_pointers());
        assert!(ScanDescriptor::Map(MapId(0)).scans_pointers());
        assert!(!ScanDescriptor::None.scans_pointers());
        assert!(!ScanDescriptor::Prefix(0).scans_pointers());
    }

    #[test]
    fn stamp_and_find_from_data() {
        let mut mem = block();
        let at = mem.0.as_mut_ptr().cast::<AllocHeader>();
        unsafe {
            AllocHeader::stamp(at, GUARD, 96, 40, ScanDescriptor::Prefix(1), flags::FINALIZE);
            let hdr = &*at;
            assert_eq!(hdr.alloc_len(), 96);
            assert_eq!(hdr.request_len(), 40);
            assert_eq!(hdr.capacity(), 48);
            assert_eq!(hdr.data_words(), 6);
            assert!(hdr.ptr_scan());
            assert!(hdr.wants_finalizer());
            assert!(!hdr.is_traced());
            assert_eq!(hdr.next_addr(), at as usize + 96);
            assert_eq!(hdr.data() as usize, at as usize + HEADER_SIZE);

            let found = AllocHeader::from_data(hdr.data(), GUARD).unwrap();
            assert_eq!(found.as_ptr(), at);
            assert_eq!(AllocHeader::from_data(hdr.data(), GUARD ^ 1), Err(GUARD));
        }
    }

    #[test]
    fn no_scan_clears_ptr_scan() {
        let mut mem = block();
        let at = mem.0.as_mut_ptr().cast::<AllocHeader>();
        unsafe {
            AllocHeader::stamp(at, GUARD, 64, 16, ScanDescriptor::None, flags::TRACED);
            assert!(!(*at).ptr_scan());
            // Only finalize/object survive from caller-supplied flags.
            assert!(!(*at).is_traced());
        }
    }

    #[test]
    fn forwarding_replaces_slot_and_keeps_hash() {
        let mut from = block();
        let mut to = block();
        let from_at = from.0.as_mut_ptr().cast::<AllocHeader>();
        let to_at = NonNull::new(to.0.as_mut_ptr().cast::<AllocHeader>()).unwrap();
        unsafe {
            AllocHeader::stamp(from_at, GUARD, 80, 32, ScanDescriptor::All, 0);
            let hdr = &mut *from_at;
            hdr.cache_hash(99);
            hdr.set_traced();
            hdr.forward_to(to_at);

            assert_eq!(hdr.forwarding(), Some(to_at));
            assert_eq!(hdr.cached_hash(), None);

            let copy = to_at.as_ref();
            assert_eq!(copy.guard(), GUARD);
            assert_eq!(copy.alloc_len(), 80);
            assert_eq!(copy.cached_hash(), Some(99));
            assert!(!copy.is_traced());
            assert!(copy.forwarding().is_none());
        }
    }

    #[test]
    fn rewrite_keeps_interior_offset() {
        let mut from = block();
        let mut to = block();
        let f = NonNull::new(from.0.as_mut_ptr().cast::<AllocHeader>()).unwrap();
        let t = NonNull::new(to.0.as_mut_ptr().cast::<AllocHeader>()).unwrap();
        let interior = f.as_ptr() as usize + HEADER_SIZE + 24;
        assert_eq!(
            rewrite_pointer(interior, f, t),
            t.as_ptr() as usize + HEADER_SIZE + 24
        );
    }

    #[test]
    fn plausibility_rejects_inconsistent_headers() {
        let mut mem = block();
        let at = mem.0.as_mut_ptr().cast::<AllocHeader>();
        let base = at as usize;
        unsafe {
            AllocHeader::stamp(at, GUARD, 64, 16, ScanDescriptor::All, 0);
            assert!(AllocHeader::is_plausible(at, base + 63, base + 256));
            // Not covered, or running past the issued limit.
            assert!(!AllocHeader::is_plausible(at, base + 64, base + 256));
            assert!(!AllocHeader::is_plausible(at, base, base + 48));

            // A guard followed by arbitrary data.
            let words = at.cast::<u64>();
            words.add(1).write(0xdead_beef);
            assert!(!AllocHeader::is_plausible(at, base + 8, base + 256));
            // Length and request disagree.
            AllocHeader::stamp(at, GUARD, 64, 16, ScanDescriptor::All, 0);
            at.cast::<u32>().add(3).write(100);
            assert!(!AllocHeader::is_plausible(at, base + 8, base + 256));
            // Unknown descriptor tag.
            AllocHeader::stamp(at, GUARD, 64, 16, ScanDescriptor::All, 0);
            at.cast::<u32>().add(4).write(9);
            assert!(!AllocHeader::is_plausible(at, base + 8, base + 256));
        }
    }

    #[test]
    fn contains_covers_header_and_data() {
        let mut mem = block();
        let at = mem.0.as_mut_ptr().cast::<AllocHeader>();
        unsafe {
            AllocHeader::stamp(at, GUARD, 64, 16, ScanDescriptor::All, 0);
            let hdr = &*at;
            assert!(hdr.contains(at as usize));
            assert!(hdr.contains(at as usize + 63));
            assert!(!hdr.contains(at as usize + 64));
        }
    }
}
