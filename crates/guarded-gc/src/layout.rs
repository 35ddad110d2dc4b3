//! Type layouts and scan descriptors.
//!
//! The collector never interprets objects. It asks a type for the byte
//! offsets of its pointer-bearing words once, and turns the answer into a
//! [`ScanDescriptor`] stored in every header of that type.

use std::any::TypeId;
use std::cell::Cell;
use std::collections::HashMap;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::AtomicPtr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::header::{MapId, ScanDescriptor, WORD};

/// Describes where a type keeps pointers into collected heaps.
///
/// # Safety
///
/// Every word of `Self` that can hold a pointer to a collected allocation
/// must be listed by [`pointer_offsets`](Self::pointer_offsets), and every
/// listed offset must be word aligned. An omitted pointer is neither traced
/// nor rewritten when its target moves.
///
/// Implement it with `#[derive(Scan)]` rather than by hand.
pub unsafe trait ScanLayout: 'static {
    /// Byte offsets of the pointer-bearing words of `Self`.
    fn pointer_offsets() -> Vec<usize>;
}

macro_rules! impl_no_pointers {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl ScanLayout for $t {
                fn pointer_offsets() -> Vec<usize> {
                    Vec::new()
                }
            }
        )*
    };
}

impl_no_pointers!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
);

macro_rules! impl_one_pointer {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl<T: 'static> ScanLayout for $t {
                fn pointer_offsets() -> Vec<usize> {
                    vec![0]
                }
            }
        )*
    };
}

impl_one_pointer!(*const T, *mut T, NonNull<T>, Option<NonNull<T>>, AtomicPtr<T>);

unsafe impl<T: ScanLayout, const N: usize> ScanLayout for [T; N] {
    fn pointer_offsets() -> Vec<usize> {
        let inner = T::pointer_offsets();
        (0..N)
            .flat_map(|i| inner.iter().map(move |off| i * size_of::<T>() + off))
            .collect()
    }
}

unsafe impl<T: ScanLayout> ScanLayout for Cell<T> {
    fn pointer_offsets() -> Vec<usize> {
        T::pointer_offsets()
    }
}

/// A per-type bitmap of pointer-bearing words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerMap {
    words: usize,
    bits: Box<[u64]>,
}

impl PointerMap {
    /// Builds a map for a `size`-byte type from its pointer offsets.
    ///
    /// # Panics
    ///
    /// Panics if an offset is not word aligned or lies past `size`.
    #[must_use]
    pub fn from_offsets(size: usize, offsets: &[usize]) -> Self {
        let words = size.div_ceil(WORD);
        let mut bits = vec![0u64; words.div_ceil(64)].into_boxed_slice();
        for &off in offsets {
            assert!(off % WORD == 0, "pointer offset {off} is not word aligned");
            assert!(off + WORD <= size, "pointer offset {off} lies outside a {size}-byte type");
            let word = off / WORD;
            bits[word / 64] |= 1 << (word % 64);
        }
        Self { words, bits }
    }

    /// Number of words covered.
    #[must_use]
    pub const fn words(&self) -> usize {
        self.words
    }

    /// Whether word `index` may hold a pointer. Words past the map never do.
    #[must_use]
    pub fn is_pointer(&self, index: usize) -> bool {
        self.bits
            .get(index / 64)
            .is_some_and(|chunk| chunk & (1 << (index % 64)) != 0)
    }

    /// Number of pointer words.
    #[must_use]
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Indices of pointer words, ascending.
    pub fn pointer_words(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.words).filter(|&i| self.is_pointer(i))
    }

    /// `Some(n)` if the pointer words are exactly the first `n` words.
    #[must_use]
    pub fn as_prefix(&self) -> Option<usize> {
        let n = self.count();
        (0..n).all(|i| self.is_pointer(i)).then_some(n)
    }
}

/// Scan descriptors by type, and the table of registered maps.
#[derive(Debug, Default)]
pub(crate) struct TypeRegistry {
    by_type: RwLock<HashMap<TypeId, ScanDescriptor>>,
    maps: RwLock<Vec<Arc<PointerMap>>>,
}

impl TypeRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn descriptor_of<T: ScanLayout>(&self) -> ScanDescriptor {
        let id = TypeId::of::<T>();
        if let Some(desc) = self.by_type.read().get(&id) {
            return *desc;
        }
        let map = PointerMap::from_offsets(size_of::<T>(), &T::pointer_offsets());
        let mut by_type = self.by_type.write();
        if let Some(desc) = by_type.get(&id) {
            return *desc;
        }
        let desc = self.descriptor_for(map);
        by_type.insert(id, desc);
        desc
    }

    /// Picks the cheapest descriptor equivalent to `map`, registering it if
    /// only a bitmap will do.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn descriptor_for(&self, map: PointerMap) -> ScanDescriptor {
        match map.as_prefix() {
            Some(0) => ScanDescriptor::None,
            Some(n) => ScanDescriptor::Prefix(n as u32),
            None => {
                let mut maps = self.maps.write();
                let id = MapId(maps.len() as u32);
                maps.push(Arc::new(map));
                ScanDescriptor::Map(id)
            }
        }
    }

    pub(crate) fn map(&self, id: MapId) -> Option<Arc<PointerMap>> {
        self.maps.read().get(id.index()).cloned()
    }

    /// Every registered map, indexed by [`MapId`].
    pub(crate) fn maps(&self) -> Vec<Arc<PointerMap>> {
        self.maps.read().clone()
    }
}
