//! Integration tests for copying collection.
//!
//! Every test builds its own runtime with stack scanning off, so the only
//! roots are the ones registered explicitly.

use std::ptr::{read_volatile, write_volatile, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use guarded_gc::{alloc_len_for, GcConfig, HeapOptions, Runtime, ScanDescriptor, HEADER_SIZE};

fn runtime(initial: usize) -> Runtime {
    Runtime::new(
        GcConfig::default()
            .with_initial_arena_bytes(initial)
            .with_min_emergency_arena_bytes(16 * 1024)
            .with_scan_thread_stacks(false),
    )
    .unwrap()
}

fn word(ptr: usize, index: usize) -> usize {
    unsafe { read_volatile((ptr as *const usize).add(index)) }
}

fn set_word(ptr: usize, index: usize, value: usize) {
    unsafe { write_volatile((ptr as *mut usize).add(index), value) };
}

fn load(slot: &usize) -> usize {
    unsafe { read_volatile(slot) }
}

fn store(slot: &mut usize, value: usize) {
    unsafe { write_volatile(slot, value) };
}

#[test]
#[cfg_attr(miri, ignore)]
fn unrooted_allocations_are_reclaimed() {
    let rt = runtime(64 * 1024);
    let heap = rt.new_heap("garbage", HeapOptions::default());
    for _ in 0..100 {
        let _ = heap.alloc(48, ScanDescriptor::All, false);
    }
    assert_eq!(heap.stats().live_allocations, 100);

    let metrics = heap.collect().unwrap();
    assert_eq!(metrics.objects_copied, 0);
    assert_eq!(metrics.bytes_before, 100 * alloc_len_for(48).unwrap());
    assert_eq!(metrics.bytes_after, 0);
    assert_eq!(metrics.bytes_reclaimed(), metrics.bytes_before);

    let stats = heap.stats();
    assert_eq!(stats.used, 0);
    assert_eq!(stats.live_allocations, 0);
    assert_eq!(stats.collections, 1);
}

#[test]
#[cfg_attr(miri, ignore)]
fn empty_heap_collects_to_nothing() {
    let rt = runtime(64 * 1024);
    let heap = rt.default_heap();
    let metrics = heap.collect().unwrap();
    assert_eq!(metrics.bytes_before, 0);
    assert_eq!(metrics.objects_copied, 0);
    assert_eq!(heap.stats().used, 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn rooted_chain_survives_and_moves() {
    let rt = runtime(64 * 1024);
    let heap = rt.default_heap();

    // a -> b -> c, each [next, value].
    let c = heap.alloc(16, ScanDescriptor::Prefix(1), false).as_ptr() as usize;
    set_word(c, 1, 3);
    let b = heap.alloc(16, ScanDescriptor::Prefix(1), false).as_ptr() as usize;
    set_word(b, 0, c);
    set_word(b, 1, 2);
    let a = heap.alloc(16, ScanDescriptor::Prefix(1), false).as_ptr() as usize;
    set_word(a, 0, b);
    set_word(a, 1, 1);
    let _garbage = heap.alloc(256, ScanDescriptor::All, false);

    let mut root = a;
    unsafe { heap.register_root(&raw mut root, 1) };
    let metrics = heap.collect().unwrap();
    assert_eq!(metrics.objects_copied, 3);
    assert_eq!(metrics.bytes_after, 3 * alloc_len_for(16).unwrap());

    let a2 = load(&root);
    assert_ne!(a2, a);
    assert!(rt.is_live_pointer(a2));
    assert!(!rt.is_live_pointer(a));

    let b2 = word(a2, 0);
    let c2 = word(b2, 0);
    assert_eq!((word(a2, 1), word(b2, 1), word(c2, 1)), (1, 2, 3));
    assert_eq!(word(c2, 0), 0);
    assert!(rt.is_live_pointer(b2) && rt.is_live_pointer(c2));

    heap.remove_root(&raw const root);
    assert_eq!(heap.collect().unwrap().objects_copied, 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn dropping_every_third_node_leaves_exact_count() {
    const NODES: usize = 10_000;

    let rt = runtime(64 * 1024);
    let heap = rt.new_heap("list", HeapOptions::default());
    let mut head = 0usize;
    unsafe { heap.register_root(&raw mut head, 1) };

    // Prepending leaves the list ordered NODES-1 down to 0. The arena is far
    // too small for the whole list, so collections run while it is built.
    for i in 0..NODES {
        let node = heap.alloc(16, ScanDescriptor::Prefix(1), false).as_ptr() as usize;
        set_word(node, 0, load(&head));
        set_word(node, 1, i);
        store(&mut head, node);
    }
    assert!(heap.stats().collections > 0);

    let mut prev = 0usize;
    let mut node = load(&head);
    while node != 0 {
        let next = word(node, 0);
        if word(node, 1) % 3 == 2 {
            if prev == 0 {
                store(&mut head, next);
            } else {
                set_word(prev, 0, next);
            }
        } else {
            prev = node;
        }
        node = next;
    }

    let metrics = heap.collect().unwrap();
    let expected = (0..NODES).filter(|i| i % 3 != 2).count();
    assert_eq!(expected, 6667);
    assert_eq!(metrics.objects_copied, expected);
    assert_eq!(heap.stats().live_allocations, expected);

    let mut count = 0;
    let mut sum = 0;
    let mut node = load(&head);
    while node != 0 {
        assert!(rt.is_live_pointer(node));
        count += 1;
        sum += word(node, 1);
        node = word(node, 0);
    }
    assert_eq!(count, expected);
    assert_eq!(sum, (0..NODES).filter(|i| i % 3 != 2).sum::<usize>());

    heap.remove_root(&raw const head);
}

#[test]
#[cfg_attr(miri, ignore)]
fn interior_pointers_keep_their_offset() {
    let rt = runtime(64 * 1024);
    let heap = rt.default_heap();
    let block = heap.alloc(64, ScanDescriptor::None, false).as_ptr() as usize;
    set_word(block, 5, 0xfeed);

    let mut roots = [block + 40, block - HEADER_SIZE + 8];
    unsafe { heap.register_root(roots.as_mut_ptr(), 2) };
    let metrics = heap.collect().unwrap();
    assert_eq!(metrics.objects_copied, 1);

    let moved = load(&roots[0]) - 40;
    assert_ne!(moved, block);
    assert_eq!(word(moved, 5), 0xfeed);
    assert_eq!(load(&roots[1]), moved - HEADER_SIZE + 8);

    heap.remove_root(roots.as_ptr());
}

#[test]
#[cfg_attr(miri, ignore)]
fn descriptors_limit_what_is_traced() {
    let rt = runtime(64 * 1024);
    let heap = rt.default_heap();
    let target = heap.alloc(16, ScanDescriptor::None, false).as_ptr() as usize;

    // The pointer sits past the scanned prefix, so it is payload.
    let holder = heap.alloc(32, ScanDescriptor::Prefix(1), false).as_ptr() as usize;
    set_word(holder, 2, target);
    let mut root = holder;
    unsafe { heap.register_root(&raw mut root, 1) };

    let metrics = heap.collect().unwrap();
    assert_eq!(metrics.objects_copied, 1);
    let holder2 = load(&root);
    assert_eq!(word(holder2, 2), target);
    assert!(!rt.is_live_pointer(target));

    heap.remove_root(&raw const root);
}

#[test]
#[cfg_attr(miri, ignore)]
fn pointer_maps_select_words() {
    let rt = runtime(64 * 1024);
    let heap = rt.default_heap();
    let desc = rt.register_pointer_map(guarded_gc::PointerMap::from_offsets(24, &[0, 16]));
    assert!(matches!(desc, ScanDescriptor::Map(_)));

    let left = heap.alloc(8, ScanDescriptor::None, false).as_ptr() as usize;
    let middle = heap.alloc(8, ScanDescriptor::None, false).as_ptr() as usize;
    let right = heap.alloc(8, ScanDescriptor::None, false).as_ptr() as usize;
    let obj = heap.alloc(24, desc, false).as_ptr() as usize;
    set_word(obj, 0, left);
    set_word(obj, 1, middle);
    set_word(obj, 2, right);

    let mut root = obj;
    unsafe { heap.register_root(&raw mut root, 1) };
    let metrics = heap.collect().unwrap();
    assert_eq!(metrics.objects_copied, 3);

    let obj2 = load(&root);
    assert!(rt.is_live_pointer(word(obj2, 0)));
    assert_eq!(word(obj2, 1), middle);
    assert!(rt.is_live_pointer(word(obj2, 2)));

    heap.remove_root(&raw const root);
}

#[test]
#[cfg_attr(miri, ignore)]
fn cycles_are_copied_once() {
    let rt = runtime(64 * 1024);
    let heap = rt.default_heap();
    let a = heap.alloc(16, ScanDescriptor::All, false).as_ptr() as usize;
    let b = heap.alloc(16, ScanDescriptor::All, false).as_ptr() as usize;
    set_word(a, 0, b);
    set_word(b, 0, a);
    set_word(a, 1, a);

    let mut root = a;
    unsafe { heap.register_root(&raw mut root, 1) };
    let metrics = heap.collect().unwrap();
    assert_eq!(metrics.objects_copied, 2);

    let a2 = load(&root);
    let b2 = word(a2, 0);
    assert_eq!(word(b2, 0), a2);
    assert_eq!(word(a2, 1), a2);

    heap.remove_root(&raw const root);
}

#[test]
#[cfg_attr(miri, ignore)]
fn words_that_only_look_like_pointers_are_left_alone() {
    let rt = runtime(64 * 1024);
    let heap = rt.default_heap();
    let data = heap.alloc(32, ScanDescriptor::All, false).as_ptr() as usize;
    set_word(data, 0, rt.guard() as usize);
    set_word(data, 1, 0xdead_beef);
    set_word(data, 2, usize::MAX);

    let mut root = data;
    unsafe { heap.register_root(&raw mut root, 1) };
    heap.collect().unwrap();

    let moved = load(&root);
    assert_eq!(word(moved, 0), rt.guard() as usize);
    assert_eq!(word(moved, 1), 0xdead_beef);
    assert_eq!(word(moved, 2), usize::MAX);

    heap.remove_root(&raw const root);
}

#[test]
#[cfg_attr(miri, ignore)]
fn header_lookalikes_in_data_do_not_hide_the_object() {
    let rt = runtime(64 * 1024);
    let heap = rt.default_heap();
    let data = heap.alloc(128, ScanDescriptor::None, false).as_ptr() as usize;
    // Guard plus a length that would make a 48-byte allocation.
    set_word(data, 0, rt.guard() as usize);
    set_word(data, 1, HEADER_SIZE);
    set_word(data, 15, 42);

    let mut root = data + 64;
    unsafe { heap.register_root(&raw mut root, 1) };
    assert_eq!(heap.collect().unwrap().objects_copied, 1);

    let moved = load(&root) - 64;
    assert_ne!(moved, data);
    assert!(rt.is_live_pointer(moved));
    let found = rt.find_allocation(load(&root)).unwrap();
    assert_eq!(found.data().as_ptr() as usize, moved);
    assert_eq!(word(moved, 0), rt.guard() as usize);
    assert_eq!(word(moved, 1), HEADER_SIZE);
    assert_eq!(word(moved, 15), 42);

    heap.remove_root(&raw const root);
}

#[test]
#[cfg_attr(miri, ignore)]
fn inactive_roots_are_skipped() {
    let rt = runtime(64 * 1024);
    let heap = rt.default_heap();
    let mut root = heap.alloc(16, ScanDescriptor::None, false).as_ptr() as usize;
    let id = unsafe { heap.register_root(&raw mut root, 1) };

    heap.set_root_active(id, false);
    assert_eq!(heap.collect().unwrap().objects_copied, 0);

    heap.set_root_active(id, true);
    store(&mut root, heap.alloc(16, ScanDescriptor::None, false).as_ptr() as usize);
    assert_eq!(heap.collect().unwrap().objects_copied, 1);
    assert!(rt.is_live_pointer(load(&root)));

    heap.remove_root(&raw const root);
}

#[test]
#[cfg_attr(miri, ignore)]
fn bootstrap_roots_are_traced_for_every_heap() {
    let rt = runtime(64 * 1024);
    let heap = rt.new_heap("boot", HeapOptions::default());
    let mut root = heap.alloc(16, ScanDescriptor::None, false).as_ptr() as usize;
    unsafe { rt.register_bootstrap_root(&raw mut root, 1) };

    let metrics = heap.collect().unwrap();
    assert_eq!(metrics.objects_copied, 1);
    assert!(heap.contains(load(&root) as *const u8));

    assert!(rt.remove_bootstrap_root(&raw const root));
    assert_eq!(heap.collect().unwrap().objects_copied, 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn identity_hash_survives_relocation() {
    let rt = runtime(64 * 1024);
    let heap = rt.default_heap();
    let mut root = heap.alloc(24, ScanDescriptor::None, false).as_ptr() as usize;
    unsafe { heap.register_root(&raw mut root, 1) };

    let before = rt.identity_hash(load(&root) as *const u8);
    let old = load(&root);
    heap.collect().unwrap();
    assert_ne!(load(&root), old);
    assert_eq!(rt.identity_hash(load(&root) as *const u8), before);

    heap.remove_root(&raw const root);
}

#[test]
#[cfg_attr(miri, ignore)]
fn find_allocation_follows_copies() {
    let rt = runtime(64 * 1024);
    let heap = rt.default_heap();
    let mut root = heap.alloc(40, ScanDescriptor::None, false).as_ptr() as usize;
    unsafe { heap.register_root(&raw mut root, 1) };
    heap.collect().unwrap();

    let data = load(&root);
    let found = rt.find_allocation(data + 33).unwrap();
    assert_eq!(found.data().as_ptr() as usize, data);
    assert_eq!(found.heap_id(), heap.id());
    assert!(rt.find_allocation(data + 4096).is_none());

    heap.remove_root(&raw const root);
}

static FINALIZED: AtomicUsize = AtomicUsize::new(0);
static FINALIZED_MARKERS: AtomicUsize = AtomicUsize::new(0);

fn count_finalized(data: NonNull<u8>) {
    FINALIZED.fetch_add(1, Ordering::SeqCst);
    let marker = unsafe { read_volatile(data.as_ptr().cast::<usize>()) };
    FINALIZED_MARKERS.fetch_add(marker, Ordering::SeqCst);
}

#[test]
#[cfg_attr(miri, ignore)]
fn finalizers_run_once_for_unreachable_allocations() {
    let rt = runtime(64 * 1024);
    rt.set_finalizer(Some(count_finalized));
    let heap = rt.new_heap("finalize", HeapOptions::default());

    let mut roots = [0usize; 4];
    unsafe { heap.register_root(roots.as_mut_ptr(), roots.len()) };
    for i in 0..10 {
        let p = heap.alloc(16, ScanDescriptor::None, true).as_ptr() as usize;
        set_word(p, 0, i + 1);
        if i < 4 {
            store(&mut roots[i], p);
        }
    }
    // Not finalizable; never reported.
    let _ = heap.alloc(16, ScanDescriptor::None, false);

    let metrics = heap.collect().unwrap();
    assert_eq!(metrics.finalized, 6);
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 6);
    assert_eq!(FINALIZED_MARKERS.load(Ordering::SeqCst), (5..=10).sum::<usize>());

    assert_eq!(heap.collect().unwrap().finalized, 0);
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 6);

    heap.remove_root(roots.as_ptr());
    assert_eq!(heap.collect().unwrap().finalized, 4);
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 10);
    assert_eq!(FINALIZED_MARKERS.load(Ordering::SeqCst), (1..=10).sum::<usize>());
}

#[test]
#[cfg_attr(miri, ignore)]
fn finalizable_allocations_without_callback_are_counted() {
    let rt = runtime(64 * 1024);
    let heap = rt.default_heap();
    for _ in 0..3 {
        let _ = heap.alloc(8, ScanDescriptor::None, true);
    }
    assert_eq!(heap.collect().unwrap().finalized, 3);
}

#[test]
#[cfg_attr(miri, ignore)]
fn resize_survives_the_collection_it_triggers() {
    let rt = runtime(4096);
    let heap = rt.new_heap("resize", HeapOptions::default());
    let p = heap.alloc(32, ScanDescriptor::None, false);
    for i in 0..4 {
        set_word(p.as_ptr() as usize, i, 100 + i);
    }
    while heap.stats().available >= 256 {
        let _ = heap.alloc(64, ScanDescriptor::None, false);
    }
    let collections = heap.stats().collections;

    let grown = rt.resize(p, 1024).as_ptr() as usize;
    assert!(heap.stats().collections > collections);
    assert!(rt.is_live_pointer(grown));
    for i in 0..4 {
        assert_eq!(word(grown, i), 100 + i);
    }
    assert_eq!(word(grown, 4), 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn resize_moves_the_finalizer_registration() {
    static RESIZED_FINALIZED: AtomicUsize = AtomicUsize::new(0);
    fn count(_: NonNull<u8>) {
        RESIZED_FINALIZED.fetch_add(1, Ordering::SeqCst);
    }

    let rt = runtime(64 * 1024);
    rt.set_finalizer(Some(count));
    let heap = rt.default_heap();
    let p = heap.alloc(16, ScanDescriptor::None, true);
    let mut root = rt.resize(p, 48).as_ptr() as usize;
    unsafe { heap.register_root(&raw mut root, 1) };

    // The old allocation is garbage but no longer finalizable.
    assert_eq!(heap.collect().unwrap().finalized, 0);
    let hdr = rt.header_of(load(&root) as *const u8);
    assert!(unsafe { hdr.as_ref() }.wants_finalizer());

    heap.remove_root(&raw const root);
    assert_eq!(heap.collect().unwrap().finalized, 1);
    assert_eq!(RESIZED_FINALIZED.load(Ordering::SeqCst), 1);
}

#[test]
#[cfg_attr(miri, ignore)]
fn allocation_collects_when_the_arena_is_full() {
    let rt = runtime(4096);
    let heap = rt.new_heap("auto", HeapOptions::default());
    for _ in 0..1000 {
        let _ = heap.alloc(100, ScanDescriptor::All, false);
    }
    let stats = heap.stats();
    assert!(stats.collections > 0);
    // Garbage never accumulates past a couple of arenas' worth.
    assert!(stats.total < 64 * 1024, "heap grew to {stats:?}");
}

#[test]
#[cfg_attr(miri, ignore)]
fn survivors_overflowing_to_space_are_chained() {
    let rt = runtime(4096);
    let heap = rt.new_heap("chain", HeapOptions::default());
    let mut roots = vec![0usize; 256];
    unsafe { heap.register_root(roots.as_mut_ptr(), roots.len()) };

    for i in 0..roots.len() {
        let p = heap.alloc(200, ScanDescriptor::None, false).as_ptr() as usize;
        set_word(p, 0, i);
        store(&mut roots[i], p);
    }

    heap.collect().unwrap();
    for (i, root) in roots.iter().enumerate() {
        let p = load(root);
        assert!(rt.is_live_pointer(p));
        assert_eq!(word(p, 0), i);
    }
    assert_eq!(heap.stats().live_allocations, roots.len());

    heap.remove_root(roots.as_ptr());
}

#[test]
#[cfg_attr(miri, ignore)]
fn low_occupancy_flags_expansion() {
    let rt = runtime(64 * 1024);
    let heap = rt.new_heap("sparse", HeapOptions::default());
    let mut root = heap.alloc(16, ScanDescriptor::None, false).as_ptr() as usize;
    unsafe { heap.register_root(&raw mut root, 1) };

    let metrics = heap.collect().unwrap();
    assert!(metrics.expand_next);
    assert!(metrics.to_space_bytes >= 64 * 1024);
    assert_eq!(rt.last_collection_metrics(), Some(metrics));

    heap.remove_root(&raw const root);
}
