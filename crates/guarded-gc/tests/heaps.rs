//! Integration tests for multiple heaps and their options.

use std::ptr::{read_volatile, write_volatile};

use guarded_gc::{GcConfig, HeapOptions, Runtime, ScanDescriptor, DEFAULT_HEAP_ID};

fn runtime() -> Runtime {
    Runtime::new(
        GcConfig::default()
            .with_initial_arena_bytes(64 * 1024)
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

#[test]
#[cfg_attr(miri, ignore)]
fn pointers_from_other_heaps_are_rewritten() {
    let rt = runtime();
    let young = rt.new_heap("young", HeapOptions::default());
    let old = rt.new_heap("old", HeapOptions::default());

    let target = young.alloc(16, ScanDescriptor::None, false).as_ptr() as usize;
    set_word(target, 0, 7);
    let holder = old.alloc(16, ScanDescriptor::All, false).as_ptr() as usize;
    set_word(holder, 0, target + 8);

    let mut root = holder;
    unsafe { old.register_root(&raw mut root, 1) };
    let metrics = young.collect().unwrap();
    assert_eq!(metrics.objects_copied, 1);
    assert_eq!(metrics.cross_heap_traced, 1);

    // The holder stays where it is; its field follows the copy.
    assert_eq!(load(&root), holder);
    let moved = word(holder, 0) - 8;
    assert_ne!(moved, target);
    assert!(young.contains(moved as *const u8));
    assert_eq!(word(moved, 0), 7);

    // Cross-heap marks are cleared, so the next cycle traces it again.
    assert_eq!(young.collect().unwrap().cross_heap_traced, 1);
    old.remove_root(&raw const root);
}

#[test]
#[cfg_attr(miri, ignore)]
fn collecting_one_heap_leaves_others_in_place() {
    let rt = runtime();
    let a = rt.new_heap("a", HeapOptions::default());
    let b = rt.new_heap("b", HeapOptions::default());
    let in_b = b.alloc(32, ScanDescriptor::All, false).as_ptr() as usize;
    let b_used = b.stats().used;

    a.collect().unwrap();
    assert!(rt.is_live_pointer(in_b));
    assert_eq!(b.stats().used, b_used);
    assert_eq!(b.stats().collections, 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn pinned_heaps_grow_and_can_be_unpinned() {
    let rt = runtime();
    let heap = rt.new_heap(
        "pinned",
        HeapOptions::default().with_initial_bytes(4096).pinned(),
    );
    assert!(heap.is_pinned());
    for _ in 0..100 {
        let _ = heap.alloc(200, ScanDescriptor::None, false);
    }
    let stats = heap.stats();
    assert!(stats.arenas > 1);
    assert_eq!(stats.collections, 0);
    assert!(heap.collect().is_none());

    let infos = heap.arena_infos();
    assert_eq!(infos.len(), stats.arenas);
    assert!(infos.iter().all(|info| info.heap_id == heap.id()));
    assert!(infos.iter().skip(1).all(|info| info.emergency));

    heap.set_pinned(false);
    let metrics = heap.collect().unwrap();
    assert_eq!(metrics.objects_copied, 0);
    assert_eq!(heap.stats().arenas, 1);
}

#[test]
#[cfg_attr(miri, ignore)]
fn private_heaps_are_invisible_to_other_collections() {
    let rt = runtime();
    let shared = rt.new_heap("shared", HeapOptions::default());
    let private = rt.new_heap("private", HeapOptions::default().private());
    assert!(private.is_private());

    let target = shared.alloc(16, ScanDescriptor::None, false).as_ptr() as usize;
    let holder = private.alloc(16, ScanDescriptor::All, false).as_ptr() as usize;
    set_word(holder, 0, target);
    let mut root = holder;
    unsafe { private.register_root(&raw mut root, 1) };

    // The root points into the private heap, which is never classified, so
    // the holder's field is never seen.
    let metrics = shared.collect().unwrap();
    assert_eq!(metrics.objects_copied, 0);
    assert_eq!(metrics.cross_heap_traced, 0);
    assert_eq!(word(holder, 0), target);
    assert!(!rt.is_live_pointer(target));

    // Collected itself, the private heap is traced as usual.
    assert_eq!(private.collect().unwrap().objects_copied, 1);
    assert!(private.contains(load(&root) as *const u8));
    assert!(rt.find_allocation(load(&root)).is_none());

    private.remove_root(&raw const root);
}

#[test]
#[cfg_attr(miri, ignore)]
fn no_trace_roots_only_count_for_their_own_heap() {
    let rt = runtime();
    let target_heap = rt.new_heap("target", HeapOptions::default());
    let quiet = rt.new_heap("quiet", HeapOptions::default().no_trace());

    let mut root = target_heap.alloc(16, ScanDescriptor::None, false).as_ptr() as usize;
    unsafe { quiet.register_root(&raw mut root, 1) };
    assert_eq!(target_heap.collect().unwrap().objects_copied, 0);

    let mut own = quiet.alloc(16, ScanDescriptor::None, false).as_ptr() as usize;
    unsafe { quiet.register_root(&raw mut own, 1) };
    assert_eq!(quiet.collect().unwrap().objects_copied, 1);
    assert!(quiet.contains(load(&own) as *const u8));

    quiet.remove_root(&raw const root);
    quiet.remove_root(&raw const own);
}

#[test]
#[cfg_attr(miri, ignore)]
fn no_trace_objects_are_not_followed_by_other_collections() {
    let rt = runtime();
    let target_heap = rt.new_heap("target", HeapOptions::default());
    let quiet = rt.new_heap("quiet", HeapOptions::default().no_trace());
    let rooted = rt.new_heap("rooted", HeapOptions::default());

    let target = target_heap.alloc(16, ScanDescriptor::None, false).as_ptr() as usize;
    let holder = quiet.alloc(16, ScanDescriptor::All, false).as_ptr() as usize;
    set_word(holder, 0, target);
    let mut root = holder;
    unsafe { rooted.register_root(&raw mut root, 1) };

    let metrics = target_heap.collect().unwrap();
    assert_eq!(metrics.objects_copied, 0);
    assert_eq!(metrics.cross_heap_traced, 0);
    assert_eq!(word(holder, 0), target);
    assert_eq!(load(&root), holder);

    rooted.remove_root(&raw const root);
}

#[test]
#[cfg_attr(miri, ignore)]
fn local_collects_ignore_foreign_roots() {
    let rt = runtime();
    let local = rt.new_heap("local", HeapOptions::default().local_collects());
    let other = rt.new_heap("other", HeapOptions::default());

    let mut foreign = local.alloc(16, ScanDescriptor::None, false).as_ptr() as usize;
    unsafe { other.register_root(&raw mut foreign, 1) };
    let mut own = local.alloc(16, ScanDescriptor::None, false).as_ptr() as usize;
    unsafe { local.register_root(&raw mut own, 1) };

    let metrics = local.collect().unwrap();
    assert_eq!(metrics.objects_copied, 1);
    assert!(rt.is_live_pointer(load(&own)));
    assert!(!rt.is_live_pointer(load(&foreign)));

    other.remove_root(&raw const foreign);
    local.remove_root(&raw const own);
}

#[test]
#[cfg_attr(miri, ignore)]
fn deleted_heaps_release_everything() {
    let rt = runtime();
    let heap = rt.new_heap("doomed", HeapOptions::default());
    let p = heap.alloc(64, ScanDescriptor::None, false).as_ptr() as usize;
    let id = heap.id();
    assert!(rt.find_heap(p as *const u8).is_some());

    assert!(rt.delete_heap(&heap));
    assert!(rt.heap(id).is_none());
    assert!(rt.find_heap(p as *const u8).is_none());
    assert!(!rt.is_live_pointer(p));
    assert!(rt.heaps().iter().all(|h| h.id() != id));

    assert!(!rt.delete_heap(&rt.default_heap()));
    assert_eq!(rt.default_heap().id(), DEFAULT_HEAP_ID);
}

#[test]
#[cfg_attr(miri, ignore)]
fn heaps_of_other_runtimes_are_not_deleted() {
    let rt = runtime();
    let other = runtime();
    let heap = other.new_heap("foreign", HeapOptions::default());
    assert!(!rt.delete_heap(&heap));
    assert!(other.heap(heap.id()).is_some());
}

#[test]
#[cfg_attr(miri, ignore)]
fn runtimes_do_not_see_each_other() {
    let a = runtime();
    let b = runtime();
    assert_ne!(a.guard(), b.guard());
    let p = a.default_heap().alloc(16, ScanDescriptor::None, false).as_ptr() as usize;
    assert!(a.is_live_pointer(p));
    assert!(!b.is_live_pointer(p));
    assert!(b.find_allocation(p).is_none());
}
