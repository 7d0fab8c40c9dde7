//! End-to-end collection tests on a single mutator.

mod common;

use common::{array, collector, leaf, list, pair, serial_config, stamp, stamp_of, structs};
use mosaic_gc::{size_class_index, CollectionKind, PageState, GC_OLD, SIZE_CLASSES, TAG_SIZE};

#[test]
fn unreachable_pool_objects_are_freed_and_pages_lazily_freed() {
    let gc = collector(serial_config());
    let m = gc.mutator();
    let osize = usize::from(SIZE_CLASSES[size_class_index(64).expect("pool")]);
    assert_eq!(osize, 64);

    let objs: Vec<_> = (0..1000).map(|_| leaf(&m, 64 - TAG_SIZE)).collect();
    let before = gc.heap_status().heap_size();
    assert_eq!(before, 1000 * 64);

    let info = m.collect(CollectionKind::Full).expect("collected");

    assert_eq!(info.freed, 1000 * 64);
    assert_eq!(gc.heap_status().heap_size(), 0);
    assert_eq!(info.live_bytes, 0);
    for obj in objs {
        assert_eq!(gc.page_state(obj.as_ptr()), PageState::LazilyFreed);
    }
}

#[test]
fn rooted_graph_survives() {
    let gc = collector(serial_config());
    let m = gc.mutator();

    let head = list(&m, 500);
    m.push_root(head);
    let garbage = list(&m, 300);

    m.collect(CollectionKind::Auto).expect("collected");

    let mut cur = Some(head);
    let mut n = 0;
    while let Some(node) = cur {
        assert_eq!(node.gc_bits(), GC_OLD);
        n += 1;
        // SAFETY: list nodes are pairs.
        cur = unsafe { node.load_slot(0) };
    }
    assert_eq!(n, 500);
    assert_ne!(garbage.gc_bits(), GC_OLD);
    assert_eq!(gc.last_metrics().objects_marked, 500);
}

#[test]
fn long_arrays_are_marked_in_chunks() {
    let mut config = serial_config();
    config.set_chunk_batch_size(4);
    let gc = collector(config);
    let m = gc.mutator();

    let elems: Vec<_> = (0..100)
        .map(|i| {
            let e = leaf(&m, 16);
            stamp(e, i + 1);
            e
        })
        .collect();
    let arr = array(&m, &elems);
    m.push_root(arr);

    m.collect(CollectionKind::Auto).expect("collected");

    for (i, e) in elems.iter().enumerate() {
        assert_eq!(e.gc_bits(), GC_OLD, "element {i} was not marked");
        assert_eq!(stamp_of(*e), i + 1);
    }
    assert_eq!(gc.last_metrics().objects_marked, 101);
}

#[test]
fn inline_struct_arrays_mark_their_reference_fields() {
    let mut config = serial_config();
    config.set_chunk_batch_size(3);
    let gc = collector(config);
    let m = gc.mutator();

    let elems: Vec<_> = (0..20).map(|_| leaf(&m, 8)).collect();
    let arr = structs(&m, &elems);
    m.push_root(arr);

    m.collect(CollectionKind::Auto).expect("collected");

    assert!(elems.iter().all(|e| e.gc_bits() == GC_OLD));
    assert_eq!(gc.last_metrics().objects_marked, 21);
}

#[test]
fn shared_children_are_marked_once() {
    let gc = collector(serial_config());
    let m = gc.mutator();

    let shared = leaf(&m, 8);
    let a = pair(&m, Some(shared), Some(shared));
    let b = pair(&m, Some(shared), Some(a));
    m.push_root(a);
    m.push_root(b);

    m.collect(CollectionKind::Auto).expect("collected");

    assert_eq!(gc.last_metrics().objects_marked, 3);
}

#[test]
fn big_objects_are_swept() {
    let gc = collector(serial_config());
    let m = gc.mutator();

    let live = leaf(&m, 64 << 10);
    let _dead = leaf(&m, 64 << 10);
    m.push_root(live);
    let before = gc.heap_status().heap_size();
    assert!(before >= 128 << 10);

    let info = m.collect(CollectionKind::Auto).expect("collected");

    assert!(info.freed >= 64 << 10);
    assert_eq!(gc.heap_status().heap_size(), before - info.freed);
    assert_eq!(live.gc_bits(), GC_OLD);
    assert_eq!(gc.last_metrics().big_objects_freed, 1);
}

#[test]
fn freed_blocks_are_reused() {
    let gc = collector(serial_config());
    let m = gc.mutator();

    let keep = leaf(&m, 40);
    m.push_root(keep);
    let dead: Vec<_> = (0..10).map(|_| leaf(&m, 40)).collect();
    m.collect(CollectionKind::Auto).expect("collected");

    let again: Vec<_> = (0..10).map(|_| leaf(&m, 40)).collect();
    assert!(again.iter().all(|o| dead.contains(o)));
    assert!(again.iter().all(|o| stamp_of(*o) == 0), "reused blocks are zeroed");
    assert!(!again.contains(&keep));
}

#[test]
fn oversized_requests_are_rejected() {
    let gc = collector(serial_config());
    let m = gc.mutator();
    let err = m.alloc(usize::MAX, common::LEAF).unwrap_err();
    assert!(matches!(err, mosaic_gc::GcError::ObjectTooLarge { .. }));
}

#[test]
fn roots_follow_stack_discipline() {
    let gc = collector(serial_config());
    let m = gc.mutator();

    let a = leaf(&m, 8);
    let b = leaf(&m, 8);
    m.push_root(a);
    let frame = m.root_count();
    m.push_root(b);
    m.push_root(b);
    assert!(m.remove_root(b));
    assert_eq!(m.pop_root(), Some(b));
    m.push_root(b);
    m.truncate_roots(frame);
    assert_eq!(m.root_count(), 1);

    m.collect(CollectionKind::Auto).expect("collected");
    assert_eq!(a.gc_bits(), GC_OLD);
    assert_ne!(b.gc_bits(), GC_OLD);
}

#[test]
fn degenerate_settings_are_clamped_by_the_setters() {
    let mut config = serial_config();
    config.set_chunk_batch_size(0);
    config.set_block_pages(0);
    config.set_max_pop_attempts(0);
    let gc = collector(config);
    assert_eq!(gc.config().chunk_batch_size(), 1);
    assert_eq!(gc.config().block_pages(), 1);
    assert_eq!(gc.config().max_pop_attempts(), 1);

    let m = gc.mutator();
    let elems: Vec<_> = (0..5).map(|_| leaf(&m, 8)).collect();
    let arr = array(&m, &elems);
    m.push_root(arr);

    m.collect(CollectionKind::Auto).expect("collected");

    assert!(elems.iter().all(|e| e.gc_bits() == GC_OLD));
    assert_eq!(gc.last_metrics().objects_marked, 6);
}
