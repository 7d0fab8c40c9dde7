//! Ageing, the write barrier and the remembered set.

mod common;

use common::{collector, leaf, pair, serial_config, stamp, stamp_of};
use mosaic_gc::{CollectionKind, GC_CLEAN, GC_MARKED, GC_OLD, GC_OLD_MARKED};

#[test]
fn survivors_age_and_stay_marked_across_quick_cycles() {
    let gc = collector(serial_config());
    let m = gc.mutator();
    let obj = leaf(&m, 8);
    m.push_root(obj);
    assert_eq!(obj.gc_bits(), GC_CLEAN);

    m.collect(CollectionKind::Auto).expect("collected");
    assert_eq!(obj.gc_bits(), GC_OLD);

    m.collect(CollectionKind::Auto).expect("collected");
    assert_eq!(obj.gc_bits(), GC_OLD_MARKED);
    assert!(obj.is_old() && obj.is_marked());
}

/// Builds a rooted parent that is old and marked.
fn old_marked_parent(m: &mosaic_gc::Mutator) -> mosaic_gc::ObjectRef {
    let parent = pair(m, None, None);
    m.push_root(parent);
    m.collect(CollectionKind::Auto).expect("collected");
    m.collect(CollectionKind::Auto).expect("collected");
    assert_eq!(parent.gc_bits(), GC_OLD_MARKED);
    parent
}

#[test]
fn barrier_keeps_young_child_of_old_parent_alive() {
    let gc = collector(serial_config());
    let m = gc.mutator();
    let parent = old_marked_parent(&m);

    let child = leaf(&m, 8);
    stamp(child, 0xC0FFEE);
    // SAFETY: pairs have two slots.
    unsafe { m.store_slot(parent, 0, Some(child)) };
    assert_eq!(parent.gc_bits(), GC_MARKED, "barrier clears the old bit");

    m.collect(CollectionKind::Auto).expect("collected");

    assert_eq!(child.gc_bits(), GC_OLD);
    assert_eq!(stamp_of(child), 0xC0FFEE);
    // The parent still points at a young-turned-old child this cycle, so it
    // went back into the remembered set and was reset to marked.
    assert_eq!(parent.gc_bits(), GC_MARKED);
}

#[test]
fn store_without_barrier_loses_the_child() {
    let gc = collector(serial_config());
    let m = gc.mutator();
    let parent = old_marked_parent(&m);

    let child = leaf(&m, 8);
    // SAFETY: pairs have two slots.
    unsafe { parent.store_slot_raw(0, Some(child)) };

    m.collect(CollectionKind::Auto).expect("collected");

    assert_eq!(child.gc_bits(), GC_CLEAN, "a quick cycle does not rescan old objects");
    // SAFETY: clear the dangling slot before anything else looks at it.
    unsafe { parent.store_slot_raw(0, None) };
}

#[test]
fn barrier_ignores_marked_children_and_young_parents() {
    let gc = collector(serial_config());
    let m = gc.mutator();
    let young = pair(&m, None, None);
    let child = leaf(&m, 8);
    m.write_barrier(young, child);
    assert_eq!(young.gc_bits(), GC_CLEAN);

    m.push_root(young);
    m.push_root(child);
    let parent = old_marked_parent(&m);
    assert!(child.is_marked());
    m.write_barrier(parent, child);
    assert_eq!(parent.gc_bits(), GC_OLD_MARKED);
}

#[test]
fn full_sweep_resets_old_objects_and_frees_dead_ones_next_cycle() {
    let mut config = serial_config();
    config.set_always_full(true);
    let gc = collector(config);
    let m = gc.mutator();

    let keep = leaf(&m, 8);
    let drop_later = leaf(&m, 8);
    m.push_root(keep);
    m.push_root(drop_later);
    m.collect(CollectionKind::Auto).expect("collected");
    assert_eq!(keep.gc_bits(), GC_OLD);
    assert_eq!(drop_later.gc_bits(), GC_OLD);

    assert!(m.remove_root(drop_later));
    let before = gc.heap_status().heap_size();
    let info = m.collect(CollectionKind::Auto).expect("collected");

    assert!(info.full);
    assert_eq!(keep.gc_bits(), GC_OLD);
    assert_eq!(info.freed, before - gc.heap_status().heap_size());
    assert!(info.freed > 0);
}
