//! Full-sweep decisions and the reason counters.

mod common;

use common::{collector, leaf, serial_config};
use mosaic_gc::{CollectionKind, FullSweepReason, PAGE_SZ};

#[test]
fn always_full_makes_every_cycle_full() {
    let mut config = serial_config();
    config.set_always_full(true);
    let gc = collector(config);
    let m = gc.mutator();

    for _ in 0..2 {
        let info = m.collect(CollectionKind::Auto).expect("collected");
        assert!(info.full);
        assert!(!info.recollect);
    }
    let reasons = gc.full_sweep_reasons();
    assert_eq!(reasons.get(FullSweepReason::AlwaysFull), 2);
    assert_eq!(reasons.get(FullSweepReason::Forced), 0);
}

#[test]
fn forced_collection_after_a_quick_sweep_recollects() {
    let gc = collector(serial_config());
    let m = gc.mutator();
    let obj = leaf(&m, 8);
    m.push_root(obj);

    let quick = m.collect(CollectionKind::Auto).expect("collected");
    assert!(!quick.full);

    let forced = m.collect(CollectionKind::Full).expect("collected");
    assert!(forced.full);
    assert!(forced.recollect);
    assert_eq!(gc.full_sweep_reasons().get(FullSweepReason::Forced), 1);

    // The re-collection itself was quick, so the next forced one sweeps
    // fully again.
    let again = m.collect(CollectionKind::Full).expect("collected");
    assert!(again.full && again.recollect);
    assert_eq!(gc.full_sweep_reasons().get(FullSweepReason::Forced), 2);
    assert!(obj.is_old());
}

#[test]
fn exceeding_the_user_maximum_sweeps_fully() {
    let mut config = serial_config();
    config.set_max_total_memory(1);
    let gc = collector(config);
    let m = gc.mutator();
    m.push_root(leaf(&m, 8));

    let info = m.collect(CollectionKind::Auto).expect("collected");
    assert!(info.full);
    assert_eq!(gc.full_sweep_reasons().get(FullSweepReason::UserMaxExceeded), 1);
}

#[test]
fn promotion_beyond_the_threshold_sweeps_fully() {
    let mut config = serial_config();
    config.set_collect_interval(PAGE_SZ);
    config.set_promotion_rate_threshold(0.0);
    let gc = collector(config);
    let m = gc.mutator();
    m.push_root(leaf(&m, 8));

    let first = m.collect(CollectionKind::Auto).expect("collected");
    assert!(!first.full, "nothing was promoted before the first cycle");
    let second = m.collect(CollectionKind::Auto).expect("collected");
    assert!(second.full);
    assert_eq!(
        gc.full_sweep_reasons().get(FullSweepReason::LargePromotionRate),
        1
    );
    let third = m.collect(CollectionKind::Auto).expect("collected");
    assert!(!third.full, "a full sweep resets the promotion count");
}
