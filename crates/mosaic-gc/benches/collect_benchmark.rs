//! Benchmark: allocation throughput and collection pauses.
//!
//! Measures pool allocation, a quick cycle over a mostly dead young
//! generation, a full cycle over a rooted list, and parallel marking.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use mosaic_gc::{
    CollectionKind, Collector, GcConfig, Mutator, NoHooks, ObjectLayout, ObjectModel, ObjectRef,
};
use std::hint::black_box;
use std::sync::Arc;

const LEAF: usize = 1;
const PAIR: usize = 2;

struct BenchModel;

// SAFETY: pairs are allocated with two reference slots.
unsafe impl ObjectModel for BenchModel {
    fn layout(&self, obj: ObjectRef) -> ObjectLayout {
        if obj.type_tag() == PAIR {
            ObjectLayout::Fields8(&[0, 1])
        } else {
            ObjectLayout::Leaf
        }
    }
}

fn collector(mark_threads: usize) -> Arc<Collector> {
    let mut config = GcConfig::new(mark_threads);
    config.set_auto_collect(false);
    Collector::new(config, BenchModel, NoHooks).expect("collector")
}

fn list(m: &Mutator, n: usize) -> ObjectRef {
    let mut head: Option<ObjectRef> = None;
    for _ in 0..n {
        let p = m.alloc(16, PAIR).expect("alloc");
        // SAFETY: pairs have two slots.
        unsafe { p.store_slot_raw(0, head) };
        head = Some(p);
    }
    head.expect("non-empty")
}

fn bench_alloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc");
    for size in [8usize, 64, 512] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let gc = collector(0);
            let m = gc.mutator();
            b.iter(|| {
                for _ in 0..1_000 {
                    black_box(m.alloc(size, LEAF).expect("alloc"));
                }
                m.collect(CollectionKind::Auto);
            });
        });
    }
    group.finish();
}

fn bench_quick_cycle(c: &mut Criterion) {
    c.bench_function("quick_cycle_10000_dead", |b| {
        let gc = collector(0);
        let m = gc.mutator();
        m.push_root(list(&m, 10_000));
        m.collect(CollectionKind::Auto);
        b.iter(|| {
            for _ in 0..10_000 {
                black_box(m.alloc(24, LEAF).expect("alloc"));
            }
            black_box(m.collect(CollectionKind::Auto));
        });
    });
}

fn bench_full_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_cycle_list");
    for threads in [0usize, 2, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            let gc = collector(threads);
            let m = gc.mutator();
            for _ in 0..threads.max(1) {
                m.push_root(list(&m, 50_000));
            }
            b.iter(|| black_box(m.collect(CollectionKind::Full)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_alloc, bench_quick_cycle, bench_full_cycle);
criterion_main!(benches);
