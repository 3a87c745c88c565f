//! Throughput of the indexed max-heap under insertion, drain, and
//! random-access update workloads, at sizes representative of a busy
//! mempool window (spec.md §4.1's target of sustaining high enqueue rates).

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use l2_engine::heap::IndexedHeap;

fn fill(n: usize) -> IndexedHeap<u64> {
    let mut heap = IndexedHeap::new();
    let now = Utc::now();
    for i in 0..n {
        heap.insert(format!("tx-{i}"), (i % 997) as f64, now, i as u64);
    }
    heap
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_insert");
    for size in [1_000usize, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut heap = IndexedHeap::new();
                let now = Utc::now();
                for i in 0..size {
                    heap.insert(format!("tx-{i}"), (i % 997) as f64, now, black_box(i as u64));
                }
                black_box(heap.len())
            });
        });
    }
    group.finish();
}

fn bench_drain_top(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_drain_top");
    for size in [1_000usize, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || fill(size),
                |mut heap| black_box(heap.drain_top(size / 10)),
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_update_priority(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_update_priority");
    for size in [1_000usize, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut heap = fill(size);
            let mut i = 0usize;
            b.iter(|| {
                let id = format!("tx-{}", i % size);
                i += 1;
                heap.update_priority(&id, black_box((i % 997) as f64));
            });
        });
    }
    group.finish();
}

fn bench_apply_aging(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_apply_aging");
    for size in [1_000usize, 10_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || fill(size),
                |mut heap| {
                    heap.apply_aging(|entry| Some(entry.priority * 1.01));
                    black_box(heap.len())
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_insert, bench_drain_top, bench_update_priority, bench_apply_aging);
criterion_main!(benches);
