//! Latency of the multi-level cache's read-through `get`/`set` path across
//! tiers (spec.md §4.3's "latency per tier" target), and of dependency-graph
//! fan-out invalidation at a representative edge count.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use l2_engine::cache::{CacheConfig, MultiLevelCache, SetOptions, ShardedBackend, SledBackend};
use l2_engine::config::PrefetchConfig;

fn cache() -> MultiLevelCache {
    MultiLevelCache::new(
        CacheConfig::default(),
        Arc::new(SledBackend::new_temp()),
        Arc::new(ShardedBackend::new(8)),
        PrefetchConfig::default(),
    )
}

fn bench_set_l1_hit_get(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = cache();
    rt.block_on(cache.set("warm", &"value".to_string(), SetOptions::default())).unwrap();

    c.bench_function("cache_get_l1_hit", |b| {
        b.to_async(&rt).iter(|| async {
            let (value, level): (Option<String>, _) = cache.get("warm").await;
            black_box((value, level))
        });
    });
}

fn bench_set(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = cache();
    let mut i = 0u64;

    c.bench_function("cache_set", |b| {
        b.to_async(&rt).iter(|| {
            i += 1;
            let key = format!("key-{i}");
            async {
                cache.set(&key, &"value".to_string(), SetOptions::default()).await.unwrap();
            }
        });
    });
}

fn bench_invalidate_dependents(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_invalidate_dependents");
    for fanout in [10usize, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(fanout), &fanout, |b, &fanout| {
            let rt = tokio::runtime::Runtime::new().unwrap();
            b.to_async(&rt).iter_batched(
                || {
                    let cache = cache();
                    rt.block_on(async {
                        cache.set("root", &"root-value".to_string(), SetOptions::default()).await.unwrap();
                        for i in 0..fanout {
                            cache
                                .set(
                                    &format!("dependent-{i}"),
                                    &"value".to_string(),
                                    SetOptions { ttl_override_secs: None, dependencies: vec!["root".to_string()] },
                                )
                                .await
                                .unwrap();
                        }
                    });
                    cache
                },
                |cache| async move {
                    black_box(cache.invalidate_dependents("root").await);
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_set_l1_hit_get, bench_set, bench_invalidate_dependents);
criterion_main!(benches);
