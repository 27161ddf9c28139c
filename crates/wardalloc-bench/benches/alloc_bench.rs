//! Allocator benchmarks: alloc/free throughput across default size classes
//! and free-slot cache hit/miss behavior.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use wardalloc_core::Allocator;

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096];
    let mut group = c.benchmark_group("alloc_free_cycle");
    let alloc = Allocator::get();

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("wardalloc", size), &size, |b, &sz| {
            b.iter(|| {
                let p = alloc.alloc(sz);
                criterion::black_box(p);
                alloc.free(p);
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");
    let alloc = Allocator::get();

    group.bench_function("1000x64B", |b| {
        b.iter(|| {
            let ptrs: Vec<*mut u8> = (0..1000).map(|_| alloc.alloc(64)).collect();
            for p in &ptrs {
                criterion::black_box(*p);
            }
            for p in ptrs {
                alloc.free(p);
            }
        });
    });

    group.finish();
}

/// With a warm cache (recently freed slots), a pop is O(1); cold, it falls
/// through to the fast/slow bitmap scans. This benchmark exercises both by
/// comparing a steady alloc/free churn (cache stays warm) against a batch
/// that frees everything only at the very end (cache drains, scans kick in).
fn bench_cache_hit_vs_miss(c: &mut Criterion) {
    let mut group = c.benchmark_group("free_cache_hit_vs_miss");
    let alloc = Allocator::get();

    group.bench_function("warm_cache_churn", |b| {
        b.iter(|| {
            for _ in 0..256 {
                let p = alloc.alloc(128);
                alloc.free(p);
            }
        });
    });

    group.bench_function("cold_cache_batch", |b| {
        b.iter(|| {
            let ptrs: Vec<*mut u8> = (0..256).map(|_| alloc.alloc(128)).collect();
            for p in ptrs {
                alloc.free(p);
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_alloc_free_cycle,
    bench_alloc_burst,
    bench_cache_hit_vs_miss
);
criterion_main!(benches);
