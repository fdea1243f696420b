//! Performance benchmarks for first-fit subnet allocation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ipalloc::allocator::FirstFitAllocator;
use ipalloc::lock::{InMemoryLeaseBackend, LeaseLockManager};
use ipalloc::store::{AllocationRepository, InMemoryTable};
use ipalloc::{AllocationService, Pool};
use ipnet::Ipv4Net;
use std::sync::Arc;

/// Every /24 of a /16 in order, as committed allocations
fn committed_24s(count: usize) -> Vec<Ipv4Net> {
    let parent: Ipv4Net = "10.0.0.0/16".parse().unwrap();
    parent.subnets(24).unwrap().take(count).collect()
}

/// Benchmark filling a pool one subnet at a time
fn bench_fill_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("first_fit_fill");

    for prefix in [24u8, 26, 28].iter() {
        let count = 1u64 << (*prefix - 16);
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::new("prefix", prefix), prefix, |b, &prefix| {
            b.iter(|| {
                let pool = Pool::parse("bench", "10.0.0.0/16");
                let mut allocator = FirstFitAllocator::new(pool, Vec::new());
                let mut allocated = 0u32;
                while allocator.allocate(prefix).is_ok() {
                    allocated += 1;
                }
                black_box(allocated)
            });
        });
    }

    group.finish();
}

/// Benchmark a single allocation against a mostly full pool
fn bench_fragmented_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("first_fit_fragmented");

    for committed in [16usize, 128, 255].iter() {
        let nets = committed_24s(*committed);
        group.bench_with_input(
            BenchmarkId::new("committed", committed),
            &nets,
            |b, nets| {
                b.iter_batched(
                    || {
                        FirstFitAllocator::new(
                            Pool::parse("bench", "10.0.0.0/16"),
                            nets.iter().copied(),
                        )
                    },
                    |mut allocator| black_box(allocator.allocate(24)),
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

/// Benchmark a locked allocation through the service with in-memory backends
fn bench_service_allocate(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("service_allocate_release", |b| {
        b.to_async(&runtime).iter_batched(
            || {
                let repository =
                    AllocationRepository::new(Arc::new(InMemoryTable::new("allocations")));
                let locks = Arc::new(LeaseLockManager::new(Arc::new(InMemoryLeaseBackend::new())));
                AllocationService::new(repository, locks)
            },
            |service| async move {
                let pool = Pool::parse("bench", "10.0.0.0/16");
                let nets = service.allocate("bench", &pool, &[24, 26, 28]).await.unwrap();
                service.release("bench").await.unwrap();
                black_box(nets)
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_fill_pool,
    bench_fragmented_pool,
    bench_service_allocate
);
criterion_main!(benches);
