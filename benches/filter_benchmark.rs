//! Inventory Performance Benchmarks for Broker
//!
//! This benchmark suite covers the hot paths of inventory handling:
//! - Filter parsing
//! - Filter evaluation over growing inventories
//! - Bounded parallel fan-out overhead
//!
//! Run with: cargo bench --bench filter_benchmark

use broker::inventory::{Filter, HostRecord};
use broker::lifecycle::parallel::run_bounded;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tokio::runtime::Runtime;

// ============================================================================
// Helper Functions
// ============================================================================

/// Build an inventory of `size` hosts across two providers
fn inventory(size: usize) -> Vec<HostRecord> {
    (0..size)
        .map(|i| {
            let provider = if i % 2 == 0 { "AnsibleTower" } else { "Container" };
            HostRecord::new(format!("host{i}.example.com"))
                .with_provider(provider, None)
                .with_attribute("os", json!({"family": "rhel", "version": 8 + i % 3}))
                .with_attribute("tags", json!(["lab", format!("rack{}", i % 10)]))
        })
        .collect()
}

// ============================================================================
// Benchmarks
// ============================================================================

fn bench_parse(c: &mut Criterion) {
    c.bench_function("filter_parse", |b| {
        b.iter(|| {
            Filter::parse(black_box(
                "_broker_provider=AnsibleTower, os.version!=9, hostname{host1, tags<rack",
            ))
        });
    });
}

fn bench_apply(c: &mut Criterion) {
    let filter =
        Filter::parse("_broker_provider=AnsibleTower, os.version!=9, tags=rack4").unwrap();
    let mut group = c.benchmark_group("filter_apply");
    for size in [10usize, 100, 1000] {
        let hosts = inventory(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &hosts, |b, hosts| {
            b.iter(|| filter.apply(black_box(hosts)));
        });
    }
    group.finish();
}

fn bench_run_bounded(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("run_bounded");
    for limit in [1usize, 8, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(limit), &limit, |b, &limit| {
            b.to_async(&runtime).iter(|| async move {
                run_bounded((0..64).collect(), limit, |i: usize| async move { Ok(i * 2) }).await
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_parse, bench_apply, bench_run_bounded);
criterion_main!(benches);
