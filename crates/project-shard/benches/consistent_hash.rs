//! Benchmarks for shard extraction and allocation

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use project_shard::{NodeRing, ShardAllocation, ShardExtractor};
use view_core::ProjectRef;

fn bench_shard_for(c: &mut Criterion) {
    let extractor = ShardExtractor::new(100).unwrap();
    let project = ProjectRef::new("bbp", "atlas");

    c.bench_function("shard_for", |b| b.iter(|| extractor.shard_for(&project)));
}

fn bench_owner_of(c: &mut Criterion) {
    let ring = NodeRing::new();
    for i in 0..10 {
        ring.add_node(&format!("node-{}", i));
    }

    c.bench_function("owner_of", |b| b.iter(|| ring.owner_of(42)));
}

fn bench_rebalance(c: &mut Criterion) {
    let mut group = c.benchmark_group("join_rebalance");

    for shard_count in [100u32, 1000, 10000].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(shard_count),
            shard_count,
            |b, &shards| {
                b.iter(|| {
                    let allocation = ShardAllocation::new(shards, 150);
                    allocation.join("node-0");
                    allocation.join("node-1")
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_shard_for, bench_owner_of, bench_rebalance);
criterion_main!(benches);
