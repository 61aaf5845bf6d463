// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![expect(
    clippy::unwrap_used,
    reason = "it is fine to let our guard down in benchmark/test code"
)]

use std::hint::black_box;

use bytes::Bytes;
use comm_funnel::{Comm, Funnel, FunnelConfig, LocalCluster, LocalFabric, ReduceOp, Source};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use futures::executor::block_on;

fn criterion_benchmark(c: &mut Criterion) {
    group_nonblocking(c);
    group_collective(c);
}

fn start(cluster: &LocalCluster, rank: usize) -> Funnel<LocalFabric> {
    Funnel::start(FunnelConfig::new(), cluster.fabric(rank)).unwrap()
}

/// Measures starting `count` non-blocking sends at once and awaiting all of them, which is
/// dominated by how quickly the poller retires a batch of pending records.
fn group_nonblocking(c: &mut Criterion) {
    let mut group = c.benchmark_group("isend_batch");

    for count in [1_u64, 8, 64] {
        group.throughput(criterion::Throughput::Elements(count));

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, count| {
            let cluster = LocalCluster::new(2);
            let sender = start(&cluster, 0);
            let receiver = start(&cluster, 1);

            b.iter(|| {
                let receives: Vec<_> = (0..*count).map(|_| receiver.irecv(8, Source::Rank(0), 0, Comm::WORLD)).collect();
                let sends: Vec<_> = (0..*count)
                    .map(|_| sender.isend(Bytes::from_static(b"payload"), 1, 0, Comm::WORLD))
                    .collect();

                black_box(block_on(sender.wait_all(sends)));
                black_box(block_on(receiver.wait_all(receives)));
            });
        });
    }

    group.finish();
}

/// Compares a suspended blocking collective with its future-returning variant.
fn group_collective(c: &mut Criterion) {
    let mut group = c.benchmark_group("all_reduce");

    let cluster = LocalCluster::new(1);
    let funnel = start(&cluster, 0);

    group.bench_function("async", |b| {
        b.iter(|| black_box(block_on(funnel.all_reduce(vec![1_i64; 16], ReduceOp::Sum, Comm::WORLD))));
    });

    group.bench_function("future", |b| {
        b.iter(|| black_box(funnel.all_reduce_future(vec![1_i64; 16], ReduceOp::Sum, Comm::WORLD).wait()));
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
