// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg(not(miri))] // The dedicated resource is a real OS thread.

use std::time::Duration;

use bytes::Bytes;
use comm_funnel::{Comm, Funnel, FunnelConfig, LocalCluster, LocalFabric, ReduceOp, Source};
use comm_funnel_testing::TEST_TIMEOUT;
use futures::future::join_all;
use tokio::time::{sleep, timeout};

fn start_cluster(size: usize) -> (LocalCluster, Vec<Funnel<LocalFabric>>) {
    let cluster = LocalCluster::new(size);

    let funnels = cluster
        .fabrics()
        .into_iter()
        .map(|fabric| Funnel::start(FunnelConfig::new(), fabric).unwrap())
        .collect();

    (cluster, funnels)
}

/// Runs `f` once per rank, all concurrently on the current task, and returns the results in
/// rank order.
async fn on_every_rank<'a, F, Fut>(funnels: &'a [Funnel<LocalFabric>], f: F) -> Vec<Fut::Output>
where
    F: Fn(usize, &'a Funnel<LocalFabric>) -> Fut,
    Fut: Future,
{
    let work = join_all(funnels.iter().enumerate().map(|(rank, funnel)| f(rank, funnel)));

    timeout(TEST_TIMEOUT, work).await.unwrap()
}

// Every rank is driven by the same single-threaded runtime. This only works because a blocked
// collective suspends the calling task instead of blocking the runtime thread.
#[tokio::test]
async fn collectives_do_not_block_the_worker_thread() {
    let (_cluster, funnels) = start_cluster(3);

    let results = on_every_rank(&funnels, |rank, funnel| async move {
        funnel.barrier(Comm::WORLD).await;

        let data = if rank == 1 { b"root data".to_vec() } else { vec![0; 9] };
        funnel.broadcast(data, 1, Comm::WORLD).await
    })
    .await;

    assert!(results.iter().all(|data| data == b"root data"));
}

#[tokio::test]
async fn worker_runs_other_tasks_while_collective_waits() {
    let (_cluster, funnels) = start_cluster(2);

    let early = funnels[0].barrier(Comm::WORLD);
    let bystander = async {
        // Only completes if the runtime thread is free while rank 0 waits in the barrier.
        sleep(Duration::from_millis(20)).await;
        funnels[1].barrier(Comm::WORLD).await;
    };

    timeout(TEST_TIMEOUT, async { tokio::join!(early, bystander) }).await.unwrap();
}

#[tokio::test]
async fn reductions_combine_all_ranks() {
    let (_cluster, funnels) = start_cluster(4);

    let results = on_every_rank(&funnels, |rank, funnel| async move {
        let value = i64::try_from(rank).unwrap();

        let reduced = funnel.reduce(vec![value, 1], ReduceOp::Sum, 2, Comm::WORLD).await;
        let everywhere = funnel.all_reduce(vec![value], ReduceOp::Max, Comm::WORLD).await;
        let product = funnel
            .all_reduce(vec![f64::from(u8::try_from(rank + 1).unwrap())], ReduceOp::Product, Comm::WORLD)
            .await;

        (reduced, everywhere, product)
    })
    .await;

    for (rank, (reduced, everywhere, product)) in results.into_iter().enumerate() {
        if rank == 2 {
            assert_eq!(reduced, Some(vec![6, 4]));
        } else {
            assert_eq!(reduced, None);
        }

        assert_eq!(everywhere, vec![3]);
        assert!((product[0] - 24.0).abs() < f64::EPSILON);
    }
}

#[tokio::test]
async fn all_reduce_future_overlaps_other_work() {
    let (_cluster, funnels) = start_cluster(2);

    // Started right away without awaiting; rank 1 has not entered the collective yet.
    let pending = funnels[0].all_reduce_future(vec![5_u32, 1], ReduceOp::Sum, Comm::WORLD);
    sleep(Duration::from_millis(20)).await;
    assert!(!pending.is_ready());

    let (first, second) = tokio::join!(pending, funnels[1].all_reduce_future(vec![7_u32, 1], ReduceOp::Sum, Comm::WORLD));

    assert_eq!(first, vec![12, 2]);
    assert_eq!(second, vec![12, 2]);
}

#[tokio::test]
async fn all_gather_concatenates_in_rank_order() {
    let (_cluster, funnels) = start_cluster(3);

    let results = on_every_rank(&funnels, |rank, funnel| async move {
        let value = i32::try_from(rank).unwrap();
        funnel.all_gather(vec![value, value * 10], Comm::WORLD).await
    })
    .await;

    for gathered in results {
        assert_eq!(gathered, vec![0, 0, 1, 10, 2, 20]);
    }
}

#[tokio::test]
async fn derived_communicators_isolate_traffic() {
    let (_cluster, funnels) = start_cluster(4);

    let results = on_every_rank(&funnels, |rank, funnel| async move {
        let dup = funnel.comm_dup(Comm::WORLD).await;

        let color = u32::try_from(rank % 2).unwrap();
        let half = funnel.comm_split(dup, Some(color), 0).await.unwrap();

        let sum = funnel.all_reduce(vec![u64::try_from(rank).unwrap()], ReduceOp::Sum, half).await;

        (dup, funnel.rank(half), funnel.size(half), sum)
    })
    .await;

    assert!(results.iter().all(|(dup, ..)| *dup == results[0].0 && *dup != Comm::WORLD));

    let views: Vec<_> = results.iter().map(|(_, rank, size, sum)| (*rank, *size, sum[0])).collect();
    assert_eq!(views, vec![(0, 2, 2), (0, 2, 4), (1, 2, 2), (1, 2, 4)]);
}

#[tokio::test]
async fn opting_out_of_split_yields_no_communicator() {
    let (_cluster, funnels) = start_cluster(2);

    let results = on_every_rank(&funnels, |rank, funnel| async move {
        let color = (rank == 0).then_some(7);
        funnel.comm_split(Comm::WORLD, color, 0).await
    })
    .await;

    assert!(results[0].is_some());
    assert_eq!(results[1], None);
}

#[tokio::test]
async fn wait_all_preserves_order() {
    let (_cluster, funnels) = start_cluster(2);

    let receives: Vec<_> = (0..4).map(|tag| funnels[1].irecv(1, Source::Rank(0), tag, Comm::WORLD)).collect();

    for tag in (0..4).rev() {
        let payload = Bytes::from(vec![u8::try_from(tag).unwrap()]);
        funnels[0].send(payload, 1, tag, Comm::WORLD).await;
    }

    let completions = timeout(TEST_TIMEOUT, funnels[1].wait_all(receives)).await.unwrap();

    let payloads: Vec<u8> = completions.into_iter().map(|c| c.into_message().unwrap().data[0]).collect();
    assert_eq!(payloads, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn blocking_receive_returns_exact_length() {
    let (_cluster, funnels) = start_cluster(2);

    let (_, message) = tokio::join!(
        funnels[0].send(Bytes::from_static(b"abc"), 1, 3, Comm::WORLD),
        funnels[1].recv(64, Source::Any, 3, Comm::WORLD)
    );

    assert_eq!(&message.data[..], b"abc");
    assert_eq!(message.status.len, 3);
    assert_eq!(message.status.source, 0);
}
