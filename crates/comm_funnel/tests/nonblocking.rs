// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg(not(miri))] // The dedicated resource is a real OS thread.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use comm_funnel::{Comm, Completion, Funnel, FunnelConfig, FunnelStats, LocalCluster, LocalFabric, Source};
use comm_funnel_testing::{TEST_TIMEOUT, log_to_stdout};
use tokio::time::{sleep, timeout};

fn start_cluster(size: usize) -> (LocalCluster, Vec<Funnel<LocalFabric>>) {
    let cluster = LocalCluster::new(size);

    let funnels = cluster
        .fabrics()
        .into_iter()
        .enumerate()
        .map(|(rank, fabric)| {
            let config = FunnelConfig::new().with_thread_name(format!("rank{rank}-comm"));
            Funnel::start(config, fabric).unwrap()
        })
        .collect();

    (cluster, funnels)
}

/// Polls until the dedicated thread has registered `count` records.
async fn registered(funnel: &Funnel<LocalFabric>, count: u64) {
    while funnel.stats().records_inserted < count {
        sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test]
async fn concurrent_isends_share_one_poller() {
    let (cluster, mut funnels) = start_cluster(2);
    let sender = Arc::new(funnels.remove(0));
    cluster.pause_completions();

    let tasks: Vec<_> = (0..3_u8)
        .map(|i| {
            let sender = Arc::clone(&sender);
            tokio::spawn(async move { sender.isend(Bytes::from(vec![i]), 1, 0, Comm::WORLD).await })
        })
        .collect();

    timeout(TEST_TIMEOUT, registered(&sender, 3)).await.unwrap();

    let stats = sender.stats();
    assert_eq!(stats.pollers_spawned, 1);
    assert_eq!(stats.outstanding(), 3);
    assert!(tasks.iter().all(|task| !task.is_finished()));

    cluster.resume_completions();

    for task in tasks {
        assert_eq!(timeout(TEST_TIMEOUT, task).await.unwrap().unwrap(), Completion::Sent);
    }

    timeout(TEST_TIMEOUT, sender.quiesce()).await.unwrap();

    let stats = sender.stats();
    assert_eq!(stats.pollers_spawned, 1);
    assert_eq!(stats.pollers_terminated, 1);
    assert_eq!(stats.records_retired, 3);
    assert_eq!(stats.outstanding(), 0);
    assert!(stats.scans >= 2);
}

// Both halves share one single-threaded runtime, so the sender only makes progress if awaiting
// the outstanding receive suspends the task instead of blocking the thread.
#[tokio::test]
async fn awaiting_outstanding_receive_lets_other_tasks_run() {
    let (cluster, funnels) = start_cluster(2);
    let (sender, receiver) = (&funnels[0], &funnels[1]);
    cluster.pause_completions();

    let receive = async {
        receiver.irecv(4, Source::Rank(0), 5, Comm::WORLD).await.into_message().unwrap()
    };

    let progress = async {
        registered(receiver, 1).await;
        sender.send(Bytes::from_static(b"ping"), 1, 5, Comm::WORLD).await;
        cluster.resume_completions();
    };

    let (message, ()) = timeout(TEST_TIMEOUT, async { tokio::join!(receive, progress) }).await.unwrap();

    assert_eq!(&message.data[..], b"ping");
    assert_eq!(message.status.source, 0);
}

#[tokio::test]
async fn receive_completes_only_after_matching_send() {
    let (_cluster, funnels) = start_cluster(2);

    let incoming = funnels[1].irecv(16, Source::Rank(0), 42, Comm::WORLD);

    timeout(TEST_TIMEOUT, registered(&funnels[1], 1)).await.unwrap();
    sleep(Duration::from_millis(20)).await;
    assert!(!incoming.is_ready());

    // Different tag does not match.
    funnels[0].send(Bytes::from_static(b"wrong tag"), 1, 41, Comm::WORLD).await;
    sleep(Duration::from_millis(20)).await;
    assert!(!incoming.is_ready());

    funnels[0].send(Bytes::from_static(b"payload"), 1, 42, Comm::WORLD).await;

    let message = timeout(TEST_TIMEOUT, incoming).await.unwrap().into_message().unwrap();
    assert_eq!(&message.data[..], b"payload");
    assert_eq!(message.status.source, 0);
    assert_eq!(message.status.tag, 42);
    assert_eq!(message.status.len, 7);
}

#[tokio::test]
async fn draining_to_empty_restarts_poller() {
    let (_cluster, funnels) = start_cluster(2);
    let sender = &funnels[0];

    for round in 1..=3 {
        let send = sender.isend(Bytes::from_static(b"x"), 1, round, Comm::WORLD);
        assert_eq!(timeout(TEST_TIMEOUT, send).await.unwrap(), Completion::Sent);

        timeout(TEST_TIMEOUT, sender.quiesce()).await.unwrap();

        let stats = sender.stats();
        let expected = u64::try_from(round).unwrap();
        assert_eq!(stats.pollers_spawned, expected);
        assert_eq!(stats.pollers_terminated, expected);
        assert_eq!(stats.records_retired, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_tasks_exchange_messages() {
    const MESSAGES: i32 = 64;

    log_to_stdout();

    let (cluster, funnels) = start_cluster(2);
    let funnels: Vec<_> = funnels.into_iter().map(Arc::new).collect();

    let receivers: Vec<_> = (0..MESSAGES)
        .map(|tag| {
            let funnel = Arc::clone(&funnels[1]);
            tokio::spawn(async move { funnel.irecv(8, Source::Any, tag, Comm::WORLD).await })
        })
        .collect();

    let senders: Vec<_> = (0..MESSAGES)
        .map(|tag| {
            let funnel = Arc::clone(&funnels[0]);
            tokio::spawn(async move {
                let payload = Bytes::from(tag.to_le_bytes().to_vec());
                funnel.isend(payload, 1, tag, Comm::WORLD).await
            })
        })
        .collect();

    for sender in senders {
        assert_eq!(timeout(TEST_TIMEOUT, sender).await.unwrap().unwrap(), Completion::Sent);
    }

    for (tag, receiver) in (0..MESSAGES).zip(receivers) {
        let message = timeout(TEST_TIMEOUT, receiver).await.unwrap().unwrap().into_message().unwrap();

        assert_eq!(message.status.tag, tag);
        assert_eq!(&message.data[..], &tag.to_le_bytes());
    }

    assert_eq!(cluster.undelivered(), 0);

    for funnel in &funnels {
        timeout(TEST_TIMEOUT, funnel.quiesce()).await.unwrap();

        let stats = funnel.stats();
        assert_eq!(stats.records_inserted, u64::try_from(MESSAGES).unwrap());
        assert_eq!(stats.records_retired, stats.records_inserted);
        assert_eq!(stats.pollers_spawned, stats.pollers_terminated);
        assert_ne!(stats, FunnelStats::default());
    }
}

#[test]
fn blocking_wait_outside_tasks() {
    let (_cluster, funnels) = start_cluster(2);

    let incoming = funnels[1].irecv(4, Source::Any, 0, Comm::WORLD);
    let outgoing = funnels[0].isend(Bytes::from_static(b"sync"), 1, 0, Comm::WORLD);

    assert_eq!(outgoing.wait(), Completion::Sent);
    assert_eq!(&incoming.wait().into_message().unwrap().data[..], b"sync");
}
