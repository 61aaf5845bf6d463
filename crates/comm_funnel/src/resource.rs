// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The dedicated communication resource: the one thread that is allowed to call into the native
//! communication library, running a single-threaded executor for units of work submitted from
//! any thread.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task;
use std::thread::{self, JoinHandle};

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::executor::LocalPool;
use futures::task::SpawnExt;
use futures::{StreamExt, future};
use tracing::{debug, error, warn};

use crate::promise::{self, CommFuture};
use crate::{Result, comm_thread};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Creates the submission queue of a dedicated communication resource.
///
/// Units of work may be submitted through the [`ResourceSpawner`] right away; they start running
/// once the [`JobQueue`] is handed to a thread via [`JobQueue::start()`].
pub(crate) fn queue() -> (ResourceSpawner, JobQueue) {
    let (tx, rx) = mpsc::unbounded();

    (ResourceSpawner { jobs: tx }, JobQueue { jobs: rx })
}

/// Submits units of work to the dedicated communication resource. Cheap to clone, usable from
/// any thread.
#[derive(Clone)]
pub(crate) struct ResourceSpawner {
    jobs: UnboundedSender<Job>,
}

impl ResourceSpawner {
    /// Runs `work` on the dedicated resource and returns a future for its output.
    ///
    /// If the resource has shut down, the work is dropped and the returned future panics when
    /// polled.
    pub(crate) fn spawn<W>(&self, work: W) -> CommFuture<W::Output>
    where
        W: Future + Send + 'static,
        W::Output: Send + 'static,
    {
        let (promise, future) = promise::pair();

        self.spawn_detached(async move {
            promise.fulfill(work.await);
        });

        future
    }

    /// Runs `work` on the dedicated resource without a way to observe its completion.
    pub(crate) fn spawn_detached<W>(&self, work: W)
    where
        W: Future<Output = ()> + Send + 'static,
    {
        if self.jobs.unbounded_send(Box::pin(work)).is_err() {
            warn!("the communication resource has shut down; dropping unit of work");
        }
    }

    /// Stops accepting new work. Work already submitted still runs.
    pub(crate) fn close(&self) {
        self.jobs.close_channel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.jobs.is_closed()
    }
}

impl fmt::Debug for ResourceSpawner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceSpawner").field("is_closed", &self.is_closed()).finish()
    }
}

/// The receiving end of the submission queue, waiting to be bound to a thread.
pub(crate) struct JobQueue {
    jobs: UnboundedReceiver<Job>,
}

impl JobQueue {
    /// Starts the dedicated thread named `name` and runs submitted work on it until the queue is
    /// closed and every unit of work has finished.
    ///
    /// If a unit of work panics, the remaining work is dropped and `on_panic` is called on the
    /// dedicated thread before it exits.
    pub(crate) fn start<P>(self, name: &str, on_panic: P) -> Result<ResourceThread>
    where
        P: FnOnce() + Send + 'static,
    {
        let JobQueue { jobs } = self;

        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            comm_thread::flag_current_thread();
            debug!("communication resource started");

            if panic::catch_unwind(AssertUnwindSafe(|| run(jobs))).is_err() {
                error!("a unit of work panicked on the communication resource; abandoning outstanding work");
                on_panic();
            }

            debug!("communication resource stopped");
        })?;

        Ok(ResourceThread { handle: Some(handle) })
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue").finish_non_exhaustive()
    }
}

fn run(jobs: UnboundedReceiver<Job>) {
    let mut pool = LocalPool::new();
    let spawner = pool.spawner();

    pool.run_until(jobs.for_each(|job| {
        if spawner.spawn(job).is_err() {
            warn!("the communication executor refused a unit of work");
        }

        future::ready(())
    }));

    // The queue is closed but units of work may still be in flight (e.g. a poller).
    pool.run();
}

/// Owns the dedicated thread.
#[derive(Debug)]
pub(crate) struct ResourceThread {
    handle: Option<JoinHandle<()>>,
}

impl ResourceThread {
    /// Waits for the dedicated thread to exit. The queue must have been closed first.
    ///
    /// It is safe to call this function multiple times.
    pub(crate) fn join(&mut self) {
        comm_thread::assert_not_flagged("ResourceThread::join");

        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("the communication thread terminated abnormally");
        }
    }
}

/// Runs `work` as one unit on the dedicated resource and completes once it has finished.
///
/// The awaiting task is suspended for the duration, so the thread it runs on is free to run
/// other tasks while the dedicated resource performs the work.
pub(crate) async fn run_and_wait<W, R>(spawner: &ResourceSpawner, work: W) -> R
where
    W: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    spawner.spawn(async move { work() }).await
}

/// When polled, yields the dedicated communication thread so other units of work can run.
///
/// The first poll schedules the task for another poll and returns pending; the second poll
/// completes.
#[derive(Debug, Default)]
pub struct YieldNow {
    first_poll_completed: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        if self.first_poll_completed {
            task::Poll::Ready(())
        } else {
            self.first_poll_completed = true;
            cx.waker().wake_by_ref();
            task::Poll::Pending
        }
    }
}

/// Cooperatively yields to other units of work on the same executor.
#[must_use]
pub fn yield_now() -> YieldNow {
    YieldNow::default()
}
