// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use bytes::Bytes;
use tracing::{debug, error, trace};

use crate::error::fail;
use crate::instrument::Instrumentation;
use crate::pending::PendingSet;
use crate::promise::{self, CommFuture, Promise};
use crate::resource::{self, ResourceSpawner, ResourceThread};
use crate::stats::Counters;
use crate::{
    Comm, CommModule, Completion, Element, Error, Fabric, FunnelConfig, FunnelStats, Locale, Message, NativeResult,
    OpEvent, Operation, Rank, ReduceOp, Result, Source, Tag, ThreadLevel, Topology, poller, yield_now,
};

/// Subsystem state shared between the handle, the units of work on the dedicated resource and
/// the poller.
pub(crate) struct Shared<F: Fabric> {
    pub(crate) fabric: F,
    pub(crate) pending: PendingSet<F::Request, Completion>,
    pub(crate) spawner: ResourceSpawner,
    pub(crate) counters: Counters,
    config: FunnelConfig,
    instrumentation: Instrumentation,
    locale: Locale,

    // Set once the dedicated resource has failed; nothing submitted afterwards can run.
    crashed: AtomicBool,
}

impl<F: Fabric> Shared<F> {
    /// Unwraps the result of a native call, treating failure as fatal.
    pub(crate) fn check<T>(&self, op: Operation, result: NativeResult<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => fail(self.config.native_error_action(), op, &err),
        }
    }

    /// Tracks a started non-blocking operation until the native library reports it complete.
    fn register(self: &Arc<Self>, request: F::Request, promise: Promise<Completion>) {
        // Counted first so the retired count can never overtake the inserted count.
        self.counters.record_inserted();

        if self.pending.insert(request, promise) {
            trace!("pending set became non-empty; starting poller");
            self.counters.poller_spawned();
            self.spawner.spawn_detached(poller::run(Arc::clone(self)));
        }
    }

    /// Completes once the pending set is empty, yielding the dedicated resource meanwhile.
    async fn drained(&self) {
        while !self.pending.is_empty() {
            yield_now().await;
        }
    }
}

/// A running communication subsystem: the dedicated communication resource plus the
/// completion-tracking engine, bound to one native library instance.
///
/// Every operation is funneled onto the dedicated thread. Non-blocking operations return a
/// [`CommFuture`] right away; logically blocking operations are `async` and suspend the calling
/// task (never its thread) until the dedicated thread has performed them.
///
/// A `Funnel` is created by [`CommModule::post_initialize()`] or [`Funnel::start()`] and shut
/// down by [`finalize()`][Self::finalize] or by dropping it.
///
/// # Native failures
///
/// Any native call that fails is fatal, handled according to
/// [`FunnelConfig::with_native_error_action()`]. No method returns a native error.
pub struct Funnel<F: Fabric> {
    shared: Arc<Shared<F>>,
    thread: ResourceThread,
    finalized: bool,
}

impl<F: Fabric> Funnel<F> {
    /// Starts the subsystem on a single-node topology, running the whole module lifecycle.
    ///
    /// # Errors
    ///
    /// Fails if the dedicated thread cannot be started or the native library cannot provide
    /// funneled thread support.
    pub fn start(config: FunnelConfig, fabric: F) -> Result<Self> {
        let mut topology = Topology::single_node();
        let mut module = CommModule::new(config);

        module.pre_initialize(&mut topology);
        module.post_initialize(&mut topology, fabric)
    }

    /// Starts the dedicated resource bound to `locale` and initializes the native library on it.
    pub(crate) fn launch(config: FunnelConfig, fabric: F, locale: Locale) -> Result<Self> {
        let (spawner, queue) = resource::queue();
        let thread_name = config.thread_name().to_string();

        let shared = Arc::new(Shared {
            fabric,
            pending: PendingSet::new(),
            spawner,
            counters: Counters::default(),
            instrumentation: Instrumentation::new(config.instrumentation()),
            config,
            locale,
            crashed: AtomicBool::new(false),
        });

        let mut thread = queue.start(&thread_name, abandon_on_panic(Arc::downgrade(&shared)))?;

        let provided = shared
            .spawner
            .spawn({
                let shared = Arc::clone(&shared);
                async move { shared.check(Operation::Init, shared.fabric.init(ThreadLevel::Funneled)) }
            })
            .wait();

        if provided < ThreadLevel::Funneled {
            // The library did initialize, so it is shut down again on the thread that owns it.
            let owner = Arc::clone(&shared);
            shared
                .spawner
                .spawn(async move { owner.check(Operation::Finalize, owner.fabric.finalize()) })
                .wait();

            shared.spawner.close();
            thread.join();

            return Err(Error::ThreadLevel {
                required: ThreadLevel::Funneled,
                provided,
            });
        }

        debug!(thread = %thread_name, ?provided, locale = shared.locale.name(), "communication subsystem started");

        Ok(Self {
            shared,
            thread,
            finalized: false,
        })
    }

    /// Starts sending `data` to `dest` and returns a future that resolves to
    /// [`Completion::Sent`] once the native library no longer needs the buffer.
    pub fn isend(&self, data: Bytes, dest: Rank, tag: Tag, comm: Comm) -> CommFuture<Completion> {
        let _event = self.shared.instrumentation.begin(Operation::Isend);

        self.initiate(Operation::Isend, move |fabric| fabric.isend(data, dest, tag, comm))
    }

    /// Starts receiving a message of at most `capacity` bytes and returns a future that resolves
    /// to [`Completion::Received`] once a matching message has arrived.
    pub fn irecv(&self, capacity: usize, source: Source, tag: Tag, comm: Comm) -> CommFuture<Completion> {
        let _event = self.shared.instrumentation.begin(Operation::Irecv);

        self.initiate(Operation::Irecv, move |fabric| fabric.irecv(capacity, source, tag, comm))
    }

    /// Sends `data` to `dest`, suspending the calling task until the buffer may be reused.
    pub async fn send(&self, data: Bytes, dest: Rank, tag: Tag, comm: Comm) {
        let _event = self.shared.instrumentation.begin(Operation::Send);

        self.blocking_call(move |shared| shared.check(Operation::Send, shared.fabric.send(&data, dest, tag, comm)))
            .await;
    }

    /// Receives a message of at most `capacity` bytes, suspending the calling task until one
    /// arrives.
    pub async fn recv(&self, capacity: usize, source: Source, tag: Tag, comm: Comm) -> Message {
        let _event = self.shared.instrumentation.begin(Operation::Recv);

        self.blocking_call(move |shared| {
            let mut buf = vec![0; capacity];
            let status = shared.check(Operation::Recv, shared.fabric.recv(&mut buf, source, tag, comm));
            buf.truncate(status.len);

            Message {
                data: Bytes::from(buf),
                status,
            }
        })
        .await
    }

    /// Suspends the calling task until every rank of `comm` has entered the barrier.
    pub async fn barrier(&self, comm: Comm) {
        let _event = self.shared.instrumentation.begin(Operation::Barrier);

        self.blocking_call(move |shared| shared.check(Operation::Barrier, shared.fabric.barrier(comm)))
            .await;
    }

    /// Broadcasts `data` from `root` to every rank of `comm`.
    ///
    /// Every rank passes a buffer of the same length; the root's contents are returned on all
    /// ranks.
    pub async fn broadcast(&self, data: Vec<u8>, root: Rank, comm: Comm) -> Vec<u8> {
        let _event = self.shared.instrumentation.begin(Operation::Broadcast);

        self.blocking_call(move |shared| {
            let mut buf = data;
            shared.check(Operation::Broadcast, shared.fabric.broadcast(&mut buf, root, comm));
            buf
        })
        .await
    }

    /// Combines `data` from every rank of `comm` element-wise with `op`.
    ///
    /// Returns the combined values on `root` and `None` on every other rank.
    pub async fn reduce<T: Element>(&self, data: Vec<T>, op: ReduceOp, root: Rank, comm: Comm) -> Option<Vec<T>> {
        let _event = self.shared.instrumentation.begin(Operation::Reduce);

        self.blocking_call(move |shared| {
            let mut result = vec![T::default(); data.len()];
            shared.check(Operation::Reduce, shared.fabric.reduce(&data, &mut result, op, root, comm));

            let rank = shared.check(Operation::CommRank, shared.fabric.rank(comm));
            (rank == root).then_some(result)
        })
        .await
    }

    /// Combines `data` from every rank of `comm` element-wise with `op`, returning the combined
    /// values on every rank.
    pub async fn all_reduce<T: Element>(&self, data: Vec<T>, op: ReduceOp, comm: Comm) -> Vec<T> {
        let _event = self.shared.instrumentation.begin(Operation::AllReduce);

        self.blocking_call(move |shared| all_reduce_on(shared, Operation::AllReduce, &data, op, comm))
            .await
    }

    /// Like [`all_reduce()`][Self::all_reduce] but returns a future immediately, so the caller
    /// can overlap the collective with other work.
    pub fn all_reduce_future<T: Element>(&self, data: Vec<T>, op: ReduceOp, comm: Comm) -> CommFuture<Vec<T>> {
        let _event = self.shared.instrumentation.begin(Operation::AllReduceFuture);

        let shared = Arc::clone(&self.shared);
        self.shared
            .spawner
            .spawn(async move { all_reduce_on(&shared, Operation::AllReduceFuture, &data, op, comm) })
    }

    /// Concatenates `data` from every rank of `comm` in rank order, returning the result on
    /// every rank. Every rank must contribute the same number of elements.
    pub async fn all_gather<T: Element>(&self, data: Vec<T>, comm: Comm) -> Vec<T> {
        let _event = self.shared.instrumentation.begin(Operation::AllGather);

        self.blocking_call(move |shared| {
            let size = shared.check(Operation::CommSize, shared.fabric.size(comm));
            let mut result = vec![T::default(); data.len() * size];
            shared.check(Operation::AllGather, shared.fabric.all_gather(&data, &mut result, comm));
            result
        })
        .await
    }

    /// Collectively creates a communicator with the same ranks as `comm` but a separate message
    /// space.
    pub async fn comm_dup(&self, comm: Comm) -> Comm {
        let _event = self.shared.instrumentation.begin(Operation::CommDup);

        self.blocking_call(move |shared| shared.check(Operation::CommDup, shared.fabric.comm_dup(comm)))
            .await
    }

    /// Collectively partitions `comm` into one communicator per `color`, ranked by `key`.
    ///
    /// Ranks passing `None` join no communicator and receive `None`.
    pub async fn comm_split(&self, comm: Comm, color: Option<u32>, key: i32) -> Option<Comm> {
        let _event = self.shared.instrumentation.begin(Operation::CommSplit);

        self.blocking_call(move |shared| shared.check(Operation::CommSplit, shared.fabric.comm_split(comm, color, key)))
            .await
    }

    /// Waits for every future in `futures`, one after another, and returns their results in the
    /// same order.
    pub async fn wait_all<T, I>(&self, futures: I) -> Vec<T>
    where
        I: IntoIterator<Item = CommFuture<T>>,
    {
        let _event = self.shared.instrumentation.begin(Operation::WaitAll);

        let mut results = Vec::new();
        for future in futures {
            results.push(future.await);
        }

        results
    }

    /// Rank of this process within `comm`.
    ///
    /// Answered by the native library directly on the calling thread.
    #[must_use]
    pub fn rank(&self, comm: Comm) -> Rank {
        self.shared.check(Operation::CommRank, self.shared.fabric.rank(comm))
    }

    /// Number of ranks in `comm`.
    ///
    /// Answered by the native library directly on the calling thread.
    #[must_use]
    pub fn size(&self, comm: Comm) -> usize {
        self.shared.check(Operation::CommSize, self.shared.fabric.size(comm))
    }

    /// Completes once every operation registered so far has been retired and its poller has
    /// stopped.
    pub async fn quiesce(&self) {
        let shared = Arc::clone(&self.shared);

        self.shared.spawner.spawn(async move { shared.drained().await }).await;
    }

    /// A snapshot of the completion-tracking counters.
    ///
    /// Counters are updated on the dedicated thread; await [`quiesce()`][Self::quiesce] first
    /// for a snapshot in which every poller has observed its last completion.
    #[must_use]
    pub fn stats(&self) -> FunnelStats {
        self.shared.counters.snapshot()
    }

    /// Every instrumentation event recorded so far. Empty unless instrumentation is enabled.
    #[must_use]
    pub fn events(&self) -> Vec<OpEvent> {
        self.shared.instrumentation.events()
    }

    /// The dedicated locale this subsystem is bound to.
    #[must_use]
    pub fn locale(&self) -> &Locale {
        &self.shared.locale
    }

    /// The configuration this subsystem was started with.
    #[must_use]
    pub fn config(&self) -> &FunnelConfig {
        &self.shared.config
    }

    /// The native library instance this subsystem funnels calls into.
    #[must_use]
    pub fn fabric(&self) -> &F {
        &self.shared.fabric
    }

    /// Waits for every outstanding operation to complete, shuts down the native library on the
    /// dedicated thread and stops the thread. Returns the final counters.
    ///
    /// # Panics
    ///
    /// Panics if called on the dedicated thread, or if the dedicated resource failed while
    /// operations were outstanding.
    pub fn finalize(mut self) -> FunnelStats {
        self.shut_down();
        self.shared.counters.snapshot()
    }

    fn shut_down(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        if thread::panicking() {
            // The dedicated thread may be stuck waiting on peers that will never arrive.
            self.shared.spawner.close();
            return;
        }

        if !self.shared.crashed.load(Ordering::Acquire) {
            let shared = Arc::clone(&self.shared);

            self.shared
                .spawner
                .spawn(async move {
                    shared.drained().await;
                    shared.check(Operation::Finalize, shared.fabric.finalize());
                })
                .wait();
        }

        self.shared.spawner.close();
        self.thread.join();

        debug!("communication subsystem finalized");
    }

    fn initiate<S>(&self, op: Operation, start: S) -> CommFuture<Completion>
    where
        S: FnOnce(&F) -> NativeResult<F::Request> + Send + 'static,
    {
        let (promise, future) = promise::pair();
        let shared = Arc::clone(&self.shared);

        self.shared.spawner.spawn_detached(async move {
            let request = shared.check(op, start(&shared.fabric));
            shared.register(request, promise);
        });

        future
    }

    async fn blocking_call<W, R>(&self, work: W) -> R
    where
        W: FnOnce(&Shared<F>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let shared = Arc::clone(&self.shared);

        resource::run_and_wait(&self.shared.spawner, move || work(&shared)).await
    }
}

fn all_reduce_on<F: Fabric, T: Element>(shared: &Shared<F>, op: Operation, data: &[T], reduce: ReduceOp, comm: Comm) -> Vec<T> {
    let mut result = vec![T::default(); data.len()];
    shared.check(op, shared.fabric.all_reduce(data, &mut result, reduce, comm));
    result
}

/// Cleans up after a unit of work panicked on the dedicated resource: stops accepting work and
/// releases every pending record so that tasks awaiting them fail instead of hanging.
fn abandon_on_panic<F: Fabric>(shared: Weak<Shared<F>>) -> impl FnOnce() + Send + 'static {
    move || {
        let Some(shared) = shared.upgrade() else {
            return;
        };

        shared.crashed.store(true, Ordering::Release);
        shared.spawner.close();

        let abandoned = shared.pending.abandon();
        error!(abandoned, "communication resource failed; outstanding operations abandoned");
    }
}

impl<F: Fabric> Drop for Funnel<F> {
    fn drop(&mut self) {
        self.shut_down();
    }
}

impl<F: Fabric> fmt::Debug for Funnel<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Funnel")
            .field("locale", &self.shared.locale)
            .field("stats", &self.stats())
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}
