// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

/// A call into the communication subsystem or the native library beneath it.
///
/// Used to label instrumentation events, log entries and native failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Operation {
    /// Native library startup.
    Init,
    /// Native library shutdown.
    Finalize,
    /// Non-blocking completion test of an outstanding handle.
    Test,
    /// Rank query.
    CommRank,
    /// Size query.
    CommSize,
    /// Blocking send.
    Send,
    /// Blocking receive.
    Recv,
    /// Non-blocking send.
    Isend,
    /// Non-blocking receive.
    Irecv,
    /// Blocking all-reduce.
    AllReduce,
    /// All-reduce returning a future.
    AllReduceFuture,
    /// Broadcast.
    Broadcast,
    /// Barrier.
    Barrier,
    /// All-gather.
    AllGather,
    /// Reduce to a root.
    Reduce,
    /// Waiting on a sequence of futures.
    WaitAll,
    /// Communicator duplication.
    CommDup,
    /// Communicator split.
    CommSplit,
}

impl Operation {
    /// Stable lower-case label of the operation.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Finalize => "finalize",
            Self::Test => "test",
            Self::CommRank => "comm_rank",
            Self::CommSize => "comm_size",
            Self::Send => "send",
            Self::Recv => "recv",
            Self::Isend => "isend",
            Self::Irecv => "irecv",
            Self::AllReduce => "all_reduce",
            Self::AllReduceFuture => "all_reduce_future",
            Self::Broadcast => "broadcast",
            Self::Barrier => "barrier",
            Self::AllGather => "all_gather",
            Self::Reduce => "reduce",
            Self::WaitAll => "wait_all",
            Self::CommDup => "comm_dup",
            Self::CommSplit => "comm_split",
        }
    }
}

/// Whether an [`OpEvent`] marks entering or leaving an entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// The entry point was called.
    Begin,
    /// The entry point returned.
    End,
}

/// One instrumentation record. Every entry point call produces a `Begin` and an `End` event
/// sharing the same `id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OpEvent {
    /// Unique per call within the subsystem instance.
    pub id: u64,

    /// Which entry point was called.
    pub op: Operation,

    /// Entering or leaving.
    pub phase: Phase,
}

/// Records begin/end event pairs around entry points, or does nothing when disabled.
#[derive(Debug)]
pub(crate) struct Instrumentation {
    log: Option<Mutex<Vec<OpEvent>>>,
    next_id: AtomicU64,
}

impl Instrumentation {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            log: enabled.then(|| Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Records the begin event of `op`; the end event is recorded when the guard is dropped.
    pub(crate) fn begin(&self, op: Operation) -> EventGuard<'_> {
        let Some(log) = &self.log else {
            return EventGuard { span: None };
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(id, op = op.name(), "begin");
        log.lock().push(OpEvent {
            id,
            op,
            phase: Phase::Begin,
        });

        EventGuard { span: Some((log, id, op)) }
    }

    /// A copy of every event recorded so far, in recording order.
    pub(crate) fn events(&self) -> Vec<OpEvent> {
        self.log.as_ref().map_or_else(Vec::new, |log| log.lock().clone())
    }
}

/// Records the end event of an entry point when dropped.
#[derive(Debug)]
#[must_use]
pub(crate) struct EventGuard<'a> {
    span: Option<(&'a Mutex<Vec<OpEvent>>, u64, Operation)>,
}

impl Drop for EventGuard<'_> {
    fn drop(&mut self) {
        if let Some((log, id, op)) = self.span.take() {
            trace!(id, op = op.name(), "end");
            log.lock().push(OpEvent { id, op, phase: Phase::End });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn event(id: u64, op: Operation, phase: Phase) -> OpEvent {
        OpEvent { id, op, phase }
    }

    #[test]
    fn disabled_records_nothing() {
        let instrumentation = Instrumentation::new(false);

        {
            let _event = instrumentation.begin(Operation::Barrier);
        }

        assert!(instrumentation.events().is_empty());
    }

    #[test]
    fn enabled_records_nested_pairs() {
        let instrumentation = Instrumentation::new(true);

        {
            let _outer = instrumentation.begin(Operation::WaitAll);
            let _inner = instrumentation.begin(Operation::Isend);
        }

        let events = instrumentation.events();
        assert_eq!(
            events,
            vec![
                event(0, Operation::WaitAll, Phase::Begin),
                event(1, Operation::Isend, Phase::Begin),
                event(1, Operation::Isend, Phase::End),
                event(0, Operation::WaitAll, Phase::End),
            ]
        );
    }

    #[test]
    fn labels() {
        assert_eq!(Operation::AllReduceFuture.name(), "all_reduce_future");
        assert_eq!(Operation::WaitAll.name(), "wait_all");
        assert_eq!(Operation::Irecv.name(), "irecv");
    }
}
