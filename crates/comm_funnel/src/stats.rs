// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::atomic::{AtomicU64, Ordering};

/// A point-in-time snapshot of completion-tracking activity, as returned by
/// [`Funnel::stats()`][crate::Funnel::stats].
///
/// Counters only ever increase. Once all outstanding operations have completed and the poller
/// has observed that, `pollers_spawned == pollers_terminated` and
/// `records_inserted == records_retired`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct FunnelStats {
    /// How many poller lifecycles have started.
    pub pollers_spawned: u64,

    /// How many poller lifecycles have ended because the pending set became empty.
    pub pollers_terminated: u64,

    /// How many non-blocking operations have been registered for completion tracking.
    pub records_inserted: u64,

    /// How many registered operations have been observed complete and fulfilled.
    pub records_retired: u64,

    /// How many full walks over the pending set the pollers have made.
    pub scans: u64,
}

impl FunnelStats {
    /// Number of operations registered but not yet retired.
    #[must_use]
    pub const fn outstanding(&self) -> u64 {
        self.records_inserted.saturating_sub(self.records_retired)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pollers_spawned: AtomicU64,
    pollers_terminated: AtomicU64,
    records_inserted: AtomicU64,
    records_retired: AtomicU64,
    scans: AtomicU64,
}

// Updates release and snapshots acquire, so a snapshot that observes a count also observes every
// count the dedicated thread updated before it.
impl Counters {
    pub(crate) fn poller_spawned(&self) {
        self.pollers_spawned.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn poller_terminated(&self) {
        self.pollers_terminated.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn record_inserted(&self) {
        self.records_inserted.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn scanned(&self, retired: usize) {
        self.scans.fetch_add(1, Ordering::Release);
        self.records_retired.fetch_add(retired as u64, Ordering::Release);
    }

    pub(crate) fn snapshot(&self) -> FunnelStats {
        FunnelStats {
            pollers_spawned: self.pollers_spawned.load(Ordering::Acquire),
            pollers_terminated: self.pollers_terminated.load(Ordering::Acquire),
            records_inserted: self.records_inserted.load(Ordering::Acquire),
            records_retired: self.records_retired.load(Ordering::Acquire),
            scans: self.scans.load(Ordering::Acquire),
        }
    }
}
