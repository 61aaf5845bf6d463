// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-process loopback implementation of the native communication library.
//!
//! Every rank of a [`LocalCluster`] lives in the current process and exchanges messages through
//! shared memory. The semantics follow those of common message-passing libraries closely enough
//! to exercise the communication subsystem end to end:
//!
//! * Sends are eager: a message is buffered at the destination as soon as it is sent.
//! * Receives match on communicator, source and tag. Messages between a pair of ranks never
//!   overtake each other, and posted non-blocking receives are matched in posting order before
//!   any later receive.
//! * Collectives rendezvous on a per-communicator sequence number, so every rank must call the
//!   same collectives in the same order. Mismatched collectives and inconsistent arguments are
//!   reported as native errors.
//!
//! The cluster also exposes simulation controls for tests: completions can be paused so that
//! non-blocking operations stay outstanding, and failures can be injected into the next native
//! call of a rank.

mod fabric;
mod rendezvous;
mod state;

use std::fmt;
use std::sync::Arc;

pub use fabric::*;
use parking_lot::{Condvar, Mutex};
use state::ClusterState;

use crate::Rank;

/// A group of ranks living in the current process.
///
/// # Examples
///
/// ```
/// use comm_funnel::{Comm, Fabric, LocalCluster, ThreadLevel};
///
/// let cluster = LocalCluster::new(2);
/// let fabric = cluster.fabric(1);
///
/// fabric.init(ThreadLevel::Funneled).unwrap();
/// assert_eq!(fabric.rank(Comm::WORLD).unwrap(), 1);
/// assert_eq!(fabric.size(Comm::WORLD).unwrap(), 2);
/// ```
#[derive(Clone)]
pub struct LocalCluster {
    inner: Arc<ClusterInner>,
}

pub(crate) struct ClusterInner {
    state: Mutex<ClusterState>,

    // Signalled whenever a message is delivered or a collective completes.
    changed: Condvar,
}

impl LocalCluster {
    /// Creates a cluster of `size` ranks.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero.
    #[must_use]
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "a cluster needs at least one rank");

        Self {
            inner: Arc::new(ClusterInner {
                state: Mutex::new(ClusterState::new(size)),
                changed: Condvar::new(),
            }),
        }
    }

    /// Number of ranks in the cluster.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.state.lock().world_size()
    }

    /// The native library instance of `rank`.
    ///
    /// # Panics
    ///
    /// Panics if `rank` is not part of the cluster.
    #[must_use]
    pub fn fabric(&self, rank: Rank) -> LocalFabric {
        assert!(rank < self.size(), "rank {rank} is not part of a cluster of {}", self.size());

        LocalFabric::new(Arc::clone(&self.inner), rank)
    }

    /// The native library instances of every rank, in rank order.
    #[must_use]
    pub fn fabrics(&self) -> Vec<LocalFabric> {
        (0..self.size()).map(|rank| self.fabric(rank)).collect()
    }

    /// Stops non-blocking operations from completing. Messages are still delivered but every
    /// completion test reports the operation as outstanding until
    /// [`resume_completions()`][Self::resume_completions] is called.
    pub fn pause_completions(&self) {
        self.inner.state.lock().set_paused(true);
    }

    /// Lets non-blocking operations complete again.
    pub fn resume_completions(&self) {
        self.inner.state.lock().set_paused(false);
        self.inner.changed.notify_all();
    }

    /// Makes the next native call on `rank` (other than rank and size queries) fail with `code`.
    pub fn inject_failure(&self, rank: Rank, code: i32) {
        self.inner.state.lock().inject_failure(rank, code);
    }

    /// Number of messages sent but not yet matched by any receive.
    #[must_use]
    pub fn undelivered(&self) -> usize {
        self.inner.state.lock().undelivered()
    }
}

impl fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();

        f.debug_struct("LocalCluster")
            .field("size", &state.world_size())
            .field("undelivered", &state.undelivered())
            .finish_non_exhaustive()
    }
}
