// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The poller: a unit of work on the dedicated resource that drains the pending set.
//!
//! A poller is started only by the inserter that observed the pending set empty. It scans the
//! set, retiring every handle the native library reports complete, and yields the dedicated
//! resource between scans so other units of work keep running. It terminates once one of its
//! own scans removed the last record. The next inserter to find the set empty starts a new,
//! independent poller, so exactly one poller is active whenever the set is non-empty.

use std::sync::Arc;

use tracing::trace;

use crate::funnel::Shared;
use crate::pending::Remaining;
use crate::{Fabric, Operation, yield_now};

pub(crate) async fn run<F: Fabric>(shared: Arc<Shared<F>>) {
    trace!("poller started");

    loop {
        let outcome = shared
            .pending
            .drain_completed(|request| shared.check(Operation::Test, shared.fabric.test(request)));

        shared.counters.scanned(outcome.retired);
        trace!(retired = outcome.retired, "pending set scanned");

        match outcome.remaining {
            Remaining::Empty => break,
            Remaining::Pending => yield_now().await,
        }
    }

    shared.counters.poller_terminated();
    trace!("poller terminated");
}
