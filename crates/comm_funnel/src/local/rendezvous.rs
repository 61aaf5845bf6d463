// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Meeting point of the ranks taking part in one collective call.
//!
//! Each member deposits its contribution and blocks. The last member to arrive combines all
//! contributions into a single outcome, which every member then reads. Outcomes are type-erased
//! because different collectives exchange different data.

use std::any::Any;
use std::mem;
use std::sync::Arc;

use parking_lot::MutexGuard;

use super::ClusterInner;
use super::state::ClusterState;
use crate::{Comm, NativeError, NativeResult, Rank};

type Contribution = Box<dyn Any + Send>;
type Outcome = NativeResult<Arc<dyn Any + Send + Sync>>;

pub(super) struct Rendezvous {
    call: &'static str,
    mismatch: bool,
    contributions: Vec<Option<Contribution>>,
    arrived: usize,
    departed: usize,
    outcome: Option<Outcome>,
}

impl Rendezvous {
    fn new(call: &'static str, members: usize) -> Self {
        Self {
            call,
            mismatch: false,
            contributions: (0..members).map(|_| None).collect(),
            arrived: 0,
            departed: 0,
            outcome: None,
        }
    }
}

/// Takes part in the next collective on `comm` as world rank `rank`, blocking until every member
/// of `comm` has arrived.
///
/// The last member to arrive calls `combine` with the contributions of all members in
/// communicator rank order. Every member receives the combined result.
pub(super) fn collective<C, R, K>(
    cluster: &ClusterInner,
    mut state: MutexGuard<'_, ClusterState>,
    rank: Rank,
    call: &'static str,
    comm: Comm,
    contribution: C,
    combine: K,
) -> NativeResult<Arc<R>>
where
    C: Send + 'static,
    R: Send + Sync + 'static,
    K: FnOnce(&mut ClusterState, &[Rank], Vec<C>) -> NativeResult<R>,
{
    let members = state.members(call, comm)?.to_vec();
    let local = state.local_rank(call, comm, rank)?;
    let key = (comm, state.next_collective(rank, comm));

    let ready = {
        let entry = state
            .rendezvous
            .entry(key)
            .or_insert_with(|| Rendezvous::new(call, members.len()));

        if entry.call != call {
            entry.mismatch = true;
        }

        entry.contributions[local] = Some(Box::new(contribution));
        entry.arrived += 1;

        (entry.arrived == members.len()).then(|| (entry.mismatch, mem::take(&mut entry.contributions)))
    };

    if let Some((mismatch, contributions)) = ready {
        let combined = if mismatch {
            Err(mismatched(call, comm))
        } else {
            downcast_all::<C>(contributions)
                .ok_or_else(|| mismatched(call, comm))
                .and_then(|contributions| combine(&mut *state, &members, contributions))
        };

        if let Some(entry) = state.rendezvous.get_mut(&key) {
            entry.outcome = Some(combined.map(|result| Arc::new(result) as Arc<dyn Any + Send + Sync>));
        }

        cluster.changed.notify_all();
    }

    loop {
        let Some(entry) = state.rendezvous.get_mut(&key) else {
            return Err(NativeError::new(call, NativeError::ERR_OTHER, "collective state lost before every member departed"));
        };

        if let Some(outcome) = entry.outcome.clone() {
            entry.departed += 1;

            if entry.departed == members.len() {
                state.rendezvous.remove(&key);
            }

            return outcome.and_then(|any| any.downcast::<R>().map_err(|_unexpected| mismatched(call, comm)));
        }

        cluster.changed.wait(&mut state);
    }
}

fn downcast_all<C: 'static>(contributions: Vec<Option<Contribution>>) -> Option<Vec<C>> {
    contributions
        .into_iter()
        .map(|contribution| contribution?.downcast::<C>().ok().map(|boxed| *boxed))
        .collect()
}

fn mismatched(call: &'static str, comm: Comm) -> NativeError {
    NativeError::new(
        call,
        NativeError::ERR_MISMATCH,
        format!("members of {comm} entered different collectives"),
    )
}

/// Verifies that every member passed the same value for an argument that must agree.
pub(super) fn agree<T: PartialEq + Copy>(
    call: &'static str,
    code: i32,
    what: &str,
    mut values: impl Iterator<Item = T>,
) -> NativeResult<Option<T>> {
    let Some(first) = values.next() else {
        return Ok(None);
    };

    if values.all(|value| value == first) {
        Ok(Some(first))
    } else {
        Err(NativeError::new(call, code, format!("members disagree on {what}")))
    }
}
