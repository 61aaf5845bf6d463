// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The pending set: outstanding native handles awaiting completion, each paired with the promise
//! that delivers its result.
//!
//! # Structure
//!
//! A singly-linked chain of heap-allocated records reachable from one atomic head pointer.
//! Records are pushed at the head by any number of concurrent inserters and removed from
//! anywhere in the chain by exactly one drainer at a time.
//!
//! # Correctness argument
//!
//! * Insertion is a Treiber-style push: the new record's link is set to the observed head and the
//!   head is swapped to the new record with a compare-and-swap, retrying on contention. The swap
//!   linearizes the insertion. Inserters never read or write any published record, so they can
//!   never corrupt links the drainer is editing.
//! * Exactly one inserter observes a null previous head for each empty to non-empty transition,
//!   because the head can only become null again through the drainer.
//! * Only the drainer writes the link of a published record and only the drainer frees records.
//!   A record's address therefore cannot be reused while the drainer still holds it, which rules
//!   out ABA on the head compare-and-swap.
//! * Removing the first record of the walk races with inserters: the drainer swaps the head from
//!   that record to its successor. If the swap fails, inserters have pushed one or more records in
//!   front of it. They form a chain from the new head that ends at the record being removed, so
//!   the drainer walks from the new head to the record whose link points at it and bypasses it
//!   there. The new head's immediate successor is not necessarily the removed record: any number
//!   of pushes may land between the drainer's read and its swap.
//! * Removing any later record is a plain link bypass because no inserter touches it.
//! * The walk reads a record's successor before testing it, so unlinking and freeing the record
//!   never invalidates the walk.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use tracing::warn;

use crate::promise::Promise;

/// Outstanding handles of type `H`, each completing with a value of type `T`.
#[derive(Debug)]
pub(crate) struct PendingSet<H, T> {
    head: AtomicPtr<Record<H, T>>,

    // Detects concurrent drains, which would violate the single-consumer contract.
    draining: AtomicBool,
}

#[derive(Debug)]
struct Record<H, T> {
    handle: H,
    promise: Promise<T>,
    next: AtomicPtr<Self>,
}

// SAFETY: Records are moved in by inserters and afterwards accessed only by the single drainer,
// so handles and values are sent between threads but never accessed from two threads at once.
unsafe impl<H: Send, T: Send> Send for PendingSet<H, T> {}

// SAFETY: See above. The shared surface is the atomic head and the drain flag.
unsafe impl<H: Send, T: Send> Sync for PendingSet<H, T> {}

/// What one pass of [`PendingSet::drain_completed()`] achieved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DrainOutcome {
    /// How many records were observed complete, unlinked and fulfilled.
    pub(crate) retired: usize,

    /// Whether the set is still non-empty from the drainer's perspective.
    pub(crate) remaining: Remaining,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Remaining {
    /// This pass removed the last record, leaving the head null. The next inserter observes the
    /// empty set and becomes responsible for starting a new drainer.
    Empty,

    /// Records remain; the drainer must come back for them.
    Pending,
}

impl<H, T> PendingSet<H, T> {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            draining: AtomicBool::new(false),
        }
    }

    /// Adds an outstanding handle. Safe to call from any number of threads concurrently.
    ///
    /// Returns `true` if the set was empty before this insertion, in which case the caller is
    /// responsible for starting a drainer.
    pub(crate) fn insert(&self, handle: H, promise: Promise<T>) -> bool {
        let record = Box::into_raw(Box::new(Record {
            handle,
            promise,
            next: AtomicPtr::new(ptr::null_mut()),
        }));

        let mut head = self.head.load(Ordering::Acquire);

        loop {
            // SAFETY: The record is not published until the exchange below succeeds, so nothing
            // else can access it yet.
            let next = unsafe { &(*record).next };
            next.store(head, Ordering::Relaxed);

            // Release publishes the record contents to the drainer that acquires the head.
            match self
                .head
                .compare_exchange_weak(head, record, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(previous) => return previous.is_null(),
                Err(current) => head = current,
            }
        }
    }

    /// Whether the set contains no records at the moment of the call.
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Walks the set once, calling `test` on each outstanding handle. Every handle for which
    /// `test` returns a value is unlinked, its promise fulfilled with that value and its record
    /// released.
    ///
    /// Concurrent [`insert()`][Self::insert] calls are permitted, including from within `test`.
    ///
    /// # Panics
    ///
    /// Panics if called while another drain is in progress.
    pub(crate) fn drain_completed<F>(&self, mut test: F) -> DrainOutcome
    where
        F: FnMut(&mut H) -> Option<T>,
    {
        let _draining = self.enter_drain();

        let mut retired = 0;
        let mut prev: *mut Record<H, T> = ptr::null_mut();
        let mut current = self.head.load(Ordering::Acquire);

        // A drainer only runs while the set is non-empty; a null head here means nothing to do.
        let mut remaining = if current.is_null() {
            Remaining::Empty
        } else {
            Remaining::Pending
        };

        while !current.is_null() {
            // SAFETY: Published records are freed only by the drainer and we are the drainer.
            let next = unsafe { &(*current).next }.load(Ordering::Acquire);

            // SAFETY: As above, and only the drainer accesses the handle of a published record.
            let handle = unsafe { &mut (*current).handle };

            let Some(value) = test(handle) else {
                prev = current;
                current = next;
                continue;
            };

            if prev.is_null() {
                // `current` is the first record we can reach, so it may still be the head.
                match self
                    .head
                    .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        if next.is_null() {
                            remaining = Remaining::Empty;
                        }
                    }
                    Err(new_head) => {
                        let predecessor = Self::predecessor_of(new_head, current);

                        // SAFETY: The predecessor is published and only the drainer writes links
                        // of published records.
                        unsafe { &(*predecessor).next }.store(next, Ordering::Release);

                        prev = predecessor;
                    }
                }
            } else {
                // SAFETY: `prev` is a published record that we have not freed.
                unsafe { &(*prev).next }.store(next, Ordering::Release);
            }

            // SAFETY: The record is unlinked, so we are the only party that can reach it.
            let record = unsafe { Box::from_raw(current) };
            record.promise.fulfill(value);
            retired += 1;

            current = next;
        }

        DrainOutcome { retired, remaining }
    }

    /// Releases every record without fulfilling it, disconnecting the awaiting futures.
    ///
    /// Used when the communication resource has failed and the handles can never be tested.
    /// Returns how many records were abandoned.
    pub(crate) fn abandon(&self) -> usize {
        let _draining = self.enter_drain();

        let mut current = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        let mut count = 0;

        while !current.is_null() {
            // SAFETY: The chain is detached from the head, so nothing else can reach it.
            let record = unsafe { Box::from_raw(current) };
            current = record.next.load(Ordering::Acquire);
            count += 1;
        }

        count
    }

    fn enter_drain(&self) -> impl Drop + '_ {
        let was_draining = self.draining.swap(true, Ordering::Acquire);
        assert!(!was_draining, "the pending set must be drained by at most one poller at a time");

        scopeguard::guard(&self.draining, |draining| {
            draining.store(false, Ordering::Release);
        })
    }

    /// Walks from `start` to the record whose link points at `target`.
    fn predecessor_of(start: *mut Record<H, T>, target: *mut Record<H, T>) -> *mut Record<H, T> {
        let mut node = start;

        loop {
            assert!(!node.is_null(), "a record pushed in front of the removed record must link to it");

            // SAFETY: Every record reachable from the head is alive until the drainer frees it.
            let next = unsafe { &(*node).next }.load(Ordering::Acquire);

            if next == target {
                return node;
            }

            node = next;
        }
    }
}

impl<H, T> Drop for PendingSet<H, T> {
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        let mut leaked = 0_usize;

        while !current.is_null() {
            // SAFETY: We have exclusive access to the set and the chain it owns.
            let mut record = unsafe { Box::from_raw(current) };
            current = *record.next.get_mut();
            leaked += 1;
        }

        if leaked > 0 {
            warn!(leaked, "pending set dropped with outstanding operations; their futures are disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::task;
    use std::thread;

    use futures::FutureExt;
    use futures::task::noop_waker_ref;
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::promise::{self, CommFuture};

    assert_impl_all!(PendingSet<u32, Vec<u8>>: Send, Sync);

    fn insert(set: &PendingSet<u32, u32>, id: u32) -> (bool, CommFuture<u32>) {
        let (promise, future) = promise::pair();
        (set.insert(id, promise), future)
    }

    /// Handles currently in the set, head first.
    fn census(set: &PendingSet<u32, u32>) -> Vec<u32> {
        let mut seen = Vec::new();
        let outcome = set.drain_completed(|id| {
            seen.push(*id);
            None
        });
        assert_eq!(outcome.retired, 0);
        seen
    }

    fn poll_now(future: &mut CommFuture<u32>) -> task::Poll<u32> {
        future.poll_unpin(&mut task::Context::from_waker(noop_waker_ref()))
    }

    #[test]
    fn first_insert_signals_empty_transition() {
        let set = PendingSet::new();

        assert!(set.is_empty());
        assert!(insert(&set, 1).0);
        assert!(!insert(&set, 2).0);
        assert!(!insert(&set, 3).0);
        assert!(!set.is_empty());

        assert_eq!(census(&set), vec![3, 2, 1]);
    }

    #[test]
    fn drain_retires_only_completed() {
        let set = PendingSet::new();
        let (_, mut one) = insert(&set, 1);
        let (_, mut two) = insert(&set, 2);
        let (_, mut three) = insert(&set, 3);

        let outcome = set.drain_completed(|id| (*id != 2).then_some(*id * 10));

        assert_eq!(
            outcome,
            DrainOutcome {
                retired: 2,
                remaining: Remaining::Pending
            }
        );
        assert_eq!(poll_now(&mut one), task::Poll::Ready(10));
        assert_eq!(poll_now(&mut three), task::Poll::Ready(30));
        assert_eq!(poll_now(&mut two), task::Poll::Pending);
        assert_eq!(census(&set), vec![2]);

        let outcome = set.drain_completed(|id| Some(*id * 10));

        assert_eq!(
            outcome,
            DrainOutcome {
                retired: 1,
                remaining: Remaining::Empty
            }
        );
        assert_eq!(poll_now(&mut two), task::Poll::Ready(20));
        assert!(set.is_empty());
    }

    #[test]
    fn tail_removal_keeps_head() {
        let set = PendingSet::new();
        let (_, _one) = insert(&set, 1);
        let (_, _two) = insert(&set, 2);

        let outcome = set.drain_completed(|id| (*id == 1).then_some(0));

        assert_eq!(outcome.retired, 1);
        assert_eq!(outcome.remaining, Remaining::Pending);
        assert_eq!(census(&set), vec![2]);
    }

    #[test]
    fn insert_after_drain_to_empty_signals_again() {
        let set = PendingSet::new();

        assert!(insert(&set, 1).0);
        assert_eq!(set.drain_completed(|_| Some(0)).remaining, Remaining::Empty);

        let (signal, mut future) = insert(&set, 2);
        assert!(signal);

        assert_eq!(set.drain_completed(|_| Some(7)).remaining, Remaining::Empty);
        assert_eq!(poll_now(&mut future), task::Poll::Ready(7));
    }

    #[test]
    fn head_race_repairs_link_behind_multiple_pushes() {
        let set = PendingSet::new();
        let (_, mut first) = insert(&set, 1);
        let mut late = Vec::new();

        // While the drainer is testing the head, two inserters push in front of it. The new
        // head's immediate successor is then another new record, not the one being removed.
        let outcome = set.drain_completed(|id| {
            if *id == 1 {
                late.push(insert(&set, 2).1);
                late.push(insert(&set, 3).1);
                Some(100)
            } else {
                None
            }
        });

        assert_eq!(outcome.retired, 1);
        assert_eq!(outcome.remaining, Remaining::Pending);
        assert_eq!(poll_now(&mut first), task::Poll::Ready(100));
        assert_eq!(census(&set), vec![3, 2]);

        // The repaired chain keeps draining correctly, head and tail alike.
        assert_eq!(set.drain_completed(|id| (*id == 2).then_some(2)).retired, 1);
        assert_eq!(census(&set), vec![3]);
        assert_eq!(set.drain_completed(|_| Some(3)).remaining, Remaining::Empty);

        let values: Vec<_> = late.iter_mut().map(poll_now).collect();
        assert_eq!(values, vec![task::Poll::Ready(2), task::Poll::Ready(3)]);
    }

    #[test]
    fn head_race_with_single_push() {
        let set = PendingSet::new();
        let (_, _first) = insert(&set, 1);
        let (_, _second) = insert(&set, 2);
        let mut late = Vec::new();

        // Record 2 is the head, record 1 its successor; complete both while pushing once.
        let outcome = set.drain_completed(|id| {
            if *id == 2 {
                late.push(insert(&set, 3).1);
            }
            (*id != 3).then_some(0)
        });

        assert_eq!(outcome.retired, 2);
        assert_eq!(late.len(), 1);
        assert_eq!(census(&set), vec![3]);
    }

    #[test]
    fn concurrent_inserts_on_empty_signal_exactly_once() {
        const INSERTERS: u32 = 8;

        for _ in 0..50 {
            let set = PendingSet::new();
            let barrier = Barrier::new(INSERTERS as usize);
            let signals = AtomicUsize::new(0);

            let futures: Vec<_> = thread::scope(|s| {
                let handles: Vec<_> = (0..INSERTERS)
                    .map(|id| {
                        let set = &set;
                        let barrier = &barrier;
                        let signals = &signals;
                        s.spawn(move || {
                            barrier.wait();
                            let (signal, future) = insert(set, id);
                            if signal {
                                signals.fetch_add(1, Ordering::Relaxed);
                            }
                            future
                        })
                    })
                    .collect();

                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            assert_eq!(signals.load(Ordering::Relaxed), 1);

            let seen: HashSet<_> = census(&set).into_iter().collect();
            assert_eq!(seen, (0..INSERTERS).collect());

            assert_eq!(set.drain_completed(|id| Some(*id)).retired, INSERTERS as usize);
            for (id, mut future) in (0..INSERTERS).zip(futures) {
                assert_eq!(poll_now(&mut future), task::Poll::Ready(id));
            }
        }
    }

    #[test]
    fn inserts_during_drain_are_never_lost() {
        const INSERTERS: u32 = 4;
        const PER_INSERTER: u32 = 500;
        const TOTAL: u32 = INSERTERS * PER_INSERTER;

        let set = PendingSet::new();
        let inserting_done = AtomicBool::new(false);
        let retired = AtomicUsize::new(0);

        let futures: Vec<(u32, CommFuture<u32>)> = thread::scope(|s| {
            // The drainer retires even handles eagerly and odd handles only once every inserter
            // is finished, so removals from the middle and the head race with pushes.
            let drainer = s.spawn(|| {
                loop {
                    let done = inserting_done.load(Ordering::Acquire);
                    let outcome = set.drain_completed(|id| (done || *id % 2 == 0).then_some(*id));
                    retired.fetch_add(outcome.retired, Ordering::Relaxed);

                    if done && set.is_empty() {
                        break;
                    }
                    thread::yield_now();
                }
            });

            let inserters: Vec<_> = (0..INSERTERS)
                .map(|t| {
                    let set = &set;
                    s.spawn(move || {
                        (0..PER_INSERTER)
                            .map(|i| {
                                let id = t * PER_INSERTER + i;
                                (id, insert(set, id).1)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            let futures = inserters.into_iter().flat_map(|h| h.join().unwrap()).collect();

            inserting_done.store(true, Ordering::Release);
            drainer.join().unwrap();

            futures
        });

        assert_eq!(retired.load(Ordering::Relaxed), TOTAL as usize);
        assert!(set.is_empty());

        for (id, mut future) in futures {
            assert_eq!(poll_now(&mut future), task::Poll::Ready(id));
        }
    }

    #[test]
    #[should_panic]
    fn abandon_disconnects_futures() {
        let set = PendingSet::new();
        let (_, mut future) = insert(&set, 1);
        let (_, _other) = insert(&set, 2);

        assert_eq!(set.abandon(), 2);
        assert!(set.is_empty());

        _ = poll_now(&mut future);
    }

    #[test]
    #[should_panic]
    fn drop_with_records_disconnects_futures() {
        let set = PendingSet::new();
        let (_, mut future) = insert(&set, 1);

        drop(set);

        _ = poll_now(&mut future);
    }

    #[test]
    #[should_panic]
    fn nested_drain_is_rejected() {
        let set = PendingSet::new();
        let (_, _future) = insert(&set, 1);

        set.drain_completed(|_| {
            set.drain_completed(|_| None);
            None
        });
    }
}
