// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;

use super::rendezvous::Rendezvous;
use crate::{Comm, Message, NativeError, NativeResult, Rank, Source, Status, Tag};

/// Everything shared by the ranks of a cluster, guarded by one lock.
pub(super) struct ClusterState {
    comms: HashMap<Comm, Vec<Rank>>,
    next_comm: u32,
    ranks: Vec<RankState>,
    next_request: u64,
    paused: bool,
    pub(super) rendezvous: HashMap<(Comm, u64), Rendezvous>,
}

#[derive(Default)]
struct RankState {
    lifecycle: Lifecycle,

    // Messages that arrived before any receive matched them, oldest first.
    mailbox: VecDeque<Envelope>,

    // Non-blocking receives still waiting for a message, in posting order.
    posted: VecDeque<PostedRecv>,

    // Non-blocking receives that have been matched but not yet tested.
    matched: HashMap<u64, NativeResult<Message>>,

    collective_seq: HashMap<Comm, u64>,
    injected: Option<i32>,
    threads: Vec<Option<String>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(super) enum Lifecycle {
    #[default]
    Uninitialized,
    Running,
    Finalized,
}

struct Envelope {
    comm: Comm,
    source: Rank,
    tag: Tag,
    data: Bytes,
}

impl Envelope {
    fn matches(&self, comm: Comm, source: Source, tag: Tag) -> bool {
        self.comm == comm && source.matches(self.source) && self.tag == tag
    }

    fn into_message(self, call: &'static str, capacity: usize) -> NativeResult<Message> {
        if self.data.len() > capacity {
            return Err(NativeError::new(
                call,
                NativeError::ERR_TRUNCATE,
                format!("message of {} bytes does not fit a buffer of {capacity} bytes", self.data.len()),
            ));
        }

        Ok(Message {
            status: Status {
                source: self.source,
                tag: self.tag,
                len: self.data.len(),
            },
            data: self.data,
        })
    }
}

struct PostedRecv {
    id: u64,
    comm: Comm,
    source: Source,
    tag: Tag,
    capacity: usize,
}

impl ClusterState {
    pub(super) fn new(size: usize) -> Self {
        Self {
            comms: HashMap::from([(Comm::WORLD, (0..size).collect())]),
            next_comm: Comm::WORLD.as_raw() + 1,
            ranks: (0..size).map(|_| RankState::default()).collect(),
            next_request: 0,
            paused: false,
            rendezvous: HashMap::new(),
        }
    }

    pub(super) fn world_size(&self) -> usize {
        self.ranks.len()
    }

    pub(super) fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub(super) const fn is_paused(&self) -> bool {
        self.paused
    }

    pub(super) fn inject_failure(&mut self, rank: Rank, code: i32) {
        if let Some(state) = self.ranks.get_mut(rank) {
            state.injected = Some(code);
        }
    }

    pub(super) fn undelivered(&self) -> usize {
        self.ranks.iter().map(|r| r.mailbox.len()).sum()
    }

    pub(super) fn lifecycle(&self, rank: Rank) -> Lifecycle {
        self.ranks[rank].lifecycle
    }

    pub(super) fn set_lifecycle(&mut self, rank: Rank, lifecycle: Lifecycle) {
        self.ranks[rank].lifecycle = lifecycle;
    }

    /// Consumes the failure injected for `rank`, if any.
    pub(super) fn take_injected(&mut self, rank: Rank) -> Option<i32> {
        self.ranks[rank].injected.take()
    }

    pub(super) fn record_thread(&mut self, rank: Rank, name: Option<&str>) {
        let threads = &mut self.ranks[rank].threads;

        if !threads.iter().any(|t| t.as_deref() == name) {
            threads.push(name.map(str::to_string));
        }
    }

    pub(super) fn threads(&self, rank: Rank) -> Vec<Option<String>> {
        self.ranks[rank].threads.clone()
    }

    /// World ranks of the members of `comm`, in communicator rank order.
    pub(super) fn members(&self, call: &'static str, comm: Comm) -> NativeResult<&[Rank]> {
        self.comms
            .get(&comm)
            .map(Vec::as_slice)
            .ok_or_else(|| NativeError::new(call, NativeError::ERR_COMM, format!("{comm} does not exist")))
    }

    /// Rank of world rank `rank` within `comm`.
    pub(super) fn local_rank(&self, call: &'static str, comm: Comm, rank: Rank) -> NativeResult<Rank> {
        self.members(call, comm)?
            .iter()
            .position(|&member| member == rank)
            .ok_or_else(|| NativeError::new(call, NativeError::ERR_COMM, format!("not a member of {comm}")))
    }

    /// World rank of the member with rank `local` within `comm`.
    pub(super) fn world_rank(&self, call: &'static str, comm: Comm, local: Rank) -> NativeResult<Rank> {
        let members = self.members(call, comm)?;

        members.get(local).copied().ok_or_else(|| {
            NativeError::new(
                call,
                NativeError::ERR_RANK,
                format!("rank {local} is outside {comm} of size {}", members.len()),
            )
        })
    }

    pub(super) fn allocate_comm(&mut self, members: Vec<Rank>) -> Comm {
        let comm = Comm::from_raw(self.next_comm);
        self.next_comm += 1;
        self.comms.insert(comm, members);
        comm
    }

    pub(super) fn next_collective(&mut self, rank: Rank, comm: Comm) -> u64 {
        let seq = self.ranks[rank].collective_seq.entry(comm).or_default();
        let current = *seq;
        *seq += 1;
        current
    }

    /// Hands a message to world rank `dest`, matching the oldest suitable posted receive first.
    pub(super) fn deliver(&mut self, dest: Rank, comm: Comm, source: Rank, tag: Tag, data: Bytes) {
        let envelope = Envelope { comm, source, tag, data };
        let target = &mut self.ranks[dest];

        let posted = target.posted.iter().position(|p| envelope.matches(p.comm, p.source, p.tag));

        match posted.and_then(|index| target.posted.remove(index)) {
            Some(recv) => {
                let result = envelope.into_message("irecv", recv.capacity);
                target.matched.insert(recv.id, result);
            }
            None => target.mailbox.push_back(envelope),
        }
    }

    /// Takes the oldest buffered message for world rank `rank` that matches.
    pub(super) fn take_message(
        &mut self,
        call: &'static str,
        rank: Rank,
        comm: Comm,
        source: Source,
        tag: Tag,
        capacity: usize,
    ) -> Option<NativeResult<Message>> {
        let mailbox = &mut self.ranks[rank].mailbox;
        let index = mailbox.iter().position(|e| e.matches(comm, source, tag))?;

        mailbox.remove(index).map(|envelope| envelope.into_message(call, capacity))
    }

    /// Posts a non-blocking receive for world rank `rank` and returns its id.
    pub(super) fn post_recv(&mut self, rank: Rank, comm: Comm, source: Source, tag: Tag, capacity: usize) -> u64 {
        let id = self.next_request;
        self.next_request += 1;

        match self.take_message("irecv", rank, comm, source, tag, capacity) {
            Some(result) => {
                self.ranks[rank].matched.insert(id, result);
            }
            None => self.ranks[rank].posted.push_back(PostedRecv {
                id,
                comm,
                source,
                tag,
                capacity,
            }),
        }

        id
    }

    /// Takes the outcome of a matched non-blocking receive, if it has been matched.
    pub(super) fn take_matched(&mut self, rank: Rank, id: u64) -> Option<NativeResult<Message>> {
        self.ranks[rank].matched.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posted_receive_takes_priority_over_mailbox() {
        let mut state = ClusterState::new(2);

        let id = state.post_recv(1, Comm::WORLD, Source::Any, 3, 16);
        state.deliver(1, Comm::WORLD, 0, 3, Bytes::from_static(b"first"));
        state.deliver(1, Comm::WORLD, 0, 3, Bytes::from_static(b"second"));

        let message = state.take_matched(1, id).unwrap().unwrap();
        assert_eq!(&message.data[..], b"first");
        assert_eq!(state.undelivered(), 1);

        let message = state
            .take_message("recv", 1, Comm::WORLD, Source::Rank(0), 3, 16)
            .unwrap()
            .unwrap();
        assert_eq!(&message.data[..], b"second");
    }

    #[test]
    fn matching_respects_comm_and_tag() {
        let mut state = ClusterState::new(2);
        let other = state.allocate_comm(vec![0, 1]);

        state.deliver(1, other, 0, 3, Bytes::from_static(b"other comm"));
        state.deliver(1, Comm::WORLD, 0, 4, Bytes::from_static(b"other tag"));

        assert!(state.take_message("recv", 1, Comm::WORLD, Source::Any, 3, 16).is_none());
        assert_eq!(state.undelivered(), 2);
    }

    #[test]
    fn truncation_is_reported() {
        let mut state = ClusterState::new(2);
        state.deliver(1, Comm::WORLD, 0, 0, Bytes::from_static(b"too long"));

        let err = state
            .take_message("recv", 1, Comm::WORLD, Source::Any, 0, 2)
            .unwrap()
            .unwrap_err();
        assert_eq!(err.code(), NativeError::ERR_TRUNCATE);
    }

    #[test]
    fn ranks_translate_between_world_and_comm() {
        let mut state = ClusterState::new(4);
        let odd = state.allocate_comm(vec![1, 3]);

        assert_eq!(state.local_rank("comm_rank", odd, 3).unwrap(), 1);
        assert_eq!(state.world_rank("send", odd, 0).unwrap(), 1);
        assert_eq!(state.world_rank("send", odd, 2).unwrap_err().code(), NativeError::ERR_RANK);
        assert_eq!(state.local_rank("comm_rank", odd, 0).unwrap_err().code(), NativeError::ERR_COMM);
    }

    #[test]
    fn collective_sequence_is_per_comm() {
        let mut state = ClusterState::new(1);
        let dup = state.allocate_comm(vec![0]);

        assert_eq!(state.next_collective(0, Comm::WORLD), 0);
        assert_eq!(state.next_collective(0, Comm::WORLD), 1);
        assert_eq!(state.next_collective(0, dup), 0);
    }
}
