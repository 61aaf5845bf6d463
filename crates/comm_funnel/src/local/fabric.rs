// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use parking_lot::MutexGuard;

use super::ClusterInner;
use super::rendezvous::{agree, collective};
use super::state::{ClusterState, Lifecycle};
use crate::native::reduce_all;
use crate::{
    Comm, Completion, Element, Fabric, NativeError, NativeResult, Rank, ReduceOp, Source, Status, Tag, ThreadLevel,
};

/// The native library instance of one rank of a [`LocalCluster`][super::LocalCluster].
///
/// Clones refer to the same rank and share its state.
#[derive(Clone)]
pub struct LocalFabric {
    cluster: Arc<ClusterInner>,
    rank: Rank,
    thread_level: Option<ThreadLevel>,
}

/// Handle of an outstanding non-blocking operation on a [`LocalFabric`].
#[derive(Debug)]
pub enum LocalRequest {
    /// A buffered send. Completes at the first test unless completions are paused.
    Send,

    /// A posted receive, identified within the cluster.
    Recv(u64),
}

impl LocalFabric {
    pub(super) fn new(cluster: Arc<ClusterInner>, rank: Rank) -> Self {
        Self {
            cluster,
            rank,
            thread_level: None,
        }
    }

    /// Makes [`init()`][Fabric::init] report `level` as the provided thread support level
    /// instead of the requested one.
    #[must_use]
    pub const fn with_thread_level(mut self, level: ThreadLevel) -> Self {
        self.thread_level = Some(level);
        self
    }

    /// World rank this instance belongs to.
    #[must_use]
    pub const fn world_rank(&self) -> Rank {
        self.rank
    }

    /// Names of the distinct threads that made native calls on this rank, in order of first
    /// call. Rank and size queries are not included.
    #[must_use]
    pub fn caller_threads(&self) -> Vec<Option<String>> {
        self.cluster.state.lock().threads(self.rank)
    }

    /// Whether [`finalize()`][Fabric::finalize] has been called on this rank.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.cluster.state.lock().lifecycle(self.rank) == Lifecycle::Finalized
    }

    /// Locks the cluster for a native call, applying injected failures and lifecycle checks.
    fn enter(&self, call: &'static str) -> NativeResult<MutexGuard<'_, ClusterState>> {
        let mut state = self.cluster.state.lock();
        state.record_thread(self.rank, thread::current().name());

        if let Some(code) = state.take_injected(self.rank) {
            return Err(NativeError::new(call, code, "injected failure"));
        }

        Self::ensure_running(&state, call, self.rank)?;
        Ok(state)
    }

    fn ensure_running(state: &ClusterState, call: &'static str, rank: Rank) -> NativeResult<()> {
        match state.lifecycle(rank) {
            Lifecycle::Running => Ok(()),
            Lifecycle::Uninitialized => Err(NativeError::new(call, NativeError::ERR_NOT_INITIALIZED, "called before init")),
            Lifecycle::Finalized => Err(NativeError::new(call, NativeError::ERR_NOT_INITIALIZED, "called after finalize")),
        }
    }

    fn collective<C, R, K>(&self, call: &'static str, comm: Comm, contribution: C, combine: K) -> NativeResult<Arc<R>>
    where
        C: Send + 'static,
        R: Send + Sync + 'static,
        K: FnOnce(&mut ClusterState, &[Rank], Vec<C>) -> NativeResult<R>,
    {
        let state = self.enter(call)?;
        collective(&self.cluster, state, self.rank, call, comm, contribution, combine)
    }

    fn reduction<T: Element>(
        &self,
        call: &'static str,
        send: &[T],
        op: ReduceOp,
        root: Option<Rank>,
        comm: Comm,
    ) -> NativeResult<Arc<Vec<T>>> {
        self.collective(call, comm, (root, op, send.to_vec()), move |_, members, contributions| {
            if let Some(root) = agree(call, NativeError::ERR_ROOT, "root", contributions.iter().map(|c| c.0))?.flatten() {
                check_root(call, root, members.len())?;
            }

            agree(call, NativeError::ERR_OTHER, "reduction operator", contributions.iter().map(|c| c.1))?;
            agree(call, NativeError::ERR_COUNT, "element count", contributions.iter().map(|c| c.2.len()))?;

            let values: Vec<Vec<T>> = contributions.into_iter().map(|c| c.2).collect();
            Ok(reduce_all(op, &values))
        })
    }
}

fn check_root(call: &'static str, root: Rank, size: usize) -> NativeResult<()> {
    if root < size {
        Ok(())
    } else {
        Err(NativeError::new(
            call,
            NativeError::ERR_ROOT,
            format!("root {root} is outside a communicator of size {size}"),
        ))
    }
}

fn check_len(call: &'static str, expected: usize, actual: usize) -> NativeResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(NativeError::new(
            call,
            NativeError::ERR_COUNT,
            format!("receive buffer holds {actual} elements but {expected} are required"),
        ))
    }
}

impl Fabric for LocalFabric {
    type Request = LocalRequest;

    fn init(&self, required: ThreadLevel) -> NativeResult<ThreadLevel> {
        let mut state = self.cluster.state.lock();
        state.record_thread(self.rank, thread::current().name());

        if let Some(code) = state.take_injected(self.rank) {
            return Err(NativeError::new("init", code, "injected failure"));
        }

        if state.lifecycle(self.rank) != Lifecycle::Uninitialized {
            return Err(NativeError::new("init", NativeError::ERR_OTHER, "already initialized"));
        }

        state.set_lifecycle(self.rank, Lifecycle::Running);
        Ok(self.thread_level.unwrap_or(required))
    }

    fn finalize(&self) -> NativeResult<()> {
        let mut state = self.enter("finalize")?;
        state.set_lifecycle(self.rank, Lifecycle::Finalized);
        Ok(())
    }

    fn rank(&self, comm: Comm) -> NativeResult<Rank> {
        let state = self.cluster.state.lock();
        Self::ensure_running(&state, "comm_rank", self.rank)?;
        state.local_rank("comm_rank", comm, self.rank)
    }

    fn size(&self, comm: Comm) -> NativeResult<usize> {
        let state = self.cluster.state.lock();
        Self::ensure_running(&state, "comm_size", self.rank)?;
        state.members("comm_size", comm).map(<[Rank]>::len)
    }

    fn comm_dup(&self, comm: Comm) -> NativeResult<Comm> {
        let dup = self.collective("comm_dup", comm, (), |state, members, _| {
            Ok(state.allocate_comm(members.to_vec()))
        })?;

        Ok(*dup)
    }

    fn comm_split(&self, comm: Comm, color: Option<u32>, key: i32) -> NativeResult<Option<Comm>> {
        let local = self.enter("comm_split")?.local_rank("comm_split", comm, self.rank)?;

        let assignment = self.collective("comm_split", comm, (color, key), |state, members, contributions| {
            let mut groups: BTreeMap<u32, Vec<(i32, Rank)>> = BTreeMap::new();

            for (member, (color, key)) in contributions.into_iter().enumerate() {
                if let Some(color) = color {
                    groups.entry(color).or_default().push((key, member));
                }
            }

            let mut assignment = vec![None; members.len()];

            for mut group in groups.into_values() {
                group.sort_unstable();

                let world: Vec<Rank> = group.iter().map(|&(_, member)| members[member]).collect();
                let new_comm = state.allocate_comm(world);

                for (_, member) in group {
                    assignment[member] = Some(new_comm);
                }
            }

            Ok(assignment)
        })?;

        Ok(assignment.get(local).copied().flatten())
    }

    fn send(&self, data: &[u8], dest: Rank, tag: Tag, comm: Comm) -> NativeResult<()> {
        let mut state = self.enter("send")?;
        let source = state.local_rank("send", comm, self.rank)?;
        let target = state.world_rank("send", comm, dest)?;

        state.deliver(target, comm, source, tag, Bytes::copy_from_slice(data));
        drop(state);

        self.cluster.changed.notify_all();
        Ok(())
    }

    fn recv(&self, buf: &mut [u8], source: Source, tag: Tag, comm: Comm) -> NativeResult<Status> {
        let mut state = self.enter("recv")?;
        state.local_rank("recv", comm, self.rank)?;

        if let Source::Rank(source) = source {
            state.world_rank("recv", comm, source)?;
        }

        loop {
            if let Some(result) = state.take_message("recv", self.rank, comm, source, tag, buf.len()) {
                let message = result?;
                buf[..message.status.len].copy_from_slice(&message.data);
                return Ok(message.status);
            }

            self.cluster.changed.wait(&mut state);
        }
    }

    fn isend(&self, data: Bytes, dest: Rank, tag: Tag, comm: Comm) -> NativeResult<Self::Request> {
        let mut state = self.enter("isend")?;
        let source = state.local_rank("isend", comm, self.rank)?;
        let target = state.world_rank("isend", comm, dest)?;

        state.deliver(target, comm, source, tag, data);
        drop(state);

        self.cluster.changed.notify_all();
        Ok(LocalRequest::Send)
    }

    fn irecv(&self, capacity: usize, source: Source, tag: Tag, comm: Comm) -> NativeResult<Self::Request> {
        let mut state = self.enter("irecv")?;
        state.local_rank("irecv", comm, self.rank)?;

        if let Source::Rank(source) = source {
            state.world_rank("irecv", comm, source)?;
        }

        Ok(LocalRequest::Recv(state.post_recv(self.rank, comm, source, tag, capacity)))
    }

    fn test(&self, request: &mut Self::Request) -> NativeResult<Option<Completion>> {
        let mut state = self.enter("test")?;

        if state.is_paused() {
            return Ok(None);
        }

        match request {
            LocalRequest::Send => Ok(Some(Completion::Sent)),
            LocalRequest::Recv(id) => state
                .take_matched(self.rank, *id)
                .transpose()
                .map(|message| message.map(Completion::Received)),
        }
    }

    fn barrier(&self, comm: Comm) -> NativeResult<()> {
        self.collective("barrier", comm, (), |_, _, _| Ok(()))?;
        Ok(())
    }

    fn broadcast(&self, buf: &mut [u8], root: Rank, comm: Comm) -> NativeResult<()> {
        let data = self.collective("broadcast", comm, (root, buf.to_vec()), |_, members, contributions| {
            let root = agree("broadcast", NativeError::ERR_ROOT, "root", contributions.iter().map(|c| c.0))?.unwrap_or(root);
            check_root("broadcast", root, members.len())?;
            agree("broadcast", NativeError::ERR_COUNT, "buffer length", contributions.iter().map(|c| c.1.len()))?;

            contributions
                .into_iter()
                .nth(root)
                .map(|(_, data)| data)
                .ok_or_else(|| NativeError::new("broadcast", NativeError::ERR_ROOT, "root did not contribute"))
        })?;

        buf.copy_from_slice(&data);
        Ok(())
    }

    fn reduce<T: Element>(&self, send: &[T], recv: &mut [T], op: ReduceOp, root: Rank, comm: Comm) -> NativeResult<()> {
        let combined = self.reduction("reduce", send, op, Some(root), comm)?;

        if self.rank(comm)? == root {
            check_len("reduce", combined.len(), recv.len())?;
            recv.copy_from_slice(&combined);
        }

        Ok(())
    }

    fn all_reduce<T: Element>(&self, send: &[T], recv: &mut [T], op: ReduceOp, comm: Comm) -> NativeResult<()> {
        let combined = self.reduction("all_reduce", send, op, None, comm)?;

        check_len("all_reduce", combined.len(), recv.len())?;
        recv.copy_from_slice(&combined);
        Ok(())
    }

    fn all_gather<T: Element>(&self, send: &[T], recv: &mut [T], comm: Comm) -> NativeResult<()> {
        let gathered = self.collective("all_gather", comm, send.to_vec(), |_, _, contributions| {
            agree("all_gather", NativeError::ERR_COUNT, "element count", contributions.iter().map(Vec::len))?;
            Ok(contributions.concat())
        })?;

        check_len("all_gather", gathered.len(), recv.len())?;
        recv.copy_from_slice(&gathered);
        Ok(())
    }
}

impl fmt::Debug for LocalFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalFabric")
            .field("rank", &self.rank)
            .field("thread_level", &self.thread_level)
            .finish_non_exhaustive()
    }
}
