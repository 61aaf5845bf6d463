// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use bytes::Bytes;

use crate::{Comm, Completion, Element, NativeResult, Rank, ReduceOp, Source, Status, Tag, ThreadLevel};

/// The native communication library, as seen by the communication subsystem.
///
/// Implementations wrap a real message-passing library (or simulate one, see
/// [`LocalFabric`][crate::LocalFabric]). The subsystem guarantees that every call except
/// [`rank()`][Self::rank] and [`size()`][Self::size] is made from the dedicated communication
/// thread, which is also the thread that calls [`init()`][Self::init]. Implementations may
/// therefore rely on funneled threading semantics.
///
/// Every method reports failure through [`NativeError`][crate::NativeError]. The subsystem
/// treats any failure as fatal.
///
/// # Thread safety
///
/// Implementations must be thread-safe (`Send + Sync`) because the subsystem handle that owns
/// them is shared between tasks on many threads, even though calls are funneled.
pub trait Fabric: Send + Sync + 'static {
    /// Handle of an outstanding non-blocking operation, polled via [`test()`][Self::test].
    type Request: Send + 'static;

    /// Starts the library, requesting the `required` thread support level, and returns the
    /// level actually provided.
    fn init(&self, required: ThreadLevel) -> NativeResult<ThreadLevel>;

    /// Shuts the library down. No other call may follow.
    fn finalize(&self) -> NativeResult<()>;

    /// Rank of the calling process within `comm`.
    fn rank(&self, comm: Comm) -> NativeResult<Rank>;

    /// Number of ranks in `comm`.
    fn size(&self, comm: Comm) -> NativeResult<usize>;

    /// Collectively creates a communicator with the same group as `comm` but a separate message
    /// space.
    fn comm_dup(&self, comm: Comm) -> NativeResult<Comm>;

    /// Collectively partitions `comm` by `color`, ordering each partition by `key`.
    ///
    /// Ranks passing `None` as color do not join any new communicator and receive `None`.
    fn comm_split(&self, comm: Comm, color: Option<u32>, key: i32) -> NativeResult<Option<Comm>>;

    /// Sends `data` to `dest`, returning once the buffer may be reused.
    fn send(&self, data: &[u8], dest: Rank, tag: Tag, comm: Comm) -> NativeResult<()>;

    /// Receives a message into `buf`, blocking until one matches.
    fn recv(&self, buf: &mut [u8], source: Source, tag: Tag, comm: Comm) -> NativeResult<Status>;

    /// Starts sending `data` to `dest`.
    fn isend(&self, data: Bytes, dest: Rank, tag: Tag, comm: Comm) -> NativeResult<Self::Request>;

    /// Starts receiving a message of at most `capacity` bytes.
    fn irecv(&self, capacity: usize, source: Source, tag: Tag, comm: Comm) -> NativeResult<Self::Request>;

    /// Checks without blocking whether `request` has completed.
    ///
    /// Returns the completion exactly once; the request must not be tested again afterwards.
    fn test(&self, request: &mut Self::Request) -> NativeResult<Option<Completion>>;

    /// Blocks until every rank of `comm` has entered the barrier.
    fn barrier(&self, comm: Comm) -> NativeResult<()>;

    /// Copies `buf` from `root` into `buf` on every other rank of `comm`.
    fn broadcast(&self, buf: &mut [u8], root: Rank, comm: Comm) -> NativeResult<()>;

    /// Combines `send` from every rank with `op`, storing the result in `recv` on `root`.
    ///
    /// `recv` is left untouched on every other rank.
    fn reduce<T: Element>(&self, send: &[T], recv: &mut [T], op: ReduceOp, root: Rank, comm: Comm) -> NativeResult<()>;

    /// Combines `send` from every rank with `op`, storing the result in `recv` on every rank.
    fn all_reduce<T: Element>(&self, send: &[T], recv: &mut [T], op: ReduceOp, comm: Comm) -> NativeResult<()>;

    /// Concatenates `send` from every rank in rank order into `recv` on every rank.
    fn all_gather<T: Element>(&self, send: &[T], recv: &mut [T], comm: Comm) -> NativeResult<()>;
}
