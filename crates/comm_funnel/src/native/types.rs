// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

use bytes::Bytes;

/// Position of a process within a communicator.
pub type Rank = usize;

/// User-chosen label used to match point-to-point messages.
pub type Tag = i32;

/// Identifies a communicator (a group of ranks with an isolated message space).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Comm(u32);

impl Comm {
    /// The communicator containing every rank of the job.
    pub const WORLD: Self = Self(0);

    /// Wraps a raw communicator id obtained from the native library.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw communicator id understood by the native library.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::WORLD {
            f.write_str("world")
        } else {
            write!(f, "comm#{}", self.0)
        }
    }
}

/// Which sender a receive accepts a message from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Source {
    /// Only messages sent by this rank.
    Rank(Rank),

    /// Messages from any rank.
    Any,
}

impl Source {
    /// Whether a message sent by `rank` satisfies this source selector.
    #[must_use]
    pub const fn matches(self, rank: Rank) -> bool {
        match self {
            Self::Rank(expected) => expected == rank,
            Self::Any => true,
        }
    }
}

impl From<Rank> for Source {
    fn from(rank: Rank) -> Self {
        Self::Rank(rank)
    }
}

/// Degree of thread support requested from or provided by the native library.
///
/// Levels are ordered: a library that provides a level also satisfies every lower level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ThreadLevel {
    /// Only one thread exists.
    Single,

    /// Many threads exist but only the thread that initialized the library calls into it.
    Funneled,

    /// Any thread may call into the library, one at a time.
    Serialized,

    /// Any thread may call into the library at any time.
    Multiple,
}

/// Describes a received message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status {
    /// Rank of the sender within the communicator.
    pub source: Rank,

    /// Tag the message was sent with.
    pub tag: Tag,

    /// Number of bytes received.
    pub len: usize,
}

/// A received message and its envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// The payload, exactly `status.len` bytes long.
    pub data: Bytes,

    /// Envelope of the message.
    pub status: Status,
}

/// The outcome of a completed non-blocking operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// A non-blocking send completed; the send buffer is no longer in use.
    Sent,

    /// A non-blocking receive completed with this message.
    Received(Message),
}

impl Completion {
    /// Returns the received message, or `None` if this was a send.
    #[must_use]
    pub fn into_message(self) -> Option<Message> {
        match self {
            Self::Sent => None,
            Self::Received(message) => Some(message),
        }
    }
}

/// Combining operation applied by reductions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,

    /// Element-wise product.
    Product,

    /// Element-wise minimum.
    Min,

    /// Element-wise maximum.
    Max,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_matching() {
        assert!(Source::Any.matches(3));
        assert!(Source::Rank(3).matches(3));
        assert!(!Source::Rank(2).matches(3));
        assert_eq!(Source::from(4), Source::Rank(4));
    }

    #[test]
    fn thread_levels_are_ordered() {
        assert!(ThreadLevel::Single < ThreadLevel::Funneled);
        assert!(ThreadLevel::Multiple >= ThreadLevel::Funneled);
    }

    #[test]
    fn comm_display() {
        assert_eq!(Comm::WORLD.to_string(), "world");
        assert_eq!(Comm::from_raw(5).to_string(), "comm#5");
        assert_eq!(Comm::from_raw(5).as_raw(), 5);
    }

    #[test]
    fn completion_into_message() {
        assert_eq!(Completion::Sent.into_message(), None);

        let message = Message {
            data: Bytes::from_static(b"abc"),
            status: Status { source: 1, tag: 9, len: 3 },
        };
        assert_eq!(Completion::Received(message.clone()).into_message(), Some(message));
    }
}
