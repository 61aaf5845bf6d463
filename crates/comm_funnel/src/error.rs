// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::process;

use thiserror::Error;
use tracing::error;

use crate::{LocaleId, NativeError, Operation, ThreadLevel};

/// A specialized `Result` type for communication subsystem operations
/// that return a subsystem [`Error`][enum@Error] on failure.
pub type Result<T> = std::result::Result<T, Error>;

/// An error originating in the communication subsystem outside of native calls.
///
/// Failures of the native communication library are never returned through this type - they are
/// fatal and handled according to the configured [`NativeErrorAction`]. This type covers
/// mistakes made while integrating the subsystem into a host (e.g. a topology without a dedicated
/// interconnect locale) and failures of the environment (e.g. the dedicated thread could not be
/// started). Hosts are expected to treat all of these as fatal during initialization.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Post-initialization was attempted before the capability class was registered.
    #[error("the communication module must be pre-initialized before it is post-initialized")]
    NotPreInitialized,

    /// The communication module has already bound a dedicated locale.
    #[error("the communication module is already bound to locale {0}")]
    AlreadyInitialized(LocaleId),

    /// Discovery found a number of dedicated locales other than exactly one.
    #[error("expected exactly one locale of kind `{kind}` but found {found}")]
    DedicatedLocaleCount {
        /// Name of the capability class that was searched for.
        kind: String,
        /// How many locales of that class exist.
        found: usize,
    },

    /// The topology does not contain the referenced locale.
    #[error("no locale with id {0} exists in the topology")]
    UnknownLocale(LocaleId),

    /// The locale already carries a special role tag.
    #[error("locale `{locale}` is already marked as `{tag}`")]
    AlreadyMarked {
        /// Name of the locale.
        locale: String,
        /// The tag it already carries.
        tag: String,
    },

    /// The native library cannot be used from a funneled communication thread.
    #[error("native library provided thread level {provided:?} but {required:?} is required")]
    ThreadLevel {
        /// The thread level that was requested.
        required: ThreadLevel,
        /// The thread level the native library reported.
        provided: ThreadLevel,
    },

    /// We are re-packaging an error from the Rust standard library I/O logic
    /// without adding further details in the communication subsystem layer.
    #[error(transparent)]
    StdIo(#[from] std::io::Error),
}

/// What to do when a native communication call fails.
///
/// Native failures are never recoverable: in a bulk-synchronous parallel program a failed
/// communication call leaves peers in an unknown state. The only choice is how to fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NativeErrorAction {
    /// Logs the error and aborts the process.
    #[default]
    Abort,

    /// Logs the error and panics on the dedicated communication thread. The subsystem then
    /// abandons all outstanding operations, so every task awaiting one of them panics as well.
    Panic,
}

impl fmt::Display for NativeErrorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort => f.write_str("abort"),
            Self::Panic => f.write_str("panic"),
        }
    }
}

/// Surfaces a failed native call and never returns.
#[cfg_attr(test, mutants::skip)] // Terminates the process in the default configuration.
#[expect(clippy::panic, reason = "native failures are fatal by contract")]
pub(crate) fn fail(action: NativeErrorAction, op: Operation, err: &NativeError) -> ! {
    error!(op = op.name(), code = err.code(), action = %action, "native communication call failed: {err}");

    match action {
        NativeErrorAction::Abort => process::abort(),
        NativeErrorAction::Panic => panic!("{} failed: {err}", op.name()),
    }
}
