// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// A specialized `Result` type for calls into the native communication library.
pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// A non-success return from a native communication call.
///
/// The subsystem never recovers from these; see [`NativeErrorAction`][crate::NativeErrorAction].
/// The well-known codes below are used by [`LocalFabric`][crate::LocalFabric]; other
/// [`Fabric`][crate::Fabric] implementations report whatever codes their library uses.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("`{call}` failed with native error code {code}: {detail}")]
pub struct NativeError {
    call: &'static str,
    code: i32,
    detail: String,
}

impl NativeError {
    /// The receive buffer was too small for the matched message.
    pub const ERR_TRUNCATE: i32 = 15;

    /// A rank argument is outside the communicator.
    pub const ERR_RANK: i32 = 6;

    /// A root argument is outside the communicator.
    pub const ERR_ROOT: i32 = 7;

    /// Ranks supplied inconsistent element counts to a collective.
    pub const ERR_COUNT: i32 = 2;

    /// The communicator does not exist or the caller is not a member.
    pub const ERR_COMM: i32 = 5;

    /// The library was used before initialization or after finalization.
    pub const ERR_NOT_INITIALIZED: i32 = 16;

    /// Ranks entered different collective operations at the same point.
    pub const ERR_MISMATCH: i32 = 17;

    /// Any other failure.
    pub const ERR_OTHER: i32 = 18;

    /// Creates an error reported by the native call named `call`.
    #[must_use]
    pub fn new(call: &'static str, code: i32, detail: impl Into<String>) -> Self {
        Self {
            call,
            code,
            detail: detail.into(),
        }
    }

    /// Name of the native call that failed.
    #[must_use]
    pub const fn call(&self) -> &'static str {
        self.call
    }

    /// The status code returned by the native library.
    #[must_use]
    pub const fn code(&self) -> i32 {
        self.code
    }

    /// Human-readable detail supplied by the native library.
    #[must_use]
    pub fn detail(&self) -> &str {
        &self.detail
    }
}
