// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Vocabulary of the native communication library that the subsystem funnels calls into.

mod element;
mod error;
mod fabric;
mod types;

pub use element::*;
pub use error::*;
pub use fabric::*;
pub use types::*;
