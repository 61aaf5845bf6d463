// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Bridges a message-passing communication library into cooperative task-based code.
//!
//! Message-passing libraries commonly impose a *funneled* threading restriction: only one thread
//! may call into the library. This crate owns that thread (the *dedicated communication
//! resource*) and exposes every library operation as something a task can `.await` without
//! stalling the worker thread it runs on.
//!
//! # Non-blocking operations
//!
//! [`Funnel::isend()`] and [`Funnel::irecv()`] start the native operation on the dedicated
//! resource and return a [`CommFuture`] immediately. The native handle is registered in a
//! lock-free pending set that a self-perpetuating poller drains on the dedicated resource,
//! fulfilling each future exactly once when the library reports the handle complete.
//!
//! # Logically blocking operations
//!
//! Point-to-point and collective calls whose native form blocks ([`Funnel::send()`],
//! [`Funnel::broadcast()`], [`Funnel::all_reduce()`], ...) run as a unit of work on the dedicated
//! resource. The calling task is suspended until that unit completes, so its worker thread is
//! free to run other tasks in the meantime.
//!
//! # Quick start
//!
//! ```rust
//! use bytes::Bytes;
//! use comm_funnel::{Comm, Funnel, FunnelConfig, LocalCluster, Source};
//!
//! # futures::executor::block_on(async {
//! let cluster = LocalCluster::new(2);
//! let sender = Funnel::start(FunnelConfig::new(), cluster.fabric(0)).unwrap();
//! let receiver = Funnel::start(FunnelConfig::new(), cluster.fabric(1)).unwrap();
//!
//! let incoming = receiver.irecv(5, Source::Rank(0), 7, Comm::WORLD);
//! sender.send(Bytes::from_static(b"hello"), 1, 7, Comm::WORLD).await;
//!
//! let message = incoming.await.into_message().unwrap();
//! assert_eq!(&message.data[..], b"hello");
//! # });
//! ```
//!
//! # Lifecycle
//!
//! Hosts that manage a locality graph integrate through [`CommModule`]: the pre-initialization
//! hook registers the interconnect capability class, post-initialization discovers and binds the
//! single dedicated locale and starts the native library in funneled mode, and finalization
//! drains outstanding operations before shutting the library down. [`Funnel::start()`] runs the
//! whole sequence against a single-node topology.

mod comm_thread;
mod config;
mod error;
mod funnel;
mod instrument;
mod local;
mod module;
mod native;
mod pending;
mod poller;
mod promise;
mod resource;
mod stats;
mod topology;

pub use config::*;
pub use error::*;
pub use funnel::Funnel;
pub use instrument::{OpEvent, Operation, Phase};
pub use local::{LocalCluster, LocalFabric, LocalRequest};
pub use module::CommModule;
pub use native::*;
pub use promise::CommFuture;
pub use resource::{YieldNow, yield_now};
pub use stats::FunnelStats;
pub use topology::*;
