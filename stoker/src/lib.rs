// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! # Stoker
//!
//! A multi-process, single-threaded-cooperative event-driven HTTP server
//! core. One **master** process owns the listening sockets, the pid file,
//! and the signal-driven control plane; N **worker** processes inherit the
//! listeners, each run one reactor, and serve all connections accepted to
//! them until told to stop.
//!
//! The crate is organized around three subsystems:
//!
//! - [`process`] — the master/worker supervisor: process table, socketpair
//!   control channels (with `SCM_RIGHTS` descriptor passing), signal
//!   adapter, graceful/forced shutdown, reconfiguration, and binary
//!   upgrade.
//! - [`event`] — the per-worker reactor: readiness multiplexing over
//!   [`mio`], posted-event queues, a timer set, accept balancing, and the
//!   stale-event discard rule backed by generation-tagged connection slots
//!   in [`conn`].
//! - [`http`] — the streaming request-body pipeline: length and chunked
//!   decoding filters, memory-chain buffering with temp-file spill, and the
//!   discard path.
//!
//! Everything in one worker runs on one thread; handlers are cooperative
//! and the only suspension point is the reactor's kernel wait. Parallelism
//! exists only across worker processes.

// Attach.
pub mod conn;
pub mod core;
pub mod event;
pub mod http;
pub mod process;

// Re-export.
pub use self::core::*;
pub use conn::*;
pub use event::*;
pub use http::*;
pub use process::*;
