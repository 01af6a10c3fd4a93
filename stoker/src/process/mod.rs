// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The master/worker supervisor: signal adapter, process table, control
//! channels, pid file, and the two process cycles.
//!
//! Lifecycle of one child record: `spawning → running → (exiting) →
//! exited → reaped`. A respawnable child that exits without being asked
//! to is re-spawned into the same slot within one master wake; a child
//! started during a reconfigure carries `just_spawn` and survives the
//! generational `Quit` broadcast that drains its predecessors.

// Attach.
pub mod channel;
pub mod master;
pub mod pidfile;
pub mod signals;
pub mod table;
pub mod worker;

// Re-export.
pub use channel::*;
pub use master::*;
pub use pidfile::*;
pub use signals::*;
pub use table::*;
pub use worker::*;
