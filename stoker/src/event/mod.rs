// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The per-worker event reactor: readiness multiplexing, posted-event
//! queues, and the timer set.
//!
//! One tick of the reactor (driven by the worker loop):
//!
//! 1. compute the earliest timer deadline (or wait forever);
//! 2. kernel wait - `EINTR` from the resolution alarm is a normal wake;
//! 3. refresh the cached clock when the update policy demands it;
//! 4. decode readiness, discard stale events, fuse error/hangup into
//!    read/write, then dispatch inline or append to a posted queue when
//!    `POST_EVENTS` is in effect;
//! 5. expire timers (their handlers may post more work);
//! 6. drain the accept posted queue, then the general posted queue.

// Attach.
pub mod accept;
pub mod posted;
pub mod reactor;
pub mod timer;

// Re-export.
pub use accept::*;
pub use posted::*;
pub use reactor::*;
pub use timer::*;
