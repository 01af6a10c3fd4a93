// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The signal adapter: OS signals become atomic flags, nothing more.
//!
//! No work runs inside signal handlers. Each control signal sets exactly
//! one flag; the master and worker loops consult the flags in a fixed
//! priority order at their next wake. The master blocks the whole control
//! set before forking (so children inherit a known state) and sleeps in
//! `sigsuspend`; workers clear the mask during init and take most commands
//! over the channel instead.
//!
//! Signal map:
//!
//! | signal        | flag            | meaning                      |
//! |---------------|-----------------|------------------------------|
//! | `CHLD`        | `reap`          | a child changed state        |
//! | `TERM`, `INT` | `terminate`     | fast shutdown                |
//! | `QUIT`        | `quit`          | graceful shutdown            |
//! | `HUP`         | `reconfigure`   | reload configuration         |
//! | `USR1`        | `reopen`        | reopen log files             |
//! | `USR2`        | `change_binary` | binary upgrade (master only) |
//! | `WINCH`       | `noaccept`      | stop accepting               |
//! | `ALRM`        | `alarm`         | timer-resolution / delay tick|

use std::sync::{Arc,
                atomic::{AtomicBool, Ordering}};

use nix::sys::signal::{SigSet, SigmaskHow, Signal, sigprocmask};
use signal_hook::consts::signal as sig;

/// The per-process signal flags. One instance exists per process; handlers
/// installed by [`install`](Self::install) write these atomics and do
/// nothing else.
#[derive(Debug, Clone, Default)]
pub struct SignalFlags {
    pub reap: Arc<AtomicBool>,
    pub terminate: Arc<AtomicBool>,
    pub quit: Arc<AtomicBool>,
    pub reconfigure: Arc<AtomicBool>,
    pub reopen: Arc<AtomicBool>,
    pub change_binary: Arc<AtomicBool>,
    pub noaccept: Arc<AtomicBool>,
    pub alarm: Arc<AtomicBool>,
}

impl SignalFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the flag-setting handlers for the whole control set.
    ///
    /// # Errors
    ///
    /// Propagates handler registration failure (fatal at startup).
    pub fn install(&self) -> std::io::Result<()> {
        signal_hook::flag::register(sig::SIGCHLD, self.reap.clone())?;
        signal_hook::flag::register(sig::SIGTERM, self.terminate.clone())?;
        signal_hook::flag::register(sig::SIGINT, self.terminate.clone())?;
        signal_hook::flag::register(sig::SIGQUIT, self.quit.clone())?;
        signal_hook::flag::register(sig::SIGHUP, self.reconfigure.clone())?;
        signal_hook::flag::register(sig::SIGUSR1, self.reopen.clone())?;
        signal_hook::flag::register(sig::SIGUSR2, self.change_binary.clone())?;
        signal_hook::flag::register(sig::SIGWINCH, self.noaccept.clone())?;
        signal_hook::flag::register(sig::SIGALRM, self.alarm.clone())?;
        Ok(())
    }
}

/// Consume a flag: returns its value and clears it in one step.
#[must_use]
pub fn take(flag: &AtomicBool) -> bool {
    flag.swap(false, Ordering::SeqCst)
}

/// Read a flag without clearing it.
#[must_use]
pub fn is_set(flag: &AtomicBool) -> bool {
    flag.load(Ordering::SeqCst)
}

/// Set a flag (worker-side channel commands route here).
pub fn raise(flag: &AtomicBool) {
    flag.store(true, Ordering::SeqCst);
}

/// The control set the master blocks before forking.
#[must_use]
pub fn control_set() -> SigSet {
    let mut set = SigSet::empty();
    for s in [
        Signal::SIGCHLD,
        Signal::SIGALRM,
        Signal::SIGIO,
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGQUIT,
        Signal::SIGHUP,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
        Signal::SIGWINCH,
    ] {
        set.add(s);
    }
    set
}

/// Block the control set (master, before the first fork).
///
/// # Errors
///
/// Propagates `sigprocmask` failure.
pub fn block_control_signals() -> nix::Result<()> {
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&control_set()), None)
}

/// Clear the mask entirely (worker init).
///
/// # Errors
///
/// Propagates `sigprocmask` failure.
pub fn clear_signal_mask() -> nix::Result<()> {
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
}

/// Atomically unblock everything and sleep until a handler runs (the
/// master's only suspension point).
pub fn suspend_until_signal() {
    SigSet::empty().suspend().ok();
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn test_take_clears_the_flag() {
        let flags = SignalFlags::new();
        raise(&flags.quit);
        assert!(take(&flags.quit));
        assert!(!take(&flags.quit));
    }

    #[test]
    #[serial]
    fn test_handler_sets_exactly_one_flag() {
        let flags = SignalFlags::new();
        flags.install().unwrap();

        // SIGUSR2 is harmless to self-deliver in a test process.
        nix::sys::signal::raise(Signal::SIGUSR2).unwrap();

        assert!(take(&flags.change_binary));
        assert!(!is_set(&flags.quit));
        assert!(!is_set(&flags.terminate));
    }
}
