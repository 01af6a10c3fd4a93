// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Cached wall clock for the worker loop.
//!
//! Timer bookkeeping and log timestamps read the cached value instead of
//! hitting the clock on every event. The cache is refreshed once per
//! reactor tick when the `UPDATE_TIME` policy is active, or whenever the
//! `timer_resolution` alarm fires (the resolution interval is delivered as
//! `SIGALRM` by `setitimer`).

use std::time::{Duration, Instant, SystemTime};

/// Per-process cached clock. Never shared across threads - each worker owns
/// exactly one.
#[derive(Debug, Clone)]
pub struct CachedClock {
    mono: Instant,
    wall: SystemTime,
}

impl Default for CachedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl CachedClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mono: Instant::now(),
            wall: SystemTime::now(),
        }
    }

    /// Refresh both cached readings.
    pub fn update(&mut self) {
        self.mono = Instant::now();
        self.wall = SystemTime::now();
    }

    /// Cached monotonic reading (timer arithmetic).
    #[must_use]
    pub fn now(&self) -> Instant {
        self.mono
    }

    /// Cached wall-clock reading (lingering deadlines, logs).
    #[must_use]
    pub fn wall(&self) -> SystemTime {
        self.wall
    }
}

/// Arm the `SIGALRM` interval timer that drives the time-cache resolution.
///
/// A zero interval disarms it. The caller is expected to have a `SIGALRM`
/// handler installed (the signal adapter's `sigalrm` flag); the reactor
/// treats an `EINTR` wake with that flag set as a normal tick.
///
/// # Errors
///
/// Returns the OS error if `setitimer` is rejected.
#[cfg(unix)]
pub fn set_timer_resolution(interval: Duration) -> std::io::Result<()> {
    let tv = libc::timeval {
        tv_sec: interval.as_secs() as libc::time_t,
        tv_usec: i64::from(interval.subsec_micros()) as libc::suseconds_t,
    };
    let itv = libc::itimerval {
        it_interval: tv,
        it_value: tv,
    };
    // SAFETY: plain syscall with a stack-local argument.
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &itv, std::ptr::null_mut()) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Arm a one-shot `SIGALRM` after `delay` (the master's forced-shutdown
/// escalation clock).
///
/// # Errors
///
/// Returns the OS error if `setitimer` is rejected.
#[cfg(unix)]
pub fn arm_alarm(delay: Duration) -> std::io::Result<()> {
    let itv = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: delay.as_secs() as libc::time_t,
            tv_usec: i64::from(delay.subsec_micros()) as libc::suseconds_t,
        },
    };
    // SAFETY: plain syscall with a stack-local argument.
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &itv, std::ptr::null_mut()) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_advances_cached_reading() {
        let mut clock = CachedClock::new();
        let before = clock.now();
        std::thread::sleep(Duration::from_millis(2));

        // The cache is stale until updated.
        assert_eq!(clock.now(), before);

        clock.update();
        assert!(clock.now() > before);
    }
}
