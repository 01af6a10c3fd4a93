// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The cross-worker accept mutex.
//!
//! At most one worker holds the listeners registered at any moment,
//! preventing thundering-herd wakeups on a shared accept backlog. The lock
//! is a non-blocking `flock` on a lock file under the server prefix: held
//! briefly around `accept` + event registration, released within the same
//! reactor tick, never across a blocking call.
//!
//! A worker that fails the try-lock removes its listeners from the reactor
//! and retries after `accept_mutex_delay`. While the lock is held the
//! worker runs with `POST_EVENTS`, so handlers execute only after the lock
//! is released.

use std::{fs::{File, OpenOptions},
          io,
          os::fd::AsRawFd,
          path::Path};

#[derive(Debug)]
pub struct AcceptMutex {
    file: File,
    held: bool,
}

impl AcceptMutex {
    /// Open (creating) the lock file.
    ///
    /// # Errors
    ///
    /// Propagates the open failure - fatal during worker init.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file, held: false })
    }

    /// Try to take the lock without blocking.
    ///
    /// # Errors
    ///
    /// Propagates unexpected `flock` failures (`EWOULDBLOCK` is the normal
    /// "another worker holds it" outcome and returns `Ok(false)`).
    pub fn try_lock(&mut self) -> io::Result<bool> {
        if self.held {
            return Ok(true);
        }
        // SAFETY: flock on an owned, open fd.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            self.held = true;
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(false);
        }
        Err(err)
    }

    /// Release the lock if held.
    pub fn unlock(&mut self) {
        if !self.held {
            return;
        }
        // SAFETY: flock on an owned, open fd.
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        self.held = false;
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for AcceptMutex {
    fn drop(&mut self) {
        self.unlock();
    }
}
