// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The process table: a bounded array of child records indexed by slot.
//!
//! The table is built in the master before forking, so every child inherits
//! a copy and knows its siblings' channel endpoints at birth; workers
//! started later are announced over the channel with an `Open` message.
//! A slot is free iff it holds `None`; slots are reused only after the
//! supervisor has observed the `exited` bit during a reap pass.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::unistd::{ForkResult, Pid, fork};

use crate::process::channel::{self, ChannelError};

/// Hard bound on table size.
pub const MAX_PROCESSES: usize = 1024;

/// What the child runs; replaces the original's entry-function pointer so
/// a reaped child can be re-spawned from its record alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    Worker { index: usize },
    Helper,
}

/// Status bits of one child record.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessStatus {
    /// Re-spawn automatically if the child dies without being asked to.
    pub respawn: bool,
    /// Started during a reconfigure; exempt from the next `Quit` broadcast.
    pub just_spawn: bool,
    /// Not supervised (the exec'd upgrade binary).
    pub detached: bool,
    /// The master asked this child to exit.
    pub exiting: bool,
    /// `SIGCHLD`/`waitpid` observed the exit; slot is reapable.
    pub exited: bool,
}

/// Spawn policy, deciding the initial status bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnPolicy {
    NoRespawn,
    JustSpawn,
    Respawn,
    JustRespawn,
    Detached,
    /// Re-spawn into an existing slot, keeping its bits.
    AtSlot(usize),
}

#[derive(Debug)]
pub struct ProcessRecord {
    pub pid: Pid,
    /// Channel endpoint 0 (kept by the master, announced to siblings).
    pub master_fd: Option<OwnedFd>,
    /// Channel endpoint 1 (the child reads commands here).
    pub worker_fd: Option<OwnedFd>,
    /// Descriptor for a sibling's master-side endpoint, as received over
    /// `Open` in a worker process. `None` in the master (it owns
    /// `master_fd` directly).
    pub sibling_fd: Option<OwnedFd>,
    pub kind: ChildKind,
    pub name: &'static str,
    pub status: ProcessStatus,
}

impl ProcessRecord {
    /// The descriptor to send control messages to this process on, from
    /// whichever process we are in.
    #[must_use]
    pub fn control_fd(&self) -> Option<RawFd> {
        self.master_fd
            .as_ref()
            .or(self.sibling_fd.as_ref())
            .map(AsRawFd::as_raw_fd)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("process table full ({MAX_PROCESSES} slots)")]
    TableFull,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("fork failed: {0}")]
    Fork(nix::errno::Errno),
}

#[derive(Debug, Default)]
pub struct ProcessTable {
    slots: Vec<Option<ProcessRecord>>,
    /// Highest slot ever used, plus one (the scan bound).
    pub last: usize,
}

impl ProcessTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&ProcessRecord> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut ProcessRecord> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    /// Free a slot after reaping. Dropping the record closes its fds.
    pub fn clear(&mut self, slot: usize) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = None;
        }
        while self.last > 0 && self.slots.get(self.last - 1).is_none_or(Option::is_none) {
            self.last -= 1;
        }
    }

    /// Iterate `(slot, record)` for live slots below `last`.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ProcessRecord)> {
        self.slots
            .iter()
            .take(self.last)
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|r| (i, r)))
    }

    /// Mutable [`iter`](Self::iter).
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut ProcessRecord)> {
        self.slots
            .iter_mut()
            .take(self.last)
            .enumerate()
            .filter_map(|(i, r)| r.as_mut().map(|r| (i, r)))
    }

    fn reserve_slot(&mut self, policy: SpawnPolicy) -> Result<usize, SpawnError> {
        if let SpawnPolicy::AtSlot(slot) = policy {
            return Ok(slot);
        }
        let slot = (0..MAX_PROCESSES)
            .find(|&i| self.slots.get(i).is_none_or(Option::is_none))
            .ok_or(SpawnError::TableFull)?;
        if self.slots.len() <= slot {
            self.slots.resize_with(slot + 1, || None);
        }
        self.last = self.last.max(slot + 1);
        Ok(slot)
    }

    /// Find the record announced for `pid`, if any.
    #[must_use]
    pub fn slot_of_pid(&self, pid: Pid) -> Option<usize> {
        self.iter().find(|(_, r)| r.pid == pid).map(|(i, _)| i)
    }

    /// Worker side of an `Open` broadcast: remember the announced
    /// sibling's endpoint, creating the record if this worker has never
    /// seen the slot.
    pub fn record_open(&mut self, slot: usize, pid: Pid, fd: RawFd) {
        if slot >= MAX_PROCESSES {
            return;
        }
        if self.slots.len() <= slot {
            self.slots.resize_with(slot + 1, || None);
        }
        self.last = self.last.max(slot + 1);

        // SAFETY: the descriptor was just received over SCM_RIGHTS and is
        // owned by this process alone.
        let owned = (fd >= 0).then(|| unsafe { OwnedFd::from_raw_fd(fd) });

        match &mut self.slots[slot] {
            Some(record) => {
                record.pid = pid;
                record.sibling_fd = owned;
            }
            entry @ None => {
                *entry = Some(ProcessRecord {
                    pid,
                    master_fd: None,
                    worker_fd: None,
                    sibling_fd: owned,
                    kind: ChildKind::Helper,
                    name: "sibling process",
                    status: ProcessStatus::default(),
                });
            }
        }
    }

    /// Worker side of a `Close` broadcast: drop the dead sibling's
    /// endpoint.
    pub fn close_sibling(&mut self, slot: usize) {
        if let Some(record) = self.get_mut(slot) {
            record.sibling_fd = None;
            record.master_fd = None;
        }
    }
}

/// Outcome of a successful spawn, in the parent.
#[derive(Debug, Clone, Copy)]
pub struct Spawned {
    pub slot: usize,
    pub pid: Pid,
}

/// Create the channel pair, place the record, and fork.
///
/// In the child, `child_main(table, slot)` runs and must never return; the
/// child's copy of the table contains every sibling spawned so far plus its
/// own record (with both channel endpoints). In the parent, the record's
/// pid is filled in and the slot/pid pair is returned.
///
/// # Errors
///
/// Returns [`SpawnError`] when the table is full, the socketpair cannot be
/// created, or `fork` fails; the reserved record is rolled back.
pub fn spawn_process<F>(
    table: &mut ProcessTable,
    kind: ChildKind,
    name: &'static str,
    policy: SpawnPolicy,
    child_main: F,
) -> Result<Spawned, SpawnError>
where
    F: FnOnce(&mut ProcessTable, usize),
{
    let slot = table.reserve_slot(policy)?;

    let (master_fd, worker_fd) = if policy == SpawnPolicy::Detached {
        (None, None)
    } else {
        let (m, w) = channel::create_channel()?;
        (Some(m), Some(w))
    };

    let status = match policy {
        SpawnPolicy::NoRespawn => ProcessStatus::default(),
        SpawnPolicy::JustSpawn => ProcessStatus {
            just_spawn: true,
            ..ProcessStatus::default()
        },
        SpawnPolicy::Respawn => ProcessStatus {
            respawn: true,
            ..ProcessStatus::default()
        },
        SpawnPolicy::JustRespawn => ProcessStatus {
            respawn: true,
            just_spawn: true,
            ..ProcessStatus::default()
        },
        SpawnPolicy::Detached => ProcessStatus {
            detached: true,
            ..ProcessStatus::default()
        },
        SpawnPolicy::AtSlot(_) => {
            // Keep the old bits, minus the lifecycle ones.
            let mut status = table
                .get(slot)
                .map(|r| r.status)
                .unwrap_or_default();
            status.exiting = false;
            status.exited = false;
            status
        }
    };

    if table.slots.len() <= slot {
        table.slots.resize_with(slot + 1, || None);
    }
    table.last = table.last.max(slot + 1);
    table.slots[slot] = Some(ProcessRecord {
        pid: Pid::from_raw(0),
        master_fd,
        worker_fd,
        sibling_fd: None,
        kind,
        name,
        status,
    });

    // SAFETY: single-threaded supervisor; the child immediately takes over
    // via child_main and never unwinds back here.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            child_main(table, slot);
            unreachable!("child entry returned");
        }
        Ok(ForkResult::Parent { child }) => {
            let record = table.get_mut(slot).expect("record placed above");
            record.pid = child;
            tracing::debug!(name, slot, pid = child.as_raw(), "spawned child");
            Ok(Spawned { slot, pid: child })
        }
        Err(e) => {
            table.slots[slot] = None;
            Err(SpawnError::Fork(e))
        }
    }
}
