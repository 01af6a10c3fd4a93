// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The pid file: ASCII master pid at a configured path.
//!
//! During a binary upgrade the old master renames its pid file to
//! `<path>.oldbin` before exec'ing the new binary; if the new master dies,
//! the rename is undone so `-s` keeps addressing the surviving master.

use std::path::{Path, PathBuf};

use nix::{sys::signal::{Signal, kill},
          unistd::Pid};

/// Suffix the old master's pid file gets during an upgrade.
pub const OLDBIN_SUFFIX: &str = ".oldbin";

#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("cannot write pid file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot read pid file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("pid file {path} does not contain a pid")]
    Malformed { path: PathBuf },
    #[error("cannot signal pid {pid}: {source}")]
    Kill { pid: i32, source: nix::errno::Errno },
}

#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current pid.
    ///
    /// # Errors
    ///
    /// Returns [`PidFileError::Write`] on I/O failure - fatal at startup.
    pub fn create(path: &Path) -> Result<Self, PidFileError> {
        let pid = std::process::id();
        std::fs::write(path, format!("{pid}\n")).map_err(|source| PidFileError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn oldbin_path(&self) -> PathBuf {
        let mut s = self.path.as_os_str().to_os_string();
        s.push(OLDBIN_SUFFIX);
        PathBuf::from(s)
    }

    /// Move aside for a binary upgrade.
    ///
    /// # Errors
    ///
    /// Propagates the rename failure; the upgrade is aborted on error.
    pub fn rename_to_oldbin(&self) -> std::io::Result<()> {
        std::fs::rename(&self.path, self.oldbin_path())
    }

    /// Undo [`rename_to_oldbin`](Self::rename_to_oldbin) after the new
    /// binary exited.
    ///
    /// # Errors
    ///
    /// Propagates the rename failure.
    pub fn restore_from_oldbin(&self) -> std::io::Result<()> {
        std::fs::rename(self.oldbin_path(), &self.path)
    }

    /// Best-effort removal at master exit.
    pub fn delete(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "could not delete pid file");
        }
    }
}

/// The control actions `-s` can deliver to a running master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Fast shutdown (`TERM`).
    Stop,
    /// Graceful shutdown (`QUIT`).
    Quit,
    /// Reopen log files (`USR1`).
    Reopen,
    /// Reload configuration (`HUP`).
    Reload,
}

impl From<ControlSignal> for Signal {
    fn from(c: ControlSignal) -> Self {
        match c {
            ControlSignal::Stop => Signal::SIGTERM,
            ControlSignal::Quit => Signal::SIGQUIT,
            ControlSignal::Reopen => Signal::SIGUSR1,
            ControlSignal::Reload => Signal::SIGHUP,
        }
    }
}

/// Read the master pid from `path` and deliver `signal` (the `-s` path).
///
/// # Errors
///
/// Returns [`PidFileError`] when the file is unreadable, malformed, or the
/// signal cannot be delivered.
pub fn signal_running_master(path: &Path, signal: impl Into<Signal>) -> Result<Pid, PidFileError> {
    let text = std::fs::read_to_string(path).map_err(|source| PidFileError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let pid: i32 = text
        .trim()
        .parse()
        .map_err(|_| PidFileError::Malformed {
            path: path.to_path_buf(),
        })?;
    let pid = Pid::from_raw(pid);
    kill(pid, signal.into()).map_err(|source| PidFileError::Kill {
        pid: pid.as_raw(),
        source,
    })?;
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_create_writes_ascii_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stoker.pid");
        let _pid_file = PidFile::create(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.trim().parse::<u32>().unwrap(), std::process::id());
    }

    #[test]
    fn test_oldbin_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stoker.pid");
        let pid_file = PidFile::create(&path).unwrap();

        pid_file.rename_to_oldbin().unwrap();
        assert!(!path.exists());
        assert!(pid_file.oldbin_path().exists());

        pid_file.restore_from_oldbin().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_signal_running_master_delivers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stoker.pid");
        let _pid_file = PidFile::create(&path).unwrap();

        // Signal 0 probes liveness without delivering anything... but nix
        // models that as `None`, so use SIGURG which is ignored by default.
        let pid = signal_running_master(&path, Signal::SIGURG).unwrap();
        assert_eq!(pid.as_raw() as u32, std::process::id());
    }

    #[test]
    fn test_malformed_pid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stoker.pid");
        std::fs::write(&path, "not a pid\n").unwrap();

        assert!(matches!(
            signal_running_master(&path, Signal::SIGURG),
            Err(PidFileError::Malformed { .. })
        ));
    }
}
