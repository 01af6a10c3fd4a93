// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The master process: an event-less supervisor loop driven by
//! `sigsuspend`.
//!
//! The master never serves traffic. It owns the listening sockets, the pid
//! file, and the control plane: it forks the workers, announces every new
//! channel endpoint to the previously started siblings, reaps and
//! re-spawns dead children, orchestrates reconfiguration and binary
//! upgrade, and escalates a forced shutdown from `TERM` broadcasts to
//! `SIGKILL` when the doubling delay clock passes one second.
//!
//! Control-flag priority within one wake: `reap` first (so the liveness
//! check is accurate), then `terminate` before `quit`, then `reconfigure`,
//! `restart`, `reopen`, `change_binary`, `noaccept`. Once `quit` is
//! observed, every flag except `reap` is ignored for the rest of the
//! master's life.

use std::{net::TcpListener,
          os::fd::{AsRawFd, FromRawFd, RawFd},
          time::Duration};

use nix::{sys::{signal::{Signal, kill},
                wait::{WaitPidFlag, WaitStatus, waitpid}},
          unistd::Pid};
use tracing::{debug, error, info, warn};

use crate::{core::{config::Config, log::ReopenableWriter, time},
            process::{channel::{self, ChannelMsg, Command},
                      pidfile::PidFile,
                      signals::{self, SignalFlags},
                      table::{ChildKind, ProcessTable, SpawnPolicy, spawn_process},
                      worker}};

/// Environment variable carrying inherited listener fds across the
/// binary-upgrade exec.
pub const INHERITED_FDS_ENV: &str = "STOKER_INHERITED_FDS";

/// First delay step of the forced-shutdown escalation.
const TERM_DELAY_START: Duration = Duration::from_millis(50);
/// Past this bound the broadcast escalates to `SIGKILL`.
const TERM_DELAY_LIMIT: Duration = Duration::from_millis(1000);
/// Grace period between starting a new generation and telling the old one
/// to quit.
const RECONFIGURE_GRACE: Duration = Duration::from_millis(100);

/// Everything the master owns.
#[derive(Debug)]
pub struct Master {
    pub cfg: Config,
    pub flags: SignalFlags,
    pub table: ProcessTable,
    pub listeners: Vec<TcpListener>,
    pub pid_file: PidFile,
    pub log_writer: Option<ReopenableWriter>,
    /// argv[..] of this invocation, replayed by the binary upgrade.
    pub argv: Vec<String>,
    new_binary: Option<Pid>,
    noaccepting: bool,
    restart: bool,
}

impl Master {
    #[must_use]
    pub fn new(
        cfg: Config,
        listeners: Vec<TcpListener>,
        pid_file: PidFile,
        log_writer: Option<ReopenableWriter>,
        argv: Vec<String>,
    ) -> Self {
        Self {
            cfg,
            flags: SignalFlags::new(),
            table: ProcessTable::new(),
            listeners,
            pid_file,
            log_writer,
            argv,
            new_binary: None,
            noaccepting: false,
            restart: false,
        }
    }

    /// Run the supervisor loop. Never returns.
    pub fn run(mut self) -> ! {
        if let Err(e) = signals::block_control_signals() {
            error!(error = %e, "sigprocmask failed");
        }
        if let Err(e) = self.flags.install() {
            error!(error = %e, "installing signal handlers failed");
            std::process::exit(2);
        }

        info!(workers = self.cfg.worker_processes, "start worker processes");
        self.start_workers(SpawnPolicy::Respawn);

        let mut delay = Duration::ZERO;
        let mut sigio: usize = 0;
        let mut live = true;

        loop {
            if !delay.is_zero() {
                if signals::take(&self.flags.alarm) {
                    sigio = 0;
                    delay *= 2;
                }
                debug!(?delay, "termination cycle");
                if let Err(e) = time::arm_alarm(delay) {
                    error!(error = %e, "setitimer failed");
                }
            }

            debug!("sigsuspend");
            signals::suspend_until_signal();

            if signals::take(&self.flags.reap) {
                debug!("reap children");
                live = self.reap_children();
            }

            let terminate = signals::is_set(&self.flags.terminate);
            let quit = signals::is_set(&self.flags.quit);

            if !live && (terminate || quit) {
                self.master_exit();
            }

            if terminate {
                if delay.is_zero() {
                    delay = TERM_DELAY_START;
                }
                if sigio > 0 {
                    sigio -= 1;
                    continue;
                }
                sigio = self.cfg.worker_processes + 2;

                if delay > TERM_DELAY_LIMIT {
                    self.signal_workers(Signal::SIGKILL);
                } else {
                    self.signal_workers(Signal::SIGTERM);
                }
                continue;
            }

            if quit {
                self.signal_workers(Signal::SIGQUIT);
                self.close_listeners();
                continue;
            }

            if signals::take(&self.flags.reconfigure) {
                if self.new_binary.is_some() {
                    // An upgrade is pending; just bring a generation up in
                    // the old binary without re-reading configuration.
                    self.start_workers(SpawnPolicy::Respawn);
                    self.noaccepting = false;
                    continue;
                }

                info!("reconfiguring");
                match self.reload_config() {
                    Ok(cfg) => self.cfg = cfg,
                    Err(e) => {
                        error!(error = %e, "reconfiguration failed, keeping old configuration");
                        continue;
                    }
                }
                self.start_workers(SpawnPolicy::JustRespawn);
                live = true;

                // Allow the new generation to start before draining the
                // old one.
                std::thread::sleep(RECONFIGURE_GRACE);
                self.signal_workers(Signal::SIGQUIT);
            }

            if self.restart {
                self.restart = false;
                self.start_workers(SpawnPolicy::Respawn);
                live = true;
            }

            if signals::take(&self.flags.reopen) {
                info!("reopening logs");
                self.reopen_logs();
                self.signal_workers(Signal::SIGUSR1);
            }

            if signals::take(&self.flags.change_binary) {
                info!("changing binary");
                self.new_binary = self.exec_new_binary();
            }

            if signals::take(&self.flags.noaccept) {
                self.noaccepting = true;
                self.signal_workers(Signal::SIGQUIT);
            }
        }
    }

    /// Fork `worker_processes` children and announce each new endpoint to
    /// the previously started siblings.
    fn start_workers(&mut self, policy: SpawnPolicy) {
        for index in 0..self.cfg.worker_processes {
            let spawned = {
                let cfg = &self.cfg;
                let listeners = &self.listeners;
                let flags = &self.flags;
                let log_writer = &self.log_writer;
                spawn_process(
                    &mut self.table,
                    ChildKind::Worker { index },
                    "worker process",
                    policy,
                    |table, slot| {
                        worker::worker_process_cycle(
                            cfg.clone(),
                            listeners,
                            table,
                            slot,
                            index,
                            flags.clone(),
                            log_writer.clone(),
                        );
                    },
                )
            };

            match spawned {
                Ok(s) => self.announce_open(s.slot),
                Err(e) => error!(error = %e, "could not spawn worker"),
            }
        }
    }

    /// Broadcast `Open{pid, slot, fd}` for `slot` to every other live
    /// child.
    fn announce_open(&mut self, slot: usize) {
        let Some(record) = self.table.get(slot) else {
            return;
        };
        let msg = ChannelMsg {
            command: Command::Open,
            pid: record.pid.as_raw(),
            slot: slot as u32,
            fd: record.control_fd().unwrap_or(-1),
        };

        for (i, r) in self.table.iter() {
            if i == slot || r.status.exited {
                continue;
            }
            let Some(fd) = r.control_fd() else { continue };
            debug!(
                announce_slot = slot,
                announce_pid = msg.pid,
                to_slot = i,
                to_pid = r.pid.as_raw(),
                "pass open channel"
            );
            if let Err(e) = channel::send_msg(fd, &msg) {
                warn!(slot = i, error = %e, "passing open channel failed");
            }
        }
    }

    /// Send a control signal to every supervised child, preferring the
    /// channel command when one maps.
    fn signal_workers(&mut self, signo: Signal) {
        let command = match signo {
            Signal::SIGQUIT => Some(Command::Quit),
            Signal::SIGTERM => Some(Command::Terminate),
            Signal::SIGUSR1 => Some(Command::Reopen),
            _ => None,
        };

        let mut reap_needed = false;
        for (slot, record) in self.table.iter_mut() {
            debug!(
                slot,
                pid = record.pid.as_raw(),
                exiting = record.status.exiting,
                exited = record.status.exited,
                respawn = record.status.respawn,
                just_spawn = record.status.just_spawn,
                "child"
            );

            if record.status.detached {
                continue;
            }
            if record.status.just_spawn {
                // Fresh generation: exempt from this broadcast.
                record.status.just_spawn = false;
                continue;
            }
            if record.status.exiting && signo == Signal::SIGQUIT {
                continue;
            }

            if let Some(cmd) = command
                && let Some(fd) = record.control_fd()
                && channel::send_msg(fd, &ChannelMsg {
                    command: cmd,
                    pid: 0,
                    slot: slot as u32,
                    fd: -1,
                })
                .is_ok()
            {
                if cmd != Command::Reopen {
                    record.status.exiting = true;
                }
                continue;
            }

            debug!(pid = record.pid.as_raw(), signal = %signo, "kill");
            match kill(record.pid, signo) {
                Ok(()) => {
                    if signo != Signal::SIGUSR1 {
                        record.status.exiting = true;
                    }
                }
                Err(nix::errno::Errno::ESRCH) => {
                    record.status.exited = true;
                    record.status.exiting = false;
                    reap_needed = true;
                }
                Err(e) => {
                    error!(pid = record.pid.as_raw(), error = %e, "kill failed");
                }
            }
        }
        if reap_needed {
            signals::raise(&self.flags.reap);
        }
    }

    /// Collect exit statuses, broadcast `Close` for dead endpoints,
    /// re-spawn respawnable children, and report whether any supervised
    /// child is still alive.
    fn reap_children(&mut self) -> bool {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, status)) => {
                    self.mark_exited(pid);
                    if status == 2 {
                        warn!(pid = pid.as_raw(), status, "child exited with fatal code");
                    } else {
                        debug!(pid = pid.as_raw(), status, "child exited");
                    }
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    warn!(pid = pid.as_raw(), signal = %signal, "child killed by signal");
                    self.mark_exited(pid);
                }
                Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "waitpid failed");
                    break;
                }
            }
        }

        let mut live = false;
        for slot in 0..self.table.last {
            let Some(status) = self.table.get(slot).map(|r| r.status) else {
                continue;
            };

            if !status.exited {
                if status.exiting || !status.detached {
                    live = true;
                }
                continue;
            }

            let pid = self.table.get(slot).map(|r| r.pid);

            if !status.detached {
                self.broadcast_close(slot);
            }

            let terminate = signals::is_set(&self.flags.terminate);
            let quit = signals::is_set(&self.flags.quit);
            if status.respawn && !status.exiting && !terminate && !quit {
                if self.respawn_child(slot) {
                    live = true;
                    continue;
                }
                error!(slot, "could not respawn child");
            }

            if pid.is_some() && pid == self.new_binary {
                // The upgraded master died; take the pid file back and, if
                // we had stopped accepting, bring workers back up.
                if let Err(e) = self.pid_file.restore_from_oldbin() {
                    error!(error = %e, "restoring pid file after failed upgrade");
                }
                self.new_binary = None;
                if self.noaccepting {
                    self.restart = true;
                    self.noaccepting = false;
                }
            }

            self.table.clear(slot);
        }

        live
    }

    fn mark_exited(&mut self, pid: Pid) {
        if let Some(slot) = self.table.slot_of_pid(pid)
            && let Some(record) = self.table.get_mut(slot)
        {
            record.status.exited = true;
        }
    }

    /// Tell the surviving workers to drop the dead sibling's endpoint.
    fn broadcast_close(&mut self, dead_slot: usize) {
        let Some(dead) = self.table.get(dead_slot) else {
            return;
        };
        let msg = ChannelMsg {
            command: Command::Close,
            pid: dead.pid.as_raw(),
            slot: dead_slot as u32,
            fd: -1,
        };

        for (i, r) in self.table.iter() {
            if i == dead_slot || r.status.exited {
                continue;
            }
            let Some(fd) = r.control_fd() else { continue };
            debug!(dead_slot, to_pid = r.pid.as_raw(), "pass close channel");
            if let Err(e) = channel::send_msg(fd, &msg) {
                warn!(slot = i, error = %e, "passing close channel failed");
            }
        }
    }

    /// Re-spawn a dead respawnable child into its own slot.
    fn respawn_child(&mut self, slot: usize) -> bool {
        let Some(kind) = self.table.get(slot).map(|r| r.kind) else {
            return false;
        };
        let ChildKind::Worker { index } = kind else {
            return false;
        };

        let spawned = {
            let cfg = &self.cfg;
            let listeners = &self.listeners;
            let flags = &self.flags;
            let log_writer = &self.log_writer;
            spawn_process(
                &mut self.table,
                kind,
                "worker process",
                SpawnPolicy::AtSlot(slot),
                |table, slot| {
                    worker::worker_process_cycle(
                        cfg.clone(),
                        listeners,
                        table,
                        slot,
                        index,
                        flags.clone(),
                        log_writer.clone(),
                    );
                },
            )
        };

        match spawned {
            Ok(s) => {
                self.announce_open(s.slot);
                true
            }
            Err(e) => {
                error!(error = %e, "respawn failed");
                false
            }
        }
    }

    fn reload_config(&self) -> Result<Config, crate::core::config::ConfigError> {
        // The daemon front-end records the config source paths in the
        // environment it was started with; re-read them.
        let file = std::env::var("STOKER_CONFIG_FILE").ok();
        let inline = std::env::var("STOKER_CONFIG_INLINE").ok();
        let src = match &file {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|source| {
                crate::core::config::ConfigError::Read {
                    path: path.into(),
                    source,
                }
            })?),
            None => None,
        };
        Config::from_sources(self.cfg.prefix.clone(), src.as_deref(), inline.as_deref())
    }

    fn reopen_logs(&self) {
        if let Some(writer) = &self.log_writer
            && let Err(e) = writer.reopen()
        {
            error!(error = %e, "reopening log file failed");
        }
    }

    /// Rename the pid file to `.oldbin` and exec the new binary in a
    /// detached child that inherits the listening fds via the environment.
    fn exec_new_binary(&mut self) -> Option<Pid> {
        if let Err(e) = self.pid_file.rename_to_oldbin() {
            error!(error = %e, "renaming pid file for upgrade failed");
            return None;
        }

        let fds: Vec<RawFd> = self.listeners.iter().map(AsRawFd::as_raw_fd).collect();
        let argv = self.argv.clone();

        let spawned = spawn_process(
            &mut self.table,
            ChildKind::Helper,
            "new binary process",
            SpawnPolicy::Detached,
            |_, _| exec_inherited(&argv, &fds),
        );

        match spawned {
            Ok(s) => Some(s.pid),
            Err(e) => {
                error!(error = %e, "spawning the new binary failed");
                if let Err(e) = self.pid_file.restore_from_oldbin() {
                    error!(error = %e, "restoring pid file failed");
                }
                None
            }
        }
    }

    fn close_listeners(&mut self) {
        self.listeners.clear();
    }

    fn master_exit(&mut self) -> ! {
        self.pid_file.delete();
        info!("exit");
        self.close_listeners();
        std::process::exit(0);
    }
}

/// Child side of the upgrade: clear close-on-exec on the listener fds,
/// publish them in the environment, and exec.
fn exec_inherited(argv: &[String], fds: &[RawFd]) -> ! {
    for &fd in fds {
        // SAFETY: clearing FD_CLOEXEC on an fd this process owns.
        if unsafe { libc::fcntl(fd, libc::F_SETFD, 0) } == -1 {
            let e = std::io::Error::last_os_error();
            error!(fd, error = %e, "clearing FD_CLOEXEC failed");
            std::process::exit(2);
        }
    }
    let value = fds
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(";");
    // SAFETY: single-threaded child between fork and exec.
    unsafe { std::env::set_var(INHERITED_FDS_ENV, value) };

    let program = std::ffi::CString::new(argv[0].clone()).expect("argv is NUL-free");
    let args: Vec<std::ffi::CString> = argv
        .iter()
        .map(|a| std::ffi::CString::new(a.clone()).expect("argv is NUL-free"))
        .collect();
    let err = nix::unistd::execv(&program, &args).unwrap_err();
    error!(program = %argv[0], error = %err, "execv failed");
    std::process::exit(2);
}

/// Detach from the controlling terminal: fork (the parent exits), start a
/// new session, and point stdio at `/dev/null`.
///
/// # Errors
///
/// Propagates `fork`/`setsid`/`open` failures - fatal at startup.
pub fn daemonize() -> std::io::Result<()> {
    // SAFETY: called once, single-threaded, before the reactor exists.
    match unsafe { nix::unistd::fork() }.map_err(std::io::Error::other)? {
        nix::unistd::ForkResult::Parent { .. } => std::process::exit(0),
        nix::unistd::ForkResult::Child => {}
    }
    nix::unistd::setsid().map_err(std::io::Error::other)?;

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    for target in 0..=2 {
        nix::unistd::dup2(devnull.as_raw_fd(), target).map_err(std::io::Error::other)?;
    }
    Ok(())
}

/// Reconstruct listeners handed down by an old master across exec.
///
/// Returns `None` when the environment variable is absent (a fresh start).
#[must_use]
pub fn inherited_listeners() -> Option<Vec<TcpListener>> {
    let value = std::env::var(INHERITED_FDS_ENV).ok()?;
    let mut listeners = vec![];
    for part in value.split(';').filter(|p| !p.is_empty()) {
        let Ok(fd) = part.parse::<RawFd>() else {
            warn!(part, "ignoring malformed inherited fd");
            continue;
        };
        // SAFETY: the old master put exactly these listener fds in the
        // environment before exec.
        let listener = unsafe { TcpListener::from_raw_fd(fd) };
        if let Err(e) = listener.set_nonblocking(true) {
            warn!(fd, error = %e, "inherited fd is not usable");
            continue;
        }
        listeners.push(listener);
    }
    Some(listeners)
}
