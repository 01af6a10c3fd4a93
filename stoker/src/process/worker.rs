// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The worker process: one reactor, one connection pool, all traffic.
//!
//! A worker inherits the listening sockets and its channel endpoint across
//! `fork`, drops the privileges and resources it was told to, and then
//! loops in `process_events_and_timers` until the master (or a signal)
//! tells it to stop. Every handler is cooperative: the only suspension
//! point is the reactor's kernel wait.
//!
//! Handler dispatch is a match on [`HandlerKind`] - the explicit-state
//! rendition of the original's per-event function pointers.

use std::{io::Write, net::TcpListener as StdTcpListener, os::fd::AsRawFd};

use tracing::{debug, error, info, trace, warn};

use crate::{conn::{ConnId, ConnIo, ConnRegistry, Dir, HandlerKind},
            core::{buf::ReadBuf,
                   config::Config,
                   log::ReopenableWriter,
                   time::{self, CachedClock}},
            event::{AcceptMutex, PostedQueues, Reactor, TimerSet, TimerTarget,
                    WaitOutcome},
            http::{self, BodyProgress, HeadStatus, PostAction, status_line},
            process::{channel::{self, Command, RecvOutcome},
                      signals::{self, SignalFlags},
                      table::ProcessTable}};

/// Capacity of the kernel event batch per tick.
const EVENT_BATCH: usize = 512;

/// Worker entry point, called in the child right after `fork`. Never
/// returns.
pub fn worker_process_cycle(
    cfg: Config,
    listeners: &[StdTcpListener],
    table: &mut ProcessTable,
    slot: usize,
    index: usize,
    flags: SignalFlags,
    log_writer: Option<ReopenableWriter>,
) -> ! {
    let mut worker = match Worker::init(cfg, listeners, table, slot, index, flags, log_writer)
    {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "worker initialization failed");
            std::process::exit(2);
        }
    };
    worker.run()
}

#[derive(Debug)]
struct Worker {
    cfg: Config,
    flags: SignalFlags,
    table: ProcessTable,
    slot: usize,
    registry: ConnRegistry,
    reactor: Reactor,
    posted: PostedQueues,
    timers: TimerSet,
    clock: CachedClock,
    listeners: Vec<ConnId>,
    listeners_active: bool,
    accept_mutex: Option<AcceptMutex>,
    accept_disabled: i64,
    post_events: bool,
    exiting: bool,
    log_writer: Option<ReopenableWriter>,
    ready_scratch: Vec<crate::event::ReadyEvent>,
}

impl Worker {
    /// Worker init: tuning, signal mask, channel registration, listener
    /// setup. Failures here are fatal (exit status 2).
    fn init(
        cfg: Config,
        listeners: &[StdTcpListener],
        table: &mut ProcessTable,
        slot: usize,
        index: usize,
        flags: SignalFlags,
        log_writer: Option<ReopenableWriter>,
    ) -> std::io::Result<Self> {
        let mut table = std::mem::take(table);

        apply_process_tuning(&cfg, index)?;

        signals::clear_signal_mask().map_err(std::io::Error::other)?;

        if !cfg.timer_resolution.is_zero() {
            time::set_timer_resolution(cfg.timer_resolution)?;
        }

        // Close the endpoints that belong to other processes: siblings'
        // worker-side fds and our own master-side fd.
        let own_fd = {
            let mut own = None;
            for (i, record) in table.iter_mut() {
                if i == slot {
                    record.master_fd = None;
                    own = record.worker_fd.as_ref().map(AsRawFd::as_raw_fd);
                } else {
                    record.worker_fd = None;
                }
            }
            own
        };

        debug!(slot, index, "worker process init");

        let reactor = Reactor::new(EVENT_BATCH)?;
        let mut registry = ConnRegistry::new(cfg.worker_connections);
        let timers = TimerSet::new();
        let clock = CachedClock::new();

        // The channel endpoint is a connection like any other.
        if let Some(fd) = own_fd {
            let id = registry
                .acquire(ConnIo::Raw(fd), fd)
                .ok_or_else(|| std::io::Error::other("connection pool too small"))?;
            let c = registry.get_mut(id).expect("just acquired");
            c.read.handler = HandlerKind::Channel;
            c.read.channel = true;
            reactor.add_event(c, id, Dir::Read)?;
        }

        let mut listener_ids = vec![];
        for l in listeners {
            let std_l = l.try_clone()?;
            std_l.set_nonblocking(true)?;
            let mio_l = mio::net::TcpListener::from_std(std_l);
            let fd = mio_l.as_raw_fd();
            let id = registry
                .acquire(ConnIo::Listener(mio_l), fd)
                .ok_or_else(|| std::io::Error::other("connection pool too small"))?;
            let c = registry.get_mut(id).expect("just acquired");
            c.read.handler = HandlerKind::Accept;
            c.read.accept = true;
            listener_ids.push(id);
        }

        let accept_mutex = if cfg.accept_mutex && listener_ids.len() < registry.capacity() {
            let path = cfg.prefix.join("stoker_accept.lock");
            Some(AcceptMutex::open(&path)?)
        } else {
            None
        };

        let mut worker = Self {
            cfg,
            flags,
            table,
            slot,
            registry,
            reactor,
            posted: PostedQueues::new(),
            timers,
            clock,
            listeners: listener_ids,
            listeners_active: false,
            accept_mutex,
            accept_disabled: 0,
            post_events: false,
            exiting: false,
            log_writer,
            ready_scratch: Vec::with_capacity(EVENT_BATCH),
        };

        // Without the accept mutex every worker keeps its listeners
        // registered permanently.
        if worker.accept_mutex.is_none() {
            worker.enable_accept_events();
        }

        Ok(worker)
    }

    fn run(&mut self) -> ! {
        loop {
            if self.exiting
                && self.registry.active_count() <= self.channel_conn_count()
                && self.timers.only_cancelable_left()
            {
                info!(slot = self.slot, "exiting");
                std::process::exit(0);
            }

            debug!("worker cycle");
            self.process_events_and_timers();

            if signals::take(&self.flags.terminate) {
                info!("exiting");
                std::process::exit(0);
            }

            if signals::take(&self.flags.quit) && !self.exiting {
                info!("gracefully shutting down");
                self.exiting = true;
                self.close_listeners();
                self.timers.add(
                    self.clock.now() + self.cfg.shutdown_timeout,
                    TimerTarget::Shutdown,
                    true,
                );
            }

            if signals::take(&self.flags.reopen) {
                info!("reopening logs");
                if let Some(writer) = &self.log_writer
                    && let Err(e) = writer.reopen()
                {
                    error!(error = %e, "reopening log file failed");
                }
            }
        }
    }

    fn channel_conn_count(&self) -> usize {
        usize::from(self.registry.live_ids().iter().any(|id| {
            self.registry
                .get(*id)
                .is_some_and(|c| c.read.channel)
        }))
    }

    /// One reactor tick: wait, dispatch/post, expire timers, release the
    /// accept mutex, drain the posted queues (accept first).
    fn process_events_and_timers(&mut self) {
        let mut timeout = self.timers.next_timeout(self.clock.now());

        if self.accept_mutex.is_some() && !self.exiting {
            if self.accept_disabled > 0 {
                self.accept_disabled -= 1;
            } else {
                let held = self
                    .accept_mutex
                    .as_mut()
                    .expect("checked above")
                    .try_lock()
                    .unwrap_or(false);
                if held {
                    if !self.listeners_active {
                        self.enable_accept_events();
                    }
                    self.post_events = true;
                } else {
                    if self.listeners_active {
                        self.disable_accept_events();
                    }
                    let delay = self.cfg.accept_mutex_delay;
                    timeout = Some(timeout.map_or(delay, |t| t.min(delay)));
                }
            }
        }

        let mut ready = std::mem::take(&mut self.ready_scratch);
        ready.clear();
        let outcome = self.reactor.wait(timeout, &mut ready);

        // Refresh the cached clock: every tick without a resolution
        // alarm, else only when the alarm fired.
        if self.cfg.timer_resolution.is_zero() || signals::take(&self.flags.alarm) {
            self.clock.update();
        }

        match outcome {
            Ok(WaitOutcome::Interrupted) => trace!("wait interrupted"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "event wait failed"),
        }

        for i in 0..ready.len() {
            let ev = ready[i];
            if self.registry.get(ev.id).is_none() {
                // Stale event: the fd was closed and the slot recycled
                // within this iteration.
                trace!(slot = ev.id.slot, "stale event");
                continue;
            }

            // Fuse error/hangup into both directions so at least one
            // handler observes the condition.
            let readable = ev.readable || ev.error;
            let writable = ev.writable || ev.error;

            if readable {
                self.route(ev.id, Dir::Read);
            }
            if writable {
                self.route(ev.id, Dir::Write);
            }
        }
        self.ready_scratch = ready;

        let mut fired = vec![];
        self.timers.expire(self.clock.now(), &mut fired);
        for target in fired {
            match target {
                TimerTarget::Event { conn, dir } => {
                    let Some(c) = self.registry.get_mut(conn) else {
                        continue;
                    };
                    let ev = c.event_mut(dir);
                    ev.timedout = true;
                    ev.timer = None;
                    self.dispatch(conn, dir);
                }
                TimerTarget::Shutdown => {
                    info!("graceful shutdown timed out, exiting");
                    std::process::exit(0);
                }
            }
        }

        // Release the lock before any queued handler runs.
        if let Some(m) = &mut self.accept_mutex {
            m.unlock();
        }
        self.post_events = false;

        while let Some(p) = self.posted.pop() {
            if let Some(c) = self.registry.get_mut(p.conn) {
                c.event_mut(p.dir).posted = false;
                self.dispatch(p.conn, p.dir);
            }
        }
    }

    /// Post or dispatch one ready direction, re-validating the handle.
    fn route(&mut self, id: ConnId, dir: Dir) {
        let post = self.post_events;
        let Some(c) = self.registry.get_mut(id) else {
            return;
        };
        let ev = c.event_mut(dir);
        if !ev.active {
            return;
        }
        ev.ready = true;
        let to_accept = ev.accept && dir == Dir::Read;
        if post {
            if !ev.posted {
                ev.posted = true;
                self.posted.post(id, dir, to_accept);
            }
        } else {
            self.dispatch(id, dir);
        }
    }

    fn dispatch(&mut self, id: ConnId, dir: Dir) {
        let Some(c) = self.registry.get(id) else {
            return;
        };
        match c.event(dir).handler {
            HandlerKind::None | HandlerKind::EmptyWrite => {}
            HandlerKind::Accept => self.accept_handler(id),
            HandlerKind::Channel => self.channel_handler(id),
            HandlerKind::ReadRequestHead => self.read_head_handler(id),
            HandlerKind::ReadRequestBody => self.read_body_handler(id),
            HandlerKind::DiscardRequestBody => self.discard_body_handler(id),
            HandlerKind::BlockReading => self.block_reading_handler(id),
        }
    }

    // ── accept ──────────────────────────────────────────────────────────

    fn accept_handler(&mut self, id: ConnId) {
        loop {
            let accepted = {
                let Some(c) = self.registry.get_mut(id) else {
                    return;
                };
                let ConnIo::Listener(listener) = &mut c.io else {
                    return;
                };
                match listener.accept() {
                    Ok(pair) => pair,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        c.read.ready = false;
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        return;
                    }
                }
            };

            let (stream, peer) = accepted;
            let fd = stream.as_raw_fd();
            let Some(new_id) = self.registry.acquire(ConnIo::Stream(stream), fd) else {
                warn!("worker_connections are not enough");
                return;
            };
            trace!(fd, %peer, "accepted connection");

            // Connection-pressure heuristic feeding the accept-mutex
            // back-off.
            self.accept_disabled =
                self.registry.capacity() as i64 / 8 - self.registry.free_count() as i64;

            let deadline = self.clock.now() + self.cfg.client_header_timeout;
            let c = self.registry.get_mut(new_id).expect("just acquired");
            c.read.handler = HandlerKind::ReadRequestHead;
            c.write.handler = HandlerKind::EmptyWrite;
            if let Err(e) = self.reactor.add_event(c, new_id, Dir::Read) {
                error!(error = %e, "registering accepted connection failed");
                self.close_connection(new_id);
                continue;
            }
            let handle = self.timers.add(
                deadline,
                TimerTarget::Event {
                    conn: new_id,
                    dir: Dir::Read,
                },
                false,
            );
            if let Some(c) = self.registry.get_mut(new_id) {
                c.read.timer = Some(handle);
            }
        }
    }

    fn enable_accept_events(&mut self) {
        for id in self.listeners.clone() {
            let Some(c) = self.registry.get_mut(id) else {
                continue;
            };
            if !c.read.active
                && let Err(e) = self.reactor.add_event(c, id, Dir::Read)
            {
                error!(error = %e, "enabling accept events failed");
            }
        }
        self.listeners_active = true;
    }

    fn disable_accept_events(&mut self) {
        for id in self.listeners.clone() {
            let Some(c) = self.registry.get_mut(id) else {
                continue;
            };
            if c.read.active
                && let Err(e) = self.reactor.del_event(c, id, Dir::Read, false)
            {
                error!(error = %e, "disabling accept events failed");
            }
        }
        self.listeners_active = false;
    }

    fn close_listeners(&mut self) {
        for id in std::mem::take(&mut self.listeners) {
            if let Some(c) = self.registry.get_mut(id) {
                let _ = self.reactor.del_event(c, id, Dir::Read, true);
            }
            self.registry.release(id);
        }
        self.listeners_active = false;
    }

    // ── master channel ──────────────────────────────────────────────────

    fn channel_handler(&mut self, id: ConnId) {
        loop {
            let fd = {
                let Some(c) = self.registry.get(id) else {
                    return;
                };
                let ConnIo::Raw(fd) = &c.io else { return };
                *fd
            };

            match channel::recv_msg(fd) {
                Ok(RecvOutcome::Msg(msg)) => {
                    debug!(command = ?msg.command, slot = msg.slot, "channel command");
                    match msg.command {
                        Command::Quit => signals::raise(&self.flags.quit),
                        Command::Terminate => signals::raise(&self.flags.terminate),
                        Command::Reopen => signals::raise(&self.flags.reopen),
                        Command::Open => {
                            self.table.record_open(
                                msg.slot as usize,
                                nix::unistd::Pid::from_raw(msg.pid),
                                msg.fd,
                            );
                        }
                        Command::Close => {
                            self.table.close_sibling(msg.slot as usize);
                        }
                    }
                }
                Ok(RecvOutcome::Again) => return,
                Ok(RecvOutcome::Closed) | Err(_) => {
                    // The master is gone; drop the channel connection and
                    // keep serving until told otherwise.
                    warn!("master channel closed");
                    self.close_connection(id);
                    return;
                }
            }
        }
    }

    // ── request head ────────────────────────────────────────────────────

    fn read_head_handler(&mut self, id: ConnId) {
        let timedout = {
            let Some(c) = self.registry.get_mut(id) else {
                return;
            };
            if c.head_buf.is_none() {
                c.head_buf = Some(ReadBuf::with_capacity(self.cfg.client_header_buffer_size));
            }
            c.read.timedout
        };
        if timedout {
            self.finalize_request(id, 408);
            return;
        }

        loop {
            let full = {
                let Some(c) = self.registry.get(id) else {
                    return;
                };
                c.head_buf.as_ref().is_none_or(ReadBuf::is_full)
            };
            if full {
                // Head larger than the header buffer.
                self.finalize_request(id, 400);
                return;
            }

            let read = {
                let Some(c) = self.registry.get_mut(id) else {
                    return;
                };
                let (io, head_buf) = (&mut c.io, &mut c.head_buf);
                let ConnIo::Stream(stream) = io else { return };
                let buf = head_buf.as_mut().expect("created above");
                let space = buf.space();
                buf.fill_from(stream, space)
            };

            match read {
                Ok(0) => {
                    self.close_connection(id);
                    return;
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!(error = %e, "reading request head failed");
                    self.close_connection(id);
                    return;
                }
            }

            let parsed = {
                let Some(c) = self.registry.get_mut(id) else {
                    return;
                };
                let buf = c.head_buf.as_mut().expect("created above");
                http::parse_request_head(buf)
            };

            match parsed {
                Ok(HeadStatus::Complete(request)) => {
                    let Some(c) = self.registry.get_mut(id) else {
                        return;
                    };
                    c.head_buf = None;
                    c.request = Some(*request);
                    if let Some(h) = c.read.timer.take() {
                        self.timers.cancel(h);
                    }
                    self.handle_request(id);
                    return;
                }
                Ok(HeadStatus::Partial) => {}
                Err(_) => {
                    self.finalize_request(id, 400);
                    return;
                }
            }
        }
    }

    /// The built-in content phase: read the body, then answer `200`.
    fn handle_request(&mut self, id: ConnId) {
        // A declared length over the limit is rejected before any body
        // byte is read.
        let too_large = {
            let Some(c) = self.registry.get(id) else {
                return;
            };
            c.request.as_ref().is_some_and(|r| {
                self.cfg.client_max_body_size > 0
                    && r.content_length_n > 0
                    && r.content_length_n as u64 > self.cfg.client_max_body_size
            })
        };
        if too_large {
            if let Some(c) = self.registry.get_mut(id)
                && let Some(r) = c.request.as_mut()
            {
                warn!(
                    declared = r.content_length_n,
                    "client intended to send too large body"
                );
                r.lingering_close = true;
            }
            self.finalize_request(id, 413);
            return;
        }

        let outcome = {
            let Some(c) = self.registry.get_mut(id) else {
                return;
            };
            let (io, request) = (&mut c.io, &mut c.request);
            let ConnIo::Stream(stream) = io else { return };
            let Some(r) = request.as_mut() else { return };
            http::read_request_body(r, stream, &self.cfg, PostAction::Respond(200))
        };
        self.after_body(id, outcome);
    }

    fn read_body_handler(&mut self, id: ConnId) {
        {
            let Some(c) = self.registry.get_mut(id) else {
                return;
            };
            if c.read.timedout {
                self.finalize_request(id, 408);
                return;
            }
        }

        let outcome = {
            let Some(c) = self.registry.get_mut(id) else {
                return;
            };
            let (io, request) = (&mut c.io, &mut c.request);
            let ConnIo::Stream(stream) = io else { return };
            let Some(r) = request.as_mut() else { return };
            http::do_read_body(r, stream, &self.cfg)
        };
        self.after_body(id, outcome);
    }

    fn after_body(
        &mut self,
        id: ConnId,
        outcome: Result<BodyProgress, http::BodyError>,
    ) {
        match outcome {
            Ok(BodyProgress::Complete) => {
                // Cancel the body timer, guard further reads, run the
                // post action exactly once.
                let post = {
                    let Some(c) = self.registry.get_mut(id) else {
                        return;
                    };
                    if let Some(h) = c.read.timer.take() {
                        self.timers.cancel(h);
                    }
                    c.read.handler = HandlerKind::BlockReading;
                    c.request
                        .as_mut()
                        .and_then(|r| r.body.as_mut())
                        .and_then(|rb| rb.post.take())
                };
                let status = match post {
                    Some(PostAction::Respond(s)) => s,
                    None => 200,
                };
                self.finalize_request(id, status);
            }
            Ok(BodyProgress::Again) => {
                let deadline = self.clock.now() + self.cfg.client_body_timeout;
                let Some(c) = self.registry.get_mut(id) else {
                    return;
                };
                c.read.handler = HandlerKind::ReadRequestBody;
                c.write.handler = HandlerKind::EmptyWrite;
                if let Some(h) = c.read.timer.take() {
                    self.timers.cancel(h);
                }
                let handle = self.timers.add(
                    deadline,
                    TimerTarget::Event {
                        conn: id,
                        dir: Dir::Read,
                    },
                    false,
                );
                if let Some(c) = self.registry.get_mut(id) {
                    c.read.timer = Some(handle);
                }
            }
            Err(e) => {
                if e.status() == 413
                    && let Some(c) = self.registry.get_mut(id)
                    && let Some(r) = c.request.as_mut()
                {
                    r.lingering_close = true;
                }
                warn!(error = %e, status = e.status(), "request body failed");
                self.finalize_request(id, e.status());
            }
        }
    }

    // ── finalization ────────────────────────────────────────────────────

    /// Write the status line, then close - through the lingering phase
    /// when the request asked for it.
    fn finalize_request(&mut self, id: ConnId, status: u16) {
        let lingering = {
            let Some(c) = self.registry.get_mut(id) else {
                return;
            };
            if let ConnIo::Stream(stream) = &mut c.io {
                let _ = stream.write(status_line(status).as_bytes());
            }
            c.request.as_ref().is_some_and(|r| r.lingering_close)
        };

        if lingering {
            self.start_lingering_close(id);
        } else {
            self.close_connection(id);
        }
    }

    /// Half-close: keep reading (and discarding) so the client can finish
    /// sending before we close.
    fn start_lingering_close(&mut self, id: ConnId) {
        let now = self.clock.now();
        let lingering_deadline = now + self.cfg.lingering_time;
        {
            let Some(c) = self.registry.get_mut(id) else {
                return;
            };
            c.read.handler = HandlerKind::DiscardRequestBody;
            c.write.handler = HandlerKind::None;
            if let Some(r) = c.request.as_mut() {
                r.lingering_deadline = Some(lingering_deadline);
                r.discard_body = true;
                // The discard walk runs off the raw byte counters from
                // here on.
                if r.content_length_n < 0 {
                    r.content_length_n = i64::MAX;
                    r.chunked = false;
                }
            }
        }
        self.arm_lingering_timer(id);
        // Drain whatever is already buffered.
        self.discard_body_handler(id);
    }

    fn arm_lingering_timer(&mut self, id: ConnId) {
        let deadline = self.clock.now() + self.cfg.lingering_timeout;
        let handle = self.timers.add(
            deadline,
            TimerTarget::Event {
                conn: id,
                dir: Dir::Read,
            },
            true,
        );
        if let Some(c) = self.registry.get_mut(id) {
            if let Some(old) = c.read.timer.replace(handle) {
                self.timers.cancel(old);
            }
        }
    }

    fn discard_body_handler(&mut self, id: ConnId) {
        let expired = {
            let Some(c) = self.registry.get_mut(id) else {
                return;
            };
            if c.read.timedout {
                c.read.timedout = false;
                true
            } else {
                c.request
                    .as_ref()
                    .and_then(|r| r.lingering_deadline)
                    .is_some_and(|d| d <= self.clock.now())
            }
        };
        if expired {
            self.close_connection(id);
            return;
        }

        let outcome = {
            let Some(c) = self.registry.get_mut(id) else {
                return;
            };
            let (io, request) = (&mut c.io, &mut c.request);
            let ConnIo::Stream(stream) = io else { return };
            let Some(r) = request.as_mut() else { return };
            http::read_discarded_body(r, stream)
        };

        match outcome {
            Ok(BodyProgress::Complete) | Err(_) => self.close_connection(id),
            Ok(BodyProgress::Again) => self.arm_lingering_timer(id),
        }
    }

    fn block_reading_handler(&mut self, id: ConnId) {
        // Unexpected readiness while nobody wants the data; errors and
        // hangups surface on the next real read.
        if let Some(c) = self.registry.get_mut(id) {
            c.read.ready = false;
        }
    }

    fn close_connection(&mut self, id: ConnId) {
        let Some(c) = self.registry.get_mut(id) else {
            return;
        };
        if let Some(h) = c.read.timer.take() {
            self.timers.cancel(h);
        }
        if let Some(h) = c.write.timer.take() {
            self.timers.cancel(h);
        }
        let _ = self.reactor.del_event(c, id, Dir::Read, true);
        let _ = self.reactor.del_event(c, id, Dir::Write, true);
        trace!(fd = c.fd, "close connection");
        self.registry.release(id);
    }
}

/// Priority, rlimits, identity, affinity, working directory - the fatal
/// subset returns an error and the worker exits with status 2.
fn apply_process_tuning(cfg: &Config, index: usize) -> std::io::Result<()> {
    if cfg.worker_priority != 0 {
        // SAFETY: plain syscall.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, cfg.worker_priority) };
        if rc == -1 {
            warn!(
                priority = cfg.worker_priority,
                error = %std::io::Error::last_os_error(),
                "setpriority failed"
            );
        }
    }

    if let Some(nofile) = cfg.worker_rlimit_nofile
        && let Err(e) = nix::sys::resource::setrlimit(
            nix::sys::resource::Resource::RLIMIT_NOFILE,
            nofile,
            nofile,
        )
    {
        warn!(nofile, error = %e, "setrlimit(RLIMIT_NOFILE) failed");
    }

    if let Some(name) = &cfg.user
        && nix::unistd::geteuid().is_root()
    {
        let user = nix::unistd::User::from_name(name)
            .map_err(std::io::Error::other)?
            .ok_or_else(|| std::io::Error::other(format!("unknown user {name:?}")))?;
        nix::unistd::setgid(user.gid).map_err(std::io::Error::other)?;
        nix::unistd::setuid(user.uid).map_err(std::io::Error::other)?;
    }

    if !cfg.worker_cpu_affinity.is_empty() {
        let cpu = cfg.worker_cpu_affinity[index % cfg.worker_cpu_affinity.len()];
        let mut set = nix::sched::CpuSet::new();
        if set.set(cpu).is_ok() {
            if let Err(e) =
                nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set)
            {
                warn!(cpu, error = %e, "sched_setaffinity failed");
            }
        } else {
            warn!(cpu, "cpu index out of range for affinity mask");
        }
    }

    if let Some(dir) = &cfg.working_directory {
        std::env::set_current_dir(dir)?;
    }

    Ok(())
}
