// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The kernel-interface half of the reactor: registration bookkeeping over
//! [`mio::Poll`] and the readiness wait.
//!
//! Registration follows the sibling-union rule: a connection's read and
//! write events are independent `active` bits over one underlying fd, so
//! adding one direction while the other is already registered is a
//! *re-registration* with the union interest set, and removing one
//! direction while the sibling stays active narrows the interest instead
//! of deregistering. Removing with `close == true` is a no-op beyond
//! clearing the `active` bit - the kernel drops closed fds on its own.
//!
//! Every registration carries the slot's [`ConnId`] packed into the token;
//! the dispatch side compares generations and silently discards stale
//! events (see [`crate::conn`]).

use std::{io, time::Duration};

use mio::{Events, Interest, Poll, Token, Waker, unix::SourceFd};

use crate::conn::{ConnId, ConnIo, Connection, Dir};

/// Token reserved for the cross-thread/notify waker; never a slot handle.
pub const WAKER_TOKEN: Token = Token(usize::MAX);

/// One readiness report, decoded from the kernel event.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub id: ConnId,
    pub readable: bool,
    pub writable: bool,
    /// Error/hangup was reported; fused into read/write by the dispatcher
    /// so at least one handler observes the condition.
    pub error: bool,
}

/// Outcome of one kernel wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
    /// `EINTR` - typically the timer-resolution alarm.
    Interrupted,
}

#[derive(Debug)]
pub struct Reactor {
    poll: Poll,
    events: Events,
}

impl Reactor {
    /// # Errors
    ///
    /// Fails when the kernel readiness facility cannot be created (fd
    /// exhaustion) - fatal during worker init.
    pub fn new(event_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(event_capacity),
        })
    }

    /// Create the notify waker bound to this reactor (replaces the
    /// original's eventfd notify channel).
    ///
    /// # Errors
    ///
    /// Propagates waker creation failure.
    pub fn waker(&self) -> io::Result<Waker> {
        Waker::new(self.poll.registry(), WAKER_TOKEN)
    }

    /// Register interest for one direction, honoring the sibling-union
    /// rule. Sets the event's `active` bit on success.
    ///
    /// # Errors
    ///
    /// Propagates `epoll_ctl` failures; the caller finalizes the
    /// connection.
    pub fn add_event(&self, c: &mut Connection, id: ConnId, dir: Dir) -> io::Result<()> {
        let sibling_active = c.event(sibling(dir)).active;
        let interest = if sibling_active {
            Interest::READABLE | Interest::WRITABLE
        } else {
            direction_interest(dir)
        };

        self.apply(c, id.token(), Some(interest), sibling_active)?;
        c.event_mut(dir).active = true;
        Ok(())
    }

    /// Drop interest for one direction.
    ///
    /// With `close == true` only the `active` bit is cleared: the fd is
    /// about to be closed and the kernel removes it automatically.
    ///
    /// # Errors
    ///
    /// Propagates `epoll_ctl` failures.
    pub fn del_event(
        &self,
        c: &mut Connection,
        id: ConnId,
        dir: Dir,
        close: bool,
    ) -> io::Result<()> {
        if close {
            c.event_mut(dir).active = false;
            return Ok(());
        }

        let sibling_active = c.event(sibling(dir)).active;
        let interest = sibling_active.then(|| direction_interest(sibling(dir)));
        self.apply(c, id.token(), interest, true)?;
        c.event_mut(dir).active = false;
        Ok(())
    }

    fn apply(
        &self,
        c: &mut Connection,
        token: Token,
        interest: Option<Interest>,
        registered: bool,
    ) -> io::Result<()> {
        let registry = self.poll.registry();
        match (&mut c.io, interest, registered) {
            (ConnIo::Stream(s), Some(i), false) => registry.register(s, token, i),
            (ConnIo::Stream(s), Some(i), true) => registry.reregister(s, token, i),
            (ConnIo::Stream(s), None, _) => registry.deregister(s),
            (ConnIo::Listener(l), Some(i), false) => registry.register(l, token, i),
            (ConnIo::Listener(l), Some(i), true) => registry.reregister(l, token, i),
            (ConnIo::Listener(l), None, _) => registry.deregister(l),
            (ConnIo::Raw(fd), Some(i), false) => {
                registry.register(&mut SourceFd(fd), token, i)
            }
            (ConnIo::Raw(fd), Some(i), true) => {
                registry.reregister(&mut SourceFd(fd), token, i)
            }
            (ConnIo::Raw(fd), None, _) => registry.deregister(&mut SourceFd(fd)),
            (ConnIo::None, ..) => Err(io::Error::other("event on a freed connection slot")),
        }
    }

    /// Block until readiness, timeout, or `EINTR`; decode kernel events
    /// into `ready`.
    ///
    /// # Errors
    ///
    /// Propagates wait failures other than `EINTR`.
    pub fn wait(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<ReadyEvent>,
    ) -> io::Result<WaitOutcome> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok(WaitOutcome::Interrupted);
            }
            Err(e) => return Err(e),
        }

        let mut any = false;
        for event in self.events.iter() {
            any = true;
            if event.token() == WAKER_TOKEN {
                continue;
            }
            ready.push(ReadyEvent {
                id: ConnId::from_token(event.token()),
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable() || event.is_write_closed(),
                error: event.is_error(),
            });
        }

        Ok(if any {
            WaitOutcome::Ready
        } else {
            WaitOutcome::TimedOut
        })
    }
}

fn sibling(dir: Dir) -> Dir {
    match dir {
        Dir::Read => Dir::Write,
        Dir::Write => Dir::Read,
    }
}

fn direction_interest(dir: Dir) -> Interest {
    match dir {
        Dir::Read => Interest::READABLE,
        Dir::Write => Interest::WRITABLE,
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, net::TcpStream as StdTcpStream};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::conn::ConnRegistry;

    /// Register a loopback connection, write to it from the peer, and
    /// check that the readiness report carries the right handle.
    #[test]
    fn test_readiness_carries_the_slot_handle() {
        let mut reactor = Reactor::new(64).unwrap();
        let mut registry = ConnRegistry::new(4);

        let listener =
            mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut peer = StdTcpStream::connect(addr).unwrap();

        // Accept the peer and park it in a slot.
        let (stream, _) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };
        let fd = {
            use std::os::fd::AsRawFd;
            stream.as_raw_fd()
        };
        let id = registry.acquire(ConnIo::Stream(stream), fd).unwrap();

        let c = registry.get_mut(id).unwrap();
        reactor.add_event(c, id, Dir::Read).unwrap();
        assert!(c.read.active);
        assert!(!c.write.active);

        peer.write_all(b"ping").unwrap();

        let mut ready = vec![];
        let outcome = reactor
            .wait(Some(Duration::from_secs(2)), &mut ready)
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Ready);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, id);
        assert!(ready[0].readable);
    }

    #[test]
    fn test_wait_times_out_with_no_events() {
        let mut reactor = Reactor::new(8).unwrap();
        let mut ready = vec![];
        let outcome = reactor
            .wait(Some(Duration::from_millis(10)), &mut ready)
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(ready.is_empty());
    }

    #[test]
    fn test_del_event_with_close_only_clears_active() {
        let reactor = Reactor::new(8).unwrap();
        let mut registry = ConnRegistry::new(1);
        let id = registry.acquire(ConnIo::None, 9).unwrap();
        let c = registry.get_mut(id).unwrap();
        c.read.active = true;

        // No kernel call is made for a closing fd, so ConnIo::None is fine.
        reactor.del_event(c, id, Dir::Read, true).unwrap();
        assert!(!c.read.active);
    }
}
