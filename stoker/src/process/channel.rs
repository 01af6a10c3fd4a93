// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The inter-process control channel.
//!
//! One `AF_UNIX`/`SOCK_STREAM` socketpair is created per worker before
//! fork: the master keeps endpoint 0, the worker endpoint 1. Messages are
//! fixed 16-byte records. `Open` additionally carries the announced
//! sibling's master-side descriptor in `SCM_RIGHTS` ancillary data, so
//! every worker ends up holding every sibling's endpoint and can survive a
//! later `Close` for a dead sibling by slot.
//!
//! Short reads are surfaced as [`RecvOutcome::Again`] and retried on the
//! next readiness event.

use std::{io::{IoSlice, IoSliceMut},
          os::fd::{OwnedFd, RawFd}};

use nix::{cmsg_space,
          errno::Errno,
          sys::socket::{AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
                        SockFlag, SockType, recvmsg, sendmsg, socketpair}};

/// Wire size of one channel record.
pub const CHANNEL_MSG_SIZE: usize = 16;

/// Channel command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// Announce a sibling: record its master-side descriptor.
    Open = 1,
    /// A sibling died: close its stored descriptor.
    Close = 2,
    /// Graceful shutdown.
    Quit = 3,
    /// Fast shutdown.
    Terminate = 4,
    /// Reopen log files.
    Reopen = 5,
}

impl TryFrom<u32> for Command {
    type Error = ChannelError;

    fn try_from(v: u32) -> Result<Self, ChannelError> {
        match v {
            1 => Ok(Self::Open),
            2 => Ok(Self::Close),
            3 => Ok(Self::Quit),
            4 => Ok(Self::Terminate),
            5 => Ok(Self::Reopen),
            other => Err(ChannelError::UnknownCommand(other)),
        }
    }
}

/// One fixed-size channel record: `{command, pid, slot, fd}`. `fd` is `-1`
/// except for [`Command::Open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelMsg {
    pub command: Command,
    pub pid: i32,
    pub slot: u32,
    pub fd: RawFd,
}

impl ChannelMsg {
    /// A command-only record (no pid/slot/fd payload).
    #[must_use]
    pub fn bare(command: Command) -> Self {
        Self {
            command,
            pid: 0,
            slot: 0,
            fd: -1,
        }
    }

    #[must_use]
    pub fn pack(&self) -> [u8; CHANNEL_MSG_SIZE] {
        let mut out = [0u8; CHANNEL_MSG_SIZE];
        out[0..4].copy_from_slice(&(self.command as u32).to_ne_bytes());
        out[4..8].copy_from_slice(&self.pid.to_ne_bytes());
        out[8..12].copy_from_slice(&self.slot.to_ne_bytes());
        out[12..16].copy_from_slice(&self.fd.to_ne_bytes());
        out
    }

    /// # Errors
    ///
    /// Returns [`ChannelError::UnknownCommand`] for a command code this
    /// build does not know.
    pub fn unpack(raw: &[u8; CHANNEL_MSG_SIZE]) -> Result<Self, ChannelError> {
        let word = |i: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&raw[i..i + 4]);
            b
        };
        Ok(Self {
            command: Command::try_from(u32::from_ne_bytes(word(0)))?,
            pid: i32::from_ne_bytes(word(4)),
            slot: u32::from_ne_bytes(word(8)),
            fd: RawFd::from_ne_bytes(word(12)),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("unknown channel command {0}")]
    UnknownCommand(u32),
    #[error("channel socketpair failed: {0}")]
    SocketPair(Errno),
    #[error("channel send failed: {0}")]
    Send(Errno),
    #[error("channel recv failed: {0}")]
    Recv(Errno),
}

/// Result of one non-blocking channel read.
#[derive(Debug)]
pub enum RecvOutcome {
    Msg(ChannelMsg),
    /// Nothing (or not enough) to read yet; retry on the next event.
    Again,
    /// The peer closed its endpoint.
    Closed,
}

/// Create the per-worker channel pair (non-blocking, close-on-exec).
/// Index 0 is the master side, index 1 the worker side.
///
/// # Errors
///
/// Returns [`ChannelError::SocketPair`] on fd exhaustion.
pub fn create_channel() -> Result<(OwnedFd, OwnedFd), ChannelError> {
    socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
    )
    .map_err(ChannelError::SocketPair)
}

/// Send one record. For `Open` with a live `fd`, the descriptor rides in
/// ancillary data so the receiver gets its own copy.
///
/// # Errors
///
/// `EAGAIN` is surfaced as [`ChannelError::Send`] - the supervisor treats
/// a full control channel as a lost message, exactly like the original.
pub fn send_msg(fd: RawFd, msg: &ChannelMsg) -> Result<(), ChannelError> {
    let buf = msg.pack();
    let iov = [IoSlice::new(&buf)];
    let fds = [msg.fd];

    let cmsgs: &[ControlMessage<'_>] = if msg.command == Command::Open && msg.fd >= 0 {
        &[ControlMessage::ScmRights(&fds)]
    } else {
        &[]
    };

    sendmsg::<()>(fd, &iov, cmsgs, MsgFlags::empty(), None)
        .map(|_| ())
        .map_err(ChannelError::Send)
}

/// Read one record, collecting a passed descriptor if one rides along.
///
/// # Errors
///
/// Returns [`ChannelError::Recv`] on hard socket errors; transient
/// conditions map to [`RecvOutcome::Again`] / [`RecvOutcome::Closed`].
pub fn recv_msg(fd: RawFd) -> Result<RecvOutcome, ChannelError> {
    let mut buf = [0u8; CHANNEL_MSG_SIZE];
    let mut cmsg_buf = cmsg_space!([RawFd; 1]);

    let (n, passed_fd) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let r = match recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty()) {
            Ok(r) => r,
            Err(Errno::EAGAIN | Errno::EINTR) => return Ok(RecvOutcome::Again),
            Err(e) => return Err(ChannelError::Recv(e)),
        };
        let mut passed = None;
        if let Ok(cmsgs) = r.cmsgs() {
            for cmsg in cmsgs {
                if let ControlMessageOwned::ScmRights(fds) = cmsg {
                    passed = fds.first().copied();
                }
            }
        }
        (r.bytes, passed)
    };

    if n == 0 {
        return Ok(RecvOutcome::Closed);
    }
    if n < CHANNEL_MSG_SIZE {
        return Ok(RecvOutcome::Again);
    }

    let mut msg = ChannelMsg::unpack(&buf)?;
    if let Some(passed) = passed_fd {
        msg.fd = passed;
    }
    Ok(RecvOutcome::Msg(msg))
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_pack_unpack_round_trip() {
        let msg = ChannelMsg {
            command: Command::Open,
            pid: 4321,
            slot: 7,
            fd: 42,
        };
        assert_eq!(ChannelMsg::unpack(&msg.pack()).unwrap(), msg);
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let mut raw = ChannelMsg::bare(Command::Quit).pack();
        raw[0..4].copy_from_slice(&99u32.to_ne_bytes());
        assert!(matches!(
            ChannelMsg::unpack(&raw),
            Err(ChannelError::UnknownCommand(99))
        ));
    }

    #[test]
    fn test_send_recv_over_socketpair() {
        let (master, worker) = create_channel().unwrap();

        let msg = ChannelMsg {
            command: Command::Quit,
            pid: 1,
            slot: 0,
            fd: -1,
        };
        send_msg(master.as_raw_fd(), &msg).unwrap();

        match recv_msg(worker.as_raw_fd()).unwrap() {
            RecvOutcome::Msg(got) => assert_eq!(got, msg),
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_channel_reports_again() {
        let (_master, worker) = create_channel().unwrap();
        assert!(matches!(
            recv_msg(worker.as_raw_fd()).unwrap(),
            RecvOutcome::Again
        ));
    }

    #[test]
    fn test_open_passes_a_descriptor() {
        let (master, worker) = create_channel().unwrap();
        let (extra, _peer) = create_channel().unwrap();

        let msg = ChannelMsg {
            command: Command::Open,
            pid: 99,
            slot: 3,
            fd: extra.as_raw_fd(),
        };
        send_msg(master.as_raw_fd(), &msg).unwrap();

        match recv_msg(worker.as_raw_fd()).unwrap() {
            RecvOutcome::Msg(got) => {
                assert_eq!(got.command, Command::Open);
                assert_eq!(got.slot, 3);
                // The received descriptor is a fresh fd in this process,
                // not the sender's number.
                assert!(got.fd >= 0);
                nix::unistd::close(got.fd).unwrap();
            }
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[test]
    fn test_closed_peer_reports_closed() {
        let (master, worker) = create_channel().unwrap();
        drop(master);
        assert!(matches!(
            recv_msg(worker.as_raw_fd()).unwrap(),
            RecvOutcome::Closed
        ));
    }
}
