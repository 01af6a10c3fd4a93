// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The connection registry: a fixed-capacity slab of connection slots, each
//! paired with a read event and a write event record.
//!
//! Slots are identified by a [`ConnId`] - a `(slot, generation)` handle
//! packed into the [`mio::Token`] the kernel hands back with each readiness
//! event. The registry bumps a slot's generation exactly once per
//! acquire/release cycle (on acquire), so a token minted for a previous
//! tenant of the slot no longer matches and the event is discarded as
//! stale. This is the allocation-free defense against handlers firing on a
//! recycled fd.
//!
//! Free slots form a singly-linked list threaded through the slots
//! themselves; acquisition and release are O(1).

use std::os::fd::RawFd;

use mio::Token;

use crate::{core::buf::ReadBuf, event::TimerHandle, http::Request};

/// Direction of an event record on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Read,
    Write,
}

/// A `(slot, generation)` handle to a connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    pub slot: u32,
    pub generation: u32,
}

impl ConnId {
    /// Pack into a [`mio::Token`]: slot in the low half, generation in the
    /// high half.
    #[must_use]
    pub fn token(self) -> Token {
        Token((self.slot as usize) | ((self.generation as usize) << 32))
    }

    #[must_use]
    pub fn from_token(token: Token) -> Self {
        Self {
            slot: (token.0 & 0xffff_ffff) as u32,
            generation: (token.0 >> 32) as u32,
        }
    }
}

/// What the worker runs when an event for the connection fires. Handlers
/// are enum-dispatched by the worker's handler table; no function pointers
/// are stored in the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerKind {
    #[default]
    None,
    /// Drain the listener's accept backlog.
    Accept,
    /// Read commands from the master channel endpoint.
    Channel,
    /// Read and parse the request head.
    ReadRequestHead,
    /// Resume the request-body drain loop.
    ReadRequestBody,
    /// Resume the body discard walk.
    DiscardRequestBody,
    /// Guard handler installed once reading is done; unexpected readiness
    /// is ignored (and errors finalize the connection).
    BlockReading,
    /// No-op write handler while a read-driven phase is in progress.
    EmptyWrite,
}

/// One direction's event record. Lives by value inside the connection slot;
/// its back-reference to the slot is the [`ConnId`] the reactor carries,
/// not an owning pointer.
#[derive(Debug, Default)]
pub struct EventRecord {
    pub handler: HandlerKind,
    /// The kernel currently knows this fd/direction.
    pub active: bool,
    /// Readiness observed and not yet consumed.
    pub ready: bool,
    /// Set by the timer set when this event's timer fires.
    pub timedout: bool,
    /// This is a listening socket's read event.
    pub accept: bool,
    /// This is the master-channel read event.
    pub channel: bool,
    /// Queued on a posted queue (guards double posting).
    pub posted: bool,
    pub timer: Option<TimerHandle>,
}

impl EventRecord {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// The I/O object a slot wraps.
#[derive(Debug, Default)]
pub enum ConnIo {
    #[default]
    None,
    Stream(mio::net::TcpStream),
    Listener(mio::net::TcpListener),
    /// A raw fd registered via `SourceFd` (the channel endpoint).
    Raw(RawFd),
}

/// One connection slot.
#[derive(Debug, Default)]
pub struct Connection {
    pub io: ConnIo,
    pub fd: RawFd,
    pub read: EventRecord,
    pub write: EventRecord,
    /// Staging buffer while the request head is being read (before a
    /// [`Request`] exists).
    pub head_buf: Option<ReadBuf>,
    pub request: Option<Request>,
    generation: u32,
    next_free: Option<u32>,
}

impl Connection {
    #[must_use]
    pub fn event(&self, dir: Dir) -> &EventRecord {
        match dir {
            Dir::Read => &self.read,
            Dir::Write => &self.write,
        }
    }

    pub fn event_mut(&mut self, dir: Dir) -> &mut EventRecord {
        match dir {
            Dir::Read => &mut self.read,
            Dir::Write => &mut self.write,
        }
    }
}

/// Fixed-capacity pool of connection slots, sized once at worker start.
#[derive(Debug)]
pub struct ConnRegistry {
    slots: Vec<Connection>,
    free_head: Option<u32>,
    free_count: usize,
}

impl ConnRegistry {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let mut c = Connection {
                fd: -1,
                ..Connection::default()
            };
            c.next_free = if i + 1 < capacity {
                Some((i + 1) as u32)
            } else {
                None
            };
            slots.push(c);
        }
        Self {
            slots,
            free_head: if capacity > 0 { Some(0) } else { None },
            free_count: capacity,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.capacity() - self.free_count
    }

    /// Pop a free slot, reset both event records, bump the generation, and
    /// install the I/O object. Returns `None` when the pool is exhausted.
    pub fn acquire(&mut self, io: ConnIo, fd: RawFd) -> Option<ConnId> {
        let slot = self.free_head?;
        let c = &mut self.slots[slot as usize];
        self.free_head = c.next_free;
        self.free_count -= 1;

        c.generation = c.generation.wrapping_add(1);
        c.next_free = None;
        c.read.reset();
        c.write.reset();
        c.head_buf = None;
        c.request = None;
        c.io = io;
        c.fd = fd;

        Some(ConnId {
            slot,
            generation: c.generation,
        })
    }

    /// Push a slot back onto the free list. The generation is *not* bumped
    /// here - the next [`acquire`](Self::acquire) does it, giving exactly
    /// one change per lifecycle.
    pub fn release(&mut self, id: ConnId) {
        let Some(index) = self.validate(id) else {
            return;
        };
        let c = &mut self.slots[index];
        c.io = ConnIo::None;
        c.fd = -1;
        c.head_buf = None;
        c.request = None;
        c.next_free = self.free_head;
        self.free_head = Some(id.slot);
        self.free_count += 1;
    }

    /// Resolve a handle, rejecting stale generations and freed slots.
    #[must_use]
    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.validate(id).map(|i| &self.slots[i])
    }

    /// Mutable [`get`](Self::get).
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.validate(id).map(move |i| &mut self.slots[i])
    }

    fn validate(&self, id: ConnId) -> Option<usize> {
        let index = id.slot as usize;
        let c = self.slots.get(index)?;
        if c.fd == -1 || c.generation != id.generation {
            return None;
        }
        Some(index)
    }

    /// Iterate the ids of every live slot (used for idle-connection sweeps
    /// at shutdown).
    #[must_use]
    pub fn live_ids(&self) -> Vec<ConnId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, c)| c.fd != -1)
            .map(|(i, c)| ConnId {
                slot: i as u32,
                generation: c.generation,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_token_round_trip() {
        let id = ConnId {
            slot: 17,
            generation: 0xdead_beef,
        };
        assert_eq!(ConnId::from_token(id.token()), id);
    }

    #[test]
    fn test_acquire_release_reuses_slots() {
        let mut reg = ConnRegistry::new(2);
        let a = reg.acquire(ConnIo::None, 10).unwrap();
        let b = reg.acquire(ConnIo::None, 11).unwrap();
        assert!(reg.acquire(ConnIo::None, 12).is_none());
        assert_eq!(reg.free_count(), 0);

        reg.release(a);
        let c = reg.acquire(ConnIo::None, 12).unwrap();
        assert_eq!(c.slot, a.slot);
        assert_ne!(c.generation, a.generation);

        reg.release(b);
        reg.release(c);
        assert_eq!(reg.free_count(), 2);
    }

    #[test]
    fn test_stale_handle_is_rejected() {
        let mut reg = ConnRegistry::new(1);
        let first = reg.acquire(ConnIo::None, 5).unwrap();
        reg.release(first);
        let second = reg.acquire(ConnIo::None, 5).unwrap();

        // Same slot, new generation: the old handle must not resolve.
        assert_eq!(first.slot, second.slot);
        assert!(reg.get(first).is_none());
        assert!(reg.get(second).is_some());
    }

    #[test]
    fn test_freed_slot_is_rejected_even_with_matching_generation() {
        let mut reg = ConnRegistry::new(1);
        let id = reg.acquire(ConnIo::None, 5).unwrap();
        reg.release(id);
        assert!(reg.get(id).is_none());
    }

    #[test]
    fn test_generation_changes_once_per_lifecycle() {
        let mut reg = ConnRegistry::new(1);
        let a = reg.acquire(ConnIo::None, 5).unwrap();
        reg.release(a);
        let b = reg.acquire(ConnIo::None, 6).unwrap();
        assert_eq!(b.generation, a.generation.wrapping_add(1));
    }
}
