// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The per-worker timer set.
//!
//! A binary heap keyed by deadline, with lazy cancellation: cancelling a
//! handle marks it dead, and dead entries are skipped when they surface at
//! the heap top. Expiration runs between I/O dispatch and the posted-queue
//! drain, so a handler armed during expiration still runs in the same tick.
//!
//! Timers marked *cancelable* do not block graceful worker exit (the
//! shutdown and lingering timers); everything else counts as pending work.

use std::{cmp::Reverse,
          collections::{BinaryHeap, HashSet},
          time::{Duration, Instant}};

use crate::conn::{ConnId, Dir};

/// Opaque handle for cancelling a pending timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// What a timer fires against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTarget {
    /// Set `timedout` on the event and run its handler.
    Event { conn: ConnId, dir: Dir },
    /// The worker's graceful-shutdown deadline.
    Shutdown,
}

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    deadline: Instant,
    id: u64,
    target: TimerTarget,
    cancelable: bool,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.id).cmp(&(other.deadline, other.id))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct TimerSet {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    canceled: HashSet<u64>,
    next_id: u64,
    /// Live non-cancelable entries; gates the graceful-exit predicate.
    blocking: usize,
}

impl TimerSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        deadline: Instant,
        target: TimerTarget,
        cancelable: bool,
    ) -> TimerHandle {
        self.next_id += 1;
        let id = self.next_id;
        self.heap.push(Reverse(HeapEntry {
            deadline,
            id,
            target,
            cancelable,
        }));
        if !cancelable {
            self.blocking += 1;
        }
        TimerHandle(id)
    }

    pub fn cancel(&mut self, handle: TimerHandle) {
        // A handle that already fired (or was already cancelled) is a no-op.
        let Some(cancelable) = self.find(handle.0).map(|e| e.cancelable) else {
            return;
        };
        if self.canceled.insert(handle.0) && !cancelable {
            // Account now so the graceful-exit predicate does not wait on a
            // dead timer.
            self.blocking -= 1;
        }
    }

    fn find(&self, id: u64) -> Option<&HeapEntry> {
        self.heap.iter().map(|Reverse(e)| e).find(|e| e.id == id)
    }

    /// Duration until the earliest live deadline, or `None` when the set is
    /// empty (wait forever).
    #[must_use]
    pub fn next_timeout(&mut self, now: Instant) -> Option<Duration> {
        self.skip_dead();
        self.heap
            .peek()
            .map(|Reverse(e)| e.deadline.saturating_duration_since(now))
    }

    fn skip_dead(&mut self) {
        while let Some(Reverse(e)) = self.heap.peek() {
            if self.canceled.remove(&e.id) {
                self.heap.pop();
            } else {
                return;
            }
        }
    }

    /// Pop every live entry whose deadline has passed.
    pub fn expire(&mut self, now: Instant, fired: &mut Vec<TimerTarget>) {
        loop {
            self.skip_dead();
            match self.heap.peek() {
                Some(Reverse(e)) if e.deadline <= now => {
                    let Reverse(e) = self.heap.pop().expect("peeked above");
                    if !e.cancelable {
                        self.blocking -= 1;
                    }
                    fired.push(e.target);
                }
                _ => return,
            }
        }
    }

    /// True when only cancelable timers remain - the graceful-exit
    /// predicate a draining worker polls.
    #[must_use]
    pub fn only_cancelable_left(&self) -> bool {
        self.blocking == 0
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn target(slot: u32) -> TimerTarget {
        TimerTarget::Event {
            conn: ConnId {
                slot,
                generation: 1,
            },
            dir: Dir::Read,
        }
    }

    #[test]
    fn test_expire_fires_in_deadline_order() {
        let mut set = TimerSet::new();
        let now = Instant::now();
        set.add(now + Duration::from_millis(20), target(2), false);
        set.add(now + Duration::from_millis(10), target(1), false);

        let mut fired = vec![];
        set.expire(now + Duration::from_millis(30), &mut fired);
        assert_eq!(fired, vec![target(1), target(2)]);
        assert!(set.only_cancelable_left());
    }

    #[test]
    fn test_canceled_timer_does_not_fire() {
        let mut set = TimerSet::new();
        let now = Instant::now();
        let h = set.add(now + Duration::from_millis(5), target(1), false);
        set.cancel(h);

        assert!(set.only_cancelable_left());
        let mut fired = vec![];
        set.expire(now + Duration::from_millis(10), &mut fired);
        assert!(fired.is_empty());
    }

    #[test]
    fn test_next_timeout_skips_canceled_entries() {
        let mut set = TimerSet::new();
        let now = Instant::now();
        let h = set.add(now + Duration::from_millis(5), target(1), false);
        set.add(now + Duration::from_millis(50), target(2), false);
        set.cancel(h);

        let timeout = set.next_timeout(now).unwrap();
        assert!(timeout > Duration::from_millis(5));
    }

    #[test]
    fn test_cancelable_timers_do_not_block_exit() {
        let mut set = TimerSet::new();
        let now = Instant::now();
        set.add(now + Duration::from_secs(10), TimerTarget::Shutdown, true);
        assert!(set.only_cancelable_left());

        set.add(now + Duration::from_secs(1), target(1), false);
        assert!(!set.only_cancelable_left());
    }

    #[test]
    fn test_due_now_fires() {
        let mut set = TimerSet::new();
        let now = Instant::now();
        set.add(now, target(1), false);
        let mut fired = vec![];
        set.expire(now, &mut fired);
        assert_eq!(fired.len(), 1);
    }
}
