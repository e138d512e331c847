//! Thread-safe priority-time scheduler
//!
//! Entries dequeue by ascending deadline, then descending priority, then
//! insertion order. Entries planned before `start` are buffered with their
//! relative times and anchored when the clock starts.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use parking_lot::Mutex;
use pnsim_core::{SimError, SimResult};

use crate::{Deadline, When};

#[derive(Debug)]
struct Entry<A> {
    deadline: Deadline,
    priority: i32,
    seq: u64,
    action: A,
}

impl<A> Entry<A> {
    fn key(&self) -> (Deadline, i64, u64) {
        (self.deadline, -(self.priority as i64), self.seq)
    }
}

impl<A> PartialEq for Entry<A> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<A> Eq for Entry<A> {}

impl<A> Ord for Entry<A> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap
        other.key().cmp(&self.key())
    }
}

impl<A> PartialOrd for Entry<A> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Pending<A> {
    when: When,
    priority: i32,
    seq: u64,
    action: A,
}

#[derive(Debug)]
struct Inner<A> {
    anchor: Option<Instant>,
    pending: Vec<Pending<A>>,
    heap: BinaryHeap<Entry<A>>,
    next_seq: u64,
}

/// Priority queue of time-stamped actions shared across threads
#[derive(Debug)]
pub struct Scheduler<A> {
    inner: Mutex<Inner<A>>,
}

impl<A: Clone + PartialEq> Scheduler<A> {
    pub fn new() -> Self {
        Scheduler {
            inner: Mutex::new(Inner {
                anchor: None,
                pending: Vec::new(),
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Plan `action`; buffered until `start`, live afterwards
    pub fn plan(&self, when: When, action: A, priority: i32) {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let anchor = inner.anchor;
        match anchor {
            Some(anchor) => inner.heap.push(Entry {
                deadline: when.anchor(anchor),
                priority,
                seq,
                action,
            }),
            None => inner.pending.push(Pending {
                when,
                priority,
                seq,
                action,
            }),
        }
    }

    /// Anchor buffered entries at `anchor` and switch to live mode
    pub fn start(&self, anchor: Instant) -> SimResult<()> {
        let mut inner = self.inner.lock();
        if inner.anchor.is_some() {
            return Err(SimError::AlreadyStarted);
        }
        inner.anchor = Some(anchor);
        let pending = std::mem::take(&mut inner.pending);
        inner.heap.extend(pending.into_iter().map(|p| Entry {
            deadline: p.when.anchor(anchor),
            priority: p.priority,
            seq: p.seq,
            action: p.action,
        }));
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.inner.lock().anchor.is_some()
    }

    pub fn anchor(&self) -> Option<Instant> {
        self.inner.lock().anchor
    }

    /// Earliest deadline; `None` when empty or not started
    pub fn peek_next_deadline(&self) -> Option<Deadline> {
        self.inner.lock().heap.peek().map(|e| e.deadline)
    }

    /// Remove and return the earliest entry
    pub fn pop_next(&self) -> Option<(Deadline, A)> {
        self.inner
            .lock()
            .heap
            .pop()
            .map(|e| (e.deadline, e.action))
    }

    /// Remove one exact match; absent entries are ignored
    pub fn remove(&self, when: When, action: &A, priority: i32) -> bool {
        let mut inner = self.inner.lock();
        let anchor = inner.anchor;
        match anchor {
            None => {
                let found = inner
                    .pending
                    .iter()
                    .position(|p| p.when == when && p.priority == priority && p.action == *action);
                match found {
                    Some(pos) => {
                        inner.pending.remove(pos);
                        true
                    }
                    None => false,
                }
            }
            Some(anchor) => {
                let deadline = when.anchor(anchor);
                let mut entries = std::mem::take(&mut inner.heap).into_vec();
                let found = entries.iter().position(|e| {
                    e.deadline == deadline && e.priority == priority && e.action == *action
                });
                if let Some(pos) = found {
                    entries.swap_remove(pos);
                }
                inner.heap = BinaryHeap::from(entries);
                found.is_some()
            }
        }
    }

    /// Remove every entry for `action` at `priority`, whatever its deadline
    pub fn remove_all(&self, action: &A, priority: i32) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.pending.len() + inner.heap.len();
        inner
            .pending
            .retain(|p| !(p.priority == priority && p.action == *action));
        inner
            .heap
            .retain(|e| !(e.priority == priority && e.action == *action));
        before - (inner.pending.len() + inner.heap.len())
    }

    /// Whether an entry for `action` is planned
    pub fn contains(&self, action: &A) -> bool {
        let inner = self.inner.lock();
        inner.pending.iter().any(|p| p.action == *action)
            || inner.heap.iter().any(|e| e.action == *action)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.pending.len() + inner.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<A: Clone + PartialEq> Default for Scheduler<A> {
    fn default() -> Self {
        Self::new()
    }
}
