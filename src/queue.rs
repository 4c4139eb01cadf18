//! Deduplicating work queue with delayed admission
//!
//! Items move through three states: waiting (scheduled by `add_after`),
//! ready (in the FIFO, also tracked in `dirty`) and in flight (returned by
//! `get`, tracked in `processing` until `done`). An item equal to one in
//! flight is held back in `dirty` and released by `done`, so a retry is
//! never coalesced into the attempt that is currently running.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub struct DelayingQueue<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    waiting: BinaryHeap<Waiting<T>>,
    deadlines: HashMap<T, Instant>,
    seq: u64,
    shutting_down: bool,
}

struct Waiting<T> {
    ready_at: Instant,
    seq: u64,
    item: T,
}

// BinaryHeap is a max-heap, so the ordering is reversed to pop the earliest
// deadline first. Ties fall back to insertion order.
impl<T> Ord for Waiting<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Waiting<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Waiting<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<T> Eq for Waiting<T> {}

impl<T: Clone + Eq + Hash> State<T> {
    fn insert(&mut self, item: T) -> bool {
        if self.dirty.contains(&item) {
            return false;
        }
        self.dirty.insert(item.clone());
        if self.processing.contains(&item) {
            return false;
        }
        self.queue.push_back(item);
        true
    }

    /// Move every waiting item whose deadline has passed into the FIFO.
    fn promote_due(&mut self, now: Instant) -> bool {
        let mut promoted = false;
        while let Some(head) = self.waiting.peek() {
            if head.ready_at > now {
                break;
            }
            let Some(entry) = self.waiting.pop() else {
                break;
            };
            // a later add_after with an earlier deadline leaves a stale entry behind
            if self.deadlines.get(&entry.item) != Some(&entry.ready_at) {
                continue;
            }
            self.deadlines.remove(&entry.item);
            promoted |= self.insert(entry.item);
        }
        promoted
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.waiting.peek().map(|w| w.ready_at)
    }
}

impl<T: Clone + Eq + Hash> DelayingQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: BinaryHeap::new(),
                deadlines: HashMap::new(),
                seq: 0,
                shutting_down: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // the state stays consistent across a panicking holder, keep going
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue now, collapsing with an equal pending item.
    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        if state.insert(item) {
            self.ready.notify_one();
        }
    }

    /// Enqueue no earlier than `delay` from now. If an equal item is already
    /// waiting, the earlier deadline is kept.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let mut state = self.lock();
        if state.shutting_down {
            return;
        }

        let ready_at = Instant::now() + delay;
        if let Some(existing) = state.deadlines.get(&item) {
            if *existing <= ready_at {
                return;
            }
        }

        state.seq += 1;
        let seq = state.seq;
        state.deadlines.insert(item.clone(), ready_at);
        state.waiting.push(Waiting {
            ready_at,
            seq,
            item,
        });
        // a sleeping consumer may need a shorter timeout now
        self.ready.notify_all();
    }

    /// Block until an item is ready. Returns `None` once the queue is shut
    /// down and nothing ready remains.
    pub fn get(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if !state.shutting_down {
                state.promote_due(Instant::now());
            }

            if let Some(item) = state.queue.pop_front() {
                state.dirty.remove(&item);
                state.processing.insert(item.clone());
                return Some(item);
            }

            if state.shutting_down {
                return None;
            }

            state = match state.next_deadline() {
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    self.ready
                        .wait_timeout(state, timeout)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                }
                None => self
                    .ready
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            };
        }
    }

    /// Mark an item returned by `get` as finished.
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            self.ready.notify_one();
        }
    }

    /// Wake every consumer and stop accepting work. Waiting items are dropped.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        state.waiting.clear();
        state.deadlines.clear();
        self.ready.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of ready items, after promoting any that are due.
    pub fn len(&self) -> usize {
        let mut state = self.lock();
        if !state.shutting_down {
            state.promote_due(Instant::now());
        }
        state.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items scheduled by `add_after` that are not yet due.
    #[cfg(test)]
    pub(crate) fn waiting_len(&self) -> usize {
        self.lock().deadlines.len()
    }
}
