//! Deadline-ordered single-shot timers.
//!
//! The socket owns one queue for every timer it runs (reconnect, heartbeat,
//! rejoin, push timeouts). Timers fire in deadline order, FIFO among equal
//! deadlines. Cancelling an unknown or already-fired timer is a no-op.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::time::Instant;

/// Handle to a scheduled timer.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct TimerId(u64);

pub(crate) struct TimerQueue<K> {
    next_id: u64,
    entries: BTreeMap<(Instant, TimerId), K>,
    deadlines: HashMap<TimerId, Instant>,
}

impl<K> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TimerQueue<K> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }

    /// Schedule `kind` to fire `delay` from now.
    pub fn schedule(&mut self, delay: Duration, kind: K) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let deadline = Instant::now() + delay;
        self.entries.insert((deadline, id), kind);
        self.deadlines.insert(id, deadline);
        id
    }

    /// Cancel a timer. Returns whether it was still pending.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(deadline) => self.entries.remove(&(deadline, id)).is_some(),
            None => false,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return the earliest timer due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, K)> {
        let (&(deadline, id), _) = self.entries.iter().next()?;
        if deadline > now {
            return None;
        }
        self.deadlines.remove(&id);
        self.entries.remove(&(deadline, id)).map(|kind| (id, kind))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_pending(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }
}
