//! Retry schedule shared by socket reconnects and channel rejoins.

use std::time::Duration;

use crate::timer::{TimerId, TimerQueue};

/// Default reconnect/rejoin steps in milliseconds. The last step repeats.
pub const DEFAULT_BACKOFF_MS: [u64; 4] = [1_000, 2_000, 5_000, 10_000];

/// Deterministic step table indexed by the number of tries so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    steps: Vec<Duration>,
}

impl Backoff {
    /// Build a schedule from millisecond steps. An empty table falls back to
    /// the default steps.
    pub fn from_millis(steps: &[u64]) -> Self {
        let steps = if steps.is_empty() {
            &DEFAULT_BACKOFF_MS[..]
        } else {
            steps
        };
        Self {
            steps: steps.iter().copied().map(Duration::from_millis).collect(),
        }
    }

    pub fn delay_for(&self, tries: u32) -> Duration {
        let index = (tries as usize).min(self.steps.len() - 1);
        self.steps[index]
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_millis(&DEFAULT_BACKOFF_MS)
    }
}

/// A restartable single-shot timer whose delay comes from a [`Backoff`].
///
/// `armed` is the only record of a pending timer; `schedule_timeout` is a
/// no-op while it is set.
pub(crate) struct BackoffTimer<K> {
    kind: K,
    backoff: Backoff,
    tries: u32,
    armed: Option<TimerId>,
}

impl<K: Clone> BackoffTimer<K> {
    pub fn new(kind: K, backoff: Backoff) -> Self {
        Self {
            kind,
            backoff,
            tries: 0,
            armed: None,
        }
    }

    /// Arm the timer for `delay_for(tries)`. No-op while already armed.
    pub fn schedule_timeout(&mut self, timers: &mut TimerQueue<K>) -> bool {
        if self.armed.is_some() {
            return false;
        }
        let delay = self.backoff.delay_for(self.tries);
        self.armed = Some(timers.schedule(delay, self.kind.clone()));
        true
    }

    /// Cancel any armed timer and start counting tries from zero.
    pub fn reset(&mut self, timers: &mut TimerQueue<K>) {
        self.tries = 0;
        if let Some(id) = self.armed.take() {
            timers.cancel(id);
        }
    }

    /// Record that timer `id` fired. Returns false when `id` is not the armed
    /// timer, i.e. it was cancelled or superseded after being popped.
    pub fn fire(&mut self, id: TimerId) -> bool {
        if self.armed != Some(id) {
            return false;
        }
        self.armed = None;
        self.tries = self.tries.saturating_add(1);
        true
    }

    pub fn tries(&self) -> u32 {
        self.tries
    }

    #[cfg(test)]
    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}
