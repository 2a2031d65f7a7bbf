//! Keyed watchdog timers
//!
//! A [`WatchdogPool`] holds at most one armed timer per key. Expiry is never
//! handled on the timer task itself: the task posts a [`TimerTick`] back onto
//! the owner's channel, and the owner checks the tick against the pool with
//! [`WatchdogPool::accept`] before acting on it. Ticks from cancelled or
//! re-armed timers are rejected there, so a stale expiry can never complete an
//! operation that has since been re-registered.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Expiry notification posted by an armed timer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerTick<K> {
    pub key: K,
    generation: u64,
}

struct ArmedTimer {
    generation: u64,
    repeating: bool,
    task: JoinHandle<()>,
}

pub struct WatchdogPool<K> {
    timers: HashMap<K, ArmedTimer>,
    next_generation: u64,
    ticks: mpsc::UnboundedSender<TimerTick<K>>,
}

impl<K> WatchdogPool<K>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
{
    /// Create a pool whose expiries are posted to `ticks`
    pub fn new(ticks: mpsc::UnboundedSender<TimerTick<K>>) -> Self {
        Self {
            timers: HashMap::new(),
            next_generation: 0,
            ticks,
        }
    }

    /// Arm a one-shot timer for `key`, replacing any timer already armed for it.
    ///
    /// With `None` nothing is armed (but an existing timer is still cancelled).
    /// Returns whether a timer is now armed.
    pub fn start(&mut self, key: K, timeout: Option<Duration>) -> bool {
        self.cancel(&key);
        let Some(timeout) = timeout else {
            return false;
        };

        let generation = self.bump_generation();
        let ticks = self.ticks.clone();
        let tick = TimerTick {
            key: key.clone(),
            generation,
        };

        trace!("Arming watchdog {:?} for {:?}", key, timeout);
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = ticks.send(tick);
        });

        self.timers.insert(
            key,
            ArmedTimer {
                generation,
                repeating: false,
                task,
            },
        );
        true
    }

    /// Arm a timer that ticks every `interval` until cancelled.
    ///
    /// A zero interval arms nothing. Returns whether a timer is now armed.
    pub fn start_repeating(&mut self, key: K, interval: Duration) -> bool {
        self.cancel(&key);
        if interval.is_zero() {
            return false;
        }

        let generation = self.bump_generation();
        let ticks = self.ticks.clone();
        let tick = TimerTick {
            key: key.clone(),
            generation,
        };

        trace!("Arming repeating watchdog {:?} every {:?}", key, interval);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                interval.tick().await;
                if ticks.send(tick.clone()).is_err() {
                    break;
                }
            }
        });

        self.timers.insert(
            key,
            ArmedTimer {
                generation,
                repeating: true,
                task,
            },
        );
        true
    }

    /// Disarm the timer for `key`. Cancelling an unarmed key is a no-op.
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.timers.remove(key) {
            Some(timer) => {
                trace!("Cancelling watchdog {:?}", key);
                timer.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.task.abort();
        }
    }

    /// Validate a tick received from the channel.
    ///
    /// Returns `true` when the tick belongs to the currently armed timer for
    /// its key. One-shot timers are disarmed by an accepted tick.
    pub fn accept(&mut self, tick: &TimerTick<K>) -> bool {
        let current = match self.timers.get(&tick.key) {
            Some(timer) => timer.generation == tick.generation,
            None => false,
        };

        if current && !self.timers.get(&tick.key).map_or(false, |t| t.repeating) {
            self.timers.remove(&tick.key);
        }
        current
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.timers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

impl<K> Drop for WatchdogPool<K> {
    fn drop(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.task.abort();
        }
    }
}
