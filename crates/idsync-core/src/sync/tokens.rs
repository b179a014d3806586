//! Suspension tokens: per-pair exclusivity for senders and reloads.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{SyncError, SyncResult};
use crate::types::PairKey;

/// Granularity of blocking waits, so shutdown is noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Process-wide stop flag that sleeping threads can wait on.
#[derive(Default)]
pub struct ShutdownSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep for `duration` unless shutdown is triggered first.
    ///
    /// Returns true if shutdown was triggered.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.cond.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

/// The set of suspended pairs.
#[derive(Default)]
pub struct SuspensionTokens {
    suspended: Mutex<HashSet<PairKey>>,
    released: Condvar,
}

impl SuspensionTokens {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suspend `pair` unless it already is.
    pub fn try_acquire(self: &Arc<Self>, pair: &PairKey) -> Option<SuspensionToken> {
        let mut suspended = self.suspended.lock();
        if !suspended.insert(pair.clone()) {
            return None;
        }
        trace!(%pair, "Suspended");
        Some(SuspensionToken {
            tokens: Arc::clone(self),
            pair: pair.clone(),
        })
    }

    /// Block until `pair` can be suspended by the caller.
    pub fn acquire(
        self: &Arc<Self>,
        pair: &PairKey,
        shutdown: &ShutdownSignal,
    ) -> SyncResult<SuspensionToken> {
        let mut suspended = self.suspended.lock();
        loop {
            if shutdown.is_triggered() {
                return Err(SyncError::ShuttingDown);
            }
            if suspended.insert(pair.clone()) {
                trace!(%pair, "Suspended after waiting");
                return Ok(SuspensionToken {
                    tokens: Arc::clone(self),
                    pair: pair.clone(),
                });
            }
            self.released.wait_for(&mut suspended, WAIT_SLICE);
        }
    }

    pub fn is_suspended(&self, pair: &PairKey) -> bool {
        self.suspended.lock().contains(pair)
    }

    pub fn suspended_count(&self) -> usize {
        self.suspended.lock().len()
    }

    /// Wait up to `timeout` for any token to be released.
    pub fn wait_released(&self, timeout: Duration) {
        let mut suspended = self.suspended.lock();
        self.released.wait_for(&mut suspended, timeout);
    }

    /// Wake every waiter, e.g. when shutting down.
    pub fn notify_all(&self) {
        self.released.notify_all();
    }

    fn release(&self, pair: &PairKey) {
        self.suspended.lock().remove(pair);
        trace!(%pair, "Resumed");
        self.released.notify_all();
    }
}

/// Exclusive hold on one pair. Resumes the pair when dropped.
pub struct SuspensionToken {
    tokens: Arc<SuspensionTokens>,
    pair: PairKey,
}

impl SuspensionToken {
    pub fn pair(&self) -> &PairKey {
        &self.pair
    }
}

impl Drop for SuspensionToken {
    fn drop(&mut self) {
        self.tokens.release(&self.pair);
    }
}

impl std::fmt::Debug for SuspensionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SuspensionToken").field(&self.pair).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_token_is_exclusive_until_dropped() {
        let tokens = Arc::new(SuspensionTokens::new());
        let pair = PairKey::new("alice@example.org", "contacts");

        let token = tokens.try_acquire(&pair).unwrap();
        assert!(tokens.is_suspended(&pair));
        assert!(tokens.try_acquire(&pair).is_none());

        let other = PairKey::new("alice@example.org", "profile");
        assert!(tokens.try_acquire(&other).is_some());

        drop(token);
        assert!(!tokens.is_suspended(&pair));
        assert!(tokens.try_acquire(&pair).is_some());
    }

    #[test]
    fn test_acquire_waits_for_release() {
        let tokens = Arc::new(SuspensionTokens::new());
        let shutdown = Arc::new(ShutdownSignal::new());
        let pair = PairKey::new("alice@example.org", "contacts");
        let held = tokens.try_acquire(&pair).unwrap();

        let waiter = {
            let tokens = tokens.clone();
            let shutdown = shutdown.clone();
            let pair = pair.clone();
            thread::spawn(move || tokens.acquire(&pair, &shutdown).map(|_| ()))
        };

        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_acquire_gives_up_on_shutdown() {
        let tokens = Arc::new(SuspensionTokens::new());
        let shutdown = Arc::new(ShutdownSignal::new());
        let pair = PairKey::new("alice@example.org", "contacts");
        let _held = tokens.try_acquire(&pair).unwrap();

        let waiter = {
            let tokens = tokens.clone();
            let shutdown = shutdown.clone();
            let pair = pair.clone();
            thread::spawn(move || tokens.acquire(&pair, &shutdown).map(|_| ()))
        };

        shutdown.trigger();
        tokens.notify_all();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(SyncError::ShuttingDown)
        ));
    }

    #[test]
    fn test_shutdown_sleep_wakes_early() {
        let shutdown = Arc::new(ShutdownSignal::new());
        let sleeper = {
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let stopped = shutdown.sleep(Duration::from_secs(30));
                (stopped, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        shutdown.trigger();
        let (stopped, elapsed) = sleeper.join().unwrap();
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(5));
    }
}
