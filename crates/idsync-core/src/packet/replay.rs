//! Replay protection for decrypted envelopes.
//!
//! An envelope is accepted only if its time lies inside
//! `[now - window, now + tolerance]` and, when it carries a nonce, the
//! nonce has never been seen. Nonces are kept for the window plus a margin
//! and then purged by a background thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{PacketError, PacketErrorKind, Side, SyncResult};
use crate::storage::Storage;
use crate::types::Timestamp;

pub struct ReplayGuard {
    storage: Storage,
    clock: Arc<dyn Clock>,
    window_ms: i64,
    tolerance_ms: i64,
    retention_ms: i64,
}

impl ReplayGuard {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>, config: &SyncConfig) -> Self {
        Self {
            storage,
            clock,
            window_ms: config.replay_window_ms,
            tolerance_ms: config.future_tolerance_ms,
            retention_ms: config.replay_retention_ms(),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Check that `time` lies inside the acceptance window.
    pub fn check_window(&self, side: Side, time: Timestamp) -> Result<(), PacketError> {
        let now = self.clock.now();
        // Header times are peer-chosen, so all arithmetic saturates
        if time < now.saturating_sub(self.window_ms) {
            return Err(PacketError::new(
                side,
                PacketErrorKind::Encryption,
                format!("too old: {} ms behind", now.saturating_sub(time)),
            ));
        }
        if time > now.saturating_add(self.tolerance_ms) {
            return Err(PacketError::new(
                side,
                PacketErrorKind::Encryption,
                format!("too far ahead: {} ms in the future", time.saturating_sub(now)),
            ));
        }
        Ok(())
    }

    /// Whether a signed element's time is recent enough to be trusted.
    pub fn is_active(&self, time: Timestamp) -> bool {
        let now = self.clock.now();
        time >= now.saturating_sub(self.window_ms) && time <= now.saturating_add(self.tolerance_ms)
    }

    /// Accept an envelope once.
    ///
    /// The nonce insert runs in its own write transaction; a nonce that is
    /// already stored means the envelope was replayed.
    pub fn check(&self, side: Side, time: Timestamp, nonce: Option<&[u8]>) -> SyncResult<()> {
        self.check_window(side, time)?;

        if let Some(nonce) = nonce {
            let fresh = self.storage.write(|txn| txn.insert_nonce(nonce, time))?;
            if !fresh {
                warn!(%side, "Rejected replayed envelope");
                return Err(PacketError::new(side, PacketErrorKind::Replay, "nonce already seen").into());
            }
        }
        Ok(())
    }

    /// Drop every nonce older than the retention period.
    pub fn purge(&self) -> SyncResult<usize> {
        let cutoff = self.clock.now().saturating_sub(self.retention_ms);
        let purged = self.storage.write(|txn| txn.purge_nonces(cutoff))?;
        if purged > 0 {
            debug!(purged, cutoff, "Purged replay nonces");
        }
        Ok(purged)
    }

    /// Run [`purge`](Self::purge) every `interval` until the handle is stopped.
    pub fn spawn_purger(self: &Arc<Self>, interval: Duration) -> SyncResult<PurgeHandle> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let guard = Arc::clone(self);

        let thread = thread::Builder::new()
            .name("idsync-replay-purge".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(e) = guard.purge() {
                            warn!(error = %e, "Replay purge failed");
                        }
                    }
                    // Stop requested or handle dropped
                    _ => break,
                }
            })?;

        info!(interval_ms = interval.as_millis() as u64, "Replay purge started");
        Ok(PurgeHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

/// Owner of the background purge thread.
pub struct PurgeHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PurgeHandle {
    /// Stop the purge thread and wait for it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Replay purge thread panicked");
            }
        }
    }
}

impl Drop for PurgeHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
