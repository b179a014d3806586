//! The scheduler: one thread that owns the queue mirror, picks batches and
//! hands them to the worker pool.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::pool::{Job, WorkerPool};
use super::queue::{Mirror, PendingEntry, QueueEvent};
use super::reconcile;
use super::sender::Sender;
use crate::action::{Action, ActionRecord};
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::packet::PurgeHandle;
use crate::types::{ActionId, PairKey};

/// Longest single wait inside [`Synchronizer::wait_idle`].
const IDLE_POLL: Duration = Duration::from_millis(50);

pub struct Synchronizer {
    ctx: Arc<SyncContext>,
    /// Held across the queue insert and the event send so each pair's
    /// events reach the scheduler in assigned-time order
    submit: Mutex<channel::Sender<QueueEvent>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    pool: Arc<WorkerPool>,
    purger: Mutex<Option<PurgeHandle>>,
}

impl Synchronizer {
    /// Rebuild the queue mirror from storage and start the scheduler.
    pub fn start(ctx: Arc<SyncContext>) -> SyncResult<Self> {
        let config = &ctx.config;
        let pool = Arc::new(WorkerPool::new(
            config.min_workers,
            config.max_workers,
            config.worker_backlog,
        ));
        let mirror = rebuild_mirror(&ctx)?;
        let purger = ctx
            .codec
            .replay()
            .spawn_purger(Duration::from_millis(config.replay_purge_interval_ms))?;

        let (tx, rx) = channel::unbounded();
        info!(pending = mirror.len(), "Starting synchronizer");

        let scheduler = Scheduler {
            ctx: ctx.clone(),
            pool: pool.clone(),
            events: tx.clone(),
            rx,
            mirror,
            reloads: VecDeque::new(),
            backoff: Backoff::new(config.initial_backoff(), config.max_backoff()),
        };
        let handle = thread::Builder::new()
            .name("idsync-scheduler".to_string())
            .spawn(move || scheduler.run())?;

        Ok(Self {
            ctx,
            submit: Mutex::new(tx),
            scheduler: Mutex::new(Some(handle)),
            pool,
            purger: Mutex::new(Some(purger)),
        })
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    /// Execute `action` locally and queue it for delivery.
    ///
    /// Returns once the action is applied and durably queued; delivery
    /// failures only ever show up in the error ledger.
    pub fn execute(&self, mut action: Box<dyn Action>) -> SyncResult<ActionId> {
        if self.ctx.shutdown.is_triggered() {
            return Err(SyncError::ShuttingDown);
        }
        let id = ActionId::new();

        if action.is_local_only() {
            self.ctx.storage.write(|txn| action.execute_locally(txn))?;
            debug!(action = %id, kind = action.type_tag(), "Executed local action");
            return Ok(id);
        }

        let pair = action.pair().clone();
        let events = self.submit.lock();
        let now = self.ctx.clock.now();
        let time = self.ctx.storage.write(|txn| {
            action.execute_locally(txn)?;
            let record = ActionRecord::capture(id, action.as_ref())?;
            txn.push_pending(&pair, &record.encode()?, now)
        })?;

        debug!(%pair, action = %id, time, kind = action.type_tag(), "Queued action");
        let entry = PendingEntry {
            id,
            pair,
            time,
            action,
        };
        if events.send(QueueEvent::Added(entry)).is_err() {
            warn!(action = %id, "Scheduler stopped; action stays queued for the next start");
        }
        Ok(id)
    }

    /// Ask for a reload of `pair` once it is free.
    pub fn request_reload(&self, pair: PairKey) {
        if self.submit.lock().send(QueueEvent::Reload(pair)).is_err() {
            warn!("Scheduler stopped; reload request dropped");
        }
    }

    /// Reload `pair` on the calling thread, waiting for it to be free.
    pub fn reload(&self, pair: &PairKey) -> SyncResult<()> {
        let token = self.ctx.tokens.acquire(pair, &self.ctx.shutdown)?;
        let result = reconcile::reload(&self.ctx, pair, &HashSet::new());
        let removed = result.as_ref().cloned().unwrap_or_default();
        let settled = QueueEvent::Settled { removed, token };
        if self.submit.lock().send(settled).is_err() {
            debug!(%pair, "Scheduler stopped before reload settled");
        }
        result.map(|_| ())
    }

    /// Wait until `pair` has nothing queued and nothing in flight.
    ///
    /// Returns false on timeout.
    pub fn wait_idle(&self, pair: &PairKey, timeout: Duration) -> SyncResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.ctx.tokens.is_suspended(pair) && self.ctx.storage.pending_count(pair)? == 0 {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.ctx.tokens.wait_released((deadline - now).min(IDLE_POLL));
        }
    }

    /// Stop scheduling, wait a bounded time for running senders and stop
    /// the replay purger. Undelivered actions stay queued.
    ///
    /// Returns false if some sender was abandoned.
    pub fn shutdown(&self) -> bool {
        let Some(handle) = self.scheduler.lock().take() else {
            return true;
        };
        info!("Stopping synchronizer");
        self.ctx.shutdown.trigger();
        if self.submit.lock().send(QueueEvent::Shutdown).is_err() {
            debug!("Scheduler already gone");
        }
        self.ctx.tokens.notify_all();

        if handle.join().is_err() {
            error!("Scheduler thread panicked");
        }
        let finished = self.pool.shutdown(self.ctx.config.shutdown_timeout());
        if let Some(purger) = self.purger.lock().take() {
            purger.stop();
        }
        info!(finished, "Synchronizer stopped");
        finished
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Load every queued record, dropping the ones that no longer decode.
fn rebuild_mirror(ctx: &SyncContext) -> SyncResult<Mirror> {
    let mut mirror = Mirror::new();
    for pending in ctx.storage.all_pending()? {
        match ctx.registry.decode_bytes(&pending.bytes) {
            Ok((record, action)) => mirror.insert(PendingEntry {
                id: record.id,
                pair: pending.pair,
                time: pending.time,
                action,
            }),
            Err(e) => {
                warn!(pair = %pending.pair, time = pending.time, error = %e, "Dropping undecodable queued action");
                if let Ok(record) = ActionRecord::decode(&pending.bytes) {
                    ctx.record_failure(&record, "decode", &e.to_string());
                }
                ctx.storage
                    .write(|txn| txn.remove_pending(&pending.pair, &[pending.time]))?;
            }
        }
    }
    Ok(mirror)
}

enum Dispatch {
    Progress,
    Saturated,
    Idle,
}

struct Scheduler {
    ctx: Arc<SyncContext>,
    pool: Arc<WorkerPool>,
    events: channel::Sender<QueueEvent>,
    rx: Receiver<QueueEvent>,
    mirror: Mirror,
    reloads: VecDeque<PairKey>,
    backoff: Backoff,
}

impl Scheduler {
    fn run(mut self) {
        debug!("Scheduler running");
        loop {
            while let Ok(event) = self.rx.try_recv() {
                if !self.apply(event) {
                    return;
                }
            }
            if self.ctx.shutdown.is_triggered() {
                return;
            }

            if self.mirror.is_empty() && self.reloads.is_empty() {
                match self.rx.recv() {
                    Ok(event) => {
                        if !self.apply(event) {
                            return;
                        }
                        continue;
                    }
                    Err(_) => return,
                }
            }

            let delay = match self.dispatch() {
                Dispatch::Progress => {
                    self.backoff.reset();
                    continue;
                }
                Dispatch::Saturated => {
                    let delay = self.backoff.next();
                    debug!(delay_ms = delay.as_millis() as u64, "Worker pool saturated");
                    delay
                }
                Dispatch::Idle => self.backoff.next(),
            };

            match self.rx.recv_timeout(delay) {
                Ok(event) => {
                    if !self.apply(event) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    /// Returns false when the scheduler must stop.
    fn apply(&mut self, event: QueueEvent) -> bool {
        match event {
            QueueEvent::Added(entry) => self.mirror.insert(entry),
            QueueEvent::Settled { removed, token } => {
                self.mirror.remove(&removed);
                drop(token);
            }
            QueueEvent::Reload(pair) => {
                if !self.reloads.contains(&pair) {
                    self.reloads.push_back(pair);
                }
            }
            QueueEvent::Shutdown => return false,
        }
        true
    }

    fn dispatch(&mut self) -> Dispatch {
        let mut progress = false;

        // Deferred reloads go first so they are not starved by new work
        let mut waiting = VecDeque::new();
        while let Some(pair) = self.reloads.pop_front() {
            let Some(token) = self.ctx.tokens.try_acquire(&pair) else {
                waiting.push_back(pair);
                continue;
            };
            let ctx = self.ctx.clone();
            let events = self.events.clone();
            let job: Job = Box::new(move || {
                let removed = match reconcile::reload(&ctx, token.pair(), &HashSet::new()) {
                    Ok(removed) => removed,
                    Err(e) => {
                        error!(pair = %token.pair(), error = %e, "Reload failed");
                        Vec::new()
                    }
                };
                let pair = token.pair().clone();
                if events.send(QueueEvent::Settled { removed, token }).is_err() {
                    debug!(%pair, "Scheduler stopped before reload settled");
                }
            });
            if self.pool.try_execute(job).is_err() {
                waiting.push_back(pair);
                waiting.extend(self.reloads.drain(..));
                self.reloads = waiting;
                return Dispatch::Saturated;
            }
            progress = true;
        }
        self.reloads = waiting;

        let tokens = &self.ctx.tokens;
        let Some((token, batch)) = self.mirror.select(|pair| tokens.try_acquire(pair)) else {
            return if progress {
                Dispatch::Progress
            } else {
                Dispatch::Idle
            };
        };

        debug!(pair = %batch.pair, items = batch.items.len(), kind = ?batch.kind, "Dispatching batch");
        let sender = Sender::new(self.ctx.clone(), batch, self.events.clone(), token);
        match self.pool.try_execute(Box::new(move || sender.run())) {
            Ok(()) => Dispatch::Progress,
            // Dropping the rejected job releases its token
            Err(_) => Dispatch::Saturated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::SetAttribute;
    use crate::config::SyncConfig;
    use crate::storage::Storage;
    use crate::types::Timestamp;
    use tempfile::TempDir;

    fn scheduler() -> (Scheduler, TempDir) {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().join("scheduler.redb")).unwrap();
        let ctx = SyncContext::builder(SyncConfig::default(), storage).build().unwrap();
        let (events, rx) = channel::unbounded();
        let scheduler = Scheduler {
            pool: Arc::new(WorkerPool::new(1, 1, 1)),
            events,
            rx,
            mirror: Mirror::new(),
            reloads: VecDeque::new(),
            backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(100)),
            ctx,
        };
        (scheduler, temp)
    }

    fn entry(pair: &PairKey, time: Timestamp, value: &str) -> PendingEntry {
        PendingEntry {
            id: ActionId::new(),
            pair: pair.clone(),
            time,
            action: Box::new(SetAttribute::new(pair.clone(), "names", "display", value)),
        }
    }

    #[test]
    fn test_settled_batch_is_forgotten_before_pair_frees() {
        let (mut scheduler, _temp) = scheduler();
        let pair = PairKey::new("alice@example.org", "profile");
        let a1 = entry(&pair, 5_000, "Alice");
        let a1_id = a1.id;
        scheduler.mirror.insert(a1);

        let tokens = scheduler.ctx.tokens.clone();
        let (token, batch) = scheduler.mirror.select(|p| tokens.try_acquire(p)).unwrap();
        assert_eq!(batch.ids(), vec![a1_id]);

        // a2 lands on the time a1 held while the batch is in flight
        let a2 = entry(&pair, 5_000, "Alicia");
        let a2_id = a2.id;
        assert!(scheduler.apply(QueueEvent::Added(a2)));
        assert!(scheduler.apply(QueueEvent::Settled {
            removed: vec![a1_id],
            token,
        }));

        assert!(!tokens.is_suspended(&pair));
        let (_token, next) = scheduler.mirror.select(|p| tokens.try_acquire(p)).unwrap();
        assert_eq!(next.ids(), vec![a2_id]);
    }

    #[test]
    fn test_reload_request_after_shutdown_is_dropped() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().join("stopped.redb")).unwrap();
        let ctx = SyncContext::builder(SyncConfig::default(), storage).build().unwrap();
        let synchronizer = Synchronizer::start(ctx).unwrap();
        let pair = PairKey::new("alice@example.org", "profile");

        assert!(synchronizer.shutdown());
        synchronizer.request_reload(pair.clone());
        assert!(!synchronizer.context().tokens.is_suspended(&pair));
        // A second shutdown finds nothing left to stop
        assert!(synchronizer.shutdown());
    }

    #[test]
    fn test_reload_requests_are_deduplicated() {
        let (mut scheduler, _temp) = scheduler();
        let pair = PairKey::new("alice@example.org", "profile");

        assert!(scheduler.apply(QueueEvent::Reload(pair.clone())));
        assert!(scheduler.apply(QueueEvent::Reload(pair.clone())));
        assert_eq!(scheduler.reloads.len(), 1);

        assert!(!scheduler.apply(QueueEvent::Shutdown));
    }
}
