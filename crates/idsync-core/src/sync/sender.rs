//! One in-flight batch: deliver it, settle each item, apply the audit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crossbeam::channel;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::queue::{Batch, BatchKind, QueueEvent};
use super::reconcile::{self, AuditReconciler};
use super::tokens::SuspensionToken;
use crate::action::{Action, ActionRecord};
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::packet::{Reply, Request, RequestAudit, Response};
use crate::types::{ActionId, PairKey, Subject, Timestamp};

/// Send `request`, retrying transport failures with backoff until it goes
/// through or the process shuts down (`None`).
pub(crate) fn send_with_backoff(ctx: &SyncContext, request: &Request) -> Option<SyncResult<Response>> {
    let mut backoff = Backoff::new(ctx.config.initial_backoff(), ctx.config.max_backoff());
    loop {
        if ctx.shutdown.is_triggered() {
            return None;
        }
        match request.send(ctx, ctx.config.verify_responses) {
            Err(e) if e.is_transient() => {
                let delay = backoff.next();
                warn!(
                    recipient = %request.recipient(),
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Delivery failed, retrying"
                );
                if ctx.shutdown.sleep(delay) {
                    return None;
                }
            }
            outcome => return Some(outcome),
        }
    }
}

/// Whether queued `bytes` are the record of action `id`.
fn holds(bytes: &[u8], id: ActionId) -> bool {
    ActionRecord::decode(bytes).map_or(false, |record| record.id == id)
}

/// A batch item reloaded from the durable queue.
struct Loaded {
    time: Timestamp,
    record: ActionRecord,
    action: Box<dyn Action>,
}

pub(crate) struct Sender {
    ctx: Arc<SyncContext>,
    batch: Batch,
    events: channel::Sender<QueueEvent>,
    token: SuspensionToken,
}

impl Sender {
    pub(crate) fn new(
        ctx: Arc<SyncContext>,
        batch: Batch,
        events: channel::Sender<QueueEvent>,
        token: SuspensionToken,
    ) -> Self {
        Self {
            ctx,
            batch,
            events,
            token,
        }
    }

    pub(crate) fn run(self) {
        let pair = self.batch.pair.clone();
        let mut resolved: HashSet<Timestamp> = HashSet::new();
        let mut dropped: Vec<ActionId> = Vec::new();

        match self.deliver(&mut resolved, &mut dropped) {
            Ok(true) => {}
            Ok(false) => {
                info!(%pair, items = self.batch.items.len(), "Batch abandoned at shutdown");
                return;
            }
            Err(e) => error!(%pair, error = %e, "Batch failed"),
        }

        // Whatever is left of the batch leaves the queue now. Times are
        // reused once a queue empties, so only the batch's own records go.
        let leftover: Vec<_> = self
            .batch
            .items
            .iter()
            .filter(|item| !resolved.contains(&item.time))
            .copied()
            .collect();
        if !leftover.is_empty() {
            let result = self.ctx.storage.write(|txn| {
                for item in &leftover {
                    txn.remove_pending_if(&pair, item.time, |bytes| holds(bytes, item.id))?;
                }
                Ok(())
            });
            if let Err(e) = result {
                error!(%pair, error = %e, "Failed to remove delivered records");
            }
        }

        dropped.extend(self.batch.ids());
        debug!(%pair, token = ?self.token, "Batch settled");

        let Sender { token, events, .. } = self;
        let settled = QueueEvent::Settled {
            removed: dropped,
            token,
        };
        // A failed send hands the event back and drops the token with it
        if events.send(settled).is_err() {
            debug!(%pair, "Scheduler stopped before batch settled");
        }
    }

    /// Returns false if the batch was abandoned because of shutdown; its
    /// records then stay queued.
    fn deliver(
        &self,
        resolved: &mut HashSet<Timestamp>,
        dropped: &mut Vec<ActionId>,
    ) -> SyncResult<bool> {
        let pair = &self.batch.pair;
        let mut items = self.load()?;
        if items.is_empty() {
            debug!(%pair, "Batch already settled");
            return Ok(true);
        }

        let since = self.ctx.storage.cursor(pair)?.unwrap_or(0);
        let outcome = self.request(pair, &items, since).and_then(|request| {
            info!(
                %pair,
                kind = ?self.batch.kind,
                items = request.len(),
                since,
                "Sending batch"
            );
            Ok(send_with_backoff(&self.ctx, &request))
        });
        let outcome = match outcome {
            Ok(None) => return Ok(false),
            Ok(Some(outcome)) => outcome,
            Err(e) => Err(e),
        };

        let mut response = match outcome {
            Ok(response) => response,
            Err(e) => {
                warn!(%pair, error = %e, "Batch rejected");
                self.fail_all(&mut items, &e, resolved, dropped);
                return Ok(true);
            }
        };

        let escalated = match self.batch.kind {
            BatchKind::Independent => self.settle_each(&mut items, &response, resolved, dropped),
            BatchKind::Composite => {
                self.settle_composite(&mut items[0], &response, resolved);
                false
            }
        };

        if escalated {
            debug!(%pair, "Audit skipped after reload");
        } else if let Some(audit) = response.take_audit() {
            let skip: HashSet<ActionId> = self.batch.ids().into_iter().collect();
            match AuditReconciler::new(&self.ctx).apply(pair, &audit, &skip) {
                Ok(removed) => dropped.extend(removed),
                Err(e) => error!(%pair, error = %e, "Failed to apply audit"),
            }
        }
        Ok(true)
    }

    /// Fresh copies of the batch items that are still queued.
    fn load(&self) -> SyncResult<Vec<Loaded>> {
        let pair = &self.batch.pair;
        let mut stored: HashMap<Timestamp, Vec<u8>> = self
            .ctx
            .storage
            .pending(pair)?
            .into_iter()
            .map(|record| (record.time, record.bytes))
            .collect();

        let mut items = Vec::with_capacity(self.batch.items.len());
        for item in &self.batch.items {
            let Some(bytes) = stored.remove(&item.time) else {
                continue;
            };
            match self.ctx.registry.decode_bytes(&bytes) {
                Ok((record, action)) if record.id == item.id => items.push(Loaded {
                    time: item.time,
                    record,
                    action,
                }),
                Ok(_) => {}
                Err(e) => warn!(%pair, action = %item.id, error = %e, "Undecodable batch item"),
            }
        }
        Ok(items)
    }

    fn request(&self, pair: &PairKey, items: &[Loaded], since: Timestamp) -> SyncResult<Request> {
        let recipient = self.ctx.cache.service_host(pair)?;
        let methods = items
            .iter()
            .map(|item| item.record.method(item.action.as_ref()))
            .collect::<SyncResult<Vec<_>>>()?;
        Ok(Request::new(
            methods,
            recipient,
            Subject::Entity(pair.identity.clone()),
            Some(RequestAudit { since }),
        )?)
    }

    /// Settle items newest first. Returns true if a reversal had to be
    /// escalated to a reload, which ends per-item processing.
    fn settle_each(
        &self,
        items: &mut [Loaded],
        response: &Response,
        resolved: &mut HashSet<Timestamp>,
        dropped: &mut Vec<ActionId>,
    ) -> bool {
        for position in (0..items.len()).rev() {
            let item = &mut items[position];
            match response.check_reply(position) {
                Ok(reply) => self.acknowledge(item, reply, resolved),
                Err(e) => {
                    self.ctx.record_failure(&item.record, &format!("{} {}", e.side, e.kind), &e.message);
                    if !self.reverse(item, resolved, dropped) {
                        return true;
                    }
                }
            }
        }
        false
    }

    fn settle_composite(&self, item: &mut Loaded, response: &Response, resolved: &mut HashSet<Timestamp>) {
        match response.check_reply(0) {
            Ok(reply) => self.acknowledge(item, reply, resolved),
            Err(e) => {
                warn!(pair = %self.batch.pair, action = %item.record.id, error = %e, "Composite action refused");
                self.ctx.record_failure(&item.record, &format!("{} {}", e.side, e.kind), &e.message);
            }
        }
    }

    /// The exchange itself failed: every item fails with the same error.
    fn fail_all(
        &self,
        items: &mut [Loaded],
        error: &SyncError,
        resolved: &mut HashSet<Timestamp>,
        dropped: &mut Vec<ActionId>,
    ) {
        let kind = match error.packet() {
            Some(packet) => format!("{} {}", packet.side, packet.kind),
            None => "delivery".to_string(),
        };
        let message = error.to_string();

        match self.batch.kind {
            BatchKind::Composite => {
                self.ctx.record_failure(&items[0].record, &kind, &message);
            }
            BatchKind::Independent => {
                for item in items.iter_mut().rev() {
                    self.ctx.record_failure(&item.record, &kind, &message);
                    if !self.reverse(item, resolved, dropped) {
                        return;
                    }
                }
            }
        }
    }

    fn acknowledge(&self, item: &mut Loaded, reply: Option<&Reply>, resolved: &mut HashSet<Timestamp>) {
        let pair = &self.batch.pair;
        let result = self.ctx.storage.write(|txn| {
            item.action.execute_on_success(txn, reply)?;
            let id = item.record.id;
            txn.remove_pending_if(pair, item.time, |bytes| holds(bytes, id))?;
            Ok(())
        });
        match result {
            Ok(()) => {
                resolved.insert(item.time);
                debug!(%pair, action = %item.record.id, "Acknowledged");
            }
            Err(e) => {
                warn!(%pair, action = %item.record.id, error = %e, "Acknowledgement failed");
                self.ctx.record_failure(&item.record, "acknowledge", &e.to_string());
            }
        }
    }

    /// Reverse a failed item. Returns false if reversal had to escalate to
    /// a reload.
    fn reverse(&self, item: &Loaded, resolved: &mut HashSet<Timestamp>, dropped: &mut Vec<ActionId>) -> bool {
        let pair = &self.batch.pair;
        let reversed = self.ctx.storage.write(|txn| {
            reconcile::reverse_failed(txn, &self.ctx.registry, pair, item.time, &item.record)
        });
        match reversed {
            Ok(()) => {
                resolved.insert(item.time);
                info!(%pair, action = %item.record.id, "Reversed failed action");
                true
            }
            Err(e) => {
                warn!(%pair, action = %item.record.id, error = %e, "Reversal failed, reloading");
                let skip: HashSet<ActionId> = self.batch.ids().into_iter().collect();
                match reconcile::reload(&self.ctx, pair, &skip) {
                    Ok(removed) => dropped.extend(removed),
                    Err(reload_err) => {
                        let failure = SyncError::ReversalFailed(format!("{}; reload: {}", e, reload_err));
                        error!(%pair, action = %item.record.id, error = %failure, "Giving up on reversal");
                        self.ctx.record_failure(&item.record, "reversal", &failure.to_string());
                    }
                }
                false
            }
        }
    }
}
