//! Reconciling local optimistic state with the host.
//!
//! Everything here runs inside one write transaction per operation, so a
//! failure half way through rolls local state back to where it started.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use super::sender::send_with_backoff;
use crate::action::{Action, ActionRecord, ActionRegistry};
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::packet::{Method, MethodKind, Request, ResponseAudit, StateSnapshot};
use crate::storage::StateTxn;
use crate::types::{ActionId, ModuleId, PairKey, Subject, Timestamp};

/// A pending action that could not be redone. It has already been removed
/// from the queue inside the transaction that found it.
pub(crate) struct RedoFailure {
    pub record: ActionRecord,
    pub error: SyncError,
}

/// Re-execute the pending actions of `pair` in queue order.
///
/// Only actions whose module passes `affected` are redone, and `skip`
/// lists actions that are being resolved by the caller. Each redone record
/// is rewritten with what the action captured this time.
pub(crate) fn redo_pending(
    txn: &mut StateTxn<'_>,
    registry: &ActionRegistry,
    pair: &PairKey,
    affected: impl Fn(Option<&ModuleId>) -> bool,
    skip: &HashSet<ActionId>,
) -> SyncResult<Vec<RedoFailure>> {
    let mut failures = Vec::new();

    for pending in txn.pending(pair)? {
        let record = match ActionRecord::decode(&pending.bytes) {
            Ok(record) => record,
            Err(e) => {
                warn!(%pair, time = pending.time, error = %e, "Dropping unreadable pending record");
                txn.remove_pending(pair, &[pending.time])?;
                continue;
            }
        };
        if skip.contains(&record.id) || !affected(record.module.as_ref()) {
            continue;
        }

        let outcome = registry.decode(&record).and_then(|mut action| {
            action.execute_locally(txn)?;
            let refreshed = ActionRecord::capture(record.id, action.as_ref())?;
            txn.update_pending(pair, pending.time, &refreshed.encode()?)?;
            Ok(())
        });
        if let Err(error) = outcome {
            debug!(%pair, action = %record.id, %error, "Redo failed");
            txn.remove_pending(pair, &[pending.time])?;
            failures.push(RedoFailure { record, error });
        }
    }
    Ok(failures)
}

/// Ledger redo failures once their transaction committed.
pub(crate) fn report_redo_failures(ctx: &SyncContext, failures: Vec<RedoFailure>) -> Vec<ActionId> {
    failures
        .into_iter()
        .map(|failure| {
            ctx.record_failure(&failure.record, "redo", &failure.error.to_string());
            failure.record.id
        })
        .collect()
}

/// Undo a failed action and drop it from the queue.
///
/// When the straight reversal is refused, every other pending action of
/// the pair that interferes with the failed one is reversed newest first,
/// the failed action is reversed, and the others are redone oldest first.
/// Any failure rolls the whole attempt back.
pub(crate) fn reverse_failed(
    txn: &mut StateTxn<'_>,
    registry: &ActionRegistry,
    pair: &PairKey,
    failed_time: Timestamp,
    failed: &ActionRecord,
) -> SyncResult<()> {
    let mut action = registry.decode(failed)?;

    if let Err(refused) = action.reverse_locally(txn) {
        debug!(%pair, action = %failed.id, error = %refused, "Direct reversal refused");

        let mut others: Vec<(Timestamp, ActionRecord, Box<dyn Action>)> = Vec::new();
        for pending in txn.pending(pair)? {
            if pending.time == failed_time {
                continue;
            }
            let (record, other) = registry.decode_bytes(&pending.bytes)?;
            if other.interferes_with(action.as_ref()) {
                others.push((pending.time, record, other));
            }
        }
        if others.is_empty() {
            return Err(refused);
        }

        for (_, record, other) in others.iter_mut().rev() {
            other.reverse_locally(txn).map_err(|e| {
                SyncError::ReversalFailed(format!("cannot reverse {}: {}", record.id, e))
            })?;
        }
        action.reverse_locally(txn)?;
        for (time, record, other) in others.iter_mut() {
            other.execute_locally(txn)?;
            let refreshed = ActionRecord::capture(record.id, other.as_ref())?;
            txn.update_pending(pair, *time, &refreshed.encode()?)?;
        }
        info!(%pair, action = %failed.id, redone = others.len(), "Reversed around interfering actions");
    }

    txn.remove_pending(pair, &[failed_time])?;
    Ok(())
}

/// Replace the local state of `pair` with the host's and redo what is
/// still pending. The caller must hold the pair's suspension token.
///
/// Returns the actions dropped from the queue because they no longer
/// apply.
pub(crate) fn reload(
    ctx: &SyncContext,
    pair: &PairKey,
    skip: &HashSet<ActionId>,
) -> SyncResult<Vec<ActionId>> {
    let recipient = ctx.cache.service_host(pair)?;
    let query = Method::new(MethodKind::StateQuery, pair.service.clone(), Vec::new());
    let request = Request::new(
        vec![query],
        recipient,
        Subject::Entity(pair.identity.clone()),
        None,
    )?;

    let response = send_with_backoff(ctx, &request).ok_or(SyncError::ShuttingDown)??;
    let reply = response
        .check_reply(0)?
        .ok_or_else(|| SyncError::InvalidOperation(format!("empty state reply for {}", pair)))?;
    let snapshot: StateSnapshot = postcard::from_bytes(&reply.payload)
        .map_err(|e| SyncError::Serialization(format!("Invalid state snapshot: {}", e)))?;

    // Every module of the pair is replaced, so every pending action is redone
    let failures = ctx.storage.write(|txn| {
        txn.replace_modules(pair, &snapshot.modules)?;
        txn.advance_cursor(pair, snapshot.time)?;
        redo_pending(txn, &ctx.registry, pair, |_| true, skip)
    })?;

    info!(
        %pair,
        modules = snapshot.modules.len(),
        cursor = snapshot.time,
        dropped = failures.len(),
        "Reloaded state"
    );
    Ok(report_redo_failures(ctx, failures))
}

/// Applies host audits to local state.
pub struct AuditReconciler<'a> {
    ctx: &'a SyncContext,
}

impl<'a> AuditReconciler<'a> {
    pub fn new(ctx: &'a SyncContext) -> Self {
        Self { ctx }
    }

    /// Advance the cursor, apply the foreign actions the host reported
    /// and, if the host says state changed under us, redo pending actions
    /// on the affected modules.
    ///
    /// Returns the actions dropped from the queue because they no longer
    /// apply.
    pub fn apply(
        &self,
        pair: &PairKey,
        audit: &ResponseAudit,
        skip: &HashSet<ActionId>,
    ) -> SyncResult<Vec<ActionId>> {
        let registry = &self.ctx.registry;
        let failures = self.ctx.storage.write(|txn| {
            txn.advance_cursor(pair, audit.time)?;

            for entry in &audit.entries {
                match registry.decode_bytes(&entry.record) {
                    Ok((record, mut action)) => {
                        if let Err(e) = action.execute_locally(txn) {
                            warn!(%pair, action = %record.id, error = %e, "Could not apply foreign action");
                        }
                    }
                    Err(e) => {
                        warn!(%pair, time = entry.time, error = %e, "Unreadable audit entry");
                    }
                }
            }

            if !audit.state_mutated {
                return Ok(Vec::new());
            }
            redo_pending(
                txn,
                registry,
                pair,
                |module| module.map_or(true, |m| audit.modules.contains(m)),
                skip,
            )
        })?;

        debug!(
            %pair,
            cursor = audit.time,
            foreign = audit.entries.len(),
            mutated = audit.state_mutated,
            "Applied audit"
        );
        Ok(report_redo_failures(self.ctx, failures))
    }
}
