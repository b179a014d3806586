//! Client-side action synchronizer
//!
//! ```text
//!  execute(action) ──► local state + pending queue (redb, one txn)
//!                              │ QueueEvent::Added
//!                              ▼
//!                      scheduler thread ── Mirror::select ──► Batch
//!                              │ SuspensionToken per (identity, service)
//!                              ▼
//!                      WorkerPool ──► Sender::run
//!                                      ├─ Request::send (backoff on transport errors)
//!                                      ├─ acknowledge / reverse each item
//!                                      ├─ reload on failed reversal
//!                                      └─ AuditReconciler::apply
//! ```
//!
//! At most one sender or reload holds a pair at a time; items of one pair
//! are delivered and redone in assigned-time order.

mod backoff;
mod pool;
mod queue;
mod reconcile;
mod sender;
mod synchronizer;
mod tokens;

pub use backoff::Backoff;
pub use pool::{Job, WorkerPool};
pub use queue::{Batch, BatchItem, BatchKind, Mirror, PendingEntry, QueueEvent};
pub use reconcile::AuditReconciler;
pub use synchronizer::Synchronizer;
pub use tokens::{ShutdownSignal, SuspensionToken, SuspensionTokens};
