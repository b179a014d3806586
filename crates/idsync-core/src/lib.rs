//! Identity Graph Sync Core Library
//!
//! Offline-first replication of actions performed on an identity graph.
//!
//! ## Overview
//!
//! A client mutates local state immediately through [`Action`]s and queues
//! each one durably. The [`Synchronizer`] delivers the queue to the host
//! that owns each `(identity, service)` pair, inside signed and encrypted
//! packet envelopes, and reconciles local state with the host's answer:
//! acknowledged actions leave the queue, refused ones are reversed, and the
//! host's audit of foreign changes is replayed locally.
//!
//! ## Core Principles
//!
//! - **Local-first**: actions apply locally before any network round trip
//! - **Per-pair ordering**: one sender per pair, items in assigned-time order
//! - **Durable**: the pending queue and sync cursors survive restarts
//!
//! ## Quick Start
//!
//! ```ignore
//! use idsync_core::{PairKey, SetAttribute, Storage, SyncConfig, SyncContext, Synchronizer};
//!
//! let storage = Storage::new("~/.idsync/state.redb")?;
//! let ctx = SyncContext::builder(SyncConfig::default(), storage).build()?;
//! let sync = Synchronizer::start(ctx)?;
//!
//! let pair = PairKey::new("alice@example.org", "profile");
//! sync.execute(Box::new(SetAttribute::new(pair.clone(), "names", "nickname", "ally")))?;
//! sync.wait_idle(&pair, std::time::Duration::from_secs(5))?;
//! ```

pub mod action;
pub mod attributes;
pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod host;
pub mod identity;
pub mod ledger;
pub mod packet;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod types;

// Re-exports
pub use action::{Action, ActionRecord, ActionRegistry};
pub use attributes::{ClearAttribute, CommitmentRotated, OpenAccount, SetAttribute};
pub use cache::{AttributeCache, TtlAttributeCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use context::{SyncContext, SyncContextBuilder};
pub use error::{PacketError, PacketErrorKind, Side, SyncError, SyncResult};
pub use host::{EntityResolver, HostEndpoint, MethodHandler, StaticResolver};
pub use identity::{Commitment, Credentials, HostKeypair, HostPublicKeys, SecretCommitment};
pub use ledger::{ErrorLedger, JsonlErrorLedger, LedgerEntry, MemoryErrorLedger};
pub use packet::{ReplayGuard, Request, Response};
pub use storage::Storage;
pub use sync::{AuditReconciler, Synchronizer};
pub use transport::{LoopbackTransport, TcpTransport, Transport};
pub use types::*;
