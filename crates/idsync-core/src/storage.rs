//! Persistent storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - The pending-action queue (durable, time-ordered per identity/service)
//! - Sync cursors (last confirmed audit time per identity/service)
//! - Local module state mutated by actions
//! - Replay nonces seen on decrypted envelopes
//!
//! All mutations go through [`Storage::write`], which runs a closure inside
//! a single redb write transaction. redb admits one writer at a time, so the
//! write transaction is the exclusive lock of the system: it is held only for
//! discrete persistence work and never across network or backoff waits.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, WriteTransaction};
use tracing::warn;

use crate::error::SyncError;

// Submodules
mod cursor;
mod modules;
mod pending;
mod replay;

use cursor::CURSORS_TABLE;
use modules::MODULES_TABLE;
use pending::{PENDING_BY_TIME_TABLE, PENDING_TABLE};
use replay::{REPLAY_BY_TIME_TABLE, REPLAY_TABLE};

pub use pending::PendingRecord;

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

/// Handle to an open write transaction.
///
/// Everything done through one `StateTxn` commits or rolls back together.
pub struct StateTxn<'a> {
    txn: &'a WriteTransaction,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(PENDING_TABLE)?;
            let _ = write_txn.open_table(PENDING_BY_TIME_TABLE)?;
            let _ = write_txn.open_table(CURSORS_TABLE)?;
            let _ = write_txn.open_table(MODULES_TABLE)?;
            let _ = write_txn.open_table(REPLAY_TABLE)?;
            let _ = write_txn.open_table(REPLAY_BY_TIME_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Run `f` inside one write transaction.
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err`.
    /// Must not be called re-entrantly from inside `f`.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&mut StateTxn<'_>) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        let db = self.db.read();
        let txn = db.begin_write()?;
        let outcome = {
            let mut state = StateTxn { txn: &txn };
            f(&mut state)
        };
        match outcome {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    warn!(error = %abort_err, "Failed to roll back transaction");
                }
                Err(e)
            }
        }
    }
}
