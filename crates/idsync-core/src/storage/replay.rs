//! Replay nonces - every nonce accepted on a decrypted envelope
//!
//! The nonce table enforces uniqueness; the (time, nonce) index lets the
//! purge walk expired records in order without scanning the whole table.

use redb::{ReadableTable, ReadableTableMetadata, TableDefinition};

use super::{StateTxn, Storage};
use crate::error::SyncError;
use crate::types::Timestamp;

/// Table for seen nonces (key: nonce; value: envelope time)
pub(crate) const REPLAY_TABLE: TableDefinition<&[u8], i64> = TableDefinition::new("replay_nonces");

/// Index for purging (key: time, nonce)
pub(crate) const REPLAY_BY_TIME_TABLE: TableDefinition<(i64, &[u8]), ()> =
    TableDefinition::new("replay_by_time");

impl StateTxn<'_> {
    /// Record `nonce` as seen at `time`.
    ///
    /// Returns `false` without modifying anything if the nonce is known.
    pub fn insert_nonce(&mut self, nonce: &[u8], time: Timestamp) -> Result<bool, SyncError> {
        let mut table = self.txn.open_table(REPLAY_TABLE)?;
        if table.get(nonce)?.is_some() {
            return Ok(false);
        }
        table.insert(nonce, time)?;
        let mut index = self.txn.open_table(REPLAY_BY_TIME_TABLE)?;
        index.insert((time, nonce), ())?;
        Ok(true)
    }

    /// Delete every nonce recorded with a time strictly before `cutoff`.
    pub fn purge_nonces(&mut self, cutoff: Timestamp) -> Result<usize, SyncError> {
        let mut index = self.txn.open_table(REPLAY_BY_TIME_TABLE)?;
        let expired: Vec<(i64, Vec<u8>)> = {
            let mut keys = Vec::new();
            for entry in index.range(..(cutoff, &[][..]))? {
                let (key, _) = entry?;
                let (time, nonce) = key.value();
                keys.push((time, nonce.to_vec()));
            }
            keys
        };

        let mut table = self.txn.open_table(REPLAY_TABLE)?;
        for (time, nonce) in &expired {
            index.remove((*time, nonce.as_slice()))?;
            table.remove(nonce.as_slice())?;
        }
        Ok(expired.len())
    }
}

impl Storage {
    /// Number of nonces currently retained.
    pub fn nonce_count(&self) -> Result<u64, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(REPLAY_TABLE)?;
        Ok(table.len()?)
    }
}
