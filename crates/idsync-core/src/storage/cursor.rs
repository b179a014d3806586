//! Sync cursors - last confirmed audit time per identity/service

use redb::{ReadableTable, TableDefinition};
use tracing::debug;

use super::{StateTxn, Storage};
use crate::error::SyncError;
use crate::types::{PairKey, Timestamp};

/// Table for sync cursors (key: identity, service; value: time)
pub(crate) const CURSORS_TABLE: TableDefinition<(&str, &str), i64> =
    TableDefinition::new("sync_cursors");

impl StateTxn<'_> {
    pub fn cursor(&self, pair: &PairKey) -> Result<Option<Timestamp>, SyncError> {
        let table = self.txn.open_table(CURSORS_TABLE)?;
        let value = table
            .get((pair.identity.as_str(), pair.service.as_str()))?
            .map(|v| v.value());
        Ok(value)
    }

    /// Upsert the cursor, never moving it backwards.
    ///
    /// Returns the cursor value after the update.
    pub fn advance_cursor(
        &mut self,
        pair: &PairKey,
        time: Timestamp,
    ) -> Result<Timestamp, SyncError> {
        let key = (pair.identity.as_str(), pair.service.as_str());
        let mut table = self.txn.open_table(CURSORS_TABLE)?;
        let current = table.get(key)?.map(|v| v.value());

        match current {
            Some(current) if current >= time => {
                if current > time {
                    debug!(%pair, current, offered = time, "Ignoring older cursor");
                }
                Ok(current)
            }
            _ => {
                table.insert(key, time)?;
                Ok(time)
            }
        }
    }
}

impl Storage {
    /// Read the sync cursor of one pair.
    pub fn cursor(&self, pair: &PairKey) -> Result<Option<Timestamp>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CURSORS_TABLE)?;
        let value = table
            .get((pair.identity.as_str(), pair.service.as_str()))?
            .map(|v| v.value());
        Ok(value)
    }

    /// Every stored cursor, ordered by identity then service.
    pub fn cursors(&self) -> Result<Vec<(PairKey, Timestamp)>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CURSORS_TABLE)?;

        let mut cursors = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let (identity, service) = key.value();
            cursors.push((PairKey::new(identity, service), value.value()));
        }
        Ok(cursors)
    }
}
