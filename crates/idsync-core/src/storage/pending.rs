//! Pending action queue - durable records of actions not yet acknowledged
//!
//! Records are keyed by (identity, service, time). `time` is assigned inside
//! the inserting transaction as `max(last + 1, now)`, so it is strictly
//! increasing per pair and never leaves gaps another writer could fill.
//! A secondary (time, identity, service) index drives the global drain order.

use redb::{ReadableTable, TableDefinition};

use super::{StateTxn, Storage};
use crate::error::SyncError;
use crate::types::{PairKey, Timestamp};

/// Table for pending actions (key: identity, service, time; value: record bytes)
pub(crate) const PENDING_TABLE: TableDefinition<(&str, &str, i64), &[u8]> =
    TableDefinition::new("pending_actions");

/// Index for ordered drain (key: time, identity, service)
pub(crate) const PENDING_BY_TIME_TABLE: TableDefinition<(i64, &str, &str), ()> =
    TableDefinition::new("pending_by_time");

/// One durable queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    pub pair: PairKey,
    pub time: Timestamp,
    pub bytes: Vec<u8>,
}

impl StateTxn<'_> {
    /// Append a record for `pair`, returning the assigned time.
    pub fn push_pending(
        &mut self,
        pair: &PairKey,
        bytes: &[u8],
        now: Timestamp,
    ) -> Result<Timestamp, SyncError> {
        let identity = pair.identity.as_str();
        let service = pair.service.as_str();

        let mut table = self.txn.open_table(PENDING_TABLE)?;
        let last = {
            let mut range =
                table.range((identity, service, i64::MIN)..=(identity, service, i64::MAX))?;
            match range.next_back() {
                Some(entry) => Some(entry?.0.value().2),
                None => None,
            }
        };
        let time = match last {
            Some(last) => now.max(last + 1),
            None => now,
        };

        table.insert((identity, service, time), bytes)?;
        let mut index = self.txn.open_table(PENDING_BY_TIME_TABLE)?;
        index.insert((time, identity, service), ())?;
        Ok(time)
    }

    /// Remove the records of `pair` at the given times.
    ///
    /// Returns how many records existed and were removed.
    pub fn remove_pending(
        &mut self,
        pair: &PairKey,
        times: &[Timestamp],
    ) -> Result<usize, SyncError> {
        let identity = pair.identity.as_str();
        let service = pair.service.as_str();

        let mut table = self.txn.open_table(PENDING_TABLE)?;
        let mut index = self.txn.open_table(PENDING_BY_TIME_TABLE)?;
        let mut removed = 0;
        for &time in times {
            if table.remove((identity, service, time))?.is_some() {
                removed += 1;
            }
            index.remove((time, identity, service))?;
        }
        Ok(removed)
    }

    /// Remove the record of `pair` at `time`, but only if `matches` accepts
    /// its bytes. Times can be reused once a record is gone, so callers
    /// holding an older view check what is stored there now.
    ///
    /// Returns whether a record was removed.
    pub fn remove_pending_if(
        &mut self,
        pair: &PairKey,
        time: Timestamp,
        matches: impl FnOnce(&[u8]) -> bool,
    ) -> Result<bool, SyncError> {
        let identity = pair.identity.as_str();
        let service = pair.service.as_str();

        let mut table = self.txn.open_table(PENDING_TABLE)?;
        let matched = match table.get((identity, service, time))? {
            Some(bytes) => matches(bytes.value()),
            None => false,
        };
        if !matched {
            return Ok(false);
        }
        table.remove((identity, service, time))?;
        let mut index = self.txn.open_table(PENDING_BY_TIME_TABLE)?;
        index.remove((time, identity, service))?;
        Ok(true)
    }

    /// Replace the bytes of an existing record, keeping its time.
    ///
    /// Returns false when no record exists at `time`.
    pub fn update_pending(
        &mut self,
        pair: &PairKey,
        time: Timestamp,
        bytes: &[u8],
    ) -> Result<bool, SyncError> {
        let key = (pair.identity.as_str(), pair.service.as_str(), time);
        let mut table = self.txn.open_table(PENDING_TABLE)?;
        if table.get(key)?.is_none() {
            return Ok(false);
        }
        table.insert(key, bytes)?;
        Ok(true)
    }

    /// Pending records of `pair` in submission order, within this transaction.
    pub fn pending(&self, pair: &PairKey) -> Result<Vec<PendingRecord>, SyncError> {
        let identity = pair.identity.as_str();
        let service = pair.service.as_str();

        let table = self.txn.open_table(PENDING_TABLE)?;
        let mut records = Vec::new();
        for entry in table.range((identity, service, i64::MIN)..=(identity, service, i64::MAX))? {
            let (key, value) = entry?;
            records.push(PendingRecord {
                pair: pair.clone(),
                time: key.value().2,
                bytes: value.value().to_vec(),
            });
        }
        Ok(records)
    }
}

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Pending Queue Reads
    // ═══════════════════════════════════════════════════════════════════════

    /// Pending records of one pair in submission order.
    pub fn pending(&self, pair: &PairKey) -> Result<Vec<PendingRecord>, SyncError> {
        let identity = pair.identity.as_str();
        let service = pair.service.as_str();

        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(PENDING_TABLE)?;

        let mut records = Vec::new();
        for entry in table.range((identity, service, i64::MIN)..=(identity, service, i64::MAX))? {
            let (key, value) = entry?;
            records.push(PendingRecord {
                pair: pair.clone(),
                time: key.value().2,
                bytes: value.value().to_vec(),
            });
        }
        Ok(records)
    }

    /// Number of pending records of one pair.
    pub fn pending_count(&self, pair: &PairKey) -> Result<usize, SyncError> {
        let identity = pair.identity.as_str();
        let service = pair.service.as_str();

        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(PENDING_TABLE)?;

        let mut count = 0;
        for entry in table.range((identity, service, i64::MIN)..=(identity, service, i64::MAX))? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Every pending record, ordered by assigned time.
    pub fn all_pending(&self) -> Result<Vec<PendingRecord>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let index = read_txn.open_table(PENDING_BY_TIME_TABLE)?;
        let table = read_txn.open_table(PENDING_TABLE)?;

        let mut records = Vec::new();
        for entry in index.iter()? {
            let (key, _) = entry?;
            let (time, identity, service) = key.value();
            if let Some(value) = table.get((identity, service, time))? {
                records.push(PendingRecord {
                    pair: PairKey::new(identity, service),
                    time,
                    bytes: value.value().to_vec(),
                });
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::create_test_storage;
    use super::*;

    #[test]
    fn test_times_strictly_increase_even_with_stale_clock() {
        let (storage, _temp) = create_test_storage();
        let pair = PairKey::new("alice@example.org", "contacts");

        let t1 = storage.write(|txn| txn.push_pending(&pair, b"a1", 1_000)).unwrap();
        let t2 = storage.write(|txn| txn.push_pending(&pair, b"a2", 1_000)).unwrap();
        let t3 = storage.write(|txn| txn.push_pending(&pair, b"a3", 500)).unwrap();
        let t4 = storage.write(|txn| txn.push_pending(&pair, b"a4", 9_000)).unwrap();

        assert_eq!((t1, t2, t3, t4), (1_000, 1_001, 1_002, 9_000));
    }

    #[test]
    fn test_pairs_are_independent() {
        let (storage, _temp) = create_test_storage();
        let contacts = PairKey::new("alice@example.org", "contacts");
        let profile = PairKey::new("alice@example.org", "profile");

        storage.write(|txn| txn.push_pending(&contacts, b"c1", 1_000)).unwrap();
        let t = storage.write(|txn| txn.push_pending(&profile, b"p1", 1_000)).unwrap();

        assert_eq!(t, 1_000);
        assert_eq!(storage.pending_count(&contacts).unwrap(), 1);
        assert_eq!(storage.pending_count(&profile).unwrap(), 1);
    }

    #[test]
    fn test_remove_pending_updates_index() {
        let (storage, _temp) = create_test_storage();
        let pair = PairKey::new("alice@example.org", "contacts");

        let t1 = storage.write(|txn| txn.push_pending(&pair, b"a1", 1_000)).unwrap();
        storage.write(|txn| txn.push_pending(&pair, b"a2", 1_000)).unwrap();

        let removed = storage.write(|txn| txn.remove_pending(&pair, &[t1])).unwrap();
        assert_eq!(removed, 1);

        let all = storage.all_pending().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].bytes, b"a2".to_vec());
    }

    #[test]
    fn test_remove_pending_if_checks_current_bytes() {
        let (storage, _temp) = create_test_storage();
        let pair = PairKey::new("alice@example.org", "contacts");

        let t1 = storage.write(|txn| txn.push_pending(&pair, b"a1", 5_000)).unwrap();
        storage.write(|txn| txn.remove_pending(&pair, &[t1])).unwrap();
        // The emptied queue hands the same time to the next record
        let t2 = storage.write(|txn| txn.push_pending(&pair, b"a2", 5_000)).unwrap();
        assert_eq!(t1, t2);

        let removed = storage
            .write(|txn| txn.remove_pending_if(&pair, t1, |bytes| bytes == b"a1"))
            .unwrap();
        assert!(!removed);
        assert_eq!(storage.pending_count(&pair).unwrap(), 1);

        let removed = storage
            .write(|txn| txn.remove_pending_if(&pair, t2, |bytes| bytes == b"a2"))
            .unwrap();
        assert!(removed);
        assert!(storage.all_pending().unwrap().is_empty());
    }

    #[test]
    fn test_update_pending_keeps_position() {
        let (storage, _temp) = create_test_storage();
        let pair = PairKey::new("alice@example.org", "contacts");

        let t1 = storage.write(|txn| txn.push_pending(&pair, b"a1", 1_000)).unwrap();
        storage.write(|txn| txn.push_pending(&pair, b"a2", 1_000)).unwrap();

        assert!(storage.write(|txn| txn.update_pending(&pair, t1, b"a1'")).unwrap());
        assert!(!storage.write(|txn| txn.update_pending(&pair, 77, b"x")).unwrap());

        let pending = storage.pending(&pair).unwrap();
        assert_eq!(pending[0].time, t1);
        assert_eq!(pending[0].bytes, b"a1'".to_vec());
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_all_pending_orders_by_time_across_pairs() {
        let (storage, _temp) = create_test_storage();
        let a = PairKey::new("alice@example.org", "contacts");
        let b = PairKey::new("bob@example.org", "contacts");

        storage.write(|txn| txn.push_pending(&b, b"b1", 2_000)).unwrap();
        storage.write(|txn| txn.push_pending(&a, b"a1", 1_000)).unwrap();
        storage.write(|txn| txn.push_pending(&a, b"a2", 3_000)).unwrap();

        let order: Vec<_> = storage
            .all_pending()
            .unwrap()
            .into_iter()
            .map(|r| r.bytes)
            .collect();
        assert_eq!(order, vec![b"a1".to_vec(), b"b1".to_vec(), b"a2".to_vec()]);
    }
}
