//! Module state - the local view of each service, split into modules
//!
//! Actions mutate module state optimistically; a full reload replaces every
//! module of a pair at once.

use redb::{ReadableTable, TableDefinition};

use super::{StateTxn, Storage};
use crate::error::SyncError;
use crate::types::{ModuleId, PairKey};

/// Table for module state (key: identity, service, module; value: state bytes)
pub(crate) const MODULES_TABLE: TableDefinition<(&str, &str, &str), &[u8]> =
    TableDefinition::new("module_state");

impl StateTxn<'_> {
    pub fn module(&self, pair: &PairKey, module: &ModuleId) -> Result<Option<Vec<u8>>, SyncError> {
        let table = self.txn.open_table(MODULES_TABLE)?;
        let value = table
            .get((pair.identity.as_str(), pair.service.as_str(), module.as_str()))?
            .map(|v| v.value().to_vec());
        Ok(value)
    }

    pub fn put_module(
        &mut self,
        pair: &PairKey,
        module: &ModuleId,
        state: &[u8],
    ) -> Result<(), SyncError> {
        let mut table = self.txn.open_table(MODULES_TABLE)?;
        table.insert(
            (pair.identity.as_str(), pair.service.as_str(), module.as_str()),
            state,
        )?;
        Ok(())
    }

    pub fn remove_module(&mut self, pair: &PairKey, module: &ModuleId) -> Result<bool, SyncError> {
        let mut table = self.txn.open_table(MODULES_TABLE)?;
        let removed = table
            .remove((pair.identity.as_str(), pair.service.as_str(), module.as_str()))?
            .is_some();
        Ok(removed)
    }

    /// Drop every module of `pair` and store `modules` in their place.
    pub fn replace_modules(
        &mut self,
        pair: &PairKey,
        modules: &[(ModuleId, Vec<u8>)],
    ) -> Result<(), SyncError> {
        let identity = pair.identity.as_str();
        let service = pair.service.as_str();
        let mut table = self.txn.open_table(MODULES_TABLE)?;

        // Collect first: the range borrows the table
        let existing: Vec<String> = {
            let mut names = Vec::new();
            for entry in table.range((identity, service, "")..)? {
                let (key, _) = entry?;
                let (i, s, module) = key.value();
                if i != identity || s != service {
                    break;
                }
                names.push(module.to_string());
            }
            names
        };

        for module in &existing {
            table.remove((identity, service, module.as_str()))?;
        }
        for (module, state) in modules {
            table.insert((identity, service, module.as_str()), state.as_slice())?;
        }
        Ok(())
    }
}

impl Storage {
    pub fn module(&self, pair: &PairKey, module: &ModuleId) -> Result<Option<Vec<u8>>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(MODULES_TABLE)?;
        let value = table
            .get((pair.identity.as_str(), pair.service.as_str(), module.as_str()))?
            .map(|v| v.value().to_vec());
        Ok(value)
    }

    /// All modules stored for one pair, ordered by module id.
    pub fn modules(&self, pair: &PairKey) -> Result<Vec<(ModuleId, Vec<u8>)>, SyncError> {
        let identity = pair.identity.as_str();
        let service = pair.service.as_str();

        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(MODULES_TABLE)?;

        let mut modules = Vec::new();
        for entry in table.range((identity, service, "")..)? {
            let (key, value) = entry?;
            let (i, s, module) = key.value();
            if i != identity || s != service {
                break;
            }
            modules.push((ModuleId::new(module), value.value().to_vec()));
        }
        Ok(modules)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::create_test_storage;
    use super::*;

    #[test]
    fn test_replace_modules_only_touches_pair() {
        let (storage, _temp) = create_test_storage();
        let alice = PairKey::new("alice@example.org", "profile");
        let bob = PairKey::new("bob@example.org", "profile");

        storage
            .write(|txn| {
                txn.put_module(&alice, &ModuleId::new("names"), b"old")?;
                txn.put_module(&alice, &ModuleId::new("photos"), b"old")?;
                txn.put_module(&bob, &ModuleId::new("names"), b"bob")
            })
            .unwrap();

        storage
            .write(|txn| {
                txn.replace_modules(&alice, &[(ModuleId::new("names"), b"new".to_vec())])
            })
            .unwrap();

        assert_eq!(
            storage.modules(&alice).unwrap(),
            vec![(ModuleId::new("names"), b"new".to_vec())]
        );
        assert_eq!(
            storage.module(&bob, &ModuleId::new("names")).unwrap(),
            Some(b"bob".to_vec())
        );
    }

    #[test]
    fn test_remove_module() {
        let (storage, _temp) = create_test_storage();
        let pair = PairKey::new("alice@example.org", "profile");
        let module = ModuleId::new("names");

        storage.write(|txn| txn.put_module(&pair, &module, b"x")).unwrap();
        assert!(storage.write(|txn| txn.remove_module(&pair, &module)).unwrap());
        assert!(!storage.write(|txn| txn.remove_module(&pair, &module)).unwrap());
    }
}
