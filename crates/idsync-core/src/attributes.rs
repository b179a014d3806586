//! Built-in identity-graph actions.
//!
//! Attribute modules are flat string maps stored as postcard-encoded
//! `BTreeMap<String, String>` in the module table. Attribute edits record
//! what they replaced so they can be reversed, and refuse to reverse once a
//! later edit has changed the same key.

use std::any::Any;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::action::{decode_as, encode_payload, Action, ActionRegistry};
use crate::error::{SyncError, SyncResult};
use crate::identity::Commitment;
use crate::packet::{MethodKind, Reply};
use crate::storage::StateTxn;
use crate::types::{ModuleId, PairKey};

pub type AttributeMap = BTreeMap<String, String>;

pub(crate) fn register_builtins(registry: &mut ActionRegistry) {
    registry.register(SetAttribute::TYPE_TAG, decode_as::<SetAttribute>);
    registry.register(ClearAttribute::TYPE_TAG, decode_as::<ClearAttribute>);
    registry.register(OpenAccount::TYPE_TAG, decode_as::<OpenAccount>);
    registry.register(CommitmentRotated::TYPE_TAG, decode_as::<CommitmentRotated>);
}

/// Read an attribute module, empty when absent.
pub fn load_attributes(
    txn: &StateTxn<'_>,
    pair: &PairKey,
    module: &ModuleId,
) -> SyncResult<AttributeMap> {
    match txn.module(pair, module)? {
        Some(bytes) => decode_attributes(&bytes),
        None => Ok(AttributeMap::new()),
    }
}

pub fn decode_attributes(bytes: &[u8]) -> SyncResult<AttributeMap> {
    postcard::from_bytes(bytes)
        .map_err(|e| SyncError::Serialization(format!("Invalid attribute module: {}", e)))
}

pub fn store_attributes(
    txn: &mut StateTxn<'_>,
    pair: &PairKey,
    module: &ModuleId,
    map: &AttributeMap,
) -> SyncResult<()> {
    let bytes = encode_payload(map)?;
    txn.put_module(pair, module, &bytes)
}

/// The (module, key) an attribute edit targets.
fn attribute_target(action: &dyn Action) -> Option<(&PairKey, &ModuleId, &str)> {
    let any = action.as_any();
    if let Some(set) = any.downcast_ref::<SetAttribute>() {
        return Some((&set.pair, &set.module, set.key.as_str()));
    }
    if let Some(clear) = any.downcast_ref::<ClearAttribute>() {
        return Some((&clear.pair, &clear.module, clear.key.as_str()));
    }
    None
}

fn is_attribute_edit(action: &dyn Action) -> bool {
    matches!(
        action.type_tag(),
        SetAttribute::TYPE_TAG | ClearAttribute::TYPE_TAG
    )
}

/// Put the value an edit replaced back, provided `key` still holds what
/// the edit left there.
fn restore(
    txn: &mut StateTxn<'_>,
    pair: &PairKey,
    module: &ModuleId,
    key: &str,
    expected: Option<&str>,
    previous: Option<&String>,
) -> SyncResult<()> {
    let mut map = load_attributes(txn, pair, module)?;
    let current = map.get(key).map(String::as_str);
    if current != expected {
        return Err(SyncError::Action(format!(
            "{} of {} in {} changed since it was edited",
            key, module, pair
        )));
    }
    match previous {
        Some(value) => map.insert(key.to_string(), value.clone()),
        None => map.remove(key),
    };
    store_attributes(txn, pair, module, &map)
}

/// Set one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAttribute {
    pub pair: PairKey,
    pub module: ModuleId,
    pub key: String,
    pub value: String,
    /// Value replaced by the last local execution
    pub previous: Option<String>,
}

impl SetAttribute {
    pub const TYPE_TAG: &'static str = "attribute.set";

    pub fn new(
        pair: PairKey,
        module: impl Into<ModuleId>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            pair,
            module: module.into(),
            key: key.into(),
            value: value.into(),
            previous: None,
        }
    }
}

impl Action for SetAttribute {
    fn type_tag(&self) -> &'static str {
        Self::TYPE_TAG
    }

    fn pair(&self) -> &PairKey {
        &self.pair
    }

    fn module(&self) -> Option<&ModuleId> {
        Some(&self.module)
    }

    fn is_similar(&self, other: &dyn Action) -> bool {
        other.pair() == &self.pair && is_attribute_edit(other)
    }

    fn interferes_with(&self, other: &dyn Action) -> bool {
        attribute_target(other)
            .is_some_and(|(p, m, k)| p == &self.pair && m == &self.module && k == self.key)
    }

    fn execute_locally(&mut self, txn: &mut StateTxn<'_>) -> SyncResult<()> {
        let mut map = load_attributes(txn, &self.pair, &self.module)?;
        let previous = map.insert(self.key.clone(), self.value.clone());
        store_attributes(txn, &self.pair, &self.module, &map)?;
        self.previous = previous;
        Ok(())
    }

    fn reverse_locally(&mut self, txn: &mut StateTxn<'_>) -> SyncResult<()> {
        restore(
            txn,
            &self.pair,
            &self.module,
            &self.key,
            Some(self.value.as_str()),
            self.previous.as_ref(),
        )
    }

    fn payload(&self) -> SyncResult<Vec<u8>> {
        encode_payload(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Remove one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearAttribute {
    pub pair: PairKey,
    pub module: ModuleId,
    pub key: String,
    pub previous: Option<String>,
}

impl ClearAttribute {
    pub const TYPE_TAG: &'static str = "attribute.clear";

    pub fn new(pair: PairKey, module: impl Into<ModuleId>, key: impl Into<String>) -> Self {
        Self {
            pair,
            module: module.into(),
            key: key.into(),
            previous: None,
        }
    }
}

impl Action for ClearAttribute {
    fn type_tag(&self) -> &'static str {
        Self::TYPE_TAG
    }

    fn pair(&self) -> &PairKey {
        &self.pair
    }

    fn module(&self) -> Option<&ModuleId> {
        Some(&self.module)
    }

    fn is_similar(&self, other: &dyn Action) -> bool {
        other.pair() == &self.pair && is_attribute_edit(other)
    }

    fn interferes_with(&self, other: &dyn Action) -> bool {
        attribute_target(other)
            .is_some_and(|(p, m, k)| p == &self.pair && m == &self.module && k == self.key)
    }

    fn execute_locally(&mut self, txn: &mut StateTxn<'_>) -> SyncResult<()> {
        let mut map = load_attributes(txn, &self.pair, &self.module)?;
        let previous = map.remove(&self.key);
        if previous.is_some() {
            store_attributes(txn, &self.pair, &self.module, &map)?;
        }
        self.previous = previous;
        Ok(())
    }

    fn reverse_locally(&mut self, txn: &mut StateTxn<'_>) -> SyncResult<()> {
        restore(
            txn,
            &self.pair,
            &self.module,
            &self.key,
            None,
            self.previous.as_ref(),
        )
    }

    fn payload(&self) -> SyncResult<Vec<u8>> {
        encode_payload(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Open an account for an identity on a host that does not serve it yet.
///
/// Composite: always delivered alone. The local "account" module tracks
/// the account status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAccount {
    pub pair: PairKey,
    pub display_name: String,
}

impl OpenAccount {
    pub const TYPE_TAG: &'static str = "account.open";
    pub const MODULE: &'static str = "account";

    pub fn new(pair: PairKey, display_name: impl Into<String>) -> Self {
        Self {
            pair,
            display_name: display_name.into(),
        }
    }

    fn module_id() -> ModuleId {
        ModuleId::new(Self::MODULE)
    }

    fn set_status(&self, txn: &mut StateTxn<'_>, status: &str) -> SyncResult<()> {
        let module = Self::module_id();
        let mut map = load_attributes(txn, &self.pair, &module)?;
        map.insert("status".to_string(), status.to_string());
        map.insert("display_name".to_string(), self.display_name.clone());
        store_attributes(txn, &self.pair, &module, &map)
    }
}

impl Action for OpenAccount {
    fn type_tag(&self) -> &'static str {
        Self::TYPE_TAG
    }

    fn pair(&self) -> &PairKey {
        &self.pair
    }

    fn is_similar(&self, _other: &dyn Action) -> bool {
        false
    }

    fn interferes_with(&self, other: &dyn Action) -> bool {
        other.type_tag() == Self::TYPE_TAG && other.pair() == &self.pair
    }

    fn execute_locally(&mut self, txn: &mut StateTxn<'_>) -> SyncResult<()> {
        let module = Self::module_id();
        if let Some(status) = load_attributes(txn, &self.pair, &module)?.get("status") {
            return Err(SyncError::Action(format!(
                "account for {} is already {}",
                self.pair, status
            )));
        }
        self.set_status(txn, "opening")
    }

    fn execute_on_success(
        &mut self,
        txn: &mut StateTxn<'_>,
        _reply: Option<&Reply>,
    ) -> SyncResult<()> {
        self.set_status(txn, "open")
    }

    fn reverse_locally(&mut self, txn: &mut StateTxn<'_>) -> SyncResult<()> {
        txn.remove_module(&self.pair, &Self::module_id())?;
        Ok(())
    }

    fn payload(&self) -> SyncResult<Vec<u8>> {
        encode_payload(self)
    }

    fn method_kind(&self) -> MethodKind {
        MethodKind::AccountOpen
    }

    fn accepts_null_reply(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Local record that the client commitment for a host was rotated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentRotated {
    pub pair: PairKey,
    pub commitment: Commitment,
}

impl CommitmentRotated {
    pub const TYPE_TAG: &'static str = "credentials.rotated";
    pub const SERVICE: &'static str = "credentials";
    pub const MODULE: &'static str = "commitments";

    pub fn new(commitment: &Commitment) -> Self {
        Self {
            pair: PairKey::new(commitment.host.as_identity(), Self::SERVICE),
            commitment: commitment.clone(),
        }
    }
}

impl Action for CommitmentRotated {
    fn type_tag(&self) -> &'static str {
        Self::TYPE_TAG
    }

    fn pair(&self) -> &PairKey {
        &self.pair
    }

    fn is_similar(&self, _other: &dyn Action) -> bool {
        false
    }

    fn interferes_with(&self, _other: &dyn Action) -> bool {
        false
    }

    fn execute_locally(&mut self, txn: &mut StateTxn<'_>) -> SyncResult<()> {
        let bytes = encode_payload(&self.commitment)?;
        txn.put_module(&self.pair, &ModuleId::new(Self::MODULE), &bytes)
    }

    fn reverse_locally(&mut self, txn: &mut StateTxn<'_>) -> SyncResult<()> {
        txn.remove_module(&self.pair, &ModuleId::new(Self::MODULE))?;
        Ok(())
    }

    fn payload(&self) -> SyncResult<Vec<u8>> {
        encode_payload(self)
    }

    fn is_local_only(&self) -> bool {
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
