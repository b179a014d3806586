//! Actions: client-originated mutations of the identity graph.
//!
//! An action executes against local state as soon as it is submitted, is
//! queued durably as an [`ActionRecord`], and is later delivered to the
//! host that owns its (identity, service) pair. Records outlive the process,
//! so actions are always reconstructed from bytes through an
//! [`ActionRegistry`] keyed by type tag.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::packet::{Method, MethodKind, Reply};
use crate::storage::StateTxn;
use crate::types::{ActionId, ModuleId, PairKey};

pub trait Action: Send + fmt::Debug {
    /// Stable tag the registry decodes this action by.
    fn type_tag(&self) -> &'static str;

    fn pair(&self) -> &PairKey;

    /// Module of local state this action touches, if any.
    fn module(&self) -> Option<&ModuleId> {
        None
    }

    /// Whether `other` may travel in the same batch as this action.
    ///
    /// An action that is not similar to itself is a composite: it is always
    /// sent alone and its outcome is judged by the first reply only.
    fn is_similar(&self, other: &dyn Action) -> bool;

    /// Whether this action's effect overlaps `other`'s, so that `other`
    /// cannot be reversed while this one is still applied.
    fn interferes_with(&self, other: &dyn Action) -> bool;

    /// Apply the action to local state. Must leave state untouched on `Err`.
    fn execute_locally(&mut self, txn: &mut StateTxn<'_>) -> SyncResult<()>;

    /// Called once the host acknowledged the action.
    fn execute_on_success(
        &mut self,
        _txn: &mut StateTxn<'_>,
        _reply: Option<&Reply>,
    ) -> SyncResult<()> {
        Ok(())
    }

    /// Undo [`Action::execute_locally`]. Fails without side effects when
    /// later changes make the undo unsafe.
    fn reverse_locally(&mut self, txn: &mut StateTxn<'_>) -> SyncResult<()>;

    /// Serialized form of the action, including anything captured while
    /// executing.
    fn payload(&self) -> SyncResult<Vec<u8>>;

    fn method_kind(&self) -> MethodKind {
        MethodKind::Action
    }

    fn accepts_null_reply(&self) -> bool {
        true
    }

    /// Local-only actions never enter the pending queue.
    fn is_local_only(&self) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;
}

/// Postcard-encode an action payload.
pub fn encode_payload<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    postcard::to_allocvec(value).map_err(|e| SyncError::Serialization(e.to_string()))
}

/// Durable form of a submitted action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: ActionId,
    pub type_tag: String,
    pub pair: PairKey,
    pub module: Option<ModuleId>,
    pub payload: Vec<u8>,
}

impl ActionRecord {
    /// Snapshot `action` as it stands now.
    pub fn capture(id: ActionId, action: &dyn Action) -> SyncResult<Self> {
        Ok(Self {
            id,
            type_tag: action.type_tag().to_string(),
            pair: action.pair().clone(),
            module: action.module().cloned(),
            payload: action.payload()?,
        })
    }

    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        postcard::from_bytes(bytes)
            .map_err(|e| SyncError::Serialization(format!("Invalid action record: {}", e)))
    }

    /// The method that delivers this record to the host.
    pub fn method(&self, action: &dyn Action) -> SyncResult<Method> {
        Ok(Method::new(action.method_kind(), self.pair.service.clone(), self.encode()?)
            .with_module(self.module.clone())
            .accepting_null_reply(action.accepts_null_reply()))
    }
}

type Decoder = fn(&[u8]) -> SyncResult<Box<dyn Action>>;

/// Decoder for any serde-deserializable action type.
pub fn decode_as<A>(payload: &[u8]) -> SyncResult<Box<dyn Action>>
where
    A: Action + DeserializeOwned + 'static,
{
    let action: A = postcard::from_bytes(payload)
        .map_err(|e| SyncError::Serialization(format!("Invalid action payload: {}", e)))?;
    Ok(Box::new(action))
}

/// Maps type tags to decoders.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    decoders: HashMap<String, Decoder>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that knows the built-in attribute and account actions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::attributes::register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, type_tag: &str, decoder: Decoder) {
        self.decoders.insert(type_tag.to_string(), decoder);
    }

    pub fn knows(&self, type_tag: &str) -> bool {
        self.decoders.contains_key(type_tag)
    }

    pub fn decode(&self, record: &ActionRecord) -> SyncResult<Box<dyn Action>> {
        let decoder = self.decoders.get(&record.type_tag).ok_or_else(|| {
            SyncError::Action(format!("unknown action type {}", record.type_tag))
        })?;
        let action = decoder(&record.payload)?;
        if action.pair() != &record.pair {
            return Err(SyncError::Action(format!(
                "{} record for {} decodes to {}",
                record.type_tag,
                record.pair,
                action.pair()
            )));
        }
        Ok(action)
    }

    /// Decode record bytes straight to the record and its action.
    pub fn decode_bytes(&self, bytes: &[u8]) -> SyncResult<(ActionRecord, Box<dyn Action>)> {
        let record = ActionRecord::decode(bytes)?;
        let action = self.decode(&record)?;
        Ok((record, action))
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&String> = self.decoders.keys().collect();
        tags.sort();
        f.debug_struct("ActionRegistry").field("types", &tags).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::SetAttribute;

    #[test]
    fn test_record_roundtrip_through_registry() {
        let registry = ActionRegistry::with_builtins();
        let pair = PairKey::new("alice@example.org", "profile");
        let action = SetAttribute::new(pair.clone(), "names", "display", "Alice");

        let id = ActionId::new();
        let record = ActionRecord::capture(id, &action).unwrap();
        let (decoded_record, decoded) = registry.decode_bytes(&record.encode().unwrap()).unwrap();

        assert_eq!(decoded_record.id, id);
        assert_eq!(decoded.type_tag(), SetAttribute::TYPE_TAG);
        assert_eq!(decoded.pair(), &pair);
        assert_eq!(decoded.module(), Some(&ModuleId::new("names")));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let registry = ActionRegistry::new();
        let record = ActionRecord {
            id: ActionId::new(),
            type_tag: "mystery".to_string(),
            pair: PairKey::new("alice@example.org", "profile"),
            module: None,
            payload: vec![],
        };
        let err = registry.decode(&record).unwrap_err();
        assert!(matches!(err, SyncError::Action(_)));
    }

    #[test]
    fn test_method_carries_record() {
        let pair = PairKey::new("alice@example.org", "profile");
        let action = SetAttribute::new(pair, "names", "display", "Alice");
        let record = ActionRecord::capture(ActionId::new(), &action).unwrap();
        let method = record.method(&action).unwrap();

        assert_eq!(method.kind, MethodKind::Action);
        assert_eq!(method.service.as_str(), "profile");
        assert_eq!(ActionRecord::decode(&method.payload).unwrap(), record);
    }
}
