//! Attribute cache
//!
//! Host public keys and service locations are looked up through the
//! [`AttributeCache`] trait. Resolution of the identity graph itself lives
//! elsewhere; [`TtlAttributeCache`] is a plain time-to-live map that callers
//! fill with values they obtained and verified.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::identity::HostPublicKeys;
use crate::types::{HostId, Identity, PairKey, Service, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    /// Signing and key-exchange keys of a host
    HostKeys,
    /// The host serving one service of an identity
    ServiceHost(Service),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    HostKeys(HostPublicKeys),
    Host(HostId),
}

pub trait AttributeCache: Send + Sync {
    /// Fetch an attribute of `identity`, as seen by `role`, that is no
    /// older than `min_fresh`.
    fn get(
        &self,
        identity: &Identity,
        role: Option<&Identity>,
        min_fresh: Timestamp,
        kind: &AttributeKind,
    ) -> SyncResult<AttributeValue>;

    /// Record a value learned out of band (e.g. from a redirect).
    fn put(
        &self,
        identity: &Identity,
        role: Option<&Identity>,
        kind: AttributeKind,
        value: AttributeValue,
    );

    fn host_keys(&self, host: &HostId) -> SyncResult<HostPublicKeys> {
        match self.get(&host.as_identity(), None, 0, &AttributeKind::HostKeys)? {
            AttributeValue::HostKeys(keys) => Ok(keys),
            other => Err(SyncError::Attribute(format!(
                "expected host keys for {}, found {:?}",
                host, other
            ))),
        }
    }

    fn service_host(&self, pair: &PairKey) -> SyncResult<HostId> {
        let kind = AttributeKind::ServiceHost(pair.service.clone());
        match self.get(&pair.identity, None, 0, &kind)? {
            AttributeValue::Host(host) => Ok(host),
            other => Err(SyncError::Attribute(format!(
                "expected host for {}, found {:?}",
                pair, other
            ))),
        }
    }
}

type CacheKey = (Identity, Option<Identity>, AttributeKind);

struct CacheEntry {
    value: AttributeValue,
    stored_at: Timestamp,
}

/// In-memory attribute cache with a fixed time-to-live.
pub struct TtlAttributeCache {
    ttl_ms: i64,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl TtlAttributeCache {
    pub fn new(ttl_ms: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl_ms,
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert_host_keys(&self, host: &HostId, keys: HostPublicKeys) {
        self.put(
            &host.as_identity(),
            None,
            AttributeKind::HostKeys,
            AttributeValue::HostKeys(keys),
        );
    }

    pub fn insert_service_host(&self, pair: &PairKey, host: HostId) {
        self.put(
            &pair.identity,
            None,
            AttributeKind::ServiceHost(pair.service.clone()),
            AttributeValue::Host(host),
        );
    }

    pub fn invalidate(&self, identity: &Identity, role: Option<&Identity>, kind: &AttributeKind) {
        self.entries
            .write()
            .remove(&(identity.clone(), role.cloned(), kind.clone()));
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| now - entry.stored_at <= self.ttl_ms);
        before - entries.len()
    }
}

impl AttributeCache for TtlAttributeCache {
    fn get(
        &self,
        identity: &Identity,
        role: Option<&Identity>,
        min_fresh: Timestamp,
        kind: &AttributeKind,
    ) -> SyncResult<AttributeValue> {
        let now = self.clock.now();
        let entries = self.entries.read();
        let key = (identity.clone(), role.cloned(), kind.clone());
        match entries.get(&key) {
            Some(entry) if entry.stored_at >= min_fresh && now - entry.stored_at <= self.ttl_ms => {
                Ok(entry.value.clone())
            }
            Some(_) => Err(SyncError::Attribute(format!(
                "{:?} of {} is stale",
                kind, identity
            ))),
            None => Err(SyncError::Attribute(format!(
                "{:?} of {} is not known",
                kind, identity
            ))),
        }
    }

    fn put(
        &self,
        identity: &Identity,
        role: Option<&Identity>,
        kind: AttributeKind,
        value: AttributeValue,
    ) {
        debug!(%identity, ?kind, "Caching attribute");
        let stored_at = self.clock.now();
        self.entries.write().insert(
            (identity.clone(), role.cloned(), kind),
            CacheEntry { value, stored_at },
        );
    }
}
