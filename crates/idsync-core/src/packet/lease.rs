//! Symmetric key leases: one key per recipient host, reused until it
//! expires so the host does not unseal a fresh key for every request.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::clock::Clock;
use crate::crypto::{SealedKey, SymmetricKey};
use crate::error::SyncResult;
use crate::identity::HostPublicKeys;
use crate::types::{HostId, Timestamp};

struct Lease {
    issued: Timestamp,
    /// Exchange key the lease was sealed to
    exchange: [u8; 32],
    key: SymmetricKey,
    sealed: SealedKey,
}

pub struct KeyLeases {
    period_ms: i64,
    clock: Arc<dyn Clock>,
    leases: Mutex<HashMap<HostId, Lease>>,
}

impl KeyLeases {
    pub fn new(period_ms: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            period_ms,
            clock,
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// The current key for `host`, issuing a new one when the lease has
    /// expired or the host's exchange key changed.
    pub fn lease(
        &self,
        host: &HostId,
        keys: &HostPublicKeys,
    ) -> SyncResult<(SymmetricKey, SealedKey)> {
        let now = self.clock.now();
        let mut leases = self.leases.lock();

        if let Some(lease) = leases.get(host) {
            if now - lease.issued < self.period_ms && lease.exchange == keys.exchange {
                return Ok((lease.key, lease.sealed.clone()));
            }
        }

        let key = SymmetricKey::generate();
        let sealed = SealedKey::seal(&key, &keys.exchange)?;
        debug!(%host, ?key, "Issued symmetric key lease");
        leases.insert(
            host.clone(),
            Lease {
                issued: now,
                exchange: keys.exchange,
                key,
                sealed: sealed.clone(),
            },
        );
        Ok((key, sealed))
    }

    pub fn revoke(&self, host: &HostId) {
        self.leases.lock().remove(host);
    }
}
