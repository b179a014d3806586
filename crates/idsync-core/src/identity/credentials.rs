//! Per-host client credentials.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use super::commitment::SecretCommitment;
use crate::clock::Clock;
use crate::error::SyncResult;
use crate::types::HostId;

/// The commitment the client presents to each host.
///
/// Commitments are created on first use and replaced when a host asks for
/// rotation.
pub struct Credentials {
    clock: Arc<dyn Clock>,
    commitments: Mutex<HashMap<HostId, SecretCommitment>>,
}

impl Credentials {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            commitments: Mutex::new(HashMap::new()),
        }
    }

    /// Install a commitment, replacing any previous one for its host.
    pub fn insert(&self, secret: SecretCommitment) {
        self.commitments.lock().insert(secret.host().clone(), secret);
    }

    pub fn for_host(&self, host: &HostId) -> SyncResult<SecretCommitment> {
        let mut commitments = self.commitments.lock();
        if let Some(secret) = commitments.get(host) {
            return Ok(secret.clone());
        }
        let secret = SecretCommitment::generate(host.clone(), self.clock.now())?;
        commitments.insert(host.clone(), secret.clone());
        Ok(secret)
    }

    /// Replace the commitment for `host` with a freshly generated one.
    pub fn rotate(&self, host: &HostId) -> SyncResult<SecretCommitment> {
        let secret = SecretCommitment::generate(host.clone(), self.clock.now())?;
        self.commitments.lock().insert(host.clone(), secret.clone());
        info!(%host, time = secret.commitment().time, "Rotated client commitment");
        Ok(secret)
    }
}
