//! Client commitments.
//!
//! A [`Commitment`] binds a client key to one host at one point in time.
//! The host only ever sees the public part. [`SecretCommitment`] adds the
//! signing secret so the holder can prove possession; it is deliberately
//! not serializable.

use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};

use super::keys::verify_ed25519;
use crate::error::SyncError;
use crate::types::{HostId, Timestamp};

const COMMITMENT_CONTEXT: &str = "idsync 2024 client commitment v1";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commitment {
    pub host: HostId,
    pub time: Timestamp,
    /// Group element binding host, time and key
    pub value: [u8; 32],
    /// Ed25519 verifying key of the holder
    pub public_key: [u8; 32],
}

impl Commitment {
    fn compute_value(host: &HostId, time: Timestamp, public_key: &[u8; 32]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_derive_key(COMMITMENT_CONTEXT);
        hasher.update(&(host.as_str().len() as u32).to_le_bytes());
        hasher.update(host.as_str().as_bytes());
        hasher.update(&time.to_le_bytes());
        hasher.update(public_key);
        *hasher.finalize().as_bytes()
    }

    /// Whether `value` really binds the stated host, time and key.
    pub fn is_well_formed(&self) -> bool {
        self.value == Self::compute_value(&self.host, self.time, &self.public_key)
    }

    /// Verify a signature produced by the holder of this commitment.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        self.is_well_formed() && verify_ed25519(&self.public_key, message, signature)
    }
}

/// A commitment together with the secret that produced it.
#[derive(Clone)]
pub struct SecretCommitment {
    commitment: Commitment,
    secret: SigningKey,
}

impl SecretCommitment {
    /// Create a commitment to `host` with a fresh secret.
    pub fn generate(host: HostId, time: Timestamp) -> Result<Self, SyncError> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| SyncError::Identity(format!("Failed to get random bytes: {}", e)))?;
        Ok(Self::from_secret(&seed, host, time))
    }

    /// Commit an existing 32-byte secret to `host`.
    pub fn from_secret(secret: &[u8; 32], host: HostId, time: Timestamp) -> Self {
        let secret = SigningKey::from_bytes(secret);
        let public_key = secret.verifying_key().to_bytes();
        let value = Commitment::compute_value(&host, time, &public_key);
        Self {
            commitment: Commitment {
                host,
                time,
                value,
                public_key,
            },
            secret,
        }
    }

    /// Same secret, committed to another host.
    pub fn rebind(&self, host: HostId, time: Timestamp) -> Self {
        Self::from_secret(self.secret.as_bytes(), host, time)
    }

    /// A fresh secret for the same host.
    pub fn rotate(&self, time: Timestamp) -> Result<Self, SyncError> {
        Self::generate(self.commitment.host.clone(), time)
    }

    pub fn commitment(&self) -> &Commitment {
        &self.commitment
    }

    pub fn host(&self) -> &HostId {
        &self.commitment.host
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.secret.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for SecretCommitment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCommitment")
            .field("commitment", &self.commitment)
            .finish_non_exhaustive()
    }
}
