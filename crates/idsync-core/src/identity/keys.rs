//! Host keypair: Ed25519 for signing responses, X25519 for receiving keys.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::error::SyncError;

/// A host's long-term secret keys.
pub struct HostKeypair {
    signing: SigningKey,
    exchange: X25519StaticSecret,
}

impl HostKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Result<Self, SyncError> {
        let mut seed = [0u8; 64];
        getrandom::getrandom(&mut seed)
            .map_err(|e| SyncError::Identity(format!("Failed to get random bytes: {}", e)))?;
        let mut signing_seed = [0u8; 32];
        let mut exchange_seed = [0u8; 32];
        signing_seed.copy_from_slice(&seed[..32]);
        exchange_seed.copy_from_slice(&seed[32..]);
        Ok(Self::from_seeds(signing_seed, exchange_seed))
    }

    fn from_seeds(signing_seed: [u8; 32], exchange_seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&signing_seed),
            exchange: X25519StaticSecret::from(exchange_seed),
        }
    }

    pub fn public_keys(&self) -> HostPublicKeys {
        HostPublicKeys {
            signing: self.signing.verifying_key().to_bytes(),
            exchange: *X25519PublicKey::from(&self.exchange).as_bytes(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    pub(crate) fn exchange_secret(&self) -> &X25519StaticSecret {
        &self.exchange
    }

    /// Serialize the secret keys.
    ///
    /// Format: [ed25519_seed: 32 bytes][x25519_secret: 32 bytes]
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(self.signing.as_bytes());
        bytes[32..].copy_from_slice(&self.exchange.to_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        if bytes.len() != 64 {
            return Err(SyncError::Identity(format!(
                "Host keypair must be 64 bytes, got {}",
                bytes.len()
            )));
        }
        let mut signing_seed = [0u8; 32];
        let mut exchange_seed = [0u8; 32];
        signing_seed.copy_from_slice(&bytes[..32]);
        exchange_seed.copy_from_slice(&bytes[32..]);
        Ok(Self::from_seeds(signing_seed, exchange_seed))
    }
}

impl std::fmt::Debug for HostKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostKeypair")
            .field("public", &self.public_keys())
            .finish_non_exhaustive()
    }
}

/// A host's published keys, distributed through the attribute cache.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPublicKeys {
    /// Ed25519 verifying key
    pub signing: [u8; 32],
    /// X25519 public key symmetric keys are sealed to
    pub exchange: [u8; 32],
}

impl HostPublicKeys {
    /// Verify an Ed25519 signature made by this host.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        verify_ed25519(&self.signing, message, signature)
    }
}

impl std::fmt::Debug for HostPublicKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPublicKeys")
            .field("signing", &hex::encode(self.signing))
            .field("exchange", &hex::encode(self.exchange))
            .finish()
    }
}

pub(crate) fn verify_ed25519(public: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}
