//! Encryption layer using ChaCha20-Poly1305 AEAD
//!
//! Provides the symmetric cipher used for the encryption layer of every
//! packet, and [`SealedKey`] for handing a fresh symmetric key to a host.
//!
//! ## Key transport
//!
//! ```text
//! 1. ephemeral X25519 keypair (e_sk, e_pk)
//! 2. shared = x25519(e_sk, host_pk)
//! 3. wrap_key = HKDF-SHA256(shared, "idsync-key-transport-v1")
//! 4. encrypted_key = ChaCha20Poly1305(wrap_key, symmetric_key)
//! ```

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

use crate::error::SyncError;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Domain separation string for HKDF
const HKDF_INFO: &[u8] = b"idsync-key-transport-v1";

/// A 32-byte symmetric packet key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SymmetricKey(pub [u8; 32]);

impl SymmetricKey {
    /// Generate a new random key from the system CSPRNG.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only a short fingerprint, never the key itself
        let fingerprint = blake3::hash(&self.0);
        write!(f, "SymmetricKey({})", bs58::encode(&fingerprint.as_bytes()[..6]).into_string())
    }
}

/// ChaCha20-Poly1305 cipher bound to one [`SymmetricKey`].
pub struct PacketCipher {
    cipher: ChaCha20Poly1305,
}

impl PacketCipher {
    pub fn new(key: &SymmetricKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new((&key.0).into()),
        }
    }

    /// Generate a random 12-byte nonce.
    pub fn generate_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt with an explicit nonce, authenticating `aad` alongside.
    ///
    /// The nonce is not prepended; the caller carries it separately.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
    ) -> Result<Vec<u8>, SyncError> {
        self.cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| SyncError::Crypto(format!("Encryption failed: {}", e)))
    }

    /// Decrypt with an explicit nonce and the same associated data.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
    ) -> Result<Vec<u8>, SyncError> {
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|e| SyncError::Crypto(format!("Decryption failed: {}", e)))
    }
}

/// A symmetric key sealed to one host's X25519 public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    /// Ephemeral X25519 public key used for the exchange
    pub ephemeral_pk: [u8; 32],
    /// Nonce for the key wrap
    pub nonce: [u8; NONCE_SIZE],
    /// Wrapped symmetric key (32 bytes + 16 byte tag)
    pub encrypted_key: Vec<u8>,
}

impl SealedKey {
    /// Seal `key` so only the holder of the matching X25519 secret can open it.
    pub fn seal(key: &SymmetricKey, host_public: &[u8; 32]) -> Result<Self, SyncError> {
        let mut ephemeral_seed = [0u8; 32];
        getrandom::getrandom(&mut ephemeral_seed)
            .map_err(|e| SyncError::Crypto(format!("Failed to generate ephemeral key: {}", e)))?;
        let ephemeral_secret = X25519StaticSecret::from(ephemeral_seed);
        let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

        let shared = ephemeral_secret.diffie_hellman(&X25519PublicKey::from(*host_public));
        let wrap_key = derive_key(shared.as_bytes())?;

        let nonce = PacketCipher::generate_nonce();
        let encrypted_key = PacketCipher::new(&wrap_key).encrypt(key.as_bytes(), &nonce, &[])?;

        Ok(Self {
            ephemeral_pk: *ephemeral_public.as_bytes(),
            nonce,
            encrypted_key,
        })
    }

    /// Recover the symmetric key with the host's X25519 secret.
    pub fn unseal(&self, host_secret: &X25519StaticSecret) -> Result<SymmetricKey, SyncError> {
        let shared = host_secret.diffie_hellman(&X25519PublicKey::from(self.ephemeral_pk));
        let wrap_key = derive_key(shared.as_bytes())?;

        let key = PacketCipher::new(&wrap_key).decrypt(&self.encrypted_key, &self.nonce, &[])?;
        let key: [u8; 32] = key
            .as_slice()
            .try_into()
            .map_err(|_| SyncError::Crypto("Unsealed key has wrong length".to_string()))?;
        Ok(SymmetricKey(key))
    }
}

/// Derive a 32-byte wrap key from a shared secret using HKDF-SHA256.
fn derive_key(shared_secret: &[u8]) -> Result<SymmetricKey, SyncError> {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut output = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut output)
        .map_err(|e| SyncError::Crypto(format!("Key derivation failed: {}", e)))?;
    Ok(SymmetricKey(output))
}
