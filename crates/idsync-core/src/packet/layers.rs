//! Wire structures of the envelope, outermost first.

use serde::{Deserialize, Serialize};

use crate::crypto::{SealedKey, NONCE_SIZE};
use crate::error::SyncError;
use crate::identity::Commitment;
use crate::types::{HostId, Subject, Timestamp};

/// Current envelope format version
pub const PACKET_VERSION: u8 = 1;

/// zstd level for content compression (3 = fast with good compression)
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketKind {
    Request,
    Response,
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketKind::Request => f.write_str("request"),
            PacketKind::Response => f.write_str("response"),
        }
    }
}

/// Self-contained top-level wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketWrapper {
    pub version: u8,
    pub kind: PacketKind,
    pub encryption: EncryptionLayer,
}

/// Everything about the encryption that travels in clear.
///
/// Serialized and bound as associated data, so none of it can be altered
/// without failing decryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionHeader {
    /// Addressed host; requests only
    pub recipient: Option<HostId>,
    pub time: Timestamp,
    /// Present only on encrypted envelopes
    pub nonce: Option<[u8; NONCE_SIZE]>,
    /// The symmetric key sealed to the recipient; requests only
    pub sealed_key: Option<SealedKey>,
}

impl EncryptionHeader {
    pub fn associated_data(&self) -> Result<Vec<u8>, SyncError> {
        postcard::to_allocvec(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionLayer {
    pub header: EncryptionHeader,
    /// Encoded element list, encrypted when the header carries a nonce
    pub body: Vec<u8>,
}

/// Who authenticates a signed element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Principal {
    /// No authentication; the signature is empty
    Unsigned,
    /// An authoritative host
    Host(HostId),
    /// A client proving possession of a commitment
    Client(Commitment),
}

impl Principal {
    pub fn is_signed(&self) -> bool {
        !matches!(self, Principal::Unsigned)
    }
}

/// One element of the list: signature over subject, time, principal,
/// the optional audit and the compressed content.
///
/// Content is absent only on a null response position that still has to
/// carry the audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureLayer<A> {
    pub subject: Option<Subject>,
    pub time: Timestamp,
    pub principal: Principal,
    pub audit: Option<A>,
    pub compression: Option<CompressionLayer>,
    pub signature: Vec<u8>,
}

impl<A: Serialize> SignatureLayer<A> {
    /// The bytes the signature covers.
    pub fn signed_bytes(&self) -> Result<Vec<u8>, SyncError> {
        postcard::to_allocvec(&(
            &self.subject,
            self.time,
            &self.principal,
            &self.audit,
            &self.compression,
        ))
        .map_err(|e| SyncError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    None,
    Zstd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionLayer {
    pub algorithm: Compression,
    pub original_len: u32,
    pub data: Vec<u8>,
}

impl CompressionLayer {
    /// Wrap encoded content, compressing it once it reaches `threshold`.
    pub fn compress(content: &[u8], threshold: usize) -> Result<Self, SyncError> {
        let original_len = u32::try_from(content.len())
            .map_err(|_| SyncError::Serialization("Content too large".to_string()))?;

        if content.len() < threshold {
            return Ok(Self {
                algorithm: Compression::None,
                original_len,
                data: content.to_vec(),
            });
        }

        let compressed = zstd::bulk::compress(content, ZSTD_LEVEL)
            .map_err(|e| SyncError::Serialization(format!("Compression failed: {}", e)))?;

        // Not worth it for incompressible content
        if compressed.len() >= content.len() {
            return Ok(Self {
                algorithm: Compression::None,
                original_len,
                data: content.to_vec(),
            });
        }

        Ok(Self {
            algorithm: Compression::Zstd,
            original_len,
            data: compressed,
        })
    }

    /// Recover the content, refusing to inflate beyond `max_len`.
    pub fn decompress(&self, max_len: usize) -> Result<Vec<u8>, String> {
        let expected = self.original_len as usize;
        if expected > max_len {
            return Err(format!("declared size {} exceeds {}", expected, max_len));
        }

        let content = match self.algorithm {
            Compression::None => self.data.clone(),
            Compression::Zstd => zstd::bulk::decompress(&self.data, expected)
                .map_err(|e| format!("decompression failed: {}", e))?,
        };

        if content.len() != expected {
            return Err(format!(
                "content is {} bytes, declared {}",
                content.len(),
                expected
            ));
        }
        Ok(content)
    }
}
