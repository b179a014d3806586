//! The shared seal/open pipeline.
//!
//! Requests and responses run through the same layers; what differs is the
//! content type, the audit type and the error side. [`Direction`] carries
//! those at the type level so request and response decoding cannot be mixed
//! up at runtime.

use std::fmt::Debug;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::audit::{RequestAudit, ResponseAudit};
use super::block::{Method, ResponseItem};
use super::layers::{
    CompressionLayer, EncryptionHeader, EncryptionLayer, PacketKind, PacketWrapper, Principal,
    SignatureLayer, PACKET_VERSION,
};
use super::replay::ReplayGuard;
use super::signer::{sign_with, ElementSigner};
use crate::config::SyncConfig;
use crate::crypto::{PacketCipher, SealedKey, SymmetricKey};
use crate::error::{PacketError, PacketErrorKind, Side, SyncError, SyncResult};
use crate::identity::HostKeypair;
use crate::types::{HostId, Subject, Timestamp};

pub trait Direction {
    const SIDE: Side;
    const KIND: PacketKind;
    type Item: Serialize + DeserializeOwned + Clone + Debug;
    type Audit: Serialize + DeserializeOwned + Clone + Debug;

    fn error(kind: PacketErrorKind, message: impl Into<String>) -> PacketError {
        PacketError::new(Self::SIDE, kind, message)
    }
}

/// Client to host: methods, optionally asking for an audit.
#[derive(Debug, Clone, Copy)]
pub enum RequestSide {}

/// Host to client: replies or declared errors, optionally with an audit.
#[derive(Debug, Clone, Copy)]
pub enum ResponseSide {}

impl Direction for RequestSide {
    const SIDE: Side = Side::Request;
    const KIND: PacketKind = PacketKind::Request;
    type Item = Method;
    type Audit = RequestAudit;
}

impl Direction for ResponseSide {
    const SIDE: Side = Side::Response;
    const KIND: PacketKind = PacketKind::Response;
    type Item = ResponseItem;
    type Audit = ResponseAudit;
}

/// How the element list is protected.
pub enum Sealing<'a> {
    /// Plaintext; only valid for the host-key bootstrap exchange
    Plain,
    Keyed {
        key: &'a SymmetricKey,
        /// Sealed copy of `key` for the recipient; requests only
        sealed: Option<&'a SealedKey>,
    },
}

/// Where the decryption key comes from.
pub enum KeySource<'a> {
    /// Unseal the key carried in the header (host receiving a request)
    Host(&'a HostKeypair),
    /// The key the matching request was sent with, if any
    Known(Option<&'a SymmetricKey>),
}

/// An envelope after steps 1 and 2: unwrapped, decrypted, replay-checked.
pub struct Opened<D: Direction> {
    pub header: EncryptionHeader,
    pub key: Option<SymmetricKey>,
    pub elements: Vec<Option<SignatureLayer<D::Audit>>>,
}

/// A fully decoded element.
#[derive(Debug, Clone)]
pub struct Element<D: Direction> {
    pub subject: Option<Subject>,
    pub time: Timestamp,
    pub principal: Principal,
    pub item: D::Item,
}

#[derive(Clone)]
pub struct Codec {
    replay: Arc<ReplayGuard>,
    compression_threshold: usize,
    max_content: usize,
}

impl Codec {
    pub fn new(replay: Arc<ReplayGuard>, config: &SyncConfig) -> Self {
        Self {
            replay,
            compression_threshold: config.compression_threshold,
            max_content: config.max_frame_bytes,
        }
    }

    pub fn replay(&self) -> &Arc<ReplayGuard> {
        &self.replay
    }

    pub fn now(&self) -> Timestamp {
        self.replay.now()
    }

    /// Encode `items` into a complete envelope.
    ///
    /// `audit` is attached to the first element only. A null first
    /// position then becomes a signed element without content, so the
    /// audit survives a response made only of null replies.
    pub fn seal<D: Direction>(
        &self,
        items: &[Option<D::Item>],
        audit: Option<D::Audit>,
        recipient: Option<&HostId>,
        subject: Option<&Subject>,
        signer: &dyn ElementSigner,
        sealing: Sealing<'_>,
    ) -> SyncResult<Vec<u8>> {
        let time = self.now();
        let mut audit = audit;

        let mut elements: Vec<Option<SignatureLayer<D::Audit>>> = Vec::with_capacity(items.len());
        for item in items {
            let compression = match item {
                Some(item) => {
                    let content = postcard::to_allocvec(item)
                        .map_err(|e| SyncError::Serialization(e.to_string()))?;
                    Some(CompressionLayer::compress(&content, self.compression_threshold)?)
                }
                None if audit.is_some() => None,
                None => {
                    elements.push(None);
                    continue;
                }
            };
            elements.push(Some(sign_with(
                signer,
                subject.cloned(),
                time,
                audit.take(),
                compression,
            )?));
        }

        let list =
            postcard::to_allocvec(&elements).map_err(|e| SyncError::Serialization(e.to_string()))?;

        let encryption = match sealing {
            Sealing::Plain => EncryptionLayer {
                header: EncryptionHeader {
                    recipient: recipient.cloned(),
                    time,
                    nonce: None,
                    sealed_key: None,
                },
                body: list,
            },
            Sealing::Keyed { key, sealed } => {
                let nonce = PacketCipher::generate_nonce();
                let header = EncryptionHeader {
                    recipient: recipient.cloned(),
                    time,
                    nonce: Some(nonce),
                    sealed_key: sealed.cloned(),
                };
                let aad = header.associated_data()?;
                let body = PacketCipher::new(key).encrypt(&list, &nonce, &aad)?;
                EncryptionLayer { header, body }
            }
        };

        let wrapper = PacketWrapper {
            version: PACKET_VERSION,
            kind: D::KIND,
            encryption,
        };
        postcard::to_allocvec(&wrapper).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Unwrap, decrypt and replay-check an envelope, then split the
    /// element list without looking inside the elements.
    pub fn open<D: Direction>(&self, bytes: &[u8], keys: KeySource<'_>) -> SyncResult<Opened<D>> {
        let wrapper: PacketWrapper = postcard::from_bytes(bytes).map_err(|e| {
            D::error(PacketErrorKind::Encryption, format!("undecodable packet: {}", e))
        })?;
        if wrapper.version != PACKET_VERSION {
            return Err(D::error(
                PacketErrorKind::Encryption,
                format!("unsupported packet version {}", wrapper.version),
            )
            .into());
        }
        if wrapper.kind != D::KIND {
            return Err(D::error(
                PacketErrorKind::Encryption,
                format!("expected a {} packet, got a {}", D::KIND, wrapper.kind),
            )
            .into());
        }

        let EncryptionLayer { header, body } = wrapper.encryption;
        let (key, list) = match (header.nonce, keys) {
            (None, KeySource::Known(Some(_))) => {
                return Err(D::error(
                    PacketErrorKind::Encryption,
                    "plaintext reply to an encrypted request",
                )
                .into())
            }
            (None, _) => (None, body),
            (Some(_), KeySource::Known(None)) => {
                return Err(D::error(
                    PacketErrorKind::Encryption,
                    "encrypted reply to a plaintext request",
                )
                .into())
            }
            (Some(nonce), KeySource::Known(Some(key))) => {
                (Some(*key), Self::decrypt::<D>(key, &nonce, &header, &body)?)
            }
            (Some(nonce), KeySource::Host(keypair)) => {
                let sealed = header.sealed_key.as_ref().ok_or_else(|| {
                    D::error(PacketErrorKind::Encryption, "missing sealed key")
                })?;
                let key = sealed
                    .unseal(keypair.exchange_secret())
                    .map_err(|e| D::error(PacketErrorKind::Encryption, e.to_string()))?;
                let list = Self::decrypt::<D>(&key, &nonce, &header, &body)?;
                (Some(key), list)
            }
        };

        self.replay
            .check(D::SIDE, header.time, header.nonce.as_ref().map(|n| &n[..]))?;

        let elements: Vec<Option<SignatureLayer<D::Audit>>> = postcard::from_bytes(&list)
            .map_err(|e| {
                D::error(PacketErrorKind::Elements, format!("undecodable element list: {}", e))
            })?;

        Ok(Opened {
            header,
            key,
            elements,
        })
    }

    fn decrypt<D: Direction>(
        key: &SymmetricKey,
        nonce: &[u8; crate::crypto::NONCE_SIZE],
        header: &EncryptionHeader,
        body: &[u8],
    ) -> Result<Vec<u8>, PacketError> {
        let aad = header
            .associated_data()
            .map_err(|e| D::error(PacketErrorKind::Encryption, e.to_string()))?;
        PacketCipher::new(key)
            .decrypt(body, nonce, &aad)
            .map_err(|e| D::error(PacketErrorKind::Encryption, e.to_string()))
    }

    /// Decode every non-null element: check its signature with `verify`,
    /// check recency, take at most one audit, then decompress and decode
    /// the content. An element without content decodes as a null position.
    pub fn unpack<D: Direction>(
        &self,
        elements: Vec<Option<SignatureLayer<D::Audit>>>,
        mut verify: impl FnMut(&SignatureLayer<D::Audit>) -> Result<(), PacketError>,
    ) -> Result<(Vec<Option<Element<D>>>, Option<D::Audit>), PacketError> {
        let mut audit: Option<D::Audit> = None;
        let mut decoded = Vec::with_capacity(elements.len());

        for element in elements {
            let Some(layer) = element else {
                decoded.push(None);
                continue;
            };

            verify(&layer)?;
            if !self.replay.is_active(layer.time) {
                return Err(D::error(
                    PacketErrorKind::Signature,
                    format!("signature inactive at {}", layer.time),
                ));
            }

            let SignatureLayer {
                subject,
                time,
                principal,
                audit: element_audit,
                compression,
                ..
            } = layer;

            if let Some(found) = element_audit {
                if audit.is_some() {
                    return Err(D::error(PacketErrorKind::Audit, "more than one audit"));
                }
                audit = Some(found);
            } else if compression.is_none() {
                return Err(D::error(PacketErrorKind::Content, "element carries nothing"));
            }

            let Some(compression) = compression else {
                decoded.push(None);
                continue;
            };
            let content = compression
                .decompress(self.max_content)
                .map_err(|e| D::error(PacketErrorKind::Compression, e))?;
            let item: D::Item = postcard::from_bytes(&content).map_err(|e| {
                D::error(PacketErrorKind::Content, format!("undecodable content: {}", e))
            })?;

            decoded.push(Some(Element {
                subject,
                time,
                principal,
                item,
            }));
        }

        Ok((decoded, audit))
    }
}
