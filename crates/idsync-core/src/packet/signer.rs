//! Element signers, one per principal variant.

use std::sync::Arc;

use serde::Serialize;

use super::layers::{CompressionLayer, Principal, SignatureLayer};
use crate::error::SyncError;
use crate::identity::{HostKeypair, HostPublicKeys, SecretCommitment};
use crate::types::{HostId, Subject, Timestamp};

/// Produces the principal and signature of every element it builds.
pub trait ElementSigner: Send + Sync {
    fn principal(&self) -> Principal;

    fn sign(&self, message: &[u8]) -> Vec<u8>;

    /// Build a signed element around `compression`.
    fn sign_element<A: Serialize>(
        &self,
        subject: Option<Subject>,
        time: Timestamp,
        audit: Option<A>,
        compression: Option<CompressionLayer>,
    ) -> Result<SignatureLayer<A>, SyncError>
    where
        Self: Sized,
    {
        sign_with(self, subject, time, audit, compression)
    }
}

pub(crate) fn sign_with<A: Serialize>(
    signer: &dyn ElementSigner,
    subject: Option<Subject>,
    time: Timestamp,
    audit: Option<A>,
    compression: Option<CompressionLayer>,
) -> Result<SignatureLayer<A>, SyncError> {
    let mut layer = SignatureLayer {
        subject,
        time,
        principal: signer.principal(),
        audit,
        compression,
        signature: Vec::new(),
    };
    let message = layer.signed_bytes()?;
    layer.signature = signer.sign(&message);
    Ok(layer)
}

/// No authentication at all.
pub struct Unsigned;

impl ElementSigner for Unsigned {
    fn principal(&self) -> Principal {
        Principal::Unsigned
    }

    fn sign(&self, _message: &[u8]) -> Vec<u8> {
        Vec::new()
    }
}

/// Signs as an authoritative host.
pub struct HostSigner {
    host: HostId,
    keys: Arc<HostKeypair>,
}

impl HostSigner {
    pub fn new(host: HostId, keys: Arc<HostKeypair>) -> Self {
        Self { host, keys }
    }
}

impl ElementSigner for HostSigner {
    fn principal(&self) -> Principal {
        Principal::Host(self.host.clone())
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.keys.sign(message)
    }
}

/// Signs as a client holding a commitment secret.
pub struct CommitmentSigner {
    secret: SecretCommitment,
}

impl CommitmentSigner {
    pub fn new(secret: SecretCommitment) -> Self {
        Self { secret }
    }
}

impl ElementSigner for CommitmentSigner {
    fn principal(&self) -> Principal {
        Principal::Client(self.secret.commitment().clone())
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.secret.sign(message)
    }
}

/// Check the signature of `layer` against its own principal.
///
/// Host principals need `host_keys`; without them the element fails.
pub(crate) fn verify_element<A: Serialize>(
    layer: &SignatureLayer<A>,
    host_keys: Option<&HostPublicKeys>,
) -> Result<bool, SyncError> {
    let message = layer.signed_bytes()?;
    let valid = match &layer.principal {
        Principal::Unsigned => layer.signature.is_empty(),
        Principal::Host(_) => host_keys.is_some_and(|keys| keys.verify(&message, &layer.signature)),
        Principal::Client(commitment) => commitment.verify(&message, &layer.signature),
    };
    Ok(valid)
}
