//! Host side of the envelope protocol.
//!
//! [`HostEndpoint`] turns request frames into response frames: it opens and
//! validates the request, enforces commitment age, hands each method to a
//! [`MethodHandler`] and seals a host-signed response with the client's key.
//! What the host actually stores is up to the handler.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::{PacketError, PacketErrorKind, Side, SyncError, SyncResult};
use crate::identity::HostKeypair;
use crate::packet::{
    Codec, DeclaredError, HostSigner, Method, MethodKind, OpenedRequest, Principal, Redirect,
    Reply, Response, ResponseAudit, ResponseItem,
};
use crate::transport::FrameHandler;
use crate::types::{HostId, Identity, Service, Subject, Timestamp};

/// How the host knows an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityStatus {
    Local,
    /// Never heard of it
    Unmapped,
    /// Mapped here but no account opened yet
    Uninitialized,
    /// Now lives under another identifier
    Relocated(Identity),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    Local,
    Moved(HostId),
    Unsupported,
}

pub trait EntityResolver: Send + Sync {
    fn entity(&self, identity: &Identity) -> EntityStatus;
    fn service(&self, identity: &Identity, service: &Service) -> ServiceStatus;
}

/// Resolver backed by explicit maps. Unknown entities are unmapped and
/// unknown services are unsupported.
#[derive(Default)]
pub struct StaticResolver {
    entities: RwLock<HashMap<Identity, EntityStatus>>,
    services: RwLock<HashMap<(Identity, Service), ServiceStatus>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_entity(&self, identity: Identity, status: EntityStatus) {
        self.entities.write().insert(identity, status);
    }

    pub fn set_service(&self, identity: Identity, service: Service, status: ServiceStatus) {
        self.services.write().insert((identity, service), status);
    }

    /// Serve `services` for a local entity.
    pub fn serve(&self, identity: &Identity, services: &[&str]) {
        self.set_entity(identity.clone(), EntityStatus::Local);
        for service in services {
            self.set_service(identity.clone(), Service::new(*service), ServiceStatus::Local);
        }
    }
}

impl EntityResolver for StaticResolver {
    fn entity(&self, identity: &Identity) -> EntityStatus {
        self.entities
            .read()
            .get(identity)
            .cloned()
            .unwrap_or(EntityStatus::Unmapped)
    }

    fn service(&self, identity: &Identity, service: &Service) -> ServiceStatus {
        self.services
            .read()
            .get(&(identity.clone(), service.clone()))
            .cloned()
            .unwrap_or(ServiceStatus::Unsupported)
    }
}

/// Authoritative handling of validated methods.
pub trait MethodHandler: Send + Sync {
    /// Execute one method. `Ok(None)` answers with a null element.
    fn handle(
        &self,
        subject: &Subject,
        principal: &Principal,
        method: &Method,
    ) -> Result<Option<Reply>, DeclaredError>;

    /// Actions on `(identity, service)` after `since`, leaving out the
    /// ones carried by `own`, the request being answered.
    fn audit(
        &self,
        identity: &Identity,
        service: &Service,
        since: Timestamp,
        own: &[Method],
    ) -> ResponseAudit;
}

pub struct HostEndpoint {
    host: HostId,
    keys: Arc<HostKeypair>,
    signer: HostSigner,
    codec: Codec,
    resolver: Arc<dyn EntityResolver>,
    handler: Arc<dyn MethodHandler>,
    commitment_max_age_ms: i64,
}

impl HostEndpoint {
    pub fn new(
        host: HostId,
        keys: Arc<HostKeypair>,
        codec: Codec,
        config: &SyncConfig,
        resolver: Arc<dyn EntityResolver>,
        handler: Arc<dyn MethodHandler>,
    ) -> Self {
        Self {
            signer: HostSigner::new(host.clone(), keys.clone()),
            host,
            keys,
            codec,
            resolver,
            handler,
            commitment_max_age_ms: config.commitment_max_age_ms,
        }
    }

    pub fn host(&self) -> &HostId {
        &self.host
    }

    /// Answer one encoded request.
    ///
    /// Validation failures are answered with a single declared error;
    /// only local failures (storage, serialization) return `Err`.
    pub fn handle(&self, bytes: &[u8]) -> SyncResult<Vec<u8>> {
        let opened = match OpenedRequest::open(bytes, &self.codec, &self.host, &self.keys) {
            Ok(opened) => opened,
            Err(SyncError::Packet(e)) => {
                warn!(host = %self.host, error = %e, "Rejected undecryptable request");
                return self.reject(e, None, None);
            }
            Err(e) => return Err(e),
        };

        let key = opened.key().copied();
        let received = match opened.validate(self.resolver.as_ref()) {
            Ok(received) => received,
            Err(e) => {
                debug!(host = %self.host, error = %e, "Rejected request");
                return self.reject(e, key.as_ref(), None);
            }
        };
        let request = &received.request;
        let subject = request.subject();

        if let Principal::Client(commitment) = &received.principal {
            let age = self.codec.now().saturating_sub(commitment.time);
            if age > self.commitment_max_age_ms {
                let error = PacketError::new(
                    Side::Request,
                    PacketErrorKind::KeyRotation,
                    format!("commitment is {} ms old", age),
                )
                .with_redirect(Redirect::KeyRotation);
                return self.reject(error, key.as_ref(), Some(subject));
            }
        }

        let mut items = Vec::with_capacity(request.len());
        for method in request.methods() {
            let item = if method.kind == MethodKind::AttributeQuery && subject.is_host() {
                Some(ResponseItem::Reply(self.host_keys_reply()?))
            } else {
                match self.handler.handle(subject, &received.principal, method) {
                    Ok(Some(reply)) => Some(ResponseItem::Reply(reply)),
                    Ok(None) => None,
                    Err(e) => Some(ResponseItem::Error(e)),
                }
            };
            items.push(item);
        }

        let audit = request.audit().map(|audit| match subject {
            Subject::Entity(identity) => self.handler.audit(
                identity,
                &request.methods()[0].service,
                audit.since,
                request.methods(),
            ),
            Subject::Host(_) => ResponseAudit::empty(self.codec.now()),
        });

        debug!(
            host = %self.host,
            %subject,
            methods = request.len(),
            audit = audit.is_some(),
            "Answered request"
        );
        Response::encode(
            &items,
            audit,
            Some(subject),
            &self.signer,
            key.as_ref(),
            &self.codec,
        )
    }

    fn host_keys_reply(&self) -> SyncResult<Reply> {
        let payload = postcard::to_allocvec(&self.keys.public_keys())
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        Ok(Reply::new(MethodKind::AttributeQuery, payload))
    }

    fn reject(
        &self,
        error: PacketError,
        key: Option<&crate::crypto::SymmetricKey>,
        subject: Option<&Subject>,
    ) -> SyncResult<Vec<u8>> {
        let item = ResponseItem::Error(DeclaredError::from(error));
        Response::encode(&[Some(item)], None, subject, &self.signer, key, &self.codec)
    }
}

impl FrameHandler for HostEndpoint {
    fn handle_frame(&self, request: &[u8]) -> SyncResult<Vec<u8>> {
        self.handle(request)
    }
}
