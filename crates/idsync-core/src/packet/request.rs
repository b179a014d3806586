//! Requests: a frozen batch of similar methods addressed to one host.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use super::audit::RequestAudit;
use super::block::{Method, MethodKind, Redirect};
use super::codec::{Codec, Direction, Element, KeySource, Opened, RequestSide, Sealing};
use super::layers::Principal;
use super::response::Response;
use super::signer::{verify_element, CommitmentSigner, ElementSigner, Unsigned};
use crate::attributes::CommitmentRotated;
use crate::cache::{AttributeKind, AttributeValue};
use crate::context::SyncContext;
use crate::crypto::SymmetricKey;
use crate::error::{PacketError, PacketErrorKind, SyncError, SyncResult};
use crate::host::{EntityResolver, EntityStatus, ServiceStatus};
use crate::identity::HostKeypair;
use crate::types::{HostId, Service, Subject, Timestamp};

fn fail(kind: PacketErrorKind, message: impl Into<String>) -> PacketError {
    RequestSide::error(kind, message)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    methods: Vec<Method>,
    recipient: HostId,
    subject: Subject,
    audit: Option<RequestAudit>,
    /// Number of redirect-driven resends that produced this request
    iteration: u8,
}

impl Request {
    /// Freeze a batch of methods.
    ///
    /// The batch must be non-empty and pairwise similar.
    pub fn new(
        methods: Vec<Method>,
        recipient: HostId,
        subject: Subject,
        audit: Option<RequestAudit>,
    ) -> Result<Self, PacketError> {
        let Some(first) = methods.first() else {
            return Err(fail(PacketErrorKind::Elements, "request has no methods"));
        };
        if let Some(odd) = methods.iter().find(|m| !(m.is_similar(first) && first.is_similar(m))) {
            return Err(fail(
                PacketErrorKind::Method,
                format!("{} on {} is not similar to {}", odd.kind, odd.service, first.kind),
            ));
        }
        Ok(Self {
            methods,
            recipient,
            subject,
            audit,
            iteration: 0,
        })
    }

    /// The plaintext query for a host's public keys.
    pub fn host_keys_query(host: HostId) -> Self {
        Self {
            methods: vec![Method::new(
                MethodKind::AttributeQuery,
                Service::new("host"),
                Vec::new(),
            )],
            recipient: host.clone(),
            subject: Subject::Host(host),
            audit: None,
            iteration: 0,
        }
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn recipient(&self) -> &HostId {
        &self.recipient
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn audit(&self) -> Option<&RequestAudit> {
        self.audit.as_ref()
    }

    pub fn iteration(&self) -> u8 {
        self.iteration
    }

    /// The only exchange allowed in plaintext: one attribute query about
    /// the host itself.
    pub fn is_bootstrap(&self) -> bool {
        self.methods.len() == 1
            && self.methods[0].kind == MethodKind::AttributeQuery
            && self.subject.is_host()
    }

    pub fn encode(
        &self,
        codec: &Codec,
        signer: &dyn ElementSigner,
        sealing: Sealing<'_>,
    ) -> SyncResult<Vec<u8>> {
        let items: Vec<Option<Method>> = self.methods.iter().cloned().map(Some).collect();
        codec.seal::<RequestSide>(
            &items,
            self.audit,
            Some(&self.recipient),
            Some(&self.subject),
            signer,
            sealing,
        )
    }

    /// Deliver the request and decode the response.
    ///
    /// Host redirects are followed by resending a corrected request, up to
    /// the configured resend limit.
    pub fn send(&self, ctx: &SyncContext, verify: bool) -> SyncResult<Response> {
        let limit = ctx.config.resend_limit;
        let mut request = self.clone();

        loop {
            let response = request.exchange(ctx, verify)?;
            let Some(redirect) = response.redirect().cloned() else {
                return Ok(response);
            };

            if request.iteration >= limit {
                warn!(recipient = %request.recipient, limit, "Resend limit reached");
                return Err(SyncError::ResendLimit {
                    recipient: request.recipient.to_string(),
                    limit,
                });
            }

            info!(
                recipient = %request.recipient,
                ?redirect,
                iteration = request.iteration + 1,
                "Resending after redirect"
            );
            request = request.redirected(&redirect, ctx)?;
        }
    }

    fn exchange(&self, ctx: &SyncContext, verify: bool) -> SyncResult<Response> {
        let (bytes, key) = if self.is_bootstrap() {
            (self.encode(&ctx.codec, &Unsigned, Sealing::Plain)?, None)
        } else {
            let host_keys = ctx.host_keys(&self.recipient)?;
            let (key, sealed) = ctx.leases.lease(&self.recipient, &host_keys)?;
            let signer = CommitmentSigner::new(ctx.credentials.for_host(&self.recipient)?);
            let bytes = self.encode(
                &ctx.codec,
                &signer,
                Sealing::Keyed {
                    key: &key,
                    sealed: Some(&sealed),
                },
            )?;
            (bytes, Some(key))
        };

        debug!(
            recipient = %self.recipient,
            subject = %self.subject,
            methods = self.methods.len(),
            bytes = bytes.len(),
            "Sending request"
        );
        let reply = ctx.transport.exchange(&self.recipient, &bytes)?;

        let host_keys = ctx.cache.host_keys(&self.recipient).ok();
        Response::decode(
            &reply,
            self,
            key.as_ref(),
            &ctx.codec,
            host_keys.as_ref(),
            verify,
        )
    }

    /// The corrected request a host redirect asks for.
    fn redirected(&self, redirect: &Redirect, ctx: &SyncContext) -> SyncResult<Request> {
        let mut next = self.clone();
        next.iteration = self.iteration.saturating_add(1);

        match redirect {
            Redirect::KeyRotation => {
                let rotated = ctx.credentials.rotate(&self.recipient)?;
                ctx.dispatch_local(Box::new(CommitmentRotated::new(rotated.commitment())));
            }
            Redirect::Subject(identity) => {
                next.subject = Subject::Entity(identity.clone());
            }
            Redirect::Host(host) => {
                if let Subject::Entity(identity) = &self.subject {
                    let services: BTreeSet<&Service> =
                        self.methods.iter().map(|m| &m.service).collect();
                    for service in services {
                        ctx.cache.put(
                            identity,
                            None,
                            AttributeKind::ServiceHost(service.clone()),
                            AttributeValue::Host(host.clone()),
                        );
                    }
                }
                next.recipient = host.clone();
            }
        }
        Ok(next)
    }
}

/// A request as the host sees it after full validation.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    /// The decoded request; its iteration is always zero
    pub request: Request,
    pub principal: Principal,
    /// Time the client sealed the envelope
    pub time: Timestamp,
    pub key: Option<SymmetricKey>,
}

/// A request after decryption but before element validation.
///
/// Splitting the two phases lets the host answer validation failures
/// encrypted with the client's key.
pub struct OpenedRequest {
    opened: Opened<RequestSide>,
    host: HostId,
    codec: Codec,
}

impl OpenedRequest {
    /// Unwrap, decrypt and replay-check a request addressed to `host`.
    pub fn open(bytes: &[u8], codec: &Codec, host: &HostId, keys: &HostKeypair) -> SyncResult<Self> {
        let opened = codec.open::<RequestSide>(bytes, KeySource::Host(keys))?;
        Ok(Self {
            opened,
            host: host.clone(),
            codec: codec.clone(),
        })
    }

    pub fn key(&self) -> Option<&SymmetricKey> {
        self.opened.key.as_ref()
    }

    /// Validate recipient, elements, signatures, subject and methods.
    pub fn validate(self, resolver: &dyn EntityResolver) -> Result<ReceivedRequest, PacketError> {
        let Opened {
            header,
            key,
            elements,
        } = self.opened;

        let recipient = header
            .recipient
            .clone()
            .ok_or_else(|| fail(PacketErrorKind::Encryption, "request carries no recipient"))?;
        if recipient != self.host {
            return Err(fail(
                PacketErrorKind::Encryption,
                format!("request is addressed to {}", recipient),
            ));
        }

        if elements.is_empty() {
            return Err(fail(PacketErrorKind::Elements, "request has no elements"));
        }
        if elements.iter().any(Option::is_none) {
            return Err(fail(PacketErrorKind::Elements, "null element in request"));
        }

        let host = &self.host;
        let (decoded, audit) = self.codec.unpack::<RequestSide>(elements, |layer| {
            if let Principal::Client(commitment) = &layer.principal {
                if &commitment.host != host {
                    return Err(fail(
                        PacketErrorKind::Signature,
                        format!("commitment is bound to {}", commitment.host),
                    ));
                }
            }
            if matches!(layer.principal, Principal::Host(_)) {
                return Err(fail(PacketErrorKind::Signature, "host principal in a request"));
            }
            match verify_element(layer, None) {
                Ok(true) => Ok(()),
                Ok(false) => Err(fail(PacketErrorKind::Signature, "invalid signature")),
                Err(e) => Err(fail(PacketErrorKind::Signature, e.to_string())),
            }
        })?;

        let elements: Vec<Element<RequestSide>> = decoded
            .into_iter()
            .collect::<Option<_>>()
            .ok_or_else(|| fail(PacketErrorKind::Elements, "element without content in request"))?;
        let first = &elements[0];
        let subject = first
            .subject
            .clone()
            .ok_or_else(|| fail(PacketErrorKind::Identifier, "element declares no subject"))?;
        for element in &elements {
            if element.subject.as_ref() != Some(&subject) {
                return Err(fail(PacketErrorKind::Identifier, "elements disagree on subject"));
            }
            if element.principal != first.principal {
                return Err(fail(PacketErrorKind::Signature, "elements are not signed alike"));
            }
        }
        let principal = first.principal.clone();
        let time = first.time;
        let methods: Vec<Method> = elements.into_iter().map(|e| e.item).collect();

        Self::check_subject(host, &subject, &methods, resolver)?;

        let request = Request {
            methods,
            recipient,
            subject,
            audit,
            iteration: 0,
        };

        if !principal.is_signed() && !request.is_bootstrap() {
            return Err(fail(
                PacketErrorKind::Method,
                format!("{} requires a signed principal", request.methods[0].kind),
            ));
        }
        if key.is_none() && !request.is_bootstrap() {
            return Err(fail(
                PacketErrorKind::Encryption,
                "only the host key query may travel unencrypted",
            ));
        }

        Ok(ReceivedRequest {
            request,
            principal,
            time,
            key,
        })
    }

    fn check_subject(
        host: &HostId,
        subject: &Subject,
        methods: &[Method],
        resolver: &dyn EntityResolver,
    ) -> Result<(), PacketError> {
        match subject {
            Subject::Host(target) => {
                if target != host {
                    return Err(fail(
                        PacketErrorKind::Identifier,
                        format!("host subject {} is not this host", target),
                    ));
                }
                if let Some(method) = methods.iter().find(|m| !m.kind.addresses_host()) {
                    return Err(fail(
                        PacketErrorKind::Method,
                        format!("{} cannot address a host", method.kind),
                    ));
                }
                Ok(())
            }
            Subject::Entity(identity) => {
                let bootstrap = methods.iter().all(|m| m.kind.bootstraps_account());
                match resolver.entity(identity) {
                    EntityStatus::Local => {}
                    EntityStatus::Relocated(moved) => {
                        return Err(fail(
                            PacketErrorKind::Relocation,
                            format!("{} moved to {}", identity, moved),
                        )
                        .with_redirect(Redirect::Subject(moved)));
                    }
                    EntityStatus::Unmapped | EntityStatus::Uninitialized if bootstrap => {
                        return Ok(());
                    }
                    EntityStatus::Unmapped => {
                        return Err(fail(
                            PacketErrorKind::Identifier,
                            format!("{} is not served here", identity),
                        ));
                    }
                    EntityStatus::Uninitialized => {
                        return Err(fail(
                            PacketErrorKind::Identifier,
                            format!("{} is not initialized", identity),
                        ));
                    }
                }

                let services: BTreeSet<&Service> = methods.iter().map(|m| &m.service).collect();
                for service in services {
                    match resolver.service(identity, service) {
                        ServiceStatus::Local => {}
                        ServiceStatus::Moved(to) => {
                            return Err(fail(
                                PacketErrorKind::Service,
                                format!("{} of {} moved to {}", service, identity, to),
                            )
                            .with_redirect(Redirect::Host(to)));
                        }
                        ServiceStatus::Unsupported => {
                            return Err(fail(
                                PacketErrorKind::Service,
                                format!("{} is not offered here", service),
                            ));
                        }
                    }
                }
                Ok(())
            }
        }
    }
}
