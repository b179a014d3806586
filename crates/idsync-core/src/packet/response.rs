//! Responses: per-position replies or declared errors, decoded strictly
//! against the request they answer.

use super::audit::ResponseAudit;
use super::block::{Redirect, Reply, ResponseItem};
use super::codec::{Codec, Direction, KeySource, ResponseSide, Sealing};
use super::layers::Principal;
use super::request::Request;
use super::signer::{verify_element, ElementSigner};
use crate::crypto::SymmetricKey;
use crate::error::{PacketError, PacketErrorKind, SyncResult};
use crate::identity::HostPublicKeys;
use crate::types::Subject;

fn fail(kind: PacketErrorKind, message: impl Into<String>) -> PacketError {
    ResponseSide::error(kind, message)
}

#[derive(Debug, Clone)]
pub struct Response {
    items: Vec<Option<ResponseItem>>,
    audit: Option<ResponseAudit>,
}

impl Response {
    /// Encode a host response.
    ///
    /// `key` must be the key the request arrived with, or `None` for the
    /// plaintext bootstrap exchange.
    pub fn encode(
        items: &[Option<ResponseItem>],
        audit: Option<ResponseAudit>,
        subject: Option<&Subject>,
        signer: &dyn ElementSigner,
        key: Option<&SymmetricKey>,
        codec: &Codec,
    ) -> SyncResult<Vec<u8>> {
        let sealing = match key {
            Some(key) => Sealing::Keyed { key, sealed: None },
            None => Sealing::Plain,
        };
        codec.seal::<ResponseSide>(items, audit, None, subject, signer, sealing)
    }

    /// Decode `bytes` as the answer to `request`.
    ///
    /// With `verify` set, host signatures are checked against `host_keys`;
    /// only the bootstrap key query may go unverified for lack of keys.
    pub fn decode(
        bytes: &[u8],
        request: &Request,
        key: Option<&SymmetricKey>,
        codec: &Codec,
        host_keys: Option<&HostPublicKeys>,
        verify: bool,
    ) -> SyncResult<Self> {
        let opened = codec.open::<ResponseSide>(bytes, KeySource::Known(key))?;

        if let Some(recipient) = &opened.header.recipient {
            return Err(fail(
                PacketErrorKind::Encryption,
                format!("response names recipient {}", recipient),
            )
            .into());
        }

        let methods = request.methods();
        if opened.elements.is_empty() {
            return Err(fail(PacketErrorKind::Elements, "response has no elements").into());
        }
        if opened.elements.len() > methods.len() {
            return Err(fail(
                PacketErrorKind::Elements,
                format!(
                    "{} elements answer {} methods",
                    opened.elements.len(),
                    methods.len()
                ),
            )
            .into());
        }
        if verify && host_keys.is_none() && !request.is_bootstrap() {
            return Err(fail(
                PacketErrorKind::Signature,
                format!("no keys known for {}", request.recipient()),
            )
            .into());
        }

        let (elements, audit) = codec.unpack::<ResponseSide>(opened.elements, |layer| {
            match &layer.principal {
                Principal::Host(signer) if signer != request.recipient() => {
                    return Err(fail(
                        PacketErrorKind::Signature,
                        format!("signed by {}, expected {}", signer, request.recipient()),
                    ));
                }
                Principal::Host(_) => {}
                Principal::Client(_) => {
                    return Err(fail(PacketErrorKind::Signature, "client-signed response"));
                }
                Principal::Unsigned if verify => {
                    return Err(fail(PacketErrorKind::Signature, "unsigned response"));
                }
                Principal::Unsigned => {}
            }
            if !verify || (host_keys.is_none() && request.is_bootstrap()) {
                return Ok(());
            }
            match verify_element(layer, host_keys) {
                Ok(true) => Ok(()),
                Ok(false) => Err(fail(PacketErrorKind::Signature, "invalid signature")),
                Err(e) => Err(fail(PacketErrorKind::Signature, e.to_string())),
            }
        })?;

        let mut principal: Option<&Principal> = None;
        for element in elements.iter().flatten() {
            match principal {
                None => principal = Some(&element.principal),
                Some(p) if *p != element.principal => {
                    return Err(
                        fail(PacketErrorKind::Signature, "elements are not signed alike").into(),
                    );
                }
                Some(_) => {}
            }
            if let Some(subject) = &element.subject {
                if subject != request.subject() {
                    return Err(fail(
                        PacketErrorKind::Identifier,
                        format!("answers {}, asked about {}", subject, request.subject()),
                    )
                    .into());
                }
            }
        }

        let mut items = Vec::with_capacity(elements.len());
        for (position, element) in elements.into_iter().enumerate() {
            let method = &methods[position];
            match element {
                Some(element) => {
                    if let ResponseItem::Reply(reply) = &element.item {
                        if !method.matches_reply(reply) {
                            return Err(fail(
                                PacketErrorKind::Content,
                                format!(
                                    "{} reply at position {} answers a {}",
                                    reply.kind, position, method.kind
                                ),
                            )
                            .into());
                        }
                    }
                    items.push(Some(element.item));
                }
                None if method.accepts_null_reply => items.push(None),
                None => {
                    return Err(fail(
                        PacketErrorKind::Elements,
                        format!("null reply to {} at position {}", method.kind, position),
                    )
                    .into());
                }
            }
        }

        let first_is_error = matches!(items.first(), Some(Some(ResponseItem::Error(_))));
        if items.len() < methods.len() && !first_is_error {
            return Err(fail(
                PacketErrorKind::Elements,
                format!("{} elements answer {} methods", items.len(), methods.len()),
            )
            .into());
        }

        match (request.audit().is_some(), audit.is_some()) {
            (true, false) if !first_is_error => {
                return Err(fail(PacketErrorKind::Audit, "requested audit is missing").into());
            }
            (false, true) => {
                return Err(fail(PacketErrorKind::Audit, "unrequested audit").into());
            }
            _ => {}
        }

        Ok(Self { items, audit })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item(&self, position: usize) -> Option<&ResponseItem> {
        self.items.get(position).and_then(Option::as_ref)
    }

    /// The reply at `position`, or the error the host declared there.
    ///
    /// `Ok(None)` is an accepted null reply. Positions past a short
    /// response fail with the error that cut it short.
    pub fn check_reply(&self, position: usize) -> Result<Option<&Reply>, PacketError> {
        match self.items.get(position) {
            Some(Some(ResponseItem::Reply(reply))) => Ok(Some(reply)),
            Some(Some(ResponseItem::Error(error))) => Err(error.clone().into()),
            Some(None) => Ok(None),
            None => match self.items.first() {
                Some(Some(ResponseItem::Error(error))) => Err(error.clone().into()),
                _ => Err(fail(
                    PacketErrorKind::Elements,
                    format!("no element at position {}", position),
                )),
            },
        }
    }

    pub fn audit(&self) -> Option<&ResponseAudit> {
        self.audit.as_ref()
    }

    pub fn take_audit(&mut self) -> Option<ResponseAudit> {
        self.audit.take()
    }

    /// The redirect the host signalled in place of the first reply.
    pub fn redirect(&self) -> Option<&Redirect> {
        match self.items.first() {
            Some(Some(ResponseItem::Error(error))) => error.redirect.as_ref(),
            _ => None,
        }
    }
}
