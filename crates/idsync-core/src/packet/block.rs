//! Content blocks: what an element actually carries once every outer layer
//! has been peeled off.

use serde::{Deserialize, Serialize};

use crate::error::{PacketError, PacketErrorKind, Side};
use crate::types::{HostId, Identity, ModuleId, Service, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MethodKind {
    /// Fetch attributes (e.g. public keys) of a host or entity
    AttributeQuery,
    CertificateIssuance,
    AccountOpen,
    AccountInitialize,
    /// Deliver one client action
    Action,
    /// Fetch the full module state of a service
    StateQuery,
}

impl MethodKind {
    /// Methods that may address a host rather than an entity.
    pub fn addresses_host(self) -> bool {
        matches!(self, MethodKind::AttributeQuery | MethodKind::CertificateIssuance)
    }

    /// Methods that may target an entity the host does not serve yet.
    pub fn bootstraps_account(self) -> bool {
        matches!(self, MethodKind::AccountOpen | MethodKind::AccountInitialize)
    }
}

impl std::fmt::Display for MethodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// One call inside a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Method {
    pub kind: MethodKind,
    pub service: Service,
    pub module: Option<ModuleId>,
    pub payload: Vec<u8>,
    /// Whether the host may answer this position with a null element
    pub accepts_null_reply: bool,
}

impl Method {
    pub fn new(kind: MethodKind, service: Service, payload: Vec<u8>) -> Self {
        Self {
            kind,
            service,
            module: None,
            payload,
            accepts_null_reply: false,
        }
    }

    pub fn with_module(mut self, module: Option<ModuleId>) -> Self {
        self.module = module;
        self
    }

    pub fn accepting_null_reply(mut self, accepts: bool) -> Self {
        self.accepts_null_reply = accepts;
        self
    }

    /// Methods of one request must be pairwise similar.
    pub fn is_similar(&self, other: &Method) -> bool {
        self.kind == other.kind && self.service == other.service
    }

    /// Whether `reply` is structurally a reply to this method.
    pub fn matches_reply(&self, reply: &Reply) -> bool {
        self.kind == reply.kind
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub kind: MethodKind,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn new(kind: MethodKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn empty(kind: MethodKind) -> Self {
        Self::new(kind, Vec::new())
    }
}

/// A recoverable condition the host signals so the client can resend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Redirect {
    /// The client commitment is too old; rotate it and resend
    KeyRotation,
    /// The subject now lives under another identifier
    Subject(Identity),
    /// The service moved to another host
    Host(HostId),
}

/// An error the host returns in place of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredError {
    pub side: Side,
    pub kind: PacketErrorKind,
    pub message: String,
    pub redirect: Option<Redirect>,
}

impl DeclaredError {
    /// A request-side error of `kind`, as a host declares it.
    pub fn new(kind: PacketErrorKind, message: impl Into<String>) -> Self {
        Self {
            side: Side::Request,
            kind,
            message: message.into(),
            redirect: None,
        }
    }
}

impl From<PacketError> for DeclaredError {
    fn from(error: PacketError) -> Self {
        Self {
            side: error.side,
            kind: error.kind,
            message: error.message,
            redirect: error.redirect,
        }
    }
}

impl From<DeclaredError> for PacketError {
    fn from(error: DeclaredError) -> Self {
        Self {
            side: error.side,
            kind: error.kind,
            message: error.message,
            redirect: error.redirect,
        }
    }
}

/// One response position: a reply or the error that replaced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseItem {
    Reply(Reply),
    Error(DeclaredError),
}

impl ResponseItem {
    pub fn is_error(&self) -> bool {
        matches!(self, ResponseItem::Error(_))
    }
}

/// Full module state of one service, as returned to a state query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Host time the snapshot was taken; becomes the new sync cursor
    pub time: Timestamp,
    pub modules: Vec<(ModuleId, Vec<u8>)>,
}
