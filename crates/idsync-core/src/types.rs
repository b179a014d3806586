//! Core types for idsync

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// An entity in the identity graph (a person, group or account).
    Identity
);

string_id!(
    /// A service hosted for an identity (e.g. "profile", "contacts").
    Service
);

string_id!(
    /// A remote authoritative host. Doubles as its network host name.
    HostId
);

string_id!(
    /// A unit of local state within a service that actions mutate.
    ModuleId
);

impl HostId {
    /// The host viewed as a graph identity, for attribute lookups.
    pub fn as_identity(&self) -> Identity {
        Identity(self.0.clone())
    }
}

/// The (identity, service) pair that scopes queues, cursors and exclusivity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PairKey {
    pub identity: Identity,
    pub service: Service,
}

impl PairKey {
    pub fn new(identity: impl Into<Identity>, service: impl Into<Service>) -> Self {
        Self {
            identity: identity.into(),
            service: service.into(),
        }
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.identity, self.service)
    }
}

/// Stable identifier of a submitted action.
///
/// Uses ULID so identifiers sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionId(pub Ulid);

impl ActionId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "action_{}", self.0)
    }
}

/// Who a signed element speaks about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Subject {
    /// A host, only valid for bootstrap methods
    Host(HostId),
    /// A graph entity owned by the addressed host
    Entity(Identity),
}

impl Subject {
    pub fn is_host(&self) -> bool {
        matches!(self, Subject::Host(_))
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subject::Host(host) => write!(f, "host:{}", host),
            Subject::Entity(identity) => write!(f, "{}", identity),
        }
    }
}
