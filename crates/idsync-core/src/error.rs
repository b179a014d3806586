//! Error types for idsync

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::packet::Redirect;

/// Which half of an exchange a packet error was raised on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Raised while building or validating a request
    Request,
    /// Raised while building or validating a response
    Response,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Request => f.write_str("request"),
            Side::Response => f.write_str("response"),
        }
    }
}

/// Layer or condition a packet error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketErrorKind {
    /// Undecodable, undecryptable or out-of-window encryption layer
    Encryption,
    /// Bad element count, or too many/too few against the request
    Elements,
    /// Invalid, inactive, not-signed-alike or wrong signer
    Signature,
    Compression,
    Content,
    /// Audit missing or unexpected
    Audit,
    /// Subject mismatch or unresolvable subject
    Identifier,
    /// Subject moved to another identifier
    Relocation,
    /// Method not supported for the principal or subject
    Method,
    /// Service not supported by the addressed host
    Service,
    /// Nonce already seen
    Replay,
    /// Client commitment must be rotated before the host accepts it
    KeyRotation,
}

impl fmt::Display for PacketErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketErrorKind::Encryption => "ENCRYPTION",
            PacketErrorKind::Elements => "ELEMENTS",
            PacketErrorKind::Signature => "SIGNATURE",
            PacketErrorKind::Compression => "COMPRESSION",
            PacketErrorKind::Content => "CONTENT",
            PacketErrorKind::Audit => "AUDIT",
            PacketErrorKind::Identifier => "IDENTIFIER",
            PacketErrorKind::Relocation => "RELOCATION",
            PacketErrorKind::Method => "METHOD",
            PacketErrorKind::Service => "SERVICE",
            PacketErrorKind::Replay => "REPLAY",
            PacketErrorKind::KeyRotation => "KEYROTATION",
        };
        f.write_str(name)
    }
}

/// A layer-tagged packet failure.
///
/// `redirect` is set when the failure is a recoverable host signal that the
/// client can act on by resending a corrected request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{side} {kind}: {message}")]
pub struct PacketError {
    pub side: Side,
    pub kind: PacketErrorKind,
    pub message: String,
    pub redirect: Option<Redirect>,
}

impl PacketError {
    pub fn new(side: Side, kind: PacketErrorKind, message: impl Into<String>) -> Self {
        Self {
            side,
            kind,
            message: message.into(),
            redirect: None,
        }
    }

    pub fn with_redirect(mut self, redirect: Redirect) -> Self {
        self.redirect = Some(redirect);
        self
    }
}

/// Main error type for idsync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Packet envelope failed to encode or validate
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// A request kept being redirected past the resend bound
    #[error("Request to {recipient} exceeded {limit} resends")]
    ResendLimit { recipient: String, limit: u8 },

    /// Local reversal could not be completed even after escalation
    #[error("Reversal failed: {0}")]
    ReversalFailed(String),

    /// The synchronizer is stopping and no longer accepts work
    #[error("Synchronizer is shutting down")]
    ShuttingDown,

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Identity-related error (keys, commitments)
    #[error("Identity error: {0}")]
    Identity(String),

    /// Attribute could not be resolved from the cache
    #[error("Attribute unavailable: {0}")]
    Attribute(String),

    /// Action failed to execute, acknowledge or reverse locally
    #[error("Action error: {0}")]
    Action(String),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SyncError {
    /// Whether retrying the same exchange later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Io(_) | SyncError::Network(_))
    }

    /// The packet error carried by this error, if any.
    pub fn packet(&self) -> Option<&PacketError> {
        match self {
            SyncError::Packet(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
