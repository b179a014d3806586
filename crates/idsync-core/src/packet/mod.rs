//! Packet envelope protocol
//!
//! Every request and response travels in the same four nested layers:
//!
//! ```text
//! PacketWrapper { version, kind }
//!  └─ EncryptionLayer { recipient?, time, nonce?, sealed key? }   body is
//!      │                                                          encrypted
//!      └─ [Option<SignatureLayer>]      one per method or reply, nulls only
//!          │                            in responses
//!          └─ SignatureLayer { subject?, time, principal, audit?, signature }
//!              └─ CompressionLayer { algorithm, original_len }
//!                  └─ Content: Method (request) | ResponseItem (response)
//! ```
//!
//! At most one audit appears per envelope, on the first signed element.
//! Decoding validates strictly layer by layer and reports the first
//! violation as a [`PacketError`](crate::error::PacketError) tagged with the
//! side and layer it was found on.

mod audit;
mod block;
mod codec;
mod layers;
mod lease;
mod replay;
mod request;
mod response;
mod signer;

pub use audit::{AuditEntry, RequestAudit, ResponseAudit};
pub use block::{
    DeclaredError, Method, MethodKind, Redirect, Reply, ResponseItem, StateSnapshot,
};
pub use codec::{Codec, Direction, Element, KeySource, Opened, RequestSide, ResponseSide, Sealing};
pub use layers::{
    Compression, CompressionLayer, EncryptionHeader, EncryptionLayer, PacketKind, PacketWrapper,
    Principal, SignatureLayer, PACKET_VERSION,
};
pub use lease::KeyLeases;
pub use replay::{PurgeHandle, ReplayGuard};
pub use request::{OpenedRequest, ReceivedRequest, Request};
pub use response::Response;
pub use signer::{CommitmentSigner, ElementSigner, HostSigner, Unsigned};
