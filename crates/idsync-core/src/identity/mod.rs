//! Identity material for hosts and clients
//!
//! - **Hosts** hold a [`HostKeypair`]: Ed25519 to sign authoritative
//!   responses and X25519 to receive sealed symmetric keys. The public half,
//!   [`HostPublicKeys`], is published through the attribute cache.
//! - **Clients** hold a [`SecretCommitment`] per host. Requests carry only
//!   the public [`Commitment`] plus a signature proving possession.

mod commitment;
mod credentials;
mod keys;

pub use commitment::{Commitment, SecretCommitment};
pub use credentials::Credentials;
pub use keys::{HostKeypair, HostPublicKeys};
