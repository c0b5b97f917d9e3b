//! Certificate authority lifecycle management for the citadel workload
//! identity server.
//!
//! This crate owns the cryptographic material the server uses to mint
//! short-lived workload credentials: the X.509 signing CA and the JWT
//! signing key. It prepares new material ahead of expiry, activates it,
//! records it in an on-disk journal for crash recovery, publishes the
//! corresponding roots into the trust bundle, and prunes expired roots.
//!
//! # Components
//!
//! - [`slot`] - Dual-slot holders for CA/key generations and rotation thresholds
//! - [`journal`] - Append-only on-disk record of prepared material
//! - [`signing`] - CA CSR generation, self-signing, and upstream signing
//! - [`bundle`] - Trust-bundle append and safety-checked pruning
//! - [`manager`] - The rotation state machines, recovery, and timer loops
//! - [`keymanager`] - Pluggable signing key backend
//! - [`datastore`] - Pluggable trust-bundle storage backend
//! - [`upstream`] - Optional upstream CA backend
//! - [`ca`] - The CA/key material types and the activation sink
//! - [`cert`] - X.509 certificate handling
//! - [`clock`] - Injectable time source
//! - [`metrics`] - Counter sink for rotation and prune events

pub mod bundle;
pub mod ca;
pub mod cert;
pub mod clock;
pub mod datastore;
pub mod journal;
pub mod keymanager;
pub mod manager;
pub mod metrics;
pub mod signing;
pub mod slot;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testutil;

pub use bundle::BundleStore;
pub use ca::{CaSetter, JwtKey, X509Ca};
pub use cert::Certificate;
pub use clock::{Clock, MockClock, SystemClock};
pub use datastore::{Bundle, BundleCert, DataStore, InMemoryDataStore, JwtSigningKey};
pub use journal::{Journal, JournalEntries, JwtKeyEntry, X509CaEntry};
pub use keymanager::{InMemoryKeyManager, KeyManager, KeySigner, KeyType, Signer};
pub use manager::{Manager, ManagerConfig, DEFAULT_CA_TTL};
pub use metrics::{InMemoryMetrics, Metrics, NoopMetrics};
pub use signing::CaSubject;
pub use slot::SlotId;
pub use upstream::{SubmitCsrResponse, UpstreamCa};

/// Errors that can occur in citadel-ca operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Certificate parsing or handling error.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// CSR generation error.
    #[error("CSR generation failed: {0}")]
    CsrGeneration(String),

    /// CA signing error.
    #[error("CA signing failed: {0}")]
    CaSigning(String),

    /// Key manager backend error.
    #[error("key manager error: {0}")]
    KeyManager(String),

    /// Upstream CA backend error.
    #[error("upstream CA error: {0}")]
    UpstreamCa(String),

    /// Datastore backend error.
    #[error("datastore error: {0}")]
    DataStore(String),

    /// Journal persistence error.
    #[error("journal error: {0}")]
    Journal(String),

    /// Pruning was refused because it would remove every CA certificate.
    #[error("pruning would remove all CA certificates")]
    PruneAllCertificates,

    /// Pruning was refused because it would remove every JWT signing key.
    #[error("pruning would remove all JWT signing keys")]
    PruneAllJwtKeys,

    /// A rotation pass failed for more than one kind of material.
    #[error("rotation failed: {0}")]
    Rotation(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for citadel-ca operations.
pub type Result<T> = std::result::Result<T, Error>;
