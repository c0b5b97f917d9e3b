//! Pluggable trust-bundle storage backend.
//!
//! The datastore owns the trust bundle for each trust domain. The manager
//! appends to it when material is prepared and replaces it when pruning;
//! the backend is responsible for making those two operations race-safe
//! with respect to each other.

use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// A root CA certificate entry in a trust bundle.
///
/// `der_bytes` usually holds a single certificate but may carry a whole
/// DER-concatenated chain; pruning treats the entry as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleCert {
    /// DER-encoded certificate bytes.
    pub der_bytes: Vec<u8>,
}

/// A JWT signing public key entry in a trust bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwtSigningKey {
    /// PKIX (SubjectPublicKeyInfo) DER encoding of the public key.
    pub pkix_bytes: Vec<u8>,
    /// The key id credentials reference.
    pub kid: String,
    /// Expiration as Unix seconds.
    pub not_after: i64,
}

/// The trust material relying parties use to validate credentials for one
/// trust domain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bundle {
    /// The trust domain this bundle belongs to (`spiffe://<domain>`).
    pub trust_domain_id: String,
    /// Root CA certificates.
    pub root_cas: Vec<BundleCert>,
    /// JWT signing public keys.
    pub jwt_signing_keys: Vec<JwtSigningKey>,
}

impl Bundle {
    /// Creates an empty bundle for a trust domain.
    pub fn new(trust_domain_id: impl Into<String>) -> Self {
        Self {
            trust_domain_id: trust_domain_id.into(),
            root_cas: Vec::new(),
            jwt_signing_keys: Vec::new(),
        }
    }
}

/// Trust-bundle storage.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Returns the bundle for a trust domain, or `None` if none exists yet.
    async fn fetch_bundle(&self, trust_domain_id: &str) -> Result<Option<Bundle>>;

    /// Adds the bundle's contents to the stored bundle for its trust
    /// domain, creating it if absent. Never removes anything.
    async fn append_bundle(&self, bundle: Bundle) -> Result<()>;

    /// Replaces the stored bundle for the bundle's trust domain.
    async fn update_bundle(&self, bundle: Bundle) -> Result<()>;
}

/// An in-memory datastore.
///
/// Appends and updates are serialized behind a single lock, which is the
/// transactional contract the manager relies on.
#[derive(Debug, Default)]
pub struct InMemoryDataStore {
    bundles: Mutex<HashMap<String, Bundle>>,
}

impl InMemoryDataStore {
    /// Creates an empty datastore.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataStore for InMemoryDataStore {
    async fn fetch_bundle(&self, trust_domain_id: &str) -> Result<Option<Bundle>> {
        let bundles = self.bundles.lock().await;
        Ok(bundles.get(trust_domain_id).cloned())
    }

    async fn append_bundle(&self, bundle: Bundle) -> Result<()> {
        let mut bundles = self.bundles.lock().await;
        let stored = bundles
            .entry(bundle.trust_domain_id.clone())
            .or_insert_with(|| Bundle::new(bundle.trust_domain_id.clone()));

        for root in bundle.root_cas {
            if !stored.root_cas.contains(&root) {
                stored.root_cas.push(root);
            }
        }
        for key in bundle.jwt_signing_keys {
            if !stored.jwt_signing_keys.contains(&key) {
                stored.jwt_signing_keys.push(key);
            }
        }
        Ok(())
    }

    async fn update_bundle(&self, bundle: Bundle) -> Result<()> {
        let mut bundles = self.bundles.lock().await;
        bundles.insert(bundle.trust_domain_id.clone(), bundle);
        Ok(())
    }
}
