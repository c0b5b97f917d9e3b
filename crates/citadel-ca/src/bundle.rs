//! Trust-bundle maintenance: idempotent appends and safety-checked pruning.
//!
//! New roots and JWT keys are appended the moment material is prepared, so
//! relying parties trust a root before anything is signed by it. Pruning
//! removes material long past expiry, but never so much that the bundle
//! could no longer validate any identity.

use crate::cert::{parse_der_chain, Certificate};
use crate::datastore::{Bundle, BundleCert, DataStore, JwtSigningKey};
use crate::metrics::Metrics;
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// How far past expiry a root or key must be before pruning touches it,
/// in hours.
const SAFETY_THRESHOLD_HOURS: i64 = 24;

/// The manager's view of the datastore bundle for one trust domain.
pub struct BundleStore {
    datastore: Arc<dyn DataStore>,
    trust_domain_id: String,
    metrics: Arc<dyn Metrics>,
}

impl BundleStore {
    /// Creates a store scoped to one trust domain.
    pub fn new(
        datastore: Arc<dyn DataStore>,
        trust_domain_id: String,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            datastore,
            trust_domain_id,
            metrics,
        }
    }

    /// Appends root certificates and an optional JWT signing key to the
    /// trust bundle. Purely additive; duplicates are the datastore's to
    /// deal with.
    pub async fn append(
        &self,
        chain: &[Certificate],
        jwt_signing_key: Option<JwtSigningKey>,
    ) -> Result<()> {
        let bundle = Bundle {
            trust_domain_id: self.trust_domain_id.clone(),
            root_cas: chain
                .iter()
                .map(|cert| BundleCert {
                    der_bytes: cert.der().to_vec(),
                })
                .collect(),
            jwt_signing_keys: jwt_signing_key.into_iter().collect(),
        };
        self.datastore.append_bundle(bundle).await
    }

    /// Removes every root whose entire chain expired more than
    /// [`SAFETY_THRESHOLD_HOURS`] ago, and every JWT key past the same
    /// cutoff.
    ///
    /// Refuses (and leaves the bundle untouched) if the result would hold
    /// no roots or no JWT keys.
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<()> {
        self.metrics.incr_counter("manager.bundle.prune", 1);

        let cutoff = now - Duration::hours(SAFETY_THRESHOLD_HOURS);

        let Some(old_bundle) = self.datastore.fetch_bundle(&self.trust_domain_id).await? else {
            // no bundle to prune
            return Ok(());
        };

        let mut new_bundle = Bundle::new(old_bundle.trust_domain_id.clone());
        let mut changed = false;

        'roots: for root_ca in &old_bundle.root_cas {
            let certs = parse_der_chain(&root_ca.der_bytes)?;
            // One expired certificate disqualifies the entire chain.
            for cert in &certs {
                let not_after = cert.not_after()?;
                if not_after <= cutoff {
                    info!(
                        "pruning CA certificate {} with expiry date {}",
                        cert.serial()?,
                        not_after.to_rfc3339()
                    );
                    changed = true;
                    continue 'roots;
                }
            }
            new_bundle.root_cas.push(root_ca.clone());
        }

        for jwt_signing_key in &old_bundle.jwt_signing_keys {
            let not_after =
                DateTime::from_timestamp(jwt_signing_key.not_after, 0).unwrap_or(DateTime::UNIX_EPOCH);
            if not_after <= cutoff {
                info!(
                    "pruning JWT signing key {:?} with expiry date {}",
                    jwt_signing_key.kid,
                    not_after.to_rfc3339()
                );
                changed = true;
                continue;
            }
            new_bundle.jwt_signing_keys.push(jwt_signing_key.clone());
        }

        if new_bundle.root_cas.is_empty() {
            warn!("pruning halted; all known CA certificates have expired");
            return Err(Error::PruneAllCertificates);
        }
        if new_bundle.jwt_signing_keys.is_empty() {
            warn!("pruning halted; all known JWT signing keys have expired");
            return Err(Error::PruneAllJwtKeys);
        }

        if changed {
            self.metrics.incr_counter("manager.bundle.pruned", 1);
            self.datastore
                .update_bundle(new_bundle)
                .await
                .map_err(|e| Error::DataStore(format!("write new bundle: {e}")))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::InMemoryDataStore;
    use crate::metrics::InMemoryMetrics;
    use crate::testutil::make_ca_cert;

    const TRUST_DOMAIN_ID: &str = "spiffe://citadel.local";

    struct Fixture {
        datastore: Arc<InMemoryDataStore>,
        metrics: Arc<InMemoryMetrics>,
        store: BundleStore,
    }

    fn fixture() -> Fixture {
        let datastore = Arc::new(InMemoryDataStore::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let store = BundleStore::new(
            datastore.clone(),
            TRUST_DOMAIN_ID.to_string(),
            metrics.clone(),
        );
        Fixture {
            datastore,
            metrics,
            store,
        }
    }

    fn fresh_cert(now: DateTime<Utc>) -> Certificate {
        make_ca_cert(now - Duration::hours(1), now + Duration::hours(24))
    }

    fn expired_cert(now: DateTime<Utc>) -> Certificate {
        make_ca_cert(now - Duration::hours(48), now - Duration::hours(25))
    }

    fn fresh_key(now: DateTime<Utc>, kid: &str) -> JwtSigningKey {
        JwtSigningKey {
            pkix_bytes: vec![1, 2, 3],
            kid: kid.to_string(),
            not_after: (now + Duration::hours(24)).timestamp(),
        }
    }

    fn expired_key(now: DateTime<Utc>, kid: &str) -> JwtSigningKey {
        JwtSigningKey {
            pkix_bytes: vec![4, 5, 6],
            kid: kid.to_string(),
            not_after: (now - Duration::hours(25)).timestamp(),
        }
    }

    #[tokio::test]
    async fn test_append_chain_and_key() {
        let f = fixture();
        let now = Utc::now();
        let cert = fresh_cert(now);

        f.store
            .append(std::slice::from_ref(&cert), Some(fresh_key(now, "kid-1")))
            .await
            .unwrap();

        let bundle = f
            .datastore
            .fetch_bundle(TRUST_DOMAIN_ID)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bundle.root_cas.len(), 1);
        assert_eq!(bundle.root_cas[0].der_bytes, cert.der());
        assert_eq!(bundle.jwt_signing_keys.len(), 1);
        assert_eq!(bundle.jwt_signing_keys[0].kid, "kid-1");
    }

    #[tokio::test]
    async fn test_prune_without_bundle_is_a_no_op() {
        let f = fixture();
        f.store.prune(Utc::now()).await.unwrap();
        assert_eq!(f.metrics.counter("manager.bundle.prune"), 1);
        assert_eq!(f.metrics.counter("manager.bundle.pruned"), 0);
    }

    #[tokio::test]
    async fn test_prune_leaves_fresh_material_alone() {
        let f = fixture();
        let now = Utc::now();

        f.store
            .append(&[fresh_cert(now)], Some(fresh_key(now, "kid-1")))
            .await
            .unwrap();
        let before = f.datastore.fetch_bundle(TRUST_DOMAIN_ID).await.unwrap();

        f.store.prune(now).await.unwrap();

        let after = f.datastore.fetch_bundle(TRUST_DOMAIN_ID).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(f.metrics.counter("manager.bundle.pruned"), 0);
    }

    #[tokio::test]
    async fn test_prune_removes_expired_root() {
        let f = fixture();
        let now = Utc::now();
        let fresh = fresh_cert(now);

        f.store
            .append(&[fresh.clone(), expired_cert(now)], Some(fresh_key(now, "kid-1")))
            .await
            .unwrap();

        f.store.prune(now).await.unwrap();

        let bundle = f
            .datastore
            .fetch_bundle(TRUST_DOMAIN_ID)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bundle.root_cas.len(), 1);
        assert_eq!(bundle.root_cas[0].der_bytes, fresh.der());
        assert_eq!(f.metrics.counter("manager.bundle.pruned"), 1);
    }

    #[tokio::test]
    async fn test_prune_drops_chain_if_any_link_expired() {
        let f = fixture();
        let now = Utc::now();
        let fresh = fresh_cert(now);

        // One bundle entry holding a concatenated chain with an expired link.
        let mut chain_bytes = fresh_cert(now).der().to_vec();
        chain_bytes.extend_from_slice(expired_cert(now).der());

        let mut bundle = Bundle::new(TRUST_DOMAIN_ID);
        bundle.root_cas.push(BundleCert {
            der_bytes: chain_bytes,
        });
        bundle.root_cas.push(BundleCert {
            der_bytes: fresh.der().to_vec(),
        });
        bundle.jwt_signing_keys.push(fresh_key(now, "kid-1"));
        f.datastore.append_bundle(bundle).await.unwrap();

        f.store.prune(now).await.unwrap();

        let stored = f
            .datastore
            .fetch_bundle(TRUST_DOMAIN_ID)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.root_cas.len(), 1);
        assert_eq!(stored.root_cas[0].der_bytes, fresh.der());
    }

    #[tokio::test]
    async fn test_prune_removes_expired_jwt_key() {
        let f = fixture();
        let now = Utc::now();

        f.store
            .append(&[fresh_cert(now)], Some(fresh_key(now, "kid-fresh")))
            .await
            .unwrap();
        f.store
            .append(&[], Some(expired_key(now, "kid-old")))
            .await
            .unwrap();

        f.store.prune(now).await.unwrap();

        let bundle = f
            .datastore
            .fetch_bundle(TRUST_DOMAIN_ID)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bundle.jwt_signing_keys.len(), 1);
        assert_eq!(bundle.jwt_signing_keys[0].kid, "kid-fresh");
    }

    #[tokio::test]
    async fn test_prune_refuses_to_remove_last_root() {
        let f = fixture();
        let now = Utc::now();

        f.store
            .append(&[expired_cert(now)], Some(fresh_key(now, "kid-1")))
            .await
            .unwrap();
        let before = f.datastore.fetch_bundle(TRUST_DOMAIN_ID).await.unwrap();

        let err = f.store.prune(now).await.unwrap_err();
        assert!(matches!(err, Error::PruneAllCertificates));

        // The bundle is left untouched.
        let after = f.datastore.fetch_bundle(TRUST_DOMAIN_ID).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(f.metrics.counter("manager.bundle.pruned"), 0);
    }

    #[tokio::test]
    async fn test_prune_refuses_to_remove_last_jwt_key() {
        let f = fixture();
        let now = Utc::now();

        f.store
            .append(&[fresh_cert(now)], Some(expired_key(now, "kid-old")))
            .await
            .unwrap();

        let err = f.store.prune(now).await.unwrap_err();
        assert!(matches!(err, Error::PruneAllJwtKeys));

        let bundle = f
            .datastore
            .fetch_bundle(TRUST_DOMAIN_ID)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bundle.jwt_signing_keys.len(), 1);
    }
}
