//! The CA manager: dual-slot rotation, crash recovery, and timer loops.
//!
//! The manager runs two identical state machines, one for the X509 signing
//! CA and one for the JWT signing key. Each works over a `current` and a
//! `next` slot: at half-life the next generation is prepared and its root
//! published to the trust bundle, at five-sixths of life the slots swap.
//! Prepared material is recorded in the on-disk journal so a restart can
//! pick up where the previous process stopped, provided the key manager
//! still holds the matching private keys.
//!
//! [`Manager::run`] drives two cooperative loops: a frequent rotation loop
//! and an infrequent prune loop. Backend failures are logged and retried
//! on the next tick; only startup failures are fatal.

use crate::bundle::BundleStore;
use crate::ca::{CaSetter, JwtKey, X509Ca};
use crate::cert::Certificate;
use crate::clock::Clock;
use crate::datastore::DataStore;
use crate::journal::{migrate_legacy_json, Journal, JwtKeyEntry, X509CaEntry};
use crate::keymanager::{KeyManager, KeyType, Signer};
use crate::metrics::Metrics;
use crate::signing::{sign_x509_ca, CaSubject};
use crate::slot::{
    jwt_key_km_key_id, x509_ca_km_key_id, JwtKeySlot, Slot, SlotId, SlotPair, X509CaSlot,
};
use crate::upstream::UpstreamCa;
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Lifetime of freshly issued CA certificates and JWT keys when the
/// configured TTL is zero.
pub const DEFAULT_CA_TTL: StdDuration = StdDuration::from_secs(24 * 60 * 60);

/// Waits until `rx` carries `true`, without holding a lock guard across an
/// await point (unlike [`watch::Receiver::wait_for`], which is not `Send`
/// when used inside a `select!` branch driven by `tokio::try_join!`).
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

const ROTATE_INTERVAL: StdDuration = StdDuration::from_secs(60);
const PRUNE_INTERVAL: StdDuration = StdDuration::from_secs(6 * 60 * 60);

/// Configuration for [`Manager`].
#[derive(Clone)]
pub struct ManagerConfig {
    /// Receives activated material.
    pub ca: Arc<dyn CaSetter>,
    /// Holds the private halves of all signing keys.
    pub key_manager: Arc<dyn KeyManager>,
    /// Signs the server's CA CSRs, when configured.
    pub upstream_ca: Option<Arc<dyn UpstreamCa>>,
    /// Stores the trust bundle.
    pub datastore: Arc<dyn DataStore>,
    /// The trust domain this server issues identities for (host form,
    /// e.g. `citadel.local`).
    pub trust_domain: String,
    /// Whether to join the upstream PKI by publishing the upstream roots
    /// instead of the server's own CA certificate.
    pub upstream_bundle: bool,
    /// Lifetime of issued CA certificates and JWT keys. Zero means
    /// [`DEFAULT_CA_TTL`].
    pub ca_ttl: StdDuration,
    /// Subject for the server's CA certificates.
    pub ca_subject: CaSubject,
    /// Directory holding the journal.
    pub data_dir: PathBuf,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Counter sink.
    pub metrics: Arc<dyn Metrics>,
}

struct ManagerState {
    x509: SlotPair<X509CaSlot>,
    jwt: SlotPair<JwtKeySlot>,
    journal: Journal,
}

/// Owns the lifecycle of the server's signing material.
pub struct Manager {
    config: ManagerConfig,
    ca_ttl: Duration,
    bundle: BundleStore,
    state: Mutex<Option<ManagerState>>,
    shutdown: watch::Sender<bool>,
}

impl Manager {
    /// Creates an uninitialized manager. Call [`Manager::initialize`]
    /// before [`Manager::run`].
    pub fn new(config: ManagerConfig) -> Self {
        let ca_ttl = if config.ca_ttl.is_zero() {
            DEFAULT_CA_TTL
        } else {
            config.ca_ttl
        };
        let ca_ttl = Duration::from_std(ca_ttl).unwrap_or_else(|_| Duration::hours(24));

        let bundle = BundleStore::new(
            config.datastore.clone(),
            trust_domain_id(&config.trust_domain),
            config.metrics.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            ca_ttl,
            bundle,
            state: Mutex::new(None),
            shutdown,
        }
    }

    /// Recovers state from the journal and runs the first rotation pass,
    /// leaving both kinds of material active.
    ///
    /// Errors here mean the server must not start: a corrupt journal, an
    /// unreachable backend, or a failed initial preparation.
    pub async fn initialize(&self) -> Result<()> {
        self.load_journal().await?;
        self.rotate().await
    }

    /// Runs the rotation and prune loops until [`Manager::shutdown`].
    ///
    /// Returns the first non-shutdown error from either loop; a shutdown
    /// is a clean `Ok(())`.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let rotation = {
            let manager = self.clone();
            async move { manager.rotate_every(ROTATE_INTERVAL).await }
        };
        let prune = {
            let manager = self.clone();
            async move { manager.prune_every(PRUNE_INTERVAL).await }
        };
        tokio::try_join!(rotation, prune)?;
        Ok(())
    }

    /// Signals both loops to stop after the pass in flight, if any.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Runs a single rotation pass over both kinds of material.
    ///
    /// Normally driven by [`Manager::run`]; exposed so operators can force
    /// a pass. Failures of one kind do not block the other; if both fail,
    /// the returned error carries both causes.
    pub async fn rotate(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = guard
            .as_mut()
            .ok_or_else(|| Error::Internal("manager is not initialized".to_string()))?;

        let x509_result = self.rotate_x509_ca(state).await;
        if let Err(ref err) = x509_result {
            error!("unable to rotate X509 CA: {err}");
        }

        let jwt_result = self.rotate_jwt_key(state).await;
        if let Err(ref err) = jwt_result {
            error!("unable to rotate JWT key: {err}");
        }

        match (x509_result, jwt_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
            (Err(x509_err), Err(jwt_err)) => {
                Err(Error::Rotation(format!("{x509_err}; {jwt_err}")))
            }
        }
    }

    async fn rotate_every(&self, interval: StdDuration) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Per-kind failures were already logged; the next tick
                    // retries.
                    let _ = self.rotate().await;
                }
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    info!("rotation loop shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn prune_every(&self, interval: StdDuration) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.prune_bundle().await {
                        error!("could not prune CA certificates: {err}");
                    }
                }
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    info!("prune loop shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn prune_bundle(&self) -> Result<()> {
        self.bundle.prune(self.config.clock.now()).await
    }

    async fn rotate_x509_ca(&self, state: &mut ManagerState) -> Result<()> {
        let now = self.config.clock.now();

        // No current material at all: bootstrap this slot and activate it.
        if state.x509.current().is_empty() {
            let slot_id = state.x509.current().id();
            self.prepare_x509_ca(state, slot_id).await?;
            self.activate_x509_ca(state);
        }

        if state.x509.next().is_empty() && state.x509.current().should_prepare_next(now) {
            let slot_id = state.x509.next().id();
            self.prepare_x509_ca(state, slot_id).await?;
        }

        if state.x509.current().should_activate_next(now) {
            state.x509.swap();
            state.x509.next_mut().reset();
            self.activate_x509_ca(state);
        }

        Ok(())
    }

    async fn rotate_jwt_key(&self, state: &mut ManagerState) -> Result<()> {
        let now = self.config.clock.now();

        if state.jwt.current().is_empty() {
            let slot_id = state.jwt.current().id();
            self.prepare_jwt_key(state, slot_id).await?;
            self.activate_jwt_key(state);
        }

        if state.jwt.next().is_empty() && state.jwt.current().should_prepare_next(now) {
            let slot_id = state.jwt.next().id();
            self.prepare_jwt_key(state, slot_id).await?;
        }

        if state.jwt.current().should_activate_next(now) {
            state.jwt.swap();
            state.jwt.next_mut().reset();
            self.activate_jwt_key(state);
        }

        Ok(())
    }

    async fn prepare_x509_ca(&self, state: &mut ManagerState, slot_id: SlotId) -> Result<()> {
        self.config.metrics.incr_counter("manager.x509_ca.prepare", 1);
        debug!("preparing X509 CA for slot {slot_id}");

        state.x509.slot_mut(slot_id).reset();

        let now = self.config.clock.now();
        // Back-date to absorb modest clock skew between this server and
        // relying parties.
        let not_before = now - Duration::seconds(10);
        let not_after = now + self.ca_ttl;

        let key_id = x509_ca_km_key_id(slot_id);
        let key = self
            .config
            .key_manager
            .generate_key(&key_id, KeyType::EcP384)
            .await?;
        let signer = Signer::new(key_id, key);

        let (x509_ca, trust_bundle) = sign_x509_ca(
            signer,
            self.config.upstream_ca.as_deref(),
            self.config.upstream_bundle,
            &self.config.trust_domain,
            &self.config.ca_subject,
            not_before,
            not_after,
        )
        .await?;

        self.bundle.append(&trust_bundle, None).await?;

        let x509_ca = Arc::new(x509_ca);
        state.x509.slot_mut(slot_id).set(now, x509_ca.clone());

        // The journal is a recovery hint; in-memory state stays
        // authoritative even if this write fails.
        if let Err(err) = state.journal.append_x509_ca(slot_id, now, &x509_ca) {
            error!("unable to append X509 CA to journal: {err}");
        }

        info!(
            slot = %slot_id,
            issued_at = %now.to_rfc3339(),
            not_after = %x509_ca.not_after().to_rfc3339(),
            self_signed = self.config.upstream_ca.is_none(),
            is_intermediate = x509_ca.is_intermediate(),
            "X509 CA prepared"
        );
        Ok(())
    }

    fn activate_x509_ca(&self, state: &ManagerState) {
        let slot = state.x509.current();
        let Some(ca) = slot.ca() else { return };

        info!(
            slot = %slot.id(),
            issued_at = %slot.issued_at().to_rfc3339(),
            not_after = %ca.not_after().to_rfc3339(),
            "X509 CA activated"
        );
        self.config.metrics.incr_counter("manager.x509_ca.activate", 1);
        self.config.ca.set_x509_ca(ca.clone());
    }

    async fn prepare_jwt_key(&self, state: &mut ManagerState, slot_id: SlotId) -> Result<()> {
        self.config.metrics.incr_counter("manager.jwt_key.prepare", 1);
        debug!("preparing JWT key for slot {slot_id}");

        state.jwt.slot_mut(slot_id).reset();

        let now = self.config.clock.now();
        let not_after = now + self.ca_ttl;

        let key_id = jwt_key_km_key_id(slot_id);
        let key = self
            .config
            .key_manager
            .generate_key(&key_id, KeyType::EcP256)
            .await?;
        let signer = Signer::new(key_id, key);

        let jwt_key = Arc::new(JwtKey::new(signer, not_after)?);

        self.bundle.append(&[], Some(jwt_key.to_bundle_key())).await?;

        state.jwt.slot_mut(slot_id).set(now, jwt_key.clone());

        if let Err(err) = state.journal.append_jwt_key(slot_id, now, &jwt_key) {
            error!("unable to append JWT key to journal: {err}");
        }

        info!(
            slot = %slot_id,
            issued_at = %now.to_rfc3339(),
            not_after = %jwt_key.not_after().to_rfc3339(),
            "JWT key prepared"
        );
        Ok(())
    }

    fn activate_jwt_key(&self, state: &ManagerState) {
        let slot = state.jwt.current();
        let Some(jwt_key) = slot.jwt_key() else { return };

        info!(
            slot = %slot.id(),
            issued_at = %slot.issued_at().to_rfc3339(),
            not_after = %jwt_key.not_after().to_rfc3339(),
            "JWT key activated"
        );
        self.config.metrics.incr_counter("manager.jwt_key.activate", 1);
        self.config.ca.set_jwt_key(jwt_key.clone());
    }

    async fn load_journal(&self) -> Result<()> {
        let json_path = self.config.data_dir.join("certs.json");
        let journal_path = self.config.data_dir.join("journal.pem");

        if migrate_legacy_json(&json_path, &journal_path)? {
            info!("migrated legacy certificate data to journal");
        }

        debug!("loading journal from {}", journal_path.display());
        let journal = Journal::load(&journal_path)?;
        let entries = journal.entries().clone();

        info!(
            x509_cas = entries.x509_cas.len(),
            jwt_keys = entries.jwt_keys.len(),
            "journal loaded"
        );

        let now = self.config.clock.now();

        // The last entry is the candidate next slot; the one before it the
        // candidate current. A candidate is only usable if its key is still
        // in the key manager and matches.
        let mut next_x509: Option<X509CaSlot> = None;
        let mut current_x509: Option<X509CaSlot> = None;
        if let Some(last) = entries.x509_cas.last() {
            next_x509 = self.try_load_x509_ca_slot(last).await?;
            if next_x509.is_some() && entries.x509_cas.len() > 1 {
                current_x509 = self
                    .try_load_x509_ca_slot(&entries.x509_cas[entries.x509_cas.len() - 2])
                    .await?;
            }
        }
        // Consecutive entries can repeat a slot id when a previous run
        // re-prepared a slot without activating it; the newer entry wins.
        if let (Some(current), Some(next)) = (&current_x509, &next_x509) {
            if current.id() == next.id() {
                current_x509 = None;
            }
        }
        let x509 = match (current_x509, next_x509) {
            (Some(current), Some(next)) => SlotPair::new(current, next),
            (None, Some(next)) => {
                // Only the newest entry is usable: promote it to current
                // and pair it with an empty slot of the other id.
                let empty = X509CaSlot::new(next.id().other());
                SlotPair::new(next, empty)
            }
            _ => SlotPair::new(X509CaSlot::new(SlotId::A), X509CaSlot::new(SlotId::B)),
        };

        let mut next_jwt: Option<JwtKeySlot> = None;
        let mut current_jwt: Option<JwtKeySlot> = None;
        if let Some(last) = entries.jwt_keys.last() {
            next_jwt = self.try_load_jwt_key_slot(last).await?;
            if next_jwt.is_some() && entries.jwt_keys.len() > 1 {
                current_jwt = self
                    .try_load_jwt_key_slot(&entries.jwt_keys[entries.jwt_keys.len() - 2])
                    .await?;
            }
        }
        if let (Some(current), Some(next)) = (&current_jwt, &next_jwt) {
            if current.id() == next.id() {
                current_jwt = None;
            }
        }
        let jwt = match (current_jwt, next_jwt) {
            (Some(current), Some(next)) => SlotPair::new(current, next),
            (None, Some(next)) => {
                let empty = JwtKeySlot::new(next.id().other());
                SlotPair::new(next, empty)
            }
            _ => SlotPair::new(JwtKeySlot::new(SlotId::A), JwtKeySlot::new(SlotId::B)),
        };

        let state = ManagerState { x509, jwt, journal };

        // Activate recovered material right away unless it is already due
        // for replacement; in that case the first rotation pass handles it.
        if !state.x509.current().is_empty() && !state.x509.current().should_activate_next(now) {
            self.activate_x509_ca(&state);
        }
        if !state.jwt.current().is_empty() && !state.jwt.current().should_activate_next(now) {
            self.activate_jwt_key(&state);
        }

        *self.state.lock().await = Some(state);
        Ok(())
    }

    async fn try_load_x509_ca_slot(&self, entry: &X509CaEntry) -> Result<Option<X509CaSlot>> {
        let slot_id = match SlotId::try_from(entry.slot_id.as_str()) {
            Ok(slot_id) => slot_id,
            Err(_) => {
                warn!(
                    "X509 CA journal entry unusable: unrecognized slot id {:?}",
                    entry.slot_id
                );
                return Ok(None);
            }
        };

        if entry.chain.is_empty() {
            warn!("X509 CA journal entry for slot {slot_id} unusable: no certificates in chain");
            return Ok(None);
        }
        let chain: Vec<Certificate> = entry
            .chain
            .iter()
            .map(|der| Certificate::from_der(der.clone()))
            .collect();
        for cert in &chain {
            cert.not_after()
                .map_err(|e| Error::Journal(format!("unable to parse journaled chain: {e}")))?;
        }

        let key_id = x509_ca_km_key_id(slot_id);
        let Some(key) = self.config.key_manager.get_key(&key_id).await? else {
            warn!("X509 CA journal entry for slot {slot_id} unusable: no key manager key");
            return Ok(None);
        };
        let signer = Signer::new(key_id, key);
        if chain[0].public_key_der()? != signer.public_key_der() {
            warn!(
                "X509 CA journal entry for slot {slot_id} unusable: \
                 public key does not match key manager key"
            );
            return Ok(None);
        }

        let issued_at = DateTime::from_timestamp(entry.issued_at, 0)
            .ok_or_else(|| Error::Journal("invalid issued_at in journal entry".to_string()))?;
        let x509_ca = Arc::new(X509Ca::new(signer, chain, entry.is_intermediate)?);
        Ok(Some(X509CaSlot::with_material(slot_id, issued_at, x509_ca)))
    }

    async fn try_load_jwt_key_slot(&self, entry: &JwtKeyEntry) -> Result<Option<JwtKeySlot>> {
        let slot_id = match SlotId::try_from(entry.slot_id.as_str()) {
            Ok(slot_id) => slot_id,
            Err(_) => {
                warn!(
                    "JWT key journal entry unusable: unrecognized slot id {:?}",
                    entry.slot_id
                );
                return Ok(None);
            }
        };

        let key_id = jwt_key_km_key_id(slot_id);
        let Some(key) = self.config.key_manager.get_key(&key_id).await? else {
            warn!("JWT key journal entry for slot {slot_id} unusable: no key manager key");
            return Ok(None);
        };
        let signer = Signer::new(key_id, key);
        if entry.public_key != signer.public_key_der() {
            warn!(
                "JWT key journal entry for slot {slot_id} unusable: \
                 public key does not match key manager key"
            );
            return Ok(None);
        }

        let issued_at = DateTime::from_timestamp(entry.issued_at, 0)
            .ok_or_else(|| Error::Journal("invalid issued_at in journal entry".to_string()))?;
        let not_after = DateTime::from_timestamp(entry.not_after, 0)
            .ok_or_else(|| Error::Journal("invalid not_after in journal entry".to_string()))?;
        let jwt_key = Arc::new(JwtKey::with_kid(signer, entry.kid.clone(), not_after));
        Ok(Some(JwtKeySlot::with_material(slot_id, issued_at, jwt_key)))
    }
}

fn trust_domain_id(trust_domain: &str) -> String {
    format!("spiffe://{trust_domain}")
}
