//! End-to-end rotation lifecycle exercised through the public API.
//!
//! ```text
//! initialize → self-signed CA + JWT key active, bundle seeded
//!   → half-life tick → next generation prepared, root published early
//!     → five-sixths tick → swap, new generation active
//!       → restart → journal + key manager recovery
//! ```

use chrono::{DateTime, Duration, Utc};
use citadel_ca::{
    CaSetter, CaSubject, DataStore, InMemoryDataStore, InMemoryKeyManager, InMemoryMetrics,
    JwtKey, Manager, ManagerConfig, MockClock, X509Ca,
};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tempfile::TempDir;

const TRUST_DOMAIN: &str = "citadel.local";
const TRUST_DOMAIN_ID: &str = "spiffe://citadel.local";

/// Records every activation the manager publishes.
#[derive(Default)]
struct Sink {
    x509: Mutex<Vec<Arc<X509Ca>>>,
    jwt: Mutex<Vec<Arc<JwtKey>>>,
}

impl CaSetter for Sink {
    fn set_x509_ca(&self, ca: Arc<X509Ca>) {
        self.x509.lock().unwrap().push(ca);
    }

    fn set_jwt_key(&self, key: Arc<JwtKey>) {
        self.jwt.lock().unwrap().push(key);
    }
}

struct Fixture {
    t0: DateTime<Utc>,
    clock: Arc<MockClock>,
    key_manager: Arc<InMemoryKeyManager>,
    datastore: Arc<InMemoryDataStore>,
    sink: Arc<Sink>,
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let t0 = DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap();
        Self {
            t0,
            clock: Arc::new(MockClock::new(t0)),
            key_manager: Arc::new(InMemoryKeyManager::new()),
            datastore: Arc::new(InMemoryDataStore::new()),
            sink: Arc::new(Sink::default()),
            dir: TempDir::new().unwrap(),
        }
    }

    fn manager(&self) -> Manager {
        Manager::new(ManagerConfig {
            ca: self.sink.clone(),
            key_manager: self.key_manager.clone(),
            upstream_ca: None,
            datastore: self.datastore.clone(),
            trust_domain: TRUST_DOMAIN.to_string(),
            upstream_bundle: false,
            ca_ttl: StdDuration::from_secs(24 * 60 * 60),
            ca_subject: CaSubject {
                country: Some("US".to_string()),
                organization: Some("CITADEL".to_string()),
                common_name: None,
            },
            data_dir: self.dir.path().to_path_buf(),
            clock: self.clock.clone(),
            metrics: Arc::new(InMemoryMetrics::new()),
        })
    }
}

#[tokio::test]
async fn full_rotation_lifecycle() {
    let fixture = Fixture::new();
    let manager = fixture.manager();

    // Cold start: one self-signed CA and one JWT key become active, and
    // the bundle can already validate both.
    manager.initialize().await.unwrap();

    assert_eq!(fixture.sink.x509.lock().unwrap().len(), 1);
    assert_eq!(fixture.sink.jwt.lock().unwrap().len(), 1);

    let first_ca = fixture.sink.x509.lock().unwrap()[0].clone();
    assert_eq!(first_ca.not_after(), fixture.t0 + Duration::hours(24));
    assert_eq!(
        first_ca.certificate().not_before().unwrap(),
        fixture.t0 - Duration::seconds(10)
    );

    let bundle = fixture
        .datastore
        .fetch_bundle(TRUST_DOMAIN_ID)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bundle.root_cas.len(), 1);
    assert_eq!(bundle.jwt_signing_keys.len(), 1);

    // Half-life: the replacement is prepared and its root published while
    // the first generation stays active.
    fixture
        .clock
        .set(fixture.t0 + Duration::hours(12) + Duration::seconds(1));
    manager.rotate().await.unwrap();

    assert_eq!(fixture.sink.x509.lock().unwrap().len(), 1);
    let bundle = fixture
        .datastore
        .fetch_bundle(TRUST_DOMAIN_ID)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bundle.root_cas.len(), 2);
    assert_eq!(bundle.jwt_signing_keys.len(), 2);

    // Five-sixths of life: the prepared generation takes over.
    fixture
        .clock
        .set(fixture.t0 + Duration::hours(20) + Duration::seconds(1));
    manager.rotate().await.unwrap();

    assert_eq!(fixture.sink.x509.lock().unwrap().len(), 2);
    let second_ca = fixture.sink.x509.lock().unwrap()[1].clone();
    assert_ne!(second_ca.certificate().der(), first_ca.certificate().der());

    // Restart: the journal plus the key manager reproduce the same active
    // material without preparing anything new.
    drop(manager);
    let restarted = fixture.manager();
    restarted.initialize().await.unwrap();

    let recovered_ca = fixture.sink.x509.lock().unwrap().last().cloned().unwrap();
    assert_eq!(
        recovered_ca.certificate().der(),
        second_ca.certificate().der()
    );
    let jwt_kids: Vec<String> = fixture
        .sink
        .jwt
        .lock()
        .unwrap()
        .iter()
        .map(|key| key.kid().to_string())
        .collect();
    assert_eq!(jwt_kids.last(), Some(&jwt_kids[1]));
}

#[tokio::test(start_paused = true)]
async fn run_loops_until_shutdown() {
    let fixture = Fixture::new();
    let manager = Arc::new(fixture.manager());
    manager.initialize().await.unwrap();

    let handle = tokio::spawn(manager.clone().run());
    tokio::task::yield_now().await;
    manager.shutdown();

    handle.await.unwrap().unwrap();
}
