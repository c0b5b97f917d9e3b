//! Pluggable signing key backend.
//!
//! The key manager owns the private halves of the CA and JWT signing keys.
//! Keys are addressed by deterministic ids derived from the slot that uses
//! them (`x509-CA-A`, `JWT-Signer-B`, ...), which lets a restarted server
//! recover its keys without persisting opaque handles.
//!
//! [`KeyManager::generate_key`] and [`KeyManager::get_key`] are async
//! because backends are typically remote; the returned [`KeySigner`] handle
//! signs synchronously, the way TLS signing keys do.

use crate::{Error, Result};
use async_trait::async_trait;
use rcgen::{PublicKeyData, SignatureAlgorithm, SigningKey};
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, KeyPair as _};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// The key algorithms the manager requests from a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// ECDSA over P-256 (JWT signing keys).
    EcP256,
    /// ECDSA over P-384 (X509 CA keys).
    EcP384,
}

/// A handle to a private key held by a key manager backend.
///
/// The handle exposes the public half and signs messages with the private
/// half without ever surfacing it.
pub trait KeySigner: Send + Sync {
    /// The algorithm of the underlying key.
    fn key_type(&self) -> KeyType;

    /// The public key as an uncompressed EC point.
    fn public_key(&self) -> &[u8];

    /// Signs `message`, returning a DER-encoded ECDSA signature.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
}

/// A private key backend.
#[async_trait]
pub trait KeyManager: Send + Sync {
    /// Creates a key under `key_id`, replacing any existing key with that id.
    async fn generate_key(&self, key_id: &str, key_type: KeyType) -> Result<Arc<dyn KeySigner>>;

    /// Returns the key under `key_id`, or `None` if no such key exists.
    async fn get_key(&self, key_id: &str) -> Result<Option<Arc<dyn KeySigner>>>;
}

/// A signer bound to a specific key manager key id.
///
/// Binds the backend handle to the id it was generated under and caches the
/// PKIX-encoded public key, which is what the journal and the trust bundle
/// store.
#[derive(Clone)]
pub struct Signer {
    key_id: String,
    key: Arc<dyn KeySigner>,
    public_key_der: Vec<u8>,
}

impl Signer {
    /// Creates a signer for the key manager key `key_id`.
    pub fn new(key_id: impl Into<String>, key: Arc<dyn KeySigner>) -> Self {
        let public_key_der = spki_from_point(key.key_type(), key.public_key());
        Self {
            key_id: key_id.into(),
            key,
            public_key_der,
        }
    }

    /// The key manager key id this signer is bound to.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// The algorithm of the underlying key.
    pub fn key_type(&self) -> KeyType {
        self.key.key_type()
    }

    /// The PKIX (SubjectPublicKeyInfo) DER encoding of the public key.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }
}

impl PublicKeyData for Signer {
    fn der_bytes(&self) -> &[u8] {
        self.key.public_key()
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        match self.key.key_type() {
            KeyType::EcP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            KeyType::EcP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
        }
    }
}

impl SigningKey for Signer {
    fn sign(&self, msg: &[u8]) -> std::result::Result<Vec<u8>, rcgen::Error> {
        self.key.sign(msg).map_err(|_| rcgen::Error::RemoteKeyError)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("key_id", &self.key_id)
            .field("key_type", &self.key.key_type())
            .finish()
    }
}

// SubjectPublicKeyInfo headers for the supported curves: a SEQUENCE of
// (id-ecPublicKey, named curve) followed by the BIT STRING header for the
// uncompressed point (65 bytes for P-256, 97 for P-384).
const SPKI_HEADER_P256: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08,
    0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];
const SPKI_HEADER_P384: [u8; 23] = [
    0x30, 0x76, 0x30, 0x10, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x05,
    0x2b, 0x81, 0x04, 0x00, 0x22, 0x03, 0x62, 0x00,
];

/// PKIX-encodes an uncompressed EC point.
fn spki_from_point(key_type: KeyType, point: &[u8]) -> Vec<u8> {
    let header: &[u8] = match key_type {
        KeyType::EcP256 => &SPKI_HEADER_P256,
        KeyType::EcP384 => &SPKI_HEADER_P384,
    };
    let mut spki = Vec::with_capacity(header.len() + point.len());
    spki.extend_from_slice(header);
    spki.extend_from_slice(point);
    spki
}

/// An in-memory key manager.
///
/// Keys live for the lifetime of the process; a restart loses them, which
/// recovery treats the same as any other missing backend key.
#[derive(Default)]
pub struct InMemoryKeyManager {
    keys: RwLock<HashMap<String, Arc<InMemoryKey>>>,
}

struct InMemoryKey {
    key_type: KeyType,
    key_pair: EcdsaKeyPair,
    public_key: Vec<u8>,
    rng: SystemRandom,
}

impl InMemoryKey {
    fn generate(key_type: KeyType) -> Result<Self> {
        let alg = match key_type {
            KeyType::EcP256 => &signature::ECDSA_P256_SHA256_ASN1_SIGNING,
            KeyType::EcP384 => &signature::ECDSA_P384_SHA384_ASN1_SIGNING,
        };
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(alg, &rng)
            .map_err(|e| Error::KeyManager(format!("key generation failed: {e}")))?;
        let key_pair = EcdsaKeyPair::from_pkcs8(alg, pkcs8.as_ref(), &rng)
            .map_err(|e| Error::KeyManager(format!("failed to load generated key: {e}")))?;
        let public_key = key_pair.public_key().as_ref().to_vec();

        Ok(Self {
            key_type,
            key_pair,
            public_key,
            rng,
        })
    }
}

impl KeySigner for InMemoryKey {
    fn key_type(&self) -> KeyType {
        self.key_type
    }

    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let sig = self
            .key_pair
            .sign(&self.rng, message)
            .map_err(|e| Error::KeyManager(format!("signing failed: {e}")))?;
        Ok(sig.as_ref().to_vec())
    }
}

impl InMemoryKeyManager {
    /// Creates an empty key manager.
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for InMemoryKeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.keys.read().map(|k| k.len()).unwrap_or(0);
        f.debug_struct("InMemoryKeyManager")
            .field("keys", &count)
            .finish()
    }
}

#[async_trait]
impl KeyManager for InMemoryKeyManager {
    async fn generate_key(&self, key_id: &str, key_type: KeyType) -> Result<Arc<dyn KeySigner>> {
        let key = Arc::new(InMemoryKey::generate(key_type)?);
        let mut keys = self
            .keys
            .write()
            .map_err(|_| Error::KeyManager("key store lock poisoned".to_string()))?;
        keys.insert(key_id.to_string(), key.clone());
        Ok(key)
    }

    async fn get_key(&self, key_id: &str) -> Result<Option<Arc<dyn KeySigner>>> {
        let keys = self
            .keys
            .read()
            .map_err(|_| Error::KeyManager("key store lock poisoned".to_string()))?;
        Ok(keys.get(key_id).map(|k| k.clone() as Arc<dyn KeySigner>))
    }
}
