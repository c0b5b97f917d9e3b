//! The CA and JWT key material types and the activation sink.

use crate::cert::Certificate;
use crate::datastore::JwtSigningKey;
use crate::keymanager::Signer;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;

/// One generation of the X.509 signing CA.
#[derive(Debug, Clone)]
pub struct X509Ca {
    /// Signs issued certificates through the key manager.
    signer: Signer,
    /// The CA certificate first, then intermediates up to (excluding) the
    /// upstream trust root.
    chain: Vec<Certificate>,
    /// Whether the chain participates in an upstream PKI.
    is_intermediate: bool,
    not_after: DateTime<Utc>,
}

impl X509Ca {
    /// Creates CA material from a signer and a non-empty certificate chain.
    pub fn new(signer: Signer, chain: Vec<Certificate>, is_intermediate: bool) -> Result<Self> {
        let leaf = chain
            .first()
            .ok_or_else(|| Error::Certificate("empty CA certificate chain".to_string()))?;
        let not_after = leaf.not_after()?;

        Ok(Self {
            signer,
            chain,
            is_intermediate,
            not_after,
        })
    }

    /// The signer for this CA's private key.
    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// The certificate chain, CA certificate first.
    pub fn chain(&self) -> &[Certificate] {
        &self.chain
    }

    /// The CA certificate itself.
    pub fn certificate(&self) -> &Certificate {
        &self.chain[0]
    }

    /// Whether this CA is an intermediate of an upstream PKI.
    pub fn is_intermediate(&self) -> bool {
        self.is_intermediate
    }

    /// Expiry of the CA certificate.
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }
}

/// One generation of the JWT signing key.
#[derive(Debug, Clone)]
pub struct JwtKey {
    signer: Signer,
    kid: String,
    not_after: DateTime<Utc>,
}

impl JwtKey {
    /// Creates JWT key material with a freshly generated kid.
    pub fn new(signer: Signer, not_after: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            signer,
            kid: new_kid()?,
            not_after,
        })
    }

    /// Creates JWT key material with a known kid (journal recovery).
    pub fn with_kid(signer: Signer, kid: impl Into<String>, not_after: DateTime<Utc>) -> Self {
        Self {
            signer,
            kid: kid.into(),
            not_after,
        }
    }

    /// The signer for this key.
    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// The key id issued credentials reference.
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Expiry of this key.
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// The trust-bundle entry for this key.
    pub fn to_bundle_key(&self) -> JwtSigningKey {
        JwtSigningKey {
            pkix_bytes: self.signer.public_key_der().to_vec(),
            kid: self.kid.clone(),
            not_after: self.not_after.timestamp(),
        }
    }
}

/// The sink the manager publishes activated material to.
///
/// Called exactly once per activation. Implementations swap the material
/// into whatever serves issuance; they must not fail.
pub trait CaSetter: Send + Sync {
    /// Publishes a newly activated X509 CA.
    fn set_x509_ca(&self, ca: Arc<X509Ca>);

    /// Publishes a newly activated JWT key.
    fn set_jwt_key(&self, key: Arc<JwtKey>);
}

const KID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const KID_LEN: usize = 32;

/// Draws a fresh 32-character alphanumeric key id.
fn new_kid() -> Result<String> {
    let rng = SystemRandom::new();
    let mut choices = [0u8; KID_LEN];
    rng.fill(&mut choices)
        .map_err(|_| Error::Internal("system random failed".to_string()))?;
    Ok(kid_from_bytes(&choices))
}

fn kid_from_bytes(choices: &[u8]) -> String {
    choices
        .iter()
        .map(|&choice| KID_ALPHABET[choice as usize % KID_ALPHABET.len()] as char)
        .collect()
}
