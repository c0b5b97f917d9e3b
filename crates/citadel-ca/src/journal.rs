//! Append-only on-disk record of prepared CA and JWT key material.
//!
//! The journal is a recovery hint, not a source of truth: rotation keeps
//! going if an append fails, at the cost of regenerating material after a
//! crash. Every write replaces the file through a temporary sibling and a
//! rename so a crash can never leave a half-written journal behind.
//!
//! On disk the journal is a single PEM block whose body is the JSON
//! serialization of the entry lists, with DER and PKIX fields as base64
//! strings.

use crate::ca::{JwtKey, X509Ca};
use crate::slot::SlotId;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const JOURNAL_PEM_TAG: &str = "CITADEL CA JOURNAL";

/// One journaled X509 CA materialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct X509CaEntry {
    /// The slot the material was prepared into.
    pub slot_id: String,
    /// Issuance time as Unix seconds.
    pub issued_at: i64,
    /// The DER certificate chain, CA certificate first.
    #[serde(with = "b64_list")]
    pub chain: Vec<Vec<u8>>,
    /// Whether the chain participates in an upstream PKI.
    #[serde(default)]
    pub is_intermediate: bool,
}

/// One journaled JWT key materialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtKeyEntry {
    /// The slot the material was prepared into.
    pub slot_id: String,
    /// Issuance time as Unix seconds.
    pub issued_at: i64,
    /// Expiration as Unix seconds.
    pub not_after: i64,
    /// The key id issued credentials reference.
    pub kid: String,
    /// PKIX (SubjectPublicKeyInfo) DER encoding of the public key.
    #[serde(with = "b64")]
    pub public_key: Vec<u8>,
}

/// The ordered per-kind entry histories.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JournalEntries {
    /// X509 CA entries, oldest first.
    #[serde(default)]
    pub x509_cas: Vec<X509CaEntry>,
    /// JWT key entries, oldest first.
    #[serde(default)]
    pub jwt_keys: Vec<JwtKeyEntry>,
}

/// The on-disk journal.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    entries: JournalEntries,
}

impl Journal {
    /// Loads the journal at `path`. A missing file yields an empty journal;
    /// an unreadable or malformed file is an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        // A stray temp file means a previous replace was interrupted after
        // the write but before the rename; the target is still the last
        // consistent state.
        let tmp = tmp_path(&path);
        if tmp.exists() {
            debug!("removing stray journal temp file {}", tmp.display());
            let _ = fs::remove_file(&tmp);
        }

        if !path.exists() {
            return Ok(Self {
                path,
                entries: JournalEntries::default(),
            });
        }

        let raw = fs::read(&path)?;
        let block = pem::parse(&raw)
            .map_err(|e| Error::Journal(format!("malformed journal file: {e}")))?;
        if block.tag() != JOURNAL_PEM_TAG {
            return Err(Error::Journal(format!(
                "unexpected journal PEM tag {:?}",
                block.tag()
            )));
        }
        let entries = serde_json::from_slice(block.contents())
            .map_err(|e| Error::Journal(format!("malformed journal entries: {e}")))?;

        Ok(Self { path, entries })
    }

    /// The path the journal persists to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The entries as loaded plus anything appended since.
    pub fn entries(&self) -> &JournalEntries {
        &self.entries
    }

    /// Records an X509 CA materialization and persists the journal.
    pub fn append_x509_ca(
        &mut self,
        slot_id: SlotId,
        issued_at: DateTime<Utc>,
        x509_ca: &X509Ca,
    ) -> Result<()> {
        self.entries.x509_cas.push(X509CaEntry {
            slot_id: slot_id.as_str().to_string(),
            issued_at: issued_at.timestamp(),
            chain: x509_ca.chain().iter().map(|c| c.der().to_vec()).collect(),
            is_intermediate: x509_ca.is_intermediate(),
        });
        self.save()
    }

    /// Records a JWT key materialization and persists the journal.
    pub fn append_jwt_key(
        &mut self,
        slot_id: SlotId,
        issued_at: DateTime<Utc>,
        jwt_key: &JwtKey,
    ) -> Result<()> {
        self.entries.jwt_keys.push(JwtKeyEntry {
            slot_id: slot_id.as_str().to_string(),
            issued_at: issued_at.timestamp(),
            not_after: jwt_key.not_after().timestamp(),
            kid: jwt_key.kid().to_string(),
            public_key: jwt_key.signer().public_key_der().to_vec(),
        });
        self.save()
    }

    fn save(&self) -> Result<()> {
        let json = serde_json::to_vec(&self.entries)
            .map_err(|e| Error::Journal(format!("failed to serialize journal: {e}")))?;
        let encoded = pem::encode(&pem::Pem::new(JOURNAL_PEM_TAG, json));

        let tmp = tmp_path(&self.path);
        fs::write(&tmp, encoded.as_bytes())?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Translates a legacy `certs.json` file into a journal, once.
///
/// The legacy file only seeds a journal that does not exist yet; it is
/// removed either way, so rerunning is a no-op. Returns whether a legacy
/// file was handled.
pub fn migrate_legacy_json(json_path: &Path, journal_path: &Path) -> Result<bool> {
    if !json_path.exists() {
        return Ok(false);
    }

    if !journal_path.exists() {
        let raw = fs::read(json_path)?;
        let legacy: LegacyCertsFile = serde_json::from_slice(&raw)
            .map_err(|e| Error::Journal(format!("failed to parse legacy certs file: {e}")))?;
        let journal = Journal {
            path: journal_path.to_path_buf(),
            entries: JournalEntries {
                x509_cas: legacy.x509_cas,
                jwt_keys: legacy.jwt_keys,
            },
        };
        journal.save()?;
    }

    fs::remove_file(json_path)?;
    Ok(true)
}

/// The pre-journal on-disk format: the same entry lists as plain JSON.
#[derive(Debug, Deserialize)]
struct LegacyCertsFile {
    #[serde(default)]
    x509_cas: Vec<X509CaEntry>,
    #[serde(default)]
    jwt_keys: Vec<JwtKeyEntry>,
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod b64_list {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(list: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(list.iter().map(|bytes| STANDARD.encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        let encoded = Vec::<String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|item| STANDARD.decode(item.as_bytes()).map_err(serde::de::Error::custom))
            .collect()
    }
}
