//! Shared fakes for module tests.

use crate::ca::{CaSetter, JwtKey, X509Ca};
use crate::cert::Certificate;
use crate::upstream::{SubmitCsrResponse, UpstreamCa};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, PublicKeyData, SignatureAlgorithm,
};
use std::sync::{Arc, Mutex};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;

/// Builds a throwaway self-signed CA certificate with the given validity.
pub(crate) fn make_ca_cert(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Certificate {
    let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
    let mut params = CertificateParams::new(vec![]).unwrap();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "citadel test CA");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.not_before = time::OffsetDateTime::from_unix_timestamp(not_before.timestamp()).unwrap();
    params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after.timestamp()).unwrap();
    let cert = params.self_signed(&key).unwrap();
    Certificate::from_der(cert.der().to_vec())
}

/// A `CaSetter` that records everything published to it.
#[derive(Default)]
pub(crate) struct RecordingCaSetter {
    pub x509: Mutex<Vec<Arc<X509Ca>>>,
    pub jwt: Mutex<Vec<Arc<JwtKey>>>,
}

impl RecordingCaSetter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn x509_count(&self) -> usize {
        self.x509.lock().unwrap().len()
    }

    pub fn jwt_count(&self) -> usize {
        self.jwt.lock().unwrap().len()
    }

    pub fn last_x509(&self) -> Option<Arc<X509Ca>> {
        self.x509.lock().unwrap().last().cloned()
    }

    pub fn last_jwt(&self) -> Option<Arc<JwtKey>> {
        self.jwt.lock().unwrap().last().cloned()
    }
}

impl CaSetter for RecordingCaSetter {
    fn set_x509_ca(&self, ca: Arc<X509Ca>) {
        self.x509.lock().unwrap().push(ca);
    }

    fn set_jwt_key(&self, key: Arc<JwtKey>) {
        self.jwt.lock().unwrap().push(key);
    }
}

/// Which response shape [`FakeUpstreamCa`] answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpstreamMode {
    Signed,
    Legacy,
}

/// An upstream CA with a two-level PKI (root -> intermediate) that signs
/// submitted CSRs under the intermediate.
pub(crate) struct FakeUpstreamCa {
    mode: UpstreamMode,
    intermediate_key: KeyPair,
    intermediate_params: CertificateParams,
    intermediate_der: Vec<u8>,
    root_der: Vec<u8>,
}

impl FakeUpstreamCa {
    pub fn new(mode: UpstreamMode) -> Self {
        let root_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).unwrap();
        let mut root_params = CertificateParams::new(vec![]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "fake upstream root");
        root_params.distinguished_name = dn;
        root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let root_cert = root_params.clone().self_signed(&root_key).unwrap();

        let intermediate_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).unwrap();
        let mut intermediate_params = CertificateParams::new(vec![]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "fake upstream intermediate");
        intermediate_params.distinguished_name = dn;
        intermediate_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let root_issuer = Issuer::from_params(&root_params, &root_key);
        let intermediate_cert = intermediate_params
            .clone()
            .signed_by(&intermediate_key, &root_issuer)
            .unwrap();

        Self {
            mode,
            intermediate_key,
            intermediate_params,
            intermediate_der: intermediate_cert.der().to_vec(),
            root_der: root_cert.der().to_vec(),
        }
    }

    pub fn root_der(&self) -> &[u8] {
        &self.root_der
    }

    pub fn intermediate_der(&self) -> &[u8] {
        &self.intermediate_der
    }

    fn sign_csr(&self, csr_der: &[u8]) -> Result<Vec<u8>> {
        let (_, csr) = X509CertificationRequest::from_der(csr_der)
            .map_err(|e| Error::UpstreamCa(format!("failed to parse CSR: {e}")))?;
        csr.verify_signature()
            .map_err(|e| Error::UpstreamCa(format!("CSR signature invalid: {e}")))?;
        let point = csr
            .certification_request_info
            .subject_pki
            .subject_public_key
            .data
            .to_vec();

        let mut params = CertificateParams::new(vec![]).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "citadel server CA");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let issuer = Issuer::from_params(&self.intermediate_params, &self.intermediate_key);
        let cert = params
            .signed_by(&CsrPublicKey { point }, &issuer)
            .map_err(|e| Error::UpstreamCa(format!("signing failed: {e}")))?;
        Ok(cert.der().to_vec())
    }
}

#[async_trait]
impl UpstreamCa for FakeUpstreamCa {
    async fn submit_csr(&self, csr_der: &[u8]) -> Result<SubmitCsrResponse> {
        let cert = self.sign_csr(csr_der)?;
        Ok(match self.mode {
            UpstreamMode::Signed => SubmitCsrResponse::Signed {
                cert_chain: vec![cert, self.intermediate_der.clone()],
                bundle: vec![self.root_der.clone()],
            },
            UpstreamMode::Legacy => SubmitCsrResponse::Legacy {
                cert,
                upstream_trust_bundle: vec![self.intermediate_der.clone(), self.root_der.clone()],
            },
        })
    }
}

struct CsrPublicKey {
    point: Vec<u8>,
}

impl PublicKeyData for CsrPublicKey {
    fn der_bytes(&self) -> &[u8] {
        &self.point
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        &rcgen::PKCS_ECDSA_P384_SHA384
    }
}
