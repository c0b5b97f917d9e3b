//! CA certificate signing: CSR generation, self-signing, upstream signing.
//!
//! A freshly generated CA key is turned into CA material one of two ways.
//! Without an upstream CA the server self-signs a root. With one, the
//! server submits a CSR and becomes an intermediate of the upstream PKI,
//! unless `upstream_bundle` is off, in which case the signed chain is
//! truncated back to the server's own certificate and the server stays
//! self-rooted from the trust bundle's point of view.

use crate::ca::X509Ca;
use crate::cert::{parse_der_chain, Certificate};
use crate::keymanager::Signer;
use crate::upstream::{SubmitCsrResponse, UpstreamCa};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyUsagePurpose, SanType,
    SerialNumber,
};
use time::OffsetDateTime;

/// The configurable subject of the server's CA certificates.
#[derive(Debug, Clone, Default)]
pub struct CaSubject {
    /// Subject country (C).
    pub country: Option<String>,
    /// Subject organization (O).
    pub organization: Option<String>,
    /// Subject common name (CN).
    pub common_name: Option<String>,
}

impl CaSubject {
    fn distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        if let Some(ref country) = self.country {
            dn.push(DnType::CountryName, country.clone());
        }
        if let Some(ref organization) = self.organization {
            dn.push(DnType::OrganizationName, organization.clone());
        }
        if let Some(ref common_name) = self.common_name {
            dn.push(DnType::CommonName, common_name.clone());
        }
        dn
    }
}

/// Generates the DER-encoded CSR for a server CA certificate.
///
/// The CSR carries the configured subject and a single URI SAN of the form
/// `spiffe://<trust-domain>`.
pub(crate) fn generate_server_ca_csr(
    signer: &Signer,
    trust_domain: &str,
    subject: &CaSubject,
) -> Result<Vec<u8>> {
    let mut params = CertificateParams::new(vec![])
        .map_err(|e| Error::CsrGeneration(format!("failed to create params: {e}")))?;

    params.distinguished_name = subject.distinguished_name();
    params.subject_alt_names = vec![trust_domain_san(trust_domain)?];

    let csr = params
        .serialize_request(signer)
        .map_err(|e| Error::CsrGeneration(format!("CSR serialization failed: {e}")))?;

    Ok(csr.der().as_ref().to_vec())
}

/// Self-signs a server CA certificate with the CA's own key.
pub(crate) fn self_sign_server_ca(
    signer: &Signer,
    trust_domain: &str,
    subject: &CaSubject,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> Result<Certificate> {
    let mut params = CertificateParams::new(vec![])
        .map_err(|e| Error::CaSigning(format!("failed to create params: {e}")))?;

    params.distinguished_name = subject.distinguished_name();
    params.subject_alt_names = vec![trust_domain_san(trust_domain)?];
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.serial_number = Some(SerialNumber::from(vec![0u8]));
    params.not_before = to_offset(not_before)?;
    params.not_after = to_offset(not_after)?;

    let cert = params
        .self_signed(signer)
        .map_err(|e| Error::CaSigning(format!("self-signing failed: {e}")))?;

    Ok(Certificate::from_der(cert.der().to_vec()))
}

/// Produces CA material and its trust-bundle roots, either self-signed or
/// signed by the upstream CA.
pub(crate) async fn sign_x509_ca(
    signer: Signer,
    upstream_ca: Option<&dyn UpstreamCa>,
    upstream_bundle: bool,
    trust_domain: &str,
    subject: &CaSubject,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> Result<(X509Ca, Vec<Certificate>)> {
    match upstream_ca {
        Some(upstream) => {
            let (mut chain, mut trust_bundle) =
                upstream_sign_server_ca(upstream, &signer, trust_domain, subject).await?;
            let is_intermediate = upstream_bundle;
            if !is_intermediate {
                // The operator opted out of joining the upstream PKI: keep
                // only the server's own certificate and root trust in it, as
                // if the upstream were not configured.
                chain.truncate(1);
                trust_bundle = chain.clone();
            }
            let ca = X509Ca::new(signer, chain, is_intermediate)?;
            Ok((ca, trust_bundle))
        }
        None => {
            let cert = self_sign_server_ca(&signer, trust_domain, subject, not_before, not_after)?;
            let chain = vec![cert];
            let trust_bundle = chain.clone();
            let ca = X509Ca::new(signer, chain, false)?;
            Ok((ca, trust_bundle))
        }
    }
}

/// Submits a CSR to the upstream CA and normalizes the response into
/// `(chain, trust_bundle)`.
async fn upstream_sign_server_ca(
    upstream: &dyn UpstreamCa,
    signer: &Signer,
    trust_domain: &str,
    subject: &CaSubject,
) -> Result<(Vec<Certificate>, Vec<Certificate>)> {
    let csr = generate_server_ca_csr(signer, trust_domain, subject)?;
    let response = upstream.submit_csr(&csr).await?;
    normalize_upstream_response(response)
}

fn normalize_upstream_response(
    response: SubmitCsrResponse,
) -> Result<(Vec<Certificate>, Vec<Certificate>)> {
    match response {
        SubmitCsrResponse::Signed { cert_chain, bundle } => {
            let chain = parse_cert_list(&cert_chain)?;
            let trust_bundle = parse_cert_list(&bundle)?;
            Ok((chain, trust_bundle))
        }
        SubmitCsrResponse::Legacy {
            cert,
            upstream_trust_bundle,
        } => {
            let mut chain = parse_der_chain(&cert)?;
            let mut trust_bundle = parse_cert_list(&upstream_trust_bundle)?;
            match trust_bundle.len() {
                0 => Err(Error::UpstreamCa(
                    "upstream CA returned an empty trust bundle".to_string(),
                )),
                1 => Ok((chain, trust_bundle)),
                n => {
                    // The upstream chain carries intermediates first and the
                    // root last; only the root belongs in the trust bundle.
                    chain.extend(trust_bundle.drain(..n - 1));
                    Ok((chain, trust_bundle))
                }
            }
        }
    }
}

fn parse_cert_list(ders: &[Vec<u8>]) -> Result<Vec<Certificate>> {
    let mut certs = Vec::new();
    for der in ders {
        certs.extend(parse_der_chain(der)?);
    }
    Ok(certs)
}

fn trust_domain_san(trust_domain: &str) -> Result<SanType> {
    let uri = rcgen::string::Ia5String::try_from(format!("spiffe://{trust_domain}"))
        .map_err(|e| Error::CaSigning(format!("invalid SAN URI: {e}")))?;
    Ok(SanType::URI(uri))
}

fn to_offset(at: DateTime<Utc>) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| Error::CaSigning(format!("invalid certificate validity time: {e}")))
}
