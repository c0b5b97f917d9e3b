//! X.509 certificate handling for CA material.
//!
//! Certificates are carried as DER throughout the crate; parsing happens on
//! demand through `x509-parser` when a validity window, public key, or serial
//! is needed.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// An X.509 certificate held as DER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
}

impl Certificate {
    /// Creates a certificate from DER-encoded bytes.
    pub fn from_der(der: Vec<u8>) -> Self {
        Self { der }
    }

    /// Creates a certificate from PEM-encoded data.
    pub fn from_pem(pem_str: &str) -> Result<Self> {
        let parsed = pem::parse(pem_str)
            .map_err(|e| Error::Certificate(format!("failed to parse PEM: {e}")))?;
        Ok(Self {
            der: parsed.into_contents(),
        })
    }

    /// Returns the DER-encoded certificate.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Returns the PEM-encoded certificate.
    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.der.clone()))
    }

    /// Returns the certificate's not-after (expiry) time.
    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        let (_, cert) = x509_parser::parse_x509_certificate(&self.der)
            .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;

        let timestamp = cert.validity().not_after.timestamp();
        DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| Error::Certificate("invalid not_after timestamp".to_string()))
    }

    /// Returns the certificate's not-before time.
    pub fn not_before(&self) -> Result<DateTime<Utc>> {
        let (_, cert) = x509_parser::parse_x509_certificate(&self.der)
            .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;

        let timestamp = cert.validity().not_before.timestamp();
        DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| Error::Certificate("invalid not_before timestamp".to_string()))
    }

    /// Returns the DER-encoded SubjectPublicKeyInfo of the certificate.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        let (_, cert) = x509_parser::parse_x509_certificate(&self.der)
            .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;

        Ok(cert.public_key().raw.to_vec())
    }

    /// Returns the certificate serial number as a decimal string.
    pub fn serial(&self) -> Result<String> {
        let (_, cert) = x509_parser::parse_x509_certificate(&self.der)
            .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;

        Ok(cert.serial.to_string())
    }
}

/// Parses one or more concatenated DER certificates.
pub fn parse_der_chain(der: &[u8]) -> Result<Vec<Certificate>> {
    let mut certs = Vec::new();
    let mut remaining = der;

    while !remaining.is_empty() {
        let (rest, _) = X509Certificate::from_der(remaining)
            .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;
        let consumed = remaining.len() - rest.len();
        certs.push(Certificate::from_der(remaining[..consumed].to_vec()));
        remaining = rest;
    }

    Ok(certs)
}
