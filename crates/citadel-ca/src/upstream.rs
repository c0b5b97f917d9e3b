//! Optional upstream CA backend.
//!
//! When configured, the server submits a CSR for each freshly generated CA
//! key to an upstream CA instead of self-signing, making the server an
//! intermediate in the upstream PKI.

use crate::Result;
use async_trait::async_trait;

/// An external CA that signs this server's CA CSRs.
#[async_trait]
pub trait UpstreamCa: Send + Sync {
    /// Submits a DER-encoded CSR and returns the signed result.
    async fn submit_csr(&self, csr_der: &[u8]) -> Result<SubmitCsrResponse>;
}

/// The two response shapes upstream CAs produce.
#[derive(Debug, Clone)]
pub enum SubmitCsrResponse {
    /// A signed leaf chain plus an explicit trust bundle.
    Signed {
        /// DER certificates, leaf first.
        cert_chain: Vec<Vec<u8>>,
        /// DER root certificates relying parties should trust.
        bundle: Vec<Vec<u8>>,
    },
    /// The older shape: a single signed certificate plus the upstream's
    /// chain, whose topmost certificate is taken as the trust root.
    Legacy {
        /// The DER certificate signed from the CSR.
        cert: Vec<u8>,
        /// The upstream chain, intermediates first, root last.
        upstream_trust_bundle: Vec<Vec<u8>>,
    },
}
