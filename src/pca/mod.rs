//! ACM Private CA signing
//!
//! - [`signing`] holds the pure request-to-call mapping (template, token,
//!   validity, chain splitting)
//! - [`client`] implements [`PcaApi`] with the AWS SDK
//! - [`provisioner`] binds a client to one CA and drives sign / fetch
//! - [`cache`] memoizes provisioners per issuer

pub mod cache;
pub mod client;
pub mod provisioner;
pub mod signing;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

pub use cache::ProvisionerCache;
pub use client::AwsPcaClient;
pub use provisioner::{Provisioner, SignRequest};

/// Errors returned by CA calls
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PcaError {
    /// The CA accepted the request but has not finished issuing
    #[error("certificate {certificate_arn} is still being issued")]
    StillIssuing {
        /// ARN returned by the earlier IssueCertificate call
        certificate_arn: String,
    },

    /// The CA throttled the call or it timed out
    #[error("CA call throttled: {0}")]
    Throttled(String),

    /// The CA rejected the request; repeating it will not help
    #[error("CA rejected request: {0}")]
    Rejected(String),

    /// Any other API failure
    #[error("CA API error: {0}")]
    Api(String),

    /// The CA answered with something that could not be used
    #[error("invalid CA response: {0}")]
    InvalidResponse(String),
}

impl PcaError {
    /// Whether this condition clears on its own and must never become terminal
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StillIssuing { .. } | Self::Throttled(_))
    }

    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Input of a single IssueCertificate call
#[derive(Clone, Debug, PartialEq)]
pub struct IssueCertificateInput {
    /// CA ARN
    pub ca_arn: String,
    /// PEM encoded CSR
    pub csr: Vec<u8>,
    /// Signing algorithm reported by the CA
    pub signing_algorithm: String,
    /// Template ARN from [`signing::select_template`]
    pub template_arn: String,
    /// Absolute expiry of the certificate
    pub not_after: DateTime<Utc>,
    /// Idempotency token from [`signing::idempotency_token`]
    pub idempotency_token: String,
}

/// Certificate and chain as returned by GetCertificate
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertificateBundle {
    /// Issued certificate, PEM encoded
    pub certificate: String,
    /// Intermediates followed by the root, PEM encoded
    pub certificate_chain: Option<String>,
}

/// Issued certificate split for cert-manager
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedPem {
    /// Leaf followed by intermediates
    pub chain: String,
    /// Trust anchor
    pub ca: String,
}

/// ACM PCA operations used by the issuer
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PcaApi: Send + Sync {
    /// Signing algorithm configured on the CA (DescribeCertificateAuthority)
    async fn describe_signing_algorithm(&self, ca_arn: &str) -> Result<String, PcaError>;

    /// Submit a CSR and return the certificate ARN (IssueCertificate)
    async fn issue_certificate(&self, input: IssueCertificateInput) -> Result<String, PcaError>;

    /// Fetch an issued certificate (GetCertificate)
    async fn get_certificate(
        &self,
        ca_arn: &str,
        certificate_arn: &str,
    ) -> Result<CertificateBundle, PcaError>;
}
