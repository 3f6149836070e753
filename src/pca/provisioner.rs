//! Provisioner: a live signing client bound to one CA

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::signing::{compute_validity, idempotency_token, select_template, split_chain};
use super::{IssueCertificateInput, IssuedPem, PcaApi, PcaError};

/// Attributes of a certificate request needed to sign it
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SignRequest {
    /// Request namespace
    pub namespace: String,
    /// Request name
    pub name: String,
    /// PEM encoded CSR
    pub csr: Vec<u8>,
    /// Requested validity; the default applies when `None`
    pub duration: Option<Duration>,
    /// Requested key usages
    pub usages: Vec<String>,
    /// Whether a CA certificate is requested
    pub is_ca: bool,
}

/// Signing client for one CA ARN
///
/// The signing algorithm is looked up once per provisioner and kept for its
/// lifetime. Two racing first calls may both describe the CA; only the first
/// value is kept.
pub struct Provisioner {
    ca_arn: String,
    client: Arc<dyn PcaApi>,
    signing_algorithm: OnceLock<String>,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("ca_arn", &self.ca_arn)
            .field("signing_algorithm", &self.signing_algorithm.get())
            .finish()
    }
}

impl Provisioner {
    /// Create a provisioner for `ca_arn`
    pub fn new(ca_arn: impl Into<String>, client: Arc<dyn PcaApi>) -> Self {
        Self {
            ca_arn: ca_arn.into(),
            client,
            signing_algorithm: OnceLock::new(),
        }
    }

    /// CA ARN this provisioner signs with
    pub fn ca_arn(&self) -> &str {
        &self.ca_arn
    }

    async fn signing_algorithm(&self) -> Result<&str, PcaError> {
        if let Some(algorithm) = self.signing_algorithm.get() {
            return Ok(algorithm);
        }
        let algorithm = self.client.describe_signing_algorithm(&self.ca_arn).await?;
        debug!(ca = %self.ca_arn, %algorithm, "resolved CA signing algorithm");
        Ok(self.signing_algorithm.get_or_init(|| algorithm))
    }

    /// Submit the request to the CA and return the certificate ARN
    ///
    /// Returns as soon as the CA accepted the request; the certificate is
    /// collected later with [`Provisioner::fetch_issued`].
    pub async fn sign(&self, request: &SignRequest, now: DateTime<Utc>) -> Result<String, PcaError> {
        let signing_algorithm = self.signing_algorithm().await?.to_string();
        let input = IssueCertificateInput {
            ca_arn: self.ca_arn.clone(),
            csr: request.csr.clone(),
            signing_algorithm,
            template_arn: select_template(&self.ca_arn, &request.usages, request.is_ca),
            not_after: compute_validity(now, request.duration)?,
            idempotency_token: idempotency_token(&request.namespace, &request.name),
        };

        let certificate_arn = self.client.issue_certificate(input).await?;
        info!(
            ca = %self.ca_arn,
            certificate_arn = %certificate_arn,
            "certificate issuance requested"
        );
        Ok(certificate_arn)
    }

    /// Fetch a certificate requested by [`Provisioner::sign`]
    ///
    /// Fails with [`PcaError::StillIssuing`] until the CA is done, and with
    /// [`PcaError::InvalidResponse`] when the CA returns no chain to split
    /// the trust anchor from.
    pub async fn fetch_issued(&self, certificate_arn: &str) -> Result<IssuedPem, PcaError> {
        let bundle = self
            .client
            .get_certificate(&self.ca_arn, certificate_arn)
            .await?;

        let mut full = bundle.certificate;
        if let Some(chain) = bundle.certificate_chain.filter(|c| !c.is_empty()) {
            full.push('\n');
            full.push_str(&chain);
        }
        let (chain, ca) = split_chain(&full)?;
        if chain.is_empty() {
            return Err(PcaError::InvalidResponse(format!(
                "no certificate chain returned for {certificate_arn}"
            )));
        }
        Ok(IssuedPem { chain, ca })
    }
}
