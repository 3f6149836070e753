//! [`PcaApi`] backed by the AWS SDK

use async_trait::async_trait;
use aws_sdk_acmpca::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_acmpca::primitives::Blob;
use aws_sdk_acmpca::types::{SigningAlgorithm, Validity, ValidityPeriodType};
use tracing::debug;

use super::{CertificateBundle, IssueCertificateInput, PcaApi, PcaError};

const REQUEST_IN_PROGRESS: &str = "RequestInProgressException";

/// ACM PCA client for one resolved AWS configuration
#[derive(Clone, Debug)]
pub struct AwsPcaClient {
    client: aws_sdk_acmpca::Client,
}

impl AwsPcaClient {
    /// Create a client from a loaded SDK configuration
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_acmpca::Client::new(config),
        }
    }
}

/// Map an AWS error code onto [`PcaError`]
pub fn classify_error_code(code: Option<&str>, message: String) -> PcaError {
    match code {
        Some(
            "ThrottlingException"
            | "TooManyRequestsException"
            | "RequestFailedException"
            | "RequestTimeout"
            | "RequestTimeoutException",
        ) => PcaError::Throttled(message),
        Some(
            "MalformedCSRException"
            | "InvalidArgsException"
            | "InvalidArnException"
            | "InvalidStateException"
            | "InvalidRequestException"
            | "ResourceNotFoundException"
            | "LimitExceededException",
        ) => PcaError::Rejected(message),
        _ => PcaError::Api(message),
    }
}

fn classify<E, R>(err: SdkError<E, R>) -> PcaError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => PcaError::Throttled(message),
        _ => classify_error_code(err.code(), message),
    }
}

#[async_trait]
impl PcaApi for AwsPcaClient {
    async fn describe_signing_algorithm(&self, ca_arn: &str) -> Result<String, PcaError> {
        let output = self
            .client
            .describe_certificate_authority()
            .certificate_authority_arn(ca_arn)
            .send()
            .await
            .map_err(classify)?;

        let config = output
            .certificate_authority()
            .and_then(|ca| ca.certificate_authority_configuration())
            .ok_or_else(|| {
                PcaError::InvalidResponse(format!("no configuration returned for {ca_arn}"))
            })?;
        Ok(config.signing_algorithm().as_str().to_string())
    }

    async fn issue_certificate(&self, input: IssueCertificateInput) -> Result<String, PcaError> {
        let validity = Validity::builder()
            .r#type(ValidityPeriodType::Absolute)
            .value(input.not_after.timestamp())
            .build()
            .map_err(|e| PcaError::Rejected(e.to_string()))?;

        debug!(
            template = %input.template_arn,
            not_after = %input.not_after,
            "calling IssueCertificate"
        );
        let output = self
            .client
            .issue_certificate()
            .certificate_authority_arn(&input.ca_arn)
            .csr(Blob::new(input.csr))
            .signing_algorithm(SigningAlgorithm::from(input.signing_algorithm.as_str()))
            .template_arn(&input.template_arn)
            .validity(validity)
            .idempotency_token(&input.idempotency_token)
            .send()
            .await
            .map_err(classify)?;

        output
            .certificate_arn()
            .map(str::to_string)
            .ok_or_else(|| PcaError::InvalidResponse("no certificate ARN returned".to_string()))
    }

    async fn get_certificate(
        &self,
        ca_arn: &str,
        certificate_arn: &str,
    ) -> Result<CertificateBundle, PcaError> {
        let output = self
            .client
            .get_certificate()
            .certificate_authority_arn(ca_arn)
            .certificate_arn(certificate_arn)
            .send()
            .await
            .map_err(|err| {
                if err.code() == Some(REQUEST_IN_PROGRESS) {
                    PcaError::StillIssuing {
                        certificate_arn: certificate_arn.to_string(),
                    }
                } else {
                    classify(err)
                }
            })?;

        let certificate = output
            .certificate()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| PcaError::InvalidResponse("no certificate returned".to_string()))?;
        Ok(CertificateBundle {
            certificate: certificate.to_string(),
            certificate_chain: output.certificate_chain().map(str::to_string),
        })
    }
}
