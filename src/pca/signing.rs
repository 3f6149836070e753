//! Pure mapping from a certificate request to an IssueCertificate call

use std::time::Duration;

use aws_lc_rs::digest::{digest, SHA256};
use chrono::{DateTime, Utc};
use pem::{EncodeConfig, LineEnding};

use super::PcaError;

/// cert-manager usage for TLS client authentication
pub const USAGE_CLIENT_AUTH: &str = "client auth";
/// cert-manager usage for TLS server authentication
pub const USAGE_SERVER_AUTH: &str = "server auth";
/// cert-manager usage for code signing
pub const USAGE_CODE_SIGNING: &str = "code signing";
/// cert-manager usage for OCSP response signing
pub const USAGE_OCSP_SIGNING: &str = "ocsp signing";

/// Validity used when a request does not ask for one
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Maximum length ACM PCA accepts for an idempotency token
pub const IDEMPOTENCY_TOKEN_LEN: usize = 36;

const TEMPLATE_SUBORDINATE_CA: &str = "SubordinateCACertificate_PathLen0/V1";
const TEMPLATE_CLIENT_AUTH: &str = "EndEntityClientAuthCertificate/V1";
const TEMPLATE_SERVER_AUTH: &str = "EndEntityServerAuthCertificate/V1";
const TEMPLATE_CODE_SIGNING: &str = "CodeSigningCertificate/V1";
const TEMPLATE_OCSP_SIGNING: &str = "OCSPSigningCertificate/V1";
const TEMPLATE_END_ENTITY: &str = "EndEntityCertificate/V1";
const TEMPLATE_PASSTHROUGH: &str = "BlankEndEntityCertificate_APICSRPassthrough/V1";

/// `arn:<partition>:` prefix of an ARN, `arn:aws:` if it cannot be found
fn arn_prefix(ca_arn: &str) -> &str {
    ca_arn
        .match_indices(':')
        .nth(1)
        .map(|(idx, _)| &ca_arn[..=idx])
        .unwrap_or("arn:aws:")
}

/// Template ARN for a request
///
/// The CA ARN's partition is kept so the template resolves in the CA's own
/// partition (aws, aws-us-gov, aws-cn, ...).
pub fn select_template(ca_arn: &str, usages: &[String], is_ca: bool) -> String {
    let name = if is_ca {
        TEMPLATE_SUBORDINATE_CA
    } else {
        match usages {
            [usage] => match usage.as_str() {
                USAGE_CLIENT_AUTH => TEMPLATE_CLIENT_AUTH,
                USAGE_SERVER_AUTH => TEMPLATE_SERVER_AUTH,
                USAGE_CODE_SIGNING => TEMPLATE_CODE_SIGNING,
                USAGE_OCSP_SIGNING => TEMPLATE_OCSP_SIGNING,
                _ => TEMPLATE_PASSTHROUGH,
            },
            [a, b] if is_client_server_pair(a, b) => TEMPLATE_END_ENTITY,
            _ => TEMPLATE_PASSTHROUGH,
        }
    };
    format!("{}acm-pca:::template/{name}", arn_prefix(ca_arn))
}

fn is_client_server_pair(a: &str, b: &str) -> bool {
    (a == USAGE_CLIENT_AUTH && b == USAGE_SERVER_AUTH)
        || (a == USAGE_SERVER_AUTH && b == USAGE_CLIENT_AUTH)
}

/// Deterministic token for `namespace/name`
///
/// Lowercase hex SHA-256, truncated to [`IDEMPOTENCY_TOKEN_LEN`].
pub fn idempotency_token(namespace: &str, name: &str) -> String {
    let hash = digest(&SHA256, format!("{namespace}/{name}").as_bytes());
    let mut token: String = hash.as_ref().iter().map(|b| format!("{:02x}", b)).collect();
    token.truncate(IDEMPOTENCY_TOKEN_LEN);
    token
}

/// Absolute expiry for a request issued at `now`
pub fn compute_validity(
    now: DateTime<Utc>,
    requested: Option<Duration>,
) -> Result<DateTime<Utc>, PcaError> {
    let validity = requested.unwrap_or(DEFAULT_VALIDITY);
    chrono::Duration::from_std(validity)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| PcaError::Rejected(format!("validity {validity:?} out of range")))
}

/// Split a PEM sequence into (all-but-last blocks, last block)
///
/// Every block must be a `CERTIFICATE`. Blocks are re-encoded with LF line
/// endings, each followed by a newline.
pub fn split_chain(pem_data: &str) -> Result<(String, String), PcaError> {
    let blocks = pem::parse_many(pem_data)
        .map_err(|e| PcaError::InvalidResponse(format!("failed to parse PEM: {e}")))?;

    let Some((last, rest)) = blocks.split_last() else {
        return Err(PcaError::InvalidResponse(
            "no certificate in response".to_string(),
        ));
    };
    if let Some(bad) = blocks.iter().find(|b| b.tag() != "CERTIFICATE") {
        return Err(PcaError::InvalidResponse(format!(
            "unexpected PEM block {:?}",
            bad.tag()
        )));
    }

    let config = EncodeConfig::new().set_line_ending(LineEnding::LF);
    let chain = rest
        .iter()
        .map(|b| pem::encode_config(b, config))
        .collect::<String>();
    Ok((chain, pem::encode_config(last, config)))
}
