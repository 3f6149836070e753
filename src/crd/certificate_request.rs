//! cert-manager CertificateRequest resource
//!
//! The type is owned by cert-manager; only the fields this controller reads or
//! writes are modelled. Unknown fields are dropped on deserialization, so all
//! writes go through merge patches rather than full replacement.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::ByteString;
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};

use super::types::{
    find_condition, Condition, ConditionStatus, CONDITION_APPROVED, CONDITION_DENIED,
    CONDITION_READY,
};
use crate::CERTIFICATE_ARN_ANNOTATION;

/// Ready reason while issuance is in progress or being retried
pub const REASON_PENDING: &str = "Pending";
/// Ready reason once the certificate has been written
pub const REASON_ISSUED: &str = "Issued";
/// Ready reason for a failed request
pub const REASON_FAILED: &str = "Failed";
/// Ready reason for a denied request
pub const REASON_DENIED: &str = "Denied";

/// CertificateRequest spec (subset)
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "CertificateRequest",
    plural = "certificaterequests",
    status = "CertificateRequestStatus",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestSpec {
    /// PEM encoded CSR
    #[serde(default)]
    pub request: ByteString,

    /// Requested validity as a Go duration string (e.g. `2160h0m0s`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    /// Requested key usages in cert-manager notation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usages: Vec<String>,

    /// Whether a CA certificate is requested
    #[serde(default, rename = "isCA")]
    pub is_ca: bool,

    /// Issuer that should sign this request
    pub issuer_ref: IssuerRef,
}

/// Reference to the issuer of a request
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct IssuerRef {
    /// Issuer name
    pub name: String,
    /// Issuer kind; empty means the namespaced issuer kind of the group
    #[serde(default)]
    pub kind: String,
    /// Issuer API group
    #[serde(default)]
    pub group: String,
}

/// CertificateRequest status (subset)
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestStatus {
    /// Request conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Issued leaf certificate followed by intermediates, PEM encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<ByteString>,

    /// Trust anchor of the issued chain, PEM encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<ByteString>,

    /// Time at which the request failed or was denied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_time: Option<DateTime<Utc>>,
}

impl CertificateRequest {
    /// `namespace/name` identity used in logs and error messages
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// Whether the request reached Issued, Failed or Denied
    ///
    /// Only `Ready=False` with reason Failed or Denied counts; temporary
    /// failures are reported with reason Pending and stay mutable.
    pub fn is_terminal(&self) -> bool {
        match find_condition(self.conditions(), CONDITION_READY) {
            Some(c) if c.status == ConditionStatus::True => true,
            Some(c) if c.status == ConditionStatus::False => {
                c.reason == REASON_FAILED || c.reason == REASON_DENIED
            }
            _ => false,
        }
    }

    /// Whether an approver set `Approved=True`
    pub fn is_approved(&self) -> bool {
        find_condition(self.conditions(), CONDITION_APPROVED)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Whether an approver set `Denied=True`
    pub fn is_denied(&self) -> bool {
        find_condition(self.conditions(), CONDITION_DENIED)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Whether a certificate was already written to status
    pub fn has_certificate(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.certificate.as_ref())
            .is_some_and(|c| !c.0.is_empty())
    }

    /// Certificate ARN recorded by a previous successful sign
    pub fn certificate_arn(&self) -> Option<&str> {
        self.annotations()
            .get(CERTIFICATE_ARN_ANNOTATION)
            .map(String::as_str)
            .filter(|arn| !arn.is_empty())
    }

    /// Requested validity, `None` when unset
    pub fn requested_duration(&self) -> Result<Option<Duration>, String> {
        match self.spec.duration.as_deref() {
            None | Some("") => Ok(None),
            Some(d) => parse_go_duration(d).map(Some),
        }
    }

    /// Time since the request was created; zero when unknown
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        self.metadata
            .creation_timestamp
            .as_ref()
            .and_then(|t| (now - t.0).to_std().ok())
            .unwrap_or_default()
    }
}

/// Parse a Go `time.Duration` string such as `2160h0m0s` or `1.5h`
pub fn parse_go_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s.starts_with('-') {
        return Err(format!("negative duration {input:?}"));
    }
    let mut rest = s.strip_prefix('+').unwrap_or(s);
    let mut total_nanos = 0f64;

    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration {input:?}"))?;
        if num_len == 0 {
            return Err(format!("invalid duration {input:?}"));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid number in duration {input:?}"))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            unit => return Err(format!("unknown unit {unit:?} in duration {input:?}")),
        };
        total_nanos += value * nanos_per_unit;
        rest = &rest[unit_len..];
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(format!("duration {input:?} out of range"));
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
