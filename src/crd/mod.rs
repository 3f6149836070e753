//! Custom Resource Definitions
//!
//! The issuer kinds are owned and installed by this controller. The
//! CertificateRequest type belongs to cert-manager and is only consumed.

mod certificate_request;
mod issuer;
mod types;

pub use certificate_request::{
    parse_go_duration, CertificateRequest, CertificateRequestSpec, CertificateRequestStatus,
    IssuerRef, REASON_DENIED, REASON_FAILED, REASON_ISSUED, REASON_PENDING,
};
pub use issuer::{
    AWSPCAClusterIssuer, AWSPCAIssuer, AnyIssuer, AwsPcaClusterIssuerSpec, AwsPcaIssuerSpec,
    AwsPcaIssuerStatus, IssuerKey, SecretReference, SecretSelector, DEFAULT_ACCESS_KEY_ID_KEY,
    DEFAULT_SECRET_ACCESS_KEY_KEY,
};
pub use types::{
    find_condition, set_condition, Condition, ConditionStatus, CONDITION_APPROVED,
    CONDITION_DENIED, CONDITION_ISSUING, CONDITION_READY,
};
