//! Reconcilers for the issuer kinds and cert-manager CertificateRequests
//!
//! Each reconciler follows the kube-runtime contract:
//! `reconcile(obj, ctx) -> Result<Action, Error>` plus an `error_policy`.
//! Kubernetes and ACM PCA access go through traits so the state machines
//! can be tested without a cluster.

pub mod certificate_request;
pub mod issuer;

pub use certificate_request::{
    issuer_kind, Clock, IssuerKind, KubeRequestStore, RequestContext, RequestContextBuilder,
    RequestStore, DENIED_MESSAGE, ISSUED_MESSAGE,
};
pub use issuer::{
    AwsProvisionerFactory, IssuerContext, IssuerResolver, IssuerStore, KubeIssuerStore,
    ProvisionerFactory, ResolvedIssuer, StaticCredentials, REASON_ERROR, REASON_VALIDATION,
    REASON_VERIFIED,
};
