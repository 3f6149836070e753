//! pca-issuer - cert-manager external issuer backed by AWS Private CA
//!
//! Bridges cert-manager `CertificateRequest` resources to ACM PCA, driving each
//! request through issue → poll → complete until it reaches a terminal state.
//!
//! # Architecture
//!
//! - Issuer controllers validate `AWSPCAIssuer` / `AWSPCAClusterIssuer` resources,
//!   resolve AWS credentials and keep a [`pca::ProvisionerCache`] warm
//! - The CertificateRequest controller reads the cache, calls ACM PCA and writes
//!   the outcome back onto the request, which is the only durable state
//!
//! # Modules
//!
//! - [`crd`] - Issuer CRDs and the cert-manager CertificateRequest type
//! - [`controller`] - Reconcilers for issuers and certificate requests
//! - [`pca`] - ACM PCA signing client, provisioners and the provisioner cache
//! - [`retry`] - Failure classification and requeue backoff
//! - [`config`] - Controller configuration
//! - [`events`] - Kubernetes Event publishing
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod pca;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the issuer CRDs
pub const ISSUER_GROUP: &str = "awspca.cert-manager.io";

/// Kind of the namespaced issuer
pub const ISSUER_KIND: &str = "AWSPCAIssuer";

/// Kind of the cluster-scoped issuer
pub const CLUSTER_ISSUER_KIND: &str = "AWSPCAClusterIssuer";

/// Annotation holding the ACM PCA certificate ARN once issuance was requested
///
/// Its presence means `IssueCertificate` already ran for the request and the
/// next reconcile must poll instead of signing again.
pub const CERTIFICATE_ARN_ANNOTATION: &str = "aws-privateca-issuer/certificate-arn";

/// Field manager used for all patches issued by this controller
pub const FIELD_MANAGER: &str = "aws-privateca-issuer";
