//! Error types for the issuer
//!
//! Errors carry enough context (issuer or request identity, issuance phase) to
//! diagnose a failure from the log line alone.

use thiserror::Error;

use crate::pca::PcaError;

/// Phase of the issuance lifecycle an error originated from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IssuancePhase {
    /// `IssueCertificate` call
    Sign,
    /// `GetCertificate` call
    Fetch,
}

impl std::fmt::Display for IssuancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sign => write!(f, "sign"),
            Self::Fetch => write!(f, "fetch"),
        }
    }
}

/// Main error type for issuer operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Issuer spec is invalid and will not become valid without a spec change
    #[error("validation error for {issuer}: {message}")]
    Validation {
        /// Issuer identity
        issuer: String,
        /// Description of what's invalid
        message: String,
    },

    /// Credentials for an issuer could not be resolved
    #[error("credential error for {issuer}: {message}")]
    Credentials {
        /// Issuer identity
        issuer: String,
        /// Description of what failed
        message: String,
    },

    /// The issuer referenced by a request is missing or not ready
    #[error("issuer {issuer} unavailable: {message}")]
    IssuerUnavailable {
        /// Issuer identity
        issuer: String,
        /// Why the issuer cannot be used
        message: String,
    },

    /// ACM PCA call failed while processing a request
    #[error("{phase} failed for {request}: {source}")]
    Issuance {
        /// Request identity (`namespace/name`)
        request: String,
        /// Lifecycle phase that failed
        phase: IssuancePhase,
        /// Underlying CA error
        #[source]
        source: PcaError,
    },

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error for the given issuer
    pub fn validation(issuer: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            issuer: issuer.into(),
            message: msg.into(),
        }
    }

    /// Create a credential error for the given issuer
    pub fn credentials(issuer: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credentials {
            issuer: issuer.into(),
            message: msg.into(),
        }
    }

    /// Create an issuer-unavailable error
    pub fn issuer_unavailable(issuer: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::IssuerUnavailable {
            issuer: issuer.into(),
            message: msg.into(),
        }
    }

    /// Wrap a CA error with the request identity and phase
    pub fn issuance(request: impl Into<String>, phase: IssuancePhase, source: PcaError) -> Self {
        Self::Issuance {
            request: request.into(),
            phase,
            source,
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying the same operation may succeed without outside changes
    ///
    /// Validation and CA rejections need a spec change. Everything else may be
    /// transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation { .. } => false,
            Self::Issuance { source, .. } => source.is_retryable(),
            _ => true,
        }
    }

    /// Whether this is a transient CA condition that must never become terminal
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Issuance { source, .. } if source.is_transient())
    }
}
