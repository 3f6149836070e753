//! Controller configuration shared by the reconcilers

use std::time::Duration;

use crate::retry::{RetryPolicy, DEFAULT_MAX_RETRY_DURATION};

/// Default timeout for a single ACM PCA operation
pub const DEFAULT_AWS_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of concurrent reconciles per controller
pub const DEFAULT_CONCURRENCY: u16 = 4;

/// Retry policy selectable on the command line
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum RetryPolicyKind {
    /// Retry until the request is older than the maximum retry duration
    #[default]
    Bounded,
    /// Fail on the first CA error
    Simple,
}

/// Runtime configuration for the controllers
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Only process requests carrying `Approved=True`
    pub check_approved: bool,
    /// Failure classification for requests
    pub retry_policy: RetryPolicy,
    /// Region used by issuers without one (`AWS_REGION`)
    pub default_region: Option<String>,
    /// Timeout for each ACM PCA operation
    pub aws_timeout: Duration,
    /// Concurrent reconciles per controller
    pub concurrency: u16,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            check_approved: true,
            retry_policy: RetryPolicy::default(),
            default_region: None,
            aws_timeout: DEFAULT_AWS_TIMEOUT,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl ControllerConfig {
    /// Build the retry policy from its command line form
    pub fn retry_policy_from(kind: RetryPolicyKind, max_retry_duration: Duration) -> RetryPolicy {
        match kind {
            RetryPolicyKind::Simple => RetryPolicy::Simple,
            RetryPolicyKind::Bounded => RetryPolicy::Bounded { max_retry_duration },
        }
    }
}

impl RetryPolicyKind {
    /// Policy with the default maximum retry duration
    pub fn into_policy(self) -> RetryPolicy {
        ControllerConfig::retry_policy_from(self, DEFAULT_MAX_RETRY_DURATION)
    }
}
