//! AWSPCAIssuer and AWSPCAClusterIssuer Custom Resource Definitions
//!
//! Both kinds share [`AwsPcaIssuerSpec`]. A namespaced issuer serves requests in
//! its own namespace, a cluster issuer serves requests in any namespace.

use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{find_condition, Condition, ConditionStatus, CONDITION_READY};

/// Default secret key holding the AWS access key ID
pub const DEFAULT_ACCESS_KEY_ID_KEY: &str = "AWS_ACCESS_KEY_ID";

/// Default secret key holding the AWS secret access key
pub const DEFAULT_SECRET_ACCESS_KEY_KEY: &str = "AWS_SECRET_ACCESS_KEY";

/// Specification shared by AWSPCAIssuer and AWSPCAClusterIssuer
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "awspca.cert-manager.io",
    version = "v1beta1",
    kind = "AWSPCAIssuer",
    plural = "awspcaissuers",
    status = "AwsPcaIssuerStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AwsPcaIssuerSpec {
    /// ARN of the ACM PCA certificate authority
    #[serde(default)]
    pub arn: String,

    /// AWS region of the CA; falls back to `AWS_REGION` when empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Secret holding static AWS credentials; ambient credentials when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,

    /// IAM role to assume on top of the resolved credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Cluster-scoped variant of [`AWSPCAIssuer`]
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "awspca.cert-manager.io",
    version = "v1beta1",
    kind = "AWSPCAClusterIssuer",
    plural = "awspcaclusterissuers",
    status = "AwsPcaIssuerStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AwsPcaClusterIssuerSpec {
    /// Issuer configuration, identical to the namespaced issuer
    #[serde(flatten)]
    pub inner: AwsPcaIssuerSpec,
}

/// Reference to a secret holding AWS credentials
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    /// Secret name
    pub name: String,

    /// Secret namespace; defaults to the issuer's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Key selector for the access key ID
    #[serde(
        default,
        rename = "accessKeyIDSelector",
        skip_serializing_if = "Option::is_none"
    )]
    pub access_key_id_selector: Option<SecretSelector>,

    /// Key selector for the secret access key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_access_key_selector: Option<SecretSelector>,
}

impl SecretReference {
    /// Secret key holding the access key ID
    pub fn access_key_id_key(&self) -> &str {
        self.access_key_id_selector
            .as_ref()
            .map(|s| s.key.as_str())
            .filter(|k| !k.is_empty())
            .unwrap_or(DEFAULT_ACCESS_KEY_ID_KEY)
    }

    /// Secret key holding the secret access key
    pub fn secret_access_key_key(&self) -> &str {
        self.secret_access_key_selector
            .as_ref()
            .map(|s| s.key.as_str())
            .filter(|k| !k.is_empty())
            .unwrap_or(DEFAULT_SECRET_ACCESS_KEY_KEY)
    }
}

/// Selects a single key in a secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SecretSelector {
    /// Key within the secret's data
    #[serde(default)]
    pub key: String,
}

/// Status shared by both issuer kinds
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct AwsPcaIssuerStatus {
    /// Conditions; only `Ready` is maintained
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl AwsPcaIssuerStatus {
    /// Whether the Ready condition is True
    pub fn is_ready(&self) -> bool {
        find_condition(&self.conditions, CONDITION_READY)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }
}

/// Identity of an issuer: the tagged union over both issuer kinds
///
/// Used as the provisioner cache key and as the result of resolving a
/// CertificateRequest's issuer reference.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IssuerKey {
    /// An `AWSPCAIssuer` in a namespace
    Namespaced {
        /// Issuer namespace
        namespace: String,
        /// Issuer name
        name: String,
    },
    /// An `AWSPCAClusterIssuer`
    Cluster {
        /// Issuer name
        name: String,
    },
}

impl IssuerKey {
    /// Key for a namespaced issuer
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Namespaced {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for a cluster issuer
    pub fn cluster(name: impl Into<String>) -> Self {
        Self::Cluster { name: name.into() }
    }

    /// Issuer name
    pub fn name(&self) -> &str {
        match self {
            Self::Namespaced { name, .. } | Self::Cluster { name } => name,
        }
    }

    /// Issuer namespace, `None` for cluster issuers
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::Namespaced { namespace, .. } => Some(namespace),
            Self::Cluster { .. } => None,
        }
    }
}

impl std::fmt::Display for IssuerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Namespaced { namespace, name } => write!(f, "{namespace}/{name}"),
            Self::Cluster { name } => write!(f, "{name}"),
        }
    }
}

/// An issuer of either kind, as seen by the controllers
#[derive(Clone, Debug)]
pub enum AnyIssuer {
    /// Namespaced issuer
    Namespaced(AWSPCAIssuer),
    /// Cluster issuer
    Cluster(AWSPCAClusterIssuer),
}

impl AnyIssuer {
    /// Identity of this issuer
    pub fn key(&self) -> IssuerKey {
        match self {
            Self::Namespaced(i) => {
                IssuerKey::namespaced(i.namespace().unwrap_or_default(), i.name_any())
            }
            Self::Cluster(i) => IssuerKey::cluster(i.name_any()),
        }
    }

    /// Issuer spec
    pub fn spec(&self) -> &AwsPcaIssuerSpec {
        match self {
            Self::Namespaced(i) => &i.spec,
            Self::Cluster(i) => &i.spec.inner,
        }
    }

    /// Issuer status, if any
    pub fn status(&self) -> Option<&AwsPcaIssuerStatus> {
        match self {
            Self::Namespaced(i) => i.status.as_ref(),
            Self::Cluster(i) => i.status.as_ref(),
        }
    }

    /// Whether the issuer reports Ready=True
    pub fn is_ready(&self) -> bool {
        self.status().map(|s| s.is_ready()).unwrap_or(false)
    }

    /// Object reference used for events
    pub fn object_ref(&self) -> k8s_openapi::api::core::v1::ObjectReference {
        match self {
            Self::Namespaced(i) => i.object_ref(&()),
            Self::Cluster(i) => i.object_ref(&()),
        }
    }
}

impl From<AWSPCAIssuer> for AnyIssuer {
    fn from(issuer: AWSPCAIssuer) -> Self {
        Self::Namespaced(issuer)
    }
}

impl From<AWSPCAClusterIssuer> for AnyIssuer {
    fn from(issuer: AWSPCAClusterIssuer) -> Self {
        Self::Cluster(issuer)
    }
}
