//! AWSPCAIssuer / AWSPCAClusterIssuer controller
//!
//! Validates the issuer, resolves AWS credentials, builds a [`Provisioner`]
//! and publishes it in the [`ProvisionerCache`]. The outcome is reported as
//! the issuer's Ready condition:
//!
//! - `Validation`: the spec is incomplete; nothing happens until it changes
//! - `Error`: credentials could not be resolved; retried by the error policy
//! - `Verified`: the provisioner is cached and requests can be signed

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::sts::AssumeRoleProvider;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_acmpca::config::Credentials;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    find_condition, set_condition, AWSPCAClusterIssuer, AWSPCAIssuer, AnyIssuer,
    AwsPcaIssuerStatus, Condition, ConditionStatus, IssuerKey, CONDITION_READY,
};
use crate::events::{actions, event_type_for, EventPublisher};
use crate::pca::{AwsPcaClient, Provisioner, ProvisionerCache};
use crate::{Error, FIELD_MANAGER};

/// Ready reason for an invalid issuer spec
pub const REASON_VALIDATION: &str = "Validation";
/// Ready reason for credential resolution failures
pub const REASON_ERROR: &str = "Error";
/// Ready reason for a usable issuer
pub const REASON_VERIFIED: &str = "Verified";

const ROLE_SESSION_NAME: &str = "aws-privateca-issuer";

/// Kubernetes operations needed by the issuer controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IssuerStore: Send + Sync {
    /// Data of a secret, `None` when the secret does not exist
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error>;

    /// Replace the status of an issuer
    async fn patch_issuer_status(
        &self,
        key: &IssuerKey,
        status: &AwsPcaIssuerStatus,
    ) -> Result<(), Error>;
}

/// [`IssuerStore`] backed by the Kubernetes API
pub struct KubeIssuerStore {
    client: Client,
}

impl KubeIssuerStore {
    /// Create a new store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IssuerStore for KubeIssuerStore {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get_opt(name).await?;
        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect()
        }))
    }

    async fn patch_issuer_status(
        &self,
        key: &IssuerKey,
        status: &AwsPcaIssuerStatus,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "status": status });
        let params = PatchParams::apply(FIELD_MANAGER);
        match key {
            IssuerKey::Namespaced { namespace, name } => {
                let api: Api<AWSPCAIssuer> = Api::namespaced(self.client.clone(), namespace);
                api.patch_status(name, &params, &Patch::Merge(&patch)).await?;
            }
            IssuerKey::Cluster { name } => {
                let api: Api<AWSPCAClusterIssuer> = Api::all(self.client.clone());
                api.patch_status(name, &params, &Patch::Merge(&patch)).await?;
            }
        }
        Ok(())
    }
}

/// Static credentials read from a secret
#[derive(Clone, PartialEq, Eq)]
pub struct StaticCredentials {
    /// AWS access key ID
    pub access_key_id: String,
    /// AWS secret access key
    pub secret_access_key: String,
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Fully resolved configuration of an issuer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedIssuer {
    /// Issuer identity
    pub key: IssuerKey,
    /// CA ARN
    pub ca_arn: String,
    /// Effective AWS region
    pub region: String,
    /// Static credentials; the ambient chain is used when `None`
    pub credentials: Option<StaticCredentials>,
    /// Role to assume on top of the base credentials
    pub role: Option<String>,
}

/// Builds provisioners from resolved issuer configuration
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProvisionerFactory: Send + Sync {
    /// Build a provisioner for `issuer`
    async fn build(&self, issuer: &ResolvedIssuer) -> Result<Provisioner, Error>;
}

/// [`ProvisionerFactory`] creating AWS SDK clients
pub struct AwsProvisionerFactory {
    operation_timeout: Duration,
}

impl AwsProvisionerFactory {
    /// Create a factory whose clients time out each call after `operation_timeout`
    pub fn new(operation_timeout: Duration) -> Self {
        Self { operation_timeout }
    }

    fn loader(&self, region: &str) -> aws_config::ConfigLoader {
        aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(self.operation_timeout)
                    .build(),
            )
    }
}

#[async_trait]
impl ProvisionerFactory for AwsProvisionerFactory {
    async fn build(&self, issuer: &ResolvedIssuer) -> Result<Provisioner, Error> {
        let mut loader = self.loader(&issuer.region);
        if let Some(creds) = &issuer.credentials {
            loader = loader.credentials_provider(Credentials::new(
                creds.access_key_id.clone(),
                creds.secret_access_key.clone(),
                None,
                None,
                "kubernetes-secret",
            ));
        }
        let mut sdk_config = loader.load().await;

        if let Some(role) = &issuer.role {
            debug!(issuer = %issuer.key, %role, "assuming role");
            let provider = AssumeRoleProvider::builder(role.clone())
                .session_name(ROLE_SESSION_NAME)
                .configure(&sdk_config)
                .build()
                .await;
            sdk_config = self
                .loader(&issuer.region)
                .credentials_provider(provider)
                .load()
                .await;
        }

        Ok(Provisioner::new(
            issuer.ca_arn.clone(),
            Arc::new(AwsPcaClient::new(&sdk_config)),
        ))
    }
}

/// Turns issuers into cached provisioners
///
/// Shared by the issuer controllers, which keep the cache up to date, and the
/// CertificateRequest controller, which builds on demand for issuers it sees
/// before their first reconcile.
pub struct IssuerResolver {
    store: Arc<dyn IssuerStore>,
    factory: Arc<dyn ProvisionerFactory>,
    cache: Arc<ProvisionerCache>,
    default_region: Option<String>,
}

impl IssuerResolver {
    /// Create a resolver
    pub fn new(
        store: Arc<dyn IssuerStore>,
        factory: Arc<dyn ProvisionerFactory>,
        cache: Arc<ProvisionerCache>,
        default_region: Option<String>,
    ) -> Self {
        Self {
            store,
            factory,
            cache,
            default_region: default_region.filter(|r| !r.is_empty()),
        }
    }

    /// Provisioner cache this resolver writes to
    pub fn cache(&self) -> &Arc<ProvisionerCache> {
        &self.cache
    }

    /// Validate the issuer spec and resolve its credentials
    pub async fn resolve(&self, issuer: &AnyIssuer) -> Result<ResolvedIssuer, Error> {
        let key = issuer.key();
        let spec = issuer.spec();

        if spec.arn.is_empty() {
            return Err(Error::validation(key.to_string(), "no Arn found in Issuer Spec"));
        }
        let region = spec
            .region
            .clone()
            .filter(|r| !r.is_empty())
            .or_else(|| self.default_region.clone())
            .ok_or_else(|| Error::validation(key.to_string(), "no Region found in Issuer Spec"))?;

        let credentials = match spec.secret_ref.as_ref().filter(|r| !r.name.is_empty()) {
            None => None,
            Some(secret_ref) => {
                let namespace = secret_ref
                    .namespace
                    .clone()
                    .filter(|ns| !ns.is_empty())
                    .or_else(|| key.namespace().map(str::to_string))
                    .ok_or_else(|| {
                        Error::validation(
                            key.to_string(),
                            "no namespace found in Issuer SecretRef",
                        )
                    })?;

                let data = self
                    .store
                    .get_secret(&namespace, &secret_ref.name)
                    .await?
                    .ok_or_else(|| {
                        Error::credentials(
                            key.to_string(),
                            format!(
                                "failed to retrieve secret {namespace}/{}: not found",
                                secret_ref.name
                            ),
                        )
                    })?;

                let read = |field: &str, missing: &str| {
                    data.get(field)
                        .map(|v| String::from_utf8_lossy(v).trim().to_string())
                        .filter(|v| !v.is_empty())
                        .ok_or_else(|| Error::credentials(key.to_string(), missing))
                };
                Some(StaticCredentials {
                    access_key_id: read(secret_ref.access_key_id_key(), "no AWS Access Key ID Found")?,
                    secret_access_key: read(
                        secret_ref.secret_access_key_key(),
                        "no AWS Secret Access Key Found",
                    )?,
                })
            }
        };

        Ok(ResolvedIssuer {
            key,
            ca_arn: spec.arn.clone(),
            region,
            credentials,
            role: spec.role.clone().filter(|r| !r.is_empty()),
        })
    }

    /// Resolve the issuer and build a fresh provisioner, bypassing the cache
    pub async fn build(&self, issuer: &AnyIssuer) -> Result<Provisioner, Error> {
        let resolved = self.resolve(issuer).await?;
        self.factory.build(&resolved).await
    }

    /// Cached provisioner for the issuer, built and stored when missing
    pub async fn provisioner_for(&self, issuer: &AnyIssuer) -> Result<Arc<Provisioner>, Error> {
        self.cache
            .get_or_create(&issuer.key(), || self.build(issuer))
            .await
    }

    /// Drop the cached provisioner of a deleted issuer
    pub fn forget(&self, key: &IssuerKey) {
        if self.cache.delete(key).is_some() {
            info!(issuer = %key, "removed provisioner of deleted issuer");
        }
    }
}

/// Shared context for the issuer controllers
pub struct IssuerContext {
    /// Resolver owning the provisioner cache
    pub resolver: Arc<IssuerResolver>,
    /// Store used for status writes
    pub store: Arc<dyn IssuerStore>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
}

impl IssuerContext {
    /// Create a new context
    pub fn new(
        resolver: Arc<IssuerResolver>,
        store: Arc<dyn IssuerStore>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            resolver,
            store,
            events,
        }
    }
}

/// Reconcile an AWSPCAIssuer
#[instrument(skip(issuer, ctx), fields(issuer = %issuer.name_any(), namespace = %issuer.namespace().unwrap_or_default()))]
pub async fn reconcile(issuer: Arc<AWSPCAIssuer>, ctx: Arc<IssuerContext>) -> Result<Action, Error> {
    reconcile_issuer(AnyIssuer::Namespaced((*issuer).clone()), &ctx).await
}

/// Reconcile an AWSPCAClusterIssuer
#[instrument(skip(issuer, ctx), fields(issuer = %issuer.name_any()))]
pub async fn reconcile_cluster(
    issuer: Arc<AWSPCAClusterIssuer>,
    ctx: Arc<IssuerContext>,
) -> Result<Action, Error> {
    reconcile_issuer(AnyIssuer::Cluster((*issuer).clone()), &ctx).await
}

/// Reconcile either issuer kind
pub async fn reconcile_issuer(issuer: AnyIssuer, ctx: &IssuerContext) -> Result<Action, Error> {
    let key = issuer.key();
    debug!("reconciling issuer");

    let provisioner = match ctx.resolver.build(&issuer).await {
        Ok(provisioner) => provisioner,
        Err(Error::Validation { message, .. }) => {
            warn!(%message, "issuer validation failed");
            let message = format!("Failed to validate resource: {message}");
            if let Err(e) =
                set_ready(&issuer, ctx, ConditionStatus::False, REASON_VALIDATION, message).await
            {
                warn!(error = %e, "failed to update issuer status");
            }
            return Ok(Action::await_change());
        }
        Err(e) => {
            warn!(error = %e, "failed to load issuer configuration");
            let message = match &e {
                Error::Credentials { message, .. } => message.clone(),
                other => other.to_string(),
            };
            if let Err(status_err) =
                set_ready(&issuer, ctx, ConditionStatus::False, REASON_ERROR, message).await
            {
                warn!(error = %status_err, "failed to update issuer status");
            }
            return Err(e);
        }
    };

    ctx.resolver.cache().store(key, Arc::new(provisioner));
    set_ready(
        &issuer,
        ctx,
        ConditionStatus::True,
        REASON_VERIFIED,
        "Issuer verified".to_string(),
    )
    .await?;

    Ok(Action::await_change())
}

/// Requeue delay after a failed issuer reconcile
pub fn error_policy<K: Resource>(issuer: Arc<K>, error: &Error, _ctx: Arc<IssuerContext>) -> Action {
    error!(?error, issuer = %issuer.name_any(), "issuer reconciliation failed");
    Action::requeue(Duration::from_secs(30))
}

/// Write the Ready condition unless it already says the same thing
async fn set_ready(
    issuer: &AnyIssuer,
    ctx: &IssuerContext,
    status: ConditionStatus,
    reason: &str,
    message: String,
) -> Result<(), Error> {
    let mut conditions = issuer
        .status()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();

    if let Some(current) = find_condition(&conditions, CONDITION_READY) {
        if current.status == status && current.reason == reason && current.message == message {
            debug!("issuer status unchanged");
            return Ok(());
        }
    }

    set_condition(
        &mut conditions,
        Condition::new(CONDITION_READY, status, reason, message.clone()),
    );
    ctx.store
        .patch_issuer_status(&issuer.key(), &AwsPcaIssuerStatus { conditions })
        .await?;
    ctx.events
        .publish(
            &issuer.object_ref(),
            event_type_for(status),
            reason,
            actions::VERIFY,
            Some(message),
        )
        .await;

    info!(%status, reason, "updated issuer status");
    Ok(())
}
