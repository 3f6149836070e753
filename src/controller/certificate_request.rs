//! CertificateRequest controller
//!
//! Drives requests addressed to our issuers through sign, poll and complete.
//! The request is the only durable state:
//!
//! - no certificate ARN annotation: `IssueCertificate` has not run yet
//! - annotation present: poll `GetCertificate` until the CA is done
//! - Ready=True/Issued, Ready=False/Failed or Ready=False/Denied: terminal,
//!   never touched again
//!
//! Temporary failures are reported as Ready=False/Pending and requeued with
//! jitter; the [`RetryPolicy`] decides when a failure becomes permanent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::issuer::IssuerResolver;
use crate::config::ControllerConfig;
use crate::crd::{
    set_condition, AWSPCAClusterIssuer, AWSPCAIssuer, AnyIssuer, CertificateRequest,
    CertificateRequestStatus, Condition, ConditionStatus, IssuerRef, CONDITION_ISSUING,
    CONDITION_READY, REASON_DENIED, REASON_FAILED, REASON_ISSUED, REASON_PENDING,
};
use crate::error::IssuancePhase;
use crate::events::{actions, event_type_for, EventPublisher, NoopEventPublisher};
use crate::pca::{IssuedPem, PcaError, SignRequest};
use crate::retry::{Disposition, JitteredRequeue, Requeuer, RetryPolicy};
use crate::{
    Error, CERTIFICATE_ARN_ANNOTATION, CLUSTER_ISSUER_KIND, FIELD_MANAGER, ISSUER_GROUP,
    ISSUER_KIND,
};

/// Message written when an approver denied the request
pub const DENIED_MESSAGE: &str = "The CertificateRequest was denied by an approval controller";

/// Message written once the certificate is stored on the request
pub const ISSUED_MESSAGE: &str = "Certificate issued";

const STILL_ISSUING_MESSAGE: &str = "Waiting for the certificate to be issued";

/// Kubernetes operations needed by the CertificateRequest controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Namespaced issuer, `None` when it does not exist
    async fn get_issuer(&self, namespace: &str, name: &str)
        -> Result<Option<AWSPCAIssuer>, Error>;

    /// Cluster issuer, `None` when it does not exist
    async fn get_cluster_issuer(&self, name: &str) -> Result<Option<AWSPCAClusterIssuer>, Error>;

    /// Set an annotation on the request
    ///
    /// Fails with a conflict if the request changed since it was read.
    async fn patch_annotation(
        &self,
        request: &CertificateRequest,
        key: &str,
        value: &str,
    ) -> Result<(), Error>;

    /// Replace the status of the request
    async fn patch_status(
        &self,
        request: &CertificateRequest,
        status: &CertificateRequestStatus,
    ) -> Result<(), Error>;
}

/// [`RequestStore`] backed by the Kubernetes API
pub struct KubeRequestStore {
    client: Client,
}

impl KubeRequestStore {
    /// Create a new store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn requests(&self, request: &CertificateRequest) -> Api<CertificateRequest> {
        Api::namespaced(self.client.clone(), &request.namespace().unwrap_or_default())
    }
}

#[async_trait]
impl RequestStore for KubeRequestStore {
    async fn get_issuer(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AWSPCAIssuer>, Error> {
        let api: Api<AWSPCAIssuer> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_cluster_issuer(&self, name: &str) -> Result<Option<AWSPCAClusterIssuer>, Error> {
        let api: Api<AWSPCAClusterIssuer> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn patch_annotation(
        &self,
        request: &CertificateRequest,
        key: &str,
        value: &str,
    ) -> Result<(), Error> {
        let annotations = BTreeMap::from([(key, value)]);
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": request.resource_version(),
                "annotations": annotations,
            }
        });
        self.requests(request)
            .patch(
                &request.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        request: &CertificateRequest,
        status: &CertificateRequestStatus,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "status": status });
        self.requests(request)
            .patch_status(
                &request.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

/// Source of the current time
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Shared context for the CertificateRequest controller
///
/// Use [`RequestContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = RequestContext::builder(store, resolver)
///     .events(events)
///     .config(&config)
///     .build();
/// ```
pub struct RequestContext {
    /// Store for issuer lookups and request writes
    pub store: Arc<dyn RequestStore>,
    /// Resolver owning the provisioner cache
    pub resolver: Arc<IssuerResolver>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Delay source for retried requests
    pub requeuer: Arc<dyn Requeuer>,
    /// Failure classification
    pub retry_policy: RetryPolicy,
    /// Only process requests carrying `Approved=True`
    pub check_approved: bool,
    clock: Clock,
}

impl RequestContext {
    /// Create a builder for constructing a RequestContext
    pub fn builder(
        store: Arc<dyn RequestStore>,
        resolver: Arc<IssuerResolver>,
    ) -> RequestContextBuilder {
        RequestContextBuilder::new(store, resolver)
    }

    /// Current time according to the context clock
    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

/// Builder for [`RequestContext`]
pub struct RequestContextBuilder {
    store: Arc<dyn RequestStore>,
    resolver: Arc<IssuerResolver>,
    events: Arc<dyn EventPublisher>,
    requeuer: Arc<dyn Requeuer>,
    retry_policy: RetryPolicy,
    check_approved: bool,
    clock: Clock,
}

impl RequestContextBuilder {
    fn new(store: Arc<dyn RequestStore>, resolver: Arc<IssuerResolver>) -> Self {
        Self {
            store,
            resolver,
            events: Arc::new(NoopEventPublisher),
            requeuer: Arc::new(JitteredRequeue),
            retry_policy: RetryPolicy::default(),
            check_approved: true,
            clock: Arc::new(Utc::now),
        }
    }

    /// Set the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Override the requeue delay source (primarily for testing)
    pub fn requeuer(mut self, requeuer: Arc<dyn Requeuer>) -> Self {
        self.requeuer = requeuer;
        self
    }

    /// Set the retry policy
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Enable or disable the approval check
    pub fn check_approved(mut self, check_approved: bool) -> Self {
        self.check_approved = check_approved;
        self
    }

    /// Take retry policy and approval check from the controller configuration
    pub fn config(self, config: &ControllerConfig) -> Self {
        self.retry_policy(config.retry_policy)
            .check_approved(config.check_approved)
    }

    /// Override the clock (primarily for testing)
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Build the context
    pub fn build(self) -> RequestContext {
        RequestContext {
            store: self.store,
            resolver: self.resolver,
            events: self.events,
            requeuer: self.requeuer,
            retry_policy: self.retry_policy,
            check_approved: self.check_approved,
            clock: self.clock,
        }
    }
}

/// Issuer kind a request is addressed to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IssuerKind {
    /// `AWSPCAIssuer`, or an empty kind
    Namespaced,
    /// `AWSPCAClusterIssuer`
    Cluster,
}

/// Our issuer kind referenced by `issuer_ref`, `None` for foreign issuers
pub fn issuer_kind(issuer_ref: &IssuerRef) -> Option<IssuerKind> {
    if issuer_ref.group != ISSUER_GROUP {
        return None;
    }
    match issuer_ref.kind.as_str() {
        "" | ISSUER_KIND => Some(IssuerKind::Namespaced),
        CLUSTER_ISSUER_KIND => Some(IssuerKind::Cluster),
        _ => None,
    }
}

/// What a successful pass through the CA achieved
enum Progress {
    /// `IssueCertificate` accepted the request and the ARN was recorded
    Submitted,
    /// The certificate is ready to be stored
    Issued(IssuedPem),
}

/// Reconcile a CertificateRequest
#[instrument(skip(request, ctx), fields(certificate_request = %request.key()))]
pub async fn reconcile(
    request: Arc<CertificateRequest>,
    ctx: Arc<RequestContext>,
) -> Result<Action, Error> {
    let Some(kind) = issuer_kind(&request.spec.issuer_ref) else {
        debug!(
            group = %request.spec.issuer_ref.group,
            kind = %request.spec.issuer_ref.kind,
            "request is for another issuer"
        );
        return Ok(Action::await_change());
    };

    if request.is_terminal() {
        debug!("request already finished");
        return Ok(Action::await_change());
    }

    if request.is_denied() {
        info!("request was denied");
        let now = ctx.now();
        update_status(
            &request,
            &ctx,
            Some(Condition::new(CONDITION_ISSUING, ConditionStatus::False, REASON_DENIED, DENIED_MESSAGE)),
            Condition::new(CONDITION_READY, ConditionStatus::False, REASON_DENIED, DENIED_MESSAGE),
            |status| {
                status.failure_time.get_or_insert(now);
            },
        )
        .await?;
        return Ok(Action::await_change());
    }

    if ctx.check_approved && !request.is_approved() {
        debug!("request not approved yet");
        return Ok(Action::await_change());
    }

    if request.has_certificate() {
        debug!("certificate already present");
        return Ok(Action::await_change());
    }

    match advance(&request, kind, &ctx).await {
        Ok(Progress::Submitted) => Ok(Action::requeue(Duration::ZERO)),
        Ok(Progress::Issued(issued)) => {
            update_status(
                &request,
                &ctx,
                Some(Condition::new(CONDITION_ISSUING, ConditionStatus::True, REASON_ISSUED, ISSUED_MESSAGE)),
                Condition::new(CONDITION_READY, ConditionStatus::True, REASON_ISSUED, ISSUED_MESSAGE),
                |status| {
                    status.certificate = Some(ByteString(issued.chain.into_bytes()));
                    status.ca = Some(ByteString(issued.ca.into_bytes()));
                },
            )
            .await?;
            Ok(Action::await_change())
        }
        Err(Error::Issuance {
            source: PcaError::StillIssuing { certificate_arn },
            ..
        }) => {
            debug!(%certificate_arn, "certificate still being issued");
            update_status(
                &request,
                &ctx,
                None,
                Condition::new(
                    CONDITION_READY,
                    ConditionStatus::False,
                    REASON_PENDING,
                    STILL_ISSUING_MESSAGE,
                ),
                |_| {},
            )
            .await?;
            Ok(Action::requeue(ctx.requeuer.requeue_after()))
        }
        Err(e) => handle_failure(&request, e, &ctx).await,
    }
}

/// Requeue delay after a failed request reconcile
pub fn error_policy(
    request: Arc<CertificateRequest>,
    error: &Error,
    ctx: Arc<RequestContext>,
) -> Action {
    error!(?error, certificate_request = %request.key(), "certificate request reconciliation failed");
    Action::requeue(ctx.requeuer.requeue_after())
}

/// Steps that talk to the issuer and the CA
async fn advance(
    request: &CertificateRequest,
    kind: IssuerKind,
    ctx: &RequestContext,
) -> Result<Progress, Error> {
    let issuer = find_issuer(request, kind, ctx).await?;
    let key = issuer.key();
    if !issuer.is_ready() {
        return Err(Error::issuer_unavailable(
            key.to_string(),
            format!("issuer {key} is not ready"),
        ));
    }

    let provisioner = ctx.resolver.provisioner_for(&issuer).await.map_err(|e| {
        Error::issuer_unavailable(
            key.to_string(),
            format!("provisioner for {key} not found: {e}"),
        )
    })?;

    let Some(certificate_arn) = request.certificate_arn() else {
        let sign_request = sign_request(request)?;
        let certificate_arn = provisioner
            .sign(&sign_request, ctx.now())
            .await
            .map_err(|e| Error::issuance(request.key(), IssuancePhase::Sign, e))?;
        ctx.store
            .patch_annotation(request, CERTIFICATE_ARN_ANNOTATION, &certificate_arn)
            .await?;
        info!(issuer = %key, %certificate_arn, "recorded certificate ARN");
        return Ok(Progress::Submitted);
    };

    let issued = provisioner
        .fetch_issued(certificate_arn)
        .await
        .map_err(|e| Error::issuance(request.key(), IssuancePhase::Fetch, e))?;
    Ok(Progress::Issued(issued))
}

/// Look up the referenced issuer, trying the namespaced kind first
async fn find_issuer(
    request: &CertificateRequest,
    kind: IssuerKind,
    ctx: &RequestContext,
) -> Result<AnyIssuer, Error> {
    let name = &request.spec.issuer_ref.name;
    let lookup_failed =
        |e: Error| Error::issuer_unavailable(name.clone(), format!("failed to retrieve Issuer resource: {e}"));

    if kind == IssuerKind::Namespaced {
        let namespace = request.namespace().unwrap_or_default();
        if let Some(issuer) = ctx.store.get_issuer(&namespace, name).await.map_err(lookup_failed)? {
            return Ok(issuer.into());
        }
    }
    if let Some(issuer) = ctx.store.get_cluster_issuer(name).await.map_err(lookup_failed)? {
        return Ok(issuer.into());
    }
    Err(Error::issuer_unavailable(
        name.clone(),
        format!("failed to retrieve Issuer resource: {name} not found"),
    ))
}

fn sign_request(request: &CertificateRequest) -> Result<SignRequest, Error> {
    let duration = request.requested_duration().map_err(|e| {
        Error::issuance(
            request.key(),
            IssuancePhase::Sign,
            PcaError::Rejected(format!("invalid duration: {e}")),
        )
    })?;
    Ok(SignRequest {
        namespace: request.namespace().unwrap_or_default(),
        name: request.name_any(),
        csr: request.spec.request.0.clone(),
        duration,
        usages: request.spec.usages.clone(),
        is_ca: request.spec.is_ca,
    })
}

/// Record a failure as temporary or permanent
async fn handle_failure(
    request: &CertificateRequest,
    error: Error,
    ctx: &RequestContext,
) -> Result<Action, Error> {
    let now = ctx.now();
    match ctx.retry_policy.classify(&error, request.age(now)) {
        Disposition::Retry => {
            warn!(error = %error, "temporary failure, will retry");
            let message = format!("Temporary error signing certificate, retry again: {error}");
            update_status(
                request,
                ctx,
                Some(Condition::new(CONDITION_ISSUING, ConditionStatus::False, REASON_FAILED, message.clone())),
                Condition::new(CONDITION_READY, ConditionStatus::False, REASON_PENDING, message),
                |_| {},
            )
            .await?;
            Ok(Action::requeue(ctx.requeuer.requeue_after()))
        }
        Disposition::Permanent => {
            error!(error = %error, "permanent failure");
            let message = format!("Permanent error signing certificate: {error}");
            update_status(
                request,
                ctx,
                Some(Condition::new(CONDITION_ISSUING, ConditionStatus::False, REASON_FAILED, message.clone())),
                Condition::new(CONDITION_READY, ConditionStatus::False, REASON_FAILED, message),
                |status| {
                    status.failure_time.get_or_insert(now);
                },
            )
            .await?;
            Ok(Action::await_change())
        }
    }
}

/// Write conditions and status fields, then publish an event for Ready
async fn update_status(
    request: &CertificateRequest,
    ctx: &RequestContext,
    issuing: Option<Condition>,
    ready: Condition,
    apply: impl FnOnce(&mut CertificateRequestStatus) + Send,
) -> Result<(), Error> {
    let mut status = request.status.clone().unwrap_or_default();
    apply(&mut status);
    if let Some(issuing) = issuing {
        set_condition(&mut status.conditions, issuing);
    }
    let (ready_status, reason, message) = (ready.status, ready.reason.clone(), ready.message.clone());
    set_condition(&mut status.conditions, ready);

    ctx.store.patch_status(request, &status).await?;
    ctx.events
        .publish(
            &request.object_ref(&()),
            event_type_for(ready_status),
            &reason,
            actions::ISSUE,
            Some(message),
        )
        .await;

    info!(status = %ready_status, %reason, "updated certificate request status");
    Ok(())
}
