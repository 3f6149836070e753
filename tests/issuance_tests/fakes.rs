//! In-memory API server, CA and provisioner factory

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::core::ErrorResponse;
use kube::ResourceExt;
use pem::{EncodeConfig, LineEnding};

use pca_issuer::controller::{
    IssuerContext, IssuerResolver, IssuerStore, ProvisionerFactory, RequestContext, RequestStore,
    ResolvedIssuer,
};
use pca_issuer::crd::{
    AWSPCAClusterIssuer, AWSPCAIssuer, AwsPcaIssuerSpec, AwsPcaIssuerStatus, CertificateRequest,
    CertificateRequestSpec, CertificateRequestStatus, Condition, ConditionStatus, IssuerKey,
    IssuerRef, CONDITION_APPROVED,
};
use pca_issuer::events::NoopEventPublisher;
use pca_issuer::pca::{
    CertificateBundle, IssueCertificateInput, PcaApi, PcaError, Provisioner, ProvisionerCache,
};
use pca_issuer::retry::{FixedRequeue, RetryPolicy};
use pca_issuer::{Error, ISSUER_GROUP, ISSUER_KIND};

pub const CA_ARN: &str = "arn:aws:acm-pca:us-east-1:123456789012:certificate-authority/ca";
pub const RETRY_DELAY: Duration = Duration::from_secs(75);

/// LF-encoded certificate block with recognizable content
pub fn pem_block(seed: u8) -> String {
    pem::encode_config(
        &pem::Pem::new("CERTIFICATE", vec![seed; 64]),
        EncodeConfig::new().set_line_ending(LineEnding::LF),
    )
}

fn bump_resource_version(meta: &mut ObjectMeta) {
    let next = meta
        .resource_version
        .as_deref()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    meta.resource_version = Some(next.to_string());
}

fn conflict(name: &str) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("the object {name} has been modified"),
        reason: "Conflict".to_string(),
        code: 409,
    }))
}

type NamespacedName = (String, String);

/// API server holding issuers, secrets and requests
#[derive(Default)]
pub struct FakeCluster {
    issuers: Mutex<BTreeMap<NamespacedName, AWSPCAIssuer>>,
    cluster_issuers: Mutex<BTreeMap<String, AWSPCAClusterIssuer>>,
    requests: Mutex<BTreeMap<NamespacedName, CertificateRequest>>,
    secrets: Mutex<BTreeMap<NamespacedName, BTreeMap<String, Vec<u8>>>>,
    status_writes: Mutex<usize>,
}

impl FakeCluster {
    pub fn add_issuer(&self, issuer: AWSPCAIssuer) {
        let key = (issuer.namespace().unwrap_or_default(), issuer.name_any());
        self.issuers.lock().unwrap().insert(key, issuer);
    }

    pub fn issuer(&self, namespace: &str, name: &str) -> AWSPCAIssuer {
        self.issuers.lock().unwrap()[&(namespace.to_string(), name.to_string())].clone()
    }

    pub fn delete_issuer(&self, namespace: &str, name: &str) {
        self.issuers
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn add_cluster_issuer(&self, issuer: AWSPCAClusterIssuer) {
        self.cluster_issuers
            .lock()
            .unwrap()
            .insert(issuer.name_any(), issuer);
    }

    pub fn cluster_issuer(&self, name: &str) -> AWSPCAClusterIssuer {
        self.cluster_issuers.lock().unwrap()[name].clone()
    }

    pub fn add_secret(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let data = data
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect();
        self.secrets
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), data);
    }

    pub fn add_request(&self, mut request: CertificateRequest) {
        request.metadata.resource_version = Some("1".to_string());
        let key = (request.namespace().unwrap_or_default(), request.name_any());
        self.requests.lock().unwrap().insert(key, request);
    }

    pub fn request(&self, namespace: &str, name: &str) -> CertificateRequest {
        self.requests.lock().unwrap()[&(namespace.to_string(), name.to_string())].clone()
    }

    pub fn status_writes(&self) -> usize {
        *self.status_writes.lock().unwrap()
    }
}

#[async_trait]
impl RequestStore for FakeCluster {
    async fn get_issuer(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<AWSPCAIssuer>, Error> {
        Ok(self
            .issuers
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn get_cluster_issuer(&self, name: &str) -> Result<Option<AWSPCAClusterIssuer>, Error> {
        Ok(self.cluster_issuers.lock().unwrap().get(name).cloned())
    }

    async fn patch_annotation(
        &self,
        request: &CertificateRequest,
        key: &str,
        value: &str,
    ) -> Result<(), Error> {
        let mut requests = self.requests.lock().unwrap();
        let stored = requests
            .get_mut(&(request.namespace().unwrap_or_default(), request.name_any()))
            .ok_or_else(|| Error::internal("request not found"))?;
        if stored.metadata.resource_version != request.metadata.resource_version {
            return Err(conflict(&request.name_any()));
        }
        stored
            .annotations_mut()
            .insert(key.to_string(), value.to_string());
        bump_resource_version(&mut stored.metadata);
        Ok(())
    }

    async fn patch_status(
        &self,
        request: &CertificateRequest,
        status: &CertificateRequestStatus,
    ) -> Result<(), Error> {
        let mut requests = self.requests.lock().unwrap();
        let stored = requests
            .get_mut(&(request.namespace().unwrap_or_default(), request.name_any()))
            .ok_or_else(|| Error::internal("request not found"))?;
        stored.status = Some(status.clone());
        bump_resource_version(&mut stored.metadata);
        *self.status_writes.lock().unwrap() += 1;
        Ok(())
    }
}

#[async_trait]
impl IssuerStore for FakeCluster {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error> {
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn patch_issuer_status(
        &self,
        key: &IssuerKey,
        status: &AwsPcaIssuerStatus,
    ) -> Result<(), Error> {
        match key {
            IssuerKey::Namespaced { namespace, name } => {
                let mut issuers = self.issuers.lock().unwrap();
                let issuer = issuers
                    .get_mut(&(namespace.clone(), name.clone()))
                    .ok_or_else(|| Error::internal("issuer not found"))?;
                issuer.status = Some(status.clone());
            }
            IssuerKey::Cluster { name } => {
                let mut issuers = self.cluster_issuers.lock().unwrap();
                let issuer = issuers
                    .get_mut(name)
                    .ok_or_else(|| Error::internal("issuer not found"))?;
                issuer.status = Some(status.clone());
            }
        }
        Ok(())
    }
}

/// CA that finishes issuing after a fixed number of polls
pub struct FakePca {
    pending_polls: Mutex<usize>,
    issued: Mutex<Vec<IssueCertificateInput>>,
    describes: Mutex<usize>,
}

impl FakePca {
    pub fn new(pending_polls: usize) -> Self {
        Self {
            pending_polls: Mutex::new(pending_polls),
            issued: Mutex::new(Vec::new()),
            describes: Mutex::new(0),
        }
    }

    pub fn issue_calls(&self) -> Vec<IssueCertificateInput> {
        self.issued.lock().unwrap().clone()
    }

    pub fn describe_calls(&self) -> usize {
        *self.describes.lock().unwrap()
    }
}

#[async_trait]
impl PcaApi for FakePca {
    async fn describe_signing_algorithm(&self, _ca_arn: &str) -> Result<String, PcaError> {
        *self.describes.lock().unwrap() += 1;
        Ok("SHA256WITHRSA".to_string())
    }

    async fn issue_certificate(&self, input: IssueCertificateInput) -> Result<String, PcaError> {
        // same token, same certificate
        let arn = format!("{}/certificate/{}", input.ca_arn, input.idempotency_token);
        self.issued.lock().unwrap().push(input);
        Ok(arn)
    }

    async fn get_certificate(
        &self,
        _ca_arn: &str,
        certificate_arn: &str,
    ) -> Result<CertificateBundle, PcaError> {
        let mut pending = self.pending_polls.lock().unwrap();
        if *pending > 0 {
            *pending -= 1;
            return Err(PcaError::StillIssuing {
                certificate_arn: certificate_arn.to_string(),
            });
        }
        Ok(CertificateBundle {
            certificate: pem_block(1),
            certificate_chain: Some(format!("{}{}", pem_block(2), pem_block(3))),
        })
    }
}

/// Factory handing out provisioners backed by one [`FakePca`]
pub struct FakeFactory {
    pca: Arc<FakePca>,
    built: Mutex<Vec<ResolvedIssuer>>,
}

impl FakeFactory {
    pub fn built(&self) -> Vec<ResolvedIssuer> {
        self.built.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProvisionerFactory for FakeFactory {
    async fn build(&self, issuer: &ResolvedIssuer) -> Result<Provisioner, Error> {
        self.built.lock().unwrap().push(issuer.clone());
        Ok(Provisioner::new(issuer.ca_arn.clone(), self.pca.clone()))
    }
}

/// Controllers wired to the fakes
pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub pca: Arc<FakePca>,
    pub factory: Arc<FakeFactory>,
    pub cache: Arc<ProvisionerCache>,
    pub resolver: Arc<IssuerResolver>,
    pub issuer_ctx: Arc<IssuerContext>,
    pub request_ctx: Arc<RequestContext>,
}

impl Harness {
    pub fn new(pending_polls: usize) -> Self {
        Self::with_policy(pending_polls, RetryPolicy::default())
    }

    pub fn with_policy(pending_polls: usize, retry_policy: RetryPolicy) -> Self {
        let cluster = Arc::new(FakeCluster::default());
        let pca = Arc::new(FakePca::new(pending_polls));
        let factory = Arc::new(FakeFactory {
            pca: pca.clone(),
            built: Mutex::new(Vec::new()),
        });
        let cache = Arc::new(ProvisionerCache::new());
        let resolver = Arc::new(IssuerResolver::new(
            cluster.clone(),
            factory.clone(),
            cache.clone(),
            None,
        ));
        let issuer_ctx = Arc::new(IssuerContext::new(
            resolver.clone(),
            cluster.clone(),
            Arc::new(NoopEventPublisher),
        ));
        let request_ctx = Arc::new(
            RequestContext::builder(cluster.clone(), resolver.clone())
                .requeuer(Arc::new(FixedRequeue(RETRY_DELAY)))
                .retry_policy(retry_policy)
                .build(),
        );
        Self {
            cluster,
            pca,
            factory,
            cache,
            resolver,
            issuer_ctx,
            request_ctx,
        }
    }
}

pub fn issuer_spec() -> AwsPcaIssuerSpec {
    AwsPcaIssuerSpec {
        arn: CA_ARN.to_string(),
        region: Some("us-east-1".to_string()),
        ..Default::default()
    }
}

pub fn issuer(namespace: &str, name: &str, spec: AwsPcaIssuerSpec) -> AWSPCAIssuer {
    let mut issuer = AWSPCAIssuer::new(name, spec);
    issuer.metadata.namespace = Some(namespace.to_string());
    issuer
}

/// Approved request for the namespaced issuer `issuer1`
pub fn approved_request(namespace: &str, name: &str) -> CertificateRequest {
    let mut request = CertificateRequest::new(
        name,
        CertificateRequestSpec {
            request: k8s_openapi::ByteString(b"-----BEGIN CERTIFICATE REQUEST-----".to_vec()),
            duration: Some("2160h0m0s".to_string()),
            usages: vec!["server auth".to_string()],
            is_ca: false,
            issuer_ref: IssuerRef {
                name: "issuer1".to_string(),
                kind: ISSUER_KIND.to_string(),
                group: ISSUER_GROUP.to_string(),
            },
        },
    );
    request.metadata.namespace = Some(namespace.to_string());
    request.metadata.creation_timestamp = Some(Time(chrono::Utc::now()));
    request.status = Some(CertificateRequestStatus {
        conditions: vec![Condition::new(
            CONDITION_APPROVED,
            ConditionStatus::True,
            "cert-manager.io",
            "Certificate request has been approved by cert-manager.io",
        )],
        ..Default::default()
    });
    request
}
