//! pca-issuer - cert-manager external issuer backed by AWS Private CA

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::controller::Config as ControllerRuntimeConfig;
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, CustomResourceExt, Resource};
use serde::de::DeserializeOwned;

use pca_issuer::config::{
    ControllerConfig, RetryPolicyKind, DEFAULT_AWS_TIMEOUT, DEFAULT_CONCURRENCY,
};
use pca_issuer::controller::{
    certificate_request, issuer, AwsProvisionerFactory, IssuerContext, IssuerResolver,
    IssuerStore, KubeIssuerStore, KubeRequestStore, RequestContext,
};
use pca_issuer::crd::{AWSPCAClusterIssuer, AWSPCAIssuer, AnyIssuer, CertificateRequest};
use pca_issuer::events::{EventPublisher, KubeEventPublisher, REPORTING_CONTROLLER};
use pca_issuer::pca::ProvisionerCache;
use pca_issuer::retry::DEFAULT_MAX_RETRY_DURATION;
use pca_issuer::telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// cert-manager external issuer that signs CertificateRequests with AWS Private CA
#[derive(Parser, Debug)]
#[command(name = "pca-issuer", version, about, long_about = None)]
struct Cli {
    /// Print the issuer CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Sign requests without waiting for cert-manager approval
    #[arg(long, env = "DISABLE_APPROVED_CHECK")]
    disable_approved_check: bool,

    /// How failed requests are retried
    #[arg(long, value_enum, env = "RETRY_POLICY", default_value_t = RetryPolicyKind::Bounded)]
    retry_policy: RetryPolicyKind,

    /// Request age after which failures become permanent (bounded policy)
    #[arg(long, env = "MAX_RETRY_DURATION_SECS", default_value_t = DEFAULT_MAX_RETRY_DURATION.as_secs())]
    max_retry_duration_secs: u64,

    /// Concurrent reconciles per controller
    #[arg(long, env = "CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: u16,

    /// Timeout for each ACM PCA operation in seconds
    #[arg(long, env = "AWS_TIMEOUT_SECS", default_value_t = DEFAULT_AWS_TIMEOUT.as_secs())]
    aws_timeout_secs: u64,

    /// Log output format
    #[arg(long, value_enum, env = "LOG_FORMAT", default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Region for issuers that do not set one
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            check_approved: !self.disable_approved_check,
            retry_policy: ControllerConfig::retry_policy_from(
                self.retry_policy,
                Duration::from_secs(self.max_retry_duration_secs),
            ),
            default_region: self.region.clone().filter(|r| !r.is_empty()),
            aws_timeout: Duration::from_secs(self.aws_timeout_secs),
            concurrency: self.concurrency.max(1),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let issuer = serde_yaml::to_string(&AWSPCAIssuer::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        let cluster_issuer = serde_yaml::to_string(&AWSPCAClusterIssuer::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{issuer}---\n{cluster_issuer}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
    })?;

    run_controller(cli.controller_config()).await
}

/// Install or update the issuer CRDs with server-side apply
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(REPORTING_CONTROLLER).force();

    for crd in [AWSPCAIssuer::crd(), AWSPCAClusterIssuer::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD...");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install CRD {}: {}", name, e))?;
    }

    tracing::info!("Issuer CRDs installed/updated");
    Ok(())
}

/// Drop cached provisioners of deleted issuers
async fn forget_deleted<K>(api: Api<K>, resolver: Arc<IssuerResolver>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    AnyIssuer: From<K>,
{
    watcher::watcher(api, WatcherConfig::default())
        .default_backoff()
        .for_each(|event| {
            let resolver = resolver.clone();
            async move {
                match event {
                    Ok(watcher::Event::Delete(issuer)) => {
                        resolver.forget(&AnyIssuer::from(issuer).key());
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Issuer watch error"),
                }
            }
        })
        .await
}

async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    tracing::info!(?config, "pca-issuer starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let cache = Arc::new(ProvisionerCache::new());
    let issuer_store: Arc<dyn IssuerStore> = Arc::new(KubeIssuerStore::new(client.clone()));
    let resolver = Arc::new(IssuerResolver::new(
        issuer_store.clone(),
        Arc::new(AwsProvisionerFactory::new(config.aws_timeout)),
        cache,
        config.default_region.clone(),
    ));
    let events: Arc<dyn EventPublisher> =
        Arc::new(KubeEventPublisher::new(client.clone(), REPORTING_CONTROLLER));

    let issuer_ctx = Arc::new(IssuerContext::new(
        resolver.clone(),
        issuer_store,
        events.clone(),
    ));
    let request_ctx = Arc::new(
        RequestContext::builder(Arc::new(KubeRequestStore::new(client.clone())), resolver.clone())
            .events(events)
            .config(&config)
            .build(),
    );

    let runtime_config = ControllerRuntimeConfig::default().concurrency(config.concurrency);
    let issuers: Api<AWSPCAIssuer> = Api::all(client.clone());
    let cluster_issuers: Api<AWSPCAClusterIssuer> = Api::all(client.clone());
    let requests: Api<CertificateRequest> = Api::all(client.clone());

    tracing::info!("Starting controllers...");
    tracing::info!("  - AWSPCAIssuer controller");
    tracing::info!("  - AWSPCAClusterIssuer controller");
    tracing::info!("  - CertificateRequest controller");

    let issuer_controller = Controller::new(issuers.clone(), WatcherConfig::default())
        .with_config(runtime_config.clone())
        .shutdown_on_signal()
        .run(
            issuer::reconcile,
            issuer::error_policy::<AWSPCAIssuer>,
            issuer_ctx.clone(),
        )
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Issuer reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Issuer reconciliation error");
                }
            }
        });

    let cluster_issuer_controller =
        Controller::new(cluster_issuers.clone(), WatcherConfig::default())
            .with_config(runtime_config.clone())
            .shutdown_on_signal()
            .run(
                issuer::reconcile_cluster,
                issuer::error_policy::<AWSPCAClusterIssuer>,
                issuer_ctx,
            )
            .for_each(|result| async move {
                match result {
                    Ok(action) => {
                        tracing::debug!(?action, "Cluster issuer reconciliation completed");
                    }
                    Err(e) => {
                        tracing::error!(error = ?e, "Cluster issuer reconciliation error");
                    }
                }
            });

    let request_controller = Controller::new(requests, WatcherConfig::default())
        .with_config(runtime_config)
        .shutdown_on_signal()
        .run(
            certificate_request::reconcile,
            certificate_request::error_policy,
            request_ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "CertificateRequest reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "CertificateRequest reconciliation error");
                }
            }
        });

    tokio::select! {
        _ = issuer_controller => {
            tracing::info!("Issuer controller completed");
        }
        _ = cluster_issuer_controller => {
            tracing::info!("Cluster issuer controller completed");
        }
        _ = request_controller => {
            tracing::info!("CertificateRequest controller completed");
        }
        _ = forget_deleted(issuers, resolver.clone()) => {
            tracing::info!("Issuer deletion watch completed");
        }
        _ = forget_deleted(cluster_issuers, resolver) => {
            tracing::info!("Cluster issuer deletion watch completed");
        }
    }

    tracing::info!("pca-issuer shutting down");
    Ok(())
}
