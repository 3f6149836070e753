//! Request lifecycle: sign, poll, complete

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::runtime::controller::Action;

use pca_issuer::controller::{certificate_request, issuer, DENIED_MESSAGE, ISSUED_MESSAGE};
use pca_issuer::crd::{
    find_condition, AWSPCAClusterIssuer, AwsPcaClusterIssuerSpec, AwsPcaIssuerSpec,
    CertificateRequest, Condition, ConditionStatus, IssuerKey, SecretReference,
    CONDITION_DENIED, CONDITION_READY, REASON_DENIED, REASON_ISSUED, REASON_PENDING,
};
use pca_issuer::pca::signing::idempotency_token;
use pca_issuer::{CERTIFICATE_ARN_ANNOTATION, CLUSTER_ISSUER_KIND};

use super::fakes::{
    approved_request, issuer as namespaced_issuer, issuer_spec, pem_block, Harness, CA_ARN,
    RETRY_DELAY,
};

async fn reconcile_request(h: &Harness, namespace: &str, name: &str) -> Action {
    let request = Arc::new(h.cluster.request(namespace, name));
    certificate_request::reconcile(request, h.request_ctx.clone())
        .await
        .expect("request reconcile failed")
}

async fn verify_issuer(h: &Harness, namespace: &str, name: &str) {
    let action = issuer::reconcile(
        Arc::new(h.cluster.issuer(namespace, name)),
        h.issuer_ctx.clone(),
    )
    .await
    .expect("issuer reconcile failed");
    assert_eq!(action, Action::await_change());
}

fn ready(request: &CertificateRequest) -> Condition {
    request
        .status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, CONDITION_READY))
        .cloned()
        .expect("Ready condition missing")
}

#[tokio::test]
async fn request_is_issued_after_sign_and_poll() {
    let h = Harness::new(1);
    h.cluster.add_issuer(namespaced_issuer("ns1", "issuer1", issuer_spec()));
    verify_issuer(&h, "ns1", "issuer1").await;
    h.cluster.add_request(approved_request("ns1", "cr1"));
    let before = Utc::now();

    // sign: ARN recorded, nothing else written
    assert_eq!(
        reconcile_request(&h, "ns1", "cr1").await,
        Action::requeue(Duration::ZERO)
    );
    let request = h.cluster.request("ns1", "cr1");
    let token = idempotency_token("ns1", "cr1");
    let expected_arn = format!("{CA_ARN}/certificate/{token}");
    assert_eq!(request.certificate_arn(), Some(expected_arn.as_str()));
    assert_eq!(h.cluster.status_writes(), 0);

    let calls = h.pca.issue_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].idempotency_token, token);
    assert_eq!(calls[0].signing_algorithm, "SHA256WITHRSA");
    assert_eq!(
        calls[0].template_arn,
        "arn:aws:acm-pca:::template/EndEntityServerAuthCertificate/V1"
    );
    assert!(calls[0].not_after >= before + chrono::Duration::hours(2160));

    // poll: CA still issuing
    assert_eq!(
        reconcile_request(&h, "ns1", "cr1").await,
        Action::requeue(RETRY_DELAY)
    );
    let pending = ready(&h.cluster.request("ns1", "cr1"));
    assert_eq!(pending.status, ConditionStatus::False);
    assert_eq!(pending.reason, REASON_PENDING);

    // poll: issued
    assert_eq!(
        reconcile_request(&h, "ns1", "cr1").await,
        Action::await_change()
    );
    let request = h.cluster.request("ns1", "cr1");
    let issued = ready(&request);
    assert_eq!(issued.status, ConditionStatus::True);
    assert_eq!(issued.reason, REASON_ISSUED);
    assert_eq!(issued.message, ISSUED_MESSAGE);
    let status = request.status.clone().unwrap();
    assert_eq!(
        status.certificate.unwrap().0,
        format!("{}{}", pem_block(1), pem_block(2)).into_bytes()
    );
    assert_eq!(status.ca.unwrap().0, pem_block(3).into_bytes());

    // terminal: nothing happens any more
    let writes = h.cluster.status_writes();
    for _ in 0..3 {
        assert_eq!(
            reconcile_request(&h, "ns1", "cr1").await,
            Action::await_change()
        );
    }
    assert_eq!(h.cluster.status_writes(), writes);
    assert_eq!(h.pca.issue_calls().len(), 1);
    assert_eq!(h.pca.describe_calls(), 1);
}

#[tokio::test]
async fn stale_request_cannot_record_a_second_arn() {
    let h = Harness::new(0);
    h.cluster.add_issuer(namespaced_issuer("ns1", "issuer1", issuer_spec()));
    verify_issuer(&h, "ns1", "issuer1").await;
    h.cluster.add_request(approved_request("ns1", "cr1"));
    let stale = Arc::new(h.cluster.request("ns1", "cr1"));

    reconcile_request(&h, "ns1", "cr1").await;
    let recorded = h.cluster.request("ns1", "cr1").certificate_arn().map(str::to_string);

    // an outdated copy signs again with the same token and loses the write
    let action = certificate_request::reconcile(stale, h.request_ctx.clone())
        .await
        .unwrap();
    assert_eq!(action, Action::requeue(RETRY_DELAY));

    let calls = h.pca.issue_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].idempotency_token, calls[1].idempotency_token);
    let request = h.cluster.request("ns1", "cr1");
    assert_eq!(request.certificate_arn().map(str::to_string), recorded);
    assert_eq!(ready(&request).reason, REASON_PENDING);

    // the current object finishes normally
    assert_eq!(
        reconcile_request(&h, "ns1", "cr1").await,
        Action::await_change()
    );
    assert_eq!(ready(&h.cluster.request("ns1", "cr1")).reason, REASON_ISSUED);
}

#[tokio::test]
async fn request_waits_for_issuer_to_become_ready() {
    let h = Harness::new(0);
    h.cluster.add_issuer(namespaced_issuer("ns1", "issuer1", issuer_spec()));
    h.cluster.add_request(approved_request("ns1", "cr1"));

    assert_eq!(
        reconcile_request(&h, "ns1", "cr1").await,
        Action::requeue(RETRY_DELAY)
    );
    let waiting = ready(&h.cluster.request("ns1", "cr1"));
    assert_eq!(waiting.reason, REASON_PENDING);
    assert!(waiting.message.contains("is not ready"), "{}", waiting.message);
    assert!(h.pca.issue_calls().is_empty());

    verify_issuer(&h, "ns1", "issuer1").await;
    assert_eq!(
        reconcile_request(&h, "ns1", "cr1").await,
        Action::requeue(Duration::ZERO)
    );
    assert_eq!(
        reconcile_request(&h, "ns1", "cr1").await,
        Action::await_change()
    );
    assert_eq!(ready(&h.cluster.request("ns1", "cr1")).reason, REASON_ISSUED);
}

#[tokio::test]
async fn cluster_issuer_signs_for_any_namespace() {
    let h = Harness::new(0);
    h.cluster.add_cluster_issuer(AWSPCAClusterIssuer::new(
        "issuer1",
        AwsPcaClusterIssuerSpec {
            inner: issuer_spec(),
        },
    ));
    let action = issuer::reconcile_cluster(
        Arc::new(h.cluster.cluster_issuer("issuer1")),
        h.issuer_ctx.clone(),
    )
    .await
    .unwrap();
    assert_eq!(action, Action::await_change());

    for namespace in ["team-a", "team-b"] {
        let mut request = approved_request(namespace, "cr1");
        request.spec.issuer_ref.kind = CLUSTER_ISSUER_KIND.to_string();
        h.cluster.add_request(request);

        reconcile_request(&h, namespace, "cr1").await;
        reconcile_request(&h, namespace, "cr1").await;
        assert_eq!(
            ready(&h.cluster.request(namespace, "cr1")).reason,
            REASON_ISSUED
        );
    }

    assert!(h.cache.get(&IssuerKey::cluster("issuer1")).is_some());
    let tokens: Vec<_> = h
        .pca
        .issue_calls()
        .into_iter()
        .map(|c| c.idempotency_token)
        .collect();
    assert_eq!(tokens.len(), 2);
    assert_ne!(tokens[0], tokens[1]);
}

#[tokio::test]
async fn denied_request_is_never_signed() {
    let h = Harness::new(0);
    h.cluster.add_issuer(namespaced_issuer("ns1", "issuer1", issuer_spec()));
    verify_issuer(&h, "ns1", "issuer1").await;

    let mut request = approved_request("ns1", "cr1");
    request.status = Some(pca_issuer::crd::CertificateRequestStatus {
        conditions: vec![Condition::new(
            CONDITION_DENIED,
            ConditionStatus::True,
            "policy-approver",
            "not allowed",
        )],
        ..Default::default()
    });
    h.cluster.add_request(request);

    assert_eq!(
        reconcile_request(&h, "ns1", "cr1").await,
        Action::await_change()
    );
    let request = h.cluster.request("ns1", "cr1");
    let denied = ready(&request);
    assert_eq!(denied.reason, REASON_DENIED);
    assert_eq!(denied.message, DENIED_MESSAGE);
    let failure_time = request.status.as_ref().and_then(|s| s.failure_time);
    assert!(failure_time.is_some());

    reconcile_request(&h, "ns1", "cr1").await;
    let request = h.cluster.request("ns1", "cr1");
    assert_eq!(request.status.as_ref().and_then(|s| s.failure_time), failure_time);
    assert!(h.pca.issue_calls().is_empty());
    assert_eq!(h.cluster.status_writes(), 1);
}

#[tokio::test]
async fn restarted_controller_rebuilds_provisioner_on_demand() {
    let h = Harness::new(0);
    h.cluster.add_issuer(namespaced_issuer("ns1", "issuer1", issuer_spec()));
    verify_issuer(&h, "ns1", "issuer1").await;
    assert_eq!(h.factory.built().len(), 1);

    // cache lost, issuer still Ready
    h.cache.clear();
    h.cluster.add_request(approved_request("ns1", "cr1"));

    assert_eq!(
        reconcile_request(&h, "ns1", "cr1").await,
        Action::requeue(Duration::ZERO)
    );
    assert_eq!(h.factory.built().len(), 2);
    assert_eq!(h.cache.len(), 1);
}

#[tokio::test]
async fn deleted_issuer_is_forgotten() {
    let h = Harness::new(0);
    h.cluster.add_issuer(namespaced_issuer("ns1", "issuer1", issuer_spec()));
    verify_issuer(&h, "ns1", "issuer1").await;
    let key = IssuerKey::namespaced("ns1", "issuer1");
    assert!(h.cache.get(&key).is_some());

    h.cluster.delete_issuer("ns1", "issuer1");
    h.resolver.forget(&key);
    assert!(h.cache.is_empty());

    h.cluster.add_request(approved_request("ns1", "cr1"));
    assert_eq!(
        reconcile_request(&h, "ns1", "cr1").await,
        Action::requeue(RETRY_DELAY)
    );
    let waiting = ready(&h.cluster.request("ns1", "cr1"));
    assert!(
        waiting.message.contains("failed to retrieve Issuer resource"),
        "{}",
        waiting.message
    );
}

#[tokio::test]
async fn secret_credentials_reach_the_factory() {
    let h = Harness::new(0);
    h.cluster.add_secret(
        "ns1",
        "pca-creds",
        &[
            ("AWS_ACCESS_KEY_ID", "AKIAEXAMPLE"),
            ("AWS_SECRET_ACCESS_KEY", "secret\n"),
        ],
    );
    h.cluster.add_issuer(namespaced_issuer(
        "ns1",
        "issuer1",
        AwsPcaIssuerSpec {
            secret_ref: Some(SecretReference {
                name: "pca-creds".to_string(),
                ..Default::default()
            }),
            ..issuer_spec()
        },
    ));
    verify_issuer(&h, "ns1", "issuer1").await;

    let built = h.factory.built();
    let credentials = built[0].credentials.as_ref().unwrap();
    assert_eq!(credentials.access_key_id, "AKIAEXAMPLE");
    assert_eq!(credentials.secret_access_key, "secret");
    assert_eq!(built[0].region, "us-east-1");
}

#[tokio::test]
async fn annotation_key_is_stable() {
    let h = Harness::new(0);
    h.cluster.add_issuer(namespaced_issuer("ns1", "issuer1", issuer_spec()));
    verify_issuer(&h, "ns1", "issuer1").await;
    h.cluster.add_request(approved_request("ns1", "cr1"));

    reconcile_request(&h, "ns1", "cr1").await;
    let request = h.cluster.request("ns1", "cr1");
    assert!(request
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(CERTIFICATE_ARN_ANNOTATION)));
    assert_eq!(CERTIFICATE_ARN_ANNOTATION, "aws-privateca-issuer/certificate-arn");
}
