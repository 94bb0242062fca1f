mod common;

use bucketgate::{
    AdmissionConfig, AdmissionEvent, Bucket, BucketBinding, InMemoryConfigSource, PriorityBand,
    Rule, RuleField,
};
use common::test_helpers::{eventually, request, start};
use http::{Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower::{service_fn, Layer, ServiceExt};

fn echo(req: Request<String>) -> std::future::Ready<Result<Response<String>, Infallible>> {
    std::future::ready(Ok(Response::new(req.uri().path().to_string())))
}

fn no_spare_quota() -> AdmissionConfig {
    AdmissionConfig::default().with_catch_all_shared_quota(0)
}

fn nodes_source(reserved: u32) -> Arc<InMemoryConfigSource> {
    let source = Arc::new(InMemoryConfigSource::new());
    source.apply_bucket(Bucket::new("nodes", PriorityBand::Medium).with_reserved_quota(reserved));
    source.apply_binding(
        BucketBinding::new("nodes", "nodes").with_rule(Rule::new(RuleField::Resource, ["nodes"])),
    );
    source
}

#[tokio::test]
async fn raising_quota_admits_a_waiting_request() {
    let source = nodes_source(0);
    let (control, _sink, tasks) = start(&source, no_spare_quota()).await;
    let svc = control.layer().layer(service_fn(echo));

    let waiting =
        tokio::spawn(svc.oneshot(request(Method::GET, "/api/v1/nodes/n1", "kubelet", &[])));
    eventually(|| control.drainer().outstanding() == 1).await;

    source.apply_bucket(Bucket::new("nodes", PriorityBand::Medium).with_reserved_quota(1));
    let response = waiting.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(control.drainer().tracker().remaining_reserved("nodes"), 1);
    tasks.abort();
}

#[tokio::test]
async fn new_binding_reroutes_requests() {
    let source = nodes_source(1);
    let (control, sink, tasks) = start(&source, AdmissionConfig::default()).await;
    let svc = control.layer().layer(service_fn(echo));

    source.apply_bucket(Bucket::new("ops", PriorityBand::Top).with_reserved_quota(1));
    source.apply_binding(
        BucketBinding::new("ops", "ops").with_rule(Rule::new(RuleField::UserGroups, ["ops"])),
    );
    eventually(|| control.drainer().snapshot().bindings().len() == 2).await;

    svc.oneshot(request(Method::GET, "/api/v1/nodes", "carol", &["ops"])).await.unwrap();
    assert!(sink.events().iter().any(
        |event| matches!(event, AdmissionEvent::Granted { bucket, .. } if bucket == "ops")
    ));
    tasks.abort();
}

#[tokio::test(start_paused = true)]
async fn waiter_for_deleted_bucket_is_parked_until_timeout() {
    let source = nodes_source(0);
    let config = no_spare_quota().with_wait_timeout(Duration::from_secs(3)).unwrap();
    let (control, sink, tasks) = start(&source, config).await;
    let svc = control.layer().layer(service_fn(echo));

    let waiting =
        tokio::spawn(svc.oneshot(request(Method::DELETE, "/api/v1/nodes/n1", "kubelet", &[])));
    eventually(|| control.drainer().outstanding() == 1).await;

    source.delete_bucket("nodes");
    eventually(|| control.drainer().tracker().listener_count("nodes") == 1).await;
    assert!(sink.events().contains(&AdmissionEvent::Parked { bucket: "nodes".into() }));

    let response = waiting.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(control.drainer().outstanding(), 0);
    tasks.abort();
}

#[tokio::test]
async fn source_outage_keeps_serving_from_last_snapshot() {
    let source = nodes_source(1);
    let (control, sink, tasks) = start(&source, AdmissionConfig::default()).await;
    let svc = control.layer().layer(service_fn(echo));

    source.set_unavailable(true);
    assert!(control.watcher().resync().await.is_err());
    assert!(sink
        .events()
        .iter()
        .any(|event| matches!(event, AdmissionEvent::ConfigSourceFailed { .. })));

    let response =
        svc.oneshot(request(Method::GET, "/api/v1/nodes/n1", "kubelet", &[])).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(control.drainer().snapshot().bucket("nodes").map(|b| b.reserved_quota), Some(1));
    tasks.abort();
}
