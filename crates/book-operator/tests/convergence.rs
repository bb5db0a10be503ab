//! Convergence tests against the in-memory store
//!
//! These tests verify the per-key sync behavior:
//! - Cold start creates all five managed objects
//! - Repeated syncs are idempotent under diff-gated policies
//! - Drift on the primary workload is corrected with one overwrite
//! - Foreign objects are never adopted
//! - Deleted Books and partial failures are tolerated

mod common;

use book_operator::crd::BookStatus;
use book_operator::error::OperatorError;
use book_operator::events::{Severity, REASON_RESOURCE_EXISTS, REASON_SYNCED};
use book_operator::plan::ConvergencePlan;
use book_operator::reconciler::SyncOutcome;
use book_operator::resources::{ResourceBuilder, ENVOY_CONFIG_KEY};
use book_operator::store::{BookLister, ManagedKind, ManagedObject, StoreCall, StoreOp};
use common::{book_key, test_book, Harness, ENVOY_DOCUMENT};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

fn deployment(object: ManagedObject) -> Deployment {
    match object {
        ManagedObject::Deployment(d) => d,
        other => panic!("expected a Deployment, got {:?}", other.kind()),
    }
}

fn owned_by_book(object: &ManagedObject) -> bool {
    object
        .metadata()
        .owner_references
        .iter()
        .flatten()
        .any(|o| o.controller == Some(true) && o.kind == "Book" && o.uid == "book-uid")
}

#[tokio::test]
async fn test_cold_start_convergence() {
    let h = Harness::new();
    h.store.put_book(test_book("lib"));

    let outcome = h.reconciler.sync(&book_key()).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced { writes: 6 });
    assert_eq!(h.store.object_count(), 5);

    let expected = [
        (ManagedKind::Deployment, "lib"),
        (ManagedKind::Service, "libservice"),
        (ManagedKind::ConfigMap, "lib-envoy-config"),
        (ManagedKind::Deployment, "lib-envoy"),
        (ManagedKind::Service, "lib-envoy-service"),
    ];
    for (kind, name) in expected {
        let object = h
            .store
            .object(kind, "default", name)
            .unwrap_or_else(|| panic!("{} {} missing", kind, name));
        assert!(owned_by_book(&object), "{} {} is not owned by the book", kind, name);
    }

    let primary = deployment(h.store.object(ManagedKind::Deployment, "default", "lib").unwrap());
    let spec = primary.spec.unwrap();
    assert_eq!(spec.replicas, Some(2));
    let container = &spec.template.spec.unwrap().containers[0];
    assert_eq!(container.image.as_deref(), Some("x:1"));
    assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 8080);

    match h.store.object(ManagedKind::ConfigMap, "default", "lib-envoy-config") {
        Some(ManagedObject::ConfigMap(cm)) => {
            assert_eq!(
                cm.data.unwrap().get(ENVOY_CONFIG_KEY).map(String::as_str),
                Some(ENVOY_DOCUMENT)
            );
        }
        other => panic!("unexpected sidecar config: {:?}", other),
    }

    let status_writes: Vec<_> = h
        .store
        .journal()
        .into_iter()
        .filter(|c| c.op() == StoreOp::UpdateStatus)
        .collect();
    assert_eq!(
        status_writes,
        vec![StoreCall::UpdateStatus {
            key: book_key(),
            status: BookStatus {
                available_replicas: 0
            },
        }]
    );

    let synced = h.events.with_reason(REASON_SYNCED);
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0].severity, Severity::Normal);
}

#[tokio::test]
async fn test_status_mirrors_observed_replicas() {
    let h = Harness::new();
    let original = h.store.put_book(test_book("lib"));
    h.reconciler.sync(&book_key()).await.unwrap();

    h.store.set_available_replicas("default", "lib", 2);
    h.reconciler.sync(&book_key()).await.unwrap();

    let book = BookLister::get(&h.store, &book_key()).unwrap();
    assert_eq!(book.status, Some(BookStatus { available_replicas: 2 }));
    assert_eq!(book.spec, original.spec);
}

#[tokio::test]
async fn test_second_sync_is_write_free_when_diff_gated() {
    let h = Harness::with_plan(ConvergencePlan::diff_gated());
    h.store.put_book(test_book("lib"));
    h.reconciler.sync(&book_key()).await.unwrap();
    h.store.clear_journal();

    let outcome = h.reconciler.sync(&book_key()).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Synced { writes: 0 });
    assert!(h.store.journal().is_empty());
}

#[tokio::test]
async fn test_second_sync_reapplies_only_services_by_default() {
    let h = Harness::new();
    h.store.put_book(test_book("lib"));
    h.reconciler.sync(&book_key()).await.unwrap();
    h.store.clear_journal();

    h.reconciler.sync(&book_key()).await.unwrap();
    let targets: Vec<_> = h
        .store
        .journal()
        .iter()
        .map(|c| (c.op(), c.target().map(|(k, n)| (k, n.to_string()))))
        .collect();
    assert_eq!(
        targets,
        vec![
            (
                StoreOp::Update,
                Some((ManagedKind::Service, "libservice".to_string()))
            ),
            (
                StoreOp::Update,
                Some((ManagedKind::Service, "lib-envoy-service".to_string()))
            ),
        ]
    );
}

#[tokio::test]
async fn test_drift_on_primary_workload_is_corrected() {
    let h = Harness::with_plan(ConvergencePlan::diff_gated());
    let mut book = test_book("lib");
    h.store.put_book(book.clone());
    h.reconciler.sync(&book_key()).await.unwrap();
    h.store.clear_journal();

    // keep the status written by the first sync, as a spec edit would
    book.status = BookLister::get(&h.store, &book_key()).unwrap().status.clone();
    book.spec.replicas = Some(3);
    let stored = h.store.put_book(book);
    h.reconciler.sync(&book_key()).await.unwrap();

    let journal = h.store.journal();
    assert_eq!(journal.len(), 1, "unexpected writes: {:?}", journal);
    assert!(journal.iter().all(|c| c.op() != StoreOp::UpdateStatus));
    let StoreCall::Update(ManagedObject::Deployment(mut written)) = journal[0].clone() else {
        panic!("expected a Deployment update, got {:?}", journal[0]);
    };
    assert_eq!(written.spec.as_ref().unwrap().replicas, Some(3));
    assert!(written.metadata.resource_version.is_some());

    // everything but the version guard is the builder's output
    written.metadata.resource_version = None;
    let desired = ResourceBuilder::new(&stored).unwrap().primary_deployment();
    assert_eq!(written, desired);
}

#[tokio::test]
async fn test_drift_on_sidecar_workload_is_left_alone() {
    let h = Harness::with_plan(ConvergencePlan::diff_gated());
    let mut book = test_book("lib");
    h.store.put_book(book.clone());
    h.reconciler.sync(&book_key()).await.unwrap();
    h.store.clear_journal();

    book.spec.replicas = Some(3);
    h.store.put_book(book);
    h.reconciler.sync(&book_key()).await.unwrap();

    let sidecar = deployment(
        h.store
            .object(ManagedKind::Deployment, "default", "lib-envoy")
            .unwrap(),
    );
    assert_eq!(sidecar.spec.unwrap().replicas, Some(2));
}

#[tokio::test]
async fn test_foreign_primary_workload_is_not_adopted() {
    let h = Harness::new();
    h.store.put_book(test_book("lib"));
    let foreign = h.store.seed(ManagedObject::Deployment(Deployment {
        metadata: ObjectMeta {
            name: Some("lib".to_string()),
            namespace: Some("default".to_string()),
            owner_references: Some(vec![OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "ReplicaSet".to_string(),
                name: "someone-else".to_string(),
                uid: "other-uid".to_string(),
                controller: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        },
        ..Default::default()
    }));

    let err = h.reconciler.sync(&book_key()).await.unwrap_err();
    assert!(matches!(err, OperatorError::ResourceConflict { .. }));
    assert!(!err.is_retryable());

    // nothing past the conflicting step ran, and the foreign object is untouched
    assert!(h.store.journal().is_empty());
    assert_eq!(h.store.object_count(), 1);
    assert_eq!(
        h.store.object(ManagedKind::Deployment, "default", "lib"),
        Some(foreign)
    );

    let warnings = h.events.with_reason(REASON_RESOURCE_EXISTS);
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].severity, Severity::Warning);
    assert!(warnings[0].note.contains("\"lib\""));
    assert!(h.events.with_reason(REASON_SYNCED).is_empty());
}

#[tokio::test]
async fn test_unowned_primary_service_is_a_conflict() {
    let h = Harness::new();
    h.store.put_book(test_book("lib"));
    let book = BookLister::get(&h.store, &book_key()).unwrap();
    let mut service = ResourceBuilder::new(&book).unwrap().primary_service(None);
    service.metadata.owner_references = None;
    h.store.seed(ManagedObject::Service(service));

    let err = h.reconciler.sync(&book_key()).await.unwrap_err();
    assert!(err.is_ownership_conflict());

    // the primary workload step ran before the conflict
    let journal = h.store.journal();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].target(), Some((ManagedKind::Deployment, "lib")));
}

#[tokio::test]
async fn test_deleted_book_causes_no_writes() {
    let h = Harness::new();
    h.store.put_book(test_book("lib"));
    h.store.remove_book(&book_key());

    let outcome = h.reconciler.sync(&book_key()).await.unwrap();
    assert_eq!(outcome, SyncOutcome::BookGone);
    assert!(h.store.journal().is_empty());
    assert!(h.events.events().is_empty());
}

#[tokio::test]
async fn test_missing_deployment_name_causes_no_writes() {
    let h = Harness::new();
    h.store.put_book(test_book(""));

    let outcome = h.reconciler.sync(&book_key()).await.unwrap();
    assert_eq!(outcome, SyncOutcome::MissingDeploymentName);
    assert!(h.store.journal().is_empty());
}

#[tokio::test]
async fn test_failure_aborts_and_retry_restarts_from_the_top() {
    let h = Harness::new();
    h.store.put_book(test_book("lib"));
    h.store.fail_next(StoreOp::Create, Some("lib-envoy-config"));

    let err = h.reconciler.sync(&book_key()).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(h.store.object_count(), 2);
    assert!(h
        .store
        .object(ManagedKind::Deployment, "default", "lib-envoy")
        .is_none());
    assert!(h.store.journal().iter().all(|c| c.op() != StoreOp::UpdateStatus));

    h.store.clear_journal();
    let outcome = h.reconciler.sync(&book_key()).await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Synced { .. }));
    assert_eq!(h.store.object_count(), 5);

    // the already created objects were not created twice
    let creates: Vec<_> = h
        .store
        .journal()
        .iter()
        .filter(|c| c.op() == StoreOp::Create)
        .filter_map(|c| c.target().map(|(_, n)| n.to_string()))
        .collect();
    assert_eq!(
        creates,
        vec![
            "lib-envoy-config".to_string(),
            "lib-envoy".to_string(),
            "lib-envoy-service".to_string()
        ]
    );
}

#[tokio::test]
async fn test_externally_deleted_object_is_recreated() {
    let h = Harness::with_plan(ConvergencePlan::diff_gated());
    h.store.put_book(test_book("lib"));
    h.reconciler.sync(&book_key()).await.unwrap();

    h.store
        .remove(ManagedKind::Service, "default", "lib-envoy-service")
        .unwrap();
    h.store.clear_journal();

    h.reconciler.sync(&book_key()).await.unwrap();
    let journal = h.store.journal();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].op(), StoreOp::Create);
    assert_eq!(
        journal[0].target(),
        Some((ManagedKind::Service, "lib-envoy-service"))
    );
}
