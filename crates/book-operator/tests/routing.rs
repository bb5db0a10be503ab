//! Routing tests: notifications through the router into the queue and back
//! out through the reconcile loop

mod common;

use book_operator::config::QueueConfig;
use book_operator::controller::ReconcileLoop;
use book_operator::informer::{Notification, Observed};
use book_operator::key::ObjectKey;
use book_operator::queue::WorkQueue;
use book_operator::router::EventRouter;
use book_operator::store::{ManagedKind, ManagedObject};
use common::{book_key, test_book, Harness};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::sync::Arc;
use std::time::Duration;

fn new_queue() -> Arc<WorkQueue<ObjectKey>> {
    Arc::new(WorkQueue::with_config(&QueueConfig::default()))
}

async fn next_key(queue: &WorkQueue<ObjectKey>) -> ObjectKey {
    tokio::time::timeout(Duration::from_secs(1), queue.get())
        .await
        .expect("nothing was queued")
        .expect("queue shut down")
}

#[tokio::test]
async fn test_object_owned_by_another_kind_is_ignored() {
    let h = Harness::new();
    h.store.put_book(test_book("lib"));
    let queue = new_queue();
    let router = EventRouter::new(queue.clone(), Arc::new(h.store.clone()));

    let replica_owned = Deployment {
        metadata: ObjectMeta {
            name: Some("lib".to_string()),
            namespace: Some("default".to_string()),
            resource_version: Some("7".to_string()),
            owner_references: Some(vec![OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "ReplicaSet".to_string(),
                // same name as the Book, which must not matter
                name: "example-book".to_string(),
                uid: "rs-uid".to_string(),
                controller: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        },
        ..Default::default()
    };

    router.on_managed(Notification::Added(Arc::new(replica_owned.clone())));
    router.on_managed(Notification::Deleted(Observed::Tombstone(Arc::new(
        replica_owned,
    ))));
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_book_changes_flow_through_to_managed_objects() {
    let h = Harness::new();
    let book = h.store.put_book(test_book("lib"));
    let queue = new_queue();
    let router = EventRouter::new(queue.clone(), Arc::new(h.store.clone()));
    let reconcile_loop = ReconcileLoop::new(queue.clone(), h.reconciler.clone());

    router.on_book(Notification::Added(book.clone()));
    // a resync of the same version adds nothing
    router.on_book(Notification::Updated {
        old: book.clone(),
        new: book.clone(),
    });
    assert_eq!(queue.len(), 1);

    let key = next_key(&queue).await;
    assert_eq!(key, book_key());
    reconcile_loop.process(&key).await;
    assert_eq!(h.store.object_count(), 5);
    assert!(queue.is_empty());

    // the sidecar service disappears behind the operator's back
    let Some(ManagedObject::Service(service)) =
        h.store
            .remove(ManagedKind::Service, "default", "lib-envoy-service")
    else {
        panic!("sidecar service was not created");
    };
    router.on_managed::<Service>(Notification::Deleted(Observed::Tombstone(Arc::new(service))));

    let key = next_key(&queue).await;
    assert_eq!(key, book_key());
    reconcile_loop.process(&key).await;
    assert!(h
        .store
        .object(ManagedKind::Service, "default", "lib-envoy-service")
        .is_some());
    assert_eq!(h.store.object_count(), 5);
}

#[tokio::test]
async fn test_objects_of_deleted_books_are_not_routed() {
    let h = Harness::new();
    let book = h.store.put_book(test_book("lib"));
    let queue = new_queue();
    let router = EventRouter::new(queue.clone(), Arc::new(h.store.clone()));
    let reconcile_loop = ReconcileLoop::new(queue.clone(), h.reconciler.clone());

    router.on_book(Notification::Added(book.clone()));
    let key = next_key(&queue).await;
    reconcile_loop.process(&key).await;

    let Some(ManagedObject::Deployment(primary)) =
        h.store.object(ManagedKind::Deployment, "default", "lib")
    else {
        panic!("primary workload was not created");
    };

    h.store.remove_book(&book_key());
    router.on_book(Notification::Deleted(Observed::Live(book)));
    router.on_managed(Notification::Deleted(Observed::Live(Arc::new(primary))));
    assert!(queue.is_empty());
}
