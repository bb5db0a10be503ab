//! Shared fixtures for the integration tests

#![allow(dead_code)]

use book_operator::crd::{Book, BookContainer, BookContainerPort, BookSpec};
use book_operator::events::MemoryEventPublisher;
use book_operator::key::ObjectKey;
use book_operator::plan::ConvergencePlan;
use book_operator::reconciler::Reconciler;
use book_operator::sidecar::StaticConfigSource;
use book_operator::store::MemoryStore;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::sync::Arc;

pub const ENVOY_DOCUMENT: &str = "admin:\n  address:\n    socket_address: { address: 0.0.0.0, port_value: 8001 }\n";

/// Book `default/example-book` with two replicas of `x:1` on port 8080
pub fn test_book(deployment_name: &str) -> Book {
    Book {
        metadata: ObjectMeta {
            name: Some("example-book".to_string()),
            namespace: Some("default".to_string()),
            uid: Some("book-uid".to_string()),
            ..Default::default()
        },
        spec: BookSpec {
            deployment_name: deployment_name.to_string(),
            replicas: Some(2),
            container: BookContainer {
                name: None,
                image: "x:1".to_string(),
                image_pull_policy: None,
                ports: vec![BookContainerPort {
                    name: None,
                    container_port: 8080,
                    protocol: None,
                }],
            },
        },
        status: None,
    }
}

pub fn book_key() -> ObjectKey {
    ObjectKey::new("default", "example-book")
}

/// Reconciler over an in-memory store
pub struct Harness {
    pub store: MemoryStore,
    pub events: MemoryEventPublisher,
    pub reconciler: Arc<Reconciler>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_plan(ConvergencePlan::default())
    }

    pub fn with_plan(plan: ConvergencePlan) -> Self {
        let store = MemoryStore::new();
        let events = MemoryEventPublisher::new();
        let reconciler = Reconciler::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(events.clone()),
            Arc::new(StaticConfigSource::new(ENVOY_DOCUMENT)),
        )
        .with_plan(plan);
        Self {
            store,
            events,
            reconciler: Arc::new(reconciler),
        }
    }
}
