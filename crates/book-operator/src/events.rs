//! Kubernetes Events emitted against Books

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// Reporter name shown on recorded events
pub const REPORTER: &str = "book-operator";

/// Reason when a Book converged
pub const REASON_SYNCED: &str = "Synced";

/// Reason when a managed name is taken by a foreign object
pub const REASON_RESOURCE_EXISTS: &str = "ErrResourceExists";

/// Reason when a Book's spec fails validation
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";

/// Message recorded with [`REASON_SYNCED`]
pub const MESSAGE_SYNCED: &str = "Book synced successfully";

/// Message recorded with [`REASON_RESOURCE_EXISTS`]
pub fn message_resource_exists(name: &str) -> String {
    format!("Resource \"{}\" already exists and is not managed by Book", name)
}

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

impl From<Severity> for EventType {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Normal => EventType::Normal,
            Severity::Warning => EventType::Warning,
        }
    }
}

/// Fire-and-forget audit sink
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, reference: &ObjectReference, severity: Severity, reason: &str, note: String);
}

/// Publishes events through the Kubernetes events API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: REPORTER.to_string(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, reference: &ObjectReference, severity: Severity, reason: &str, note: String) {
        let event = Event {
            type_: severity.into(),
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconciling".to_string(),
            secondary: None,
        };

        if let Err(e) = self.recorder.publish(&event, reference).await {
            warn!(
                error = %e,
                reason = reason,
                object = reference.name.as_deref().unwrap_or_default(),
                "Failed to publish event"
            );
        }
    }
}

/// An event captured by [`MemoryEventPublisher`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub object: String,
    pub severity: Severity,
    pub reason: String,
    pub note: String,
}

/// Keeps published events in memory
#[derive(Clone, Default)]
pub struct MemoryEventPublisher {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl MemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Events carrying the given reason
    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.reason == reason)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventPublisher {
    async fn publish(&self, reference: &ObjectReference, severity: Severity, reason: &str, note: String) {
        let object = format!(
            "{}/{}",
            reference.namespace.as_deref().unwrap_or_default(),
            reference.name.as_deref().unwrap_or_default()
        );
        self.events.lock().push(RecordedEvent {
            object,
            severity,
            reason: reason.to_string(),
            note,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message_names_resource() {
        assert_eq!(
            message_resource_exists("lib"),
            "Resource \"lib\" already exists and is not managed by Book"
        );
    }

    #[tokio::test]
    async fn test_memory_publisher_records() {
        let publisher = MemoryEventPublisher::new();
        let reference = ObjectReference {
            name: Some("example-book".to_string()),
            namespace: Some("default".to_string()),
            kind: Some("Book".to_string()),
            ..Default::default()
        };

        publisher
            .publish(&reference, Severity::Normal, REASON_SYNCED, MESSAGE_SYNCED.to_string())
            .await;
        publisher
            .publish(
                &reference,
                Severity::Warning,
                REASON_RESOURCE_EXISTS,
                message_resource_exists("lib"),
            )
            .await;

        assert_eq!(publisher.events().len(), 2);
        let warnings = publisher.with_reason(REASON_RESOURCE_EXISTS);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].object, "default/example-book");
        assert_eq!(warnings[0].severity, Severity::Warning);
    }
}
