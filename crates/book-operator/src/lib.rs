//! # Book Kubernetes Operator
//!
//! Kubernetes controller that converges `Book` custom resources into a
//! server workload fronted by an Envoy sidecar.
//!
//! For every Book the operator keeps five managed objects in the Book's
//! namespace, all named after `spec.deploymentName` and all carrying the
//! Book as controller owner:
//!
//! | Object | Name | Kind |
//! |---|---|---|
//! | primary workload | `<name>` | Deployment |
//! | primary service | `<name>service` | NodePort Service |
//! | sidecar configuration | `<name>-envoy-config` | ConfigMap |
//! | sidecar workload | `<name>-envoy` | Deployment |
//! | sidecar service | `<name>-envoy-service` | LoadBalancer Service |
//!
//! The primary workload's available replica count is mirrored into
//! `status.availableReplicas`.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use book_operator::prelude::*;
//! use kube::Client;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     run_controller(client, ControllerConfig::default(), CancellationToken::new()).await
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Watch**: [`informer`] turns watch streams for Books and managed
//!    objects into [`informer::Notification`]s
//! 2. **Route**: [`router`] maps each notification to the key of the owning
//!    Book, dropping resyncs and objects this operator does not control
//! 3. **Queue**: [`queue`] deduplicates keys, guarantees a key is never
//!    processed by two workers at once and rate-limits retries
//! 4. **Reconcile**: [`reconciler`] walks the [`plan`] for the Book, creating
//!    missing objects and updating existing ones according to their policy
//! 5. **Report**: status is written back to the Book and a Kubernetes Event
//!    is recorded through [`events`]
//!
//! ## Update Policies
//!
//! | Component | Default |
//! |---|---|
//! | primary workload | diff-gated (replicas, image, port) |
//! | primary service | always update |
//! | sidecar configuration | create only |
//! | sidecar workload | create only |
//! | sidecar service | always update |
//!
//! The service policy can be switched to diff-gated with `--service-policy`.
//!
//! ## Example Book
//!
//! ```yaml
//! apiVersion: simplecustomcontroller.crd.com/v1
//! kind: Book
//! metadata:
//!   name: example-book
//! spec:
//!   deploymentName: lib
//!   replicas: 2
//!   container:
//!     image: x:1
//!     ports:
//!       - containerPort: 8080
//! ```
//!
//! ## Metrics
//!
//! - `book_operator_reconciliations_total` - Total sync attempts
//! - `book_operator_reconciliation_errors_total` - Failed syncs
//! - `book_operator_reconciliation_duration_seconds` - Sync latency
//! - `book_operator_conflicts_total` - Ownership conflicts
//! - `book_operator_workqueue_depth` - Keys ready for processing
//! - `book_operator_workqueue_adds_total` - Keys added
//! - `book_operator_workqueue_retries_total` - Rate-limited requeues

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod informer;
pub mod key;
pub mod plan;
pub mod queue;
pub mod reconciler;
pub mod resources;
pub mod router;
pub mod sidecar;
pub mod store;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::config::{ControllerConfig, PolicyConfig, QueueConfig};
    pub use crate::controller::{run_controller, ControllerMetrics, ReconcileLoop};
    pub use crate::crd::{Book, BookContainer, BookContainerPort, BookSpec, BookStatus};
    pub use crate::error::{OperatorError, Result};
    pub use crate::events::{EventPublisher, KubeEventPublisher, MemoryEventPublisher, Severity};
    pub use crate::informer::{Notification, Observed};
    pub use crate::key::ObjectKey;
    pub use crate::plan::{Component, ConvergencePlan, UpdatePolicy};
    pub use crate::queue::WorkQueue;
    pub use crate::reconciler::{Reconciler, SyncOutcome};
    pub use crate::resources::ResourceBuilder;
    pub use crate::router::EventRouter;
    pub use crate::sidecar::{FileConfigSource, SidecarConfigSource, StaticConfigSource};
    pub use crate::store::{
        BookLister, KubeStore, ManagedKind, ManagedObject, MemoryStore, ObjectStore,
    };
}
