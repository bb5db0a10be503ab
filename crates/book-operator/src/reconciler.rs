//! Book convergence
//!
//! `sync` walks the [`ConvergencePlan`] in order. Each step fetches its
//! object from the store, creates it when absent, refuses to touch it when
//! another controller owns it, and otherwise applies the step's update
//! policy. Any error aborts the walk; a retried sync starts from the top, so
//! every step is safe to repeat against a partially converged namespace.

use crate::crd::{Book, BookStatus};
use crate::error::{OperatorError, Result};
use crate::events::{
    message_resource_exists, EventPublisher, Severity, MESSAGE_SYNCED, REASON_INVALID_SPEC,
    REASON_RESOURCE_EXISTS, REASON_SYNCED,
};
use crate::key::ObjectKey;
use crate::plan::{self, BuildSettings, ConvergencePlan, Step, UpdatePolicy};
use crate::resources::ResourceBuilder;
use crate::sidecar::SidecarConfigSource;
use crate::store::{BookLister, ManagedObject, ObjectStore};
use kube::Resource;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What a successful sync did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Every component converged; `writes` counts creates and updates
    Synced { writes: usize },
    /// The Book is gone from the cache
    BookGone,
    /// `spec.deploymentName` is blank; waiting for a spec update
    MissingDeploymentName,
}

/// Converges one Book per call
pub struct Reconciler {
    books: Arc<dyn BookLister>,
    store: Arc<dyn ObjectStore>,
    events: Arc<dyn EventPublisher>,
    sidecar_config: Arc<dyn SidecarConfigSource>,
    plan: ConvergencePlan,
    settings: BuildSettings,
}

impl Reconciler {
    pub fn new(
        books: Arc<dyn BookLister>,
        store: Arc<dyn ObjectStore>,
        events: Arc<dyn EventPublisher>,
        sidecar_config: Arc<dyn SidecarConfigSource>,
    ) -> Self {
        Self {
            books,
            store,
            events,
            sidecar_config,
            plan: ConvergencePlan::default(),
            settings: BuildSettings::default(),
        }
    }

    pub fn with_plan(mut self, plan: ConvergencePlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_settings(mut self, settings: BuildSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Drive the managed objects of the Book at `key` toward its spec
    #[instrument(skip_all, fields(book = %key))]
    pub async fn sync(&self, key: &ObjectKey) -> Result<SyncOutcome> {
        let Some(book) = self.books.get(key) else {
            debug!("Book no longer exists");
            return Ok(SyncOutcome::BookGone);
        };

        if book.spec.deployment_name.trim().is_empty() {
            warn!("deployment name must be specified");
            return Ok(SyncOutcome::MissingDeploymentName);
        }

        if let Err(message) = book.spec.check() {
            self.publish(&book, Severity::Warning, REASON_INVALID_SPEC, message.clone())
                .await;
            return Err(OperatorError::ValidationError(message));
        }

        let builder = ResourceBuilder::new(&book)?;
        let mut writes = 0;
        let mut available = 0;

        for step in self.plan.steps() {
            let (object, written) = self.converge(&book, &builder, *step).await?;
            if written {
                writes += 1;
            }
            if step.component == plan::Component::PrimaryWorkload {
                available = object.available_replicas();
            }
        }

        if self.publish_status(&book, available).await? {
            writes += 1;
        }

        self.publish(&book, Severity::Normal, REASON_SYNCED, MESSAGE_SYNCED.to_string())
            .await;
        info!(writes, available, "Book synced");

        Ok(SyncOutcome::Synced { writes })
    }

    /// Converge one component; returns the resulting object and whether it was written
    async fn converge(
        &self,
        book: &Book,
        builder: &ResourceBuilder<'_>,
        step: Step,
    ) -> Result<(ManagedObject, bool)> {
        let component = step.component;
        let kind = component.kind();
        let name = component.object_name(&book.spec.deployment_name);
        let namespace = builder.namespace();

        let Some(observed) = self.store.get(kind, namespace, &name).await? else {
            let desired = self.desired(step, builder)?;
            info!(%component, %kind, %name, "Creating managed object");
            let created = self.store.create(desired).await?;
            return Ok((created, true));
        };

        self.verify_ownership(book, &observed).await?;

        match step.policy {
            UpdatePolicy::CreateOnly => Ok((observed, false)),
            UpdatePolicy::DiffGated => {
                let desired = self.desired(step, builder)?;
                let drift = plan::drift(&desired, &observed);
                if drift.is_empty() {
                    debug!(%component, %name, "Up to date");
                    return Ok((observed, false));
                }
                info!(%component, %name, ?drift, "Updating drifted object");
                self.overwrite(desired, &observed).await
            }
            UpdatePolicy::AlwaysUpdate => {
                let desired = self.desired(step, builder)?;
                debug!(%component, %name, "Re-applying object");
                self.overwrite(desired, &observed).await
            }
        }
    }

    fn desired(&self, step: Step, builder: &ResourceBuilder<'_>) -> Result<ManagedObject> {
        let document = if step.component.needs_sidecar_document() {
            Some(self.sidecar_config.load()?)
        } else {
            None
        };
        Ok(step.component.desired(builder, &self.settings, document))
    }

    /// Full-object replace guarded by the observed resource version
    async fn overwrite(
        &self,
        mut desired: ManagedObject,
        observed: &ManagedObject,
    ) -> Result<(ManagedObject, bool)> {
        desired.metadata_mut().resource_version = observed.resource_version().map(str::to_string);
        let updated = self.store.update(desired).await?;
        Ok((updated, true))
    }

    /// Refuse to manage an object this Book does not control
    async fn verify_ownership(&self, book: &Book, observed: &ManagedObject) -> Result<()> {
        let controlled = observed
            .metadata()
            .owner_references
            .iter()
            .flatten()
            .any(|owner| book.controls(owner));
        if controlled {
            return Ok(());
        }

        warn!(kind = %observed.kind(), name = observed.name(), "Object exists and is not owned by this book");
        self.publish(
            book,
            Severity::Warning,
            REASON_RESOURCE_EXISTS,
            message_resource_exists(observed.name()),
        )
        .await;

        Err(OperatorError::ResourceConflict {
            kind: observed.kind().to_string(),
            name: observed.name().to_string(),
        })
    }

    /// Write `status.availableReplicas` when it changed; returns whether it wrote
    async fn publish_status(&self, book: &Book, available: i32) -> Result<bool> {
        let current = book.status.as_ref().map(|s| s.available_replicas);
        if current == Some(available) {
            return Ok(false);
        }
        self.store
            .update_book_status(
                book,
                BookStatus {
                    available_replicas: available,
                },
            )
            .await?;
        Ok(true)
    }

    async fn publish(&self, book: &Book, severity: Severity, reason: &str, note: String) {
        self.events
            .publish(&book.object_ref(&()), severity, reason, note)
            .await;
    }
}
