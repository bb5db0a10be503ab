//! Book Controller
//!
//! This module wires the watch streams, the event router, the work queue and
//! a pool of workers that call [`Reconciler::sync`] for every queued key.

use crate::config::ControllerConfig;
use crate::crd::Book;
use crate::error::{OperatorError, Result};
use crate::events::KubeEventPublisher;
use crate::informer::{run_informer, Informer};
use crate::key::ObjectKey;
use crate::queue::WorkQueue;
use crate::reconciler::{Reconciler, SyncOutcome};
use crate::router::EventRouter;
use crate::sidecar::FileConfigSource;
use crate::store::{KubeStore, ReflectorLister};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::Api;
use kube::runtime::watcher;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
    /// Counter for ownership conflicts
    pub conflicts: metrics::Counter,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("book_operator_reconciliations_total"),
            errors: metrics::counter!("book_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("book_operator_reconciliation_duration_seconds"),
            conflicts: metrics::counter!("book_operator_conflicts_total"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool of workers draining the queue into the reconciler
#[derive(Clone)]
pub struct ReconcileLoop {
    queue: Arc<WorkQueue<ObjectKey>>,
    reconciler: Arc<Reconciler>,
    metrics: ControllerMetrics,
}

impl ReconcileLoop {
    pub fn new(queue: Arc<WorkQueue<ObjectKey>>, reconciler: Arc<Reconciler>) -> Self {
        Self {
            queue,
            reconciler,
            metrics: ControllerMetrics::new(),
        }
    }

    /// Run `workers` workers until `shutdown` fires or the queue shuts down.
    ///
    /// Cancellation stops workers from taking new keys; syncs already in
    /// flight run to completion before this returns.
    pub async fn run(&self, workers: usize, shutdown: CancellationToken) {
        let stopper = {
            let queue = self.queue.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                info!("Shutting down work queue");
                queue.shut_down();
            })
        };

        info!(workers, "Starting workers");
        let mut tasks = JoinSet::new();
        for id in 0..workers {
            let this = self.clone();
            tasks.spawn(async move { this.worker(id).await });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
            }
        }

        stopper.abort();
        info!("All workers stopped");
    }

    async fn worker(&self, id: usize) {
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
        }
        debug!(worker = id, "Worker stopped");
    }

    /// Sync one key and apply the requeue policy to the result
    pub async fn process(&self, key: &ObjectKey) {
        let start = Instant::now();
        self.metrics.reconciliations.increment(1);

        // a panicking sync must not take the worker down with it
        let reconciler = self.reconciler.clone();
        let task_key = key.clone();
        let result = match tokio::spawn(async move { reconciler.sync(&task_key).await }).await {
            Ok(result) => result,
            Err(e) => Err(OperatorError::Internal(format!("sync task failed: {}", e))),
        };

        self.metrics.duration.record(start.elapsed().as_secs_f64());

        match result {
            Ok(outcome) => {
                if let SyncOutcome::Synced { writes } = outcome {
                    debug!(book = %key, writes, "Successfully synced");
                }
                self.queue.forget(key);
            }
            Err(e) if e.is_retryable() => {
                self.metrics.errors.increment(1);
                error!(
                    book = %key,
                    retries = self.queue.num_requeues(key),
                    error = %e,
                    "Error syncing book, requeuing"
                );
                self.queue.add_rate_limited(key.clone());
            }
            Err(e) => {
                self.metrics.errors.increment(1);
                if e.is_ownership_conflict() {
                    self.metrics.conflicts.increment(1);
                }
                warn!(
                    book = %key,
                    error = %e,
                    "Sync failed permanently, waiting for the next change"
                );
                self.queue.forget(key);
            }
        }

        self.queue.done(key);
    }
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn spawn_managed_informer<K>(
    tasks: &mut JoinSet<()>,
    client: &Client,
    config: &ControllerConfig,
    router: &Arc<EventRouter>,
    shutdown: &CancellationToken,
) where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    let api = scoped_api::<K>(client, config.namespace.as_deref());
    let watch_config = watcher::Config::default().labels(&config.managed_selector);
    let router = router.clone();
    tasks.spawn(run_informer(
        api,
        watch_config,
        Informer::<K>::new(),
        move |n| router.on_managed(n),
        shutdown.clone(),
    ));
}

/// Start the Book controller and block until `shutdown` fires
pub async fn run_controller(
    client: Client,
    config: ControllerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    config.validate()?;

    info!(
        namespace = config.namespace.as_deref().unwrap_or("all"),
        workers = config.workers,
        "Starting Book controller"
    );

    let queue = Arc::new(WorkQueue::with_config(&config.queue));

    let book_informer = Informer::<Book>::new();
    let book_cache = book_informer.reader();
    let lister = Arc::new(ReflectorLister::new(book_cache.clone()));
    let router = Arc::new(EventRouter::new(queue.clone(), lister.clone()));

    let mut informers = JoinSet::new();
    {
        let router = router.clone();
        informers.spawn(run_informer(
            scoped_api::<Book>(&client, config.namespace.as_deref()),
            watcher::Config::default(),
            book_informer,
            move |n| router.on_book(n),
            shutdown.clone(),
        ));
    }
    spawn_managed_informer::<Deployment>(&mut informers, &client, &config, &router, &shutdown);
    spawn_managed_informer::<Service>(&mut informers, &client, &config, &router, &shutdown);
    spawn_managed_informer::<ConfigMap>(&mut informers, &client, &config, &router, &shutdown);

    let reconciler = Reconciler::new(
        lister,
        Arc::new(KubeStore::new(client.clone())),
        Arc::new(KubeEventPublisher::new(client, std::env::var("POD_NAME").ok())),
        Arc::new(FileConfigSource::new(config.envoy_config_path.clone())),
    )
    .with_plan(config.policies.plan())
    .with_settings(config.build_settings());

    info!("Waiting for book cache to sync");
    tokio::select! {
        ready = book_cache.wait_until_ready() => {
            ready.map_err(|e| OperatorError::Internal(format!("book cache failed to sync: {}", e)))?;
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown requested before cache sync");
            informers.shutdown().await;
            return Ok(());
        }
    }
    info!("Book cache synced");

    ReconcileLoop::new(queue, Arc::new(reconciler))
        .run(config.workers, shutdown.clone())
        .await;

    // workers only stop on shutdown, which also ends the informers
    shutdown.cancel();
    while informers.join_next().await.is_some() {}

    info!("Book controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::crd::{BookContainer, BookContainerPort, BookSpec};
    use crate::events::MemoryEventPublisher;
    use crate::sidecar::StaticConfigSource;
    use crate::store::{ManagedKind, ManagedObject, MemoryStore, StoreOp};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::time::Duration;

    fn create_test_book() -> Book {
        Book {
            metadata: ObjectMeta {
                name: Some("example-book".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("book-uid".to_string()),
                ..Default::default()
            },
            spec: BookSpec {
                deployment_name: "lib".to_string(),
                replicas: Some(2),
                container: BookContainer {
                    image: "x:1".to_string(),
                    ports: vec![BookContainerPort {
                        container_port: 8080,
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            },
            status: None,
        }
    }

    fn setup() -> (ReconcileLoop, Arc<WorkQueue<ObjectKey>>, MemoryStore) {
        let store = MemoryStore::new();
        let queue = Arc::new(WorkQueue::with_config(&QueueConfig::default()));
        let reconciler = Reconciler::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(MemoryEventPublisher::new()),
            Arc::new(StaticConfigSource::new("admin: {}")),
        );
        (
            ReconcileLoop::new(queue.clone(), Arc::new(reconciler)),
            queue,
            store,
        )
    }

    fn key() -> ObjectKey {
        ObjectKey::new("default", "example-book")
    }

    #[tokio::test]
    async fn test_success_forgets_key() {
        let (workers, queue, store) = setup();
        store.put_book(create_test_book());

        queue.add(key());
        let item = queue.get().await.unwrap();
        workers.process(&item).await;

        assert_eq!(queue.num_requeues(&key()), 0);
        assert!(queue.is_empty());
        assert_eq!(store.object_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_is_requeued() {
        let (workers, queue, store) = setup();
        store.put_book(create_test_book());
        store.fail_next(StoreOp::Get, None);

        queue.add(key());
        let item = queue.get().await.unwrap();
        workers.process(&item).await;
        assert_eq!(queue.num_requeues(&key()), 1);

        // delivered again once the backoff elapses
        let item = queue.get().await.unwrap();
        workers.process(&item).await;
        assert_eq!(queue.num_requeues(&key()), 0);
        assert_eq!(store.object_count(), 5);
    }

    #[tokio::test]
    async fn test_ownership_conflict_is_not_requeued() {
        let (workers, queue, store) = setup();
        store.put_book(create_test_book());
        store.seed(ManagedObject::Deployment(Deployment {
            metadata: ObjectMeta {
                name: Some("lib".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }));

        queue.add(key());
        let item = queue.get().await.unwrap();
        workers.process(&item).await;

        assert_eq!(queue.num_requeues(&key()), 0);
        assert!(queue.is_empty());
        assert_eq!(store.object_count(), 1);
        assert!(store
            .object(ManagedKind::Service, "default", "libservice")
            .is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (workers, queue, store) = setup();
        store.put_book(create_test_book());
        queue.add(key());

        let shutdown = CancellationToken::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { workers.run(2, shutdown).await })
        };

        // wait for the first sync to land
        for _ in 0..100 {
            if store.object_count() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.object_count(), 5);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("workers stop after cancellation")
            .unwrap();
        assert!(queue.is_shutting_down());
    }
}
