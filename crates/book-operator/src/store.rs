//! Object store access
//!
//! The reconciler reads Books from a local cache and reads/writes managed
//! objects through [`ObjectStore`]. [`KubeStore`] talks to the API server,
//! [`MemoryStore`] is an in-process store with the same conflict semantics.

use crate::crd::{Book, BookStatus};
use crate::error::{OperatorError, Result};
use crate::key::ObjectKey;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, Resource};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "book-operator";

/// Kinds of objects the operator manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ManagedKind {
    Deployment,
    Service,
    ConfigMap,
}

impl ManagedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagedKind::Deployment => "Deployment",
            ManagedKind::Service => "Service",
            ManagedKind::ConfigMap => "ConfigMap",
        }
    }
}

impl fmt::Display for ManagedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A managed object of any supported kind
#[derive(Debug, Clone, PartialEq)]
pub enum ManagedObject {
    Deployment(Deployment),
    Service(Service),
    ConfigMap(ConfigMap),
}

impl ManagedObject {
    pub fn kind(&self) -> ManagedKind {
        match self {
            ManagedObject::Deployment(_) => ManagedKind::Deployment,
            ManagedObject::Service(_) => ManagedKind::Service,
            ManagedObject::ConfigMap(_) => ManagedKind::ConfigMap,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            ManagedObject::Deployment(d) => &d.metadata,
            ManagedObject::Service(s) => &s.metadata,
            ManagedObject::ConfigMap(c) => &c.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            ManagedObject::Deployment(d) => &mut d.metadata,
            ManagedObject::Service(s) => &mut s.metadata,
            ManagedObject::ConfigMap(c) => &mut c.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata().resource_version.as_deref()
    }

    /// Available replicas reported by a Deployment's status; zero otherwise
    pub fn available_replicas(&self) -> i32 {
        match self {
            ManagedObject::Deployment(d) => d
                .status
                .as_ref()
                .and_then(|s| s.available_replicas)
                .unwrap_or(0),
            _ => 0,
        }
    }
}

/// Cached, eventually consistent read access to Books
pub trait BookLister: Send + Sync {
    fn get(&self, key: &ObjectKey) -> Option<Arc<Book>>;
}

/// Authoritative store for managed objects and Book status
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object; `Ok(None)` when it does not exist
    async fn get(&self, kind: ManagedKind, namespace: &str, name: &str)
        -> Result<Option<ManagedObject>>;

    /// Create an object; fails with `AlreadyExists` if the name is taken
    async fn create(&self, object: ManagedObject) -> Result<ManagedObject>;

    /// Overwrite an object; fails with `Conflict` if its resource version is stale
    async fn update(&self, object: ManagedObject) -> Result<ManagedObject>;

    /// Write the status subresource of a Book, leaving its spec untouched
    async fn update_book_status(&self, book: &Book, status: BookStatus) -> Result<()>;
}

/// [`BookLister`] backed by a reflector cache
#[derive(Clone)]
pub struct ReflectorLister {
    store: Store<Book>,
}

impl ReflectorLister {
    pub fn new(store: Store<Book>) -> Self {
        Self { store }
    }
}

impl BookLister for ReflectorLister {
    fn get(&self, key: &ObjectKey) -> Option<Arc<Book>> {
        self.store
            .get(&ObjectRef::new(&key.name).within(&key.namespace))
    }
}

/// [`ObjectStore`] talking to the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

async fn get_typed<K>(api: Api<K>, kind: ManagedKind, namespace: &str, name: &str) -> Result<Option<K>>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    api.get_opt(name)
        .await
        .map_err(|e| OperatorError::from_api(e, kind.as_str(), namespace, name))
}

async fn create_typed<K>(api: Api<K>, kind: ManagedKind, obj: &K) -> Result<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    let meta = obj.meta();
    let namespace = meta.namespace.clone().unwrap_or_default();
    let name = meta.name.clone().unwrap_or_default();
    api.create(&post_params(), obj)
        .await
        .map_err(|e| OperatorError::from_api(e, kind.as_str(), &namespace, &name))
}

async fn replace_typed<K>(api: Api<K>, kind: ManagedKind, obj: &K) -> Result<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    let meta = obj.meta();
    let namespace = meta.namespace.clone().unwrap_or_default();
    let name = meta.name.clone().unwrap_or_default();
    api.replace(&name, &post_params(), obj)
        .await
        .map_err(|e| OperatorError::from_api(e, kind.as_str(), &namespace, &name))
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        kind: ManagedKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ManagedObject>> {
        let object = match kind {
            ManagedKind::Deployment => get_typed(self.api::<Deployment>(namespace), kind, namespace, name)
                .await?
                .map(ManagedObject::Deployment),
            ManagedKind::Service => get_typed(self.api::<Service>(namespace), kind, namespace, name)
                .await?
                .map(ManagedObject::Service),
            ManagedKind::ConfigMap => get_typed(self.api::<ConfigMap>(namespace), kind, namespace, name)
                .await?
                .map(ManagedObject::ConfigMap),
        };
        Ok(object)
    }

    async fn create(&self, object: ManagedObject) -> Result<ManagedObject> {
        let namespace = object.namespace().to_string();
        let kind = object.kind();
        debug!(kind = %kind, name = object.name(), namespace = %namespace, "Creating object");
        let created = match object {
            ManagedObject::Deployment(d) => {
                ManagedObject::Deployment(create_typed(self.api(&namespace), kind, &d).await?)
            }
            ManagedObject::Service(s) => {
                ManagedObject::Service(create_typed(self.api(&namespace), kind, &s).await?)
            }
            ManagedObject::ConfigMap(c) => {
                ManagedObject::ConfigMap(create_typed(self.api(&namespace), kind, &c).await?)
            }
        };
        Ok(created)
    }

    async fn update(&self, object: ManagedObject) -> Result<ManagedObject> {
        let namespace = object.namespace().to_string();
        let kind = object.kind();
        debug!(
            kind = %kind,
            name = object.name(),
            namespace = %namespace,
            resource_version = ?object.resource_version(),
            "Replacing object"
        );
        let updated = match object {
            ManagedObject::Deployment(d) => {
                ManagedObject::Deployment(replace_typed(self.api(&namespace), kind, &d).await?)
            }
            ManagedObject::Service(s) => {
                ManagedObject::Service(replace_typed(self.api(&namespace), kind, &s).await?)
            }
            ManagedObject::ConfigMap(c) => {
                ManagedObject::ConfigMap(replace_typed(self.api(&namespace), kind, &c).await?)
            }
        };
        Ok(updated)
    }

    async fn update_book_status(&self, book: &Book, status: BookStatus) -> Result<()> {
        let namespace = book.metadata.namespace.clone().unwrap_or_default();
        let name = book.metadata.name.clone().unwrap_or_default();
        let api: Api<Book> = self.api(&namespace);

        debug!(name = %name, available = status.available_replicas, "Updating book status");

        // resourceVersion turns the merge patch into a compare-and-swap
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": book.metadata.resource_version },
            "status": status
        });

        api.patch_status(&name, &patch_params(), &Patch::Merge(&patch))
            .await
            .map_err(|e| OperatorError::from_api(e, "Book", &namespace, &name))?;

        Ok(())
    }
}

/// Operations recorded by [`MemoryStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Create,
    Update,
    UpdateStatus,
}

/// A mutating call observed by [`MemoryStore`]
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Create(ManagedObject),
    Update(ManagedObject),
    UpdateStatus { key: ObjectKey, status: BookStatus },
}

impl StoreCall {
    pub fn op(&self) -> StoreOp {
        match self {
            StoreCall::Create(_) => StoreOp::Create,
            StoreCall::Update(_) => StoreOp::Update,
            StoreCall::UpdateStatus { .. } => StoreOp::UpdateStatus,
        }
    }

    /// `(kind, name)` of the written object; Book status writes report `None`
    pub fn target(&self) -> Option<(ManagedKind, &str)> {
        match self {
            StoreCall::Create(o) | StoreCall::Update(o) => Some((o.kind(), o.name())),
            StoreCall::UpdateStatus { .. } => None,
        }
    }
}

type ObjectId = (ManagedKind, String, String);

#[derive(Default)]
struct MemoryState {
    books: HashMap<ObjectKey, Arc<Book>>,
    objects: HashMap<ObjectId, ManagedObject>,
    journal: Vec<StoreCall>,
    failures: Vec<(StoreOp, Option<String>)>,
    next_version: u64,
}

impl MemoryState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    /// Take the first injected failure matching `op` and `name`
    fn take_failure(&mut self, op: StoreOp, name: &str) -> Option<OperatorError> {
        let idx = self.failures.iter().position(|(o, n)| {
            *o == op && n.as_deref().map(|n| n == name).unwrap_or(true)
        })?;
        self.failures.remove(idx);
        Some(OperatorError::Internal(format!(
            "injected {:?} failure for '{}'",
            op, name
        )))
    }
}

/// In-process object store with API-server-like version semantics
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a Book, assigning a fresh resource version
    pub fn put_book(&self, mut book: Book) -> Arc<Book> {
        let mut state = self.state.lock();
        book.metadata.resource_version = Some(state.bump());
        let book = Arc::new(book);
        if let Some(key) = book.key() {
            state.books.insert(key, book.clone());
        }
        book
    }

    pub fn remove_book(&self, key: &ObjectKey) -> Option<Arc<Book>> {
        self.state.lock().books.remove(key)
    }

    /// Seed an object without recording a journal entry
    pub fn seed(&self, mut object: ManagedObject) -> ManagedObject {
        let mut state = self.state.lock();
        object.metadata_mut().resource_version = Some(state.bump());
        let id = (
            object.kind(),
            object.namespace().to_string(),
            object.name().to_string(),
        );
        state.objects.insert(id, object.clone());
        object
    }

    /// Current copy of an object
    pub fn object(&self, kind: ManagedKind, namespace: &str, name: &str) -> Option<ManagedObject> {
        self.state
            .lock()
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Remove an object as an outside actor would, without a journal entry
    pub fn remove(&self, kind: ManagedKind, namespace: &str, name: &str) -> Option<ManagedObject> {
        self.state
            .lock()
            .objects
            .remove(&(kind, namespace.to_string(), name.to_string()))
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Simulate the workload controller reporting available replicas
    pub fn set_available_replicas(&self, namespace: &str, name: &str, available: i32) {
        let mut state = self.state.lock();
        let version = state.bump();
        let id = (ManagedKind::Deployment, namespace.to_string(), name.to_string());
        if let Some(ManagedObject::Deployment(d)) = state.objects.get_mut(&id) {
            d.status.get_or_insert_with(Default::default).available_replicas = Some(available);
            d.metadata.resource_version = Some(version);
        }
    }

    /// Fail the next `op` on `name` (or on any name when `None`)
    pub fn fail_next(&self, op: StoreOp, name: Option<&str>) {
        self.state
            .lock()
            .failures
            .push((op, name.map(str::to_string)));
    }

    /// Mutating calls recorded so far
    pub fn journal(&self) -> Vec<StoreCall> {
        self.state.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }
}

impl BookLister for MemoryStore {
    fn get(&self, key: &ObjectKey) -> Option<Arc<Book>> {
        self.state.lock().books.get(key).cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(
        &self,
        kind: ManagedKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ManagedObject>> {
        let mut state = self.state.lock();
        if let Some(err) = state.take_failure(StoreOp::Get, name) {
            return Err(err);
        }
        Ok(state
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create(&self, mut object: ManagedObject) -> Result<ManagedObject> {
        let mut state = self.state.lock();
        state.journal.push(StoreCall::Create(object.clone()));
        if let Some(err) = state.take_failure(StoreOp::Create, object.name()) {
            return Err(err);
        }

        let id = (
            object.kind(),
            object.namespace().to_string(),
            object.name().to_string(),
        );
        if state.objects.contains_key(&id) {
            return Err(OperatorError::AlreadyExists {
                kind: id.0.to_string(),
                name: id.2,
                namespace: id.1,
            });
        }

        let version = state.bump();
        let meta = object.metadata_mut();
        meta.resource_version = Some(version.clone());
        meta.uid = Some(format!("uid-{}", version));
        state.objects.insert(id, object.clone());
        Ok(object)
    }

    async fn update(&self, mut object: ManagedObject) -> Result<ManagedObject> {
        let mut state = self.state.lock();
        state.journal.push(StoreCall::Update(object.clone()));
        if let Some(err) = state.take_failure(StoreOp::Update, object.name()) {
            return Err(err);
        }

        let id = (
            object.kind(),
            object.namespace().to_string(),
            object.name().to_string(),
        );
        let Some(current) = state.objects.get(&id) else {
            return Err(OperatorError::NotFound {
                kind: id.0.to_string(),
                name: id.2,
                namespace: id.1,
            });
        };

        if object.resource_version().is_some() && object.resource_version() != current.resource_version() {
            return Err(OperatorError::Conflict {
                kind: id.0.to_string(),
                name: id.2,
                namespace: id.1,
            });
        }

        // A replace never touches server-owned status
        match (&mut object, current) {
            (ManagedObject::Deployment(new), ManagedObject::Deployment(old)) => {
                new.status = old.status.clone();
            }
            (ManagedObject::Service(new), ManagedObject::Service(old)) => {
                new.status = old.status.clone();
            }
            _ => {}
        }
        object.metadata_mut().uid = current.metadata().uid.clone();

        let version = state.bump();
        object.metadata_mut().resource_version = Some(version);
        state.objects.insert(id, object.clone());
        Ok(object)
    }

    async fn update_book_status(&self, book: &Book, status: BookStatus) -> Result<()> {
        let key = book
            .key()
            .ok_or_else(|| OperatorError::Internal("book without namespace/name".to_string()))?;

        let mut state = self.state.lock();
        state.journal.push(StoreCall::UpdateStatus {
            key: key.clone(),
            status: status.clone(),
        });
        if let Some(err) = state.take_failure(StoreOp::UpdateStatus, &key.name) {
            return Err(err);
        }

        let Some(current) = state.books.get(&key).cloned() else {
            return Err(OperatorError::NotFound {
                kind: "Book".to_string(),
                name: key.name,
                namespace: key.namespace,
            });
        };
        if book.metadata.resource_version.is_some()
            && book.metadata.resource_version != current.metadata.resource_version
        {
            return Err(OperatorError::Conflict {
                kind: "Book".to_string(),
                name: key.name,
                namespace: key.namespace,
            });
        }

        let mut updated = (*current).clone();
        updated.status = Some(status);
        updated.metadata.resource_version = Some(state.bump());
        state.books.insert(key, Arc::new(updated));
        Ok(())
    }
}
