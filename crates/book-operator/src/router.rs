//! Maps change notifications onto Book reconciliation keys

use crate::crd::{Book, BOOK_GROUP, BOOK_KIND};
use crate::informer::Notification;
use crate::key::ObjectKey;
use crate::queue::WorkQueue;
use crate::store::BookLister;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Routes Book and managed-object notifications into the work queue
#[derive(Clone)]
pub struct EventRouter {
    queue: Arc<WorkQueue<ObjectKey>>,
    books: Arc<dyn BookLister>,
}

/// True when an update carries the same resource version as the cached object
fn is_resync<K: Resource>(old: &K, new: &K) -> bool {
    match (
        old.meta().resource_version.as_deref(),
        new.meta().resource_version.as_deref(),
    ) {
        (Some(old), Some(new)) => old == new,
        _ => false,
    }
}

/// Controller owner reference of an object, if any
fn controller_of<K: Resource>(obj: &K) -> Option<&OwnerReference> {
    obj.meta()
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

fn points_at_book(owner: &OwnerReference) -> bool {
    let group = owner.api_version.split_once('/').map(|(g, _)| g).unwrap_or("");
    owner.kind == BOOK_KIND && group == BOOK_GROUP
}

impl EventRouter {
    pub fn new(queue: Arc<WorkQueue<ObjectKey>>, books: Arc<dyn BookLister>) -> Self {
        Self { queue, books }
    }

    /// Key to enqueue for a Book notification
    pub fn route_book(&self, notification: &Notification<Book>) -> Option<ObjectKey> {
        let book = match notification {
            Notification::Added(book) => book,
            Notification::Updated { old, new } => {
                if is_resync(&**old, &**new) {
                    trace!(book = ?new.metadata.name, "Skipping resync");
                    return None;
                }
                new
            }
            Notification::Deleted(observed) => {
                debug!(book = ?observed.object().metadata.name, "Book deleted");
                return None;
            }
        };

        let key = book.key();
        if key.is_none() {
            error!(book = ?book.metadata.name, "Dropping book notification without namespace/name");
        }
        key
    }

    /// Key of the Book controlling a managed object, if it is known
    pub fn route_managed<K: Resource>(&self, notification: &Notification<K>) -> Option<ObjectKey> {
        if let Notification::Updated { old, new } = notification {
            if is_resync(&**old, &**new) {
                return None;
            }
        }

        let obj: &K = notification.object();
        let meta = obj.meta();
        let Some(namespace) = meta.namespace.as_deref().filter(|ns| !ns.is_empty()) else {
            error!(name = ?meta.name, "Dropping managed notification without namespace");
            return None;
        };

        let owner = controller_of(obj)?;
        if !points_at_book(owner) {
            trace!(name = ?meta.name, owner_kind = %owner.kind, "Ignoring object owned by another kind");
            return None;
        }

        let key = ObjectKey::new(namespace, owner.name.clone());
        if self.books.get(&key).is_none() {
            debug!(name = ?meta.name, owner = %key, "Ignoring orphaned owner reference");
            return None;
        }

        debug!(name = ?meta.name, owner = %key, "Managed object changed");
        Some(key)
    }

    pub fn on_book(&self, notification: Notification<Book>) {
        if let Some(key) = self.route_book(&notification) {
            self.queue.add(key);
        }
    }

    pub fn on_managed<K: Resource>(&self, notification: Notification<K>) {
        if let Some(key) = self.route_managed(&notification) {
            self.queue.add(key);
        }
    }
}
