//! Change notifications for watched resources
//!
//! An [`Informer`] keeps a reflector cache of one resource type and turns raw
//! watch events into [`Notification`]s carrying the previous state of
//! updated objects. Objects that disappear while the watch is re-listing are
//! reported as [`Observed::Tombstone`] with their last known state.

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::reflector::{store::Writer, ObjectRef, Store};
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::Resource;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a deletion was observed
#[derive(Debug, Clone, PartialEq)]
pub enum Observed<K> {
    /// The watch delivered the delete directly
    Live(Arc<K>),
    /// The object vanished across a re-list; this is its last cached state
    Tombstone(Arc<K>),
}

impl<K> Observed<K> {
    pub fn object(&self) -> &Arc<K> {
        match self {
            Observed::Live(obj) | Observed::Tombstone(obj) => obj,
        }
    }
}

/// A change to a watched object
#[derive(Debug, Clone, PartialEq)]
pub enum Notification<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Observed<K>),
}

impl<K> Notification<K> {
    /// The most recent state carried by the notification
    pub fn object(&self) -> &Arc<K> {
        match self {
            Notification::Added(obj) => obj,
            Notification::Updated { new, .. } => new,
            Notification::Deleted(observed) => observed.object(),
        }
    }
}

/// Reflector cache plus watch-event translation for one resource type
pub struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    reader: Store<K>,
    writer: Writer<K>,
    /// Objects seen during the current re-list
    relisted: HashSet<ObjectRef<K>>,
}

impl<K> Default for Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + 'static,
{
    pub fn new() -> Self {
        let writer = Writer::default();
        Self {
            reader: writer.as_reader(),
            writer,
            relisted: HashSet::new(),
        }
    }

    /// Read handle on the cache; becomes ready after the first full list
    pub fn reader(&self) -> Store<K> {
        self.reader.clone()
    }

    /// Apply a watch event to the cache and return the resulting notifications
    pub fn handle(&mut self, event: Event<K>) -> Vec<Notification<K>> {
        let notifications = match &event {
            Event::Apply(obj) => vec![self.applied(obj)],
            Event::Delete(obj) => vec![Notification::Deleted(Observed::Live(Arc::new(obj.clone())))],
            Event::Init => {
                self.relisted.clear();
                Vec::new()
            }
            Event::InitApply(obj) => {
                self.relisted.insert(ObjectRef::from_obj(obj));
                vec![self.applied(obj)]
            }
            Event::InitDone => {
                let relisted = std::mem::take(&mut self.relisted);
                self.reader
                    .state()
                    .into_iter()
                    .filter(|obj| !relisted.contains(&ObjectRef::from_obj(&**obj)))
                    .map(|obj| Notification::Deleted(Observed::Tombstone(obj)))
                    .collect()
            }
        };

        self.writer.apply_watcher_event(&event);
        notifications
    }

    fn applied(&self, obj: &K) -> Notification<K> {
        let new = Arc::new(obj.clone());
        match self.reader.get(&ObjectRef::from_obj(obj)) {
            Some(old) => Notification::Updated { old, new },
            None => Notification::Added(new),
        }
    }
}

/// Drive a watch on `api` until `shutdown` fires, feeding every notification
/// to `on_notification`. Watch errors are retried with the watcher backoff.
pub async fn run_informer<K, F>(
    api: Api<K>,
    config: watcher::Config,
    mut informer: Informer<K>,
    mut on_notification: F,
    shutdown: CancellationToken,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    F: FnMut(Notification<K>) + Send,
{
    let kind = K::kind(&()).to_string();
    let stream = watcher(api, config).default_backoff();
    futures::pin_mut!(stream);

    debug!(kind = %kind, "Starting informer");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(event)) => {
                    for notification in informer.handle(event) {
                        on_notification(notification);
                    }
                }
                Some(Err(e)) => warn!(kind = %kind, error = %e, "Watch error"),
                None => break,
            }
        }
    }
    debug!(kind = %kind, "Informer stopped");
}
