//! Watcher handles.

use std::fmt;
use std::sync::Arc;

use cinder_client_api::WatchCreateRequest;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::WatchEvent;
use super::manager::WatchManager;
use crate::error::Result;
use crate::events::Emitter;
use crate::namespace::KeyApplicator;

struct WatcherInner {
    manager: WatchManager,
    namespace: KeyApplicator,
    request: Mutex<WatchCreateRequest>,
    id: Mutex<Option<i64>>,
    last_revision: Mutex<Option<i64>>,
    events: Emitter<WatchEvent>,
}

/// One logical subscription multiplexed over its manager's stream.
///
/// Handles are cheap to clone and compare equal when they refer to the same
/// subscription.
#[derive(Clone)]
pub struct Watcher {
    inner: Arc<WatcherInner>,
}

impl Watcher {
    pub(crate) fn new(manager: WatchManager, namespace: KeyApplicator, request: WatchCreateRequest) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                manager,
                namespace,
                request: Mutex::new(request),
                id: Mutex::new(None),
                last_revision: Mutex::new(None),
                events: Emitter::new(),
            }),
        }
    }

    /// Id assigned by the store, `None` until the subscription is confirmed.
    pub fn id(&self) -> Option<i64> {
        *self.inner.id.lock()
    }

    /// Revision of the last update seen.
    pub fn last_revision(&self) -> Option<i64> {
        *self.inner.last_revision.lock()
    }

    /// The create request sent for this watcher, with namespaced keys.
    pub fn request(&self) -> WatchCreateRequest {
        self.inner.request.lock().clone()
    }

    /// Overrides the revision the next subscription starts from. A
    /// reconnection replaces it with the revision after the last update.
    pub fn set_start_revision(&self, revision: i64) {
        self.inner.request.lock().start_revision = revision;
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<WatchEvent> {
        self.inner.events.subscribe()
    }

    pub fn on<F>(&self, callback: F)
    where F: Fn(&WatchEvent) + Send + Sync + 'static {
        self.inner.events.on(callback);
    }

    /// Attaches to the manager. Use [`Watcher::subscribe`] first to see
    /// every event.
    pub async fn attach(&self) -> Result<()> {
        self.inner.manager.attach(self).await
    }

    /// Detaches from the manager, waiting for the store to confirm the
    /// cancellation when the subscription is live.
    pub async fn cancel(&self) -> Result<()> {
        self.inner.manager.detach(self).await
    }

    pub(crate) fn namespace(&self) -> &KeyApplicator {
        &self.inner.namespace
    }

    pub(crate) fn set_id(&self, id: Option<i64>) {
        *self.inner.id.lock() = id;
    }

    pub(crate) fn set_last_revision(&self, revision: i64) {
        *self.inner.last_revision.lock() = Some(revision);
    }

    /// Points the next subscription just past the last seen revision.
    pub(crate) fn resume_from_last_revision(&self) {
        if let Some(revision) = self.last_revision() {
            self.set_start_revision(revision + 1);
        }
    }

    pub(crate) fn emit(&self, event: WatchEvent) {
        self.inner.events.emit(event);
    }
}

impl PartialEq for Watcher {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Watcher {}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.id())
            .field("last_revision", &self.last_revision())
            .field("key", &self.inner.request.lock().key)
            .finish()
    }
}
