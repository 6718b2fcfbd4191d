//! Builder for watchers.

use cinder_client_api::WatchCreateRequest;
use cinder_client_api::WatchFilter;

use super::WatchEvent;
use super::manager::WatchManager;
use super::watcher::Watcher;
use crate::error::ClientError;
use crate::error::Result;
use crate::namespace::KeyApplicator;
use crate::range::Range;

/// Which kind of change a watcher should skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ignore {
    Put,
    Delete,
}

/// Configures and creates a [`Watcher`].
#[derive(Debug, Clone)]
pub struct WatchBuilder {
    manager: WatchManager,
    namespace: KeyApplicator,
    range: Range,
    request: WatchCreateRequest,
}

impl WatchBuilder {
    pub fn new(manager: WatchManager, namespace: KeyApplicator) -> Self {
        Self {
            manager,
            namespace,
            range: Range::new(b"", b""),
            request: WatchCreateRequest::default(),
        }
    }

    pub fn key(mut self, key: impl AsRef<[u8]>) -> Self {
        self.range = Range::new(key, b"");
        self
    }

    pub fn prefix(mut self, prefix: impl AsRef<[u8]>) -> Self {
        self.range = Range::prefix(prefix);
        self
    }

    pub fn in_range(mut self, range: Range) -> Self {
        self.range = range;
        self
    }

    pub fn ignore(mut self, kind: Ignore) -> Self {
        let filter = match kind {
            Ignore::Put => WatchFilter::NoPut,
            Ignore::Delete => WatchFilter::NoDelete,
        };
        if !self.request.filters.contains(&filter) {
            self.request.filters.push(filter);
        }
        self
    }

    /// Includes the previous record with each event.
    pub fn with_previous_kv(mut self) -> Self {
        self.request.prev_kv = true;
        self
    }

    /// Replays changes from `revision` onwards.
    pub fn start_revision(mut self, revision: i64) -> Self {
        self.request.start_revision = revision;
        self
    }

    /// Builds an unattached watcher.
    pub fn watcher(self) -> Watcher {
        let mut request = self.request;
        (request.key, request.range_end) = self.namespace.apply_range(&self.range);
        Watcher::new(self.manager, self.namespace, request)
    }

    /// Attaches a watcher and waits until the store confirms it.
    pub async fn create(self) -> Result<Watcher> {
        let watcher = self.watcher();
        let mut events = watcher.subscribe();
        watcher.attach().await?;
        loop {
            match events.recv().await {
                Some(WatchEvent::Connected(_)) => return Ok(watcher),
                Some(WatchEvent::Error(e)) => return Err(e),
                Some(WatchEvent::End) | None => return Err(ClientError::Closed),
                Some(_) => {}
            }
        }
    }
}
