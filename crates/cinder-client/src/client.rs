//! Top-level client.

use std::ops::Deref;
use std::sync::Arc;

use cinder_client_api::Transport;
use tracing::debug;

use crate::config::ClientOptions;
use crate::connection_pool::ConnectionPool;
use crate::connection_pool::RpcCallable;
use crate::error::Result;
use crate::namespace::KeyApplicator;
use crate::namespace::Namespace;
use crate::watch::WatchManager;

/// Client for a consensus-backed key-value store.
///
/// The client is the root [`Namespace`]: every namespace operation is
/// available on it directly. Cloning is cheap and clones share the
/// connection pool and watch stream.
#[derive(Debug, Clone)]
pub struct Client {
    root: Namespace,
}

impl Client {
    /// Builds a client over `transport`. Fails on an empty or mixed-scheme
    /// host list.
    pub fn new(options: ClientOptions, transport: Arc<dyn Transport>) -> Result<Self> {
        let backoff = options.backoff.strategy();
        let pool = Arc::new(ConnectionPool::new(options, transport)?);
        let watch_manager = WatchManager::new(pool.clone(), backoff);
        debug!(hosts = pool.hosts().len(), "client created");
        Ok(Self {
            root: Namespace::new(pool, KeyApplicator::default(), watch_manager),
        })
    }

    /// Routes every unary call to `callable`.
    pub fn mock(&self, callable: Arc<dyn RpcCallable>) {
        self.root.pool().mock(callable);
    }

    pub fn unmock(&self) {
        self.root.pool().unmock();
    }

    /// Ends the root namespace's watchers and closes every host channel.
    pub fn close(&self) {
        self.root.watch_manager().shutdown();
        self.root.pool().close();
    }
}

impl Deref for Client {
    type Target = Namespace;

    fn deref(&self) -> &Namespace {
        &self.root
    }
}
