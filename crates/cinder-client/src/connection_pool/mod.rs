//! Connection pool over store hosts.
//!
//! The pool seeds a [`SharedPool`] with one [`Host`] per configured address
//! and executes every RPC of the client through it:
//!
//! - transport failures back the host off, close its channels and, when
//!   `retry` is enabled and another host is available, retry elsewhere
//! - a rejected auth token is dropped and the call retried once
//! - every other error is surfaced unchanged
//!
//! ## Usage
//!
//! ```ignore
//! let pool = ConnectionPool::new(ClientOptions::new(["127.0.0.1:2379"]), transport)?;
//! let response = pool.range(RangeRequest { key: b"foo".to_vec(), ..Default::default() }).await?;
//! ```

mod authenticator;
mod host;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use cinder_client_api::ChannelCredentials;
use cinder_client_api::DeleteRangeRequest;
use cinder_client_api::DeleteRangeResponse;
use cinder_client_api::LeaseGrantRequest;
use cinder_client_api::LeaseGrantResponse;
use cinder_client_api::LeaseKeepAliveRequest;
use cinder_client_api::LeaseKeepAliveResponse;
use cinder_client_api::LeaseRevokeRequest;
use cinder_client_api::LeaseRevokeResponse;
use cinder_client_api::LeaseTimeToLiveRequest;
use cinder_client_api::LeaseTimeToLiveResponse;
use cinder_client_api::Metadata;
use cinder_client_api::PutRequest;
use cinder_client_api::PutResponse;
use cinder_client_api::RangeRequest;
use cinder_client_api::RangeResponse;
use cinder_client_api::RpcError;
use cinder_client_api::RpcRequest;
use cinder_client_api::RpcResponse;
use cinder_client_api::Service;
use cinder_client_api::ServiceChannel;
use cinder_client_api::TlsMaterial;
use cinder_client_api::Transport;
use cinder_client_api::TxnRequest;
use cinder_client_api::TxnResponse;
use cinder_client_api::WatchStream;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tracing::debug;
use tracing::warn;

pub use self::authenticator::Authenticator;
pub use self::host::Host;
pub use self::host::strip_scheme;
use crate::config::ClientOptions;
use crate::constants::MAX_AUTH_RETRIES;
use crate::error::ClientError;
use crate::error::Result;
use crate::shared_pool::SharedPool;

/// Test double that replaces the real execution path of a pool.
#[async_trait]
pub trait RpcCallable: Send + Sync {
    async fn exec(&self, request: RpcRequest) -> Result<RpcResponse, RpcError>;

    async fn watch(&self) -> Result<WatchStream, RpcError> {
        Err(RpcError::unavailable("watch streams are not mocked"))
    }
}

/// Pool of store hosts executing the client's RPCs.
pub struct ConnectionPool {
    pool: SharedPool<Arc<Host>>,
    authenticator: Authenticator,
    credentials: ChannelCredentials,
    retry: bool,
    mock: RwLock<Option<Arc<dyn RpcCallable>>>,
}

impl ConnectionPool {
    /// Builds the pool, rejecting empty or mixed-scheme host lists.
    pub fn new(options: ClientOptions, transport: Arc<dyn Transport>) -> Result<Self> {
        options.validate()?;

        let credentials = match &options.tls {
            Some(tls) => ChannelCredentials::Tls(tls.clone()),
            None if options.has_secure_hosts() => ChannelCredentials::Tls(TlsMaterial::default()),
            None => ChannelCredentials::Insecure,
        };

        let pool = SharedPool::new(options.backoff.strategy());
        for address in &options.hosts {
            pool.add(Arc::new(Host::new(address, credentials.clone(), transport.clone())));
        }

        let authenticator = Authenticator::new(&options.hosts, options.auth.clone(), credentials.clone(), transport);

        debug!(
            hosts = options.hosts.len(),
            secure = credentials.is_secure(),
            retry = options.retry,
            "connection pool created"
        );

        Ok(Self {
            pool,
            authenticator,
            credentials,
            retry: options.retry,
            mock: RwLock::new(None),
        })
    }

    /// Routes every call to `callable` instead of the hosts.
    pub fn mock(&self, callable: Arc<dyn RpcCallable>) {
        *self.mock.write() = Some(callable);
    }

    pub fn unmock(&self) {
        *self.mock.write() = None;
    }

    /// Tears down every host's channels.
    pub fn close(&self) {
        for host in self.pool.all() {
            host.close();
        }
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.pool.all()
    }

    /// Hosts not currently backing off.
    pub fn available_hosts(&self) -> Vec<Arc<Host>> {
        self.pool.available()
    }

    pub fn credentials(&self) -> &ChannelCredentials {
        &self.credentials
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    /// Executes one unary call.
    pub async fn exec(&self, request: RpcRequest) -> Result<RpcResponse> {
        let mock = self.mock.read().clone();
        if let Some(mock) = mock {
            return mock.exec(request).await.map_err(ClientError::from);
        }

        let service = request.service();
        let method = request.method();
        self.with_channel(service, method, move |channel, metadata| {
            let request = request.clone();
            Box::pin(async move { channel.unary(request, &metadata).await })
        })
        .await
    }

    /// Opens a watch stream on some host.
    pub async fn watch_stream(&self) -> Result<WatchStream> {
        let mock = self.mock.read().clone();
        if let Some(mock) = mock {
            return mock.watch().await.map_err(ClientError::from);
        }

        self.with_channel(Service::Watch, "watch", |channel, metadata| {
            Box::pin(async move { channel.watch(&metadata).await })
        })
        .await
    }

    /// Runs `call` against a pulled host, applying the failover and
    /// re-authentication policy.
    async fn with_channel<T, F>(&self, service: Service, method: &'static str, call: F) -> Result<T>
    where F: Fn(Arc<dyn ServiceChannel>, Metadata) -> BoxFuture<'static, Result<T, RpcError>> {
        let mut auth_retries = 0;
        loop {
            let (host, metadata) = tokio::try_join!(self.pull_host(), self.authenticator.metadata())?;
            let channel = host.channel(service);

            match call(channel, metadata).await {
                Ok(response) => {
                    self.pool.succeed(&host).map_err(pool_bug)?;
                    return Ok(response);
                }
                Err(RpcError::InvalidAuthToken) if auth_retries < MAX_AUTH_RETRIES => {
                    auth_retries += 1;
                    debug!(method, address = host.address(), "auth token rejected, refreshing");
                    self.authenticator.invalidate();
                }
                Err(e) if e.is_transport() => {
                    self.pool.fail(&host).map_err(pool_bug)?;
                    host.close();
                    if self.retry && !self.pool.available().is_empty() {
                        warn!(method, address = host.address(), error = %e, "host failed, retrying on another host");
                        continue;
                    }
                    warn!(method, address = host.address(), error = %e, "host failed");
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn pull_host(&self) -> Result<Arc<Host>> {
        self.pool.pull().await.map_err(pool_bug)
    }

    pub async fn range(&self, request: RangeRequest) -> Result<RangeResponse> {
        Ok(self.exec(RpcRequest::Range(request)).await?.into_range()?)
    }

    pub async fn put(&self, request: PutRequest) -> Result<PutResponse> {
        Ok(self.exec(RpcRequest::Put(request)).await?.into_put()?)
    }

    pub async fn delete_range(&self, request: DeleteRangeRequest) -> Result<DeleteRangeResponse> {
        Ok(self.exec(RpcRequest::DeleteRange(request)).await?.into_delete_range()?)
    }

    pub async fn txn(&self, request: TxnRequest) -> Result<TxnResponse> {
        Ok(self.exec(RpcRequest::Txn(request)).await?.into_txn()?)
    }

    pub async fn lease_grant(&self, request: LeaseGrantRequest) -> Result<LeaseGrantResponse> {
        Ok(self.exec(RpcRequest::LeaseGrant(request)).await?.into_lease_grant()?)
    }

    pub async fn lease_revoke(&self, request: LeaseRevokeRequest) -> Result<LeaseRevokeResponse> {
        Ok(self.exec(RpcRequest::LeaseRevoke(request)).await?.into_lease_revoke()?)
    }

    pub async fn lease_keep_alive(&self, request: LeaseKeepAliveRequest) -> Result<LeaseKeepAliveResponse> {
        Ok(self.exec(RpcRequest::LeaseKeepAlive(request)).await?.into_lease_keep_alive()?)
    }

    pub async fn lease_time_to_live(&self, request: LeaseTimeToLiveRequest) -> Result<LeaseTimeToLiveResponse> {
        Ok(self.exec(RpcRequest::LeaseTimeToLive(request)).await?.into_lease_time_to_live()?)
    }
}

/// The pool is seeded with at least one host and only ever asked about
/// hosts it handed out, so pool errors indicate a bug.
fn pool_bug(err: crate::shared_pool::PoolError) -> ClientError {
    ClientError::Configuration(err.to_string())
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("hosts", &self.pool.all())
            .field("retry", &self.retry)
            .field("mocked", &self.mock.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use cinder_client_api::PutResponse;
    use cinder_testing::DeterministicStore;

    use super::*;
    use crate::config::BackoffConfig;

    fn quick_backoff() -> BackoffConfig {
        BackoffConfig {
            initial_ms: 500,
            max_ms: 5000,
            random: 0,
        }
    }

    fn put(key: &str) -> PutRequest {
        PutRequest {
            key: key.as_bytes().to_vec(),
            value: b"v".to_vec(),
            ..Default::default()
        }
    }

    // ========================================================================
    // Construction
    // ========================================================================

    #[test]
    fn test_rejects_mixed_hosts() {
        let store = DeterministicStore::new();
        let err = ConnectionPool::new(ClientOptions::new(["https://a:1", "b:2"]), store.transport()).unwrap_err();
        assert!(matches!(err, ClientError::Configuration(ref msg) if msg.contains("mix of secure and insecure")));
    }

    #[test]
    fn test_rejects_empty_hosts() {
        let store = DeterministicStore::new();
        let err = ConnectionPool::new(ClientOptions::new(Vec::<String>::new()), store.transport()).unwrap_err();
        assert!(matches!(err, ClientError::Configuration(_)));
    }

    #[test]
    fn test_builds_credentials_once() {
        let store = DeterministicStore::new();
        let insecure = ConnectionPool::new(ClientOptions::new(["a:1"]), store.transport()).unwrap();
        assert_eq!(insecure.credentials(), &ChannelCredentials::Insecure);

        let secure = ConnectionPool::new(ClientOptions::new(["https://a:1"]), store.transport()).unwrap();
        assert!(secure.credentials().is_secure());
        assert_eq!(secure.hosts()[0].address(), "a:1");

        let explicit = ConnectionPool::new(
            ClientOptions::new(["a:1"]).with_tls(TlsMaterial {
                root_certificate: Some("PEM".into()),
                ..Default::default()
            }),
            store.transport(),
        )
        .unwrap();
        assert!(explicit.credentials().is_secure());
    }

    // ========================================================================
    // Failover
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_retries_on_another_host() {
        let store = DeterministicStore::new();
        store.set_host_down("bad:1", true);
        let pool = ConnectionPool::new(
            ClientOptions::new(["bad:1", "good:1"]).with_backoff(quick_backoff()),
            store.transport(),
        )
        .unwrap();

        pool.put(put("foo")).await.unwrap();

        assert_eq!(pool.available_hosts().len(), 1);
        assert_eq!(pool.available_hosts()[0].address(), "good:1");
        assert_eq!(store.requests_to("bad:1"), 1);
        assert_eq!(store.requests_to("good:1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_surfaces_transport_errors_without_retry() {
        let store = DeterministicStore::new();
        store.set_host_down("bad:1", true);
        let pool = ConnectionPool::new(
            ClientOptions::new(["bad:1", "good:1"]).with_retry(false).with_backoff(quick_backoff()),
            store.transport(),
        )
        .unwrap();

        let err = pool.put(put("foo")).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(store.requests_to("good:1"), 0);
        assert_eq!(pool.hosts()[0].open_channels(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_surfaces_error_when_no_host_is_left() {
        let store = DeterministicStore::new();
        store.set_host_down("only:1", true);
        let pool =
            ConnectionPool::new(ClientOptions::new(["only:1"]).with_backoff(quick_backoff()), store.transport())
                .unwrap();

        assert!(pool.put(put("foo")).await.unwrap_err().is_transport());
        assert_eq!(store.requests_to("only:1"), 1);
    }

    #[tokio::test]
    async fn test_server_errors_do_not_fail_the_host() {
        let store = DeterministicStore::new();
        store.fail_next("put", RpcError::PermissionDenied("read only".into()));
        let pool = ConnectionPool::new(ClientOptions::new(["a:1"]), store.transport()).unwrap();

        let err = pool.put(put("foo")).await.unwrap_err();
        assert_eq!(err, ClientError::Server(RpcError::PermissionDenied("read only".into())));
        assert_eq!(pool.available_hosts().len(), 1);
    }

    // ========================================================================
    // Authentication
    // ========================================================================

    #[tokio::test]
    async fn test_authenticates_and_refreshes_token_once() {
        let store = DeterministicStore::new();
        store.add_user("root", "pw");
        let pool = ConnectionPool::new(ClientOptions::new(["a:1"]).with_auth("root", "pw"), store.transport()).unwrap();

        pool.put(put("foo")).await.unwrap();
        assert_eq!(store.method_calls("authenticate"), 1);

        store.invalidate_tokens();
        pool.put(put("bar")).await.unwrap();
        assert_eq!(store.method_calls("authenticate"), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_one_refresh() {
        let store = DeterministicStore::new();
        store.add_user("root", "pw");
        store.fail_always("put", RpcError::InvalidAuthToken);
        let pool = ConnectionPool::new(ClientOptions::new(["a:1"]).with_auth("root", "pw"), store.transport()).unwrap();

        assert_eq!(pool.put(put("foo")).await.unwrap_err(), ClientError::AuthInvalid);
        assert_eq!(store.method_calls("put"), 2);
    }

    #[tokio::test]
    async fn test_bad_credentials_try_every_host_then_clear() {
        let store = DeterministicStore::new();
        store.add_user("root", "pw");
        let pool =
            ConnectionPool::new(ClientOptions::new(["a:1", "b:1"]).with_auth("root", "wrong"), store.transport())
                .unwrap();

        assert!(matches!(pool.put(put("foo")).await.unwrap_err(), ClientError::AuthFailed(_)));
        assert_eq!(store.method_calls("authenticate"), 2);

        // The failed fetch is not cached.
        assert!(pool.put(put("foo")).await.is_err());
        assert_eq!(store.method_calls("authenticate"), 4);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_token_fetch() {
        let store = DeterministicStore::new();
        store.add_user("root", "pw");
        let pool = Arc::new(
            ConnectionPool::new(ClientOptions::new(["a:1"]).with_auth("root", "pw"), store.transport()).unwrap(),
        );

        let calls: Vec<_> = (0..5)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.put(put(&format!("k{i}"))).await })
            })
            .collect();
        for call in calls {
            call.await.unwrap().unwrap();
        }
        assert_eq!(store.method_calls("authenticate"), 1);
    }

    // ========================================================================
    // Mocking
    // ========================================================================

    struct CountingMock(AtomicUsize);

    #[async_trait]
    impl RpcCallable for CountingMock {
        async fn exec(&self, _request: RpcRequest) -> Result<RpcResponse, RpcError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(RpcResponse::Put(PutResponse::default()))
        }
    }

    #[tokio::test]
    async fn test_mock_replaces_execution_path() {
        let store = DeterministicStore::new();
        let pool = ConnectionPool::new(ClientOptions::new(["a:1"]), store.transport()).unwrap();
        let mock = Arc::new(CountingMock(AtomicUsize::new(0)));

        pool.mock(mock.clone());
        pool.put(put("foo")).await.unwrap();
        assert_eq!(mock.0.load(Ordering::SeqCst), 1);
        assert_eq!(store.method_calls("put"), 0);
        assert!(pool.watch_stream().await.unwrap_err().is_transport());

        pool.unmock();
        pool.put(put("foo")).await.unwrap();
        assert_eq!(store.method_calls("put"), 1);
    }
}
