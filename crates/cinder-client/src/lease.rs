//! Lease keep-alive state machine.
//!
//! A [`Lease`] is granted lazily (or eagerly when created through a
//! namespace) and then kept alive by a background task that sends a
//! keep-alive every third of the TTL. Transient keep-alive failures are
//! tolerated until the time since the last acknowledged keep-alive exceeds
//! the TTL; a lease the store no longer knows is lost immediately.
//!
//! ```text
//! Unestablished -> Granting -> Alive -> Lost      (error, terminal)
//!                                    -> Revoked   (revoke(), terminal)
//!                                    -> Released  (release(), terminal)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let lease = client.lease(30)?;
//! lease.on(|event| if let LeaseEvent::Lost(err) = event { eprintln!("lost: {err}") });
//! lease.put("service/instance-1").value("10.0.0.7").exec().await?;
//! // ...
//! lease.revoke().await?;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cinder_client_api::LeaseGrantRequest;
use cinder_client_api::LeaseKeepAliveRequest;
use cinder_client_api::LeaseKeepAliveResponse;
use cinder_client_api::LeaseRevokeRequest;
use cinder_client_api::LeaseTimeToLiveRequest;
use cinder_client_api::LeaseTimeToLiveResponse;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::builder::PutBuilder;
use crate::connection_pool::ConnectionPool;
use crate::constants::KEEPALIVES_PER_TTL;
use crate::constants::MIN_LEASE_TTL_SECS;
use crate::error::ClientError;
use crate::error::Result;
use crate::events::Emitter;
use crate::namespace::KeyApplicator;

/// Lifecycle state of a [`Lease`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseState {
    Unestablished,
    Granting,
    Alive,
    /// The lease expired or was invalidated. Carries the terminal error.
    Lost(ClientError),
    /// Revoked by this client.
    Revoked,
    /// Keep-alives stopped without telling the store.
    Released,
}

impl LeaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LeaseState::Lost(_) | LeaseState::Revoked | LeaseState::Released)
    }
}

/// Notifications published by a [`Lease`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseEvent {
    /// The lease was granted and keep-alives started.
    KeepaliveEstablished,
    /// A scheduled keep-alive is being sent.
    KeepaliveFired,
    KeepaliveSucceeded(LeaseKeepAliveResponse),
    /// A keep-alive failed but the lease may still be alive.
    KeepaliveFailed(ClientError),
    /// Emitted exactly once when the lease is lost.
    Lost(ClientError),
}

struct LeaseInner {
    pool: Arc<ConnectionPool>,
    namespace: KeyApplicator,
    ttl: i64,
    grant: OnceCell<Result<i64>>,
    state: Mutex<LeaseState>,
    last_keep_alive: Mutex<Instant>,
    events: Emitter<LeaseEvent>,
    cancel: CancellationToken,
}

/// A TTL-bound lease kept alive in the background.
///
/// Cloning yields another handle to the same lease.
#[derive(Clone)]
pub struct Lease {
    inner: Arc<LeaseInner>,
}

impl Lease {
    /// Creates an unestablished lease. TTLs under one second are rejected.
    pub fn new(pool: Arc<ConnectionPool>, namespace: KeyApplicator, ttl_secs: i64) -> Result<Self> {
        if ttl_secs < MIN_LEASE_TTL_SECS {
            return Err(ClientError::Configuration(format!(
                "the TTL for a lease must be at least {MIN_LEASE_TTL_SECS} second, got {ttl_secs}"
            )));
        }
        Ok(Self {
            inner: Arc::new(LeaseInner {
                pool,
                namespace,
                ttl: ttl_secs,
                grant: OnceCell::new(),
                state: Mutex::new(LeaseState::Unestablished),
                last_keep_alive: Mutex::new(Instant::now()),
                events: Emitter::new(),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Requested TTL in seconds.
    pub fn ttl(&self) -> i64 {
        self.inner.ttl
    }

    pub fn state(&self) -> LeaseState {
        self.inner.state.lock().clone()
    }

    /// The lease id, once granted.
    pub fn id(&self) -> Option<i64> {
        self.inner.grant.get().and_then(|r| r.as_ref().ok().copied())
    }

    /// Whether the lease was lost or revoked.
    pub fn is_revoked(&self) -> bool {
        matches!(*self.inner.state.lock(), LeaseState::Lost(_) | LeaseState::Revoked)
    }

    pub fn on<F>(&self, callback: F)
    where F: Fn(&LeaseEvent) + Send + Sync + 'static {
        self.inner.events.on(callback);
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LeaseEvent> {
        self.inner.events.subscribe()
    }

    /// Grants the lease if needed and returns its id.
    ///
    /// Concurrent and repeated calls share one grant request. Once the
    /// lease is lost this returns the loss error.
    pub async fn grant(&self) -> Result<i64> {
        if let Some(err) = self.inner.lost_error() {
            return Err(err);
        }
        let inner = self.inner.clone();
        self.inner.grant.get_or_init(|| establish(inner)).await.clone()
    }

    /// Stops keep-alives and asks the store to drop the lease and every
    /// key attached to it.
    pub async fn revoke(&self) -> Result<()> {
        if let Some(err) = self.inner.lost_error() {
            return Err(err);
        }
        self.inner.close(LeaseState::Revoked);
        let id = self.grant().await?;
        match self.inner.pool.lease_revoke(LeaseRevokeRequest { id }).await {
            Ok(_) => {
                debug!(lease_id = id, "lease revoked");
                Ok(())
            }
            Err(e) if e.is_lease_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Stops keep-alives without notifying the store. The lease expires on
    /// its own once the TTL elapses.
    pub fn release(&self) {
        self.inner.close(LeaseState::Released);
    }

    /// Sends one keep-alive immediately.
    pub async fn keepalive_once(&self) -> Result<LeaseKeepAliveResponse> {
        if let Some(err) = self.inner.lost_error() {
            return Err(err);
        }
        let id = self.grant().await?;
        send_keepalive(&self.inner, id).await
    }

    /// Queries the remaining TTL and, optionally, the attached keys.
    pub async fn time_to_live(&self, keys: bool) -> Result<LeaseTimeToLiveResponse> {
        let id = self.grant().await?;
        let mut response = self.inner.pool.lease_time_to_live(LeaseTimeToLiveRequest { id, keys }).await?;
        response.keys = response
            .keys
            .iter()
            .map(|k| self.inner.namespace.unprefix(k))
            .collect::<Result<Vec<_>>>()?;
        Ok(response)
    }

    /// Starts a write bound to this lease.
    pub fn put(&self, key: impl AsRef<[u8]>) -> PutBuilder {
        PutBuilder::new(self.inner.pool.clone(), self.inner.namespace.clone(), key).with_lease_handle(self.clone())
    }

    /// Marks the lease lost after the store rejected a write bound to it,
    /// returning the terminal error.
    pub(crate) fn invalidate_from_server(&self, lease_id: i64) -> ClientError {
        self.inner.emit_loss(lease_invalid(lease_id, "requested lease not found"))
    }
}

impl LeaseInner {
    fn lost_error(&self) -> Option<ClientError> {
        match &*self.state.lock() {
            LeaseState::Lost(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// Moves into a terminal state and stops the keep-alive task.
    fn close(&self, terminal: LeaseState) {
        {
            let mut state = self.state.lock();
            if !state.is_terminal() {
                *state = terminal;
            }
        }
        self.cancel.cancel();
    }

    /// Records the loss and emits [`LeaseEvent::Lost`] the first time.
    /// Returns the terminal error every caller should see.
    fn emit_loss(&self, err: ClientError) -> ClientError {
        {
            let mut state = self.state.lock();
            match &*state {
                LeaseState::Lost(existing) => return existing.clone(),
                LeaseState::Revoked | LeaseState::Released => return err,
                _ => *state = LeaseState::Lost(err.clone()),
            }
        }
        self.cancel.cancel();
        warn!(error = %err, "lease lost");
        self.events.emit(LeaseEvent::Lost(err.clone()));
        err
    }

    fn expired(&self) -> bool {
        self.last_keep_alive.lock().elapsed() > Duration::from_secs(self.ttl as u64)
    }

    /// When the lease runs out unless a keep-alive lands first.
    fn deadline(&self) -> Instant {
        *self.last_keep_alive.lock() + Duration::from_secs(self.ttl as u64)
    }
}

fn lease_invalid(lease_id: i64, reason: &str) -> ClientError {
    ClientError::LeaseInvalid {
        lease_id,
        reason: reason.to_string(),
    }
}

async fn establish(inner: Arc<LeaseInner>) -> Result<i64> {
    {
        let mut state = inner.state.lock();
        if *state == LeaseState::Unestablished {
            *state = LeaseState::Granting;
        }
    }

    let response = match inner.pool.lease_grant(LeaseGrantRequest { ttl: inner.ttl, id: 0 }).await {
        Ok(response) => response,
        Err(e) => return Err(inner.emit_loss(e)),
    };

    *inner.last_keep_alive.lock() = Instant::now();
    let alive = {
        let mut state = inner.state.lock();
        if *state == LeaseState::Granting {
            *state = LeaseState::Alive;
            true
        } else {
            false
        }
    };

    debug!(lease_id = response.id, ttl_secs = response.ttl, "lease granted");
    if alive {
        let period = Duration::from_secs(inner.ttl as u64) / KEEPALIVES_PER_TTL;
        tokio::spawn(run_keepalive_loop(inner.clone(), response.id, period));
        inner.events.emit(LeaseEvent::KeepaliveEstablished);
    }
    Ok(response.id)
}

/// Run the keepalive loop until cancelled.
async fn run_keepalive_loop(inner: Arc<LeaseInner>, lease_id: i64, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    debug!(lease_id, interval_ms = period.as_millis() as u64, "Lease keepalive started");

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                debug!(lease_id, "Lease keepalive stopped");
                break;
            }
            _ = ticker.tick() => {
                inner.events.emit(LeaseEvent::KeepaliveFired);
                let deadline = inner.deadline();
                // A stalled keep-alive must not outlive the lease or a cancel.
                tokio::select! {
                    _ = inner.cancel.cancelled() => {
                        debug!(lease_id, "Lease keepalive stopped");
                        break;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        inner.emit_loss(lease_invalid(lease_id, "our lease has expired"));
                        break;
                    }
                    result = send_keepalive(&inner, lease_id) => {
                        if let Err(e) = result {
                            debug!(lease_id, error = %e, "Lease keepalive failed");
                        }
                    }
                }
            }
        }
    }
}

/// Sends one keep-alive and applies the loss rules to the outcome.
async fn send_keepalive(inner: &LeaseInner, lease_id: i64) -> Result<LeaseKeepAliveResponse> {
    match inner.pool.lease_keep_alive(LeaseKeepAliveRequest { id: lease_id }).await {
        Ok(response) if response.ttl <= 0 => Err(inner.emit_loss(lease_invalid(lease_id, "lease expired or revoked"))),
        Ok(response) => {
            *inner.last_keep_alive.lock() = Instant::now();
            inner.events.emit(LeaseEvent::KeepaliveSucceeded(response.clone()));
            Ok(response)
        }
        Err(e) if e.is_lease_not_found() => Err(inner.emit_loss(lease_invalid(lease_id, "requested lease not found"))),
        Err(e) => {
            inner.events.emit(LeaseEvent::KeepaliveFailed(e.clone()));
            if inner.expired() {
                return Err(inner.emit_loss(lease_invalid(lease_id, "our lease has expired")));
            }
            Err(e)
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id())
            .field("ttl", &self.inner.ttl)
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use cinder_client_api::LeaseGrantResponse;
    use cinder_client_api::RpcError;
    use cinder_client_api::RpcRequest;
    use cinder_client_api::RpcResponse;
    use cinder_testing::DeterministicStore;

    use super::*;
    use crate::config::BackoffConfig;
    use crate::config::ClientOptions;
    use crate::connection_pool::RpcCallable;

    /// Grants every lease and never answers a keep-alive.
    struct StalledKeepalives;

    #[async_trait]
    impl RpcCallable for StalledKeepalives {
        async fn exec(&self, request: RpcRequest) -> std::result::Result<RpcResponse, RpcError> {
            match request {
                RpcRequest::LeaseGrant(req) => Ok(RpcResponse::LeaseGrant(LeaseGrantResponse {
                    id: 42,
                    ttl: req.ttl,
                    ..Default::default()
                })),
                RpcRequest::LeaseKeepAlive(_) => std::future::pending().await,
                other => Err(RpcError::Internal(format!("unexpected {}", other.method()))),
            }
        }
    }

    fn pool_for(store: &Arc<DeterministicStore>) -> Arc<ConnectionPool> {
        let options = ClientOptions::new(["store:1"]).with_backoff(BackoffConfig {
            initial_ms: 100,
            max_ms: 1000,
            random: 0,
        });
        Arc::new(ConnectionPool::new(options, store.transport()).unwrap())
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<LeaseEvent>) -> LeaseEvent {
        rx.recv().await.unwrap()
    }

    #[test]
    fn test_rejects_short_ttl() {
        let store = DeterministicStore::new();
        let err = Lease::new(pool_for(&store), KeyApplicator::default(), 0).unwrap_err();
        assert!(err.to_string().contains("must be at least 1 second"));
        assert!(Lease::new(pool_for(&store), KeyApplicator::default(), -5).is_err());
    }

    #[tokio::test]
    async fn test_concurrent_grants_share_one_request() {
        let store = DeterministicStore::new();
        let lease = Lease::new(pool_for(&store), KeyApplicator::default(), 100).unwrap();

        let (a, b, c) = tokio::join!(lease.grant(), lease.grant(), lease.grant());
        assert_eq!(a.unwrap(), b.clone().unwrap());
        assert_eq!(b.unwrap(), c.unwrap());
        assert_eq!(store.method_calls("lease_grant"), 1);
        assert_eq!(lease.state(), LeaseState::Alive);
        lease.revoke().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_fires_at_a_third_of_the_ttl() {
        let store = DeterministicStore::new();
        let lease = Lease::new(pool_for(&store), KeyApplicator::default(), 60).unwrap();
        let mut rx = lease.subscribe();
        lease.grant().await.unwrap();
        assert_eq!(next_event(&mut rx).await, LeaseEvent::KeepaliveEstablished);

        tokio::time::advance(Duration::from_millis(19_999)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(next_event(&mut rx).await, LeaseEvent::KeepaliveFired);
        match next_event(&mut rx).await {
            LeaseEvent::KeepaliveSucceeded(response) => assert_eq!(response.ttl, 60),
            other => panic!("unexpected event {other:?}"),
        }
        lease.revoke().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_stops_keepalives() {
        let store = DeterministicStore::new();
        let lease = Lease::new(pool_for(&store), KeyApplicator::default(), 60).unwrap();
        let mut rx = lease.subscribe();
        lease.grant().await.unwrap();
        assert_eq!(next_event(&mut rx).await, LeaseEvent::KeepaliveEstablished);

        lease.release();
        tokio::time::advance(Duration::from_secs(20)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(lease.state(), LeaseState::Released);
        assert!(!lease.is_revoked());
        assert_eq!(store.method_calls("lease_revoke"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_exactly_once_after_ttl_without_keepalives() {
        let store = DeterministicStore::new();
        let lease = Lease::new(pool_for(&store), KeyApplicator::default(), 3).unwrap();
        let mut rx = lease.subscribe();
        lease.grant().await.unwrap();
        assert_eq!(next_event(&mut rx).await, LeaseEvent::KeepaliveEstablished);

        store.set_host_down("store:1", true);

        let mut failures = 0;
        let lost = loop {
            match next_event(&mut rx).await {
                LeaseEvent::KeepaliveFailed(_) => failures += 1,
                LeaseEvent::Lost(err) => break err,
                _ => {}
            }
        };
        assert!(failures >= 1);
        assert!(lost.to_string().contains("our lease has expired"));

        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, LeaseEvent::Lost(_)), "lost emitted twice");
        }
        assert_eq!(lease.keepalive_once().await.unwrap_err(), lost);
        assert_eq!(lease.grant().await.unwrap_err(), lost);
        assert!(lease.is_revoked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_do_not_lose_the_lease() {
        let store = DeterministicStore::new();
        let lease = Lease::new(pool_for(&store), KeyApplicator::default(), 30).unwrap();
        let mut rx = lease.subscribe();
        lease.grant().await.unwrap();
        assert_eq!(next_event(&mut rx).await, LeaseEvent::KeepaliveEstablished);

        store.set_host_down("store:1", true);
        loop {
            if let LeaseEvent::KeepaliveFailed(_) = next_event(&mut rx).await {
                break;
            }
        }
        store.set_host_down("store:1", false);
        loop {
            if let LeaseEvent::KeepaliveSucceeded(_) = next_event(&mut rx).await {
                break;
            }
        }
        assert_eq!(lease.state(), LeaseState::Alive);
        lease.revoke().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_side_revocation_loses_the_lease() {
        let store = DeterministicStore::new();
        let lease = Lease::new(pool_for(&store), KeyApplicator::default(), 100).unwrap();
        let mut rx = lease.subscribe();
        assert!(!lease.is_revoked());
        let id = lease.grant().await.unwrap();

        store.revoke_lease(id);
        let err = lease.keepalive_once().await.unwrap_err();
        assert!(matches!(err, ClientError::LeaseInvalid { lease_id, .. } if lease_id == id));
        assert!(lease.is_revoked());

        let mut lost = None;
        while let Ok(event) = rx.try_recv() {
            if let LeaseEvent::Lost(e) = event {
                lost = Some(e);
            }
        }
        assert_eq!(lost, Some(err));
    }

    #[tokio::test]
    async fn test_failed_grant_is_a_loss() {
        let store = DeterministicStore::new();
        store.set_host_down("store:1", true);
        let lease = Lease::new(pool_for(&store), KeyApplicator::default(), 1).unwrap();
        let mut rx = lease.subscribe();

        let err = lease.grant().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(next_event(&mut rx).await, LeaseEvent::Lost(err.clone()));
        assert_eq!(lease.grant().await.unwrap_err(), err);
    }

    #[tokio::test]
    async fn test_revoke_deletes_attached_keys() {
        let store = DeterministicStore::new();
        let pool = pool_for(&store);
        let lease = Lease::new(pool.clone(), KeyApplicator::default(), 100).unwrap();

        lease.put("leased").value("foo").exec().await.unwrap();
        let id = lease.grant().await.unwrap();
        assert_eq!(store.get(b"leased").unwrap().lease, id);

        let ttl = lease.time_to_live(true).await.unwrap();
        assert_eq!(ttl.keys, vec![b"leased".to_vec()]);

        lease.revoke().await.unwrap();
        assert!(store.get(b"leased").is_none());
        assert_eq!(lease.state(), LeaseState::Revoked);
        assert!(lease.is_revoked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_when_keepalives_hang() {
        let store = DeterministicStore::new();
        let pool = pool_for(&store);
        pool.mock(Arc::new(StalledKeepalives));
        let lease = Lease::new(pool, KeyApplicator::default(), 3).unwrap();
        let mut rx = lease.subscribe();
        assert_eq!(lease.grant().await.unwrap(), 42);

        let lost = tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                if let LeaseEvent::Lost(err) = next_event(&mut rx).await {
                    break err;
                }
            }
        })
        .await
        .expect("lease never reported lost");
        assert_eq!(lost, lease_invalid(42, "our lease has expired"));
        assert_eq!(lease.state(), LeaseState::Lost(lost));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_interrupts_a_hanging_keepalive() {
        let store = DeterministicStore::new();
        let pool = pool_for(&store);
        pool.mock(Arc::new(StalledKeepalives));
        let lease = Lease::new(pool, KeyApplicator::default(), 30).unwrap();
        let mut rx = lease.subscribe();
        lease.grant().await.unwrap();
        assert_eq!(next_event(&mut rx).await, LeaseEvent::KeepaliveEstablished);
        assert_eq!(next_event(&mut rx).await, LeaseEvent::KeepaliveFired);

        lease.release();
        tokio::time::advance(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, LeaseEvent::Lost(_)), "a released lease is not lost");
        }
        assert_eq!(lease.state(), LeaseState::Released);
    }

    #[tokio::test]
    async fn test_rejected_write_loses_the_lease() {
        let store = DeterministicStore::new();
        let lease = Lease::new(pool_for(&store), KeyApplicator::default(), 100).unwrap();
        let mut rx = lease.subscribe();
        let id = lease.grant().await.unwrap();

        store.revoke_lease(id);
        let err = lease.put("foo").value("bar").exec().await.unwrap_err();
        assert!(matches!(err, ClientError::LeaseInvalid { lease_id, .. } if lease_id == id));
        assert_eq!(lease.state(), LeaseState::Lost(err.clone()));

        let mut lost = None;
        while let Ok(event) = rx.try_recv() {
            if let LeaseEvent::Lost(e) = event {
                assert!(lost.is_none(), "lost emitted twice");
                lost = Some(e);
            }
        }
        assert_eq!(lost, Some(err.clone()));
        assert_eq!(lease.put("foo").value("baz").exec().await.unwrap_err(), err);
        assert!(store.get(b"foo").is_none());
    }

    #[tokio::test]
    async fn test_immediate_keepalive_reports_ttl() {
        let store = DeterministicStore::new();
        let lease = Lease::new(pool_for(&store), KeyApplicator::default(), 100).unwrap();
        let response = lease.keepalive_once().await.unwrap();
        assert_eq!(response.id, lease.grant().await.unwrap());
        assert_eq!(response.ttl, 100);
        lease.revoke().await.unwrap();
    }
}
