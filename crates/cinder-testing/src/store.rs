//! The deterministic store and its in-process transport.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use cinder_client_api::AuthenticateResponse;
use cinder_client_api::ChannelCredentials;
use cinder_client_api::DeleteRangeRequest;
use cinder_client_api::DeleteRangeResponse;
use cinder_client_api::KeyValue;
use cinder_client_api::LeaseGrantResponse;
use cinder_client_api::LeaseKeepAliveResponse;
use cinder_client_api::LeaseRevokeResponse;
use cinder_client_api::LeaseTimeToLiveResponse;
use cinder_client_api::Metadata;
use cinder_client_api::PutRequest;
use cinder_client_api::PutResponse;
use cinder_client_api::RequestOp;
use cinder_client_api::ResponseHeader;
use cinder_client_api::ResponseOp;
use cinder_client_api::RpcError;
use cinder_client_api::RpcRequest;
use cinder_client_api::RpcResponse;
use cinder_client_api::Service;
use cinder_client_api::ServiceChannel;
use cinder_client_api::TOKEN_METADATA_KEY;
use cinder_client_api::Transport;
use cinder_client_api::TxnRequest;
use cinder_client_api::TxnResponse;
use cinder_client_api::WatchCreateRequest;
use cinder_client_api::WatchRequest;
use cinder_client_api::WatchStream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::lease::LeaseTable;
use crate::mvcc::Batch;
use crate::mvcc::KeySpace;
use crate::watch::WatchHub;

/// Everything a real cluster would persist.
#[derive(Debug, Default)]
struct StoreState {
    kv: KeySpace,
    leases: LeaseTable,
    watches: WatchHub,
    users: HashMap<String, String>,
    tokens: HashSet<String>,
    next_token: u64,
}

/// What the "network" between client and store is doing.
#[derive(Debug, Default)]
struct NetworkState {
    down: HashSet<String>,
    requests_to: HashMap<String, usize>,
    method_calls: HashMap<String, usize>,
    fail_next: HashMap<String, VecDeque<RpcError>>,
    fail_always: HashMap<String, RpcError>,
}

/// An in-memory store with etcd3 semantics, for tests.
///
/// Every host address routes to the same store. Hosts can be taken down,
/// and failures can be injected per method, to exercise the client's
/// failover and recovery paths without a cluster.
///
/// Enabling auth is implicit: once a user is added, every call other than
/// authentication needs a valid token.
#[derive(Debug, Default)]
pub struct DeterministicStore {
    state: Mutex<StoreState>,
    network: Mutex<NetworkState>,
}

impl DeterministicStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport whose every channel talks to this store.
    pub fn transport(self: &Arc<Self>) -> Arc<dyn Transport> {
        Arc::new(StoreTransport { store: self.clone() })
    }

    // ========================================================================
    // Network control
    // ========================================================================

    /// Makes calls to `address` fail as unreachable.
    pub fn set_host_down(&self, address: &str, down: bool) {
        let mut network = self.network.lock();
        if down {
            network.down.insert(address.to_string());
        } else {
            network.down.remove(address);
        }
    }

    /// Calls attempted against `address`, reachable or not.
    pub fn requests_to(&self, address: &str) -> usize {
        self.network.lock().requests_to.get(address).copied().unwrap_or(0)
    }

    /// Calls of `method` that reached the store, failed injections included.
    pub fn method_calls(&self, method: &str) -> usize {
        self.network.lock().method_calls.get(method).copied().unwrap_or(0)
    }

    /// Fails the next call of `method` with `error`.
    pub fn fail_next(&self, method: &str, error: RpcError) {
        self.network.lock().fail_next.entry(method.to_string()).or_default().push_back(error);
    }

    /// Fails every call of `method` with `error` until cleared.
    pub fn fail_always(&self, method: &str, error: RpcError) {
        self.network.lock().fail_always.insert(method.to_string(), error);
    }

    pub fn clear_failures(&self) {
        let mut network = self.network.lock();
        network.fail_next.clear();
        network.fail_always.clear();
    }

    // ========================================================================
    // Auth control
    // ========================================================================

    pub fn add_user(&self, name: &str, password: &str) {
        self.state.lock().users.insert(name.to_string(), password.to_string());
    }

    /// Forgets every issued token, as a server restart would.
    pub fn invalidate_tokens(&self) {
        self.state.lock().tokens.clear();
    }

    // ========================================================================
    // Direct access
    // ========================================================================

    /// Writes `key` as another client would. Returns the new revision.
    pub fn put(&self, key: &[u8], value: &[u8]) -> i64 {
        let mut state = self.state.lock();
        let mut batch = state.kv.begin();
        state.put_key(&mut batch, key, value.to_vec(), 0);
        state.commit(batch);
        state.kv.revision()
    }

    pub fn get(&self, key: &[u8]) -> Option<KeyValue> {
        let mut state = self.state.lock();
        state.expire_leases(Instant::now());
        state.kv.current(key).cloned()
    }

    pub fn delete(&self, key: &[u8]) -> i64 {
        let mut state = self.state.lock();
        let mut batch = state.kv.begin();
        state.delete_key(&mut batch, key);
        state.commit(batch);
        state.kv.revision()
    }

    pub fn revision(&self) -> i64 {
        self.state.lock().kv.revision()
    }

    /// Discards history older than `revision`.
    pub fn compact(&self, revision: i64) {
        self.state.lock().kv.compact(revision);
    }

    /// Revokes a lease behind the client's back.
    pub fn revoke_lease(&self, id: i64) {
        let mut state = self.state.lock();
        state.revoke(id);
    }

    // ========================================================================
    // Watch control
    // ========================================================================

    /// Drops every open watch stream from the server side.
    pub fn disconnect_watch_streams(&self) {
        self.state.lock().watches.disconnect_all();
    }

    /// Cancels every watch with `reason`.
    pub fn cancel_watches(&self, reason: &str) {
        let mut state = self.state.lock();
        let revision = state.kv.revision();
        state.watches.cancel_all(reason, revision);
    }

    /// Every create request received, in order.
    pub fn watch_create_log(&self) -> Vec<WatchCreateRequest> {
        self.state.lock().watches.create_log().to_vec()
    }

    pub fn open_watch_streams(&self) -> usize {
        self.state.lock().watches.open_streams()
    }

    // ========================================================================
    // Serving
    // ========================================================================

    /// Applies the network model to a call of `method` on `address`.
    fn admit(&self, address: &str, method: &str) -> Result<(), RpcError> {
        let mut network = self.network.lock();
        *network.requests_to.entry(address.to_string()).or_default() += 1;
        if network.down.contains(address) {
            return Err(RpcError::unavailable(format!("{address} is unreachable")));
        }
        *network.method_calls.entry(method.to_string()).or_default() += 1;
        if let Some(error) = network.fail_always.get(method) {
            return Err(error.clone());
        }
        if let Some(error) = network.fail_next.get_mut(method).and_then(VecDeque::pop_front) {
            return Err(error);
        }
        Ok(())
    }

    fn serve(&self, request: RpcRequest, metadata: &Metadata) -> Result<RpcResponse, RpcError> {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.expire_leases(now);
        if !matches!(request, RpcRequest::Authenticate(_)) {
            state.check_token(metadata)?;
        }

        match request {
            RpcRequest::Range(request) => {
                let mut response = state.kv.range(&request)?;
                response.header = state.header();
                Ok(RpcResponse::Range(response))
            }
            RpcRequest::Put(request) => {
                state.validate_put(&request)?;
                let mut batch = state.kv.begin();
                let prev_kv = state.apply_put(&mut batch, &request)?;
                state.commit(batch);
                Ok(RpcResponse::Put(PutResponse {
                    header: state.header(),
                    prev_kv,
                }))
            }
            RpcRequest::DeleteRange(request) => {
                let mut batch = state.kv.begin();
                let mut response = state.apply_delete(&mut batch, &request);
                state.commit(batch);
                response.header = state.header();
                Ok(RpcResponse::DeleteRange(response))
            }
            RpcRequest::Txn(request) => {
                let mut batch = state.kv.begin();
                let mut response = state.apply_txn(&mut batch, &request)?;
                state.commit(batch);
                response.header = state.header();
                Ok(RpcResponse::Txn(response))
            }
            RpcRequest::LeaseGrant(request) => {
                let id = state.leases.grant(request.id, request.ttl, now)?;
                Ok(RpcResponse::LeaseGrant(LeaseGrantResponse {
                    header: state.header(),
                    id,
                    ttl: request.ttl,
                }))
            }
            RpcRequest::LeaseRevoke(request) => {
                if !state.revoke(request.id) {
                    return Err(RpcError::LeaseNotFound);
                }
                Ok(RpcResponse::LeaseRevoke(LeaseRevokeResponse { header: state.header() }))
            }
            RpcRequest::LeaseKeepAlive(request) => {
                // Unknown leases are acknowledged with a zero TTL.
                let ttl = state.leases.renew(request.id, now).unwrap_or(0);
                Ok(RpcResponse::LeaseKeepAlive(LeaseKeepAliveResponse {
                    header: state.header(),
                    id: request.id,
                    ttl,
                }))
            }
            RpcRequest::LeaseTimeToLive(request) => {
                let response = match state.leases.get(request.id) {
                    Some(lease) => LeaseTimeToLiveResponse {
                        header: state.header(),
                        id: request.id,
                        ttl: lease.remaining(now),
                        granted_ttl: lease.granted_ttl,
                        keys: if request.keys { lease.keys.iter().cloned().collect() } else { Vec::new() },
                    },
                    None => LeaseTimeToLiveResponse {
                        header: state.header(),
                        id: request.id,
                        ttl: -1,
                        ..Default::default()
                    },
                };
                Ok(RpcResponse::LeaseTimeToLive(response))
            }
            RpcRequest::Authenticate(request) => {
                if state.users.get(&request.name) != Some(&request.password) {
                    return Err(RpcError::AuthFailed("invalid user ID or password".to_string()));
                }
                state.next_token += 1;
                let token = format!("{}.{}", request.name, state.next_token);
                state.tokens.insert(token.clone());
                Ok(RpcResponse::Authenticate(AuthenticateResponse {
                    header: state.header(),
                    token,
                }))
            }
        }
    }

    fn open_watch(self: &Arc<Self>, metadata: &Metadata) -> Result<WatchStream, RpcError> {
        let (requests, mut incoming) = mpsc::unbounded_channel();
        let (outgoing, responses) = mpsc::unbounded_channel();
        let stream_id = {
            let mut state = self.state.lock();
            state.check_token(metadata)?;
            state.watches.open(outgoing)
        };
        debug!(stream_id, "watch stream opened");

        let store = self.clone();
        tokio::spawn(async move {
            while let Some(request) = incoming.recv().await {
                store.handle_watch_request(stream_id, request);
            }
            store.state.lock().watches.close(stream_id);
            debug!(stream_id, "watch stream closed by the client");
        });

        Ok(WatchStream { requests, responses })
    }

    fn handle_watch_request(&self, stream_id: u64, request: WatchRequest) {
        let mut state = self.state.lock();
        let StoreState { kv, watches, .. } = &mut *state;
        match request {
            WatchRequest::Create(create) => watches.create(stream_id, create, kv),
            WatchRequest::Cancel(cancel) => watches.cancel(stream_id, cancel.watch_id, kv.revision()),
        }
    }
}

impl StoreState {
    fn header(&self) -> ResponseHeader {
        ResponseHeader {
            revision: self.kv.revision(),
            member_id: 1,
            raft_term: 1,
        }
    }

    fn check_token(&self, metadata: &Metadata) -> Result<(), RpcError> {
        if self.users.is_empty() {
            return Ok(());
        }
        match metadata.get(TOKEN_METADATA_KEY) {
            Some(token) if self.tokens.contains(token) => Ok(()),
            _ => Err(RpcError::InvalidAuthToken),
        }
    }

    fn commit(&mut self, batch: Batch) {
        if let Some(committed) = self.kv.finish(batch) {
            self.watches.publish(&committed);
        }
    }

    fn expire_leases(&mut self, now: Instant) {
        for id in self.leases.expired(now) {
            debug!(lease_id = id, "lease expired");
            self.revoke(id);
        }
    }

    /// Drops a lease and deletes its keys. Returns false for unknown leases.
    fn revoke(&mut self, id: i64) -> bool {
        let Some(lease) = self.leases.remove(id) else {
            return false;
        };
        let mut batch = self.kv.begin();
        for key in &lease.keys {
            self.kv.delete(&mut batch, key);
        }
        self.commit(batch);
        true
    }

    fn put_key(&mut self, batch: &mut Batch, key: &[u8], value: Vec<u8>, lease: i64) -> Option<KeyValue> {
        let prev = self.kv.put(batch, key, value, lease);
        if let Some(prev) = &prev
            && prev.lease != lease
        {
            self.leases.detach(prev.lease, key);
        }
        if lease != 0 {
            self.leases.attach(lease, key);
        }
        prev
    }

    fn delete_key(&mut self, batch: &mut Batch, key: &[u8]) -> Option<KeyValue> {
        let prev = self.kv.delete(batch, key)?;
        if prev.lease != 0 {
            self.leases.detach(prev.lease, key);
        }
        Some(prev)
    }

    /// Rejects puts that would fail half way through a transaction.
    fn validate_put(&self, request: &PutRequest) -> Result<(), RpcError> {
        if !request.ignore_lease && request.lease != 0 && !self.leases.contains(request.lease) {
            return Err(RpcError::LeaseNotFound);
        }
        if (request.ignore_lease || request.ignore_value) && self.kv.current(&request.key).is_none() {
            return Err(RpcError::NotFound("key not found".to_string()));
        }
        Ok(())
    }

    fn validate_ops(&self, ops: &[RequestOp]) -> Result<(), RpcError> {
        for op in ops {
            match op {
                RequestOp::Put(put) => self.validate_put(put)?,
                RequestOp::Txn(txn) => {
                    self.validate_ops(&txn.success)?;
                    self.validate_ops(&txn.failure)?;
                }
                RequestOp::Range(_) | RequestOp::DeleteRange(_) => {}
            }
        }
        Ok(())
    }

    fn apply_put(&mut self, batch: &mut Batch, request: &PutRequest) -> Result<Option<KeyValue>, RpcError> {
        let current = self.kv.current(&request.key).cloned();
        let value = match (&current, request.ignore_value) {
            (Some(current), true) => current.value.clone(),
            _ => request.value.clone(),
        };
        let lease = match (&current, request.ignore_lease) {
            (Some(current), true) => current.lease,
            _ => request.lease,
        };
        let prev = self.put_key(batch, &request.key, value, lease);
        Ok(if request.prev_kv { prev } else { None })
    }

    fn apply_delete(&mut self, batch: &mut Batch, request: &DeleteRangeRequest) -> DeleteRangeResponse {
        let mut response = DeleteRangeResponse::default();
        for key in self.kv.live_keys(&request.key, &request.range_end) {
            if let Some(prev) = self.delete_key(batch, &key) {
                response.deleted += 1;
                if request.prev_kv {
                    response.prev_kvs.push(prev);
                }
            }
        }
        response
    }

    fn apply_txn(&mut self, batch: &mut Batch, request: &TxnRequest) -> Result<TxnResponse, RpcError> {
        let succeeded = request.compare.iter().all(|compare| self.kv.compare(compare));
        let ops = if succeeded { &request.success } else { &request.failure };
        self.validate_ops(ops)?;

        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            responses.push(match op {
                RequestOp::Range(range) => {
                    // Reads see the batch's own writes, as they do on a real store.
                    let mut response = self.kv.range(range)?;
                    response.header = ResponseHeader {
                        revision: batch.revision(),
                        ..self.header()
                    };
                    ResponseOp::Range(response)
                }
                RequestOp::Put(put) => ResponseOp::Put(PutResponse {
                    prev_kv: self.apply_put(batch, put)?,
                    ..Default::default()
                }),
                RequestOp::DeleteRange(delete) => ResponseOp::DeleteRange(self.apply_delete(batch, delete)),
                RequestOp::Txn(txn) => ResponseOp::Txn(self.apply_txn(batch, txn)?),
            });
        }
        Ok(TxnResponse {
            succeeded,
            responses,
            ..Default::default()
        })
    }
}

/// Transport handing out channels to a [`DeterministicStore`].
#[derive(Debug)]
struct StoreTransport {
    store: Arc<DeterministicStore>,
}

impl Transport for StoreTransport {
    fn channel(&self, address: &str, service: Service, _credentials: &ChannelCredentials) -> Arc<dyn ServiceChannel> {
        Arc::new(StoreChannel {
            store: self.store.clone(),
            address: address.to_string(),
            service,
            closed: AtomicBool::new(false),
        })
    }
}

#[derive(Debug)]
struct StoreChannel {
    store: Arc<DeterministicStore>,
    address: String,
    service: Service,
    closed: AtomicBool,
}

impl StoreChannel {
    fn ensure_open(&self) -> Result<(), RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::unavailable(format!("{} channel to {} is closed", self.service, self.address)));
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceChannel for StoreChannel {
    async fn unary(&self, request: RpcRequest, metadata: &Metadata) -> Result<RpcResponse, RpcError> {
        self.ensure_open()?;
        if request.service() != self.service {
            return Err(RpcError::Internal(format!(
                "{} sent on the {} channel",
                request.method(),
                self.service
            )));
        }
        self.store.admit(&self.address, request.method())?;
        self.store.serve(request, metadata)
    }

    async fn watch(&self, metadata: &Metadata) -> Result<WatchStream, RpcError> {
        self.ensure_open()?;
        self.store.admit(&self.address, "watch")?;
        self.store.open_watch(metadata)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use cinder_client_api::AuthenticateRequest;
    use cinder_client_api::Compare;
    use cinder_client_api::CompareOp;
    use cinder_client_api::CompareTarget;
    use cinder_client_api::LeaseGrantRequest;
    use cinder_client_api::LeaseKeepAliveRequest;
    use cinder_client_api::RangeRequest;

    use super::*;

    async fn call(store: &Arc<DeterministicStore>, request: RpcRequest) -> Result<RpcResponse, RpcError> {
        let channel = store.transport().channel("store:1", request.service(), &ChannelCredentials::Insecure);
        channel.unary(request, &Metadata::new()).await
    }

    fn put(key: &str, lease: i64) -> PutRequest {
        PutRequest {
            key: key.as_bytes().to_vec(),
            value: b"v".to_vec(),
            lease,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_counts_requests_and_injects_failures() {
        let store = DeterministicStore::new();
        store.set_host_down("store:1", true);
        assert!(call(&store, RpcRequest::Put(put("a", 0))).await.unwrap_err().is_transport());
        assert_eq!(store.requests_to("store:1"), 1);
        assert_eq!(store.method_calls("put"), 0);

        store.set_host_down("store:1", false);
        store.fail_next("put", RpcError::Internal("boom".into()));
        assert!(call(&store, RpcRequest::Put(put("a", 0))).await.is_err());
        call(&store, RpcRequest::Put(put("a", 0))).await.unwrap();
        assert_eq!(store.method_calls("put"), 2);
    }

    #[tokio::test]
    async fn test_closed_channels_are_unavailable() {
        let store = DeterministicStore::new();
        let channel = store.transport().channel("store:1", Service::Kv, &ChannelCredentials::Insecure);
        channel.close();
        let err = channel.unary(RpcRequest::Range(RangeRequest::default()), &Metadata::new()).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_requires_tokens_once_users_exist() {
        let store = DeterministicStore::new();
        store.add_user("root", "pw");
        let err = call(&store, RpcRequest::Put(put("a", 0))).await.unwrap_err();
        assert_eq!(err, RpcError::InvalidAuthToken);

        let bad = call(
            &store,
            RpcRequest::Authenticate(AuthenticateRequest {
                name: "root".into(),
                password: "nope".into(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(bad, RpcError::AuthFailed(_)));

        let token = call(
            &store,
            RpcRequest::Authenticate(AuthenticateRequest {
                name: "root".into(),
                password: "pw".into(),
            }),
        )
        .await
        .unwrap()
        .into_authenticate()
        .unwrap()
        .token;
        let mut metadata = Metadata::new();
        metadata.insert(TOKEN_METADATA_KEY.to_string(), token);
        let channel = store.transport().channel("store:1", Service::Kv, &ChannelCredentials::Insecure);
        channel.unary(RpcRequest::Put(put("a", 0)), &metadata).await.unwrap();

        store.invalidate_tokens();
        assert_eq!(
            channel.unary(RpcRequest::Put(put("a", 0)), &metadata).await.unwrap_err(),
            RpcError::InvalidAuthToken
        );
    }

    #[tokio::test]
    async fn test_txn_applies_one_branch_atomically() {
        let store = DeterministicStore::new();
        store.put(b"a", b"1");
        let before = store.revision();

        let txn = TxnRequest {
            compare: vec![Compare::new("a", CompareTarget::Value(b"1".to_vec()), CompareOp::Equal)],
            success: vec![RequestOp::Put(put("b", 0)), RequestOp::Put(put("c", 0))],
            failure: vec![],
        };
        let response = call(&store, RpcRequest::Txn(txn)).await.unwrap().into_txn().unwrap();
        assert!(response.succeeded);
        assert_eq!(response.header.revision, before + 1);
        assert_eq!(store.get(b"b").unwrap().mod_revision, store.get(b"c").unwrap().mod_revision);

        let failing = TxnRequest {
            compare: vec![],
            success: vec![RequestOp::Put(put("d", 0)), RequestOp::Put(put("e", 999))],
            failure: vec![],
        };
        assert_eq!(call(&store, RpcRequest::Txn(failing)).await.unwrap_err(), RpcError::LeaseNotFound);
        assert!(store.get(b"d").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_leases_delete_their_keys() {
        let store = DeterministicStore::new();
        let grant = call(&store, RpcRequest::LeaseGrant(LeaseGrantRequest { ttl: 5, id: 0 }))
            .await
            .unwrap()
            .into_lease_grant()
            .unwrap();
        call(&store, RpcRequest::Put(put("leased", grant.id))).await.unwrap();
        assert_eq!(store.get(b"leased").unwrap().lease, grant.id);

        tokio::time::advance(std::time::Duration::from_secs(5)).await;
        assert!(store.get(b"leased").is_none());
        let keep_alive = call(&store, RpcRequest::LeaseKeepAlive(LeaseKeepAliveRequest { id: grant.id }))
            .await
            .unwrap()
            .into_lease_keep_alive()
            .unwrap();
        assert_eq!(keep_alive.ttl, 0);
    }
}
