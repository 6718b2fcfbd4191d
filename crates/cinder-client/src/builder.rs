//! Fluent request builders.
//!
//! Builders hold un-prefixed keys and apply their namespace when the
//! request is executed or turned into a transaction op. A transaction strips
//! its own namespace from every key it returns, so ops that read keys must
//! come from the namespace the transaction was started in.

use std::collections::BTreeMap;
use std::sync::Arc;

use cinder_client_api::Compare;
use cinder_client_api::CompareOp;
use cinder_client_api::CompareTarget;
use cinder_client_api::DeleteRangeRequest;
use cinder_client_api::DeleteRangeResponse;
use cinder_client_api::KeyValue;
use cinder_client_api::PutRequest;
use cinder_client_api::PutResponse;
use cinder_client_api::RangeRequest;
use cinder_client_api::RangeResponse;
use cinder_client_api::RequestOp;
use cinder_client_api::SortOrder;
use cinder_client_api::SortTarget;
use cinder_client_api::TxnRequest;
use cinder_client_api::TxnResponse;
use serde::de::DeserializeOwned;

use crate::connection_pool::ConnectionPool;
use crate::error::ClientError;
use crate::error::Result;
use crate::lease::Lease;
use crate::namespace::KeyApplicator;
use crate::range::Range;

fn decode_utf8(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| ClientError::Decode(e.to_string()))
}

// ============================================================================
// Reads
// ============================================================================

/// Reads one key.
#[derive(Debug, Clone)]
pub struct SingleRangeBuilder {
    pool: Arc<ConnectionPool>,
    namespace: KeyApplicator,
    request: RangeRequest,
}

impl SingleRangeBuilder {
    pub fn new(pool: Arc<ConnectionPool>, namespace: KeyApplicator, key: impl AsRef<[u8]>) -> Self {
        Self {
            pool,
            namespace,
            request: RangeRequest {
                key: key.as_ref().to_vec(),
                ..Default::default()
            },
        }
    }

    /// Reads the key as of a past revision.
    pub fn revision(mut self, revision: i64) -> Self {
        self.request.revision = revision;
        self
    }

    /// Allows any member to answer without going through consensus.
    pub fn serializable(mut self, serializable: bool) -> Self {
        self.request.serializable = serializable;
        self
    }

    fn build(&self) -> RangeRequest {
        let mut request = self.request.clone();
        request.key = self.namespace.apply_key(&request.key);
        request
    }

    pub fn into_op(self) -> RequestOp {
        RequestOp::Range(self.build())
    }

    pub async fn exec(self) -> Result<RangeResponse> {
        let mut response = self.pool.range(self.build()).await?;
        response.kvs = self.namespace.unprefix_kvs(response.kvs)?;
        Ok(response)
    }

    /// The full key-value record, if the key exists.
    pub async fn kv(self) -> Result<Option<KeyValue>> {
        Ok(self.exec().await?.kvs.into_iter().next())
    }

    pub async fn buffer(self) -> Result<Option<Vec<u8>>> {
        Ok(self.kv().await?.map(|kv| kv.value))
    }

    pub async fn string(self) -> Result<Option<String>> {
        self.buffer().await?.map(decode_utf8).transpose()
    }

    /// Parses the value as a number.
    pub async fn number<T>(self) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string().await? {
            Some(s) => s.trim().parse().map(Some).map_err(|e: T::Err| ClientError::Decode(e.to_string())),
            None => Ok(None),
        }
    }

    /// Deserializes the value as JSON.
    pub async fn json<T: DeserializeOwned>(self) -> Result<Option<T>> {
        match self.buffer().await? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| ClientError::Decode(e.to_string())),
            None => Ok(None),
        }
    }
}

/// Reads a range of keys.
#[derive(Debug, Clone)]
pub struct MultiRangeBuilder {
    pool: Arc<ConnectionPool>,
    namespace: KeyApplicator,
    range: Range,
    request: RangeRequest,
}

impl MultiRangeBuilder {
    pub fn new(pool: Arc<ConnectionPool>, namespace: KeyApplicator) -> Self {
        Self {
            pool,
            namespace,
            range: Range::prefix(b""),
            request: RangeRequest::default(),
        }
    }

    pub fn prefix(mut self, prefix: impl AsRef<[u8]>) -> Self {
        self.range = Range::prefix(prefix);
        self
    }

    pub fn in_range(mut self, range: Range) -> Self {
        self.range = range;
        self
    }

    /// Every key in the namespace.
    pub fn all(self) -> Self {
        self.prefix(b"")
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.request.limit = limit;
        self
    }

    pub fn sort(mut self, target: SortTarget, order: SortOrder) -> Self {
        self.request.sort_target = target;
        self.request.sort_order = order;
        self
    }

    pub fn revision(mut self, revision: i64) -> Self {
        self.request.revision = revision;
        self
    }

    pub fn serializable(mut self, serializable: bool) -> Self {
        self.request.serializable = serializable;
        self
    }

    fn build(&self) -> RangeRequest {
        let mut request = self.request.clone();
        (request.key, request.range_end) = self.namespace.apply_range(&self.range);
        request
    }

    pub fn into_op(self) -> RequestOp {
        RequestOp::Range(self.build())
    }

    pub async fn exec(self) -> Result<RangeResponse> {
        let mut response = self.pool.range(self.build()).await?;
        response.kvs = self.namespace.unprefix_kvs(response.kvs)?;
        Ok(response)
    }

    pub async fn kvs(self) -> Result<Vec<KeyValue>> {
        Ok(self.exec().await?.kvs)
    }

    /// Only the keys, without fetching values.
    pub async fn keys(mut self) -> Result<Vec<Vec<u8>>> {
        self.request.keys_only = true;
        Ok(self.exec().await?.kvs.into_iter().map(|kv| kv.key).collect())
    }

    pub async fn key_strings(self) -> Result<Vec<String>> {
        self.keys().await?.into_iter().map(decode_utf8).collect()
    }

    pub async fn buffers(self) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        Ok(self.exec().await?.kvs.into_iter().map(|kv| (kv.key, kv.value)).collect())
    }

    pub async fn strings(self) -> Result<BTreeMap<String, String>> {
        self.buffers()
            .await?
            .into_iter()
            .map(|(k, v)| Ok((decode_utf8(k)?, decode_utf8(v)?)))
            .collect()
    }

    /// Number of keys in the range.
    pub async fn count(mut self) -> Result<i64> {
        self.request.count_only = true;
        Ok(self.exec().await?.count)
    }
}

// ============================================================================
// Writes
// ============================================================================

/// Writes one key.
#[derive(Debug, Clone)]
pub struct PutBuilder {
    pool: Arc<ConnectionPool>,
    namespace: KeyApplicator,
    request: PutRequest,
    lease: Option<Lease>,
}

impl PutBuilder {
    pub fn new(pool: Arc<ConnectionPool>, namespace: KeyApplicator, key: impl AsRef<[u8]>) -> Self {
        Self {
            pool,
            namespace,
            request: PutRequest {
                key: key.as_ref().to_vec(),
                ..Default::default()
            },
            lease: None,
        }
    }

    pub fn value(mut self, value: impl AsRef<[u8]>) -> Self {
        self.request.value = value.as_ref().to_vec();
        self
    }

    /// Serializes `value` as JSON.
    pub fn json<T: serde::Serialize>(self, value: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(value).map_err(|e| ClientError::Decode(e.to_string()))?;
        Ok(self.value(bytes))
    }

    /// Attaches the key to a lease by id.
    pub fn lease(mut self, lease_id: i64) -> Self {
        self.request.lease = lease_id;
        self
    }

    /// Attaches the key to a lease handle. The lease is granted first if
    /// needed, and a rejection by the store marks the lease lost.
    pub(crate) fn with_lease_handle(mut self, lease: Lease) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Keeps whatever lease the key already has.
    pub fn ignore_lease(mut self) -> Self {
        self.request.ignore_lease = true;
        self
    }

    /// Bumps the key's revision without changing its value.
    pub fn touch(mut self) -> Self {
        self.request.ignore_value = true;
        self
    }

    /// Turns into a transaction op. A lease handle must already be granted.
    fn build(&self) -> PutRequest {
        let mut request = self.request.clone();
        if let Some(id) = self.lease.as_ref().and_then(|lease| lease.id()) {
            request.lease = id;
        }
        request.key = self.namespace.apply_key(&request.key);
        request
    }

    pub fn into_op(self) -> RequestOp {
        RequestOp::Put(self.build())
    }

    pub async fn exec(mut self) -> Result<PutResponse> {
        if let Some(lease) = &self.lease {
            self.request.lease = lease.grant().await?;
        }

        match self.pool.put(self.build()).await {
            Ok(mut response) => {
                response.prev_kv = response.prev_kv.map(|kv| self.namespace.unprefix_kv(kv)).transpose()?;
                Ok(response)
            }
            Err(e) if e.is_lease_not_found() => match &self.lease {
                Some(lease) => Err(lease.invalidate_from_server(self.request.lease)),
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Writes and returns the previous record, if any.
    pub async fn get_previous(mut self) -> Result<Option<KeyValue>> {
        self.request.prev_kv = true;
        Ok(self.exec().await?.prev_kv)
    }
}

/// Deletes a key or range.
#[derive(Debug, Clone)]
pub struct DeleteBuilder {
    pool: Arc<ConnectionPool>,
    namespace: KeyApplicator,
    range: Range,
    prev_kv: bool,
}

impl DeleteBuilder {
    /// Starts with no key selected; pick one with [`DeleteBuilder::key`],
    /// [`DeleteBuilder::prefix`], [`DeleteBuilder::range`] or
    /// [`DeleteBuilder::all`].
    pub fn new(pool: Arc<ConnectionPool>, namespace: KeyApplicator) -> Self {
        Self {
            pool,
            namespace,
            range: Range::new(b"", b""),
            prev_kv: false,
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

    pub fn range(mut self, range: Range) -> Self {
        self.range = range;
        self
    }

    /// Every key in the namespace.
    pub fn all(self) -> Self {
        self.prefix(b"")
    }

    fn build(&self) -> DeleteRangeRequest {
        let (key, range_end) = self.namespace.apply_range(&self.range);
        DeleteRangeRequest {
            key,
            range_end,
            prev_kv: self.prev_kv,
        }
    }

    pub fn into_op(self) -> RequestOp {
        RequestOp::DeleteRange(self.build())
    }

    pub async fn exec(self) -> Result<DeleteRangeResponse> {
        let mut response = self.pool.delete_range(self.build()).await?;
        response.prev_kvs = self.namespace.unprefix_kvs(response.prev_kvs)?;
        Ok(response)
    }

    /// Deletes and returns the removed records.
    pub async fn get_previous(mut self) -> Result<Vec<KeyValue>> {
        self.prev_kv = true;
        Ok(self.exec().await?.prev_kvs)
    }
}

// ============================================================================
// Transactions
// ============================================================================

/// Compare-and-swap transaction: `when` comparisons hold, run the `and_then`
/// ops, otherwise run the `or_else` ops.
#[derive(Debug, Clone)]
pub struct TxnBuilder {
    pool: Arc<ConnectionPool>,
    namespace: KeyApplicator,
    request: TxnRequest,
}

impl TxnBuilder {
    pub fn new(pool: Arc<ConnectionPool>, namespace: KeyApplicator) -> Self {
        Self {
            pool,
            namespace,
            request: TxnRequest::default(),
        }
    }

    /// Adds a comparison. All comparisons must hold.
    pub fn and(mut self, key: impl AsRef<[u8]>, target: CompareTarget, op: CompareOp) -> Self {
        self.request.compare.push(Compare::new(self.namespace.apply_key(key), target, op));
        self
    }

    /// Adds a comparison over every key in `range`.
    pub fn and_range(mut self, range: &Range, target: CompareTarget, op: CompareOp) -> Self {
        let (key, end) = self.namespace.apply_range(range);
        self.request.compare.push(Compare::new(key, target, op).with_range_end(end));
        self
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = RequestOp>) -> Self {
        self.request.success.extend(ops);
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = RequestOp>) -> Self {
        self.request.failure.extend(ops);
        self
    }

    pub fn into_op(self) -> RequestOp {
        RequestOp::Txn(self.request)
    }

    /// Commits the transaction. Keys in the responses are unprefixed with
    /// this builder's namespace; a returned key outside it fails with
    /// [`ClientError::NamespaceMismatch`].
    pub async fn commit(self) -> Result<TxnResponse> {
        let mut response = self.pool.txn(self.request).await?;
        response.responses = response
            .responses
            .into_iter()
            .map(|op| self.namespace.unprefix_response(op))
            .collect::<Result<_>>()?;
        Ok(response)
    }
}
