//! Key namespacing.
//!
//! A [`Namespace`] is a view of the store in which every key carries a fixed
//! prefix. Keys are prefixed on the way out and stripped on the way back, so
//! code running inside a namespace never sees the prefix. The [`Client`] is
//! the namespace with an empty prefix.
//!
//! ```ignore
//! let users = client.namespace("users/");
//! users.put("alice").value("admin").exec().await?;          // stores "users/alice"
//! assert_eq!(client.get("users/alice").string().await?, Some("admin".into()));
//! ```

use std::fmt;
use std::sync::Arc;

use cinder_client_api::CompareOp;
use cinder_client_api::CompareTarget;
use cinder_client_api::KeyValue;
use cinder_client_api::ResponseOp;
use tracing::debug;

use crate::builder::DeleteBuilder;
use crate::builder::MultiRangeBuilder;
use crate::builder::PutBuilder;
use crate::builder::SingleRangeBuilder;
use crate::builder::TxnBuilder;
use crate::connection_pool::ConnectionPool;
use crate::error::ClientError;
use crate::error::Result;
use crate::lease::Lease;
use crate::lock::Lock;
use crate::range::Range;
use crate::range::ZERO_KEY;
use crate::range::end_range_for_prefix;
use crate::stm::SoftwareTransaction;
use crate::stm::StmOptions;
use crate::watch::WatchBuilder;
use crate::watch::WatchManager;

/// Adds and strips a namespace prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyApplicator {
    prefix: Arc<[u8]>,
    prefix_end: Arc<[u8]>,
}

impl KeyApplicator {
    pub fn new(prefix: impl AsRef<[u8]>) -> Self {
        let prefix = prefix.as_ref();
        Self {
            prefix: Arc::from(prefix),
            prefix_end: Arc::from(end_range_for_prefix(prefix)),
        }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// Applicator for a namespace nested inside this one.
    pub fn join(&self, child: impl AsRef<[u8]>) -> Self {
        Self::new(self.apply_key(child))
    }

    pub fn apply_key(&self, key: impl AsRef<[u8]>) -> Vec<u8> {
        let key = key.as_ref();
        if self.prefix.is_empty() {
            return key.to_vec();
        }
        let mut out = Vec::with_capacity(self.prefix.len() + key.len());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(key);
        out
    }

    /// Prefixes a range end. An empty end (single key) stays empty and
    /// [`ZERO_KEY`] becomes the end of the namespace.
    pub fn apply_range_end(&self, end: impl AsRef<[u8]>) -> Vec<u8> {
        let end = end.as_ref();
        if self.prefix.is_empty() || end.is_empty() {
            return end.to_vec();
        }
        if end == ZERO_KEY {
            return self.prefix_end.to_vec();
        }
        self.apply_key(end)
    }

    /// Prefixes both ends of a range. The range of every key maps to the
    /// whole namespace.
    pub fn apply_range(&self, range: &Range) -> (Vec<u8>, Vec<u8>) {
        if !self.prefix.is_empty() && range.start.as_slice() == ZERO_KEY && range.end.as_slice() == ZERO_KEY {
            return (self.prefix.to_vec(), self.prefix_end.to_vec());
        }
        (self.apply_key(&range.start), self.apply_range_end(&range.end))
    }

    /// Strips the prefix from a key returned by the store.
    pub fn unprefix(&self, key: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        let key = key.as_ref();
        match key.strip_prefix(&*self.prefix) {
            Some(rest) => Ok(rest.to_vec()),
            None => Err(ClientError::NamespaceMismatch {
                key: key.to_vec(),
                prefix: self.prefix.to_vec(),
            }),
        }
    }

    pub fn unprefix_kv(&self, mut kv: KeyValue) -> Result<KeyValue> {
        kv.key = self.unprefix(&kv.key)?;
        Ok(kv)
    }

    pub(crate) fn unprefix_kvs(&self, kvs: Vec<KeyValue>) -> Result<Vec<KeyValue>> {
        kvs.into_iter().map(|kv| self.unprefix_kv(kv)).collect()
    }

    /// Strips the prefix from every key inside a transaction response.
    pub(crate) fn unprefix_response(&self, op: ResponseOp) -> Result<ResponseOp> {
        Ok(match op {
            ResponseOp::Range(mut r) => {
                r.kvs = self.unprefix_kvs(r.kvs)?;
                ResponseOp::Range(r)
            }
            ResponseOp::Put(mut r) => {
                r.prev_kv = r.prev_kv.map(|kv| self.unprefix_kv(kv)).transpose()?;
                ResponseOp::Put(r)
            }
            ResponseOp::DeleteRange(mut r) => {
                r.prev_kvs = self.unprefix_kvs(r.prev_kvs)?;
                ResponseOp::DeleteRange(r)
            }
            ResponseOp::Txn(mut r) => {
                r.responses = r.responses.into_iter().map(|op| self.unprefix_response(op)).collect::<Result<_>>()?;
                ResponseOp::Txn(r)
            }
        })
    }
}

/// A prefixed view of the store.
#[derive(Clone)]
pub struct Namespace {
    pool: Arc<ConnectionPool>,
    watch_manager: WatchManager,
    applicator: KeyApplicator,
}

impl Namespace {
    pub(crate) fn new(pool: Arc<ConnectionPool>, applicator: KeyApplicator, watch_manager: WatchManager) -> Self {
        Self {
            pool,
            watch_manager,
            applicator,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn prefix(&self) -> &[u8] {
        self.applicator.prefix()
    }

    pub fn applicator(&self) -> &KeyApplicator {
        &self.applicator
    }

    /// Reads a single key.
    pub fn get(&self, key: impl AsRef<[u8]>) -> SingleRangeBuilder {
        SingleRangeBuilder::new(self.pool.clone(), self.applicator.clone(), key)
    }

    /// Reads many keys. Selects every key in the namespace until narrowed.
    pub fn get_all(&self) -> MultiRangeBuilder {
        MultiRangeBuilder::new(self.pool.clone(), self.applicator.clone())
    }

    pub fn put(&self, key: impl AsRef<[u8]>) -> PutBuilder {
        PutBuilder::new(self.pool.clone(), self.applicator.clone(), key)
    }

    pub fn delete(&self) -> DeleteBuilder {
        DeleteBuilder::new(self.pool.clone(), self.applicator.clone())
    }

    /// Starts a comparison transaction.
    pub fn when(&self, key: impl AsRef<[u8]>, target: CompareTarget, op: CompareOp) -> TxnBuilder {
        TxnBuilder::new(self.pool.clone(), self.applicator.clone()).and(key, target, op)
    }

    /// Creates a lease and starts granting it in the background. Loss of
    /// that first grant is reported through the lease's events.
    ///
    /// Outside a tokio runtime nothing is spawned and the lease is granted
    /// by its first use instead.
    pub fn lease(&self, ttl_secs: i64) -> Result<Lease> {
        let lease = Lease::new(self.pool.clone(), self.applicator.clone(), ttl_secs)?;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let eager = lease.clone();
                runtime.spawn(async move {
                    let _ = eager.grant().await;
                });
            }
            Err(_) => debug!(ttl_secs, "no runtime, lease will be granted on first use"),
        }
        Ok(lease)
    }

    pub fn lock(&self, key: impl AsRef<[u8]>) -> Lock {
        Lock::new(self.clone(), key)
    }

    pub fn stm(&self, options: StmOptions) -> SoftwareTransaction {
        SoftwareTransaction::new(self.clone(), options)
    }

    pub fn watch(&self) -> WatchBuilder {
        WatchBuilder::new(self.watch_manager.clone(), self.applicator.clone())
    }

    /// A namespace nested under this one.
    pub fn namespace(&self, prefix: impl AsRef<[u8]>) -> Namespace {
        let applicator = self.applicator.join(prefix);
        let watch_manager = WatchManager::new(self.pool.clone(), self.watch_manager.backoff());
        Namespace::new(self.pool.clone(), applicator, watch_manager)
    }

    pub fn watch_manager(&self) -> &WatchManager {
        &self.watch_manager
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace").field("prefix", &self.applicator.prefix()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_prefix_is_identity() {
        let ns = KeyApplicator::default();
        assert_eq!(ns.apply_key(b"foo"), b"foo".to_vec());
        assert_eq!(ns.apply_range_end(ZERO_KEY), ZERO_KEY.to_vec());
        assert_eq!(ns.unprefix(b"foo").unwrap(), b"foo".to_vec());
    }

    #[test]
    fn test_applies_prefix() {
        let ns = KeyApplicator::new(b"user1/");
        assert_eq!(ns.apply_key(b"foo"), b"user1/foo".to_vec());
        assert_eq!(ns.apply_range_end(b"foo2"), b"user1/foo2".to_vec());
        assert_eq!(ns.apply_range_end(b""), Vec::<u8>::new());
    }

    #[test]
    fn test_zero_range_end_is_namespace_end() {
        let ns = KeyApplicator::new(b"user1/");
        assert_eq!(ns.apply_range_end(ZERO_KEY), b"user10".to_vec());
    }

    #[test]
    fn test_every_key_maps_to_whole_namespace() {
        let ns = KeyApplicator::new(b"user1/");
        assert_eq!(ns.apply_range(&Range::prefix(b"")), (b"user1/".to_vec(), b"user10".to_vec()));
        assert_eq!(ns.apply_range(&Range::prefix(b"a")), (b"user1/a".to_vec(), b"user1/b".to_vec()));
    }

    #[test]
    fn test_unprefix_rejects_foreign_keys() {
        let ns = KeyApplicator::new(b"user1/");
        assert_eq!(ns.unprefix(b"user1/foo").unwrap(), b"foo".to_vec());
        assert_eq!(
            ns.unprefix(b"user2/foo").unwrap_err(),
            ClientError::NamespaceMismatch {
                key: b"user2/foo".to_vec(),
                prefix: b"user1/".to_vec(),
            }
        );
    }

    #[test]
    fn test_lease_outside_a_runtime_is_granted_on_first_use() {
        let store = cinder_testing::DeterministicStore::new();
        let client = crate::Client::new(crate::ClientOptions::new(["store:1"]), store.transport()).unwrap();
        let lease = client.namespace("sessions/").lease(60).unwrap();
        assert_eq!(lease.state(), crate::LeaseState::Unestablished);
        assert_eq!(store.method_calls("lease_grant"), 0);

        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            lease.grant().await.unwrap();
            assert_eq!(lease.state(), crate::LeaseState::Alive);
            lease.revoke().await.unwrap();
        });
        assert_eq!(store.method_calls("lease_grant"), 1);
    }

    #[test]
    fn test_join_nests_prefixes() {
        let ns = KeyApplicator::new(b"a/").join(b"b/");
        assert_eq!(ns.prefix(), b"a/b/");
        assert_eq!(ns.apply_key(b"k"), b"a/b/k".to_vec());
    }
}
