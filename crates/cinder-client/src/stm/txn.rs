//! The per-attempt transaction overlay.

use std::collections::BTreeMap;
use std::sync::Arc;

use cinder_client_api::Compare;
use cinder_client_api::CompareOp;
use cinder_client_api::CompareTarget;
use cinder_client_api::DeleteRangeRequest;
use cinder_client_api::KeyValue;
use cinder_client_api::PutRequest;
use cinder_client_api::RangeRequest;
use cinder_client_api::RequestOp;
use cinder_client_api::ResponseOp;
use cinder_client_api::TxnRequest;

use super::IsolationFlags;
use crate::connection_pool::ConnectionPool;
use crate::error::ClientError;
use crate::error::Result;
use crate::namespace::KeyApplicator;
use crate::range::Range;

/// One attempt of a software transaction.
///
/// Reads go to the store (or the read cache, depending on isolation) and
/// writes only touch the local overlay until the attempt commits. Keys are
/// relative to the transaction's namespace.
#[derive(Debug)]
pub struct Txn {
    pool: Arc<ConnectionPool>,
    namespace: KeyApplicator,
    flags: IsolationFlags,
    /// Snapshot revision, pinned by the first read.
    revision: Option<i64>,
    /// Keys read from the store and what was seen.
    reads: BTreeMap<Vec<u8>, Option<KeyValue>>,
    range_reads: Vec<(Range, i64)>,
    /// Pending writes. `None` is a tombstone.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    deleted_ranges: Vec<Range>,
}

impl Txn {
    pub(crate) fn new(pool: Arc<ConnectionPool>, namespace: KeyApplicator, flags: IsolationFlags) -> Self {
        Self {
            pool,
            namespace,
            flags,
            revision: None,
            reads: BTreeMap::new(),
            range_reads: Vec::new(),
            writes: BTreeMap::new(),
            deleted_ranges: Vec::new(),
        }
    }

    /// The pinned snapshot revision, if any read has happened.
    pub fn revision(&self) -> Option<i64> {
        self.revision
    }

    /// Reads a record, seeing this attempt's own writes.
    pub async fn get_kv(&mut self, key: impl AsRef<[u8]>) -> Result<Option<KeyValue>> {
        let key = key.as_ref();
        if let Some(pending) = self.writes.get(key) {
            return Ok(pending.as_ref().map(|value| KeyValue {
                key: key.to_vec(),
                value: value.clone(),
                ..Default::default()
            }));
        }
        if self.deleted_ranges.iter().any(|range| range.includes(key)) {
            return Ok(None);
        }
        if self.flags.caches_reads
            && let Some(cached) = self.reads.get(key)
        {
            return Ok(cached.clone());
        }

        let response = self
            .pool
            .range(RangeRequest {
                key: self.namespace.apply_key(key),
                revision: self.snapshot_revision(),
                ..Default::default()
            })
            .await?;
        self.pin(response.header.revision);
        let kv = response.kvs.into_iter().next().map(|kv| self.namespace.unprefix_kv(kv)).transpose()?;
        if self.flags.caches_reads {
            self.reads.insert(key.to_vec(), kv.clone());
        }
        Ok(kv)
    }

    pub async fn get(&mut self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        Ok(self.get_kv(key).await?.map(|kv| kv.value))
    }

    pub async fn get_string(&mut self, key: impl AsRef<[u8]>) -> Result<Option<String>> {
        self.get(key)
            .await?
            .map(|bytes| String::from_utf8(bytes).map_err(|e| ClientError::Decode(e.to_string())))
            .transpose()
    }

    /// Reads every key in `range`, merged with this attempt's writes.
    pub async fn get_range(&mut self, range: Range) -> Result<Vec<KeyValue>> {
        let (key, range_end) = self.namespace.apply_range(&range);
        let response = self
            .pool
            .range(RangeRequest {
                key,
                range_end,
                revision: self.snapshot_revision(),
                ..Default::default()
            })
            .await?;
        self.pin(response.header.revision);
        if self.flags.checks_ranges {
            let revision = self.revision.unwrap_or(response.header.revision);
            self.range_reads.push((range.clone(), revision));
        }

        let mut merged: BTreeMap<Vec<u8>, KeyValue> = BTreeMap::new();
        for kv in self.namespace.unprefix_kvs(response.kvs)? {
            if !self.deleted_ranges.iter().any(|deleted| deleted.includes(&kv.key)) {
                merged.insert(kv.key.clone(), kv);
            }
        }
        for (key, pending) in self.writes.range(range.start.clone()..) {
            if !range.includes(key) {
                break;
            }
            match pending {
                Some(value) => {
                    merged.insert(key.clone(), KeyValue {
                        key: key.clone(),
                        value: value.clone(),
                        ..Default::default()
                    });
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    /// Buffers a write.
    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.writes.insert(key.as_ref().to_vec(), Some(value.as_ref().to_vec()));
    }

    /// Buffers a single-key delete.
    pub fn delete_key(&mut self, key: impl AsRef<[u8]>) {
        self.writes.insert(key.as_ref().to_vec(), None);
    }

    pub fn delete_prefix(&mut self, prefix: impl AsRef<[u8]>) -> Result<()> {
        self.delete_range(Range::prefix(prefix))
    }

    /// Buffers a range delete. Snapshot isolation refuses ranges holding a
    /// key this attempt already read.
    pub fn delete_range(&mut self, range: Range) -> Result<()> {
        if self.flags.checks_ranges
            && let Some(key) = self.reads.keys().find(|key| range.includes(key))
        {
            return Err(ClientError::RangeDeleteAfterRead { key: key.clone() });
        }
        self.writes.retain(|key, _| !range.includes(key));
        self.deleted_ranges.push(range);
        Ok(())
    }

    /// Reads `keys` in one round trip and caches the results.
    pub(crate) async fn prefetch(&mut self, keys: &[Vec<u8>]) -> Result<()> {
        if keys.is_empty() || !self.flags.caches_reads {
            return Ok(());
        }
        let request = TxnRequest {
            success: keys
                .iter()
                .map(|key| {
                    RequestOp::Range(RangeRequest {
                        key: self.namespace.apply_key(key),
                        ..Default::default()
                    })
                })
                .collect(),
            ..Default::default()
        };
        let response = self.pool.txn(request).await?;
        self.pin(response.header.revision);
        for (key, op) in keys.iter().zip(response.responses) {
            if let ResponseOp::Range(range) = op {
                let kv = range.kvs.into_iter().next().map(|kv| self.namespace.unprefix_kv(kv)).transpose()?;
                self.reads.insert(key.clone(), kv);
            }
        }
        Ok(())
    }

    /// Whether committing would neither check nor change anything.
    pub(crate) fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.deleted_ranges.is_empty() && self.compares().is_empty()
    }

    fn snapshot_revision(&self) -> i64 {
        if self.flags.pins_snapshot { self.revision.unwrap_or(0) } else { 0 }
    }

    fn pin(&mut self, revision: i64) {
        if self.flags.pins_snapshot && self.revision.is_none() {
            self.revision = Some(revision);
        }
    }

    fn compares(&self) -> Vec<Compare> {
        let mut compares = Vec::new();
        if self.flags.caches_reads {
            for (key, kv) in &self.reads {
                let mod_revision = kv.as_ref().map_or(0, |kv| kv.mod_revision);
                compares.push(Compare::new(
                    self.namespace.apply_key(key),
                    CompareTarget::ModRevision(mod_revision),
                    CompareOp::Equal,
                ));
            }
        }
        if self.flags.checks_ranges {
            for (range, revision) in &self.range_reads {
                compares.push(self.unchanged_since(range, *revision));
            }
            if let Some(revision) = self.revision {
                for range in &self.deleted_ranges {
                    compares.push(self.unchanged_since(range, revision));
                }
                for key in self.writes.keys().filter(|key| !self.reads.contains_key(*key)) {
                    compares.push(Compare::new(
                        self.namespace.apply_key(key),
                        CompareTarget::ModRevision(revision + 1),
                        CompareOp::Less,
                    ));
                }
            }
        }
        compares
    }

    fn unchanged_since(&self, range: &Range, revision: i64) -> Compare {
        let (key, range_end) = self.namespace.apply_range(range);
        Compare::new(key, CompareTarget::ModRevision(revision + 1), CompareOp::Less).with_range_end(range_end)
    }

    /// The compare-and-swap request that commits this attempt.
    pub(crate) fn commit_request(&self) -> TxnRequest {
        let mut success = Vec::with_capacity(self.deleted_ranges.len() + self.writes.len());
        for range in &self.deleted_ranges {
            let (key, range_end) = self.namespace.apply_range(range);
            success.push(RequestOp::DeleteRange(DeleteRangeRequest {
                key,
                range_end,
                prev_kv: false,
            }));
        }
        for (key, pending) in &self.writes {
            let key = self.namespace.apply_key(key);
            success.push(match pending {
                Some(value) => RequestOp::Put(PutRequest {
                    key,
                    value: value.clone(),
                    ..Default::default()
                }),
                None => RequestOp::DeleteRange(DeleteRangeRequest {
                    key,
                    ..Default::default()
                }),
            });
        }
        TxnRequest {
            compare: self.compares(),
            success,
            failure: Vec::new(),
        }
    }
}
