//! Multi-version key space.
//!
//! Every key keeps its full history so reads at a past revision see the
//! value as it was. Writes are grouped into a [`Batch`] that commits under
//! a single revision, the way a transaction does on a real store.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use cinder_client_api::Compare;
use cinder_client_api::CompareOp;
use cinder_client_api::CompareTarget;
use cinder_client_api::Event;
use cinder_client_api::EventType;
use cinder_client_api::KeyValue;
use cinder_client_api::RangeRequest;
use cinder_client_api::RangeResponse;
use cinder_client_api::RpcError;
use cinder_client_api::SortOrder;
use cinder_client_api::SortTarget;

/// Whether `key` falls in the selection `(start, end)`.
///
/// An empty `end` selects `start` alone and `[0]` selects every key from
/// `start` onwards.
pub fn in_range(key: &[u8], start: &[u8], end: &[u8]) -> bool {
    match end {
        [] => key == start,
        [0] => key >= start,
        _ => key >= start && key < end,
    }
}

#[derive(Debug, Clone)]
struct Version {
    revision: i64,
    /// `None` is a tombstone.
    kv: Option<KeyValue>,
}

/// Writes pending under one revision.
#[derive(Debug)]
pub struct Batch {
    revision: i64,
    events: Vec<Event>,
}

impl Batch {
    pub fn revision(&self) -> i64 {
        self.revision
    }
}

/// A revision's worth of committed events.
#[derive(Debug, Clone)]
pub struct Committed {
    pub revision: i64,
    pub events: Vec<Event>,
}

#[derive(Debug)]
pub struct KeySpace {
    revision: i64,
    compact_revision: i64,
    keys: BTreeMap<Vec<u8>, Vec<Version>>,
    log: Vec<Committed>,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new()
    }
}

impl KeySpace {
    /// An empty key space at revision 1.
    pub fn new() -> Self {
        Self {
            revision: 1,
            compact_revision: 0,
            keys: BTreeMap::new(),
            log: Vec::new(),
        }
    }

    pub fn revision(&self) -> i64 {
        self.revision
    }

    pub fn compact_revision(&self) -> i64 {
        self.compact_revision
    }

    /// Latest live value of `key`.
    pub fn current(&self, key: &[u8]) -> Option<&KeyValue> {
        self.keys.get(key)?.last()?.kv.as_ref()
    }

    fn at(&self, key: &[u8], revision: i64) -> Option<&KeyValue> {
        self.keys
            .get(key)?
            .iter()
            .rev()
            .find(|version| version.revision <= revision)?
            .kv
            .as_ref()
    }

    /// Live keys in `(start, end)` at the latest revision.
    pub fn live_keys(&self, start: &[u8], end: &[u8]) -> Vec<Vec<u8>> {
        self.keys
            .range(start.to_vec()..)
            .filter(|(key, versions)| in_range(key, start, end) && versions.last().is_some_and(|v| v.kv.is_some()))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn range(&self, request: &RangeRequest) -> Result<RangeResponse, RpcError> {
        let revision = match request.revision {
            0 => self.revision,
            r if r < self.compact_revision => {
                return Err(RpcError::Compacted {
                    compact_revision: self.compact_revision,
                });
            }
            r if r > self.revision => return Err(RpcError::InvalidArgument("required revision is a future revision".into())),
            r => r,
        };

        let mut kvs: Vec<KeyValue> = self
            .keys
            .range(request.key.clone()..)
            .filter(|(key, _)| in_range(key, &request.key, &request.range_end))
            .filter_map(|(key, _)| self.at(key, revision).cloned())
            .collect();
        sort(&mut kvs, request.sort_order, request.sort_target);

        let count = kvs.len() as i64;
        let mut more = false;
        if request.limit > 0 && count > request.limit {
            kvs.truncate(request.limit as usize);
            more = true;
        }
        if request.count_only {
            kvs.clear();
        } else if request.keys_only {
            for kv in &mut kvs {
                kv.value.clear();
            }
        }

        Ok(RangeResponse {
            kvs,
            more,
            count,
            ..Default::default()
        })
    }

    /// Starts a batch committing at the next revision.
    pub fn begin(&self) -> Batch {
        Batch {
            revision: self.revision + 1,
            events: Vec::new(),
        }
    }

    /// Writes `key`, returning the value it replaced.
    pub fn put(&mut self, batch: &mut Batch, key: &[u8], value: Vec<u8>, lease: i64) -> Option<KeyValue> {
        let prev = self.current(key).cloned();
        let kv = KeyValue {
            key: key.to_vec(),
            value,
            create_revision: prev.as_ref().map_or(batch.revision, |p| p.create_revision),
            mod_revision: batch.revision,
            version: prev.as_ref().map_or(1, |p| p.version + 1),
            lease,
        };
        self.push(key, batch.revision, Some(kv.clone()));
        batch.events.push(Event {
            kind: EventType::Put,
            kv,
            prev_kv: prev.clone(),
        });
        prev
    }

    /// Deletes `key`, returning the deleted value if it was live.
    pub fn delete(&mut self, batch: &mut Batch, key: &[u8]) -> Option<KeyValue> {
        let prev = self.current(key).cloned()?;
        self.push(key, batch.revision, None);
        batch.events.push(Event {
            kind: EventType::Delete,
            kv: KeyValue {
                key: key.to_vec(),
                mod_revision: batch.revision,
                ..Default::default()
            },
            prev_kv: Some(prev.clone()),
        });
        Some(prev)
    }

    fn push(&mut self, key: &[u8], revision: i64, kv: Option<KeyValue>) {
        let versions = self.keys.entry(key.to_vec()).or_default();
        // Later writes to the same key in one batch replace earlier ones.
        if versions.last().is_some_and(|v| v.revision == revision) {
            versions.pop();
        }
        versions.push(Version { revision, kv });
    }

    /// Commits `batch`. Batches without writes leave the revision alone.
    pub fn finish(&mut self, batch: Batch) -> Option<Committed> {
        if batch.events.is_empty() {
            return None;
        }
        self.revision = batch.revision;
        let committed = Committed {
            revision: batch.revision,
            events: batch.events,
        };
        self.log.push(committed.clone());
        Some(committed)
    }

    /// Committed revisions from `start` onwards.
    pub fn history_from(&self, start: i64) -> impl Iterator<Item = &Committed> {
        self.log.iter().filter(move |c| c.revision >= start)
    }

    pub fn compact(&mut self, revision: i64) {
        self.compact_revision = self.compact_revision.max(revision);
        self.log.retain(|c| c.revision >= revision);
    }

    /// Evaluates one transaction predicate against the latest revision.
    pub fn compare(&self, compare: &Compare) -> bool {
        if compare.range_end.is_empty() {
            return match self.current(&compare.key) {
                Some(kv) => compare_kv(compare, kv),
                // A missing key has no value to compare, but zero revisions.
                None if matches!(compare.target, CompareTarget::Value(_)) => false,
                None => compare_kv(compare, &KeyValue::default()),
            };
        }
        self.live_keys(&compare.key, &compare.range_end)
            .iter()
            .filter_map(|key| self.current(key))
            .all(|kv| compare_kv(compare, kv))
    }
}

fn compare_kv(compare: &Compare, kv: &KeyValue) -> bool {
    let ordering = match &compare.target {
        CompareTarget::Version(v) => kv.version.cmp(v),
        CompareTarget::CreateRevision(v) => kv.create_revision.cmp(v),
        CompareTarget::ModRevision(v) => kv.mod_revision.cmp(v),
        CompareTarget::Value(v) => kv.value.as_slice().cmp(v.as_slice()),
        CompareTarget::Lease(v) => kv.lease.cmp(v),
    };
    match compare.op {
        CompareOp::Equal => ordering == Ordering::Equal,
        CompareOp::NotEqual => ordering != Ordering::Equal,
        CompareOp::Greater => ordering == Ordering::Greater,
        CompareOp::Less => ordering == Ordering::Less,
    }
}

fn sort(kvs: &mut [KeyValue], order: SortOrder, target: SortTarget) {
    if order == SortOrder::None && target == SortTarget::Key {
        return;
    }
    kvs.sort_by(|a, b| match target {
        SortTarget::Key => a.key.cmp(&b.key),
        SortTarget::Version => a.version.cmp(&b.version),
        SortTarget::Create => a.create_revision.cmp(&b.create_revision),
        SortTarget::Mod => a.mod_revision.cmp(&b.mod_revision),
        SortTarget::Value => a.value.cmp(&b.value),
    });
    if order == SortOrder::Descend {
        kvs.reverse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(space: &mut KeySpace, key: &str, value: &str) -> i64 {
        let mut batch = space.begin();
        space.put(&mut batch, key.as_bytes(), value.as_bytes().to_vec(), 0);
        space.finish(batch).unwrap().revision
    }

    fn range(key: &str, end: &[u8]) -> RangeRequest {
        RangeRequest {
            key: key.as_bytes().to_vec(),
            range_end: end.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_range_selection() {
        assert!(in_range(b"a", b"a", b""));
        assert!(!in_range(b"ab", b"a", b""));
        assert!(in_range(b"zzz", b"a", &[0]));
        assert!(in_range(b"ab", b"a", b"b"));
        assert!(!in_range(b"b", b"a", b"b"));
    }

    #[test]
    fn test_tracks_versions_and_revisions() {
        let mut space = KeySpace::new();
        let first = put(&mut space, "foo", "1");
        let second = put(&mut space, "foo", "2");
        assert_eq!(first, 2);

        let kv = space.current(b"foo").unwrap();
        assert_eq!(kv.create_revision, first);
        assert_eq!(kv.mod_revision, second);
        assert_eq!(kv.version, 2);

        let old = space
            .range(&RangeRequest {
                revision: first,
                ..range("foo", b"")
            })
            .unwrap();
        assert_eq!(old.kvs[0].value, b"1".to_vec());
    }

    #[test]
    fn test_empty_batches_keep_the_revision() {
        let mut space = KeySpace::new();
        let mut batch = space.begin();
        assert!(space.delete(&mut batch, b"missing").is_none());
        assert!(space.finish(batch).is_none());
        assert_eq!(space.revision(), 1);
    }

    #[test]
    fn test_range_limits_and_sorts() {
        let mut space = KeySpace::new();
        for key in ["a", "b", "c"] {
            put(&mut space, key, key);
        }
        let response = space
            .range(&RangeRequest {
                limit: 2,
                sort_order: SortOrder::Descend,
                ..range("a", &[0])
            })
            .unwrap();
        assert_eq!(response.count, 3);
        assert!(response.more);
        let keys: Vec<_> = response.kvs.iter().map(|kv| kv.key.clone()).collect();
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_compacted_reads_fail() {
        let mut space = KeySpace::new();
        let first = put(&mut space, "foo", "1");
        let second = put(&mut space, "foo", "2");
        space.compact(second);
        let err = space
            .range(&RangeRequest {
                revision: first,
                ..range("foo", b"")
            })
            .unwrap_err();
        assert_eq!(err, RpcError::Compacted { compact_revision: second });
        assert_eq!(space.history_from(0).count(), 1);
    }

    #[test]
    fn test_compares_missing_keys_as_zero() {
        let space = KeySpace::new();
        assert!(space.compare(&Compare::new("nope", CompareTarget::CreateRevision(0), CompareOp::Equal)));
        assert!(!space.compare(&Compare::new("nope", CompareTarget::Value(Vec::new()), CompareOp::Equal)));
    }

    #[test]
    fn test_range_compares_hold_for_every_key() {
        let mut space = KeySpace::new();
        let first = put(&mut space, "foo1", "a");
        let pinned = Compare::new("foo", CompareTarget::ModRevision(first + 1), CompareOp::Less).with_range_end("fop");
        assert!(space.compare(&pinned));
        put(&mut space, "foo2", "b");
        assert!(!space.compare(&pinned));
        assert!(space.compare(
            &Compare::new("x", CompareTarget::Version(5), CompareOp::Equal).with_range_end("y")
        ));
    }
}
