//! Lease bookkeeping.
//!
//! Deadlines use the tokio clock so paused-time tests can expire leases by
//! advancing time. Expiry is lazy: the store sweeps before serving a call.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;

use cinder_client_api::RpcError;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct LeaseRecord {
    pub granted_ttl: i64,
    pub deadline: Instant,
    pub keys: BTreeSet<Vec<u8>>,
}

impl LeaseRecord {
    /// Whole seconds left before expiry.
    pub fn remaining(&self, now: Instant) -> i64 {
        self.deadline.saturating_duration_since(now).as_secs() as i64
    }
}

#[derive(Debug)]
pub struct LeaseTable {
    leases: BTreeMap<i64, LeaseRecord>,
    next_id: i64,
}

impl Default for LeaseTable {
    fn default() -> Self {
        Self {
            leases: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl LeaseTable {
    /// Grants a lease, choosing an id when `requested_id` is zero.
    pub fn grant(&mut self, requested_id: i64, ttl: i64, now: Instant) -> Result<i64, RpcError> {
        if ttl <= 0 {
            return Err(RpcError::InvalidArgument(format!("lease TTL must be positive, got {ttl}")));
        }
        let id = match requested_id {
            0 => {
                while self.leases.contains_key(&self.next_id) {
                    self.next_id += 1;
                }
                self.next_id
            }
            id if self.leases.contains_key(&id) => {
                return Err(RpcError::InvalidArgument(format!("lease {id} already exists")));
            }
            id => id,
        };
        self.leases.insert(id, LeaseRecord {
            granted_ttl: ttl,
            deadline: now + Duration::from_secs(ttl as u64),
            keys: BTreeSet::new(),
        });
        Ok(id)
    }

    pub fn get(&self, id: i64) -> Option<&LeaseRecord> {
        self.leases.get(&id)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.leases.contains_key(&id)
    }

    /// Pushes the deadline out by the granted TTL. Returns that TTL.
    pub fn renew(&mut self, id: i64, now: Instant) -> Option<i64> {
        let lease = self.leases.get_mut(&id)?;
        lease.deadline = now + Duration::from_secs(lease.granted_ttl as u64);
        Some(lease.granted_ttl)
    }

    pub fn remove(&mut self, id: i64) -> Option<LeaseRecord> {
        self.leases.remove(&id)
    }

    pub fn attach(&mut self, id: i64, key: &[u8]) {
        if let Some(lease) = self.leases.get_mut(&id) {
            lease.keys.insert(key.to_vec());
        }
    }

    pub fn detach(&mut self, id: i64, key: &[u8]) {
        if let Some(lease) = self.leases.get_mut(&id) {
            lease.keys.remove(key);
        }
    }

    /// Ids of leases past their deadline.
    pub fn expired(&self, now: Instant) -> Vec<i64> {
        self.leases.iter().filter(|(_, lease)| lease.deadline <= now).map(|(id, _)| *id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grants_unique_ids() {
        let mut table = LeaseTable::default();
        let now = Instant::now();
        let a = table.grant(0, 10, now).unwrap();
        let b = table.grant(0, 10, now).unwrap();
        assert_ne!(a, b);
        assert!(table.grant(a, 10, now).is_err());
        assert_eq!(table.grant(42, 10, now).unwrap(), 42);
        assert!(table.grant(0, 0, now).is_err());
    }

    #[test]
    fn test_expiry_and_renewal() {
        let mut table = LeaseTable::default();
        let start = Instant::now();
        let id = table.grant(0, 5, start).unwrap();
        assert!(table.expired(start + Duration::from_secs(4)).is_empty());
        assert_eq!(table.expired(start + Duration::from_secs(5)), vec![id]);

        assert_eq!(table.renew(id, start + Duration::from_secs(4)), Some(5));
        assert!(table.expired(start + Duration::from_secs(5)).is_empty());
        assert_eq!(table.get(id).unwrap().remaining(start + Duration::from_secs(5)), 4);
    }
}
