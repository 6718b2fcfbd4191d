//! Lease-backed distributed lock.
//!
//! Acquiring grants a lease and then creates the lock key attached to it,
//! but only if the key does not exist yet. Releasing revokes the lease,
//! which deletes the key. A holder that dies simply stops renewing its
//! lease and the lock frees itself after the TTL.
//!
//! ## Usage
//!
//! ```ignore
//! let result = client
//!     .lock("jobs/rebuild-index")
//!     .run(|| async { rebuild_index().await })
//!     .await?;
//! ```

use std::future::Future;

use cinder_client_api::CompareOp;
use cinder_client_api::CompareTarget;
use tracing::debug;

use crate::constants::DEFAULT_LOCK_TTL_SECS;
use crate::error::ClientError;
use crate::error::Result;
use crate::lease::Lease;
use crate::namespace::Namespace;

/// A named lock in a namespace.
#[derive(Debug)]
pub struct Lock {
    namespace: Namespace,
    key: Vec<u8>,
    ttl_secs: i64,
    lease: Option<Lease>,
}

impl Lock {
    pub fn new(namespace: Namespace, key: impl AsRef<[u8]>) -> Self {
        Self {
            namespace,
            key: key.as_ref().to_vec(),
            ttl_secs: DEFAULT_LOCK_TTL_SECS,
            lease: None,
        }
    }

    /// Sets the TTL of the backing lease. Must be called before acquiring.
    pub fn ttl(&mut self, ttl_secs: i64) -> Result<&mut Self> {
        if self.lease.is_some() {
            return Err(ClientError::LockTtlAfterAcquire);
        }
        self.ttl_secs = ttl_secs;
        Ok(self)
    }

    /// Id of the backing lease while the lock is held.
    pub fn lease_id(&self) -> Option<i64> {
        self.lease.as_ref().and_then(Lease::id)
    }

    pub fn is_held(&self) -> bool {
        self.lease.is_some()
    }

    /// Takes the lock, failing with [`ClientError::LockFailed`] if someone
    /// else holds it.
    pub async fn acquire(&mut self) -> Result<()> {
        let lease = self.namespace.lease(self.ttl_secs)?;
        let lease_id = lease.grant().await?;

        let outcome = self
            .namespace
            .when(&self.key, CompareTarget::CreateRevision(0), CompareOp::Equal)
            .and_then([self.namespace.put(&self.key).lease(lease_id).into_op()])
            .commit()
            .await;

        match outcome {
            Ok(response) if response.succeeded => {
                debug!(lease_id, "lock acquired");
                self.lease = Some(lease);
                Ok(())
            }
            Ok(_) => {
                lease.revoke().await?;
                Err(ClientError::LockFailed { key: self.key.clone() })
            }
            Err(e) => {
                // The commit error is the one worth reporting.
                let _ = lease.revoke().await;
                Err(e)
            }
        }
    }

    /// Releases the lock. Does nothing if it is not held.
    pub async fn release(&mut self) -> Result<()> {
        match self.lease.take() {
            Some(lease) => lease.revoke().await,
            None => Ok(()),
        }
    }

    /// Runs `f` while holding the lock, releasing it afterwards whether or
    /// not `f` succeeded.
    pub async fn run<F, Fut, T>(mut self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire().await?;
        let result = f().await;
        let released = self.release().await;
        let value = result?;
        released?;
        Ok(value)
    }
}
