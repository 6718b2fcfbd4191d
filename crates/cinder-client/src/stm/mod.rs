//! Software transactional memory.
//!
//! [`SoftwareTransaction::transact`] runs a closure against a [`Txn`] that
//! buffers writes locally and records what it read. The attempt commits as
//! a single compare-and-swap; if another writer got in first the closure is
//! run again on fresh state, up to the configured number of retries.
//!
//! How strict the commit checks are depends on the [`Isolation`] level,
//! described by [`IsolationFlags`]:
//!
//! | level                  | caches_reads | pins_snapshot | checks_ranges |
//! |------------------------|--------------|---------------|---------------|
//! | `ReadCommitted`        |              |               |               |
//! | `RepeatableReads`      | yes          |               |               |
//! | `Serializable`         | yes          | yes           |               |
//! | `SerializableSnapshot` | yes          | yes           | yes           |
//!
//! ## Usage
//!
//! ```ignore
//! let total = client
//!     .stm(StmOptions::default())
//!     .transact(|tx| {
//!         Box::pin(async move {
//!             let balance: i64 = tx.get_string("balance").await?.unwrap_or_default().parse().unwrap_or(0);
//!             tx.put("balance", (balance + 10).to_string());
//!             Ok(balance + 10)
//!         })
//!     })
//!     .await?;
//! ```

mod txn;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

pub use self::txn::Txn;
use crate::constants::DEFAULT_STM_RETRIES;
use crate::error::ClientError;
use crate::error::Result;
use crate::namespace::Namespace;

/// Isolation level of a software transaction, strongest first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Isolation {
    /// Serializable, and also fails if any range read or written by the
    /// transaction changed since its snapshot.
    #[default]
    SerializableSnapshot = 0,
    /// Every read sees the revision pinned by the first read.
    Serializable = 1,
    /// Repeated reads of a key return the same value, and the commit fails
    /// if a read key changed.
    RepeatableReads = 2,
    /// Reads see the latest committed value; commits are unconditional.
    ReadCommitted = 3,
}

/// What an isolation level asks of the transaction engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsolationFlags {
    /// Serve repeated reads from the read set and check it at commit.
    pub caches_reads: bool,
    /// Read every key at the revision of the first read.
    pub pins_snapshot: bool,
    /// Check read and deleted ranges at commit, and refuse range deletes
    /// over keys already read.
    pub checks_ranges: bool,
}

impl Isolation {
    pub const fn flags(self) -> IsolationFlags {
        match self {
            Isolation::ReadCommitted => IsolationFlags {
                caches_reads: false,
                pins_snapshot: false,
                checks_ranges: false,
            },
            Isolation::RepeatableReads => IsolationFlags {
                caches_reads: true,
                pins_snapshot: false,
                checks_ranges: false,
            },
            Isolation::Serializable => IsolationFlags {
                caches_reads: true,
                pins_snapshot: true,
                checks_ranges: false,
            },
            Isolation::SerializableSnapshot => IsolationFlags {
                caches_reads: true,
                pins_snapshot: true,
                checks_ranges: true,
            },
        }
    }
}

/// Options for [`SoftwareTransaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StmOptions {
    pub isolation: Isolation,
    /// Re-runs allowed after a conflicting commit.
    pub retries: u32,
    /// Keys read in one round trip at the start of every attempt. Ignored by
    /// levels that do not cache reads.
    pub prefetch: Vec<Vec<u8>>,
}

impl Default for StmOptions {
    fn default() -> Self {
        Self {
            isolation: Isolation::default(),
            retries: DEFAULT_STM_RETRIES,
            prefetch: Vec::new(),
        }
    }
}

impl StmOptions {
    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_prefetch<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        self.prefetch = keys.into_iter().map(|k| k.as_ref().to_vec()).collect();
        self
    }
}

/// Optimistic transaction runner bound to a namespace.
#[derive(Debug, Clone)]
pub struct SoftwareTransaction {
    namespace: Namespace,
    options: StmOptions,
}

impl SoftwareTransaction {
    pub fn new(namespace: Namespace, options: StmOptions) -> Self {
        Self { namespace, options }
    }

    pub fn options(&self) -> &StmOptions {
        &self.options
    }

    /// Runs `body` until its attempt commits.
    ///
    /// Each attempt gets a fresh [`Txn`]. An attempt that neither read with
    /// a caching level nor wrote anything returns without contacting the
    /// store. Errors from `body` abort the transaction immediately.
    pub async fn transact<T, F>(&self, mut body: F) -> Result<T>
    where F: for<'t> FnMut(&'t mut Txn) -> BoxFuture<'t, Result<T>> {
        let flags = self.options.isolation.flags();
        let attempts = self.options.retries.saturating_add(1);

        for attempt in 1..=attempts {
            let mut txn = Txn::new(self.namespace.pool().clone(), self.namespace.applicator().clone(), flags);
            txn.prefetch(&self.options.prefetch).await?;

            let value = body(&mut txn).await?;
            if txn.is_empty() {
                return Ok(value);
            }

            let response = self.namespace.pool().txn(txn.commit_request()).await?;
            if response.succeeded {
                debug!(attempt, isolation = ?self.options.isolation, "software transaction committed");
                return Ok(value);
            }
            debug!(attempt, attempts, "software transaction conflicted");
        }

        Err(ClientError::Conflict { attempts })
    }
}
