//! Client runtime for consensus-backed key-value stores.
//!
//! The runtime sits on top of a [`Transport`] and turns the store's raw
//! RPCs into a resilient client:
//!
//! - [`ConnectionPool`]: host selection with backoff, failover and token auth
//! - [`Lease`]: TTL leases kept alive in the background
//! - [`WatchManager`]: one multiplexed watch stream that reconnects and
//!   resumes where it left off
//! - [`SoftwareTransaction`]: optimistic transactions at four isolation levels
//! - [`Namespace`]: every operation scoped to a key prefix
//!
//! # Usage
//!
//! ```ignore
//! use cinder_client::Client;
//! use cinder_client::ClientOptions;
//!
//! let client = Client::new(ClientOptions::new(["127.0.0.1:2379"]), transport)?;
//! client.put("foo").value("bar").exec().await?;
//! assert_eq!(client.get("foo").string().await?.as_deref(), Some("bar"));
//!
//! let jobs = client.namespace("jobs/");
//! let watcher = jobs.watch().prefix("").create().await?;
//! ```

pub mod backoff;
pub mod builder;
pub mod client;
pub mod config;
pub mod connection_pool;
pub mod constants;
pub mod error;
pub mod events;
pub mod lease;
pub mod lock;
pub mod namespace;
pub mod range;
pub mod shared_pool;
pub mod stm;
pub mod watch;

pub use backoff::BackoffStrategy;
pub use backoff::ExponentialBackoff;
pub use builder::DeleteBuilder;
pub use builder::MultiRangeBuilder;
pub use builder::PutBuilder;
pub use builder::SingleRangeBuilder;
pub use builder::TxnBuilder;
pub use cinder_client_api::transport;
pub use cinder_client_api::CompareOp;
pub use cinder_client_api::CompareTarget;
pub use cinder_client_api::KeyValue;
pub use cinder_client_api::RpcError;
pub use cinder_client_api::SortOrder;
pub use cinder_client_api::SortTarget;
pub use cinder_client_api::Transport;
pub use client::Client;
pub use config::AuthOptions;
pub use config::BackoffConfig;
pub use config::ClientOptions;
pub use connection_pool::ConnectionPool;
pub use connection_pool::RpcCallable;
pub use error::ClientError;
pub use error::Result;
pub use lease::Lease;
pub use lease::LeaseEvent;
pub use lease::LeaseState;
pub use lock::Lock;
pub use namespace::KeyApplicator;
pub use namespace::Namespace;
pub use range::Range;
pub use stm::Isolation;
pub use stm::SoftwareTransaction;
pub use stm::StmOptions;
pub use stm::Txn;
pub use watch::Ignore;
pub use watch::WatchBuilder;
pub use watch::WatchEvent;
pub use watch::WatchManager;
pub use watch::Watcher;
