//! Cinder: a resilient client runtime for consensus-backed key-value stores.
//!
//! This crate re-exports the public surface of the workspace so
//! applications depend on a single crate:
//!
//! - [`client`]: the runtime (connection pool, leases, watches, STM, locks)
//! - [`api`]: typed requests, responses and the transport seam

pub use cinder_client as client;
pub use cinder_client::Client;
pub use cinder_client::ClientError;
pub use cinder_client::ClientOptions;
pub use cinder_client::Isolation;
pub use cinder_client::Lease;
pub use cinder_client::Lock;
pub use cinder_client::Namespace;
pub use cinder_client::Range;
pub use cinder_client::Result;
pub use cinder_client::SoftwareTransaction;
pub use cinder_client::StmOptions;
pub use cinder_client::WatchEvent;
pub use cinder_client::Watcher;
pub use cinder_client_api as api;
