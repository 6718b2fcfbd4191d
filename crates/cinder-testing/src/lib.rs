//! Testing infrastructure for the cinder client.
//!
//! [`DeterministicStore`] is an in-memory key-value store with etcd3
//! semantics (MVCC revisions, transactions, leases and watch streams) that
//! plugs into the client through its [`cinder_client_api::Transport`] seam.
//! Tests drive the client against it and use its control surface to take
//! hosts down, inject failures, expire tokens and break watch streams.
//!
//! # Usage
//!
//! ```ignore
//! let store = DeterministicStore::new();
//! let client = Client::new(ClientOptions::new(["store:1"]), store.transport())?;
//!
//! store.set_host_down("store:1", true);
//! assert!(client.get("foo").string().await.unwrap_err().is_transport());
//! ```

mod lease;
mod mvcc;
mod store;
mod watch;

pub use store::DeterministicStore;

/// Installs a test subscriber honouring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,cinder_client=debug"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}
