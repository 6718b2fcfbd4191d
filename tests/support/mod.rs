//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use cinder::Client;
use cinder::ClientOptions;
use cinder::client::BackoffConfig;
use cinder_testing::DeterministicStore;

/// Backoff that keeps paused-time tests short.
pub fn quick_backoff() -> BackoffConfig {
    BackoffConfig {
        initial_ms: 100,
        max_ms: 1_000,
        random: 0,
    }
}

/// A client on a fresh store, reached through a single host.
pub fn client() -> (Arc<DeterministicStore>, Client) {
    cinder_testing::init_tracing();
    let store = DeterministicStore::new();
    let client = client_for(&store, ClientOptions::new(["store:1"]));
    (store, client)
}

pub fn client_for(store: &Arc<DeterministicStore>, options: ClientOptions) -> Client {
    Client::new(options.with_backoff(quick_backoff()), store.transport()).expect("valid client options")
}
