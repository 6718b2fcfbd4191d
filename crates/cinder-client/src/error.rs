//! Client error types.

use cinder_client_api::RpcError;
use thiserror::Error;

/// Result alias used throughout the client.
pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Errors surfaced by the client runtime.
///
/// The type is `Clone` so one terminal error (a lost lease, a failed
/// token fetch) can be handed to every waiter that observes it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Invalid construction parameters. Never retried.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A host could not be reached.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The store rejected the auth token.
    #[error("auth token is invalid or expired")]
    AuthInvalid,

    /// The credentials were rejected by every host.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The lease expired or was revoked on the server.
    #[error("lease {lease_id} is no longer valid: {reason}")]
    LeaseInvalid { lease_id: i64, reason: String },

    /// A software transaction kept conflicting until its retries ran out.
    #[error("software transaction conflicted on every one of {attempts} attempts")]
    Conflict { attempts: u32 },

    /// Snapshot-isolated transactions cannot delete a range containing a
    /// key they already read.
    #[error("You cannot delete ranges that were read in this transaction (key {key:?})")]
    RangeDeleteAfterRead { key: Vec<u8> },

    /// The server ended a watch the client did not cancel.
    #[error("watch {watch_id} was cancelled by the server: {reason}")]
    WatchCancelled { watch_id: i64, reason: String },

    /// Any other error reported by the store.
    #[error("store error: {0}")]
    Server(RpcError),

    /// A key returned by the store lies outside the namespace prefix.
    #[error("key {key:?} does not carry namespace prefix {prefix:?}")]
    NamespaceMismatch { key: Vec<u8>, prefix: Vec<u8> },

    #[error("failed to acquire lock on {key:?}: it is already held")]
    LockFailed { key: Vec<u8> },

    #[error("cannot set a lock TTL after acquiring the lock")]
    LockTtlAfterAcquire,

    /// A value could not be decoded into the requested type.
    #[error("failed to decode value: {0}")]
    Decode(String),

    /// The component was shut down.
    #[error("client is closed")]
    Closed,
}

impl ClientError {
    /// Whether the store reported that the lease does not exist.
    pub fn is_lease_not_found(&self) -> bool {
        matches!(self, ClientError::Server(RpcError::LeaseNotFound))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}

impl From<RpcError> for ClientError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Unavailable(reason) => ClientError::Transport(reason),
            RpcError::InvalidAuthToken => ClientError::AuthInvalid,
            RpcError::AuthFailed(reason) => ClientError::AuthFailed(reason),
            other => ClientError::Server(other),
        }
    }
}
