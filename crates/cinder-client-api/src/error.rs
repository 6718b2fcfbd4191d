//! Typed errors delivered by transports.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Error returned by a [`crate::ServiceChannel`].
///
/// Transports classify failures into these variants so that the runtime
/// can decide between failover, re-authentication and surfacing the error.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RpcError {
    /// The host could not be reached or the connection broke.
    #[error("host unavailable: {0}")]
    Unavailable(String),

    /// The auth token is missing, stale or was revoked.
    #[error("invalid auth token")]
    InvalidAuthToken,

    /// The supplied credentials were rejected.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("requested lease not found")]
    LeaseNotFound,

    #[error("required revision has been compacted (compact revision {compact_revision})")]
    Compacted { compact_revision: i64 },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcError {
    /// Whether the error means the host itself failed, as opposed to the
    /// request being rejected.
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Unavailable(_))
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        RpcError::Unavailable(reason.into())
    }
}
