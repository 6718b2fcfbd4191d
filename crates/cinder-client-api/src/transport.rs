//! Transport seam between the runtime and a store host.
//!
//! The runtime never speaks a wire protocol directly. It asks a
//! [`Transport`] for a [`ServiceChannel`] per `(host, service)` pair and
//! drives unary calls and watch streams through it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::RpcError;
use crate::rpc::RpcRequest;
use crate::rpc::RpcResponse;
use crate::rpc::Service;
use crate::watch::WatchRequest;
use crate::watch::WatchResponse;

/// Per-call metadata, e.g. the auth token.
pub type Metadata = BTreeMap<String, String>;

/// Metadata key carrying the auth token.
pub const TOKEN_METADATA_KEY: &str = "token";

/// PEM-encoded TLS material. Absent fields fall back to system defaults.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMaterial {
    pub root_certificate: Option<String>,
    pub private_key: Option<String>,
    pub cert_chain: Option<String>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("root_certificate", &self.root_certificate.is_some())
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("cert_chain", &self.cert_chain.is_some())
            .finish()
    }
}

/// Channel-level credentials, built once per connection pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ChannelCredentials {
    #[default]
    Insecure,
    Tls(TlsMaterial),
}

impl ChannelCredentials {
    pub fn is_secure(&self) -> bool {
        matches!(self, ChannelCredentials::Tls(_))
    }
}

/// An open watch stream.
///
/// Dropping `requests` closes the stream from the client side. The stream
/// has ended from the server side once `responses` yields `None` or an
/// error.
#[derive(Debug)]
pub struct WatchStream {
    pub requests: mpsc::UnboundedSender<WatchRequest>,
    pub responses: mpsc::UnboundedReceiver<Result<WatchResponse, RpcError>>,
}

/// Factory for per-service channels to a host.
pub trait Transport: Send + Sync {
    /// Returns a channel to `service` on `address`.
    ///
    /// Channels connect lazily: this never fails, and connection errors
    /// surface from the first call made on the channel.
    fn channel(&self, address: &str, service: Service, credentials: &ChannelCredentials) -> Arc<dyn ServiceChannel>;
}

/// A channel to one service on one host.
#[async_trait]
pub trait ServiceChannel: Send + Sync {
    async fn unary(&self, request: RpcRequest, metadata: &Metadata) -> Result<RpcResponse, RpcError>;

    async fn watch(&self, metadata: &Metadata) -> Result<WatchStream, RpcError>;

    /// Releases the channel. Later calls fail with [`RpcError::Unavailable`].
    fn close(&self);
}
