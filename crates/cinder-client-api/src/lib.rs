//! Wire contract for the cinder client runtime.
//!
//! This crate defines the typed requests, responses and errors exchanged
//! with a consensus-backed key-value store, plus the [`Transport`] seam the
//! runtime uses to reach it. Nothing here performs I/O on its own; concrete
//! transports (a gRPC channel, or the deterministic in-memory store used by
//! tests) implement [`Transport`] and [`ServiceChannel`].
//!
//! # Key Components
//!
//! - [`RpcRequest`] / [`RpcResponse`]: every unary call the client issues
//! - [`WatchRequest`] / [`WatchResponse`]: messages on a watch stream
//! - [`RpcError`]: typed errors delivered by transports
//! - [`Transport`] / [`ServiceChannel`]: the transport seam

pub mod auth;
pub mod error;
pub mod kv;
pub mod lease;
pub mod rpc;
pub mod transport;
pub mod watch;

pub use auth::AuthenticateRequest;
pub use auth::AuthenticateResponse;
pub use error::RpcError;
pub use kv::Compare;
pub use kv::CompareOp;
pub use kv::CompareTarget;
pub use kv::DeleteRangeRequest;
pub use kv::DeleteRangeResponse;
pub use kv::KeyValue;
pub use kv::PutRequest;
pub use kv::PutResponse;
pub use kv::RangeRequest;
pub use kv::RangeResponse;
pub use kv::RequestOp;
pub use kv::ResponseHeader;
pub use kv::ResponseOp;
pub use kv::SortOrder;
pub use kv::SortTarget;
pub use kv::TxnRequest;
pub use kv::TxnResponse;
pub use lease::LeaseGrantRequest;
pub use lease::LeaseGrantResponse;
pub use lease::LeaseKeepAliveRequest;
pub use lease::LeaseKeepAliveResponse;
pub use lease::LeaseRevokeRequest;
pub use lease::LeaseRevokeResponse;
pub use lease::LeaseTimeToLiveRequest;
pub use lease::LeaseTimeToLiveResponse;
pub use rpc::RpcRequest;
pub use rpc::RpcResponse;
pub use rpc::Service;
pub use transport::ChannelCredentials;
pub use transport::Metadata;
pub use transport::ServiceChannel;
pub use transport::TOKEN_METADATA_KEY;
pub use transport::TlsMaterial;
pub use transport::Transport;
pub use transport::WatchStream;
pub use watch::Event;
pub use watch::EventType;
pub use watch::WatchCancelRequest;
pub use watch::WatchCreateRequest;
pub use watch::WatchFilter;
pub use watch::WatchRequest;
pub use watch::WatchResponse;
