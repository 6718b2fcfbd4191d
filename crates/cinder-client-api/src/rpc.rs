//! Unary request and response envelopes.

use serde::Deserialize;
use serde::Serialize;

use crate::auth::AuthenticateRequest;
use crate::auth::AuthenticateResponse;
use crate::error::RpcError;
use crate::kv::DeleteRangeRequest;
use crate::kv::DeleteRangeResponse;
use crate::kv::PutRequest;
use crate::kv::PutResponse;
use crate::kv::RangeRequest;
use crate::kv::RangeResponse;
use crate::kv::TxnRequest;
use crate::kv::TxnResponse;
use crate::lease::LeaseGrantRequest;
use crate::lease::LeaseGrantResponse;
use crate::lease::LeaseKeepAliveRequest;
use crate::lease::LeaseKeepAliveResponse;
use crate::lease::LeaseRevokeRequest;
use crate::lease::LeaseRevokeResponse;
use crate::lease::LeaseTimeToLiveRequest;
use crate::lease::LeaseTimeToLiveResponse;

/// Store service a call belongs to. Hosts open one channel per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Service {
    Kv,
    Lease,
    Watch,
    Auth,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Kv => "KV",
            Service::Lease => "Lease",
            Service::Watch => "Watch",
            Service::Auth => "Auth",
        }
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every unary call the client can issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    Range(RangeRequest),
    Put(PutRequest),
    DeleteRange(DeleteRangeRequest),
    Txn(TxnRequest),
    LeaseGrant(LeaseGrantRequest),
    LeaseRevoke(LeaseRevokeRequest),
    LeaseKeepAlive(LeaseKeepAliveRequest),
    LeaseTimeToLive(LeaseTimeToLiveRequest),
    Authenticate(AuthenticateRequest),
}

impl RpcRequest {
    pub fn service(&self) -> Service {
        match self {
            RpcRequest::Range(_) | RpcRequest::Put(_) | RpcRequest::DeleteRange(_) | RpcRequest::Txn(_) => Service::Kv,
            RpcRequest::LeaseGrant(_)
            | RpcRequest::LeaseRevoke(_)
            | RpcRequest::LeaseKeepAlive(_)
            | RpcRequest::LeaseTimeToLive(_) => Service::Lease,
            RpcRequest::Authenticate(_) => Service::Auth,
        }
    }

    /// Method name, used for logging and for fault injection in tests.
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::Range(_) => "range",
            RpcRequest::Put(_) => "put",
            RpcRequest::DeleteRange(_) => "delete_range",
            RpcRequest::Txn(_) => "txn",
            RpcRequest::LeaseGrant(_) => "lease_grant",
            RpcRequest::LeaseRevoke(_) => "lease_revoke",
            RpcRequest::LeaseKeepAlive(_) => "lease_keep_alive",
            RpcRequest::LeaseTimeToLive(_) => "lease_time_to_live",
            RpcRequest::Authenticate(_) => "authenticate",
        }
    }
}

/// Responses paired with [`RpcRequest`] variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    Range(RangeResponse),
    Put(PutResponse),
    DeleteRange(DeleteRangeResponse),
    Txn(TxnResponse),
    LeaseGrant(LeaseGrantResponse),
    LeaseRevoke(LeaseRevokeResponse),
    LeaseKeepAlive(LeaseKeepAliveResponse),
    LeaseTimeToLive(LeaseTimeToLiveResponse),
    Authenticate(AuthenticateResponse),
}

impl RpcResponse {
    pub fn method(&self) -> &'static str {
        match self {
            RpcResponse::Range(_) => "range",
            RpcResponse::Put(_) => "put",
            RpcResponse::DeleteRange(_) => "delete_range",
            RpcResponse::Txn(_) => "txn",
            RpcResponse::LeaseGrant(_) => "lease_grant",
            RpcResponse::LeaseRevoke(_) => "lease_revoke",
            RpcResponse::LeaseKeepAlive(_) => "lease_keep_alive",
            RpcResponse::LeaseTimeToLive(_) => "lease_time_to_live",
            RpcResponse::Authenticate(_) => "authenticate",
        }
    }
}

macro_rules! response_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        impl RpcResponse {
            #[doc = concat!("Unwraps a `", stringify!($variant), "` response, failing on any other variant.")]
            pub fn $name(self) -> Result<$ty, RpcError> {
                match self {
                    RpcResponse::$variant(inner) => Ok(inner),
                    other => Err(RpcError::Internal(format!(
                        "expected {} response, got {}",
                        stringify!($variant),
                        other.method()
                    ))),
                }
            }
        }
    };
}

response_accessor!(into_range, Range, RangeResponse);
response_accessor!(into_put, Put, PutResponse);
response_accessor!(into_delete_range, DeleteRange, DeleteRangeResponse);
response_accessor!(into_txn, Txn, TxnResponse);
response_accessor!(into_lease_grant, LeaseGrant, LeaseGrantResponse);
response_accessor!(into_lease_revoke, LeaseRevoke, LeaseRevokeResponse);
response_accessor!(into_lease_keep_alive, LeaseKeepAlive, LeaseKeepAliveResponse);
response_accessor!(into_lease_time_to_live, LeaseTimeToLive, LeaseTimeToLiveResponse);
response_accessor!(into_authenticate, Authenticate, AuthenticateResponse);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_route_to_their_service() {
        assert_eq!(RpcRequest::Range(RangeRequest::default()).service(), Service::Kv);
        assert_eq!(RpcRequest::Txn(TxnRequest::default()).service(), Service::Kv);
        assert_eq!(RpcRequest::LeaseKeepAlive(LeaseKeepAliveRequest { id: 1 }).service(), Service::Lease);
        assert_eq!(RpcRequest::Authenticate(AuthenticateRequest::default()).service(), Service::Auth);
    }

    #[test]
    fn test_accessor_rejects_mismatched_variant() {
        let response = RpcResponse::Put(PutResponse::default());
        let err = response.into_range().unwrap_err();
        assert!(matches!(err, RpcError::Internal(ref msg) if msg.contains("put")));
    }
}
