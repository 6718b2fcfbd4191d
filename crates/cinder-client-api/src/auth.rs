//! Authentication service messages.

use serde::Deserialize;
use serde::Serialize;

use crate::kv::ResponseHeader;

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticateRequest {
    pub name: String,
    pub password: String,
}

impl std::fmt::Debug for AuthenticateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticateRequest")
            .field("name", &self.name)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticateResponse {
    pub header: ResponseHeader,
    /// Token to send as `token` metadata on subsequent calls.
    pub token: String,
}
