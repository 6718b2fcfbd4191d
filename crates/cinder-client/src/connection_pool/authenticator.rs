//! Auth token acquisition and caching.

use std::sync::Arc;

use cinder_client_api::AuthenticateRequest;
use cinder_client_api::ChannelCredentials;
use cinder_client_api::Metadata;
use cinder_client_api::RpcRequest;
use cinder_client_api::Service;
use cinder_client_api::TOKEN_METADATA_KEY;
use cinder_client_api::Transport;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Shared;
use parking_lot::Mutex;
use tracing::debug;
use tracing::warn;

use super::host::strip_scheme;
use crate::config::AuthOptions;
use crate::error::ClientError;
use crate::error::Result;

type MetadataFuture = Shared<BoxFuture<'static, Result<Metadata>>>;

/// Fetches and caches the metadata sent with every call.
///
/// Without credentials the metadata is empty and no request is made. With
/// credentials, the first caller starts a token fetch that tries each host
/// in turn; concurrent callers await that same fetch. A fetch that fails on
/// every host is dropped from the cache so the next caller starts over.
pub struct Authenticator {
    hosts: Vec<String>,
    auth: Option<AuthOptions>,
    credentials: ChannelCredentials,
    transport: Arc<dyn Transport>,
    pending: Mutex<Option<MetadataFuture>>,
}

impl Authenticator {
    pub fn new(
        hosts: &[String],
        auth: Option<AuthOptions>,
        credentials: ChannelCredentials,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            hosts: hosts.iter().map(|h| strip_scheme(h).to_string()).collect(),
            auth,
            credentials,
            transport,
            pending: Mutex::new(None),
        }
    }

    /// Drops the cached token. The next call to [`Authenticator::metadata`]
    /// fetches a new one.
    pub fn invalidate(&self) {
        debug!("invalidating cached auth metadata");
        *self.pending.lock() = None;
    }

    /// Returns metadata for the next call.
    pub async fn metadata(&self) -> Result<Metadata> {
        let Some(auth) = self.auth.clone() else {
            return Ok(Metadata::new());
        };

        let fetch = {
            let mut pending = self.pending.lock();
            match pending.as_ref() {
                Some(fetch) => fetch.clone(),
                None => {
                    let fetch = fetch_token(self.hosts.clone(), auth, self.credentials.clone(), self.transport.clone())
                        .boxed()
                        .shared();
                    *pending = Some(fetch.clone());
                    fetch
                }
            }
        };

        let result = fetch.clone().await;
        if result.is_err() {
            let mut pending = self.pending.lock();
            if pending.as_ref().is_some_and(|current| current.ptr_eq(&fetch)) {
                *pending = None;
            }
        }
        result
    }
}

async fn fetch_token(
    hosts: Vec<String>,
    auth: AuthOptions,
    credentials: ChannelCredentials,
    transport: Arc<dyn Transport>,
) -> Result<Metadata> {
    let mut last_error = ClientError::AuthFailed("no hosts to authenticate against".to_string());
    for address in &hosts {
        let channel = transport.channel(address, Service::Auth, &credentials);
        let request = RpcRequest::Authenticate(AuthenticateRequest {
            name: auth.username.clone(),
            password: auth.password.clone(),
        });
        let response = channel.unary(request, &Metadata::new()).await;
        channel.close();

        match response.and_then(|r| r.into_authenticate()) {
            Ok(response) => {
                debug!(address = %address, "obtained auth token");
                let mut metadata = Metadata::new();
                metadata.insert(TOKEN_METADATA_KEY.to_string(), response.token);
                return Ok(metadata);
            }
            Err(e) => {
                warn!(address = %address, error = %e, "authentication attempt failed");
                last_error = e.into();
            }
        }
    }
    Err(last_error)
}
