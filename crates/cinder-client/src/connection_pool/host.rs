//! A single store host and its per-service channels.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use cinder_client_api::ChannelCredentials;
use cinder_client_api::Service;
use cinder_client_api::ServiceChannel;
use cinder_client_api::Transport;
use parking_lot::Mutex;
use tracing::debug;

/// Strips a leading `http://` or `https://` from a host address.
pub fn strip_scheme(address: &str) -> &str {
    address
        .strip_prefix("https://")
        .or_else(|| address.strip_prefix("http://"))
        .unwrap_or(address)
}

/// One store host. Channels are opened lazily per service and cached
/// until [`Host::close`].
pub struct Host {
    address: String,
    credentials: ChannelCredentials,
    transport: Arc<dyn Transport>,
    channels: Mutex<HashMap<Service, Arc<dyn ServiceChannel>>>,
}

impl Host {
    pub fn new(address: &str, credentials: ChannelCredentials, transport: Arc<dyn Transport>) -> Self {
        Self {
            address: strip_scheme(address).to_string(),
            credentials,
            transport,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Address without scheme.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns the cached channel for `service`, opening one if needed.
    pub fn channel(&self, service: Service) -> Arc<dyn ServiceChannel> {
        self.channels
            .lock()
            .entry(service)
            .or_insert_with(|| self.transport.channel(&self.address, service, &self.credentials))
            .clone()
    }

    /// Closes and forgets every open channel.
    pub fn close(&self) {
        let channels: Vec<_> = self.channels.lock().drain().map(|(_, channel)| channel).collect();
        if !channels.is_empty() {
            debug!(address = %self.address, count = channels.len(), "closing host channels");
        }
        for channel in channels {
            channel.close();
        }
    }

    pub fn open_channels(&self) -> usize {
        self.channels.lock().len()
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.address)
            .field("secure", &self.credentials.is_secure())
            .field("open_channels", &self.open_channels())
            .finish()
    }
}
