//! Resilient watches.
//!
//! A [`WatchManager`] multiplexes any number of [`Watcher`]s over a single
//! watch stream. When the stream breaks, every watcher is told it was
//! disconnected and, once a new stream is up, re-subscribed from the
//! revision after the last update it saw, so no change is lost across
//! reconnections.
//!
//! ## Usage
//!
//! ```ignore
//! let watcher = client.watch().prefix("jobs/").with_previous_kv().create().await?;
//! let mut events = watcher.subscribe();
//! while let Some(event) = events.recv().await {
//!     match event {
//!         WatchEvent::Put { kv, .. } => println!("{:?} updated", kv.key),
//!         WatchEvent::Delete { kv, .. } => println!("{:?} removed", kv.key),
//!         _ => {}
//!     }
//! }
//! ```

mod builder;
mod manager;
mod watcher;

use cinder_client_api::KeyValue;
use cinder_client_api::WatchCreateRequest;
use cinder_client_api::WatchResponse;

pub use self::builder::Ignore;
pub use self::builder::WatchBuilder;
pub use self::manager::StreamState;
pub use self::manager::WatchManager;
pub use self::watcher::Watcher;
use crate::error::ClientError;

/// Notifications published by a [`Watcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The create request was sent.
    Connecting(WatchCreateRequest),
    /// The store confirmed the subscription; the watcher's id is set.
    Connected(WatchResponse),
    /// Any update, with keys relative to the watcher's namespace.
    Data(WatchResponse),
    Put {
        kv: KeyValue,
        prev_kv: Option<KeyValue>,
    },
    Delete {
        kv: KeyValue,
        prev_kv: Option<KeyValue>,
    },
    /// The stream broke. The watcher reconnects on its own.
    Disconnected(ClientError),
    /// The watcher stopped for good. Not followed by [`WatchEvent::End`].
    Error(ClientError),
    /// The watcher was cancelled cleanly.
    End,
}
