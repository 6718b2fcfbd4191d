//! Server side of watch streams.

use std::collections::BTreeMap;

use cinder_client_api::Event;
use cinder_client_api::EventType;
use cinder_client_api::ResponseHeader;
use cinder_client_api::RpcError;
use cinder_client_api::WatchCreateRequest;
use cinder_client_api::WatchFilter;
use cinder_client_api::WatchResponse;
use tokio::sync::mpsc;
use tracing::debug;

use crate::mvcc::Committed;
use crate::mvcc::KeySpace;
use crate::mvcc::in_range;

type ResponseSender = mpsc::UnboundedSender<Result<WatchResponse, RpcError>>;

#[derive(Debug)]
struct StreamEntry {
    responses: ResponseSender,
    watches: BTreeMap<i64, WatchCreateRequest>,
}

impl StreamEntry {
    fn send(&self, response: WatchResponse) {
        // The client may already have hung up.
        let _ = self.responses.send(Ok(response));
    }
}

/// Open streams and the watches registered on them.
#[derive(Debug, Default)]
pub struct WatchHub {
    streams: BTreeMap<u64, StreamEntry>,
    next_stream_id: u64,
    next_watch_id: i64,
    create_log: Vec<WatchCreateRequest>,
}

impl WatchHub {
    pub fn open(&mut self, responses: ResponseSender) -> u64 {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        self.streams.insert(id, StreamEntry {
            responses,
            watches: BTreeMap::new(),
        });
        id
    }

    pub fn close(&mut self, stream_id: u64) {
        self.streams.remove(&stream_id);
    }

    /// Drops every stream from the server side.
    pub fn disconnect_all(&mut self) {
        debug!(streams = self.streams.len(), "disconnecting watch streams");
        self.streams.clear();
    }

    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn create_log(&self) -> &[WatchCreateRequest] {
        &self.create_log
    }

    /// Registers a watch, confirming it and replaying history when the
    /// request starts in the past.
    pub fn create(&mut self, stream_id: u64, request: WatchCreateRequest, kv: &KeySpace) {
        self.create_log.push(request.clone());
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        let watch_id = self.next_watch_id;
        self.next_watch_id += 1;
        let header = header(kv.revision());

        if request.start_revision > 0 && request.start_revision < kv.compact_revision() {
            stream.send(WatchResponse {
                header,
                watch_id,
                created: true,
                canceled: true,
                compact_revision: kv.compact_revision(),
                cancel_reason: "required revision has been compacted".to_string(),
                events: Vec::new(),
            });
            return;
        }

        stream.send(WatchResponse {
            header,
            watch_id,
            created: true,
            ..Default::default()
        });
        if request.start_revision > 0 {
            for committed in kv.history_from(request.start_revision) {
                if let Some(response) = matching(watch_id, &request, committed) {
                    stream.send(response);
                }
            }
        }
        stream.watches.insert(watch_id, request);
    }

    pub fn cancel(&mut self, stream_id: u64, watch_id: i64, revision: i64) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.watches.remove(&watch_id);
            stream.send(WatchResponse {
                header: header(revision),
                watch_id,
                canceled: true,
                ..Default::default()
            });
        }
    }

    /// Cancels every registered watch with `reason`.
    pub fn cancel_all(&mut self, reason: &str, revision: i64) {
        for stream in self.streams.values_mut() {
            for watch_id in std::mem::take(&mut stream.watches).into_keys() {
                stream.send(WatchResponse {
                    header: header(revision),
                    watch_id,
                    canceled: true,
                    cancel_reason: reason.to_string(),
                    ..Default::default()
                });
            }
        }
    }

    /// Delivers a committed revision to every matching watch.
    pub fn publish(&self, committed: &Committed) {
        for stream in self.streams.values() {
            for (watch_id, request) in &stream.watches {
                if let Some(response) = matching(*watch_id, request, committed) {
                    stream.send(response);
                }
            }
        }
    }
}

fn header(revision: i64) -> ResponseHeader {
    ResponseHeader {
        revision,
        ..Default::default()
    }
}

/// The response `request` should see for `committed`, if any.
fn matching(watch_id: i64, request: &WatchCreateRequest, committed: &Committed) -> Option<WatchResponse> {
    let events: Vec<Event> = committed
        .events
        .iter()
        .filter(|event| in_range(&event.kv.key, &request.key, &request.range_end))
        .filter(|event| match event.kind {
            EventType::Put => !request.filters.contains(&WatchFilter::NoPut),
            EventType::Delete => !request.filters.contains(&WatchFilter::NoDelete),
        })
        .map(|event| Event {
            prev_kv: if request.prev_kv { event.prev_kv.clone() } else { None },
            ..event.clone()
        })
        .collect();
    if events.is_empty() {
        return None;
    }
    Some(WatchResponse {
        header: header(committed.revision),
        watch_id,
        events,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space_with(writes: &[(&str, &str)]) -> KeySpace {
        let mut space = KeySpace::new();
        for (key, value) in writes {
            let mut batch = space.begin();
            space.put(&mut batch, key.as_bytes(), value.as_bytes().to_vec(), 0);
            space.finish(batch);
        }
        space
    }

    fn watch(key: &str) -> WatchCreateRequest {
        WatchCreateRequest {
            key: key.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_replays_matching_history() {
        let space = space_with(&[("foo", "1"), ("bar", "x"), ("foo", "2")]);
        let mut hub = WatchHub::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream = hub.open(tx);

        hub.create(stream, WatchCreateRequest {
            start_revision: 1,
            ..watch("foo")
        }, &space);

        let created = rx.try_recv().unwrap().unwrap();
        assert!(created.created);
        assert_eq!(created.header.revision, space.revision());
        let values: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|r| r.unwrap().events[0].kv.value.clone())
            .collect();
        assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec()]);
    }

    #[test]
    fn test_filters_and_strips_previous_values() {
        let mut space = space_with(&[("foo", "1")]);
        let mut hub = WatchHub::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stream = hub.open(tx);
        hub.create(stream, WatchCreateRequest {
            filters: vec![WatchFilter::NoDelete],
            ..watch("foo")
        }, &space);
        rx.try_recv().unwrap().unwrap();

        let mut batch = space.begin();
        space.put(&mut batch, b"foo", b"2".to_vec(), 0);
        hub.publish(&space.finish(batch).unwrap());
        let update = rx.try_recv().unwrap().unwrap();
        assert_eq!(update.events[0].prev_kv, None);

        let mut batch = space.begin();
        space.delete(&mut batch, b"foo");
        hub.publish(&space.finish(batch).unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disconnect_closes_response_channels() {
        let mut hub = WatchHub::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.open(tx);
        hub.disconnect_all();
        assert_eq!(hub.open_streams(), 0);
        assert!(matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Disconnected)));
    }
}
