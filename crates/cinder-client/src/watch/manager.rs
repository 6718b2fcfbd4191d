//! Multiplexes watchers over one stream.
//!
//! The manager's state lives in a background task started on first use.
//! Handles talk to it over a command channel, so attach, detach and stream
//! traffic are processed one at a time in arrival order.
//!
//! Create requests go out one at a time: the store confirms creations in
//! order without echoing which request a confirmation belongs to, so the
//! head of the queue is the only request in flight and the next confirmation
//! is matched to it.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use cinder_client_api::EventType;
use cinder_client_api::RpcError;
use cinder_client_api::WatchCancelRequest;
use cinder_client_api::WatchRequest;
use cinder_client_api::WatchResponse;
use cinder_client_api::WatchStream;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use super::WatchEvent;
use super::watcher::Watcher;
use crate::backoff::BackoffStrategy;
use crate::connection_pool::ConnectionPool;
use crate::error::ClientError;
use crate::error::Result;
use crate::namespace::KeyApplicator;

/// Lifecycle of the shared stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No stream, or waiting to reconnect.
    Idle,
    Connecting,
    Connected,
    /// The manager was shut down.
    Closed,
}

enum Command {
    Attach(Watcher),
    Detach(Watcher, oneshot::Sender<()>),
    Watchers(oneshot::Sender<Vec<Watcher>>),
    State(oneshot::Sender<StreamState>),
    Shutdown,
}

#[derive(Default)]
struct CommandSlot {
    sender: Option<mpsc::UnboundedSender<Command>>,
    shut_down: bool,
}

struct ManagerShared {
    pool: Arc<ConnectionPool>,
    backoff: Arc<dyn BackoffStrategy>,
    commands: Mutex<CommandSlot>,
}

/// Handle to a watch manager. Clones share the same stream.
#[derive(Clone)]
pub struct WatchManager {
    inner: Arc<ManagerShared>,
}

impl WatchManager {
    /// Creates a manager. No task runs and no stream is opened until the
    /// first watcher attaches.
    pub fn new(pool: Arc<ConnectionPool>, backoff: Arc<dyn BackoffStrategy>) -> Self {
        Self {
            inner: Arc::new(ManagerShared {
                pool,
                backoff,
                commands: Mutex::new(CommandSlot::default()),
            }),
        }
    }

    /// Backoff used between reconnection attempts.
    pub fn backoff(&self) -> Arc<dyn BackoffStrategy> {
        self.inner.backoff.clone()
    }

    fn send(&self, command: Command) -> Result<()> {
        let mut slot = self.inner.commands.lock();
        if slot.shut_down {
            return Err(ClientError::Closed);
        }
        let sender = slot.sender.get_or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let task = ManagerTask::new(self.inner.pool.clone(), self.inner.backoff.clone());
            tokio::spawn(task.run(rx));
            tx
        });
        sender.send(command).map_err(|_| ClientError::Closed)
    }

    /// Adds a watcher, opening the stream if needed.
    pub async fn attach(&self, watcher: &Watcher) -> Result<()> {
        self.send(Command::Attach(watcher.clone()))
    }

    /// Removes a watcher. Resolves once it has ended.
    pub async fn detach(&self, watcher: &Watcher) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Detach(watcher.clone(), tx))?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Currently attached watchers, in attachment order.
    pub async fn watchers(&self) -> Result<Vec<Watcher>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Watchers(tx))?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    pub async fn state(&self) -> Result<StreamState> {
        if self.inner.commands.lock().shut_down {
            return Ok(StreamState::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.send(Command::State(tx))?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Ends every watcher and stops the task. Later calls fail with
    /// [`ClientError::Closed`].
    pub fn shutdown(&self) {
        let mut slot = self.inner.commands.lock();
        slot.shut_down = true;
        if let Some(sender) = slot.sender.take() {
            let _ = sender.send(Command::Shutdown);
        }
    }
}

impl fmt::Debug for WatchManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.inner.commands.lock();
        f.debug_struct("WatchManager")
            .field("started", &slot.sender.is_some())
            .field("shut_down", &slot.shut_down)
            .finish()
    }
}

/// A watcher waiting for the store to confirm its cancellation.
struct Closer {
    watcher: Watcher,
    done: Option<oneshot::Sender<()>>,
}

impl Closer {
    fn finish(self) {
        self.watcher.set_id(None);
        self.watcher.emit(WatchEvent::End);
        if let Some(done) = self.done {
            let _ = done.send(());
        }
    }
}

struct ManagerTask {
    pool: Arc<ConnectionPool>,
    backoff: Arc<dyn BackoffStrategy>,
    state: StreamState,
    attached: Vec<Watcher>,
    queue: VecDeque<Watcher>,
    in_flight: bool,
    /// Detached while their create request was in flight.
    awaiting_create: Vec<Closer>,
    expected_closers: HashMap<i64, Closer>,
    stream: Option<WatchStream>,
    connecting: Option<BoxFuture<'static, Result<WatchStream>>>,
    reconnect_at: Option<Instant>,
}

impl ManagerTask {
    fn new(pool: Arc<ConnectionPool>, backoff: Arc<dyn BackoffStrategy>) -> Self {
        Self {
            pool,
            backoff,
            state: StreamState::Idle,
            attached: Vec::new(),
            queue: VecDeque::new(),
            in_flight: false,
            awaiting_create: Vec::new(),
            expected_closers: HashMap::new(),
            stream: None,
            connecting: None,
            reconnect_at: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        self.shutdown();
                        break;
                    }
                    Some(command) => self.handle_command(command),
                },
                result = next_connection(&mut self.connecting) => self.on_connected(result),
                message = next_message(&mut self.stream) => self.on_message(message),
                _ = sleep_until(self.reconnect_at) => self.connect(),
            }
        }
        debug!("watch manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Attach(watcher) => self.attach(watcher),
            Command::Detach(watcher, done) => self.detach(watcher, done),
            Command::Watchers(reply) => {
                let _ = reply.send(self.attached.clone());
            }
            Command::State(reply) => {
                let _ = reply.send(self.state);
            }
            Command::Shutdown => self.shutdown(),
        }
    }

    fn attach(&mut self, watcher: Watcher) {
        if self.attached.contains(&watcher) {
            return;
        }
        self.attached.push(watcher.clone());
        match self.state {
            StreamState::Idle => self.connect(),
            StreamState::Connecting => {}
            StreamState::Connected => {
                self.queue.push_back(watcher);
                self.pump();
            }
            StreamState::Closed => watcher.emit(WatchEvent::Error(ClientError::Closed)),
        }
    }

    fn detach(&mut self, watcher: Watcher, done: oneshot::Sender<()>) {
        let Some(position) = self.attached.iter().position(|w| w == &watcher) else {
            let _ = done.send(());
            return;
        };
        self.attached.remove(position);

        let closer = Closer {
            watcher: watcher.clone(),
            done: Some(done),
        };
        if self.in_flight && self.queue.front() == Some(&watcher) {
            // The confirmation still has to be matched against the queue head.
            self.awaiting_create.push(closer);
        } else if self.queue.contains(&watcher) {
            self.queue.retain(|w| w != &watcher);
            closer.finish();
        } else {
            match (self.state, watcher.id()) {
                (StreamState::Connected, Some(watch_id)) => {
                    self.expected_closers.insert(watch_id, closer);
                    self.write(WatchRequest::Cancel(WatchCancelRequest { watch_id }));
                }
                _ => closer.finish(),
            }
        }

        if self.attached.is_empty() {
            debug!("no watchers left, closing watch stream");
            self.teardown();
        }
    }

    fn connect(&mut self) {
        self.reconnect_at = None;
        self.state = StreamState::Connecting;
        let pool = self.pool.clone();
        self.connecting = Some(Box::pin(async move { pool.watch_stream().await }));
    }

    fn on_connected(&mut self, result: Result<WatchStream>) {
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => return self.on_stream_error(e),
        };
        if self.attached.is_empty() {
            self.state = StreamState::Idle;
            return;
        }

        debug!(watchers = self.attached.len(), "watch stream connected");
        self.backoff = self.backoff.reset();
        self.state = StreamState::Connected;
        self.stream = Some(stream);
        for watcher in &self.attached {
            watcher.resume_from_last_revision();
        }
        self.queue = self.attached.iter().cloned().collect();
        self.in_flight = false;
        self.pump();
    }

    /// Sends the create request for the queue head if nothing is in flight.
    fn pump(&mut self) {
        if self.state != StreamState::Connected || self.in_flight {
            return;
        }
        let Some(head) = self.queue.front() else {
            return;
        };
        let request = head.request();
        head.emit(WatchEvent::Connecting(request.clone()));
        self.in_flight = true;
        self.write(WatchRequest::Create(request));
    }

    fn write(&self, request: WatchRequest) {
        if let Some(stream) = &self.stream {
            // A closed stream surfaces on the response side.
            if stream.requests.send(request).is_err() {
                debug!("watch stream request channel closed");
            }
        }
    }

    fn on_message(&mut self, message: Option<Result<WatchResponse, RpcError>>) {
        match message {
            Some(Ok(response)) if response.created => self.on_created(response),
            Some(Ok(response)) if response.canceled => self.on_cancelled(response),
            Some(Ok(response)) => self.on_update(response),
            Some(Err(e)) => self.on_stream_error(e.into()),
            None => self.on_stream_error(ClientError::Transport("watch stream closed".to_string())),
        }
    }

    fn on_created(&mut self, response: WatchResponse) {
        self.in_flight = false;
        let Some(watcher) = self.queue.pop_front() else {
            warn!(watch_id = response.watch_id, "watch created with no pending request");
            return;
        };
        let detached = self.awaiting_create.iter().position(|c| c.watcher == watcher);

        if response.canceled {
            // The store refused the subscription, e.g. a compacted start revision.
            self.attached.retain(|w| w != &watcher);
            match detached {
                Some(index) => self.awaiting_create.remove(index).finish(),
                None => watcher.emit(WatchEvent::Error(ClientError::WatchCancelled {
                    watch_id: response.watch_id,
                    reason: response.cancel_reason,
                })),
            }
        } else {
            watcher.set_id(Some(response.watch_id));
            if watcher.last_revision().is_none() {
                watcher.set_last_revision(response.header.revision);
            }
            match detached {
                Some(index) => {
                    let closer = self.awaiting_create.remove(index);
                    self.expected_closers.insert(response.watch_id, closer);
                    self.write(WatchRequest::Cancel(WatchCancelRequest {
                        watch_id: response.watch_id,
                    }));
                }
                None => {
                    debug!(watch_id = response.watch_id, "watcher connected");
                    watcher.emit(WatchEvent::Connected(response));
                }
            }
        }

        if self.attached.is_empty() {
            self.teardown();
        } else {
            self.pump();
        }
    }

    fn on_cancelled(&mut self, response: WatchResponse) {
        if let Some(closer) = self.expected_closers.remove(&response.watch_id) {
            closer.finish();
        } else if let Some(position) = self.attached.iter().position(|w| w.id() == Some(response.watch_id)) {
            let watcher = self.attached.remove(position);
            warn!(watch_id = response.watch_id, reason = %response.cancel_reason, "watch cancelled by the store");
            watcher.emit(WatchEvent::Error(ClientError::WatchCancelled {
                watch_id: response.watch_id,
                reason: response.cancel_reason,
            }));
        }

        if self.attached.is_empty() {
            self.teardown();
        }
    }

    fn on_update(&mut self, response: WatchResponse) {
        let Some(watcher) = self.attached.iter().find(|w| w.id() == Some(response.watch_id)).cloned() else {
            debug!(watch_id = response.watch_id, "update for an unknown watcher");
            return;
        };
        watcher.set_last_revision(response.header.revision);

        let response = match unprefix_events(watcher.namespace(), response) {
            Ok(response) => response,
            Err(e) => return watcher.emit(WatchEvent::Error(e)),
        };
        watcher.emit(WatchEvent::Data(response.clone()));
        for event in response.events {
            watcher.emit(match event.kind {
                EventType::Put => WatchEvent::Put {
                    kv: event.kv,
                    prev_kv: event.prev_kv,
                },
                EventType::Delete => WatchEvent::Delete {
                    kv: event.kv,
                    prev_kv: event.prev_kv,
                },
            });
        }
    }

    fn on_stream_error(&mut self, error: ClientError) {
        warn!(error = %error, watchers = self.attached.len(), "watch stream failed");
        for watcher in &self.attached {
            watcher.emit(WatchEvent::Disconnected(error.clone()));
        }
        self.teardown();

        if !self.attached.is_empty() {
            let delay = self.backoff.delay();
            self.backoff = self.backoff.next();
            self.reconnect_at = Some(Instant::now() + delay);
            debug!(delay_ms = delay.as_millis() as u64, "scheduling watch reconnection");
        }
    }

    /// Drops the stream and ends every watcher waiting on a cancellation.
    fn teardown(&mut self) {
        self.stream = None;
        self.connecting = None;
        self.reconnect_at = None;
        self.state = StreamState::Idle;
        self.queue.clear();
        self.in_flight = false;
        for closer in self.awaiting_create.drain(..) {
            closer.finish();
        }
        for (_, closer) in self.expected_closers.drain() {
            closer.finish();
        }
    }

    fn shutdown(&mut self) {
        self.teardown();
        for watcher in self.attached.drain(..) {
            watcher.emit(WatchEvent::End);
        }
        self.state = StreamState::Closed;
    }
}

fn unprefix_events(namespace: &KeyApplicator, mut response: WatchResponse) -> Result<WatchResponse> {
    for event in &mut response.events {
        event.kv.key = namespace.unprefix(&event.kv.key)?;
        if let Some(prev) = &mut event.prev_kv {
            prev.key = namespace.unprefix(&prev.key)?;
        }
    }
    Ok(response)
}

async fn next_connection(connecting: &mut Option<BoxFuture<'static, Result<WatchStream>>>) -> Result<WatchStream> {
    match connecting.as_mut() {
        Some(future) => {
            let result = future.await;
            *connecting = None;
            result
        }
        None => std::future::pending().await,
    }
}

async fn next_message(stream: &mut Option<WatchStream>) -> Option<Result<WatchResponse, RpcError>> {
    match stream.as_mut() {
        Some(stream) => stream.responses.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
