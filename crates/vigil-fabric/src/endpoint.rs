//! Per-peer endpoint state: identity, subscriptions, live stream, and
//! topic handlers.
//!
//! An [`Endpoint`] is a named peer in the fabric. Local endpoints deliver
//! requests to registered topic handlers; remote endpoints serialize
//! messages onto their framed TLS stream. An endpoint survives the loss
//! of its stream — it stays in the registry as a reconnect candidate
//! until explicitly unregistered.
//!
//! Stream ownership: [`Endpoint::set_stream`] splits the stream and
//! spawns a reader task and a writer task. Outbound messages are queued
//! on a bounded channel drained by the writer, so senders never await a
//! socket while holding a lock. Each stream assignment carries a
//! generation number; a terminating task only clears the stream reference
//! if its generation is still current, so a stale task cannot tear down a
//! replacement connection.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vigil_wire::{read_message, write_message, Message, RequestMessage, ResponseMessage, WireError};

use crate::manager::EndpointManager;

/// Topic advertised by every endpoint on connect; advisory only.
pub const WELCOME_METHOD: &str = "fabric::Welcome";

/// Outbound messages queued per endpoint before backpressure drops.
const OUTBOUND_QUEUE: usize = 128;

/// A callback fired for requests on a subscribed topic.
///
/// Arguments: the endpoint the handler is registered on, the sending
/// endpoint (`None` for anonymous local senders), and the request.
/// Errors are logged at the dispatch boundary; they never stop later
/// handlers from running.
pub type TopicHandler =
    Arc<dyn Fn(Arc<Endpoint>, Option<Arc<Endpoint>>, &RequestMessage) -> Result<(), String> + Send + Sync>;

/// Live stream bookkeeping for a connected endpoint.
struct StreamHandle {
    tx: mpsc::Sender<Message>,
    generation: u64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl StreamHandle {
    fn teardown(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Mutable endpoint state, guarded by one lock.
struct EndpointState {
    subscriptions: HashSet<String>,
    node: Option<String>,
    service: Option<String>,
    stream: Option<StreamHandle>,
    sent_welcome: bool,
    received_welcome: bool,
    connected_at: Option<DateTime<Utc>>,
    generation: u64,
}

/// A named, possibly-connected peer in the fabric.
pub struct Endpoint {
    name: String,
    local: bool,
    replicated: bool,
    manager: Weak<EndpointManager>,
    state: Mutex<EndpointState>,
    handlers: Mutex<HashMap<String, Vec<TopicHandler>>>,
}

impl Endpoint {
    pub(crate) fn new(
        name: impl Into<String>,
        replicated: bool,
        local: bool,
        manager: Weak<EndpointManager>,
    ) -> Self {
        Self {
            name: name.into(),
            local,
            replicated,
            manager,
            state: Mutex::new(EndpointState {
                subscriptions: HashSet::new(),
                node: None,
                service: None,
                stream: None,
                sent_welcome: false,
                received_welcome: false,
                connected_at: None,
                generation: 0,
            }),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// The endpoint's unique name (the peer certificate CN for remote
    /// endpoints).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if messages may be routed between this endpoint and non-local
    /// peers. Immutable after creation.
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// True if this endpoint came from the wire or config rather than
    /// being built in-process.
    pub fn is_replicated(&self) -> bool {
        self.replicated
    }

    /// True while a stream is attached.
    pub fn is_connected(&self) -> bool {
        self.lock_state().stream.is_some()
    }

    /// When the current stream was attached, if connected.
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.lock_state().connected_at
    }

    /// Whether a welcome has been sent on the current stream.
    pub fn sent_welcome(&self) -> bool {
        self.lock_state().sent_welcome
    }

    /// Whether any message has arrived on the current stream.
    pub fn received_welcome(&self) -> bool {
        self.lock_state().received_welcome
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Add a topic subscription. Idempotent.
    pub fn register_subscription(&self, topic: impl Into<String>) {
        self.lock_state().subscriptions.insert(topic.into());
    }

    /// Remove a topic subscription. Idempotent.
    pub fn unregister_subscription(&self, topic: &str) {
        self.lock_state().subscriptions.remove(topic);
    }

    /// True if the endpoint subscribes to `topic`.
    pub fn has_subscription(&self, topic: &str) -> bool {
        self.lock_state().subscriptions.contains(topic)
    }

    /// Snapshot of the subscription set.
    pub fn subscriptions(&self) -> HashSet<String> {
        self.lock_state().subscriptions.clone()
    }

    /// Replace the whole subscription set.
    pub fn set_subscriptions(&self, subscriptions: HashSet<String>) {
        self.lock_state().subscriptions = subscriptions;
    }

    /// Drop every subscription.
    pub fn clear_subscriptions(&self) {
        self.lock_state().subscriptions.clear();
    }

    // ------------------------------------------------------------------
    // Dial target
    // ------------------------------------------------------------------

    /// Set the host and port the reconnect timer dials for this endpoint.
    pub fn set_dial_target(&self, node: impl Into<String>, service: impl Into<String>) {
        let mut state = self.lock_state();
        state.node = Some(node.into());
        state.service = Some(service.into());
    }

    /// The dial target, if both node and service are known.
    pub fn dial_target(&self) -> Option<(String, String)> {
        let state = self.lock_state();
        match (&state.node, &state.service) {
            (Some(node), Some(service)) => Some((node.clone(), service.clone())),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Topic handlers
    // ------------------------------------------------------------------

    /// Append a handler for `topic`. Handlers fire in registration order
    /// for every matching request and remain for the endpoint's lifetime.
    ///
    /// Registering a handler also subscribes the endpoint to the topic so
    /// the router can find it.
    pub fn register_topic_handler(&self, topic: impl Into<String>, handler: TopicHandler) {
        let topic = topic.into();
        self.register_subscription(topic.clone());
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(topic)
            .or_default()
            .push(handler);
    }

    // ------------------------------------------------------------------
    // Message processing
    // ------------------------------------------------------------------

    /// Deliver a request to this endpoint.
    ///
    /// Local endpoints invoke their topic handlers in registration order;
    /// a handler error is logged and later handlers still run. Remote
    /// endpoints serialize the request onto their stream; without a
    /// stream the request is dropped.
    pub fn process_request(self: &Arc<Self>, sender: Option<Arc<Endpoint>>, request: &RequestMessage) {
        if self.local {
            let handlers: Vec<TopicHandler> = {
                let map = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
                map.get(&request.method).cloned().unwrap_or_default()
            };
            for handler in handlers {
                if let Err(e) = handler(Arc::clone(self), sender.clone(), request) {
                    error!(
                        endpoint = %self.name,
                        method = %request.method,
                        error = %e,
                        "Topic handler failed"
                    );
                }
            }
        } else if !self.send_message(Message::Request(request.clone())) {
            debug!(
                endpoint = %self.name,
                method = %request.method,
                "Dropping request for disconnected endpoint"
            );
        }
    }

    /// Deliver a response to this endpoint.
    ///
    /// Local endpoints hand the response to the manager's pending-request
    /// tracker; remote endpoints serialize it onto their stream.
    pub fn process_response(&self, sender: Option<Arc<Endpoint>>, response: &ResponseMessage) {
        if self.local {
            if let Some(manager) = self.manager.upgrade() {
                manager.process_response_message(sender, response);
            }
        } else if !self.send_message(Message::Response(response.clone())) {
            debug!(
                endpoint = %self.name,
                id = %response.id,
                "Dropping response for disconnected endpoint"
            );
        }
    }

    /// Queue a message for the writer task. Returns false if no stream is
    /// attached or the outbound queue rejected the message.
    fn send_message(&self, message: Message) -> bool {
        let tx = {
            let mut state = self.lock_state();
            let Some(handle) = state.stream.as_ref() else {
                return false;
            };
            let tx = handle.tx.clone();
            state.sent_welcome = true;
            tx
        };
        match tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(endpoint = %self.name, "Outbound queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    // ------------------------------------------------------------------
    // Stream lifecycle
    // ------------------------------------------------------------------

    /// Attach a stream, replacing any current one.
    ///
    /// Spawns the reader and writer tasks and queues the welcome message.
    /// Must be called from within a tokio runtime.
    pub fn set_stream<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);

        {
            let mut state = self.lock_state();
            if let Some(old) = state.stream.take() {
                old.teardown();
            }
            state.generation += 1;
            let generation = state.generation;
            state.sent_welcome = false;
            state.received_welcome = false;
            state.connected_at = Some(Utc::now());

            let reader = tokio::spawn(read_loop(read_half, Arc::clone(self), generation));
            let writer = tokio::spawn(write_loop(write_half, rx, Arc::clone(self), generation));
            state.stream = Some(StreamHandle {
                tx,
                generation,
                reader,
                writer,
            });
        }

        info!(endpoint = %self.name, "Stream attached");
        self.send_message(Message::Request(RequestMessage::new(WELCOME_METHOD)));
    }

    /// Detach the current stream, if any. The endpoint stays registered
    /// and becomes a reconnect candidate.
    pub fn clear_stream(&self) {
        let handle = {
            let mut state = self.lock_state();
            state.connected_at = None;
            state.stream.take()
        };
        if let Some(handle) = handle {
            handle.teardown();
            info!(endpoint = %self.name, "Stream detached");
        }
    }

    /// Clear the stream only if `generation` is still the live one. Used
    /// by terminating reader/writer tasks.
    fn clear_stream_if(&self, generation: u64) {
        let handle = {
            let mut state = self.lock_state();
            match &state.stream {
                Some(handle) if handle.generation == generation => {
                    state.connected_at = None;
                    state.stream.take()
                }
                _ => None,
            }
        };
        if let Some(handle) = handle {
            handle.teardown();
            info!(endpoint = %self.name, "Stream closed");
        }
    }

    fn note_received(&self) {
        self.lock_state().received_welcome = true;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("local", &self.local)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Reader task: consumes framed messages until the stream ends or errors.
///
/// Inbound requests are re-routed through the manager — anycast when the
/// request expects a response, multicast when it does not — so the
/// locality firewall confines delivery to local endpoints. Inbound
/// responses go to the pending-request tracker.
async fn read_loop<S>(mut reader: ReadHalf<S>, endpoint: Arc<Endpoint>, generation: u64)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        match read_message(&mut reader).await {
            Ok(message) => {
                endpoint.note_received();
                let Some(manager) = endpoint.manager.upgrade() else {
                    break;
                };
                match message {
                    Message::Response(response) => {
                        manager.process_response_message(Some(Arc::clone(&endpoint)), &response);
                    }
                    Message::Request(request) => {
                        let routed = if request.id.is_some() {
                            manager.send_anycast(Some(&endpoint), &request)
                        } else {
                            manager.send_multicast(Some(&endpoint), &request)
                        };
                        if let Err(e) = routed {
                            warn!(
                                endpoint = %endpoint.name,
                                error = %e,
                                "Dropping connection after protocol fault"
                            );
                            break;
                        }
                    }
                }
            }
            Err(WireError::ConnectionClosed) => {
                debug!(endpoint = %endpoint.name, "Peer closed connection");
                break;
            }
            Err(e) => {
                warn!(endpoint = %endpoint.name, error = %e, "Read failed, dropping connection");
                break;
            }
        }
    }
    endpoint.clear_stream_if(generation);
}

/// Writer task: drains the outbound queue onto the stream.
async fn write_loop<S>(
    mut writer: WriteHalf<S>,
    mut rx: mpsc::Receiver<Message>,
    endpoint: Arc<Endpoint>,
    generation: u64,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    while let Some(message) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            warn!(endpoint = %endpoint.name, error = %e, "Write failed, dropping connection");
            break;
        }
    }
    endpoint.clear_stream_if(generation);
}
