//! The endpoint manager: TLS listener/dialer, message router, pending
//! request correlation, and the periodic timers that keep the fabric
//! converging.
//!
//! A manager is an explicitly constructed value — tests run several side
//! by side. It owns the endpoint registry, the pending-request tracker,
//! and an optional TLS context shared by listeners and dialers. Send
//! operations are synchronous: remote delivery only queues onto the
//! recipient's writer task, so they are safe to call from topic handlers
//! and from any task.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vigil_wire::{Message, RequestMessage, ResponseMessage};

use crate::config::FabricConfig;
use crate::endpoint::Endpoint;
use crate::error::{FabricError, FabricResult};
use crate::registry::EndpointRegistry;
use crate::tls::{peer_identity, TlsContext};
use crate::tracker::{ApiCallback, RequestTracker};

/// Default period of the request-sweep, aggregation, and reconnect timers.
pub const DEFAULT_TIMER_INTERVAL: Duration = Duration::from_secs(5);

/// Which side of the TLS handshake a new connection plays.
#[derive(Debug, Clone)]
pub enum ConnectionRole {
    /// Accepted by a listener.
    Server,
    /// Dialed outward; the peer certificate must be valid for `server_name`.
    Client {
        /// The dialed host name.
        server_name: String,
    },
}

/// Callback fired whenever a connection is established for an endpoint.
pub type ConnectedHandler = Arc<dyn Fn(Arc<Endpoint>) + Send + Sync>;

/// Routes messages between named endpoints over mutually-authenticated
/// TLS.
pub struct EndpointManager {
    identity: String,
    registry: EndpointRegistry,
    tracker: RequestTracker,
    tls: RwLock<Option<TlsContext>>,
    next_message_id: AtomicU64,
    timer_interval: Duration,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    on_connected: Mutex<Vec<ConnectedHandler>>,
}

impl EndpointManager {
    /// Create a manager with the given identity and the default timer
    /// interval. The identity endpoint is registered immediately.
    pub fn new(identity: impl Into<String>) -> Arc<Self> {
        Self::with_timer_interval(identity, DEFAULT_TIMER_INTERVAL)
    }

    /// Create a manager with an explicit timer interval (tests compress
    /// time through this).
    pub fn with_timer_interval(identity: impl Into<String>, timer_interval: Duration) -> Arc<Self> {
        let identity = identity.into();
        let (shutdown, _) = watch::channel(false);
        let manager = Arc::new_cyclic(|weak: &Weak<EndpointManager>| EndpointManager {
            identity: identity.clone(),
            registry: EndpointRegistry::new(weak.clone()),
            tracker: RequestTracker::new(),
            tls: RwLock::new(None),
            next_message_id: AtomicU64::new(0),
            timer_interval,
            shutdown,
            started: AtomicBool::new(false),
            on_connected: Mutex::new(Vec::new()),
        });
        manager.registry.make_or_get(&identity, true, true);
        manager
    }

    /// Build a manager from a parsed config: TLS context, declared
    /// endpoints, listeners, and timers.
    pub async fn from_config(config: &FabricConfig) -> FabricResult<Arc<Self>> {
        if config.identity.is_empty() {
            return Err(FabricError::Config("Identity must not be empty".into()));
        }
        let manager = Self::with_timer_interval(
            &config.identity,
            Duration::from_millis(config.timer_interval_ms),
        );
        if let Some(tls) = &config.tls {
            manager.set_tls_context(TlsContext::from_pem_files(
                &tls.cert_file,
                &tls.key_file,
                &tls.ca_file,
            )?);
        }
        for declared in &config.endpoints {
            let endpoint = manager
                .registry
                .make_or_get(&declared.name, true, declared.local);
            if let (Some(node), Some(service)) = (&declared.node, &declared.service) {
                endpoint.set_dial_target(node, service);
            }
        }
        for service in &config.listen {
            manager.add_listener(service).await?;
        }
        manager.start();
        Ok(manager)
    }

    /// The manager's own name; equal to the identity endpoint's name.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The endpoint registry.
    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    /// The pending-request tracker.
    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    /// The identity endpoint, unless it was explicitly unregistered.
    pub fn identity_endpoint(&self) -> Option<Arc<Endpoint>> {
        self.registry.get_by_name(&self.identity)
    }

    /// Install the TLS context used by all listeners and dialers.
    pub fn set_tls_context(&self, context: TlsContext) {
        let mut tls = self.tls.write().unwrap_or_else(|e| e.into_inner());
        *tls = Some(context);
    }

    /// The current TLS context, if configured.
    pub fn tls_context(&self) -> Option<TlsContext> {
        let tls = self.tls.read().unwrap_or_else(|e| e.into_inner());
        tls.clone()
    }

    /// Register a callback fired after each successful handshake.
    pub fn on_connected(&self, handler: ConnectedHandler) {
        self.on_connected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    // ------------------------------------------------------------------
    // Listener / dialer
    // ------------------------------------------------------------------

    /// Bind a dual-stack listener on `service` (a port number) and accept
    /// connections until shutdown.
    ///
    /// Fails with a configuration error if no TLS context is installed.
    pub async fn add_listener(self: &Arc<Self>, service: &str) -> FabricResult<()> {
        if self.tls_context().is_none() {
            return Err(FabricError::Config(
                "TLS context is required for add_listener".into(),
            ));
        }
        let port: u16 = service
            .parse()
            .map_err(|_| FabricError::Config(format!("Invalid service '{service}'")))?;

        let listener = TcpListener::bind(("::", port)).await?;
        info!(port, "Adding new listener");

        let manager = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((socket, peer)) => {
                            let Some(manager) = manager.upgrade() else { break };
                            tokio::spawn(async move {
                                if let Err(e) = manager.new_client(socket, ConnectionRole::Server).await {
                                    info!(peer = %peer, error = %e, "Error for new fabric socket");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Resolve and dial `node:service`, then hand the socket to
    /// [`new_client`](Self::new_client).
    ///
    /// Dial and handshake failures are logged, not returned — the
    /// reconnect timer drives retries. Only a missing TLS context or an
    /// unparsable service is an error.
    pub async fn add_connection(self: &Arc<Self>, node: &str, service: &str) -> FabricResult<()> {
        if self.tls_context().is_none() {
            return Err(FabricError::Config(
                "TLS context is required for add_connection".into(),
            ));
        }
        let port: u16 = service
            .parse()
            .map_err(|_| FabricError::Config(format!("Invalid service '{service}'")))?;

        match TcpStream::connect((node, port)).await {
            Ok(socket) => {
                let role = ConnectionRole::Client {
                    server_name: node.to_string(),
                };
                if let Err(e) = self.new_client(socket, role).await {
                    info!(node, service, error = %e, "Could not connect");
                }
            }
            Err(e) => {
                info!(node, service, error = %e, "Could not connect");
            }
        }
        Ok(())
    }

    /// Upgrade a socket to TLS, extract the peer identity from its
    /// certificate CN, and attach the stream to the matching endpoint
    /// (created on first contact).
    pub async fn new_client(self: &Arc<Self>, socket: TcpStream, role: ConnectionRole) -> FabricResult<()> {
        let tls = self.tls_context().ok_or_else(|| {
            FabricError::Config("TLS context is required for new_client".into())
        })?;

        let stream = match &role {
            ConnectionRole::Server => tls.accept(socket).await?,
            ConnectionRole::Client { server_name } => tls.connect(server_name, socket).await?,
        };

        let identity = peer_identity(&stream).ok_or_else(|| {
            FabricError::Connection("Peer certificate has no common name".into())
        })?;

        info!(identity = %identity, "New client connection");

        let endpoint = self.registry.make_or_get(&identity, true, false);
        endpoint.set_stream(stream);

        let handlers: Vec<ConnectedHandler> = {
            let on_connected = self.on_connected.lock().unwrap_or_else(|e| e.into_inner());
            on_connected.clone()
        };
        for handler in handlers {
            handler(Arc::clone(&endpoint));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Deliver a message to one recipient.
    ///
    /// Messages between two non-local endpoints are dropped silently —
    /// the fabric never relays for anonymous remote peers. A missing
    /// sender counts as local.
    pub fn send_unicast(
        &self,
        sender: Option<&Arc<Endpoint>>,
        recipient: &Arc<Endpoint>,
        message: &Message,
    ) {
        if sender.is_some_and(|s| !s.is_local()) && !recipient.is_local() {
            return;
        }
        match message {
            Message::Response(response) => recipient.process_response(sender.cloned(), response),
            Message::Request(request) => recipient.process_request(sender.cloned(), request),
        }
    }

    /// Deliver a request to one randomly chosen endpoint subscribed to
    /// its method. No subscribers is not an error.
    pub fn send_anycast(
        &self,
        sender: Option<&Arc<Endpoint>>,
        request: &RequestMessage,
    ) -> FabricResult<()> {
        if request.method.is_empty() {
            return Err(FabricError::Protocol(
                "Message is missing the 'method' property".into(),
            ));
        }

        let candidates: Vec<Arc<Endpoint>> = self
            .registry
            .all_endpoints()
            .into_iter()
            .filter(|ep| !(sender.is_some_and(|s| !s.is_local()) && !ep.is_local()))
            .filter(|ep| ep.has_subscription(&request.method))
            .collect();

        let Some(recipient) = candidates.choose(&mut rand::thread_rng()) else {
            return Ok(());
        };
        self.send_unicast(sender, recipient, &Message::Request(request.clone()));
        Ok(())
    }

    /// Deliver a request to every subscribed endpoint except the sender.
    ///
    /// Multicast requests must not carry a correlation ID — no single
    /// response could answer them.
    pub fn send_multicast(
        &self,
        sender: Option<&Arc<Endpoint>>,
        request: &RequestMessage,
    ) -> FabricResult<()> {
        if request.id.is_some() {
            return Err(FabricError::Protocol(
                "Multicast requests must not have an ID".into(),
            ));
        }
        if request.method.is_empty() {
            return Err(FabricError::Protocol(
                "Message is missing the 'method' property".into(),
            ));
        }

        for recipient in self.registry.all_endpoints() {
            if let Some(sender) = sender {
                if Arc::ptr_eq(sender, &recipient) {
                    continue;
                }
            }
            if recipient.has_subscription(&request.method) {
                self.send_unicast(sender, &recipient, &Message::Request(request.clone()));
            }
        }
        Ok(())
    }

    /// Send a request that expects a response.
    ///
    /// Assigns the next correlation ID, registers the callback with a
    /// deadline of `now + timeout`, and dispatches by unicast when a
    /// recipient is given, anycast otherwise. The callback fires exactly
    /// once: with the matching response, or with the timeout flag after
    /// the deadline passes.
    pub fn send_api_message(
        &self,
        sender: Option<&Arc<Endpoint>>,
        recipient: Option<&Arc<Endpoint>>,
        mut request: RequestMessage,
        callback: ApiCallback,
        timeout: Duration,
    ) -> FabricResult<()> {
        if request.method.is_empty() {
            return Err(FabricError::Protocol(
                "Message is missing the 'method' property".into(),
            ));
        }

        let id = (self.next_message_id.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        request.id = Some(id.clone());
        self.tracker
            .insert(id, request.clone(), callback, Instant::now() + timeout);

        match recipient {
            Some(recipient) => {
                self.send_unicast(sender, recipient, &Message::Request(request));
                Ok(())
            }
            None => self.send_anycast(sender, &request),
        }
    }

    /// Correlate an inbound response with its pending request.
    pub fn process_response_message(&self, sender: Option<Arc<Endpoint>>, response: &ResponseMessage) {
        self.tracker.complete(&response.id, sender, response);
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Start the periodic tasks: request-timeout sweep, subscription
    /// aggregation, and reconnect. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(request_timer(Arc::downgrade(self), self.timer_interval, self.shutdown.subscribe()));
        tokio::spawn(subscription_timer(Arc::downgrade(self), self.timer_interval, self.shutdown.subscribe()));
        tokio::spawn(reconnect_timer(Arc::downgrade(self), self.timer_interval, self.shutdown.subscribe()));
    }

    /// Signal timer and accept tasks to exit. Reader tasks end with
    /// their streams.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Recompute the identity endpoint's subscriptions as the union of
    /// all other local endpoints' subscriptions. Runs from scratch every
    /// tick, so missed updates converge.
    fn aggregate_subscriptions(&self) {
        let Some(identity_endpoint) = self.identity_endpoint() else {
            return;
        };
        let mut union = HashSet::new();
        for endpoint in self.registry.all_endpoints() {
            if !endpoint.is_local() || Arc::ptr_eq(&endpoint, &identity_endpoint) {
                continue;
            }
            union.extend(endpoint.subscriptions());
        }
        identity_endpoint.set_subscriptions(union);
    }

    /// Dial every disconnected endpoint that has a dial target.
    fn reconnect_pass(self: &Arc<Self>) {
        for endpoint in self.registry.all_endpoints() {
            if endpoint.is_connected() || endpoint.name() == self.identity {
                continue;
            }
            let Some((node, service)) = endpoint.dial_target() else {
                if !endpoint.is_local() {
                    debug!(
                        endpoint = %endpoint.name(),
                        "Cannot reconnect: no node/service information"
                    );
                }
                continue;
            };
            let manager = Arc::clone(self);
            let name = endpoint.name().to_string();
            tokio::spawn(async move {
                if let Err(e) = manager.add_connection(&node, &service).await {
                    warn!(endpoint = %name, error = %e, "Reconnect failed");
                }
            });
        }
    }
}

impl std::fmt::Debug for EndpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointManager")
            .field("identity", &self.identity)
            .field("endpoints", &self.registry.len())
            .field("pending_requests", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

async fn request_timer(
    manager: Weak<EndpointManager>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(manager) = manager.upgrade() else { break };
                let expired = manager.tracker.sweep(Instant::now());
                if expired > 0 {
                    debug!(expired, "Timed out pending requests");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn subscription_timer(
    manager: Weak<EndpointManager>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(manager) = manager.upgrade() else { break };
                manager.aggregate_subscriptions();
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn reconnect_timer(
    manager: Weak<EndpointManager>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(manager) = manager.upgrade() else { break };
                manager.reconnect_pass();
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use vigil_wire::read_message;

    fn request(method: &str) -> RequestMessage {
        RequestMessage::new(method)
    }

    #[tokio::test]
    async fn test_unicast_delivers_to_local_handler() {
        let manager = EndpointManager::new("alpha");
        let local = manager.registry().make_or_get("checker", false, true);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        local.register_topic_handler(
            "ping",
            Arc::new(move |_, _, _| {
                fired2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        manager.send_unicast(None, &local, &Message::Request(request("ping")));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_locality_firewall_blocks_remote_to_remote() {
        let manager = EndpointManager::new("alpha");
        let remote_sender = manager.registry().make_or_get("r1", true, false);
        let remote_recipient = manager.registry().make_or_get("r2", true, false);

        let (stream, mut observer) = tokio::io::duplex(4096);
        remote_recipient.set_stream(stream);
        // Consume the welcome so anything further is firewall leakage.
        let welcome = read_message(&mut observer).await.unwrap();
        assert_eq!(welcome.method(), Some(crate::endpoint::WELCOME_METHOD));

        manager.send_unicast(
            Some(&remote_sender),
            &remote_recipient,
            &Message::Request(request("ping")),
        );

        let leaked = tokio::time::timeout(
            Duration::from_millis(100),
            read_message(&mut observer),
        )
        .await;
        assert!(leaked.is_err(), "Firewalled message reached the wire");
    }

    #[tokio::test]
    async fn test_anonymous_sender_counts_as_local() {
        let manager = EndpointManager::new("alpha");
        let remote = manager.registry().make_or_get("r1", true, false);

        let (stream, mut observer) = tokio::io::duplex(4096);
        remote.set_stream(stream);
        let _welcome = read_message(&mut observer).await.unwrap();

        manager.send_unicast(None, &remote, &Message::Request(request("ping")));
        let delivered = read_message(&mut observer).await.unwrap();
        assert_eq!(delivered.method(), Some("ping"));
    }

    #[tokio::test]
    async fn test_multicast_rejects_caller_supplied_id() {
        let manager = EndpointManager::new("alpha");
        let subscriber = manager.registry().make_or_get("sub", false, true);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        subscriber.register_topic_handler(
            "x",
            Arc::new(move |_, _, _| {
                fired2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let result = manager.send_multicast(None, &request("x").with_id("42"));
        assert!(matches!(result, Err(FabricError::Protocol(_))));
        assert_eq!(fired.load(Ordering::SeqCst), 0, "Rejected multicast was delivered");
    }

    #[tokio::test]
    async fn test_multicast_excludes_sender() {
        let manager = EndpointManager::new("alpha");
        let sender = manager.registry().make_or_get("sender", false, true);
        let other = manager.registry().make_or_get("other", false, true);

        let sender_hits = Arc::new(AtomicUsize::new(0));
        let other_hits = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&sender_hits);
        sender.register_topic_handler(
            "x",
            Arc::new(move |_, _, _| {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        let o = Arc::clone(&other_hits);
        other.register_topic_handler(
            "x",
            Arc::new(move |_, _, _| {
                o.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        manager.send_multicast(Some(&sender), &request("x")).unwrap();
        assert_eq!(sender_hits.load(Ordering::SeqCst), 0);
        assert_eq!(other_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_anycast_with_no_subscribers_is_silent() {
        let manager = EndpointManager::new("alpha");
        assert!(manager.send_anycast(None, &request("nobody-cares")).is_ok());
    }

    #[tokio::test]
    async fn test_anycast_requires_method() {
        let manager = EndpointManager::new("alpha");
        let result = manager.send_anycast(None, &request(""));
        assert!(matches!(result, Err(FabricError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_anycast_delivers_to_exactly_one_subscriber() {
        let manager = EndpointManager::new("alpha");
        let total = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b", "c"] {
            let ep = manager.registry().make_or_get(name, false, true);
            let total = Arc::clone(&total);
            ep.register_topic_handler(
                "x",
                Arc::new(move |_, _, _| {
                    total.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }

        for _ in 0..20 {
            manager.send_anycast(None, &request("x")).unwrap();
        }
        assert_eq!(total.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_api_message_ids_are_monotonic() {
        let manager = EndpointManager::new("alpha");
        let seen = Arc::new(Mutex::new(Vec::new()));

        // No recipient subscribes, so requests sit in the tracker; the
        // assigned IDs are visible through the stored request.
        for _ in 0..3 {
            let seen = Arc::clone(&seen);
            manager
                .send_api_message(
                    None,
                    None,
                    request("x"),
                    Box::new(move |_, req, _, timed_out| {
                        assert!(timed_out);
                        seen.lock().unwrap().push(req.id.clone().unwrap());
                    }),
                    Duration::from_secs(0),
                )
                .unwrap();
        }

        manager.tracker().sweep(Instant::now() + Duration::from_millis(1));
        let mut ids = seen.lock().unwrap().clone();
        ids.sort_by_key(|id| id.parse::<u64>().unwrap());
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_api_message_callback_completes_with_response() {
        let manager = EndpointManager::new("alpha");
        let responder = manager.registry().make_or_get("responder", false, true);

        let manager_for_handler = Arc::clone(&manager);
        responder.register_topic_handler(
            "ping",
            Arc::new(move |_, sender, req| {
                let id = req.id.clone().ok_or("missing id")?;
                let response = ResponseMessage::reply_to(id, serde_json::json!("pong"));
                manager_for_handler
                    .process_response_message(sender, &response);
                Ok(())
            }),
        );

        let completed = Arc::new(AtomicUsize::new(0));
        let completed2 = Arc::clone(&completed);
        manager
            .send_api_message(
                None,
                None,
                request("ping"),
                Box::new(move |_, _, response, timed_out| {
                    assert!(!timed_out);
                    assert_eq!(response.result, serde_json::json!("pong"));
                    completed2.fetch_add(1, Ordering::SeqCst);
                }),
                Duration::from_secs(10),
            )
            .unwrap();

        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert!(manager.tracker().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_aggregation_converges() {
        let manager = EndpointManager::new("alpha");
        let a = manager.registry().make_or_get("a", false, true);
        let b = manager.registry().make_or_get("b", false, true);
        let remote = manager.registry().make_or_get("r", true, false);

        a.register_subscription("x");
        b.register_subscription("y");
        remote.register_subscription("z");

        manager.aggregate_subscriptions();
        let identity = manager.identity_endpoint().unwrap();
        assert!(identity.has_subscription("x"));
        assert!(identity.has_subscription("y"));
        assert!(!identity.has_subscription("z"), "Remote subscriptions leaked");

        // Recomputed from scratch: dropped subscriptions disappear.
        a.unregister_subscription("x");
        manager.aggregate_subscriptions();
        let identity = manager.identity_endpoint().unwrap();
        assert!(!identity.has_subscription("x"));
        assert!(identity.has_subscription("y"));
    }

    #[tokio::test]
    async fn test_from_config_materializes_declared_endpoints() {
        let config = FabricConfig::from_toml(
            r#"
            identity = "alpha"
            timer_interval_ms = 100

            [[endpoint]]
            name = "beta"
            node = "beta-host"
            service = "5665"

            [[endpoint]]
            name = "loopback"
            local = true
            "#,
        )
        .unwrap();

        let manager = EndpointManager::from_config(&config).await.unwrap();
        assert_eq!(manager.identity(), "alpha");

        let beta = manager.registry().get_by_name("beta").unwrap();
        assert!(!beta.is_local());
        assert_eq!(
            beta.dial_target(),
            Some(("beta-host".to_string(), "5665".to_string()))
        );

        let loopback = manager.registry().get_by_name("loopback").unwrap();
        assert!(loopback.is_local());
        assert!(loopback.dial_target().is_none());

        manager.shutdown();
    }

    #[tokio::test]
    async fn test_from_config_requires_tls_for_listeners() {
        let config = FabricConfig::from_toml(
            r#"
            identity = "alpha"
            listen = ["0"]
            "#,
        )
        .unwrap();
        let result = EndpointManager::from_config(&config).await;
        assert!(matches!(result, Err(FabricError::Config(_))));
    }

    #[tokio::test]
    async fn test_add_listener_without_tls_is_a_config_error() {
        let manager = EndpointManager::new("alpha");
        let result = manager.add_listener("0").await;
        assert!(matches!(result, Err(FabricError::Config(_))));
    }

    #[tokio::test]
    async fn test_add_connection_without_tls_is_a_config_error() {
        let manager = EndpointManager::new("alpha");
        let result = manager.add_connection("localhost", "5665").await;
        assert!(matches!(result, Err(FabricError::Config(_))));
    }
}
