//! Vigil remoting fabric — peer-to-peer messaging between named
//! endpoints over mutually-authenticated TLS.
//!
//! The [`EndpointManager`] accepts and dials TLS connections, binds each
//! live connection to an endpoint named by the peer certificate's common
//! name, dispatches inbound requests to per-topic handlers, and routes
//! outbound messages by unicast, anycast, or multicast. Request/response
//! correlation runs through a pending-request tracker with per-request
//! timeouts.
//!
//! ## Topology rules
//!
//! - Endpoints are unique by name; losing a stream does not lose the
//!   endpoint — the reconnect timer redials endpoints with a dial target.
//! - Messages between two non-local endpoints are never relayed.
//! - The identity endpoint advertises the union of all other local
//!   endpoints' subscriptions, recomputed every aggregation tick.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod registry;
pub mod tls;
pub mod tracker;

pub use config::{EndpointConfig, FabricConfig, TlsFilesConfig};
pub use endpoint::{Endpoint, TopicHandler, WELCOME_METHOD};
pub use error::{FabricError, FabricResult};
pub use manager::{ConnectedHandler, ConnectionRole, EndpointManager, DEFAULT_TIMER_INTERVAL};
pub use registry::EndpointRegistry;
pub use tls::{peer_identity, TlsContext, TLS_HANDSHAKE_TIMEOUT};
pub use tracker::{ApiCallback, RequestTracker};
