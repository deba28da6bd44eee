//! TOML configuration surface for the fabric.
//!
//! ```toml
//! identity = "alpha"
//! listen = ["5665"]
//! timer_interval_ms = 5000
//!
//! [tls]
//! cert_file = "/etc/vigil/alpha.crt"
//! key_file = "/etc/vigil/alpha.key"
//! ca_file = "/etc/vigil/ca.crt"
//!
//! [[endpoint]]
//! name = "beta"
//! node = "beta-host"
//! service = "5665"
//! ```
//!
//! Declared endpoints are re-materialized into the registry on every
//! manager construction; nothing is persisted by the core.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{FabricError, FabricResult};

fn default_timer_interval_ms() -> u64 {
    5000
}

/// Paths to the PEM material for the manager's TLS context.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsFilesConfig {
    /// Certificate chain presented to peers.
    pub cert_file: PathBuf,
    /// Private key for the chain.
    pub key_file: PathBuf,
    /// Trust roots that sign peer certificates.
    pub ca_file: PathBuf,
}

/// A statically declared endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint name; must match the peer certificate CN for remote
    /// endpoints.
    pub name: String,
    /// Host to dial for reconnection.
    #[serde(default)]
    pub node: Option<String>,
    /// Port to dial for reconnection.
    #[serde(default)]
    pub service: Option<String>,
    /// Whether the endpoint is local (may receive forwarded messages
    /// from non-local senders).
    #[serde(default)]
    pub local: bool,
}

/// Manager configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FabricConfig {
    /// This manager's name; also the CN peers see in our certificate.
    pub identity: String,
    /// Ports to listen on.
    #[serde(default)]
    pub listen: Vec<String>,
    /// TLS material. Listening and dialing require it.
    #[serde(default)]
    pub tls: Option<TlsFilesConfig>,
    /// Statically declared endpoints.
    #[serde(default, rename = "endpoint")]
    pub endpoints: Vec<EndpointConfig>,
    /// Period of the sweep/aggregation/reconnect timers.
    #[serde(default = "default_timer_interval_ms")]
    pub timer_interval_ms: u64,
}

impl FabricConfig {
    /// Parse a configuration from a TOML string.
    pub fn from_toml(contents: &str) -> FabricResult<Self> {
        toml::from_str(contents).map_err(|e| FabricError::Config(format!("Bad config: {e}")))
    }

    /// Load a configuration file.
    pub fn from_path(path: &Path) -> FabricResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            FabricError::Config(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&contents)
    }
}
