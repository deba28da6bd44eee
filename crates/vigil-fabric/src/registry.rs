//! Endpoint registry — the manager-wide index from name to endpoint.
//!
//! Mutation is serialized behind one lock; iteration hands out a
//! snapshot of shared references so routing never races inserts.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use tracing::debug;

use crate::endpoint::Endpoint;
use crate::manager::EndpointManager;

/// Thread-safe mapping from endpoint name to endpoint.
pub struct EndpointRegistry {
    manager: Weak<EndpointManager>,
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
}

impl EndpointRegistry {
    pub(crate) fn new(manager: Weak<EndpointManager>) -> Self {
        Self {
            manager,
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Exact lookup by name.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<Endpoint>> {
        let endpoints = self.endpoints.read().unwrap_or_else(|e| e.into_inner());
        endpoints.get(name).cloned()
    }

    /// Look up `name`, creating the endpoint if it does not exist yet.
    ///
    /// The check and insert happen under one write lock, so two
    /// concurrent calls for the same name observe a single endpoint.
    /// For an existing endpoint the `replicated` and `local` arguments
    /// are ignored — those flags are fixed at creation.
    pub fn make_or_get(&self, name: &str, replicated: bool, local: bool) -> Arc<Endpoint> {
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = endpoints.get(name) {
            return Arc::clone(existing);
        }
        debug!(endpoint = %name, local, "Creating endpoint");
        let endpoint = Arc::new(Endpoint::new(name, replicated, local, self.manager.clone()));
        endpoints.insert(name.to_string(), Arc::clone(&endpoint));
        endpoint
    }

    /// Remove an endpoint. Its stream, if any, is torn down.
    pub fn unregister(&self, name: &str) -> Option<Arc<Endpoint>> {
        let removed = {
            let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
            endpoints.remove(name)
        };
        if let Some(endpoint) = &removed {
            endpoint.clear_stream();
            debug!(endpoint = %name, "Unregistered endpoint");
        }
        removed
    }

    /// Snapshot of every registered endpoint.
    pub fn all_endpoints(&self) -> Vec<Arc<Endpoint>> {
        let endpoints = self.endpoints.read().unwrap_or_else(|e| e.into_inner());
        endpoints.values().cloned().collect()
    }

    /// Number of registered endpoints.
    pub fn len(&self) -> usize {
        let endpoints = self.endpoints.read().unwrap_or_else(|e| e.into_inner());
        endpoints.len()
    }

    /// True if no endpoints are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
