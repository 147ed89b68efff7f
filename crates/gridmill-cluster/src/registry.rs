use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use gridmill_core::types::{ClusterName, ServerName};

use crate::client::{ClientHandle, ServerPort};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("server {server} already registered in cluster {cluster}")]
    DuplicateServer {
        cluster: ClusterName,
        server: ServerName,
    },
}

/// Registry surface consumed by a server coordinator: announce yourself under
/// a unique name, enumerate the cluster's clients.
pub trait ClusterRegistry<T>: Send + Sync {
    fn register_server(
        &self,
        cluster: &ClusterName,
        server: Arc<dyn ServerPort<T>>,
    ) -> Result<(), RegistryError>;

    fn clients(&self, cluster: &ClusterName) -> Vec<ClientHandle<T>>;
}

struct ClusterEntry<T> {
    servers: HashMap<ServerName, Arc<dyn ServerPort<T>>>,
    clients: Vec<ClientHandle<T>>,
}

impl<T> ClusterEntry<T> {
    fn new() -> Self {
        Self {
            servers: HashMap::new(),
            clients: Vec::new(),
        }
    }
}

/// Process-local registry backing a single-host cluster. Clients register
/// themselves through `register_client`; the `ClusterRegistry` impl is the
/// server-side surface.
pub struct MemoryRegistry<T> {
    clusters: Mutex<HashMap<ClusterName, ClusterEntry<T>>>,
}

impl<T> MemoryRegistry<T> {
    pub fn new() -> Self {
        Self {
            clusters: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_client(&self, cluster: &ClusterName, client: ClientHandle<T>) {
        let mut guard = self.lock();
        guard
            .entry(cluster.clone())
            .or_insert_with(ClusterEntry::new)
            .clients
            .push(client);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ClusterName, ClusterEntry<T>>> {
        self.clusters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<T> Default for MemoryRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ClusterRegistry<T> for MemoryRegistry<T>
where
    T: Send + Sync,
{
    fn register_server(
        &self,
        cluster: &ClusterName,
        server: Arc<dyn ServerPort<T>>,
    ) -> Result<(), RegistryError> {
        let mut guard = self.lock();
        let entry = guard
            .entry(cluster.clone())
            .or_insert_with(ClusterEntry::new);
        let name = server.server_name().clone();
        if entry.servers.contains_key(&name) {
            return Err(RegistryError::DuplicateServer {
                cluster: cluster.clone(),
                server: name,
            });
        }
        entry.servers.insert(name, server);
        Ok(())
    }

    fn clients(&self, cluster: &ClusterName) -> Vec<ClientHandle<T>> {
        self.lock()
            .get(cluster)
            .map(|entry| entry.clients.clone())
            .unwrap_or_default()
    }
}
