//! Authenticated admin client cache
//!
//! One client per admin hostname, shared by every environment that talks to
//! the same endpoint. The host process owns the cache and passes it into
//! each provisioning and finalization call. Entries live until released.

use crate::error::Result;
use crate::oauth::OAuthClient;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Cache of OAuth clients keyed by admin hostname
pub type AdminClientCache = ClientCache<OAuthClient>;

/// Map of hostname to shared client, guarded by one reader/writer lock
#[derive(Debug)]
pub struct ClientCache<C> {
    clients: RwLock<HashMap<String, Arc<C>>>,
}

impl<C> ClientCache<C> {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Client cached for `hostname`
    pub fn get(&self, hostname: &str) -> Option<Arc<C>> {
        self.clients.read().get(hostname).cloned()
    }

    /// Store `client` for `hostname`, replacing any previous entry
    pub fn set(&self, hostname: impl Into<String>, client: Arc<C>) {
        let hostname = hostname.into();
        debug!(hostname = %hostname, "Caching admin client");
        self.clients.write().insert(hostname, client);
    }

    /// Remove the client for `hostname`, e.g. after credential rotation
    pub fn release(&self, hostname: &str) -> Option<Arc<C>> {
        let removed = self.clients.write().remove(hostname);
        if removed.is_some() {
            info!(hostname = %hostname, "Released cached admin client");
        }
        removed
    }

    /// Cached client for `hostname`, building it with `build` when absent.
    ///
    /// `build` runs under the write lock, so concurrent callers for the same
    /// hostname construct at most one client.
    pub fn get_or_insert_with<F>(&self, hostname: &str, build: F) -> Result<Arc<C>>
    where
        F: FnOnce() -> Result<C>,
    {
        if let Some(client) = self.get(hostname) {
            return Ok(client);
        }

        let mut clients = self.clients.write();
        if let Some(client) = clients.get(hostname) {
            return Ok(Arc::clone(client));
        }

        info!(hostname = %hostname, "Creating admin client");
        let client = Arc::new(build()?);
        clients.insert(hostname.to_string(), Arc::clone(&client));
        Ok(client)
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

impl<C> Default for ClientCache<C> {
    fn default() -> Self {
        Self::new()
    }
}
