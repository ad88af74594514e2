//! Per-origin port authorization.
//!
//! Grants are durable (an [`AuthStore`] implementation persists which
//! origins may see which ports); auth keys are not. A key is minted by the
//! companion per connection and cached only for the companion's lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::descriptor::PortDescriptor;
use crate::error::Result;

/// What an origin was granted for one port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAuthEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Grants held by one origin, keyed by port id.
pub type OriginAuth = HashMap<String, PortAuthEntry>;

/// Durable record of which origins may use which ports.
#[async_trait]
pub trait AuthStore: Send + Sync {
    async fn read(&self, origin: &str) -> Result<OriginAuth>;
    async fn grant(&self, origin: &str, port: &PortDescriptor) -> Result<()>;
    async fn revoke(&self, origin: &str, port_id: &str) -> Result<()>;
}

/// In-memory store, for embedding hosts and tests.
#[derive(Default)]
pub struct MemoryAuthStore {
    origins: Mutex<HashMap<String, OriginAuth>>,
}

impl MemoryAuthStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthStore for MemoryAuthStore {
    async fn read(&self, origin: &str) -> Result<OriginAuth> {
        Ok(self
            .origins
            .lock()
            .expect("auth store lock poisoned")
            .get(origin)
            .cloned()
            .unwrap_or_default())
    }

    async fn grant(&self, origin: &str, port: &PortDescriptor) -> Result<()> {
        let entry = PortAuthEntry {
            name: port.name.clone(),
            description: port.description.clone(),
        };
        self.origins
            .lock()
            .expect("auth store lock poisoned")
            .entry(origin.to_string())
            .or_default()
            .insert(port.id.clone(), entry);
        Ok(())
    }

    async fn revoke(&self, origin: &str, port_id: &str) -> Result<()> {
        let mut origins = self.origins.lock().expect("auth store lock poisoned");
        if let Some(ports) = origins.get_mut(origin) {
            ports.remove(port_id);
            if ports.is_empty() {
                origins.remove(origin);
            }
        }
        Ok(())
    }
}

/// Session-scoped cache of companion-minted auth keys, keyed by port id.
#[derive(Clone, Default)]
pub struct AuthKeyCache {
    keys: Arc<Mutex<HashMap<String, String>>>,
}

impl AuthKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, port_id: &str) -> Option<String> {
        self.keys
            .lock()
            .expect("auth cache lock poisoned")
            .get(port_id)
            .cloned()
    }

    pub fn insert(&self, port_id: &str, key: String) {
        self.keys
            .lock()
            .expect("auth cache lock poisoned")
            .insert(port_id.to_string(), key);
    }

    pub fn remove(&self, port_id: &str) {
        self.keys
            .lock()
            .expect("auth cache lock poisoned")
            .remove(port_id);
    }

    /// Drop every cached key. Keys from a previous companion process are
    /// worthless to a new one.
    pub fn clear(&self) {
        self.keys.lock().expect("auth cache lock poisoned").clear();
    }
}
