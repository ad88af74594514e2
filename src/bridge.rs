//! Caller-facing control surface.
//!
//! [`SerialBridge`] implements the operations exposed to embedding
//! collaborators (a page-facing script, a chooser UI): enumerating
//! authorized ports, the request-port grant flow, and broker keep-alive /
//! completion plumbing for the human-interactive chooser call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::{AuthKeyCache, AuthStore};
use crate::broker::{CallBroker, CallOutcome, DEFAULT_CALL_TIMEOUT};
use crate::descriptor::PortDescriptor;
use crate::error::{BridgeError, Result};
use crate::filter::{matches_any, validate_filters, RequestOptions};
use crate::transport::HostSession;

/// Shared collaborators of one bridge instance.
pub struct BridgeContext {
    pub broker: CallBroker,
    pub host: Arc<HostSession>,
    pub auth_keys: AuthKeyCache,
}

/// Presents the port chooser to the user.
///
/// The implementation opens whatever UI the embedding provides and later
/// completes the broker call identified by `call_id` with the chosen
/// descriptor (resolve) or a refusal (reject).
#[async_trait]
pub trait PortChooser: Send + Sync {
    async fn open(&self, call_id: Uuid, origin: &str, options: &RequestOptions) -> Result<()>;
}

/// The control surface itself.
pub struct SerialBridge {
    ctx: BridgeContext,
    store: Arc<dyn AuthStore>,
    chooser: Arc<dyn PortChooser>,
}

impl SerialBridge {
    pub fn new(ctx: BridgeContext, store: Arc<dyn AuthStore>, chooser: Arc<dyn PortChooser>) -> Self {
        Self { ctx, store, chooser }
    }

    /// Ports this origin already holds grants for, each annotated with a
    /// fresh auth key.
    ///
    /// An origin with no grants gets an empty list without waking the
    /// companion.
    pub async fn get_ports(&self, origin: &str) -> Result<Vec<PortDescriptor>> {
        let auth = self.store.read(origin).await?;
        if auth.is_empty() {
            return Ok(Vec::new());
        }
        let ports = self.ctx.host.list_ports().await?;
        let mut granted = Vec::new();
        for mut port in ports {
            if !auth.contains_key(&port.id) {
                continue;
            }
            port.is_paired = true;
            port.auth_key = Some(self.auth_key_for(&port).await?);
            granted.push(port);
        }
        Ok(granted)
    }

    /// Run the chooser flow: the user picks one port, the grant is
    /// persisted, and the descriptor comes back keyed for opening.
    pub async fn request_port(
        &self,
        origin: &str,
        options: &RequestOptions,
    ) -> Result<PortDescriptor> {
        validate_filters(&options.filters)?;

        let (call_id, handle) = self.ctx.broker.register(Some(DEFAULT_CALL_TIMEOUT));
        self.chooser.open(call_id, origin, options).await?;

        let mut port: PortDescriptor = match handle.wait().await {
            CallOutcome::Resolved(value) => serde_json::from_value(value)?,
            CallOutcome::TimedOut => {
                return Err(BridgeError::Timeout("port chooser".to_string()))
            }
            CallOutcome::Failed(reason) => return Err(BridgeError::CallFailed(reason)),
        };

        self.store.grant(origin, &port).await?;
        port.is_paired = true;
        port.auth_key = Some(self.auth_key_for(&port).await?);
        Ok(port)
    }

    /// Every visible port, flagged with whether this origin holds a grant.
    /// Consumed by the chooser UI.
    pub async fn list_available_ports(
        &self,
        origin: &str,
        options: &RequestOptions,
    ) -> Result<Vec<PortDescriptor>> {
        validate_filters(&options.filters)?;
        let auth = self.store.read(origin).await?;
        let mut ports = self.ctx.host.list_ports().await?;
        ports.retain(|port| matches_any(&options.filters, port));
        for port in &mut ports {
            port.is_paired = auth.contains_key(&port.id);
        }
        Ok(ports)
    }

    /// Withdraw an origin's grant for one port.
    pub async fn revoke_port(&self, origin: &str, port_id: &str) -> Result<()> {
        let auth = self.store.read(origin).await?;
        if !auth.contains_key(port_id) {
            return Err(BridgeError::Authorization(format!(
                "origin {origin} holds no grant for port {port_id}"
            )));
        }
        self.store.revoke(origin, port_id).await?;
        self.ctx.auth_keys.remove(port_id);
        // The companion may already be gone; its grant dies with it anyway.
        if let Err(err) = self.ctx.host.auth_revoke(port_id).await {
            tracing::debug!(%err, port_id, "companion-side revoke failed");
        }
        Ok(())
    }

    /// Drop every cached auth key.
    pub fn clear_auth_key_cache(&self) {
        self.ctx.auth_keys.clear();
    }

    /// Cached companion key for a port, minting one on first use.
    ///
    /// The companion grants keys by port name; the cache is keyed by the
    /// stable port id.
    async fn auth_key_for(&self, port: &PortDescriptor) -> Result<String> {
        if let Some(key) = self.ctx.auth_keys.get(&port.id) {
            return Ok(key);
        }
        let key = self.ctx.host.auth_grant(&port.name).await?;
        self.ctx.auth_keys.insert(&port.id, key.clone());
        Ok(key)
    }

    /// Handle one decoded request from an embedding collaborator.
    pub async fn dispatch(&self, request: BridgeRequest) -> Result<serde_json::Value> {
        match request {
            BridgeRequest::GetPorts { origin } => {
                Ok(serde_json::to_value(self.get_ports(&origin).await?)?)
            }
            BridgeRequest::RequestPort { origin, options } => {
                Ok(serde_json::to_value(self.request_port(&origin, &options).await?)?)
            }
            BridgeRequest::ListAvailablePorts { origin, options } => Ok(serde_json::to_value(
                self.list_available_ports(&origin, &options).await?,
            )?),
            BridgeRequest::RevokePort { origin, port_id } => {
                self.revoke_port(&origin, &port_id).await?;
                Ok(serde_json::Value::Null)
            }
            BridgeRequest::ClearAuthKeyCache => {
                self.clear_auth_key_cache();
                Ok(serde_json::Value::Null)
            }
            BridgeRequest::ExtendCall { id, timeout_ms } => {
                self.ctx
                    .broker
                    .extend(id, Duration::from_millis(timeout_ms));
                Ok(serde_json::Value::Null)
            }
            BridgeRequest::ResolveCall { id, value } => {
                self.ctx.broker.resolve(id, value);
                Ok(serde_json::Value::Null)
            }
            BridgeRequest::RejectCall { id, reason } => {
                self.ctx.broker.reject(id, reason);
                Ok(serde_json::Value::Null)
            }
        }
    }
}

/// Requests accepted by [`SerialBridge::dispatch`], tagged by action.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum BridgeRequest {
    #[serde(rename_all = "camelCase")]
    GetPorts { origin: String },
    #[serde(rename_all = "camelCase")]
    RequestPort {
        origin: String,
        #[serde(default)]
        options: RequestOptions,
    },
    #[serde(rename_all = "camelCase")]
    ListAvailablePorts {
        origin: String,
        #[serde(default)]
        options: RequestOptions,
    },
    #[serde(rename_all = "camelCase")]
    RevokePort { origin: String, port_id: String },
    ClearAuthKeyCache,
    #[serde(rename_all = "camelCase")]
    ExtendCall { id: Uuid, timeout_ms: u64 },
    #[serde(rename_all = "camelCase")]
    ResolveCall {
        id: Uuid,
        #[serde(default)]
        value: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    RejectCall { id: Uuid, reason: String },
}

/// Decode a request line, mapping unknown actions onto a protocol error.
pub fn parse_request(raw: &str) -> Result<BridgeRequest> {
    serde_json::from_str(raw)
        .map_err(|err| BridgeError::Protocol(format!("unsupported request: {err}")))
}
