//! Control-plane session with the companion process.
//!
//! The companion speaks newline-delimited JSON over its stdio-style duplex
//! channel. Requests carry a broker-issued id; the read loop routes each
//! response line back through the [`CallBroker`]. A version ping doubles as
//! the handshake: it proves the companion is installed, speaks a compatible
//! protocol, and tells us which local TCP port carries the data plane.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::auth::AuthKeyCache;
use crate::broker::{CallBroker, CallOutcome};
use crate::descriptor::PortDescriptor;
use crate::error::{BridgeError, Result};

/// Control-plane protocol version this build requires of the companion.
pub const PROTOCOL_VERSION: u32 = 1;

/// Actions understood by the companion's control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HostAction {
    Ping,
    ListPorts,
    AuthGrant,
    AuthRevoke,
}

/// One request line sent to the companion.
#[derive(Debug, Serialize, Deserialize)]
pub struct HostRequest {
    pub action: HostAction,
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}

/// One response line read from the companion.
#[derive(Debug, Default, Deserialize)]
pub struct HostResponse {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<i64>,
}

/// Payload of a successful ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloInfo {
    pub version: String,
    pub protocol: u32,
    pub socket_port: u16,
}

/// Where the companion connection currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    /// No handshake attempted yet, or one is in flight.
    Checking,
    /// The platform reported no such companion application.
    NotInstalled,
    /// The connection attempt failed for another reason.
    Error(String),
    /// The companion answered but speaks an incompatible protocol.
    Outdated,
    /// Handshake succeeded.
    Connected {
        version: String,
        protocol: u32,
        socket_port: u16,
    },
}

/// Opens the raw duplex channel to the companion process.
///
/// Production code launches the native process; tests hand back the ends
/// of an in-memory duplex.
#[async_trait]
pub trait HostConnector: Send + Sync {
    async fn connect(
        &self,
    ) -> Result<(
        Box<dyn AsyncRead + Send + Unpin>,
        Box<dyn AsyncWrite + Send + Unpin>,
    )>;
}

struct Link {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    alive: Arc<AtomicBool>,
}

/// Lazily-connected control-plane session.
///
/// `ensure_connected` is safe to call concurrently; callers coalesce on a
/// single connection attempt. A dead link is detected on the next call and
/// reconnected transparently.
pub struct HostSession {
    broker: CallBroker,
    connector: Box<dyn HostConnector>,
    auth_keys: AuthKeyCache,
    link: Mutex<Option<Link>>,
    state: Arc<std::sync::Mutex<HandshakeState>>,
}

impl HostSession {
    pub fn new(
        broker: CallBroker,
        connector: Box<dyn HostConnector>,
        auth_keys: AuthKeyCache,
    ) -> Self {
        Self {
            broker,
            connector,
            auth_keys,
            link: Mutex::new(None),
            state: Arc::new(std::sync::Mutex::new(HandshakeState::Checking)),
        }
    }

    /// Current handshake state, without blocking.
    pub fn state(&self) -> HandshakeState {
        self.state.lock().expect("state lock poisoned").clone()
    }

    fn set_state(&self, next: HandshakeState) {
        *self.state.lock().expect("state lock poisoned") = next;
    }

    /// Resolve the companion's version ping.
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<HelloInfo> {
        let mut link = self.link.lock().await;
        if let Some(active) = link.as_ref() {
            if active.alive.load(Ordering::Acquire) {
                if let HandshakeState::Connected {
                    version,
                    protocol,
                    socket_port,
                } = self.state()
                {
                    return Ok(HelloInfo {
                        version,
                        protocol,
                        socket_port,
                    });
                }
            }
            *link = None;
        }

        self.set_state(HandshakeState::Checking);
        // A fresh companion process knows nothing of previous grants.
        self.auth_keys.clear();

        let (reader, writer) = match self.connector.connect().await {
            Ok(pair) => pair,
            Err(err) => {
                let state = classify_disconnect(&err.to_string());
                self.set_state(state);
                return Err(err);
            }
        };

        let alive = Arc::new(AtomicBool::new(true));
        self.spawn_read_loop(reader, alive.clone());
        let mut active = Link { writer, alive };

        let hello = match self.ping(&mut active).await {
            Ok(hello) => hello,
            Err(err) => {
                self.set_state(classify_disconnect(&err.to_string()));
                return Err(err);
            }
        };

        if hello.protocol != PROTOCOL_VERSION {
            self.set_state(HandshakeState::Outdated);
            return Err(BridgeError::Protocol(format!(
                "companion protocol incompatible: expected v{}, found v{}",
                PROTOCOL_VERSION, hello.protocol
            )));
        }

        let alive = active.alive.clone();
        *link = Some(active);
        self.set_state(HandshakeState::Connected {
            version: hello.version.clone(),
            protocol: hello.protocol,
            socket_port: hello.socket_port,
        });
        // A link that died during the handshake must not leave Connected
        // behind; the read loop only reclassifies a Connected state, so the
        // re-check here covers a death it observed before we stored it.
        if !alive.load(Ordering::Acquire) {
            self.set_state(classify_disconnect("connection closed"));
            *link = None;
            return Err(BridgeError::ConnectionClosed);
        }
        tracing::info!(
            version = %hello.version,
            socket_port = hello.socket_port,
            "companion connected"
        );
        Ok(hello)
    }

    async fn ping(self: &Arc<Self>, link: &mut Link) -> Result<HelloInfo> {
        let (id, handle) = self.broker.register_default();
        let request = HostRequest {
            action: HostAction::Ping,
            id,
            port: None,
        };
        Self::write_request(link, &request).await?;
        // The link lock stays held until the ping completes, so no other
        // caller can interleave with an unfinished handshake.
        match handle.wait().await {
            CallOutcome::Resolved(value) => Ok(serde_json::from_value(value)?),
            CallOutcome::TimedOut => Err(BridgeError::Timeout("companion ping".to_string())),
            CallOutcome::Failed(reason) => Err(BridgeError::CallFailed(reason)),
        }
    }

    /// Issue one control-plane call and await its outcome.
    pub async fn call(
        self: &Arc<Self>,
        action: HostAction,
        port: Option<String>,
    ) -> Result<serde_json::Value> {
        self.ensure_connected().await?;

        let mut link = self.link.lock().await;
        let Some(active) = link.as_mut() else {
            return Err(BridgeError::ConnectionClosed);
        };
        let (id, handle) = self.broker.register_default();
        let request = HostRequest { action, id, port };
        if let Err(err) = Self::write_request(active, &request).await {
            active.alive.store(false, Ordering::Release);
            self.broker.reject(id, "companion write failed");
            return Err(err);
        }
        drop(link);

        match handle.wait().await {
            CallOutcome::Resolved(value) => Ok(value),
            CallOutcome::TimedOut => Err(BridgeError::Timeout(format!("{action:?} call"))),
            CallOutcome::Failed(reason) => Err(BridgeError::CallFailed(reason)),
        }
    }

    /// Enumerate the serial ports the companion can see.
    pub async fn list_ports(self: &Arc<Self>) -> Result<Vec<PortDescriptor>> {
        let value = self.call(HostAction::ListPorts, None).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Ask the companion for a per-session auth key for a port.
    pub async fn auth_grant(self: &Arc<Self>, port_id: &str) -> Result<String> {
        let value = self
            .call(HostAction::AuthGrant, Some(port_id.to_string()))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Drop the companion-side grant for a port. Best-effort.
    pub async fn auth_revoke(self: &Arc<Self>, port_id: &str) -> Result<()> {
        self.call(HostAction::AuthRevoke, Some(port_id.to_string()))
            .await?;
        Ok(())
    }

    async fn write_request(link: &mut Link, request: &HostRequest) -> Result<()> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        link.writer.write_all(&line).await?;
        link.writer.flush().await?;
        Ok(())
    }

    fn spawn_read_loop(
        self: &Arc<Self>,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        alive: Arc<AtomicBool>,
    ) {
        let broker = self.broker.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            let reason = loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let response: HostResponse = match serde_json::from_str(&line) {
                            Ok(r) => r,
                            Err(err) => {
                                tracing::warn!(%err, "unparseable companion line");
                                continue;
                            }
                        };
                        let Some(id) = response.id else {
                            tracing::debug!("companion line without call id");
                            continue;
                        };
                        if let Some(code) = response.error {
                            broker.reject(id, format!("companion error {code}"));
                        } else {
                            broker.resolve(id, response.data.unwrap_or(serde_json::Value::Null));
                        }
                    }
                    Ok(None) => break "connection closed".to_string(),
                    Err(err) => {
                        tracing::debug!(%err, "companion read loop ended");
                        break err.to_string();
                    }
                }
            };
            alive.store(false, Ordering::Release);
            // A post-handshake death reclassifies the state; an in-flight
            // handshake owns the state until it resolves.
            let mut current = state.lock().expect("state lock poisoned");
            if matches!(*current, HandshakeState::Connected { .. }) {
                *current = classify_disconnect(&reason);
            }
        });
    }
}

/// Map a connection failure message onto a handshake state.
///
/// Platform launchers word "no such application" differently, so this
/// matches the known phrasings.
pub fn classify_disconnect(text: &str) -> HandshakeState {
    let lower = text.to_lowercase();
    if lower.contains("no such native application")
        || lower.contains("not installed")
        || lower.contains("not found")
    {
        HandshakeState::NotInstalled
    } else {
        HandshakeState::Error(text.to_string())
    }
}
