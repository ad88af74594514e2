//! Transports: the JSON control plane to the companion process and the
//! framed data plane carrying per-port serial traffic.

mod host;
mod socket;

pub use host::{
    classify_disconnect, HandshakeState, HelloInfo, HostAction, HostConnector, HostRequest,
    HostResponse, HostSession, PROTOCOL_VERSION,
};
pub use socket::{SerialSocket, RESPONSE_TIMEOUT};

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{BridgeError, Result};

/// Produces a connected data-plane socket for a port session.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<SerialSocket>>;
}

/// Factory that reaches the data plane through a companion handshake.
pub struct HostSocketFactory {
    host: Arc<HostSession>,
}

impl HostSocketFactory {
    pub fn new(host: Arc<HostSession>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl TransportFactory for HostSocketFactory {
    async fn connect(&self) -> Result<Arc<SerialSocket>> {
        self.host.ensure_connected().await?;
        match self.host.state() {
            HandshakeState::Connected { socket_port, .. } => {
                Ok(Arc::new(SerialSocket::connect(socket_port).await?))
            }
            other => Err(BridgeError::Protocol(format!(
                "companion not connected: {other:?}"
            ))),
        }
    }
}
