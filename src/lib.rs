//! # webserial-bridge
//!
//! Bridges a logical serial-port abstraction to a local companion process
//! that owns the real devices.
//!
//! ## Architecture
//!
//! - **Control Plane** (companion stdio): JSON lines for handshake, port
//!   enumeration, and authorization grants
//! - **Data Plane** (local TCP, length-prefixed frames): binary protocol
//!   for opening, configuring, and exchanging bytes with one port
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use webserial_bridge::{HostSocketFactory, PortSession, SerialOptions};
//!
//! #[tokio::main]
//! async fn main() -> webserial_bridge::Result<()> {
//!     let factory = Arc::new(HostSocketFactory::new(host_session));
//!     let session = PortSession::new(descriptor, factory);
//!     session.open(&SerialOptions { baud_rate: 115200, ..Default::default() }).await?;
//!
//!     let source = session.source().await.unwrap();
//!     while let Some(chunk) = source.read().await {
//!         println!("{chunk:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod bridge;
pub mod broker;
pub mod descriptor;
pub mod error;
pub mod filter;
pub mod port;
pub mod protocol;
pub mod stream;
pub mod transport;

pub use bridge::{BridgeContext, BridgeRequest, PortChooser, SerialBridge};
pub use broker::{CallBroker, CallOutcome};
pub use descriptor::{PortDescriptor, TransportKind};
pub use error::{BridgeError, Result};
pub use port::{PortSession, SerialOptions, SignalPatch};
pub use stream::{ByteSink, ByteSource};
pub use transport::{HandshakeState, HostSession, HostSocketFactory, SerialSocket};
