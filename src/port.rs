//! Port session state machine.
//!
//! A [`PortSession`] owns the lifecycle of one logical serial port:
//! `closed → opening → opened → closed`. Opening validates line options
//! before any I/O, connects a data-plane socket, then runs the
//! `PORT_OPEN` / `SET_CONFIG` / `SET_SIGNALS` sequence. A transport-initiated
//! disconnect drives the session through `close` exactly once.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::descriptor::{PortDescriptor, PortInfo};
use crate::error::{BridgeError, Result};
use crate::protocol::{self, Parity};
use crate::stream::{ByteSink, ByteSource, DEFAULT_BUFFER_SIZE};
use crate::transport::{SerialSocket, TransportFactory};

/// Line options requested for `open`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialOptions {
    pub baud_rate: u32,
    #[serde(default)]
    pub data_bits: Option<u8>,
    #[serde(default)]
    pub parity: Option<Parity>,
    #[serde(default)]
    pub stop_bits: Option<u8>,
    #[serde(default)]
    pub buffer_size: Option<usize>,
}

/// Options with defaults applied, known valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    pub buffer_size: usize,
}

impl SerialOptions {
    /// Validate and apply defaults. Runs before any I/O.
    pub fn resolve(&self) -> Result<ResolvedOptions> {
        let data_bits = self.data_bits.unwrap_or(8);
        if !matches!(data_bits, 7 | 8) {
            return Err(BridgeError::Validation(format!(
                "invalid dataBits: {data_bits} (expected 7 or 8)"
            )));
        }
        let stop_bits = self.stop_bits.unwrap_or(1);
        if !matches!(stop_bits, 1 | 2) {
            return Err(BridgeError::Validation(format!(
                "invalid stopBits: {stop_bits} (expected 1 or 2)"
            )));
        }
        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        if buffer_size == 0 {
            return Err(BridgeError::Validation(
                "bufferSize must be greater than zero".to_string(),
            ));
        }
        Ok(ResolvedOptions {
            baud_rate: self.baud_rate,
            data_bits,
            parity: self.parity.unwrap_or_default(),
            stop_bits,
            buffer_size,
        })
    }
}

/// Locally tracked output signal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSignals {
    pub data_terminal_ready: bool,
    pub request_to_send: bool,
    #[serde(rename = "break")]
    pub break_signal: bool,
}

/// Input signal state reported by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSignals {
    pub data_carrier_detect: bool,
    pub clear_to_send: bool,
    pub ring_indicator: bool,
    pub data_set_ready: bool,
}

impl InputSignals {
    /// Decode the device bitmask: CTS=1, DSR=2, DCD=4, RI=8.
    pub fn from_wire(mask: u8) -> Self {
        Self {
            clear_to_send: mask & 0x01 != 0,
            data_set_ready: mask & 0x02 != 0,
            data_carrier_detect: mask & 0x04 != 0,
            ring_indicator: mask & 0x08 != 0,
        }
    }
}

/// Requested change to output signals. Unset fields keep their value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPatch {
    #[serde(default)]
    pub data_terminal_ready: Option<bool>,
    #[serde(default)]
    pub request_to_send: Option<bool>,
    #[serde(default, rename = "break")]
    pub break_signal: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Closed,
    Opening,
    Opened,
}

struct Inner {
    phase: Phase,
    socket: Option<Arc<SerialSocket>>,
    options: Option<ResolvedOptions>,
    output_signals: OutputSignals,
    input_signals: InputSignals,
    source: Option<ByteSource>,
    sink: Option<Arc<ByteSink>>,
    /// Bumped on every open; stale disconnect watchers compare against it.
    epoch: u64,
}

/// One logical serial port and its connection lifecycle.
#[derive(Clone)]
pub struct PortSession {
    descriptor: PortDescriptor,
    factory: Arc<dyn TransportFactory>,
    inner: Arc<Mutex<Inner>>,
}

impl PortSession {
    pub fn new(descriptor: PortDescriptor, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            descriptor,
            factory,
            inner: Arc::new(Mutex::new(Inner {
                phase: Phase::Closed,
                socket: None,
                options: None,
                output_signals: OutputSignals::default(),
                input_signals: InputSignals::default(),
                source: None,
                sink: None,
                epoch: 0,
            })),
        }
    }

    pub fn descriptor(&self) -> &PortDescriptor {
        &self.descriptor
    }

    /// USB vendor/product ids, when the transport is USB.
    pub fn info(&self) -> PortInfo {
        self.descriptor.info()
    }

    pub async fn phase(&self) -> Phase {
        self.inner.lock().await.phase
    }

    /// Open the port with the given line options.
    ///
    /// An already-open session is closed first. A failure anywhere in the
    /// open sequence rolls back to fully closed and propagates the original
    /// error.
    pub async fn open(&self, options: &SerialOptions) -> Result<()> {
        let resolved = options.resolve()?;

        let mut inner = self.inner.lock().await;
        if inner.phase != Phase::Closed {
            Self::close_inner(&mut inner).await;
        }

        let auth_key = self
            .descriptor
            .auth_key
            .clone()
            .ok_or_else(|| {
                BridgeError::Authorization(format!(
                    "no authorization key for port {}",
                    self.descriptor.id
                ))
            })?;

        inner.phase = Phase::Opening;
        if let Err(err) = self.open_inner(&mut inner, &resolved, &auth_key).await {
            Self::close_inner(&mut inner).await;
            return Err(err);
        }
        inner.phase = Phase::Opened;
        tracing::info!(port = %self.descriptor.id, baud = resolved.baud_rate, "port opened");
        Ok(())
    }

    async fn open_inner(
        &self,
        inner: &mut Inner,
        options: &ResolvedOptions,
        auth_key: &str,
    ) -> Result<()> {
        let socket = self.factory.connect().await?;

        inner.epoch += 1;
        let epoch = inner.epoch;

        // One watcher per open; an epoch mismatch makes a stale watcher
        // a no-op instead of tearing down a newer session.
        let mut disconnected = socket.disconnected();
        let session = self.clone();
        tokio::spawn(async move {
            if disconnected.changed().await.is_ok() && *disconnected.borrow() {
                session.close_for_epoch(epoch).await;
            }
        });

        // Handles land in the session before the open sequence, so a send
        // failure still gives the rollback close a live socket to send the
        // best-effort teardown frames through.
        inner.socket = Some(socket.clone());
        inner.options = Some(*options);
        inner.output_signals = OutputSignals::default();
        inner.input_signals = InputSignals::default();
        inner.source = Some(self.make_source(&socket, options.buffer_size, epoch));
        inner.sink = Some(self.make_sink(&socket, epoch));

        socket.send(protocol::port_open(auth_key)).await?;
        socket
            .send(protocol::set_config(
                options.baud_rate,
                options.data_bits,
                options.parity,
                options.stop_bits,
            ))
            .await?;
        socket.send(protocol::set_signals(true, false)).await?;

        inner.output_signals = OutputSignals {
            data_terminal_ready: true,
            request_to_send: false,
            break_signal: false,
        };
        Ok(())
    }

    /// Build the inbound stream for one open, wired to the socket's DATA
    /// feed.
    fn make_source(&self, socket: &Arc<SerialSocket>, capacity: usize, epoch: u64) -> ByteSource {
        let source = ByteSource::new(capacity);
        let feed = source.clone();
        socket.set_source_feed(move |payload| feed.feed(&payload));
        let session = self.clone();
        source.set_teardown(move || {
            tokio::spawn(async move {
                session.replace_source_for_epoch(epoch).await;
            });
        });
        source
    }

    /// Build the outbound stream for one open.
    fn make_sink(&self, socket: &Arc<SerialSocket>, epoch: u64) -> Arc<ByteSink> {
        let sink = Arc::new(ByteSink::new(socket.clone()));
        let session = self.clone();
        sink.set_teardown(move || {
            tokio::spawn(async move {
                session.replace_sink_for_epoch(epoch).await;
            });
        });
        sink
    }

    /// A torn-down source on a still-open session gets a fresh replacement,
    /// so a cancelled reader does not strand the port without a stream.
    async fn replace_source_for_epoch(&self, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch || inner.phase != Phase::Opened {
            return;
        }
        let socket = inner.socket.clone().filter(|s| s.is_connected());
        inner.source = match socket {
            Some(socket) => {
                let capacity = inner
                    .options
                    .map_or(DEFAULT_BUFFER_SIZE, |o| o.buffer_size);
                Some(self.make_source(&socket, capacity, epoch))
            }
            None => None,
        };
    }

    /// A latched sink on a still-open session gets a fresh replacement,
    /// so one failed write does not strand the port without a stream.
    async fn replace_sink_for_epoch(&self, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch || inner.phase != Phase::Opened {
            return;
        }
        let socket = inner.socket.clone().filter(|s| s.is_connected());
        inner.sink = socket.map(|socket| self.make_sink(&socket, epoch));
    }

    /// Close the port. Errors if the session is already closed.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.phase == Phase::Closed && inner.socket.is_none() {
            return Err(BridgeError::Validation("port is already closed".to_string()));
        }
        Self::close_inner(&mut inner).await;
        tracing::info!(port = %self.descriptor.id, "port closed");
        Ok(())
    }

    /// Teardown shared by `close`, failed opens, and disconnect watchers.
    /// The remote side may already be gone, so the signal reset and close
    /// frames are best-effort.
    async fn close_inner(inner: &mut Inner) {
        if let Some(source) = inner.source.take() {
            source.cancel();
        }
        if let Some(sink) = inner.sink.take() {
            sink.abort();
        }
        if let Some(socket) = inner.socket.take() {
            if socket.is_connected() {
                let _ = socket.send(protocol::set_signals(false, false)).await;
                let _ = socket.send(protocol::port_close()).await;
            }
            socket.clear_source_feed();
            socket.disconnect().await;
        }
        inner.options = None;
        inner.output_signals = OutputSignals::default();
        inner.input_signals = InputSignals::default();
        inner.phase = Phase::Closed;
    }

    /// Close driven by a transport disconnect. Only acts when the epoch
    /// still matches the session that spawned the watcher.
    async fn close_for_epoch(&self, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch || inner.phase == Phase::Closed {
            return;
        }
        tracing::warn!(port = %self.descriptor.id, "transport disconnected, closing port");
        Self::close_inner(&mut inner).await;
    }

    /// Apply a partial output-signal change.
    ///
    /// `SET_SIGNALS` goes out only when DTR or RTS actually changed, and a
    /// break frame only when the break flag changed.
    pub async fn set_signals(&self, patch: SignalPatch) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.phase != Phase::Opened {
            return Err(BridgeError::Validation("port is not open".to_string()));
        }
        let socket = inner.socket.clone().ok_or(BridgeError::ConnectionClosed)?;

        let current = inner.output_signals;
        let next = OutputSignals {
            data_terminal_ready: patch
                .data_terminal_ready
                .unwrap_or(current.data_terminal_ready),
            request_to_send: patch.request_to_send.unwrap_or(current.request_to_send),
            break_signal: patch.break_signal.unwrap_or(current.break_signal),
        };

        if next.data_terminal_ready != current.data_terminal_ready
            || next.request_to_send != current.request_to_send
        {
            socket
                .send(protocol::set_signals(
                    next.data_terminal_ready,
                    next.request_to_send,
                ))
                .await?;
        }
        if next.break_signal != current.break_signal {
            let frame = if next.break_signal {
                protocol::start_break()
            } else {
                protocol::end_break()
            };
            socket.send(frame).await?;
        }

        inner.output_signals = next;
        Ok(())
    }

    /// Query the device for its current input signals.
    pub async fn refresh_signals(&self) -> Result<InputSignals> {
        let socket = {
            let inner = self.inner.lock().await;
            if inner.phase != Phase::Opened {
                return Err(BridgeError::Validation("port is not open".to_string()));
            }
            inner.socket.clone().ok_or(BridgeError::ConnectionClosed)?
        };
        let payload = socket.send(protocol::get_signals()).await?;
        let mask = *payload
            .first()
            .ok_or_else(|| BridgeError::Protocol("empty GET_SIGNALS payload".to_string()))?;
        let signals = InputSignals::from_wire(mask);
        self.inner.lock().await.input_signals = signals;
        Ok(signals)
    }

    /// Last known input signals, without touching the device.
    pub async fn input_signals(&self) -> InputSignals {
        self.inner.lock().await.input_signals
    }

    pub async fn output_signals(&self) -> OutputSignals {
        self.inner.lock().await.output_signals
    }

    pub async fn options(&self) -> Option<ResolvedOptions> {
        self.inner.lock().await.options
    }

    /// Inbound stream handle for the current open.
    pub async fn source(&self) -> Option<ByteSource> {
        self.inner.lock().await.source.clone()
    }

    /// Outbound stream handle for the current open.
    pub async fn sink(&self) -> Option<Arc<ByteSink>> {
        self.inner.lock().await.sink.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let options = SerialOptions {
            baud_rate: 9600,
            ..Default::default()
        };
        let resolved = options.resolve().unwrap();
        assert_eq!(resolved.data_bits, 8);
        assert_eq!(resolved.parity, Parity::None);
        assert_eq!(resolved.stop_bits, 1);
        assert_eq!(resolved.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn test_rejects_bad_data_bits() {
        let options = SerialOptions {
            baud_rate: 9600,
            data_bits: Some(9),
            ..Default::default()
        };
        assert!(matches!(
            options.resolve(),
            Err(BridgeError::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_bad_stop_bits() {
        let options = SerialOptions {
            baud_rate: 9600,
            stop_bits: Some(3),
            ..Default::default()
        };
        assert!(matches!(
            options.resolve(),
            Err(BridgeError::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_zero_buffer_size() {
        let options = SerialOptions {
            baud_rate: 9600,
            buffer_size: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            options.resolve(),
            Err(BridgeError::Validation(_))
        ));
    }

    #[test]
    fn test_input_signals_from_wire() {
        let signals = InputSignals::from_wire(0b0101);
        assert!(signals.clear_to_send);
        assert!(!signals.data_set_ready);
        assert!(signals.data_carrier_detect);
        assert!(!signals.ring_indicator);
    }

    #[test]
    fn test_options_deserialize_camel_case() {
        let options: SerialOptions = serde_json::from_str(
            r#"{"baudRate":115200,"dataBits":7,"parity":"even","stopBits":2}"#,
        )
        .unwrap();
        let resolved = options.resolve().unwrap();
        assert_eq!(resolved.baud_rate, 115200);
        assert_eq!(resolved.data_bits, 7);
        assert_eq!(resolved.parity, Parity::Even);
        assert_eq!(resolved.stop_bits, 2);
    }
}
