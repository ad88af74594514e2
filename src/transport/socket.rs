//! Data-plane socket to a single serial port.
//!
//! Each opened port gets its own framed TCP connection to the companion on
//! 127.0.0.1. Commands are strictly single-flight: exactly one request may
//! be awaiting its acknowledgement at a time, enforced by holding a lock
//! across the whole exchange. Unsolicited DATA frames bypass the pending
//! slot and go straight to the registered feed callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};

use crate::error::{BridgeError, Result};
use crate::protocol::{self, encode_frame, FrameBuffer, InboundFrame};

/// How long a command may wait for its acknowledgement.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(5000);

type CommandReply = std::result::Result<Bytes, (u8, String)>;
type FeedFn = Box<dyn Fn(Bytes) + Send + Sync>;

struct Shared {
    pending: std::sync::Mutex<Option<oneshot::Sender<CommandReply>>>,
    feed: std::sync::Mutex<Option<FeedFn>>,
    connected: AtomicBool,
    disconnect_tx: watch::Sender<bool>,
    // Keeps the channel open when no session is subscribed yet.
    _disconnect_rx: watch::Receiver<bool>,
}

impl Shared {
    fn new() -> Self {
        let (disconnect_tx, disconnect_rx) = watch::channel(false);
        Self {
            pending: std::sync::Mutex::new(None),
            feed: std::sync::Mutex::new(None),
            connected: AtomicBool::new(true),
            disconnect_tx,
            _disconnect_rx: disconnect_rx,
        }
    }

    /// Idempotent transition into the disconnected state.
    fn begin_disconnect(&self, reason: &str) {
        if self.connected.swap(false, Ordering::AcqRel) {
            tracing::debug!(reason, "serial socket disconnected");
            if let Some(tx) = self.pending.lock().expect("pending lock poisoned").take() {
                let _ = tx.send(Err((0, "connection closed".to_string())));
            }
            *self.feed.lock().expect("feed lock poisoned") = None;
            let _ = self.disconnect_tx.send(true);
        }
    }
}

/// Framed command/data channel for one port.
pub struct SerialSocket {
    shared: Arc<Shared>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    flight: Mutex<()>,
    response_timeout: Duration,
}

impl SerialSocket {
    /// Connect to the companion's data-plane listener.
    pub async fn connect(port: u16) -> Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        Ok(Self::from_split(tokio::io::split(stream)))
    }

    /// Build a socket over an arbitrary duplex stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::from_split(tokio::io::split(stream))
    }

    fn from_split<R, W>((reader, writer): (R, W)) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared::new());
        tokio::spawn(read_loop(reader, shared.clone()));
        Self {
            shared,
            writer: Mutex::new(Box::new(writer)),
            flight: Mutex::new(()),
            response_timeout: RESPONSE_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Watch channel that flips to `true` exactly once, on disconnect.
    pub fn disconnected(&self) -> watch::Receiver<bool> {
        self.shared.disconnect_tx.subscribe()
    }

    /// Route unsolicited DATA payloads to `feed`.
    pub fn set_source_feed(&self, feed: impl Fn(Bytes) + Send + Sync + 'static) {
        *self.shared.feed.lock().expect("feed lock poisoned") = Some(Box::new(feed));
    }

    pub fn clear_source_feed(&self) {
        *self.shared.feed.lock().expect("feed lock poisoned") = None;
    }

    /// Send one command frame and wait for its acknowledgement.
    ///
    /// Commands serialize behind the flight lock; a second caller blocks
    /// until the first exchange completes or times out.
    pub async fn send(&self, frame: Bytes) -> Result<Bytes> {
        let _flight = self.flight.lock().await;
        if !self.is_connected() {
            return Err(BridgeError::ConnectionClosed);
        }

        let (tx, rx) = oneshot::channel();
        *self
            .shared
            .pending
            .lock()
            .expect("pending lock poisoned") = Some(tx);

        if let Err(err) = self.write_frame(&frame).await {
            self.shared
                .pending
                .lock()
                .expect("pending lock poisoned")
                .take();
            return Err(err);
        }

        match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(Ok(payload))) => Ok(payload),
            Ok(Ok(Err((code, message)))) => {
                if code == 0 {
                    Err(BridgeError::ConnectionClosed)
                } else {
                    Err(BridgeError::RemoteDevice { code, message })
                }
            }
            Ok(Err(_)) => Err(BridgeError::ConnectionClosed),
            Err(_) => {
                self.shared
                    .pending
                    .lock()
                    .expect("pending lock poisoned")
                    .take();
                Err(BridgeError::Timeout("serial command".to_string()))
            }
        }
    }

    /// Ship outbound bytes as a DATA frame. Like any other command, DATA is
    /// acknowledged and serializes behind the flight lock.
    pub async fn send_data(&self, payload: &[u8]) -> Result<()> {
        self.send(protocol::data(payload)).await?;
        Ok(())
    }

    async fn write_frame(&self, body: &Bytes) -> Result<()> {
        let framed = encode_frame(body);
        let mut writer = self.writer.lock().await;
        if let Err(err) = async {
            writer.write_all(&framed).await?;
            writer.flush().await
        }
        .await
        {
            self.shared.begin_disconnect("write failed");
            return Err(err.into());
        }
        Ok(())
    }

    /// Tear the connection down. Safe to call more than once.
    pub async fn disconnect(&self) {
        self.shared.begin_disconnect("local disconnect");
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut frames = FrameBuffer::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(%err, "serial socket read failed");
                break;
            }
        };
        let bodies = match frames.push(&chunk[..n]) {
            Ok(bodies) => bodies,
            Err(err) => {
                tracing::warn!(%err, "malformed frame from companion");
                break;
            }
        };
        for body in bodies {
            route_frame(&shared, body);
        }
    }
    shared.begin_disconnect("stream ended");
}

fn route_frame(shared: &Shared, body: Bytes) {
    let frame = match protocol::classify(body) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(%err, "unclassifiable frame");
            return;
        }
    };
    match frame {
        InboundFrame::Data(payload) => {
            let feed = shared.feed.lock().expect("feed lock poisoned");
            match feed.as_ref() {
                Some(feed) => feed(payload),
                None => tracing::trace!(len = payload.len(), "data frame with no reader"),
            }
        }
        InboundFrame::Ack(payload) => {
            let pending = shared
                .pending
                .lock()
                .expect("pending lock poisoned")
                .take();
            match pending {
                Some(tx) => {
                    let _ = tx.send(Ok(payload));
                }
                None => tracing::debug!("acknowledgement with no command in flight"),
            }
        }
        InboundFrame::Error { code, message } => {
            let pending = shared
                .pending
                .lock()
                .expect("pending lock poisoned")
                .take();
            match pending {
                // An error answers the in-flight command.
                Some(tx) => {
                    let _ = tx.send(Err((code, message)));
                }
                // An unsolicited error means the device side is gone.
                None => shared.begin_disconnect("unsolicited device error"),
            }
        }
    }
}
