//! Outbound byte sink forwarding writes as DATA frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{BridgeError, Result};
use crate::transport::SerialSocket;

type Teardown = Box<dyn FnOnce() + Send>;

/// Writable end of a port's outbound byte stream.
///
/// The first write failure latches the sink closed; later writes fail fast
/// without touching the socket.
pub struct ByteSink {
    socket: Arc<SerialSocket>,
    closed: AtomicBool,
    teardown: Mutex<Option<Teardown>>,
}

impl ByteSink {
    pub fn new(socket: Arc<SerialSocket>) -> Self {
        Self {
            socket,
            closed: AtomicBool::new(false),
            teardown: Mutex::new(None),
        }
    }

    /// Register the hook run exactly once when the sink shuts down.
    pub fn set_teardown(&self, teardown: impl FnOnce() + Send + 'static) {
        *self.teardown.lock().expect("sink lock poisoned") = Some(Box::new(teardown));
    }

    /// Forward bytes to the device as a DATA frame.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::ConnectionClosed);
        }
        if let Err(err) = self.socket.send_data(bytes).await {
            self.shut_down();
            return Err(err);
        }
        Ok(())
    }

    /// Wait until the device has transmitted everything written so far.
    pub async fn flush(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BridgeError::ConnectionClosed);
        }
        if let Err(err) = self.socket.send(crate::protocol::drain()).await {
            self.shut_down();
            return Err(err);
        }
        Ok(())
    }

    /// Stop the sink. Safe to call more than once.
    pub fn abort(&self) {
        self.shut_down();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn shut_down(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Some(teardown) = self.teardown.lock().expect("sink lock poisoned").take() {
                teardown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::opcode;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_write_emits_data_frame_and_awaits_ack() {
        let (local, mut remote) = tokio::io::duplex(256);
        let sink = ByteSink::new(Arc::new(SerialSocket::from_stream(local)));

        let server = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let n = remote.read(&mut buf).await.unwrap();
            assert_eq!(n, 9);
            assert_eq!(&buf[..4], &5u32.to_le_bytes());
            assert_eq!(buf[4], opcode::DATA);
            // Reserved drain flag stays zero on every write.
            assert_eq!(buf[5], 0);
            assert_eq!(&buf[6..9], b"xyz");
            let ack = crate::protocol::encode_frame(&bytes::Bytes::from_static(&[opcode::OK]));
            remote.write_all(&ack).await.unwrap();
            remote
        });

        sink.write(b"xyz").await.unwrap();
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_write_after_abort_fails_fast() {
        let (local, _remote) = tokio::io::duplex(256);
        let sink = ByteSink::new(Arc::new(SerialSocket::from_stream(local)));

        sink.abort();
        assert!(sink.is_closed());
        assert!(matches!(
            sink.write(b"no").await,
            Err(BridgeError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_failed_write_latches_closed() {
        let (local, _remote) = tokio::io::duplex(256);
        let socket = Arc::new(SerialSocket::from_stream(local));
        socket.disconnect().await;

        let sink = ByteSink::new(socket);
        assert!(sink.write(b"dead").await.is_err());
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_teardown_runs_exactly_once() {
        let (local, _remote) = tokio::io::duplex(256);
        let sink = ByteSink::new(Arc::new(SerialSocket::from_stream(local)));

        let count = Arc::new(AtomicUsize::new(0));
        let hits = count.clone();
        sink.set_teardown(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        sink.abort();
        sink.abort();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
