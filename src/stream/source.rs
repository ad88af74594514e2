//! Inbound byte source with capacity-driven chunking.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;

/// Default accumulation buffer size, in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 255;

type Teardown = Box<dyn FnOnce() + Send>;

struct SourceState {
    capacity: usize,
    /// Partial chunk still accumulating toward `capacity`.
    buffer: Vec<u8>,
    /// Full chunks flushed and awaiting a reader.
    ready: VecDeque<Bytes>,
    closed: bool,
    teardown: Option<Teardown>,
}

struct Inner {
    state: Mutex<SourceState>,
    notify: Notify,
}

/// Readable end of a port's inbound byte stream.
///
/// Bytes fed faster than they are read accumulate in a buffer of fixed
/// capacity; each time the buffer fills it is flushed as one ready chunk.
/// A reader that keeps up instead drains the partial buffer directly, so a
/// slow trickle of bytes is never held hostage to the capacity.
#[derive(Clone)]
pub struct ByteSource {
    inner: Arc<Inner>,
}

impl ByteSource {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SourceState {
                    capacity: capacity.max(1),
                    buffer: Vec::with_capacity(capacity.max(1)),
                    ready: VecDeque::new(),
                    closed: false,
                    teardown: None,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Register the hook run exactly once when the source is cancelled
    /// or closed.
    pub fn set_teardown(&self, teardown: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock().expect("source lock poisoned");
        state.teardown = Some(Box::new(teardown));
    }

    /// Append device bytes. Chunks of exactly `capacity` bytes flush to the
    /// ready queue; a shorter remainder stays buffered.
    pub fn feed(&self, mut bytes: &[u8]) {
        let mut state = self.inner.state.lock().expect("source lock poisoned");
        if state.closed {
            return;
        }
        while state.buffer.len() + bytes.len() > state.capacity {
            let take = state.capacity - state.buffer.len();
            state.buffer.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            let full = std::mem::take(&mut state.buffer);
            state.ready.push_back(Bytes::from(full));
        }
        state.buffer.extend_from_slice(bytes);
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Next chunk, or `None` once the source is closed and drained.
    pub async fn read(&self) -> Option<Bytes> {
        loop {
            // Arm the waiter before inspecting state so a concurrent feed
            // cannot slip between the check and the await.
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().expect("source lock poisoned");
                if let Some(chunk) = state.ready.pop_front() {
                    return Some(chunk);
                }
                if !state.buffer.is_empty() {
                    let partial = std::mem::take(&mut state.buffer);
                    return Some(Bytes::from(partial));
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Discard everything buffered and shut the source down.
    pub fn cancel(&self) {
        let teardown = {
            let mut state = self.inner.state.lock().expect("source lock poisoned");
            state.buffer.clear();
            state.ready.clear();
            state.closed = true;
            state.teardown.take()
        };
        if let Some(teardown) = teardown {
            teardown();
        }
        self.inner.notify.notify_waiters();
    }

    /// Stop accepting new bytes but let the reader drain what is buffered.
    pub fn close(&self) {
        let teardown = {
            let mut state = self.inner.state.lock().expect("source lock poisoned");
            if state.closed {
                None
            } else {
                state.closed = true;
                state.teardown.take()
            }
        };
        if let Some(teardown) = teardown {
            teardown();
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().expect("source lock poisoned").closed
    }

    #[cfg(test)]
    fn ready_chunks(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("source lock poisoned")
            .ready
            .len()
    }

    #[cfg(test)]
    fn buffered_len(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("source lock poisoned")
            .buffer
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_capacity_overflow_flushes_full_chunk() {
        let source = ByteSource::new(4);
        source.feed(&[1, 2]);
        assert_eq!(source.ready_chunks(), 0);
        assert_eq!(source.buffered_len(), 2);

        source.feed(&[3, 4, 5]);
        assert_eq!(source.ready_chunks(), 1);
        assert_eq!(source.buffered_len(), 1);

        assert_eq!(source.read().await.unwrap(), Bytes::from_static(&[1, 2, 3, 4]));
        assert_eq!(source.read().await.unwrap(), Bytes::from_static(&[5]));
    }

    #[tokio::test]
    async fn test_large_feed_splits_into_capacity_chunks() {
        let source = ByteSource::new(3);
        source.feed(&[0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(source.ready_chunks(), 2);
        assert_eq!(source.read().await.unwrap(), Bytes::from_static(&[0, 1, 2]));
        assert_eq!(source.read().await.unwrap(), Bytes::from_static(&[3, 4, 5]));
        assert_eq!(source.read().await.unwrap(), Bytes::from_static(&[6]));
    }

    #[tokio::test]
    async fn test_read_waits_for_feed() {
        let source = ByteSource::new(16);
        let reader = source.clone();
        let pending = tokio::spawn(async move { reader.read().await });

        tokio::task::yield_now().await;
        source.feed(b"abc");

        assert_eq!(pending.await.unwrap().unwrap(), Bytes::from_static(b"abc"));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let source = ByteSource::new(16);
        source.feed(b"tail");
        source.close();

        assert_eq!(source.read().await.unwrap(), Bytes::from_static(b"tail"));
        assert_eq!(source.read().await, None);

        // A feed after close is dropped.
        source.feed(b"late");
        assert_eq!(source.read().await, None);
    }

    #[tokio::test]
    async fn test_cancel_discards_buffered_bytes() {
        let source = ByteSource::new(2);
        source.feed(&[1, 2, 3]);
        source.cancel();
        assert_eq!(source.read().await, None);
    }

    #[tokio::test]
    async fn test_teardown_runs_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let source = ByteSource::new(4);
        let hits = count.clone();
        source.set_teardown(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        source.cancel();
        source.cancel();
        source.close();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
