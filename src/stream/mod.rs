//! Byte streams bridging device traffic to async readers and writers.
//!
//! [`ByteSource`] buffers inbound device bytes with a capacity-driven flush
//! discipline; [`ByteSink`] forwards outbound bytes as DATA frames and
//! latches the first failure.

mod sink;
mod source;

pub use sink::ByteSink;
pub use source::{ByteSource, DEFAULT_BUFFER_SIZE};
