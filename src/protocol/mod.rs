//! Binary frame codec for the serial data plane.
//!
//! A frame is a one-byte opcode followed by an opcode-specific payload;
//! multi-byte integers are Little Endian. Frame bodies are delimited on the
//! socket by the length prefix handled in [`frame_buffer`].

mod frame_buffer;

pub use frame_buffer::{encode_frame, FrameBuffer, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{BridgeError, Result};

/// Opcode constants for the serial protocol.
pub mod opcode {
    /// Plain acknowledgment.
    pub const OK: u8 = 0;
    /// Open the port named by the authorization key in the payload.
    pub const PORT_OPEN: u8 = 10;
    /// Close the currently open port.
    pub const PORT_CLOSE: u8 = 11;
    /// Configure baud rate and line options.
    pub const SET_CONFIG: u8 = 20;
    /// Set DTR/RTS output signals.
    pub const SET_SIGNALS: u8 = 30;
    /// Query input signals.
    pub const GET_SIGNALS: u8 = 31;
    /// Start the break condition.
    pub const START_BREAK: u8 = 40;
    /// End the break condition.
    pub const END_BREAK: u8 = 41;
    /// Serial payload bytes.
    pub const DATA: u8 = 50;
    /// Wait until the output buffer is drained.
    pub const DRAIN: u8 = 51;
    /// Generic error; payload is a UTF-8 message.
    pub const ERROR: u8 = 128;
    /// Invalid operation.
    pub const ERR_OPCODE: u8 = 129;
    /// Unknown authorization key.
    pub const ERR_AUTH: u8 = 130;
    /// Port is already open.
    pub const ERR_IS_OPEN: u8 = 131;
    /// Port is not open.
    pub const ERR_NOT_OPEN: u8 = 132;
}

/// Parity setting, encoded as a single byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl Parity {
    /// Wire encoding: 0 = none, 1 = odd, 2 = even.
    pub fn wire(self) -> u8 {
        match self {
            Parity::None => 0,
            Parity::Odd => 1,
            Parity::Even => 2,
        }
    }

    /// Decode the wire byte back into a parity setting.
    pub fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Parity::None),
            1 => Ok(Parity::Odd),
            2 => Ok(Parity::Even),
            other => Err(BridgeError::Protocol(format!(
                "invalid parity byte: {other}"
            ))),
        }
    }
}

/// Encode a `PORT_OPEN` frame: opcode + authorization key, null-terminated.
pub fn port_open(auth_key: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(auth_key.len() + 2);
    buf.put_u8(opcode::PORT_OPEN);
    buf.put_slice(auth_key.as_bytes());
    buf.put_u8(0);
    buf.freeze()
}

/// Encode a `SET_CONFIG` frame: opcode + u32 baud + data bits + parity
/// + stop bits.
pub fn set_config(baud_rate: u32, data_bits: u8, parity: Parity, stop_bits: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u8(opcode::SET_CONFIG);
    buf.put_u32_le(baud_rate);
    buf.put_u8(data_bits);
    buf.put_u8(parity.wire());
    buf.put_u8(stop_bits);
    buf.freeze()
}

/// Encode a `SET_SIGNALS` frame: opcode + DTR + RTS.
pub fn set_signals(dtr: bool, rts: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(3);
    buf.put_u8(opcode::SET_SIGNALS);
    buf.put_u8(dtr as u8);
    buf.put_u8(rts as u8);
    buf.freeze()
}

/// Encode a `GET_SIGNALS` frame (opcode only). The acknowledgement payload
/// is a single input-signal bitmask byte.
pub fn get_signals() -> Bytes {
    Bytes::from_static(&[opcode::GET_SIGNALS])
}

/// Encode a `START_BREAK` frame (opcode only).
pub fn start_break() -> Bytes {
    Bytes::from_static(&[opcode::START_BREAK])
}

/// Encode an `END_BREAK` frame (opcode only).
pub fn end_break() -> Bytes {
    Bytes::from_static(&[opcode::END_BREAK])
}

/// Encode a `PORT_CLOSE` frame (opcode only).
pub fn port_close() -> Bytes {
    Bytes::from_static(&[opcode::PORT_CLOSE])
}

/// Encode a `DRAIN` frame (opcode only). Blocks the device side until its
/// transmit buffer is flushed.
pub fn drain() -> Bytes {
    Bytes::from_static(&[opcode::DRAIN])
}

/// Encode an outbound `DATA` frame: opcode + one reserved zero byte +
/// payload.
///
/// The reserved byte exists only in the outbound direction; inbound DATA
/// frames carry the payload immediately after the opcode. The asymmetry is
/// part of the protocol (the byte is reserved for future outbound flags)
/// and must not be unified.
pub fn data(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 2);
    buf.put_u8(opcode::DATA);
    buf.put_u8(0);
    buf.put_slice(payload);
    buf.freeze()
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Serial payload bytes, routed to the stream source.
    Data(Bytes),
    /// An error reported by the companion (opcode >= 128).
    Error { code: u8, message: String },
    /// A plain acknowledgment; remaining bytes are returned opaquely to
    /// the waiting call.
    Ack(Bytes),
}

/// Classify an inbound frame body by its opcode.
pub fn classify(mut frame: Bytes) -> Result<InboundFrame> {
    if frame.is_empty() {
        return Err(BridgeError::Protocol("empty frame".to_string()));
    }
    let op = frame[0];
    let rest = frame.split_off(1);

    if op == opcode::DATA {
        return Ok(InboundFrame::Data(rest));
    }
    if op >= opcode::ERROR {
        return Ok(InboundFrame::Error {
            code: op,
            message: error_message(op, &rest),
        });
    }
    Ok(InboundFrame::Ack(rest))
}

/// Resolve the human-readable message for an error opcode.
///
/// Codes 129-132 map to fixed strings; everything else decodes the payload
/// as UTF-8 and appends the numeric code.
fn error_message(code: u8, payload: &[u8]) -> String {
    match code {
        opcode::ERR_OPCODE => "Invalid operation".to_string(),
        opcode::ERR_AUTH => "Port not found (auth)".to_string(),
        opcode::ERR_IS_OPEN => "Port is already open".to_string(),
        opcode::ERR_NOT_OPEN => "Port is not open".to_string(),
        _ if payload.is_empty() => format!("Companion error {code}"),
        _ => format!("{} ({code})", String::from_utf8_lossy(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_open_null_terminated() {
        let frame = port_open("abc123");
        assert_eq!(frame[0], opcode::PORT_OPEN);
        assert_eq!(&frame[1..7], b"abc123");
        assert_eq!(frame[7], 0);
        assert_eq!(frame.len(), 8);
    }

    #[test]
    fn test_set_config_little_endian() {
        let frame = set_config(115200, 8, Parity::Even, 1);
        assert_eq!(frame[0], opcode::SET_CONFIG);
        // 115200 = 0x0001C200 in LE
        assert_eq!(&frame[1..5], &[0x00, 0xC2, 0x01, 0x00]);
        assert_eq!(frame[5], 8);
        assert_eq!(frame[6], 2);
        assert_eq!(frame[7], 1);
    }

    #[test]
    fn test_set_config_roundtrip() {
        let frame = set_config(115200, 8, Parity::Even, 1);
        let baud = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let parity = Parity::from_wire(frame[6]).unwrap();
        assert_eq!(
            (baud, frame[5], parity, frame[7]),
            (115200, 8, Parity::Even, 1)
        );
    }

    #[test]
    fn test_set_signals_encoding() {
        assert_eq!(&set_signals(true, false)[..], &[opcode::SET_SIGNALS, 1, 0]);
        assert_eq!(&set_signals(false, true)[..], &[opcode::SET_SIGNALS, 0, 1]);
    }

    #[test]
    fn test_opcode_only_frames() {
        assert_eq!(&start_break()[..], &[opcode::START_BREAK]);
        assert_eq!(&end_break()[..], &[opcode::END_BREAK]);
        assert_eq!(&port_close()[..], &[opcode::PORT_CLOSE]);
    }

    #[test]
    fn test_outbound_data_has_reserved_byte() {
        let frame = data(b"hello");
        assert_eq!(frame[0], opcode::DATA);
        assert_eq!(frame[1], 0);
        assert_eq!(&frame[2..], b"hello");
    }

    #[test]
    fn test_inbound_data_has_no_reserved_byte() {
        // Inbound: opcode immediately followed by payload.
        let mut body = vec![opcode::DATA];
        body.extend_from_slice(b"hello");
        match classify(Bytes::from(body)).unwrap() {
            InboundFrame::Data(payload) => assert_eq!(&payload[..], b"hello"),
            other => panic!("expected data frame, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_fixed_error_strings() {
        let cases = [
            (opcode::ERR_OPCODE, "Invalid operation"),
            (opcode::ERR_AUTH, "Port not found (auth)"),
            (opcode::ERR_IS_OPEN, "Port is already open"),
            (opcode::ERR_NOT_OPEN, "Port is not open"),
        ];
        for (code, expected) in cases {
            match classify(Bytes::copy_from_slice(&[code])).unwrap() {
                InboundFrame::Error { code: c, message } => {
                    assert_eq!(c, code);
                    assert_eq!(message, expected);
                }
                other => panic!("expected error frame, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_classify_generic_error_appends_code() {
        let mut body = vec![opcode::ERROR];
        body.extend_from_slice(b"device unplugged");
        match classify(Bytes::from(body)).unwrap() {
            InboundFrame::Error { code, message } => {
                assert_eq!(code, 128);
                assert_eq!(message, "device unplugged (128)");
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_ack_returns_remaining_bytes() {
        let body = vec![opcode::OK, 0xAA, 0xBB];
        match classify(Bytes::from(body)).unwrap() {
            InboundFrame::Ack(rest) => assert_eq!(&rest[..], &[0xAA, 0xBB]),
            other => panic!("expected ack frame, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_empty_frame_rejected() {
        assert!(classify(Bytes::new()).is_err());
    }

    #[test]
    fn test_parity_wire_values() {
        assert_eq!(Parity::None.wire(), 0);
        assert_eq!(Parity::Odd.wire(), 1);
        assert_eq!(Parity::Even.wire(), 2);
        assert!(Parity::from_wire(3).is_err());
    }
}
