//! WebSocket framing (RFC 6455, server role).
//!
//! Client frames must be masked; the parser unmasks the payload in place
//! inside the connection's input buffer. Server frames are written unmasked
//! with FIN set.

use crate::conn::Conn;
use bytes::BytesMut;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub(crate) const OP_CONTINUATION: u8 = 0;
pub(crate) const OP_TEXT: u8 = 1;
pub(crate) const OP_BINARY: u8 = 2;
pub(crate) const OP_CLOSE: u8 = 8;
pub(crate) const OP_PING: u8 = 9;
pub(crate) const OP_PONG: u8 = 10;

#[derive(Debug, Error)]
pub(crate) enum WsError {
    #[error("unexpected continuation frame")]
    UnexpectedContinuation,
    #[error("continuation frame too large")]
    ContinuationTooLarge,
    #[error("frame payload length {0} out of range")]
    FrameTooLarge(u64),
}

/// One parsed frame: payload bounds inside the input buffer, already
/// unmasked, plus the total framed length to truncate.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct WsFrame {
    pub opcode: u8,
    pub fin: bool,
    pub payload: Range<usize>,
    pub len: usize,
}

/// Parse the frame at the front of `input`, unmasking its payload in place.
/// Returns `None` while the frame is still incomplete.
pub(crate) fn parse_frame(input: &mut [u8]) -> Result<Option<WsFrame>, WsError> {
    if input.len() < 2 {
        return Ok(None);
    }
    let opcode = input[0] & 0x0f;
    let fin = input[0] >> 7 > 0;

    let marker = (input[1] & 0x7f) as usize;
    let (size, off) = match marker {
        126 => {
            if input.len() < 2 + 2 + 4 {
                return Ok(None);
            }
            let size = u16::from_be_bytes([input[2], input[3]]) as usize;
            (size, 8)
        }
        127 => {
            if input.len() < 2 + 8 + 4 {
                return Ok(None);
            }
            let size = u64::from_be_bytes([
                input[2], input[3], input[4], input[5], input[6], input[7], input[8], input[9],
            ]);
            if size > u32::MAX as u64 {
                return Err(WsError::FrameTooLarge(size));
            }
            (size as usize, 14)
        }
        size => {
            if input.len() < 2 + 4 + size {
                return Ok(None);
            }
            (size, 6)
        }
    };
    if input.len() < off + size {
        return Ok(None);
    }

    let mask = [
        input[off - 4],
        input[off - 3],
        input[off - 2],
        input[off - 1],
    ];
    for i in 0..size {
        input[off + i] ^= mask[i % 4];
    }

    Ok(Some(WsFrame {
        opcode,
        fin,
        payload: off..off + size,
        len: off + size,
    }))
}

/// Append an unmasked FIN frame to `out`.
pub(crate) fn encode_frame(out: &mut BytesMut, opcode: u8, payload: &[u8]) {
    out.extend_from_slice(&[0x80 | opcode]);
    if payload.len() < 126 {
        out.extend_from_slice(&[payload.len() as u8]);
    } else if payload.len() < 65536 {
        out.extend_from_slice(&[126]);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        out.extend_from_slice(&[127]);
        out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
}

struct WsShared {
    conn: Conn,
    closed: AtomicBool,
    closing_data: spin::Mutex<Vec<u8>>,
}

/// Handle to an upgraded connection; cheap to clone and safe to use from
/// handler threads.
#[derive(Clone)]
pub struct Websocket {
    shared: Arc<WsShared>,
}

impl Websocket {
    pub(crate) fn new(conn: Conn) -> Self {
        Websocket {
            shared: Arc::new(WsShared {
                conn,
                closed: AtomicBool::new(false),
                closing_data: spin::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn conn(&self) -> &Conn {
        &self.shared.conn
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn write_text(&self, msg: &str) {
        self.write_frame(OP_TEXT, msg.as_bytes());
    }

    pub fn write_binary(&self, p: &[u8]) {
        self.write_frame(OP_BINARY, p);
    }

    /// Enqueue a close frame; the connection shuts down once it is flushed.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.write_frame(OP_CLOSE, b"websocket: close 1000 (normal)");
    }

    pub(crate) fn write_frame(&self, opcode: u8, payload: &[u8]) {
        self.shared
            .conn
            .append_output(|out| encode_frame(out, opcode, payload));
        self.shared.conn.flush();
    }

    /// Record the payload of the peer's close frame for `on_ws_close`.
    pub(crate) fn set_closing_data(&self, data: &[u8]) {
        *self.shared.closing_data.lock() = data.to_vec();
    }

    pub(crate) fn take_closing_data(&self) -> Vec<u8> {
        std::mem::take(&mut self.shared.closing_data.lock())
    }
}

/// Reactor-side state for an upgraded connection: the accumulator for
/// fragmented messages.
#[derive(Default)]
pub(crate) struct WsSession {
    pub cont: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masked(opcode: u8, fin: bool, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
        let mut frame = Vec::new();
        let b0 = if fin { 0x80 | opcode } else { opcode };
        frame.push(b0);
        if payload.len() < 126 {
            frame.push(0x80 | payload.len() as u8);
        } else if payload.len() < 65536 {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        frame.extend_from_slice(&mask);
        frame.extend(payload.iter().enumerate().map(|(i, &b)| b ^ mask[i % 4]));
        frame
    }

    #[test]
    fn test_parse_small_frame() {
        let mut frame = masked(OP_BINARY, true, b"hello", [0x12, 0x34, 0x56, 0x78]);
        let parsed = parse_frame(&mut frame).unwrap().unwrap();
        assert_eq!(parsed.opcode, OP_BINARY);
        assert!(parsed.fin);
        assert_eq!(parsed.len, 11);
        assert_eq!(&frame[parsed.payload.clone()], b"hello");
    }

    #[test]
    fn test_parse_medium_frame() {
        let payload = vec![0xabu8; 300];
        let mut frame = masked(OP_TEXT, true, &payload, [1, 2, 3, 4]);
        let parsed = parse_frame(&mut frame).unwrap().unwrap();
        assert_eq!(parsed.len, 2 + 2 + 4 + 300);
        assert_eq!(&frame[parsed.payload.clone()], &payload[..]);
    }

    #[test]
    fn test_parse_large_frame() {
        let payload = vec![7u8; 70000];
        let mut frame = masked(OP_BINARY, true, &payload, [9, 9, 9, 9]);
        let parsed = parse_frame(&mut frame).unwrap().unwrap();
        assert_eq!(parsed.len, 2 + 8 + 4 + 70000);
        assert_eq!(&frame[parsed.payload.clone()], &payload[..]);
    }

    #[test]
    fn test_parse_needs_full_frame() {
        let full = masked(OP_BINARY, true, b"hello", [1, 2, 3, 4]);
        for cut in 0..full.len() {
            let mut prefix = full[..cut].to_vec();
            assert!(
                parse_frame(&mut prefix).unwrap().is_none(),
                "prefix of {cut} bytes should be incomplete"
            );
        }
    }

    #[test]
    fn test_parse_fin_clear() {
        let mut frame = masked(OP_TEXT, false, b"part", [1, 1, 1, 1]);
        let parsed = parse_frame(&mut frame).unwrap().unwrap();
        assert!(!parsed.fin);
        assert_eq!(parsed.opcode, OP_TEXT);
    }

    #[test]
    fn test_encode_small() {
        let mut out = BytesMut::new();
        encode_frame(&mut out, OP_BINARY, b"hello");
        assert_eq!(&out[..], &[0x82, 0x05, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_encode_medium() {
        let mut out = BytesMut::new();
        encode_frame(&mut out, OP_TEXT, &[b'x'; 200]);
        assert_eq!(out[0], 0x81);
        assert_eq!(out[1], 126);
        assert_eq!(u16::from_be_bytes([out[2], out[3]]), 200);
        assert_eq!(out.len(), 4 + 200);
    }

    #[test]
    fn test_encode_large() {
        let mut out = BytesMut::new();
        encode_frame(&mut out, OP_BINARY, &vec![0u8; 70000]);
        assert_eq!(out[1], 127);
        assert_eq!(
            u64::from_be_bytes(out[2..10].try_into().unwrap()),
            70000
        );
        assert_eq!(out.len(), 10 + 70000);
    }

    #[test]
    fn test_echo_round_trip() {
        // E4: masked binary "hello" in, unmasked echo out.
        let mut frame = masked(OP_BINARY, true, b"hello", [0x37, 0xfa, 0x21, 0x3d]);
        let parsed = parse_frame(&mut frame).unwrap().unwrap();
        let payload = &frame[parsed.payload.clone()];

        let mut out = BytesMut::new();
        encode_frame(&mut out, OP_BINARY, payload);
        assert_eq!(&out[..], &[0x82, 0x05, b'h', b'e', b'l', b'l', b'o']);
    }
}
