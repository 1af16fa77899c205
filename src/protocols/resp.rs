//! RESP (RESP2) command framing and reply writers.
//!
//! Commands are `*<n>` arrays of bulk strings. Arguments are recorded as
//! `(start, len)` spans into the connection's input buffer; nothing is copied
//! until the request buffer is detached from the queue.

use crate::conn::Conn;
use crate::protocols::{read_prefixed_number, FramingError, Prefixed, Progress};
use bytes::BytesMut;
use std::net::SocketAddr;

/// Largest accepted bulk-string length (RESP2 wire limit).
const BULK_MAX: i64 = u32::MAX as i64;

/// A RESP command being assembled by the framer.
#[derive(Debug)]
pub(crate) struct RespPartial {
    /// Bytes consumed so far (array header plus completed arguments).
    pub read: u32,
    /// Declared argument count.
    pub nargs: u16,
    /// `(start, len)` spans of completed arguments.
    pub args: Vec<(u32, u32)>,
}

impl RespPartial {
    pub(crate) fn new(nargs: u16, header_width: u32) -> Self {
        RespPartial {
            read: header_width,
            nargs,
            args: Vec::with_capacity(nargs as usize),
        }
    }
}

/// Consume bulk strings until `nargs` spans are recorded.
pub(crate) fn advance_args(
    partial: &mut RespPartial,
    input: &[u8],
    max_bytes: usize,
) -> Result<Progress, FramingError> {
    while partial.args.len() < partial.nargs as usize {
        let at = partial.read as usize;
        match read_prefixed_number(b'$', &input[at.min(input.len())..])? {
            Prefixed::NeedMore => return Ok(Progress::More),
            Prefixed::Other => return Err(FramingError::InvalidBulkHead(input[at])),
            Prefixed::Num { value, width } => {
                if !(0..=BULK_MAX).contains(&value) {
                    return Err(FramingError::InvalidBulkLen(value));
                }
                let len = value as usize;
                let data_start = at + width;
                let data_end = data_start + len;
                if data_end + 2 > max_bytes {
                    return Err(FramingError::DeclaredTooLarge {
                        declared: data_end + 2,
                        max: max_bytes,
                    });
                }
                if input.len() < data_end + 2 {
                    return Ok(Progress::More);
                }
                if input[data_end] != b'\r' || input[data_end + 1] != b'\n' {
                    return Err(FramingError::InvalidBulkTail);
                }
                partial.args.push((data_start as u32, len as u32));
                partial.read = (data_end + 2) as u32;
            }
        }
    }
    Ok(Progress::Done)
}

/// One parsed RESP command, handed to the `on_redis` callback.
///
/// Argument accessors slice into the detached input buffer; `release` hands
/// the buffer back to the connection for reuse.
pub struct RespRequest {
    conn: Conn,
    data: BytesMut,
    args: Vec<(u32, u32)>,
}

impl RespRequest {
    pub(crate) fn new(conn: Conn, data: BytesMut, args: Vec<(u32, u32)>) -> Self {
        RespRequest { conn, data, args }
    }

    pub fn conn(&self) -> &Conn {
        &self.conn
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    /// Number of arguments, command name included.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn arg(&self, i: usize) -> Option<&[u8]> {
        let &(start, len) = self.args.get(i)?;
        Some(&self.data[start as usize..(start + len) as usize])
    }

    pub fn str_arg(&self, i: usize) -> Option<&str> {
        std::str::from_utf8(self.arg(i)?).ok()
    }

    pub fn i64_arg(&self, i: usize) -> Option<i64> {
        self.str_arg(i)?.parse().ok()
    }

    pub fn i64_arg_or(&self, i: usize, default: i64) -> i64 {
        self.i64_arg(i).unwrap_or(default)
    }

    /// Append a `+simple` reply.
    pub fn write_simple_string(&self, s: &str) -> &Self {
        self.conn.append_output(|out| {
            out.extend_from_slice(b"+");
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        });
        self
    }

    /// Append a `-error` reply.
    pub fn write_error(&self, msg: &str) -> &Self {
        self.conn.append_output(|out| {
            out.extend_from_slice(b"-");
            out.extend_from_slice(msg.as_bytes());
            out.extend_from_slice(b"\r\n");
        });
        self
    }

    /// Append a `:integer` reply.
    pub fn write_int(&self, v: i64) -> &Self {
        self.conn.append_output(|out| {
            out.extend_from_slice(b":");
            out.extend_from_slice(v.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        });
        self
    }

    /// Append a `$bulk` reply.
    pub fn write_bulk(&self, p: &[u8]) -> &Self {
        self.conn.append_output(|out| {
            out.extend_from_slice(b"$");
            out.extend_from_slice(p.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(p);
            out.extend_from_slice(b"\r\n");
        });
        self
    }

    pub fn write_bulk_string(&self, s: &str) -> &Self {
        self.write_bulk(s.as_bytes())
    }

    /// Append a `*n` array header; the caller writes the `n` elements.
    pub fn write_array_header(&self, n: usize) -> &Self {
        self.conn.append_output(|out| {
            out.extend_from_slice(b"*");
            out.extend_from_slice(n.to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        });
        self
    }

    /// Append pre-encoded reply bytes verbatim.
    pub fn write_raw(&self, p: &[u8]) -> &Self {
        self.conn.append_output(|out| out.extend_from_slice(p));
        self
    }

    /// Schedule a write pass for everything appended so far.
    pub fn flush(&self) -> &Self {
        self.conn.flush();
        self
    }

    /// Hand the request buffer back to the connection for reuse.
    pub fn release(self) {
        let RespRequest { conn, data, .. } = self;
        conn.reuse_input_buffer(data);
    }
}

/// Serialize `args` as a RESP bulk-string array into `out`.
pub(crate) fn encode_command<I, A>(out: &mut BytesMut, args: I) -> usize
where
    I: IntoIterator<Item = A>,
    A: AsRef<[u8]>,
{
    let args: Vec<A> = args.into_iter().collect();
    out.extend_from_slice(b"*");
    out.extend_from_slice(args.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    for a in &args {
        let a = a.as_ref();
        out.extend_from_slice(b"$");
        out.extend_from_slice(a.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(a);
        out.extend_from_slice(b"\r\n");
    }
    args.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::{FrameState, Progress, Stage};

    fn parse(input: &[u8]) -> (RespPartial, Progress) {
        let mut state = FrameState::default();
        let mut buf = input.to_vec();
        let progress = state.advance(&mut buf, 1 << 20).unwrap();
        (
            state.resp.unwrap_or_else(|| RespPartial::new(0, 0)),
            progress,
        )
    }

    #[test]
    fn test_parse_three_args() {
        let input = b"*3\r\n$4\r\nTEST\r\n$1\r\n0\r\n$3\r\nfoo\r\n";
        let (partial, progress) = parse(input);
        assert_eq!(progress, Progress::Done);
        assert_eq!(partial.read as usize, input.len());

        let spans: Vec<&[u8]> = partial
            .args
            .iter()
            .map(|&(s, l)| &input[s as usize..(s + l) as usize])
            .collect();
        assert_eq!(spans, vec![&b"TEST"[..], &b"0"[..], &b"foo"[..]]);
    }

    #[test]
    fn test_parse_incremental() {
        let full = b"*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n";
        let mut state = FrameState::default();
        let mut buf = full[..9].to_vec();
        assert_eq!(state.advance(&mut buf, 1 << 20).unwrap(), Progress::More);

        let mut buf = full[..20].to_vec();
        assert_eq!(state.advance(&mut buf, 1 << 20).unwrap(), Progress::More);

        let mut buf = full.to_vec();
        assert_eq!(state.advance(&mut buf, 1 << 20).unwrap(), Progress::Done);
        assert_eq!(state.stage, Stage::Complete);
    }

    #[test]
    fn test_bad_bulk_head() {
        let mut state = FrameState::default();
        let mut buf = b"*1\r\n:12\r\n".to_vec();
        assert!(matches!(
            state.advance(&mut buf, 1 << 20),
            Err(FramingError::InvalidBulkHead(b':'))
        ));
    }

    #[test]
    fn test_bad_bulk_tail() {
        let mut state = FrameState::default();
        let mut buf = b"*1\r\n$3\r\nfooXX".to_vec();
        assert!(matches!(
            state.advance(&mut buf, 1 << 20),
            Err(FramingError::InvalidBulkTail)
        ));
    }

    #[test]
    fn test_declared_oversize() {
        let mut state = FrameState::default();
        let mut buf = b"*1\r\n$99999\r\n".to_vec();
        assert!(matches!(
            state.advance(&mut buf, 1024),
            Err(FramingError::DeclaredTooLarge { .. })
        ));
    }

    #[test]
    fn test_encode_command() {
        let mut out = BytesMut::new();
        encode_command(&mut out, ["GET", "key"]);
        assert_eq!(&out[..], b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n");
    }

    #[test]
    fn test_encode_parse_round_trip() {
        let args: Vec<&[u8]> = vec![b"SET", b"k\r\nwith crlf", b""];
        let mut out = BytesMut::new();
        encode_command(&mut out, args.clone());

        let (partial, progress) = parse(&out);
        assert_eq!(progress, Progress::Done);
        let spans: Vec<&[u8]> = partial
            .args
            .iter()
            .map(|&(s, l)| &out[s as usize..(s + l) as usize])
            .collect();
        assert_eq!(spans, args);
    }
}
