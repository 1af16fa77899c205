//! RESP reply scanning and reading for the client pool.
//!
//! `element_len` finds the byte length of the next complete reply element so
//! the reactor can split exactly one reply off the input queue; [`Reply`]
//! then walks that element without re-parsing.

use crate::util::find_crlf;
use bytes::BytesMut;
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum ReplyError {
    #[error("invalid RESP first byte {0:#04x}")]
    BadFirstByte(u8),
    #[error("invalid RESP number: {0}")]
    BadNumber(String),
    #[error("invalid end of bulk string")]
    BadBulkTail,
}

/// Length in bytes of the complete element at the front of `input`, or
/// `None` when more bytes are needed.
pub(crate) fn element_len(input: &[u8]) -> Result<Option<usize>, ReplyError> {
    if input.is_empty() {
        return Ok(None);
    }
    match input[0] {
        b'$' => {
            let Some(idx) = find_crlf(input) else {
                return Ok(None);
            };
            let size = parse_int(&input[1..idx])?;
            if size < 0 {
                // Null bulk string.
                return Ok(Some(idx + 2));
            }
            let total = idx + 2 + size as usize + 2;
            if input.len() < total {
                return Ok(None);
            }
            if input[total - 2] != b'\r' || input[total - 1] != b'\n' {
                return Err(ReplyError::BadBulkTail);
            }
            Ok(Some(total))
        }
        b'+' | b'-' | b':' => {
            let Some(idx) = find_crlf(input) else {
                return Ok(None);
            };
            Ok(Some(idx + 2))
        }
        b'*' => {
            let Some(idx) = find_crlf(input) else {
                return Ok(None);
            };
            let count = parse_int(&input[1..idx])?;
            if count < 0 {
                // Null array.
                return Ok(Some(idx + 2));
            }
            let mut at = idx + 2;
            for _ in 0..count {
                match element_len(&input[at.min(input.len())..])? {
                    Some(n) => at += n,
                    None => return Ok(None),
                }
            }
            Ok(Some(at))
        }
        other => Err(ReplyError::BadFirstByte(other)),
    }
}

fn parse_int(digits: &[u8]) -> Result<i64, ReplyError> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ReplyError::BadNumber(String::from_utf8_lossy(digits).into_owned()))
}

/// One value read out of a [`Reply`].
#[derive(Debug, PartialEq, Eq)]
pub enum Element {
    /// Bulk or simple string bytes.
    Bytes(Vec<u8>),
    /// `:n` integer.
    Int(i64),
    /// `-ERR ...` error line.
    Error(String),
    /// Nested `*n` array; read its elements from the sub-reply.
    Array(Reply),
    /// `$-1` / `*-1` null.
    Null,
}

/// Cursor over one complete reply element received from the upstream peer.
#[derive(Debug, PartialEq, Eq)]
pub struct Reply {
    buf: BytesMut,
}

impl Reply {
    pub(crate) fn new(buf: BytesMut) -> Self {
        Reply { buf }
    }

    /// The error message, when this reply is a RESP `-error`.
    pub fn error_message(&self) -> Option<&str> {
        if self.buf.first() == Some(&b'-') {
            let end = find_crlf(&self.buf)?;
            std::str::from_utf8(&self.buf[1..end]).ok()
        } else {
            None
        }
    }

    /// Pop the next element off the front of the reply.
    pub fn next(&mut self) -> Option<Element> {
        let head = *self.buf.first()?;
        match head {
            b'$' => {
                let idx = find_crlf(&self.buf)?;
                let size: i64 = std::str::from_utf8(&self.buf[1..idx]).ok()?.parse().ok()?;
                if size < 0 {
                    let _ = self.buf.split_to(idx + 2);
                    return Some(Element::Null);
                }
                let total = idx + 2 + size as usize + 2;
                let chunk = self.buf.split_to(total.min(self.buf.len()));
                Some(Element::Bytes(
                    chunk[idx + 2..idx + 2 + size as usize].to_vec(),
                ))
            }
            b'+' | b'-' | b':' => {
                let idx = find_crlf(&self.buf)?;
                let chunk = self.buf.split_to(idx + 2);
                let line = &chunk[1..idx];
                match head {
                    b'+' => Some(Element::Bytes(line.to_vec())),
                    b'-' => Some(Element::Error(String::from_utf8_lossy(line).into_owned())),
                    _ => Some(Element::Int(
                        std::str::from_utf8(line).ok()?.parse().ok()?,
                    )),
                }
            }
            b'*' => {
                let idx = find_crlf(&self.buf)?;
                let count: i64 = std::str::from_utf8(&self.buf[1..idx]).ok()?.parse().ok()?;
                if count < 0 {
                    let _ = self.buf.split_to(idx + 2);
                    return Some(Element::Null);
                }
                let mut at = idx + 2;
                for _ in 0..count {
                    match element_len(&self.buf[at..]).ok()? {
                        Some(n) => at += n,
                        None => return None,
                    }
                }
                let mut chunk = self.buf.split_to(at);
                let _ = chunk.split_to(idx + 2);
                Some(Element::Array(Reply::new(chunk)))
            }
            _ => None,
        }
    }

    /// Next element as bytes (bulk or simple string).
    pub fn bytes(&mut self) -> Option<Vec<u8>> {
        match self.next()? {
            Element::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Next element as a UTF-8 string.
    pub fn string(&mut self) -> Option<String> {
        String::from_utf8(self.bytes()?).ok()
    }

    /// Next element as an integer.
    pub fn int(&mut self) -> Option<i64> {
        match self.next()? {
            Element::Int(n) => Some(n),
            _ => None,
        }
    }

    /// Next element as a nested array reader.
    pub fn array(&mut self) -> Option<Reply> {
        match self.next()? {
            Element::Array(r) => Some(r),
            _ => None,
        }
    }
}
