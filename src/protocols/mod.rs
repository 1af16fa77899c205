//! Protocol detection and framing.
//!
//! Every server connection starts in the detection stage: a leading `*`
//! followed by a decimal count and CRLF selects RESP, anything else is
//! HTTP/1.1. A WebSocket session, once installed by an upgrade, bypasses this
//! machine entirely (see [`ws`]).
//!
//! Parsers are total over prefixes: any prefix of a valid message yields
//! [`Progress::More`] and no bytes are consumed until a message is complete.

pub mod http;
pub mod resp;
pub mod ws;

use thiserror::Error;

/// Framing failure; the reactor closes the connection and reports it.
#[derive(Debug, Error)]
pub(crate) enum FramingError {
    #[error("too many arguments: {0}")]
    TooManyArgs(i64),
    #[error("negative argument count: {0}")]
    NegativeCount(i64),
    #[error("invalid prefixed number: {0:?}")]
    BadNumber(String),
    #[error("invalid bulk string head {0:#04x}")]
    InvalidBulkHead(u8),
    #[error("invalid bulk string length {0}")]
    InvalidBulkLen(i64),
    #[error("invalid bulk string tail")]
    InvalidBulkTail,
    #[error("invalid HTTP/1 first line")]
    InvalidFirstLine,
    #[error("invalid HTTP/1 header line")]
    InvalidHeaderLine,
    #[error("request path is not valid UTF-8")]
    PathNotUtf8,
    #[error("declared message size {declared} exceeds limit {max}")]
    DeclaredTooLarge { declared: usize, max: usize },
}

impl FramingError {
    /// Declared-size violations close as `oversize`, everything else as `read`.
    pub(crate) fn is_oversize(&self) -> bool {
        matches!(self, FramingError::DeclaredTooLarge { .. })
    }
}

/// Where the framer stands on the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    /// Nothing classified yet.
    Detect,
    /// RESP: reading bulk-string arguments.
    RespArgs,
    /// HTTP: waiting for the end of the header block.
    HttpHeader,
    /// HTTP: waiting for `Content-Length` worth of body.
    HttpBody,
    /// A complete message is described by `http` or `resp`.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    /// Come back when more bytes have arrived.
    More,
    /// One complete message parsed; inspect `http`/`resp`.
    Done,
}

/// Per-connection framing state, reset after every complete message.
pub(crate) struct FrameState {
    pub stage: Stage,
    pub resp: Option<resp::RespPartial>,
    pub http: Option<http::HttpPartial>,
}

impl Default for FrameState {
    fn default() -> Self {
        FrameState {
            stage: Stage::Detect,
            resp: None,
            http: None,
        }
    }
}

impl FrameState {
    /// Advance the machine over `input`.
    ///
    /// HTTP parsing rewrites bytes in place (method uppercased, header names
    /// lowercased, path percent-decoded), which is why `input` is mutable.
    pub(crate) fn advance(
        &mut self,
        input: &mut [u8],
        max_bytes: usize,
    ) -> Result<Progress, FramingError> {
        loop {
            match self.stage {
                Stage::Detect => match read_prefixed_number(b'*', input)? {
                    Prefixed::NeedMore => return Ok(Progress::More),
                    Prefixed::Other => {
                        self.http = Some(http::HttpPartial::default());
                        self.stage = Stage::HttpHeader;
                    }
                    Prefixed::Num { value, width } => {
                        if value < 0 {
                            return Err(FramingError::NegativeCount(value));
                        }
                        if value > 65535 {
                            return Err(FramingError::TooManyArgs(value));
                        }
                        self.resp = Some(resp::RespPartial::new(value as u16, width as u32));
                        self.stage = Stage::RespArgs;
                    }
                },
                Stage::RespArgs => {
                    let partial = self.resp.as_mut().expect("resp partial in RespArgs stage");
                    match resp::advance_args(partial, input, max_bytes)? {
                        Progress::More => return Ok(Progress::More),
                        Progress::Done => {
                            self.stage = Stage::Complete;
                            return Ok(Progress::Done);
                        }
                    }
                }
                Stage::HttpHeader => {
                    let partial = self.http.as_mut().expect("http partial in HttpHeader stage");
                    match http::parse_header(partial, input, max_bytes)? {
                        http::HeaderProgress::More => return Ok(Progress::More),
                        http::HeaderProgress::NeedBody => self.stage = Stage::HttpBody,
                        http::HeaderProgress::Done => {
                            self.stage = Stage::Complete;
                            return Ok(Progress::Done);
                        }
                    }
                }
                Stage::HttpBody => {
                    let partial = self.http.as_ref().expect("http partial in HttpBody stage");
                    if input.len() < partial.total_len() {
                        return Ok(Progress::More);
                    }
                    self.stage = Stage::Complete;
                    return Ok(Progress::Done);
                }
                Stage::Complete => return Ok(Progress::Done),
            }
        }
    }
}

pub(crate) enum Prefixed {
    /// Too few bytes to decide.
    NeedMore,
    /// First byte is not `head`.
    Other,
    /// `head` + decimal + CRLF.
    Num { value: i64, width: usize },
}

/// Read a `<head><decimal>\r\n` token from the front of `input`.
pub(crate) fn read_prefixed_number(head: u8, input: &[u8]) -> Result<Prefixed, FramingError> {
    if input.len() < 4 {
        // head + at least one digit + CRLF
        return Ok(Prefixed::NeedMore);
    }
    if input[0] != head {
        return Ok(Prefixed::Other);
    }
    let Some(idx) = crate::util::find_crlf(input) else {
        return Ok(Prefixed::NeedMore);
    };
    let digits = &input[1..idx];
    let text = std::str::from_utf8(digits)
        .map_err(|_| FramingError::BadNumber(String::from_utf8_lossy(digits).into_owned()))?;
    let value = text
        .parse::<i64>()
        .map_err(|_| FramingError::BadNumber(text.to_string()))?;
    Ok(Prefixed::Num {
        value,
        width: idx + 2,
    })
}
