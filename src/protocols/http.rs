//! HTTP/1.1 request framing and response builders.
//!
//! Requests are parsed in place inside the connection's input buffer: the
//! method is uppercased, header names are lowercased and the path is
//! percent-decoded without copying. The parsed request records byte spans
//! into that buffer. Only `Content-Length` bodies are accepted; chunked
//! transfer coding is supported on responses only.

use crate::conn::Conn;
use crate::protocols::ws::Websocket;
use crate::protocols::FramingError;
use crate::util::{find_crlf, find_subsequence, status_text, unescape_in_place};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::ops::Range;

const WS_ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Response headers the fixed/chunked builders always set themselves.
const RESERVED_HEADERS: [&str; 4] = [
    "Content-Type",
    "Connection",
    "Content-Length",
    "Transfer-Encoding",
];

/// Small writes are coalesced until the pending buffer reaches this size.
const CHUNK_COALESCE: usize = 64;

/// A chunked response auto-flushes once this much output is queued.
const CHUNK_FLUSH_AT: usize = 16 * 1024;

/// An HTTP request under construction by the framer. All positions are byte
/// spans `(start, len)` into the connection input buffer.
#[derive(Debug, Default)]
pub(crate) struct HttpPartial {
    pub hdr_len: u32,
    pub body_len: u32,
    pub path: (u32, u32),
    pub host: (u32, u32),
    pub query: (u32, u32),
    pub ws_upgrade: bool,
}

impl HttpPartial {
    pub(crate) fn total_len(&self) -> usize {
        (self.hdr_len + self.body_len) as usize
    }
}

pub(crate) enum HeaderProgress {
    More,
    NeedBody,
    Done,
}

/// Parse the header block once `\r\n\r\n` is present, rewriting bytes in
/// place as described in the module docs.
pub(crate) fn parse_header(
    partial: &mut HttpPartial,
    input: &mut [u8],
    max_bytes: usize,
) -> Result<HeaderProgress, FramingError> {
    let Some(idx) = find_subsequence(input, b"\r\n\r\n") else {
        return Ok(HeaderProgress::More);
    };
    let hdr_len = idx + 4;
    partial.hdr_len = hdr_len as u32;

    let mut start = 0usize;
    while start < hdr_len {
        let Some(rel) = find_crlf(&input[start..hdr_len]) else {
            break;
        };
        if rel == 0 {
            break;
        }
        let line_end = start + rel;
        if start == 0 {
            parse_request_line(partial, input, line_end)?;
        } else {
            parse_header_line(partial, input, start, line_end)?;
        }
        start = line_end + 2;
    }

    if partial.total_len() > max_bytes {
        return Err(FramingError::DeclaredTooLarge {
            declared: partial.total_len(),
            max: max_bytes,
        });
    }
    if partial.body_len == 0 {
        Ok(HeaderProgress::Done)
    } else {
        Ok(HeaderProgress::NeedBody)
    }
}

/// `<Method> <Request-URI> <Version>` with the URI located between the first
/// and last space.
fn parse_request_line(
    partial: &mut HttpPartial,
    input: &mut [u8],
    line_end: usize,
) -> Result<(), FramingError> {
    let line = &input[..line_end];
    let idx0 = line.iter().position(|&c| c == b' ');
    let idx1 = line.iter().rposition(|&c| c == b' ');
    let (idx0, idx1) = match (idx0, idx1) {
        (Some(a), Some(b)) if a != b && b <= 0xffff => (a, b),
        _ => return Err(FramingError::InvalidFirstLine),
    };

    input[..idx0].make_ascii_uppercase();

    let uri_start = idx0 + 1;
    let mut uri_end = idx1;
    if let Some(q) = input[uri_start..uri_end].iter().position(|&c| c == b'?') {
        partial.query = ((uri_start + q + 1) as u32, (uri_end - uri_start - q - 1) as u32);
        uri_end = uri_start + q;
    }

    let decoded = unescape_in_place(&mut input[uri_start..uri_end], false);
    std::str::from_utf8(&input[uri_start..uri_start + decoded])
        .map_err(|_| FramingError::PathNotUtf8)?;
    partial.path = (uri_start as u32, decoded as u32);

    // Absolute-form URI: split `scheme://host/path` into host and path.
    if decoded == 0 || input[uri_start] != b'/' {
        let region = uri_start..uri_start + decoded;
        if let Some(s) = find_subsequence(&input[region.clone()], b"://") {
            let host_start = uri_start + s + 3;
            let host_region = &input[host_start..region.end];
            match host_region.iter().position(|&c| c == b'/') {
                Some(slash) => {
                    partial.host = (host_start as u32, slash as u32);
                    partial.path = (
                        (host_start + slash) as u32,
                        (region.end - host_start - slash) as u32,
                    );
                }
                None => {
                    partial.host = (host_start as u32, host_region.len() as u32);
                    partial.path = (0, 0); // rendered as "/"
                }
            }
        }
    }
    Ok(())
}

fn parse_header_line(
    partial: &mut HttpPartial,
    input: &mut [u8],
    start: usize,
    line_end: usize,
) -> Result<(), FramingError> {
    let colon = input[start..line_end]
        .iter()
        .position(|&c| c == b':')
        .filter(|&c| c >= 1)
        .ok_or(FramingError::InvalidHeaderLine)?;

    input[start..start + colon].make_ascii_lowercase();

    let mut vs = start + colon + 1;
    let mut ve = line_end;
    while vs < ve && (input[vs] == b' ' || input[vs] == b'\t') {
        vs += 1;
    }
    while ve > vs && (input[ve - 1] == b' ' || input[ve - 1] == b'\t') {
        ve -= 1;
    }

    match &input[start..start + colon] {
        b"upgrade" => partial.ws_upgrade = input[vs..ve].eq_ignore_ascii_case(b"websocket"),
        b"host" => partial.host = (vs as u32, (ve - vs) as u32),
        b"content-length" => {
            partial.body_len = std::str::from_utf8(&input[vs..ve])
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(0);
        }
        // transfer-encoding is scanned past: chunked requests unsupported.
        _ => {}
    }
    Ok(())
}

/// One parsed HTTP request, handed to the `on_http` callback.
pub struct HttpRequest {
    conn: Conn,
    data: BytesMut,
    hdr_len: u32,
    body_len: u32,
    path: (u32, u32),
    host: (u32, u32),
    query: (u32, u32),
    ws_upgrade: bool,
    qmap: Option<HashMap<String, String>>,
    chunked: bool,
    chunk_buf: Vec<u8>,
}

impl HttpRequest {
    pub(crate) fn new(conn: Conn, data: BytesMut, partial: HttpPartial) -> Self {
        HttpRequest {
            conn,
            data,
            hdr_len: partial.hdr_len,
            body_len: partial.body_len,
            path: partial.path,
            host: partial.host,
            query: partial.query,
            ws_upgrade: partial.ws_upgrade,
            qmap: None,
            chunked: false,
            chunk_buf: Vec::new(),
        }
    }

    pub fn conn(&self) -> &Conn {
        &self.conn
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    /// Request method, uppercased (`GET`, `POST`, ...).
    pub fn method(&self) -> &str {
        let end = self
            .data
            .iter()
            .position(|&c| c == b' ')
            .unwrap_or(self.data.len());
        std::str::from_utf8(&self.data[..end]).unwrap_or("")
    }

    /// Percent-decoded request path.
    pub fn path(&self) -> &str {
        let (start, len) = self.path;
        if len == 0 {
            return "/";
        }
        std::str::from_utf8(&self.data[start as usize..(start + len) as usize]).unwrap_or("/")
    }

    /// Host from an absolute-form URI or the `Host` header.
    pub fn host(&self) -> Option<&str> {
        let (start, len) = self.host;
        if len == 0 {
            return None;
        }
        std::str::from_utf8(&self.data[start as usize..(start + len) as usize]).ok()
    }

    pub fn body(&self) -> &[u8] {
        &self.data[self.data.len() - self.body_len as usize..]
    }

    /// True when the client asked for a WebSocket upgrade.
    pub fn is_ws_upgrade(&self) -> bool {
        self.ws_upgrade
    }

    /// Walk header lines, yielding `(name, value)` spans into the request
    /// buffer with the value whitespace-trimmed; stop on `false`.
    fn scan_headers(&self, mut f: impl FnMut(Range<usize>, Range<usize>) -> bool) {
        let hdr_len = self.hdr_len as usize;
        let mut start = 0usize;
        let mut first = true;
        while start < hdr_len {
            let Some(rel) = find_crlf(&self.data[start..hdr_len]) else {
                break;
            };
            if rel == 0 {
                break;
            }
            let line_end = start + rel;
            if !first {
                let line = &self.data[start..line_end];
                if let Some(colon) = line.iter().position(|&c| c == b':').filter(|&c| c >= 1) {
                    let mut vs = start + colon + 1;
                    let mut ve = line_end;
                    while vs < ve && (self.data[vs] == b' ' || self.data[vs] == b'\t') {
                        vs += 1;
                    }
                    while ve > vs && (self.data[ve - 1] == b' ' || self.data[ve - 1] == b'\t') {
                        ve -= 1;
                    }
                    if !f(start..start + colon, vs..ve) {
                        return;
                    }
                }
            }
            first = false;
            start = line_end + 2;
        }
    }

    /// Visit each header as raw `(name, value)` bytes; names are lowercased.
    /// Stop early by returning `false`.
    pub fn for_each_header(&self, mut f: impl FnMut(&[u8], &[u8]) -> bool) {
        self.scan_headers(|name, value| f(&self.data[name], &self.data[value]))
    }

    /// Look up a header by its lowercase name.
    pub fn header(&self, name: &str) -> Option<&str> {
        let mut found: Option<Range<usize>> = None;
        self.scan_headers(|k, v| {
            if self.data[k].eq_ignore_ascii_case(name.as_bytes()) {
                found = Some(v);
                false
            } else {
                true
            }
        });
        std::str::from_utf8(&self.data[found?]).ok()
    }

    /// Visit each decoded `key=value` pair of the query string.
    pub fn for_each_query(&self, mut f: impl FnMut(&str, &str)) {
        let (start, len) = self.query;
        if len == 0 {
            return;
        }
        let raw = &self.data[start as usize..(start + len) as usize];
        for part in raw.split(|&c| c == b'&') {
            if part.is_empty() {
                continue;
            }
            let (kraw, vraw) = match part.iter().position(|&c| c == b'=') {
                Some(eq) => (&part[..eq], &part[eq + 1..]),
                None => (part, &[][..]),
            };
            let key = decode_component(kraw);
            let value = decode_component(vraw);
            f(&key, &value);
        }
    }

    /// Look up a decoded query value; the map is built on first use.
    pub fn query(&mut self, key: &str) -> Option<&str> {
        if self.qmap.is_none() {
            let mut map = HashMap::new();
            self.for_each_query(|k, v| {
                map.insert(k.to_string(), v.to_string());
            });
            self.qmap = Some(map);
        }
        self.qmap.as_ref().and_then(|m| m.get(key)).map(String::as_str)
    }

    pub fn query_i64(&mut self, key: &str) -> Option<i64> {
        self.query(key)?.parse().ok()
    }

    pub fn query_i64_or(&mut self, key: &str, default: i64) -> i64 {
        self.query_i64(key).unwrap_or(default)
    }

    /// Schedule a write pass for everything appended so far.
    pub fn flush(&self) -> &Self {
        self.conn.flush();
        self
    }

    /// `text/plain` response with the default content type.
    pub fn text(&self, code: u16, msg: &str) -> &Self {
        self.respond_full(code, "", &[], msg.as_bytes())
    }

    pub fn bytes(&self, code: u16, content_type: &str, data: &[u8]) -> &Self {
        self.respond_full(code, content_type, &[], data)
    }

    pub fn bytes_with_headers(
        &self,
        code: u16,
        content_type: &str,
        headers: &[(&str, &str)],
        data: &[u8],
    ) -> &Self {
        self.respond_full(code, content_type, headers, data)
    }

    pub fn redirect(&self, code: u16, location: &str) -> &Self {
        self.conn.append_output(|out| {
            out.extend_from_slice(b"HTTP/1.1 ");
            out.extend_from_slice(code.to_string().as_bytes());
            out.extend_from_slice(b" ");
            out.extend_from_slice(status_text(code).as_bytes());
            out.extend_from_slice(b"\r\nLocation: ");
            out.extend_from_slice(location.as_bytes());
            out.extend_from_slice(b"\r\n\r\n");
        });
        self
    }

    fn respond_full(
        &self,
        code: u16,
        content_type: &str,
        headers: &[(&str, &str)],
        data: &[u8],
    ) -> &Self {
        self.conn.append_output(|out| {
            head(out, code, content_type, headers);
            out.extend_from_slice(b"\r\nConnection: Keep-Alive\r\nContent-Length: ");
            out.extend_from_slice(data.len().to_string().as_bytes());
            out.extend_from_slice(b"\r\n\r\n");
            out.extend_from_slice(data);
        });
        self
    }

    /// Open a `Transfer-Encoding: chunked` response; feed it through
    /// [`io::Write`] and close it with [`finish_chunked`](Self::finish_chunked).
    pub fn start_chunked(&mut self, code: u16, content_type: &str, headers: &[(&str, &str)]) {
        self.conn.append_output(|out| {
            head(out, code, content_type, headers);
            out.extend_from_slice(b"\r\nConnection: Keep-Alive\r\nTransfer-Encoding: chunked\r\n\r\n");
        });
        self.chunked = true;
    }

    fn emit_chunk(&self, p: &[u8]) {
        let queued = self.conn.append_output(|out| {
            out.extend_from_slice(format!("{:x}", p.len()).as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(p);
            out.extend_from_slice(b"\r\n");
        });
        if queued >= CHUNK_FLUSH_AT {
            self.conn.flush();
        }
    }

    /// Emit the pending coalesce buffer, the zero-chunk terminator, and flush.
    ///
    /// # Panics
    /// Panics unless [`start_chunked`](Self::start_chunked) was called.
    pub fn finish_chunked(&mut self) {
        assert!(self.chunked, "not in chunked mode, call start_chunked first");
        if !self.chunk_buf.is_empty() {
            let pending = std::mem::take(&mut self.chunk_buf);
            self.emit_chunk(&pending);
        }
        self.conn.append_output(|out| out.extend_from_slice(b"0\r\n\r\n"));
        self.chunked = false;
        self.conn.flush();
    }

    /// Complete the WebSocket handshake and install a session.
    ///
    /// Returns `None` unless the request carried `Upgrade: websocket`.
    /// `headers` are echoed into the `101` response, minus the handshake
    /// fields the server sets itself.
    pub fn upgrade_websocket(&self, headers: &[(&str, &str)]) -> Option<Websocket> {
        if !self.ws_upgrade {
            return None;
        }
        let mut sha = Sha1::new();
        sha.update(self.header("sec-websocket-key").unwrap_or("").as_bytes());
        sha.update(WS_ACCEPT_GUID);
        let accept = BASE64.encode(sha.finalize());

        let ws = Websocket::new(self.conn.clone());
        self.conn.set_websocket(ws.clone());

        self.conn.append_output(|out| {
            out.extend_from_slice(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: ",
            );
            out.extend_from_slice(accept.as_bytes());
            out.extend_from_slice(b"\r\n");
            for (k, v) in headers {
                if k.eq_ignore_ascii_case("upgrade")
                    || k.eq_ignore_ascii_case("connection")
                    || k.eq_ignore_ascii_case("sec-websocket-accept")
                {
                    continue;
                }
                out.extend_from_slice(k.as_bytes());
                out.extend_from_slice(b": ");
                out.extend_from_slice(v.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            out.extend_from_slice(b"\r\n");
        });
        self.conn.flush();
        Some(ws)
    }

    /// Hand the request buffer back to the connection for reuse.
    pub fn release(self) {
        let HttpRequest { conn, data, .. } = self;
        conn.reuse_input_buffer(data);
    }
}

/// Status line, content type and caller headers (reserved names skipped).
fn head(out: &mut BytesMut, code: u16, content_type: &str, headers: &[(&str, &str)]) {
    let code = if code == 0 { 200 } else { code };
    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(code.to_string().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(status_text(code).as_bytes());
    let ct = if content_type.is_empty() {
        "text/plain; charset=utf-8"
    } else {
        content_type
    };
    out.extend_from_slice(b"\r\nContent-Type: ");
    out.extend_from_slice(ct.as_bytes());
    for (k, v) in headers {
        if RESERVED_HEADERS.iter().any(|r| r.eq_ignore_ascii_case(k)) {
            continue;
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(k.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(v.as_bytes());
    }
}

impl io::Write for HttpRequest {
    /// Append a chunk; writes of four bytes or fewer are coalesced.
    ///
    /// # Panics
    /// Panics unless [`start_chunked`](Self::start_chunked) was called.
    fn write(&mut self, p: &[u8]) -> io::Result<usize> {
        assert!(self.chunked, "not in chunked mode, call start_chunked first");
        if p.is_empty() {
            return Ok(0);
        }
        if p.len() <= 4 || !self.chunk_buf.is_empty() {
            self.chunk_buf.extend_from_slice(p);
            if self.chunk_buf.len() >= CHUNK_COALESCE {
                let pending = std::mem::take(&mut self.chunk_buf);
                self.emit_chunk(&pending);
            }
        } else {
            self.emit_chunk(p);
        }
        Ok(p.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.flush();
        Ok(())
    }
}

fn decode_component(raw: &[u8]) -> String {
    let mut buf = raw.to_vec();
    let n = unescape_in_place(&mut buf, true);
    buf.truncate(n);
    String::from_utf8_lossy(&buf).into_owned()
}
