//! The server reactor.
//!
//! One `Listener` owns one poller, one accept socket, one scratch read
//! buffer and the connection table, and drives everything from a single
//! thread inside [`Listener::serve`]. Handlers may complete synchronously on
//! the reactor thread or hand their request to another thread and call
//! `flush` later; either way the reactor alone touches the sockets.

use crate::config::ServerConfig;
use crate::conn::Conn;
use crate::error::{Error, ErrorKind};
use crate::poller::{Poller, Readiness, Trigger};
use crate::protocols::http::HttpRequest;
use crate::protocols::resp::RespRequest;
use crate::protocols::ws::{self, Websocket, WsSession};
use crate::protocols::{FrameState, Progress};
use crate::recency::RecencyList;
use crate::tls::{TlsContext, TlsError, TlsSession};
use mio::net::{TcpListener, TcpStream};
use mio::Token;
use slab::Slab;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

pub type HttpHandler = Box<dyn Fn(HttpRequest) -> bool + Send + Sync>;
pub type RedisHandler = Box<dyn Fn(RespRequest) -> bool + Send + Sync>;
pub type WsDataHandler = Box<dyn Fn(Websocket, &[u8]) + Send + Sync>;
pub type WsCloseHandler = Box<dyn Fn(Websocket, &[u8]) + Send + Sync>;
pub type ErrorHandler = Box<dyn Fn(Error) + Send + Sync>;
pub type FdCountHandler = Box<dyn Fn(usize) + Send + Sync>;

/// Reactor-side state for one accepted connection. The shared half (byte
/// queues, closed flag) lives in [`Conn`]; everything here is touched only by
/// the reactor thread.
struct ServerConn {
    stream: TcpStream,
    tls: Option<TlsSession>,
    shared: Conn,
    frame: FrameState,
    ws: Option<WsSession>,
    last_active: Instant,
}

/// What a read-pass step decided.
enum Flow {
    /// More complete messages may follow in the buffered input.
    Continue,
    /// Stop parsing; the connection may or may not still exist.
    Stop,
}

/// A TCP listener multiplexing HTTP/1.1, RESP and WebSocket on one port.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    poller: Poller,
    trigger: Arc<Trigger>,
    scratch: Vec<u8>,
    conns: Slab<ServerConn>,
    recency: RecencyList,
    tls: Option<TlsContext>,
    count: Arc<AtomicUsize>,
    short_writes: AtomicU64,
    shutdown: Arc<AtomicBool>,
    config: ServerConfig,

    on_http: Option<HttpHandler>,
    on_redis: Option<RedisHandler>,
    on_ws_data: Option<WsDataHandler>,
    on_ws_close: Option<WsCloseHandler>,
    on_error: Option<ErrorHandler>,
    on_fd_count: Option<FdCountHandler>,
}

impl Listener {
    /// Bind a listening socket. With `reuse_port` set, multiple listeners can
    /// share the address for kernel load balancing.
    pub fn bind(reuse_port: bool, addr: &str, config: ServerConfig) -> io::Result<Listener> {
        let addr: SocketAddr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address resolved"))?;

        let std_listener = create_listener(addr, reuse_port)?;
        let local_addr = std_listener.local_addr()?;
        let mut listener = TcpListener::from_std(std_listener);

        let poller = Poller::new()?;
        poller
            .registry()
            .register(&mut listener, LISTENER_TOKEN, mio::Interest::READABLE)?;
        let trigger = poller.trigger_handle();

        Ok(Listener {
            listener,
            local_addr,
            poller,
            trigger,
            scratch: vec![0u8; 0xffff],
            conns: Slab::new(),
            recency: RecencyList::new(),
            tls: None,
            count: Arc::new(AtomicUsize::new(0)),
            short_writes: AtomicU64::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
            config,
            on_http: None,
            on_redis: None,
            on_ws_data: None,
            on_ws_close: None,
            on_error: None,
            on_fd_count: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live connection count.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Number of short writes observed since start.
    pub fn short_write_count(&self) -> u64 {
        self.short_writes.load(Ordering::Relaxed)
    }

    /// Install a TLS certificate; subsequent connections are wrapped.
    pub fn load_cert_pems(&mut self, cert: &[u8], key: &[u8]) -> Result<(), TlsError> {
        self.tls = Some(TlsContext::from_cert_pems(cert, key)?);
        Ok(())
    }

    pub fn on_http(&mut self, f: impl Fn(HttpRequest) -> bool + Send + Sync + 'static) {
        self.on_http = Some(Box::new(f));
    }

    pub fn on_redis(&mut self, f: impl Fn(RespRequest) -> bool + Send + Sync + 'static) {
        self.on_redis = Some(Box::new(f));
    }

    pub fn on_ws_data(&mut self, f: impl Fn(Websocket, &[u8]) + Send + Sync + 'static) {
        self.on_ws_data = Some(Box::new(f));
    }

    pub fn on_ws_close(&mut self, f: impl Fn(Websocket, &[u8]) + Send + Sync + 'static) {
        self.on_ws_close = Some(Box::new(f));
    }

    pub fn on_error(&mut self, f: impl Fn(Error) + Send + Sync + 'static) {
        self.on_error = Some(Box::new(f));
    }

    pub fn on_fd_count(&mut self, f: impl Fn(usize) + Send + Sync + 'static) {
        self.on_fd_count = Some(Box::new(f));
    }

    /// Handle for stopping the reactor from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            trigger: Arc::clone(&self.trigger),
        }
    }

    /// Run the event loop on the calling thread until shut down.
    ///
    /// # Panics
    /// Panics when no `on_error` callback is installed. Unset request
    /// handlers get defaults that answer `500` / `-ERR`.
    pub fn serve(&mut self) -> io::Result<()> {
        assert!(self.on_error.is_some(), "missing on_error handler");
        if self.on_http.is_none() {
            self.on_http = Some(Box::new(|req| {
                req.text(500, "on_http handler not found");
                true
            }));
        }
        if self.on_redis.is_none() {
            self.on_redis = Some(Box::new(|req| {
                req.write_error("on_redis handler not found");
                true
            }));
        }
        if self.on_ws_data.is_none() {
            self.on_ws_data = Some(Box::new(|_, _| {}));
        }
        if self.on_ws_close.is_none() {
            self.on_ws_close = Some(Box::new(|_, _| {}));
        }
        if self.on_fd_count.is_none() {
            self.on_fd_count = Some(Box::new(|_| {}));
        }

        debug!(addr = %self.local_addr, "listener serving");

        let result = catch_unwind(AssertUnwindSafe(|| self.event_loop()));
        match &result {
            Err(payload) => {
                let msg = panic_message(payload);
                error!(%msg, "reactor panicked");
                self.report(Error::msg(ErrorKind::Panic, msg));
            }
            Ok(Err(e)) => error!(error = %e, "reactor failed"),
            Ok(Ok(())) => {}
        }

        self.close_all();
        debug!(addr = %self.local_addr, "listener stopped");
        match result {
            Ok(r) => r,
            Err(_) => Ok(()),
        }
    }

    fn event_loop(&mut self) -> io::Result<()> {
        let mut ready: Vec<Readiness> = Vec::new();
        let mut triggered: Vec<usize> = Vec::new();

        while !self.shutdown.load(Ordering::Acquire) {
            ready.clear();
            triggered.clear();
            self.poller
                .wait(|r| ready.push(r), |token| triggered.push(token))?;

            for r in &ready {
                if Token(r.token) == LISTENER_TOKEN {
                    self.accept_pass();
                } else {
                    self.conn_event(*r);
                }
            }
            for &token in &triggered {
                self.write_conn(token);
            }
            self.sweep_idle();
        }
        Ok(())
    }

    fn accept_pass(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => self.register_conn(stream, peer_addr),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.report(Error::io(ErrorKind::Accept, e));
                    break;
                }
            }
        }
    }

    fn register_conn(&mut self, stream: TcpStream, peer_addr: SocketAddr) {
        let tls = match &self.tls {
            Some(ctx) => match ctx.accept() {
                Ok(session) => Some(session),
                Err(e) => {
                    self.report(Error::new(ErrorKind::Ssl, e));
                    return;
                }
            },
            None => None,
        };

        if self.config.tcp_keepalive_secs > 0 {
            let keepalive = TcpKeepalive::new()
                .with_time(std::time::Duration::from_secs(self.config.tcp_keepalive_secs));
            if let Err(e) = socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
                warn!(error = %e, "failed to set keepalive");
            }
        }

        let entry = self.conns.vacant_entry();
        let token = entry.key();
        let shared = Conn::new(token, peer_addr, Arc::clone(&self.trigger));
        let mut sc = ServerConn {
            stream,
            tls,
            shared,
            frame: FrameState::default(),
            ws: None,
            last_active: Instant::now(),
        };

        if let Err(e) = self.poller.add_read(&mut sc.stream, token) {
            self.report(Error::io(ErrorKind::Accept, e));
            return;
        }
        entry.insert(sc);
        self.recency.push_front(token);

        let n = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(cb) = &self.on_fd_count {
            cb(n);
        }
        debug!(token, peer = %peer_addr, "accepted connection");
    }

    fn conn_event(&mut self, r: Readiness) {
        if !self.conns.contains(r.token) {
            self.report(Error::msg(
                ErrorKind::Lookup,
                format!("token {} not found", r.token),
            ));
            return;
        }
        self.touch(r.token);

        if r.writable {
            self.write_conn(r.token);
        }
        if r.readable && self.conns.contains(r.token) {
            self.read_conn(r.token);
        }
        if r.eof && self.conns.contains(r.token) {
            self.close_conn(r.token, ErrorKind::Eof, None);
        }
    }

    fn touch(&mut self, token: usize) {
        self.recency.touch(token);
        if let Some(sc) = self.conns.get_mut(token) {
            sc.last_active = Instant::now();
        }
    }

    /// §write path: try to push the whole output queue in one write.
    fn write_conn(&mut self, token: usize) {
        let mut pending_close: Option<(ErrorKind, Option<io::Error>)> = None;

        {
            let Some(sc) = self.conns.get_mut(token) else {
                self.report(Error::msg(
                    ErrorKind::Lookup,
                    format!("token {token} not found"),
                ));
                return;
            };
            let shared = sc.shared.clone();
            let mut io = shared.lock_io();

            if io.output.is_empty() {
                drop(io);
                let _ = self.poller.mod_read(&mut sc.stream, token);
                return;
            }

            let res = match &mut sc.tls {
                Some(tls) => tls.write(&mut sc.stream, &io.output),
                None => sc.stream.write(&io.output),
            };
            match res {
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    drop(io);
                    let _ = self.poller.mod_read_write(&mut sc.stream, token);
                }
                Err(e) => {
                    drop(io);
                    pending_close = Some((ErrorKind::Write, Some(e)));
                }
                Ok(n) if n == io.output.len() => {
                    io.output.clear();
                    drop(io);
                    let ws_closed = shared
                        .websocket()
                        .map(|ws| ws.is_closed())
                        .unwrap_or(false);
                    if ws_closed {
                        pending_close = Some((ErrorKind::Close, None));
                    } else {
                        let _ = self.poller.mod_read(&mut sc.stream, token);
                    }
                }
                Ok(n) => {
                    use bytes::Buf;
                    io.output.advance(n);
                    drop(io);
                    let _ = self.poller.mod_read_write(&mut sc.stream, token);
                    self.short_writes.fetch_add(1, Ordering::Relaxed);
                    trace!(token, n, "short write");
                }
            }
        }

        if let Some((kind, cause)) = pending_close {
            self.close_conn(token, kind, cause.map(|e| e.into()));
        }
    }

    /// §read path: drain the socket (notifications are edge-style, so a
    /// full scratch buffer means another read), then every complete message.
    fn read_conn(&mut self, token: usize) {
        let mut last_shared = None;
        loop {
            let (shared, n) = {
                let Some(sc) = self.conns.get_mut(token) else {
                    break;
                };
                let shared = sc.shared.clone();
                let handshaking = sc.tls.as_ref().map(|t| t.is_handshaking()).unwrap_or(false);
                let res = match &mut sc.tls {
                    Some(tls) => tls.read(&mut sc.stream, &mut self.scratch),
                    None => sc.stream.read(&mut self.scratch),
                };
                match res {
                    Ok(0) => {
                        drop(shared);
                        self.close_conn(token, ErrorKind::Eof, None);
                        return;
                    }
                    Ok(n) => (shared, n),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        let _ = self.poller.mod_read(&mut sc.stream, token);
                        break;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        drop(shared);
                        self.close_conn(token, ErrorKind::Eof, None);
                        return;
                    }
                    Err(e) => {
                        let kind = if handshaking {
                            ErrorKind::Ssl
                        } else {
                            ErrorKind::Read
                        };
                        drop(shared);
                        self.close_conn(token, kind, Some(e.into()));
                        return;
                    }
                }
            };

            {
                let mut io = shared.lock_io();
                io.input.extend_from_slice(&self.scratch[..n]);
            }

            loop {
                let buffered = shared.lock_io().input.len();
                if buffered == 0 {
                    break;
                }
                if buffered > self.config.request_max_bytes {
                    self.close_conn(
                        token,
                        ErrorKind::Oversize,
                        Some(format!("request too large: {buffered}b").into()),
                    );
                    return;
                }

                let flow = match shared.websocket() {
                    Some(ws) => self.advance_ws(token, &shared, &ws),
                    None => self.advance_frame(token, &shared),
                };
                match flow {
                    Flow::Continue => continue,
                    Flow::Stop => break,
                }
            }

            let drained = n < self.scratch.len();
            last_shared = Some(shared);
            if drained {
                break;
            }
        }

        // Piggyback: a handler that answered synchronously gets its bytes on
        // the wire without waiting for a flush trigger.
        if let Some(shared) = last_shared {
            if self.conns.contains(token) && shared.output_len() > 0 {
                self.write_conn(token);
            }
        }
    }

    /// Advance the HTTP/RESP stage machine and dispatch a complete request.
    fn advance_frame(&mut self, token: usize, shared: &Conn) -> Flow {
        let max = self.config.request_max_bytes;
        let outcome = {
            let Some(sc) = self.conns.get_mut(token) else {
                return Flow::Stop;
            };
            let mut io = shared.lock_io();
            match sc.frame.advance(&mut io.input[..], max) {
                Err(e) => Err(e),
                Ok(Progress::More) => Ok(None),
                Ok(Progress::Done) => Ok(Some(std::mem::take(&mut sc.frame))),
            }
        };

        let state = match outcome {
            Err(e) => {
                let kind = if e.is_oversize() {
                    ErrorKind::Oversize
                } else {
                    ErrorKind::Read
                };
                self.close_conn(token, kind, Some(e.into()));
                return Flow::Stop;
            }
            Ok(None) => return Flow::Stop,
            Ok(Some(state)) => state,
        };

        if let Some(partial) = state.http {
            let (data, _) = shared.split_input(partial.total_len());
            let req = HttpRequest::new(shared.clone(), data, partial);
            let keep = match &self.on_http {
                Some(cb) => cb(req),
                None => true,
            };
            if !keep {
                self.close_conn(token, ErrorKind::Close, None);
                return Flow::Stop;
            }
        } else if let Some(partial) = state.resp {
            let (data, _) = shared.split_input(partial.read as usize);
            let req = RespRequest::new(shared.clone(), data, partial.args);
            let keep = match &self.on_redis {
                Some(cb) => cb(req),
                None => true,
            };
            if !keep {
                self.close_conn(token, ErrorKind::Close, None);
                return Flow::Stop;
            }
        }

        if shared.lock_io().input.is_empty() {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    /// Parse and dispatch one WebSocket frame.
    fn advance_ws(&mut self, token: usize, shared: &Conn, ws: &Websocket) -> Flow {
        if ws.is_closed() {
            // A close frame is already queued; ignore further input.
            return Flow::Stop;
        }

        let parsed = {
            let Some(sc) = self.conns.get_mut(token) else {
                return Flow::Stop;
            };
            if sc.ws.is_none() {
                sc.ws = Some(WsSession::default());
            }
            let mut io = shared.lock_io();
            match ws::parse_frame(&mut io.input[..]) {
                Err(e) => Err(e),
                Ok(None) => Ok(None),
                Ok(Some(frame)) => {
                    let buf = io.input.split_to(frame.len);
                    let remain = io.input.len();
                    Ok(Some((frame, buf, remain)))
                }
            }
        };

        let (frame, buf, remain) = match parsed {
            Err(e) => {
                self.close_conn(token, ErrorKind::Websocket, Some(e.into()));
                return Flow::Stop;
            }
            Ok(None) => return Flow::Stop,
            Ok(Some(t)) => t,
        };
        let payload = &buf[frame.payload.clone()];

        match frame.opcode {
            ws::OP_CONTINUATION => {
                enum Cont {
                    Deliver(Vec<u8>),
                    Pending,
                    Unexpected,
                    TooLarge,
                }
                let max = self.config.request_max_bytes;
                let outcome = {
                    let Some(sc) = self.conns.get_mut(token) else {
                        return Flow::Stop;
                    };
                    let session = sc.ws.get_or_insert_with(WsSession::default);
                    match session.cont.take() {
                        None => Cont::Unexpected,
                        Some(mut cont) => {
                            cont.extend_from_slice(payload);
                            if cont.len() > max {
                                Cont::TooLarge
                            } else if frame.fin {
                                Cont::Deliver(cont)
                            } else {
                                session.cont = Some(cont);
                                Cont::Pending
                            }
                        }
                    }
                };
                match outcome {
                    Cont::Deliver(message) => {
                        if let Some(cb) = &self.on_ws_data {
                            cb(ws.clone(), &message);
                        }
                    }
                    Cont::Pending => {}
                    Cont::Unexpected => {
                        self.close_conn(
                            token,
                            ErrorKind::Websocket,
                            Some(ws::WsError::UnexpectedContinuation.into()),
                        );
                        return Flow::Stop;
                    }
                    Cont::TooLarge => {
                        self.close_conn(
                            token,
                            ErrorKind::Websocket,
                            Some(ws::WsError::ContinuationTooLarge.into()),
                        );
                        return Flow::Stop;
                    }
                }
            }
            ws::OP_CLOSE => {
                ws.set_closing_data(payload);
                self.close_conn(token, ErrorKind::Close, None);
                return Flow::Stop;
            }
            ws::OP_PING => ws.write_frame(ws::OP_PONG, payload),
            ws::OP_PONG => {}
            _ => {
                if frame.fin {
                    if let Some(cb) = &self.on_ws_data {
                        cb(ws.clone(), payload);
                    }
                } else if let Some(sc) = self.conns.get_mut(token) {
                    let session = sc.ws.get_or_insert_with(WsSession::default);
                    session.cont = Some(payload.to_vec());
                }
            }
        }

        if remain > 0 {
            Flow::Continue
        } else {
            Flow::Stop
        }
    }

    /// Idempotent close: at most one caller wins the CAS, removes the
    /// connection from the table and list, fires `on_ws_close` if a session
    /// exists, and reports `kind` when a cause is attached.
    fn close_conn(
        &mut self,
        token: usize,
        kind: ErrorKind,
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) {
        let Some(sc) = self.conns.get(token) else {
            return;
        };
        if !sc.shared.mark_closed() {
            return;
        }
        let mut sc = self.conns.remove(token);
        self.recency.detach(token);

        if let Some(ws) = sc.shared.websocket() {
            let payload = ws.take_closing_data();
            if let Some(cb) = &self.on_ws_close {
                cb(ws.clone(), &payload);
            }
            sc.shared.clear_websocket();
        }

        let n = self.count.fetch_sub(1, Ordering::AcqRel) - 1;
        if let Some(cb) = &self.on_fd_count {
            cb(n);
        }

        if let Err(e) = self.poller.deregister(&mut sc.stream) {
            self.report(Error::io(ErrorKind::Close, e));
        }
        if let Some(cause) = cause {
            self.report(Error { kind, cause });
        }
        debug!(token, kind = kind.as_str(), "connection closed");
        // Dropping `sc` closes the fd and tears down any TLS session.
    }

    /// Close every connection older than the idle timeout, tail-first.
    fn sweep_idle(&mut self) {
        let Some(timeout) = self.config.idle_timeout() else {
            return;
        };
        let now = Instant::now();
        while let Some(token) = self.recency.back() {
            let Some(sc) = self.conns.get(token) else {
                // A stale list entry cannot make progress; drop it.
                self.recency.detach(token);
                continue;
            };
            if now.duration_since(sc.last_active) <= timeout {
                break;
            }
            let peer = sc.shared.remote_addr();
            self.close_conn(
                token,
                ErrorKind::Timeout,
                Some(format!("connection to {peer} timed out (token={token})").into()),
            );
        }
    }

    fn close_all(&mut self) {
        let tokens: Vec<usize> = self.conns.iter().map(|(token, _)| token).collect();
        for token in tokens {
            self.close_conn(token, ErrorKind::Close, None);
        }
    }

    fn report(&self, err: Error) {
        if let Some(cb) = &self.on_error {
            cb(err);
        }
    }
}

/// Stops a running [`Listener::serve`] from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    trigger: Arc<Trigger>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        self.trigger.wake();
    }
}

/// Bind with `SO_REUSEADDR` (and optionally `SO_REUSEPORT`) via socket2.
fn create_listener(addr: SocketAddr, reuse_port: bool) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
