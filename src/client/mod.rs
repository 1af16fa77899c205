//! Pooled RESP client.
//!
//! A `Client` owns a dedicated reactor thread with its own poller and drives
//! every upstream socket from there; `exec` may be called from any thread.
//! Quiescent connections park in a bounded idle channel. When an AUTH secret
//! is configured, every fresh socket sends `AUTH <secret>` ahead of the first
//! command and its reply is consumed internally.

mod parser;

pub use parser::{Element, Reply};

use crate::config::ClientConfig;
use crate::conn::IoBufs;
use crate::error::{Error, ErrorKind};
use crate::poller::{Poller, Readiness, Trigger};
use crate::protocols::resp::encode_command;
use bytes::BytesMut;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, trace};

/// Delivered exactly once with the reply or the failure.
pub type ReplyCallback = Box<dyn FnOnce(Result<Reply, Error>) + Send>;

const AUTH_NONE: u8 = 0;
const AUTH_PENDING: u8 = 1;
const AUTH_REPLIED: u8 = 2;

/// One upstream socket. I/O happens only on the client's reactor thread;
/// `exec` threads touch the byte queues and callback slot under their locks.
struct ClientConn {
    token: usize,
    stream: parking_lot::Mutex<TcpStream>,
    closed: AtomicBool,
    io: spin::Mutex<IoBufs>,
    callback: spin::Mutex<Option<ReplyCallback>>,
    auth: AtomicU8,
    deadline: spin::Mutex<Option<Instant>>,
}

impl ClientConn {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct Inner {
    addr: SocketAddr,
    config: ClientConfig,
    registry: Registry,
    trigger: Arc<Trigger>,
    conns: parking_lot::Mutex<Slab<Arc<ClientConn>>>,
    idle_tx: Sender<Arc<ClientConn>>,
    idle_rx: Receiver<Arc<ClientConn>>,
    total: AtomicUsize,
    shutdown: AtomicBool,
    on_error: Box<dyn Fn(Error) + Send + Sync>,
    on_fd_count: parking_lot::RwLock<Arc<dyn Fn(usize) + Send + Sync>>,
}

/// Connection-pool client speaking RESP to one upstream address.
pub struct Client {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl Client {
    /// Resolve `addr`, spawn the reactor thread, and return the pool.
    pub fn new(
        addr: &str,
        config: ClientConfig,
        on_error: impl Fn(Error) + Send + Sync + 'static,
    ) -> io::Result<Client> {
        let addr: SocketAddr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address resolved"))?;

        let poller = Poller::new()?;
        let registry = poller.registry().try_clone()?;
        let trigger = poller.trigger_handle();
        let (idle_tx, idle_rx) = bounded(config.pool_size);

        let inner = Arc::new(Inner {
            addr,
            config,
            registry,
            trigger,
            conns: parking_lot::Mutex::new(Slab::new()),
            idle_tx,
            idle_rx,
            total: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            on_error: Box::new(on_error),
            on_fd_count: parking_lot::RwLock::new(Arc::new(|_| {})),
        });

        let reactor_inner = Arc::clone(&inner);
        let thread = std::thread::Builder::new()
            .name("resp-client".to_string())
            .spawn(move || reactor(poller, reactor_inner))?;

        Ok(Client {
            inner,
            thread: Some(thread),
        })
    }

    /// Observe pool size changes; called with the live socket count.
    pub fn on_fd_count(&self, f: impl Fn(usize) + Send + Sync + 'static) {
        *self.inner.on_fd_count.write() = Arc::new(f);
    }

    /// Serialize `args` as a RESP command and schedule it on a pooled
    /// connection; `cb` fires with the reply or the failure.
    ///
    /// Blocks only when the pool is exhausted and no connection is idle.
    pub fn exec<I, A, F>(&self, args: I, cb: F)
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
        F: FnOnce(Result<Reply, Error>) + Send + 'static,
    {
        let mut cmd = BytesMut::new();
        encode_command(&mut cmd, args);
        self.inner.exec_raw(&cmd, Box::new(cb));
    }

    /// Total live sockets, idle and active.
    pub fn count(&self) -> usize {
        self.inner.total.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle_rx.len()
    }

    pub fn active_count(&self) -> usize {
        self.count().saturating_sub(self.idle_count())
    }

    /// Stop the reactor; every live connection closes and pending callbacks
    /// receive a `close` error.
    pub fn close(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.trigger.wake();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Inner {
    fn exec_raw(&self, cmd: &[u8], cb: ReplyCallback) {
        // Fast path: reuse an idle connection, skipping any that died while
        // parked in the channel.
        loop {
            match self.idle_rx.try_recv() {
                Ok(conn) if !conn.is_closed() => {
                    self.activate(&conn, cmd, cb);
                    return;
                }
                Ok(_stale) => continue,
                Err(_) => break,
            }
        }

        // Below pool size: open a fresh socket.
        loop {
            let cur = self.total.load(Ordering::Acquire);
            if cur >= self.config.pool_size {
                break;
            }
            if self
                .total
                .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.open_conn(cmd, cb);
                return;
            }
        }

        // Pool exhausted: block until a connection is handed back.
        loop {
            match self.idle_rx.recv() {
                Ok(conn) if !conn.is_closed() => {
                    self.activate(&conn, cmd, cb);
                    return;
                }
                Ok(_stale) => continue,
                Err(_) => {
                    cb(Err(Error::msg(ErrorKind::Close, "client closed")));
                    return;
                }
            }
        }
    }

    /// Reuse an idle connection for one command.
    fn activate(&self, conn: &Arc<ClientConn>, cmd: &[u8], cb: ReplyCallback) {
        *conn.callback.lock() = Some(cb);
        {
            let mut io = conn.io.lock();
            debug_assert!(io.output.is_empty(), "idle connection with queued output");
            io.output.extend_from_slice(cmd);
        }
        *conn.deadline.lock() = self.config.timeout().map(|t| Instant::now() + t);
        self.trigger.trigger(conn.token);

        // The reactor may have closed this connection between the idle-pop
        // and the install above; whoever takes the slot delivers exactly once.
        if conn.is_closed() {
            if let Some(cb) = conn.callback.lock().take() {
                cb(Err(Error::msg(ErrorKind::Close, "connection closed")));
            }
        }
    }

    /// Open, register and queue a fresh socket carrying the AUTH prelude
    /// (when configured) plus the user command.
    fn open_conn(&self, cmd: &[u8], cb: ReplyCallback) {
        let mut stream = match TcpStream::connect(self.addr) {
            Ok(stream) => stream,
            Err(e) => {
                self.total.fetch_sub(1, Ordering::AcqRel);
                cb(Err(Error::io(ErrorKind::Write, e)));
                return;
            }
        };

        let mut out = BytesMut::new();
        let mut auth_state = AUTH_NONE;
        if let Some(secret) = &self.config.auth {
            encode_command(&mut out, [b"AUTH".as_ref(), secret.as_bytes()]);
            auth_state = AUTH_PENDING;
        }
        out.extend_from_slice(cmd);

        let mut conns = self.conns.lock();
        let entry = conns.vacant_entry();
        let token = entry.key();

        if let Err(e) = self
            .registry
            .register(&mut stream, Token(token), Interest::READABLE | Interest::WRITABLE)
        {
            drop(conns);
            self.total.fetch_sub(1, Ordering::AcqRel);
            cb(Err(Error::io(ErrorKind::Write, e)));
            return;
        }

        let conn = Arc::new(ClientConn {
            token,
            stream: parking_lot::Mutex::new(stream),
            closed: AtomicBool::new(false),
            io: spin::Mutex::new(IoBufs {
                input: BytesMut::new(),
                output: out,
            }),
            callback: spin::Mutex::new(Some(cb)),
            auth: AtomicU8::new(auth_state),
            deadline: spin::Mutex::new(self.config.timeout().map(|t| Instant::now() + t)),
        });
        entry.insert(Arc::clone(&conn));
        drop(conns);

        self.fire_fd_count();
        debug!(token, addr = %self.addr, "opened upstream connection");
    }

    fn lookup(&self, token: usize) -> Option<Arc<ClientConn>> {
        self.conns.lock().get(token).cloned()
    }

    fn fire_fd_count(&self) {
        let cb = Arc::clone(&self.on_fd_count.read());
        cb(self.total.load(Ordering::Acquire));
    }

    fn report(&self, err: Error) {
        (self.on_error)(err);
    }

    fn conn_event(&self, r: Readiness, scratch: &mut [u8]) {
        let Some(conn) = self.lookup(r.token) else {
            self.report(Error::msg(
                ErrorKind::Lookup,
                format!("token {} not found", r.token),
            ));
            return;
        };
        if r.writable {
            self.write_conn(&conn);
        }
        if r.readable && !conn.is_closed() {
            self.read_conn(&conn, scratch);
        }
        if r.eof && !conn.is_closed() {
            self.close_conn(&conn, ErrorKind::Eof, None);
        }
    }

    fn write_conn(&self, conn: &Arc<ClientConn>) {
        let mut pending_close: Option<io::Error> = None;
        {
            let mut stream = conn.stream.lock();
            let mut io = conn.io.lock();
            if io.output.is_empty() {
                drop(io);
                let _ = self
                    .registry
                    .reregister(&mut *stream, Token(conn.token), Interest::READABLE);
                return;
            }
            match stream.write(&io.output) {
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    drop(io);
                    let _ = self.registry.reregister(
                        &mut *stream,
                        Token(conn.token),
                        Interest::READABLE | Interest::WRITABLE,
                    );
                }
                Err(e) => pending_close = Some(e),
                Ok(n) if n == io.output.len() => {
                    io.output.clear();
                    drop(io);
                    let _ = self
                        .registry
                        .reregister(&mut *stream, Token(conn.token), Interest::READABLE);
                }
                Ok(n) => {
                    use bytes::Buf;
                    io.output.advance(n);
                    drop(io);
                    let _ = self.registry.reregister(
                        &mut *stream,
                        Token(conn.token),
                        Interest::READABLE | Interest::WRITABLE,
                    );
                    trace!(token = conn.token, n, "short write");
                }
            }
        }
        if let Some(e) = pending_close {
            self.close_conn(conn, ErrorKind::Write, Some(e.to_string()));
        }
    }

    fn read_conn(&self, conn: &Arc<ClientConn>, scratch: &mut [u8]) {
        // Readiness is edge-style: keep reading until a short read or
        // WouldBlock so no burst is left stranded in the kernel buffer.
        loop {
            enum Outcome {
                Data(usize),
                Eof,
                Rearm,
                Fail(io::Error),
            }
            let outcome = {
                let mut stream = conn.stream.lock();
                match stream.read(scratch) {
                    Ok(0) => Outcome::Eof,
                    Ok(n) => Outcome::Data(n),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        let _ = self
                            .registry
                            .reregister(&mut *stream, Token(conn.token), Interest::READABLE);
                        Outcome::Rearm
                    }
                    Err(e) => Outcome::Fail(e),
                }
            };
            let n = match outcome {
                Outcome::Data(n) => n,
                Outcome::Eof => {
                    self.close_conn(conn, ErrorKind::Eof, None);
                    return;
                }
                Outcome::Rearm => break,
                Outcome::Fail(e) => {
                    self.close_conn(conn, ErrorKind::Read, Some(e.to_string()));
                    return;
                }
            };

            {
                let mut io = conn.io.lock();
                io.input.extend_from_slice(&scratch[..n]);
                let len = io.input.len();
                if len > self.config.response_max_bytes {
                    drop(io);
                    self.close_conn(
                        conn,
                        ErrorKind::Oversize,
                        Some(format!("response too large: {len}b")),
                    );
                    return;
                }
            }

            if n < scratch.len() {
                break;
            }
        }

        loop {
            let element = {
                let mut io = conn.io.lock();
                match parser::element_len(&io.input) {
                    Err(e) => {
                        drop(io);
                        self.close_conn(conn, ErrorKind::Read, Some(e.to_string()));
                        return;
                    }
                    Ok(None) => break,
                    Ok(Some(len)) => io.input.split_to(len),
                }
            };

            // AUTH prelude: the first reply on a fresh socket is ours.
            match conn.auth.load(Ordering::Acquire) {
                AUTH_PENDING => {
                    conn.auth.store(AUTH_REPLIED, Ordering::Release);
                    continue;
                }
                AUTH_REPLIED => conn.auth.store(AUTH_NONE, Ordering::Release),
                _ => {}
            }

            let cb = conn.callback.lock().take();
            *conn.deadline.lock() = None;
            match cb {
                Some(cb) => {
                    let reply = Reply::new(element);
                    match reply.error_message().map(str::to_string) {
                        Some(msg) => cb(Err(Error::msg(ErrorKind::Reply, msg))),
                        None => cb(Ok(reply)),
                    }
                }
                None => {
                    self.close_conn(
                        conn,
                        ErrorKind::Read,
                        Some(format!("token {} is not active", conn.token)),
                    );
                    return;
                }
            }
        }

        // Pipeline quiescent: hand the connection back to the idle pool, or
        // close it quietly when the pool is already full.
        let drained = conn.io.lock().input.is_empty();
        let quiescent = drained
            && conn.callback.lock().is_none()
            && conn.auth.load(Ordering::Acquire) == AUTH_NONE;
        if quiescent && !conn.is_closed() {
            match self.idle_tx.try_send(Arc::clone(conn)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    self.close_conn(conn, ErrorKind::Close, None);
                }
            }
        }
    }

    /// Idempotent close. A pending callback always learns about the close;
    /// `on_error` is told only when a cause is attached.
    fn close_conn(&self, conn: &Arc<ClientConn>, kind: ErrorKind, cause: Option<String>) {
        if conn
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        {
            let mut conns = self.conns.lock();
            conns.try_remove(conn.token);
        }
        self.total.fetch_sub(1, Ordering::AcqRel);
        self.fire_fd_count();

        let _ = self.registry.deregister(&mut *conn.stream.lock());

        let msg = cause.clone().unwrap_or_else(|| "connection closed".to_string());
        if let Some(cb) = conn.callback.lock().take() {
            cb(Err(Error::msg(kind, msg.clone())));
        }
        if cause.is_some() {
            self.report(Error::msg(kind, msg));
        }
        debug!(token = conn.token, kind = kind.as_str(), "upstream connection closed");
    }

    /// Close every connection whose death timer has fired.
    fn sweep_deadlines(&self) {
        let now = Instant::now();
        let expired: Vec<Arc<ClientConn>> = self
            .conns
            .lock()
            .iter()
            .filter_map(|(_, conn)| match *conn.deadline.lock() {
                Some(deadline) if deadline <= now => Some(Arc::clone(conn)),
                _ => None,
            })
            .collect();
        for conn in expired {
            self.close_conn(&conn, ErrorKind::Timeout, Some("request timed out".into()));
        }
    }

    fn close_all(&self) {
        let conns: Vec<Arc<ClientConn>> =
            self.conns.lock().iter().map(|(_, c)| Arc::clone(c)).collect();
        for conn in conns {
            self.close_conn(&conn, ErrorKind::Close, None);
        }
    }
}

/// The client's event loop, pinned to its own thread.
fn reactor(mut poller: Poller, inner: Arc<Inner>) {
    let mut scratch = vec![0u8; 0xffff];
    debug!(addr = %inner.addr, "client reactor started");

    let result = catch_unwind(AssertUnwindSafe(|| -> io::Result<()> {
        let mut ready: Vec<Readiness> = Vec::new();
        let mut triggered: Vec<usize> = Vec::new();
        while !inner.shutdown.load(Ordering::Acquire) {
            ready.clear();
            triggered.clear();
            poller.wait(|r| ready.push(r), |t| triggered.push(t))?;

            for r in &ready {
                inner.conn_event(*r, &mut scratch);
            }
            for &token in &triggered {
                match inner.lookup(token) {
                    Some(conn) => inner.write_conn(&conn),
                    None => inner.report(Error::msg(
                        ErrorKind::Lookup,
                        format!("token {token} not found"),
                    )),
                }
            }
            inner.sweep_deadlines();
        }
        Ok(())
    }));

    match result {
        Err(payload) => {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            error!(%msg, "client reactor panicked");
            inner.report(Error::msg(ErrorKind::Panic, msg));
        }
        Ok(Err(e)) => error!(error = %e, "client reactor failed"),
        Ok(Ok(())) => {}
    }

    inner.close_all();
    debug!(addr = %inner.addr, "client reactor stopped");
}

/// Round-robin shard over independent clients, for scaling past one reactor
/// thread. A monotonic counter selects the shard.
pub struct MultiClient {
    clients: Vec<Client>,
    ctr: AtomicUsize,
}

impl MultiClient {
    pub fn new(
        n: usize,
        addr: &str,
        config: ClientConfig,
        on_error: impl Fn(Error) + Send + Sync + 'static,
    ) -> io::Result<MultiClient> {
        assert!(n > 0, "need at least one client");
        let on_error = Arc::new(on_error);
        let mut clients = Vec::with_capacity(n);
        for _ in 0..n {
            let on_error = Arc::clone(&on_error);
            clients.push(Client::new(addr, config.clone(), move |e| on_error(e))?);
        }
        Ok(MultiClient {
            clients,
            ctr: AtomicUsize::new(0),
        })
    }

    pub fn exec<I, A, F>(&self, args: I, cb: F)
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
        F: FnOnce(Result<Reply, Error>) + Send + 'static,
    {
        let i = self.ctr.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        self.clients[i].exec(args, cb);
    }

    pub fn idle_count(&self) -> usize {
        self.clients.iter().map(Client::idle_count).sum()
    }

    pub fn active_count(&self) -> usize {
        self.clients.iter().map(Client::active_count).sum()
    }

    pub fn close(&self) {
        for client in &self.clients {
            client.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_state_transitions() {
        let auth = AtomicU8::new(AUTH_PENDING);
        // First reply: consumed internally.
        assert_eq!(auth.load(Ordering::Acquire), AUTH_PENDING);
        auth.store(AUTH_REPLIED, Ordering::Release);
        // Second reply: delivered, back to none.
        auth.store(AUTH_NONE, Ordering::Release);
        assert_eq!(auth.load(Ordering::Acquire), AUTH_NONE);
    }

    #[test]
    fn test_exec_against_dead_upstream_delivers_error() {
        // Port from the ephemeral range with nothing listening; connect or
        // the first write fails and the callback must still fire.
        let client = Client::new("127.0.0.1:1", ClientConfig::default(), |_| {}).unwrap();
        let (tx, rx) = bounded(1);
        client.exec(["PING"], move |res| {
            tx.send(res.is_err()).unwrap();
        });
        let failed = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("callback fired");
        assert!(failed);
    }
}
