//! Shared per-connection handle.
//!
//! The reactor owns the socket; handlers (possibly on other threads) own a
//! cheaply cloneable [`Conn`] that can only append to the output queue and
//! request a flush. Both byte queues live behind one spin lock whose critical
//! sections are pure memory copies, so the reactor thread never parks waiting
//! for a handler.

use crate::poller::Trigger;
use crate::protocols::ws::Websocket;
use bytes::BytesMut;
use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) struct IoBufs {
    pub input: BytesMut,
    pub output: BytesMut,
}

struct Shared {
    token: usize,
    addr: SocketAddr,
    trigger: Arc<Trigger>,
    closed: AtomicBool,
    io: spin::Mutex<IoBufs>,
    ws: spin::Mutex<Option<Websocket>>,
    tag: spin::Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

/// Handle to one accepted connection.
#[derive(Clone)]
pub struct Conn {
    shared: Arc<Shared>,
}

impl Conn {
    pub(crate) fn new(token: usize, addr: SocketAddr, trigger: Arc<Trigger>) -> Self {
        Conn {
            shared: Arc::new(Shared {
                token,
                addr,
                trigger,
                closed: AtomicBool::new(false),
                io: spin::Mutex::new(IoBufs {
                    input: BytesMut::new(),
                    output: BytesMut::new(),
                }),
                ws: spin::Mutex::new(None),
                tag: spin::Mutex::new(None),
            }),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.addr
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Flip the closed flag; returns true for exactly one caller.
    pub(crate) fn mark_closed(&self) -> bool {
        self.shared
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Append raw bytes to the output queue.
    ///
    /// The bytes are not sent until the reactor's next write pass; call
    /// [`flush`](Conn::flush) to schedule one from a non-reactor thread.
    pub fn write(&self, p: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            ));
        }
        let mut io = self.shared.io.lock();
        io.output.extend_from_slice(p);
        Ok(p.len())
    }

    /// Run `f` against the output queue under the connection lock.
    ///
    /// Returns the queue length afterwards. No-op on a closed connection; a
    /// late handler write simply vanishes.
    pub(crate) fn append_output(&self, f: impl FnOnce(&mut BytesMut)) -> usize {
        if self.is_closed() {
            return 0;
        }
        let mut io = self.shared.io.lock();
        f(&mut io.output);
        io.output.len()
    }

    pub(crate) fn output_len(&self) -> usize {
        self.shared.io.lock().output.len()
    }

    /// Schedule a write pass on the owning reactor.
    pub fn flush(&self) {
        if self.is_closed() {
            return;
        }
        self.shared.trigger.trigger(self.shared.token);
    }

    pub(crate) fn lock_io(&self) -> spin::MutexGuard<'_, IoBufs> {
        self.shared.io.lock()
    }

    /// Split the first `n` parsed bytes out of the input queue.
    ///
    /// Returns the detached prefix and the number of bytes still queued.
    pub(crate) fn split_input(&self, n: usize) -> (BytesMut, usize) {
        let mut io = self.shared.io.lock();
        let data = io.input.split_to(n);
        (data, io.input.len())
    }

    /// Hand a request's buffer back for reuse.
    ///
    /// The allocation is reclaimed only while the input queue is empty;
    /// otherwise later bytes are preserved and `data` is dropped.
    pub fn reuse_input_buffer(&self, mut data: BytesMut) {
        let mut io = self.shared.io.lock();
        if io.input.is_empty() {
            data.clear();
            data.unsplit(std::mem::replace(&mut io.input, BytesMut::new()));
            io.input = data;
        }
    }

    pub(crate) fn set_websocket(&self, ws: Websocket) {
        *self.shared.ws.lock() = Some(ws);
    }

    pub(crate) fn websocket(&self) -> Option<Websocket> {
        self.shared.ws.lock().clone()
    }

    pub(crate) fn clear_websocket(&self) {
        *self.shared.ws.lock() = None;
    }

    /// Attach an opaque application value to the connection.
    pub fn set_tag(&self, tag: Box<dyn Any + Send + Sync>) {
        *self.shared.tag.lock() = Some(tag);
    }

    /// Detach the application value, if any.
    pub fn take_tag(&self) -> Option<Box<dyn Any + Send + Sync>> {
        self.shared.tag.lock().take()
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("token", &self.shared.token)
            .field("addr", &self.shared.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::Poller;

    fn test_conn() -> Conn {
        let poller = Poller::new().unwrap();
        let addr = "127.0.0.1:0".parse().unwrap();
        Conn::new(3, addr, poller.trigger_handle())
    }

    #[test]
    fn test_write_appends_to_output() {
        let conn = test_conn();
        conn.write(b"hello ").unwrap();
        conn.write(b"world").unwrap();
        assert_eq!(&conn.lock_io().output[..], b"hello world");
    }

    #[test]
    fn test_write_after_close_fails() {
        let conn = test_conn();
        assert!(conn.mark_closed());
        assert!(conn.write(b"x").is_err());
        assert_eq!(conn.output_len(), 0);
    }

    #[test]
    fn test_mark_closed_once() {
        let conn = test_conn();
        assert!(conn.mark_closed());
        assert!(!conn.mark_closed());
    }

    #[test]
    fn test_split_input_preserves_tail() {
        let conn = test_conn();
        conn.lock_io().input.extend_from_slice(b"firstsecond");
        let (data, remain) = conn.split_input(5);
        assert_eq!(&data[..], b"first");
        assert_eq!(remain, 6);
        assert_eq!(&conn.lock_io().input[..], b"second");
    }

    #[test]
    fn test_reuse_input_buffer_only_when_empty() {
        let conn = test_conn();
        conn.lock_io().input.extend_from_slice(b"request-one");
        let (data, _) = conn.split_input(11);
        conn.reuse_input_buffer(data);
        assert!(conn.lock_io().input.is_empty());

        // With bytes pending, the pending bytes win.
        conn.lock_io().input.extend_from_slice(b"pipelined");
        let stale = BytesMut::from(&b"old"[..]);
        conn.reuse_input_buffer(stale);
        assert_eq!(&conn.lock_io().input[..], b"pipelined");
    }

    #[test]
    fn test_tag_round_trip() {
        let conn = test_conn();
        conn.set_tag(Box::new(42u32));
        let tag = conn.take_tag().unwrap();
        assert_eq!(*tag.downcast::<u32>().unwrap(), 42);
        assert!(conn.take_tag().is_none());
    }
}
