//! Readiness poller shared by the server reactor and the client pool.
//!
//! Wraps a `mio::Poll` (epoll on Linux, kqueue on the BSDs and macOS) plus a
//! cross-thread trigger: a lock-free queue of tokens paired with a
//! `mio::Waker` (eventfd / `EVFILT_USER`). `trigger` enqueues first and wakes
//! second, so a wake-up always observes the token it announces.

use crossbeam_queue::SegQueue;
use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Token reserved for the internal waker.
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// The poller never sleeps longer than this, so idle sweeps and death
/// timers run on quiet reactors.
pub(crate) const TICK: Duration = Duration::from_millis(100);

/// Cross-thread half of the poller: everything a connection handle needs to
/// request a flush from an arbitrary thread.
pub(crate) struct Trigger {
    waker: Waker,
    queue: SegQueue<usize>,
}

impl Trigger {
    /// Enqueue `token` for a write pass and wake the poller.
    pub(crate) fn trigger(&self, token: usize) {
        self.queue.push(token);
        // Wake failures mean the poll fd is gone; the reactor is shutting
        // down and the queued token will never be read.
        let _ = self.waker.wake();
    }

    /// Wake the poller without scheduling any token.
    pub(crate) fn wake(&self) {
        let _ = self.waker.wake();
    }
}

/// Reactor-side poller: owns the `mio::Poll` and drains the trigger queue.
pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    trigger: Arc<Trigger>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Poller {
            poll,
            events: Events::with_capacity(1024),
            trigger: Arc::new(Trigger {
                waker,
                queue: SegQueue::new(),
            }),
        })
    }

    pub(crate) fn trigger_handle(&self) -> Arc<Trigger> {
        Arc::clone(&self.trigger)
    }

    pub(crate) fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub(crate) fn add_read<S: Source>(&self, source: &mut S, token: usize) -> io::Result<()> {
        self.poll
            .registry()
            .register(source, Token(token), Interest::READABLE)
    }

    pub(crate) fn mod_read<S: Source>(&self, source: &mut S, token: usize) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(source, Token(token), Interest::READABLE)
    }

    pub(crate) fn mod_read_write<S: Source>(&self, source: &mut S, token: usize) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(source, Token(token), Interest::READABLE | Interest::WRITABLE)
    }

    pub(crate) fn deregister<S: Source>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Block until readiness or the tick elapses, then hand each event to
    /// `on_event`, then drain triggered tokens into `on_trigger`.
    ///
    /// `EINTR` is retried; any other poll failure is reactor-fatal and
    /// propagates.
    pub(crate) fn wait(
        &mut self,
        mut on_event: impl FnMut(Readiness),
        mut on_trigger: impl FnMut(usize),
    ) -> io::Result<()> {
        loop {
            match self.poll.poll(&mut self.events, Some(TICK)) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            on_event(Readiness {
                token: event.token().0,
                readable: event.is_readable(),
                writable: event.is_writable(),
                eof: event.is_read_closed(),
            });
        }

        while let Some(token) = self.trigger.queue.pop() {
            on_trigger(token);
        }
        Ok(())
    }
}

/// One readiness event, flattened out of `mio::event::Event`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
    pub eof: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_wakes_poller() {
        let mut poller = Poller::new().unwrap();
        let handle = poller.trigger_handle();

        let t = std::thread::spawn(move || handle.trigger(7));
        t.join().unwrap();

        let mut triggered = Vec::new();
        poller
            .wait(|_| {}, |token| triggered.push(token))
            .unwrap();
        assert_eq!(triggered, vec![7]);
    }

    #[test]
    fn test_trigger_order_preserved() {
        let mut poller = Poller::new().unwrap();
        let handle = poller.trigger_handle();
        handle.trigger(1);
        handle.trigger(2);
        handle.trigger(3);

        let mut triggered = Vec::new();
        poller.wait(|_| {}, |token| triggered.push(token)).unwrap();
        assert_eq!(triggered, vec![1, 2, 3]);
    }

    #[test]
    fn test_tick_returns_without_events() {
        let mut poller = Poller::new().unwrap();
        let fired = std::cell::Cell::new(false);
        poller
            .wait(|_| fired.set(true), |_| fired.set(true))
            .unwrap();
        assert!(!fired.get());
    }
}
