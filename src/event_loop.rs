//! The Event Loop (spec §4.1): a single-threaded readiness multiplexer
//! over file descriptors, built on `mio` — the idiomatic Rust
//! equivalent of the original's raw epoll wrapper.
//!
//! Registrations live in a slab (`Vec<Option<Registration>>`) indexed
//! by handle; `mio::Token` is just that index. Sources themselves stay
//! owned by their caller (a `Connection` or the listener) — `mio` only
//! needs a `&mut` borrow at register/deregister time, so the slab
//! stores dispatch metadata, not the socket. `poll()` is allowed to
//! report several ready descriptors at once, but the component
//! contract is "dispatch exactly one per call" — extra readiness is
//! buffered in `pending` and drained on subsequent calls rather than
//! discarded, so no wakeup is lost between `poll_once()` invocations.

use std::collections::VecDeque;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use tracing::{trace, warn};

use crate::error::EventLoopError;

pub const MAX_EVENTS: usize = 8192;

pub type Handle = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Listener,
    ClientToServer,
    ServerToClient,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    pub handle: Handle,
    pub kind: HandlerKind,
    pub payload: u64,
}

#[derive(Clone, Copy)]
struct Registration {
    kind: HandlerKind,
    payload: u64,
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    slots: Vec<Option<Registration>>,
    pending: VecDeque<usize>,
    count: usize,
}

impl EventLoop {
    pub fn new() -> Result<Self, EventLoopError> {
        Ok(EventLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            slots: Vec::new(),
            pending: VecDeque::new(),
            count: 0,
        })
    }

    /// Installs `source` (borrowed only for the duration of the
    /// kernel registration call) with readable interest, returning a
    /// handle used for later removal. Reuses the lowest freed slot
    /// before growing the slab.
    pub fn register(
        &mut self,
        source: &mut dyn Source,
        kind: HandlerKind,
        payload: u64,
    ) -> Result<Handle, EventLoopError> {
        if self.count >= MAX_EVENTS {
            return Err(EventLoopError::CapacityExhausted(MAX_EVENTS));
        }

        let handle = match self.slots.iter().position(|s| s.is_none()) {
            Some(idx) => idx,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };

        self.poll.registry().register(source, Token(handle), Interest::READABLE)?;

        self.slots[handle] = Some(Registration { kind, payload });
        self.count += 1;
        trace!(handle, ?kind, payload, "registered fd");
        Ok(handle)
    }

    /// Clears `handle`'s slot, deregistering `source` from the kernel
    /// poller. If it was the slab's high-water mark, shrinks the slab
    /// back to the next occupied slot. Idempotent: calling twice for
    /// the same handle is the same as calling once (the second call
    /// finds an already-empty slot and is a no-op).
    pub fn unregister(&mut self, handle: Handle, source: &mut dyn Source) -> bool {
        let Some(slot) = self.slots.get_mut(handle) else {
            return false;
        };
        if slot.take().is_none() {
            return false;
        }
        let _ = self.poll.registry().deregister(source);
        self.count -= 1;

        if handle + 1 == self.slots.len() {
            self.slots.pop();
            while matches!(self.slots.last(), Some(None)) {
                self.slots.pop();
            }
        }
        self.pending.retain(|&h| h != handle);
        trace!(handle, "unregistered fd");
        true
    }

    /// Blocks until at least one descriptor is ready, then dispatches
    /// exactly one (the lowest handle among those ready), returning
    /// its tag. A signal interrupting the underlying `epoll_wait`
    /// yields `Ok(None)` without touching any registration. Remaining
    /// readiness from the same kernel poll is retained across calls.
    pub fn poll_once(&mut self) -> Result<Option<ReadyEvent>, EventLoopError> {
        self.poll_inner(None)
    }

    /// Polls with a bounded wait instead of blocking indefinitely;
    /// used by the proxy thread so it can check the termination flag
    /// between iterations (spec §5).
    pub fn poll_once_timeout(&mut self, timeout: Duration) -> Result<Option<ReadyEvent>, EventLoopError> {
        self.poll_inner(Some(timeout))
    }

    fn poll_inner(&mut self, timeout: Option<Duration>) -> Result<Option<ReadyEvent>, EventLoopError> {
        if self.pending.is_empty() {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(None),
                Err(e) => return Err(EventLoopError::Io(e)),
            }
            let mut tokens: Vec<usize> = self.events.iter().map(|e| e.token().0).collect();
            tokens.sort_unstable();
            tokens.dedup();
            self.pending = tokens.into();
        }

        while let Some(handle) = self.pending.pop_front() {
            match self.slots.get(handle) {
                Some(Some(reg)) => {
                    return Ok(Some(ReadyEvent {
                        handle,
                        kind: reg.kind,
                        payload: reg.payload,
                    }));
                }
                _ => {
                    warn!(handle, "readiness for a since-unregistered handle, skipping");
                }
            }
        }
        Ok(None)
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;

    #[test]
    fn unregister_is_idempotent() {
        let mut ev = EventLoop::new().unwrap();
        let mut l = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let h = ev.register(&mut l, HandlerKind::Listener, 0).unwrap();
        assert!(ev.unregister(h, &mut l));
        assert!(!ev.unregister(h, &mut l));
    }

    #[test]
    fn unregister_shrinks_high_water_mark() {
        let mut ev = EventLoop::new().unwrap();
        let mut a = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut b = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let ha = ev.register(&mut a, HandlerKind::Listener, 0).unwrap();
        let hb = ev.register(&mut b, HandlerKind::Listener, 1).unwrap();
        assert_eq!(ev.slots.len(), 2);
        ev.unregister(hb, &mut b);
        assert_eq!(ev.slots.len(), 1);
        ev.unregister(ha, &mut a);
        assert_eq!(ev.slots.len(), 0);
    }

    #[test]
    fn register_reuses_freed_slot() {
        let mut ev = EventLoop::new().unwrap();
        let mut a = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut b = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let ha = ev.register(&mut a, HandlerKind::Listener, 0).unwrap();
        let _hb = ev.register(&mut b, HandlerKind::Listener, 1).unwrap();
        ev.unregister(ha, &mut a);
        let mut c = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let hc = ev.register(&mut c, HandlerKind::Listener, 2).unwrap();
        assert_eq!(hc, ha);
        assert_eq!(ev.count(), 2);
    }

    #[test]
    fn count_tracks_registrations() {
        let mut ev = EventLoop::new().unwrap();
        let mut l = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(ev.count(), 0);
        let h = ev.register(&mut l, HandlerKind::Listener, 0).unwrap();
        assert_eq!(ev.count(), 1);
        ev.unregister(h, &mut l);
        assert_eq!(ev.count(), 0);
    }
}
