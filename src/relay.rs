//! The Relay Engine (spec §4.5): per-ready-fd copy loop under the
//! global worker lock and the per-connection lock. Grounded in
//! `do_proxying`/`proxy_from_client_to_server`/
//! `proxy_from_server_to_client` in `examples/original_source/src/proxying.c`.
//!
//! Sockets here are non-blocking `mio` streams rather than the
//! original's blocking fds — the architectural contract (worker lock
//! held across one read/write cycle) is preserved, but a `write_all`
//! that would have to wait on backpressure surfaces as a write error
//! instead of actually blocking the thread; that's treated the same
//! as any other write error (close the connection), which is the
//! closest honest behavior without giving up non-blocking I/O.

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::Instant;

use tracing::warn;

use crate::connection::Connection;
use crate::event_loop::{HandlerKind, ReadyEvent};
use crate::proxy::ProxyState;
use crate::rate_limiter::Clock;

const READ_CHUNK: usize = 32 * 1024;

pub fn handle_ready<C: Clock>(state: &Arc<ProxyState<C>>, event: &ReadyEvent) {
    let Some(conn) = state.connections.get(event.payload) else {
        return;
    };
    let _worker = state.worker.lock();
    let from_client = event.kind == HandlerKind::ClientToServer;

    let mut close = false;
    {
        let mut st = conn.state.lock();
        st.recent_time = Instant::now();

        let mut buf = [0u8; READ_CHUNK];
        let read_result = if from_client {
            st.client.as_mut().map(|s| s.read(&mut buf))
        } else {
            st.backend.as_mut().map(|s| s.read(&mut buf))
        };

        let n = match read_result {
            Some(Ok(0)) => {
                close = true;
                0
            }
            Some(Ok(n)) => n,
            Some(Err(e)) if e.kind() == ErrorKind::WouldBlock => return,
            Some(Err(_)) => {
                close = true;
                0
            }
            None => {
                close = true;
                0
            }
        };

        if !close {
            let was_enabled = state.analyzer.is_enabled();
            let _ = state.analyzer.analyze(conn.id(), from_client, &buf[..n]);
            if was_enabled && !state.analyzer.is_enabled() {
                state.metrics.analyzer_faults.inc();
            }

            if from_client && st.request_count > state.config.max_allowed_requests {
                warn!(conn_id = conn.id(), ip = %st.ip, "client exceeded max allowed requests, closing");
                close = true;
            } else {
                let write_result = if from_client {
                    st.backend.as_mut().map(|s| s.write_all(&buf[..n]))
                } else {
                    st.client.as_mut().map(|s| s.write_all(&buf[..n]))
                };
                match write_result {
                    Some(Ok(())) => {
                        if from_client {
                            st.bytes_sent += n as u64;
                            st.request_count += 1;
                            state.metrics.bytes_sent.inc_by(n as u64);
                        } else {
                            st.bytes_received += n as u64;
                            st.response_count += 1;
                            state.metrics.bytes_received.inc_by(n as u64);
                        }
                        let mut report = state.report.lock();
                        report.total_requests += 1;
                    }
                    _ => close = true,
                }
            }
        }
    }

    if close {
        close_connection(state, &conn, false);
    }
}

/// Tears down a connection record: detaches from the global list,
/// shuts down and unregisters both fds, releases the analyzer handle,
/// records accounting, and returns the record to the free pool.
/// Called both from the relay (`idle = false`) and the reaper
/// (`idle = true`).
pub fn close_connection<C: Clock>(state: &Arc<ProxyState<C>>, conn: &Arc<Connection>, idle: bool) {
    let Some(conn) = state.connections.detach(conn.id()) else {
        return;
    };

    let (sn, insert_id, bytes_received, request_count, analyzer_handle, client_handle, backend_handle) = {
        let mut st = conn.state.lock();
        if let Some(client) = st.client.as_ref() {
            let _ = client.shutdown(std::net::Shutdown::Both);
        }
        if let Some(backend) = st.backend.as_ref() {
            let _ = backend.shutdown(std::net::Shutdown::Both);
        }
        let sn = st.session.as_ref().map(|s| s.sn).unwrap_or(0);
        (
            sn,
            st.insert_id,
            st.bytes_received,
            st.request_count,
            st.analyzer_handle.take(),
            st.client_handle.take(),
            st.backend_handle.take(),
        )
    };

    {
        let mut events = state.events.lock();
        let mut st = conn.state.lock();
        if let (Some(h), Some(stream)) = (client_handle, st.client.as_mut()) {
            events.unregister(h, stream);
        }
        if let (Some(h), Some(stream)) = (backend_handle, st.backend.as_mut()) {
            events.unregister(h, stream);
        }
    }

    if let Some(handle) = analyzer_handle {
        state.analyzer.release_handle(handle);
    }

    if sn != 0 {
        state.db.connection_close(insert_id, bytes_received, request_count, idle);
    }
    state.db.done();

    state.metrics.connections_closed.inc();
    state.connections.release(conn);
    state.metrics.live_connections.set(state.connections.live_count() as i64);
}
