//! The Connection Acceptor (spec §4.4): classifies each new client
//! connection, selects a backend, establishes the paired socket, and
//! tracks its lifecycle. Grounded in `accepting_request` from
//! `examples/original_source/src/proxying.c`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::event_loop::HandlerKind;
use crate::proxy::ProxyState;
use crate::rate_limiter::{is_fail_guessing_candidate, Clock, IpEntrySnapshot};

fn classify_ip(addr: SocketAddr) -> (String, Option<Ipv4Addr>) {
    match addr.ip() {
        IpAddr::V4(v4) => (v4.to_string(), Some(v4)),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => (v4.to_string(), Some(v4)),
            None => (v6.to_string(), None),
        },
    }
}

pub fn handle_listener_ready<C: Clock>(state: &Arc<ProxyState<C>>, listener: &TcpListener) {
    let _worker = state.worker.lock();

    let (mut client, peer) = match listener.accept() {
        Ok(pair) => pair,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
        Err(e) => {
            warn!(error = %e, "accept() failed");
            return;
        }
    };

    let (ip_text, ipv4) = classify_ip(peer);
    state.metrics.connections_accepted.inc();

    let session = state.db.check_available(&ip_text);
    let mut channel: i64;
    let mut auto_blacklisted = false;
    let mut blacklisted_notice = false;
    let mut snapshot: Option<IpEntrySnapshot> = None;

    if let Some(s) = &session {
        channel = s.channel as i64;
    } else {
        let allowed = state
            .config
            .white_list_ip_prefix
            .iter()
            .any(|prefix| ip_text.to_lowercase().starts_with(&prefix.to_lowercase()));
        if !allowed {
            debug!(ip = %ip_text, "dropped, not on whitelist");
            drop(client);
            return;
        }

        channel = state.backends.default_channel() as i64;

        if state.db.connection_blacklisted(&ip_text) > 0 {
            channel = -1;
            blacklisted_notice = true;
        }

        if let Some(ip4) = ipv4 {
            let snap = state.limiter.touch(ip4);
            snapshot = Some(snap);
            let counter = snap.counter;
            let threshold = state.config.threshold;
            let persist_threshold = state.config.persist_threshold;

            if channel >= 0 {
                let default = state.backends.default_channel();
                let fallback = state.backends.fallback_channel();
                if fallback != default
                    && is_fail_guessing_candidate(counter, threshold)
                    && state.db.fail_guessing(&ip_text)
                {
                    channel = fallback as i64;
                }

                if counter as i64 > threshold && state.db.check_vip(&ip_text) == 0 {
                    channel = -1;
                    auto_blacklisted = true;
                    if counter as i64 > persist_threshold {
                        state.db.add_ip_to_auto_blacklist(&ip_text);
                        info!(ip = %ip_text, "threshold reached, add to blacklist database");
                    }
                }
            }

            if channel >= 0 {
                let age = state.limiter.now_secs().saturating_sub(snap.first_block_log_time);
                if Duration::from_secs(age) > state.config.max_persistent_time {
                    debug!(
                        ip = %ip_text,
                        elapsed_days = age as f64 / 86_400.0,
                        connection = counter,
                        success = snap.success_counter,
                        "long-running persistent entry"
                    );
                    if state.db.check_vip(&ip_text) == 0 {
                        channel = -1;
                        auto_blacklisted = true;
                        if counter as i64 > persist_threshold {
                            state.db.add_ip_to_auto_blacklist(&ip_text);
                        }
                    }
                }
            }

            if channel >= 0 {
                state.limiter.mark_success(ip4);
            }
        }
    }

    if channel < 0 {
        state.db.connection_not_allowed(&ip_text);
        drop(client);
        if auto_blacklisted {
            state.metrics.connections_auto_blacklisted.inc();
            info!(ip = %ip_text, "auto-blocklisted, connection refused");
        } else if blacklisted_notice {
            state.metrics.connections_blacklisted.inc();
            match (ipv4, snapshot) {
                (Some(ip4), Some(snap)) => throttled_blacklist_notice(state, ip4, &ip_text, snap),
                _ => info!(ip = %ip_text, "persistent blocklist, connection refused"),
            }
        } else {
            state.metrics.connections_denied.inc();
            debug!(ip = %ip_text, "connection not allowed");
        }
        return;
    }

    let idx = state.backends.clamp(channel as usize);
    let backend_std = match state.backends.connect(idx) {
        Ok(s) => s,
        Err(e) => {
            warn!(ip = %ip_text, error = %e, "backend connect failed");
            drop(client);
            return;
        }
    };
    backend_std.set_nonblocking(true).ok();
    let mut backend = mio::net::TcpStream::from_std(backend_std);

    let conn = state.connections.allocate();
    let conn_id = conn.id();

    let client_handle = {
        let mut events = state.events.lock();
        match events.register(&mut client, HandlerKind::ClientToServer, conn_id) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "event loop registration failed for client fd");
                state.connections.release(conn);
                return;
            }
        }
    };
    let backend_handle = {
        let mut events = state.events.lock();
        match events.register(&mut backend, HandlerKind::ServerToClient, conn_id) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "event loop registration failed for backend fd");
                events.unregister(client_handle, &mut client);
                state.connections.release(conn);
                return;
            }
        }
    };

    {
        let mut st = conn.state.lock();
        st.client = Some(client);
        st.backend = Some(backend);
        st.client_handle = Some(client_handle);
        st.backend_handle = Some(backend_handle);
        st.ip = ip_text.clone();
        st.attempts = snapshot.map(|s| s.counter).unwrap_or(0);
        st.session = session.clone();
        if let Some(s) = &session {
            st.insert_id = state.db.connection_established(s.sn, s.account.as_deref(), &ip_text);
        }
        st.analyzer_handle = state.analyzer.allocate_handle();
    }

    if session.is_some() {
        state.user_counter.fetch_add(1, Ordering::Relaxed);
    }
    {
        let mut report = state.report.lock();
        report.total_connections += 1;
    }

    state.connections.attach(conn);
    state.metrics.live_connections.set(state.connections.live_count() as i64);

    info!(ip = %ip_text, channel = idx, conn_id, "Connect from client");
}

/// Blocklisted (not auto-blocklisted) peers get a notice at most once
/// per 1800s per entry; every other call is a debug line (spec §4.4
/// step 5). Reuses the snapshot from the single `touch()` already
/// performed this accept rather than touching again.
fn throttled_blacklist_notice<C: Clock>(
    state: &Arc<ProxyState<C>>,
    ip: Ipv4Addr,
    ip_text: &str,
    snapshot: IpEntrySnapshot,
) {
    const NOTICE_INTERVAL: u64 = 1800;
    let now = state.limiter.now_secs();
    if now.saturating_sub(snapshot.first_block_log_time) >= NOTICE_INTERVAL {
        state.limiter.reset_log_time(ip);
        info!(ip = %ip_text, "persistent blocklist, connection refused");
    } else {
        debug!(ip = %ip_text, "persistent blocklist, connection refused");
    }
}
