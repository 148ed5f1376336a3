//! End-to-end scenarios against a loopback backend and a `MockGate`
//! (spec §8). Requires the `testing` feature (see the `[[test]]` entry
//! in `Cargo.toml`), since `MockGate`/`AuthorizedSession` are only
//! visible under `#[cfg(any(test, feature = "testing"))]` and this
//! crate compiles as a separate binary from the lib's own test cfg.

use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpListener as MioTcpListener;

use tcpproxy::acceptor::handle_listener_ready;
use tcpproxy::analyzer::Analyzer;
use tcpproxy::config::{Config, RawConfig};
use tcpproxy::db::{AuthorizedSession, MockGate, PolicyGate};
use tcpproxy::metrics::Metrics;
use tcpproxy::proxy::ProxyState;
use tcpproxy::rate_limiter::{ManualClock, RateLimiter};
use tcpproxy::reaper::reap_idle;

/// A backend the acceptor can successfully connect a channel to. Kept
/// alive for the test's duration; never needs to actually `accept()`
/// since a completed three-way handshake is enough for
/// `BackendTable::connect` to succeed.
fn spawn_backend() -> (StdTcpListener, u16) {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn mio_listener() -> (MioTcpListener, SocketAddr) {
    let listener = MioTcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

fn build_state(toml_body: &str) -> (Arc<ProxyState<ManualClock>>, Arc<MockGate>) {
    let raw: RawConfig = toml::from_str(toml_body).expect("valid test config");
    let config = Config::from_raw(raw).unwrap();
    let clock = Arc::new(ManualClock::new(1_000_000));
    let limiter = RateLimiter::with_clock(16, Duration::from_secs(120), clock);
    let db = Arc::new(MockGate::default());
    let db_dyn: Arc<dyn PolicyGate> = db.clone();
    let state = Arc::new(ProxyState::new(config, limiter, db_dyn, Analyzer::new(), Metrics::new()).unwrap());
    (state, db)
}

/// Connects a client and drives `handle_listener_ready` until the
/// connection is accepted or a small number of attempts is exhausted —
/// covers the rare case where `accept()` still sees `WouldBlock`
/// immediately after a local loopback `connect()` returns.
fn accept_one(state: &Arc<ProxyState<ManualClock>>, listener: &MioTcpListener, client: StdTcpStream) {
    std::mem::drop(client); // handshake is already complete; the fd itself isn't needed past connect()
    for _ in 0..20 {
        handle_listener_ready(state, listener);
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn authorized_session_is_admitted_on_its_assigned_channel() {
    let (_backend, port) = spawn_backend();
    let (listener, addr) = mio_listener();
    let (state, db) = build_state(&format!("servers = [\"127.0.0.1:{port}\"]\n"));

    db.sessions.insert(
        "127.0.0.1".to_string(),
        AuthorizedSession {
            sn: 42,
            account: Some("alice".to_string()),
            channel: 0,
        },
    );

    let client = StdTcpStream::connect(addr).unwrap();
    accept_one(&state, &listener, client);

    assert_eq!(state.connections.live_count(), 1);
    assert_eq!(state.user_counter.load(Ordering::Relaxed), 1);
}

#[test]
fn whitelisted_ip_without_session_uses_default_channel() {
    let (_backend, port) = spawn_backend();
    let (listener, addr) = mio_listener();
    let (state, _db) = build_state(&format!(
        "servers = [\"127.0.0.1:{port}\"]\nwhite-list-ip-prefix = [\"127.0.0.1\"]\nthreshold = 50\n"
    ));

    let client = StdTcpStream::connect(addr).unwrap();
    accept_one(&state, &listener, client);

    assert_eq!(state.connections.live_count(), 1);
    // Anonymous admission counts towards the rate limiter's success
    // counter, not the authorized-session user counter.
    assert_eq!(state.user_counter.load(Ordering::Relaxed), 0);
}

#[test]
fn ip_outside_the_whitelist_is_dropped_without_a_session() {
    let (_backend, port) = spawn_backend();
    let (listener, addr) = mio_listener();
    let (state, _db) = build_state(&format!("servers = [\"127.0.0.1:{port}\"]\n"));

    let client = StdTcpStream::connect(addr).unwrap();
    accept_one(&state, &listener, client);

    assert_eq!(state.connections.live_count(), 0);
    assert_eq!(state.metrics.connections_denied.get(), 0);
}

#[test]
fn repeated_access_past_threshold_denies_and_auto_blacklists() {
    let (_backend, port) = spawn_backend();
    let (listener, addr) = mio_listener();
    let (state, db) = build_state(&format!(
        "servers = [\"127.0.0.1:{port}\"]\nwhite-list-ip-prefix = [\"127.0.0.1\"]\nthreshold = 3\npersist-threshold = 4\n"
    ));

    // Five accesses: the first three stay under threshold and are
    // admitted; the fourth breaches it (channel denied); the fifth
    // also breaches persist-threshold and triggers the blacklist add.
    for _ in 0..5 {
        let client = StdTcpStream::connect(addr).unwrap();
        accept_one(&state, &listener, client);
    }

    assert_eq!(state.connections.live_count(), 3);
    assert_eq!(state.metrics.connections_auto_blacklisted.get(), 2);
    assert!(db.auto_blacklisted.contains_key("127.0.0.1"));
}

#[test]
fn fail_guessing_diverts_to_the_fallback_channel() {
    let (_default_backend, default_port) = spawn_backend();
    let (fallback_backend, fallback_port) = spawn_backend();
    let (listener, addr) = mio_listener();
    let (state, db) = build_state(&format!(
        "servers = [\"127.0.0.1:{default_port}\", \"127.0.0.1:{fallback_port}\"]\n\
         white-list-ip-prefix = [\"127.0.0.1\"]\n\
         default-server = 0\n\
         on-failed-channel = 1\n\
         threshold = 10\n\
         persist-threshold = 100\n"
    ));
    db.fail_guessing_answer.store(true, Ordering::Relaxed);

    // Access counts 1..=4; the fourth (even, within (threshold-7, threshold])
    // is the fail-guessing candidate that triggers the diversion.
    for _ in 0..4 {
        let client = StdTcpStream::connect(addr).unwrap();
        accept_one(&state, &listener, client);
    }

    // Four accepted connections total: the first three land on the
    // default channel, the fourth diverts to the fallback.
    assert_eq!(state.connections.live_count(), 4);
    fallback_backend.set_nonblocking(true).unwrap();
    assert!(
        fallback_backend.accept().is_ok(),
        "the diverted connection should have reached the fallback channel's backend"
    );
}

#[test]
fn accepted_connection_is_reaped_once_idle() {
    let (_backend, port) = spawn_backend();
    let (listener, addr) = mio_listener();
    let (state, db) = build_state(&format!(
        "servers = [\"127.0.0.1:{port}\"]\nexpiring-timeout = 180\n"
    ));
    db.sessions.insert(
        "127.0.0.1".to_string(),
        AuthorizedSession {
            sn: 7,
            account: None,
            channel: 0,
        },
    );

    let client = StdTcpStream::connect(addr).unwrap();
    accept_one(&state, &listener, client);
    assert_eq!(state.connections.live_count(), 1);

    for conn in state.connections.snapshot() {
        conn.state.lock().recent_time = Instant::now() - Duration::from_secs(200);
    }

    reap_idle(&state);

    assert_eq!(state.connections.live_count(), 0);
}
