//! Orchestrator wiring (spec §5, §9 "no process-wide registry"): builds
//! every component as a value with explicit injected dependencies and
//! spawns the threads named in §5.

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{error, info};

use crate::analyzer::Analyzer;
use crate::backend::BackendTable;
use crate::config::Config;
use crate::connection::ConnectionTable;
use crate::db::PolicyGate;
use crate::event_loop::EventLoop;
use crate::metrics::Metrics;
use crate::rate_limiter::{Clock, RateLimiter, SystemClock};

/// Everything the acceptor, relay, reaper, and minute tick share.
/// Built once at startup and handed around behind an `Arc`.
pub struct ProxyState<C: Clock = SystemClock> {
    pub config: Config,
    pub backends: BackendTable,
    pub limiter: Arc<RateLimiter<C>>,
    pub db: Arc<dyn PolicyGate>,
    pub analyzer: Arc<Analyzer>,
    pub connections: ConnectionTable,
    pub metrics: Arc<Metrics>,
    pub events: Mutex<EventLoop>,
    /// Spec §5 "worker mutex": serializes all data-plane mutations
    /// (accept and relay).
    pub worker: Mutex<()>,
    pub user_counter: AtomicU64,
    pub terminate: AtomicBool,
    pub start_time: Instant,
    pub report: Mutex<ReportState>,
}

/// Running totals consulted by the 15-minute uptime/throughput report
/// (spec §4.5), grounded in the original `tell_time`'s recent-vs-total
/// bookkeeping (SPEC_FULL.md §C.1).
pub struct ReportState {
    pub last_report_at: Instant,
    pub total_connections: u64,
    pub total_requests: u64,
    pub recent_connections_at_last_report: u64,
    pub recent_requests_at_last_report: u64,
}

impl<C: Clock> ProxyState<C> {
    pub fn new(
        config: Config,
        limiter: Arc<RateLimiter<C>>,
        db: Arc<dyn PolicyGate>,
        analyzer: Arc<Analyzer>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, crate::error::EventLoopError> {
        let backends = BackendTable::new(config.servers.clone(), config.default_server, config.on_failed_channel);
        Ok(ProxyState {
            config,
            backends,
            limiter,
            db,
            analyzer,
            connections: ConnectionTable::new(),
            metrics,
            events: Mutex::new(EventLoop::new()?),
            worker: Mutex::new(()),
            user_counter: AtomicU64::new(0),
            terminate: AtomicBool::new(false),
            start_time: Instant::now(),
            report: Mutex::new(ReportState {
                last_report_at: Instant::now(),
                total_connections: 0,
                total_requests: 0,
                recent_connections_at_last_report: 0,
                recent_requests_at_last_report: 0,
            }),
        })
    }

    pub fn is_terminating(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    pub fn request_shutdown(&self) {
        self.terminate.store(true, Ordering::Release);
        self.limiter.shutdown();
    }
}

/// Runs the proxy thread: owns the listening socket and the event
/// loop, dispatches accept/relay work, and checks the termination
/// flag between iterations.
pub fn run_proxy_thread(state: Arc<ProxyState>) -> std::io::Result<()> {
    // IPv6 socket bound to `::`, accepting both native IPv6 and
    // IPv4-mapped-IPv6 clients (spec §6). `SO_REUSEADDR` and
    // `SO_KEEPALIVE` on, backlog 5.
    let addr = SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), state.config.port);
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_keepalive(true)?;
    socket.bind(&addr.into())?;
    socket.listen(5)?;
    socket.set_nonblocking(true)?;
    let mut listener = TcpListener::from_std(socket.into());

    let listener_handle = {
        let mut events = state.events.lock();
        events.register(&mut listener, crate::event_loop::HandlerKind::Listener, 0)?
    };

    info!(port = state.config.port, "proxy thread listening");

    while !state.is_terminating() {
        let ready = {
            let mut events = state.events.lock();
            events.poll_once_timeout(Duration::from_millis(500))
        };
        match ready {
            Ok(Some(event)) => match event.kind {
                crate::event_loop::HandlerKind::Listener => {
                    crate::acceptor::handle_listener_ready(&state, &listener);
                }
                crate::event_loop::HandlerKind::ClientToServer | crate::event_loop::HandlerKind::ServerToClient => {
                    crate::relay::handle_ready(&state, &event);
                }
                crate::event_loop::HandlerKind::Admin => {}
            },
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "event loop poll failed");
            }
        }
    }

    // Shutdown: reaper with a negative timeout closes everything, then
    // the listening socket itself (spec §5).
    crate::reaper::close_all(&state);
    let mut events = state.events.lock();
    events.unregister(listener_handle, &mut listener);
    info!("proxy thread stopped");
    Ok(())
}
