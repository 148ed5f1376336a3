//! The Idle Reaper (spec §4.5): a periodic scan that closes
//! connections exceeding an inactivity deadline. Grounded in
//! `clean_idle_connections`/`tell_time` in
//! `examples/original_source/src/proxying.c`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::proxy::ProxyState;
use crate::rate_limiter::Clock;
use crate::relay::close_connection;

const REPORT_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Snapshots the live list (without holding its lock across the
/// scan), then closes every record whose inactivity exceeds
/// `expiring_timeout`. Also fires the 15-minute uptime/throughput
/// report (SPEC_FULL.md §C.1).
pub fn reap_idle<C: Clock>(state: &Arc<ProxyState<C>>) {
    let snapshot = state.connections.snapshot();
    let now = Instant::now();
    let timeout = state.config.expiring_timeout;

    for conn in snapshot {
        let idle_for = {
            let st = conn.state.lock();
            now.saturating_duration_since(st.recent_time)
        };
        if idle_for > timeout {
            close_connection(state, &conn, true);
        }
    }

    maybe_report(state);
}

/// Shutdown path (spec §5): reaper invoked with "a negative timeout",
/// i.e. close every connection unconditionally.
pub fn close_all<C: Clock>(state: &Arc<ProxyState<C>>) {
    for conn in state.connections.snapshot() {
        close_connection(state, &conn, false);
    }
}

fn maybe_report<C: Clock>(state: &Arc<ProxyState<C>>) {
    let mut report = state.report.lock();
    if report.last_report_at.elapsed() < REPORT_INTERVAL {
        return;
    }

    let uptime = state.start_time.elapsed();
    let days = uptime.as_secs() / 86_400;
    let hours = (uptime.as_secs() % 86_400) / 3_600;
    let minutes = (uptime.as_secs() % 3_600) / 60;
    let seconds = uptime.as_secs() % 60;

    let window = report.last_report_at.elapsed().as_secs_f64().max(1.0);
    let recent_connections = report.total_connections - report.recent_connections_at_last_report;
    let recent_requests = report.total_requests - report.recent_requests_at_last_report;

    info!(
        uptime = format!("{days}d {hours:02}:{minutes:02}:{seconds:02}"),
        event_loop_registrations = state.events.lock().count(),
        recent_users = state.user_counter.load(std::sync::atomic::Ordering::Relaxed),
        total_connections = report.total_connections,
        recent_connections,
        recent_requests_per_sec = recent_requests as f64 / window,
        lifetime_requests_per_sec = report.total_requests as f64 / uptime.as_secs_f64().max(1.0),
        "uptime and throughput report"
    );

    report.last_report_at = Instant::now();
    report.recent_connections_at_last_report = report.total_connections;
    report.recent_requests_at_last_report = report.total_requests;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::config::{Config, RawConfig};
    use crate::db::MockGate;
    use crate::metrics::Metrics;
    use crate::rate_limiter::{ManualClock, RateLimiter};

    fn test_state() -> Arc<ProxyState<ManualClock>> {
        let raw: RawConfig = toml::from_str("servers = [\"127.0.0.1:1\"]\nexpiring-timeout = 180").unwrap();
        let config = Config::from_raw(raw).unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::with_clock(16, Duration::from_secs(120), clock);
        let db: Arc<dyn crate::db::PolicyGate> = Arc::new(MockGate::default());
        Arc::new(ProxyState::new(config, limiter, db, Analyzer::new(), Metrics::new()).unwrap())
    }

    #[test]
    fn idle_connection_is_detached_and_pooled() {
        let state = test_state();
        let conn = state.connections.allocate();
        conn.state.lock().recent_time = Instant::now() - Duration::from_secs(200);
        state.connections.attach(conn.clone());

        reap_idle(&state);

        assert_eq!(state.connections.live_count(), 0);
    }

    #[test]
    fn fresh_connection_survives_reap() {
        let state = test_state();
        let conn = state.connections.allocate();
        state.connections.attach(conn.clone());

        reap_idle(&state);

        assert_eq!(state.connections.live_count(), 1);
    }
}
