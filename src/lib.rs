//! TCP reverse proxy with IP-based classification, auto-blocklist rate
//! limiting, and selective backend routing via a database policy gate.

pub mod acceptor;
pub mod admin;
pub mod analyzer;
pub mod backend;
pub mod cli;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod db;
pub mod error;
pub mod event_loop;
pub mod logging;
pub mod metrics;
pub mod minute_tick;
pub mod proxy;
pub mod rate_limiter;
pub mod reaper;
pub mod relay;
pub mod signals;

use std::sync::Arc;

use tracing::info;

use crate::analyzer::Analyzer;
use crate::config::Config;
use crate::db::{MySqlGate, PolicyGate};
use crate::logging::LogHandle;
use crate::metrics::Metrics;
use crate::proxy::ProxyState;
use crate::rate_limiter::{RateLimiter, SystemClock};

/// Wires every component together and runs until a termination signal
/// arrives. This is the single entrypoint `main.rs` calls into, kept
/// here rather than in the binary so integration tests can drive it
/// too (spec §9 "no process-wide registry" — everything is an owned
/// value threaded through explicitly).
pub fn run(config: Config, log: Arc<LogHandle>) -> anyhow::Result<()> {
    let limiter = RateLimiter::<SystemClock>::new(config.hash_size, config.monitor_period);

    let db: Arc<dyn PolicyGate> = if config.enable_database {
        let opts = config.mysql_opts();
        Arc::new(MySqlGate::new(opts, &config.sql, config.max_db_connection_time)?)
    } else {
        #[cfg(any(test, feature = "testing"))]
        {
            Arc::new(db::MockGate::default())
        }
        #[cfg(not(any(test, feature = "testing")))]
        {
            anyhow::bail!("enable-database = false requires building with the `testing` feature");
        }
    };

    let analyzer = Analyzer::new();
    if config.load_plugin_on_boot {
        if let Err(e) = analyzer.load(&config.packet_analyzer_plugin) {
            tracing::warn!(error = %e, "failed to load analyzer plugin on boot");
        } else {
            analyzer.set_enabled(config.enable_plugin_on_boot);
        }
    }

    let metrics = Metrics::new();
    let state = Arc::new(ProxyState::new(config, limiter.clone(), db, analyzer, metrics.clone())?);

    if let Some(user) = state.config.run_as.clone() {
        daemon::drop_privileges(&user)?;
    }

    let expiry_limiter = limiter.clone();
    std::thread::Builder::new()
        .name("expiry".into())
        .spawn(move || expiry_limiter.run_expiry_worker())?;

    {
        let metrics = metrics.clone();
        let addr = state.config.metrics_bind.clone();
        std::thread::Builder::new().name("metrics".into()).spawn(move || {
            if let Err(e) = metrics.serve(&addr) {
                tracing::error!(error = %e, "metrics thread exited with an error");
            }
        })?;
    }

    {
        let state = state.clone();
        std::thread::Builder::new()
            .name("minute-tick".into())
            .spawn(move || minute_tick::run(state))?;
    }

    {
        let state = state.clone();
        let log = log.clone();
        std::thread::Builder::new()
            .name("admin".into())
            .spawn(move || {
                if let Err(e) = admin::serve(state, log) {
                    tracing::error!(error = %e, "admin thread exited with an error");
                }
            })?;
    }

    signals::spawn(state.clone(), log)?;

    info!("starting proxy thread");
    proxy::run_proxy_thread(state)?;
    Ok(())
}
