//! The Database Policy Gate (spec §4.3): a serialized façade around a
//! SQL client exposing only the semantic operations the acceptor
//! needs. The SQL implementation itself is an external collaborator
//! (spec §1) — this module owns the operation set, reconnect policy,
//! and prepared-statement cache; the SQL text lives in configuration.

pub mod queries;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use mysql::prelude::Queryable;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::DbError;
use queries::{QueryName, QueryTable};

const DATABASE_IDLE_SECS: u64 = 300;
const MAX_RECONNECT_ATTEMPTS: u32 = 60;
const RECONNECT_SLEEP: Duration = Duration::from_secs(10);
const RECONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct AuthorizedSession {
    pub sn: i64,
    pub account: Option<String>,
    pub channel: i32,
}

/// The narrow interface the acceptor consults (spec §4.4, §4.3).
/// Implemented by `MySqlGate` in production and by `MockGate` (behind
/// `#[cfg(test)]` / the `testing` feature) in the test suite, following
/// the teacher's pattern of trait-bounded backends
/// (`ComputeConnectBackend` in `proxy::proxy::connect_compute`).
pub trait PolicyGate: Send + Sync {
    fn check_available(&self, ip: &str) -> Option<AuthorizedSession>;
    /// `insert_id` is the row id `connection_established` returned for
    /// this connection, not the session serial — close accounting
    /// targets the row it created (spec §3's "database insert id for
    /// close accounting").
    fn connection_close(&self, insert_id: i64, bytes_received: u64, request_count: u32, idle: bool);
    fn connection_established(&self, sn: i64, account: Option<&str>, ip: &str) -> i64;
    fn connection_not_allowed(&self, ip: &str);
    fn connection_blacklisted(&self, ip: &str) -> u64;
    fn check_vip(&self, ip: &str) -> u64;
    fn add_ip_to_auto_blacklist(&self, ip: &str) -> u64;
    fn fail_guessing(&self, ip: &str) -> bool;
    fn reload_product_names(&self);
    fn get_product_name(&self, app_id: &str, kms_id: &str) -> Option<String>;
    /// KMS licensing detail row, recorded by the packet analyzer plugin
    /// via this gate (`add_kms_details` in `db_service.c`).
    #[allow(clippy::too_many_arguments)]
    fn add_kms_details(
        &self,
        ip: &str,
        account: Option<&str>,
        workstation: &str,
        major_version: i32,
        minor_version: i32,
        app_id: &str,
        kms_id: &str,
        client_machine_id: &str,
        remaining_min: i32,
    ) -> u64;
    /// Records or refreshes the owning account for a client machine id,
    /// branching between an insert-owner and an access-refresh query
    /// depending on whether an account is already known
    /// (`update_machine_owner` in `db_service.c`).
    fn update_machine_owner(&self, ip: &str, account: Option<&str>, client_machine_id: &str) -> u64;
    /// Periodic idle/age based connection cycling (spec §4.3 `close_idle`).
    fn done(&self);
}

enum Conn {
    Disconnected,
    Connected {
        inner: mysql::Conn,
        stmts: HashMap<QueryName, mysql::Statement>,
        connected_at: Instant,
        last_used: Instant,
    },
}

struct State {
    conn: Conn,
}

pub struct MySqlGate {
    opts: mysql::Opts,
    queries: QueryTable,
    state: Mutex<State>,
    max_connection_time: Duration,
    product_names: DashMap<String, String>,
}

impl MySqlGate {
    pub fn new(opts: mysql::Opts, sql: &HashMap<String, String>, max_connection_time: Duration) -> Result<Self, DbError> {
        Ok(MySqlGate {
            opts,
            queries: QueryTable::from_config(sql),
            state: Mutex::new(State {
                conn: Conn::Disconnected,
            }),
            max_connection_time,
            product_names: DashMap::new(),
        })
    }

    /// Ensures `state.conn` is `Connected`, retrying up to
    /// `MAX_RECONNECT_ATTEMPTS` times with a 10s sleep between the
    /// second and subsequent attempts (spec §4.3). Per the redesign
    /// note in SPEC_FULL.md §E, this path uses bounded retries with an
    /// explicit per-attempt timeout rather than signal/panic
    /// interception — a genuine segfault in the driver would still
    /// abort the process, same as upstream `mysql`.
    fn ensure_connected(&self, state: &mut State) -> Result<(), DbError> {
        if matches!(state.conn, Conn::Connected { .. }) {
            return Ok(());
        }

        let mut opts_builder = mysql::OptsBuilder::from_opts(self.opts.clone());
        opts_builder = opts_builder.tcp_connect_timeout(Some(RECONNECT_ATTEMPT_TIMEOUT));

        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            if attempt > 1 {
                std::thread::sleep(RECONNECT_SLEEP);
            }
            match mysql::Conn::new(opts_builder.clone()) {
                Ok(conn) => {
                    info!(attempt, "database reconnected");
                    let now = Instant::now();
                    state.conn = Conn::Connected {
                        inner: conn,
                        stmts: HashMap::new(),
                        connected_at: now,
                        last_used: now,
                    };
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "database reconnect attempt failed");
                }
            }
        }

        error!(attempts = MAX_RECONNECT_ATTEMPTS, "database reconnect exhausted");
        Err(DbError::ReconnectExhausted {
            attempts: MAX_RECONNECT_ATTEMPTS,
        })
    }

    fn statement(
        &self,
        inner: &mut mysql::Conn,
        stmts: &mut HashMap<QueryName, mysql::Statement>,
        name: QueryName,
    ) -> Result<mysql::Statement, DbError> {
        if let Some(stmt) = stmts.get(&name) {
            return Ok(stmt.clone());
        }
        let sql = self
            .queries
            .get(name)
            .ok_or(DbError::MissingStatement(name.into()))?;
        let stmt = inner
            .prep(sql)
            .map_err(|e| DbError::Transport(e.to_string()))?;
        stmts.insert(name, stmt.clone());
        Ok(stmt)
    }

    /// Runs `op` against a connected client, triggering a reconnect and
    /// transitioning to `Disconnected` on any transport error. Returns
    /// `None` (rather than propagating) on a transport error once
    /// reconnect has been kicked off for next time, matching "on
    /// transport error triggers reconnect and returns none" (§4.3).
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut mysql::Conn, &mut HashMap<QueryName, mysql::Statement>) -> Result<T, DbError>,
    ) -> Option<T> {
        let mut state = self.state.lock();
        if let Err(e) = self.ensure_connected(&mut state) {
            if e.is_fatal() {
                error!("unrecoverable database failure, exiting");
                std::process::exit(139);
            }
            return None;
        }

        let result = match &mut state.conn {
            Conn::Connected {
                inner,
                stmts,
                last_used,
                ..
            } => {
                *last_used = Instant::now();
                f(inner, stmts)
            }
            Conn::Disconnected => unreachable!("ensure_connected guarantees Connected"),
        };

        match result {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "database operation failed, marking disconnected");
                state.conn = Conn::Disconnected;
                None
            }
        }
    }
}

impl PolicyGate for MySqlGate {
    fn check_available(&self, ip: &str) -> Option<AuthorizedSession> {
        self.with_conn(|conn, stmts| {
            let stmt = self.statement(conn, stmts, QueryName::CheckAvailable)?;
            let row: Option<(i64, Option<String>, i32)> = conn
                .exec_first(&stmt, (ip,))
                .map_err(|e| DbError::Transport(e.to_string()))?;
            Ok(row.map(|(sn, account, channel)| AuthorizedSession { sn, account, channel }))
        })
        .flatten()
    }

    fn connection_close(&self, insert_id: i64, bytes_received: u64, request_count: u32, idle: bool) {
        self.with_conn(|conn, stmts| {
            let stmt = self.statement(conn, stmts, QueryName::ConnectionClose)?;
            conn.exec_drop(&stmt, (insert_id, bytes_received, request_count, idle))
                .map_err(|e| DbError::Transport(e.to_string()))
        });
    }

    fn connection_established(&self, sn: i64, account: Option<&str>, ip: &str) -> i64 {
        self.with_conn(|conn, stmts| {
            let stmt = self.statement(conn, stmts, QueryName::ConnectionEstablished)?;
            conn.exec_drop(&stmt, (sn, account, ip))
                .map_err(|e| DbError::Transport(e.to_string()))?;
            Ok(conn.last_insert_id() as i64)
        })
        .unwrap_or(0)
    }

    fn connection_not_allowed(&self, ip: &str) {
        self.with_conn(|conn, stmts| {
            let stmt = self.statement(conn, stmts, QueryName::ConnectionNotAllowed)?;
            conn.exec_drop(&stmt, (ip,))
                .map_err(|e| DbError::Transport(e.to_string()))
        });
    }

    fn connection_blacklisted(&self, ip: &str) -> u64 {
        self.with_conn(|conn, stmts| {
            let stmt = self.statement(conn, stmts, QueryName::Blacklist)?;
            conn.exec_drop(&stmt, (ip,))
                .map_err(|e| DbError::Transport(e.to_string()))?;
            Ok(conn.affected_rows())
        })
        .unwrap_or(0)
    }

    fn check_vip(&self, ip: &str) -> u64 {
        self.with_conn(|conn, stmts| {
            let stmt = self.statement(conn, stmts, QueryName::CheckVip)?;
            conn.exec_drop(&stmt, (ip,))
                .map_err(|e| DbError::Transport(e.to_string()))?;
            Ok(conn.affected_rows())
        })
        .unwrap_or(0)
    }

    fn add_ip_to_auto_blacklist(&self, ip: &str) -> u64 {
        self.with_conn(|conn, stmts| {
            let stmt = self.statement(conn, stmts, QueryName::AddToBlacklist)?;
            conn.exec_drop(&stmt, (ip,))
                .map_err(|e| DbError::Transport(e.to_string()))?;
            Ok(conn.affected_rows())
        })
        .unwrap_or(0)
    }

    fn fail_guessing(&self, ip: &str) -> bool {
        self.with_conn(|conn, stmts| {
            let stmt = self.statement(conn, stmts, QueryName::CallFailureGuessing)?;
            let row: Option<i64> = conn
                .exec_first(&stmt, (ip,))
                .map_err(|e| DbError::Transport(e.to_string()))?;
            Ok(row.unwrap_or(0) > 5)
        })
        .unwrap_or(false)
    }

    fn reload_product_names(&self) {
        let loaded = self.with_conn(|conn, stmts| {
            let stmt = self.statement(conn, stmts, QueryName::AllProductNames)?;
            let rows: Vec<(String, String, String)> = conn
                .exec(&stmt, ())
                .map_err(|e| DbError::Transport(e.to_string()))?;
            Ok(rows)
        });
        if let Some(rows) = loaded {
            self.product_names.clear();
            for (app_id, kms_id, product_name) in rows {
                self.product_names.insert(format!("{app_id}-{kms_id}"), product_name);
            }
        }
    }

    fn get_product_name(&self, app_id: &str, kms_id: &str) -> Option<String> {
        self.product_names
            .get(&format!("{app_id}-{kms_id}"))
            .map(|v| v.clone())
    }

    fn add_kms_details(
        &self,
        ip: &str,
        account: Option<&str>,
        workstation: &str,
        major_version: i32,
        minor_version: i32,
        app_id: &str,
        kms_id: &str,
        client_machine_id: &str,
        remaining_min: i32,
    ) -> u64 {
        self.with_conn(|conn, stmts| {
            let stmt = self.statement(conn, stmts, QueryName::AddDetails)?;
            conn.exec_drop(
                &stmt,
                (
                    account.unwrap_or(""),
                    ip,
                    workstation,
                    major_version,
                    minor_version,
                    app_id,
                    kms_id,
                    client_machine_id,
                    remaining_min,
                ),
            )
            .map_err(|e| DbError::Transport(e.to_string()))?;
            Ok(conn.affected_rows())
        })
        .unwrap_or(0)
    }

    fn update_machine_owner(&self, ip: &str, account: Option<&str>, client_machine_id: &str) -> u64 {
        self.with_conn(|conn, stmts| match account {
            Some(acct) => {
                let stmt = self.statement(conn, stmts, QueryName::AddMachineOwner)?;
                conn.exec_drop(&stmt, (client_machine_id, acct, ip, ip, acct))
                    .map_err(|e| DbError::Transport(e.to_string()))?;
                Ok(conn.affected_rows())
            }
            None => {
                let stmt = self.statement(conn, stmts, QueryName::UpdateMachineAccess)?;
                conn.exec_drop(&stmt, (client_machine_id, "", ip, ip))
                    .map_err(|e| DbError::Transport(e.to_string()))?;
                Ok(conn.affected_rows())
            }
        })
        .unwrap_or(0)
    }

    fn done(&self) {
        let mut state = self.state.lock();
        if let Conn::Connected {
            connected_at,
            last_used,
            ..
        } = &state.conn
        {
            let now = Instant::now();
            let idle = now.duration_since(*last_used) > Duration::from_secs(DATABASE_IDLE_SECS);
            let too_old = now.duration_since(*connected_at) > self.max_connection_time;
            if idle || too_old {
                info!(idle, too_old, "closing idle/aged database connection");
                state.conn = Conn::Disconnected;
            }
        }
    }
}

/// In-memory stand-in used by the integration tests in `tests/` and by
/// `--testing` mode; lets the acceptor's classification logic be
/// exercised deterministically without a live database.
#[cfg(any(test, feature = "testing"))]
pub struct MockGate {
    pub sessions: DashMap<String, AuthorizedSession>,
    pub blacklisted: DashMap<String, bool>,
    pub vip: DashMap<String, bool>,
    pub auto_blacklisted: DashMap<String, ()>,
    pub fail_guessing_answer: std::sync::atomic::AtomicBool,
}

#[cfg(any(test, feature = "testing"))]
impl Default for MockGate {
    fn default() -> Self {
        MockGate {
            sessions: DashMap::new(),
            blacklisted: DashMap::new(),
            vip: DashMap::new(),
            auto_blacklisted: DashMap::new(),
            fail_guessing_answer: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[cfg(any(test, feature = "testing"))]
impl PolicyGate for MockGate {
    fn check_available(&self, ip: &str) -> Option<AuthorizedSession> {
        self.sessions.get(ip).map(|s| s.clone())
    }

    fn connection_close(&self, _insert_id: i64, _bytes_received: u64, _request_count: u32, _idle: bool) {}

    fn connection_established(&self, sn: i64, _account: Option<&str>, _ip: &str) -> i64 {
        sn
    }

    fn connection_not_allowed(&self, _ip: &str) {}

    fn connection_blacklisted(&self, ip: &str) -> u64 {
        if self.blacklisted.get(ip).map(|v| *v).unwrap_or(false) {
            1
        } else {
            0
        }
    }

    fn check_vip(&self, ip: &str) -> u64 {
        if self.vip.get(ip).map(|v| *v).unwrap_or(false) {
            1
        } else {
            0
        }
    }

    fn add_ip_to_auto_blacklist(&self, ip: &str) -> u64 {
        self.auto_blacklisted.insert(ip.to_string(), ());
        1
    }

    fn fail_guessing(&self, _ip: &str) -> bool {
        self.fail_guessing_answer.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn reload_product_names(&self) {}

    fn get_product_name(&self, _app_id: &str, _kms_id: &str) -> Option<String> {
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn add_kms_details(
        &self,
        _ip: &str,
        _account: Option<&str>,
        _workstation: &str,
        _major_version: i32,
        _minor_version: i32,
        _app_id: &str,
        _kms_id: &str,
        _client_machine_id: &str,
        _remaining_min: i32,
    ) -> u64 {
        0
    }

    fn update_machine_owner(&self, _ip: &str, _account: Option<&str>, _client_machine_id: &str) -> u64 {
        0
    }

    fn done(&self) {}
}
