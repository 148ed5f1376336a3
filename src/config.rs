//! Typed configuration, the narrow boundary the external file parser
//! (out of scope per spec §1) hands a value across. The core never
//! touches a raw key/value map after this module has run.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

fn default_port() -> u16 {
    80
}
fn default_zero() -> i32 {
    0
}
fn default_threshold() -> i32 {
    5
}
fn default_persist_threshold() -> i32 {
    5
}
fn default_max_persistent_day() -> i32 {
    5
}
fn default_max_allowed_requests() -> u32 {
    6
}
fn default_expiring_timeout() -> u64 {
    180
}
fn default_hash_size() -> usize {
    521
}
fn default_monitor_period() -> u64 {
    86_400
}
fn default_max_db_connection_time() -> u64 {
    3_600
}
fn default_log_priority() -> String {
    "notice".into()
}
fn default_socket_name() -> String {
    "/var/run/tcp-proxy/tcp-proxy.sock".into()
}
fn default_packet_analyzer_plugin() -> String {
    "/usr/local/libexec/tcp-proxy/libpkanalyzer.so".into()
}

fn default_mysql_server() -> String {
    "127.0.0.1".into()
}
fn default_metrics_bind() -> String {
    "127.0.0.1:9090".into()
}

/// Raw, directly-deserialized shape of the TOML config file. Mirrors
/// the key table in spec §6 one-for-one, plus the `mysql-*` connection
/// keys (`CONF_VAR_MYSQL_*` in `sysconf.h`) that the distilled table
/// dropped — the Database Policy Gate still needs somewhere to dial.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default = "default_zero")]
    pub default_server: i32,
    #[serde(default = "default_zero")]
    pub on_failed_channel: i32,
    #[serde(default = "default_threshold")]
    pub threshold: i32,
    #[serde(default = "default_persist_threshold")]
    pub persist_threshold: i32,
    #[serde(default = "default_max_persistent_day")]
    pub max_persistent_day: i32,
    #[serde(default = "default_max_allowed_requests")]
    pub max_allowed_requests: u32,
    #[serde(default)]
    pub white_list_ip_prefix: Vec<String>,
    #[serde(default = "default_expiring_timeout")]
    pub expiring_timeout: u64,
    #[serde(default = "default_hash_size")]
    pub hash_size: usize,
    #[serde(default = "default_monitor_period")]
    pub monitor_period: u64,
    #[serde(default)]
    pub enable_database: i32,
    #[serde(default = "default_max_db_connection_time")]
    pub max_db_connection_time: u64,
    #[serde(default)]
    pub log_file: Vec<String>,
    #[serde(default = "default_log_priority")]
    pub log_priority: String,
    #[serde(default)]
    pub daemon: i32,
    #[serde(default)]
    pub run_as: Option<String>,
    #[serde(default = "default_socket_name")]
    pub socket_name: String,
    #[serde(default = "default_packet_analyzer_plugin")]
    pub packet_analyzer_plugin: String,
    #[serde(default)]
    pub load_plugin_on_boot: i32,
    #[serde(default)]
    pub enable_plugin_on_boot: i32,
    #[serde(default = "default_mysql_server")]
    pub mysql_server: String,
    #[serde(default)]
    pub mysql_account: String,
    #[serde(default)]
    pub mysql_passwd: String,
    #[serde(default)]
    pub mysql_database: String,
    /// Not part of the original collaborator set (out of scope per
    /// spec §1's "logging appenders") but needed to serve the
    /// Prometheus text this crate adds as its ambient observability
    /// surface.
    #[serde(default = "default_metrics_bind")]
    pub metrics_bind: String,
    /// Every `sql-*` key lands here verbatim; see `db::queries`.
    #[serde(flatten)]
    pub sql: HashMap<String, String>,
}

/// Typed, validated configuration consumed by the core. Built once at
/// startup from `RawConfig` and never mutated (runtime-adjustable
/// values like the default/fallback channel live in `BackendTable`
/// behind `ArcSwap`, not here).
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub servers: Vec<(String, u16)>,
    pub default_server: usize,
    pub on_failed_channel: usize,
    pub threshold: i64,
    pub persist_threshold: i64,
    pub max_persistent_time: Duration,
    pub max_allowed_requests: u32,
    pub white_list_ip_prefix: Vec<String>,
    pub expiring_timeout: Duration,
    pub hash_size: usize,
    pub monitor_period: Duration,
    pub enable_database: bool,
    pub max_db_connection_time: Duration,
    pub log_file: Vec<String>,
    pub log_priority: String,
    pub daemon: bool,
    pub run_as: Option<String>,
    pub socket_name: String,
    pub packet_analyzer_plugin: String,
    pub load_plugin_on_boot: bool,
    pub enable_plugin_on_boot: bool,
    pub mysql_server: String,
    pub mysql_account: String,
    pub mysql_passwd: String,
    pub mysql_database: String,
    pub metrics_bind: String,
    pub sql: HashMap<String, String>,
}

/// Matches the original's `^\s*(.*):(\d+)\s*$` PCRE2 pattern exactly.
fn host_port_regex() -> &'static regex::Regex {
    static RE: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    RE.get_or_init(|| regex::Regex::new(r"^\s*(.*):(\d+)\s*$").unwrap())
}

fn parse_server(entry: &str) -> Result<(String, u16), ConfigError> {
    let caps = host_port_regex()
        .captures(entry)
        .ok_or_else(|| ConfigError::InvalidServer(entry.to_string()))?;
    let host = caps.get(1).unwrap().as_str().to_string();
    let port: u16 = caps
        .get(2)
        .unwrap()
        .as_str()
        .parse()
        .map_err(|_| ConfigError::InvalidServer(entry.to_string()))?;
    Ok((host, port))
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_raw(raw)
    }

    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut servers = Vec::with_capacity(raw.servers.len());
        for entry in &raw.servers {
            servers.push(parse_server(entry)?);
        }

        Ok(Config {
            port: raw.port,
            servers,
            default_server: raw.default_server.max(0) as usize,
            on_failed_channel: raw.on_failed_channel.max(0) as usize,
            threshold: raw.threshold as i64,
            persist_threshold: raw.persist_threshold as i64,
            max_persistent_time: Duration::from_secs(raw.max_persistent_day.max(0) as u64 * 86_400),
            max_allowed_requests: raw.max_allowed_requests,
            white_list_ip_prefix: raw.white_list_ip_prefix,
            expiring_timeout: Duration::from_secs(raw.expiring_timeout),
            hash_size: raw.hash_size.max(1),
            monitor_period: Duration::from_secs(raw.monitor_period.max(crate::rate_limiter::SLOTS as u64)),
            enable_database: raw.enable_database != 0,
            max_db_connection_time: Duration::from_secs(raw.max_db_connection_time),
            log_file: raw.log_file,
            log_priority: raw.log_priority,
            daemon: raw.daemon != 0,
            run_as: raw.run_as,
            socket_name: raw.socket_name,
            packet_analyzer_plugin: raw.packet_analyzer_plugin,
            load_plugin_on_boot: raw.load_plugin_on_boot != 0,
            enable_plugin_on_boot: raw.enable_plugin_on_boot != 0,
            mysql_server: raw.mysql_server,
            mysql_account: raw.mysql_account,
            mysql_passwd: raw.mysql_passwd,
            mysql_database: raw.mysql_database,
            metrics_bind: raw.metrics_bind,
            sql: raw.sql,
        })
    }

    /// Builds the connection options the Database Policy Gate dials,
    /// from the four `mysql-*` keys (`dbmysql_connect` in
    /// `examples/original_source/src/db_mysql.c`).
    pub fn mysql_opts(&self) -> mysql::Opts {
        mysql::OptsBuilder::default()
            .ip_or_hostname(Some(self.mysql_server.clone()))
            .user(Some(self.mysql_account.clone()))
            .pass(Some(self.mysql_passwd.clone()))
            .db_name(Some(self.mysql_database.clone()))
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        assert_eq!(
            parse_server("  10.0.0.5:5432 ").unwrap(),
            ("10.0.0.5".to_string(), 5432)
        );
        assert_eq!(
            parse_server("db.internal:6543").unwrap(),
            ("db.internal".to_string(), 6543)
        );
    }

    #[test]
    fn rejects_malformed_server() {
        assert!(parse_server("no-port-here").is_err());
    }

    #[test]
    fn raw_config_applies_defaults() {
        let raw: RawConfig = toml::from_str("servers = [\"a:1\", \"b:2\"]").unwrap();
        let cfg = Config::from_raw(raw).unwrap();
        assert_eq!(cfg.port, 80);
        assert_eq!(cfg.threshold, 5);
        assert_eq!(cfg.servers, vec![("a".into(), 1), ("b".into(), 2)]);
    }
}
