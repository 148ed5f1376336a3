//! Error types for every component boundary, following the teacher's
//! `thiserror`-per-module pattern (cf. `auth::backend::ConsoleRedirectError`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid host:port entry in `servers`: {0}")]
    InvalidServer(String),
}

#[derive(Debug, Error)]
pub enum EventLoopError {
    #[error("maximum number of registrations ({0}) reached")]
    CapacityExhausted(usize),
    #[error("kernel registration failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("accept() failed: {0}")]
    Accept(#[source] std::io::Error),
    #[error("getpeername() failed: {0}")]
    PeerAddr(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database is not connected")]
    NotConnected,
    #[error("database transport error: {0}")]
    Transport(String),
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },
    #[error("prepared statement `{0}` has no configured SQL text")]
    MissingStatement(&'static str),
}

impl DbError {
    /// Mirrors §7: reconnect exhaustion is the one DB error that is
    /// process-fatal (the caller exits with code 139); everything else
    /// is recovered by triggering a reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DbError::ReconnectExhausted { .. })
    }
}

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("failed to load analyzer plugin at {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: libloading::Error,
    },
    #[error("analyzer plugin is missing required symbol `{0}`")]
    MissingSymbol(&'static str),
    #[error("analyzer panicked during analyze(), disabling plugin")]
    Panicked,
    #[error("analyzer is not currently loaded")]
    NotLoaded,
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("unrecognized command: {0}")]
    UnknownCommand(String),
    #[error("invalid argument for `{command}`: {reason}")]
    InvalidArgument { command: String, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
