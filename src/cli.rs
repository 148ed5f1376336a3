//! Command-line flags (spec §6).

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "tcp-proxy", about = "TCP reverse proxy with IP classification and auto-blocklist rate limiting")]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(short = 'c', long = "config", default_value = "/etc/tcp-proxy/tcp-proxy.toml")]
    pub config: PathBuf,

    /// Connect to the running instance's admin socket and enter an
    /// interactive CLI instead of starting the proxy.
    #[arg(long)]
    pub client: bool,

    /// Run in the foreground with the database gate and analyzer
    /// disabled, for local experimentation.
    #[arg(long)]
    pub testing: bool,

    /// Stay attached to the controlling terminal instead of
    /// daemonizing, even if the config file requests it.
    #[arg(long = "no-daemon")]
    pub no_daemon: bool,
}
