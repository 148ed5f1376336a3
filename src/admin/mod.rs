//! The admin command-line interface (spec §6): a Unix-domain-socket
//! server accepting one line-oriented command per connection turn,
//! grounded in `commands.c`'s `cmdlintf_t` dispatcher and styled after
//! `metrics::serve`'s thread-per-connection loop.

pub mod commands;

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::logging::LogHandle;
use crate::proxy::ProxyState;
use crate::rate_limiter::Clock;

/// Binds the admin socket (removing a stale one from a previous run)
/// and serves connections until the process is terminating.
pub fn serve<C: Clock + 'static>(state: Arc<ProxyState<C>>, log: Arc<LogHandle>) -> std::io::Result<()> {
    let path = std::path::Path::new(&state.config.socket_name);
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    info!(path = %state.config.socket_name, "admin socket listening");

    while !state.is_terminating() {
        match listener.accept() {
            Ok((stream, _addr)) => {
                let state = state.clone();
                let log = log.clone();
                std::thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, &state, &log) {
                        warn!(error = %e, "admin connection ended with an error");
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(std::time::Duration::from_millis(200));
            }
            Err(e) => {
                error!(error = %e, "admin accept() failed");
                std::thread::sleep(std::time::Duration::from_secs(1));
            }
        }
    }

    let _ = std::fs::remove_file(path);
    info!("admin thread stopped");
    Ok(())
}

fn handle_connection<C: Clock>(stream: UnixStream, state: &Arc<ProxyState<C>>, log: &Arc<LogHandle>) -> std::io::Result<()> {
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }

        let keep_open = match commands::parse(&line) {
            Ok(cmd) => {
                let (reply, keep_open) = commands::execute(cmd, state, log);
                writer.write_all(reply.as_bytes())?;
                keep_open
            }
            Err(err) => {
                writer.write_all(format!("error: {}\n", err.0).as_bytes())?;
                true
            }
        };
        writer.flush()?;
        if !keep_open {
            return Ok(());
        }
    }
}
