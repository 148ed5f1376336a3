//! Process signal handling (spec §5): SIGINT/SIGTERM shut the proxy
//! down, SIGHUP is ignored, SIGUSR1/SIGUSR2 step the logging level.

use std::sync::Arc;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;
use tracing::info;

use crate::logging::LogHandle;
use crate::proxy::ProxyState;
use crate::rate_limiter::Clock;

/// Spawns the signal-handling thread. Blocks on the `signal-hook`
/// iterator until the process is terminating, then returns.
pub fn spawn<C: Clock + 'static>(state: Arc<ProxyState<C>>, log: Arc<LogHandle>) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP, SIGUSR1, SIGUSR2])?;

    std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            for signal in signals.forever() {
                match signal {
                    SIGINT | SIGTERM => {
                        info!(signal, "termination signal received, shutting down");
                        state.request_shutdown();
                        break;
                    }
                    SIGHUP => {
                        info!("SIGHUP received, ignored");
                    }
                    SIGUSR1 => {
                        log.raise();
                        info!(level = %log.current(), "SIGUSR1: logging level raised");
                    }
                    SIGUSR2 => {
                        log.lower();
                        info!(level = %log.current(), "SIGUSR2: logging level lowered");
                    }
                    _ => {}
                }
                if state.is_terminating() {
                    break;
                }
            }
        })?;
    Ok(())
}
