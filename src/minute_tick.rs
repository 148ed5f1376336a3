//! Minute Tick (spec §4.6): sleeps to the next 5-second boundary and,
//! at most once per wall-clock minute, fires the reaper, the database
//! idle check, and the rate-limiter expiry wake. Grounded in the
//! `minute_timer` usage in `examples/original_source/src/main.c`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::proxy::ProxyState;
use crate::rate_limiter::Clock;

const TICK: Duration = Duration::from_secs(5);

fn current_minute() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() / 60
}

/// Runs on its own thread until `state.terminate` is set.
pub fn run<C: Clock>(state: Arc<ProxyState<C>>) {
    info!("minute tick thread started");
    let mut last_minute = None;

    while !state.is_terminating() {
        std::thread::sleep(TICK);
        if state.terminate.load(Ordering::Acquire) {
            break;
        }

        let minute = current_minute();
        if last_minute == Some(minute) {
            continue;
        }
        last_minute = Some(minute);

        crate::reaper::reap_idle(&state);
        state.db.done();
        state.limiter.signal_expire();
    }
    info!("minute tick thread stopped");
}
