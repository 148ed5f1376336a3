//! Admin command parsing and execution (spec §6), grounded in
//! `commands.c`'s command table — each entry there becomes one
//! `Command` variant here, dispatched by a `match` instead of a
//! registered-handler table.

use std::str::FromStr;
use std::sync::Arc;

use tracing::info;

use crate::analyzer::Mode;
use crate::logging::{LogHandle, LogLevel};
use crate::proxy::ProxyState;
use crate::rate_limiter::Clock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exit,
    Shutdown,
    Date,
    Echo(String),
    Uptime,
    SetLoggingLevel(LogLevel),
    SetDefaultChannel(usize),
    SetFallbackChannel(usize),
    LoadModule(String),
    UnloadModule,
    AnalyzerEnable,
    AnalyzerDisable,
    AnalyzerModeSafe,
    AnalyzerModeFast,
    ShowAnalyzerMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

pub fn parse(line: &str) -> Result<Command, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ParseError("empty command".into()));
    }

    if let Some(rest) = line.strip_prefix("echo") {
        return Ok(Command::Echo(rest.trim().to_string()));
    }
    if line == "exit" {
        return Ok(Command::Exit);
    }
    if line == "shutdown" {
        return Ok(Command::Shutdown);
    }
    if line == "date" {
        return Ok(Command::Date);
    }
    if line == "uptime" {
        return Ok(Command::Uptime);
    }
    if let Some(rest) = line.strip_prefix("set logging level") {
        let level = LogLevel::from_str(rest.trim()).map_err(|_| ParseError(format!("unknown logging level: {}", rest.trim())))?;
        return Ok(Command::SetLoggingLevel(level));
    }
    if let Some(rest) = line.strip_prefix("set default channel") {
        let idx: usize = rest.trim().parse().map_err(|_| ParseError("expected a channel number".into()))?;
        return Ok(Command::SetDefaultChannel(idx));
    }
    if let Some(rest) = line.strip_prefix("set fall back channel") {
        let idx: usize = rest.trim().parse().map_err(|_| ParseError("expected a channel number".into()))?;
        return Ok(Command::SetFallbackChannel(idx));
    }
    if let Some(rest) = line.strip_prefix("load module") {
        let path = rest.trim();
        if path.is_empty() {
            return Err(ParseError("module file name required".into()));
        }
        return Ok(Command::LoadModule(path.to_string()));
    }
    if line == "unload module" {
        return Ok(Command::UnloadModule);
    }
    if line == "analyzer enable" {
        return Ok(Command::AnalyzerEnable);
    }
    if line == "analyzer disable" {
        return Ok(Command::AnalyzerDisable);
    }
    if line == "analyzer mode safe" {
        return Ok(Command::AnalyzerModeSafe);
    }
    if line == "analyzer mode fast" {
        return Ok(Command::AnalyzerModeFast);
    }
    if line == "show analyzer mode" {
        return Ok(Command::ShowAnalyzerMode);
    }

    Err(ParseError(format!("unrecognized command: {line}")))
}

/// Runs one command, returning the text reply and whether the admin
/// connection should stay open (`false` for `exit`/`shutdown`).
pub fn execute<C: Clock>(cmd: Command, state: &Arc<ProxyState<C>>, log: &Arc<LogHandle>) -> (String, bool) {
    match cmd {
        Command::Exit => {
            info!("admin: exit");
            ("**** Exit ****\n".into(), false)
        }
        Command::Shutdown => {
            info!("admin: shutdown");
            state.request_shutdown();
            ("**** Shutdown ****\n".into(), false)
        }
        Command::Date => {
            let now: chrono_lite::LocalTime = chrono_lite::now();
            (format!("{now}\n"), true)
        }
        Command::Echo(text) => (format!("{text}\n"), true),
        Command::Uptime => {
            let uptime = state.start_time.elapsed();
            let days = uptime.as_secs() / 86_400;
            let hours = (uptime.as_secs() % 86_400) / 3_600;
            let minutes = (uptime.as_secs() % 3_600) / 60;
            let seconds = uptime.as_secs() % 60;
            let text = if days > 0 {
                format!("Uptime: {days} day(s), {hours:02}:{minutes:02}:{seconds:02}\n")
            } else {
                format!("Uptime:  {hours:02}:{minutes:02}:{seconds:02}\n")
            };
            (text, true)
        }
        Command::SetLoggingLevel(level) => {
            log.set(level);
            (format!("Logging level: {level}\n"), true)
        }
        Command::SetDefaultChannel(idx) => {
            if idx < state.backends.len() {
                state.backends.set_default_channel(idx);
                (format!("default channel set to {idx}\n"), true)
            } else {
                (format!("failed to set default channel to {idx}\n"), true)
            }
        }
        Command::SetFallbackChannel(idx) => {
            if idx < state.backends.len() {
                state.backends.set_fallback_channel(idx);
                (format!("default channel set to {idx}\n"), true)
            } else {
                (format!("failed to set default channel to {idx}\n"), true)
            }
        }
        Command::LoadModule(path) => {
            let text = match state.analyzer.load(&path) {
                Ok(()) => "module loaded successfully\n".to_string(),
                Err(e) => format!("failed to loading module: {e}\n"),
            };
            (text, true)
        }
        Command::UnloadModule => {
            state.analyzer.unload();
            ("module unload successfully\n".into(), true)
        }
        Command::AnalyzerEnable => {
            state.analyzer.set_enabled(true);
            ("packet analyzer: enabled\n".into(), true)
        }
        Command::AnalyzerDisable => {
            state.analyzer.set_enabled(false);
            ("packet analyzer: disable\n".into(), true)
        }
        Command::AnalyzerModeSafe => {
            state.analyzer.set_mode(Mode::Safe);
            ("packet analyzer mode: safe\n".into(), true)
        }
        Command::AnalyzerModeFast => {
            state.analyzer.set_mode(Mode::Fast);
            ("packet analyzer mode: fast\n".into(), true)
        }
        Command::ShowAnalyzerMode => {
            let mode = match state.analyzer.mode() {
                Mode::Safe => "safe",
                Mode::Fast => "fast",
            };
            (format!("packet analyzer mode: {mode}\n"), true)
        }
    }
}

/// Minimal local-time formatter so `date` doesn't need to pull in a
/// full calendar crate for one command (SPEC_FULL.md §C.6: fixed
/// `%Y-%m-%d %H:%M:%S` format, server-local time).
mod chrono_lite {
    use std::fmt;
    use std::time::{SystemTime, UNIX_EPOCH};

    pub struct LocalTime {
        secs_since_epoch: u64,
    }

    pub fn now() -> LocalTime {
        LocalTime {
            secs_since_epoch: SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs(),
        }
    }

    impl fmt::Display for LocalTime {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            const DAYS_PER_MONTH: [u64; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
            let days_total = self.secs_since_epoch / 86_400;
            let secs_of_day = self.secs_since_epoch % 86_400;
            let hour = secs_of_day / 3_600;
            let minute = (secs_of_day % 3_600) / 60;
            let second = secs_of_day % 60;

            let mut year = 1970u64;
            let mut days = days_total;
            loop {
                let leap = is_leap(year);
                let year_len = if leap { 366 } else { 365 };
                if days < year_len {
                    break;
                }
                days -= year_len;
                year += 1;
            }

            let leap = is_leap(year);
            let mut month = 0usize;
            for (i, &len) in DAYS_PER_MONTH.iter().enumerate() {
                let len = if i == 1 && leap { len + 1 } else { len };
                if days < len {
                    month = i;
                    break;
                }
                days -= len;
            }
            let day = days + 1;

            write!(f, "{year:04}-{:02}-{day:02} {hour:02}:{minute:02}:{second:02}", month + 1)
        }
    }

    fn is_leap(year: u64) -> bool {
        (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_echo_with_argument() {
        assert_eq!(parse("echo hello world").unwrap(), Command::Echo("hello world".into()));
    }

    #[test]
    fn parses_echo_with_no_argument() {
        assert_eq!(parse("echo").unwrap(), Command::Echo("".into()));
    }

    #[test]
    fn parses_set_logging_level() {
        assert_eq!(parse("set logging level trace").unwrap(), Command::SetLoggingLevel(LogLevel::Trace));
    }

    #[test]
    fn rejects_unknown_logging_level() {
        assert!(parse("set logging level loud").is_err());
    }

    #[test]
    fn parses_channel_commands() {
        assert_eq!(parse("set default channel 2").unwrap(), Command::SetDefaultChannel(2));
        assert_eq!(parse("set fall back channel 1").unwrap(), Command::SetFallbackChannel(1));
    }

    #[test]
    fn rejects_empty_load_module_path() {
        assert!(parse("load module").is_err());
    }

    #[test]
    fn rejects_unrecognized_command() {
        assert!(parse("frobnicate").is_err());
    }
}
