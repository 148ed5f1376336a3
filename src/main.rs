use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use clap::Parser;
use tcpproxy::cli::Args;
use tcpproxy::config::Config;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.client {
        return run_client(&args);
    }

    let config = Config::load(&args.config)?;

    if config.daemon && !args.no_daemon && !args.testing {
        tcpproxy::daemon::daemonize()?;
    }

    let (log_handle, _guard) = tcpproxy::logging::init(&config)?;
    let log_handle = Arc::new(log_handle);

    tcpproxy::run(config, log_handle)
}

/// `--client`: connects to the running instance's admin socket and
/// relays stdin lines to it, printing replies, until EOF or `exit`.
fn run_client(args: &Args) -> anyhow::Result<()> {
    let config = Config::load(&args.config)?;
    let stream = UnixStream::connect(&config.socket_name)?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        let mut reply = String::new();
        reader.read_line(&mut reply)?;
        print!("{reply}");

        if line.trim() == "exit" || line.trim() == "shutdown" {
            break;
        }
    }
    Ok(())
}
