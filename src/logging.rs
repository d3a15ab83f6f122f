use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "LATCH_LOG";
pub const LOG_FILE_ENV: &str = "LATCH_LOG_FILE";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install the global subscriber. Logs go to stderr unless `$LATCH_LOG_FILE`
/// names a file to append to; hosts usually discard hook stderr.
/// Safe to call more than once.
pub fn init() {
    let file = std::env::var(LOG_FILE_ENV)
        .ok()
        .filter(|p| !p.trim().is_empty())
        .and_then(|p| OpenOptions::new().create(true).append(true).open(p).ok());

    match file {
        Some(file) => tracing_subscriber::fmt()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_env_filter(filter())
            .try_init()
            .ok(),
        None => tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter())
            .try_init()
            .ok(),
    };
}
