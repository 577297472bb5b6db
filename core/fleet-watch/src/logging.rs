//! Logging setup.
//!
//! Logs go to stderr so stdout stays clean JSON. With `--log-dir` a daily
//! rolling file is written as well; the returned guard must be held until
//! exit so buffered lines are flushed.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const DEBUG_ENV_VAR: &str = "FLEET_SYNC_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "fleet-watch.log";

fn debug_forced() -> bool {
    std::env::var(DEBUG_ENV_VAR)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

fn filter() -> EnvFilter {
    if debug_forced() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let Some(log_dir) = log_dir else {
        let _ = tracing_subscriber::registry().with(filter()).with(stderr).try_init();
        return None;
    };

    if let Err(err) = fs_err::create_dir_all(log_dir) {
        let _ = tracing_subscriber::registry().with(filter()).with(stderr).try_init();
        tracing::warn!(error = %err, "Log directory unavailable; logging to stderr only");
        return None;
    }

    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(stderr)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .try_init();
    Some(guard)
}
