//! Structured logging for the harness.
//!
//! Log levels follow the usual `tracing` meaning:
//! - ERROR: Critical failures that abort a run (spec errors, broken config)
//! - WARN: Recoverable conditions (verification failures, broken baseline)
//! - INFO: Session lifecycle, checkpoints, discovered work
//! - DEBUG: Scheduler transitions and command invocations
//! - TRACE: Raw agent and check output
//!
//! Debug mode can be enabled with `--debug` or `HARNESS_DEBUG=1`. `RUST_LOG`
//! takes precedence over both when set.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable that turns on debug logging.
pub const DEBUG_ENV: &str = "HARNESS_DEBUG";

/// Whether debug logging was requested by flag or environment.
pub fn debug_requested(flag: bool) -> bool {
    flag || std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Build the level filter used when `RUST_LOG` is not set.
fn default_filter(debug: bool) -> EnvFilter {
    if debug {
        EnvFilter::new("harness=debug,info")
    } else {
        EnvFilter::new("info")
    }
}

/// Initialize logging, writing to `<state_dir>/harness.log`.
///
/// The log file is truncated on startup. When it cannot be opened the
/// subscriber writes to stderr instead. Calling this twice is a no-op.
pub fn init_with_debug(state_dir: &Path, debug: bool) {
    let debug = debug_requested(debug);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(debug));

    let _ = std::fs::create_dir_all(state_dir);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(state_dir.join("harness.log"));

    let result = match file {
        Ok(file) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .try_init(),
        Err(_) => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init(),
    };

    if result.is_ok() {
        let debug_enabled = debug;
        tracing::debug!(debug = debug_enabled, state_dir = %state_dir.display(), "logging initialized");
    }
}
