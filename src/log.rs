//! Structured logging for swarm.
//!
//! Everything goes through `tracing`. The subscriber writes to
//! `~/.swarm/swarm.log` so that task output on the terminal stays clean.
//!
//! Log levels:
//! - ERROR: Critical failures that prevent operations from completing
//! - WARN: Unexpected conditions that are recoverable (corrupt records, failed iterations)
//! - INFO: Lifecycle notifications (agent registered, iteration started, pipeline finished)
//! - DEBUG: Store reads and writes, readiness decisions
//! - TRACE: Raw agent output lines
//!
//! Debug mode can be enabled with `--debug` flag or `SWARM_DEBUG=1` env var.
//! `RUST_LOG` always wins over both.

use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const LOG_FILE: &str = "swarm.log";

/// Initialize logging to ~/.swarm/swarm.log.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();

    let Ok(dir) = Config::swarm_dir() else {
        return;
    };
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    init_at(&dir, debug_enabled);
}

/// Install the file subscriber in `dir`.
pub fn init_at(dir: &Path, debug: bool) {
    if LOG_GUARD.get().is_some() {
        return;
    }
    let appender = tracing_appender::rolling::never(dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);

    let installed = tracing_subscriber::registry()
        .with(filter_for(debug))
        .with(layer)
        .try_init()
        .is_ok();
    if installed {
        let _ = LOG_GUARD.set(guard);
    }
}

fn env_debug() -> bool {
    std::env::var("SWARM_DEBUG")
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "swarm=debug"
    } else {
        "swarm=info"
    }
}

fn filter_for(debug: bool) -> EnvFilter {
    match std::env::var("RUST_LOG") {
        Ok(v) if !v.trim().is_empty() => EnvFilter::from_default_env(),
        _ => EnvFilter::new(default_directive(debug)),
    }
}
