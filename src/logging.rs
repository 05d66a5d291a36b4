//! Diagnostic logging for the dispatcher.
//!
//! `start` runs as a long-lived daemon and gets a daily-rotated JSON file plus
//! stderr ([`init_production`]). Every other subcommand prints its result on
//! stdout, so it only logs warnings to stderr ([`init_cli`]).
//!
//! HTTP client crates are always capped at `warn`: their debug output includes
//! request URLs, and Graph requests carry the access token as a query
//! parameter.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// File name prefix of the daemon log; the date is appended on rotation.
pub const LOG_FILE_PREFIX: &str = "sealpost.log";

/// Targets whose verbose output may echo tokenized URLs.
const QUIET_TARGETS: &[&str] = &["hyper", "hyper_util", "reqwest", "h2"];

/// Keeps the file writer alive. Dropping it flushes pending entries.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Build the filter from `RUST_LOG`, falling back to `default_level`, with
/// HTTP client targets capped at `warn`.
///
/// # Errors
///
/// Returns an error if `default_level` is not a valid filter directive.
pub fn env_filter(default_level: &str) -> anyhow::Result<EnvFilter> {
    let mut filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level)
            .with_context(|| format!("invalid log level '{default_level}'"))?,
    };

    for target in QUIET_TARGETS {
        let directive: Directive = format!("{target}=warn")
            .parse()
            .with_context(|| format!("invalid log directive for {target}"))?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

/// Install daemon logging: JSON lines in `{logs_dir}/sealpost.log.YYYY-MM-DD`
/// and human-readable stderr, both at `RUST_LOG` (default `info`).
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created or a global
/// subscriber is already installed.
pub fn init_production(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter("info")?)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("failed to install log subscriber")?;

    Ok(LoggingGuard { _guard: guard })
}

/// Install stderr-only logging for one-shot subcommands (default `warn`).
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_cli() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter("warn")?)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}
