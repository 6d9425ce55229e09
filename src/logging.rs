//! Tracing setup for campaign runs and the small admin subcommands.
//!
//! `send` gets a delivery log: one JSON event per line in
//! `{logs_dir}/delivery.log.YYYY-MM-DD`, so per-recipient outcomes can be
//! audited after the terminal is gone. Everything else logs to stderr only.
//!
//! The filter comes from `CAMPAIGNER_LOG`, then `RUST_LOG`, then
//! [`DEFAULT_DIRECTIVES`], which keeps `sqlx` and `hyper` chatter out of
//! the delivery log.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when neither `CAMPAIGNER_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_DIRECTIVES: &str = "info,sqlx=warn,hyper=warn,reqwest=warn";

/// Engine-specific filter variable, checked before `RUST_LOG`.
pub const LOG_ENV_VAR: &str = "CAMPAIGNER_LOG";

const DELIVERY_LOG_PREFIX: &str = "delivery.log";

/// Keeps the delivery log writer alive; dropping it flushes the file.
pub struct LoggingGuard {
    _writer: WorkerGuard,
}

/// Path of the delivery log written on `day`.
pub fn delivery_log_path(logs_dir: &Path, day: NaiveDate) -> PathBuf {
    logs_dir.join(format!("{DELIVERY_LOG_PREFIX}.{}", day.format("%Y-%m-%d")))
}

/// Install the delivery log plus a stderr layer for a campaign run.
///
/// # Errors
///
/// Fails if `logs_dir` cannot be created or a subscriber is already set.
pub fn init_delivery_logging(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!("cannot create logs directory {}: {e}", logs_dir.display())
    })?;

    let appender = tracing_appender::rolling::daily(logs_dir, DELIVERY_LOG_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(campaign_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(writer),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing subscriber already installed: {e}"))?;

    Ok(LoggingGuard { _writer: guard })
}

/// Stderr-only logging for `validate`, `status` and `suppress`.
/// Calling it again once a subscriber exists does nothing.
pub fn init_console_logging() {
    let _ = tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(campaign_filter())
        .with_writer(std::io::stderr)
        .try_init();
}

/// Directives from `CAMPAIGNER_LOG`, else `RUST_LOG`, else the defaults.
pub fn filter_directives(engine_var: Option<&str>, rust_log: Option<&str>) -> String {
    [engine_var, rust_log]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
        .unwrap_or(DEFAULT_DIRECTIVES)
        .to_owned()
}

fn campaign_filter() -> EnvFilter {
    let engine_var = std::env::var(LOG_ENV_VAR).ok();
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directives = filter_directives(engine_var.as_deref(), rust_log.as_deref());
    EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}
