use std::fs;
use std::path::Path;

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::errors::{ManagerError, Result};

pub const LOG_FILE_PREFIX: &str = "manager.log";

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Installs the global subscriber: a daily rolling `manager.log` in `log_dir`,
/// mirrored to stderr when `mirror_stderr` is set.
///
/// Server console output is not routed through here; it travels on the event bus.
pub fn init(log_dir: &Path, mirror_stderr: bool) -> Result<()> {
    fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true);
    let stderr_layer = mirror_stderr.then(|| fmt::layer().with_writer(std::io::stderr).with_target(false));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|err| ManagerError::Config(err.to_string()))?;

    Ok(())
}
