use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::Subscriber;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

const FILE_FILTER: &str = "info,elevenbot=debug,template_test=debug";

/// Build the subscriber: console at `RUST_LOG` (default info), a debug log
/// per session and an append-only error log, both in `log_dir`.
///
/// Returns the subscriber and the session log path.
pub fn subscriber(log_dir: &Path) -> Result<(impl Subscriber + Send + Sync + 'static, PathBuf)> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let session_path = log_dir.join(format!(
        "bot_{}.log",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    ));
    let session_file = File::create(&session_path)
        .with_context(|| format!("failed to create {}", session_path.display()))?;

    let errors_path = log_dir.join("errors.log");
    let errors_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&errors_path)
        .with_context(|| format!("failed to open {}", errors_path.display()))?;

    let console = fmt::layer().with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );

    let session = fmt::layer()
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(Mutex::new(session_file))
        .with_filter(EnvFilter::new(FILE_FILTER));

    let errors = fmt::layer()
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(Mutex::new(errors_file))
        .with_filter(LevelFilter::ERROR);

    let subscriber = tracing_subscriber::registry()
        .with(console)
        .with(session)
        .with(errors);

    Ok((subscriber, session_path))
}

/// Install the subscriber globally.
pub fn init(log_dir: &Path) -> Result<PathBuf> {
    let (subscriber, session_path) = subscriber(log_dir)?;
    subscriber
        .try_init()
        .context("failed to install tracing subscriber")?;
    tracing::info!("logging to {}", session_path.display());
    Ok(session_path)
}

/// Console-only logging for short commands that should not create log files.
pub fn init_console() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
