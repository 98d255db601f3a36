use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// File-based telemetry: a rolling text log for `info!`/`error!` lines plus a
/// rolling newline-delimited JSON log for per-turn report events.
pub struct FileTelemetry;

impl FileTelemetry {
    /// Installs the global subscriber.
    ///
    /// - `log_level` is an `EnvFilter` directive (e.g. `"info"`).
    /// - `log_file` receives the plain-text log.
    /// - `event_file` receives one JSON line per `target = "turn"` event.
    pub fn init_files(log_level: &str, log_file: PathBuf, event_file: PathBuf) -> Result<Self> {
        let env_filter = EnvFilter::new(log_level);

        let txt_dir = parent_dir(&log_file);
        std::fs::create_dir_all(txt_dir)?;
        let txt_appender = RollingFileAppender::new(
            Rotation::DAILY,
            txt_dir,
            log_file.file_name().unwrap_or(OsStr::new("charla.log")),
        );
        let txt_layer = fmt::Layer::default()
            .with_writer(txt_appender)
            .with_ansi(false);

        let json_dir = parent_dir(&event_file);
        std::fs::create_dir_all(json_dir)?;
        let json_appender = RollingFileAppender::new(
            Rotation::DAILY,
            json_dir,
            event_file.file_name().unwrap_or(OsStr::new("charla-events.json")),
        );
        let json_layer = fmt::layer()
            .json()
            .with_writer(json_appender)
            .with_target(true)
            .with_filter(EnvFilter::new("turn=info"));

        Registry::default()
            .with(env_filter)
            .with(txt_layer)
            .with(json_layer)
            .init();

        Ok(FileTelemetry)
    }

    /// Wraps one conversation turn with logs and a JSON report event.
    ///
    /// Any `info!`/`error!` inside `handler` goes to the text log; at the end
    /// one JSON line (target = "turn") records the name, latency and outcome.
    pub async fn instrument_turn<F, Fut, T, E>(&self, name: &str, handler: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let start = Instant::now();
        let result = handler().await;
        let elapsed = start.elapsed().as_secs_f64() * 1_000.0;

        match &result {
            Ok(_) => {
                info!("turn `{}` handled in {:.1} ms", name, elapsed);
            }
            Err(err) => {
                error!(error = %err, "turn `{}` failed after {:.1} ms", name, elapsed);
            }
        }

        tracing::event!(
            target: "turn",
            tracing::Level::INFO,
            turn = name,
            latency_ms = elapsed,
            status = match &result {
                Ok(_) => "ok",
                Err(_) => "error",
            },
        );

        result
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Wires up tracing for the runtime. Logs go to the rolling files under
/// `root`, keeping stdout free for the conversation itself.
pub fn init_tracing(
    root: PathBuf,
    log_file: String,
    event_file: String,
    log_level: String,
) -> Result<FileTelemetry> {
    FileTelemetry::init_files(&log_level, root.join(&log_file), root.join(&event_file))
}
