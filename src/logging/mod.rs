//! Logging initialization from the `log:` config section.
//!
//! Levels are numeric 1..9 (fatal..trace) and map onto `tracing` level
//! filters. Output goes to stdout, or through a non-blocking appender when a
//! file is configured; the returned guard must be held for the process
//! lifetime or buffered lines are lost on exit.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Truthy `SV_DEBUG` forces level 8 (debug) regardless of configuration.
pub const SV_DEBUG_ENV: &str = "SV_DEBUG";

const DEFAULT_LEVEL: u8 = 7;
const DEFAULT_TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("init logging error: `{0}`")]
    TryInitError(String),
    #[error("unable to open log file `{path}`: {source}")]
    OpenFile { path: PathBuf, source: io::Error },
}

pub type LoggerGuard = Option<WorkerGuard>;

/// Installs the global subscriber according to `config`.
pub fn try_init(config: &LogConfig) -> Result<LoggerGuard, LoggingError> {
    let filter = level_filter(effective_level(config.level));
    let timer = ChronoLocal::new(
        config
            .ts_format
            .clone()
            .unwrap_or_else(|| DEFAULT_TS_FORMAT.to_string()),
    );
    let env_filter = EnvFilter::builder()
        .with_default_directive(filter.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(timer);

    match &config.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::OpenFile {
                    path: path.clone(),
                    source,
                })?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            builder
                .with_ansi(false)
                .with_writer(writer)
                .try_init()
                .map_err(|err| LoggingError::TryInitError(err.to_string()))?;
            Ok(Some(guard))
        }
        None => {
            builder
                .with_writer(io::stdout)
                .try_init()
                .map_err(|err| LoggingError::TryInitError(err.to_string()))?;
            Ok(None)
        }
    }
}

fn effective_level(configured: Option<u8>) -> u8 {
    if sv_debug() {
        return 8;
    }
    configured.unwrap_or(DEFAULT_LEVEL)
}

fn sv_debug() -> bool {
    std::env::var(SV_DEBUG_ENV)
        .map(|v| !v.is_empty() && v != "0")
        .unwrap_or(false)
}

fn level_filter(level: u8) -> LevelFilter {
    match level {
        0..=4 => LevelFilter::ERROR,
        5 => LevelFilter::WARN,
        6 | 7 => LevelFilter::INFO,
        8 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}
