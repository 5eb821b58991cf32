//! Tracing subscriber setup for the CLI.
//!
//! Logs go to stderr, or to a file when one is configured. `RUST_LOG`
//! overrides the configured level.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing::subscriber::set_global_default;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level '{0}'")]
    Level(String),

    #[error("invalid RUST_LOG: {0}")]
    Env(#[from] tracing_subscriber::filter::FromEnvError),

    #[error("cannot open log file '{path}': {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a global subscriber is already installed")]
    AlreadyInstalled(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Install the global subscriber.
pub fn init(level: &str, file: Option<&Path>) -> Result<(), LoggingError> {
    let level: LevelFilter = level
        .parse()
        .map_err(|_| LoggingError::Level(level.to_string()))?;
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()?;

    let (stderr_layer, file_layer) = match file {
        Some(path) => {
            let log_file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::File {
                    path: path.to_path_buf(),
                    source,
                })?;
            let layer = fmt::Layer::default()
                .with_ansi(false)
                .with_writer(Mutex::new(log_file));
            (None, Some(layer))
        }
        None => {
            let layer = fmt::Layer::default()
                .compact()
                .with_writer(std::io::stderr);
            (Some(layer), None)
        }
    };

    set_global_default(
        Registry::default()
            .with(filter)
            .with(stderr_layer)
            .with(file_layer),
    )?;
    Ok(())
}
