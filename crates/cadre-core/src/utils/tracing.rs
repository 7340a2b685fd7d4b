use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing_appender::rolling;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

const LOG_DIR_NAME: &str = ".cadre";

/// Directory log files are written to, when a home directory exists.
pub fn log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(LOG_DIR_NAME))
}

/// Initialize the tracing system with a file logger that appends to a timestamp-named file.
/// Configuration is loaded from the RUST_LOG environment variable.
pub fn init_tracing() -> io::Result<()> {
    match log_dir() {
        Some(dir) => init_file_tracing(&dir),
        None => {
            let subscriber = tracing_subscriber::registry()
                .with(fmt::Layer::default().with_ansi(true).with_target(true))
                .with(EnvFilter::from_default_env());
            tracing::subscriber::set_global_default(subscriber).map_err(io::Error::other)?;

            tracing::debug!(
                target: "cadre::utils::tracing",
                "Tracing initialized with stdout output. Filter configured via RUST_LOG env var."
            );
            Ok(())
        }
    }
}

/// Like [`init_tracing`], writing into `dir` instead of the home directory.
pub fn init_file_tracing(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;

    let file_name = format!("{}.log", Local::now().format("%Y%m%d_%H%M%S"));
    let file_appender = rolling::never(dir, &file_name);

    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::Layer::new()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_span_events(FmtSpan::CLOSE)
                .with_file(true)
                .with_line_number(true),
        )
        .with(EnvFilter::from_default_env());
    tracing::subscriber::set_global_default(subscriber).map_err(io::Error::other)?;

    tracing::debug!(
        target: "cadre::utils::tracing",
        path = %dir.join(&file_name).display(),
        "Tracing initialized with file output. Filter configured via RUST_LOG env var."
    );
    Ok(())
}
