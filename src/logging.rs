use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_ROOT: &str = "logs";

/// Installs the global subscriber: stderr plus a per-run file under
/// `logs/<MODE>/<MODE>_<season>_<timestamp>.log`. Returns the file path when
/// file logging could be set up.
pub fn init(mode: &str, season: &str, debug: bool) -> Option<PathBuf> {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{default_level},reqwest=warn")));

    let log_path = log_file_path(mode, season);
    let file_layer = match open_log_file(&log_path) {
        Ok(file) => Some(
            tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .with_target(true),
        ),
        Err(err) => {
            eprintln!(
                "Warning: could not open log file {} ({err}), file logging disabled",
                log_path.display()
            );
            None
        }
    };
    let file_enabled = file_layer.is_some();

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    (installed && file_enabled).then_some(log_path)
}

fn log_file_path(mode: &str, season: &str) -> PathBuf {
    let mode = mode.to_ascii_uppercase();
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    PathBuf::from(LOG_ROOT)
        .join(&mode)
        .join(format!("{mode}_{season}_{stamp}.log"))
}

fn open_log_file(path: &Path) -> std::io::Result<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    File::create(path)
}
