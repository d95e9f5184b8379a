use std::path::PathBuf;
use std::time::Duration;

use crate::sources::SourceOptions;
use crate::store::default_db_path;

const DEFAULT_OUTPUT_DIR: &str = "output";
const DEFAULT_REQUEST_DELAY_MS: u64 = 500;

/// Runtime settings read from the environment (after `.env.local` / `.env`).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub db_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub bounds_file: Option<PathBuf>,
    pub palette_file: Option<PathBuf>,
    pub request_delay: Duration,
    pub fetch_images: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            bounds_file: None,
            palette_file: None,
            request_delay: Duration::from_millis(DEFAULT_REQUEST_DELAY_MS),
            fetch_images: true,
        }
    }
}

impl Config {
    pub fn load_dotenv() {
        let _ = dotenvy::from_filename(".env.local");
        let _ = dotenvy::from_filename(".env");
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();
        Self {
            db_path: get("HOOPGEN_DB").map(PathBuf::from).or(defaults.db_path),
            output_dir: get("HOOPGEN_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            bounds_file: get("HOOPGEN_BOUNDS_FILE").map(PathBuf::from),
            palette_file: get("HOOPGEN_PALETTE_FILE").map(PathBuf::from),
            request_delay: get("HOOPGEN_REQUEST_DELAY_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_delay),
            fetch_images: get("HOOPGEN_FETCH_IMAGES")
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
                .unwrap_or(defaults.fetch_images),
        }
    }

    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            request_delay: self.request_delay,
            ..SourceOptions::default()
        }
    }
}
