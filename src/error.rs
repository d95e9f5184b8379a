use thiserror::Error;

use crate::league::League;

/// Failure kinds a source client reports. The repository treats all of them
/// as recoverable for a single player and fatal for a roster listing.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("network error: {0}")]
    Network(String),

    #[error("http {status} from {url}")]
    Status { status: u16, url: String },

    #[error("malformed payload: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => SourceError::Status {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            },
            None => SourceError::Network(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::Parse(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("stored json is invalid: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("season {season:?} is not valid for {league}")]
    InvalidSeason { league: League, season: String },

    #[error("roster listing failed for {league} {season}: {source}")]
    Roster {
        league: League,
        season: String,
        #[source]
        source: SourceError,
    },

    #[error("draft history failed for {season}: {source}")]
    DraftHistory {
        season: String,
        #[source]
        source: SourceError,
    },

    #[error("persistent store failed: {0}")]
    Store(#[from] StoreError),

    #[error("{actual} source client plugged in for {expected}")]
    SourceMismatch { expected: League, actual: League },
}
