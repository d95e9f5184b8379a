use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::SourceError;
use crate::http_cache::{CachePolicy, fetch_json_cached};
use crate::http_client::http_client;
use crate::league::League;
use crate::model::{DraftPick, RawStats, RosterEntry};

pub mod espn;
pub mod nba;

pub use espn::{EspnAthlete, EspnClient};
pub use nba::{NbaClient, NbaStatRow};

/// Read-only access to one upstream provider. No caching of records and no
/// rating logic lives behind this trait; that is the repository's job.
pub trait SourceClient {
    fn league(&self) -> League;

    /// Player identities for the season, in provider order.
    fn list_roster(&self, season: &str) -> Result<Vec<RosterEntry>, SourceError>;

    fn fetch_stats(&self, season: &str, entry: &RosterEntry)
    -> Result<ProviderPayload, SourceError>;

    fn fetch_draft_history(&self, season: &str) -> Result<Vec<DraftPick>, SourceError>;

    fn headshot_url(&self, source_id: &str) -> Option<String>;
}

/// Provider-native stat payloads. Converted to [`RawStats`] on ingestion so
/// nothing downstream branches on the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderPayload {
    Professional(NbaStatRow),
    Collegiate(EspnAthlete),
}

impl ProviderPayload {
    pub fn into_raw_stats(self) -> RawStats {
        match self {
            ProviderPayload::Professional(row) => row.into_raw_stats(),
            ProviderPayload::Collegiate(athlete) => athlete.into_raw_stats(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SourceOptions {
    /// Pause before every upstream request.
    pub request_delay: Duration,
    pub attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            request_delay: Duration::from_millis(500),
            attempts: 3,
            retry_backoff: Duration::from_millis(750),
        }
    }
}

/// Fetches `url` with politeness delay and retries on transient failures.
pub(crate) fn get_json(
    options: &SourceOptions,
    url: &str,
    headers: &[(&str, &str)],
    policy: CachePolicy,
) -> Result<String, SourceError> {
    let client = http_client().map_err(|e| SourceError::Network(e.to_string()))?;
    with_retry(options, url, || {
        if !options.request_delay.is_zero() {
            thread::sleep(options.request_delay);
        }
        fetch_json_cached(client, url, headers, policy)
    })
}

pub(crate) fn with_retry<T>(
    options: &SourceOptions,
    what: &str,
    mut op: impl FnMut() -> Result<T, SourceError>,
) -> Result<T, SourceError> {
    let attempts = options.attempts.max(1);
    let mut backoff = options.retry_backoff;
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && is_transient(&err) => {
                warn!(what, attempt, attempts, error = %err, "request failed, retrying");
                thread::sleep(backoff);
                backoff = backoff.mul_f64(1.5);
                attempt += 1;
            }
            Err(err) => {
                debug!(what, attempt, error = %err, "giving up");
                return Err(err);
            }
        }
    }
}

fn is_transient(err: &SourceError) -> bool {
    match err {
        SourceError::Network(_) => true,
        SourceError::Status { status, .. } => *status == 429 || *status >= 500,
        SourceError::Parse(_) => false,
    }
}

/// Image bytes for a headshot, or `None` when unavailable. Content is not validated.
pub trait ImageSource {
    fn fetch_image(&self, url: &str) -> Option<Vec<u8>>;
}

pub struct HttpImageSource;

impl ImageSource for HttpImageSource {
    fn fetch_image(&self, url: &str) -> Option<Vec<u8>> {
        let client = http_client().ok()?;
        let resp = match client.get(url).send() {
            Ok(resp) => resp,
            Err(err) => {
                debug!(url, error = %err, "headshot request failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            debug!(url, status = resp.status().as_u16(), "headshot unavailable");
            return None;
        }
        resp.bytes().ok().map(|b| b.to_vec())
    }
}

/// Used when image fetching is switched off; every player gets the fallback look.
pub struct NoImages;

impl ImageSource for NoImages {
    fn fetch_image(&self, _url: &str) -> Option<Vec<u8>> {
        None
    }
}
