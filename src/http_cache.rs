use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{
    ETAG, HeaderMap, HeaderName, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SourceError;

const CACHE_VERSION: u32 = 1;
const CACHE_DIR: &str = "hoopgen";
const CACHE_FILE: &str = "http_cache.json";
/// Listing pages only; a full collegiate season is a few hundred team rosters.
const MAX_ENTRIES: usize = 1024;

static CACHE: Mutex<Option<CacheState>> = Mutex::new(None);

/// Whether a request takes part in conditional revalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Roster and team listings: replay validators so an unchanged page comes
    /// back as a 304.
    Revalidate,
    /// Per-player payloads, which the player store already keeps.
    Bypass,
}

#[derive(Debug, Default)]
struct CacheState {
    file: HttpCacheFile,
    dirty: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct HttpCacheFile {
    version: u32,
    entries: HashMap<String, CacheEntry>,
}

impl HttpCacheFile {
    /// Inserts `entry`, dropping the oldest entries beyond `cap`.
    fn insert(&mut self, key: &str, entry: CacheEntry, cap: usize) {
        self.version = CACHE_VERSION;
        self.entries.insert(key.to_string(), entry);
        let excess = self.entries.len().saturating_sub(cap);
        if excess == 0 {
            return;
        }
        let mut by_age = self
            .entries
            .iter()
            .map(|(k, e)| (e.fetched_at, k.clone()))
            .collect::<Vec<_>>();
        by_age.sort();
        for (_, key) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    body: String,
    etag: Option<String>,
    last_modified: Option<String>,
    fetched_at: u64,
}

/// GET, optionally with conditional revalidation: the request always reaches
/// the provider, but an unchanged body comes back as a cheap 304. New entries
/// stay in memory until [`flush`].
pub fn fetch_json_cached(
    client: &Client,
    url: &str,
    extra_headers: &[(&str, &str)],
    policy: CachePolicy,
) -> std::result::Result<String, SourceError> {
    let cached_entry = match policy {
        CachePolicy::Revalidate => with_cache(|state| state.file.entries.get(url).cloned()),
        CachePolicy::Bypass => None,
    };

    let mut req = client.get(url);
    for (name, value) in extra_headers {
        req = req.header(*name, *value);
    }
    if let Some(entry) = cached_entry.as_ref() {
        if let Some(etag) = entry.etag.as_ref() {
            req = req.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = entry.last_modified.as_ref() {
            req = req.header(IF_MODIFIED_SINCE, last_modified);
        }
    }

    let resp = req.send()?;
    let status = resp.status();
    let headers = resp.headers().clone();
    if status == StatusCode::NOT_MODIFIED {
        if let Some(entry) = cached_entry {
            debug!(url, "not modified, serving cached body");
            return Ok(entry.body);
        }
        return Err(SourceError::Parse(format!("304 without cached body for {url}")));
    }
    if !status.is_success() {
        return Err(SourceError::Status {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }
    let body = resp.text()?;

    let etag = header_string(&headers, ETAG);
    let last_modified = header_string(&headers, LAST_MODIFIED);
    if policy == CachePolicy::Revalidate && (etag.is_some() || last_modified.is_some()) {
        let entry = CacheEntry {
            body: body.clone(),
            etag,
            last_modified,
            fetched_at: system_time_to_secs(SystemTime::now()).unwrap_or_default(),
        };
        with_cache(|state| {
            state.file.insert(url, entry, MAX_ENTRIES);
            state.dirty = true;
        });
    }
    Ok(body)
}

/// Writes the cache file if anything changed since it was loaded.
pub fn flush() {
    let mut guard = lock_cache();
    let Some(state) = guard.as_mut().filter(|state| state.dirty) else {
        return;
    };
    match save_cache_file(&state.file) {
        Ok(()) => {
            debug!(entries = state.file.entries.len(), "http cache saved");
            state.dirty = false;
        }
        Err(err) => warn!(error = %err, "http cache not saved"),
    }
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

pub fn app_cache_dir() -> Option<PathBuf> {
    if let Ok(base) = std::env::var("XDG_CACHE_HOME")
        && !base.trim().is_empty()
    {
        return Some(PathBuf::from(base).join(CACHE_DIR));
    }
    let home = std::env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(home).join(".cache").join(CACHE_DIR))
}

fn lock_cache() -> MutexGuard<'static, Option<CacheState>> {
    match CACHE.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn with_cache<T>(f: impl FnOnce(&mut CacheState) -> T) -> T {
    let mut guard = lock_cache();
    let state = guard.get_or_insert_with(|| CacheState {
        file: load_cache_file(),
        dirty: false,
    });
    f(state)
}

fn load_cache_file() -> HttpCacheFile {
    let Some(path) = cache_path() else {
        return HttpCacheFile::default();
    };
    let Ok(raw) = fs::read_to_string(path) else {
        return HttpCacheFile::default();
    };
    parse_cache_file(&raw)
}

// Unreadable or older-format files start an empty cache.
fn parse_cache_file(raw: &str) -> HttpCacheFile {
    match serde_json::from_str::<HttpCacheFile>(raw) {
        Ok(cache) if cache.version == CACHE_VERSION => cache,
        _ => HttpCacheFile::default(),
    }
}

fn save_cache_file(cache: &HttpCacheFile) -> Result<()> {
    let Some(path) = cache_path() else {
        return Ok(());
    };
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).context("create http cache dir")?;
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string(cache).context("serialize http cache")?;
    fs::write(&tmp, json).context("write http cache")?;
    fs::rename(&tmp, &path).context("swap http cache")?;
    Ok(())
}

fn cache_path() -> Option<PathBuf> {
    app_cache_dir().map(|dir| dir.join(CACHE_FILE))
}

fn system_time_to_secs(time: SystemTime) -> Option<u64> {
    time.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}
