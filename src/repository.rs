use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{Datelike, Utc};
use tracing::{debug, info, warn};

use crate::appearance::{AppearancePalettes, classify};
use crate::error::{RepositoryError, StoreError};
use crate::league::{Identity, League, PROFESSIONAL_FIRST_SEASON};
use crate::model::{
    Appearance, Cohort, DraftPick, OmittedPlayer, PlayerRecord, Ratings, RawStats, RosterEntry,
};
use crate::normalize::{NormalizationBounds, normalize};
use crate::sources::{ImageSource, SourceClient};
use crate::store::{InsertOutcome, PlayerStore, claim_owner};
use crate::tables::{self, StaticTables};

pub type RepoResult<T> = Result<T, RepositoryError>;

const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(10 * 60);

static NEXT_OWNER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateScope {
    /// Ratings and appearance only; raw stats stay cached.
    Derived,
    /// The whole record, so the next cohort request refetches it.
    Full,
}

enum Resolved {
    Fetched(PlayerRecord),
    Cached(PlayerRecord),
    Omitted(String),
}

/// Mediates between the persistent store and the upstream providers.
///
/// A record is fetched from its provider at most once; after that every
/// cohort request is served from the store, with missing derived fields
/// computed on first access and persisted.
pub struct Repository {
    store: Box<dyn PlayerStore>,
    professional: Box<dyn SourceClient>,
    collegiate: Box<dyn SourceClient>,
    images: Box<dyn ImageSource>,
    tables: Option<Arc<StaticTables>>,
    owner: String,
    claim_ttl: Duration,
}

impl Repository {
    pub fn new(
        store: Box<dyn PlayerStore>,
        professional: Box<dyn SourceClient>,
        collegiate: Box<dyn SourceClient>,
        images: Box<dyn ImageSource>,
    ) -> RepoResult<Self> {
        for (expected, client) in [
            (League::Professional, professional.as_ref()),
            (League::Collegiate, collegiate.as_ref()),
        ] {
            let actual = client.league();
            if actual != expected {
                return Err(RepositoryError::SourceMismatch { expected, actual });
            }
        }
        let seq = NEXT_OWNER.fetch_add(1, Ordering::Relaxed);
        Ok(Self {
            store,
            professional,
            collegiate,
            images,
            tables: None,
            owner: claim_owner(seq),
            claim_ttl: DEFAULT_CLAIM_TTL,
        })
    }

    /// Pins the tables instead of reading the process-wide ones per call.
    pub fn with_tables(mut self, tables: Arc<StaticTables>) -> Self {
        self.tables = Some(tables);
        self
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    fn tables(&self) -> Arc<StaticTables> {
        self.tables.clone().unwrap_or_else(tables::current)
    }

    fn source(&self, league: League) -> &dyn SourceClient {
        match league {
            League::Professional => self.professional.as_ref(),
            League::Collegiate => self.collegiate.as_ref(),
        }
    }

    /// All player records for `(league, season)` in roster order.
    pub fn get_cohort(&self, league: League, season: &str) -> RepoResult<Cohort> {
        check_season(league, season)?;
        let source = self.source(league);
        let tables = self.tables();

        let listed = source
            .list_roster(season)
            .map_err(|source| RepositoryError::Roster {
                league,
                season: season.to_string(),
                source,
            })?;
        let roster = dedupe_roster(listed);
        info!(%league, season, players = roster.len(), "building cohort");

        let mut cohort = Cohort {
            league,
            season: season.to_string(),
            records: Vec::with_capacity(roster.len()),
            omitted: Vec::new(),
            fetched: 0,
            cached: 0,
        };
        for entry in &roster {
            let id = Identity::new(league, season, &entry.source_id);
            let resolved = match self.store.get(&id)? {
                Some(stored) => Resolved::Cached(stored),
                None => self.fetch_new(source, &id, entry, &tables)?,
            };
            match resolved {
                Resolved::Fetched(record) => {
                    cohort.fetched += 1;
                    cohort.records.push(record);
                }
                Resolved::Cached(record) => {
                    cohort.cached += 1;
                    cohort
                        .records
                        .push(self.fill_derived(source, record, &tables)?);
                }
                Resolved::Omitted(reason) => {
                    warn!(player = %id, reason = %reason, "player omitted");
                    cohort.omitted.push(OmittedPlayer {
                        source_id: entry.source_id.clone(),
                        name: entry.name.clone(),
                        reason,
                    });
                }
            }
        }

        info!(
            %league,
            season,
            records = cohort.records.len(),
            fetched = cohort.fetched,
            cached = cohort.cached,
            omitted = cohort.omitted.len(),
            "cohort ready"
        );
        Ok(cohort)
    }

    fn fetch_new(
        &self,
        source: &dyn SourceClient,
        id: &Identity,
        entry: &RosterEntry,
        tables: &StaticTables,
    ) -> RepoResult<Resolved> {
        if !self.store.try_claim(id, &self.owner, self.claim_ttl)? {
            // The other worker may have finished between our lookup and the claim.
            return Ok(match self.store.get(id)? {
                Some(stored) => Resolved::Cached(stored),
                None => Resolved::Omitted("fetch in progress by another worker".to_string()),
            });
        }
        let resolved = self.fetch_and_insert(source, id, entry, tables);
        let released = self.store.release_claim(id, &self.owner);
        let resolved = resolved?;
        released?;
        Ok(resolved)
    }

    fn fetch_and_insert(
        &self,
        source: &dyn SourceClient,
        id: &Identity,
        entry: &RosterEntry,
        tables: &StaticTables,
    ) -> RepoResult<Resolved> {
        let payload = match source.fetch_stats(&id.season, entry) {
            Ok(payload) => payload,
            Err(err) => return Ok(Resolved::Omitted(err.to_string())),
        };
        let raw_stats = payload.into_raw_stats();
        let derived_ratings = Some(rate(&raw_stats, id.league, &tables.bounds));
        let appearance = Some(self.look_up_appearance(source, &id.source_id, &tables.palettes));

        let record = PlayerRecord {
            identity: id.clone(),
            name: entry.name.clone(),
            team_id: entry.team_id.clone(),
            raw_stats,
            derived_ratings,
            appearance,
            fetched_at: Utc::now().to_rfc3339(),
        };
        match self.store.insert_if_absent(&record)? {
            InsertOutcome::Inserted => {
                debug!(player = %id, "fetched and stored");
                Ok(Resolved::Fetched(record))
            }
            InsertOutcome::AlreadyExists => {
                debug!(player = %id, "lost insert race, keeping stored record");
                let stored = self.store.get(id)?.ok_or_else(|| {
                    StoreError::Corrupt(format!("{id} vanished after conflicting insert"))
                })?;
                Ok(Resolved::Cached(stored))
            }
        }
    }

    fn fill_derived(
        &self,
        source: &dyn SourceClient,
        mut record: PlayerRecord,
        tables: &StaticTables,
    ) -> RepoResult<PlayerRecord> {
        if record.derived_ratings.is_none() {
            let ratings = rate(&record.raw_stats, record.identity.league, &tables.bounds);
            self.store.update_ratings(&record.identity, &ratings)?;
            debug!(player = %record.identity, "ratings recomputed");
            record.derived_ratings = Some(ratings);
        }
        if record.appearance.is_none() {
            let appearance =
                self.look_up_appearance(source, &record.identity.source_id, &tables.palettes);
            self.store.update_appearance(&record.identity, &appearance)?;
            debug!(player = %record.identity, "appearance recomputed");
            record.appearance = Some(appearance);
        }
        Ok(record)
    }

    fn look_up_appearance(
        &self,
        source: &dyn SourceClient,
        source_id: &str,
        palettes: &AppearancePalettes,
    ) -> Appearance {
        let image = source
            .headshot_url(source_id)
            .and_then(|url| self.images.fetch_image(&url));
        classify(image.as_deref(), palettes)
    }

    /// Clears derived fields or deletes records. Returns the affected count.
    pub fn invalidate(
        &self,
        league: League,
        season: &str,
        source_id: Option<&str>,
        scope: InvalidateScope,
    ) -> RepoResult<usize> {
        check_season(league, season)?;
        let n = match scope {
            InvalidateScope::Derived => self.store.clear_derived(league, season, source_id)?,
            InvalidateScope::Full => self.store.delete(league, season, source_id)?,
        };
        info!(%league, season, player = ?source_id, ?scope, records = n, "invalidated");
        Ok(n)
    }

    /// Professional draft picks for a draft year, fetched once then served from the store.
    pub fn draft_class(&self, season: &str) -> RepoResult<Vec<DraftPick>> {
        let current = Utc::now().year();
        let valid = season.len() == 4
            && season
                .parse::<i32>()
                .is_ok_and(|year| (PROFESSIONAL_FIRST_SEASON..=current).contains(&year));
        if !valid {
            return Err(RepositoryError::InvalidSeason {
                league: League::Professional,
                season: season.to_string(),
            });
        }

        let stored = self.store.load_draft(season)?;
        if !stored.is_empty() {
            debug!(season, picks = stored.len(), "draft class from store");
            return Ok(stored);
        }
        let picks = self
            .professional
            .fetch_draft_history(season)
            .map_err(|source| RepositoryError::DraftHistory {
                season: season.to_string(),
                source,
            })?;
        self.store.save_draft(season, &picks)?;
        info!(season, picks = picks.len(), "draft class fetched");
        Ok(picks)
    }

    /// Stored records whose derived fields were produced by tables other than
    /// the installed ones. Nothing is invalidated.
    pub fn stale_records(&self, league: League, season: &str) -> RepoResult<Vec<Identity>> {
        check_season(league, season)?;
        let tables = self.tables();
        let stale = self
            .store
            .list_cohort(league, season)?
            .into_iter()
            .filter(|record| {
                let ratings_stale = record
                    .derived_ratings
                    .as_ref()
                    .is_some_and(|r| r.version != tables.bounds.version);
                let appearance_stale = record
                    .appearance
                    .as_ref()
                    .is_some_and(|a| a.palette_version != tables.palettes.version);
                ratings_stale || appearance_stale
            })
            .map(|record| record.identity)
            .collect();
        Ok(stale)
    }
}

fn check_season(league: League, season: &str) -> RepoResult<()> {
    match league.validate_season(season) {
        Some(_) => Ok(()),
        None => Err(RepositoryError::InvalidSeason {
            league,
            season: season.to_string(),
        }),
    }
}

fn rate(raw: &RawStats, league: League, bounds: &NormalizationBounds) -> Ratings {
    Ratings {
        version: bounds.version.clone(),
        values: normalize(raw, league, bounds),
    }
}

/// Collapses repeated identities: first listing keeps its position, the last
/// listing's team wins.
pub fn dedupe_roster(listed: Vec<RosterEntry>) -> Vec<RosterEntry> {
    let mut position: HashMap<String, usize> = HashMap::with_capacity(listed.len());
    let mut out: Vec<RosterEntry> = Vec::with_capacity(listed.len());
    for entry in listed {
        match position.get(&entry.source_id) {
            Some(&i) => {
                if !entry.team_id.is_empty() {
                    out[i].team_id = entry.team_id;
                }
            }
            None => {
                position.insert(entry.source_id.clone(), out.len());
                out.push(entry);
            }
        }
    }
    out
}
