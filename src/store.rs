use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;

use crate::error::StoreError;
use crate::http_cache::app_cache_dir;
use crate::league::{Identity, League};
use crate::model::{Appearance, DraftPick, PlayerRecord, Ratings};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another writer stored this identity first; the stored row is untouched.
    AlreadyExists,
}

/// Durable keyed storage for player records, fetch claims and draft picks.
/// Every write is a single statement or transaction, so a record is either
/// fully present or absent.
pub trait PlayerStore {
    fn get(&self, id: &Identity) -> StoreResult<Option<PlayerRecord>>;

    fn insert_if_absent(&self, record: &PlayerRecord) -> StoreResult<InsertOutcome>;

    fn update_ratings(&self, id: &Identity, ratings: &Ratings) -> StoreResult<()>;

    fn update_appearance(&self, id: &Identity, appearance: &Appearance) -> StoreResult<()>;

    /// Clears ratings and appearance; `source_id: None` covers the whole cohort.
    fn clear_derived(&self, league: League, season: &str, source_id: Option<&str>)
    -> StoreResult<usize>;

    fn delete(&self, league: League, season: &str, source_id: Option<&str>) -> StoreResult<usize>;

    fn list_cohort(&self, league: League, season: &str) -> StoreResult<Vec<PlayerRecord>>;

    /// Takes the fetch claim for `id` unless another owner holds a live claim.
    /// A claim is dead once it is older than `ttl` or its owner's process has
    /// exited.
    fn try_claim(&self, id: &Identity, owner: &str, ttl: Duration) -> StoreResult<bool>;

    fn release_claim(&self, id: &Identity, owner: &str) -> StoreResult<()>;

    /// Replaces the stored picks for `season`.
    fn save_draft(&self, season: &str, picks: &[DraftPick]) -> StoreResult<usize>;

    fn load_draft(&self, season: &str) -> StoreResult<Vec<DraftPick>>;
}

pub fn default_db_path() -> Option<PathBuf> {
    app_cache_dir().map(|dir| dir.join("players.sqlite"))
}

/// Claim owner tag `<pid>-<micros>-<seq>`, unique per repository instance.
pub fn claim_owner(seq: u64) -> String {
    format!("{}-{}-{seq}", std::process::id(), Utc::now().timestamp_micros())
}

/// The process id leading an owner tag, if it has one.
pub fn owner_pid(owner: &str) -> Option<u32> {
    owner.split('-').next()?.parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return true;
    };
    if raw <= 0 {
        return true;
    }
    // EPERM still means the process exists.
    !matches!(kill(Pid::from_raw(raw), None::<Signal>), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        init_schema(&conn)?;
        debug!(path = %path.display(), "opened player store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn count(&self, league: League, season: &str) -> StoreResult<usize> {
        let n = self.conn().query_row(
            "SELECT COUNT(*) FROM players WHERE league = ?1 AND season = ?2",
            params![league.key(), season],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(usize::try_from(n).unwrap_or_default())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS players (
            league TEXT NOT NULL,
            season TEXT NOT NULL,
            source_id TEXT NOT NULL,
            name TEXT NOT NULL,
            team_id TEXT NOT NULL,
            raw_stats TEXT NOT NULL,
            ratings TEXT NULL,
            ratings_version TEXT NULL,
            appearance TEXT NULL,
            palette_version TEXT NULL,
            fetched_at TEXT NOT NULL,
            PRIMARY KEY (league, season, source_id)
        );
        CREATE INDEX IF NOT EXISTS idx_players_cohort ON players(league, season);

        CREATE TABLE IF NOT EXISTS fetch_claims (
            league TEXT NOT NULL,
            season TEXT NOT NULL,
            source_id TEXT NOT NULL,
            owner TEXT NOT NULL,
            claimed_at INTEGER NOT NULL,
            PRIMARY KEY (league, season, source_id)
        );

        CREATE TABLE IF NOT EXISTS draft_picks (
            season TEXT NOT NULL,
            person_id TEXT NOT NULL,
            pick TEXT NOT NULL,
            overall_pick INTEGER NULL,
            PRIMARY KEY (season, person_id)
        );
        "#,
    )?;
    Ok(())
}

const PLAYER_COLUMNS: &str = "league, season, source_id, name, team_id, raw_stats, \
                              ratings, ratings_version, appearance, palette_version, fetched_at";

fn decode_player(row: &Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        league: row.get(0)?,
        season: row.get(1)?,
        source_id: row.get(2)?,
        name: row.get(3)?,
        team_id: row.get(4)?,
        raw_stats: row.get(5)?,
        ratings: row.get(6)?,
        ratings_version: row.get(7)?,
        appearance: row.get(8)?,
        palette_version: row.get(9)?,
        fetched_at: row.get(10)?,
    })
}

struct StoredRow {
    league: String,
    season: String,
    source_id: String,
    name: String,
    team_id: String,
    raw_stats: String,
    ratings: Option<String>,
    ratings_version: Option<String>,
    appearance: Option<String>,
    palette_version: Option<String>,
    fetched_at: String,
}

impl StoredRow {
    fn into_record(self) -> StoreResult<PlayerRecord> {
        let league = self
            .league
            .parse::<League>()
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", self.source_id)))?;
        let derived_ratings = match (self.ratings, self.ratings_version) {
            (Some(values), Some(version)) => Some(Ratings {
                version,
                values: serde_json::from_str(&values)?,
            }),
            _ => None,
        };
        let appearance = match (self.appearance, self.palette_version) {
            (Some(raw), Some(version)) => {
                let codes: AppearanceCodes = serde_json::from_str(&raw)?;
                Some(Appearance {
                    skin_tone_code: codes.skin_tone_code,
                    hair_color_code: codes.hair_color_code,
                    hair_style_code: codes.hair_style_code,
                    facial_hair_code: codes.facial_hair_code,
                    accessory_code: codes.accessory_code,
                    palette_version: version,
                })
            }
            _ => None,
        };
        Ok(PlayerRecord {
            identity: Identity::new(league, self.season, self.source_id),
            name: self.name,
            team_id: self.team_id,
            raw_stats: serde_json::from_str(&self.raw_stats)?,
            derived_ratings,
            appearance,
            fetched_at: self.fetched_at,
        })
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct AppearanceCodes {
    skin_tone_code: u8,
    hair_color_code: u8,
    #[serde(default)]
    hair_style_code: u8,
    #[serde(default)]
    facial_hair_code: u8,
    #[serde(default)]
    accessory_code: u8,
}

fn appearance_json(appearance: &Appearance) -> StoreResult<String> {
    Ok(serde_json::to_string(&AppearanceCodes {
        skin_tone_code: appearance.skin_tone_code,
        hair_color_code: appearance.hair_color_code,
        hair_style_code: appearance.hair_style_code,
        facial_hair_code: appearance.facial_hair_code,
        accessory_code: appearance.accessory_code,
    })?)
}

impl PlayerStore for SqliteStore {
    fn get(&self, id: &Identity) -> StoreResult<Option<PlayerRecord>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {PLAYER_COLUMNS} FROM players \
                     WHERE league = ?1 AND season = ?2 AND source_id = ?3"
                ),
                params![id.league.key(), id.season, id.source_id],
                decode_player,
            )
            .optional()?;
        row.map(StoredRow::into_record).transpose()
    }

    fn insert_if_absent(&self, record: &PlayerRecord) -> StoreResult<InsertOutcome> {
        let raw_stats = serde_json::to_string(&record.raw_stats)?;
        let ratings = record
            .derived_ratings
            .as_ref()
            .map(|r| serde_json::to_string(&r.values))
            .transpose()?;
        let appearance = record.appearance.as_ref().map(appearance_json).transpose()?;
        let id = &record.identity;

        let inserted = self.conn().execute(
            "INSERT INTO players(league, season, source_id, name, team_id, raw_stats,
                                 ratings, ratings_version, appearance, palette_version, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(league, season, source_id) DO NOTHING",
            params![
                id.league.key(),
                id.season,
                id.source_id,
                record.name,
                record.team_id,
                raw_stats,
                ratings,
                record.derived_ratings.as_ref().map(|r| r.version.as_str()),
                appearance,
                record.appearance.as_ref().map(|a| a.palette_version.as_str()),
                record.fetched_at,
            ],
        )?;
        Ok(if inserted == 1 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyExists
        })
    }

    fn update_ratings(&self, id: &Identity, ratings: &Ratings) -> StoreResult<()> {
        let values = serde_json::to_string(&ratings.values)?;
        self.conn().execute(
            "UPDATE players SET ratings = ?1, ratings_version = ?2
             WHERE league = ?3 AND season = ?4 AND source_id = ?5",
            params![values, ratings.version, id.league.key(), id.season, id.source_id],
        )?;
        Ok(())
    }

    fn update_appearance(&self, id: &Identity, appearance: &Appearance) -> StoreResult<()> {
        let codes = appearance_json(appearance)?;
        self.conn().execute(
            "UPDATE players SET appearance = ?1, palette_version = ?2
             WHERE league = ?3 AND season = ?4 AND source_id = ?5",
            params![
                codes,
                appearance.palette_version,
                id.league.key(),
                id.season,
                id.source_id
            ],
        )?;
        Ok(())
    }

    fn clear_derived(
        &self,
        league: League,
        season: &str,
        source_id: Option<&str>,
    ) -> StoreResult<usize> {
        let n = self.conn().execute(
            "UPDATE players
             SET ratings = NULL, ratings_version = NULL, appearance = NULL, palette_version = NULL
             WHERE league = ?1 AND season = ?2 AND (?3 IS NULL OR source_id = ?3)",
            params![league.key(), season, source_id],
        )?;
        Ok(n)
    }

    fn delete(&self, league: League, season: &str, source_id: Option<&str>) -> StoreResult<usize> {
        let n = self.conn().execute(
            "DELETE FROM players
             WHERE league = ?1 AND season = ?2 AND (?3 IS NULL OR source_id = ?3)",
            params![league.key(), season, source_id],
        )?;
        Ok(n)
    }

    fn list_cohort(&self, league: League, season: &str) -> StoreResult<Vec<PlayerRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PLAYER_COLUMNS} FROM players
             WHERE league = ?1 AND season = ?2
             ORDER BY source_id ASC"
        ))?;
        let rows = stmt.query_map(params![league.key(), season], decode_player)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_record()?);
        }
        Ok(out)
    }

    fn try_claim(&self, id: &Identity, owner: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Utc::now().timestamp();
        let cutoff = now - i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM fetch_claims
             WHERE league = ?1 AND season = ?2 AND source_id = ?3 AND claimed_at < ?4",
            params![id.league.key(), id.season, id.source_id, cutoff],
        )?;
        tx.execute(
            "INSERT INTO fetch_claims(league, season, source_id, owner, claimed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(league, season, source_id) DO NOTHING",
            params![id.league.key(), id.season, id.source_id, owner, now],
        )?;
        let holder: String = tx.query_row(
            "SELECT owner FROM fetch_claims WHERE league = ?1 AND season = ?2 AND source_id = ?3",
            params![id.league.key(), id.season, id.source_id],
            |row| row.get(0),
        )?;
        let mut claimed = holder == owner;
        if !claimed && owner_pid(&holder).is_some_and(|pid| !process_alive(pid)) {
            tx.execute(
                "UPDATE fetch_claims SET owner = ?4, claimed_at = ?5
                 WHERE league = ?1 AND season = ?2 AND source_id = ?3",
                params![id.league.key(), id.season, id.source_id, owner, now],
            )?;
            debug!(player = %id, previous = %holder, "took over claim of exited process");
            claimed = true;
        }
        tx.commit()?;
        Ok(claimed)
    }

    fn release_claim(&self, id: &Identity, owner: &str) -> StoreResult<()> {
        self.conn().execute(
            "DELETE FROM fetch_claims
             WHERE league = ?1 AND season = ?2 AND source_id = ?3 AND owner = ?4",
            params![id.league.key(), id.season, id.source_id, owner],
        )?;
        Ok(())
    }

    fn save_draft(&self, season: &str, picks: &[DraftPick]) -> StoreResult<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM draft_picks WHERE season = ?1", params![season])?;
        for pick in picks {
            tx.execute(
                "INSERT INTO draft_picks(season, person_id, pick, overall_pick)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(season, person_id) DO UPDATE SET
                    pick = excluded.pick,
                    overall_pick = excluded.overall_pick",
                params![
                    season,
                    pick.person_id,
                    serde_json::to_string(pick)?,
                    pick.overall_pick.map(i64::from)
                ],
            )?;
        }
        tx.commit()?;
        Ok(picks.len())
    }

    fn load_draft(&self, season: &str) -> StoreResult<Vec<DraftPick>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT pick FROM draft_picks
             WHERE season = ?1
             ORDER BY overall_pick IS NULL, overall_pick ASC, person_id ASC",
        )?;
        let rows = stmt.query_map(params![season], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }
}
