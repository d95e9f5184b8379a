use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::{ProviderPayload, SourceClient, SourceOptions, get_json};
use crate::http_cache::CachePolicy;
use crate::error::SourceError;
use crate::league::League;
use crate::model::{
    DraftPick, PlayerBio, RawStats, RosterEntry, stat, value_as_f64, value_as_string,
};

const STATS_BASE: &str = "https://stats.nba.com/stats";
const HEADSHOT_BASE: &str = "https://cdn.nba.com/headshots/nba/latest/260x190";
const STATS_HEADERS: &[(&str, &str)] = &[
    ("Referer", "https://www.nba.com/"),
    ("Origin", "https://www.nba.com"),
    ("x-nba-stats-origin", "stats"),
    ("x-nba-stats-token", "true"),
];

const STAT_KEYS: [&str; 18] = [
    stat::GP,
    stat::MIN,
    stat::PTS,
    stat::REB,
    stat::AST,
    stat::STL,
    stat::BLK,
    stat::TOV,
    stat::FGM,
    stat::FGA,
    stat::FG_PCT,
    stat::FG3M,
    stat::FG3A,
    stat::FG3_PCT,
    stat::FTM,
    stat::FTA,
    stat::FT_PCT,
    stat::DEF_RATING,
];

/// One stats.nba.com row keyed by column header.
#[derive(Debug, Clone, PartialEq)]
pub struct NbaStatRow {
    pub fields: Map<String, Value>,
    pub per_game: bool,
    pub bio: PlayerBio,
}

impl NbaStatRow {
    pub fn player_id(&self) -> Option<String> {
        self.fields
            .get("PLAYER_ID")
            .and_then(value_as_string)
    }

    pub fn into_raw_stats(self) -> RawStats {
        let mut raw = RawStats::new("nba", Value::Object(self.fields));
        if let Value::Object(fields) = &raw.payload {
            let extracted = STAT_KEYS
                .iter()
                .map(|key| (*key, fields.get(*key).and_then(value_as_f64)))
                .collect::<Vec<_>>();
            for (key, value) in extracted {
                raw.set_stat(key, value);
            }
        }
        if !self.per_game {
            raw.totals_to_per_game();
        }
        raw.bio = self.bio;
        raw
    }
}

pub struct NbaClient {
    options: SourceOptions,
    // (season, player id) -> row from the last roster listing
    rows: Mutex<HashMap<(String, String), NbaStatRow>>,
    // (season, team id) -> player id -> roster metadata
    team_bios: Mutex<HashMap<(String, String), HashMap<String, PlayerBio>>>,
}

impl NbaClient {
    pub fn new(options: SourceOptions) -> Self {
        Self {
            options,
            rows: Mutex::new(HashMap::new()),
            team_bios: Mutex::new(HashMap::new()),
        }
    }

    fn league_dash(&self, season: &str, measure: &str) -> Result<Vec<NbaStatRow>, SourceError> {
        let url = format!(
            "{STATS_BASE}/leaguedashplayerstats?College=&Conference=&Country=&DateFrom=&DateTo=\
             &Division=&DraftPick=&DraftYear=&GameScope=&GameSegment=&Height=&LastNGames=0\
             &LeagueID=00&Location=&MeasureType={measure}&Month=0&OpponentTeamID=0&Outcome=\
             &PORound=0&PaceAdjust=N&PerMode=PerGame&Period=0&PlayerExperience=&PlayerPosition=\
             &PlusMinus=N&Rank=N&Season={season}&SeasonSegment=&SeasonType=Regular%20Season\
             &ShotClockRange=&StarterBench=&TeamID=0&TwoWay=0&VsConference=&VsDivision=&Weight="
        );
        let body = get_json(&self.options, &url, STATS_HEADERS, CachePolicy::Revalidate)?;
        parse_league_dash_json(&body)
    }

    fn team_bio(&self, season: &str, team_id: &str, player_id: &str) -> Option<PlayerBio> {
        let key = (season.to_string(), team_id.to_string());
        if let Some(team) = lock(&self.team_bios).get(&key) {
            return team.get(player_id).cloned();
        }

        let url = format!(
            "{STATS_BASE}/commonteamroster?LeagueID=00&Season={season}&TeamID={team_id}"
        );
        let bios = match get_json(&self.options, &url, STATS_HEADERS, CachePolicy::Revalidate)
            .and_then(|body| parse_team_roster_json(&body))
        {
            Ok(bios) => bios,
            Err(err) => {
                warn!(season, team_id, error = %err, "team roster metadata unavailable");
                HashMap::new()
            }
        };
        let out = bios.get(player_id).cloned();
        lock(&self.team_bios).insert(key, bios);
        out
    }

    fn career_row(&self, season: &str, player_id: &str) -> Result<NbaStatRow, SourceError> {
        let url = format!(
            "{STATS_BASE}/playercareerstats?LeagueID=00&PerMode=Totals&PlayerID={player_id}"
        );
        let body = get_json(&self.options, &url, STATS_HEADERS, CachePolicy::Bypass)?;
        parse_career_season_json(&body, season)?.ok_or_else(|| {
            SourceError::Parse(format!("no {season} season row for player {player_id}"))
        })
    }
}

impl SourceClient for NbaClient {
    fn league(&self) -> League {
        League::Professional
    }

    fn list_roster(&self, season: &str) -> Result<Vec<RosterEntry>, SourceError> {
        let mut rows = self.league_dash(season, "Base")?;
        match self.league_dash(season, "Advanced") {
            Ok(advanced) => merge_def_rating(&mut rows, &advanced),
            Err(err) => warn!(season, error = %err, "advanced stats unavailable"),
        }

        let mut entries = Vec::with_capacity(rows.len());
        let mut memo = lock(&self.rows);
        for row in rows {
            let Some(source_id) = row.player_id() else {
                continue;
            };
            entries.push(RosterEntry {
                source_id: source_id.clone(),
                name: row
                    .fields
                    .get("PLAYER_NAME")
                    .and_then(value_as_string)
                    .unwrap_or_else(|| "Unknown".to_string()),
                team_id: row
                    .fields
                    .get("TEAM_ID")
                    .and_then(value_as_string)
                    .unwrap_or_default(),
            });
            memo.insert((season.to_string(), source_id), row);
        }
        info!(season, players = entries.len(), "listed professional roster");
        Ok(entries)
    }

    fn fetch_stats(
        &self,
        season: &str,
        entry: &RosterEntry,
    ) -> Result<ProviderPayload, SourceError> {
        let memo = lock(&self.rows)
            .get(&(season.to_string(), entry.source_id.clone()))
            .cloned();
        let mut row = match memo {
            Some(row) => row,
            None => {
                debug!(season, player = %entry.source_id, "not in league listing, using career stats");
                self.career_row(season, &entry.source_id)?
            }
        };
        if !entry.team_id.is_empty()
            && let Some(bio) = self.team_bio(season, &entry.team_id, &entry.source_id)
        {
            row.bio.merge_missing(bio);
        }
        Ok(ProviderPayload::Professional(row))
    }

    fn fetch_draft_history(&self, season: &str) -> Result<Vec<DraftPick>, SourceError> {
        let url = format!("{STATS_BASE}/drafthistory?LeagueID=00&Season={season}");
        let body = get_json(&self.options, &url, STATS_HEADERS, CachePolicy::Revalidate)?;
        parse_draft_history_json(&body, season)
    }

    fn headshot_url(&self, source_id: &str) -> Option<String> {
        (!source_id.is_empty()).then(|| format!("{HEADSHOT_BASE}/{source_id}.png"))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn merge_def_rating(rows: &mut [NbaStatRow], advanced: &[NbaStatRow]) {
    let by_id = advanced
        .iter()
        .filter_map(|row| Some((row.player_id()?, row.fields.get(stat::DEF_RATING)?.clone())))
        .collect::<HashMap<_, _>>();
    for row in rows {
        if let Some(id) = row.player_id()
            && let Some(def) = by_id.get(&id)
        {
            row.fields.insert(stat::DEF_RATING.to_string(), def.clone());
        }
    }
}

/// Rows of the named result set (or the first one when `name` is `None`).
pub fn parse_result_set(
    raw: &str,
    name: Option<&str>,
) -> Result<Vec<Map<String, Value>>, SourceError> {
    let value: Value = serde_json::from_str(raw.trim())?;
    let sets = match value.get("resultSets").or_else(|| value.get("resultSet")) {
        Some(Value::Array(sets)) => sets.clone(),
        Some(single @ Value::Object(_)) => vec![single.clone()],
        _ => return Err(SourceError::Parse("no resultSets in response".to_string())),
    };
    let set = match name {
        Some(name) => sets
            .iter()
            .find(|s| s.get("name").and_then(Value::as_str) == Some(name)),
        None => sets.first(),
    }
    .ok_or_else(|| SourceError::Parse(format!("result set {name:?} missing")))?;

    let headers = set
        .get("headers")
        .and_then(Value::as_array)
        .ok_or_else(|| SourceError::Parse("result set has no headers".to_string()))?
        .iter()
        .map(|h| h.as_str().unwrap_or_default().to_string())
        .collect::<Vec<_>>();
    let rows = set
        .get("rowSet")
        .and_then(Value::as_array)
        .ok_or_else(|| SourceError::Parse("result set has no rowSet".to_string()))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(cells) = row.as_array() else {
            continue;
        };
        let fields = headers
            .iter()
            .cloned()
            .zip(cells.iter().cloned())
            .collect::<Map<String, Value>>();
        out.push(fields);
    }
    Ok(out)
}

pub fn parse_league_dash_json(raw: &str) -> Result<Vec<NbaStatRow>, SourceError> {
    Ok(parse_result_set(raw, None)?
        .into_iter()
        .map(|fields| NbaStatRow {
            fields,
            per_game: true,
            bio: PlayerBio::default(),
        })
        .collect())
}

pub fn parse_team_roster_json(raw: &str) -> Result<HashMap<String, PlayerBio>, SourceError> {
    let rows = parse_result_set(raw, Some("CommonTeamRoster"))?;
    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        let Some(id) = row.get("PLAYER_ID").and_then(value_as_string) else {
            continue;
        };
        let text = |key: &str| row.get(key).and_then(value_as_string);
        out.insert(
            id,
            PlayerBio {
                age: row.get("AGE").and_then(value_as_f64),
                height: text("HEIGHT"),
                weight: text("WEIGHT"),
                position: text("POSITION"),
                country: text("BIRTH_COUNTRY").or_else(|| text("COUNTRY")),
                school: text("SCHOOL"),
            },
        );
    }
    Ok(out)
}

/// Season totals for `season`; a traded player's combined `TOT` row wins,
/// with the team of the last stint.
pub fn parse_career_season_json(
    raw: &str,
    season: &str,
) -> Result<Option<NbaStatRow>, SourceError> {
    let rows = parse_result_set(raw, Some("SeasonTotalsRegularSeason"))?;
    let season_rows = rows
        .into_iter()
        .filter(|r| r.get("SEASON_ID").and_then(Value::as_str) == Some(season))
        .collect::<Vec<_>>();
    let last_team = season_rows
        .iter()
        .rev()
        .find(|r| r.get("TEAM_ABBREVIATION").and_then(Value::as_str) != Some("TOT"))
        .and_then(|r| r.get("TEAM_ID").cloned());
    let chosen = season_rows
        .iter()
        .find(|r| r.get("TEAM_ABBREVIATION").and_then(Value::as_str) == Some("TOT"))
        .or_else(|| season_rows.last())
        .cloned();

    Ok(chosen.map(|mut fields| {
        if let Some(team) = last_team {
            fields.insert("TEAM_ID".to_string(), team);
        }
        let bio = PlayerBio {
            age: fields.get("PLAYER_AGE").and_then(value_as_f64),
            ..PlayerBio::default()
        };
        NbaStatRow {
            fields,
            per_game: false,
            bio,
        }
    }))
}

pub fn parse_draft_history_json(raw: &str, season: &str) -> Result<Vec<DraftPick>, SourceError> {
    let rows = parse_result_set(raw, Some("DraftHistory"))?;
    let mut out = Vec::new();
    for row in rows {
        let row_season = row.get("SEASON").and_then(value_as_string);
        if row_season.as_deref() != Some(season) {
            continue;
        }
        let Some(person_id) = row.get("PERSON_ID").and_then(value_as_string) else {
            continue;
        };
        let number = |key: &str| {
            row.get(key)
                .and_then(value_as_f64)
                .and_then(|v| u32::try_from(v as i64).ok())
        };
        out.push(DraftPick {
            season: season.to_string(),
            person_id,
            name: row
                .get("PLAYER_NAME")
                .and_then(value_as_string)
                .unwrap_or_else(|| "Unknown".to_string()),
            round: number("ROUND_NUMBER"),
            round_pick: number("ROUND_PICK"),
            overall_pick: number("OVERALL_PICK"),
            team_id: row.get("TEAM_ID").and_then(value_as_string),
            organization: row.get("ORGANIZATION").and_then(value_as_string),
        });
    }
    out.sort_by_key(|p| p.overall_pick.unwrap_or(u32::MAX));
    Ok(out)
}
