use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{ProviderPayload, SourceClient, SourceOptions, get_json};
use crate::http_cache::CachePolicy;
use crate::error::SourceError;
use crate::league::League;
use crate::model::{
    DraftPick, PlayerBio, RawStats, RosterEntry, stat, value_as_f64, value_as_string,
};

const SITE_BASE: &str =
    "https://site.api.espn.com/apis/site/v2/sports/basketball/mens-college-basketball";
const ATHLETE_BASE: &str =
    "https://site.web.api.espn.com/apis/common/v3/sports/basketball/mens-college-basketball";
const HEADSHOT_BASE: &str = "https://a.espncdn.com/i/headshots/mens-college-basketball/players/full";

/// ESPN stat names mapped onto the canonical keys in [`stat`].
const STAT_NAMES: &[(&str, &str)] = &[
    ("gamesPlayed", stat::GP),
    ("avgMinutes", stat::MIN),
    ("avgPoints", stat::PTS),
    ("avgRebounds", stat::REB),
    ("avgAssists", stat::AST),
    ("avgSteals", stat::STL),
    ("avgBlocks", stat::BLK),
    ("avgTurnovers", stat::TOV),
    ("avgFieldGoalsMade", stat::FGM),
    ("avgFieldGoalsAttempted", stat::FGA),
    ("fieldGoalPct", stat::FG_PCT),
    ("avgThreePointFieldGoalsMade", stat::FG3M),
    ("avgThreePointFieldGoalsAttempted", stat::FG3A),
    ("threePointFieldGoalPct", stat::FG3_PCT),
    ("threePointPct", stat::FG3_PCT),
    ("avgFreeThrowsMade", stat::FTM),
    ("avgFreeThrowsAttempted", stat::FTA),
    ("freeThrowPct", stat::FT_PCT),
];

const PERCENT_KEYS: [&str; 3] = [stat::FG_PCT, stat::FG3_PCT, stat::FT_PCT];

/// Roster athlete object plus the per-game line from the stats endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EspnAthlete {
    pub athlete: Value,
    pub stats: BTreeMap<String, f64>,
}

impl EspnAthlete {
    pub fn into_raw_stats(self) -> RawStats {
        let bio = athlete_bio(&self.athlete);
        let mut raw = RawStats::new(
            "espn",
            json!({ "athlete": self.athlete, "stats": self.stats }),
        );
        for (key, value) in &self.stats {
            let value = if PERCENT_KEYS.contains(&key.as_str()) && *value > 1.0 {
                *value / 100.0
            } else {
                *value
            };
            raw.set_stat(key, Some(value));
        }
        raw.bio = bio;
        raw
    }
}

fn athlete_bio(athlete: &Value) -> PlayerBio {
    let text = |ptr: &str| athlete.pointer(ptr).and_then(value_as_string);
    PlayerBio {
        age: athlete.get("age").and_then(value_as_f64),
        height: text("/displayHeight"),
        weight: text("/displayWeight"),
        position: text("/position/abbreviation"),
        country: text("/birthPlace/country"),
        school: None,
    }
}

pub struct EspnClient {
    options: SourceOptions,
    // (season, athlete id) -> roster athlete object
    athletes: Mutex<HashMap<(String, String), Value>>,
}

impl EspnClient {
    pub fn new(options: SourceOptions) -> Self {
        Self {
            options,
            athletes: Mutex::new(HashMap::new()),
        }
    }

    fn team_ids(&self) -> Result<Vec<(String, String)>, SourceError> {
        let url = format!("{SITE_BASE}/teams?limit=1000");
        let body = get_json(&self.options, &url, &[], CachePolicy::Revalidate)?;
        parse_teams_json(&body)
    }
}

impl SourceClient for EspnClient {
    fn league(&self) -> League {
        League::Collegiate
    }

    fn list_roster(&self, season: &str) -> Result<Vec<RosterEntry>, SourceError> {
        let teams = self.team_ids()?;
        if teams.is_empty() {
            return Err(SourceError::Parse("team list is empty".to_string()));
        }

        let mut entries = Vec::new();
        let mut failed = 0usize;
        let mut last_err = None;
        for (team_id, team_name) in &teams {
            let url = format!("{SITE_BASE}/teams/{team_id}/roster?season={season}");
            let athletes = match get_json(&self.options, &url, &[], CachePolicy::Revalidate)
                .and_then(|body| parse_roster_json(&body))
            {
                Ok(athletes) => athletes,
                Err(err) => {
                    warn!(season, team = %team_name, error = %err, "team roster skipped");
                    failed += 1;
                    last_err = Some(err);
                    continue;
                }
            };
            debug!(season, team = %team_name, players = athletes.len(), "team roster");

            let mut memo = lock(&self.athletes);
            for athlete in athletes {
                let Some(source_id) = athlete.get("id").and_then(value_as_string) else {
                    continue;
                };
                entries.push(RosterEntry {
                    source_id: source_id.clone(),
                    name: athlete
                        .get("fullName")
                        .or_else(|| athlete.get("displayName"))
                        .and_then(value_as_string)
                        .unwrap_or_else(|| "Unknown".to_string()),
                    team_id: team_id.clone(),
                });
                memo.insert((season.to_string(), source_id), athlete);
            }
        }

        if failed == teams.len()
            && let Some(err) = last_err
        {
            return Err(err);
        }
        info!(
            season,
            teams = teams.len(),
            failed,
            players = entries.len(),
            "listed collegiate roster"
        );
        Ok(entries)
    }

    fn fetch_stats(
        &self,
        season: &str,
        entry: &RosterEntry,
    ) -> Result<ProviderPayload, SourceError> {
        let athlete = lock(&self.athletes)
            .get(&(season.to_string(), entry.source_id.clone()))
            .cloned()
            .unwrap_or_else(|| json!({ "id": entry.source_id, "fullName": entry.name }));

        let url = format!("{ATHLETE_BASE}/athletes/{}/stats", entry.source_id);
        let body = get_json(&self.options, &url, &[], CachePolicy::Bypass)?;
        let stats = parse_athlete_stats_json(&body, season)?;
        Ok(ProviderPayload::Collegiate(EspnAthlete { athlete, stats }))
    }

    /// The collegiate provider has no draft history.
    fn fetch_draft_history(&self, _season: &str) -> Result<Vec<DraftPick>, SourceError> {
        Ok(Vec::new())
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

/// `(team id, display name)` pairs from the `sports -> leagues -> teams` tree.
pub fn parse_teams_json(raw: &str) -> Result<Vec<(String, String)>, SourceError> {
    let value: Value = serde_json::from_str(raw.trim())?;
    let sports = value
        .get("sports")
        .and_then(Value::as_array)
        .ok_or_else(|| SourceError::Parse("teams response has no sports".to_string()))?;

    let mut out = Vec::new();
    for sport in sports {
        let leagues = sport.get("leagues").and_then(Value::as_array);
        for league in leagues.into_iter().flatten() {
            let teams = league.get("teams").and_then(Value::as_array);
            for wrapper in teams.into_iter().flatten() {
                let team = wrapper.get("team").unwrap_or(wrapper);
                let Some(id) = team.get("id").and_then(value_as_string) else {
                    continue;
                };
                let name = team
                    .get("displayName")
                    .and_then(value_as_string)
                    .unwrap_or_else(|| id.clone());
                out.push((id, name));
            }
        }
    }
    Ok(out)
}

/// Athletes from a roster response; accepts both the flat list and the
/// grouped `[{ "items": [...] }]` shape.
pub fn parse_roster_json(raw: &str) -> Result<Vec<Value>, SourceError> {
    let value: Value = serde_json::from_str(raw.trim())?;
    let athletes = value
        .get("athletes")
        .and_then(Value::as_array)
        .ok_or_else(|| SourceError::Parse("roster response has no athletes".to_string()))?;

    let mut out = Vec::with_capacity(athletes.len());
    for item in athletes {
        match item.get("items").and_then(Value::as_array) {
            Some(group) => out.extend(group.iter().cloned()),
            None => out.push(item.clone()),
        }
    }
    Ok(out)
}

/// Per-game line for `season` from an athlete stats response. Unknown stat
/// names and non-numeric cells are skipped; a season with no row yields an
/// empty map.
pub fn parse_athlete_stats_json(
    raw: &str,
    season: &str,
) -> Result<BTreeMap<String, f64>, SourceError> {
    let value: Value = serde_json::from_str(raw.trim())?;
    let Some(categories) = value.get("categories").and_then(Value::as_array) else {
        return Ok(BTreeMap::new());
    };

    let mut out = BTreeMap::new();
    for category in categories {
        let Some(names) = category.get("names").and_then(Value::as_array) else {
            continue;
        };
        let rows = category
            .get("statistics")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let Some(row) = rows.iter().rev().find(|row| {
            row.pointer("/season/year").and_then(value_as_string).as_deref() == Some(season)
        }) else {
            continue;
        };
        let cells = row
            .get("stats")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for (name, cell) in names.iter().zip(cells) {
            let Some(name) = name.as_str() else {
                continue;
            };
            let Some((_, key)) = STAT_NAMES.iter().find(|(espn, _)| *espn == name) else {
                continue;
            };
            if let Some(v) = value_as_f64(cell) {
                out.entry((*key).to_string()).or_insert(v);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentages_are_scaled_to_fractions() {
        let athlete = EspnAthlete {
            athlete: json!({ "id": "1", "displayHeight": "6' 5\"" }),
            stats: BTreeMap::from([
                (stat::FG_PCT.to_string(), 48.5),
                (stat::FT_PCT.to_string(), 0.8),
                (stat::PTS.to_string(), 14.0),
            ]),
        };
        let raw = athlete.into_raw_stats();
        assert_eq!(raw.stat(stat::FG_PCT), Some(0.485));
        assert_eq!(raw.stat(stat::FT_PCT), Some(0.8));
        assert_eq!(raw.stat(stat::PTS), Some(14.0));
        assert_eq!(raw.bio.height.as_deref(), Some("6' 5\""));
        assert_eq!(raw.provider, "espn");
    }

    #[test]
    fn grouped_roster_is_flattened() {
        let raw = r#"{"athletes":[{"position":"G","items":[{"id":"1"},{"id":"2"}]},{"items":[{"id":"3"}]}]}"#;
        let athletes = parse_roster_json(raw).expect("roster");
        assert_eq!(athletes.len(), 3);
    }
}
