use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::league::{Identity, League};

/// Canonical per-game stat keys every provider payload is mapped onto.
pub mod stat {
    pub const GP: &str = "GP";
    pub const MIN: &str = "MIN";
    pub const PTS: &str = "PTS";
    pub const REB: &str = "REB";
    pub const AST: &str = "AST";
    pub const STL: &str = "STL";
    pub const BLK: &str = "BLK";
    pub const TOV: &str = "TOV";
    pub const FGM: &str = "FGM";
    pub const FGA: &str = "FGA";
    pub const FG_PCT: &str = "FG_PCT";
    pub const FG3M: &str = "FG3M";
    pub const FG3A: &str = "FG3A";
    pub const FG3_PCT: &str = "FG3_PCT";
    pub const FTM: &str = "FTM";
    pub const FTA: &str = "FTA";
    pub const FT_PCT: &str = "FT_PCT";
    pub const DEF_RATING: &str = "DEF_RATING";

    /// Counting stats that are divided by games played when a provider reports totals.
    pub const COUNTING: [&str; 13] = [
        MIN, PTS, REB, AST, STL, BLK, TOV, FGM, FGA, FG3M, FG3A, FTM, FTA,
    ];
}

/// Provider payload as received, plus the provider-agnostic stat line extracted from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStats {
    pub provider: String,
    pub payload: Value,
    #[serde(default)]
    pub stats: BTreeMap<String, f64>,
    #[serde(default)]
    pub bio: PlayerBio,
}

impl RawStats {
    pub fn new(provider: &str, payload: Value) -> Self {
        Self {
            provider: provider.to_string(),
            payload,
            stats: BTreeMap::new(),
            bio: PlayerBio::default(),
        }
    }

    pub fn stat(&self, key: &str) -> Option<f64> {
        self.stats.get(key).copied().filter(|v| v.is_finite())
    }

    pub fn set_stat(&mut self, key: &str, value: Option<f64>) {
        if let Some(value) = value.filter(|v| v.is_finite()) {
            self.stats.insert(key.to_string(), value);
        }
    }

    /// Converts counting stats from season totals to per-game averages.
    pub fn totals_to_per_game(&mut self) {
        let Some(gp) = self.stat(stat::GP).filter(|gp| *gp > 0.0) else {
            return;
        };
        for key in stat::COUNTING {
            if let Some(v) = self.stats.get_mut(key) {
                *v /= gp;
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerBio {
    pub age: Option<f64>,
    pub height: Option<String>,
    pub weight: Option<String>,
    pub position: Option<String>,
    pub country: Option<String>,
    pub school: Option<String>,
}

impl PlayerBio {
    /// Fills empty fields from `other`.
    pub fn merge_missing(&mut self, other: PlayerBio) {
        self.age = self.age.or(other.age);
        self.height = self.height.take().or(other.height);
        self.weight = self.weight.take().or(other.weight);
        self.position = self.position.take().or(other.position);
        self.country = self.country.take().or(other.country);
        self.school = self.school.take().or(other.school);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ratings {
    pub version: String,
    pub values: BTreeMap<String, u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appearance {
    pub skin_tone_code: u8,
    pub hair_color_code: u8,
    /// 0 means bald or not detected; the same holds for the two codes below.
    #[serde(default)]
    pub hair_style_code: u8,
    #[serde(default)]
    pub facial_hair_code: u8,
    #[serde(default)]
    pub accessory_code: u8,
    pub palette_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub identity: Identity,
    pub name: String,
    pub team_id: String,
    pub raw_stats: RawStats,
    pub derived_ratings: Option<Ratings>,
    pub appearance: Option<Appearance>,
    pub fetched_at: String,
}

impl PlayerRecord {
    pub fn is_complete(&self) -> bool {
        self.derived_ratings.is_some() && self.appearance.is_some()
    }
}

/// One line of a roster listing, in provider order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub source_id: String,
    pub name: String,
    pub team_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftPick {
    pub season: String,
    pub person_id: String,
    pub name: String,
    pub round: Option<u32>,
    pub round_pick: Option<u32>,
    pub overall_pick: Option<u32>,
    pub team_id: Option<String>,
    pub organization: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmittedPlayer {
    pub source_id: String,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Cohort {
    pub league: League,
    pub season: String,
    pub records: Vec<PlayerRecord>,
    pub omitted: Vec<OmittedPlayer>,
    pub fetched: usize,
    pub cached: usize,
}

/// Reads a JSON value as a number, accepting numeric strings.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

/// Reads a JSON scalar as a trimmed, non-empty string.
pub fn value_as_string(value: &Value) -> Option<String> {
    let rendered = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!rendered.is_empty()).then_some(rendered)
}
