use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::league::League;
use crate::model::{RawStats, stat};

pub const RATING_FLOOR: u8 = 1;
pub const RATING_CEIL: u8 = 10;
const DEGENERATE_RATING: u8 = 5;
// Absorbs float error so exact halves still round up.
const HALF_UP_EPSILON: f64 = 1e-9;

pub const BUILTIN_BOUNDS_VERSION: &str = "2024.1";

/// Fixed historical range and weight of one input statistic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatBound {
    pub stat: String,
    pub min: f64,
    pub max: f64,
    pub weight: f64,
}

impl StatBound {
    pub fn new(stat: &str, min: f64, max: f64, weight: f64) -> Self {
        Self {
            stat: stat.to_string(),
            min,
            max,
            weight,
        }
    }

    // Value that contributes least to the composite.
    fn floor_value(&self) -> f64 {
        if self.weight >= 0.0 { self.min } else { self.max }
    }

    fn contribution_range(&self) -> (f64, f64) {
        let a = self.weight * self.min;
        let b = self.weight * self.max;
        (a.min(b), a.max(b))
    }
}

/// Volume gate: below `min_value` of `stat` the rating is pinned to the floor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptGate {
    pub stat: String,
    pub min_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingSpec {
    pub name: String,
    pub inputs: Vec<StatBound>,
    #[serde(default)]
    pub gate: Option<AttemptGate>,
}

/// Rating definitions per league. Both leagues rate the same names, so every
/// record carries the full set; only the inputs and ranges differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationBounds {
    pub version: String,
    pub professional: Vec<RatingSpec>,
    pub collegiate: Vec<RatingSpec>,
}

impl NormalizationBounds {
    /// Ranges chosen from historical league-wide per-game distributions.
    /// They are not recomputed per season; changing them re-rates everyone.
    pub fn builtin() -> Self {
        let mut professional = shared_ratings();
        professional.push(RatingSpec {
            name: "defense".to_string(),
            inputs: vec![
                StatBound::new(stat::STL, 0.0, 1.6, 1.5),
                StatBound::new(stat::BLK, 0.0, 1.1, 1.0),
                StatBound::new(stat::DEF_RATING, 96.0, 116.0, -0.05),
            ],
            gate: None,
        });
        // The collegiate feed has no defensive rating.
        let mut collegiate = shared_ratings();
        collegiate.push(RatingSpec {
            name: "defense".to_string(),
            inputs: vec![
                StatBound::new(stat::STL, 0.0, 1.6, 1.5),
                StatBound::new(stat::BLK, 0.0, 1.1, 1.0),
            ],
            gate: None,
        });
        Self {
            version: BUILTIN_BOUNDS_VERSION.to_string(),
            professional,
            collegiate,
        }
    }

    /// One rating set used for both leagues.
    pub fn uniform(version: &str, ratings: Vec<RatingSpec>) -> Self {
        Self {
            version: version.to_string(),
            professional: ratings.clone(),
            collegiate: ratings,
        }
    }

    pub fn for_league(&self, league: League) -> &[RatingSpec] {
        match league {
            League::Professional => &self.professional,
            League::Collegiate => &self.collegiate,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.version.trim().is_empty() {
            return Err("bounds version is empty".to_string());
        }
        validate_ratings(League::Professional, &self.professional)?;
        validate_ratings(League::Collegiate, &self.collegiate)?;

        if rating_set(&self.professional) != rating_set(&self.collegiate) {
            return Err("leagues must define the same rating names".to_string());
        }
        Ok(())
    }
}

fn shared_ratings() -> Vec<RatingSpec> {
    vec![
        RatingSpec {
            name: "shooting_inside".to_string(),
            inputs: vec![
                StatBound::new(stat::FG_PCT, 0.35, 0.55, 0.5),
                StatBound::new(stat::FGM, 0.0, 10.0, 0.01),
            ],
            gate: None,
        },
        RatingSpec {
            name: "shooting_mid".to_string(),
            inputs: vec![
                StatBound::new(stat::FG_PCT, 0.35, 0.50, 0.5),
                StatBound::new(stat::FT_PCT, 0.60, 0.90, 0.25),
            ],
            gate: None,
        },
        RatingSpec {
            name: "shooting_3pt".to_string(),
            inputs: vec![
                StatBound::new(stat::FG3_PCT, 0.28, 0.44, 1.0),
                StatBound::new(stat::FG3M, 0.0, 3.5, 0.045),
            ],
            gate: Some(AttemptGate {
                stat: stat::FG3A.to_string(),
                min_value: 0.1,
            }),
        },
        RatingSpec {
            name: "dribbling".to_string(),
            inputs: vec![
                StatBound::new(stat::AST, 0.0, 9.5, 1.0),
                StatBound::new(stat::TOV, 0.5, 4.0, -0.5),
            ],
            gate: None,
        },
        RatingSpec {
            name: "passing".to_string(),
            inputs: vec![StatBound::new(stat::AST, 0.0, 9.5, 1.0)],
            gate: None,
        },
        RatingSpec {
            name: "rebounding".to_string(),
            inputs: vec![StatBound::new(stat::REB, 0.0, 12.0, 1.0)],
            gate: None,
        },
    ]
}

fn rating_set(ratings: &[RatingSpec]) -> BTreeSet<&str> {
    ratings.iter().map(|r| r.name.as_str()).collect()
}

fn validate_ratings(league: League, ratings: &[RatingSpec]) -> Result<(), String> {
    let mut seen = HashSet::new();
    for rating in ratings {
        if !seen.insert(rating.name.as_str()) {
            return Err(format!("{league}: duplicate rating {}", rating.name));
        }
        if rating.inputs.is_empty() {
            return Err(format!("{league}: rating {} has no inputs", rating.name));
        }
        for input in &rating.inputs {
            let finite = input.min.is_finite() && input.max.is_finite() && input.weight.is_finite();
            if !finite || input.min > input.max {
                return Err(format!(
                    "{league}: rating {}: invalid bound for {} ({}..{} w={})",
                    rating.name, input.stat, input.min, input.max, input.weight
                ));
            }
        }
    }
    Ok(())
}

/// Maps a raw stat line onto the full set of 1-10 ratings `bounds` defines
/// for `league`.
///
/// Total over any stat line: missing or non-finite inputs take the value that
/// contributes least to their composite, so they floor that component instead
/// of failing.
pub fn normalize(
    raw: &RawStats,
    league: League,
    bounds: &NormalizationBounds,
) -> BTreeMap<String, u8> {
    bounds
        .for_league(league)
        .iter()
        .map(|spec| (spec.name.clone(), rate(raw, spec)))
        .collect()
}

fn rate(raw: &RawStats, spec: &RatingSpec) -> u8 {
    if let Some(gate) = spec.gate.as_ref() {
        let volume = raw.stat(&gate.stat).unwrap_or(0.0);
        if volume < gate.min_value {
            return RATING_FLOOR;
        }
    }
    if let [input] = spec.inputs.as_slice()
        && input.weight > 0.0
    {
        return rate_stat(raw.stat(&input.stat), input.min, input.max);
    }

    let mut composite = 0.0;
    let mut lo = 0.0;
    let mut hi = 0.0;
    for input in &spec.inputs {
        let value = raw
            .stat(&input.stat)
            .unwrap_or_else(|| input.floor_value())
            .max(input.min)
            .min(input.max);
        composite += input.weight * value;
        let (a, b) = input.contribution_range();
        lo += a;
        hi += b;
    }
    scale(composite, lo, hi)
}

/// Single-statistic rating: `None` floors, degenerate bounds give the midpoint.
pub fn rate_stat(value: Option<f64>, min: f64, max: f64) -> u8 {
    let Some(value) = value.filter(|v| v.is_finite()) else {
        return RATING_FLOOR;
    };
    scale(value, min, max)
}

fn scale(value: f64, lo: f64, hi: f64) -> u8 {
    let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
    if (hi - lo).abs() < f64::EPSILON {
        return DEGENERATE_RATING;
    }
    let scaled = (value.max(lo).min(hi) - lo) / (hi - lo) * 10.0;
    let rounded = (scaled + 0.5 + HALF_UP_EPSILON).floor();
    (rounded as i64).clamp(RATING_FLOOR as i64, RATING_CEIL as i64) as u8
}
