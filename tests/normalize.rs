use serde_json::Value;

use hoopgen::league::League;
use hoopgen::model::{RawStats, stat};
use hoopgen::normalize::{
    AttemptGate, NormalizationBounds, RATING_CEIL, RATING_FLOOR, RatingSpec, StatBound, normalize,
    rate_stat,
};

fn line(pairs: &[(&str, f64)]) -> RawStats {
    let mut raw = RawStats::new("test", Value::Null);
    for (key, value) in pairs {
        raw.set_stat(key, Some(*value));
    }
    raw
}

const PRO: League = League::Professional;

fn three_point_only() -> NormalizationBounds {
    NormalizationBounds::uniform(
        "test",
        vec![RatingSpec {
            name: "shooting_3pt".to_string(),
            inputs: vec![StatBound::new(stat::FG3_PCT, 0.25, 0.45, 1.0)],
            gate: None,
        }],
    )
}

#[test]
fn three_point_example_maps_ends_and_midpoint() {
    let bounds = three_point_only();
    let rate = |pct: f64| {
        normalize(&line(&[(stat::FG3_PCT, pct)]), PRO, &bounds)["shooting_3pt"]
    };
    assert_eq!(rate(0.45), 10);
    assert_eq!(rate(0.25), 1);
    assert_eq!(rate(0.35), 5);
}

#[test]
fn values_outside_bounds_are_clamped() {
    let bounds = three_point_only();
    let rate = |pct: f64| {
        normalize(&line(&[(stat::FG3_PCT, pct)]), PRO, &bounds)["shooting_3pt"]
    };
    assert_eq!(rate(0.0), RATING_FLOOR);
    assert_eq!(rate(0.90), RATING_CEIL);
    assert_eq!(rate(-3.0), RATING_FLOOR);
}

#[test]
fn rate_stat_matches_single_stat_scaling() {
    assert_eq!(rate_stat(Some(0.45), 0.25, 0.45), 10);
    assert_eq!(rate_stat(Some(0.35), 0.25, 0.45), 5);
    assert_eq!(rate_stat(Some(0.10), 0.25, 0.45), 1);
    assert_eq!(rate_stat(None, 0.25, 0.45), 1);
    assert_eq!(rate_stat(Some(f64::NAN), 0.25, 0.45), 1);
    assert_eq!(rate_stat(Some(3.0), 2.0, 2.0), 5);
}

#[test]
fn every_rating_present_for_empty_and_full_lines() {
    let bounds = NormalizationBounds::builtin();
    let names = bounds
        .for_league(PRO)
        .iter()
        .map(|r| r.name.clone())
        .collect::<Vec<_>>();

    let empty = normalize(&line(&[]), PRO, &bounds);
    let full = normalize(
        &line(&[
            (stat::FG_PCT, 0.48),
            (stat::FGM, 8.0),
            (stat::FT_PCT, 0.8),
            (stat::FG3_PCT, 0.38),
            (stat::FG3M, 2.0),
            (stat::FG3A, 5.5),
            (stat::AST, 6.0),
            (stat::TOV, 2.5),
            (stat::REB, 7.0),
            (stat::STL, 1.2),
            (stat::BLK, 0.6),
            (stat::DEF_RATING, 104.0),
        ]),
        PRO,
        &bounds,
    );
    for ratings in [&empty, &full] {
        assert_eq!(ratings.keys().cloned().collect::<Vec<_>>(), {
            let mut sorted = names.clone();
            sorted.sort();
            sorted
        });
        assert!(ratings.values().all(|v| (RATING_FLOOR..=RATING_CEIL).contains(v)));
    }
}

#[test]
fn missing_inputs_floor_their_contribution() {
    let bounds = NormalizationBounds::builtin();
    let ratings = normalize(&line(&[]), PRO, &bounds);
    assert!(ratings.values().all(|v| *v == RATING_FLOOR));
}

#[test]
fn inverse_stats_lower_the_rating() {
    let bounds = NormalizationBounds::builtin();
    let careful = normalize(&line(&[(stat::AST, 6.0), (stat::TOV, 0.5)]), PRO, &bounds);
    let sloppy = normalize(&line(&[(stat::AST, 6.0), (stat::TOV, 4.0)]), PRO, &bounds);
    assert!(careful["dribbling"] > sloppy["dribbling"]);
    assert_eq!(careful["passing"], sloppy["passing"]);
}

#[test]
fn low_attempt_gate_pins_rating_to_floor() {
    let bounds = NormalizationBounds::uniform(
        "test",
        vec![RatingSpec {
            name: "shooting_3pt".to_string(),
            inputs: vec![StatBound::new(stat::FG3_PCT, 0.25, 0.45, 1.0)],
            gate: Some(AttemptGate {
                stat: stat::FG3A.to_string(),
                min_value: 0.1,
            }),
        }],
    );
    let lucky = line(&[(stat::FG3_PCT, 1.0), (stat::FG3A, 0.05)]);
    let regular = line(&[(stat::FG3_PCT, 1.0), (stat::FG3A, 3.0)]);
    let unknown = line(&[(stat::FG3_PCT, 1.0)]);
    assert_eq!(normalize(&lucky, PRO, &bounds)["shooting_3pt"], 1);
    assert_eq!(normalize(&regular, PRO, &bounds)["shooting_3pt"], 10);
    assert_eq!(normalize(&unknown, PRO, &bounds)["shooting_3pt"], 1);
}

#[test]
fn normalize_is_deterministic() {
    let bounds = NormalizationBounds::builtin();
    let raw = line(&[(stat::FG_PCT, 0.51), (stat::REB, 9.3), (stat::AST, 2.2)]);
    assert_eq!(normalize(&raw, PRO, &bounds), normalize(&raw, PRO, &bounds));
}

#[test]
fn collegiate_defense_reaches_the_ceiling_without_defensive_rating() {
    let bounds = NormalizationBounds::builtin();
    let stopper = line(&[(stat::STL, 3.0), (stat::BLK, 4.0)]);
    assert_eq!(normalize(&stopper, League::Collegiate, &bounds)["defense"], RATING_CEIL);

    let mut pro = stopper.clone();
    pro.set_stat(stat::DEF_RATING, Some(96.0));
    assert_eq!(normalize(&pro, PRO, &bounds)["defense"], RATING_CEIL);
}

#[test]
fn both_leagues_rate_the_same_names() {
    let bounds = NormalizationBounds::builtin();
    let raw = line(&[(stat::REB, 6.0)]);
    let pro = normalize(&raw, PRO, &bounds);
    let college = normalize(&raw, League::Collegiate, &bounds);
    assert_eq!(
        pro.keys().collect::<Vec<_>>(),
        college.keys().collect::<Vec<_>>()
    );
    assert_eq!(pro["rebounding"], college["rebounding"]);
}

#[test]
fn single_input_ratings_match_rate_stat() {
    let bounds = NormalizationBounds::builtin();
    for reb in [0.0, 3.3, 6.0, 11.9, 15.0] {
        let rated = normalize(&line(&[(stat::REB, reb)]), PRO, &bounds)["rebounding"];
        assert_eq!(rated, rate_stat(Some(reb), 0.0, 12.0), "reb={reb}");
    }
}
