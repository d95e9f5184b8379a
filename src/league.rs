use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};

pub const PROFESSIONAL_FIRST_SEASON: i32 = 2000;
pub const COLLEGIATE_FIRST_SEASON: i32 = 2002;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum League {
    Professional,
    Collegiate,
}

impl League {
    pub fn key(self) -> &'static str {
        match self {
            League::Professional => "NBA",
            League::Collegiate => "NCAA",
        }
    }

    /// Season identifier the provider uses for the season that ends in `year`.
    pub fn season_for_year(self, year: i32) -> String {
        match self {
            League::Professional => format!("{}-{:02}", year - 1, year.rem_euclid(100)),
            League::Collegiate => year.to_string(),
        }
    }

    /// Checks the provider's season format and the supported year range.
    pub fn validate_season(self, season: &str) -> Option<i32> {
        let current = Utc::now().year();
        match self {
            League::Professional => {
                let (start, end) = season.split_once('-')?;
                if start.len() != 4 || end.len() != 2 {
                    return None;
                }
                let start = start.parse::<i32>().ok()?;
                let end = end.parse::<i32>().ok()?;
                if (start + 1).rem_euclid(100) != end {
                    return None;
                }
                (PROFESSIONAL_FIRST_SEASON..=current)
                    .contains(&start)
                    .then_some(start)
            }
            League::Collegiate => {
                if season.len() != 4 {
                    return None;
                }
                let year = season.parse::<i32>().ok()?;
                (COLLEGIATE_FIRST_SEASON..=current + 1)
                    .contains(&year)
                    .then_some(year)
            }
        }
    }
}

impl fmt::Display for League {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for League {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nba" | "pro" | "professional" => Ok(League::Professional),
            "ncaa" | "college" | "collegiate" => Ok(League::Collegiate),
            other => Err(format!("unknown league {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub league: League,
    pub season: String,
    pub source_id: String,
}

impl Identity {
    pub fn new(league: League, season: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            league,
            season: season.into(),
            source_id: source_id.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.league, self.season, self.source_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn season_for_year_matches_provider_format() {
        assert_eq!(League::Professional.season_for_year(2004), "2003-04");
        assert_eq!(League::Professional.season_for_year(2000), "1999-00");
        assert_eq!(League::Collegiate.season_for_year(2004), "2004");
    }

    #[test]
    fn validate_season_checks_shape_and_range() {
        assert_eq!(League::Professional.validate_season("2003-04"), Some(2003));
        assert_eq!(League::Professional.validate_season("2003-05"), None);
        assert_eq!(League::Professional.validate_season("1995-96"), None);
        assert_eq!(League::Professional.validate_season("2003"), None);
        assert_eq!(League::Collegiate.validate_season("2002"), Some(2002));
        assert_eq!(League::Collegiate.validate_season("2001"), None);
        assert_eq!(League::Collegiate.validate_season("2003-04"), None);
    }

    #[test]
    fn league_parses_cli_names() {
        assert_eq!("NBA".parse::<League>(), Ok(League::Professional));
        assert_eq!("ncaa".parse::<League>(), Ok(League::Collegiate));
        assert!("wnba".parse::<League>().is_err());
    }
}
