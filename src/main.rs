use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{info, warn};

use hoopgen::config::Config;
use hoopgen::http_cache;
use hoopgen::league::League;
use hoopgen::logging;
use hoopgen::repository::{InvalidateScope, Repository};
use hoopgen::sources::{EspnClient, HttpImageSource, ImageSource, NbaClient, NoImages};
use hoopgen::store::SqliteStore;
use hoopgen::tables::{self, StaticTables};

const USAGE: &str = "usage: hoopgen --league=nba|ncaa|draft --year=YYYY [--db=PATH] \
                     [--invalidate[=full]] [--player=ID] [--debug]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Cohort(League),
    Draft,
}

impl Mode {
    fn label(self) -> &'static str {
        match self {
            Mode::Cohort(league) => league.key(),
            Mode::Draft => "DRAFT",
        }
    }
}

#[derive(Debug)]
struct Args {
    mode: Mode,
    year: i32,
    db: Option<PathBuf>,
    invalidate: Option<InvalidateScope>,
    player: Option<String>,
    debug: bool,
}

fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1).collect())?;
    Config::load_dotenv();
    let config = Config::from_env();

    let season = match args.mode {
        Mode::Cohort(league) => league.season_for_year(args.year),
        Mode::Draft => args.year.to_string(),
    };
    if let Some(path) = logging::init(args.mode.label(), &season, args.debug) {
        eprintln!("Logging to: {}", path.display());
    }

    let static_tables =
        StaticTables::load(config.bounds_file.as_deref(), config.palette_file.as_deref())
            .context("load static tables")?;
    tables::install(static_tables)?;

    let db_path = args
        .db
        .clone()
        .or_else(|| config.db_path.clone())
        .context("unable to resolve sqlite path")?;
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("open player store {}", db_path.display()))?;

    let options = config.source_options();
    let images: Box<dyn ImageSource> = if config.fetch_images {
        Box::new(HttpImageSource)
    } else {
        Box::new(NoImages)
    };
    let repo = Repository::new(
        Box::new(store),
        Box::new(NbaClient::new(options)),
        Box::new(EspnClient::new(options)),
        images,
    )?;

    let out_dir = config.output_dir.join(args.year.to_string());
    let outcome = run(&repo, &args, &season, &out_dir, &db_path);
    // Saved even when the run failed part way.
    http_cache::flush();
    outcome
}

fn run(
    repo: &Repository,
    args: &Args,
    season: &str,
    out_dir: &Path,
    db_path: &Path,
) -> Result<()> {
    match args.mode {
        Mode::Draft => {
            let picks = repo.draft_class(season)?;
            let path = write_output(out_dir, "NBA", args.year, "draft", &picks)?;
            println!("Draft class {season}: {} picks", picks.len());
            println!("Output: {}", path.display());
        }
        Mode::Cohort(league) => {
            if let Some(scope) = args.invalidate {
                let n = repo.invalidate(league, season, args.player.as_deref(), scope)?;
                println!("Invalidated {n} record(s) ({scope:?})");
            }

            let cohort = repo.get_cohort(league, season)?;
            let stale = repo.stale_records(league, season)?;
            if !stale.is_empty() {
                warn!(
                    records = stale.len(),
                    "records were derived with older tables; rerun with --invalidate to refresh"
                );
            }

            let path = write_output(out_dir, league.key(), args.year, "players", &cohort)?;
            info!(path = %path.display(), "cohort written");

            println!("{} {season}", league.key());
            println!("DB: {}", db_path.display());
            println!(
                "Players: {} (fetched {}, cached {})",
                cohort.records.len(),
                cohort.fetched,
                cohort.cached
            );
            if !cohort.omitted.is_empty() {
                println!("Omitted: {}", cohort.omitted.len());
                for omitted in cohort.omitted.iter().take(6) {
                    println!("   - {} ({}): {}", omitted.name, omitted.source_id, omitted.reason);
                }
            }
            println!("Output: {}", path.display());
        }
    }
    Ok(())
}

fn write_output<T: Serialize>(
    dir: &Path,
    league: &str,
    year: i32,
    kind: &str,
    value: &T,
) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create output dir {}", dir.display()))?;
    let path = dir.join(format!("{league}_{year}_{kind}.json"));
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

fn parse_args(args: Vec<String>) -> Result<Args> {
    let mut mode = None;
    let mut year = None;
    let mut db = None;
    let mut invalidate = None;
    let mut player = None;
    let mut debug = false;

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        let (key, inline) = match arg.split_once('=') {
            Some((k, v)) => (k.to_string(), Some(v.trim().to_string())),
            None => (arg.clone(), None),
        };
        match key.as_str() {
            "--league" => {
                let value = inline.or_else(|| iter.next()).unwrap_or_default();
                mode = Some(if value.eq_ignore_ascii_case("draft") {
                    Mode::Draft
                } else {
                    Mode::Cohort(value.parse::<League>().map_err(|e| anyhow!(e))?)
                });
            }
            "--year" => {
                let value = inline.or_else(|| iter.next()).unwrap_or_default();
                year = Some(
                    value
                        .trim()
                        .parse::<i32>()
                        .with_context(|| format!("invalid --year {value:?}"))?,
                );
            }
            "--db" => {
                db = inline
                    .or_else(|| iter.next())
                    .filter(|v| !v.trim().is_empty())
                    .map(PathBuf::from);
            }
            "--player" => {
                player = inline
                    .or_else(|| iter.next())
                    .filter(|v| !v.trim().is_empty());
            }
            "--invalidate" => {
                invalidate = Some(match inline.as_deref() {
                    None | Some("") | Some("derived") => InvalidateScope::Derived,
                    Some("full") => InvalidateScope::Full,
                    Some(other) => return Err(anyhow!("unknown invalidate scope {other:?}")),
                });
            }
            "--debug" => debug = true,
            "-h" | "--help" => return Err(anyhow!(USAGE)),
            other => return Err(anyhow!("unknown argument {other:?}\n{USAGE}")),
        }
    }

    let mode = mode.ok_or_else(|| anyhow!("missing --league\n{USAGE}"))?;
    let year = year.ok_or_else(|| anyhow!("missing --year\n{USAGE}"))?;
    if player.is_some() && invalidate.is_none() {
        return Err(anyhow!("--player only applies together with --invalidate"));
    }
    Ok(Args {
        mode,
        year,
        db,
        invalidate,
        player,
        debug,
    })
}
