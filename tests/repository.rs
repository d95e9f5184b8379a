use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use serde_json::json;
use tempfile::TempDir;

use hoopgen::error::{RepositoryError, SourceError, StoreError};
use hoopgen::league::{Identity, League};
use hoopgen::model::{Appearance, DraftPick, PlayerRecord, Ratings, RosterEntry, stat};
use hoopgen::repository::{InvalidateScope, Repository};
use hoopgen::sources::{
    EspnAthlete, ImageSource, NbaStatRow, NoImages, ProviderPayload, SourceClient,
};
use hoopgen::store::{InsertOutcome, PlayerStore, SqliteStore, StoreResult};
use hoopgen::tables::StaticTables;

const SEASON: &str = "2003-04";

#[derive(Default)]
struct Calls {
    roster: Cell<usize>,
    stats: Cell<usize>,
    draft: Cell<usize>,
    images: Cell<usize>,
}

struct MockSource {
    league: League,
    roster: RefCell<Vec<RosterEntry>>,
    roster_fails: Cell<bool>,
    failing: RefCell<HashSet<String>>,
    calls: Rc<Calls>,
}

impl MockSource {
    fn new(league: League, ids: &[&str], calls: Rc<Calls>) -> Self {
        Self {
            league,
            roster: RefCell::new(ids.iter().map(|id| entry(id, "T1")).collect()),
            roster_fails: Cell::new(false),
            failing: RefCell::new(HashSet::new()),
            calls,
        }
    }
}

fn entry(id: &str, team: &str) -> RosterEntry {
    RosterEntry {
        source_id: id.to_string(),
        name: format!("Player {id}"),
        team_id: team.to_string(),
    }
}

impl SourceClient for MockSource {
    fn league(&self) -> League {
        self.league
    }

    fn list_roster(&self, _season: &str) -> Result<Vec<RosterEntry>, SourceError> {
        self.calls.roster.set(self.calls.roster.get() + 1);
        if self.roster_fails.get() {
            return Err(SourceError::Status {
                status: 503,
                url: "mock://roster".to_string(),
            });
        }
        Ok(self.roster.borrow().clone())
    }

    fn fetch_stats(
        &self,
        _season: &str,
        entry: &RosterEntry,
    ) -> Result<ProviderPayload, SourceError> {
        self.calls.stats.set(self.calls.stats.get() + 1);
        if self.failing.borrow().contains(&entry.source_id) {
            return Err(SourceError::Network("connection reset".to_string()));
        }
        let pts = entry.source_id.len() as f64 * 5.0;
        Ok(match self.league {
            League::Professional => {
                let fields = json!({
                    "PLAYER_ID": entry.source_id,
                    "PTS": pts,
                    "REB": 7.5,
                    "AST": 4.0,
                    "FG3A": 3.0,
                    "FG3_PCT": 0.37,
                });
                ProviderPayload::Professional(NbaStatRow {
                    fields: fields.as_object().cloned().unwrap_or_default(),
                    per_game: true,
                    bio: Default::default(),
                })
            }
            League::Collegiate => ProviderPayload::Collegiate(EspnAthlete {
                athlete: json!({ "id": entry.source_id }),
                stats: BTreeMap::from([(stat::PTS.to_string(), pts)]),
            }),
        })
    }

    fn fetch_draft_history(&self, season: &str) -> Result<Vec<DraftPick>, SourceError> {
        self.calls.draft.set(self.calls.draft.get() + 1);
        Ok(vec![DraftPick {
            season: season.to_string(),
            person_id: "2544".to_string(),
            name: "LeBron James".to_string(),
            round: Some(1),
            round_pick: Some(1),
            overall_pick: Some(1),
            team_id: Some("1610612739".to_string()),
            organization: None,
        }])
    }

    fn headshot_url(&self, source_id: &str) -> Option<String> {
        Some(format!("mock://headshot/{source_id}"))
    }
}

/// Serves the same synthetic PNG headshot for every URL.
struct MockImages {
    bytes: Vec<u8>,
    calls: Rc<Calls>,
}

impl ImageSource for MockImages {
    fn fetch_image(&self, _url: &str) -> Option<Vec<u8>> {
        self.calls.images.set(self.calls.images.get() + 1);
        Some(self.bytes.clone())
    }
}

fn headshot_png() -> Vec<u8> {
    let img = RgbaImage::from_fn(100, 100, |x, y| {
        let centre = (25..75).contains(&x);
        if centre && y < 20 {
            Rgba([30, 25, 20, 255])
        } else if centre && (20..70).contains(&y) {
            Rgba([200, 150, 120, 255])
        } else {
            Rgba([255, 255, 255, 255])
        }
    });
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("png encode");
    bytes
}

struct FailingStore;

fn disk_gone<T>() -> StoreResult<T> {
    Err(StoreError::Corrupt("disk gone".to_string()))
}

impl PlayerStore for FailingStore {
    fn get(&self, _id: &Identity) -> StoreResult<Option<PlayerRecord>> {
        disk_gone()
    }
    fn insert_if_absent(&self, _record: &PlayerRecord) -> StoreResult<InsertOutcome> {
        disk_gone()
    }
    fn update_ratings(&self, _id: &Identity, _ratings: &Ratings) -> StoreResult<()> {
        disk_gone()
    }
    fn update_appearance(&self, _id: &Identity, _appearance: &Appearance) -> StoreResult<()> {
        disk_gone()
    }
    fn clear_derived(&self, _l: League, _s: &str, _id: Option<&str>) -> StoreResult<usize> {
        disk_gone()
    }
    fn delete(&self, _l: League, _s: &str, _id: Option<&str>) -> StoreResult<usize> {
        disk_gone()
    }
    fn list_cohort(&self, _l: League, _s: &str) -> StoreResult<Vec<PlayerRecord>> {
        disk_gone()
    }
    fn try_claim(&self, _id: &Identity, _owner: &str, _ttl: Duration) -> StoreResult<bool> {
        disk_gone()
    }
    fn release_claim(&self, _id: &Identity, _owner: &str) -> StoreResult<()> {
        disk_gone()
    }
    fn save_draft(&self, _season: &str, _picks: &[DraftPick]) -> StoreResult<usize> {
        disk_gone()
    }
    fn load_draft(&self, _season: &str) -> StoreResult<Vec<DraftPick>> {
        disk_gone()
    }
}

struct Harness {
    repo: Repository,
    pro: Rc<MockSource>,
    calls: Rc<Calls>,
}

/// Lets a test keep a handle on the mock after boxing it into the repository.
struct Shared(Rc<MockSource>);

impl SourceClient for Shared {
    fn league(&self) -> League {
        self.0.league()
    }
    fn list_roster(&self, season: &str) -> Result<Vec<RosterEntry>, SourceError> {
        self.0.list_roster(season)
    }
    fn fetch_stats(&self, season: &str, e: &RosterEntry) -> Result<ProviderPayload, SourceError> {
        self.0.fetch_stats(season, e)
    }
    fn fetch_draft_history(&self, season: &str) -> Result<Vec<DraftPick>, SourceError> {
        self.0.fetch_draft_history(season)
    }
    fn headshot_url(&self, source_id: &str) -> Option<String> {
        self.0.headshot_url(source_id)
    }
}

fn harness_with(store: Box<dyn PlayerStore>, ids: &[&str], images: bool) -> Harness {
    let calls = Rc::new(Calls::default());
    let pro = Rc::new(MockSource::new(League::Professional, ids, calls.clone()));
    let college = MockSource::new(League::Collegiate, ids, calls.clone());
    let image_source: Box<dyn ImageSource> = if images {
        Box::new(MockImages {
            bytes: headshot_png(),
            calls: calls.clone(),
        })
    } else {
        Box::new(NoImages)
    };
    let repo = Repository::new(
        store,
        Box::new(Shared(pro.clone())),
        Box::new(college),
        image_source,
    )
    .expect("repository")
    .with_tables(Arc::new(StaticTables::builtin()));
    Harness { repo, pro, calls }
}

fn harness(ids: &[&str]) -> Harness {
    let store = SqliteStore::open_in_memory().expect("in-memory store");
    harness_with(Box::new(store), ids, false)
}

fn ids(records: &[PlayerRecord]) -> Vec<&str> {
    records
        .iter()
        .map(|r| r.identity.source_id.as_str())
        .collect()
}

#[test]
fn second_request_is_served_from_store_without_refetch() {
    let h = harness(&["2544", "1905", "708"]);

    let first = h.repo.get_cohort(League::Professional, SEASON).expect("cohort");
    assert_eq!(first.fetched, 3);
    assert_eq!(first.cached, 0);
    assert_eq!(h.calls.stats.get(), 3);

    let second = h.repo.get_cohort(League::Professional, SEASON).expect("cohort");
    assert_eq!(second.fetched, 0);
    assert_eq!(second.cached, 3);
    assert_eq!(h.calls.stats.get(), 3);
    assert_eq!(h.calls.roster.get(), 2);
    assert_eq!(ids(&first.records), ids(&second.records));
    for (a, b) in first.records.iter().zip(&second.records) {
        assert_eq!(a.derived_ratings, b.derived_ratings);
        assert_eq!(a.appearance, b.appearance);
        assert_eq!(a.fetched_at, b.fetched_at);
    }
}

#[test]
fn records_follow_roster_order_and_stay_stable() {
    let h = harness(&["30", "2544", "1905", "4"]);
    let first = h.repo.get_cohort(League::Professional, SEASON).expect("cohort");
    let second = h.repo.get_cohort(League::Professional, SEASON).expect("cohort");
    assert_eq!(ids(&first.records), ["30", "2544", "1905", "4"]);
    assert_eq!(ids(&first.records), ids(&second.records));
}

#[test]
fn every_record_is_complete_and_in_range() {
    let h = harness(&["2544", "1905"]);
    let cohort = h.repo.get_cohort(League::Professional, SEASON).expect("cohort");
    for record in &cohort.records {
        assert!(record.is_complete());
        let ratings = record.derived_ratings.as_ref().expect("ratings");
        assert_eq!(ratings.values.len(), 7);
        assert!(ratings.values.values().all(|v| (1..=10).contains(v)));
        let look = record.appearance.as_ref().expect("appearance");
        assert_eq!((look.skin_tone_code, look.hair_color_code), (5, 0));
    }
}

#[test]
fn traded_player_keeps_first_position_and_last_team() {
    let h = harness(&[]);
    *h.pro.roster.borrow_mut() = vec![
        entry("708", "POR"),
        entry("2544", "CLE"),
        entry("708", "ATL"),
    ];
    let cohort = h.repo.get_cohort(League::Professional, SEASON).expect("cohort");
    assert_eq!(ids(&cohort.records), ["708", "2544"]);
    assert_eq!(cohort.records[0].team_id, "ATL");
    assert_eq!(h.calls.stats.get(), 2);
}

#[test]
fn failed_player_is_omitted_and_retried_next_time() {
    let h = harness(&["1", "2", "3"]);
    h.pro.failing.borrow_mut().insert("2".to_string());

    let cohort = h.repo.get_cohort(League::Professional, SEASON).expect("cohort");
    assert_eq!(ids(&cohort.records), ["1", "3"]);
    assert_eq!(cohort.omitted.len(), 1);
    assert_eq!(cohort.omitted[0].source_id, "2");
    assert!(cohort.omitted[0].reason.contains("connection reset"));

    h.pro.failing.borrow_mut().clear();
    let again = h.repo.get_cohort(League::Professional, SEASON).expect("cohort");
    assert_eq!(ids(&again.records), ["1", "2", "3"]);
    assert_eq!(again.fetched, 1);
    assert_eq!(h.calls.stats.get(), 4);
}

#[test]
fn roster_failure_is_fatal() {
    let h = harness(&["1"]);
    h.pro.roster_fails.set(true);
    let err = h
        .repo
        .get_cohort(League::Professional, SEASON)
        .expect_err("roster failure");
    assert!(matches!(err, RepositoryError::Roster { .. }), "{err}");
    assert_eq!(h.calls.stats.get(), 0);
}

#[test]
fn invalid_season_is_rejected_before_any_request() {
    let h = harness(&["1"]);
    for (league, season) in [
        (League::Professional, "2003"),
        (League::Professional, "1990-91"),
        (League::Collegiate, "2003-04"),
    ] {
        let err = h.repo.get_cohort(league, season).expect_err("invalid season");
        assert!(matches!(err, RepositoryError::InvalidSeason { .. }), "{err}");
    }
    assert_eq!(h.calls.roster.get(), 0);
}

#[test]
fn store_failure_is_fatal() {
    let h = harness_with(Box::new(FailingStore), &["1", "2"], false);
    let err = h
        .repo
        .get_cohort(League::Professional, SEASON)
        .expect_err("store failure");
    assert!(matches!(err, RepositoryError::Store(_)), "{err}");
}

#[test]
fn collegiate_cohort_uses_collegiate_source() {
    let h = harness(&["4066", "4067"]);
    let cohort = h.repo.get_cohort(League::Collegiate, "2004").expect("cohort");
    assert_eq!(cohort.league, League::Collegiate);
    assert_eq!(cohort.records.len(), 2);
    assert_eq!(cohort.records[0].raw_stats.provider, "espn");
    assert_eq!(cohort.records[0].identity.season, "2004");
}

#[test]
fn derived_invalidate_recomputes_without_refetch() {
    let h = harness(&["1", "2"]);
    h.repo.get_cohort(League::Professional, SEASON).expect("cohort");

    let n = h
        .repo
        .invalidate(League::Professional, SEASON, Some("1"), InvalidateScope::Derived)
        .expect("invalidate");
    assert_eq!(n, 1);

    let cohort = h.repo.get_cohort(League::Professional, SEASON).expect("cohort");
    assert_eq!(h.calls.stats.get(), 2);
    assert!(cohort.records.iter().all(PlayerRecord::is_complete));
}

#[test]
fn full_invalidate_refetches() {
    let h = harness(&["1", "2"]);
    h.repo.get_cohort(League::Professional, SEASON).expect("cohort");
    let n = h
        .repo
        .invalidate(League::Professional, SEASON, None, InvalidateScope::Full)
        .expect("invalidate");
    assert_eq!(n, 2);

    let cohort = h.repo.get_cohort(League::Professional, SEASON).expect("cohort");
    assert_eq!(cohort.fetched, 2);
    assert_eq!(h.calls.stats.get(), 4);
}

#[test]
fn headshots_are_classified_once_per_player() {
    let store = SqliteStore::open_in_memory().expect("store");
    let h = harness_with(Box::new(store), &["1", "2"], true);

    let cohort = h.repo.get_cohort(League::Professional, SEASON).expect("cohort");
    assert_eq!(h.calls.images.get(), 2);
    let look = cohort.records[0].appearance.as_ref().expect("appearance");
    assert_eq!((look.skin_tone_code, look.hair_color_code), (4, 1));

    h.repo.get_cohort(League::Professional, SEASON).expect("cohort");
    assert_eq!(h.calls.images.get(), 2);
}

#[test]
fn shared_store_never_holds_duplicates() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("players.sqlite");
    let a = harness_with(Box::new(SqliteStore::open(&path).expect("store a")), &["1", "2"], false);
    let b = harness_with(
        Box::new(SqliteStore::open(&path).expect("store b")),
        &["1", "2", "3"],
        false,
    );

    a.repo.get_cohort(League::Professional, SEASON).expect("cohort a");
    let cohort = b.repo.get_cohort(League::Professional, SEASON).expect("cohort b");
    assert_eq!(cohort.cached, 2);
    assert_eq!(cohort.fetched, 1);
    assert_eq!(b.calls.stats.get(), 1);

    let check = SqliteStore::open(&path).expect("store check");
    assert_eq!(check.count(League::Professional, SEASON).ok(), Some(3));
}

#[test]
fn identity_claimed_elsewhere_is_omitted_for_this_run() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("players.sqlite");
    let other = SqliteStore::open(&path).expect("other worker");
    let id = Identity::new(League::Professional, SEASON, "2");
    let owner = format!("{}-0-worker", std::process::id());
    assert!(
        other
            .try_claim(&id, &owner, Duration::from_secs(600))
            .expect("claim")
    );

    let h = harness_with(Box::new(SqliteStore::open(&path).expect("store")), &["1", "2"], false);
    let cohort = h.repo.get_cohort(League::Professional, SEASON).expect("cohort");
    assert_eq!(ids(&cohort.records), ["1"]);
    assert_eq!(cohort.omitted.len(), 1);
    assert_eq!(h.calls.stats.get(), 1);

    other.release_claim(&id, &owner).expect("release");
    let cohort = h.repo.get_cohort(League::Professional, SEASON).expect("cohort");
    assert_eq!(ids(&cohort.records), ["1", "2"]);
}

#[cfg(unix)]
#[test]
fn interrupted_run_does_not_hide_player_from_next_run() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("players.sqlite");
    let id = Identity::new(League::Professional, SEASON, "2");
    {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "exit 0"])
            .spawn()
            .expect("spawn sh");
        let dead = format!("{}-1700000000000000-0", child.id());
        child.wait().expect("wait");
        let killed = SqliteStore::open(&path).expect("interrupted run");
        assert!(
            killed
                .try_claim(&id, &dead, Duration::from_secs(600))
                .expect("claim")
        );
    }

    let h = harness_with(Box::new(SqliteStore::open(&path).expect("store")), &["1", "2"], false);
    let cohort = h.repo.get_cohort(League::Professional, SEASON).expect("cohort");
    assert_eq!(ids(&cohort.records), ["1", "2"]);
    assert!(cohort.omitted.is_empty());
    assert_eq!(h.calls.stats.get(), 2);
}

#[test]
fn source_client_in_wrong_league_slot_is_rejected() {
    let calls = Rc::new(Calls::default());
    let result = Repository::new(
        Box::new(SqliteStore::open_in_memory().expect("store")),
        Box::new(MockSource::new(League::Collegiate, &[], calls.clone())),
        Box::new(MockSource::new(League::Collegiate, &[], calls)),
        Box::new(NoImages),
    );
    assert!(matches!(
        result,
        Err(RepositoryError::SourceMismatch {
            expected: League::Professional,
            actual: League::Collegiate,
        })
    ));
}

#[test]
fn draft_class_is_fetched_once() {
    let h = harness(&[]);
    let first = h.repo.draft_class("2003").expect("draft");
    let second = h.repo.draft_class("2003").expect("draft");
    assert_eq!(first, second);
    assert_eq!(first[0].name, "LeBron James");
    assert_eq!(h.calls.draft.get(), 1);
    assert!(matches!(
        h.repo.draft_class("03"),
        Err(RepositoryError::InvalidSeason { .. })
    ));
}

#[test]
fn stale_records_reports_version_mismatch() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("players.sqlite");
    let h = harness_with(Box::new(SqliteStore::open(&path).expect("store")), &["1", "2"], false);
    h.repo.get_cohort(League::Professional, SEASON).expect("cohort");
    assert!(
        h.repo
            .stale_records(League::Professional, SEASON)
            .expect("stale")
            .is_empty()
    );

    let mut next = StaticTables::builtin();
    next.bounds.version = "next".to_string();
    let later = harness_with(Box::new(SqliteStore::open(&path).expect("store")), &[], false);
    let repo = later.repo.with_tables(Arc::new(next));
    let stale = repo
        .stale_records(League::Professional, SEASON)
        .expect("stale");
    assert_eq!(stale.len(), 2);
}
