//! Synchronization engine for the chamber's open-data exports.
//!
//! A run fetches the configured ZIP archives, parses their flat-file
//! members, maps rows to typed entities, and upserts them in dependency
//! order so that foreign-key targets always land before their referrers.
//! Reference data the source never publishes (electoral periods, parties,
//! constituencies) is seeded from built-in tables at the start of every run.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Datelike, NaiveDate, Utc};
use psp_core::{
    Bill, Committee, Constituency, ElectoralPeriod, EntityKey, EntityKind, EntityRecord,
    MemberTerm, Party, Person, RunStatus, SyncCounts, SyncMode, SyncRunRecord, VoteRecord,
    VoteResult, VotingSession,
};
use psp_format::{
    extract_members, parse_table, schemas, MemberSelection, MemberSpec, MismatchPolicy, ParsedRow,
};
use psp_store::{diff_rows, ArchiveSource, ChangeCache, EntityStore, RunLedger, Snapshot};
use serde::Deserialize;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "psp-sync";

// ---------------------------------------------------------------------------
// Configuration

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: String,
    /// When set, archives are read from this directory instead of HTTP.
    pub archives_dir: Option<PathBuf>,
    pub cache_dir: PathBuf,
    pub fetch_concurrency: usize,
    pub run_timeout: Duration,
    pub user_agent: String,
    /// Electoral period the MP roster belongs to; the roster file itself
    /// does not carry one.
    pub current_period: i64,
    /// Period identifiers whose voting archives are fetched, e.g. `2021ps`.
    pub voting_periods: Vec<String>,
    /// Reject rows whose field count disagrees with the schema instead of
    /// accepting them degraded.
    pub strict_rows: bool,
    /// Optional YAML registry that can disable individual archives.
    pub registry_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.psp.cz/eknih/cdrom/opendata".to_string(),
            archives_dir: None,
            cache_dir: PathBuf::from("./cache"),
            fetch_concurrency: 4,
            run_timeout: Duration::from_secs(600),
            user_agent: "psp-sync/0.1".to_string(),
            current_period: 9,
            voting_periods: vec!["2021ps".to_string()],
            strict_rows: false,
            registry_path: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("PSP_BASE_URL").unwrap_or(defaults.base_url),
            archives_dir: std::env::var("PSP_ARCHIVES_DIR").ok().map(PathBuf::from),
            cache_dir: std::env::var("PSP_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            fetch_concurrency: std::env::var("PSP_FETCH_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.fetch_concurrency),
            run_timeout: std::env::var("PSP_RUN_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.run_timeout),
            user_agent: std::env::var("PSP_USER_AGENT").unwrap_or(defaults.user_agent),
            current_period: std::env::var("PSP_CURRENT_PERIOD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.current_period),
            voting_periods: std::env::var("PSP_VOTING_PERIODS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(defaults.voting_periods),
            strict_rows: std::env::var("PSP_STRICT_ROWS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            registry_path: std::env::var("PSP_SOURCES_FILE").ok().map(PathBuf::from),
        }
    }

    pub fn mismatch_policy(&self) -> MismatchPolicy {
        if self.strict_rows {
            MismatchPolicy::Reject
        } else {
            MismatchPolicy::AcceptDegraded
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub archive: String,
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub async fn load(path: &PathBuf) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn allows(&self, archive: &str) -> bool {
        self.sources
            .iter()
            .find(|s| s.archive == archive)
            .map(|s| s.enabled)
            .unwrap_or(true)
    }
}

// ---------------------------------------------------------------------------
// Archive plan

/// One flat-file member inside an archive, and the entity kind its rows
/// become.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub member: String,
    pub kind: EntityKind,
    /// Cache key for this member's snapshot; voting members carry the
    /// period so each period diffs against its own history.
    pub source_key: String,
}

#[derive(Debug, Clone)]
pub struct ArchiveSpec {
    pub archive: String,
    pub tables: Vec<TableSpec>,
}

fn table_spec(prefix: &str, kind: EntityKind) -> Option<TableSpec> {
    let table = kind.table()?;
    Some(TableSpec {
        member: format!("{table}.unl"),
        kind,
        source_key: format!("{prefix}/{table}"),
    })
}

/// Archives a run would fetch for this configuration, before any registry
/// filtering.
pub fn archive_plan(config: &SyncConfig) -> Vec<ArchiveSpec> {
    let mut plan = Vec::new();

    let fixed: [(&str, &[EntityKind]); 3] = [
        ("poslanci", &[EntityKind::Person, EntityKind::MemberTerm]),
        ("organy", &[EntityKind::Committee]),
        ("tisky", &[EntityKind::Bill]),
    ];
    for (name, kinds) in fixed {
        plan.push(ArchiveSpec {
            archive: format!("{name}.zip"),
            tables: kinds.iter().filter_map(|k| table_spec(name, *k)).collect(),
        });
    }

    for period in &config.voting_periods {
        let prefix = format!("hl-{period}");
        plan.push(ArchiveSpec {
            archive: format!("{prefix}.zip"),
            tables: [EntityKind::VotingSession, EntityKind::VoteRecord]
                .iter()
                .filter_map(|k| table_spec(&prefix, *k))
                .collect(),
        });
    }

    plan
}

// ---------------------------------------------------------------------------
// Reference data seeds

fn seed_date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("hardcoded seed date is valid")
}

/// Electoral periods of the chamber since 1993. The source publishes no
/// machine-readable table for these.
pub fn electoral_period_seeds() -> Vec<ElectoralPeriod> {
    let rows: [(i64, (i32, u32, u32), Option<(i32, u32, u32)>); 9] = [
        (1, (1993, 12, 1), Some((1996, 5, 30))),
        (2, (1996, 5, 31), Some((1998, 6, 18))),
        (3, (1998, 6, 19), Some((2002, 6, 13))),
        (4, (2002, 6, 14), Some((2006, 6, 1))),
        (5, (2006, 6, 2), Some((2010, 5, 28))),
        (6, (2010, 5, 29), Some((2013, 10, 24))),
        (7, (2013, 10, 25), Some((2017, 10, 19))),
        (8, (2017, 10, 20), Some((2021, 10, 7))),
        (9, (2021, 10, 8), None),
    ];
    rows.into_iter()
        .map(|(number, start, end)| {
            let until = end.map(|(y, m, d)| seed_date(y, m, d));
            let span = match until {
                Some(u) => format!("{}-{}", start.0, u.year()),
                None => format!("{}-", start.0),
            };
            ElectoralPeriod {
                number,
                start_date: seed_date(start.0, start.1, start.2),
                end_date: until,
                description: format!("{number}. volební období ({span})"),
                active: until.is_none(),
            }
        })
        .collect()
}

pub fn party_seeds() -> Vec<Party> {
    let rows = [
        ("Občanská demokratická strana", "ODS", "#0066CC"),
        ("ANO 2011", "ANO", "#EC407A"),
        ("Piráti", "Piráti", "#000000"),
        ("Svoboda a přímá demokracie", "SPD", "#DC2626"),
        ("Starostové a nezávislí", "STAN", "#FFA500"),
        ("Komunistická strana Čech a Moravy", "KSČM", "#B91C1C"),
        ("Česká strana sociálně demokratická", "ČSSD", "#F97316"),
        ("TOP 09", "TOP 09", "#8B5CF6"),
        (
            "Křesťanská a demokratická unie - Československá strana lidová",
            "KDU-ČSL",
            "#10B981",
        ),
        ("Trikolóra hnutí občanů", "Trikolóra", "#FF6B6B"),
        ("Přísaha", "Přísaha", "#4ECDC4"),
        ("SPOLU", "SPOLU", "#45B7D1"),
    ];
    rows.into_iter()
        .map(|(name, short_name, color)| Party {
            name: name.to_string(),
            short_name: short_name.to_string(),
            color_hex: Some(color.to_string()),
            active: true,
        })
        .collect()
}

pub fn constituency_seeds() -> Vec<Constituency> {
    let rows = [
        ("Praha", "PHA", "Praha"),
        ("Jihočeský kraj", "JCK", "České Budějovice"),
        ("Jihomoravský kraj", "JMK", "Brno"),
        ("Karlovarský kraj", "KVK", "Karlovy Vary"),
        ("Královéhradecký kraj", "KHK", "Hradec Králové"),
        ("Liberecký kraj", "LBK", "Liberec"),
        ("Moravskoslezský kraj", "MSK", "Ostrava"),
        ("Olomoucký kraj", "OLK", "Olomouc"),
        ("Pardubický kraj", "PAK", "Pardubice"),
        ("Plzeňský kraj", "PLK", "Plzeň"),
        ("Středočeský kraj", "STK", "Praha"),
        ("Ústecký kraj", "ULK", "Ústí nad Labem"),
        ("Vysočina", "VYS", "Jihlava"),
        ("Zlínský kraj", "ZLK", "Zlín"),
    ];
    rows.into_iter()
        .map(|(name, code, region)| Constituency {
            name: name.to_string(),
            code: code.to_string(),
            region: region.to_string(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Row mapping

fn text(row: &ParsedRow, name: &str) -> Option<String> {
    row.get(name).as_text().map(str::to_string)
}

fn require_integer(row: &ParsedRow, name: &str) -> Result<i64> {
    row.get(name)
        .as_integer()
        .with_context(|| format!("`{name}` missing"))
}

fn map_person(row: &ParsedRow) -> Result<EntityRecord> {
    Ok(EntityRecord::Person(Person {
        id: require_integer(row, "id_osoba")?,
        title_before: text(row, "pred"),
        first_name: text(row, "jmeno"),
        last_name: text(row, "prijmeni"),
        title_after: text(row, "za"),
        birth_date: row.get("narozeni").as_date(),
        death_date: row.get("umrti").as_date(),
        gender: text(row, "pohlavi"),
        changed_on: row.get("zmena").as_date(),
    }))
}

fn map_member_term(row: &ParsedRow, current_period: i64) -> Result<EntityRecord> {
    Ok(EntityRecord::MemberTerm(MemberTerm {
        id: require_integer(row, "id_poslanec")?,
        person_id: require_integer(row, "id_osoba")?,
        constituency_id: row.get("id_kraj").as_integer(),
        party_id: row.get("id_kandidatka").as_integer(),
        period_number: current_period,
        period_organ_id: row.get("id_organ").as_integer(),
        website: text(row, "web"),
        street: text(row, "ulice"),
        city: text(row, "obec"),
        postal_code: text(row, "psc"),
        email: text(row, "email"),
        phone: text(row, "telefon"),
        fax: text(row, "fax"),
        office_phone: text(row, "psp_telefon"),
        facebook: text(row, "facebook"),
        photo_url: text(row, "foto"),
        active: true,
    }))
}

fn map_committee(row: &ParsedRow) -> Result<EntityRecord> {
    Ok(EntityRecord::Committee(Committee {
        id: require_integer(row, "id_organ")?,
        parent_id: row.get("organ_id_organ").as_integer(),
        type_id: row.get("id_typ_organu").as_integer(),
        abbreviation: text(row, "zkratka"),
        name_cs: text(row, "nazev_organu_cz"),
        name_en: text(row, "nazev_organu_en"),
        since: row.get("od_organ").as_date(),
        until: row.get("do_organ").as_date(),
        priority: row.get("priorita").as_integer(),
    }))
}

fn map_bill(row: &ParsedRow) -> Result<EntityRecord> {
    Ok(EntityRecord::Bill(Bill {
        id: require_integer(row, "id_tisk")?,
        organ_id: row.get("id_organ").as_integer(),
        bill_number: text(row, "tisk"),
        title: text(row, "nazev"),
        description: text(row, "popis"),
        own_number: text(row, "cislo_vlastni"),
        bill_type: row.get("typ").as_integer(),
        status: row.get("stav").as_integer(),
        submitted: row.get("datum").as_date(),
        collection_number: text(row, "cislo_sbirky"),
        collection_year: row.get("rok_sbirky").as_integer(),
        url: text(row, "url"),
    }))
}

fn map_voting_session(row: &ParsedRow) -> Result<EntityRecord> {
    Ok(EntityRecord::VotingSession(VotingSession {
        id: require_integer(row, "id_hlasovani")?,
        committee_id: require_integer(row, "id_organ")?,
        session_number: require_integer(row, "schuze")?,
        vote_number: require_integer(row, "cislo")?,
        agenda_item: row.get("bod").as_integer(),
        date: row.get("datum").as_date(),
        time: row.get("cas").as_time(),
        votes_for: row.get("pro").as_integer().unwrap_or(0),
        votes_against: row.get("proti").as_integer().unwrap_or(0),
        abstentions: row.get("zdrzel").as_integer().unwrap_or(0),
        did_not_vote: row.get("nehlasoval").as_integer().unwrap_or(0),
        present: row.get("prihlaseno").as_integer().unwrap_or(0),
        quorum: row.get("kvorum").as_integer(),
        vote_kind: text(row, "druh_hlasovani"),
        result: text(row, "vysledek"),
        title_long: text(row, "nazev_dlouhy"),
        title_short: text(row, "nazev_kratky"),
        bill_id: None,
    }))
}

fn map_vote(row: &ParsedRow) -> Result<EntityRecord> {
    let code = row
        .get("vysledek")
        .as_text()
        .context("`vysledek` missing")?;
    let result = VoteResult::from_code(code)
        .ok_or_else(|| anyhow!("unknown vote code `{code}`"))?;
    Ok(EntityRecord::VoteRecord(VoteRecord {
        session_id: require_integer(row, "id_hlasovani")?,
        term_id: require_integer(row, "id_poslanec")?,
        result,
    }))
}

fn map_row(kind: EntityKind, row: &ParsedRow, config: &SyncConfig) -> Result<EntityRecord> {
    match kind {
        EntityKind::Person => map_person(row),
        EntityKind::MemberTerm => map_member_term(row, config.current_period),
        EntityKind::Committee => map_committee(row),
        EntityKind::Bill => map_bill(row),
        EntityKind::VotingSession => map_voting_session(row),
        EntityKind::VoteRecord => map_vote(row),
        other => bail!("{other} is seeded, not parsed"),
    }
}

/// Order a committee batch so every in-batch parent precedes its children.
/// Rows caught in a parent cycle keep their input order at the tail; their
/// reference checks fail against the store.
fn order_committees(mapped: Vec<EntityRecord>) -> Vec<EntityRecord> {
    let batch_ids: HashSet<i64> = mapped
        .iter()
        .filter_map(|r| match r {
            EntityRecord::Committee(c) => Some(c.id),
            _ => None,
        })
        .collect();

    let mut ordered = Vec::with_capacity(mapped.len());
    let mut emitted: HashSet<i64> = HashSet::new();
    let mut pending = mapped;
    loop {
        let mut rest = Vec::new();
        let mut progressed = false;
        for record in pending {
            let ready = match &record {
                EntityRecord::Committee(c) => match c.parent_id {
                    Some(parent) => !batch_ids.contains(&parent) || emitted.contains(&parent),
                    None => true,
                },
                _ => true,
            };
            if ready {
                if let EntityRecord::Committee(c) = &record {
                    emitted.insert(c.id);
                }
                ordered.push(record);
                progressed = true;
            } else {
                rest.push(record);
            }
        }
        if rest.is_empty() || !progressed {
            ordered.extend(rest);
            return ordered;
        }
        pending = rest;
    }
}

// ---------------------------------------------------------------------------
// Archive inspection

#[derive(Debug)]
pub struct MemberInspection {
    pub member: String,
    pub rows: usize,
    /// Known table behind this member, if a schema is declared for it.
    pub table: Option<&'static str>,
}

#[derive(Debug)]
pub struct ArchiveInspection {
    pub archive: String,
    pub members: Vec<MemberInspection>,
}

/// Decode every member of one archive without touching the store, for
/// troubleshooting new or changed exports.
pub async fn inspect_archive(
    source: &dyn ArchiveSource,
    archive: &str,
) -> Result<ArchiveInspection> {
    let bytes = source.fetch(archive).await?;
    let members = extract_members(&bytes, &MemberSelection::All)?;
    Ok(ArchiveInspection {
        archive: archive.to_string(),
        members: members
            .into_iter()
            .map(|(member, rows)| {
                let table = member
                    .strip_suffix(".unl")
                    .and_then(schemas::by_table)
                    .map(|s| s.table);
                MemberInspection {
                    member,
                    rows: rows.len(),
                    table,
                }
            })
            .collect(),
    })
}

// ---------------------------------------------------------------------------
// Engine

struct TableBatch {
    source_key: String,
    lines: Vec<String>,
}

struct RunOutcome {
    per_kind: BTreeMap<EntityKind, SyncCounts>,
    kind_errors: BTreeMap<EntityKind, String>,
}

pub struct SyncEngine {
    config: SyncConfig,
    source: Arc<dyn ArchiveSource>,
    store: Arc<dyn EntityStore>,
    ledger: Arc<dyn RunLedger>,
    cache: ChangeCache,
    cancel: Arc<AtomicBool>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn ArchiveSource>,
        store: Arc<dyn EntityStore>,
        ledger: Arc<dyn RunLedger>,
    ) -> Self {
        let cache = ChangeCache::new(config.cache_dir.clone());
        Self {
            config,
            source,
            store,
            ledger,
            cache,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle that aborts the run at the next kind boundary when set.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Execute one synchronization run and return its closed ledger record.
    ///
    /// Row- and kind-scoped failures are absorbed into the record; only
    /// ledger unavailability surfaces as `Err`.
    pub async fn run(
        &self,
        mode: SyncMode,
        only: Option<&[EntityKind]>,
    ) -> Result<SyncRunRecord> {
        let scope: Vec<EntityKind> = EntityKind::sync_order()
            .into_iter()
            .filter(|k| only.map_or(true, |wanted| wanted.contains(k)))
            .collect();

        let mut record = SyncRunRecord::open(Uuid::new_v4(), mode, scope.clone(), Utc::now());
        self.ledger.open_run(record.clone()).await?;
        info!(run_id = %record.run_id, mode = mode.as_str(), kinds = scope.len(), "sync run started");

        match tokio::time::timeout(self.config.run_timeout, self.execute(mode, &scope)).await {
            Ok(Ok(outcome)) => {
                let mut totals = SyncCounts::default();
                for counts in outcome.per_kind.values() {
                    totals.merge(*counts);
                }
                record.per_kind = outcome.per_kind;
                record.totals = totals;
                record.status = if outcome.kind_errors.is_empty() && totals.failed == 0 {
                    RunStatus::Completed
                } else if totals.processed == 0 {
                    // Nothing of any requested kind could be processed.
                    RunStatus::Failed
                } else {
                    RunStatus::CompletedWithErrors
                };
                if !outcome.kind_errors.is_empty() {
                    record.error = Some(
                        outcome
                            .kind_errors
                            .iter()
                            .map(|(kind, err)| format!("{kind}: {err}"))
                            .collect::<Vec<_>>()
                            .join("; "),
                    );
                }
            }
            Ok(Err(err)) => {
                record.status = RunStatus::Failed;
                record.error = Some(err.to_string());
            }
            Err(_) => {
                record.status = RunStatus::Failed;
                record.error = Some(format!(
                    "run timed out after {:?}",
                    self.config.run_timeout
                ));
            }
        }

        record.finished_at = Some(Utc::now());
        self.ledger.close_run(record.clone()).await?;
        info!(
            run_id = %record.run_id,
            status = record.status.as_str(),
            processed = record.totals.processed,
            failed = record.totals.failed,
            "sync run finished"
        );
        Ok(record)
    }

    async fn execute(&self, mode: SyncMode, scope: &[EntityKind]) -> Result<RunOutcome> {
        let mut tables = self.fetch_tables(scope).await?;

        let mut per_kind = BTreeMap::new();
        let mut kind_errors = BTreeMap::new();
        let mut failed_kinds: BTreeSet<EntityKind> = BTreeSet::new();

        for kind in EntityKind::sync_order() {
            if !scope.contains(&kind) {
                continue;
            }
            if self.cancel.load(Ordering::Relaxed) {
                bail!("run cancelled");
            }

            if let Some(prereq) = kind
                .prerequisites()
                .iter()
                .find(|p| failed_kinds.contains(p))
            {
                warn!(kind = %kind, prerequisite = %prereq, "skipping kind; prerequisite failed");
                failed_kinds.insert(kind);
                kind_errors.insert(kind, format!("prerequisite {prereq} failed"));

                // Rows already fetched for the skipped kind count as failed
                // rather than vanishing from the record.
                let mut counts = SyncCounts::default();
                for batch in tables.remove(&kind).unwrap_or_default().into_iter().flatten() {
                    let rows = batch.lines.len() as u64;
                    counts.processed += rows;
                    counts.failed += rows;
                }
                per_kind.insert(kind, counts);
                continue;
            }

            let (counts, errors) = if kind.table().is_none() {
                self.apply_seeds(kind).await
            } else {
                let batches = tables.remove(&kind).unwrap_or_default();
                self.apply_batches(mode, kind, batches).await
            };

            if !errors.is_empty() {
                failed_kinds.insert(kind);
                kind_errors.insert(kind, errors.join("; "));
            }
            per_kind.insert(kind, counts);
        }

        Ok(RunOutcome {
            per_kind,
            kind_errors,
        })
    }

    /// Fetch and extract every archive whose tables intersect the scope.
    /// An archive failure poisons each of its tables, not the whole run.
    async fn fetch_tables(
        &self,
        scope: &[EntityKind],
    ) -> Result<BTreeMap<EntityKind, Vec<Result<TableBatch, String>>>> {
        let registry = match &self.config.registry_path {
            Some(path) => Some(SourceRegistry::load(path).await?),
            None => None,
        };

        let mut plan = archive_plan(&self.config);
        plan.retain(|spec| {
            registry
                .as_ref()
                .map(|r| r.allows(&spec.archive))
                .unwrap_or(true)
        });
        for spec in &mut plan {
            spec.tables.retain(|t| scope.contains(&t.kind));
        }
        plan.retain(|spec| !spec.tables.is_empty());

        let mut join = JoinSet::new();
        for spec in plan {
            let source = Arc::clone(&self.source);
            join.spawn(async move {
                let wanted = MemberSelection::Named(
                    spec.tables
                        .iter()
                        .map(|t| MemberSpec::required(t.member.clone()))
                        .collect(),
                );
                let result = match source.fetch(&spec.archive).await {
                    Ok(bytes) => extract_members(&bytes, &wanted).map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                (spec, result)
            });
        }

        let mut tables: BTreeMap<EntityKind, Vec<Result<TableBatch, String>>> = BTreeMap::new();
        while let Some(joined) = join.join_next().await {
            let (spec, result) = joined.map_err(|e| anyhow!("archive task panicked: {e}"))?;
            match result {
                Ok(mut members) => {
                    for table in spec.tables {
                        let lines = members.remove(&table.member).unwrap_or_default();
                        tables.entry(table.kind).or_default().push(Ok(TableBatch {
                            source_key: table.source_key,
                            lines,
                        }));
                    }
                }
                Err(err) => {
                    warn!(archive = %spec.archive, %err, "archive unavailable");
                    for table in spec.tables {
                        tables
                            .entry(table.kind)
                            .or_default()
                            .push(Err(format!("{}: {err}", spec.archive)));
                    }
                }
            }
        }
        Ok(tables)
    }

    async fn apply_seeds(&self, kind: EntityKind) -> (SyncCounts, Vec<String>) {
        let records: Vec<EntityRecord> = match kind {
            EntityKind::ElectoralPeriod => electoral_period_seeds()
                .into_iter()
                .map(EntityRecord::ElectoralPeriod)
                .collect(),
            EntityKind::Party => party_seeds().into_iter().map(EntityRecord::Party).collect(),
            EntityKind::Constituency => constituency_seeds()
                .into_iter()
                .map(EntityRecord::Constituency)
                .collect(),
            _ => Vec::new(),
        };

        let mut counts = SyncCounts::default();
        let mut errors = Vec::new();
        for record in records {
            match self.store.upsert(record).await {
                Ok(outcome) => counts.record(outcome),
                Err(err) => {
                    counts.record_failure();
                    errors.push(err.to_string());
                }
            }
        }
        (counts, errors)
    }

    async fn apply_batches(
        &self,
        mode: SyncMode,
        kind: EntityKind,
        batches: Vec<Result<TableBatch, String>>,
    ) -> (SyncCounts, Vec<String>) {
        let mut counts = SyncCounts::default();
        let mut errors = Vec::new();

        let Some(schema) = kind.table().and_then(schemas::by_table) else {
            errors.push(format!("no schema declared for {kind}"));
            return (counts, errors);
        };

        for batch in batches {
            let batch = match batch {
                Ok(batch) => batch,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };

            let parsed = parse_table(schema, &batch.lines, self.config.mismatch_policy());

            let mut batch_failures = 0u64;
            let mut mapped = Vec::with_capacity(parsed.rows.len());
            for row in &parsed.rows {
                let record = row
                    .as_ref()
                    .map_err(|e| anyhow!("{e}"))
                    .and_then(|row| map_row(kind, row, &self.config));
                match record {
                    Ok(record) => mapped.push(record),
                    Err(err) => {
                        warn!(kind = %kind, source = %batch.source_key, %err, "row rejected");
                        counts.record_failure();
                        batch_failures += 1;
                    }
                }
            }

            // Organs reference their parent within the same file, in either
            // direction. Parents are applied first, so a child only passes
            // its reference check once its parent actually landed.
            if kind == EntityKind::Committee {
                mapped = order_committees(mapped);
            }
            let mut applied_ids: HashSet<i64> = HashSet::new();

            let mut current: BTreeMap<String, serde_json::Value> = BTreeMap::new();
            for record in &mapped {
                if let Ok(value) = serde_json::to_value(record) {
                    current.insert(record.key().to_string(), value);
                }
            }

            let previous = if mode == SyncMode::Incremental {
                self.cache.load(&batch.source_key).await
            } else {
                None
            };
            let diff = diff_rows(previous.as_ref(), &current);
            if !diff.removed.is_empty() {
                warn!(
                    kind = %kind,
                    source = %batch.source_key,
                    removed = diff.removed.len(),
                    "rows disappeared from the source; keeping local copies"
                );
            }
            counts.record_skipped_unchanged(diff.unchanged.len() as u64);
            let unchanged: BTreeSet<&String> = diff.unchanged.iter().collect();

            for record in mapped {
                let key = record.key().to_string();
                if unchanged.contains(&key) {
                    if let EntityRecord::Committee(c) = &record {
                        applied_ids.insert(c.id);
                    }
                    continue;
                }
                if let Err(err) = self.check_references(&record, &applied_ids).await {
                    warn!(kind = %kind, source = %batch.source_key, row = %key, %err, "row rejected");
                    counts.record_failure();
                    batch_failures += 1;
                    current.remove(&key);
                    continue;
                }
                let committee_id = match &record {
                    EntityRecord::Committee(c) => Some(c.id),
                    _ => None,
                };
                match self.store.upsert(record).await {
                    Ok(outcome) => {
                        counts.record(outcome);
                        if let Some(id) = committee_id {
                            applied_ids.insert(id);
                        }
                    }
                    Err(err) => {
                        warn!(kind = %kind, source = %batch.source_key, row = %key, %err, "upsert failed");
                        counts.record_failure();
                        batch_failures += 1;
                        current.remove(&key);
                    }
                }
            }

            // Snapshot only clean batches; rejected rows must show up as
            // pending work on the next incremental run.
            if batch_failures == 0 {
                let snapshot = Snapshot::new(batch.source_key.clone(), Utc::now(), current);
                if let Err(err) = self.cache.store(&snapshot).await {
                    warn!(source = %batch.source_key, %err, "snapshot not persisted");
                }
            }
        }

        (counts, errors)
    }

    /// Referential checks a row must pass before it may be upserted. The
    /// store already holds every kind ordered before this one.
    async fn check_references(
        &self,
        record: &EntityRecord,
        applied: &HashSet<i64>,
    ) -> Result<()> {
        match record {
            EntityRecord::MemberTerm(term) => {
                self.require(EntityKind::Person, EntityKey::Id(term.person_id))
                    .await?;
                self.require(
                    EntityKind::ElectoralPeriod,
                    EntityKey::Id(term.period_number),
                )
                .await?;
            }
            EntityRecord::Committee(committee) => {
                if let Some(parent) = committee.parent_id {
                    if !applied.contains(&parent) {
                        self.require(EntityKind::Committee, EntityKey::Id(parent))
                            .await?;
                    }
                }
            }
            EntityRecord::VotingSession(session) => {
                self.require(EntityKind::Committee, EntityKey::Id(session.committee_id))
                    .await?;
            }
            EntityRecord::VoteRecord(vote) => {
                self.require(EntityKind::VotingSession, EntityKey::Id(vote.session_id))
                    .await?;
                self.require(EntityKind::MemberTerm, EntityKey::Id(vote.term_id))
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn require(&self, kind: EntityKind, key: EntityKey) -> Result<()> {
        match self.store.resolve(kind, &key).await? {
            Some(_) => Ok(()),
            None => bail!("unresolved {kind} reference {key}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psp_format::parse_row;

    fn config() -> SyncConfig {
        SyncConfig::default()
    }

    #[test]
    fn plan_covers_fixed_archives_and_configured_periods() {
        let mut cfg = config();
        cfg.voting_periods = vec!["2021ps".to_string(), "2017ps".to_string()];
        let plan = archive_plan(&cfg);

        let archives: Vec<&str> = plan.iter().map(|s| s.archive.as_str()).collect();
        assert_eq!(
            archives,
            vec![
                "poslanci.zip",
                "organy.zip",
                "tisky.zip",
                "hl-2021ps.zip",
                "hl-2017ps.zip"
            ]
        );

        let roster = &plan[0];
        assert_eq!(roster.tables.len(), 2);
        assert_eq!(roster.tables[0].member, "osoby.unl");
        assert_eq!(roster.tables[0].source_key, "poslanci/osoby");

        let voting = &plan[3];
        assert_eq!(voting.tables[1].member, "hl_poslanec.unl");
        assert_eq!(voting.tables[1].source_key, "hl-2021ps/hl_poslanec");
    }

    #[test]
    fn registry_disables_listed_archives_only() {
        let registry: SourceRegistry = serde_yaml::from_str(
            "sources:\n  - archive: tisky.zip\n    enabled: false\n  - archive: organy.zip\n    enabled: true\n",
        )
        .expect("parse registry");

        assert!(!registry.allows("tisky.zip"));
        assert!(registry.allows("organy.zip"));
        assert!(registry.allows("poslanci.zip"));
    }

    #[test]
    fn period_seeds_have_one_active_period() {
        let periods = electoral_period_seeds();
        assert_eq!(periods.len(), 9);
        let active: Vec<_> = periods.iter().filter(|p| p.active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].number, 9);
        assert!(active[0].end_date.is_none());
        assert!(periods.iter().all(|p| p.active || p.end_date.is_some()));
    }

    #[test]
    fn reference_seed_keys_are_unique() {
        let parties = party_seeds();
        let mut short_names: Vec<_> = parties.iter().map(|p| p.short_name.as_str()).collect();
        short_names.sort_unstable();
        short_names.dedup();
        assert_eq!(short_names.len(), parties.len());

        let constituencies = constituency_seeds();
        let mut codes: Vec<_> = constituencies.iter().map(|c| c.code.as_str()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), 14);
    }

    fn committee(id: i64, parent_id: Option<i64>) -> EntityRecord {
        EntityRecord::Committee(Committee {
            id,
            parent_id,
            type_id: None,
            abbreviation: None,
            name_cs: None,
            name_en: None,
            since: None,
            until: None,
            priority: None,
        })
    }

    #[test]
    fn committee_ordering_puts_in_batch_parents_first() {
        let ordered = order_committees(vec![
            committee(300, Some(200)),
            committee(200, Some(165)),
            committee(400, Some(300)),
        ]);
        let ids: Vec<i64> = ordered
            .iter()
            .map(|r| match r {
                EntityRecord::Committee(c) => c.id,
                other => panic!("unexpected record: {other:?}"),
            })
            .collect();
        // 200 leans on an out-of-batch parent and goes first; its
        // descendants follow in dependency order.
        assert_eq!(ids, vec![200, 300, 400]);
    }

    #[test]
    fn committee_ordering_keeps_cyclic_rows_at_the_tail() {
        let ordered = order_committees(vec![
            committee(500, Some(501)),
            committee(501, Some(500)),
            committee(165, None),
        ]);
        let ids: Vec<i64> = ordered
            .iter()
            .map(|r| match r {
                EntityRecord::Committee(c) => c.id,
                other => panic!("unexpected record: {other:?}"),
            })
            .collect();
        assert_eq!(ids, vec![165, 500, 501]);
    }

    #[test]
    fn vote_mapping_accepts_only_published_codes() {
        let row = parse_row(
            &schemas::HL_POSLANEC,
            "77001|1401|A",
            MismatchPolicy::AcceptDegraded,
        )
        .expect("parse");
        let record = map_vote(&row).expect("map");
        assert_eq!(
            record,
            EntityRecord::VoteRecord(VoteRecord {
                session_id: 77001,
                term_id: 1401,
                result: VoteResult::Yes,
            })
        );

        let row = parse_row(
            &schemas::HL_POSLANEC,
            "77001|1401|Q",
            MismatchPolicy::AcceptDegraded,
        )
        .expect("parse");
        let err = map_vote(&row).unwrap_err();
        assert!(err.to_string().contains("unknown vote code"));
    }

    #[test]
    fn member_term_mapping_uses_the_configured_period() {
        let row = parse_row(
            &schemas::POSLANEC,
            "1401|101|27|5|172||||||||||",
            MismatchPolicy::AcceptDegraded,
        )
        .expect("parse");
        let record = map_member_term(&row, 9).expect("map");
        match record {
            EntityRecord::MemberTerm(term) => {
                assert_eq!(term.id, 1401);
                assert_eq!(term.person_id, 101);
                assert_eq!(term.period_number, 9);
                assert_eq!(term.constituency_id, Some(27));
                assert_eq!(term.party_id, Some(5));
                assert_eq!(term.period_organ_id, Some(172));
                assert!(term.active);
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }

    #[test]
    fn voting_session_mapping_defaults_missing_tallies_to_zero() {
        let row = parse_row(
            &schemas::HL_HLASOVANI,
            "77001|165|5|12||||||||||N|A||",
            MismatchPolicy::AcceptDegraded,
        )
        .expect("parse");
        let record = map_voting_session(&row).expect("map");
        match record {
            EntityRecord::VotingSession(session) => {
                assert_eq!(session.id, 77001);
                assert_eq!(session.committee_id, 165);
                assert_eq!(session.votes_for, 0);
                assert_eq!(session.present, 0);
                assert_eq!(session.quorum, None);
                assert_eq!(session.result.as_deref(), Some("A"));
            }
            other => panic!("unexpected record: {other:?}"),
        }
    }
}
