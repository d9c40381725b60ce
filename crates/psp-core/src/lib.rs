//! Core domain model for the PSP open-data sync: entities, identity keys,
//! vote-result codes and sync-run bookkeeping.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "psp-core";

/// Every entity type the engine knows how to synchronize.
///
/// The declaration order here is meaningful only through [`EntityKind::sync_order`],
/// which guarantees that foreign-key targets come before their referrers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    ElectoralPeriod,
    Party,
    Constituency,
    Person,
    MemberTerm,
    Committee,
    Bill,
    VotingSession,
    VoteRecord,
}

impl EntityKind {
    /// Fixed dependency order: reference data first, then each kind after
    /// everything it references.
    pub fn sync_order() -> [EntityKind; 9] {
        [
            EntityKind::ElectoralPeriod,
            EntityKind::Party,
            EntityKind::Constituency,
            EntityKind::Person,
            EntityKind::MemberTerm,
            EntityKind::Committee,
            EntityKind::Bill,
            EntityKind::VotingSession,
            EntityKind::VoteRecord,
        ]
    }

    /// Kinds that must have completed without a type-scoped failure before
    /// this kind can be applied.
    pub fn prerequisites(self) -> &'static [EntityKind] {
        match self {
            EntityKind::ElectoralPeriod | EntityKind::Party | EntityKind::Constituency => &[],
            EntityKind::Person => &[],
            EntityKind::MemberTerm => &[EntityKind::Person, EntityKind::ElectoralPeriod],
            EntityKind::Committee => &[],
            EntityKind::Bill => &[],
            EntityKind::VotingSession => &[EntityKind::Committee],
            EntityKind::VoteRecord => &[EntityKind::VotingSession, EntityKind::MemberTerm],
        }
    }

    /// Source flat-file table backing this kind, if it is fetched rather
    /// than seeded.
    pub fn table(self) -> Option<&'static str> {
        match self {
            EntityKind::ElectoralPeriod | EntityKind::Party | EntityKind::Constituency => None,
            EntityKind::Person => Some("osoby"),
            EntityKind::MemberTerm => Some("poslanec"),
            EntityKind::Committee => Some("organy"),
            EntityKind::Bill => Some("tisk"),
            EntityKind::VotingSession => Some("hl_hlasovani"),
            EntityKind::VoteRecord => Some("hl_poslanec"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::ElectoralPeriod => "electoral_period",
            EntityKind::Party => "party",
            EntityKind::Constituency => "constituency",
            EntityKind::Person => "person",
            EntityKind::MemberTerm => "member_term",
            EntityKind::Committee => "committee",
            EntityKind::Bill => "bill",
            EntityKind::VotingSession => "voting_session",
            EntityKind::VoteRecord => "vote_record",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "electoral_period" => Ok(EntityKind::ElectoralPeriod),
            "party" => Ok(EntityKind::Party),
            "constituency" => Ok(EntityKind::Constituency),
            "person" => Ok(EntityKind::Person),
            "member_term" => Ok(EntityKind::MemberTerm),
            "committee" => Ok(EntityKind::Committee),
            "bill" => Ok(EntityKind::Bill),
            "voting_session" => Ok(EntityKind::VotingSession),
            "vote_record" => Ok(EntityKind::VoteRecord),
            other => Err(format!("unknown entity kind: {other}")),
        }
    }
}

/// Natural identity of a row within its entity kind.
///
/// Entities reference each other by these source-assigned identifiers only,
/// never by in-memory reference; referents may arrive in a later batch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKey {
    /// Source-assigned numeric id.
    Id(i64),
    /// Natural short-code key (reference data).
    Code(String),
    /// Composite (voting session, member term) pair.
    Pair(i64, i64),
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Id(id) => write!(f, "{id}"),
            EntityKey::Code(code) => f.write_str(code),
            EntityKey::Pair(a, b) => write!(f, "{a}:{b}"),
        }
    }
}

/// How an MP voted in one voting session. Restricted to the seven codes the
/// source publishes; anything else is a parse failure upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteResult {
    #[serde(rename = "A")]
    Yes,
    #[serde(rename = "N")]
    No,
    #[serde(rename = "Z")]
    Abstain,
    #[serde(rename = "@")]
    NotRegistered,
    #[serde(rename = "M")]
    Excused,
    #[serde(rename = "X")]
    DidNotVote,
    #[serde(rename = "0")]
    NotRecorded,
}

impl VoteResult {
    pub fn from_code(code: &str) -> Option<VoteResult> {
        match code {
            "A" => Some(VoteResult::Yes),
            "N" => Some(VoteResult::No),
            "Z" => Some(VoteResult::Abstain),
            "@" => Some(VoteResult::NotRegistered),
            "M" => Some(VoteResult::Excused),
            "X" => Some(VoteResult::DidNotVote),
            "0" => Some(VoteResult::NotRecorded),
            _ => None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            VoteResult::Yes => "A",
            VoteResult::No => "N",
            VoteResult::Abstain => "Z",
            VoteResult::NotRegistered => "@",
            VoteResult::Excused => "M",
            VoteResult::DidNotVote => "X",
            VoteResult::NotRecorded => "0",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectoralPeriod {
    pub number: i64,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub description: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Party {
    pub name: String,
    pub short_name: String,
    pub color_hex: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constituency {
    pub name: String,
    pub code: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: i64,
    pub title_before: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub title_after: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub death_date: Option<NaiveDate>,
    /// Single-letter gender code as published by the source.
    pub gender: Option<String>,
    /// Date the source last touched the record.
    pub changed_on: Option<NaiveDate>,
}

/// One MP's term of office. Unique per (person, electoral period).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberTerm {
    pub id: i64,
    pub person_id: i64,
    pub constituency_id: Option<i64>,
    pub party_id: Option<i64>,
    /// Electoral period the term belongs to, by period number.
    pub period_number: i64,
    /// Raw chamber-organ id from the source, kept for provenance.
    pub period_organ_id: Option<i64>,
    pub website: Option<String>,
    pub street: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub fax: Option<String>,
    pub office_phone: Option<String>,
    pub facebook: Option<String>,
    pub photo_url: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Committee {
    pub id: i64,
    /// Self-referential hierarchy; top-level organs have no parent.
    pub parent_id: Option<i64>,
    pub type_id: Option<i64>,
    pub abbreviation: Option<String>,
    pub name_cs: Option<String>,
    pub name_en: Option<String>,
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    pub id: i64,
    /// Chamber organ the print belongs to, carried as data.
    pub organ_id: Option<i64>,
    pub bill_number: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub own_number: Option<String>,
    pub bill_type: Option<i64>,
    pub status: Option<i64>,
    pub submitted: Option<NaiveDate>,
    pub collection_number: Option<String>,
    pub collection_year: Option<i64>,
    pub url: Option<String>,
}

/// One recorded vote of the whole chamber or a committee.
/// Unique per (committee, session number, vote number).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotingSession {
    pub id: i64,
    pub committee_id: i64,
    pub session_number: i64,
    pub vote_number: i64,
    pub agenda_item: Option<i64>,
    pub date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
    pub votes_for: i64,
    pub votes_against: i64,
    pub abstentions: i64,
    pub did_not_vote: i64,
    pub present: i64,
    pub quorum: Option<i64>,
    pub vote_kind: Option<String>,
    pub result: Option<String>,
    pub title_long: Option<String>,
    pub title_short: Option<String>,
    /// Parliamentary print the vote concerned, when the source links one.
    pub bill_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub session_id: i64,
    pub term_id: i64,
    pub result: VoteResult,
}

/// A single typed row handed to the store. Carries its own kind and natural
/// identity so the store can upsert and resolve without downcasting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "row", rename_all = "snake_case")]
pub enum EntityRecord {
    ElectoralPeriod(ElectoralPeriod),
    Party(Party),
    Constituency(Constituency),
    Person(Person),
    MemberTerm(MemberTerm),
    Committee(Committee),
    Bill(Bill),
    VotingSession(VotingSession),
    VoteRecord(VoteRecord),
}

impl EntityRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRecord::ElectoralPeriod(_) => EntityKind::ElectoralPeriod,
            EntityRecord::Party(_) => EntityKind::Party,
            EntityRecord::Constituency(_) => EntityKind::Constituency,
            EntityRecord::Person(_) => EntityKind::Person,
            EntityRecord::MemberTerm(_) => EntityKind::MemberTerm,
            EntityRecord::Committee(_) => EntityKind::Committee,
            EntityRecord::Bill(_) => EntityKind::Bill,
            EntityRecord::VotingSession(_) => EntityKind::VotingSession,
            EntityRecord::VoteRecord(_) => EntityKind::VoteRecord,
        }
    }

    pub fn key(&self) -> EntityKey {
        match self {
            EntityRecord::ElectoralPeriod(p) => EntityKey::Id(p.number),
            EntityRecord::Party(p) => EntityKey::Code(p.short_name.clone()),
            EntityRecord::Constituency(c) => EntityKey::Code(c.code.clone()),
            EntityRecord::Person(p) => EntityKey::Id(p.id),
            EntityRecord::MemberTerm(t) => EntityKey::Id(t.id),
            EntityRecord::Committee(c) => EntityKey::Id(c.id),
            EntityRecord::Bill(b) => EntityKey::Id(b.id),
            EntityRecord::VotingSession(s) => EntityKey::Id(s.id),
            EntityRecord::VoteRecord(v) => EntityKey::Pair(v.session_id, v.term_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Incremental,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        }
    }
}

/// Terminal run states are final; a run is never resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithErrors => "completed-with-errors",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// What happened to a single row at the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Per-row tallies for one entity kind or a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
}

impl SyncCounts {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        self.processed += 1;
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }

    pub fn record_failure(&mut self) {
        self.processed += 1;
        self.failed += 1;
    }

    /// Rows skipped before the store roundtrip still count as processed
    /// and unchanged.
    pub fn record_skipped_unchanged(&mut self, rows: u64) {
        self.processed += rows;
        self.unchanged += rows;
    }

    pub fn merge(&mut self, other: SyncCounts) {
        self.processed += other.processed;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
    }
}

/// Append-only provenance record of one synchronization run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunRecord {
    pub run_id: Uuid,
    pub mode: SyncMode,
    pub scope: Vec<EntityKind>,
    pub status: RunStatus,
    pub totals: SyncCounts,
    pub per_kind: BTreeMap<EntityKind, SyncCounts>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SyncRunRecord {
    pub fn open(
        run_id: Uuid,
        mode: SyncMode,
        scope: Vec<EntityKind>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            mode,
            scope,
            status: RunStatus::Running,
            totals: SyncCounts::default(),
            per_kind: BTreeMap::new(),
            started_at,
            finished_at: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_order_places_referents_before_referrers() {
        let order = EntityKind::sync_order();
        let pos = |kind: EntityKind| order.iter().position(|k| *k == kind).unwrap();

        for kind in order {
            for prereq in kind.prerequisites() {
                assert!(
                    pos(*prereq) < pos(kind),
                    "{prereq} must sync before {kind}"
                );
            }
        }
    }

    #[test]
    fn vote_result_codes_round_trip() {
        for code in ["A", "N", "Z", "@", "M", "X", "0"] {
            let result = VoteResult::from_code(code).expect("known code");
            assert_eq!(result.code(), code);
        }
        assert_eq!(VoteResult::from_code("K"), None);
        assert_eq!(VoteResult::from_code(""), None);
        assert_eq!(VoteResult::from_code("AA"), None);
    }

    #[test]
    fn entity_kind_names_round_trip() {
        for kind in EntityKind::sync_order() {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("mps".parse::<EntityKind>().is_err());
    }

    #[test]
    fn counts_record_outcomes_and_merge() {
        let mut counts = SyncCounts::default();
        counts.record(UpsertOutcome::Inserted);
        counts.record(UpsertOutcome::Updated);
        counts.record(UpsertOutcome::Unchanged);
        counts.record_failure();
        counts.record_skipped_unchanged(3);

        assert_eq!(counts.processed, 7);
        assert_eq!(counts.inserted, 1);
        assert_eq!(counts.updated, 1);
        assert_eq!(counts.unchanged, 4);
        assert_eq!(counts.failed, 1);

        let mut totals = SyncCounts::default();
        totals.merge(counts);
        totals.merge(counts);
        assert_eq!(totals.processed, 14);
    }

    #[test]
    fn vote_record_identity_is_the_session_member_pair() {
        let record = EntityRecord::VoteRecord(VoteRecord {
            session_id: 77001,
            term_id: 1401,
            result: VoteResult::Yes,
        });
        assert_eq!(record.kind(), EntityKind::VoteRecord);
        assert_eq!(record.key(), EntityKey::Pair(77001, 1401));
        assert_eq!(record.key().to_string(), "77001:1401");
    }
}
