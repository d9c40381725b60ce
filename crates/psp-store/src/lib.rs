//! External collaborators of the sync engine behind traits: archive
//! transport (HTTP with retry/backoff, or a fixture directory), the
//! entity store and run ledger, and the on-disk change cache used by
//! incremental runs.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use psp_core::{EntityKey, EntityKind, EntityRecord, SyncRunRecord, UpsertOutcome};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "psp-store";

// ---------------------------------------------------------------------------
// Archive transport

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("archive `{name}` unavailable: {reason}")]
    Unavailable { name: String, reason: String },
}

/// Source of raw archive bytes, addressed by a small fixed set of names.
/// Fetches must be safe to repeat; transient failures are expected.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    async fn fetch(&self, archive_name: &str) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.psp.cz/eknih/cdrom/opendata".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Fetches archives from the chamber's open-data endpoint with bounded
/// concurrency and exponential backoff on retryable failures.
#[derive(Debug)]
pub struct HttpArchiveSource {
    client: reqwest::Client,
    base_url: String,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpArchiveSource {
    pub fn new(config: HttpSourceConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }
}

#[async_trait]
impl ArchiveSource for HttpArchiveSource {
    async fn fetch(&self, archive_name: &str) -> Result<Vec<u8>, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        let url = format!("{}/{archive_name}", self.base_url);

        let span = info_span!("archive_fetch", archive = archive_name, url = %url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(&url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}

/// Archive source backed by a directory of captured archives, for offline
/// runs and tests.
#[derive(Debug, Clone)]
pub struct DirArchiveSource {
    root: PathBuf,
}

impl DirArchiveSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArchiveSource for DirArchiveSource {
    async fn fetch(&self, archive_name: &str) -> Result<Vec<u8>, FetchError> {
        let path = self.root.join(archive_name);
        fs::read(&path).await.map_err(|err| FetchError::Unavailable {
            name: archive_name.to_string(),
            reason: format!("{}: {err}", path.display()),
        })
    }
}

// ---------------------------------------------------------------------------
// Entity store and run ledger

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Upsert-by-natural-identity store for synchronized entities.
///
/// `resolve` must reflect rows upserted earlier in the same run
/// (read-your-writes); the engine relies on it for foreign-key checks.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn upsert(&self, record: EntityRecord) -> Result<UpsertOutcome, StoreError>;

    /// Handle of a previously synchronized row, or `None` when absent.
    async fn resolve(
        &self,
        kind: EntityKind,
        key: &EntityKey,
    ) -> Result<Option<EntityKey>, StoreError>;
}

/// Append-only ledger of synchronization runs. Closed records never mutate.
#[async_trait]
pub trait RunLedger: Send + Sync {
    async fn open_run(&self, record: SyncRunRecord) -> Result<(), StoreError>;
    async fn close_run(&self, record: SyncRunRecord) -> Result<(), StoreError>;
    async fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRunRecord>, StoreError>;
}

/// Reference in-process store. Upserts are atomic per row and `resolve`
/// observes them immediately, which is exactly the contract the engine
/// needs from the real backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entities: Mutex<HashMap<(EntityKind, EntityKey), EntityRecord>>,
    runs: Mutex<Vec<SyncRunRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, kind: EntityKind, key: &EntityKey) -> Option<EntityRecord> {
        self.entities
            .lock()
            .await
            .get(&(kind, key.clone()))
            .cloned()
    }

    pub async fn count(&self, kind: EntityKind) -> usize {
        self.entities
            .lock()
            .await
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn upsert(&self, record: EntityRecord) -> Result<UpsertOutcome, StoreError> {
        let slot = (record.kind(), record.key());
        let mut entities = self.entities.lock().await;
        match entities.get(&slot) {
            None => {
                entities.insert(slot, record);
                Ok(UpsertOutcome::Inserted)
            }
            Some(existing) if *existing == record => Ok(UpsertOutcome::Unchanged),
            Some(_) => {
                entities.insert(slot, record);
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    async fn resolve(
        &self,
        kind: EntityKind,
        key: &EntityKey,
    ) -> Result<Option<EntityKey>, StoreError> {
        let entities = self.entities.lock().await;
        Ok(entities
            .contains_key(&(kind, key.clone()))
            .then(|| key.clone()))
    }
}

#[async_trait]
impl RunLedger for MemoryStore {
    async fn open_run(&self, record: SyncRunRecord) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().await;
        if runs.iter().any(|r| r.run_id == record.run_id) {
            return Err(StoreError::Constraint(format!(
                "run {} already opened",
                record.run_id
            )));
        }
        runs.push(record);
        Ok(())
    }

    async fn close_run(&self, record: SyncRunRecord) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().await;
        let slot = runs
            .iter_mut()
            .find(|r| r.run_id == record.run_id)
            .ok_or_else(|| {
                StoreError::Constraint(format!("run {} was never opened", record.run_id))
            })?;
        if slot.status.is_terminal() {
            return Err(StoreError::Constraint(format!(
                "run {} already closed as {}",
                record.run_id,
                slot.status.as_str()
            )));
        }
        if !record.status.is_terminal() {
            return Err(StoreError::Constraint(format!(
                "run {} closed with non-terminal status {}",
                record.run_id,
                record.status.as_str()
            )));
        }
        *slot = record;
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRunRecord>, StoreError> {
        let runs = self.runs.lock().await;
        Ok(runs.iter().rev().take(limit).cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Change cache

/// Normalized rows last successfully synchronized for one source, keyed by
/// the row's natural identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub source: String,
    pub taken_at: DateTime<Utc>,
    pub content_hash: String,
    pub rows: BTreeMap<String, serde_json::Value>,
}

impl Snapshot {
    pub fn new(
        source: impl Into<String>,
        taken_at: DateTime<Utc>,
        rows: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let content_hash = hash_rows(&rows);
        Self {
            source: source.into(),
            taken_at,
            content_hash,
            rows,
        }
    }
}

fn hash_rows(rows: &BTreeMap<String, serde_json::Value>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in rows {
        hasher.update(key.as_bytes());
        hasher.update(b"\0");
        hasher.update(value.to_string().as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

/// Identity-keyed partition of current rows against a previous snapshot.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RowDiff {
    pub new: Vec<String>,
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
    pub removed: Vec<String>,
}

pub fn diff_rows(
    previous: Option<&Snapshot>,
    current: &BTreeMap<String, serde_json::Value>,
) -> RowDiff {
    let mut diff = RowDiff::default();
    let empty = BTreeMap::new();
    let previous_rows = previous.map(|s| &s.rows).unwrap_or(&empty);

    for (key, value) in current {
        match previous_rows.get(key) {
            None => diff.new.push(key.clone()),
            Some(old) if old == value => diff.unchanged.push(key.clone()),
            Some(_) => diff.changed.push(key.clone()),
        }
    }
    for key in previous_rows.keys() {
        if !current.contains_key(key) {
            diff.removed.push(key.clone());
        }
    }
    diff
}

/// Advisory snapshot cache on disk. Absent or unreadable state degrades to
/// "no previous snapshot"; it never fails a run.
#[derive(Debug, Clone)]
pub struct ChangeCache {
    root: PathBuf,
}

impl ChangeCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, source: &str) -> PathBuf {
        let safe: String = source
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{safe}.json"))
    }

    pub async fn load(&self, source: &str) -> Option<Snapshot> {
        let path = self.path_for(source);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(source, path = %path.display(), %err, "cache unreadable; treating as absent");
                return None;
            }
        };
        match serde_json::from_slice::<Snapshot>(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(source, path = %path.display(), %err, "cache corrupt; treating as absent");
                None
            }
        }
    }

    /// Atomic write via temp file + rename, so a crashed run can never leave
    /// a half-written snapshot behind.
    pub async fn store(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root).await?;
        let path = self.path_for(&snapshot.source);
        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));

        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        fs::rename(&temp_path, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use psp_core::{Person, RunStatus, SyncMode, VoteRecord, VoteResult};
    use tempfile::tempdir;

    fn person(id: i64, last_name: &str) -> EntityRecord {
        EntityRecord::Person(Person {
            id,
            title_before: None,
            first_name: Some("Jan".to_string()),
            last_name: Some(last_name.to_string()),
            title_after: None,
            birth_date: None,
            death_date: None,
            gender: Some("M".to_string()),
            changed_on: None,
        })
    }

    #[tokio::test]
    async fn upsert_is_insert_update_noop_by_value() {
        let store = MemoryStore::new();

        let first = store.upsert(person(1, "Novák")).await.unwrap();
        assert_eq!(first, UpsertOutcome::Inserted);

        let repeat = store.upsert(person(1, "Novák")).await.unwrap();
        assert_eq!(repeat, UpsertOutcome::Unchanged);

        let changed = store.upsert(person(1, "Novotný")).await.unwrap();
        assert_eq!(changed, UpsertOutcome::Updated);
        assert_eq!(store.count(EntityKind::Person).await, 1);
    }

    #[tokio::test]
    async fn resolve_reflects_prior_upserts() {
        let store = MemoryStore::new();
        let key = EntityKey::Id(42);
        assert!(store
            .resolve(EntityKind::Person, &key)
            .await
            .unwrap()
            .is_none());

        store.upsert(person(42, "Svoboda")).await.unwrap();
        assert_eq!(
            store.resolve(EntityKind::Person, &key).await.unwrap(),
            Some(key.clone())
        );

        // Same id under another kind stays unresolved.
        assert!(store
            .resolve(EntityKind::Bill, &key)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn vote_records_key_on_the_session_member_pair() {
        let store = MemoryStore::new();
        let vote = |result| {
            EntityRecord::VoteRecord(VoteRecord {
                session_id: 9,
                term_id: 3,
                result,
            })
        };
        assert_eq!(
            store.upsert(vote(VoteResult::Yes)).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert(vote(VoteResult::No)).await.unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(store.count(EntityKind::VoteRecord).await, 1);
    }

    #[tokio::test]
    async fn ledger_rejects_mutation_after_close() {
        let store = MemoryStore::new();
        let started = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap();
        let mut record = SyncRunRecord::open(
            Uuid::new_v4(),
            SyncMode::Full,
            vec![EntityKind::Person],
            started,
        );

        store.open_run(record.clone()).await.unwrap();

        record.status = RunStatus::Completed;
        record.finished_at = Some(started);
        store.close_run(record.clone()).await.unwrap();

        record.status = RunStatus::Failed;
        let err = store.close_run(record.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));

        let recent = store.recent_runs(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, RunStatus::Completed);
    }

    fn rows(entries: &[(&str, &str)]) -> BTreeMap<String, serde_json::Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::json!({ "value": v })))
            .collect()
    }

    #[test]
    fn diff_partitions_by_identity_and_value() {
        let taken = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap();
        let previous = Snapshot::new("osoby", taken, rows(&[("1", "a"), ("2", "b"), ("3", "c")]));
        let current = rows(&[("2", "b"), ("3", "changed"), ("4", "d")]);

        let diff = diff_rows(Some(&previous), &current);
        assert_eq!(diff.new, vec!["4"]);
        assert_eq!(diff.changed, vec!["3"]);
        assert_eq!(diff.unchanged, vec!["2"]);
        assert_eq!(diff.removed, vec!["1"]);
    }

    #[test]
    fn diff_without_previous_snapshot_marks_everything_new() {
        let current = rows(&[("1", "a"), ("2", "b")]);
        let diff = diff_rows(None, &current);
        assert_eq!(diff.new.len(), 2);
        assert!(diff.changed.is_empty() && diff.unchanged.is_empty() && diff.removed.is_empty());
    }

    #[tokio::test]
    async fn cache_round_trips_and_degrades_on_corruption() {
        let dir = tempdir().expect("tempdir");
        let cache = ChangeCache::new(dir.path());
        let taken = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap();

        assert!(cache.load("hl-2021ps/hl_poslanec").await.is_none());

        let snapshot = Snapshot::new("hl-2021ps/hl_poslanec", taken, rows(&[("9:3", "A")]));
        cache.store(&snapshot).await.expect("store");
        let loaded = cache.load("hl-2021ps/hl_poslanec").await.expect("load");
        assert_eq!(loaded, snapshot);

        // Scribble over the snapshot file; the cache must shrug it off.
        let path = cache.path_for("hl-2021ps/hl_poslanec");
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        assert!(cache.load("hl-2021ps/hl_poslanec").await.is_none());
    }

    #[test]
    fn snapshot_hash_tracks_content() {
        let taken = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap();
        let a = Snapshot::new("osoby", taken, rows(&[("1", "a")]));
        let b = Snapshot::new("osoby", taken, rows(&[("1", "a")]));
        let c = Snapshot::new("osoby", taken, rows(&[("1", "x")]));
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.content_hash, c.content_hash);
    }

    #[tokio::test]
    async fn dir_source_reports_missing_archives() {
        let dir = tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("poslanci.zip"), b"PK")
            .await
            .unwrap();

        let source = DirArchiveSource::new(dir.path());
        assert_eq!(source.fetch("poslanci.zip").await.unwrap(), b"PK".to_vec());

        let err = source.fetch("tisky.zip").await.unwrap_err();
        assert!(matches!(err, FetchError::Unavailable { name, .. } if name == "tisky.zip"));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
