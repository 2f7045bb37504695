//! HTTP fetch utilities, durable posting storage and the read cache for
//! Job Radar.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobradar_core::{JobPosting, NewJob};
use reqwest::StatusCode;
use serde::Serialize;
use sqlx::postgres::PgPool;
use sqlx::Row;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobradar-storage";

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
pub struct HttpClientConfig {
    /// Default per-request timeout; individual fetches may override it.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[source] reqwest::Error),
    #[error("timed out fetching {url}")]
    Timeout {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

fn request_error(url: &str, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
            source: err,
        }
    } else {
        FetchError::Request(err)
    }
}

/// Bounded HTTP GET client shared by all source adapters. One slow source
/// cannot starve the others: each request carries its own timeout and the
/// concurrency cap only delays, never cancels, sibling fetches.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    default_timeout: Duration,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
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
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            default_timeout: config.timeout,
            backoff: config.backoff,
        })
    }

    /// GET a listing page and return its body as text. Retryable failures
    /// (5xx, 429, timeouts, connection errors) are retried with capped
    /// exponential backoff before the error surfaces.
    pub async fn fetch_text(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<String, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, source_id, url);
        let _guard = span.enter();

        let timeout = timeout.unwrap_or(self.default_timeout);
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).timeout(timeout).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|err| request_error(&final_url, err))?;
                        return Ok(String::from_utf8_lossy(&body).into_owned());
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(request_error(url, err));
                }
            }
        }

        Err(request_error(
            url,
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable")]
    Unavailable(#[source] anyhow::Error),
    #[error("storage query failed")]
    Query(#[source] anyhow::Error),
    #[error("storage commit failed")]
    Commit(#[source] anyhow::Error),
}

fn query_err(err: sqlx::Error) -> StoreError {
    StoreError::Query(err.into())
}

/// Counts reported by one upsert batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// Durable posting store keyed by canonical URL. The upserter is the sole
/// writer of postings; nothing in the pipeline deletes them.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Reconcile one deduplicated batch against storage as a single unit:
    /// insert unseen URLs, update title/company of known ones (never
    /// overwriting a populated field with an empty value, never changing
    /// `id`). An insert that loses a uniqueness race degrades to an update
    /// for that record; only a commit-level failure fails the batch, and a
    /// failed batch leaves storage unchanged.
    async fn upsert_all(&self, jobs: &[NewJob]) -> Result<UpsertOutcome, StoreError>;

    /// All postings, most recently inserted first.
    async fn all_postings_newest_first(&self) -> Result<Vec<JobPosting>, StoreError>;
}

/// Postgres-backed store. Schema lives in `migrations/` at the workspace
/// root; `jobs.url` carries the uniqueness invariant.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|err| StoreError::Unavailable(err.into()))?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Query(err.into()))
    }
}

struct StoredRow {
    id: i64,
    title: String,
    company: Option<String>,
}

async fn fetch_by_url(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    url: &str,
) -> Result<Option<StoredRow>, StoreError> {
    let row = sqlx::query("SELECT id, title, company FROM jobs WHERE url = $1")
        .bind(url)
        .fetch_optional(&mut **tx)
        .await
        .map_err(query_err)?;
    row.map(|row| {
        Ok(StoredRow {
            id: row.try_get("id").map_err(query_err)?,
            title: row.try_get("title").map_err(query_err)?,
            company: row.try_get("company").map_err(query_err)?,
        })
    })
    .transpose()
}

async fn update_existing(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    existing: StoredRow,
    job: &NewJob,
    outcome: &mut UpsertOutcome,
) -> Result<(), StoreError> {
    let title_changed = existing.title != job.title;
    let company_changed = match job.company.as_deref() {
        Some(incoming) => existing.company.as_deref() != Some(incoming),
        None => false,
    };
    if !title_changed && !company_changed {
        outcome.skipped += 1;
        return Ok(());
    }
    sqlx::query("UPDATE jobs SET title = $2, company = COALESCE($3, company) WHERE id = $1")
        .bind(existing.id)
        .bind(&job.title)
        .bind(job.company.as_deref())
        .execute(&mut **tx)
        .await
        .map_err(query_err)?;
    outcome.updated += 1;
    Ok(())
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn upsert_all(&self, jobs: &[NewJob]) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| StoreError::Unavailable(err.into()))?;
        let mut outcome = UpsertOutcome::default();

        for job in jobs {
            match fetch_by_url(&mut tx, &job.url).await? {
                Some(existing) => update_existing(&mut tx, existing, job, &mut outcome).await?,
                None => {
                    let inserted: Option<i64> = sqlx::query_scalar(
                        "INSERT INTO jobs (title, company, url) VALUES ($1, $2, $3) \
                         ON CONFLICT (url) DO NOTHING RETURNING id",
                    )
                    .bind(&job.title)
                    .bind(job.company.as_deref())
                    .bind(&job.url)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(query_err)?;

                    match inserted {
                        Some(_) => outcome.inserted += 1,
                        None => {
                            // lost an insert race; resolve as an update
                            if let Some(existing) = fetch_by_url(&mut tx, &job.url).await? {
                                update_existing(&mut tx, existing, job, &mut outcome).await?;
                            } else {
                                outcome.skipped += 1;
                            }
                        }
                    }
                }
            }
        }

        tx.commit()
            .await
            .map_err(|err| StoreError::Commit(err.into()))?;
        Ok(outcome)
    }

    async fn all_postings_newest_first(&self) -> Result<Vec<JobPosting>, StoreError> {
        let rows = sqlx::query("SELECT id, title, company, url FROM jobs ORDER BY id DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(query_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(JobPosting {
                id: row.try_get("id").map_err(query_err)?,
                title: row.try_get("title").map_err(query_err)?,
                company: row.try_get("company").map_err(query_err)?,
                url: row.try_get("url").map_err(query_err)?,
            });
        }
        Ok(out)
    }
}

/// In-process store with the same observable semantics as [`PgJobStore`].
/// Backs the pipeline and web tests; `fail_commits` exercises the
/// commit-failure path, where a failed batch must leave state untouched.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: Mutex<MemoryInner>,
    fail_commits: AtomicBool,
}

#[derive(Debug)]
struct MemoryInner {
    next_id: i64,
    jobs: Vec<JobPosting>,
}

impl Default for MemoryInner {
    fn default() -> Self {
        Self {
            next_id: 1,
            jobs: Vec::new(),
        }
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `upsert_all` fail at commit time.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn upsert_all(&self, jobs: &[NewJob]) -> Result<UpsertOutcome, StoreError> {
        let mut inner = self.inner.lock().await;

        // Stage the batch against a copy so a failed commit rolls back
        // to the pre-run state.
        let mut staged = inner.jobs.clone();
        let mut next_id = inner.next_id;
        let mut outcome = UpsertOutcome::default();

        for job in jobs {
            match staged.iter_mut().find(|existing| existing.url == job.url) {
                Some(existing) => {
                    let title_changed = existing.title != job.title;
                    let company_changed = match job.company.as_deref() {
                        Some(incoming) => existing.company.as_deref() != Some(incoming),
                        None => false,
                    };
                    if title_changed || company_changed {
                        existing.title = job.title.clone();
                        if job.company.is_some() {
                            existing.company = job.company.clone();
                        }
                        outcome.updated += 1;
                    } else {
                        outcome.skipped += 1;
                    }
                }
                None => {
                    staged.push(JobPosting {
                        id: next_id,
                        title: job.title.clone(),
                        company: job.company.clone(),
                        url: job.url.clone(),
                    });
                    next_id += 1;
                    outcome.inserted += 1;
                }
            }
        }

        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StoreError::Commit(anyhow::anyhow!(
                "injected commit failure"
            )));
        }

        inner.jobs = staged;
        inner.next_id = next_id;
        Ok(outcome)
    }

    async fn all_postings_newest_first(&self) -> Result<Vec<JobPosting>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.iter().rev().cloned().collect())
    }
}

/// Immutable point-in-time view of all stored postings, newest first.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub refreshed_at: DateTime<Utc>,
    jobs: Vec<JobPosting>,
}

impl CacheSnapshot {
    fn empty() -> Self {
        Self {
            refreshed_at: Utc::now(),
            jobs: Vec::new(),
        }
    }

    pub fn jobs(&self) -> &[JobPosting] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Case-insensitive substring match over title, company and url, in
    /// snapshot order. An empty query returns the full snapshot.
    pub fn query(&self, text: &str) -> Vec<&JobPosting> {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return self.jobs.iter().collect();
        }
        self.jobs
            .iter()
            .filter(|job| {
                job.title.to_lowercase().contains(&needle)
                    || job
                        .company
                        .as_deref()
                        .is_some_and(|company| company.to_lowercase().contains(&needle))
                    || job.url.to_lowercase().contains(&needle)
            })
            .collect()
    }
}

/// Holds exactly one live snapshot. `refresh` builds the replacement
/// outside the lock and swaps the `Arc` in one write, so readers never
/// observe a half-built snapshot; readers keep whatever snapshot they
/// cloned until they drop it.
#[derive(Debug)]
pub struct JobCache {
    snapshot: RwLock<Arc<CacheSnapshot>>,
}

impl JobCache {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(CacheSnapshot::empty())),
        }
    }

    pub async fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Rebuild the snapshot wholesale from storage and swap it in. Returns
    /// the number of postings in the new snapshot.
    pub async fn refresh(&self, store: &dyn JobStore) -> Result<usize, StoreError> {
        let jobs = store.all_postings_newest_first().await?;
        let next = Arc::new(CacheSnapshot {
            refreshed_at: Utc::now(),
            jobs,
        });
        let count = next.len();
        *self.snapshot.write().await = next;
        Ok(count)
    }
}

impl Default for JobCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job(title: &str, company: Option<&str>, url: &str) -> NewJob {
        NewJob {
            title: title.to_string(),
            company: company.map(str::to_string),
            url: url.to_string(),
        }
    }

    #[tokio::test]
    async fn upsert_inserts_new_urls_and_preserves_insertion_order() {
        let store = MemoryJobStore::new();
        let outcome = store
            .upsert_all(&[
                new_job("Engineer", Some("Acme"), "https://example.test/apply/1"),
                new_job("Analyst", Some("Beta"), "https://example.test/apply/2"),
            ])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            UpsertOutcome {
                inserted: 2,
                updated: 0,
                skipped: 0
            }
        );

        let postings = store.all_postings_newest_first().await.unwrap();
        assert_eq!(postings.len(), 2);
        assert_eq!(postings[0].title, "Analyst");
        assert_eq!(postings[1].title, "Engineer");
    }

    #[tokio::test]
    async fn second_identical_run_is_idempotent_and_keeps_ids() {
        let store = MemoryJobStore::new();
        let batch = vec![
            new_job("Engineer", Some("Acme"), "https://example.test/apply/1"),
            new_job("Analyst", Some("Beta"), "https://example.test/apply/2"),
        ];
        store.upsert_all(&batch).await.unwrap();
        let first = store.all_postings_newest_first().await.unwrap();

        let outcome = store.upsert_all(&batch).await.unwrap();
        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.updated, 0);
        assert_eq!(outcome.skipped, 2);

        let second = store.all_postings_newest_first().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn changed_title_updates_in_place_with_same_id() {
        let store = MemoryJobStore::new();
        store
            .upsert_all(&[new_job(
                "Engineer",
                Some("Acme"),
                "https://example.test/apply/1",
            )])
            .await
            .unwrap();
        let before = store.all_postings_newest_first().await.unwrap();

        let outcome = store
            .upsert_all(&[new_job(
                "Senior Engineer",
                Some("Acme"),
                "https://example.test/apply/1",
            )])
            .await
            .unwrap();
        assert_eq!(outcome.updated, 1);

        let after = store.all_postings_newest_first().await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, before[0].id);
        assert_eq!(after[0].title, "Senior Engineer");
    }

    #[tokio::test]
    async fn missing_company_never_clears_a_populated_one() {
        let store = MemoryJobStore::new();
        store
            .upsert_all(&[new_job(
                "Engineer",
                Some("Acme"),
                "https://example.test/apply/1",
            )])
            .await
            .unwrap();
        store
            .upsert_all(&[new_job("Engineer", None, "https://example.test/apply/1")])
            .await
            .unwrap();

        let postings = store.all_postings_newest_first().await.unwrap();
        assert_eq!(postings[0].company.as_deref(), Some("Acme"));
    }

    #[tokio::test]
    async fn failed_commit_leaves_storage_unchanged() {
        let store = MemoryJobStore::new();
        store
            .upsert_all(&[new_job("Engineer", None, "https://example.test/apply/1")])
            .await
            .unwrap();

        store.fail_commits(true);
        let err = store
            .upsert_all(&[
                new_job("Senior Engineer", None, "https://example.test/apply/1"),
                new_job("Analyst", None, "https://example.test/apply/2"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Commit(_)));

        store.fail_commits(false);
        let postings = store.all_postings_newest_first().await.unwrap();
        assert_eq!(postings.len(), 1);
        assert_eq!(postings[0].title, "Engineer");
    }

    #[tokio::test]
    async fn cache_refresh_swaps_snapshot_without_disturbing_held_readers() {
        let store = MemoryJobStore::new();
        let cache = JobCache::new();
        store
            .upsert_all(&[new_job("Engineer", None, "https://example.test/apply/1")])
            .await
            .unwrap();
        cache.refresh(&store).await.unwrap();

        let held = cache.snapshot().await;
        assert_eq!(held.len(), 1);

        store
            .upsert_all(&[new_job("Analyst", None, "https://example.test/apply/2")])
            .await
            .unwrap();
        let count = cache.refresh(&store).await.unwrap();
        assert_eq!(count, 2);

        // the reader's snapshot is immutable; only new readers see the swap
        assert_eq!(held.len(), 1);
        let fresh = cache.snapshot().await;
        assert_eq!(fresh.len(), 2);
        assert_eq!(fresh.jobs()[0].title, "Analyst");
    }

    #[tokio::test]
    async fn cache_query_matches_title_company_and_url_case_insensitively() {
        let store = MemoryJobStore::new();
        let cache = JobCache::new();
        store
            .upsert_all(&[
                new_job("Data Engineer", Some("Acme"), "https://example.test/a"),
                new_job("Analyst", Some("Globex"), "https://example.test/b"),
                new_job("Designer", None, "https://jobs.acme.test/c"),
            ])
            .await
            .unwrap();
        cache.refresh(&store).await.unwrap();
        let snapshot = cache.snapshot().await;

        let by_title = snapshot.query("engineer");
        assert_eq!(by_title.len(), 1);
        assert_eq!(by_title[0].title, "Data Engineer");

        // matches Acme the company and acme in a URL, newest first
        let by_company = snapshot.query("ACME");
        assert_eq!(by_company.len(), 2);
        assert_eq!(by_company[0].title, "Designer");

        assert_eq!(snapshot.query("").len(), 3);
        assert_eq!(snapshot.query("   ").len(), 3);
        assert!(snapshot.query("nonexistent").is_empty());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
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

    #[test]
    fn non_2xx_statuses_classify_for_retry_correctly() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
