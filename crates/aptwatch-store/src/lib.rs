//! Persistence for snapshots, change records and crawl jobs: a store trait
//! with a Postgres (sqlx) implementation and an in-memory implementation for
//! tests and database-less development.

use std::collections::BTreeMap;

use aptwatch_core::{
    ArticleChange, ChangeType, ComplexSummary, CrawlJob, JobKind, JobStatus, ListingSnapshot,
};
use aptwatch_diff::DiffOutcome;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "aptwatch-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("crawl job not found: {0}")]
    JobNotFound(Uuid),
    #[error("crawl job {0} is not in a terminal state")]
    JobNotTerminal(Uuid),
    #[error("crawl job {0} already finished")]
    JobFinished(Uuid),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
}

/// Windowed ledger summary. `most_significant_change` is the price move with
/// the largest absolute percent, ties broken by most recent detection.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeSummary {
    pub new: i64,
    pub removed: i64,
    pub price_up: i64,
    pub price_down: i64,
    pub total: i64,
    pub most_significant_change: Option<ArticleChange>,
}

pub fn summarize_changes(changes: &[ArticleChange]) -> ChangeSummary {
    let count = |ct: ChangeType| changes.iter().filter(|c| c.change_type == ct).count() as i64;
    let most_significant_change = changes
        .iter()
        .filter(|c| c.change_type.is_price_move())
        .max_by(|a, b| {
            let pa = a.price_change_percent.unwrap_or(0.0).abs();
            let pb = b.price_change_percent.unwrap_or(0.0).abs();
            pa.total_cmp(&pb).then(a.detected_at.cmp(&b.detected_at))
        })
        .cloned();
    ChangeSummary {
        new: count(ChangeType::New),
        removed: count(ChangeType::Removed),
        price_up: count(ChangeType::PriceUp),
        price_down: count(ChangeType::PriceDown),
        total: changes.len() as i64,
        most_significant_change,
    }
}

/// Storage contract for the crawl pipeline. Writes for one complex are
/// linearized by the crawl lock; `apply_cycle` is the only multi-row write
/// and must be all-or-nothing.
#[async_trait]
pub trait TrackerStore: Send + Sync {
    async fn register_complex(&self, complex: &ComplexSummary) -> Result<(), StoreError>;
    async fn get_complex(&self, complex_id: &str) -> Result<Option<ComplexSummary>, StoreError>;
    async fn list_complexes(&self) -> Result<Vec<ComplexSummary>, StoreError>;

    async fn active_snapshots(&self, complex_id: &str)
        -> Result<Vec<ListingSnapshot>, StoreError>;
    /// Persist one diff cycle: flip superseded/removed rows inactive and
    /// insert new rows plus change records, atomically.
    async fn apply_cycle(&self, complex_id: &str, outcome: &DiffOutcome)
        -> Result<(), StoreError>;
    async fn snapshots_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<ListingSnapshot>, StoreError>;
    /// Delete inactive snapshot rows captured before the cutoff. Active rows
    /// are never pruned.
    async fn prune_inactive_snapshots(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Changes detected at or after `since`, newest first.
    async fn recent_changes(
        &self,
        complex_id: &str,
        since: DateTime<Utc>,
        limit: Option<i64>,
    ) -> Result<Vec<ArticleChange>, StoreError>;
    async fn changes_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<ArticleChange>, StoreError>;

    async fn insert_job(&self, job: &CrawlJob) -> Result<(), StoreError>;
    /// Persist the current state of a job. Refused once the stored row is in
    /// a terminal state.
    async fn update_job(&self, job: &CrawlJob) -> Result<(), StoreError>;
    async fn get_job(&self, job_id: Uuid) -> Result<Option<CrawlJob>, StoreError>;
    /// Delete a terminal job. RUNNING/PENDING jobs are refused here; the
    /// manager's force-cancel path fails the job first.
    async fn delete_job(&self, job_id: Uuid) -> Result<(), StoreError>;
    /// Reconciliation sweep: mark jobs still RUNNING since before the cutoff
    /// as FAILED with a synthetic stale error. Returns the number swept.
    async fn sweep_stale_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS complexes (
        complex_id TEXT PRIMARY KEY,
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS article_snapshots (
        id BIGSERIAL PRIMARY KEY,
        complex_id TEXT NOT NULL,
        article_no TEXT NOT NULL,
        trade_type TEXT,
        price BIGINT,
        area_name TEXT,
        area DOUBLE PRECISION,
        floor_info TEXT,
        direction TEXT,
        building_name TEXT,
        realtor_name TEXT,
        is_active BOOLEAN NOT NULL,
        captured_at TIMESTAMPTZ NOT NULL,
        first_seen_at TIMESTAMPTZ NOT NULL,
        crawl_session_id UUID NOT NULL
    )",
    // The core invariant: at most one active row per listing.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_snapshots_active
        ON article_snapshots (complex_id, article_no) WHERE is_active",
    "CREATE INDEX IF NOT EXISTS idx_snapshots_session
        ON article_snapshots (crawl_session_id)",
    "CREATE TABLE IF NOT EXISTS article_changes (
        id BIGSERIAL PRIMARY KEY,
        complex_id TEXT NOT NULL,
        article_no TEXT NOT NULL,
        change_type TEXT NOT NULL,
        old_price BIGINT,
        new_price BIGINT,
        price_change_amount BIGINT,
        price_change_percent DOUBLE PRECISION,
        trade_type TEXT,
        area_name TEXT,
        building_name TEXT,
        floor_info TEXT,
        detected_at TIMESTAMPTZ NOT NULL,
        crawl_session_id UUID NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_changes_complex_detected
        ON article_changes (complex_id, detected_at)",
    "CREATE TABLE IF NOT EXISTS crawl_jobs (
        job_id UUID PRIMARY KEY,
        kind TEXT NOT NULL,
        complex_id TEXT,
        status TEXT NOT NULL,
        started_at TIMESTAMPTZ NOT NULL,
        finished_at TIMESTAMPTZ,
        articles_collected BIGINT NOT NULL DEFAULT 0,
        articles_new BIGINT NOT NULL DEFAULT 0,
        articles_updated BIGINT NOT NULL DEFAULT 0,
        articles_skipped BIGINT NOT NULL DEFAULT 0,
        error_message TEXT,
        error_traceback TEXT
    )",
];

fn change_type_str(ct: ChangeType) -> &'static str {
    match ct {
        ChangeType::New => "NEW",
        ChangeType::Removed => "REMOVED",
        ChangeType::PriceUp => "PRICE_UP",
        ChangeType::PriceDown => "PRICE_DOWN",
    }
}

fn parse_change_type(raw: &str) -> Result<ChangeType, StoreError> {
    match raw {
        "NEW" => Ok(ChangeType::New),
        "REMOVED" => Ok(ChangeType::Removed),
        "PRICE_UP" => Ok(ChangeType::PriceUp),
        "PRICE_DOWN" => Ok(ChangeType::PriceDown),
        other => Err(StoreError::Corrupt(format!("change_type {other}"))),
    }
}

fn job_kind_str(kind: JobKind) -> &'static str {
    match kind {
        JobKind::SingleComplex => "SINGLE_COMPLEX",
        JobKind::AllComplexes => "ALL_COMPLEXES",
        JobKind::Cleanup => "CLEANUP",
    }
}

fn parse_job_kind(raw: &str) -> Result<JobKind, StoreError> {
    match raw {
        "SINGLE_COMPLEX" => Ok(JobKind::SingleComplex),
        "ALL_COMPLEXES" => Ok(JobKind::AllComplexes),
        "CLEANUP" => Ok(JobKind::Cleanup),
        other => Err(StoreError::Corrupt(format!("job kind {other}"))),
    }
}

fn job_status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "PENDING",
        JobStatus::Running => "RUNNING",
        JobStatus::Success => "SUCCESS",
        JobStatus::Failed => "FAILED",
    }
}

fn parse_job_status(raw: &str) -> Result<JobStatus, StoreError> {
    match raw {
        "PENDING" => Ok(JobStatus::Pending),
        "RUNNING" => Ok(JobStatus::Running),
        "SUCCESS" => Ok(JobStatus::Success),
        "FAILED" => Ok(JobStatus::Failed),
        other => Err(StoreError::Corrupt(format!("job status {other}"))),
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Idempotent schema creation.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("schema ready");
        Ok(())
    }

    fn snapshot_from_row(row: &sqlx::postgres::PgRow) -> Result<ListingSnapshot, StoreError> {
        Ok(ListingSnapshot {
            complex_id: row.try_get("complex_id")?,
            article_no: row.try_get("article_no")?,
            trade_type: row.try_get("trade_type")?,
            price: row.try_get("price")?,
            area_name: row.try_get("area_name")?,
            area: row.try_get("area")?,
            floor_info: row.try_get("floor_info")?,
            direction: row.try_get("direction")?,
            building_name: row.try_get("building_name")?,
            realtor_name: row.try_get("realtor_name")?,
            is_active: row.try_get("is_active")?,
            captured_at: row.try_get("captured_at")?,
            first_seen_at: row.try_get("first_seen_at")?,
            crawl_session_id: row.try_get("crawl_session_id")?,
        })
    }

    fn change_from_row(row: &sqlx::postgres::PgRow) -> Result<ArticleChange, StoreError> {
        let change_type: String = row.try_get("change_type")?;
        Ok(ArticleChange {
            id: row.try_get("id")?,
            complex_id: row.try_get("complex_id")?,
            article_no: row.try_get("article_no")?,
            change_type: parse_change_type(&change_type)?,
            old_price: row.try_get("old_price")?,
            new_price: row.try_get("new_price")?,
            price_change_amount: row.try_get("price_change_amount")?,
            price_change_percent: row.try_get("price_change_percent")?,
            trade_type: row.try_get("trade_type")?,
            area_name: row.try_get("area_name")?,
            building_name: row.try_get("building_name")?,
            floor_info: row.try_get("floor_info")?,
            detected_at: row.try_get("detected_at")?,
            crawl_session_id: row.try_get("crawl_session_id")?,
        })
    }

    fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<CrawlJob, StoreError> {
        let kind: String = row.try_get("kind")?;
        let status: String = row.try_get("status")?;
        Ok(CrawlJob {
            job_id: row.try_get("job_id")?,
            kind: parse_job_kind(&kind)?,
            complex_id: row.try_get("complex_id")?,
            status: parse_job_status(&status)?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            articles_collected: row.try_get("articles_collected")?,
            articles_new: row.try_get("articles_new")?,
            articles_updated: row.try_get("articles_updated")?,
            articles_skipped: row.try_get("articles_skipped")?,
            error_message: row.try_get("error_message")?,
            error_traceback: row.try_get("error_traceback")?,
        })
    }

    async fn insert_snapshot_tx(
        tx: &mut Transaction<'_, Postgres>,
        snapshot: &ListingSnapshot,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO article_snapshots
                (complex_id, article_no, trade_type, price, area_name, area,
                 floor_info, direction, building_name, realtor_name,
                 is_active, captured_at, first_seen_at, crawl_session_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&snapshot.complex_id)
        .bind(&snapshot.article_no)
        .bind(&snapshot.trade_type)
        .bind(snapshot.price)
        .bind(&snapshot.area_name)
        .bind(snapshot.area)
        .bind(&snapshot.floor_info)
        .bind(&snapshot.direction)
        .bind(&snapshot.building_name)
        .bind(&snapshot.realtor_name)
        .bind(snapshot.is_active)
        .bind(snapshot.captured_at)
        .bind(snapshot.first_seen_at)
        .bind(snapshot.crawl_session_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_change_tx(
        tx: &mut Transaction<'_, Postgres>,
        change: &ArticleChange,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO article_changes
                (complex_id, article_no, change_type, old_price, new_price,
                 price_change_amount, price_change_percent, trade_type,
                 area_name, building_name, floor_info, detected_at,
                 crawl_session_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&change.complex_id)
        .bind(&change.article_no)
        .bind(change_type_str(change.change_type))
        .bind(change.old_price)
        .bind(change.new_price)
        .bind(change.price_change_amount)
        .bind(change.price_change_percent)
        .bind(&change.trade_type)
        .bind(&change.area_name)
        .bind(&change.building_name)
        .bind(&change.floor_info)
        .bind(change.detected_at)
        .bind(change.crawl_session_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TrackerStore for PgStore {
    async fn register_complex(&self, complex: &ComplexSummary) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO complexes (complex_id, name)
            VALUES ($1, $2)
            ON CONFLICT (complex_id) DO UPDATE SET name = EXCLUDED.name
            "#,
        )
        .bind(&complex.complex_id)
        .bind(&complex.name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_complex(&self, complex_id: &str) -> Result<Option<ComplexSummary>, StoreError> {
        let row = sqlx::query("SELECT complex_id, name FROM complexes WHERE complex_id = $1")
            .bind(complex_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            Ok(ComplexSummary {
                complex_id: r.try_get("complex_id")?,
                name: r.try_get("name")?,
            })
        })
        .transpose()
    }

    async fn list_complexes(&self) -> Result<Vec<ComplexSummary>, StoreError> {
        let rows = sqlx::query("SELECT complex_id, name FROM complexes ORDER BY complex_id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| {
                Ok(ComplexSummary {
                    complex_id: r.try_get("complex_id")?,
                    name: r.try_get("name")?,
                })
            })
            .collect()
    }

    async fn active_snapshots(
        &self,
        complex_id: &str,
    ) -> Result<Vec<ListingSnapshot>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM article_snapshots WHERE complex_id = $1 AND is_active",
        )
        .bind(complex_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::snapshot_from_row).collect()
    }

    async fn apply_cycle(
        &self,
        complex_id: &str,
        outcome: &DiffOutcome,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let mut deactivate: Vec<String> = outcome.superseded.clone();
        deactivate.extend(outcome.removed.iter().cloned());
        if !deactivate.is_empty() {
            sqlx::query(
                r#"
                UPDATE article_snapshots
                   SET is_active = FALSE
                 WHERE complex_id = $1
                   AND is_active
                   AND article_no = ANY($2)
                "#,
            )
            .bind(complex_id)
            .bind(&deactivate)
            .execute(&mut *tx)
            .await?;
        }

        for snapshot in &outcome.inserted {
            Self::insert_snapshot_tx(&mut tx, snapshot).await?;
        }
        for change in &outcome.changes {
            Self::insert_change_tx(&mut tx, change).await?;
        }

        tx.commit().await?;
        debug!(
            complex_id,
            inserted = outcome.inserted.len(),
            deactivated = deactivate.len(),
            changes = outcome.changes.len(),
            "cycle applied"
        );
        Ok(())
    }

    async fn snapshots_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<ListingSnapshot>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM article_snapshots WHERE crawl_session_id = $1 ORDER BY article_no",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::snapshot_from_row).collect()
    }

    async fn prune_inactive_snapshots(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM article_snapshots WHERE NOT is_active AND captured_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn recent_changes(
        &self,
        complex_id: &str,
        since: DateTime<Utc>,
        limit: Option<i64>,
    ) -> Result<Vec<ArticleChange>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM article_changes
             WHERE complex_id = $1 AND detected_at >= $2
             ORDER BY detected_at DESC, id DESC
             LIMIT $3
            "#,
        )
        .bind(complex_id)
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::change_from_row).collect()
    }

    async fn changes_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<ArticleChange>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM article_changes WHERE crawl_session_id = $1 ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::change_from_row).collect()
    }

    async fn insert_job(&self, job: &CrawlJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO crawl_jobs
                (job_id, kind, complex_id, status, started_at, finished_at,
                 articles_collected, articles_new, articles_updated,
                 articles_skipped, error_message, error_traceback)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(job.job_id)
        .bind(job_kind_str(job.kind))
        .bind(&job.complex_id)
        .bind(job_status_str(job.status))
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.articles_collected)
        .bind(job.articles_new)
        .bind(job.articles_updated)
        .bind(job.articles_skipped)
        .bind(&job.error_message)
        .bind(&job.error_traceback)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job(&self, job: &CrawlJob) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_jobs
               SET status = $2,
                   started_at = $3,
                   finished_at = $4,
                   articles_collected = $5,
                   articles_new = $6,
                   articles_updated = $7,
                   articles_skipped = $8,
                   error_message = $9,
                   error_traceback = $10
             WHERE job_id = $1
               AND status IN ('PENDING', 'RUNNING')
            "#,
        )
        .bind(job.job_id)
        .bind(job_status_str(job.status))
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.articles_collected)
        .bind(job.articles_new)
        .bind(job.articles_updated)
        .bind(job.articles_skipped)
        .bind(&job.error_message)
        .bind(&job.error_traceback)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_job(job.job_id).await? {
                Some(_) => Err(StoreError::JobFinished(job.job_id)),
                None => Err(StoreError::JobNotFound(job.job_id)),
            };
        }
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<CrawlJob>, StoreError> {
        let row = sqlx::query("SELECT * FROM crawl_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "DELETE FROM crawl_jobs WHERE job_id = $1 AND status IN ('SUCCESS', 'FAILED')",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return match self.get_job(job_id).await? {
                Some(_) => Err(StoreError::JobNotTerminal(job_id)),
                None => Err(StoreError::JobNotFound(job_id)),
            };
        }
        Ok(())
    }

    async fn sweep_stale_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_jobs
               SET status = 'FAILED',
                   finished_at = NOW(),
                   error_message = 'stale job reconciled: process died mid-crawl'
             WHERE status = 'RUNNING'
               AND started_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemInner {
    complexes: BTreeMap<String, ComplexSummary>,
    snapshots: Vec<ListingSnapshot>,
    changes: Vec<ArticleChange>,
    jobs: BTreeMap<Uuid, CrawlJob>,
    next_change_id: i64,
}

/// Mutex-guarded store used by tests and database-less development. Applies
/// the same state-machine guards as the Postgres implementation.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TrackerStore for MemStore {
    async fn register_complex(&self, complex: &ComplexSummary) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .complexes
            .insert(complex.complex_id.clone(), complex.clone());
        Ok(())
    }

    async fn get_complex(&self, complex_id: &str) -> Result<Option<ComplexSummary>, StoreError> {
        Ok(self.inner.lock().await.complexes.get(complex_id).cloned())
    }

    async fn list_complexes(&self) -> Result<Vec<ComplexSummary>, StoreError> {
        Ok(self.inner.lock().await.complexes.values().cloned().collect())
    }

    async fn active_snapshots(
        &self,
        complex_id: &str,
    ) -> Result<Vec<ListingSnapshot>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .snapshots
            .iter()
            .filter(|s| s.complex_id == complex_id && s.is_active)
            .cloned()
            .collect())
    }

    async fn apply_cycle(
        &self,
        complex_id: &str,
        outcome: &DiffOutcome,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for snapshot in inner.snapshots.iter_mut() {
            if snapshot.complex_id == complex_id
                && snapshot.is_active
                && (outcome.superseded.contains(&snapshot.article_no)
                    || outcome.removed.contains(&snapshot.article_no))
            {
                snapshot.is_active = false;
            }
        }
        inner.snapshots.extend(outcome.inserted.iter().cloned());
        for change in &outcome.changes {
            inner.next_change_id += 1;
            let mut change = change.clone();
            change.id = Some(inner.next_change_id);
            inner.changes.push(change);
        }
        Ok(())
    }

    async fn snapshots_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<ListingSnapshot>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .snapshots
            .iter()
            .filter(|s| s.crawl_session_id == session_id)
            .cloned()
            .collect())
    }

    async fn prune_inactive_snapshots(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.snapshots.len();
        inner
            .snapshots
            .retain(|s| s.is_active || s.captured_at >= cutoff);
        Ok((before - inner.snapshots.len()) as u64)
    }

    async fn recent_changes(
        &self,
        complex_id: &str,
        since: DateTime<Utc>,
        limit: Option<i64>,
    ) -> Result<Vec<ArticleChange>, StoreError> {
        let inner = self.inner.lock().await;
        let mut out: Vec<ArticleChange> = inner
            .changes
            .iter()
            .filter(|c| c.complex_id == complex_id && c.detected_at >= since)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.detected_at
                .cmp(&a.detected_at)
                .then(b.id.cmp(&a.id))
        });
        if let Some(limit) = limit {
            out.truncate(limit.max(0) as usize);
        }
        Ok(out)
    }

    async fn changes_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<ArticleChange>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .changes
            .iter()
            .filter(|c| c.crawl_session_id == session_id)
            .cloned()
            .collect())
    }

    async fn insert_job(&self, job: &CrawlJob) -> Result<(), StoreError> {
        self.inner.lock().await.jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &CrawlJob) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(&job.job_id) {
            None => Err(StoreError::JobNotFound(job.job_id)),
            Some(existing) if existing.status.is_terminal() => {
                Err(StoreError::JobFinished(job.job_id))
            }
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
        }
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<CrawlJob>, StoreError> {
        Ok(self.inner.lock().await.jobs.get(&job_id).cloned())
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get(&job_id) {
            None => Err(StoreError::JobNotFound(job_id)),
            Some(job) if !job.status.is_terminal() => Err(StoreError::JobNotTerminal(job_id)),
            Some(_) => {
                inner.jobs.remove(&job_id);
                Ok(())
            }
        }
    }

    async fn sweep_stale_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut swept = 0u64;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Running && job.started_at < cutoff {
                job.status = JobStatus::Failed;
                job.finished_at = Some(now);
                job.error_message =
                    Some("stale job reconciled: process died mid-crawl".to_string());
                swept += 1;
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aptwatch_core::RawListing;
    use chrono::{Duration, TimeZone};

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 29, hour, 0, 0).single().unwrap()
    }

    fn raw(article_no: &str, price: i64) -> RawListing {
        RawListing {
            article_no: Some(article_no.to_string()),
            trade_type: Some("매매".to_string()),
            price: Some(price),
            area_name: Some("84A".to_string()),
            area: Some(84.9),
            floor_info: Some("12/25".to_string()),
            direction: Some("남향".to_string()),
            building_name: Some("101동".to_string()),
            realtor_name: None,
        }
    }

    async fn run_cycle(
        store: &MemStore,
        complex_id: &str,
        scraped: &[RawListing],
        captured_at: DateTime<Utc>,
    ) -> Uuid {
        let session = Uuid::new_v4();
        let previous = store.active_snapshots(complex_id).await.unwrap();
        let outcome = aptwatch_diff::diff(complex_id, &previous, scraped, captured_at, session);
        store.apply_cycle(complex_id, &outcome).await.unwrap();
        session
    }

    #[tokio::test]
    async fn at_most_one_active_row_per_listing_across_cycles() {
        let store = MemStore::new();
        run_cycle(&store, "1482", &[raw("A1", 50_000)], ts(6)).await;
        run_cycle(&store, "1482", &[raw("A1", 55_000)], ts(7)).await;
        run_cycle(&store, "1482", &[raw("A1", 53_000)], ts(8)).await;

        let inner = store.inner.lock().await;
        let active: Vec<_> = inner
            .snapshots
            .iter()
            .filter(|s| s.article_no == "A1" && s.is_active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].price, Some(53_000));
        // Superseded rows are retained, not deleted.
        assert_eq!(inner.snapshots.iter().filter(|s| s.article_no == "A1").count(), 3);
    }

    #[tokio::test]
    async fn recent_changes_respects_window_and_limit() {
        let store = MemStore::new();
        run_cycle(&store, "1482", &[raw("A1", 50_000)], ts(1)).await;
        run_cycle(&store, "1482", &[raw("A1", 51_000)], ts(5)).await;
        run_cycle(&store, "1482", &[raw("A1", 52_000)], ts(9)).await;

        let windowed = store.recent_changes("1482", ts(4), None).await.unwrap();
        assert_eq!(windowed.len(), 2);
        // Newest first.
        assert_eq!(windowed[0].new_price, Some(52_000));

        let limited = store.recent_changes("1482", ts(0), Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].new_price, Some(52_000));
    }

    #[tokio::test]
    async fn summary_picks_largest_percent_then_most_recent() {
        let store = MemStore::new();
        run_cycle(&store, "1482", &[raw("A1", 50_000), raw("A2", 10_000)], ts(1)).await;
        // A1: +2% at 05:00, A2: -10% at 06:00.
        run_cycle(&store, "1482", &[raw("A1", 51_000), raw("A2", 10_000)], ts(5)).await;
        run_cycle(&store, "1482", &[raw("A1", 51_000), raw("A2", 9_000)], ts(6)).await;

        let changes = store.recent_changes("1482", ts(0), None).await.unwrap();
        let summary = summarize_changes(&changes);
        assert_eq!(summary.new, 2);
        assert_eq!(summary.price_up, 1);
        assert_eq!(summary.price_down, 1);
        assert_eq!(summary.total, 4);
        let top = summary.most_significant_change.unwrap();
        assert_eq!(top.article_no, "A2");
        assert_eq!(top.price_change_percent, Some(-10.0));
    }

    #[tokio::test]
    async fn summary_breaks_percent_ties_by_recency() {
        let a = ArticleChange {
            id: Some(1),
            complex_id: "1482".into(),
            article_no: "A1".into(),
            change_type: ChangeType::PriceUp,
            old_price: Some(100),
            new_price: Some(105),
            price_change_amount: Some(5),
            price_change_percent: Some(5.0),
            trade_type: None,
            area_name: None,
            building_name: None,
            floor_info: None,
            detected_at: ts(1),
            crawl_session_id: Uuid::new_v4(),
        };
        let mut b = a.clone();
        b.id = Some(2);
        b.article_no = "A2".into();
        b.change_type = ChangeType::PriceDown;
        b.price_change_percent = Some(-5.0);
        b.detected_at = ts(2);

        let summary = summarize_changes(&[a, b]);
        assert_eq!(summary.most_significant_change.unwrap().article_no, "A2");
    }

    #[tokio::test]
    async fn job_updates_refused_after_terminal_state() {
        let store = MemStore::new();
        let mut job = CrawlJob::new(JobKind::SingleComplex, Some("1482".into()));
        store.insert_job(&job).await.unwrap();

        job.status = JobStatus::Success;
        job.finished_at = Some(Utc::now());
        store.update_job(&job).await.unwrap();

        job.status = JobStatus::Running;
        assert!(matches!(
            store.update_job(&job).await,
            Err(StoreError::JobFinished(_))
        ));
    }

    #[tokio::test]
    async fn running_jobs_cannot_be_deleted() {
        let store = MemStore::new();
        let mut job = CrawlJob::new(JobKind::SingleComplex, Some("1482".into()));
        job.status = JobStatus::Running;
        store.insert_job(&job).await.unwrap();

        assert!(matches!(
            store.delete_job(job.job_id).await,
            Err(StoreError::JobNotTerminal(_))
        ));

        let mut done = job.clone();
        done.status = JobStatus::Failed;
        store.update_job(&done).await.unwrap();
        store.delete_job(job.job_id).await.unwrap();
        assert!(store.get_job(job.job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_sweep_fails_only_old_running_jobs() {
        let store = MemStore::new();
        let mut stale = CrawlJob::new(JobKind::SingleComplex, Some("1".into()));
        stale.status = JobStatus::Running;
        stale.started_at = Utc::now() - Duration::minutes(30);
        let mut fresh = CrawlJob::new(JobKind::SingleComplex, Some("2".into()));
        fresh.status = JobStatus::Running;
        store.insert_job(&stale).await.unwrap();
        store.insert_job(&fresh).await.unwrap();

        let swept = store
            .sweep_stale_jobs(Utc::now() - Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(swept, 1);
        let reconciled = store.get_job(stale.job_id).await.unwrap().unwrap();
        assert_eq!(reconciled.status, JobStatus::Failed);
        assert!(reconciled.error_message.unwrap().contains("stale"));
        let untouched = store.get_job(fresh.job_id).await.unwrap().unwrap();
        assert_eq!(untouched.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn retention_prunes_only_old_inactive_rows() {
        let store = MemStore::new();
        run_cycle(&store, "1482", &[raw("A1", 50_000)], ts(1)).await;
        run_cycle(&store, "1482", &[raw("A1", 55_000)], ts(2)).await;

        // Cutoff after both cycles: the superseded row goes, the active stays.
        let pruned = store
            .prune_inactive_snapshots(ts(3))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        let inner = store.inner.lock().await;
        assert_eq!(inner.snapshots.len(), 1);
        assert!(inner.snapshots[0].is_active);
    }
}
