//! Crawl orchestration: the per-complex crawl lock, the crawl job manager,
//! the editable schedule store with its tick loop, and maintenance sweeps.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use aptwatch_core::{
    ArticleChange, ComplexSummary, CrawlJob, JobKind, JobStatus, ListingSnapshot, ScheduleEntry,
    ScheduledTask,
};
use aptwatch_source::ScrapeSource;
use aptwatch_store::{StoreError, TrackerStore};
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "aptwatch-pipeline";

const ALL_COMPLEXES_LOCK: &str = "__all_complexes__";

fn complex_lock_key(complex_id: &str) -> String {
    format!("complex:{complex_id}")
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub portal_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub bind_port: u16,
    pub schedule_file: PathBuf,
    /// Upper bound on one crawl cycle; must stay below the UI's 5-minute
    /// polling ceiling.
    pub crawl_timeout_secs: u64,
    /// Lock TTL guards against a crashed holder. Single crawls keep it
    /// above the crawl timeout; batch crawls re-arm it between complexes.
    pub lock_ttl_secs: u64,
    pub tick_interval_secs: u64,
    pub complex_delay_secs: u64,
    pub snapshot_retention_days: i64,
    pub stale_grace_secs: i64,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            portal_base_url: std::env::var("APTWATCH_PORTAL_URL")
                .unwrap_or_else(|_| "https://new.land.naver.com".to_string()),
            user_agent: std::env::var("APTWATCH_USER_AGENT")
                .unwrap_or_else(|_| "aptwatch-bot/0.1".to_string()),
            http_timeout_secs: env_parsed("APTWATCH_HTTP_TIMEOUT_SECS", 20),
            bind_port: env_parsed("APTWATCH_WEB_PORT", 8000),
            schedule_file: std::env::var("APTWATCH_SCHEDULE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./schedules.json")),
            crawl_timeout_secs: env_parsed("APTWATCH_CRAWL_TIMEOUT_SECS", 240),
            lock_ttl_secs: env_parsed("APTWATCH_LOCK_TTL_SECS", 300),
            tick_interval_secs: env_parsed("APTWATCH_TICK_INTERVAL_SECS", 30),
            complex_delay_secs: env_parsed("APTWATCH_COMPLEX_DELAY_SECS", 5),
            snapshot_retention_days: env_parsed("APTWATCH_SNAPSHOT_RETENTION_DAYS", 30),
            stale_grace_secs: env_parsed("APTWATCH_STALE_GRACE_SECS", 600),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            crawl_timeout: Duration::from_secs(self.crawl_timeout_secs),
            lock_ttl: Duration::from_secs(self.lock_ttl_secs),
            complex_delay: Duration::from_secs(self.complex_delay_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Crawl lock
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    Acquired,
    /// The key is already held; carries the holder's job id so a contended
    /// trigger can return the in-flight job instead of starting a duplicate.
    Held(Uuid),
}

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    holder: Uuid,
    expires_at: Instant,
}

/// Keyed in-process lock with TTL expiry. Acquisition is a single
/// check-and-set under one mutex; an expired entry counts as free, so a
/// crashed holder cannot deadlock a complex forever.
#[derive(Default)]
pub struct CrawlLock {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl CrawlLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str, holder: Uuid, ttl: Duration) -> Acquisition {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        if let Some(entry) = entries.get(key) {
            if entry.expires_at > now {
                return Acquisition::Held(entry.holder);
            }
            warn!(key, stale_holder = %entry.holder, "expired lock reclaimed");
        }
        entries.insert(
            key.to_string(),
            LockEntry {
                holder,
                expires_at: now + ttl,
            },
        );
        Acquisition::Acquired
    }

    /// Push a held lock's expiry forward. Ignored unless `holder` still
    /// owns the key, so a stale owner cannot revive a reclaimed lock.
    pub async fn renew(&self, key: &str, holder: Uuid, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            if entry.holder == holder {
                entry.expires_at = Instant::now() + ttl;
            }
        }
    }

    /// Release only if still held by `holder`; a reclaimed-then-reacquired
    /// lock must not be released by the stale owner.
    pub async fn release(&self, key: &str, holder: Uuid) {
        let mut entries = self.entries.lock().await;
        if entries.get(key).is_some_and(|e| e.holder == holder) {
            entries.remove(key);
        }
    }

    /// Drop every key held by `holder` (force-cancel path).
    pub async fn release_holder(&self, holder: Uuid) {
        self.entries
            .lock()
            .await
            .retain(|_, entry| entry.holder != holder);
    }
}

// ---------------------------------------------------------------------------
// Crawl job manager
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("complex not registered: {0}")]
    ComplexNotFound(String),
    #[error("crawl job not found: {0}")]
    JobNotFound(Uuid),
    #[error("crawl job {0} is still running; pass force to cancel it")]
    JobRunning(Uuid),
}

#[derive(Debug, Clone, Copy)]
pub struct ManagerConfig {
    pub crawl_timeout: Duration,
    pub lock_ttl: Duration,
    pub complex_delay: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            crawl_timeout: Duration::from_secs(240),
            lock_ttl: Duration::from_secs(300),
            complex_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CycleCounts {
    collected: i64,
    new: i64,
    updated: i64,
    skipped: i64,
}

impl CycleCounts {
    fn from_outcome(collected: usize, outcome: &aptwatch_diff::DiffOutcome) -> Self {
        Self {
            collected: collected as i64,
            new: outcome
                .changes
                .iter()
                .filter(|c| c.change_type == aptwatch_core::ChangeType::New)
                .count() as i64,
            updated: outcome
                .changes
                .iter()
                .filter(|c| c.change_type.is_price_move())
                .count() as i64,
            skipped: outcome.skipped_records as i64,
        }
    }

    fn add(&mut self, other: &CycleCounts) {
        self.collected += other.collected;
        self.new += other.new;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }
}

/// Full job view for operator diagnosis: the job row plus the cycle's
/// snapshots and change records.
#[derive(Debug, Clone, Serialize)]
pub struct JobDetail {
    pub job: CrawlJob,
    pub snapshots: Vec<ListingSnapshot>,
    pub changes: Vec<ArticleChange>,
}

/// Sole writer of crawl jobs. Triggering returns a job id immediately and
/// runs the scrape -> diff -> persist cycle on a spawned task; callers poll
/// `status` for completion.
pub struct CrawlManager {
    store: Arc<dyn TrackerStore>,
    source: Arc<dyn ScrapeSource>,
    lock: CrawlLock,
    config: ManagerConfig,
    handles: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

impl CrawlManager {
    pub fn new(
        store: Arc<dyn TrackerStore>,
        source: Arc<dyn ScrapeSource>,
        config: ManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            source,
            lock: CrawlLock::new(),
            config,
            handles: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<dyn TrackerStore> {
        &self.store
    }

    /// Start a crawl for one complex. Idempotent under contention: if a
    /// crawl for this complex is already in flight, its job id is returned
    /// and no second job is created.
    pub async fn trigger(self: &Arc<Self>, complex_id: &str) -> Result<Uuid, CrawlError> {
        if self.store.get_complex(complex_id).await?.is_none() {
            return Err(CrawlError::ComplexNotFound(complex_id.to_string()));
        }

        let job = CrawlJob::new(JobKind::SingleComplex, Some(complex_id.to_string()));
        let key = complex_lock_key(complex_id);
        match self.lock.acquire(&key, job.job_id, self.config.lock_ttl).await {
            Acquisition::Held(existing) => {
                info!(complex_id, job_id = %existing, "crawl already in flight, reusing job");
                Ok(existing)
            }
            Acquisition::Acquired => {
                if let Err(err) = self.store.insert_job(&job).await {
                    self.lock.release(&key, job.job_id).await;
                    return Err(err.into());
                }
                let job_id = job.job_id;
                let manager = Arc::clone(self);
                let complex_id = complex_id.to_string();
                let handle = tokio::spawn(async move {
                    manager.run_single(job, complex_id).await;
                });
                self.handles.lock().await.insert(job_id, handle);
                Ok(job_id)
            }
        }
    }

    /// Start a batch crawl over every registered complex.
    pub async fn trigger_all(self: &Arc<Self>) -> Result<Uuid, CrawlError> {
        let job = CrawlJob::new(JobKind::AllComplexes, None);
        match self
            .lock
            .acquire(ALL_COMPLEXES_LOCK, job.job_id, self.config.lock_ttl)
            .await
        {
            Acquisition::Held(existing) => {
                info!(job_id = %existing, "batch crawl already in flight, reusing job");
                Ok(existing)
            }
            Acquisition::Acquired => {
                if let Err(err) = self.store.insert_job(&job).await {
                    self.lock.release(ALL_COMPLEXES_LOCK, job.job_id).await;
                    return Err(err.into());
                }
                let job_id = job.job_id;
                let manager = Arc::clone(self);
                let handle = tokio::spawn(async move {
                    manager.run_batch(job).await;
                });
                self.handles.lock().await.insert(job_id, handle);
                Ok(job_id)
            }
        }
    }

    pub async fn status(&self, job_id: Uuid) -> Result<CrawlJob, CrawlError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(CrawlError::JobNotFound(job_id))
    }

    pub async fn detail(&self, job_id: Uuid) -> Result<JobDetail, CrawlError> {
        let job = self.status(job_id).await?;
        let snapshots = self.store.snapshots_for_session(job_id).await?;
        let changes = self.store.changes_for_session(job_id).await?;
        Ok(JobDetail {
            job,
            snapshots,
            changes,
        })
    }

    /// Delete a finished job. A RUNNING job is refused unless `force`, which
    /// aborts the task, fails the job and releases every lock it held.
    pub async fn delete_job(&self, job_id: Uuid, force: bool) -> Result<(), CrawlError> {
        let job = self.status(job_id).await?;
        if job.status.is_terminal() {
            self.store.delete_job(job_id).await?;
            return Ok(());
        }
        if !force {
            return Err(CrawlError::JobRunning(job_id));
        }

        if let Some(handle) = self.handles.lock().await.remove(&job_id) {
            handle.abort();
        }
        let mut cancelled = job;
        cancelled.status = JobStatus::Failed;
        cancelled.finished_at = Some(Utc::now());
        cancelled.error_message = Some("force-cancelled by operator".to_string());
        if let Err(err) = self.store.update_job(&cancelled).await {
            // The task may have finished between the status check and the
            // abort; a terminal row is fine to delete either way.
            warn!(job_id = %job_id, error = %err, "force-cancel raced job completion");
        }
        self.lock.release_holder(job_id).await;
        self.store.delete_job(job_id).await?;
        Ok(())
    }

    /// Number of crawl tasks still registered. Drains to zero once every
    /// spawned job has finished and cleaned up after itself.
    pub async fn in_flight(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// Await completion of a spawned crawl (drain/shutdown and tests).
    /// Returns immediately when the job already finished.
    pub async fn wait(&self, job_id: Uuid) {
        let handle = self.handles.lock().await.remove(&job_id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run_single(self: Arc<Self>, mut job: CrawlJob, complex_id: String) {
        let key = complex_lock_key(&complex_id);
        job.status = JobStatus::Running;
        job.started_at = Utc::now();
        if let Err(err) = self.store.update_job(&job).await {
            error!(job_id = %job.job_id, error = %err, "failed to mark job running");
            self.lock.release(&key, job.job_id).await;
            self.handles.lock().await.remove(&job.job_id);
            return;
        }

        let result = timeout(
            self.config.crawl_timeout,
            self.crawl_cycle(&complex_id, job.job_id),
        )
        .await;
        match result {
            Err(_) => {
                self.finish_failed(
                    &mut job,
                    format!(
                        "crawl timed out after {}s",
                        self.config.crawl_timeout.as_secs()
                    ),
                    None,
                )
                .await;
            }
            Ok(Err(err)) => {
                self.finish_failed(&mut job, format!("{err:#}"), Some(format!("{err:?}")))
                    .await;
            }
            Ok(Ok(counts)) => {
                self.finish_success(&mut job, counts, None).await;
            }
        }

        self.lock.release(&key, job.job_id).await;
        self.handles.lock().await.remove(&job.job_id);
    }

    async fn run_batch(self: Arc<Self>, mut job: CrawlJob) {
        job.status = JobStatus::Running;
        job.started_at = Utc::now();
        if let Err(err) = self.store.update_job(&job).await {
            error!(job_id = %job.job_id, error = %err, "failed to mark batch job running");
            self.lock.release(ALL_COMPLEXES_LOCK, job.job_id).await;
            self.handles.lock().await.remove(&job.job_id);
            return;
        }

        let complexes = match self.store.list_complexes().await {
            Ok(complexes) => complexes,
            Err(err) => {
                self.finish_failed(&mut job, format!("listing complexes: {err}"), None)
                    .await;
                self.lock.release(ALL_COMPLEXES_LOCK, job.job_id).await;
                self.handles.lock().await.remove(&job.job_id);
                return;
            }
        };

        let mut totals = CycleCounts::default();
        let mut errors: Vec<String> = Vec::new();
        let mut succeeded = 0usize;
        let total = complexes.len();

        // A batch can outlive any fixed TTL, so re-arm the batch lock before
        // each complex. One iteration is bounded by the crawl timeout plus
        // the politeness delay, and the TTL margin covers the rest.
        let batch_ttl =
            self.config.crawl_timeout + self.config.complex_delay + self.config.lock_ttl;

        for (idx, ComplexSummary { complex_id, name }) in complexes.into_iter().enumerate() {
            self.lock
                .renew(ALL_COMPLEXES_LOCK, job.job_id, batch_ttl)
                .await;
            let key = complex_lock_key(&complex_id);
            match self.lock.acquire(&key, job.job_id, self.config.lock_ttl).await {
                Acquisition::Held(other) => {
                    warn!(complex_id = %complex_id, holder = %other, "skipping complex, crawl in flight");
                    errors.push(format!("{complex_id} ({name}): skipped, crawl in flight"));
                }
                Acquisition::Acquired => {
                    let result = timeout(
                        self.config.crawl_timeout,
                        self.crawl_cycle(&complex_id, job.job_id),
                    )
                    .await;
                    self.lock.release(&key, job.job_id).await;
                    match result {
                        Err(_) => errors.push(format!("{complex_id} ({name}): crawl timed out")),
                        Ok(Err(err)) => errors.push(format!("{complex_id} ({name}): {err:#}")),
                        Ok(Ok(counts)) => {
                            totals.add(&counts);
                            succeeded += 1;
                        }
                    }
                }
            }
            // Politeness delay between complexes.
            if idx + 1 < total && !self.config.complex_delay.is_zero() {
                tokio::time::sleep(self.config.complex_delay).await;
            }
        }

        let error_message = if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        };
        if total > 0 && succeeded == 0 && !errors.is_empty() {
            let message = error_message.unwrap_or_default();
            self.finish_failed(&mut job, message, None).await;
        } else {
            self.finish_success(&mut job, totals, error_message).await;
        }

        self.lock.release(ALL_COMPLEXES_LOCK, job.job_id).await;
        self.handles.lock().await.remove(&job.job_id);
    }

    /// One crawl cycle: fetch, diff against the previous active set, persist
    /// the outcome transactionally.
    async fn crawl_cycle(
        &self,
        complex_id: &str,
        session_id: Uuid,
    ) -> anyhow::Result<CycleCounts> {
        let listings = self
            .source
            .fetch_listings(complex_id)
            .await
            .with_context(|| format!("fetching listings for complex {complex_id}"))?;
        let previous = self.store.active_snapshots(complex_id).await?;
        let captured_at = Utc::now();
        let outcome =
            aptwatch_diff::diff(complex_id, &previous, &listings, captured_at, session_id);
        self.store
            .apply_cycle(complex_id, &outcome)
            .await
            .with_context(|| format!("persisting cycle for complex {complex_id}"))?;

        let counts = CycleCounts::from_outcome(listings.len(), &outcome);
        info!(
            complex_id,
            collected = counts.collected,
            new = counts.new,
            updated = counts.updated,
            removed = outcome.removed.len(),
            skipped = counts.skipped,
            "crawl cycle complete"
        );
        Ok(counts)
    }

    async fn finish_success(
        &self,
        job: &mut CrawlJob,
        counts: CycleCounts,
        error_message: Option<String>,
    ) {
        job.status = JobStatus::Success;
        job.finished_at = Some(Utc::now());
        job.articles_collected = counts.collected;
        job.articles_new = counts.new;
        job.articles_updated = counts.updated;
        job.articles_skipped = counts.skipped;
        job.error_message = error_message;
        if let Err(err) = self.store.update_job(job).await {
            error!(job_id = %job.job_id, error = %err, "failed to record job success");
        }
    }

    async fn finish_failed(&self, job: &mut CrawlJob, message: String, traceback: Option<String>) {
        warn!(job_id = %job.job_id, message = %message, "crawl job failed");
        job.status = JobStatus::Failed;
        job.finished_at = Some(Utc::now());
        job.error_message = Some(message);
        job.error_traceback = traceback;
        if let Err(err) = self.store.update_job(job).await {
            error!(job_id = %job.job_id, error = %err, "failed to record job failure");
        }
    }
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MaintenanceReport {
    pub snapshots_pruned: u64,
    pub jobs_swept: u64,
}

/// Retention plus reconciliation, recorded as a CLEANUP job: delete inactive
/// snapshots past the retention window and fail jobs stuck in RUNNING past
/// the grace period. Runs outside any crawl's transactional path.
pub async fn run_maintenance(
    store: &dyn TrackerStore,
    retention_days: i64,
    stale_grace_secs: i64,
) -> Result<MaintenanceReport, StoreError> {
    let mut job = CrawlJob::new(JobKind::Cleanup, None);
    job.status = JobStatus::Running;
    store.insert_job(&job).await?;

    let now = Utc::now();
    let result = async {
        let pruned = store
            .prune_inactive_snapshots(now - chrono::Duration::days(retention_days))
            .await?;
        let swept = store
            .sweep_stale_jobs(now - chrono::Duration::seconds(stale_grace_secs))
            .await?;
        Ok::<_, StoreError>(MaintenanceReport {
            snapshots_pruned: pruned,
            jobs_swept: swept,
        })
    }
    .await;

    job.finished_at = Some(Utc::now());
    match result {
        Ok(report) => {
            job.status = JobStatus::Success;
            store.update_job(&job).await?;
            info!(
                pruned = report.snapshots_pruned,
                swept = report.jobs_swept,
                "maintenance complete"
            );
            Ok(report)
        }
        Err(err) => {
            job.status = JobStatus::Failed;
            job.error_message = Some(err.to_string());
            store.update_job(&job).await?;
            Err(err)
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule store
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("schedule '{0}' already exists")]
    Duplicate(String),
    #[error("schedule '{0}' not found")]
    NotFound(String),
    #[error("invalid schedule: {0}")]
    Invalid(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Partial update for an existing entry; absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulePatch {
    pub task: Option<ScheduledTask>,
    pub hour: Option<u32>,
    pub minute: Option<u32>,
    pub day_of_week: Option<aptwatch_core::DayRule>,
    pub enabled: Option<bool>,
    pub description: Option<String>,
}

fn validate_entry(entry: &ScheduleEntry) -> Result<(), ScheduleError> {
    if entry.name.trim().is_empty() {
        return Err(ScheduleError::Invalid("name must not be empty".into()));
    }
    if entry.hour > 23 {
        return Err(ScheduleError::Invalid(format!("hour out of range: {}", entry.hour)));
    }
    if entry.minute > 59 {
        return Err(ScheduleError::Invalid(format!(
            "minute out of range: {}",
            entry.minute
        )));
    }
    Ok(())
}

/// JSON-file-backed schedule definitions, shared between the editing API and
/// the tick loop. Edits take effect on the next tick; no restart needed.
pub struct ScheduleStore {
    path: PathBuf,
    entries: tokio::sync::RwLock<BTreeMap<String, ScheduleEntry>>,
}

impl ScheduleStore {
    /// Load from disk; a missing file starts an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ScheduleError> {
        let path = path.into();
        let entries = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let list: Vec<ScheduleEntry> = serde_json::from_str(&text)?;
            list.into_iter().map(|e| (e.name.clone(), e)).collect()
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            entries: tokio::sync::RwLock::new(entries),
        })
    }

    fn persist(&self, entries: &BTreeMap<String, ScheduleEntry>) -> Result<(), ScheduleError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let list: Vec<&ScheduleEntry> = entries.values().collect();
        std::fs::write(&self.path, serde_json::to_vec_pretty(&list)?)?;
        Ok(())
    }

    pub async fn create(&self, entry: ScheduleEntry) -> Result<(), ScheduleError> {
        validate_entry(&entry)?;
        let mut entries = self.entries.write().await;
        if entries.contains_key(&entry.name) {
            return Err(ScheduleError::Duplicate(entry.name));
        }
        entries.insert(entry.name.clone(), entry);
        self.persist(&entries)
    }

    pub async fn update(
        &self,
        name: &str,
        patch: SchedulePatch,
    ) -> Result<ScheduleEntry, ScheduleError> {
        let mut entries = self.entries.write().await;
        let current = entries
            .get(name)
            .cloned()
            .ok_or_else(|| ScheduleError::NotFound(name.to_string()))?;
        let updated = ScheduleEntry {
            name: current.name,
            task: patch.task.unwrap_or(current.task),
            hour: patch.hour.unwrap_or(current.hour),
            minute: patch.minute.unwrap_or(current.minute),
            day_of_week: patch.day_of_week.unwrap_or(current.day_of_week),
            enabled: patch.enabled.unwrap_or(current.enabled),
            description: patch.description.or(current.description),
        };
        validate_entry(&updated)?;
        entries.insert(name.to_string(), updated.clone());
        self.persist(&entries)?;
        Ok(updated)
    }

    pub async fn delete(&self, name: &str) -> Result<(), ScheduleError> {
        let mut entries = self.entries.write().await;
        if entries.remove(name).is_none() {
            return Err(ScheduleError::NotFound(name.to_string()));
        }
        self.persist(&entries)
    }

    /// Atomic snapshot of every entry; the tick loop iterates this snapshot,
    /// never the live map.
    pub async fn list(&self) -> Vec<ScheduleEntry> {
        self.entries.read().await.values().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Tick loop
// ---------------------------------------------------------------------------

fn truncate_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// Whether an entry should fire at `now`, given when it last fired. Firing
/// is debounced to once per matching minute even when ticks are shorter
/// than 60 seconds.
pub fn is_due(entry: &ScheduleEntry, now: DateTime<Utc>, last_fired: Option<DateTime<Utc>>) -> bool {
    if !entry.enabled {
        return false;
    }
    if now.hour() != entry.hour || now.minute() != entry.minute {
        return false;
    }
    if !entry.day_of_week.matches(now.date_naive()) {
        return false;
    }
    match last_fired {
        Some(last) => truncate_to_minute(last) != truncate_to_minute(now),
        None => true,
    }
}

/// Evaluates the schedule snapshot on a fixed interval and fires matching
/// entries through the crawl manager.
pub struct Ticker {
    schedules: Arc<ScheduleStore>,
    manager: Arc<CrawlManager>,
    retention_days: i64,
    stale_grace_secs: i64,
    interval: Duration,
    last_fired: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Ticker {
    pub fn new(
        schedules: Arc<ScheduleStore>,
        manager: Arc<CrawlManager>,
        config: &PipelineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            schedules,
            manager,
            retention_days: config.snapshot_retention_days,
            stale_grace_secs: config.stale_grace_secs,
            interval: Duration::from_secs(config.tick_interval_secs.max(1)),
            last_fired: Mutex::new(HashMap::new()),
        })
    }

    pub async fn run(self: Arc<Self>) {
        info!(interval_secs = self.interval.as_secs(), "scheduler tick loop started");
        loop {
            self.tick(Utc::now()).await;
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One evaluation pass. Returns the names that fired.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<String> {
        let snapshot = self.schedules.list().await;
        let mut fired = Vec::new();
        for entry in snapshot {
            let last = self.last_fired.lock().await.get(&entry.name).copied();
            if !is_due(&entry, now, last) {
                continue;
            }
            self.last_fired.lock().await.insert(entry.name.clone(), now);
            info!(name = %entry.name, task = ?entry.task, "schedule fired");
            match entry.task {
                ScheduledTask::CrawlAllComplexes => {
                    if let Err(err) = self.manager.trigger_all().await {
                        error!(name = %entry.name, error = %err, "scheduled batch crawl failed to start");
                    }
                }
                ScheduledTask::CleanupSnapshots => {
                    if let Err(err) = run_maintenance(
                        self.manager.store().as_ref(),
                        self.retention_days,
                        self.stale_grace_secs,
                    )
                    .await
                    {
                        error!(name = %entry.name, error = %err, "scheduled maintenance failed");
                    }
                }
            }
            fired.push(entry.name);
        }
        fired
    }
}
