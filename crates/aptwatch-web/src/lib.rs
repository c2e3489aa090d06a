//! Axum JSON API over the crawl pipeline: complex registry, article and
//! change queries, crawl triggering/monitoring, and schedule editing.

use std::sync::Arc;

use aptwatch_core::{ComplexSummary, CrawlJob, JobStatus, ScheduleEntry};
use aptwatch_pipeline::{CrawlError, CrawlManager, ScheduleError, SchedulePatch, ScheduleStore};
use aptwatch_store::summarize_changes;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "aptwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<CrawlManager>,
    pub schedules: Arc<ScheduleStore>,
}

impl AppState {
    pub fn new(manager: Arc<CrawlManager>, schedules: Arc<ScheduleStore>) -> Self {
        Self { manager, schedules }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/complexes", get(list_complexes_handler).post(register_complex_handler))
        .route("/api/complexes/{complex_id}/articles", get(articles_handler))
        .route("/api/complexes/{complex_id}/changes", get(changes_handler))
        .route("/api/crawl/{complex_id}", post(trigger_handler))
        .route("/api/crawl-all", post(trigger_all_handler))
        .route("/api/crawl/jobs/{job_id}", get(job_status_handler).delete(job_delete_handler))
        .route("/api/crawl/jobs/{job_id}/detail", get(job_detail_handler))
        .route("/api/schedules", get(list_schedules_handler).post(create_schedule_handler))
        .route(
            "/api/schedules/{name}",
            delete(delete_schedule_handler).patch(update_schedule_handler),
        )
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web API listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

fn crawl_error(err: CrawlError) -> Response {
    match err {
        CrawlError::ComplexNotFound(_) | CrawlError::JobNotFound(_) => {
            error_body(StatusCode::NOT_FOUND, err.to_string())
        }
        CrawlError::JobRunning(_) => error_body(StatusCode::CONFLICT, err.to_string()),
        CrawlError::Store(_) => error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn schedule_error(err: ScheduleError) -> Response {
    match err {
        ScheduleError::Duplicate(_) => error_body(StatusCode::CONFLICT, err.to_string()),
        ScheduleError::NotFound(_) => error_body(StatusCode::NOT_FOUND, err.to_string()),
        ScheduleError::Invalid(_) => error_body(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
        ScheduleError::Io(_) | ScheduleError::Json(_) => {
            error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn store_error(err: aptwatch_store::StoreError) -> Response {
    error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// Complexes
// ---------------------------------------------------------------------------

async fn list_complexes_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.manager.store().list_complexes().await {
        Ok(complexes) => Json(complexes).into_response(),
        Err(err) => store_error(err),
    }
}

async fn register_complex_handler(
    State(state): State<Arc<AppState>>,
    Json(complex): Json<ComplexSummary>,
) -> Response {
    if complex.complex_id.trim().is_empty() {
        return error_body(StatusCode::UNPROCESSABLE_ENTITY, "complex_id must not be empty");
    }
    match state.manager.store().register_complex(&complex).await {
        Ok(()) => (StatusCode::CREATED, Json(complex)).into_response(),
        Err(err) => store_error(err),
    }
}

async fn articles_handler(
    State(state): State<Arc<AppState>>,
    Path(complex_id): Path<String>,
) -> Response {
    match state.manager.store().active_snapshots(&complex_id).await {
        Ok(snapshots) => Json(snapshots).into_response(),
        Err(err) => store_error(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct ChangesQuery {
    hours: Option<i64>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ChangesResponse {
    complex_id: String,
    since: DateTime<Utc>,
    summary: aptwatch_store::ChangeSummary,
    changes: Vec<aptwatch_core::ArticleChange>,
}

async fn changes_handler(
    State(state): State<Arc<AppState>>,
    Path(complex_id): Path<String>,
    Query(query): Query<ChangesQuery>,
) -> Response {
    let hours = query.hours.unwrap_or(24).clamp(1, 24 * 90);
    let since = Utc::now() - chrono::Duration::hours(hours);
    // Summarize the whole window before applying the list limit, so a
    // truncated page still reports the window's full counts.
    match state
        .manager
        .store()
        .recent_changes(&complex_id, since, None)
        .await
    {
        Ok(mut changes) => {
            let summary = summarize_changes(&changes);
            if let Some(limit) = query.limit {
                changes.truncate(limit.max(0) as usize);
            }
            Json(ChangesResponse {
                complex_id,
                since,
                summary,
                changes,
            })
            .into_response()
        }
        Err(err) => store_error(err),
    }
}

// ---------------------------------------------------------------------------
// Crawl jobs
// ---------------------------------------------------------------------------

/// Status view: safe summary only. The traceback is deliberately absent
/// here and exposed on the detail route instead.
#[derive(Debug, Serialize)]
struct JobStatusView {
    job_id: Uuid,
    job_type: aptwatch_core::JobKind,
    complex_id: Option<String>,
    status: JobStatus,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    duration_seconds: Option<f64>,
    articles_collected: i64,
    articles_new: i64,
    articles_updated: i64,
    articles_skipped: i64,
    error_message: Option<String>,
}

impl From<CrawlJob> for JobStatusView {
    fn from(job: CrawlJob) -> Self {
        Self {
            duration_seconds: job.duration_seconds(),
            job_id: job.job_id,
            job_type: job.kind,
            complex_id: job.complex_id,
            status: job.status,
            started_at: job.started_at,
            finished_at: job.finished_at,
            articles_collected: job.articles_collected,
            articles_new: job.articles_new,
            articles_updated: job.articles_updated,
            articles_skipped: job.articles_skipped,
            error_message: job.error_message,
        }
    }
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    job_id: Uuid,
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    Path(complex_id): Path<String>,
) -> Response {
    match state.manager.trigger(&complex_id).await {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(TriggerResponse { job_id })).into_response(),
        Err(err) => crawl_error(err),
    }
}

async fn trigger_all_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.manager.trigger_all().await {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(TriggerResponse { job_id })).into_response(),
        Err(err) => crawl_error(err),
    }
}

async fn job_status_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Response {
    match state.manager.status(job_id).await {
        Ok(job) => Json(JobStatusView::from(job)).into_response(),
        Err(err) => crawl_error(err),
    }
}

async fn job_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Response {
    match state.manager.detail(job_id).await {
        Ok(detail) => Json(detail).into_response(),
        Err(err) => crawl_error(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct DeleteJobQuery {
    #[serde(default)]
    force: bool,
}

async fn job_delete_handler(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
    Query(query): Query<DeleteJobQuery>,
) -> Response {
    match state.manager.delete_job(job_id, query.force).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => crawl_error(err),
    }
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

async fn list_schedules_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.schedules.list().await).into_response()
}

async fn create_schedule_handler(
    State(state): State<Arc<AppState>>,
    Json(entry): Json<ScheduleEntry>,
) -> Response {
    match state.schedules.create(entry.clone()).await {
        Ok(()) => (StatusCode::CREATED, Json(entry)).into_response(),
        Err(err) => schedule_error(err),
    }
}

async fn update_schedule_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(patch): Json<SchedulePatch>,
) -> Response {
    match state.schedules.update(&name, patch).await {
        Ok(updated) => Json(updated).into_response(),
        Err(err) => schedule_error(err),
    }
}

async fn delete_schedule_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.schedules.delete(&name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => schedule_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aptwatch_core::RawListing;
    use aptwatch_pipeline::ManagerConfig;
    use aptwatch_source::StaticSource;
    use aptwatch_store::{MemStore, TrackerStore};
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

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

    async fn test_state(dir: &tempfile::TempDir) -> AppState {
        let store = Arc::new(MemStore::new());
        store
            .register_complex(&ComplexSummary {
                complex_id: "1482".into(),
                name: "리버뷰자이".into(),
            })
            .await
            .unwrap();
        let source =
            StaticSource::new().with_complex("1482", vec![raw("A1", 50_000), raw("A2", 30_000)]);
        let manager = CrawlManager::new(
            store,
            Arc::new(source),
            ManagerConfig {
                crawl_timeout: Duration::from_secs(5),
                lock_ttl: Duration::from_secs(5),
                complex_delay: Duration::ZERO,
            },
        );
        let schedules =
            Arc::new(ScheduleStore::load(dir.path().join("schedules.json")).unwrap());
        AppState::new(manager, schedules)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_and_complex_registry() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let app = app(state);

        let health = app.clone().oneshot(get_request("/health")).await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let created = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/complexes",
                serde_json::json!({ "complex_id": "7777", "name": "한강타워" }),
            ))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);

        let list = app.oneshot(get_request("/api/complexes")).await.unwrap();
        assert_eq!(list.status(), StatusCode::OK);
        let body = body_json(list).await;
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn crawl_round_trip_exposes_status_articles_and_changes() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let manager = state.manager.clone();
        let app = app(state);

        let trigger = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/crawl/1482")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(trigger.status(), StatusCode::ACCEPTED);
        let job_id: Uuid =
            serde_json::from_value(body_json(trigger).await["job_id"].clone()).unwrap();
        manager.wait(job_id).await;

        let status = app
            .clone()
            .oneshot(get_request(&format!("/api/crawl/jobs/{job_id}")))
            .await
            .unwrap();
        assert_eq!(status.status(), StatusCode::OK);
        let status_body = body_json(status).await;
        assert_eq!(status_body["status"], "SUCCESS");
        assert_eq!(status_body["articles_collected"], 2);
        // Traceback is a detail-only field.
        assert!(status_body.get("error_traceback").is_none());

        let detail = app
            .clone()
            .oneshot(get_request(&format!("/api/crawl/jobs/{job_id}/detail")))
            .await
            .unwrap();
        assert_eq!(detail.status(), StatusCode::OK);
        let detail_body = body_json(detail).await;
        assert_eq!(detail_body["snapshots"].as_array().unwrap().len(), 2);
        assert_eq!(detail_body["changes"].as_array().unwrap().len(), 2);

        let articles = app
            .clone()
            .oneshot(get_request("/api/complexes/1482/articles"))
            .await
            .unwrap();
        assert_eq!(body_json(articles).await.as_array().unwrap().len(), 2);

        let changes = app
            .oneshot(get_request("/api/complexes/1482/changes?hours=24"))
            .await
            .unwrap();
        let changes_body = body_json(changes).await;
        assert_eq!(changes_body["summary"]["new"], 2);
        assert_eq!(changes_body["summary"]["total"], 2);
    }

    #[tokio::test]
    async fn limited_change_list_keeps_the_full_window_summary() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let manager = state.manager.clone();
        let app = app(state);

        let job_id = manager.trigger("1482").await.unwrap();
        manager.wait(job_id).await;

        let changes = app
            .oneshot(get_request("/api/complexes/1482/changes?hours=24&limit=1"))
            .await
            .unwrap();
        let body = body_json(changes).await;
        // The limit pages the list; the summary still covers the window.
        assert_eq!(body["changes"].as_array().unwrap().len(), 1);
        assert_eq!(body["summary"]["total"], 2);
        assert_eq!(body["summary"]["new"], 2);
    }

    #[tokio::test]
    async fn unknown_complex_and_job_return_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(test_state(&dir).await);

        let trigger = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/crawl/9999")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(trigger.status(), StatusCode::NOT_FOUND);

        let missing = app
            .oneshot(get_request(&format!("/api/crawl/jobs/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn schedule_crud_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(test_state(&dir).await);

        let entry = serde_json::json!({
            "name": "nightly",
            "task": "crawl_all_complexes",
            "hour": 6,
            "minute": 0,
            "day_of_week": "*",
            "enabled": true
        });
        let created = app
            .clone()
            .oneshot(json_request("POST", "/api/schedules", entry.clone()))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);

        let duplicate = app
            .clone()
            .oneshot(json_request("POST", "/api/schedules", entry))
            .await
            .unwrap();
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        let patched = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                "/api/schedules/nightly",
                serde_json::json!({ "minute": 30, "enabled": false }),
            ))
            .await
            .unwrap();
        assert_eq!(patched.status(), StatusCode::OK);
        let patched_body = body_json(patched).await;
        assert_eq!(patched_body["minute"], 30);
        assert_eq!(patched_body["enabled"], false);

        let invalid = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                "/api/schedules/nightly",
                serde_json::json!({ "hour": 24 }),
            ))
            .await
            .unwrap();
        assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let deleted = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/schedules/nightly")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let listed = app.oneshot(get_request("/api/schedules")).await.unwrap();
        assert!(body_json(listed).await.as_array().unwrap().is_empty());
    }
}
