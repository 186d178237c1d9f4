//! JSON HTTP API over the seatwatch store and ingest services.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, NaiveDateTime};
use seatwatch_core::{
    average_occupation_by_area, busiest_day, busiest_hours_for_area, busiest_hours_for_branch,
    daily_peaks, AreaObservation, Branch,
};
use seatwatch_sync::SyncService;
use seatwatch_upstream::{normalize, FALLBACK_PAYLOAD};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "seatwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<SyncService>,
}

impl AppState {
    pub fn new(sync: Arc<SyncService>) -> Self {
        Self { sync }
    }
}

/// An observation as served over the wire, with the derived rate attached.
#[derive(Debug, Clone, Serialize)]
pub struct ObservationView {
    pub area_id: String,
    pub branch_name: String,
    pub floor_name: String,
    pub area_name: String,
    pub free_count: u32,
    pub total_count: u32,
    pub observed_at: NaiveDateTime,
    pub occupation_rate: f64,
}

impl From<AreaObservation> for ObservationView {
    fn from(record: AreaObservation) -> Self {
        let occupation_rate = record.occupation_rate();
        Self {
            area_id: record.area_id,
            branch_name: record.branch_name,
            floor_name: record.floor_name,
            area_name: record.area_name,
            free_count: record.free_count,
            total_count: record.total_count,
            observed_at: record.observed_at,
            occupation_rate,
        }
    }
}

fn views(records: Vec<AreaObservation>) -> Vec<ObservationView> {
    records.into_iter().map(ObservationView::from).collect()
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/library/current", get(current_handler))
        .route("/api/library/by-branch", get(by_branch_handler))
        .route("/api/library/stats", get(stats_handler))
        .route("/api/library/fetch", post(fetch_handler))
        .route("/api/library/db-status", get(db_status_handler))
        .route("/api/library/test-api", get(test_api_handler))
        .route("/api/library/reset-db", post(reset_db_handler))
        .route("/api/library/history/date/{date}", get(history_by_date_handler))
        .route("/api/library/history/range", get(history_range_handler))
        .route(
            "/api/library/history/area/{area_id}/date/{date}",
            get(area_history_handler),
        )
        .route(
            "/api/library/busiest-hours/area/{area_id}/date/{date}",
            get(busiest_hours_area_handler),
        )
        .route(
            "/api/library/busiest-hours/branch/{branch}/date/{date}",
            get(busiest_hours_branch_handler),
        )
        .route(
            "/api/library/average-occupation/date/{date}",
            get(average_occupation_handler),
        )
        .route("/api/branch/all", get(branches_handler))
        .route("/api/branch/save", post(save_branch_handler))
        .route("/api/branch/update-status", post(update_branch_status_handler))
        .route("/api/branch/check-closing", post(check_closing_handler))
        .route("/api/config/library-hours", get(library_hours_handler))
        .route(
            "/api/config/scheduler",
            get(scheduler_status_handler).post(set_scheduler_handler),
        )
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web API listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message })),
    )
        .into_response()
}

fn parse_date(raw: &str) -> Result<NaiveDate, Response> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| bad_request("expected date in YYYY-MM-DD form"))
}

fn parse_datetime(raw: &str) -> Result<NaiveDateTime, Response> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .map_err(|_| bad_request("expected datetime in YYYY-MM-DDTHH:MM:SS form"))
}

async fn current_handler(State(state): State<AppState>) -> Response {
    match state.sync.store.latest_snapshots().await {
        Ok(records) => Json(views(records)).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn by_branch_handler(State(state): State<AppState>) -> Response {
    match state.sync.store.latest_snapshots().await {
        Ok(records) => {
            let mut grouped: BTreeMap<String, Vec<ObservationView>> = BTreeMap::new();
            for record in records {
                grouped
                    .entry(record.branch_name.clone())
                    .or_default()
                    .push(record.into());
            }
            Json(grouped).into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

#[derive(Debug, Serialize)]
struct BusiestDayView {
    date: NaiveDate,
    average_rate: f64,
    peak_rate: f64,
    peak_observed_at: NaiveDateTime,
    records: Vec<ObservationView>,
}

async fn stats_handler(State(state): State<AppState>) -> Response {
    let history = match state.sync.store.history_all().await {
        Ok(history) => history,
        Err(err) => return server_error(err.into()),
    };
    let peaks = views(daily_peaks(&history));
    let busiest = busiest_day(&history).map(|day| BusiestDayView {
        date: day.date,
        average_rate: day.average_rate,
        peak_rate: day.peak_rate,
        peak_observed_at: day.peak_observed_at,
        records: views(day.records),
    });
    Json(json!({
        "daily_peaks": peaks,
        "busiest_day": busiest,
    }))
    .into_response()
}

/// Manual trigger: runs one full ingest cycle immediately, regardless of
/// opening hours or the scheduler flag.
async fn fetch_handler(State(state): State<AppState>) -> Response {
    let now = state.sync.config.local_now();
    match state.sync.ingest.ingest_now(now).await {
        Ok(report) => Json(json!({
            "source": format!("{:?}", report.source),
            "records": views(report.records),
        }))
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn reset_db_handler(State(state): State<AppState>) -> Response {
    let now = state.sync.config.local_now();
    let seed = match normalize(FALLBACK_PAYLOAD, now) {
        Ok(seed) => seed,
        Err(err) => return server_error(err.into()),
    };
    match state.sync.store.reset_and_seed(&seed).await {
        Ok(()) => Json(json!({ "seeded": seed.len() })).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn history_by_date_handler(
    State(state): State<AppState>,
    AxumPath(date): AxumPath<String>,
) -> Response {
    let date = match parse_date(&date) {
        Ok(date) => date,
        Err(resp) => return resp,
    };
    match state.sync.store.history_on(date).await {
        Ok(records) => Json(views(records)).into_response(),
        Err(err) => server_error(err.into()),
    }
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    start: String,
    end: String,
}

async fn history_range_handler(
    State(state): State<AppState>,
    Query(range): Query<RangeQuery>,
) -> Response {
    let start = match parse_datetime(&range.start) {
        Ok(start) => start,
        Err(resp) => return resp,
    };
    let end = match parse_datetime(&range.end) {
        Ok(end) => end,
        Err(resp) => return resp,
    };
    if end < start {
        return bad_request("range end precedes start");
    }
    match state.sync.store.history_between(start, end).await {
        Ok(records) => Json(views(records)).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn area_history_handler(
    State(state): State<AppState>,
    AxumPath((area_id, date)): AxumPath<(String, String)>,
) -> Response {
    let date = match parse_date(&date) {
        Ok(date) => date,
        Err(resp) => return resp,
    };
    match state.sync.store.area_history_on(&area_id, date).await {
        Ok(records) => Json(views(records)).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn busiest_hours_area_handler(
    State(state): State<AppState>,
    AxumPath((area_id, date)): AxumPath<(String, String)>,
) -> Response {
    let date = match parse_date(&date) {
        Ok(date) => date,
        Err(resp) => return resp,
    };
    match state.sync.store.area_history(&area_id).await {
        Ok(records) => Json(busiest_hours_for_area(&records, &area_id, date)).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn busiest_hours_branch_handler(
    State(state): State<AppState>,
    AxumPath((branch, date)): AxumPath<(String, String)>,
) -> Response {
    let date = match parse_date(&date) {
        Ok(date) => date,
        Err(resp) => return resp,
    };
    match state.sync.store.history_on(date).await {
        Ok(records) => Json(busiest_hours_for_branch(&records, &branch, date)).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn average_occupation_handler(
    State(state): State<AppState>,
    AxumPath(date): AxumPath<String>,
) -> Response {
    let date = match parse_date(&date) {
        Ok(date) => date,
        Err(resp) => return resp,
    };
    match state.sync.store.history_on(date).await {
        Ok(records) => Json(average_occupation_by_area(&records, date)).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn branches_handler(State(state): State<AppState>) -> Response {
    match state.sync.store.branches().await {
        Ok(branches) => Json(branches).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn save_branch_handler(
    State(state): State<AppState>,
    Json(branch): Json<Branch>,
) -> Response {
    if branch.branch_name.trim().is_empty() {
        return bad_request("branch_name must not be empty");
    }
    match state.sync.store.save_branch(&branch).await {
        Ok(()) => Json(branch).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn update_branch_status_handler(State(state): State<AppState>) -> Response {
    let now = state.sync.config.local_now();
    match state.sync.gate.refresh_branch_flags(now).await {
        Ok(changed) => Json(json!({ "changed": changed })).into_response(),
        Err(err) => server_error(err),
    }
}

/// Manual run of the end-of-day check: captures every branch currently due
/// and reports which ones fired.
async fn check_closing_handler(State(state): State<AppState>) -> Response {
    let now = state.sync.config.local_now();
    let due = match state.sync.gate.closing_captures_due(now).await {
        Ok(due) => due,
        Err(err) => return server_error(err),
    };
    let mut captured = Vec::new();
    for (branch, stamp) in due {
        if let Err(err) = state.sync.ingest.ingest_now(stamp).await {
            return server_error(err);
        }
        state.sync.gate.mark_captured(&branch, now.date()).await;
        captured.push(json!({ "branch": branch, "stamped_at": stamp }));
    }
    Json(json!({ "captured": captured })).into_response()
}

async fn db_status_handler(State(state): State<AppState>) -> Response {
    match state.sync.store.counts().await {
        Ok(counts) => Json(json!({
            "snapshots": counts.snapshots,
            "history": counts.history,
            "branches": counts.branches,
        }))
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

/// Runs the fetch chain against the live upstream without writing anything,
/// so an operator can tell connectivity problems from parsing ones.
async fn test_api_handler(State(state): State<AppState>) -> Response {
    match state.sync.ingest.probe_upstream().await {
        Some(body) => {
            let preview: String = body.chars().take(200).collect();
            Json(json!({
                "reachable": true,
                "bytes": body.len(),
                "preview": preview,
            }))
            .into_response()
        }
        None => Json(json!({ "reachable": false })).into_response(),
    }
}

async fn library_hours_handler(State(state): State<AppState>) -> Response {
    let config = &state.sync.config;
    Json(json!({
        "open_time": config.open_time,
        "close_time": config.close_time,
        "weekend_open_time": config.weekend_open_time,
        "weekend_close_time": config.weekend_close_time,
        "weekend_days": config
            .weekend_days
            .days()
            .iter()
            .map(|d| format!("{d:?}"))
            .collect::<Vec<_>>(),
        "utc_offset": config.utc_offset.to_string(),
        "closing_window_minutes": config.closing_window_minutes,
        "retention_days": config.retention_days,
    }))
    .into_response()
}

async fn scheduler_status_handler(State(state): State<AppState>) -> Response {
    Json(json!({ "enabled": state.sync.ingest.is_enabled() })).into_response()
}

#[derive(Debug, Deserialize)]
struct SchedulerToggle {
    enabled: bool,
}

async fn set_scheduler_handler(
    State(state): State<AppState>,
    Json(toggle): Json<SchedulerToggle>,
) -> Response {
    state.sync.ingest.set_enabled(toggle.enabled);
    Json(json!({ "enabled": state.sync.ingest.is_enabled() })).into_response()
}
