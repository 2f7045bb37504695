//! Axum JSON surface for Job Radar.
//!
//! Thin consumer of the pipeline's outputs: listing/search reads come from
//! the cache snapshot and never block on an in-progress run; the manual
//! trigger shares the pipeline's single-flight run lock with the scheduler.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use jobradar_core::JobPosting;
use jobradar_sync::SyncPipeline;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

pub const CRATE_NAME: &str = "jobradar-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

#[derive(Debug, Deserialize, Default)]
struct JobsQuery {
    q: Option<String>,
}

#[derive(Debug, Serialize)]
struct JobView {
    title: String,
    company: Option<String>,
    url: String,
}

impl From<&JobPosting> for JobView {
    fn from(posting: &JobPosting) -> Self {
        Self {
            title: posting.title.clone(),
            company: posting.company.clone(),
            url: posting.url.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct JobsResponse {
    count: usize,
    jobs: Vec<JobView>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/jobs", get(jobs_handler))
        .route("/run-scrape", post(run_scrape_handler))
        .with_state(state)
}

pub async fn serve(pipeline: Arc<SyncPipeline>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(AppState { pipeline })).await?;
    Ok(())
}

async fn index_handler(State(state): State<AppState>) -> Response {
    let snapshot = state.pipeline.cache().snapshot().await;
    Json(serde_json::json!({ "job_count": snapshot.len() })).into_response()
}

async fn jobs_handler(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Response {
    let snapshot = state.pipeline.cache().snapshot().await;
    let jobs = snapshot
        .query(query.q.as_deref().unwrap_or(""))
        .into_iter()
        .map(JobView::from)
        .collect::<Vec<_>>();
    Json(JobsResponse {
        count: jobs.len(),
        jobs,
    })
    .into_response()
}

async fn run_scrape_handler(State(state): State<AppState>) -> Response {
    match state.pipeline.run_once().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
