//! Dashboard read API (§6): three read-only endpoints backed directly by
//! the Store's query-side methods, plus health/readiness checks. Route
//! table and handler shape (`State<Arc<AppState>>`, `utoipa::path`
//! annotations, a shared `ApiResult<Json<T>>` return type) are grounded on
//! this codebase's `handlers/query_history.rs` and `utils/error.rs`,
//! narrowed from an authenticated multi-tenant admin surface down to the
//! unauthenticated read-only surface this core exposes (§6, §1 non-goals).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::{OpenApi, ToSchema};

use crate::models::{Analysis, DashboardStats, FeedbackEntry, FingerprintSummary, Observation, SourceType};
use crate::store::dashboard::SlowQueryFilters;
use crate::utils::{AppError, AppResult};
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct SlowQueryListParams {
    pub source_type: Option<SourceType>,
    pub min_duration_ms: Option<f64>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SlowQueryDetail {
    pub observation: Observation,
    pub analysis: Option<Analysis>,
    pub feedback_timeline: Vec<FeedbackEntry>,
}

#[derive(OpenApi)]
#[openapi(
    paths(list_slow_queries, get_slow_query, get_dashboard_stats, healthz, readyz),
    components(schemas(SlowQueryListParams, SlowQueryDetail, FingerprintSummary, DashboardStats)),
    tags((name = "slow-queries", description = "Slow query observation, analysis and feedback"))
)]
pub struct ApiDoc;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/slow-queries", get(list_slow_queries))
        .route("/slow-queries/:id", get(get_slow_query))
        .route("/stats/dashboard", get(get_dashboard_stats))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// `GET /slow-queries` (§6): one row per fingerprint, most recently seen
/// first, optionally filtered by dialect and minimum duration.
#[utoipa::path(
    get,
    path = "/slow-queries",
    params(SlowQueryListParams),
    responses((status = 200, description = "Fingerprint summaries", body = [FingerprintSummary])),
    tag = "slow-queries"
)]
pub async fn list_slow_queries(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SlowQueryListParams>,
) -> AppResult<Json<Vec<FingerprintSummary>>> {
    let filters = SlowQueryFilters {
        source_type: params.source_type,
        min_duration_ms: params.min_duration_ms,
        limit: params.limit.clamp(1, 500),
        offset: params.offset.max(0),
    };
    let summaries = state.store.summarise_by_fingerprint(filters).await?;
    Ok(Json(summaries))
}

/// `GET /slow-queries/{id}` (§6): the raw Observation plus its Analysis (if
/// any) and the FeedbackEntry timeline for its fingerprint.
#[utoipa::path(
    get,
    path = "/slow-queries/{id}",
    params(("id" = i64, Path, description = "Observation id")),
    responses(
        (status = 200, description = "Observation detail", body = SlowQueryDetail),
        (status = 404, description = "Observation not found"),
    ),
    tag = "slow-queries"
)]
pub async fn get_slow_query(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> AppResult<Json<SlowQueryDetail>> {
    let observation = state
        .store
        .get_observation(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("observation {id}")))?;

    let analysis = state.store.get_analysis_for_observation(id).await?;
    let feedback_timeline = state.store.feedback_timeline(&observation.fingerprint).await?;

    Ok(Json(SlowQueryDetail { observation, analysis, feedback_timeline }))
}

/// `GET /stats/dashboard` (§6): aggregate totals plus a 7-day confirmed-gain
/// histogram.
#[utoipa::path(
    get,
    path = "/stats/dashboard",
    responses((status = 200, description = "Dashboard aggregate stats", body = DashboardStats)),
    tag = "slow-queries"
)]
pub async fn get_dashboard_stats(State(state): State<Arc<AppState>>) -> AppResult<Json<DashboardStats>> {
    let stats = state.store.dashboard_stats().await?;
    Ok(Json(stats))
}

#[utoipa::path(get, path = "/healthz", responses((status = 200, description = "Process is alive")))]
pub async fn healthz() -> &'static str {
    "ok"
}

/// Readiness probe: a trivial query against the Store confirms the
/// connection pool is actually usable, not just that the process started.
#[utoipa::path(get, path = "/readyz", responses((status = 200, description = "Store is reachable")))]
pub async fn readyz(State(state): State<Arc<AppState>>) -> AppResult<&'static str> {
    state.store.dashboard_stats().await?;
    Ok("ready")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn test_state() -> Arc<AppState> {
        Arc::new(AppState { store: crate::store::test_store().await })
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let app = router(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn slow_queries_on_empty_store_returns_empty_array() {
        let app = router(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/slow-queries").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_observation_returns_404() {
        let app = router(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/slow-queries/9999").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
