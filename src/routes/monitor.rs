use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use time::{Duration, OffsetDateTime};
use tracing::warn;

use crate::recorder::retry::RetryError;
use crate::responses::JsonResponse;
use crate::routes::{since_for_period, PeriodQuery};
use crate::state::AppState;

const RECENT_JOBS_LIMIT: i64 = 20;
const BREAKDOWN_LIMIT: i64 = 5;
const DEFAULT_TAG_LIMIT: i64 = 10;
const DEFAULT_LIST_LIMIT: i64 = 50;

/// Everything the dashboard's landing page needs in one round trip. Any
/// failing sub-query degrades to an empty section rather than breaking the
/// page.
pub async fn overview(
    State(state): State<AppState>,
    Query(query): Query<PeriodQuery>,
) -> Response {
    let since = since_for_period(query.period.as_deref());
    let repo = &state.job_runs;

    let stats = match repo.statistics(since).await {
        Ok(stats) => stats,
        Err(err) => {
            warn!(?err, "overview statistics query failed");
            return JsonResponse::server_error("failed to load statistics").into_response();
        }
    };

    // Success rate over completed runs only; zero completed reads as 0.
    let completed = stats.processed + stats.failed;
    let success_rate = if completed > 0 {
        (stats.processed as f64 / completed as f64 * 1000.0).round() / 10.0
    } else {
        0.0
    };

    // Only recently started runs count as live for the headline number.
    let processing_hour = OffsetDateTime::now_utc() - Duration::hours(1);
    let recent_processing = repo
        .statistics(processing_hour)
        .await
        .map(|s| s.processing)
        .unwrap_or(stats.processing);

    let recent_jobs = repo.list_recent(RECENT_JOBS_LIMIT).await.unwrap_or_else(|err| {
        warn!(?err, "recent jobs query failed");
        Vec::new()
    });
    let jobs_by_hour = repo.jobs_by_hour(since).await.unwrap_or_else(|err| {
        warn!(?err, "hourly trend query failed");
        Vec::new()
    });
    let top_failing = repo
        .top_failing_jobs(since, BREAKDOWN_LIMIT)
        .await
        .unwrap_or_else(|err| {
            warn!(?err, "top failing jobs query failed");
            Vec::new()
        });
    let top_exceptions = repo
        .top_exceptions(since, BREAKDOWN_LIMIT)
        .await
        .unwrap_or_else(|err| {
            warn!(?err, "top exceptions query failed");
            Vec::new()
        });
    let slowest = repo
        .slowest_jobs(since, BREAKDOWN_LIMIT)
        .await
        .unwrap_or_else(|err| {
            warn!(?err, "slowest jobs query failed");
            Vec::new()
        });
    let heaviest = repo
        .heaviest_jobs(since, BREAKDOWN_LIMIT)
        .await
        .unwrap_or_else(|err| {
            warn!(?err, "heaviest jobs query failed");
            Vec::new()
        });
    let top_tags = state
        .tag_aggregation
        .top_tags(since, DEFAULT_TAG_LIMIT)
        .await
        .unwrap_or_else(|err| {
            warn!(?err, "top tags query failed");
            Vec::new()
        });
    let queue_depth = state.queue_depth.check(None).await;

    Json(json!({
        "stats": {
            "total": stats.total,
            "processed": stats.processed,
            "failed": stats.failed,
            "processing": recent_processing,
            "avg_duration_ms": stats.avg_duration_ms,
            "success_rate": success_rate,
        },
        "recent_jobs": recent_jobs,
        "jobs_by_hour": jobs_by_hour,
        "top_failing_jobs": top_failing,
        "top_exceptions": top_exceptions,
        "slowest_jobs": slowest,
        "heaviest_jobs": heaviest,
        "top_tags": top_tags,
        "queue_depth": queue_depth,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub tag: Option<String>,
    pub limit: Option<i64>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 500);

    let result = if let Some(tag) = &query.tag {
        state.job_runs.list_by_tag(tag, limit).await
    } else if let Some(status) = &query.status {
        state.job_runs.list_by_status(status, limit).await
    } else {
        state.job_runs.list_recent(limit).await
    };

    match result {
        Ok(jobs) => Json(json!({ "jobs": jobs })).into_response(),
        Err(err) => {
            warn!(?err, "job listing query failed");
            JsonResponse::server_error("failed to list jobs").into_response()
        }
    }
}

pub async fn get_job(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.job_runs.find_by_id(id).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => JsonResponse::not_found("job run not found").into_response(),
        Err(err) => {
            warn!(?err, id, "job lookup failed");
            JsonResponse::server_error("failed to load job run").into_response()
        }
    }
}

pub async fn retry_job(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.retrier.retry(id).await {
        Ok(()) => JsonResponse::success("job queued for retry").into_response(),
        Err(err @ RetryError::NotFound(_)) => {
            JsonResponse::not_found(&err.to_string()).into_response()
        }
        Err(
            err @ (RetryError::NotFailed { .. }
            | RetryError::UnknownJobClass(_)
            | RetryError::RestoreFailed),
        ) => JsonResponse::unprocessable(&err.to_string()).into_response(),
        Err(err) => {
            warn!(?err, id, "retry failed");
            JsonResponse::server_error(&err.to_string()).into_response()
        }
    }
}

pub async fn top_tags(
    State(state): State<AppState>,
    Query(query): Query<PeriodQuery>,
) -> Response {
    let since = since_for_period(query.period.as_deref());
    let limit = query.limit.unwrap_or(DEFAULT_TAG_LIMIT).clamp(1, 100);

    match state.tag_aggregation.top_tags(since, limit).await {
        Ok(tags) => Json(json!({ "tags": tags })).into_response(),
        Err(err) => {
            warn!(?err, "top tags query failed");
            JsonResponse::server_error("failed to aggregate tags").into_response()
        }
    }
}

pub async fn tag_stats(
    State(state): State<AppState>,
    Query(query): Query<PeriodQuery>,
) -> Response {
    let since = since_for_period(query.period.as_deref());

    match state.tag_aggregation.tag_stats(since).await {
        Ok(stats) => Json(json!({ "tags": stats })).into_response(),
        Err(err) => {
            warn!(?err, "tag stats query failed");
            JsonResponse::server_error("failed to aggregate tag stats").into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct QueueDepthQuery {
    pub queue: Option<String>,
}

pub async fn queue_depth(
    State(state): State<AppState>,
    Query(query): Query<QueueDepthQuery>,
) -> Response {
    let depths = state.queue_depth.check(query.queue.as_deref()).await;
    Json(json!({ "queues": depths })).into_response()
}
