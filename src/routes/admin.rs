//! Administrative maintenance operations. All three are chunked and report
//! counts; a late chunk failing never rolls back earlier chunks.

use axum::{extract::State, response::{IntoResponse, Response}, Json};
use serde::Deserialize;
use serde_json::json;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::aggregation::backfill::{backfill_tag_index, BackfillOptions};
use crate::responses::JsonResponse;
use crate::state::AppState;

const PRUNE_CHUNK_SIZE: i64 = 1000;

#[derive(Debug, Deserialize)]
pub struct PruneRequest {
    /// Keep runs from the last N days; defaults to the configured retention.
    pub days: Option<i64>,
    /// Overrides `days` when given.
    pub hours: Option<i64>,
    /// Only prune runs with this status.
    pub status: Option<String>,
    /// Also prune live processing rows (off by default).
    #[serde(default)]
    pub include_processing: bool,
}

pub async fn prune_runs(
    State(state): State<AppState>,
    Json(request): Json<PruneRequest>,
) -> Response {
    let now = OffsetDateTime::now_utc();
    let cutoff = match request.hours {
        Some(hours) => now - Duration::hours(hours),
        None => {
            let days = request.days.unwrap_or(state.monitor_config.retention_days);
            now - Duration::days(days)
        }
    };

    match state
        .job_runs
        .prune_runs(
            cutoff,
            request.status.as_deref(),
            request.include_processing,
            PRUNE_CHUNK_SIZE,
        )
        .await
    {
        Ok(outcome) => {
            info!(
                deleted = outcome.deleted,
                orphaned = outcome.orphaned_children,
                "pruned old job runs"
            );
            Json(json!({
                "deleted": outcome.deleted,
                "orphaned_children": outcome.orphaned_children,
            }))
            .into_response()
        }
        Err(err) => {
            warn!(?err, "prune failed");
            JsonResponse::server_error("failed to prune job runs").into_response()
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct BackfillRequest {
    pub days: Option<i64>,
    pub chunk_size: Option<i64>,
    #[serde(default)]
    pub rebuild: bool,
}

pub async fn backfill_tags(
    State(state): State<AppState>,
    Json(request): Json<BackfillRequest>,
) -> Response {
    let mut options = BackfillOptions {
        days: request.days,
        rebuild: request.rebuild,
        ..Default::default()
    };
    if let Some(chunk_size) = request.chunk_size {
        options.chunk_size = chunk_size.clamp(1, 10_000);
    }

    match backfill_tag_index(state.job_runs.as_ref(), &options).await {
        Ok(report) => Json(json!(report)).into_response(),
        Err(err) => {
            warn!(?err, "tag backfill failed");
            JsonResponse::server_error("failed to backfill tag index").into_response()
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct CleanupStuckRequest {
    /// Hours a processing run may age before it counts as stuck.
    pub timeout_hours: Option<i64>,
}

pub async fn cleanup_stuck(
    State(state): State<AppState>,
    Json(request): Json<CleanupStuckRequest>,
) -> Response {
    let hours = request
        .timeout_hours
        .unwrap_or(state.monitor_config.stuck_timeout_hours);
    let cutoff = OffsetDateTime::now_utc() - Duration::hours(hours);
    let message = format!("Job stuck in processing state for more than {hours} hours");

    match state.job_runs.sweep_stuck_runs(cutoff, &message).await {
        Ok(swept) => {
            if swept > 0 {
                info!(swept, hours, "marked stuck jobs as failed");
            }
            Json(json!({ "swept": swept })).into_response()
        }
        Err(err) => {
            warn!(?err, "stuck cleanup failed");
            JsonResponse::server_error("failed to clean up stuck jobs").into_response()
        }
    }
}
