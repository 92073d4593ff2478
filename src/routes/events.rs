//! Lifecycle event ingestion: the external queue posts its start, success,
//! and failure events here. The recorder never errors back at the broker;
//! a malformed body is the only rejectable condition (axum handles that at
//! extraction time).

use axum::{extract::State, response::IntoResponse, Json};
use serde::Deserialize;

use crate::jobs::{JobEvent, JobFailure};
use crate::responses::JsonResponse;
use crate::state::AppState;

pub async fn job_started(
    State(state): State<AppState>,
    Json(event): Json<JobEvent>,
) -> impl IntoResponse {
    state.recorder.on_job_started(&event).await;
    JsonResponse::success("recorded")
}

pub async fn job_succeeded(
    State(state): State<AppState>,
    Json(event): Json<JobEvent>,
) -> impl IntoResponse {
    state.recorder.on_job_succeeded(&event).await;
    JsonResponse::success("recorded")
}

#[derive(Debug, Deserialize)]
pub struct FailedEventBody {
    #[serde(flatten)]
    pub event: JobEvent,
    pub exception: JobFailure,
}

pub async fn job_failed(
    State(state): State<AppState>,
    Json(body): Json<FailedEventBody>,
) -> impl IntoResponse {
    state.recorder.on_job_failed(&body.event, &body.exception).await;
    JsonResponse::success("recorded")
}
