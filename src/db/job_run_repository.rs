use async_trait::async_trait;
use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;

use crate::models::job_run::{JobRun, JobRunSummary};
use crate::models::job_tag::NewJobTag;

/// Insert form for a run record. The start handler fills the processing
/// shape; the end handlers use the same form for fallback-created terminal
/// rows.
#[derive(Debug, Clone, Default)]
pub struct NewJobRun {
    pub uuid: String,
    pub job_class: String,
    pub queue: Option<String>,
    pub connection: Option<String>,
    pub attempt: i32,
    pub status: String,
    pub started_at: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
    pub duration_ms: Option<i64>,
    pub retried_from_id: Option<i64>,
    pub exception_class: Option<String>,
    pub exception_message: Option<String>,
    pub stack: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub job_tags: Option<serde_json::Value>,
    pub memory_start_bytes: Option<i64>,
    pub memory_peak_start_bytes: Option<i64>,
    pub memory_end_bytes: Option<i64>,
    pub memory_peak_end_bytes: Option<i64>,
    pub cpu_user_ms: Option<i64>,
    pub cpu_sys_ms: Option<i64>,
}

/// In-place terminal transition applied to a matched processing row.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: String,
    pub finished_at: OffsetDateTime,
    pub duration_ms: Option<i64>,
    pub memory_end_bytes: Option<i64>,
    pub memory_peak_end_bytes: Option<i64>,
    pub memory_peak_delta_bytes: Option<i64>,
    pub cpu_user_ms: Option<i64>,
    pub cpu_sys_ms: Option<i64>,
    pub exception_class: Option<String>,
    pub exception_message: Option<String>,
    pub stack: Option<String>,
}

#[derive(Debug, FromRow, Serialize)]
pub struct OverviewStats {
    pub total: i64,
    pub processed: i64,
    pub failed: i64,
    pub processing: i64,
    pub avg_duration_ms: Option<f64>,
}

#[derive(Debug, FromRow, Serialize)]
pub struct HourBucket {
    pub hour: String,
    pub count: i64,
    pub failed_count: i64,
}

#[derive(Debug, FromRow, Serialize)]
pub struct ClassFailureCount {
    pub job_class: String,
    pub failure_count: i64,
}

#[derive(Debug, FromRow, Serialize)]
pub struct ExceptionCount {
    pub exception_class: String,
    pub count: i64,
}

#[derive(Debug, FromRow, Serialize)]
pub struct ClassDurationStats {
    pub job_class: String,
    pub avg_duration_ms: Option<f64>,
    pub max_duration_ms: Option<i64>,
    pub count: i64,
}

#[derive(Debug, FromRow, Serialize)]
pub struct ClassResourceStats {
    pub job_class: String,
    pub avg_peak_delta_bytes: Option<f64>,
    pub avg_cpu_total_ms: Option<f64>,
    pub count: i64,
}

#[derive(Debug, FromRow, Serialize)]
pub struct QueueProcessingCount {
    pub queue: Option<String>,
    pub count: i64,
}

/// One aggregated tag row as every strategy produces it.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct TagCountRow {
    pub tag: String,
    pub total: i64,
    pub processed: i64,
    pub failed: i64,
    pub processing: i64,
}

#[derive(Debug, FromRow)]
pub struct TagStatsRow {
    pub tag: String,
    pub total: i64,
    pub processed: i64,
    pub failed: i64,
    pub processing: i64,
    pub avg_duration_ms: Option<f64>,
}

/// Narrow projection streamed by the chunked aggregation fallback.
#[derive(Debug, FromRow)]
pub struct TagScanRow {
    pub id: i64,
    pub status: String,
    pub duration_ms: Option<i64>,
    pub job_tags: Option<serde_json::Value>,
}

/// Narrow projection streamed by the tag-index backfill.
#[derive(Debug, FromRow)]
pub struct BackfillRow {
    pub id: i64,
    pub job_tags: Option<serde_json::Value>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Default, Serialize)]
pub struct PruneOutcome {
    pub deleted: u64,
    pub orphaned_children: u64,
}

#[async_trait]
pub trait JobRunRepository: Send + Sync {
    async fn insert_run(&self, new_run: NewJobRun) -> Result<JobRun, sqlx::Error>;

    async fn find_by_id(&self, id: i64) -> Result<Option<JobRun>, sqlx::Error>;

    /// The authoritative correlation lookup: live processing row for this
    /// uuid.
    async fn find_processing_by_uuid(&self, uuid: &str) -> Result<Option<JobRun>, sqlx::Error>;

    /// Heuristic correlation for runners without stable ids: newest
    /// processing row with the same routing labels created after `cutoff`.
    async fn find_recent_processing(
        &self,
        job_class: &str,
        queue: Option<&str>,
        connection: Option<&str>,
        cutoff: OffsetDateTime,
    ) -> Result<Option<JobRun>, sqlx::Error>;

    async fn complete_run(
        &self,
        id: i64,
        completion: RunCompletion,
    ) -> Result<Option<JobRun>, sqlx::Error>;

    // Listings (dashboard)
    async fn list_recent(&self, limit: i64) -> Result<Vec<JobRunSummary>, sqlx::Error>;

    async fn list_by_status(
        &self,
        status: &str,
        limit: i64,
    ) -> Result<Vec<JobRunSummary>, sqlx::Error>;

    async fn list_by_tag(&self, tag: &str, limit: i64)
        -> Result<Vec<JobRunSummary>, sqlx::Error>;

    // Overview analytics
    async fn statistics(&self, since: OffsetDateTime) -> Result<OverviewStats, sqlx::Error>;

    async fn jobs_by_hour(&self, since: OffsetDateTime) -> Result<Vec<HourBucket>, sqlx::Error>;

    async fn top_failing_jobs(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<ClassFailureCount>, sqlx::Error>;

    async fn top_exceptions(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<ExceptionCount>, sqlx::Error>;

    async fn slowest_jobs(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<ClassDurationStats>, sqlx::Error>;

    async fn heaviest_jobs(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<ClassResourceStats>, sqlx::Error>;

    /// Per-queue counts of live processing rows, the depth fallback for
    /// brokers we cannot probe.
    async fn processing_counts_by_queue(&self)
        -> Result<Vec<QueueProcessingCount>, sqlx::Error>;

    // Denormalized tag index
    async fn insert_tag_rows(&self, rows: &[NewJobTag]) -> Result<u64, sqlx::Error>;

    async fn tag_index_populated(&self) -> Result<bool, sqlx::Error>;

    async fn clear_tag_index(
        &self,
        created_after: Option<OffsetDateTime>,
    ) -> Result<u64, sqlx::Error>;

    // Aggregation primitives, one per strategy
    /// Whether this engine can unnest a JSON tag array natively.
    fn supports_json_aggregation(&self) -> bool;

    async fn top_tags_indexed(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<TagCountRow>, sqlx::Error>;

    async fn tag_stats_indexed(
        &self,
        since: OffsetDateTime,
    ) -> Result<Vec<TagStatsRow>, sqlx::Error>;

    async fn top_tags_json(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<TagCountRow>, sqlx::Error>;

    async fn tag_stats_json(&self, since: OffsetDateTime)
        -> Result<Vec<TagStatsRow>, sqlx::Error>;

    /// Keyset page of tagged runs for the in-memory fallback; rows are
    /// ordered by id and start strictly after `after_id`.
    async fn scan_tagged_runs(
        &self,
        since: OffsetDateTime,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<TagScanRow>, sqlx::Error>;

    // Maintenance
    /// Chunked delete of old runs. Children of deleted parents get their
    /// `retried_from_id` nulled first so the surviving history never dangles.
    async fn prune_runs(
        &self,
        cutoff: OffsetDateTime,
        status: Option<&str>,
        include_processing: bool,
        chunk_size: i64,
    ) -> Result<PruneOutcome, sqlx::Error>;

    /// Mark processing rows started before the cutoff as failed-by-timeout.
    async fn sweep_stuck_runs(
        &self,
        started_before: OffsetDateTime,
        message: &str,
    ) -> Result<u64, sqlx::Error>;

    async fn backfill_chunk(
        &self,
        since: Option<OffsetDateTime>,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<BackfillRow>, sqlx::Error>;
}
