use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;

/// Denormalized (job_id, tag) pair used purely to accelerate tag
/// aggregation. `job_runs.job_tags` stays authoritative; these rows are
/// rebuildable at any time via the backfill operation and cascade-delete
/// with their parent run.
#[derive(Debug, FromRow, Serialize, Deserialize, Clone)]
pub struct JobTag {
    pub id: i64,
    pub job_id: i64,
    pub tag: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Insert form, batched by the backfill and by the start handler.
#[derive(Debug, Clone)]
pub struct NewJobTag {
    pub job_id: i64,
    pub tag: String,
    pub created_at: OffsetDateTime,
}
