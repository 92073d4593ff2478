use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;

pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_PROCESSED: &str = "processed";
pub const STATUS_FAILED: &str = "failed";

pub const MAX_EXCEPTION_MESSAGE_LEN: usize = 2000;
pub const MAX_STACK_LEN: usize = 4000;

/// One row per job execution attempt. A retry is a new row linked to its
/// parent through `retried_from_id`; the chain is forward-only and must
/// survive a pruned parent (the column is nulled, never cascaded).
#[derive(Debug, FromRow, Serialize, Deserialize, Clone)]
pub struct JobRun {
    pub id: i64,
    pub uuid: String,
    pub job_class: String,
    pub queue: Option<String>,
    pub connection: Option<String>,
    pub attempt: i32,
    pub status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub duration_ms: Option<i64>,
    pub retried_from_id: Option<i64>,
    pub exception_class: Option<String>,
    pub exception_message: Option<String>,
    pub stack: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub job_tags: Option<serde_json::Value>,
    pub memory_start_bytes: Option<i64>,
    pub memory_end_bytes: Option<i64>,
    pub memory_peak_start_bytes: Option<i64>,
    pub memory_peak_end_bytes: Option<i64>,
    pub memory_peak_delta_bytes: Option<i64>,
    pub cpu_user_ms: Option<i64>,
    pub cpu_sys_ms: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// List-view projection that leaves out the large `payload` and `stack`
/// columns.
#[derive(Debug, FromRow, Serialize, Deserialize, Clone)]
pub struct JobRunSummary {
    pub id: i64,
    pub uuid: String,
    pub job_class: String,
    pub queue: Option<String>,
    pub connection: Option<String>,
    pub attempt: i32,
    pub status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub duration_ms: Option<i64>,
    pub retried_from_id: Option<i64>,
    pub exception_class: Option<String>,
    pub exception_message: Option<String>,
    pub job_tags: Option<serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl JobRun {
    pub fn tags(&self) -> Vec<String> {
        decode_tags(self.job_tags.as_ref())
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        let needle = tag.to_lowercase();
        self.tags().iter().any(|t| t == &needle)
    }

    pub fn is_failed(&self) -> bool {
        self.status == STATUS_FAILED
    }

    /// Resident memory growth over the run, signed (can be negative when an
    /// allocator returns pages between snapshots).
    pub fn memory_delta_bytes(&self) -> Option<i64> {
        Some(self.memory_end_bytes? - self.memory_start_bytes?)
    }

    pub fn cpu_total_ms(&self) -> Option<i64> {
        if self.cpu_user_ms.is_none() && self.cpu_sys_ms.is_none() {
            return None;
        }
        Some(self.cpu_user_ms.unwrap_or(0) + self.cpu_sys_ms.unwrap_or(0))
    }
}

pub fn decode_tags(job_tags: Option<&serde_json::Value>) -> Vec<String> {
    match job_tags {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.to_string())
            .collect(),
        _ => Vec::new(),
    }
}

pub fn encode_tags(tags: &[String]) -> serde_json::Value {
    serde_json::Value::Array(
        tags.iter()
            .map(|t| serde_json::Value::String(t.clone()))
            .collect(),
    )
}

/// Truncate on a char boundary; exception messages and stacks carry a hard
/// storage bound.
pub fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_with_tags(tags: serde_json::Value) -> JobRun {
        JobRun {
            id: 1,
            uuid: "u".into(),
            job_class: "app::jobs::EmailJob".into(),
            queue: Some("default".into()),
            connection: None,
            attempt: 1,
            status: STATUS_PROCESSED.into(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            retried_from_id: None,
            exception_class: None,
            exception_message: None,
            stack: None,
            payload: None,
            job_tags: Some(tags),
            memory_start_bytes: Some(1000),
            memory_end_bytes: Some(800),
            memory_peak_start_bytes: None,
            memory_peak_end_bytes: None,
            memory_peak_delta_bytes: None,
            cpu_user_ms: Some(12),
            cpu_sys_ms: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn tag_lookup_is_case_insensitive() {
        let run = run_with_tags(serde_json::json!(["email", "urgent"]));
        assert!(run.has_tag("EMAIL"));
        assert!(!run.has_tag("billing"));
    }

    #[test]
    fn memory_delta_can_go_negative() {
        let run = run_with_tags(serde_json::json!([]));
        assert_eq!(run.memory_delta_bytes(), Some(-200));
    }

    #[test]
    fn cpu_total_treats_missing_halves_as_zero() {
        let run = run_with_tags(serde_json::json!([]));
        assert_eq!(run.cpu_total_ms(), Some(12));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("ok", 10), "ok");
    }
}
