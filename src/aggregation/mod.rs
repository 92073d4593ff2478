//! Tag/metrics aggregation. Three interchangeable strategies produce the
//! same output shapes; the fastest one the storage engine can serve is
//! picked once at startup, and the slower universal fallback backs the
//! faster ones up at query time.

pub mod backfill;
mod chunked;
mod indexed;
mod json;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::info;

use crate::db::job_run_repository::{JobRunRepository, TagCountRow, TagStatsRow};

pub use chunked::ChunkedTagAggregation;
pub use indexed::IndexedTagAggregation;
pub use json::JsonTagAggregation;

/// Per-tag detail row served to the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagStats {
    pub total: i64,
    pub processed: i64,
    pub failed: i64,
    pub processing: i64,
    pub avg_duration_ms: f64,
    pub success_rate_pct: f64,
}

#[async_trait]
pub trait TagAggregation: Send + Sync {
    async fn top_tags(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<TagCountRow>, sqlx::Error>;

    async fn tag_stats(
        &self,
        since: OffsetDateTime,
    ) -> Result<BTreeMap<String, TagStats>, sqlx::Error>;
}

/// Pick the best strategy this deployment can serve, in priority order:
/// populated denormalized index, native JSON unnesting, chunked in-memory
/// scan.
pub async fn select_strategy(repo: Arc<dyn JobRunRepository>) -> Arc<dyn TagAggregation> {
    match repo.tag_index_populated().await {
        Ok(true) => {
            info!("tag aggregation: using denormalized tag index");
            return Arc::new(IndexedTagAggregation::new(repo));
        }
        Ok(false) => {}
        Err(err) => {
            tracing::warn!(?err, "tag index probe failed, skipping indexed strategy");
        }
    }

    if repo.supports_json_aggregation() {
        info!("tag aggregation: using native json array queries");
        Arc::new(JsonTagAggregation::new(repo))
    } else {
        info!("tag aggregation: using chunked in-memory fallback");
        Arc::new(ChunkedTagAggregation::new(repo))
    }
}

/// Fold raw stats rows into the dashboard map. Success rate is guarded:
/// total of zero reads as 0, never a division error.
pub(crate) fn format_stats(rows: Vec<TagStatsRow>) -> BTreeMap<String, TagStats> {
    rows.into_iter()
        .map(|row| {
            let success_rate_pct = if row.total > 0 {
                round1(row.processed as f64 / row.total as f64 * 100.0)
            } else {
                0.0
            };
            (
                row.tag,
                TagStats {
                    total: row.total,
                    processed: row.processed,
                    failed: row.failed,
                    processing: row.processing,
                    avg_duration_ms: round2(row.avg_duration_ms.unwrap_or(0.0)),
                    success_rate_pct,
                },
            )
        })
        .collect()
}

pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::job_run_repository::{NewJobRun, TagStatsRow};
    use crate::db::mock_db::MockJobRunRepository;
    use crate::models::job_run::encode_tags;
    use crate::models::job_tag::NewJobTag;
    use time::Duration;

    fn since_epoch() -> OffsetDateTime {
        OffsetDateTime::now_utc() - Duration::hours(1)
    }

    async fn seed_runs(repo: &MockJobRunRepository) {
        // Two processed (email), one failed (email, urgent), one
        // processing (urgent).
        let shapes = [
            ("processed", vec!["email"], Some(100)),
            ("processed", vec!["email"], Some(300)),
            ("failed", vec!["email", "urgent"], Some(50)),
            ("processing", vec!["urgent"], None),
        ];
        for (status, tags, duration) in shapes {
            let tags: Vec<String> = tags.into_iter().map(String::from).collect();
            let run = repo
                .insert_run(NewJobRun {
                    uuid: uuid::Uuid::new_v4().to_string(),
                    job_class: "EmailJob".into(),
                    status: status.into(),
                    duration_ms: duration,
                    job_tags: Some(encode_tags(&tags)),
                    ..Default::default()
                })
                .await
                .unwrap();
            let rows: Vec<NewJobTag> = tags
                .iter()
                .map(|tag| NewJobTag {
                    job_id: run.id,
                    tag: tag.clone(),
                    created_at: run.created_at,
                })
                .collect();
            repo.insert_tag_rows(&rows).await.unwrap();
        }
    }

    #[tokio::test]
    async fn indexed_and_chunked_agree_on_counts() {
        let repo = Arc::new(MockJobRunRepository::default());
        seed_runs(&repo).await;

        let indexed = IndexedTagAggregation::new(repo.clone() as Arc<dyn JobRunRepository>);
        let chunked = ChunkedTagAggregation::new(repo.clone() as Arc<dyn JobRunRepository>);

        let a = indexed.top_tags(since_epoch(), 10).await.unwrap();
        let b = chunked.top_tags(since_epoch(), 10).await.unwrap();
        assert_eq!(a, b);

        let email = a.iter().find(|r| r.tag == "email").unwrap();
        assert_eq!(
            (email.total, email.processed, email.failed, email.processing),
            (3, 2, 1, 0)
        );
        let urgent = a.iter().find(|r| r.tag == "urgent").unwrap();
        assert_eq!(
            (urgent.total, urgent.processed, urgent.failed, urgent.processing),
            (2, 0, 1, 1)
        );
    }

    #[tokio::test]
    async fn indexed_and_chunked_agree_on_stats() {
        let repo = Arc::new(MockJobRunRepository::default());
        seed_runs(&repo).await;

        let indexed = IndexedTagAggregation::new(repo.clone() as Arc<dyn JobRunRepository>);
        let chunked = ChunkedTagAggregation::new(repo.clone() as Arc<dyn JobRunRepository>);

        let a = indexed.tag_stats(since_epoch()).await.unwrap();
        let b = chunked.tag_stats(since_epoch()).await.unwrap();
        assert_eq!(a, b);

        let email = &a["email"];
        assert_eq!(email.total, 3);
        assert_eq!(email.avg_duration_ms, 150.0);
        assert_eq!(email.success_rate_pct, 66.7);
    }

    #[tokio::test]
    async fn json_strategy_falls_back_when_engine_lacks_support() {
        // json_aggregation=false makes the json primitive error out; the
        // strategy must degrade to the chunked scan and still answer.
        let repo = Arc::new(MockJobRunRepository::default());
        seed_runs(&repo).await;

        let json = JsonTagAggregation::new(repo.clone() as Arc<dyn JobRunRepository>);
        let chunked = ChunkedTagAggregation::new(repo.clone() as Arc<dyn JobRunRepository>);

        let a = json.top_tags(since_epoch(), 10).await.unwrap();
        let b = chunked.top_tags(since_epoch(), 10).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn strategy_selection_prefers_populated_index() {
        let repo = Arc::new(MockJobRunRepository::default());
        seed_runs(&repo).await;
        // Index rows exist, so the indexed strategy is chosen; smoke-check
        // it answers.
        let strategy = select_strategy(repo.clone() as Arc<dyn JobRunRepository>).await;
        assert!(!strategy.top_tags(since_epoch(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chunked_honors_the_time_window() {
        let repo = Arc::new(MockJobRunRepository::default());
        seed_runs(&repo).await;
        let chunked = ChunkedTagAggregation::new(repo as Arc<dyn JobRunRepository>);
        let future = OffsetDateTime::now_utc() + Duration::hours(1);
        assert!(chunked.top_tags(future, 10).await.unwrap().is_empty());
    }

    #[test]
    fn zero_total_formats_to_zero_rate() {
        let stats = format_stats(vec![TagStatsRow {
            tag: "empty".into(),
            total: 0,
            processed: 0,
            failed: 0,
            processing: 0,
            avg_duration_ms: None,
        }]);
        assert_eq!(stats["empty"].success_rate_pct, 0.0);
        assert_eq!(stats["empty"].avg_duration_ms, 0.0);
    }
}
