use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::warn;

use crate::db::job_run_repository::{JobRunRepository, TagCountRow};

use super::{format_stats, ChunkedTagAggregation, TagAggregation, TagStats};

/// Fast path: join the denormalized tag index against job_runs. Cost scales
/// with matching rows, not corpus size. A query-time failure degrades to
/// the chunked scan rather than erroring the dashboard.
pub struct IndexedTagAggregation {
    repo: Arc<dyn JobRunRepository>,
    fallback: ChunkedTagAggregation,
}

impl IndexedTagAggregation {
    pub fn new(repo: Arc<dyn JobRunRepository>) -> Self {
        IndexedTagAggregation {
            fallback: ChunkedTagAggregation::new(repo.clone()),
            repo,
        }
    }
}

#[async_trait]
impl TagAggregation for IndexedTagAggregation {
    async fn top_tags(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<TagCountRow>, sqlx::Error> {
        match self.repo.top_tags_indexed(since, limit).await {
            Ok(rows) => Ok(rows),
            Err(err) => {
                warn!(?err, "indexed top-tags query failed, using chunked fallback");
                self.fallback.top_tags(since, limit).await
            }
        }
    }

    async fn tag_stats(
        &self,
        since: OffsetDateTime,
    ) -> Result<BTreeMap<String, TagStats>, sqlx::Error> {
        match self.repo.tag_stats_indexed(since).await {
            Ok(rows) => Ok(format_stats(rows)),
            Err(err) => {
                warn!(?err, "indexed tag-stats query failed, using chunked fallback");
                self.fallback.tag_stats(since).await
            }
        }
    }
}
