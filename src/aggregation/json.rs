use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::warn;

use crate::db::job_run_repository::{JobRunRepository, TagCountRow};

use super::{format_stats, ChunkedTagAggregation, TagAggregation, TagStats};

/// Native-JSON path: the engine unnests each run's tag array into one row
/// per tag and groups in SQL. Used when no denormalized index exists;
/// engines that turn out not to support it degrade to the chunked scan.
pub struct JsonTagAggregation {
    repo: Arc<dyn JobRunRepository>,
    fallback: ChunkedTagAggregation,
}

impl JsonTagAggregation {
    pub fn new(repo: Arc<dyn JobRunRepository>) -> Self {
        JsonTagAggregation {
            fallback: ChunkedTagAggregation::new(repo.clone()),
            repo,
        }
    }
}

#[async_trait]
impl TagAggregation for JsonTagAggregation {
    async fn top_tags(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<TagCountRow>, sqlx::Error> {
        match self.repo.top_tags_json(since, limit).await {
            Ok(rows) => Ok(rows),
            Err(err) => {
                warn!(?err, "json top-tags query failed, using chunked fallback");
                self.fallback.top_tags(since, limit).await
            }
        }
    }

    async fn tag_stats(
        &self,
        since: OffsetDateTime,
    ) -> Result<BTreeMap<String, TagStats>, sqlx::Error> {
        match self.repo.tag_stats_json(since).await {
            Ok(rows) => Ok(format_stats(rows)),
            Err(err) => {
                warn!(?err, "json tag-stats query failed, using chunked fallback");
                self.fallback.tag_stats(since).await
            }
        }
    }
}
