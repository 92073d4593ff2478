use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::db::job_run_repository::{JobRunRepository, TagCountRow, TagStatsRow};
use crate::models::job_run::decode_tags;

use super::{format_stats, TagAggregation, TagStats};

/// Rows pulled per round trip by the scan.
const SCAN_CHUNK_SIZE: i64 = 1000;

/// Universal fallback: stream tagged runs in bounded chunks and aggregate
/// in memory. Works against any storage engine and produces exactly the
/// shapes the faster strategies produce, just slower.
pub struct ChunkedTagAggregation {
    repo: Arc<dyn JobRunRepository>,
}

struct TagAccumulator {
    total: i64,
    processed: i64,
    failed: i64,
    processing: i64,
    duration_sum: i64,
    duration_count: i64,
}

impl ChunkedTagAggregation {
    pub fn new(repo: Arc<dyn JobRunRepository>) -> Self {
        ChunkedTagAggregation { repo }
    }

    async fn aggregate(&self, since: OffsetDateTime) -> Result<Vec<TagStatsRow>, sqlx::Error> {
        let mut grouped: BTreeMap<String, TagAccumulator> = BTreeMap::new();
        let mut after_id = 0;

        loop {
            let chunk = self
                .repo
                .scan_tagged_runs(since, after_id, SCAN_CHUNK_SIZE)
                .await?;
            let exhausted = (chunk.len() as i64) < SCAN_CHUNK_SIZE;

            for row in &chunk {
                after_id = row.id;
                for tag in decode_tags(row.job_tags.as_ref()) {
                    let acc = grouped.entry(tag).or_insert(TagAccumulator {
                        total: 0,
                        processed: 0,
                        failed: 0,
                        processing: 0,
                        duration_sum: 0,
                        duration_count: 0,
                    });
                    acc.total += 1;
                    match row.status.as_str() {
                        "processed" => acc.processed += 1,
                        "failed" => acc.failed += 1,
                        "processing" => acc.processing += 1,
                        _ => {}
                    }
                    if let Some(duration) = row.duration_ms {
                        acc.duration_sum += duration;
                        acc.duration_count += 1;
                    }
                }
            }

            if exhausted {
                break;
            }
        }

        let mut rows: Vec<TagStatsRow> = grouped
            .into_iter()
            .map(|(tag, acc)| TagStatsRow {
                tag,
                total: acc.total,
                processed: acc.processed,
                failed: acc.failed,
                processing: acc.processing,
                avg_duration_ms: if acc.duration_count > 0 {
                    Some(acc.duration_sum as f64 / acc.duration_count as f64)
                } else {
                    None
                },
            })
            .collect();
        rows.sort_by(|a, b| b.total.cmp(&a.total).then(a.tag.cmp(&b.tag)));
        Ok(rows)
    }
}

#[async_trait]
impl TagAggregation for ChunkedTagAggregation {
    async fn top_tags(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<TagCountRow>, sqlx::Error> {
        let rows = self.aggregate(since).await?;
        Ok(rows
            .into_iter()
            .take(limit as usize)
            .map(|row| TagCountRow {
                tag: row.tag,
                total: row.total,
                processed: row.processed,
                failed: row.failed,
                processing: row.processing,
            })
            .collect())
    }

    async fn tag_stats(
        &self,
        since: OffsetDateTime,
    ) -> Result<BTreeMap<String, TagStats>, sqlx::Error> {
        let rows = self.aggregate(since).await?;
        Ok(format_stats(rows))
    }
}
