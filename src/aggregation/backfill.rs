use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::db::job_run_repository::JobRunRepository;
use crate::models::job_run::decode_tags;
use crate::models::job_tag::NewJobTag;

/// Regenerate the denormalized tag index from existing job_runs rows.
#[derive(Debug, Clone)]
pub struct BackfillOptions {
    /// Only backfill runs created in the last N days; None means all time.
    pub days: Option<i64>,
    /// Runs fetched per round trip.
    pub chunk_size: i64,
    /// Tag rows per insert, to bound statement and packet size.
    pub insert_batch: i64,
    /// Clear the matching window of the index first instead of appending.
    pub rebuild: bool,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        BackfillOptions {
            days: None,
            chunk_size: 1000,
            insert_batch: 500,
            rebuild: false,
        }
    }
}

#[derive(Debug, Default, serde::Serialize)]
pub struct BackfillReport {
    pub jobs_processed: u64,
    pub tags_inserted: u64,
    pub errors: u64,
    pub cleared: u64,
}

/// Stream runs with tags in chunks and insert one index row per (job, tag)
/// pair. A failing insert batch is counted and skipped; earlier batches
/// stay inserted.
pub async fn backfill_tag_index(
    repo: &dyn JobRunRepository,
    options: &BackfillOptions,
) -> Result<BackfillReport, sqlx::Error> {
    let since = options
        .days
        .map(|days| OffsetDateTime::now_utc() - Duration::days(days));

    let mut report = BackfillReport::default();

    if options.rebuild {
        report.cleared = repo.clear_tag_index(since).await?;
        info!(cleared = report.cleared, "cleared tag index before rebuild");
    }

    let mut after_id = 0;
    loop {
        let chunk = repo
            .backfill_chunk(since, after_id, options.chunk_size)
            .await?;
        let exhausted = (chunk.len() as i64) < options.chunk_size;

        let mut pending: Vec<NewJobTag> = Vec::new();
        for row in &chunk {
            after_id = row.id;
            report.jobs_processed += 1;
            for tag in decode_tags(row.job_tags.as_ref()) {
                let tag = tag.trim().to_string();
                if tag.is_empty() {
                    continue;
                }
                pending.push(NewJobTag {
                    job_id: row.id,
                    tag,
                    created_at: row.created_at,
                });
            }
        }

        for batch in pending.chunks(options.insert_batch as usize) {
            match repo.insert_tag_rows(batch).await {
                Ok(inserted) => report.tags_inserted += inserted,
                Err(err) => {
                    warn!(?err, batch_len = batch.len(), "tag backfill batch failed");
                    report.errors += 1;
                }
            }
        }

        if exhausted {
            break;
        }
    }

    info!(
        jobs = report.jobs_processed,
        tags = report.tags_inserted,
        errors = report.errors,
        "tag index backfill finished"
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::job_run_repository::NewJobRun;
    use crate::db::mock_db::MockJobRunRepository;
    use crate::models::job_run::encode_tags;

    async fn seed(repo: &MockJobRunRepository, count: usize) {
        for i in 0..count {
            repo.insert_run(NewJobRun {
                uuid: format!("u{i}"),
                job_class: "EmailJob".into(),
                status: "processed".into(),
                job_tags: Some(encode_tags(&["email".into(), format!("batch{}", i % 3)])),
                ..Default::default()
            })
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn backfill_inserts_one_row_per_job_tag_pair() {
        let repo = MockJobRunRepository::default();
        seed(&repo, 7).await;

        let report = backfill_tag_index(&repo, &BackfillOptions::default())
            .await
            .unwrap();

        assert_eq!(report.jobs_processed, 7);
        assert_eq!(report.tags_inserted, 14);
        assert_eq!(report.errors, 0);
        assert_eq!(repo.tag_rows.lock().unwrap().len(), 14);
    }

    #[tokio::test]
    async fn rebuild_clears_existing_rows_first() {
        let repo = MockJobRunRepository::default();
        seed(&repo, 3).await;

        backfill_tag_index(&repo, &BackfillOptions::default())
            .await
            .unwrap();
        let report = backfill_tag_index(
            &repo,
            &BackfillOptions {
                rebuild: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(report.cleared, 6);
        // No duplicates after the rebuild.
        assert_eq!(repo.tag_rows.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn additive_mode_appends_without_clearing() {
        let repo = MockJobRunRepository::default();
        seed(&repo, 2).await;

        backfill_tag_index(&repo, &BackfillOptions::default())
            .await
            .unwrap();
        backfill_tag_index(&repo, &BackfillOptions::default())
            .await
            .unwrap();

        assert_eq!(repo.tag_rows.lock().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn small_chunks_cover_everything() {
        let repo = MockJobRunRepository::default();
        seed(&repo, 5).await;

        let report = backfill_tag_index(
            &repo,
            &BackfillOptions {
                chunk_size: 2,
                insert_batch: 3,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(report.jobs_processed, 5);
        assert_eq!(report.tags_inserted, 10);
    }
}
