use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::db::job_run_repository::{
    BackfillRow, ClassDurationStats, ClassFailureCount, ClassResourceStats, ExceptionCount,
    HourBucket, JobRunRepository, NewJobRun, OverviewStats, PruneOutcome, QueueProcessingCount,
    RunCompletion, TagCountRow, TagScanRow, TagStatsRow,
};
use crate::models::job_run::{JobRun, JobRunSummary, STATUS_PROCESSING};
use crate::models::job_tag::NewJobTag;

const JOB_RUN_COLUMNS: &str = "id, uuid, job_class, queue, connection, attempt, status, \
     started_at, finished_at, duration_ms, retried_from_id, \
     exception_class, exception_message, stack, payload, job_tags, \
     memory_start_bytes, memory_end_bytes, memory_peak_start_bytes, \
     memory_peak_end_bytes, memory_peak_delta_bytes, cpu_user_ms, cpu_sys_ms, \
     created_at, updated_at";

const JOB_RUN_SUMMARY_COLUMNS: &str = "id, uuid, job_class, queue, connection, attempt, status, \
     started_at, finished_at, duration_ms, retried_from_id, \
     exception_class, exception_message, job_tags, created_at";

pub struct PostgresJobRunRepository {
    pub pool: PgPool,
}

#[async_trait]
impl JobRunRepository for PostgresJobRunRepository {
    async fn insert_run(&self, new_run: NewJobRun) -> Result<JobRun, sqlx::Error> {
        let sql = format!(
            r#"
            INSERT INTO job_runs (
                uuid, job_class, queue, connection, attempt, status,
                started_at, finished_at, duration_ms, retried_from_id,
                exception_class, exception_message, stack, payload, job_tags,
                memory_start_bytes, memory_peak_start_bytes, memory_end_bytes,
                memory_peak_end_bytes, cpu_user_ms, cpu_sys_ms,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21, now(), now())
            RETURNING {JOB_RUN_COLUMNS}
            "#
        );

        let result = sqlx::query_as::<_, JobRun>(&sql)
            .bind(&new_run.uuid)
            .bind(&new_run.job_class)
            .bind(&new_run.queue)
            .bind(&new_run.connection)
            .bind(new_run.attempt)
            .bind(&new_run.status)
            .bind(new_run.started_at)
            .bind(new_run.finished_at)
            .bind(new_run.duration_ms)
            .bind(new_run.retried_from_id)
            .bind(&new_run.exception_class)
            .bind(&new_run.exception_message)
            .bind(&new_run.stack)
            .bind(&new_run.payload)
            .bind(&new_run.job_tags)
            .bind(new_run.memory_start_bytes)
            .bind(new_run.memory_peak_start_bytes)
            .bind(new_run.memory_end_bytes)
            .bind(new_run.memory_peak_end_bytes)
            .bind(new_run.cpu_user_ms)
            .bind(new_run.cpu_sys_ms)
            .fetch_one(&self.pool)
            .await?;

        Ok(result)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<JobRun>, sqlx::Error> {
        let sql = format!("SELECT {JOB_RUN_COLUMNS} FROM job_runs WHERE id = $1");

        sqlx::query_as::<_, JobRun>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn find_processing_by_uuid(&self, uuid: &str) -> Result<Option<JobRun>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {JOB_RUN_COLUMNS}
            FROM job_runs
            WHERE uuid = $1 AND status = $2
            ORDER BY id
            LIMIT 1
            "#
        );

        sqlx::query_as::<_, JobRun>(&sql)
            .bind(uuid)
            .bind(STATUS_PROCESSING)
            .fetch_optional(&self.pool)
            .await
    }

    async fn find_recent_processing(
        &self,
        job_class: &str,
        queue: Option<&str>,
        connection: Option<&str>,
        cutoff: OffsetDateTime,
    ) -> Result<Option<JobRun>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {JOB_RUN_COLUMNS}
            FROM job_runs
            WHERE job_class = $1
              AND queue IS NOT DISTINCT FROM $2
              AND connection IS NOT DISTINCT FROM $3
              AND status = $4
              AND created_at > $5
            ORDER BY id DESC
            LIMIT 1
            "#
        );

        sqlx::query_as::<_, JobRun>(&sql)
            .bind(job_class)
            .bind(queue)
            .bind(connection)
            .bind(STATUS_PROCESSING)
            .bind(cutoff)
            .fetch_optional(&self.pool)
            .await
    }

    async fn complete_run(
        &self,
        id: i64,
        completion: RunCompletion,
    ) -> Result<Option<JobRun>, sqlx::Error> {
        let sql = format!(
            r#"
            UPDATE job_runs
            SET status = $2,
                finished_at = $3,
                duration_ms = $4,
                memory_end_bytes = $5,
                memory_peak_end_bytes = $6,
                memory_peak_delta_bytes = $7,
                cpu_user_ms = $8,
                cpu_sys_ms = $9,
                exception_class = $10,
                exception_message = $11,
                stack = $12,
                updated_at = now()
            WHERE id = $1
            RETURNING {JOB_RUN_COLUMNS}
            "#
        );

        sqlx::query_as::<_, JobRun>(&sql)
            .bind(id)
            .bind(&completion.status)
            .bind(completion.finished_at)
            .bind(completion.duration_ms)
            .bind(completion.memory_end_bytes)
            .bind(completion.memory_peak_end_bytes)
            .bind(completion.memory_peak_delta_bytes)
            .bind(completion.cpu_user_ms)
            .bind(completion.cpu_sys_ms)
            .bind(&completion.exception_class)
            .bind(&completion.exception_message)
            .bind(&completion.stack)
            .fetch_optional(&self.pool)
            .await
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<JobRunSummary>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {JOB_RUN_SUMMARY_COLUMNS}
            FROM job_runs
            ORDER BY id DESC
            LIMIT $1
            "#
        );

        sqlx::query_as::<_, JobRunSummary>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }

    async fn list_by_status(
        &self,
        status: &str,
        limit: i64,
    ) -> Result<Vec<JobRunSummary>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {JOB_RUN_SUMMARY_COLUMNS}
            FROM job_runs
            WHERE status = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#
        );

        sqlx::query_as::<_, JobRunSummary>(&sql)
            .bind(status)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }

    async fn list_by_tag(
        &self,
        tag: &str,
        limit: i64,
    ) -> Result<Vec<JobRunSummary>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {JOB_RUN_SUMMARY_COLUMNS}
            FROM job_runs
            WHERE job_tags IS NOT NULL
              AND jsonb_exists(job_tags, $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#
        );

        sqlx::query_as::<_, JobRunSummary>(&sql)
            .bind(tag.to_lowercase())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }

    async fn statistics(&self, since: OffsetDateTime) -> Result<OverviewStats, sqlx::Error> {
        sqlx::query_as::<_, OverviewStats>(
            r#"
            SELECT COUNT(*) AS total,
                   COALESCE(SUM(CASE WHEN status = 'processed' THEN 1 ELSE 0 END), 0) AS processed,
                   COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                   COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0) AS processing,
                   AVG(duration_ms)::float8 AS avg_duration_ms
            FROM job_runs
            WHERE created_at > $1
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await
    }

    async fn jobs_by_hour(&self, since: OffsetDateTime) -> Result<Vec<HourBucket>, sqlx::Error> {
        sqlx::query_as::<_, HourBucket>(
            r#"
            SELECT to_char(created_at, 'YYYY-MM-DD HH24:00:00') AS hour,
                   COUNT(*) AS count,
                   COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed_count
            FROM job_runs
            WHERE created_at > $1
            GROUP BY 1
            ORDER BY 1
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
    }

    async fn top_failing_jobs(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<ClassFailureCount>, sqlx::Error> {
        sqlx::query_as::<_, ClassFailureCount>(
            r#"
            SELECT job_class, COUNT(*) AS failure_count
            FROM job_runs
            WHERE created_at > $1 AND status = 'failed'
            GROUP BY job_class
            ORDER BY failure_count DESC
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn top_exceptions(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<ExceptionCount>, sqlx::Error> {
        sqlx::query_as::<_, ExceptionCount>(
            r#"
            SELECT exception_class, COUNT(*) AS count
            FROM job_runs
            WHERE created_at > $1 AND exception_class IS NOT NULL
            GROUP BY exception_class
            ORDER BY count DESC
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn slowest_jobs(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<ClassDurationStats>, sqlx::Error> {
        sqlx::query_as::<_, ClassDurationStats>(
            r#"
            SELECT job_class,
                   AVG(duration_ms)::float8 AS avg_duration_ms,
                   MAX(duration_ms) AS max_duration_ms,
                   COUNT(*) AS count
            FROM job_runs
            WHERE created_at > $1 AND duration_ms IS NOT NULL
            GROUP BY job_class
            ORDER BY avg_duration_ms DESC
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn heaviest_jobs(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<ClassResourceStats>, sqlx::Error> {
        sqlx::query_as::<_, ClassResourceStats>(
            r#"
            SELECT job_class,
                   AVG(memory_peak_delta_bytes)::float8 AS avg_peak_delta_bytes,
                   AVG(COALESCE(cpu_user_ms, 0) + COALESCE(cpu_sys_ms, 0))::float8 AS avg_cpu_total_ms,
                   COUNT(*) AS count
            FROM job_runs
            WHERE created_at > $1
              AND (memory_peak_delta_bytes IS NOT NULL
                   OR cpu_user_ms IS NOT NULL
                   OR cpu_sys_ms IS NOT NULL)
            GROUP BY job_class
            ORDER BY avg_peak_delta_bytes DESC NULLS LAST
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn processing_counts_by_queue(
        &self,
    ) -> Result<Vec<QueueProcessingCount>, sqlx::Error> {
        sqlx::query_as::<_, QueueProcessingCount>(
            r#"
            SELECT queue, COUNT(*) AS count
            FROM job_runs
            WHERE status = 'processing'
            GROUP BY queue
            "#,
        )
        .fetch_all(&self.pool)
        .await
    }

    async fn insert_tag_rows(&self, rows: &[NewJobTag]) -> Result<u64, sqlx::Error> {
        if rows.is_empty() {
            return Ok(0);
        }

        let job_ids: Vec<i64> = rows.iter().map(|r| r.job_id).collect();
        let tags: Vec<String> = rows.iter().map(|r| r.tag.clone()).collect();
        let created: Vec<OffsetDateTime> = rows.iter().map(|r| r.created_at).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO job_run_tags (job_id, tag, created_at)
            SELECT * FROM UNNEST($1::bigint[], $2::text[], $3::timestamptz[])
            "#,
        )
        .bind(&job_ids)
        .bind(&tags)
        .bind(&created)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn tag_index_populated(&self) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM job_run_tags)")
            .fetch_one(&self.pool)
            .await
    }

    async fn clear_tag_index(
        &self,
        created_after: Option<OffsetDateTime>,
    ) -> Result<u64, sqlx::Error> {
        let result = if let Some(after) = created_after {
            sqlx::query("DELETE FROM job_run_tags WHERE created_at > $1")
                .bind(after)
                .execute(&self.pool)
                .await?
        } else {
            sqlx::query("DELETE FROM job_run_tags")
                .execute(&self.pool)
                .await?
        };

        Ok(result.rows_affected())
    }

    fn supports_json_aggregation(&self) -> bool {
        // jsonb_array_elements_text is available on every Postgres we run.
        true
    }

    async fn top_tags_indexed(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<TagCountRow>, sqlx::Error> {
        sqlx::query_as::<_, TagCountRow>(
            r#"
            SELECT t.tag,
                   COUNT(*) AS total,
                   COALESCE(SUM(CASE WHEN j.status = 'processed' THEN 1 ELSE 0 END), 0) AS processed,
                   COALESCE(SUM(CASE WHEN j.status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                   COALESCE(SUM(CASE WHEN j.status = 'processing' THEN 1 ELSE 0 END), 0) AS processing
            FROM job_run_tags t
            INNER JOIN job_runs j ON j.id = t.job_id
            WHERE j.created_at > $1
            GROUP BY t.tag
            ORDER BY total DESC, t.tag
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn tag_stats_indexed(
        &self,
        since: OffsetDateTime,
    ) -> Result<Vec<TagStatsRow>, sqlx::Error> {
        sqlx::query_as::<_, TagStatsRow>(
            r#"
            SELECT t.tag,
                   COUNT(*) AS total,
                   COALESCE(SUM(CASE WHEN j.status = 'processed' THEN 1 ELSE 0 END), 0) AS processed,
                   COALESCE(SUM(CASE WHEN j.status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                   COALESCE(SUM(CASE WHEN j.status = 'processing' THEN 1 ELSE 0 END), 0) AS processing,
                   AVG(j.duration_ms)::float8 AS avg_duration_ms
            FROM job_run_tags t
            INNER JOIN job_runs j ON j.id = t.job_id
            WHERE j.created_at > $1
            GROUP BY t.tag
            ORDER BY total DESC, t.tag
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
    }

    async fn top_tags_json(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<TagCountRow>, sqlx::Error> {
        sqlx::query_as::<_, TagCountRow>(
            r#"
            SELECT tag,
                   COUNT(*) AS total,
                   COALESCE(SUM(CASE WHEN j.status = 'processed' THEN 1 ELSE 0 END), 0) AS processed,
                   COALESCE(SUM(CASE WHEN j.status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                   COALESCE(SUM(CASE WHEN j.status = 'processing' THEN 1 ELSE 0 END), 0) AS processing
            FROM job_runs j,
            LATERAL jsonb_array_elements_text(j.job_tags) AS tag
            WHERE j.created_at > $1 AND j.job_tags IS NOT NULL
            GROUP BY tag
            ORDER BY total DESC, tag
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn tag_stats_json(
        &self,
        since: OffsetDateTime,
    ) -> Result<Vec<TagStatsRow>, sqlx::Error> {
        sqlx::query_as::<_, TagStatsRow>(
            r#"
            SELECT tag,
                   COUNT(*) AS total,
                   COALESCE(SUM(CASE WHEN j.status = 'processed' THEN 1 ELSE 0 END), 0) AS processed,
                   COALESCE(SUM(CASE WHEN j.status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                   COALESCE(SUM(CASE WHEN j.status = 'processing' THEN 1 ELSE 0 END), 0) AS processing,
                   AVG(j.duration_ms)::float8 AS avg_duration_ms
            FROM job_runs j,
            LATERAL jsonb_array_elements_text(j.job_tags) AS tag
            WHERE j.created_at > $1 AND j.job_tags IS NOT NULL
            GROUP BY tag
            ORDER BY total DESC, tag
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
    }

    async fn scan_tagged_runs(
        &self,
        since: OffsetDateTime,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<TagScanRow>, sqlx::Error> {
        sqlx::query_as::<_, TagScanRow>(
            r#"
            SELECT id, status, duration_ms, job_tags
            FROM job_runs
            WHERE created_at > $1 AND job_tags IS NOT NULL AND id > $2
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(since)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn prune_runs(
        &self,
        cutoff: OffsetDateTime,
        status: Option<&str>,
        include_processing: bool,
        chunk_size: i64,
    ) -> Result<PruneOutcome, sqlx::Error> {
        let mut outcome = PruneOutcome::default();

        loop {
            let ids: Vec<i64> = if let Some(status) = status {
                sqlx::query_scalar(
                    r#"
                    SELECT id FROM job_runs
                    WHERE created_at < $1 AND status = $2
                    ORDER BY id
                    LIMIT $3
                    "#,
                )
                .bind(cutoff)
                .bind(status)
                .bind(chunk_size)
                .fetch_all(&self.pool)
                .await?
            } else if include_processing {
                sqlx::query_scalar(
                    r#"
                    SELECT id FROM job_runs
                    WHERE created_at < $1
                    ORDER BY id
                    LIMIT $2
                    "#,
                )
                .bind(cutoff)
                .bind(chunk_size)
                .fetch_all(&self.pool)
                .await?
            } else {
                sqlx::query_scalar(
                    r#"
                    SELECT id FROM job_runs
                    WHERE created_at < $1 AND status <> 'processing'
                    ORDER BY id
                    LIMIT $2
                    "#,
                )
                .bind(cutoff)
                .bind(chunk_size)
                .fetch_all(&self.pool)
                .await?
            };

            if ids.is_empty() {
                break;
            }

            // Orphan retry children before their parents disappear so the
            // chain never dangles.
            let orphaned = sqlx::query(
                "UPDATE job_runs SET retried_from_id = NULL WHERE retried_from_id = ANY($1)",
            )
            .bind(&ids)
            .execute(&self.pool)
            .await?
            .rows_affected();

            let deleted = sqlx::query("DELETE FROM job_runs WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&self.pool)
                .await?
                .rows_affected();

            outcome.orphaned_children += orphaned;
            outcome.deleted += deleted;

            if (ids.len() as i64) < chunk_size {
                break;
            }
        }

        Ok(outcome)
    }

    async fn sweep_stuck_runs(
        &self,
        started_before: OffsetDateTime,
        message: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET status = 'failed',
                finished_at = now(),
                exception_class = 'TimeoutException',
                exception_message = $2,
                updated_at = now()
            WHERE status = 'processing' AND started_at < $1
            "#,
        )
        .bind(started_before)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn backfill_chunk(
        &self,
        since: Option<OffsetDateTime>,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<BackfillRow>, sqlx::Error> {
        if let Some(since) = since {
            sqlx::query_as::<_, BackfillRow>(
                r#"
                SELECT id, job_tags, created_at
                FROM job_runs
                WHERE job_tags IS NOT NULL AND created_at > $1 AND id > $2
                ORDER BY id
                LIMIT $3
                "#,
            )
            .bind(since)
            .bind(after_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, BackfillRow>(
                r#"
                SELECT id, job_tags, created_at
                FROM job_runs
                WHERE job_tags IS NOT NULL AND id > $1
                ORDER BY id
                LIMIT $2
                "#,
            )
            .bind(after_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
    }
}
