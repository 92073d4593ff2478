use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::jobs::{QueueClient, QueueableJob};

/// Database-backed broker adapter: enqueue writes a pending row the workers
/// pick up, depth counts unreserved rows per queue. Brokers with their own
/// transport implement `QueueClient` elsewhere; this is the one we can serve
/// out of the same Postgres.
pub struct PostgresQueueClient {
    pub pool: PgPool,
}

#[async_trait]
impl QueueClient for PostgresQueueClient {
    async fn enqueue(
        &self,
        job: &dyn QueueableJob,
        queue: &str,
        connection: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut command = job.command_data();
        if let Some(retry_of) = job.retry_of() {
            if let Some(fields) = command.as_object_mut() {
                fields.insert("retry_of".to_string(), retry_of.into());
            }
        }

        let payload = json!({
            "uuid": Uuid::new_v4().to_string(),
            "job": job.name(),
            "data": { "command": command },
        });

        sqlx::query(
            r#"
            INSERT INTO queue_jobs (queue, connection, payload, attempts, available_at, created_at)
            VALUES ($1, $2, $3, 0, now(), now())
            "#,
        )
        .bind(queue)
        .bind(connection)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn queue_depths(&self, queue: Option<&str>) -> anyhow::Result<BTreeMap<String, i64>> {
        let rows: Vec<(String, i64)> = if let Some(queue) = queue {
            sqlx::query_as(
                r#"
                SELECT queue, COUNT(*) AS count
                FROM queue_jobs
                WHERE reserved_at IS NULL AND attempts = 0 AND queue = $1
                GROUP BY queue
                "#,
            )
            .bind(queue)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                r#"
                SELECT queue, COUNT(*) AS count
                FROM queue_jobs
                WHERE reserved_at IS NULL AND attempts = 0
                GROUP BY queue
                "#,
            )
            .fetch_all(&self.pool)
            .await?
        };

        let mut depths: BTreeMap<String, i64> = rows.into_iter().collect();
        if let Some(queue) = queue {
            depths.entry(queue.to_string()).or_insert(0);
        }

        Ok(depths)
    }
}
