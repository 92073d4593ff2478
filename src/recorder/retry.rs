use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::MonitorConfig;
use crate::db::job_run_repository::JobRunRepository;
use crate::jobs::{JobRegistry, QueueClient};
use crate::models::job_run::STATUS_FAILED;
use crate::support::payload;

/// Why a retry was refused, phrased for the operator who asked for it.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("job run {0} not found")]
    NotFound(i64),
    #[error("job run {id} is {status}; only failed runs can be retried")]
    NotFailed { id: i64, status: String },
    #[error("job class {0} is not a registered job type")]
    UnknownJobClass(String),
    #[error("stored payload could not be restored to the expected job type")]
    RestoreFailed,
    #[error("failed to enqueue retried job")]
    Enqueue(#[source] anyhow::Error),
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

/// Re-submits a previously captured failed run to the external queue. Never
/// creates or mutates a JobRun itself; the retried execution is recorded
/// independently when its own start event arrives.
pub struct JobRetrier {
    repo: Arc<dyn JobRunRepository>,
    registry: Arc<JobRegistry>,
    queue: Arc<dyn QueueClient>,
    config: Arc<MonitorConfig>,
}

impl JobRetrier {
    pub fn new(
        repo: Arc<dyn JobRunRepository>,
        registry: Arc<JobRegistry>,
        queue: Arc<dyn QueueClient>,
        config: Arc<MonitorConfig>,
    ) -> Self {
        JobRetrier {
            repo,
            registry,
            queue,
            config,
        }
    }

    pub async fn retry(&self, run_id: i64) -> Result<(), RetryError> {
        let run = self
            .repo
            .find_by_id(run_id)
            .await?
            .ok_or(RetryError::NotFound(run_id))?;

        if run.status != STATUS_FAILED {
            return Err(RetryError::NotFailed {
                id: run.id,
                status: run.status.clone(),
            });
        }

        if !self.registry.contains(&run.job_class) {
            return Err(RetryError::UnknownJobClass(run.job_class.clone()));
        }

        let mut job = match &run.payload {
            // A payload exists: restoration is restricted to exactly the
            // stored class. A mismatch is a tamper/corruption signal and
            // refuses; there is no laxer fallback.
            Some(stored) => payload::restore_job(stored, &run.job_class, &self.registry)
                .ok_or(RetryError::RestoreFailed)?,
            // No payload was ever captured: a bare default instance is the
            // best we can do, when configured to allow it.
            None => {
                if !self.config.retry_default_construct {
                    return Err(RetryError::RestoreFailed);
                }
                warn!(
                    id = run.id,
                    job_class = %run.job_class,
                    "no stored payload, retrying with default-constructed job"
                );
                self.registry
                    .construct_default(&run.job_class)
                    .ok_or(RetryError::RestoreFailed)?
            }
        };

        job.set_retry_of(run.id);

        let queue = run.queue.as_deref().unwrap_or("default");
        self.queue
            .enqueue(job.as_ref(), queue, run.connection.as_deref())
            .await
            .map_err(RetryError::Enqueue)?;

        info!(id = run.id, job_class = %run.job_class, queue, "retried failed job");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::job_run_repository::NewJobRun;
    use crate::db::mock_db::MockJobRunRepository;
    use crate::jobs::queue::MockQueueClient;
    use crate::jobs::testing::registry_with_report_job;
    use crate::models::job_run::{STATUS_PROCESSED, STATUS_PROCESSING};
    use serde_json::json;

    struct Fixture {
        repo: Arc<MockJobRunRepository>,
        queue: Arc<MockQueueClient>,
        retrier: JobRetrier,
    }

    fn fixture(config: MonitorConfig) -> Fixture {
        let repo = Arc::new(MockJobRunRepository::default());
        let queue = Arc::new(MockQueueClient::default());
        let retrier = JobRetrier::new(
            repo.clone(),
            Arc::new(registry_with_report_job()),
            queue.clone(),
            Arc::new(config),
        );
        Fixture {
            repo,
            queue,
            retrier,
        }
    }

    async fn insert_failed_run(
        repo: &MockJobRunRepository,
        job_class: &str,
        payload: Option<serde_json::Value>,
    ) -> i64 {
        let run = repo
            .insert_run(NewJobRun {
                uuid: "u-retry".into(),
                job_class: job_class.into(),
                queue: Some("reports".into()),
                connection: Some("database".into()),
                attempt: 1,
                status: STATUS_FAILED.into(),
                payload,
                ..Default::default()
            })
            .await
            .unwrap();
        run.id
    }

    fn stored_payload(report_id: i64) -> serde_json::Value {
        json!({"raw_payload": {"data": {"command": {"report_id": report_id}}}})
    }

    #[tokio::test]
    async fn retry_preserves_constructor_fields_and_sets_marker() {
        let f = fixture(MonitorConfig::default());
        let id = insert_failed_run(&f.repo, "ReportJob", Some(stored_payload(9))).await;

        f.retrier.retry(id).await.unwrap();

        let enqueued = f.queue.enqueued.lock().unwrap();
        assert_eq!(enqueued.len(), 1);
        assert_eq!(enqueued[0].job_class, "ReportJob");
        assert_eq!(enqueued[0].queue, "reports");
        assert_eq!(enqueued[0].connection.as_deref(), Some("database"));
        assert_eq!(enqueued[0].retry_of, Some(id));
        assert_eq!(enqueued[0].command["report_id"], 9);
    }

    #[tokio::test]
    async fn retry_refuses_missing_run() {
        let f = fixture(MonitorConfig::default());
        assert!(matches!(
            f.retrier.retry(999).await,
            Err(RetryError::NotFound(999))
        ));
    }

    #[tokio::test]
    async fn retry_refuses_non_failed_statuses() {
        let f = fixture(MonitorConfig::default());
        for status in [STATUS_PROCESSING, STATUS_PROCESSED] {
            let run = f
                .repo
                .insert_run(NewJobRun {
                    uuid: "u".into(),
                    job_class: "ReportJob".into(),
                    status: status.into(),
                    ..Default::default()
                })
                .await
                .unwrap();
            assert!(matches!(
                f.retrier.retry(run.id).await,
                Err(RetryError::NotFailed { .. })
            ));
        }
    }

    #[tokio::test]
    async fn retry_refuses_unregistered_job_class() {
        let f = fixture(MonitorConfig::default());
        let id = insert_failed_run(&f.repo, "GhostJob", Some(stored_payload(1))).await;
        assert!(matches!(
            f.retrier.retry(id).await,
            Err(RetryError::UnknownJobClass(_))
        ));
    }

    #[tokio::test]
    async fn corrupt_payload_refuses_instead_of_falling_back() {
        let f = fixture(MonitorConfig::default());
        let id = insert_failed_run(
            &f.repo,
            "ReportJob",
            Some(json!({"raw_payload": {"data": {"command": "not-an-object"}}})),
        )
        .await;

        assert!(matches!(
            f.retrier.retry(id).await,
            Err(RetryError::RestoreFailed)
        ));
        assert!(f.queue.enqueued.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_payload_falls_back_to_default_when_allowed() {
        let f = fixture(MonitorConfig::default());
        let id = insert_failed_run(&f.repo, "ReportJob", None).await;

        f.retrier.retry(id).await.unwrap();

        let enqueued = f.queue.enqueued.lock().unwrap();
        assert_eq!(enqueued.len(), 1);
        assert_eq!(enqueued[0].retry_of, Some(id));
    }

    #[tokio::test]
    async fn missing_payload_refuses_when_fallback_disabled() {
        let config = MonitorConfig {
            retry_default_construct: false,
            ..Default::default()
        };
        let f = fixture(config);
        let id = insert_failed_run(&f.repo, "ReportJob", None).await;

        assert!(matches!(
            f.retrier.retry(id).await,
            Err(RetryError::RestoreFailed)
        ));
    }

    #[tokio::test]
    async fn retried_execution_records_with_chain_link() {
        use crate::recorder::JobRecorder;
        use crate::support::baseline::BaselineStore;

        let f = fixture(MonitorConfig::default());
        let id = insert_failed_run(&f.repo, "ReportJob", Some(stored_payload(9))).await;

        f.retrier.retry(id).await.unwrap();

        // Feed the enqueued job back through the recorder as if the queue
        // had started executing it.
        let enqueued = f.queue.enqueued.lock().unwrap().remove(0);
        let mut command = enqueued.command.clone();
        command["retry_of"] = json!(enqueued.retry_of);
        let event = crate::jobs::JobEvent {
            uuid: Some("u-retried".into()),
            job_id: None,
            job_class: enqueued.job_class.clone(),
            queue: Some(enqueued.queue.clone()),
            connection: enqueued.connection.clone(),
            attempt: 1,
            payload: json!({"data": {"command": command}}),
            released: false,
        };

        let recorder = JobRecorder::new(
            f.repo.clone(),
            Arc::new(registry_with_report_job()),
            Arc::new(BaselineStore::default()),
            Arc::new(MonitorConfig::default()),
        );
        recorder.on_job_started(&event).await;

        let new_run = f
            .repo
            .find_processing_by_uuid("u-retried")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(new_run.retried_from_id, Some(id));
        assert_eq!(new_run.job_class, "ReportJob");
    }

    #[tokio::test]
    async fn enqueue_failure_surfaces_as_retry_error() {
        let repo = Arc::new(MockJobRunRepository::default());
        let queue = Arc::new(MockQueueClient {
            fail_enqueue: true,
            ..Default::default()
        });
        let retrier = JobRetrier::new(
            repo.clone(),
            Arc::new(registry_with_report_job()),
            queue,
            Arc::new(MonitorConfig::default()),
        );
        let id = insert_failed_run(&repo, "ReportJob", Some(stored_payload(1))).await;

        assert!(matches!(
            retrier.retry(id).await,
            Err(RetryError::Enqueue(_))
        ));
    }
}
