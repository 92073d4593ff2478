use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::db::job_run_repository::JobRunRepository;
use crate::jobs::QueueClient;

/// One queue's pending depth with a coarse health label for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub depth: i64,
    pub status: &'static str,
}

pub fn health_status(depth: i64) -> &'static str {
    if depth == 0 {
        "healthy"
    } else if depth < 100 {
        "normal"
    } else if depth < 1000 {
        "warning"
    } else {
        "critical"
    }
}

/// Probes the broker for pending-job counts. Probe failures degrade to
/// counting our own live processing rows; an empty answer still yields a
/// default/healthy entry so the dashboard section never disappears.
pub struct QueueDepthChecker {
    queue: Arc<dyn QueueClient>,
    repo: Arc<dyn JobRunRepository>,
}

impl QueueDepthChecker {
    pub fn new(queue: Arc<dyn QueueClient>, repo: Arc<dyn JobRunRepository>) -> Self {
        QueueDepthChecker { queue, repo }
    }

    pub async fn check(&self, queue: Option<&str>) -> BTreeMap<String, QueueHealth> {
        let depths = match self.queue.queue_depths(queue).await {
            Ok(depths) => depths,
            Err(err) => {
                warn!(?err, ?queue, "queue depth probe failed, using processing counts");
                self.processing_fallback(queue).await
            }
        };

        let mut result: BTreeMap<String, QueueHealth> = depths
            .into_iter()
            .map(|(name, depth)| {
                (
                    name,
                    QueueHealth {
                        depth,
                        status: health_status(depth),
                    },
                )
            })
            .collect();

        if result.is_empty() {
            result.insert(
                queue.unwrap_or("default").to_string(),
                QueueHealth {
                    depth: 0,
                    status: "healthy",
                },
            );
        }

        result
    }

    pub async fn total_depth(&self) -> i64 {
        self.check(None).await.values().map(|q| q.depth).sum()
    }

    async fn processing_fallback(&self, queue: Option<&str>) -> BTreeMap<String, i64> {
        match self.repo.processing_counts_by_queue().await {
            Ok(counts) => counts
                .into_iter()
                .map(|row| (row.queue.unwrap_or_else(|| "default".to_string()), row.count))
                .filter(|(name, _)| queue.map(|q| q == name).unwrap_or(true))
                .collect(),
            Err(err) => {
                warn!(?err, "processing-count fallback failed");
                BTreeMap::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::job_run_repository::NewJobRun;
    use crate::db::mock_db::MockJobRunRepository;
    use crate::jobs::queue::MockQueueClient;
    use crate::models::job_run::STATUS_PROCESSING;

    #[test]
    fn health_thresholds() {
        assert_eq!(health_status(0), "healthy");
        assert_eq!(health_status(99), "normal");
        assert_eq!(health_status(100), "warning");
        assert_eq!(health_status(1000), "critical");
    }

    #[tokio::test]
    async fn broker_depths_pass_through_with_labels() {
        let queue = Arc::new(MockQueueClient::default());
        queue.depths.lock().unwrap().insert("mail".into(), 150);
        let checker =
            QueueDepthChecker::new(queue, Arc::new(MockJobRunRepository::default()));

        let result = checker.check(None).await;
        assert_eq!(result["mail"].depth, 150);
        assert_eq!(result["mail"].status, "warning");
    }

    #[tokio::test]
    async fn probe_failure_falls_back_to_processing_counts() {
        let queue = Arc::new(MockQueueClient {
            fail_depths: true,
            ..Default::default()
        });
        let repo = Arc::new(MockJobRunRepository::default());
        repo.insert_run(NewJobRun {
            uuid: "u".into(),
            job_class: "EmailJob".into(),
            queue: Some("mail".into()),
            status: STATUS_PROCESSING.into(),
            ..Default::default()
        })
        .await
        .unwrap();

        let checker = QueueDepthChecker::new(queue, repo);
        let result = checker.check(None).await;
        assert_eq!(result["mail"].depth, 1);
    }

    #[tokio::test]
    async fn empty_answer_degrades_to_default_healthy_entry() {
        let queue = Arc::new(MockQueueClient {
            fail_depths: true,
            ..Default::default()
        });
        let checker =
            QueueDepthChecker::new(queue, Arc::new(MockJobRunRepository::failing()));

        let result = checker.check(None).await;
        assert_eq!(result.len(), 1);
        assert_eq!(result["default"].depth, 0);
        assert_eq!(result["default"].status, "healthy");
    }
}
