use std::collections::BTreeMap;

use async_trait::async_trait;

use super::QueueableJob;

/// The one command surface the external queue accepts from us, plus the
/// depth probe the dashboard uses. The broker itself stays a black box.
#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn enqueue(
        &self,
        job: &dyn QueueableJob,
        queue: &str,
        connection: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Pending-job counts per queue; scoped to one queue when given.
    async fn queue_depths(&self, queue: Option<&str>) -> anyhow::Result<BTreeMap<String, i64>>;
}

/// In-memory queue used by tests: records what was enqueued and serves
/// canned depths.
#[derive(Default)]
pub struct MockQueueClient {
    pub enqueued: std::sync::Mutex<Vec<EnqueuedJob>>,
    pub depths: std::sync::Mutex<BTreeMap<String, i64>>,
    pub fail_enqueue: bool,
    pub fail_depths: bool,
}

#[derive(Debug, Clone)]
pub struct EnqueuedJob {
    pub job_class: String,
    pub queue: String,
    pub connection: Option<String>,
    pub retry_of: Option<i64>,
    pub command: serde_json::Value,
}

#[async_trait]
impl QueueClient for MockQueueClient {
    async fn enqueue(
        &self,
        job: &dyn QueueableJob,
        queue: &str,
        connection: Option<&str>,
    ) -> anyhow::Result<()> {
        if self.fail_enqueue {
            anyhow::bail!("mock queue enqueue failure");
        }
        self.enqueued.lock().unwrap().push(EnqueuedJob {
            job_class: job.name().to_string(),
            queue: queue.to_string(),
            connection: connection.map(|c| c.to_string()),
            retry_of: job.retry_of(),
            command: job.command_data(),
        });
        Ok(())
    }

    async fn queue_depths(&self, queue: Option<&str>) -> anyhow::Result<BTreeMap<String, i64>> {
        if self.fail_depths {
            anyhow::bail!("mock queue depth failure");
        }
        let depths = self.depths.lock().unwrap();
        match queue {
            Some(name) => {
                let mut scoped = BTreeMap::new();
                scoped.insert(name.to_string(), depths.get(name).copied().unwrap_or(0));
                Ok(scoped)
            }
            None => Ok(depths.clone()),
        }
    }
}
