//! The lifecycle recorder: three handlers that turn the queue's
//! start/success/failure events into job_runs rows. Recording is strictly
//! additive observation: every internal fault here degrades and logs
//! instead of propagating into the job being observed.

pub mod retry;

use std::sync::Arc;

use rand::Rng;
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::db::job_run_repository::{JobRunRepository, NewJobRun, RunCompletion};
use crate::jobs::{JobEvent, JobFailure, JobRegistry, QueueableJob};
use crate::models::job_run::{
    encode_tags, truncate_chars, JobRun, MAX_EXCEPTION_MESSAGE_LEN, MAX_STACK_LEN,
    STATUS_FAILED, STATUS_PROCESSED, STATUS_PROCESSING,
};
use crate::models::job_tag::NewJobTag;
use crate::support::baseline::BaselineStore;
use crate::support::payload;
use crate::support::tags;
use crate::support::telemetry::{self, TelemetrySnapshot};

/// How far back the no-stable-id heuristic match may reach. Kept tight so
/// concurrent identical jobs rarely cross-match.
const HEURISTIC_MATCH_WINDOW: Duration = Duration::seconds(60);

pub struct JobRecorder {
    repo: Arc<dyn JobRunRepository>,
    registry: Arc<JobRegistry>,
    baselines: Arc<BaselineStore>,
    config: Arc<MonitorConfig>,
}

impl JobRecorder {
    pub fn new(
        repo: Arc<dyn JobRunRepository>,
        registry: Arc<JobRegistry>,
        baselines: Arc<BaselineStore>,
        config: Arc<MonitorConfig>,
    ) -> Self {
        JobRecorder {
            repo,
            registry,
            baselines,
            config,
        }
    }

    /// Always creates a fresh processing row; the end handlers find it again
    /// through the correlation key.
    pub async fn on_job_started(&self, event: &JobEvent) {
        if !self.config.enabled {
            return;
        }

        let uuid = self.best_uuid(event);

        let mut start_snapshot = TelemetrySnapshot::default();
        let telemetry_cfg = &self.config.telemetry;
        if telemetry_cfg.enabled && rand::rng().random::<f64>() <= telemetry_cfg.sample_rate {
            start_snapshot = telemetry::capture_snapshot(telemetry_cfg.capture_cpu);

            // CPU baseline lives in memory only; its loss costs us a delta,
            // nothing else.
            if let (Some(user), Some(sys)) =
                (start_snapshot.cpu_user_micros, start_snapshot.cpu_sys_micros)
            {
                self.baselines.set(&uuid, user, sys);
            }
        }

        let job = self.restore_from_envelope(event);
        let declared_tags = job.as_ref().map(|j| j.tags()).unwrap_or_default();
        let job_tags = tags::extract_tags(
            event,
            &declared_tags,
            &self.config.tagging,
            &self.config.environment,
        );
        let command_data = job.as_ref().map(|j| j.command_data());
        let stored_payload =
            payload::extract_payload(event, command_data.as_ref(), &self.config.payload);
        let retry_of = self.extract_retry_of(event, job.as_deref());

        let now = OffsetDateTime::now_utc();
        let new_run = NewJobRun {
            uuid: uuid.clone(),
            job_class: event.job_class.clone(),
            queue: event.queue.clone(),
            connection: event.connection.clone(),
            attempt: event.attempt,
            status: STATUS_PROCESSING.to_string(),
            started_at: Some(now),
            retried_from_id: retry_of,
            payload: stored_payload,
            job_tags: job_tags.as_deref().map(encode_tags),
            memory_start_bytes: start_snapshot.memory_bytes,
            memory_peak_start_bytes: start_snapshot.peak_memory_bytes,
            ..Default::default()
        };

        let run = match self.repo.insert_run(new_run).await {
            Ok(run) => run,
            Err(err) => {
                error!(?err, job_class = %event.job_class, %uuid, "failed to record job start");
                return;
            }
        };

        // Eagerly denormalize tags so aggregation's fast path stays current.
        if let Some(tags) = &job_tags {
            let rows: Vec<NewJobTag> = tags
                .iter()
                .map(|tag| NewJobTag {
                    job_id: run.id,
                    tag: tag.clone(),
                    created_at: run.created_at,
                })
                .collect();
            if let Err(err) = self.repo.insert_tag_rows(&rows).await {
                warn!(?err, job_id = run.id, "failed to insert job tag index rows");
            }
        }
    }

    pub async fn on_job_succeeded(&self, event: &JobEvent) {
        if !self.config.enabled {
            return;
        }

        // Rate-limited jobs get "processed" only to be released right back
        // onto the queue; recording them would poison the success stats.
        if event.released {
            debug!(job_class = %event.job_class, "job was released, skipping processed record");
            return;
        }

        let uuid = self.best_uuid(event);
        let row = self.locate_processing(event, &uuid).await;
        let now = OffsetDateTime::now_utc();

        match row {
            Some(row) => {
                let completion =
                    self.build_completion(&row, &uuid, now, STATUS_PROCESSED, None);
                match self.repo.complete_run(row.id, completion).await {
                    Ok(Some(updated)) => {
                        debug!(
                            id = updated.id,
                            job_class = %updated.job_class,
                            duration_ms = ?updated.duration_ms,
                            "job completed"
                        );
                    }
                    Ok(None) => {
                        warn!(id = row.id, "processing record vanished before completion")
                    }
                    Err(err) => error!(?err, id = row.id, "failed to record job success"),
                }
            }
            None => {
                // The start event was missed (recorder down or disabled
                // mid-run). A terminal record is better than silence.
                warn!(job_class = %event.job_class, %uuid, "no processing record found, creating new");
                self.insert_terminal(event, &uuid, now, STATUS_PROCESSED, None)
                    .await;
            }
        }
    }

    pub async fn on_job_failed(&self, event: &JobEvent, failure: &JobFailure) {
        if !self.config.enabled {
            return;
        }

        let uuid = self.best_uuid(event);
        let row = self.locate_processing(event, &uuid).await;
        let now = OffsetDateTime::now_utc();

        let recorded_id = match row {
            Some(row) => {
                let completion =
                    self.build_completion(&row, &uuid, now, STATUS_FAILED, Some(failure));
                match self.repo.complete_run(row.id, completion).await {
                    Ok(Some(updated)) => Some(updated.id),
                    Ok(None) => {
                        warn!(id = row.id, "processing record vanished before failure update");
                        None
                    }
                    Err(err) => {
                        error!(?err, id = row.id, "failed to record job failure");
                        None
                    }
                }
            }
            None => {
                warn!(
                    job_class = %event.job_class,
                    %uuid,
                    "no processing record found for failed job, creating new"
                );
                self.insert_terminal(event, &uuid, now, STATUS_FAILED, Some(failure))
                    .await
            }
        };

        if let Some(id) = recorded_id {
            info!(
                id,
                job_class = %event.job_class,
                exception = %failure.exception_class,
                "job failed"
            );
        }

        // Delivery belongs to the external notifier; we just hand it the
        // configured targets.
        let notify = &self.config.notify;
        if notify.email.is_some() || notify.slack_webhook.is_some() {
            info!(
                email = ?notify.email,
                slack = ?notify.slack_webhook,
                job_class = %event.job_class,
                "dispatching failure notification"
            );
        }
    }

    /// Stable key from the queue when it has one, otherwise a fresh uuid.
    /// A generated uuid can never match at end-time and falls through to
    /// terminal-record creation.
    fn best_uuid(&self, event: &JobEvent) -> String {
        match event.correlation_key() {
            Some(key) => key.to_string(),
            None => Uuid::new_v4().to_string(),
        }
    }

    async fn locate_processing(&self, event: &JobEvent, uuid: &str) -> Option<JobRun> {
        if event.correlation_key().is_some() {
            match self.repo.find_processing_by_uuid(uuid).await {
                Ok(row) => row,
                Err(err) => {
                    error!(?err, %uuid, "correlation lookup failed");
                    None
                }
            }
        } else {
            // No stable id: newest same-shaped processing row inside the
            // match window. Racy under concurrent identical jobs; accepted.
            let cutoff = OffsetDateTime::now_utc() - HEURISTIC_MATCH_WINDOW;
            match self
                .repo
                .find_recent_processing(
                    &event.job_class,
                    event.queue.as_deref(),
                    event.connection.as_deref(),
                    cutoff,
                )
                .await
            {
                Ok(row) => row,
                Err(err) => {
                    error!(?err, job_class = %event.job_class, "heuristic lookup failed");
                    None
                }
            }
        }
    }

    fn build_completion(
        &self,
        row: &JobRun,
        uuid: &str,
        now: OffsetDateTime,
        status: &str,
        failure: Option<&JobFailure>,
    ) -> RunCompletion {
        let end_snapshot = self.end_snapshot();
        let (cpu_user_ms, cpu_sys_ms) = self.cpu_deltas(uuid, &end_snapshot);

        let duration_ms = row
            .started_at
            .map(|started| ((now - started).whole_milliseconds() as i64).max(0));

        let memory_peak_delta_bytes = match (row.memory_peak_start_bytes, end_snapshot.peak_memory_bytes)
        {
            (Some(start), Some(end)) => Some(telemetry::peak_delta_bytes(start, end)),
            _ => None,
        };

        RunCompletion {
            status: status.to_string(),
            finished_at: now,
            duration_ms,
            memory_end_bytes: end_snapshot.memory_bytes,
            memory_peak_end_bytes: end_snapshot.peak_memory_bytes,
            memory_peak_delta_bytes,
            cpu_user_ms,
            cpu_sys_ms,
            exception_class: failure.map(|f| f.exception_class.clone()),
            exception_message: failure
                .map(|f| truncate_chars(&f.message, MAX_EXCEPTION_MESSAGE_LEN)),
            stack: failure.map(|f| truncate_chars(&f.stack, MAX_STACK_LEN)),
        }
    }

    async fn insert_terminal(
        &self,
        event: &JobEvent,
        uuid: &str,
        now: OffsetDateTime,
        status: &str,
        failure: Option<&JobFailure>,
    ) -> Option<i64> {
        let end_snapshot = self.end_snapshot();
        let (cpu_user_ms, cpu_sys_ms) = self.cpu_deltas(uuid, &end_snapshot);

        let job = self.restore_from_envelope(event);
        let declared_tags = job.as_ref().map(|j| j.tags()).unwrap_or_default();
        let job_tags = tags::extract_tags(
            event,
            &declared_tags,
            &self.config.tagging,
            &self.config.environment,
        );
        let command_data = job.as_ref().map(|j| j.command_data());
        let stored_payload =
            payload::extract_payload(event, command_data.as_ref(), &self.config.payload);
        let retry_of = self.extract_retry_of(event, job.as_deref());

        let new_run = NewJobRun {
            uuid: uuid.to_string(),
            job_class: event.job_class.clone(),
            queue: event.queue.clone(),
            connection: event.connection.clone(),
            attempt: event.attempt,
            status: status.to_string(),
            finished_at: Some(now),
            retried_from_id: retry_of,
            payload: stored_payload,
            job_tags: job_tags.as_deref().map(encode_tags),
            exception_class: failure.map(|f| f.exception_class.clone()),
            exception_message: failure
                .map(|f| truncate_chars(&f.message, MAX_EXCEPTION_MESSAGE_LEN)),
            stack: failure.map(|f| truncate_chars(&f.stack, MAX_STACK_LEN)),
            memory_end_bytes: end_snapshot.memory_bytes,
            memory_peak_end_bytes: end_snapshot.peak_memory_bytes,
            cpu_user_ms,
            cpu_sys_ms,
            ..Default::default()
        };

        match self.repo.insert_run(new_run).await {
            Ok(run) => Some(run.id),
            Err(err) => {
                error!(?err, job_class = %event.job_class, %uuid, "failed to create terminal record");
                None
            }
        }
    }

    fn end_snapshot(&self) -> TelemetrySnapshot {
        if self.config.telemetry.enabled {
            telemetry::capture_snapshot(self.config.telemetry.capture_cpu)
        } else {
            TelemetrySnapshot::default()
        }
    }

    fn cpu_deltas(
        &self,
        uuid: &str,
        end_snapshot: &TelemetrySnapshot,
    ) -> (Option<i64>, Option<i64>) {
        let Some(baseline) = self.baselines.take(uuid) else {
            return (None, None);
        };
        let user = end_snapshot
            .cpu_user_micros
            .map(|end| telemetry::cpu_delta_ms(end, baseline.user_micros));
        let sys = end_snapshot
            .cpu_sys_micros
            .map(|end| telemetry::cpu_delta_ms(end, baseline.sys_micros));
        (user, sys)
    }

    fn restore_from_envelope(&self, event: &JobEvent) -> Option<Box<dyn QueueableJob>> {
        let command = payload::command_value(&event.payload)?;
        self.registry.restore(&event.job_class, command)
    }

    fn extract_retry_of(
        &self,
        event: &JobEvent,
        job: Option<&dyn QueueableJob>,
    ) -> Option<i64> {
        job.and_then(|j| j.retry_of())
            .or_else(|| payload::extract_retry_of(&event.payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock_db::MockJobRunRepository;
    use crate::jobs::testing::registry_with_report_job;
    use serde_json::json;

    fn recorder_with(
        repo: Arc<MockJobRunRepository>,
        config: MonitorConfig,
    ) -> JobRecorder {
        JobRecorder::new(
            repo,
            Arc::new(registry_with_report_job()),
            Arc::new(BaselineStore::default()),
            Arc::new(config),
        )
    }

    fn start_event(uuid: &str) -> JobEvent {
        JobEvent {
            uuid: Some(uuid.to_string()),
            job_id: None,
            job_class: "EmailJob".to_string(),
            queue: Some("default".to_string()),
            connection: Some("database".to_string()),
            attempt: 1,
            payload: json!({"data": {"command": {}}}),
            released: false,
        }
    }

    fn failure() -> JobFailure {
        JobFailure {
            exception_class: "RuntimeException".to_string(),
            message: "boom".to_string(),
            stack: "at worker.rs:1".to_string(),
        }
    }

    #[tokio::test]
    async fn start_creates_processing_record_with_tags_and_index_rows() {
        let repo = Arc::new(MockJobRunRepository::default());
        let recorder = recorder_with(repo.clone(), MonitorConfig::default());

        recorder.on_job_started(&start_event("u1")).await;

        let run = repo.find_processing_by_uuid("u1").await.unwrap().unwrap();
        assert_eq!(run.status, STATUS_PROCESSING);
        assert_eq!(run.job_class, "EmailJob");
        assert!(run.started_at.is_some());
        assert!(run.finished_at.is_none());
        assert_eq!(run.tags(), vec!["queue:default"]);
        assert_eq!(repo.tag_rows.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn success_updates_the_same_record_without_duplicates() {
        let repo = Arc::new(MockJobRunRepository::default());
        let recorder = recorder_with(repo.clone(), MonitorConfig::default());

        recorder.on_job_started(&start_event("u1")).await;
        let started = repo.find_processing_by_uuid("u1").await.unwrap().unwrap();

        recorder.on_job_succeeded(&start_event("u1")).await;

        let runs = repo.runs.lock().unwrap();
        let matching: Vec<_> = runs.iter().filter(|r| r.uuid == "u1").collect();
        assert_eq!(matching.len(), 1);
        let updated = matching[0];
        assert_eq!(updated.id, started.id);
        assert_eq!(updated.status, STATUS_PROCESSED);
        assert!(updated.finished_at.is_some());
        assert!(updated.duration_ms.unwrap() >= 0);
    }

    #[tokio::test]
    async fn duration_measures_from_recorded_start() {
        let repo = Arc::new(MockJobRunRepository::default());
        let recorder = recorder_with(repo.clone(), MonitorConfig::default());

        // A processing row that started five seconds ago.
        let started = repo
            .insert_run(NewJobRun {
                uuid: "u-dur".into(),
                job_class: "EmailJob".into(),
                queue: Some("default".into()),
                connection: Some("database".into()),
                attempt: 1,
                status: STATUS_PROCESSING.into(),
                started_at: Some(OffsetDateTime::now_utc() - Duration::milliseconds(5000)),
                ..Default::default()
            })
            .await
            .unwrap();

        recorder.on_job_succeeded(&start_event("u-dur")).await;

        let run = repo.find_by_id(started.id).await.unwrap().unwrap();
        assert_eq!(run.status, STATUS_PROCESSED);
        let duration = run.duration_ms.unwrap();
        assert!((5000..6000).contains(&duration), "duration was {duration}");
    }

    #[tokio::test]
    async fn failure_updates_in_place_with_truncated_exception() {
        let repo = Arc::new(MockJobRunRepository::default());
        let recorder = recorder_with(repo.clone(), MonitorConfig::default());

        recorder.on_job_started(&start_event("u2")).await;
        let mut long_failure = failure();
        long_failure.message = "x".repeat(5000);
        recorder.on_job_failed(&start_event("u2"), &long_failure).await;

        let runs = repo.runs.lock().unwrap();
        let run = runs.iter().find(|r| r.uuid == "u2").unwrap();
        assert_eq!(run.status, STATUS_FAILED);
        assert_eq!(run.exception_class.as_deref(), Some("RuntimeException"));
        assert_eq!(
            run.exception_message.as_ref().unwrap().chars().count(),
            MAX_EXCEPTION_MESSAGE_LEN
        );
        assert_eq!(runs.iter().filter(|r| r.uuid == "u2").count(), 1);
    }

    #[tokio::test]
    async fn failure_without_start_creates_terminal_record() {
        let repo = Arc::new(MockJobRunRepository::default());
        let recorder = recorder_with(repo.clone(), MonitorConfig::default());

        recorder.on_job_failed(&start_event("u3"), &failure()).await;

        let runs = repo.runs.lock().unwrap();
        let run = runs.iter().find(|r| r.uuid == "u3").unwrap();
        assert_eq!(run.status, STATUS_FAILED);
        assert!(run.started_at.is_none());
        assert!(run.finished_at.is_some());
        assert!(run.duration_ms.is_none());
        assert_eq!(run.exception_class.as_deref(), Some("RuntimeException"));
    }

    #[tokio::test]
    async fn released_jobs_are_never_recorded() {
        let repo = Arc::new(MockJobRunRepository::default());
        let recorder = recorder_with(repo.clone(), MonitorConfig::default());

        let mut event = start_event("u4");
        event.released = true;
        recorder.on_job_succeeded(&event).await;

        assert!(repo.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn master_switch_disables_every_handler() {
        let repo = Arc::new(MockJobRunRepository::default());
        let config = MonitorConfig {
            enabled: false,
            ..Default::default()
        };
        let recorder = recorder_with(repo.clone(), config);

        recorder.on_job_started(&start_event("u5")).await;
        recorder.on_job_succeeded(&start_event("u5")).await;
        recorder.on_job_failed(&start_event("u5"), &failure()).await;

        assert!(repo.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_marker_flows_into_retried_from_id() {
        let repo = Arc::new(MockJobRunRepository::default());
        let recorder = recorder_with(repo.clone(), MonitorConfig::default());

        let mut event = start_event("u6");
        event.job_class = "ReportJob".to_string();
        event.payload = json!({"data": {"command": {"report_id": 9, "retry_of": 42}}});
        recorder.on_job_started(&event).await;

        let run = repo.find_processing_by_uuid("u6").await.unwrap().unwrap();
        assert_eq!(run.retried_from_id, Some(42));
        // Declared tags from the restored job come through too.
        assert!(run.tags().contains(&"reports".to_string()));
    }

    #[tokio::test]
    async fn retry_marker_read_from_raw_command_for_unregistered_jobs() {
        let repo = Arc::new(MockJobRunRepository::default());
        let recorder = recorder_with(repo.clone(), MonitorConfig::default());

        let mut event = start_event("u7");
        event.payload = json!({"data": {"command": {"retry_of": 7}}});
        recorder.on_job_started(&event).await;

        let run = repo.find_processing_by_uuid("u7").await.unwrap().unwrap();
        assert_eq!(run.retried_from_id, Some(7));
    }

    #[tokio::test]
    async fn storage_failure_never_propagates() {
        let repo = Arc::new(MockJobRunRepository::failing());
        let recorder = recorder_with(repo.clone(), MonitorConfig::default());

        // Must not panic or return an error; the job being observed goes on.
        recorder.on_job_started(&start_event("u8")).await;
        recorder.on_job_succeeded(&start_event("u8")).await;
        recorder.on_job_failed(&start_event("u8"), &failure()).await;
    }

    #[tokio::test]
    async fn heuristic_match_updates_newest_same_shape_row() {
        let repo = Arc::new(MockJobRunRepository::default());
        let recorder = recorder_with(repo.clone(), MonitorConfig::default());

        let mut no_id = start_event("ignored");
        no_id.uuid = None;
        no_id.job_id = None;

        recorder.on_job_started(&no_id).await;
        recorder.on_job_started(&no_id).await;
        let newest_id = repo.runs.lock().unwrap().iter().map(|r| r.id).max().unwrap();

        recorder.on_job_succeeded(&no_id).await;

        let runs = repo.runs.lock().unwrap();
        let newest = runs.iter().find(|r| r.id == newest_id).unwrap();
        assert_eq!(newest.status, STATUS_PROCESSED);
        assert_eq!(
            runs.iter().filter(|r| r.status == STATUS_PROCESSING).count(),
            1
        );
    }
}
