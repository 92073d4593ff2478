use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::db::job_run_repository::{
    BackfillRow, ClassDurationStats, ClassFailureCount, ClassResourceStats, ExceptionCount,
    HourBucket, JobRunRepository, NewJobRun, OverviewStats, PruneOutcome, QueueProcessingCount,
    RunCompletion, TagCountRow, TagScanRow, TagStatsRow,
};
use crate::models::job_run::{decode_tags, JobRun, JobRunSummary, STATUS_FAILED, STATUS_PROCESSING};
use crate::models::job_tag::{JobTag, NewJobTag};

/// In-memory repository used by unit tests and doubling as the reference
/// implementation for storage engines without native JSON aggregation
/// (`supports_json_aggregation` is false unless a test flips it).
pub struct MockJobRunRepository {
    pub runs: Mutex<Vec<JobRun>>,
    pub tag_rows: Mutex<Vec<JobTag>>,
    next_run_id: AtomicI64,
    next_tag_id: AtomicI64,
    pub should_fail: bool,
    pub json_aggregation: bool,
}

impl Default for MockJobRunRepository {
    fn default() -> Self {
        MockJobRunRepository {
            runs: Mutex::new(Vec::new()),
            tag_rows: Mutex::new(Vec::new()),
            next_run_id: AtomicI64::new(1),
            next_tag_id: AtomicI64::new(1),
            should_fail: false,
            json_aggregation: false,
        }
    }
}

impl MockJobRunRepository {
    pub fn failing() -> Self {
        MockJobRunRepository {
            should_fail: true,
            ..Default::default()
        }
    }

    fn check(&self) -> Result<(), sqlx::Error> {
        if self.should_fail {
            return Err(sqlx::Error::Protocol("mock repository failure".into()));
        }
        Ok(())
    }

    fn summarize(run: &JobRun) -> JobRunSummary {
        JobRunSummary {
            id: run.id,
            uuid: run.uuid.clone(),
            job_class: run.job_class.clone(),
            queue: run.queue.clone(),
            connection: run.connection.clone(),
            attempt: run.attempt,
            status: run.status.clone(),
            started_at: run.started_at,
            finished_at: run.finished_at,
            duration_ms: run.duration_ms,
            retried_from_id: run.retried_from_id,
            exception_class: run.exception_class.clone(),
            exception_message: run.exception_message.clone(),
            job_tags: run.job_tags.clone(),
            created_at: run.created_at,
        }
    }

    /// Shared tag grouping used by the indexed and json paths below.
    fn group_tag_rows(
        entries: impl Iterator<Item = (String, String, Option<i64>)>,
    ) -> Vec<TagStatsRow> {
        struct Acc {
            total: i64,
            processed: i64,
            failed: i64,
            processing: i64,
            duration_sum: i64,
            duration_count: i64,
        }

        let mut grouped: BTreeMap<String, Acc> = BTreeMap::new();
        for (tag, status, duration_ms) in entries {
            let acc = grouped.entry(tag).or_insert(Acc {
                total: 0,
                processed: 0,
                failed: 0,
                processing: 0,
                duration_sum: 0,
                duration_count: 0,
            });
            acc.total += 1;
            match status.as_str() {
                "processed" => acc.processed += 1,
                "failed" => acc.failed += 1,
                "processing" => acc.processing += 1,
                _ => {}
            }
            if let Some(d) = duration_ms {
                acc.duration_sum += d;
                acc.duration_count += 1;
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
        rows
    }

    fn indexed_rows(&self, since: OffsetDateTime) -> Vec<TagStatsRow> {
        let runs = self.runs.lock().unwrap();
        let tag_rows = self.tag_rows.lock().unwrap();
        let entries = tag_rows.iter().filter_map(|tag_row| {
            let run = runs.iter().find(|r| r.id == tag_row.job_id)?;
            if run.created_at <= since {
                return None;
            }
            Some((tag_row.tag.clone(), run.status.clone(), run.duration_ms))
        });
        Self::group_tag_rows(entries)
    }

    fn json_rows(&self, since: OffsetDateTime) -> Vec<TagStatsRow> {
        let runs = self.runs.lock().unwrap();
        let entries = runs
            .iter()
            .filter(|r| r.created_at > since && r.job_tags.is_some())
            .flat_map(|r| {
                decode_tags(r.job_tags.as_ref())
                    .into_iter()
                    .map(move |tag| (tag, r.status.clone(), r.duration_ms))
            })
            .collect::<Vec<_>>();
        Self::group_tag_rows(entries.into_iter())
    }
}

#[async_trait]
impl JobRunRepository for MockJobRunRepository {
    async fn insert_run(&self, new_run: NewJobRun) -> Result<JobRun, sqlx::Error> {
        self.check()?;
        let now = OffsetDateTime::now_utc();
        let run = JobRun {
            id: self.next_run_id.fetch_add(1, Ordering::SeqCst),
            uuid: new_run.uuid,
            job_class: new_run.job_class,
            queue: new_run.queue,
            connection: new_run.connection,
            attempt: new_run.attempt,
            status: new_run.status,
            started_at: new_run.started_at,
            finished_at: new_run.finished_at,
            duration_ms: new_run.duration_ms,
            retried_from_id: new_run.retried_from_id,
            exception_class: new_run.exception_class,
            exception_message: new_run.exception_message,
            stack: new_run.stack,
            payload: new_run.payload,
            job_tags: new_run.job_tags,
            memory_start_bytes: new_run.memory_start_bytes,
            memory_end_bytes: new_run.memory_end_bytes,
            memory_peak_start_bytes: new_run.memory_peak_start_bytes,
            memory_peak_end_bytes: new_run.memory_peak_end_bytes,
            memory_peak_delta_bytes: None,
            cpu_user_ms: new_run.cpu_user_ms,
            cpu_sys_ms: new_run.cpu_sys_ms,
            created_at: now,
            updated_at: now,
        };
        self.runs.lock().unwrap().push(run.clone());
        Ok(run)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<JobRun>, sqlx::Error> {
        self.check()?;
        Ok(self.runs.lock().unwrap().iter().find(|r| r.id == id).cloned())
    }

    async fn find_processing_by_uuid(&self, uuid: &str) -> Result<Option<JobRun>, sqlx::Error> {
        self.check()?;
        Ok(self
            .runs
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.uuid == uuid && r.status == STATUS_PROCESSING)
            .cloned())
    }

    async fn find_recent_processing(
        &self,
        job_class: &str,
        queue: Option<&str>,
        connection: Option<&str>,
        cutoff: OffsetDateTime,
    ) -> Result<Option<JobRun>, sqlx::Error> {
        self.check()?;
        Ok(self
            .runs
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                r.job_class == job_class
                    && r.queue.as_deref() == queue
                    && r.connection.as_deref() == connection
                    && r.status == STATUS_PROCESSING
                    && r.created_at > cutoff
            })
            .max_by_key(|r| r.id)
            .cloned())
    }

    async fn complete_run(
        &self,
        id: i64,
        completion: RunCompletion,
    ) -> Result<Option<JobRun>, sqlx::Error> {
        self.check()?;
        let mut runs = self.runs.lock().unwrap();
        let Some(run) = runs.iter_mut().find(|r| r.id == id) else {
            return Ok(None);
        };
        run.status = completion.status;
        run.finished_at = Some(completion.finished_at);
        run.duration_ms = completion.duration_ms;
        run.memory_end_bytes = completion.memory_end_bytes;
        run.memory_peak_end_bytes = completion.memory_peak_end_bytes;
        run.memory_peak_delta_bytes = completion.memory_peak_delta_bytes;
        run.cpu_user_ms = completion.cpu_user_ms;
        run.cpu_sys_ms = completion.cpu_sys_ms;
        run.exception_class = completion.exception_class;
        run.exception_message = completion.exception_message;
        run.stack = completion.stack;
        run.updated_at = OffsetDateTime::now_utc();
        Ok(Some(run.clone()))
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<JobRunSummary>, sqlx::Error> {
        self.check()?;
        let runs = self.runs.lock().unwrap();
        let mut sorted: Vec<&JobRun> = runs.iter().collect();
        sorted.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(sorted
            .into_iter()
            .take(limit as usize)
            .map(Self::summarize)
            .collect())
    }

    async fn list_by_status(
        &self,
        status: &str,
        limit: i64,
    ) -> Result<Vec<JobRunSummary>, sqlx::Error> {
        self.check()?;
        let runs = self.runs.lock().unwrap();
        let mut matching: Vec<&JobRun> = runs.iter().filter(|r| r.status == status).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching
            .into_iter()
            .take(limit as usize)
            .map(Self::summarize)
            .collect())
    }

    async fn list_by_tag(
        &self,
        tag: &str,
        limit: i64,
    ) -> Result<Vec<JobRunSummary>, sqlx::Error> {
        self.check()?;
        let needle = tag.to_lowercase();
        let runs = self.runs.lock().unwrap();
        let mut matching: Vec<&JobRun> = runs
            .iter()
            .filter(|r| decode_tags(r.job_tags.as_ref()).iter().any(|t| t == &needle))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching
            .into_iter()
            .take(limit as usize)
            .map(Self::summarize)
            .collect())
    }

    async fn statistics(&self, since: OffsetDateTime) -> Result<OverviewStats, sqlx::Error> {
        self.check()?;
        let runs = self.runs.lock().unwrap();
        let window: Vec<&JobRun> = runs.iter().filter(|r| r.created_at > since).collect();
        let durations: Vec<i64> = window.iter().filter_map(|r| r.duration_ms).collect();
        Ok(OverviewStats {
            total: window.len() as i64,
            processed: window.iter().filter(|r| r.status == "processed").count() as i64,
            failed: window.iter().filter(|r| r.status == "failed").count() as i64,
            processing: window.iter().filter(|r| r.status == "processing").count() as i64,
            avg_duration_ms: if durations.is_empty() {
                None
            } else {
                Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64)
            },
        })
    }

    async fn jobs_by_hour(&self, since: OffsetDateTime) -> Result<Vec<HourBucket>, sqlx::Error> {
        self.check()?;
        let runs = self.runs.lock().unwrap();
        let mut buckets: BTreeMap<String, (i64, i64)> = BTreeMap::new();
        for run in runs.iter().filter(|r| r.created_at > since) {
            let hour = format!(
                "{:04}-{:02}-{:02} {:02}:00:00",
                run.created_at.year(),
                u8::from(run.created_at.month()),
                run.created_at.day(),
                run.created_at.hour()
            );
            let entry = buckets.entry(hour).or_insert((0, 0));
            entry.0 += 1;
            if run.status == STATUS_FAILED {
                entry.1 += 1;
            }
        }
        Ok(buckets
            .into_iter()
            .map(|(hour, (count, failed_count))| HourBucket {
                hour,
                count,
                failed_count,
            })
            .collect())
    }

    async fn top_failing_jobs(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<ClassFailureCount>, sqlx::Error> {
        self.check()?;
        let runs = self.runs.lock().unwrap();
        let mut counts: BTreeMap<String, i64> = BTreeMap::new();
        for run in runs
            .iter()
            .filter(|r| r.created_at > since && r.status == STATUS_FAILED)
        {
            *counts.entry(run.job_class.clone()).or_insert(0) += 1;
        }
        let mut rows: Vec<ClassFailureCount> = counts
            .into_iter()
            .map(|(job_class, failure_count)| ClassFailureCount {
                job_class,
                failure_count,
            })
            .collect();
        rows.sort_by(|a, b| b.failure_count.cmp(&a.failure_count));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn top_exceptions(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<ExceptionCount>, sqlx::Error> {
        self.check()?;
        let runs = self.runs.lock().unwrap();
        let mut counts: BTreeMap<String, i64> = BTreeMap::new();
        for run in runs.iter().filter(|r| r.created_at > since) {
            if let Some(exception) = &run.exception_class {
                *counts.entry(exception.clone()).or_insert(0) += 1;
            }
        }
        let mut rows: Vec<ExceptionCount> = counts
            .into_iter()
            .map(|(exception_class, count)| ExceptionCount {
                exception_class,
                count,
            })
            .collect();
        rows.sort_by(|a, b| b.count.cmp(&a.count));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn slowest_jobs(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<ClassDurationStats>, sqlx::Error> {
        self.check()?;
        let runs = self.runs.lock().unwrap();
        let mut grouped: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        for run in runs.iter().filter(|r| r.created_at > since) {
            if let Some(duration) = run.duration_ms {
                grouped.entry(run.job_class.clone()).or_default().push(duration);
            }
        }
        let mut rows: Vec<ClassDurationStats> = grouped
            .into_iter()
            .map(|(job_class, durations)| ClassDurationStats {
                avg_duration_ms: Some(
                    durations.iter().sum::<i64>() as f64 / durations.len() as f64,
                ),
                max_duration_ms: durations.iter().max().copied(),
                count: durations.len() as i64,
                job_class,
            })
            .collect();
        rows.sort_by(|a, b| {
            b.avg_duration_ms
                .partial_cmp(&a.avg_duration_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn heaviest_jobs(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<ClassResourceStats>, sqlx::Error> {
        self.check()?;
        let runs = self.runs.lock().unwrap();
        let mut grouped: BTreeMap<String, (Vec<i64>, Vec<i64>, i64)> = BTreeMap::new();
        for run in runs.iter().filter(|r| {
            r.created_at > since
                && (r.memory_peak_delta_bytes.is_some()
                    || r.cpu_user_ms.is_some()
                    || r.cpu_sys_ms.is_some())
        }) {
            let entry = grouped.entry(run.job_class.clone()).or_default();
            if let Some(delta) = run.memory_peak_delta_bytes {
                entry.0.push(delta);
            }
            entry.1.push(run.cpu_user_ms.unwrap_or(0) + run.cpu_sys_ms.unwrap_or(0));
            entry.2 += 1;
        }
        let mut rows: Vec<ClassResourceStats> = grouped
            .into_iter()
            .map(|(job_class, (deltas, cpu_totals, count))| ClassResourceStats {
                avg_peak_delta_bytes: if deltas.is_empty() {
                    None
                } else {
                    Some(deltas.iter().sum::<i64>() as f64 / deltas.len() as f64)
                },
                avg_cpu_total_ms: if cpu_totals.is_empty() {
                    None
                } else {
                    Some(cpu_totals.iter().sum::<i64>() as f64 / cpu_totals.len() as f64)
                },
                count,
                job_class,
            })
            .collect();
        rows.sort_by(|a, b| {
            b.avg_peak_delta_bytes
                .partial_cmp(&a.avg_peak_delta_bytes)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn processing_counts_by_queue(
        &self,
    ) -> Result<Vec<QueueProcessingCount>, sqlx::Error> {
        self.check()?;
        let runs = self.runs.lock().unwrap();
        let mut counts: BTreeMap<Option<String>, i64> = BTreeMap::new();
        for run in runs.iter().filter(|r| r.status == STATUS_PROCESSING) {
            *counts.entry(run.queue.clone()).or_insert(0) += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(queue, count)| QueueProcessingCount { queue, count })
            .collect())
    }

    async fn insert_tag_rows(&self, rows: &[NewJobTag]) -> Result<u64, sqlx::Error> {
        self.check()?;
        let mut tag_rows = self.tag_rows.lock().unwrap();
        for row in rows {
            tag_rows.push(JobTag {
                id: self.next_tag_id.fetch_add(1, Ordering::SeqCst),
                job_id: row.job_id,
                tag: row.tag.clone(),
                created_at: row.created_at,
            });
        }
        Ok(rows.len() as u64)
    }

    async fn tag_index_populated(&self) -> Result<bool, sqlx::Error> {
        self.check()?;
        Ok(!self.tag_rows.lock().unwrap().is_empty())
    }

    async fn clear_tag_index(
        &self,
        created_after: Option<OffsetDateTime>,
    ) -> Result<u64, sqlx::Error> {
        self.check()?;
        let mut tag_rows = self.tag_rows.lock().unwrap();
        let before = tag_rows.len();
        match created_after {
            Some(after) => tag_rows.retain(|t| t.created_at <= after),
            None => tag_rows.clear(),
        }
        Ok((before - tag_rows.len()) as u64)
    }

    fn supports_json_aggregation(&self) -> bool {
        self.json_aggregation
    }

    async fn top_tags_indexed(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<TagCountRow>, sqlx::Error> {
        self.check()?;
        Ok(self
            .indexed_rows(since)
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

    async fn tag_stats_indexed(
        &self,
        since: OffsetDateTime,
    ) -> Result<Vec<TagStatsRow>, sqlx::Error> {
        self.check()?;
        Ok(self.indexed_rows(since))
    }

    async fn top_tags_json(
        &self,
        since: OffsetDateTime,
        limit: i64,
    ) -> Result<Vec<TagCountRow>, sqlx::Error> {
        self.check()?;
        if !self.json_aggregation {
            return Err(sqlx::Error::Protocol(
                "json aggregation not supported by this engine".into(),
            ));
        }
        Ok(self
            .json_rows(since)
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

    async fn tag_stats_json(
        &self,
        since: OffsetDateTime,
    ) -> Result<Vec<TagStatsRow>, sqlx::Error> {
        self.check()?;
        if !self.json_aggregation {
            return Err(sqlx::Error::Protocol(
                "json aggregation not supported by this engine".into(),
            ));
        }
        Ok(self.json_rows(since))
    }

    async fn scan_tagged_runs(
        &self,
        since: OffsetDateTime,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<TagScanRow>, sqlx::Error> {
        self.check()?;
        let runs = self.runs.lock().unwrap();
        let mut matching: Vec<&JobRun> = runs
            .iter()
            .filter(|r| r.created_at > since && r.job_tags.is_some() && r.id > after_id)
            .collect();
        matching.sort_by_key(|r| r.id);
        Ok(matching
            .into_iter()
            .take(limit as usize)
            .map(|r| TagScanRow {
                id: r.id,
                status: r.status.clone(),
                duration_ms: r.duration_ms,
                job_tags: r.job_tags.clone(),
            })
            .collect())
    }

    async fn prune_runs(
        &self,
        cutoff: OffsetDateTime,
        status: Option<&str>,
        include_processing: bool,
        _chunk_size: i64,
    ) -> Result<PruneOutcome, sqlx::Error> {
        self.check()?;
        let mut runs = self.runs.lock().unwrap();
        let doomed: Vec<i64> = runs
            .iter()
            .filter(|r| {
                r.created_at < cutoff
                    && match status {
                        Some(status) => r.status == status,
                        None => include_processing || r.status != STATUS_PROCESSING,
                    }
            })
            .map(|r| r.id)
            .collect();

        let mut outcome = PruneOutcome::default();
        for run in runs.iter_mut() {
            if let Some(parent) = run.retried_from_id {
                if doomed.contains(&parent) && !doomed.contains(&run.id) {
                    run.retried_from_id = None;
                    outcome.orphaned_children += 1;
                }
            }
        }
        let before = runs.len();
        runs.retain(|r| !doomed.contains(&r.id));
        outcome.deleted = (before - runs.len()) as u64;

        // Emulate the FK cascade.
        self.tag_rows
            .lock()
            .unwrap()
            .retain(|t| !doomed.contains(&t.job_id));

        Ok(outcome)
    }

    async fn sweep_stuck_runs(
        &self,
        started_before: OffsetDateTime,
        message: &str,
    ) -> Result<u64, sqlx::Error> {
        self.check()?;
        let now = OffsetDateTime::now_utc();
        let mut swept = 0;
        for run in self.runs.lock().unwrap().iter_mut() {
            if run.status == STATUS_PROCESSING
                && run.started_at.map(|s| s < started_before).unwrap_or(false)
            {
                run.status = STATUS_FAILED.to_string();
                run.finished_at = Some(now);
                run.exception_class = Some("TimeoutException".to_string());
                run.exception_message = Some(message.to_string());
                run.updated_at = now;
                swept += 1;
            }
        }
        Ok(swept)
    }

    async fn backfill_chunk(
        &self,
        since: Option<OffsetDateTime>,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<BackfillRow>, sqlx::Error> {
        self.check()?;
        let runs = self.runs.lock().unwrap();
        let mut matching: Vec<&JobRun> = runs
            .iter()
            .filter(|r| {
                r.job_tags.is_some()
                    && r.id > after_id
                    && since.map(|s| r.created_at > s).unwrap_or(true)
            })
            .collect();
        matching.sort_by_key(|r| r.id);
        Ok(matching
            .into_iter()
            .take(limit as usize)
            .map(|r| BackfillRow {
                id: r.id,
                job_tags: r.job_tags.clone(),
                created_at: r.created_at,
            })
            .collect())
    }
}
