use std::time::Duration;

use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::time::sleep;
use tracing::{error, info};

use crate::state::AppState;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(600);
const TICK: Duration = Duration::from_secs(60);
const PRUNE_CHUNK_SIZE: i64 = 1000;

/// Background maintenance: periodic retention pruning plus a sweep that
/// fails out processing rows whose worker died. Both are external to the
/// lifecycle state machine itself.
pub async fn start_background_workers(state: AppState) {
    tokio::spawn(async move {
        let mut last_maintenance: Option<std::time::Instant> = None;
        loop {
            let due = last_maintenance
                .map(|t| t.elapsed() >= MAINTENANCE_INTERVAL)
                .unwrap_or(true);
            if due {
                run_maintenance(&state).await;
                last_maintenance = Some(std::time::Instant::now());
            }
            sleep(TICK).await;
        }
    });
}

async fn run_maintenance(state: &AppState) {
    let now = OffsetDateTime::now_utc();
    let config = &state.monitor_config;

    let retention_cutoff = now - TimeDuration::days(config.retention_days);
    match state
        .job_runs
        .prune_runs(retention_cutoff, None, false, PRUNE_CHUNK_SIZE)
        .await
    {
        Ok(outcome) if outcome.deleted > 0 => {
            info!(
                deleted = outcome.deleted,
                orphaned = outcome.orphaned_children,
                retention_days = config.retention_days,
                "retention prune completed"
            );
        }
        Ok(_) => {}
        Err(err) => error!(?err, "retention prune failed"),
    }

    let stuck_cutoff = now - TimeDuration::hours(config.stuck_timeout_hours);
    let message = format!(
        "Job stuck in processing state for more than {} hours",
        config.stuck_timeout_hours
    );
    match state.job_runs.sweep_stuck_runs(stuck_cutoff, &message).await {
        Ok(swept) if swept > 0 => {
            info!(swept, "stuck processing jobs marked as failed")
        }
        Ok(_) => {}
        Err(err) => error!(?err, "stuck job sweep failed"),
    }
}
