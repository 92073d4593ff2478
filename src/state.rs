use std::sync::Arc;

use crate::aggregation::TagAggregation;
use crate::config::MonitorConfig;
use crate::db::job_run_repository::JobRunRepository;
use crate::recorder::retry::JobRetrier;
use crate::recorder::JobRecorder;
use crate::support::queue_depth::QueueDepthChecker;

#[derive(Clone)]
pub struct AppState {
    pub job_runs: Arc<dyn JobRunRepository>,
    pub recorder: Arc<JobRecorder>,
    pub retrier: Arc<JobRetrier>,
    pub tag_aggregation: Arc<dyn TagAggregation>,
    pub queue_depth: Arc<QueueDepthChecker>,
    pub monitor_config: Arc<MonitorConfig>,
}
