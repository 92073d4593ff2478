use std::{net::SocketAddr, sync::Arc};

use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Method};
use axum::{
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use jobsight::aggregation::select_strategy;
use jobsight::config::Config;
use jobsight::db::job_run_repository::JobRunRepository;
use jobsight::db::postgres_job_run_repository::PostgresJobRunRepository;
use jobsight::db::postgres_queue_client::PostgresQueueClient;
use jobsight::jobs::{JobRegistry, QueueClient};
use jobsight::recorder::retry::JobRetrier;
use jobsight::recorder::JobRecorder;
use jobsight::routes::{admin, events, monitor};
use jobsight::support::baseline::BaselineStore;
use jobsight::support::queue_depth::QueueDepthChecker;
use jobsight::worker;
use jobsight::AppState;

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let config = Config::from_env();
    let monitor_config = Arc::new(config.monitor.clone());

    let pg_pool = establish_connection(&config.database_url).await;

    let job_runs = Arc::new(PostgresJobRunRepository {
        pool: pg_pool.clone(),
    }) as Arc<dyn JobRunRepository>;

    let queue_client = Arc::new(PostgresQueueClient {
        pool: pg_pool.clone(),
    }) as Arc<dyn QueueClient>;

    // Embedding applications register their job types here; unregistered
    // types are still recorded from their envelopes but cannot be retried
    // with full fidelity.
    let registry = Arc::new(JobRegistry::new());

    let baselines = Arc::new(BaselineStore::default());

    let recorder = Arc::new(JobRecorder::new(
        job_runs.clone(),
        registry.clone(),
        baselines,
        monitor_config.clone(),
    ));
    let retrier = Arc::new(JobRetrier::new(
        job_runs.clone(),
        registry,
        queue_client.clone(),
        monitor_config.clone(),
    ));
    let tag_aggregation = select_strategy(job_runs.clone()).await;
    let queue_depth = Arc::new(QueueDepthChecker::new(queue_client, job_runs.clone()));

    let state = AppState {
        job_runs,
        recorder,
        retrier,
        tag_aggregation,
        queue_depth,
        monitor_config,
    };
    let state_for_worker = state.clone();

    let cors = CorsLayer::new()
        .allow_origin(config.frontend_origin.parse::<HeaderValue>().unwrap())
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE]);

    let monitor_routes = Router::new()
        .route("/overview", get(monitor::overview))
        .route("/jobs", get(monitor::list_jobs))
        .route("/jobs/{id}", get(monitor::get_job))
        .route("/jobs/{id}/retry", post(monitor::retry_job))
        .route("/tags/top", get(monitor::top_tags))
        .route("/tags/stats", get(monitor::tag_stats))
        .route("/queue-depth", get(monitor::queue_depth));

    let event_routes = Router::new()
        .route("/job-started", post(events::job_started))
        .route("/job-succeeded", post(events::job_succeeded))
        .route("/job-failed", post(events::job_failed));

    let admin_routes = Router::new()
        .route("/prune", post(admin::prune_runs))
        .route("/backfill-tags", post(admin::backfill_tags))
        .route("/cleanup-stuck", post(admin::cleanup_stuck));

    let app = Router::new()
        .nest("/api/monitor", monitor_routes)
        .nest("/api/events", event_routes)
        .nest("/api/admin", admin_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    worker::start_background_workers(state_for_worker).await;

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    let listener = TcpListener::bind(addr).await.unwrap();
    info!("jobsight listening on http://{addr}");
    axum::serve(listener, app).await.unwrap();
}

/// Establish a connection to the database and verify it.
async fn establish_connection(database_url: &str) -> PgPool {
    let pool = PgPool::connect(database_url)
        .await
        .expect("Failed to connect to the database");

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .expect("Failed to verify database connection");

    info!("connected to the database");
    pool
}
