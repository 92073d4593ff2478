pub mod job_run_repository;
pub mod mock_db;
pub mod postgres_job_run_repository;
pub mod postgres_queue_client;
