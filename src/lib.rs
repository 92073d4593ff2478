pub mod aggregation;
pub mod config;
pub mod db;
pub mod jobs;
pub mod models;
pub mod recorder;
pub mod responses;
pub mod routes;
pub mod state;
pub mod support;
pub mod worker;

pub use state::AppState;
