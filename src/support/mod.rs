pub mod baseline;
pub mod payload;
pub mod queue_depth;
pub mod tags;
pub mod telemetry;
