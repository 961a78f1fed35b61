pub mod client;
pub mod config;
pub mod error;
pub mod heartbeat_monitor;
pub mod models;
pub mod routes;
pub mod status;
pub mod store;
pub mod worker_processing;
pub mod worker_runtime;
pub mod worker_scheduler;
