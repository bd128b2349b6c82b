pub mod api;
pub mod config;
pub mod error;
pub mod gs;
pub mod jobs;
pub mod metrics;
pub mod scratch;
pub mod upload;
