//! Infrastructure layer: job storage, execution, workers and configuration.

pub mod config;
pub mod jobs;
