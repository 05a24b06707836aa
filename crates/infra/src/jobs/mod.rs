//! Persistent background job queue.
//!
//! ## Components
//!
//! - `JobDescriptorStore`: durable descriptors (in-memory or Postgres)
//! - `QueuedJob`: job logic registered per kind
//! - `ExecutionStrategy`: immediate (inline) or queued (worker) start
//! - `QueueService`: submit, claim, run, pause, resume, cancel
//! - `QueueWorker`: polls for due descriptors on a background thread
//! - `CleanupJob`: self-rescheduling retention of finished descriptors
//!
//! ## Lifecycle
//!
//! ```text
//! New → Initialising → Running → Complete | Broken
//!                         ↓  ↑
//!                 Waiting / Paused
//! ```
//!
//! Any non-terminal status may move to Cancelled.

pub mod cleanup;
pub mod job;
pub mod postgres;
pub mod service;
pub mod store;
pub mod strategy;
pub mod worker;

pub use cleanup::{CleanupConfig, CleanupJob, CleanupMethod, RetentionPolicy, CLEANUP_JOB_KIND};
pub use job::{JobContext, JobError, JobOutcome, NewJob, QueuedJob};
pub use postgres::PostgresJobStore;
pub use service::QueueService;
pub use store::{InMemoryJobStore, JobDescriptorStore, JobStats};
pub use strategy::{ExecutionStrategy, ImmediateStrategy, JobRunner, JobSubmitter, QueuedStrategy};
pub use worker::{PollOutcome, QueueWorker, QueueWorkerConfig, QueueWorkerHandle, WorkerStats};
