//! Job logic contract and the context handed to it while running.

use serde_json::Value as JsonValue;

use jobqueue_core::{ExecutionMode, JobDescriptor, JobId, JobStatus, StoreError};

use super::store::JobDescriptorStore;

/// Job logic registered under a kind.
///
/// One instance serves every descriptor of its kind; per-run data travels in the
/// descriptor payload.
pub trait QueuedJob: Send + Sync {
    /// Registered type name, stored on each descriptor.
    fn kind(&self) -> &str;

    /// Human-readable title captured on the descriptor at submission.
    fn title(&self) -> String {
        self.kind().to_string()
    }

    /// How descriptors of this kind are started.
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Queued
    }

    /// Initial progress denominator.
    fn total_steps(&self) -> u32 {
        1
    }

    /// Execute one run.
    ///
    /// Errors and panics are contained: the descriptor is marked Broken with the
    /// failure recorded as a message.
    fn process(&self, ctx: &mut JobContext<'_>) -> Result<JobOutcome, JobError>;
}

/// Where a run leaves its descriptor when job logic returns normally.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Complete,
    /// Yield; a worker picks the descriptor up again.
    Waiting,
    Paused,
}

impl JobOutcome {
    pub fn status(self) -> JobStatus {
        match self {
            JobOutcome::Complete => JobStatus::Complete,
            JobOutcome::Waiting => JobStatus::Waiting,
            JobOutcome::Paused => JobStatus::Paused,
        }
    }
}

/// Failure raised by job logic.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    /// An operator paused or cancelled the descriptor mid-run.
    #[error("job was interrupted")]
    Interrupted,
}

impl JobError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// A submission request: which kind to run and with what data.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub kind: String,
    pub payload: JsonValue,
}

impl NewJob {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: JsonValue::Null,
        }
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }
}

/// Running view of a descriptor.
///
/// Messages and progress accumulate on a working copy that the runner persists
/// when the run ends; `checkpoint` persists it early.
pub struct JobContext<'a> {
    descriptor: JobDescriptor,
    store: &'a dyn JobDescriptorStore,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(descriptor: JobDescriptor, store: &'a dyn JobDescriptorStore) -> Self {
        Self { descriptor, store }
    }

    pub(crate) fn into_descriptor(self) -> JobDescriptor {
        self.descriptor
    }

    pub fn id(&self) -> JobId {
        self.descriptor.id()
    }

    pub fn payload(&self) -> &JsonValue {
        self.descriptor.payload()
    }

    pub fn descriptor(&self) -> &JobDescriptor {
        &self.descriptor
    }

    pub fn add_message(&mut self, message: impl Into<String>) {
        self.descriptor.add_message(message);
    }

    pub fn set_total_steps(&mut self, total: u32) {
        self.descriptor.set_total_steps(total);
    }

    pub fn set_current_step(&mut self, step: u32) {
        self.descriptor.set_current_step(step);
    }

    /// Persist messages and progress so far.
    ///
    /// Fails with `Interrupted` if the stored descriptor is no longer Running.
    pub fn checkpoint(&mut self) -> Result<(), JobError> {
        if self
            .store
            .save_if_status(&self.descriptor, JobStatus::Running)?
        {
            Ok(())
        } else {
            Err(JobError::Interrupted)
        }
    }

    /// True once an operator paused, cancelled or removed the descriptor.
    pub fn is_interrupted(&self) -> Result<bool, JobError> {
        let stored = self.store.get(self.descriptor.id())?;
        Ok(stored.is_none_or(|d| d.status() != JobStatus::Running))
    }
}
