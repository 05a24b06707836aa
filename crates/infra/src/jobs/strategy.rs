//! Execution strategies: how a submitted descriptor gets started.

use std::sync::Weak;

use chrono::{DateTime, Utc};
use tracing::debug;

use jobqueue_core::{ExecutionMode, JobDescriptor, JobId, QueueError, QueueResult};

use super::job::NewJob;

/// Runs a descriptor to its next resting status.
pub trait JobRunner: Send + Sync {
    fn run(&self, id: JobId) -> QueueResult<JobDescriptor>;
}

/// Accepts new work.
pub trait JobSubmitter: Send + Sync {
    fn submit(
        &self,
        job: NewJob,
        scheduled_start: Option<DateTime<Utc>>,
    ) -> QueueResult<JobDescriptor>;
}

/// Starts a freshly persisted descriptor.
pub trait ExecutionStrategy: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Returns the finished descriptor when the job ran inline.
    fn run_now(&self, id: JobId) -> QueueResult<Option<JobDescriptor>>;
}

/// Runs the job in the submitting call.
///
/// Holds the runner weakly: the runner owns this strategy.
pub struct ImmediateStrategy {
    runner: Weak<dyn JobRunner>,
}

impl ImmediateStrategy {
    pub fn new(runner: Weak<dyn JobRunner>) -> Self {
        Self { runner }
    }
}

impl ExecutionStrategy for ImmediateStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Immediate
    }

    fn run_now(&self, id: JobId) -> QueueResult<Option<JobDescriptor>> {
        let runner = self
            .runner
            .upgrade()
            .ok_or_else(|| QueueError::configuration("job runner is no longer available"))?;
        debug!(job_id = %id, "running job inline");
        runner.run(id).map(Some)
    }
}

/// Leaves the descriptor for a worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueuedStrategy;

impl ExecutionStrategy for QueuedStrategy {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Queued
    }

    fn run_now(&self, id: JobId) -> QueueResult<Option<JobDescriptor>> {
        debug!(job_id = %id, "job queued for a worker");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<JobId>>,
    }

    impl JobRunner for RecordingRunner {
        fn run(&self, id: JobId) -> QueueResult<JobDescriptor> {
            self.calls.lock().unwrap().push(id);
            Err(QueueError::NotFound(id))
        }
    }

    #[test]
    fn immediate_strategy_delegates_to_the_runner() {
        let runner = Arc::new(RecordingRunner::default());
        let weak: Weak<dyn JobRunner> = Arc::downgrade(&runner) as Weak<dyn JobRunner>;
        let strategy = ImmediateStrategy::new(weak);
        let id = JobId::new();

        assert_eq!(strategy.run_now(id), Err(QueueError::NotFound(id)));
        assert_eq!(*runner.calls.lock().unwrap(), vec![id]);
    }

    #[test]
    fn immediate_strategy_reports_a_dropped_runner() {
        let runner = Arc::new(RecordingRunner::default());
        let weak: Weak<dyn JobRunner> = Arc::downgrade(&runner) as Weak<dyn JobRunner>;
        drop(runner);

        let strategy = ImmediateStrategy::new(weak);
        assert!(matches!(
            strategy.run_now(JobId::new()),
            Err(QueueError::Configuration(_))
        ));
    }

    #[test]
    fn queued_strategy_never_runs_anything() {
        assert_eq!(QueuedStrategy.run_now(JobId::new()), Ok(None));
        assert_eq!(QueuedStrategy.mode(), ExecutionMode::Queued);
    }
}
