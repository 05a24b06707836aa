//! Queue service: submission, claiming and running of job descriptors.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, info_span, warn};

use jobqueue_core::{ExecutionMode, JobDescriptor, JobId, JobStatus, QueueError, QueueResult};

use super::cleanup::CLEANUP_JOB_KIND;
use super::job::{JobContext, JobError, JobOutcome, NewJob, QueuedJob};
use super::store::{JobDescriptorStore, JobStats};
use super::strategy::{
    ExecutionStrategy, ImmediateStrategy, JobRunner, JobSubmitter, QueuedStrategy,
};

/// Orchestrating facade over the store, the registered job logic and the
/// execution strategies.
///
/// ## Claiming
///
/// `run` moves a descriptor New → Initialising → Running (or Waiting → Running)
/// with one compare-and-set per step. Of several concurrent runners only the first
/// CAS wins; the others observe the new status and fail with `Contention` or
/// `AlreadyTerminal` without touching job logic.
///
/// ## Operator changes
///
/// `pause`/`cancel` may land while job logic is still executing. The runner's final
/// write is also a CAS on Running, so the operator's status wins and the job's own
/// outcome is dropped.
pub struct QueueService {
    store: Arc<dyn JobDescriptorStore>,
    registry: RwLock<HashMap<String, Arc<dyn QueuedJob>>>,
    immediate: Box<dyn ExecutionStrategy>,
    queued: Box<dyn ExecutionStrategy>,
}

impl QueueService {
    pub fn new(store: Arc<dyn JobDescriptorStore>) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<QueueService>| {
            let runner: Weak<dyn JobRunner> = this.clone();
            Self {
                store,
                registry: RwLock::new(HashMap::new()),
                immediate: Box::new(ImmediateStrategy::new(runner)),
                queued: Box::new(QueuedStrategy),
            }
        })
    }

    pub fn store(&self) -> &Arc<dyn JobDescriptorStore> {
        &self.store
    }

    /// Register job logic under its kind, replacing any previous registration.
    pub fn register(&self, job: Arc<dyn QueuedJob>) {
        let kind = job.kind().to_string();
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if registry.insert(kind.clone(), job).is_some() {
            warn!(kind = %kind, "job kind registered twice; keeping the latest");
        } else {
            info!(kind = %kind, "job kind registered");
        }
    }

    fn job_for(&self, kind: &str) -> Option<Arc<dyn QueuedJob>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
    }

    /// Persist a New descriptor and start it according to its kind's mode.
    ///
    /// Immediate jobs that are already due run before this returns and the
    /// finished descriptor is returned. Everything else is left for a worker.
    /// Not idempotent: every call creates a descriptor.
    pub fn submit(
        &self,
        job: NewJob,
        scheduled_start: Option<DateTime<Utc>>,
    ) -> QueueResult<JobDescriptor> {
        let logic = self
            .job_for(&job.kind)
            .ok_or_else(|| QueueError::UnknownJobKind(job.kind.clone()))?;

        let mut descriptor = JobDescriptor::new(
            job.kind,
            logic.title(),
            logic.mode(),
            job.payload,
            scheduled_start,
        );
        descriptor.set_total_steps(logic.total_steps());
        self.store.insert(&descriptor)?;

        let id = descriptor.id();
        info!(
            job_id = %id,
            kind = %descriptor.kind(),
            mode = %descriptor.mode(),
            scheduled_start = ?scheduled_start,
            "job submitted"
        );

        let strategy = self.strategy_for(&descriptor);
        match strategy.run_now(id) {
            Ok(Some(finished)) => Ok(finished),
            Ok(None) => Ok(descriptor),
            Err(e) => {
                warn!(job_id = %id, error = %e, "inline run failed; returning stored descriptor");
                Ok(self.store.get(id)?.unwrap_or(descriptor))
            }
        }
    }

    fn strategy_for(&self, descriptor: &JobDescriptor) -> &dyn ExecutionStrategy {
        // A scheduled cleanup is a re-arm; running it inline would recurse.
        let rearm =
            descriptor.kind() == CLEANUP_JOB_KIND && descriptor.scheduled_start().is_some();
        if descriptor.mode() == ExecutionMode::Immediate
            && !rearm
            && descriptor.is_due(Utc::now())
        {
            self.immediate.as_ref()
        } else {
            self.queued.as_ref()
        }
    }

    /// Claim and execute a descriptor.
    pub fn run(&self, id: JobId) -> QueueResult<JobDescriptor> {
        let mut descriptor = self.load(id)?;
        match descriptor.status() {
            status @ (JobStatus::Complete | JobStatus::Broken | JobStatus::Cancelled) => {
                return Err(QueueError::AlreadyTerminal { id, status });
            }
            status @ (JobStatus::Initialising | JobStatus::Running) => {
                return Err(QueueError::Contention { id, status });
            }
            JobStatus::Paused => {
                return Err(QueueError::InvalidTransition {
                    from: JobStatus::Paused,
                    to: JobStatus::Initialising,
                });
            }
            JobStatus::New => {
                self.advance(&mut descriptor, JobStatus::Initialising)?;
                self.advance(&mut descriptor, JobStatus::Running)?;
            }
            JobStatus::Waiting => {
                self.advance(&mut descriptor, JobStatus::Running)?;
            }
        }
        self.execute(descriptor)
    }

    /// Restart a Paused descriptor.
    pub fn resume(&self, id: JobId) -> QueueResult<JobDescriptor> {
        let mut descriptor = self.load(id)?;
        if descriptor.status() != JobStatus::Paused {
            return Err(QueueError::InvalidTransition {
                from: descriptor.status(),
                to: JobStatus::Running,
            });
        }
        self.advance(&mut descriptor, JobStatus::Running)?;
        info!(job_id = %id, "job resumed");
        self.execute(descriptor)
    }

    /// Operator pause of a Running descriptor.
    pub fn pause(&self, id: JobId) -> QueueResult<JobDescriptor> {
        let mut descriptor = self.load(id)?;
        self.advance(&mut descriptor, JobStatus::Paused)?;
        info!(job_id = %id, "job paused");
        Ok(descriptor)
    }

    /// Operator cancel of any non-terminal descriptor.
    pub fn cancel(&self, id: JobId) -> QueueResult<JobDescriptor> {
        let mut descriptor = self.load(id)?;
        self.advance(&mut descriptor, JobStatus::Cancelled)?;
        info!(job_id = %id, "job cancelled");
        Ok(descriptor)
    }

    pub fn get(&self, id: JobId) -> QueueResult<Option<JobDescriptor>> {
        Ok(self.store.get(id)?)
    }

    pub fn stats(&self) -> QueueResult<JobStats> {
        Ok(self.store.stats()?)
    }

    fn load(&self, id: JobId) -> QueueResult<JobDescriptor> {
        self.store.get(id)?.ok_or(QueueError::NotFound(id))
    }

    /// One lifecycle step, persisted with a CAS on the previous status.
    fn advance(&self, descriptor: &mut JobDescriptor, next: JobStatus) -> QueueResult<()> {
        let expected = descriptor.status();
        let mut updated = descriptor.clone();
        updated.transition(next)?;
        if self.store.save_if_status(&updated, expected)? {
            *descriptor = updated;
            return Ok(());
        }
        let current = self.load(descriptor.id())?;
        debug!(
            job_id = %descriptor.id(),
            expected = %expected,
            found = %current.status(),
            "lost status race"
        );
        Err(lost_race(&current))
    }

    fn execute(&self, descriptor: JobDescriptor) -> QueueResult<JobDescriptor> {
        let id = descriptor.id();
        let span = info_span!("job", job_id = %id, kind = %descriptor.kind());
        let _enter = span.enter();

        let Some(job) = self.job_for(descriptor.kind()) else {
            let reason = JobError::failed(format!(
                "no job registered for kind {:?}",
                descriptor.kind()
            ));
            return self.finish(descriptor, Err(reason));
        };

        debug!("job logic starting");
        let mut ctx = JobContext::new(descriptor, self.store.as_ref());
        let result = panic::catch_unwind(AssertUnwindSafe(|| job.process(&mut ctx)))
            .unwrap_or_else(|payload| Err(JobError::failed(panic_message(payload.as_ref()))));
        self.finish(ctx.into_descriptor(), result)
    }

    fn finish(
        &self,
        mut descriptor: JobDescriptor,
        result: Result<JobOutcome, JobError>,
    ) -> QueueResult<JobDescriptor> {
        let id = descriptor.id();
        let next = match result {
            Ok(outcome) => outcome.status(),
            Err(JobError::Interrupted) => {
                let current = self.load(id)?;
                info!(status = %current.status(), "job stopped after operator interruption");
                return Ok(current);
            }
            Err(e) => {
                let failure = QueueError::job_execution(e.to_string());
                error!(error = %failure, "job failed");
                descriptor.add_message(failure.to_string());
                JobStatus::Broken
            }
        };

        let running = descriptor.clone();
        if next == JobStatus::Complete && descriptor.current_step() < descriptor.total_steps() {
            descriptor.set_current_step(descriptor.total_steps());
        }
        descriptor.transition(next)?;

        let saved = match self.store.save_if_status(&descriptor, JobStatus::Running) {
            Ok(saved) => saved,
            Err(e) => return self.record_lost_outcome(running, next, e.into()),
        };
        if saved {
            info!(status = %next, "job finished");
            Ok(descriptor)
        } else {
            let current = self.load(id)?;
            info!(
                outcome = %next,
                status = %current.status(),
                "status changed while job was running; outcome dropped"
            );
            Ok(current)
        }
    }
}

impl QueueService {
    /// The final write failed: try once to mark the run Broken instead.
    ///
    /// If that write fails too the descriptor stays Running in the store and only
    /// an operator `cancel` releases it.
    fn record_lost_outcome(
        &self,
        mut running: JobDescriptor,
        outcome: JobStatus,
        cause: QueueError,
    ) -> QueueResult<JobDescriptor> {
        let id = running.id();
        error!(outcome = %outcome, error = %cause, "failed to record job outcome");
        running.add_message(format!("failed to record outcome {outcome}: {cause}"));
        running.transition(JobStatus::Broken)?;

        match self.store.save_if_status(&running, JobStatus::Running) {
            Ok(true) => Ok(running),
            Ok(false) => self.load(id),
            Err(retry) => {
                error!(
                    outcome = %outcome,
                    error = %retry,
                    "failed to mark job Broken; descriptor left Running"
                );
                Err(cause)
            }
        }
    }
}

impl JobRunner for QueueService {
    fn run(&self, id: JobId) -> QueueResult<JobDescriptor> {
        QueueService::run(self, id)
    }
}

impl JobSubmitter for QueueService {
    fn submit(
        &self,
        job: NewJob,
        scheduled_start: Option<DateTime<Utc>>,
    ) -> QueueResult<JobDescriptor> {
        QueueService::submit(self, job, scheduled_start)
    }
}

fn lost_race(current: &JobDescriptor) -> QueueError {
    let (id, status) = (current.id(), current.status());
    if status.is_terminal() {
        QueueError::AlreadyTerminal { id, status }
    } else {
        QueueError::Contention { id, status }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("job panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("job panicked: {s}")
    } else {
        "job panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;

    struct Echo {
        mode: ExecutionMode,
    }

    impl QueuedJob for Echo {
        fn kind(&self) -> &str {
            "echo"
        }

        fn mode(&self) -> ExecutionMode {
            self.mode
        }

        fn process(&self, ctx: &mut JobContext<'_>) -> Result<JobOutcome, JobError> {
            let text = ctx.payload()["text"].as_str().unwrap_or_default().to_string();
            ctx.add_message(text);
            Ok(JobOutcome::Complete)
        }
    }

    fn service(mode: ExecutionMode) -> Arc<QueueService> {
        let service = QueueService::new(InMemoryJobStore::arc());
        service.register(Arc::new(Echo { mode }));
        service
    }

    #[test]
    fn queued_submission_stays_new() {
        let service = service(ExecutionMode::Queued);

        let d = service
            .submit(NewJob::new("echo").with_payload(serde_json::json!({"text": "hi"})), None)
            .unwrap();

        assert_eq!(d.status(), JobStatus::New);
        assert_eq!(d.mode(), ExecutionMode::Queued);
        assert_eq!(d.total_steps(), 1);
    }

    #[test]
    fn run_completes_and_records_messages() {
        let service = service(ExecutionMode::Queued);
        let d = service
            .submit(NewJob::new("echo").with_payload(serde_json::json!({"text": "hi"})), None)
            .unwrap();

        let done = service.run(d.id()).unwrap();

        assert_eq!(done.status(), JobStatus::Complete);
        assert_eq!(done.messages(), ["hi".to_string()]);
        assert_eq!(done.completion_percent(), 100);
        assert_eq!(service.get(d.id()).unwrap().unwrap(), done);
    }

    #[test]
    fn immediate_submission_runs_inline() {
        let service = service(ExecutionMode::Immediate);

        let d = service.submit(NewJob::new("echo"), None).unwrap();

        assert_eq!(d.status(), JobStatus::Complete);
    }

    #[test]
    fn immediate_submission_in_the_future_is_deferred() {
        let service = service(ExecutionMode::Immediate);
        let later = Utc::now() + chrono::Duration::hours(24);

        let d = service.submit(NewJob::new("echo"), Some(later)).unwrap();

        assert_eq!(d.status(), JobStatus::New);
        assert_eq!(d.scheduled_start(), Some(later));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let service = service(ExecutionMode::Queued);

        assert_eq!(
            service.submit(NewJob::new("nope"), None),
            Err(QueueError::UnknownJobKind("nope".to_string()))
        );
    }

    #[test]
    fn running_a_finished_job_is_rejected() {
        let service = service(ExecutionMode::Immediate);
        let d = service.submit(NewJob::new("echo"), None).unwrap();

        assert_eq!(
            service.run(d.id()),
            Err(QueueError::AlreadyTerminal {
                id: d.id(),
                status: JobStatus::Complete,
            })
        );
    }

    #[test]
    fn paused_jobs_need_resume() {
        let service = service(ExecutionMode::Queued);
        let d = service.submit(NewJob::new("echo"), None).unwrap();

        assert!(matches!(
            service.pause(d.id()),
            Err(QueueError::InvalidTransition { from: JobStatus::New, to: JobStatus::Paused })
        ));
        assert!(matches!(
            service.resume(d.id()),
            Err(QueueError::InvalidTransition { from: JobStatus::New, to: JobStatus::Running })
        ));
    }

    #[test]
    fn cancel_is_terminal() {
        let service = service(ExecutionMode::Queued);
        let d = service.submit(NewJob::new("echo"), None).unwrap();

        let cancelled = service.cancel(d.id()).unwrap();
        assert_eq!(cancelled.status(), JobStatus::Cancelled);

        assert!(matches!(
            service.cancel(d.id()),
            Err(QueueError::AlreadyTerminal { status: JobStatus::Cancelled, .. })
        ));
        assert!(matches!(
            service.run(d.id()),
            Err(QueueError::AlreadyTerminal { status: JobStatus::Cancelled, .. })
        ));
    }

    #[test]
    fn missing_descriptor_is_not_found() {
        let service = service(ExecutionMode::Queued);
        let id = JobId::new();
        assert_eq!(service.run(id), Err(QueueError::NotFound(id)));
    }
}
