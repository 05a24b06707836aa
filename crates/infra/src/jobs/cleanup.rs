//! Retention: the self-scheduling job that deletes stale descriptors.
//!
//! Each run resolves its policy, selects stale descriptors, deletes them in one
//! batch and, when enabled, queues the next run `rearm_interval` into the future.
//! Only one pending cleanup run is ever kept in the queue.

use core::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use jobqueue_core::{
    ExecutionMode, JobDescriptor, JobId, JobStatus, QueueError, QueueResult, StoreError,
};

use crate::config::{parse_flag, parse_list, parse_var, process_env};

use super::job::{JobContext, JobError, JobOutcome, NewJob, QueuedJob};
use super::service::QueueService;
use super::store::JobDescriptorStore;
use super::strategy::JobSubmitter;

pub const CLEANUP_JOB_KIND: &str = "cleanup";

const MSG_BAD_CONFIG: &str = "Incorrect configuration values set. Cleanup ignored";
const MSG_NOTHING_TO_DO: &str = "No jobs to clean up.";
const MSG_REARMING: &str = "Queueing the next Cleanup Job.";
const MSG_ALREADY_ARMED: &str = "Next Cleanup Job already queued.";
const MSG_REARM_FAILED: &str = "Failed to queue the next Cleanup Job";

/// How staleness is decided.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CleanupMethod {
    /// `value` is a number of days since the last edit.
    Age,
    /// `value` is a number of descriptors to retain.
    Number,
}

impl FromStr for CleanupMethod {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "age" => Ok(CleanupMethod::Age),
            "number" => Ok(CleanupMethod::Number),
            other => Err(QueueError::configuration(format!(
                "unknown cleanup method {other:?} (expected \"age\" or \"number\")"
            ))),
        }
    }
}

/// Retention settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// `"age"` or `"number"`; validated when a run starts.
    pub method: String,
    pub value: u32,
    /// Statuses that may be deleted.
    pub statuses: Vec<JobStatus>,
    /// Re-arm after each run.
    pub enabled: bool,
    pub rearm_interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            method: "age".to_string(),
            value: 30,
            statuses: vec![JobStatus::Complete, JobStatus::Broken],
            enabled: false,
            rearm_interval_secs: 24 * 60 * 60,
        }
    }
}

impl CleanupConfig {
    pub const METHOD_VAR: &'static str = "JOBQUEUE_CLEANUP_METHOD";
    pub const VALUE_VAR: &'static str = "JOBQUEUE_CLEANUP_VALUE";
    pub const STATUSES_VAR: &'static str = "JOBQUEUE_CLEANUP_STATUSES";
    pub const ENABLED_VAR: &'static str = "JOBQUEUE_CLEANUP_ENABLED";
    pub const INTERVAL_VAR: &'static str = "JOBQUEUE_CLEANUP_INTERVAL_SECS";

    pub fn from_env() -> QueueResult<Self> {
        Self::from_lookup(process_env)
    }

    /// Build from a key lookup, falling back to defaults for missing keys.
    ///
    /// The method is kept verbatim; an unknown method is reported by each run
    /// rather than at startup.
    pub fn from_lookup<F>(lookup: F) -> QueueResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            method: lookup(Self::METHOD_VAR)
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .unwrap_or(defaults.method),
            value: parse_var(&lookup, Self::VALUE_VAR)?.unwrap_or(defaults.value),
            statuses: parse_list(&lookup, Self::STATUSES_VAR)?.unwrap_or(defaults.statuses),
            enabled: parse_flag(&lookup, Self::ENABLED_VAR)?.unwrap_or(defaults.enabled),
            rearm_interval_secs: match parse_var(&lookup, Self::INTERVAL_VAR)? {
                Some(0) => {
                    return Err(QueueError::configuration(format!(
                        "{}: must be greater than zero",
                        Self::INTERVAL_VAR
                    )));
                }
                Some(secs) => secs,
                None => defaults.rearm_interval_secs,
            },
        })
    }

    pub fn rearm_interval(&self) -> Duration {
        Duration::from_secs(self.rearm_interval_secs)
    }

    /// When a run finishing at `now` schedules its successor.
    ///
    /// `None` if the interval is zero or the result is not a representable time,
    /// so a re-armed run always lies strictly in the future.
    pub fn next_run_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(self.rearm_interval())
            .ok()
            .filter(|interval| *interval > chrono::Duration::zero())
            .and_then(|interval| now.checked_add_signed(interval))
    }

    /// Resolve the policy a run applies.
    pub fn policy(&self) -> QueueResult<RetentionPolicy> {
        let method = self.method.parse()?;
        let live: Vec<_> = self.statuses.iter().filter(|s| !s.is_terminal()).collect();
        if !live.is_empty() {
            warn!(statuses = ?live, "cleanup may delete descriptors that are still live");
        }
        Ok(RetentionPolicy {
            method,
            value: self.value,
            statuses: self.statuses.clone(),
        })
    }
}

/// A resolved retention rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub method: CleanupMethod,
    pub value: u32,
    pub statuses: Vec<JobStatus>,
}

impl RetentionPolicy {
    /// IDs of stale descriptors at `now`.
    ///
    /// `Number` keeps the first `value` descriptors by ascending `last_edited`,
    /// i.e. the oldest ones, and selects eligible descriptors among the rest.
    pub fn select(
        &self,
        store: &dyn JobDescriptorStore,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        match self.method {
            CleanupMethod::Age => {
                // A cutoff before the earliest representable time selects nothing.
                let cutoff = chrono::Duration::try_days(i64::from(self.value))
                    .and_then(|age| now.checked_sub_signed(age));
                match cutoff {
                    Some(cutoff) => store.select_by_status_and_age(&self.statuses, cutoff),
                    None => Ok(Vec::new()),
                }
            }
            CleanupMethod::Number => {
                let retained = store.select_ordered_by_last_edited(self.value as usize)?;
                store.select_by_status_excluding(&self.statuses, &retained)
            }
        }
    }
}

/// Maintenance job that keeps the descriptor store from growing without bound.
///
/// Runs immediately when due. The queue it re-arms through is held weakly since
/// the queue owns this job.
pub struct CleanupJob {
    store: Arc<dyn JobDescriptorStore>,
    submitter: Weak<dyn JobSubmitter>,
    config: CleanupConfig,
}

impl CleanupJob {
    pub fn new(
        store: Arc<dyn JobDescriptorStore>,
        submitter: Weak<dyn JobSubmitter>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            store,
            submitter,
            config,
        }
    }

    /// Build a cleanup job wired to `service` and register it there.
    pub fn install(service: &Arc<QueueService>, config: CleanupConfig) -> Arc<Self> {
        let submitter: Weak<dyn JobSubmitter> = Arc::downgrade(service) as Weak<dyn JobSubmitter>;
        let job = Arc::new(Self::new(service.store().clone(), submitter, config));
        service.register(job.clone());
        job
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Submit a run now if re-arming is enabled and none is pending.
    pub fn ensure_scheduled(&self) -> QueueResult<Option<JobDescriptor>> {
        if !self.config.enabled {
            return Ok(None);
        }
        if !self.pending_runs()?.is_empty() {
            return Ok(None);
        }
        let submitter = self.submitter()?;
        info!("seeding cleanup job");
        submitter.submit(NewJob::new(CLEANUP_JOB_KIND), None).map(Some)
    }

    fn pending_runs(&self) -> Result<Vec<JobDescriptor>, StoreError> {
        self.store
            .list_by_kind(CLEANUP_JOB_KIND, &JobStatus::CLAIMABLE)
    }

    fn submitter(&self) -> QueueResult<Arc<dyn JobSubmitter>> {
        self.submitter
            .upgrade()
            .ok_or_else(|| QueueError::configuration("queue service is no longer available"))
    }

    fn rearm(&self, ctx: &mut JobContext<'_>, now: DateTime<Utc>) {
        match self.pending_runs() {
            Ok(pending) if !pending.is_empty() => {
                info!(next_job_id = %pending[0].id(), "next cleanup already queued");
                ctx.add_message(MSG_ALREADY_ARMED);
                return;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not check for a queued cleanup job"),
        }

        let Some(run_at) = self.config.next_run_at(now) else {
            warn!(
                rearm_interval_secs = self.config.rearm_interval_secs,
                "cleanup re-arm interval is not usable; next run not queued"
            );
            ctx.add_message(format!(
                "{MSG_REARM_FAILED}: invalid re-arm interval of {}s",
                self.config.rearm_interval_secs
            ));
            return;
        };

        ctx.add_message(MSG_REARMING);

        let submitted = self
            .submitter()
            .and_then(|submitter| submitter.submit(NewJob::new(CLEANUP_JOB_KIND), Some(run_at)));
        match submitted {
            Ok(next) => info!(next_job_id = %next.id(), run_at = %run_at, "next cleanup queued"),
            Err(e) => {
                warn!(error = %e, "failed to queue the next cleanup job");
                ctx.add_message(format!("{MSG_REARM_FAILED}: {e}"));
            }
        }
    }
}

impl QueuedJob for CleanupJob {
    fn kind(&self) -> &str {
        CLEANUP_JOB_KIND
    }

    fn title(&self) -> String {
        "Clean up old jobs from the database".to_string()
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Immediate
    }

    fn process(&self, ctx: &mut JobContext<'_>) -> Result<JobOutcome, JobError> {
        let policy = match self.config.policy() {
            Ok(policy) => policy,
            Err(e) => {
                warn!(error = %e, method = %self.config.method, "cleanup ignored");
                ctx.add_message(MSG_BAD_CONFIG);
                return Ok(JobOutcome::Complete);
            }
        };

        let now = Utc::now();
        let mut stale = policy
            .select(self.store.as_ref(), now)
            .map_err(|e| storage_failure("select", &policy, e))?;
        stale.retain(|id| *id != ctx.id());

        if stale.is_empty() {
            info!(method = ?policy.method, "no stale jobs");
            ctx.add_message(MSG_NOTHING_TO_DO);
        } else {
            let deleted = self
                .store
                .delete_by_ids(&stale, &policy.statuses)
                .map_err(|e| storage_failure("delete", &policy, e))?;
            info!(
                method = ?policy.method,
                selected = stale.len(),
                deleted,
                "stale jobs deleted"
            );
            ctx.add_message(format!("{deleted} jobs cleaned up."));
        }

        if self.config.enabled {
            self.rearm(ctx, now);
        }
        ctx.set_current_step(1);
        Ok(JobOutcome::Complete)
    }
}

fn storage_failure(operation: &str, policy: &RetentionPolicy, err: StoreError) -> JobError {
    error!(
        operation,
        method = ?policy.method,
        value = policy.value,
        statuses = ?policy.statuses,
        error = %err,
        "cleanup storage failure"
    );
    JobError::Storage(err)
}
