//! Polling worker that runs due descriptors.

use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use jobqueue_core::{JobDescriptor, JobStatus, QueueResult};

use crate::config::{parse_var, process_env};

use super::service::QueueService;

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueWorkerConfig {
    /// How often to poll for due jobs
    pub poll_interval: Duration,
    /// Due jobs claimed per poll
    pub batch_size: usize,
    /// Name for logging
    pub name: String,
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            batch_size: 10,
            name: "jobqueue-worker".to_string(),
        }
    }
}

impl QueueWorkerConfig {
    pub const POLL_INTERVAL_VAR: &'static str = "JOBQUEUE_POLL_INTERVAL_MS";
    pub const BATCH_SIZE_VAR: &'static str = "JOBQUEUE_BATCH_SIZE";
    pub const NAME_VAR: &'static str = "JOBQUEUE_WORKER_NAME";

    pub fn from_env() -> QueueResult<Self> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<F>(lookup: F) -> QueueResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            poll_interval: parse_var::<u64, _>(&lookup, Self::POLL_INTERVAL_VAR)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            batch_size: parse_var(&lookup, Self::BATCH_SIZE_VAR)?
                .unwrap_or(defaults.batch_size)
                .max(1),
            name: lookup(Self::NAME_VAR)
                .filter(|n| !n.trim().is_empty())
                .unwrap_or(defaults.name),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub polls: u64,
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_broken: u64,
    /// Jobs another runner claimed first.
    pub jobs_skipped: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

/// Result of one poll.
#[derive(Debug, Clone, Default)]
pub struct PollOutcome {
    pub ran: Vec<JobDescriptor>,
    pub skipped: usize,
    pub errors: usize,
}

/// Background worker.
///
/// Polls the store for due descriptors and runs each through the queue service.
/// Several workers may share a store; claiming is settled by the service.
pub struct QueueWorker {
    service: Arc<QueueService>,
}

impl QueueWorker {
    pub fn new(service: Arc<QueueService>) -> Self {
        Self { service }
    }

    /// Run up to `batch_size` due descriptors once.
    pub fn poll_once(&self, batch_size: usize) -> QueueResult<PollOutcome> {
        let due = self.service.store().select_due(Utc::now(), batch_size)?;
        let mut outcome = PollOutcome::default();

        for id in due {
            match self.service.run(id) {
                Ok(descriptor) => {
                    debug!(job_id = %id, status = %descriptor.status(), "job run finished");
                    outcome.ran.push(descriptor);
                }
                Err(e) if e.is_contention() => {
                    debug!(job_id = %id, error = %e, "job claimed elsewhere");
                    outcome.skipped += 1;
                }
                Err(e) => {
                    warn!(job_id = %id, error = %e, "job run failed");
                    outcome.errors += 1;
                }
            }
        }

        Ok(outcome)
    }

    /// Spawn the worker loop on a dedicated thread.
    pub fn spawn(self, config: QueueWorkerConfig) -> std::io::Result<QueueWorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || worker_loop(self, config, shutdown_rx, stats_clone))?;

        Ok(QueueWorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct QueueWorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl QueueWorkerHandle {
    /// Request graceful shutdown and wait for the current poll to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn worker_loop(
    worker: QueueWorker,
    config: QueueWorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    info!(worker = %config.name, batch_size = config.batch_size, "queue worker started");
    let started = Instant::now();

    loop {
        let result = worker.poll_once(config.batch_size);

        {
            let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
            s.polls += 1;
            s.uptime_secs = started.elapsed().as_secs();
            match &result {
                Ok(outcome) => {
                    s.jobs_processed += outcome.ran.len() as u64;
                    s.jobs_completed += count(&outcome.ran, JobStatus::Complete);
                    s.jobs_broken += count(&outcome.ran, JobStatus::Broken);
                    s.jobs_skipped += outcome.skipped as u64;
                    s.errors += outcome.errors as u64;
                }
                Err(_) => s.errors += 1,
            }
        }

        let busy = match result {
            Ok(outcome) => outcome.ran.len() + outcome.skipped >= config.batch_size,
            Err(e) => {
                error!(worker = %config.name, error = %e, "failed to poll for due jobs");
                false
            }
        };

        // A full batch means more work may be waiting; poll again straight away.
        let wait = if busy { Duration::ZERO } else { config.poll_interval };
        match shutdown_rx.recv_timeout(wait) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(worker = %config.name, "queue worker stopped");
}

fn count(ran: &[JobDescriptor], status: JobStatus) -> u64 {
    ran.iter().filter(|d| d.status() == status).count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn config_from_lookup() {
        let env: HashMap<&str, &str> = HashMap::from([
            (QueueWorkerConfig::POLL_INTERVAL_VAR, "250"),
            (QueueWorkerConfig::BATCH_SIZE_VAR, "0"),
            (QueueWorkerConfig::NAME_VAR, "reports"),
        ]);

        let config =
            QueueWorkerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.name, "reports");
    }

    #[test]
    fn config_defaults_when_unset() {
        let config = QueueWorkerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, QueueWorkerConfig::default());
    }
}
