//! Job descriptor storage: the store boundary and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use jobqueue_core::{JobDescriptor, JobId, JobStatus, StoreError};

/// Durable store of job descriptors.
///
/// The queue only talks to storage through this trait. Every status write is a
/// compare-and-set (`save_if_status`) so that concurrent runners cannot both claim
/// the same descriptor, and retention deletes are guarded by status so a
/// descriptor that moved on after selection survives.
pub trait JobDescriptorStore: Send + Sync {
    /// Persist a new descriptor. Fails with `AlreadyExists` on id reuse.
    fn insert(&self, descriptor: &JobDescriptor) -> Result<(), StoreError>;

    fn get(&self, id: JobId) -> Result<Option<JobDescriptor>, StoreError>;

    /// Overwrite the stored descriptor only if its stored status is still `expected`.
    ///
    /// Returns `Ok(false)` when the status changed underneath the caller and
    /// `NotFound` when the descriptor no longer exists.
    fn save_if_status(
        &self,
        descriptor: &JobDescriptor,
        expected: JobStatus,
    ) -> Result<bool, StoreError>;

    /// Claimable descriptors (New/Waiting) whose start time has passed, oldest first.
    fn select_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, StoreError>;

    /// Descriptors of one kind in any of `statuses`.
    fn list_by_kind(
        &self,
        kind: &str,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobDescriptor>, StoreError>;

    /// IDs in `statuses` last edited strictly before `cutoff`.
    fn select_by_status_and_age(
        &self,
        statuses: &[JobStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError>;

    /// The first `limit` IDs ordered by `last_edited` ascending.
    fn select_ordered_by_last_edited(&self, limit: usize) -> Result<Vec<JobId>, StoreError>;

    /// IDs in `statuses` that are not listed in `exclude`.
    fn select_by_status_excluding(
        &self,
        statuses: &[JobStatus],
        exclude: &[JobId],
    ) -> Result<Vec<JobId>, StoreError>;

    /// Delete, as one atomic batch, the listed descriptors whose status is still in
    /// `statuses`. Returns the number of rows removed.
    fn delete_by_ids(&self, ids: &[JobId], statuses: &[JobStatus]) -> Result<u64, StoreError>;

    fn stats(&self) -> Result<JobStats, StoreError>;
}

impl<S> JobDescriptorStore for Arc<S>
where
    S: JobDescriptorStore + ?Sized,
{
    fn insert(&self, descriptor: &JobDescriptor) -> Result<(), StoreError> {
        (**self).insert(descriptor)
    }

    fn get(&self, id: JobId) -> Result<Option<JobDescriptor>, StoreError> {
        (**self).get(id)
    }

    fn save_if_status(
        &self,
        descriptor: &JobDescriptor,
        expected: JobStatus,
    ) -> Result<bool, StoreError> {
        (**self).save_if_status(descriptor, expected)
    }

    fn select_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, StoreError> {
        (**self).select_due(now, limit)
    }

    fn list_by_kind(
        &self,
        kind: &str,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobDescriptor>, StoreError> {
        (**self).list_by_kind(kind, statuses)
    }

    fn select_by_status_and_age(
        &self,
        statuses: &[JobStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        (**self).select_by_status_and_age(statuses, cutoff)
    }

    fn select_ordered_by_last_edited(&self, limit: usize) -> Result<Vec<JobId>, StoreError> {
        (**self).select_ordered_by_last_edited(limit)
    }

    fn select_by_status_excluding(
        &self,
        statuses: &[JobStatus],
        exclude: &[JobId],
    ) -> Result<Vec<JobId>, StoreError> {
        (**self).select_by_status_excluding(statuses, exclude)
    }

    fn delete_by_ids(&self, ids: &[JobId], statuses: &[JobStatus]) -> Result<u64, StoreError> {
        (**self).delete_by_ids(ids, statuses)
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        (**self).stats()
    }
}

/// Descriptor counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub new: usize,
    pub initialising: usize,
    pub running: usize,
    pub waiting: usize,
    pub paused: usize,
    pub complete: usize,
    pub broken: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: JobStatus, count: usize) {
        let slot = match status {
            JobStatus::New => &mut self.new,
            JobStatus::Initialising => &mut self.initialising,
            JobStatus::Running => &mut self.running,
            JobStatus::Waiting => &mut self.waiting,
            JobStatus::Paused => &mut self.paused,
            JobStatus::Complete => &mut self.complete,
            JobStatus::Broken => &mut self.broken,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }

    pub fn total(&self) -> usize {
        self.new
            + self.initialising
            + self.running
            + self.waiting
            + self.paused
            + self.complete
            + self.broken
            + self.cancelled
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobDescriptor>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, JobDescriptor>>, StoreError> {
        self.jobs
            .read()
            .map_err(|_| StoreError::backend("job store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, JobDescriptor>>, StoreError> {
        self.jobs
            .write()
            .map_err(|_| StoreError::backend("job store lock poisoned"))
    }
}

impl JobDescriptorStore for InMemoryJobStore {
    fn insert(&self, descriptor: &JobDescriptor) -> Result<(), StoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&descriptor.id()) {
            return Err(StoreError::AlreadyExists(descriptor.id()));
        }
        jobs.insert(descriptor.id(), descriptor.clone());
        Ok(())
    }

    fn get(&self, id: JobId) -> Result<Option<JobDescriptor>, StoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    fn save_if_status(
        &self,
        descriptor: &JobDescriptor,
        expected: JobStatus,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.write()?;
        let stored = jobs
            .get_mut(&descriptor.id())
            .ok_or(StoreError::NotFound(descriptor.id()))?;
        if stored.status() != expected {
            return Ok(false);
        }
        *stored = descriptor.clone();
        Ok(true)
    }

    fn select_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobId>, StoreError> {
        let jobs = self.read()?;
        let mut due: Vec<_> = jobs
            .values()
            .filter(|d| JobStatus::CLAIMABLE.contains(&d.status()) && d.is_due(now))
            .collect();
        due.sort_by_key(|d| (d.scheduled_start().unwrap_or(d.created_at()), d.id()));
        Ok(due.into_iter().take(limit).map(|d| d.id()).collect())
    }

    fn list_by_kind(
        &self,
        kind: &str,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobDescriptor>, StoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|d| d.kind() == kind && statuses.contains(&d.status()))
            .cloned()
            .collect();
        result.sort_by_key(|d| d.created_at());
        Ok(result)
    }

    fn select_by_status_and_age(
        &self,
        statuses: &[JobStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StoreError> {
        let jobs = self.read()?;
        Ok(jobs
            .values()
            .filter(|d| statuses.contains(&d.status()) && d.last_edited() < cutoff)
            .map(|d| d.id())
            .collect())
    }

    fn select_ordered_by_last_edited(&self, limit: usize) -> Result<Vec<JobId>, StoreError> {
        let jobs = self.read()?;
        let mut ordered: Vec<_> = jobs.values().collect();
        ordered.sort_by_key(|d| (d.last_edited(), d.id()));
        Ok(ordered.into_iter().take(limit).map(|d| d.id()).collect())
    }

    fn select_by_status_excluding(
        &self,
        statuses: &[JobStatus],
        exclude: &[JobId],
    ) -> Result<Vec<JobId>, StoreError> {
        let jobs = self.read()?;
        Ok(jobs
            .values()
            .filter(|d| statuses.contains(&d.status()) && !exclude.contains(&d.id()))
            .map(|d| d.id())
            .collect())
    }

    fn delete_by_ids(&self, ids: &[JobId], statuses: &[JobStatus]) -> Result<u64, StoreError> {
        let mut jobs = self.write()?;
        let mut deleted = 0;
        for id in ids {
            let eligible = jobs
                .get(id)
                .is_some_and(|d| statuses.contains(&d.status()));
            if eligible {
                jobs.remove(id);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for d in jobs.values() {
            stats.record(d.status());
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use jobqueue_core::ExecutionMode;

    fn descriptor(kind: &str) -> JobDescriptor {
        JobDescriptor::new(kind, kind, ExecutionMode::Queued, serde_json::json!({}), None)
    }

    fn stored_with(status: JobStatus, last_edited: DateTime<Utc>) -> JobDescriptor {
        let mut record = descriptor("test").to_record();
        record.status = status;
        record.created_at = last_edited;
        record.last_edited = last_edited;
        JobDescriptor::from_record(record)
    }

    #[test]
    fn insert_rejects_duplicate_ids() {
        let store = InMemoryJobStore::new();
        let d = descriptor("test");
        store.insert(&d).unwrap();

        assert_eq!(store.insert(&d), Err(StoreError::AlreadyExists(d.id())));
    }

    #[test]
    fn save_if_status_is_a_compare_and_set() {
        let store = InMemoryJobStore::new();
        let mut d = descriptor("test");
        store.insert(&d).unwrap();

        d.transition(JobStatus::Initialising).unwrap();
        assert!(store.save_if_status(&d, JobStatus::New).unwrap());

        // Second writer still believes the job is New.
        assert!(!store.save_if_status(&d, JobStatus::New).unwrap());
        assert_eq!(store.get(d.id()).unwrap().unwrap().status(), JobStatus::Initialising);
    }

    #[test]
    fn save_if_status_reports_missing_rows() {
        let store = InMemoryJobStore::new();
        let d = descriptor("test");

        assert_eq!(
            store.save_if_status(&d, JobStatus::New),
            Err(StoreError::NotFound(d.id()))
        );
    }

    #[test]
    fn select_due_skips_future_and_unclaimable_jobs() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let due = descriptor("due");
        let later = JobDescriptor::new(
            "later",
            "later",
            ExecutionMode::Queued,
            serde_json::Value::Null,
            Some(now + Duration::hours(1)),
        );
        let done = stored_with(JobStatus::Complete, now - Duration::minutes(5));
        let paused = stored_with(JobStatus::Paused, now - Duration::minutes(5));
        for d in [&due, &later, &done, &paused] {
            store.insert(d).unwrap();
        }

        assert_eq!(store.select_due(now, 10).unwrap(), vec![due.id()]);
    }

    #[test]
    fn ordered_selection_is_ascending_by_last_edited() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let newest = stored_with(JobStatus::Complete, now - Duration::hours(1));
        let oldest = stored_with(JobStatus::Complete, now - Duration::hours(3));
        let middle = stored_with(JobStatus::Broken, now - Duration::hours(2));
        for d in [&newest, &oldest, &middle] {
            store.insert(d).unwrap();
        }

        assert_eq!(
            store.select_ordered_by_last_edited(2).unwrap(),
            vec![oldest.id(), middle.id()]
        );
    }

    #[test]
    fn delete_only_removes_rows_still_in_an_eligible_status() {
        let store = InMemoryJobStore::new();
        let old = Utc::now() - Duration::days(40);
        let complete = stored_with(JobStatus::Complete, old);
        let running = stored_with(JobStatus::Running, old);
        store.insert(&complete).unwrap();
        store.insert(&running).unwrap();

        let deleted = store
            .delete_by_ids(
                &[complete.id(), running.id(), JobId::new()],
                &[JobStatus::Complete, JobStatus::Broken],
            )
            .unwrap();

        assert_eq!(deleted, 1);
        assert!(store.get(complete.id()).unwrap().is_none());
        assert!(store.get(running.id()).unwrap().is_some());
    }

    #[test]
    fn stats_count_every_status() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.insert(&descriptor("a")).unwrap();
        store.insert(&stored_with(JobStatus::Complete, now)).unwrap();
        store.insert(&stored_with(JobStatus::Complete, now)).unwrap();
        store.insert(&stored_with(JobStatus::Broken, now)).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.new, 1);
        assert_eq!(stats.complete, 2);
        assert_eq!(stats.broken, 1);
        assert_eq!(stats.total(), 4);
    }
}
