//! The persisted unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::QueueError;
use crate::id::JobId;
use crate::status::{ExecutionMode, JobStatus};

/// Durable record of one job instance and its lifecycle state.
///
/// Status, mode, messages and progress are only reachable through methods so that
/// every mutation goes through the lifecycle checks and refreshes `last_edited`.
/// Stores rebuild descriptors from rows through [`DescriptorRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "DescriptorRecord", from = "DescriptorRecord")]
pub struct JobDescriptor {
    id: JobId,
    kind: String,
    title: String,
    status: JobStatus,
    mode: ExecutionMode,
    payload: JsonValue,
    scheduled_start: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    last_edited: DateTime<Utc>,
    messages: Vec<String>,
    total_steps: u32,
    current_step: u32,
}

/// Flat, storage-facing view of a descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorRecord {
    pub id: JobId,
    pub kind: String,
    pub title: String,
    pub status: JobStatus,
    pub mode: ExecutionMode,
    pub payload: JsonValue,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_edited: DateTime<Utc>,
    pub messages: Vec<String>,
    pub total_steps: u32,
    pub current_step: u32,
}

impl JobDescriptor {
    /// Create a `New` descriptor with a fresh id.
    pub fn new(
        kind: impl Into<String>,
        title: impl Into<String>,
        mode: ExecutionMode,
        payload: JsonValue,
        scheduled_start: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            kind: kind.into(),
            title: title.into(),
            status: JobStatus::New,
            mode,
            payload,
            scheduled_start,
            created_at: now,
            last_edited: now,
            messages: Vec::new(),
            total_steps: 0,
            current_step: 0,
        }
    }

    /// Rebuild a descriptor from its stored form.
    ///
    /// `last_edited` is raised to `created_at` if a row claims otherwise.
    pub fn from_record(record: DescriptorRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            title: record.title,
            status: record.status,
            mode: record.mode,
            payload: record.payload,
            scheduled_start: record.scheduled_start,
            created_at: record.created_at,
            last_edited: record.last_edited.max(record.created_at),
            messages: record.messages,
            total_steps: record.total_steps,
            current_step: record.current_step,
        }
    }

    pub fn to_record(&self) -> DescriptorRecord {
        self.clone().into()
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn scheduled_start(&self) -> Option<DateTime<Utc>> {
        self.scheduled_start
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_edited(&self) -> DateTime<Utc> {
        self.last_edited
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn total_steps(&self) -> u32 {
        self.total_steps
    }

    pub fn current_step(&self) -> u32 {
        self.current_step
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Eligible for execution at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_start.is_none_or(|at| at <= now)
    }

    /// Move to `next`, enforcing the lifecycle.
    ///
    /// On error the descriptor is left untouched.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), QueueError> {
        if self.status.is_terminal() {
            return Err(QueueError::AlreadyTerminal {
                id: self.id,
                status: self.status,
            });
        }
        self.status.check_transition(next)?;
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn add_message(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
        self.touch();
    }

    pub fn set_total_steps(&mut self, total: u32) {
        self.total_steps = total;
        self.touch();
    }

    pub fn set_current_step(&mut self, step: u32) {
        self.current_step = step;
        self.touch();
    }

    /// Progress in percent, capped at 100.
    pub fn completion_percent(&self) -> u8 {
        if self.total_steps == 0 {
            return if self.status == JobStatus::Complete { 100 } else { 0 };
        }
        let pct = u64::from(self.current_step) * 100 / u64::from(self.total_steps);
        pct.min(100) as u8
    }

    fn touch(&mut self) {
        self.last_edited = Utc::now().max(self.last_edited);
    }
}

impl From<JobDescriptor> for DescriptorRecord {
    fn from(d: JobDescriptor) -> Self {
        Self {
            id: d.id,
            kind: d.kind,
            title: d.title,
            status: d.status,
            mode: d.mode,
            payload: d.payload,
            scheduled_start: d.scheduled_start,
            created_at: d.created_at,
            last_edited: d.last_edited,
            messages: d.messages,
            total_steps: d.total_steps,
            current_step: d.current_step,
        }
    }
}

impl From<DescriptorRecord> for JobDescriptor {
    fn from(record: DescriptorRecord) -> Self {
        Self::from_record(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn descriptor() -> JobDescriptor {
        JobDescriptor::new(
            "report",
            "Nightly report",
            ExecutionMode::Queued,
            serde_json::json!({"day": "2026-10-16"}),
            None,
        )
    }

    #[test]
    fn new_descriptor_starts_new_and_fresh() {
        let d = descriptor();
        assert_eq!(d.status(), JobStatus::New);
        assert_eq!(d.created_at(), d.last_edited());
        assert!(d.messages().is_empty());
        assert!(d.is_due(Utc::now()));
    }

    #[test]
    fn transition_refreshes_last_edited() {
        let mut record = descriptor().to_record();
        record.created_at = Utc::now() - Duration::days(3);
        record.last_edited = record.created_at;
        let mut d = JobDescriptor::from_record(record);
        let before = d.last_edited();

        d.transition(JobStatus::Initialising).unwrap();

        assert_eq!(d.status(), JobStatus::Initialising);
        assert!(d.last_edited() > before);
    }

    #[test]
    fn invalid_transition_leaves_descriptor_unchanged() {
        let mut d = descriptor();
        let snapshot = d.clone();

        let err = d.transition(JobStatus::Complete).unwrap_err();

        assert_eq!(
            err,
            QueueError::InvalidTransition {
                from: JobStatus::New,
                to: JobStatus::Complete,
            }
        );
        assert_eq!(d, snapshot);
    }

    #[test]
    fn terminal_descriptor_rejects_every_transition() {
        let mut d = descriptor();
        d.transition(JobStatus::Initialising).unwrap();
        d.transition(JobStatus::Running).unwrap();
        d.transition(JobStatus::Broken).unwrap();

        for next in JobStatus::ALL {
            assert_eq!(
                d.transition(next),
                Err(QueueError::AlreadyTerminal {
                    id: d.id(),
                    status: JobStatus::Broken,
                })
            );
        }
    }

    #[test]
    fn future_schedule_is_not_due() {
        let later = Utc::now() + Duration::hours(24);
        let d = JobDescriptor::new(
            "cleanup",
            "Cleanup",
            ExecutionMode::Immediate,
            serde_json::Value::Null,
            Some(later),
        );
        assert!(!d.is_due(Utc::now()));
        assert!(d.is_due(later));
    }

    #[test]
    fn completion_percent_is_capped() {
        let mut d = descriptor();
        assert_eq!(d.completion_percent(), 0);
        d.set_total_steps(4);
        d.set_current_step(1);
        assert_eq!(d.completion_percent(), 25);
        d.set_current_step(9);
        assert_eq!(d.completion_percent(), 100);
    }

    #[test]
    fn record_keeps_last_edited_after_creation() {
        let mut record = descriptor().to_record();
        record.last_edited = record.created_at - Duration::days(1);
        let d = JobDescriptor::from_record(record.clone());
        assert_eq!(d.last_edited(), record.created_at);
    }

    #[test]
    fn serde_goes_through_the_record() {
        let d = descriptor();
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["status"], "New");
        assert_eq!(json["mode"], "queued");
        let back: JobDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(back, d);
    }
}
