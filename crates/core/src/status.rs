//! Job lifecycle: statuses, legal transitions and execution modes.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Status of a job descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Persisted, not yet picked up.
    New,
    /// Claimed by a runner, job logic not started.
    Initialising,
    Running,
    /// Job logic yielded and asked to be picked up again.
    Waiting,
    /// Stopped by an operator; only `resume` restarts it.
    Paused,
    Complete,
    Broken,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::New,
        JobStatus::Initialising,
        JobStatus::Running,
        JobStatus::Waiting,
        JobStatus::Paused,
        JobStatus::Complete,
        JobStatus::Broken,
        JobStatus::Cancelled,
    ];

    /// Statuses a worker may claim.
    pub const CLAIMABLE: [JobStatus; 2] = [JobStatus::New, JobStatus::Waiting];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "New",
            JobStatus::Initialising => "Initialising",
            JobStatus::Running => "Running",
            JobStatus::Waiting => "Waiting",
            JobStatus::Paused => "Paused",
            JobStatus::Complete => "Complete",
            JobStatus::Broken => "Broken",
            JobStatus::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Complete | JobStatus::Broken | JobStatus::Cancelled
        )
    }

    /// Statuses reachable from `self` in one step.
    pub fn next_statuses(&self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            New => &[Initialising, Cancelled],
            Initialising => &[Running, Cancelled],
            Running => &[Complete, Broken, Waiting, Paused, Cancelled],
            Waiting | Paused => &[Running, Cancelled],
            Complete | Broken | Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        self.next_statuses().contains(&next)
    }

    /// Validate a single lifecycle step.
    pub fn check_transition(&self, next: JobStatus) -> Result<(), QueueError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(QueueError::InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| QueueError::configuration(format!("unknown job status: {trimmed:?}")))
    }
}

/// How a job is started once submitted.
///
/// Declared by the job type and fixed for the descriptor's lifetime.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run synchronously inside the submitting call.
    Immediate,
    /// Persist and let a worker pick it up.
    #[default]
    Queued,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Immediate => "immediate",
            ExecutionMode::Queued => "queued",
        }
    }
}

impl core::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "immediate" => Ok(ExecutionMode::Immediate),
            "queued" => Ok(ExecutionMode::Queued),
            other => Err(QueueError::configuration(format!(
                "unknown execution mode: {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        let path = [
            JobStatus::New,
            JobStatus::Initialising,
            JobStatus::Running,
            JobStatus::Complete,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn waiting_and_paused_resume_into_running() {
        assert!(JobStatus::Waiting.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Paused.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Paused.can_transition_to(JobStatus::Initialising));
    }

    #[test]
    fn every_non_terminal_status_can_be_cancelled() {
        for status in JobStatus::ALL {
            assert_eq!(
                status.can_transition_to(JobStatus::Cancelled),
                !status.is_terminal(),
                "{status}"
            );
        }
    }

    #[test]
    fn skipping_initialising_is_rejected() {
        assert_eq!(
            JobStatus::New.check_transition(JobStatus::Running),
            Err(QueueError::InvalidTransition {
                from: JobStatus::New,
                to: JobStatus::Running,
            })
        );
    }

    #[test]
    fn status_parsing_is_case_insensitive() {
        assert_eq!("complete".parse::<JobStatus>().unwrap(), JobStatus::Complete);
        assert_eq!(" Broken ".parse::<JobStatus>().unwrap(), JobStatus::Broken);
        assert!("Done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn mode_round_trips_through_str() {
        for mode in [ExecutionMode::Immediate, ExecutionMode::Queued] {
            assert_eq!(mode.as_str().parse::<ExecutionMode>().unwrap(), mode);
        }
    }

    #[cfg(test)]
    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn any_status() -> impl Strategy<Value = JobStatus> {
            (0..JobStatus::ALL.len()).prop_map(|i| JobStatus::ALL[i])
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: terminal statuses never transition anywhere.
            #[test]
            fn terminal_statuses_are_final(from in any_status(), to in any_status()) {
                if from.is_terminal() {
                    prop_assert!(from.check_transition(to).is_err());
                }
            }

            /// Property: a random walk only ever moves along declared edges and
            /// stops for good once it hits a terminal status.
            #[test]
            fn random_walks_stay_on_edges(steps in prop::collection::vec(any_status(), 1..32)) {
                let mut current = JobStatus::New;
                for next in steps {
                    match current.check_transition(next) {
                        Ok(()) => {
                            prop_assert!(current.next_statuses().contains(&next));
                            current = next;
                        }
                        Err(QueueError::InvalidTransition { from, to }) => {
                            prop_assert_eq!(from, current);
                            prop_assert_eq!(to, next);
                        }
                        Err(other) => prop_assert!(false, "unexpected error {other}"),
                    }
                }
                if current.is_terminal() {
                    prop_assert!(current.next_statuses().is_empty());
                }
            }
        }
    }
}
