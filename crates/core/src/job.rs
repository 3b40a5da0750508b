//! Asynchronous job state and the sequence-gated reconciliation step.
//!
//! A job is observed through two channels (push and poll) that may
//! deliver the same information twice, out of order, or not at all.
//! [`JobState::apply`] is the only way channel data reaches the state: an
//! update is applied when its sequence number is strictly greater than
//! the last applied one, and once the job is terminal nothing else is.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::types::{JobId, Timestamp};

/// A delivered output of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Position of the output within the request (0-based variant index).
    pub index: u32,
    pub url: String,
}

/// Why a job ended in the failed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum JobFailure {
    /// The render service reported the failure.
    Server { message: String },
    /// Neither channel could reach the service any more.
    Transport { kind: ErrorKind, message: String },
}

impl JobFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Server { .. } => ErrorKind::Server,
            Self::Transport { kind, .. } => *kind,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Server { message } | Self::Transport { message, .. } => message,
        }
    }
}

/// Status-specific content of an update. Each variant carries only the
/// fields that make sense for that status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobEvent {
    Submitted,
    Running {
        progress: u8,
        #[serde(default)]
        artifacts: Vec<Artifact>,
    },
    Completed {
        #[serde(default)]
        artifacts: Vec<Artifact>,
    },
    Failed {
        message: String,
    },
    Cancelled,
}

/// One sequence-numbered observation of a job, from either channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub sequence: u64,
    #[serde(flatten)]
    pub event: JobEvent,
}

impl JobUpdate {
    pub fn new(sequence: u64, event: JobEvent) -> Self {
        Self { sequence, event }
    }
}

/// Lifecycle phase of a tracked job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum JobPhase {
    Submitted,
    Running,
    Completed,
    Failed { reason: JobFailure },
    Cancelled,
}

impl JobPhase {
    /// Position in the forward-only ordering
    /// `submitted → running → terminal`.
    fn rank(&self) -> u8 {
        match self {
            Self::Submitted => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed { .. } | Self::Cancelled => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }
}

/// The channel an update arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Push,
    Poll,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Push => "push",
            Self::Poll => "poll",
        })
    }
}

/// Result of offering an update to [`JobState::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The update advanced the state.
    Applied,
    /// The update's sequence number was not newer than the stored one.
    Stale,
    /// The job had already reached a terminal phase.
    Terminal,
}

/// Authoritative view of one asynchronous job.
///
/// Callers only ever see clones of this value; the tracker owning it is
/// the single writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: JobId,
    pub phase: JobPhase,
    pub progress_pct: u8,
    pub artifacts: Vec<Artifact>,
    /// Sequence number of the last applied update (0 = none yet).
    pub sequence: u64,
    /// Channel that delivered the last applied update.
    pub last_channel: Option<Channel>,
    pub updated_at: Timestamp,
}

impl JobState {
    /// State of a job whose id was just returned by the service.
    pub fn submitted(job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: job_id.into(),
            phase: JobPhase::Submitted,
            progress_pct: 0,
            artifacts: Vec::new(),
            sequence: 0,
            last_channel: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Merge an update delivered on `channel`.
    ///
    /// The phase never moves backwards, progress never decreases and
    /// artifacts are only appended; an update with an older phase still
    /// advances the stored sequence number.
    pub fn apply(&mut self, channel: Channel, update: JobUpdate) -> ApplyOutcome {
        if self.is_terminal() {
            return ApplyOutcome::Terminal;
        }
        if update.sequence <= self.sequence {
            return ApplyOutcome::Stale;
        }

        self.sequence = update.sequence;
        self.last_channel = Some(channel);
        self.updated_at = Utc::now();

        match update.event {
            JobEvent::Submitted => {}
            JobEvent::Running {
                progress,
                artifacts,
            } => {
                self.advance_to(JobPhase::Running);
                self.progress_pct = self.progress_pct.max(progress.min(100));
                self.append_artifacts(artifacts);
            }
            JobEvent::Completed { artifacts } => {
                self.append_artifacts(artifacts);
                self.progress_pct = 100;
                self.phase = JobPhase::Completed;
            }
            JobEvent::Failed { message } => {
                self.phase = JobPhase::Failed {
                    reason: JobFailure::Server { message },
                };
            }
            JobEvent::Cancelled => {
                self.phase = JobPhase::Cancelled;
            }
        }

        ApplyOutcome::Applied
    }

    /// Mark the job cancelled by the local caller. Returns `false` when
    /// the job was already terminal.
    pub fn cancel_locally(&mut self) -> bool {
        self.finish_locally(JobPhase::Cancelled)
    }

    /// Mark the job failed without a server verdict. Returns `false` when
    /// the job was already terminal.
    pub fn fail_locally(&mut self, reason: JobFailure) -> bool {
        self.finish_locally(JobPhase::Failed { reason })
    }

    fn finish_locally(&mut self, phase: JobPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.phase = phase;
        self.updated_at = Utc::now();
        true
    }

    fn advance_to(&mut self, phase: JobPhase) {
        if phase.rank() > self.phase.rank() {
            self.phase = phase;
        }
    }

    fn append_artifacts(&mut self, artifacts: Vec<Artifact>) {
        for artifact in artifacts {
            if !self.artifacts.iter().any(|a| a.index == artifact.index) {
                self.artifacts.push(artifact);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn running(sequence: u64, progress: u8) -> JobUpdate {
        JobUpdate::new(
            sequence,
            JobEvent::Running {
                progress,
                artifacts: Vec::new(),
            },
        )
    }

    fn artifact(index: u32) -> Artifact {
        Artifact {
            index,
            url: format!("https://cdn.example/{index}.png"),
        }
    }

    #[test]
    fn new_state_is_submitted() {
        let state = JobState::submitted("job-1");
        assert_eq!(state.phase, JobPhase::Submitted);
        assert_eq!(state.sequence, 0);
        assert!(state.last_channel.is_none());
    }

    #[test]
    fn newer_update_is_applied() {
        let mut state = JobState::submitted("job-1");
        assert_eq!(state.apply(Channel::Push, running(1, 10)), ApplyOutcome::Applied);
        assert_eq!(state.phase, JobPhase::Running);
        assert_eq!(state.progress_pct, 10);
        assert_eq!(state.last_channel, Some(Channel::Push));
    }

    #[test]
    fn equal_or_older_sequence_is_stale() {
        let mut state = JobState::submitted("job-1");
        state.apply(Channel::Poll, running(4, 40));

        assert_eq!(state.apply(Channel::Push, running(4, 45)), ApplyOutcome::Stale);
        assert_eq!(state.apply(Channel::Push, running(3, 90)), ApplyOutcome::Stale);
        assert_eq!(state.progress_pct, 40);
        assert_eq!(state.last_channel, Some(Channel::Poll));
    }

    #[test]
    fn push_five_overrides_poll_four_but_not_poll_six() {
        let mut state = JobState::submitted("job-1");
        state.apply(Channel::Poll, running(4, 40));
        assert_eq!(state.apply(Channel::Push, running(5, 50)), ApplyOutcome::Applied);
        assert_eq!(state.sequence, 5);

        let mut other = JobState::submitted("job-2");
        other.apply(Channel::Poll, running(6, 60));
        assert_eq!(other.apply(Channel::Push, running(5, 50)), ApplyOutcome::Stale);
        assert_eq!(other.sequence, 6);
        assert_eq!(other.progress_pct, 60);
    }

    #[test]
    fn progress_never_decreases_while_running() {
        let mut state = JobState::submitted("job-1");
        state.apply(Channel::Push, running(1, 70));
        state.apply(Channel::Poll, running(2, 30));
        assert_eq!(state.progress_pct, 70);
        assert_eq!(state.sequence, 2);
    }

    #[test]
    fn progress_is_clamped() {
        let mut state = JobState::submitted("job-1");
        state.apply(Channel::Push, running(1, 250));
        assert_eq!(state.progress_pct, 100);
    }

    #[test]
    fn phase_does_not_move_backwards() {
        let mut state = JobState::submitted("job-1");
        state.apply(Channel::Push, running(1, 10));
        assert_eq!(
            state.apply(Channel::Poll, JobUpdate::new(2, JobEvent::Submitted)),
            ApplyOutcome::Applied
        );
        assert_eq!(state.phase, JobPhase::Running);
        assert_eq!(state.sequence, 2);
    }

    #[test]
    fn terminal_state_ignores_everything() {
        let mut state = JobState::submitted("job-1");
        state.apply(
            Channel::Push,
            JobUpdate::new(
                3,
                JobEvent::Completed {
                    artifacts: vec![artifact(0)],
                },
            ),
        );
        assert_eq!(state.phase, JobPhase::Completed);
        assert_eq!(state.progress_pct, 100);

        assert_eq!(state.apply(Channel::Poll, running(9, 10)), ApplyOutcome::Terminal);
        assert_eq!(state.sequence, 3);
        assert!(!state.cancel_locally());
        assert_eq!(state.phase, JobPhase::Completed);
    }

    #[test]
    fn server_failure_is_distinct_from_transport_failure() {
        let mut state = JobState::submitted("job-1");
        state.apply(
            Channel::Poll,
            JobUpdate::new(
                1,
                JobEvent::Failed {
                    message: "nsfw filter".into(),
                },
            ),
        );
        assert_matches!(
            &state.phase,
            JobPhase::Failed { reason: JobFailure::Server { message } } if message == "nsfw filter"
        );

        let mut other = JobState::submitted("job-2");
        assert!(other.fail_locally(JobFailure::Transport {
            kind: ErrorKind::ServiceUnavailable,
            message: "circuit open".into(),
        }));
        assert_matches!(
            &other.phase,
            JobPhase::Failed { reason } if reason.kind() == ErrorKind::ServiceUnavailable
        );
    }

    #[test]
    fn artifacts_are_appended_never_reordered_or_removed() {
        let mut state = JobState::submitted("job-1");
        state.apply(
            Channel::Push,
            JobUpdate::new(
                1,
                JobEvent::Running {
                    progress: 30,
                    artifacts: vec![artifact(1)],
                },
            ),
        );
        state.apply(
            Channel::Poll,
            JobUpdate::new(
                2,
                JobEvent::Running {
                    progress: 60,
                    artifacts: vec![artifact(0), artifact(1)],
                },
            ),
        );
        state.apply(
            Channel::Push,
            JobUpdate::new(3, JobEvent::Completed { artifacts: vec![] }),
        );

        let indices: Vec<u32> = state.artifacts.iter().map(|a| a.index).collect();
        assert_eq!(indices, vec![1, 0]);
    }

    #[test]
    fn final_state_reflects_highest_sequence_for_any_arrival_order() {
        // Progress grows with sequence and the terminal update carries the
        // highest sequence, as the service emits them.
        let updates = vec![
            (Channel::Push, running(1, 10)),
            (Channel::Poll, running(2, 25)),
            (Channel::Push, running(3, 50)),
            (Channel::Poll, running(4, 80)),
            (
                Channel::Push,
                JobUpdate::new(
                    5,
                    JobEvent::Completed {
                        artifacts: vec![artifact(0)],
                    },
                ),
            ),
        ];

        let orders: [[usize; 5]; 6] = [
            [0, 1, 2, 3, 4],
            [4, 3, 2, 1, 0],
            [2, 0, 4, 1, 3],
            [1, 3, 0, 2, 4],
            [3, 4, 1, 0, 2],
            [0, 4, 2, 3, 1],
        ];

        for order in orders {
            let mut state = JobState::submitted("job-1");
            for &i in &order {
                let (channel, update) = updates[i].clone();
                state.apply(channel, update);
            }
            assert_eq!(state.sequence, 5, "order {order:?}");
            assert_eq!(state.phase, JobPhase::Completed, "order {order:?}");
            assert_eq!(state.progress_pct, 100, "order {order:?}");
        }

        // Without a terminal update, the highest running update wins.
        let running_only = &updates[..4];
        for order in [[3, 2, 1, 0], [1, 3, 0, 2], [0, 1, 2, 3]] {
            let mut state = JobState::submitted("job-1");
            for &i in &order {
                let (channel, update) = running_only[i].clone();
                state.apply(channel, update);
            }
            assert_eq!(state.sequence, 4);
            assert_eq!(state.progress_pct, 80);
        }
    }

    #[test]
    fn update_serializes_with_flat_status_tag() {
        let json = serde_json::to_value(running(7, 42)).unwrap();
        assert_eq!(json["sequence"], 7);
        assert_eq!(json["status"], "running");
        assert_eq!(json["progress"], 42);
    }
}
