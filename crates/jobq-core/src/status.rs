use crate::{DispatchError, JobError, JobId, JobPayload, JobSpec, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a job.
///
/// ```text
/// Pending -> Assigned -> Running -> Succeeded
///                        Running -> Retrying -> Assigned -> Running ...
///                        Running -> Failed
/// Pending | Assigned | Running | Retrying -> Cancelled
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting in the priority queue for a free slot
    Pending,
    /// Removed from the queue and bound to a slot, attempt not started yet
    Assigned { slot: String },
    /// Attempt `attempt` is in flight on `slot`
    Running { slot: String, attempt: u32 },
    /// Last attempt failed with a retryable error; re-enters the queue at `retry_at`
    Retrying {
        attempt: u32,
        retry_at: DateTime<Utc>,
        last_error: JobError,
    },
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn name(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Assigned { .. } => "assigned",
            JobState::Running { .. } => "running",
            JobState::Retrying { .. } => "retrying",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Waiting for a slot, either fresh or after a backoff.
    pub fn is_queued(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Retrying { .. })
    }

    /// Slot currently holding this job, if any.
    pub fn slot(&self) -> Option<&str> {
        match self {
            JobState::Assigned { slot } | JobState::Running { slot, .. } => Some(slot),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: &JobState) -> bool {
        use JobState::*;

        match (self, next) {
            (Pending, Assigned { .. }) => true,
            (Assigned { .. }, Running { .. }) => true,
            (Running { .. }, Succeeded | Failed | Retrying { .. }) => true,
            (Retrying { .. }, Assigned { .. }) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Mutable lifecycle record, one per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: JobState,

    /// Attempts that have entered `Running`
    pub attempts_used: u32,

    /// When the dispatcher accepted the job
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// When the first attempt started
    pub started_at: Option<DateTime<Utc>>,

    /// When a terminal state was reached
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobStatus {
    pub fn pending(job_id: JobId) -> Self {
        let now = Utc::now();
        JobStatus {
            job_id,
            state: JobState::Pending,
            attempts_used: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Record created directly in `Failed`, used when a job is refused at submit.
    pub fn failed_on_arrival(job_id: JobId) -> Self {
        let mut status = Self::pending(job_id);
        status.state = JobState::Failed;
        status.finished_at = Some(status.created_at);
        status
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply a state change, rejecting moves the lifecycle does not allow
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(&next) {
            return Err(DispatchError::InvalidTransition {
                job_id: self.job_id.clone(),
                from: self.state.name(),
                to: next.name(),
            });
        }

        let now = Utc::now();
        if let JobState::Running { .. } = next {
            self.attempts_used += 1;
            self.started_at.get_or_insert(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }

        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    /// Bind the job to a slot
    pub fn assign(&mut self, slot: impl Into<String>) -> Result<()> {
        self.transition(JobState::Assigned { slot: slot.into() })
    }

    /// Begin the next attempt on the assigned slot. Returns the attempt number.
    pub fn start_attempt(&mut self) -> Result<u32> {
        let slot = match &self.state {
            JobState::Assigned { slot } => slot.clone(),
            other => {
                return Err(DispatchError::InvalidTransition {
                    job_id: self.job_id.clone(),
                    from: other.name(),
                    to: "running",
                })
            }
        };

        let attempt = self.attempts_used + 1;
        self.transition(JobState::Running { slot, attempt })?;
        Ok(attempt)
    }

    /// Park the job until `retry_at` after a retryable failure
    pub fn schedule_retry(&mut self, last_error: JobError, retry_at: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Retrying {
            attempt: self.attempts_used,
            retry_at,
            last_error,
        })
    }

    pub fn succeed(&mut self) -> Result<()> {
        self.transition(JobState::Succeeded)
    }

    pub fn fail(&mut self) -> Result<()> {
        self.transition(JobState::Failed)
    }

    /// Returns false when the job had already reached a terminal state.
    pub fn cancel(&mut self) -> bool {
        self.transition(JobState::Cancelled).is_ok()
    }

    /// Put a job that was on a slot when the process stopped back into the queue.
    /// Attempts already used are kept.
    pub fn release_after_restart(&mut self) -> bool {
        match self.state {
            JobState::Assigned { .. } | JobState::Running { .. } => {
                self.state = JobState::Pending;
                self.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Time from the first attempt start to the terminal transition.
    pub fn total_wall_time(&self) -> Duration {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,

    /// Terminal state: Succeeded, Failed or Cancelled
    pub state: JobState,

    /// Worker output (on success)
    pub output: Option<JobPayload>,

    /// Failure taxonomy and message (on failure or cancellation)
    pub error: Option<JobError>,

    pub attempts_used: u32,
    pub total_wall_time: Duration,
}

impl JobResult {
    pub fn succeeded(status: &JobStatus, output: JobPayload) -> Self {
        Self::from_status(status, Some(output), None)
    }

    pub fn failed(status: &JobStatus, error: JobError) -> Self {
        Self::from_status(status, None, Some(error))
    }

    pub fn cancelled(status: &JobStatus) -> Self {
        Self::from_status(
            status,
            None,
            Some(JobError::new(
                crate::ErrorKind::Cancelled,
                "cancelled by caller",
            )),
        )
    }

    fn from_status(status: &JobStatus, output: Option<JobPayload>, error: Option<JobError>) -> Self {
        JobResult {
            job_id: status.job_id.clone(),
            state: status.state.clone(),
            output,
            error,
            attempts_used: status.attempts_used,
            total_wall_time: status.total_wall_time(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == JobState::Succeeded
    }
}

/// Everything stored for one job id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub spec: JobSpec,
    pub status: JobStatus,
    pub result: Option<JobResult>,
}

impl JobRecord {
    pub fn new(spec: JobSpec) -> Self {
        let status = JobStatus::pending(spec.id.clone());
        JobRecord {
            spec,
            status,
            result: None,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.spec.id
    }

    /// Serialize record to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(DispatchError::from)
    }

    /// Deserialize record from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(DispatchError::from)
    }
}
