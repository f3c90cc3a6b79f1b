use crate::{DispatchError, Result, Tier, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT, MAX_PAYLOAD_SIZE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a job, caller-supplied or generated.
///
/// Ordered lexicographically; the queue uses this as the final tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        JobId(id.into())
    }

    /// Random v4 UUID in its hyphenated text form.
    pub fn generate() -> Self {
        JobId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        JobId(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        JobId(id)
    }
}

/// Worker role name (e.g., "architect", "coder", "reviewer")
pub type Role = String;

/// Job payload (opaque bytes handed to the worker)
pub type JobPayload = Vec<u8>;

/// Immutable job request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: JobId,

    /// Priority class (lower dispatches first)
    pub tier: Tier,

    /// Worker-pool role that must process this job
    pub role: Role,

    /// Opaque data passed to the worker (max 10MB)
    pub payload: JobPayload,

    /// Second ordering key after tier
    pub submitted_at: DateTime<Utc>,

    /// Total attempts allowed, first attempt included
    pub max_retries: u32,

    /// Per-attempt wall-clock limit
    pub timeout: Duration,
}

impl JobSpec {
    /// Create a job with a generated id and default limits
    pub fn new(role: impl Into<Role>, payload: JobPayload, tier: Tier) -> Result<Self> {
        Self::builder(role, payload).tier(tier).build()
    }

    pub fn builder(role: impl Into<Role>, payload: JobPayload) -> JobSpecBuilder {
        JobSpecBuilder::new(role.into(), payload)
    }

    /// Reject malformed submissions before they reach the queue.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(DispatchError::InvalidJobSpec("job id is empty".to_string()));
        }
        if self.role.trim().is_empty() {
            return Err(DispatchError::InvalidJobSpec(format!(
                "job {} has an empty role",
                self.id
            )));
        }
        if self.max_retries == 0 {
            return Err(DispatchError::InvalidJobSpec(format!(
                "job {} allows zero attempts",
                self.id
            )));
        }
        if self.timeout.is_zero() {
            return Err(DispatchError::InvalidJobSpec(format!(
                "job {} has a zero timeout",
                self.id
            )));
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(DispatchError::PayloadTooLarge {
                max: MAX_PAYLOAD_SIZE,
                actual: self.payload.len(),
            });
        }
        Ok(())
    }
}

/// Builder for jobs with custom configuration
pub struct JobSpecBuilder {
    id: Option<JobId>,
    tier: Tier,
    role: Role,
    payload: JobPayload,
    submitted_at: Option<DateTime<Utc>>,
    max_retries: u32,
    timeout: Duration,
}

impl JobSpecBuilder {
    pub fn new(role: Role, payload: JobPayload) -> Self {
        JobSpecBuilder {
            id: None,
            tier: Tier::default(),
            role,
            payload,
            submitted_at: None,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn submitted_at(mut self, submitted_at: DateTime<Utc>) -> Self {
        self.submitted_at = Some(submitted_at);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<JobSpec> {
        let spec = JobSpec {
            id: self.id.unwrap_or_else(JobId::generate),
            tier: self.tier,
            role: self.role,
            payload: self.payload,
            submitted_at: self.submitted_at.unwrap_or_else(Utc::now),
            max_retries: self.max_retries,
            timeout: self.timeout,
        };
        spec.validate()?;
        Ok(spec)
    }
}
