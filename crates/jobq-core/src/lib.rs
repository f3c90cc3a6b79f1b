mod backoff;
mod client;
mod error;
mod job;
mod status;
mod tier;

pub use backoff::BackoffPolicy;
pub use client::WorkerClient;
pub use error::{ClientError, DispatchError, ErrorKind, JobError, Result};
pub use job::{JobId, JobPayload, JobSpec, JobSpecBuilder, Role};
pub use status::{JobRecord, JobResult, JobState, JobStatus};
pub use tier::Tier;

use std::time::Duration;

pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Attempts granted to a job that does not override `max_retries`.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Per-attempt wall-clock limit for a job that does not override `timeout`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
