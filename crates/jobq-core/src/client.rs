use crate::{ClientError, JobPayload};
use async_trait::async_trait;
use std::time::Duration;

/// Capability that performs one unit of work for a worker slot,
/// e.g. a single LLM completion against a bound backend.
///
/// The dispatcher enforces `timeout` on its own; it is passed in so
/// implementations can size their transport-level deadlines to match.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn invoke(&self, payload: JobPayload, timeout: Duration) -> Result<JobPayload, ClientError>;

    /// Short label used in logs and slot listings
    fn name(&self) -> &str {
        "worker"
    }
}
