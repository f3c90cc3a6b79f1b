use jobq_core::{ClientError, JobPayload, JobSpec, WorkerClient};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Runs a single attempt of a job against a slot's client.
pub struct AttemptExecutor {
    client: Arc<dyn WorkerClient>,
}

impl AttemptExecutor {
    pub fn new(client: Arc<dyn WorkerClient>) -> Self {
        AttemptExecutor { client }
    }

    /// Invoke the client under the job's per-attempt timeout.
    ///
    /// On timeout the in-flight call is dropped and nothing it produced is kept.
    /// A panicking client is reported as a protocol error instead of taking
    /// the supervising task down with it.
    pub async fn execute(&self, job: &JobSpec, attempt: u32) -> Result<JobPayload, ClientError> {
        let client = self.client.clone();
        let payload = job.payload.clone();
        let limit = job.timeout;

        debug!(
            "Executing job {} attempt {} on {} with timeout {:?}",
            job.id,
            attempt,
            client.name(),
            limit
        );

        let handle = tokio::spawn(async move { timeout(limit, client.invoke(payload, limit)).await });

        match handle.await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                warn!("Job {} attempt {} timed out after {:?}", job.id, attempt, limit);
                Err(ClientError::Timeout)
            }
            Err(e) if e.is_panic() => {
                error!("Job {} attempt {} panicked in worker client", job.id, attempt);
                Err(ClientError::Protocol("worker client panicked".to_string()))
            }
            Err(_) => Err(ClientError::Unreachable("attempt was aborted".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{EchoClient, SleepClient};
    use async_trait::async_trait;
    use jobq_core::Tier;
    use std::time::Duration;

    struct PanickingClient;

    #[async_trait]
    impl WorkerClient for PanickingClient {
        async fn invoke(&self, _payload: JobPayload, _timeout: Duration) -> Result<JobPayload, ClientError> {
            panic!("backend driver bug");
        }
    }

    fn job(timeout: Duration) -> JobSpec {
        JobSpec::builder("coder", b"test data".to_vec())
            .tier(Tier::Pro)
            .timeout(timeout)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_executor_success() {
        let executor = AttemptExecutor::new(Arc::new(EchoClient));

        let result = executor.execute(&job(Duration::from_secs(1)), 1).await.unwrap();
        assert_eq!(result, b"test data");
    }

    #[tokio::test]
    async fn test_executor_timeout() {
        let executor = AttemptExecutor::new(Arc::new(SleepClient::new(Duration::from_secs(2))));

        let result = executor.execute(&job(Duration::from_millis(100)), 1).await;
        assert_eq!(result, Err(ClientError::Timeout));
    }

    #[tokio::test]
    async fn test_executor_recovers_from_panic() {
        let executor = AttemptExecutor::new(Arc::new(PanickingClient));

        let result = executor.execute(&job(Duration::from_secs(1)), 1).await;
        assert!(matches!(result, Err(ClientError::Protocol(_))));
    }
}
