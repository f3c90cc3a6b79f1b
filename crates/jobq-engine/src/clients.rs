//! Reference `WorkerClient` implementations for local runs and tests.

use async_trait::async_trait;
use jobq_core::{ClientError, JobPayload, WorkerClient};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Returns the payload unchanged
pub struct EchoClient;

#[async_trait]
impl WorkerClient for EchoClient {
    async fn invoke(&self, payload: JobPayload, _timeout: Duration) -> Result<JobPayload, ClientError> {
        Ok(payload)
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// Simulates a slow backend
pub struct SleepClient {
    duration: Duration,
}

impl SleepClient {
    pub fn new(duration: Duration) -> Self {
        SleepClient { duration }
    }
}

#[async_trait]
impl WorkerClient for SleepClient {
    async fn invoke(&self, payload: JobPayload, _timeout: Duration) -> Result<JobPayload, ClientError> {
        tokio::time::sleep(self.duration).await;
        Ok(payload)
    }

    fn name(&self) -> &str {
        "sleep"
    }
}

/// Plays back a fixed sequence of outcomes, then echoes the payload.
pub struct ScriptedClient {
    script: Mutex<VecDeque<Result<JobPayload, ClientError>>>,
    calls: AtomicU32,
}

impl ScriptedClient {
    pub fn new(script: Vec<Result<JobPayload, ClientError>>) -> Self {
        ScriptedClient {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        }
    }

    /// Fails with `error` `times` times, then succeeds
    pub fn failing_times(times: usize, error: ClientError) -> Self {
        Self::new(vec![Err(error); times])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerClient for ScriptedClient {
    async fn invoke(&self, payload: JobPayload, _timeout: Duration) -> Result<JobPayload, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        next.unwrap_or(Ok(payload))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Fails every call with the same error
pub struct FailingClient {
    error: ClientError,
    calls: AtomicU32,
}

impl FailingClient {
    pub fn new(error: ClientError) -> Self {
        FailingClient {
            error,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerClient for FailingClient {
    async fn invoke(&self, _payload: JobPayload, _timeout: Duration) -> Result<JobPayload, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }

    fn name(&self) -> &str {
        "failing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_client() {
        let client = EchoClient;
        let result = client.invoke(b"test".to_vec(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(result, b"test");
    }

    #[tokio::test]
    async fn test_scripted_client_plays_back_then_echoes() {
        let client = ScriptedClient::failing_times(2, ClientError::EmptyResponse);

        assert_eq!(
            client.invoke(vec![1], Duration::from_secs(1)).await,
            Err(ClientError::EmptyResponse)
        );
        assert_eq!(
            client.invoke(vec![1], Duration::from_secs(1)).await,
            Err(ClientError::EmptyResponse)
        );
        assert_eq!(client.invoke(vec![1], Duration::from_secs(1)).await, Ok(vec![1]));
        assert_eq!(client.calls(), 3);
    }
}
