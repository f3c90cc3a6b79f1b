//! `WorkerClient` backed by an Ollama server's `/api/generate` endpoint.

use async_trait::async_trait;
use jobq_core::{ClientError, JobPayload, WorkerClient};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Job payload accepted by the client. A payload that is not a JSON object
/// is sent as the prompt text itself.
#[derive(Debug, Deserialize)]
struct PromptPayload {
    prompt: String,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    options: Option<Value>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<Value>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

pub struct OllamaClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    system: Option<String>,
    options: Option<Value>,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(OllamaClient {
            http,
            endpoint: format!("{}/api/generate", base_url.trim_end_matches('/')),
            model: model.into(),
            system: None,
            options: None,
        })
    }

    /// System prompt used when the payload does not carry its own
    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system = system;
        self
    }

    /// Model options used when the payload does not carry its own
    pub fn with_options(mut self, options: Option<Value>) -> Self {
        self.options = options;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, payload: &[u8]) -> Result<GenerateRequest<'_>, ClientError> {
        let parsed = match serde_json::from_slice::<PromptPayload>(payload) {
            Ok(parsed) => parsed,
            Err(_) => {
                let prompt = std::str::from_utf8(payload)
                    .map_err(|_| ClientError::Rejected("payload is neither JSON nor UTF-8 text".to_string()))?;
                PromptPayload {
                    prompt: prompt.to_string(),
                    system: None,
                    options: None,
                }
            }
        };

        if parsed.prompt.trim().is_empty() {
            return Err(ClientError::Rejected("prompt is empty".to_string()));
        }

        Ok(GenerateRequest {
            model: &self.model,
            prompt: parsed.prompt,
            system: parsed.system.or_else(|| self.system.clone()),
            options: parsed.options.or_else(|| self.options.clone()),
            stream: false,
        })
    }
}

fn transport_error(err: reqwest::Error) -> ClientError {
    if err.is_timeout() {
        ClientError::Timeout
    } else if err.is_connect() {
        ClientError::Unreachable(err.to_string())
    } else if err.is_decode() {
        ClientError::Protocol(err.to_string())
    } else {
        ClientError::Unreachable(err.to_string())
    }
}

#[async_trait]
impl WorkerClient for OllamaClient {
    async fn invoke(&self, payload: JobPayload, timeout: Duration) -> Result<JobPayload, ClientError> {
        let request = self.build_request(&payload)?;
        debug!("POST {} (model {})", self.endpoint, self.model);

        let response = self
            .http
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::REQUEST_TIMEOUT {
            return Err(ClientError::Timeout);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ClientError::Unreachable(format!("backend busy: {}", status)));
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Rejected(format!("{}: {}", status, body.trim())));
        }
        if status.is_server_error() {
            return Err(ClientError::Unreachable(format!("backend returned {}", status)));
        }

        let body = response.text().await.map_err(transport_error)?;
        let generated: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| ClientError::Protocol(format!("unexpected response body: {}", e)))?;

        if generated.response.trim().is_empty() {
            return Err(ClientError::EmptyResponse);
        }

        Ok(generated.response.into_bytes())
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
