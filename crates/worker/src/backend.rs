//! Model backends
//!
//! `OllamaLoader` talks to an Ollama-compatible server over HTTP.
//! `EchoLoader` answers in-process and is meant for development and tests.

use crate::client::error_body;
use crate::model::{ModelHandle, ModelLoader};
use async_trait::async_trait;
use promptloop_common::config::{BackendConfig, BackendKind};
use promptloop_common::{PromptLoopError, Result};
use promptloop_proto::TaskOptions;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Build the loader selected by `config.kind`
pub fn loader_from_config(config: &BackendConfig) -> Result<Arc<dyn ModelLoader>> {
    let loader: Arc<dyn ModelLoader> = match config.kind {
        BackendKind::Ollama => Arc::new(OllamaLoader::new(config.clone())?),
        BackendKind::Echo => Arc::new(EchoLoader::new()),
    };
    Ok(loader)
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
    stream: bool,
    #[serde(skip_serializing_if = "Map::is_empty")]
    options: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// HTTP client for the `/api/generate` endpoint with retry
#[derive(Clone)]
struct OllamaClient {
    http: reqwest::Client,
    config: BackendConfig,
}

impl OllamaClient {
    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.config.base_url.trim_end_matches('/'))
    }

    async fn generate(&self, request: &GenerateRequest<'_>) -> Result<GenerateResponse> {
        let mut attempt = 0;
        loop {
            match self.generate_once(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = backoff_delay(self.config.retry_backoff(), attempt);
                    warn!(
                        "Backend call for {} failed ({}), retrying in {:?}",
                        request.model, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn generate_once(&self, request: &GenerateRequest<'_>) -> Result<GenerateResponse> {
        let response = self
            .http
            .post(self.generate_url())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PromptLoopError::timeout(format!("generate {}", request.model))
                } else {
                    PromptLoopError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response.text().await, "backend");
            let message = format!("backend returned {}: {}", status, body);
            return Err(if status.is_server_error() {
                PromptLoopError::Connection(message)
            } else {
                PromptLoopError::inference(message)
            });
        }

        Ok(response.json().await?)
    }
}

/// Exponential backoff: `base * 2^attempt`
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}

/// Map task options onto backend generation options
fn generation_options(options: &TaskOptions) -> Map<String, Value> {
    let mut mapped = options.extra.clone();
    if let Some(temperature) = options.temperature {
        mapped.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(max_tokens) = options.max_tokens {
        mapped.insert("num_predict".to_string(), json!(max_tokens));
    }
    mapped
}

/// Loads models on an Ollama-compatible server
pub struct OllamaLoader {
    client: OllamaClient,
}

impl OllamaLoader {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client: OllamaClient { http, config },
        })
    }
}

#[async_trait]
impl ModelLoader for OllamaLoader {
    async fn load(&self, model_id: &str) -> Result<Box<dyn ModelHandle>> {
        // A request without a prompt makes the server load the model.
        let request = GenerateRequest {
            model: model_id,
            prompt: None,
            stream: false,
            options: Map::new(),
            keep_alive: None,
        };
        self.client.generate(&request).await.map_err(|e| {
            PromptLoopError::model(format!("failed to load {}: {}", model_id, e))
        })?;

        Ok(Box::new(OllamaModel {
            model_id: model_id.to_string(),
            client: self.client.clone(),
        }))
    }
}

struct OllamaModel {
    model_id: String,
    client: OllamaClient,
}

#[async_trait]
impl ModelHandle for OllamaModel {
    async fn generate(&self, prompt: &str, options: &TaskOptions) -> Result<String> {
        let request = GenerateRequest {
            model: &self.model_id,
            prompt: Some(prompt),
            stream: false,
            options: generation_options(options),
            keep_alive: None,
        };
        let response = self.client.generate(&request).await.map_err(|e| match e {
            PromptLoopError::Timeout(_) => e,
            other => PromptLoopError::inference(other.to_string()),
        })?;
        debug!(
            "Model {} produced {} bytes",
            self.model_id,
            response.response.len()
        );
        Ok(response.response)
    }

    async fn unload(&self) -> Result<()> {
        let request = GenerateRequest {
            model: &self.model_id,
            prompt: None,
            stream: false,
            options: Map::new(),
            keep_alive: Some(0),
        };
        self.client.generate_once(&request).await.map(|_| ())
    }
}

/// In-process backend that echoes the prompt back
#[derive(Debug, Default)]
pub struct EchoLoader {
    delay: Duration,
}

impl EchoLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate inference latency
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ModelLoader for EchoLoader {
    async fn load(&self, model_id: &str) -> Result<Box<dyn ModelHandle>> {
        Ok(Box::new(EchoModel {
            model_id: model_id.to_string(),
            delay: self.delay,
        }))
    }
}

struct EchoModel {
    model_id: String,
    delay: Duration,
}

#[async_trait]
impl ModelHandle for EchoModel {
    async fn generate(&self, prompt: &str, _options: &TaskOptions) -> Result<String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(format!("[{}] {}", self.model_id, prompt))
    }

    async fn unload(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(4000));
    }

    #[test]
    fn test_generation_options_mapping() {
        let mut options = TaskOptions {
            temperature: Some(0.5),
            max_tokens: Some(128),
            quality_mode: Some("pro".to_string()),
            ..Default::default()
        };
        options.extra.insert("top_p".to_string(), json!(0.9));

        let mapped = generation_options(&options);
        assert_eq!(mapped["temperature"], json!(0.5));
        assert_eq!(mapped["num_predict"], json!(128));
        assert_eq!(mapped["top_p"], json!(0.9));
        assert!(!mapped.contains_key("quality_mode"));
    }

    #[test]
    fn test_generate_request_shape() {
        let request = GenerateRequest {
            model: "llama3",
            prompt: None,
            stream: false,
            options: Map::new(),
            keep_alive: Some(0),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value, json!({ "model": "llama3", "stream": false, "keep_alive": 0 }));
    }

    #[tokio::test]
    async fn test_echo_backend() {
        let loader = EchoLoader::with_delay(Duration::from_millis(1));
        let model = loader.load("m1").await.unwrap();

        let output = model.generate("hello", &TaskOptions::default()).await.unwrap();
        assert_eq!(output, "[m1] hello");
        model.unload().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_backend_fails_load() {
        let config = BackendConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            max_retries: 1,
            retry_backoff_ms: 1,
            timeout_secs: 2,
            ..Default::default()
        };
        let loader = OllamaLoader::new(config).unwrap();

        let err = loader.load("llama3").await.err().unwrap();
        assert!(matches!(err, PromptLoopError::Model(_)));
    }
}
