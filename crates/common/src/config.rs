//! Configuration structures for PromptLoop
//!
//! This module defines all configuration types used by the scheduler and workers.
//! Configurations are loaded from YAML files and can be overridden by environment variables.

use crate::error::{PromptLoopError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for PromptLoop components
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptLoopConfig {
    /// Mode: either "scheduler" or "worker"
    pub mode: String,

    /// Server binding address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Scheduler-specific configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerConfig>,

    /// Worker-specific configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerConfig>,

    /// Observability configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Scheduler-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum gap since the last heartbeat before a worker is treated as offline
    #[serde(default = "default_liveness_window")]
    pub liveness_window_secs: u64,

    /// How often the liveness/retention sweep runs
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// How long finished tasks stay queryable
    #[serde(default = "default_task_retention")]
    pub task_retention_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            liveness_window_secs: default_liveness_window(),
            sweep_interval_secs: default_sweep_interval(),
            task_retention_secs: default_task_retention(),
        }
    }
}

impl SchedulerConfig {
    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }
}

/// Worker-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Unique worker identifier (random if absent)
    #[serde(default = "default_worker_id")]
    pub worker_id: String,

    /// Base URL of the scheduler
    #[serde(default = "default_scheduler_url")]
    pub scheduler_url: String,

    /// Models this worker advertises
    #[serde(default)]
    pub models: Vec<String>,

    /// Free accelerator memory in bytes
    #[serde(default)]
    pub free_vram: u64,

    /// Declared concurrency (execution is currently one task at a time)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,

    /// Hardware class: cpu, gpu or browser
    #[serde(default = "default_worker_type")]
    pub worker_type: String,

    /// Number of models kept resident at once
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Delay between empty polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Heartbeat period
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Timeout for calls to the scheduler
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Model used when a task names none
    #[serde(default)]
    pub default_model: Option<String>,

    /// Model backend
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            scheduler_url: default_scheduler_url(),
            models: Vec::new(),
            free_vram: 0,
            max_concurrent: default_max_concurrent(),
            worker_type: default_worker_type(),
            cache_capacity: default_cache_capacity(),
            poll_interval_ms: default_poll_interval(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            request_timeout_secs: default_request_timeout(),
            default_model: None,
            backend: BackendConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Model backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend kind
    #[serde(default)]
    pub kind: BackendKind,

    /// Base URL of the local model server
    #[serde(default = "default_backend_url")]
    pub base_url: String,

    /// Per-request timeout
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,

    /// Retries on transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff, doubled on every retry
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            base_url: default_backend_url(),
            timeout_secs: default_backend_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Backend kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Ollama-compatible local HTTP API
    Ollama,

    /// In-process echo backend (development)
    Echo,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Ollama
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,

    /// Enable structured logging
    #[serde(default = "default_structured_logging")]
    pub structured_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            enable_metrics: default_metrics(),
            structured_logging: default_structured_logging(),
        }
    }
}

/// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_liveness_window() -> u64 {
    90 // three missed 30s heartbeats
}

fn default_sweep_interval() -> u64 {
    15
}

fn default_task_retention() -> u64 {
    3600
}

fn default_worker_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_scheduler_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_worker_type() -> String {
    "cpu".to_string()
}

fn default_cache_capacity() -> usize {
    2
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    30
}

fn default_backend_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_backend_timeout() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

fn default_structured_logging() -> bool {
    false
}

impl PromptLoopConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            PromptLoopError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_yaml(&content)
            .map_err(|e| PromptLoopError::Config(format!("{} ({})", e, path.display())))
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: PromptLoopConfig = serde_yaml::from_str(content)
            .map_err(|e| PromptLoopError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Only the settings needed to reach a scheduler are read; everything
    /// else takes its default. `PROMPTLOOP_MODE` overrides `default_mode`.
    pub fn from_env(default_mode: &str) -> Result<Self> {
        let mode = std::env::var("PROMPTLOOP_MODE").unwrap_or_else(|_| default_mode.to_string());
        let port = std::env::var("PROMPTLOOP_PORT")
            .unwrap_or_else(|_| default_port().to_string())
            .parse()
            .map_err(|_| PromptLoopError::Config("Invalid port number".to_string()))?;

        let (scheduler, worker) = match mode.as_str() {
            "worker" => {
                let mut worker = WorkerConfig::default();
                if let Ok(url) = std::env::var("PROMPTLOOP_SCHEDULER_URL") {
                    worker.scheduler_url = url;
                }
                if let Ok(id) = std::env::var("PROMPTLOOP_WORKER_ID") {
                    worker.worker_id = id;
                }
                if let Ok(models) = std::env::var("PROMPTLOOP_MODELS") {
                    worker.models = models
                        .split(',')
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(String::from)
                        .collect();
                }
                (None, Some(worker))
            }
            _ => (Some(SchedulerConfig::default()), None),
        };

        let config = PromptLoopConfig {
            mode,
            bind_address: std::env::var("PROMPTLOOP_BIND_ADDRESS")
                .unwrap_or_else(|_| default_bind_address()),
            port,
            scheduler,
            worker,
            observability: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match self.mode.as_str() {
            "scheduler" => {
                let scheduler = self.scheduler.as_ref().ok_or_else(|| {
                    PromptLoopError::config("Scheduler config required for scheduler mode")
                })?;
                if scheduler.liveness_window_secs == 0 {
                    return Err(PromptLoopError::config(
                        "liveness_window_secs must be greater than zero",
                    ));
                }
            }
            "worker" => {
                let worker = self.worker.as_ref().ok_or_else(|| {
                    PromptLoopError::config("Worker config required for worker mode")
                })?;
                if worker.cache_capacity == 0 {
                    return Err(PromptLoopError::config("cache_capacity must be at least 1"));
                }
                if worker.worker_id.trim().is_empty() {
                    return Err(PromptLoopError::config("worker_id must not be empty"));
                }
                if !matches!(worker.worker_type.as_str(), "cpu" | "gpu" | "browser") {
                    return Err(PromptLoopError::config(format!(
                        "Invalid worker_type: {}",
                        worker.worker_type
                    )));
                }
            }
            _ => {
                return Err(PromptLoopError::config(format!(
                    "Invalid mode: {}",
                    self.mode
                )));
            }
        }
        Ok(())
    }

    /// Observability settings, falling back to defaults
    pub fn observability(&self) -> ObservabilityConfig {
        self.observability.clone().unwrap_or_default()
    }

    /// Get the liveness window as Duration
    pub fn liveness_window(&self) -> Result<Duration> {
        let scheduler = self
            .scheduler
            .as_ref()
            .ok_or_else(|| PromptLoopError::config("Scheduler config not found"))?;

        Ok(scheduler.liveness_window())
    }
}
