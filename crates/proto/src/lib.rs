//! PromptLoop wire protocol
//!
//! JSON message types exchanged between clients, the scheduler and workers.
//! Both the scheduler's HTTP surface and the worker's scheduler client
//! serialize exactly these structs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Task identifier
pub type TaskId = Uuid;

/// Worker identifier
pub type WorkerId = String;

/// Session identifier
pub type SessionId = String;

/// Priority tier a task is submitted at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Time-sensitive requests, always dispatched first
    HighPriority,

    /// Default tier
    Normal,

    /// Background / cheap requests, dispatched last and never sticky
    Economy,
}

impl Priority {
    /// Lanes in dispatch order
    pub const ALL: [Priority; 3] = [Priority::HighPriority, Priority::Normal, Priority::Economy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::HighPriority => "high_priority",
            Priority::Normal => "normal",
            Priority::Economy => "economy",
        }
    }

    /// Parse a priority name, falling back to `Normal` when absent or unknown
    pub fn parse_or_default(value: Option<&str>) -> Self {
        match value {
            Some("high_priority") => Priority::HighPriority,
            Some("economy") => Priority::Economy,
            _ => Priority::Normal,
        }
    }

    /// Lane index (0 = highest)
    pub fn lane(&self) -> usize {
        match self {
            Priority::HighPriority => 0,
            Priority::Normal => 1,
            Priority::Economy => 2,
        }
    }

    /// Whether session affinity is honoured for this tier
    pub fn uses_affinity(&self) -> bool {
        !matches!(self, Priority::Economy)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task generation options
///
/// Only `model` and `required_models` are interpreted by the scheduler and
/// worker; everything else is passed through to the model backend untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Model the worker should run this prompt against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Models a worker must advertise to be eligible
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_models: Option<BTreeSet<String>>,

    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Token budget for the completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Client-side quality selector (`pro`, `normal`, `economy`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_mode: Option<String>,

    /// Any other backend-specific fields
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskOptions {
    /// Options requesting a specific model
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Default::default()
        }
    }

    /// Whether a worker advertising `models` may run this task
    pub fn is_satisfied_by(&self, models: &BTreeSet<String>) -> bool {
        match &self.required_models {
            Some(required) => required.is_subset(models),
            None => true,
        }
    }
}

/// A late payload reported for a task that had already been cancelled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum LateReport {
    Result(String),
    Error(String),
}

/// Unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub priority: Priority,
    pub session_id: SessionId,
    pub prompt: String,
    #[serde(default)]
    pub options: TaskOptions,
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_worker: Option<WorkerId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub late_result: Option<LateReport>,
}

impl Task {
    /// Create a new pending task
    pub fn new(
        priority: Priority,
        session_id: SessionId,
        prompt: String,
        options: TaskOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            priority,
            session_id,
            prompt,
            options,
            created_at: Utc::now(),
            assigned_worker: None,
            assigned_at: None,
            finished_at: None,
            result: None,
            error: None,
            late_result: None,
        }
    }
}

/// Hardware class of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerType {
    Cpu,
    Gpu,
    Browser,
}

impl Default for WorkerType {
    fn default() -> Self {
        WorkerType::Cpu
    }
}

/// Capabilities a worker advertises on registration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    /// Models this worker can serve
    #[serde(default)]
    pub models: BTreeSet<String>,

    /// Free accelerator memory in bytes
    #[serde(default)]
    pub free_vram: u64,

    /// Declared concurrency; workers currently run one task at a time
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,

    #[serde(rename = "type", default)]
    pub worker_type: WorkerType,
}

fn default_max_concurrent() -> u32 {
    1
}

/// Availability of a worker as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Available,
    Busy,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Available => "available",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource stats carried by heartbeats
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    #[serde(default)]
    pub free_vram: u64,

    /// Load average over the last minute, if the platform reports one
    #[serde(default)]
    pub cpu_load: f64,

    /// Tasks currently executing
    #[serde(default)]
    pub in_flight: u32,
}

/// Registered worker as tracked by the scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub capabilities: WorkerCapabilities,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stats: Option<WorkerStats>,
}

// Request / response bodies

/// POST /worker/register
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerRequest {
    pub worker_id: WorkerId,
    #[serde(default)]
    pub capabilities: WorkerCapabilities,
}

/// POST /worker/{id}/heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub status: WorkerStatus,
    #[serde(default)]
    pub current_stats: WorkerStats,
}

/// POST /task/{id}/complete
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteTaskRequest {
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
}

/// POST /task/{id}/error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailTaskRequest {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
}

/// POST /api/enqueue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub session_id: SessionId,
    pub prompt: String,
    /// Free-form so unknown tiers degrade to `normal` instead of failing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default)]
    pub options: TaskOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// Generic acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            ok: true,
            outcome: None,
        }
    }

    pub fn with_outcome(ok: bool, outcome: impl Into<String>) -> Self {
        Self {
            ok,
            outcome: Some(outcome.into()),
        }
    }
}

/// Body returned by GET /api/status/{id} for unknown ids
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotFound {
    pub status: String,
}

impl NotFound {
    pub fn new() -> Self {
        Self {
            status: "not_found".to_string(),
        }
    }
}

impl Default for NotFound {
    fn default() -> Self {
        Self::new()
    }
}

/// Lane depths and counts returned by GET /api/stats
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub high_priority: usize,
    pub normal: usize,
    pub economy: usize,
    pub tasks_total: usize,
    pub tasks_assigned: usize,
    pub tasks_finished: usize,
    pub workers_available: usize,
    pub workers_busy: usize,
    pub workers_offline: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_defaults_to_normal() {
        assert_eq!(Priority::parse_or_default(None), Priority::Normal);
        assert_eq!(Priority::parse_or_default(Some("urgent")), Priority::Normal);
        assert_eq!(
            Priority::parse_or_default(Some("high_priority")),
            Priority::HighPriority
        );
        assert_eq!(Priority::parse_or_default(Some("economy")), Priority::Economy);
    }

    #[test]
    fn test_required_models_subset() {
        let models: BTreeSet<String> = ["m1", "m2"].iter().map(|s| s.to_string()).collect();

        let mut options = TaskOptions::default();
        assert!(options.is_satisfied_by(&models));
        assert!(options.is_satisfied_by(&BTreeSet::new()));

        options.required_models = Some(["m1".to_string()].into_iter().collect());
        assert!(options.is_satisfied_by(&models));

        options.required_models = Some(["m3".to_string()].into_iter().collect());
        assert!(!options.is_satisfied_by(&models));
    }

    #[test]
    fn test_options_keep_unknown_fields() {
        let json = serde_json::json!({
            "model": "llama3",
            "quality_mode": "pro",
            "top_p": 0.9
        });
        let options: TaskOptions = serde_json::from_value(json).unwrap();

        assert_eq!(options.model.as_deref(), Some("llama3"));
        assert_eq!(options.extra.get("top_p"), Some(&serde_json::json!(0.9)));

        let back = serde_json::to_value(&options).unwrap();
        assert_eq!(back["top_p"], serde_json::json!(0.9));
    }

    #[test]
    fn test_capabilities_wire_names() {
        let json = serde_json::json!({
            "models": ["m1"],
            "free_vram": 1024,
            "type": "gpu"
        });
        let caps: WorkerCapabilities = serde_json::from_value(json).unwrap();

        assert_eq!(caps.worker_type, WorkerType::Gpu);
        assert_eq!(caps.max_concurrent, 1);
        assert!(caps.models.contains("m1"));
    }
}
