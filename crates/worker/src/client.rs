//! Scheduler client
//!
//! The worker only ever talks to the scheduler through `SchedulerApi`, so the
//! agent can be driven by an in-process fake in tests.

use async_trait::async_trait;
use promptloop_common::{PromptLoopError, Result};
use promptloop_proto::{
    CompleteTaskRequest, FailTaskRequest, HeartbeatRequest, RegisterWorkerRequest, Task, TaskId,
    WorkerCapabilities,
};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

/// Worker-side view of the scheduler
#[async_trait]
pub trait SchedulerApi: Send + Sync {
    /// Register (or re-register) this worker
    async fn register(&self, worker_id: &str, capabilities: &WorkerCapabilities) -> Result<()>;

    /// Ask for the next task; `None` when there is nothing to do
    async fn poll_task(&self, worker_id: &str) -> Result<Option<Task>>;

    /// Report liveness; `NotFound` means the scheduler forgot this worker
    async fn heartbeat(&self, worker_id: &str, request: &HeartbeatRequest) -> Result<()>;

    async fn complete_task(&self, task_id: &TaskId, worker_id: &str, result: String) -> Result<()>;

    async fn fail_task(&self, task_id: &TaskId, worker_id: &str, error: String) -> Result<()>;

    async fn deregister(&self, worker_id: &str) -> Result<()>;
}

/// `SchedulerApi` over the scheduler's HTTP surface
#[derive(Clone)]
pub struct HttpSchedulerClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSchedulerClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Map a non-success response onto an error
async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = error_body(response.text().await, what);
    let message = format!("{} returned {}: {}", what, status, body);
    Err(match status {
        StatusCode::NOT_FOUND => PromptLoopError::not_found(message),
        StatusCode::CONFLICT => PromptLoopError::conflict(message),
        StatusCode::BAD_REQUEST => PromptLoopError::invalid_input(message),
        s if s.is_server_error() => PromptLoopError::Connection(message),
        _ => PromptLoopError::Internal(message),
    })
}

/// Body of an error response; a failed read is logged and described inline
pub(crate) fn error_body<E: std::fmt::Display>(
    body: std::result::Result<String, E>,
    what: &str,
) -> String {
    match body {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to read {} error body: {}", what, e);
            format!("<unreadable body: {}>", e)
        }
    }
}

fn transport_error(err: reqwest::Error, what: &str) -> PromptLoopError {
    if err.is_timeout() {
        PromptLoopError::timeout(what.to_string())
    } else {
        PromptLoopError::Http(err)
    }
}

#[async_trait]
impl SchedulerApi for HttpSchedulerClient {
    async fn register(&self, worker_id: &str, capabilities: &WorkerCapabilities) -> Result<()> {
        let request = RegisterWorkerRequest {
            worker_id: worker_id.to_string(),
            capabilities: capabilities.clone(),
        };
        let response = self
            .http
            .post(self.url("/worker/register"))
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(e, "register"))?;
        check(response, "register").await?;
        Ok(())
    }

    async fn poll_task(&self, worker_id: &str) -> Result<Option<Task>> {
        let response = self
            .http
            .get(self.url(&format!("/worker/{}/task", worker_id)))
            .send()
            .await
            .map_err(|e| transport_error(e, "poll"))?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let task: Task = check(response, "poll").await?.json().await?;
        debug!("Received task {}", task.id);
        Ok(Some(task))
    }

    async fn heartbeat(&self, worker_id: &str, request: &HeartbeatRequest) -> Result<()> {
        let response = self
            .http
            .post(self.url(&format!("/worker/{}/heartbeat", worker_id)))
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error(e, "heartbeat"))?;
        check(response, "heartbeat").await?;
        Ok(())
    }

    async fn complete_task(&self, task_id: &TaskId, worker_id: &str, result: String) -> Result<()> {
        let request = CompleteTaskRequest {
            result,
            worker_id: Some(worker_id.to_string()),
        };
        let response = self
            .http
            .post(self.url(&format!("/task/{}/complete", task_id)))
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(e, "complete"))?;
        check(response, "complete").await?;
        Ok(())
    }

    async fn fail_task(&self, task_id: &TaskId, worker_id: &str, error: String) -> Result<()> {
        let request = FailTaskRequest {
            error,
            worker_id: Some(worker_id.to_string()),
        };
        let response = self
            .http
            .post(self.url(&format!("/task/{}/error", task_id)))
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(e, "error report"))?;
        check(response, "error report").await?;
        Ok(())
    }

    async fn deregister(&self, worker_id: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/worker/{}", worker_id)))
            .send()
            .await
            .map_err(|e| transport_error(e, "deregister"))?;
        check(response, "deregister").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_without_double_slash() {
        let client =
            HttpSchedulerClient::new("http://localhost:3000/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.url("/worker/register"),
            "http://localhost:3000/worker/register"
        );
    }

    #[test]
    fn test_error_body_keeps_read_failure() {
        assert_eq!(error_body::<String>(Ok("busy".to_string()), "poll"), "busy");

        let body = error_body(Err("connection reset"), "poll");
        assert_eq!(body, "<unreadable body: connection reset>");
    }

    #[tokio::test]
    async fn test_unreachable_scheduler_is_transient() {
        let client = HttpSchedulerClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = client.poll_task("w1").await.unwrap_err();
        assert!(err.is_transient());
    }
}
