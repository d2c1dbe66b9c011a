//! Integration tests for the scheduler HTTP surface.
//!
//! Each test serves the router on a random port and talks to it over real
//! HTTP with reqwest.

use std::sync::Arc;

use promptloop_common::config::SchedulerConfig;
use promptloop_proto::{Ack, EnqueueResponse, QueueStats, Task, TaskStatus, Worker, WorkerStatus};
use promptloop_scheduler::{router, Scheduler};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;

/// Start the scheduler on a random port, return (base url, scheduler).
async fn start_server() -> (String, Arc<Scheduler>) {
    let scheduler = Arc::new(Scheduler::in_memory(&SchedulerConfig::default()));
    let app = router(scheduler.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://127.0.0.1:{}", port), scheduler)
}

async fn register(client: &reqwest::Client, base: &str, worker_id: &str, models: &[&str]) {
    let resp = client
        .post(format!("{}/worker/register", base))
        .json(&json!({
            "worker_id": worker_id,
            "capabilities": { "models": models, "free_vram": 0, "max_concurrent": 1, "type": "cpu" }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let worker: Worker = resp.json().await.unwrap();
    assert_eq!(worker.id, worker_id);
}

async fn enqueue(client: &reqwest::Client, base: &str, body: Value) -> uuid::Uuid {
    let resp = client
        .post(format!("{}/api/enqueue", base))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    resp.json::<EnqueueResponse>().await.unwrap().task_id
}

#[tokio::test]
async fn full_task_lifecycle() {
    let (base, _scheduler) = start_server().await;
    let client = reqwest::Client::new();

    register(&client, &base, "w1", &["llama3"]).await;
    let task_id = enqueue(
        &client,
        &base,
        json!({ "session_id": "s1", "prompt": "hello", "priority": "high_priority",
                "options": { "model": "llama3" } }),
    )
    .await;

    let resp = client
        .get(format!("{}/worker/w1/task", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let task: Task = resp.json().await.unwrap();
    assert_eq!(task.id, task_id);
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(task.options.model.as_deref(), Some("llama3"));

    // Nothing else queued.
    let resp = client
        .get(format!("{}/worker/w1/task", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = client
        .post(format!("{}/task/{}/complete", base, task_id))
        .json(&json!({ "result": "hi there", "worker_id": "w1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let ack: Ack = resp.json().await.unwrap();
    assert!(ack.ok);
    assert_eq!(ack.outcome.as_deref(), Some("recorded"));

    let task: Task = client
        .get(format!("{}/api/status/{}", base, task_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.as_deref(), Some("hi there"));
}

#[tokio::test]
async fn unknown_ids_return_not_found() {
    let (base, _scheduler) = start_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/api/status/{}", base, uuid::Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "not_found");

    let resp = client
        .get(format!("{}/api/status/not-a-uuid", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = client
        .post(format!("{}/worker/ghost/heartbeat", base))
        .json(&json!({ "status": "available", "current_stats": {} }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = client
        .post(format!("{}/task/{}/complete", base, uuid::Uuid::new_v4()))
        .json(&json!({ "result": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("Not found"));

    let resp = client
        .delete(format!("{}/worker/ghost", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn conflicting_reports_return_409() {
    let (base, _scheduler) = start_server().await;
    let client = reqwest::Client::new();

    register(&client, &base, "w1", &[]).await;
    let task_id = enqueue(&client, &base, json!({ "session_id": "s1", "prompt": "p" })).await;

    // Still pending.
    let resp = client
        .post(format!("{}/task/{}/error", base, task_id))
        .json(&json!({ "error": "boom" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    client
        .get(format!("{}/worker/w1/task", base))
        .send()
        .await
        .unwrap();

    let resp = client
        .post(format!("{}/task/{}/complete", base, task_id))
        .json(&json!({ "result": "x", "worker_id": "w2" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let resp = client
        .post(format!("{}/task/{}/error", base, task_id))
        .json(&json!({ "error": "Model m1 is not loaded", "worker_id": "w1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = client
        .post(format!("{}/task/{}/complete", base, task_id))
        .json(&json!({ "result": "late", "worker_id": "w1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn cancel_and_stats() {
    let (base, _scheduler) = start_server().await;
    let client = reqwest::Client::new();

    let economy = enqueue(
        &client,
        &base,
        json!({ "session_id": "s1", "prompt": "p", "priority": "economy" }),
    )
    .await;
    enqueue(
        &client,
        &base,
        json!({ "session_id": "s2", "prompt": "p", "priority": "no_such_tier" }),
    )
    .await;

    let stats: QueueStats = client
        .get(format!("{}/api/stats", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats.economy, 1);
    assert_eq!(stats.normal, 1);

    let body: Value = client
        .post(format!("{}/api/cancel/{}", base, economy))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["cancelled"], true);

    let body: Value = client
        .post(format!("{}/api/cancel/{}", base, economy))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["cancelled"], false);

    let stats: QueueStats = client
        .get(format!("{}/api/stats", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats.economy, 0);
}

#[tokio::test]
async fn heartbeat_and_deregister() {
    let (base, scheduler) = start_server().await;
    let client = reqwest::Client::new();

    register(&client, &base, "w1", &["m1"]).await;

    let resp = client
        .post(format!("{}/worker/w1/heartbeat", base))
        .json(&json!({ "status": "busy", "current_stats": { "free_vram": 512, "cpu_load": 0.5, "in_flight": 1 } }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let worker = scheduler.worker("w1").unwrap();
    assert_eq!(worker.last_stats.unwrap().free_vram, 512);
    // Nothing is assigned to w1, whatever it reports.
    assert_eq!(worker.status, WorkerStatus::Available);

    let resp = client
        .delete(format!("{}/worker/w1", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(scheduler.worker("w1").is_none());

    let resp = client
        .get(format!("{}/worker/w1/task", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn health_and_metrics() {
    let (base, _scheduler) = start_server().await;
    let client = reqwest::Client::new();

    let body: Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");

    enqueue(&client, &base, json!({ "session_id": "s1", "prompt": "p" })).await;

    let text = client
        .get(format!("{}/metrics", base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("scheduler_tasks_enqueued_total"));
}
