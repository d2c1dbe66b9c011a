//! End-to-end tests: worker agents against a real scheduler served on a
//! random port.

use std::sync::Arc;
use std::time::Duration;

use promptloop_common::config::{SchedulerConfig, WorkerConfig};
use promptloop_common::PromptLoopError;
use promptloop_proto::{
    EnqueueRequest, Priority, TaskId, TaskOptions, TaskStatus, WorkerStatus,
};
use promptloop_scheduler::{router, Scheduler};
use promptloop_worker::{EchoLoader, HttpSchedulerClient, SchedulerApi, WorkerAgent};
use tokio::net::TcpListener;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn start_scheduler() -> (String, Arc<Scheduler>) {
    let scheduler = Arc::new(Scheduler::in_memory(&SchedulerConfig::default()));
    let app = router(scheduler.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://127.0.0.1:{}", port), scheduler)
}

fn worker_config(worker_id: &str, scheduler_url: &str, models: &[&str]) -> WorkerConfig {
    WorkerConfig {
        worker_id: worker_id.to_string(),
        scheduler_url: scheduler_url.to_string(),
        models: models.iter().map(|m| m.to_string()).collect(),
        poll_interval_ms: 10,
        heartbeat_interval_secs: 1,
        request_timeout_secs: 5,
        ..Default::default()
    }
}

fn spawn_agent(config: WorkerConfig) -> (Arc<WorkerAgent>, tokio::task::JoinHandle<()>) {
    let api = Arc::new(
        HttpSchedulerClient::new(config.scheduler_url.clone(), config.request_timeout()).unwrap(),
    );
    let agent = Arc::new(WorkerAgent::new(config, api, Arc::new(EchoLoader::new())).unwrap());
    let handle = {
        let agent = agent.clone();
        tokio::spawn(async move {
            agent.start().await.unwrap();
        })
    };
    (agent, handle)
}

async fn wait_terminal(scheduler: &Scheduler, task_id: &TaskId) -> promptloop_proto::Task {
    timeout(TEST_TIMEOUT, async {
        loop {
            if let Some(task) = scheduler.get_status(task_id) {
                if task.status.is_terminal() {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task did not finish in time")
}

fn request(session: &str, priority: Priority, options: TaskOptions) -> EnqueueRequest {
    EnqueueRequest {
        session_id: session.to_string(),
        prompt: format!("prompt from {}", session),
        priority: Some(priority.as_str().to_string()),
        options,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_completes_enqueued_task() {
    let (base, scheduler) = start_scheduler().await;
    let (agent, handle) = spawn_agent(worker_config("w1", &base, &["m1"]));

    let task_id = scheduler
        .enqueue(request("s1", Priority::Normal, TaskOptions::for_model("m1")))
        .await;

    let task = wait_terminal(&scheduler, &task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.as_deref(), Some("[m1] prompt from s1"));
    assert_eq!(task.assigned_worker.as_deref(), Some("w1"));

    agent.shutdown();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();

    // Deregistered on the way out.
    assert!(scheduler.worker("w1").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unresolvable_model_is_reported_as_failure() {
    let (base, scheduler) = start_scheduler().await;
    let (agent, handle) = spawn_agent(worker_config("w1", &base, &[]));

    let task_id = scheduler
        .enqueue(request("s1", Priority::HighPriority, TaskOptions::default()))
        .await;

    let task = wait_terminal(&scheduler, &task_id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("no model"));

    // The worker goes back to polling after a failure.
    let follow_up = scheduler
        .enqueue(request("s1", Priority::Normal, TaskOptions::for_model("m2")))
        .await;
    assert_eq!(
        wait_terminal(&scheduler, &follow_up).await.status,
        TaskStatus::Completed
    );

    agent.shutdown();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn capability_filtering_routes_to_capable_worker() {
    let (base, scheduler) = start_scheduler().await;
    let (plain, plain_handle) = spawn_agent(worker_config("plain", &base, &["m2"]));
    let (capable, capable_handle) = spawn_agent(worker_config("capable", &base, &["m1"]));

    let options = TaskOptions {
        required_models: Some(["m1".to_string()].into_iter().collect()),
        ..Default::default()
    };
    let task_id = scheduler
        .enqueue(request("s1", Priority::Normal, options))
        .await;

    let task = wait_terminal(&scheduler, &task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.assigned_worker.as_deref(), Some("capable"));
    assert_eq!(task.result.as_deref(), Some("[m1] prompt from s1"));

    plain.shutdown();
    capable.shutdown();
    timeout(TEST_TIMEOUT, plain_handle).await.unwrap().unwrap();
    timeout(TEST_TIMEOUT, capable_handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn registration_failure_is_fatal() {
    // Nothing listens on the discard port.
    let config = worker_config("w1", "http://127.0.0.1:9", &["m1"]);
    let api = Arc::new(HttpSchedulerClient::new(config.scheduler_url.clone(), config.request_timeout()).unwrap());
    let agent = WorkerAgent::new(config, api, Arc::new(EchoLoader::new())).unwrap();

    let err = timeout(TEST_TIMEOUT, agent.start()).await.unwrap().unwrap_err();
    assert!(matches!(err, PromptLoopError::Registration(_)));
}

#[tokio::test]
async fn http_client_round_trip() {
    let (base, scheduler) = start_scheduler().await;
    let client = HttpSchedulerClient::new(base, Duration::from_secs(5)).unwrap();
    let config = worker_config("w1", "unused", &["m1"]);
    let caps = WorkerAgent::new(config, Arc::new(client.clone()), Arc::new(EchoLoader::new()))
        .unwrap()
        .capabilities()
        .clone();

    client.register("w1", &caps).await.unwrap();
    assert!(client.poll_task("w1").await.unwrap().is_none());

    let task_id = scheduler
        .enqueue(request("s1", Priority::Economy, TaskOptions::for_model("m1")))
        .await;
    let task = client.poll_task("w1").await.unwrap().unwrap();
    assert_eq!(task.id, task_id);
    assert_eq!(scheduler.worker("w1").unwrap().status, WorkerStatus::Busy);

    client
        .complete_task(&task_id, "w1", "done".to_string())
        .await
        .unwrap();
    let err = client
        .fail_task(&task_id, "w1", "late".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, PromptLoopError::Conflict(_)));

    let heartbeat = promptloop_proto::HeartbeatRequest {
        status: WorkerStatus::Available,
        current_stats: Default::default(),
    };
    client.heartbeat("w1", &heartbeat).await.unwrap();
    client.deregister("w1").await.unwrap();

    let err = client.heartbeat("w1", &heartbeat).await.unwrap_err();
    assert!(matches!(err, PromptLoopError::NotFound(_)));
}
