//! Worker agent
//!
//! Registers with the scheduler, then runs two activities until shutdown:
//! a heartbeat on a fixed period and a poll loop that executes one task at a
//! time through the model cache.

use crate::client::SchedulerApi;
use crate::model::{ModelCache, ModelLoader};
use promptloop_common::config::WorkerConfig;
use promptloop_common::{PromptLoopError, Result, METRICS};
use promptloop_proto::{
    HeartbeatRequest, Task, TaskOptions, WorkerCapabilities, WorkerStats, WorkerStatus, WorkerType,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Sets the busy flag for its lifetime
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Parse the configured hardware class
fn parse_worker_type(value: &str) -> Result<WorkerType> {
    match value {
        "cpu" => Ok(WorkerType::Cpu),
        "gpu" => Ok(WorkerType::Gpu),
        "browser" => Ok(WorkerType::Browser),
        other => Err(PromptLoopError::config(format!("Invalid worker_type: {}", other))),
    }
}

/// One-minute load average, or 0 where unavailable
fn cpu_load() -> f64 {
    std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse().ok()))
        .unwrap_or(0.0)
}

/// Everything the heartbeat activity needs, cloned out of the agent
struct HeartbeatContext {
    worker_id: String,
    capabilities: WorkerCapabilities,
    api: Arc<dyn SchedulerApi>,
    busy: Arc<AtomicBool>,
    period: Duration,
}

impl HeartbeatContext {
    fn request(&self) -> HeartbeatRequest {
        let busy = self.busy.load(Ordering::SeqCst);
        HeartbeatRequest {
            status: if busy {
                WorkerStatus::Busy
            } else {
                WorkerStatus::Available
            },
            current_stats: WorkerStats {
                free_vram: self.capabilities.free_vram,
                cpu_load: cpu_load(),
                in_flight: busy as u32,
            },
        }
    }

    /// Send one heartbeat, re-registering if the scheduler forgot us
    async fn beat(&self) {
        match self.api.heartbeat(&self.worker_id, &self.request()).await {
            Ok(()) => debug!("Heartbeat sent"),
            Err(PromptLoopError::NotFound(_)) => {
                warn!("Scheduler does not know worker {}, re-registering", self.worker_id);
                if let Err(e) = self.api.register(&self.worker_id, &self.capabilities).await {
                    METRICS.worker.heartbeat_failures.inc();
                    warn!("Re-registration failed: {}", e);
                }
            }
            Err(e) => {
                METRICS.worker.heartbeat_failures.inc();
                warn!("Heartbeat failed: {}", e);
            }
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.beat().await,
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
        }
        debug!("Heartbeat loop stopped");
    }
}

/// Polling inference worker
pub struct WorkerAgent {
    config: WorkerConfig,
    capabilities: WorkerCapabilities,
    api: Arc<dyn SchedulerApi>,
    loader: Arc<dyn ModelLoader>,
    busy: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerAgent {
    /// Create an agent; nothing is contacted until `start`
    pub fn new(
        config: WorkerConfig,
        api: Arc<dyn SchedulerApi>,
        loader: Arc<dyn ModelLoader>,
    ) -> Result<Self> {
        let capabilities = WorkerCapabilities {
            models: config.models.iter().cloned().collect(),
            free_vram: config.free_vram,
            max_concurrent: config.max_concurrent,
            worker_type: parse_worker_type(&config.worker_type)?,
        };
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            capabilities,
            api,
            loader,
            busy: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn capabilities(&self) -> &WorkerCapabilities {
        &self.capabilities
    }

    /// Whether a task is executing right now
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Ask both activities to stop; an executing task runs to completion
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Register, then heartbeat and poll until `shutdown`
    ///
    /// Registration failure is returned immediately and nothing else runs.
    pub async fn start(&self) -> Result<()> {
        self.api
            .register(self.worker_id(), &self.capabilities)
            .await
            .map_err(|e| PromptLoopError::registration(e.to_string()))?;
        info!(
            "Worker {} registered ({} models, capacity {})",
            self.worker_id(),
            self.capabilities.models.len(),
            self.config.cache_capacity
        );

        let heartbeat = HeartbeatContext {
            worker_id: self.config.worker_id.clone(),
            capabilities: self.capabilities.clone(),
            api: self.api.clone(),
            busy: self.busy.clone(),
            period: self.config.heartbeat_interval(),
        };
        let heartbeat_handle = tokio::spawn(heartbeat.run(self.shutdown_tx.subscribe()));

        let mut cache = ModelCache::new(self.loader.clone(), self.config.cache_capacity);
        self.poll_loop(&mut cache, self.shutdown_tx.subscribe()).await;

        if let Err(e) = heartbeat_handle.await {
            warn!("Heartbeat task ended abnormally: {}", e);
        }

        info!("Unloading {} resident models", cache.len());
        cache.clear().await;

        if let Err(e) = self.api.deregister(self.worker_id()).await {
            warn!("Failed to deregister from scheduler: {}", e);
        }
        info!("Worker {} stopped", self.worker_id());
        Ok(())
    }

    async fn poll_loop(&self, cache: &mut ModelCache, mut shutdown: watch::Receiver<bool>) {
        info!("Starting poll loop");
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            match self.api.poll_task(self.worker_id()).await {
                Ok(Some(task)) => {
                    self.execute(cache, task).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!("Poll failed: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("Poll loop stopped");
    }

    /// Execute one task and report the outcome
    pub async fn execute(&self, cache: &mut ModelCache, task: Task) {
        let _busy = BusyGuard::acquire(&self.busy);
        info!("Processing task {} ({})", task.id, task.priority);

        match self.run_task(cache, &task).await {
            Ok(result) => {
                METRICS.worker.tasks_processed.inc();
                if let Err(e) = self
                    .api
                    .complete_task(&task.id, self.worker_id(), result)
                    .await
                {
                    warn!("Failed to report result for task {}: {}", task.id, e);
                }
            }
            Err(e) => {
                METRICS.worker.tasks_failed.inc();
                error!("Task {} failed: {}", task.id, e);
                if let Err(report_err) = self
                    .api
                    .fail_task(&task.id, self.worker_id(), e.to_string())
                    .await
                {
                    warn!("Failed to report error for task {}: {}", task.id, report_err);
                }
            }
        }
    }

    async fn run_task(&self, cache: &mut ModelCache, task: &Task) -> Result<String> {
        let model = self.resolve_model(&task.options)?;
        cache.load(&model).await?;

        let options = TaskOptions {
            model: Some(model),
            ..task.options.clone()
        };
        cache.infer(&task.prompt, &options).await
    }

    /// Pick the model a task runs on
    ///
    /// `options.model` wins, then a single required model, then the
    /// configured default.
    fn resolve_model(&self, options: &TaskOptions) -> Result<String> {
        options
            .model
            .clone()
            .or_else(|| {
                options
                    .required_models
                    .as_ref()
                    .filter(|models| models.len() == 1)
                    .and_then(|models| models.iter().next().cloned())
            })
            .or_else(|| self.config.default_model.clone())
            .ok_or_else(|| {
                PromptLoopError::invalid_input("task names no model and no default_model is set")
            })
    }
}
