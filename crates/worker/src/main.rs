//! PromptLoop Worker - Main Entry Point
//!
//! Registers with the scheduler, then polls for prompts and runs them on the
//! configured model backend until interrupted.

use promptloop_common::config::ObservabilityConfig;
use promptloop_common::{PromptLoopConfig, PromptLoopError, Result};
use promptloop_worker::{loader_from_config, HttpSchedulerClient, WorkerAgent};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_PATH: &str = "configs/worker-config.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    init_logging(&config.observability());

    info!("Starting PromptLoop Worker");

    let worker_config = config
        .worker
        .clone()
        .ok_or_else(|| PromptLoopError::config("Worker config not found"))?;

    info!(
        "Worker configuration loaded: id={}, scheduler={}, models={:?}, backend={:?}",
        worker_config.worker_id,
        worker_config.scheduler_url,
        worker_config.models,
        worker_config.backend.kind
    );

    let api = Arc::new(HttpSchedulerClient::new(
        worker_config.scheduler_url.clone(),
        worker_config.request_timeout(),
    )?);
    let loader = loader_from_config(&worker_config.backend)?;
    let agent = Arc::new(WorkerAgent::new(worker_config, api, loader)?);

    let mut runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.start().await })
    };

    // Wait for shutdown signal; registration failure ends the runner early
    let result = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
            agent.shutdown();
            (&mut runner).await
        }
        result = &mut runner => result,
    };
    result.map_err(|e| PromptLoopError::Internal(format!("Worker task failed: {}", e)))??;

    info!("PromptLoop Worker shutdown complete");
    Ok(())
}

fn load_config() -> Result<PromptLoopConfig> {
    match std::env::var("PROMPTLOOP_CONFIG") {
        Ok(path) => PromptLoopConfig::from_file(path),
        Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            PromptLoopConfig::from_file(DEFAULT_CONFIG_PATH)
        }
        Err(_) => PromptLoopConfig::from_env("worker"),
    }
}

fn init_logging(observability: &ObservabilityConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("promptloop_worker={0},promptloop_common={0}", observability.log_level).into()
    });

    let (json, plain) = if observability.structured_logging {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .init();
}
