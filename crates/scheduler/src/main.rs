//! PromptLoop Scheduler - Main Entry Point
//!
//! Serves the worker and client HTTP API and runs the liveness/retention
//! sweep in the background.

use promptloop_common::config::ObservabilityConfig;
use promptloop_common::{PromptLoopConfig, PromptLoopError, Result};
use promptloop_scheduler::{monitor, router, MemoryStore, Scheduler};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_PATH: &str = "configs/scheduler-config.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    init_logging(&config.observability());

    info!("Starting PromptLoop Scheduler");
    info!(
        "Scheduler configuration loaded: mode={}, bind={}:{}",
        config.mode, config.bind_address, config.port
    );

    let scheduler_config = config
        .scheduler
        .clone()
        .ok_or_else(|| PromptLoopError::config("Scheduler config not found"))?;

    let scheduler = Arc::new(Scheduler::new(
        &scheduler_config,
        Arc::new(MemoryStore::new()),
    ));

    // Start liveness sweep
    let maintenance =
        monitor::start_maintenance(scheduler.clone(), scheduler_config.sweep_interval());

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("PromptLoop Scheduler listening on {}", addr);

    let server = axum::serve(listener, router(scheduler)).into_future();

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server => {
            result?;
        }
        result = maintenance => {
            result.map_err(|e| PromptLoopError::Internal(format!("Maintenance task failed: {}", e)))?;
        }
    }

    info!("PromptLoop Scheduler shutdown complete");
    Ok(())
}

fn load_config() -> Result<PromptLoopConfig> {
    match std::env::var("PROMPTLOOP_CONFIG") {
        Ok(path) => PromptLoopConfig::from_file(path),
        Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            PromptLoopConfig::from_file(DEFAULT_CONFIG_PATH)
        }
        Err(_) => PromptLoopConfig::from_env("scheduler"),
    }
}

fn init_logging(observability: &ObservabilityConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("promptloop_scheduler={0},promptloop_common={0}", observability.log_level).into()
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
