//! Metrics collection for PromptLoop
//!
//! This module provides Prometheus metrics for observability.
//! Scheduler metrics are updated outside the dispatch lock.

use crate::error::{PromptLoopError, Result};
use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use std::sync::Arc;

/// Metrics registry for PromptLoop
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub scheduler: SchedulerMetrics,
    pub worker: WorkerMetrics,
}

/// Scheduler-side metrics
#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
    /// Tasks enqueued, by priority
    pub tasks_enqueued: IntCounterVec,

    /// Tasks handed to workers, by priority
    pub tasks_assigned: IntCounterVec,

    /// Assignments made through session affinity
    pub affinity_hits: IntCounter,

    /// Tasks completed
    pub tasks_completed: IntCounter,

    /// Tasks failed
    pub tasks_failed: IntCounter,

    /// Tasks cancelled
    pub tasks_cancelled: IntCounter,

    /// Results reported for cancelled tasks
    pub late_reports: IntCounter,

    /// Pending tasks per lane
    pub lane_depth: IntGaugeVec,

    /// Registered workers
    pub registered_workers: IntGauge,

    /// Workers marked offline by the liveness sweep
    pub workers_marked_offline: IntCounter,

    /// Time between enqueue and assignment
    pub queue_wait: Histogram,
}

/// Worker-side metrics
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Tasks executed successfully
    pub tasks_processed: IntCounter,

    /// Tasks that ended in an error
    pub tasks_failed: IntCounter,

    /// Model instantiations
    pub model_loads: IntCounter,

    /// Models evicted to make room
    pub model_evictions: IntCounter,

    /// Models currently resident
    pub resident_models: IntGauge,

    /// Model load duration
    pub load_duration: Histogram,

    /// Inference duration
    pub inference_duration: Histogram,

    /// Heartbeats that failed to reach the scheduler
    pub heartbeat_failures: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry =
        MetricsRegistry::new().expect("metric definitions are valid");
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        // Scheduler metrics
        let tasks_enqueued = IntCounterVec::new(
            Opts::new("scheduler_tasks_enqueued_total", "Total number of tasks enqueued"),
            &["priority"],
        )
        .map_err(metric_error)?;

        let tasks_assigned = IntCounterVec::new(
            Opts::new("scheduler_tasks_assigned_total", "Total number of tasks assigned to workers"),
            &["priority"],
        )
        .map_err(metric_error)?;

        let affinity_hits = IntCounter::new(
            "scheduler_affinity_hits_total",
            "Assignments made through session affinity",
        )
        .map_err(metric_error)?;

        let tasks_completed = IntCounter::new(
            "scheduler_tasks_completed_total",
            "Total number of completed tasks",
        )
        .map_err(metric_error)?;

        let tasks_failed = IntCounter::new(
            "scheduler_tasks_failed_total",
            "Total number of failed tasks",
        )
        .map_err(metric_error)?;

        let tasks_cancelled = IntCounter::new(
            "scheduler_tasks_cancelled_total",
            "Total number of cancelled tasks",
        )
        .map_err(metric_error)?;

        let late_reports = IntCounter::new(
            "scheduler_late_reports_total",
            "Results reported for tasks that were already cancelled",
        )
        .map_err(metric_error)?;

        let lane_depth = IntGaugeVec::new(
            Opts::new("scheduler_lane_depth", "Pending tasks per priority lane"),
            &["priority"],
        )
        .map_err(metric_error)?;

        let registered_workers = IntGauge::new(
            "scheduler_registered_workers",
            "Current number of registered workers",
        )
        .map_err(metric_error)?;

        let workers_marked_offline = IntCounter::new(
            "scheduler_workers_marked_offline_total",
            "Workers marked offline after missing heartbeats",
        )
        .map_err(metric_error)?;

        let queue_wait = Histogram::with_opts(
            HistogramOpts::new(
                "scheduler_queue_wait_seconds",
                "Time tasks spend pending before assignment",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
        )
        .map_err(metric_error)?;

        // Worker metrics
        let tasks_processed = IntCounter::new(
            "worker_tasks_processed_total",
            "Tasks executed successfully",
        )
        .map_err(metric_error)?;

        let worker_tasks_failed = IntCounter::new(
            "worker_tasks_failed_total",
            "Tasks that ended in an error",
        )
        .map_err(metric_error)?;

        let model_loads = IntCounter::new("worker_model_loads_total", "Model instantiations")
            .map_err(metric_error)?;

        let model_evictions = IntCounter::new(
            "worker_model_evictions_total",
            "Models evicted to make room for another",
        )
        .map_err(metric_error)?;

        let resident_models = IntGauge::new("worker_resident_models", "Models currently resident")
            .map_err(metric_error)?;

        let load_duration = Histogram::with_opts(
            HistogramOpts::new("worker_model_load_duration_seconds", "Model load duration")
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )
        .map_err(metric_error)?;

        let inference_duration = Histogram::with_opts(
            HistogramOpts::new("worker_inference_duration_seconds", "Inference duration")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )
        .map_err(metric_error)?;

        let heartbeat_failures = IntCounter::new(
            "worker_heartbeat_failures_total",
            "Heartbeats that failed to reach the scheduler",
        )
        .map_err(metric_error)?;

        // Register all metrics
        registry.register(Box::new(tasks_enqueued.clone())).map_err(metric_error)?;
        registry.register(Box::new(tasks_assigned.clone())).map_err(metric_error)?;
        registry.register(Box::new(affinity_hits.clone())).map_err(metric_error)?;
        registry.register(Box::new(tasks_completed.clone())).map_err(metric_error)?;
        registry.register(Box::new(tasks_failed.clone())).map_err(metric_error)?;
        registry.register(Box::new(tasks_cancelled.clone())).map_err(metric_error)?;
        registry.register(Box::new(late_reports.clone())).map_err(metric_error)?;
        registry.register(Box::new(lane_depth.clone())).map_err(metric_error)?;
        registry.register(Box::new(registered_workers.clone())).map_err(metric_error)?;
        registry.register(Box::new(workers_marked_offline.clone())).map_err(metric_error)?;
        registry.register(Box::new(queue_wait.clone())).map_err(metric_error)?;

        registry.register(Box::new(tasks_processed.clone())).map_err(metric_error)?;
        registry.register(Box::new(worker_tasks_failed.clone())).map_err(metric_error)?;
        registry.register(Box::new(model_loads.clone())).map_err(metric_error)?;
        registry.register(Box::new(model_evictions.clone())).map_err(metric_error)?;
        registry.register(Box::new(resident_models.clone())).map_err(metric_error)?;
        registry.register(Box::new(load_duration.clone())).map_err(metric_error)?;
        registry.register(Box::new(inference_duration.clone())).map_err(metric_error)?;
        registry.register(Box::new(heartbeat_failures.clone())).map_err(metric_error)?;

        let scheduler = SchedulerMetrics {
            tasks_enqueued,
            tasks_assigned,
            affinity_hits,
            tasks_completed,
            tasks_failed,
            tasks_cancelled,
            late_reports,
            lane_depth,
            registered_workers,
            workers_marked_offline,
            queue_wait,
        };

        let worker = WorkerMetrics {
            tasks_processed,
            tasks_failed: worker_tasks_failed,
            model_loads,
            model_evictions,
            resident_models,
            load_duration,
            inference_duration,
            heartbeat_failures,
        };

        Ok(MetricsRegistry {
            registry,
            scheduler,
            worker,
        })
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).map_err(metric_error)?;
        String::from_utf8(buffer).map_err(|e| PromptLoopError::Internal(e.to_string()))
    }
}

fn metric_error(err: prometheus::Error) -> PromptLoopError {
    PromptLoopError::Internal(format!("metrics: {}", err))
}
