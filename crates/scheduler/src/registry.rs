//! Worker registry
//!
//! Tracks registered workers, their declared capabilities and liveness.
//! A worker whose last heartbeat is older than the liveness window is never
//! handed work, regardless of the status it last reported.

use chrono::{DateTime, Utc};
use promptloop_proto::{
    TaskOptions, Worker, WorkerCapabilities, WorkerId, WorkerStats, WorkerStatus,
};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Registered workers keyed by id
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, Worker>,

    /// Maximum gap since the last heartbeat
    liveness_window: Duration,
}

impl WorkerRegistry {
    /// Create a new registry
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            workers: HashMap::new(),
            liveness_window,
        }
    }

    pub fn liveness_window(&self) -> Duration {
        self.liveness_window
    }

    /// Register or re-register a worker
    ///
    /// Re-registration replaces the capabilities, resets the status to
    /// `available` and refreshes the heartbeat.
    pub fn register(
        &mut self,
        worker_id: &str,
        capabilities: WorkerCapabilities,
        now: DateTime<Utc>,
    ) -> Worker {
        let registered_at = self
            .workers
            .get(worker_id)
            .map(|w| w.registered_at)
            .unwrap_or(now);

        let worker = Worker {
            id: worker_id.to_string(),
            capabilities,
            status: WorkerStatus::Available,
            last_heartbeat: now,
            registered_at,
            last_stats: None,
        };

        if self
            .workers
            .insert(worker_id.to_string(), worker.clone())
            .is_some()
        {
            info!("Re-registered worker: {}", worker_id);
        } else {
            info!(
                "Registered worker: {} ({} models)",
                worker_id,
                worker.capabilities.models.len()
            );
        }

        worker
    }

    /// Remove a worker
    pub fn remove(&mut self, worker_id: &str) -> Option<Worker> {
        let removed = self.workers.remove(worker_id);
        if removed.is_some() {
            info!("Unregistered worker: {}", worker_id);
        }
        removed
    }

    pub fn get(&self, worker_id: &str) -> Option<&Worker> {
        self.workers.get(worker_id)
    }

    /// Record a heartbeat
    ///
    /// `in_flight` is whether the scheduler has a task assigned to this
    /// worker; it decides busy or available, whatever the worker last said.
    /// Returns false if the worker is unknown.
    pub fn heartbeat(
        &mut self,
        worker_id: &str,
        in_flight: bool,
        stats: WorkerStats,
        now: DateTime<Utc>,
    ) -> bool {
        match self.workers.get_mut(worker_id) {
            Some(worker) => {
                if worker.status == WorkerStatus::Offline {
                    info!("Worker {} is back online", worker_id);
                }
                worker.last_heartbeat = now;
                worker.status = if in_flight {
                    WorkerStatus::Busy
                } else {
                    WorkerStatus::Available
                };
                worker.last_stats = Some(stats);
                debug!("Heartbeat from worker {}: {}", worker_id, worker.status);
                true
            }
            None => false,
        }
    }

    /// Update a worker's status
    pub fn set_status(&mut self, worker_id: &str, status: WorkerStatus) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.status = status;
        }
    }

    /// Whether the worker's last heartbeat is older than the liveness window
    pub fn is_stale(&self, worker: &Worker, now: DateTime<Utc>) -> bool {
        (now - worker.last_heartbeat)
            .to_std()
            .map(|elapsed| elapsed > self.liveness_window)
            .unwrap_or(false)
    }

    /// Whether a worker is available and within its liveness window
    pub fn is_idle(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.workers
            .get(worker_id)
            .map(|w| w.status == WorkerStatus::Available && !self.is_stale(w, now))
            .unwrap_or(false)
    }

    /// Whether the worker advertises every model `options` requires
    pub fn can_run(&self, worker_id: &str, options: &TaskOptions) -> bool {
        self.workers
            .get(worker_id)
            .map(|w| options.is_satisfied_by(&w.capabilities.models))
            .unwrap_or(false)
    }

    /// Check whether a worker may receive a task right now
    ///
    /// A stale worker is marked offline as a side effect.
    pub fn check_dispatchable(&mut self, worker_id: &str, now: DateTime<Utc>) -> Option<&Worker> {
        let stale = match self.workers.get(worker_id) {
            Some(worker) => self.is_stale(worker, now),
            None => {
                debug!("Assignment requested by unknown worker {}", worker_id);
                return None;
            }
        };

        let worker = self.workers.get_mut(worker_id)?;
        if stale {
            if worker.status != WorkerStatus::Offline {
                warn!(
                    "Worker {} missed its liveness window (last heartbeat {})",
                    worker_id, worker.last_heartbeat
                );
                worker.status = WorkerStatus::Offline;
            }
            return None;
        }

        if worker.status != WorkerStatus::Available {
            debug!("Worker {} is {}, not dispatching", worker_id, worker.status);
            return None;
        }

        Some(worker)
    }

    /// Mark every stale worker offline
    ///
    /// Returns the ids that transitioned on this call.
    pub fn mark_stale_offline(&mut self, now: DateTime<Utc>) -> Vec<WorkerId> {
        let window = self.liveness_window;
        let mut marked = Vec::new();

        for worker in self.workers.values_mut() {
            if worker.status == WorkerStatus::Offline {
                continue;
            }
            let stale = (now - worker.last_heartbeat)
                .to_std()
                .map(|elapsed| elapsed > window)
                .unwrap_or(false);
            if stale {
                warn!(
                    "Worker {} marked offline (last heartbeat {})",
                    worker.id, worker.last_heartbeat
                );
                worker.status = WorkerStatus::Offline;
                marked.push(worker.id.clone());
            }
        }

        marked
    }

    /// Count workers by status
    pub fn count_by_status(&self, status: WorkerStatus) -> usize {
        self.workers.values().filter(|w| w.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Snapshot of all workers
    pub fn workers(&self) -> Vec<Worker> {
        self.workers.values().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn set_last_heartbeat(&mut self, worker_id: &str, at: DateTime<Utc>) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.last_heartbeat = at;
        }
    }
}
