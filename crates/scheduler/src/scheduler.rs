//! Task dispatch
//!
//! The scheduler owns every lane, task record, worker record and affinity
//! binding behind a single lock. Each mutating operation holds the write lock
//! for its whole critical section, which is what guarantees that a task is
//! handed to at most one worker. Store mirroring and metrics happen after the
//! lock is released; every snapshot carries a revision taken under the lock so
//! the mirror can drop writes that arrive out of order.

use crate::affinity::AffinityTracker;
use crate::queue::TaskQueue;
use crate::registry::WorkerRegistry;
use crate::store::{queue_key, MemoryStore, Store, TaskMirror};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use promptloop_common::config::SchedulerConfig;
use promptloop_common::{PromptLoopError, Result, METRICS};
use promptloop_proto::{
    EnqueueRequest, LateReport, Priority, QueueStats, Task, TaskId, TaskStatus, Worker,
    WorkerCapabilities, WorkerId, WorkerStats, WorkerStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lanes consulted for session affinity; economy is never sticky
const AFFINITY_LANES: [Priority; 2] = [Priority::HighPriority, Priority::Normal];

/// Outcome of a completion or failure report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Task was assigned and is now terminal
    Recorded,

    /// Task had been cancelled; the payload was kept as a late result
    Discarded,

    /// Task already completed or failed
    AlreadyTerminal,

    /// Task was never handed to a worker
    NotAssigned,

    /// Reporter is not the worker the task was assigned to
    WrongWorker,

    /// Unknown task id
    NotFound,
}

impl ReportOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportOutcome::Recorded => "recorded",
            ReportOutcome::Discarded => "discarded",
            ReportOutcome::AlreadyTerminal => "already_terminal",
            ReportOutcome::NotAssigned => "not_assigned",
            ReportOutcome::WrongWorker => "wrong_worker",
            ReportOutcome::NotFound => "not_found",
        }
    }

    /// Whether the report was accepted
    pub fn is_accepted(&self) -> bool {
        matches!(self, ReportOutcome::Recorded | ReportOutcome::Discarded)
    }

    /// Convert a rejected outcome into an error
    pub fn into_result(self, task_id: &TaskId) -> Result<Self> {
        match self {
            ReportOutcome::Recorded | ReportOutcome::Discarded => Ok(self),
            ReportOutcome::NotFound => {
                Err(PromptLoopError::not_found(format!("task {}", task_id)))
            }
            other => Err(PromptLoopError::conflict(format!(
                "task {}: {}",
                task_id,
                other.as_str()
            ))),
        }
    }
}

enum Report {
    Result(String),
    Error(String),
}

/// Everything the dispatch lock protects
#[derive(Debug)]
struct DispatchState {
    queue: TaskQueue,
    workers: WorkerRegistry,
    affinity: AffinityTracker,

    /// Bumped on every task mutation
    revision: u64,
}

impl DispatchState {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}

/// Central scheduler
pub struct Scheduler {
    state: RwLock<DispatchState>,
    mirror: TaskMirror,
    task_retention: Duration,
}

impl Scheduler {
    /// Create a scheduler mirroring into `store`
    pub fn new(config: &SchedulerConfig, store: Arc<dyn Store>) -> Self {
        Self {
            state: RwLock::new(DispatchState {
                queue: TaskQueue::new(),
                workers: WorkerRegistry::new(config.liveness_window()),
                affinity: AffinityTracker::new(),
                revision: 0,
            }),
            mirror: TaskMirror::new(store),
            task_retention: config.task_retention(),
        }
    }

    /// Create a scheduler backed by an in-memory store
    pub fn in_memory(config: &SchedulerConfig) -> Self {
        Self::new(config, Arc::new(MemoryStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        self.mirror.store()
    }

    /// Submit a prompt; returns the new task id
    ///
    /// Absent or unknown priorities fall back to `normal`.
    pub async fn enqueue(&self, request: EnqueueRequest) -> TaskId {
        let priority = Priority::parse_or_default(request.priority.as_deref());
        let task = Task::new(priority, request.session_id, request.prompt, request.options);
        let snapshot = task.clone();

        let revision = {
            let mut state = self.state.write();
            state.queue.push(task);
            publish_depths(&state.queue);
            state.next_revision()
        };

        debug!(
            "Enqueued task {} (priority={}, session={})",
            snapshot.id, priority, snapshot.session_id
        );
        METRICS
            .scheduler
            .tasks_enqueued
            .with_label_values(&[priority.as_str()])
            .inc();

        self.mirror(&snapshot, revision).await;
        if let Err(e) = self
            .store()
            .list_push(&queue_key(priority), snapshot.id.to_string())
            .await
        {
            warn!("Failed to record task {} in {}: {}", snapshot.id, queue_key(priority), e);
        }

        snapshot.id
    }

    /// Snapshot of a task, or `None` if unknown
    pub fn get_status(&self, task_id: &TaskId) -> Option<Task> {
        self.state.read().queue.get(task_id).cloned()
    }

    /// Cancel a pending or assigned task
    ///
    /// A pending task leaves its lane immediately. An assigned task keeps
    /// running on its worker; whatever it reports later is kept aside.
    pub async fn cancel(&self, task_id: &TaskId) -> bool {
        let (snapshot, revision) = {
            let mut guard = self.state.write();
            let state = &mut *guard;

            let (status, priority) = match state.queue.get(task_id) {
                Some(task) => (task.status, task.priority),
                None => return false,
            };

            match status {
                TaskStatus::Pending => {
                    state.queue.remove_from_lane(task_id, priority);
                    publish_depths(&state.queue);
                }
                TaskStatus::Assigned => {}
                _ => return false,
            }

            let Some(task) = state.queue.get_mut(task_id) else {
                return false;
            };
            task.status = TaskStatus::Cancelled;
            task.finished_at = Some(Utc::now());
            let snapshot = task.clone();
            (snapshot, state.next_revision())
        };

        match snapshot.assigned_worker.as_deref() {
            Some(worker_id) => info!("Cancelled task {} (running on {})", task_id, worker_id),
            None => info!("Cancelled task {} before assignment", task_id),
        }
        METRICS.scheduler.tasks_cancelled.inc();
        self.mirror(&snapshot, revision).await;
        true
    }

    /// Register or re-register a worker
    pub fn register_worker(
        &self,
        worker_id: &str,
        capabilities: WorkerCapabilities,
    ) -> Result<Worker> {
        if worker_id.trim().is_empty() {
            return Err(PromptLoopError::invalid_input("worker_id must not be empty"));
        }
        if capabilities.max_concurrent > 1 {
            debug!(
                "Worker {} declares max_concurrent={}; dispatching one task at a time",
                worker_id, capabilities.max_concurrent
            );
        }

        let mut state = self.state.write();
        let worker = state.workers.register(worker_id, capabilities, Utc::now());
        METRICS
            .scheduler
            .registered_workers
            .set(state.workers.len() as i64);
        Ok(worker)
    }

    /// Record a heartbeat; false if the worker is unknown
    ///
    /// The reported status is advisory. Busy or available follows from
    /// whether a task is assigned to the worker, so a heartbeat that crossed
    /// a report on the wire cannot undo it.
    pub fn heartbeat(&self, worker_id: &str, reported: WorkerStatus, stats: WorkerStats) -> bool {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let in_flight = !state.queue.assigned_to(worker_id).is_empty();
        let known = state.workers.heartbeat(worker_id, in_flight, stats, Utc::now());
        if known && in_flight != (reported == WorkerStatus::Busy) {
            debug!(
                "Worker {} reported {} with {} task in flight",
                worker_id,
                reported,
                if in_flight { "a" } else { "no" }
            );
        }
        known
    }

    /// Snapshot of a worker
    pub fn worker(&self, worker_id: &str) -> Option<Worker> {
        self.state.read().workers.get(worker_id).cloned()
    }

    /// Hand the best pending task to `worker_id`, if any
    ///
    /// Order of preference: a high-priority or normal task from a session
    /// bound to this worker, then the first eligible task scanning
    /// high-priority, normal and economy lanes front to back. A task is
    /// eligible when the worker advertises all of its `required_models`.
    /// `None` is the normal answer when there is nothing to do.
    pub async fn assign_task(&self, worker_id: &str) -> Option<Task> {
        let now = Utc::now();
        let (task, via_affinity, revision) = self.claim(worker_id, now)?;

        info!(
            "Assigned task {} ({}) to worker {}{}",
            task.id,
            task.priority,
            worker_id,
            if via_affinity { " via session affinity" } else { "" }
        );
        METRICS
            .scheduler
            .tasks_assigned
            .with_label_values(&[task.priority.as_str()])
            .inc();
        if via_affinity {
            METRICS.scheduler.affinity_hits.inc();
        }
        if let Ok(wait) = (now - task.created_at).to_std() {
            METRICS.scheduler.queue_wait.observe(wait.as_secs_f64());
        }

        self.mirror(&task, revision).await;
        Some(task)
    }

    /// The dispatch critical section
    fn claim(&self, worker_id: &str, now: DateTime<Utc>) -> Option<(Task, bool, u64)> {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let models = state
            .workers
            .check_dispatchable(worker_id, now)?
            .capabilities
            .models
            .clone();

        let affinity = &state.affinity;
        let workers = &state.workers;

        let mut via_affinity = true;
        let mut claimed = state.queue.take_first(&AFFINITY_LANES, |task| {
            affinity.is_bound_to(&task.session_id, worker_id)
                && task.options.is_satisfied_by(&models)
        });

        if claimed.is_none() {
            via_affinity = false;
            claimed = state.queue.take_first(&Priority::ALL, |task| {
                if !task.options.is_satisfied_by(&models) {
                    return false;
                }
                // Leave sticky tasks for their own worker while it is idle
                // and able to run them.
                match affinity.get(&task.session_id) {
                    Some(bound) if task.priority.uses_affinity() && bound != worker_id => {
                        !(workers.is_idle(bound, now) && workers.can_run(bound, &task.options))
                    }
                    _ => true,
                }
            });
        }

        let task_id = claimed?;
        publish_depths(&state.queue);

        let task = state.queue.get_mut(&task_id)?;
        if task.status != TaskStatus::Pending {
            warn!(
                "Rejected claim of task {} by worker {}: status is {}",
                task_id, worker_id, task.status
            );
            return None;
        }

        task.status = TaskStatus::Assigned;
        task.assigned_worker = Some(worker_id.to_string());
        task.assigned_at = Some(now);
        let snapshot = task.clone();

        state.affinity.set(&snapshot.session_id, worker_id);
        state.workers.set_status(worker_id, WorkerStatus::Busy);

        Some((snapshot, via_affinity, state.next_revision()))
    }

    /// Report a successful result
    pub async fn complete_task(
        &self,
        task_id: &TaskId,
        worker_id: Option<&str>,
        result: String,
    ) -> ReportOutcome {
        self.report(task_id, worker_id, Report::Result(result)).await
    }

    /// Report a failure
    pub async fn fail_task(
        &self,
        task_id: &TaskId,
        worker_id: Option<&str>,
        error: String,
    ) -> ReportOutcome {
        self.report(task_id, worker_id, Report::Error(error)).await
    }

    async fn report(&self, task_id: &TaskId, worker_id: Option<&str>, report: Report) -> ReportOutcome {
        let (outcome, snapshot, revision) = {
            let mut guard = self.state.write();
            let state = &mut *guard;

            let Some(task) = state.queue.get_mut(task_id) else {
                return ReportOutcome::NotFound;
            };

            if let (Some(reporter), Some(assigned)) = (worker_id, task.assigned_worker.as_deref()) {
                if reporter != assigned {
                    warn!(
                        "Worker {} reported on task {} assigned to {}",
                        reporter, task_id, assigned
                    );
                    return ReportOutcome::WrongWorker;
                }
            }

            let outcome = match task.status {
                TaskStatus::Pending => ReportOutcome::NotAssigned,
                TaskStatus::Completed | TaskStatus::Failed => ReportOutcome::AlreadyTerminal,
                TaskStatus::Cancelled => {
                    task.late_result = Some(match report {
                        Report::Result(result) => LateReport::Result(result),
                        Report::Error(error) => LateReport::Error(error),
                    });
                    ReportOutcome::Discarded
                }
                TaskStatus::Assigned => {
                    match report {
                        Report::Result(result) => {
                            task.status = TaskStatus::Completed;
                            task.result = Some(result);
                        }
                        Report::Error(error) => {
                            task.status = TaskStatus::Failed;
                            task.error = Some(error);
                        }
                    }
                    task.finished_at = Some(Utc::now());
                    ReportOutcome::Recorded
                }
            };

            if !outcome.is_accepted() {
                return outcome;
            }

            let snapshot = task.clone();
            if let Some(assigned) = snapshot.assigned_worker.as_deref() {
                if state.workers.get(assigned).map(|w| w.status) == Some(WorkerStatus::Busy) {
                    state.workers.set_status(assigned, WorkerStatus::Available);
                }
            }
            (outcome, snapshot, state.next_revision())
        };

        match (outcome, snapshot.status) {
            (ReportOutcome::Discarded, _) => {
                debug!("Discarded late report for cancelled task {}", task_id);
                METRICS.scheduler.late_reports.inc();
            }
            (_, TaskStatus::Completed) => {
                info!("Task {} completed", task_id);
                METRICS.scheduler.tasks_completed.inc();
            }
            _ => {
                warn!(
                    "Task {} failed: {}",
                    task_id,
                    snapshot.error.as_deref().unwrap_or("unknown error")
                );
                METRICS.scheduler.tasks_failed.inc();
            }
        }

        self.mirror(&snapshot, revision).await;
        outcome
    }

    /// Remove a worker
    ///
    /// Its affinity bindings are dropped and any task still assigned to it
    /// fails, since nothing will ever report on it.
    pub async fn deregister_worker(&self, worker_id: &str) -> bool {
        let failed = {
            let mut guard = self.state.write();
            let state = &mut *guard;

            if state.workers.remove(worker_id).is_none() {
                return false;
            }
            let unbound = state.affinity.clear_worker(worker_id);
            debug!("Cleared {} affinity bindings for worker {}", unbound, worker_id);
            METRICS
                .scheduler
                .registered_workers
                .set(state.workers.len() as i64);

            let now = Utc::now();
            let mut failed = Vec::new();
            for task_id in state.queue.assigned_to(worker_id) {
                let Some(task) = state.queue.get_mut(&task_id) else {
                    continue;
                };
                task.status = TaskStatus::Failed;
                task.error = Some(format!("worker {} deregistered", worker_id));
                task.finished_at = Some(now);
                let snapshot = task.clone();
                failed.push((snapshot, state.next_revision()));
            }
            failed
        };

        for (task, revision) in &failed {
            warn!("Task {} failed: worker {} deregistered", task.id, worker_id);
            METRICS.scheduler.tasks_failed.inc();
            self.mirror(task, *revision).await;
        }
        true
    }

    /// Mark workers that missed their liveness window offline
    ///
    /// Returns the workers that went offline on this sweep.
    pub fn sweep_liveness(&self, now: DateTime<Utc>) -> Vec<WorkerId> {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let marked = state.workers.mark_stale_offline(now);
        for worker_id in &marked {
            state.affinity.clear_worker(worker_id);
        }
        METRICS
            .scheduler
            .workers_marked_offline
            .inc_by(marked.len() as u64);
        marked
    }

    /// Drop finished tasks older than the retention window
    pub async fn purge_finished(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.task_retention)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = now - retention;

        let purged: Vec<TaskId> = {
            let mut state = self.state.write();
            let expired = state.queue.finished_before(cutoff);
            for task_id in &expired {
                state.queue.remove(task_id);
            }
            expired
        };

        for task_id in &purged {
            if let Err(e) = self.mirror.purge(task_id, now).await {
                warn!("Failed to delete record of task {}: {}", task_id, e);
            }
        }
        self.mirror.forget_purged(cutoff).await;
        if !purged.is_empty() {
            debug!("Purged {} finished tasks", purged.len());
        }
        purged.len()
    }

    /// Lane depths and counts
    pub fn queue_stats(&self) -> QueueStats {
        let state = self.state.read();
        let queue = &state.queue;
        QueueStats {
            high_priority: queue.depth(Priority::HighPriority),
            normal: queue.depth(Priority::Normal),
            economy: queue.depth(Priority::Economy),
            tasks_total: queue.len(),
            tasks_assigned: queue.count_by_status(TaskStatus::Assigned),
            tasks_finished: queue.len()
                - queue.count_by_status(TaskStatus::Pending)
                - queue.count_by_status(TaskStatus::Assigned),
            workers_available: state.workers.count_by_status(WorkerStatus::Available),
            workers_busy: state.workers.count_by_status(WorkerStatus::Busy),
            workers_offline: state.workers.count_by_status(WorkerStatus::Offline),
        }
    }

    /// Write a task record to the backing store
    async fn mirror(&self, task: &Task, revision: u64) {
        match self.mirror.write(task, revision).await {
            Ok(true) => {}
            Ok(false) => debug!(
                "Dropped stale snapshot of task {} (status {})",
                task.id, task.status
            ),
            Err(e) => warn!("Failed to mirror task {}: {}", task.id, e),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_last_heartbeat(&self, worker_id: &str, at: DateTime<Utc>) {
        self.state.write().workers.set_last_heartbeat(worker_id, at);
    }
}

fn publish_depths(queue: &TaskQueue) {
    for priority in Priority::ALL {
        METRICS
            .scheduler
            .lane_depth
            .with_label_values(&[priority.as_str()])
            .set(queue.depth(priority) as i64);
    }
}
