//! Priority lanes
//!
//! Three FIFO lanes of pending task ids plus an index of every known task.
//! The queue is not synchronized itself; the scheduler owns it behind its
//! dispatch lock so find-and-remove happens as one step.

use chrono::{DateTime, Utc};
use promptloop_proto::{Priority, Task, TaskId, TaskStatus};
use std::collections::{HashMap, VecDeque};

/// Pending lanes and the task index
#[derive(Debug, Default)]
pub struct TaskQueue {
    /// Lanes indexed by `Priority::lane()`
    lanes: [VecDeque<TaskId>; 3],

    /// Every task still retained, pending or not
    tasks: HashMap<TaskId, Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a new task and append it to the tail of its lane
    pub fn push(&mut self, task: Task) -> TaskId {
        let id = task.id;
        self.lanes[task.priority.lane()].push_back(id);
        self.tasks.insert(id, task);
        id
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Remove a task id from its lane without touching the index
    pub fn remove_from_lane(&mut self, id: &TaskId, priority: Priority) -> bool {
        let lane = &mut self.lanes[priority.lane()];
        match lane.iter().position(|queued| queued == id) {
            Some(idx) => {
                lane.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Find and remove the first pending task accepted by `eligible`
    ///
    /// Lanes are scanned in the order given, each front to back. The
    /// returned id is no longer in any lane; its status is left for the
    /// caller to update.
    pub fn take_first<F>(&mut self, lanes: &[Priority], mut eligible: F) -> Option<TaskId>
    where
        F: FnMut(&Task) -> bool,
    {
        for priority in lanes {
            let lane = &mut self.lanes[priority.lane()];
            let tasks = &self.tasks;

            let position = lane.iter().position(|id| {
                tasks
                    .get(id)
                    .map(|task| task.status == TaskStatus::Pending && eligible(task))
                    .unwrap_or(false)
            });

            if let Some(idx) = position {
                return lane.remove(idx);
            }
        }
        None
    }

    /// Drop a task from the index (and its lane, if still queued)
    pub fn remove(&mut self, id: &TaskId) -> Option<Task> {
        let task = self.tasks.remove(id)?;
        self.remove_from_lane(id, task.priority);
        Some(task)
    }

    /// Ids of terminal tasks that finished before `cutoff`
    pub fn finished_before(&self, cutoff: DateTime<Utc>) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|task| task.status.is_terminal())
            .filter(|task| task.finished_at.map(|at| at < cutoff).unwrap_or(false))
            .map(|task| task.id)
            .collect()
    }

    /// Ids of tasks currently assigned to `worker_id`
    pub fn assigned_to(&self, worker_id: &str) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|task| task.status == TaskStatus::Assigned)
            .filter(|task| task.assigned_worker.as_deref() == Some(worker_id))
            .map(|task| task.id)
            .collect()
    }

    /// Number of tasks waiting in a lane
    pub fn depth(&self, priority: Priority) -> usize {
        self.lanes[priority.lane()].len()
    }

    /// Queued ids of a lane, front first
    pub fn lane(&self, priority: Priority) -> Vec<TaskId> {
        self.lanes[priority.lane()].iter().copied().collect()
    }

    pub fn count_by_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
