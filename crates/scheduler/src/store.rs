//! Backing store for task records
//!
//! A minimal hash/list interface that an external key-value store can satisfy.
//! The scheduler mirrors task records into it; the in-memory dispatch state
//! stays authoritative.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use promptloop_common::{PromptLoopError, Result};
use promptloop_proto::{Priority, Task, TaskId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Field map stored under a hash key
pub type Fields = HashMap<String, String>;

/// Key for a task record
pub fn task_key(id: &TaskId) -> String {
    format!("task:{}", id)
}

/// Key for a lane's enqueue log
pub fn queue_key(priority: Priority) -> String {
    format!("queue:{}", priority.as_str())
}

/// Flatten a task into hash fields
pub fn task_fields(task: &Task) -> Result<Fields> {
    let mut fields = Fields::new();
    fields.insert("id".to_string(), task.id.to_string());
    fields.insert("status".to_string(), task.status.as_str().to_string());
    fields.insert("priority".to_string(), task.priority.as_str().to_string());
    fields.insert("session_id".to_string(), task.session_id.clone());
    fields.insert("prompt".to_string(), task.prompt.clone());
    fields.insert("options".to_string(), serde_json::to_string(&task.options)?);
    fields.insert("created_at".to_string(), task.created_at.to_rfc3339());

    if let Some(worker) = &task.assigned_worker {
        fields.insert("assigned_worker".to_string(), worker.clone());
    }
    if let Some(finished_at) = task.finished_at {
        fields.insert("finished_at".to_string(), finished_at.to_rfc3339());
    }
    if let Some(result) = &task.result {
        fields.insert("result".to_string(), result.clone());
    }
    if let Some(error) = &task.error {
        fields.insert("error".to_string(), error.clone());
    }
    Ok(fields)
}

/// Hash/list storage used to mirror scheduler state
#[async_trait]
pub trait Store: Send + Sync {
    /// Merge `fields` into the hash at `key`
    async fn hash_set(&self, key: &str, fields: Fields) -> Result<()>;

    /// All fields of the hash at `key`, or `None` if absent
    async fn hash_get_all(&self, key: &str) -> Result<Option<Fields>>;

    /// Append `value` to the list at `key`
    async fn list_push(&self, key: &str, value: String) -> Result<()>;

    /// Delete `key`; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
enum Entry {
    Hash(Fields),
    List(Vec<String>),
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents of the list at `key` (empty if absent)
    pub fn list(&self, key: &str) -> Vec<String> {
        match self.entries.lock().get(key) {
            Some(Entry::List(items)) => items.clone(),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn hash_set(&self, key: &str, fields: Fields) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(Fields::new()))
        {
            Entry::Hash(existing) => {
                existing.extend(fields);
                Ok(())
            }
            Entry::List(_) => Err(PromptLoopError::store(format!(
                "{} holds a list, not a hash",
                key
            ))),
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<Option<Fields>> {
        match self.entries.lock().get(key) {
            Some(Entry::Hash(fields)) => Ok(Some(fields.clone())),
            Some(Entry::List(_)) => Err(PromptLoopError::store(format!(
                "{} holds a list, not a hash",
                key
            ))),
            None => Ok(None),
        }
    }

    async fn list_push(&self, key: &str, value: String) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(Vec::new()))
        {
            Entry::List(items) => {
                items.push(value);
                Ok(())
            }
            Entry::Hash(_) => Err(PromptLoopError::store(format!(
                "{} holds a hash, not a list",
                key
            ))),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }
}

#[derive(Debug, Clone, Copy)]
enum Mark {
    /// Revision of the last snapshot written
    Written(u64),

    /// Record deleted at this time; later snapshots are dropped
    Purged(DateTime<Utc>),
}

/// Writes task snapshots to a store in revision order
///
/// Snapshots are taken under the dispatch lock but written after it is
/// released, so they can arrive out of order. A snapshot older than the one
/// already written, or for a purged task, is dropped.
pub struct TaskMirror {
    store: Arc<dyn Store>,
    marks: AsyncMutex<HashMap<TaskId, Mark>>,
}

impl TaskMirror {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            marks: AsyncMutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Write `task` at `revision`; returns false if the snapshot was stale
    pub async fn write(&self, task: &Task, revision: u64) -> Result<bool> {
        let mut marks = self.marks.lock().await;
        match marks.get(&task.id) {
            Some(Mark::Written(seen)) if *seen >= revision => return Ok(false),
            Some(Mark::Purged(_)) => return Ok(false),
            _ => {}
        }

        self.store
            .hash_set(&task_key(&task.id), task_fields(task)?)
            .await?;
        marks.insert(task.id, Mark::Written(revision));
        Ok(true)
    }

    /// Delete a task record and refuse any snapshot still in flight
    pub async fn purge(&self, task_id: &TaskId, now: DateTime<Utc>) -> Result<bool> {
        let mut marks = self.marks.lock().await;
        marks.insert(*task_id, Mark::Purged(now));
        self.store.delete(&task_key(task_id)).await
    }

    /// Drop purge marks older than `before`
    pub async fn forget_purged(&self, before: DateTime<Utc>) -> usize {
        let mut marks = self.marks.lock().await;
        let len = marks.len();
        marks.retain(|_, mark| !matches!(mark, Mark::Purged(at) if *at < before));
        len - marks.len()
    }
}
