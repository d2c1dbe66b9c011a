//! Resident model management
//!
//! Each worker keeps a small, bounded set of models loaded. Loading a model
//! beyond capacity evicts the least recently used one first.

use async_trait::async_trait;
use promptloop_common::{PromptLoopError, Result, METRICS};
use promptloop_proto::TaskOptions;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A loaded model
#[async_trait]
pub trait ModelHandle: Send + Sync {
    /// Run one prompt to completion
    async fn generate(&self, prompt: &str, options: &TaskOptions) -> Result<String>;

    /// Release the model's resources
    async fn unload(&self) -> Result<()>;
}

/// Instantiates models by id
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, model_id: &str) -> Result<Box<dyn ModelHandle>>;
}

struct CacheEntry {
    handle: Box<dyn ModelHandle>,

    /// Use counter value at the last load or inference
    last_used: u64,
}

/// Bounded LRU cache of loaded models
pub struct ModelCache {
    loader: Arc<dyn ModelLoader>,
    entries: HashMap<String, CacheEntry>,
    capacity: usize,
    clock: u64,
}

impl ModelCache {
    /// Create an empty cache; capacity is clamped to at least one
    pub fn new(loader: Arc<dyn ModelLoader>, capacity: usize) -> Self {
        Self {
            loader,
            entries: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Make `model_id` resident
    ///
    /// A resident model only has its recency refreshed. Otherwise, when the
    /// cache is full the least recently used model is unloaded before the
    /// new one is instantiated. A failed instantiation inserts nothing.
    pub async fn load(&mut self, model_id: &str) -> Result<()> {
        let now = self.tick();
        if let Some(entry) = self.entries.get_mut(model_id) {
            entry.last_used = now;
            debug!("Model {} already loaded", model_id);
            return Ok(());
        }

        if self.entries.len() >= self.capacity {
            if let Some(victim) = self.least_recently_used() {
                info!("Evicting model {} to make room for {}", victim, model_id);
                self.unload(&victim).await;
                METRICS.worker.model_evictions.inc();
            }
        }

        info!("Loading model {}", model_id);
        let start = Instant::now();
        let handle = self.loader.load(model_id).await.map_err(|e| {
            warn!("Failed to load model {}: {}", model_id, e);
            e
        })?;
        METRICS
            .worker
            .load_duration
            .observe(start.elapsed().as_secs_f64());
        METRICS.worker.model_loads.inc();

        self.entries.insert(
            model_id.to_string(),
            CacheEntry {
                handle,
                last_used: now,
            },
        );
        METRICS.worker.resident_models.set(self.entries.len() as i64);
        info!("Model {} loaded in {:?}", model_id, start.elapsed());
        Ok(())
    }

    /// Drop a model; returns whether it was resident
    ///
    /// Release failures are logged and the entry is removed anyway.
    pub async fn unload(&mut self, model_id: &str) -> bool {
        let Some(entry) = self.entries.remove(model_id) else {
            return false;
        };
        if let Err(e) = entry.handle.unload().await {
            warn!("Error unloading model {}: {}", model_id, e);
        }
        METRICS.worker.resident_models.set(self.entries.len() as i64);
        true
    }

    /// Run a prompt against the model named in `options.model`
    pub async fn infer(&mut self, prompt: &str, options: &TaskOptions) -> Result<String> {
        let model_id = options
            .model
            .as_deref()
            .ok_or_else(|| PromptLoopError::invalid_input("no model specified"))?;

        let now = self.tick();
        let entry = self
            .entries
            .get_mut(model_id)
            .ok_or_else(|| PromptLoopError::ModelNotLoaded(model_id.to_string()))?;
        entry.last_used = now;

        let start = Instant::now();
        let output = entry.handle.generate(prompt, options).await;
        METRICS
            .worker
            .inference_duration
            .observe(start.elapsed().as_secs_f64());

        output.map_err(|e| {
            warn!("Inference error with model {}: {}", model_id, e);
            e
        })
    }

    pub fn is_loaded(&self, model_id: &str) -> bool {
        self.entries.contains_key(model_id)
    }

    /// Resident model ids, most recently used first
    pub fn resident_models(&self) -> Vec<String> {
        let mut models: Vec<(&String, u64)> = self
            .entries
            .iter()
            .map(|(id, entry)| (id, entry.last_used))
            .collect();
        models.sort_by(|a, b| b.1.cmp(&a.1));
        models.into_iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Unload every resident model
    pub async fn clear(&mut self) {
        let models: Vec<String> = self.entries.keys().cloned().collect();
        for model_id in models {
            self.unload(&model_id).await;
        }
    }

    fn least_recently_used(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(id, _)| id.clone())
    }
}
