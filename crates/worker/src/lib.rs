//! PromptLoop Worker
//!
//! Polling inference worker: registers with the scheduler, keeps a bounded
//! set of models resident and runs one prompt at a time.

pub mod agent;
pub mod backend;
pub mod client;
pub mod model;

pub use agent::WorkerAgent;
pub use backend::{loader_from_config, EchoLoader, OllamaLoader};
pub use client::{HttpSchedulerClient, SchedulerApi};
pub use model::{ModelCache, ModelHandle, ModelLoader};
