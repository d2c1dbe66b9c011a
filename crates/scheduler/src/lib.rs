//! PromptLoop Scheduler
//!
//! Priority-lane task queue with capability- and affinity-aware dispatch to a
//! pool of polling workers.

pub mod affinity;
pub mod http;
pub mod monitor;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod store;

pub use http::{router, ApiError, AppState};
pub use scheduler::{ReportOutcome, Scheduler};
pub use store::{MemoryStore, Store};
