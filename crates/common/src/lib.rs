//! PromptLoop common library
//!
//! This crate contains shared code used across PromptLoop components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::PromptLoopConfig;
pub use error::{PromptLoopError, Result};
pub use metrics::{MetricsRegistry, METRICS};
