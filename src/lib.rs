// Core infrastructure modules
pub mod core;

// Admission, idempotent submission, task registry and the worker pool
pub mod tasks;

// Re-exports for convenience
pub use core::config::TaskCoreConfig;
pub use core::errors::{Result, TaskCoreError};
pub use core::logging::init_logging;
pub use tasks::*;
