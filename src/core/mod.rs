// Core infrastructure shared by every task component

pub mod config;
pub mod errors;
pub mod logging;

// Re-export commonly used types
pub use config::TaskCoreConfig;
pub use errors::{Result, TaskCoreError};
pub use logging::init_logging;
