use crate::core::errors::{Result, TaskCoreError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Longest retention `validate` accepts, in days
pub const MAX_RETENTION_DAYS: u32 = 36_500;
/// Longest pending timeout `validate` accepts
pub const MAX_PENDING_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 3600);

/// Task core configuration with all tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskCoreConfig {
    // Worker pool configuration
    /// Number of long-lived worker loops
    pub worker_count: usize,
    /// Maximum number of tasks waiting in the request queue
    pub queue_capacity: usize,
    /// Maximum number of undrained outcome strings
    pub result_queue_capacity: usize,

    // Shutdown configuration
    /// Time in-flight tasks get to finish after shutdown is requested
    pub shutdown_grace_period: Duration,
    /// Time allowed for aborted workers to unwind
    pub shutdown_hard_timeout: Duration,

    // Task execution configuration
    /// Deadline for a single runner invocation (None = unbounded)
    pub task_execution_timeout: Option<Duration>,
    /// Age after which a task still PENDING is marked TIMEOUT
    pub pending_timeout: Duration,

    // Maintenance configuration
    /// Interval of the background maintenance job
    pub maintenance_interval: Duration,
    /// Terminal tasks older than this many days are removed
    pub retention_days: u32,
    /// Lifetime of idempotency mappings (None = never expire)
    pub idempotency_ttl: Option<Duration>,
}

impl Default for TaskCoreConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            queue_capacity: 1_000,
            result_queue_capacity: 1_000,

            shutdown_grace_period: Duration::from_secs(5),
            shutdown_hard_timeout: Duration::from_secs(1),

            task_execution_timeout: Some(Duration::from_secs(300)), // 5 minutes
            pending_timeout: Duration::from_secs(600),              // 10 minutes

            maintenance_interval: Duration::from_secs(60),
            retention_days: 7,
            idempotency_ttl: Some(Duration::from_secs(24 * 3600)),
        }
    }
}

impl TaskCoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(TaskCoreError::configuration_field(
                "worker_count must be greater than 0",
                "worker_count",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(TaskCoreError::configuration_field(
                "queue_capacity must be greater than 0",
                "queue_capacity",
            ));
        }
        if self.result_queue_capacity == 0 {
            return Err(TaskCoreError::configuration_field(
                "result_queue_capacity must be greater than 0",
                "result_queue_capacity",
            ));
        }
        if self.maintenance_interval.is_zero() {
            return Err(TaskCoreError::configuration_field(
                "maintenance_interval cannot be zero",
                "maintenance_interval",
            ));
        }
        if self.pending_timeout.is_zero() {
            return Err(TaskCoreError::configuration_field(
                "pending_timeout cannot be zero",
                "pending_timeout",
            ));
        }
        if self.pending_timeout > MAX_PENDING_TIMEOUT {
            return Err(TaskCoreError::configuration_field(
                format!("pending_timeout cannot exceed {:?}", MAX_PENDING_TIMEOUT),
                "pending_timeout",
            ));
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            return Err(TaskCoreError::configuration_field(
                format!("retention_days cannot exceed {}", MAX_RETENTION_DAYS),
                "retention_days",
            ));
        }
        if matches!(self.task_execution_timeout, Some(t) if t.is_zero()) {
            return Err(TaskCoreError::configuration_field(
                "task_execution_timeout cannot be zero",
                "task_execution_timeout",
            ));
        }
        if matches!(self.idempotency_ttl, Some(t) if t.is_zero()) {
            return Err(TaskCoreError::configuration_field(
                "idempotency_ttl cannot be zero",
                "idempotency_ttl",
            ));
        }
        Ok(())
    }

    /// Small, fast settings for tests
    pub fn for_testing() -> Self {
        Self {
            worker_count: 2,
            queue_capacity: 64,
            result_queue_capacity: 64,
            shutdown_grace_period: Duration::from_millis(500),
            shutdown_hard_timeout: Duration::from_millis(200),
            task_execution_timeout: Some(Duration::from_secs(5)),
            pending_timeout: Duration::from_secs(60),
            maintenance_interval: Duration::from_millis(50),
            retention_days: 7,
            idempotency_ttl: Some(Duration::from_secs(3600)),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| TaskCoreError::io(format!("read config {}", path.display()), e))?;
        let config = Self::from_yaml_str(&contents)?;
        info!(
            path = %path.display(),
            workers = config.worker_count,
            "Loaded task core configuration"
        );
        Ok(config)
    }
}
