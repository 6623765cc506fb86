use thiserror::Error;

use crate::tasks::model::{TaskId, TaskStatus};

/// Unified error type for the task processing core
#[derive(Debug, Error)]
pub enum TaskCoreError {
    /// A task id that the registry does not know about
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// A status change the task state machine does not allow
    #[error("Invalid transition for task {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Command handler registration and lookup errors
    #[error("Runner error: {command} - {message}")]
    Runner { command: String, message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// IO errors (config files)
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TaskCoreError {
    pub fn task_not_found(task_id: &TaskId) -> Self {
        Self::TaskNotFound {
            task_id: task_id.to_string(),
        }
    }

    pub fn invalid_transition(task_id: &TaskId, from: TaskStatus, to: TaskStatus) -> Self {
        Self::InvalidTransition {
            task_id: task_id.to_string(),
            from,
            to,
        }
    }

    pub fn runner<S: Into<String>, M: Into<String>>(command: S, message: M) -> Self {
        Self::Runner {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error naming the offending field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::TaskNotFound { .. } => "not_found",
            Self::InvalidTransition { .. } => "state",
            Self::Runner { .. } => "runner",
            Self::Configuration { .. } => "configuration",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, TaskCoreError>;

impl From<serde_yaml::Error> for TaskCoreError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = TaskCoreError::runner("add_book", "handler already registered");
        assert!(matches!(err, TaskCoreError::Runner { .. }));
        assert_eq!(err.category(), "runner");
        assert_eq!(err.to_string(), "Runner error: add_book - handler already registered");
    }

    #[test]
    fn test_configuration_field() {
        let err = TaskCoreError::configuration_field("must be greater than 0", "worker_count");
        assert_eq!(err.category(), "configuration");
        if let TaskCoreError::Configuration { field, .. } = err {
            assert_eq!(field.as_deref(), Some("worker_count"));
        } else {
            panic!("Expected configuration error");
        }
    }

    #[test]
    fn test_io_error_keeps_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = TaskCoreError::io("read config", source);
        assert_eq!(err.category(), "io");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_invalid_transition_message() {
        let id = TaskId::new();
        let err = TaskCoreError::invalid_transition(&id, TaskStatus::Completed, TaskStatus::Failed);
        assert_eq!(err.category(), "state");
        assert!(err.to_string().contains(&id.to_string()));
        assert!(err.to_string().contains("Completed -> Failed"));
    }

    #[test]
    fn test_from_yaml_error() {
        let yaml_err = serde_yaml::from_str::<u32>("not: [a number").unwrap_err();
        let err: TaskCoreError = yaml_err.into();
        assert_eq!(err.category(), "serialization");
    }
}
