use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Stable identifier of a submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Unit of work handed to the worker pool.
///
/// Ephemeral: it is consumed by exactly one worker, only its status projection
/// in the registry outlives execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub command: String,
    pub payload: Value,
    pub submitter: String,
}

impl Task {
    /// Build the queued task for a freshly registered request
    pub fn from_request(request: &AsyncTaskRequest) -> Self {
        Self {
            id: request.task_id,
            command: request.request_type.clone(),
            payload: request.data.clone(),
            submitter: request.user_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses accept no further status or progress updates
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (*self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Pending, Timeout)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Timeout)
        )
    }

    pub fn description(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Task is waiting to be processed",
            TaskStatus::Processing => "Task is being processed",
            TaskStatus::Completed => "Task completed successfully",
            TaskStatus::Failed => "Task failed",
            TaskStatus::Timeout => "Task timed out",
            TaskStatus::Cancelled => "Task was cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Timeout => "TIMEOUT",
            TaskStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Status-tracking record owned by the registry; callers only ever see clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncTaskRequest {
    pub task_id: TaskId,
    pub request_type: String,
    pub data: Value,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: u8,
}

impl AsyncTaskRequest {
    pub fn new(request_type: String, data: Value, user_id: String) -> Self {
        Self {
            task_id: TaskId::new(),
            request_type,
            data,
            user_id,
            created_at: Utc::now(),
            status: TaskStatus::Pending,
            result: None,
            completed_at: None,
            progress: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Human-readable line shown to API clients
    pub fn status_message(&self) -> String {
        match (self.status, &self.result) {
            (TaskStatus::Processing, _) => {
                format!("{} ({}%)", self.status.description(), self.progress)
            }
            (status, Some(result)) if status.is_terminal() => {
                format!("{}: {}", status.description(), result)
            }
            (status, _) => status.description().to_string(),
        }
    }

    /// Apply a status change, stamping `completed_at` on terminal statuses
    pub(crate) fn apply_status(&mut self, status: TaskStatus, result: Option<String>) {
        self.status = status;
        if result.is_some() {
            self.result = result;
        }
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        if status == TaskStatus::Completed {
            self.progress = 100;
        }
    }
}

/// Client-facing projection of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub command: String,
    pub submitter: String,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: u8,
    pub message: String,
}

impl From<&AsyncTaskRequest> for TaskSnapshot {
    fn from(request: &AsyncTaskRequest) -> Self {
        Self {
            id: request.task_id,
            command: request.request_type.clone(),
            submitter: request.user_id.clone(),
            created_at: request.created_at,
            status: request.status,
            result: request.result.clone(),
            completed_at: request.completed_at,
            progress: request.progress,
            message: request.status_message(),
        }
    }
}

impl From<AsyncTaskRequest> for TaskSnapshot {
    fn from(request: AsyncTaskRequest) -> Self {
        Self::from(&request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        for status in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Timeout,
            TaskStatus::Cancelled,
        ] {
            assert!(status.is_terminal());
            assert!(!status.can_transition_to(TaskStatus::Processing));
        }
    }

    #[test]
    fn test_transition_table() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Timeout));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Processing.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn test_new_request_is_pending() {
        let request =
            AsyncTaskRequest::new("update_book".into(), json!({"id": "B1"}), "alice".into());
        assert_eq!(request.status, TaskStatus::Pending);
        assert_eq!(request.progress, 0);
        assert!(request.completed_at.is_none());
        assert_eq!(request.status_message(), "Task is waiting to be processed");
    }

    #[test]
    fn test_apply_terminal_status_stamps_completion() {
        let mut request = AsyncTaskRequest::new("add_book".into(), json!({}), "bob".into());
        request.apply_status(TaskStatus::Processing, None);
        assert!(request.completed_at.is_none());

        request.apply_status(TaskStatus::Completed, Some("Book added".into()));
        assert_eq!(request.progress, 100);
        let completed_at = request.completed_at.expect("terminal status stamps completed_at");
        assert!(completed_at >= request.created_at);
        assert_eq!(request.status_message(), "Task completed successfully: Book added");
    }

    #[test]
    fn test_status_serializes_upper_case() {
        assert_eq!(serde_json::to_value(TaskStatus::Cancelled).unwrap(), json!("CANCELLED"));
        assert_eq!(TaskStatus::Timeout.to_string(), "TIMEOUT");
    }

    #[test]
    fn test_snapshot_carries_message() {
        let mut request = AsyncTaskRequest::new("update_book".into(), json!({}), "carol".into());
        request.apply_status(TaskStatus::Processing, None);
        request.progress = 40;
        let snapshot = TaskSnapshot::from(&request);
        assert_eq!(snapshot.id, request.task_id);
        assert_eq!(snapshot.message, "Task is being processed (40%)");
    }

    #[test]
    fn test_task_id_parses_back() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
