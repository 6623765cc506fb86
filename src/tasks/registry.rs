use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::model::{AsyncTaskRequest, TaskId, TaskStatus};
use crate::core::errors::{Result, TaskCoreError};

pub const CANCELLED_RESULT: &str = "Task cancelled by user";
pub const PENDING_TIMEOUT_RESULT: &str = "Task was not picked up before the pending timeout";

/// Single source of truth for task existence and status.
///
/// Only this type mutates an [`AsyncTaskRequest`] after creation; every read
/// hands out a clone.
#[derive(Debug, Default)]
pub struct AsyncTaskService {
    tasks: DashMap<TaskId, AsyncTaskRequest>,
}

impl AsyncTaskService {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    pub fn submit(&self, command: &str, payload: Value, submitter: &str) -> AsyncTaskRequest {
        let request = AsyncTaskRequest::new(command.to_string(), payload, submitter.to_string());
        self.tasks.insert(request.task_id, request.clone());
        info!(task_id = %request.task_id, command, submitter, "Task submitted");
        request
    }

    pub fn get_status(&self, task_id: &TaskId) -> Option<AsyncTaskRequest> {
        self.tasks.get(task_id).map(|entry| entry.value().clone())
    }

    /// Newest first
    pub fn get_tasks_for_user(&self, submitter: &str) -> Vec<AsyncTaskRequest> {
        let mut tasks: Vec<AsyncTaskRequest> = self
            .tasks
            .iter()
            .filter(|entry| entry.user_id == submitter)
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// Cancel a task that no worker has picked up yet.
    ///
    /// Returns false, leaving the task untouched, when it is unknown, owned by
    /// someone else or no longer PENDING.
    pub fn cancel(&self, task_id: &TaskId, submitter: &str) -> bool {
        let Some(mut entry) = self.tasks.get_mut(task_id) else {
            debug!(task_id = %task_id, "Cancel requested for unknown task");
            return false;
        };
        if entry.user_id != submitter {
            warn!(task_id = %task_id, submitter, "Cancel requested by non-owner");
            return false;
        }
        if entry.status != TaskStatus::Pending {
            debug!(task_id = %task_id, status = %entry.status, "Task can no longer be cancelled");
            return false;
        }
        entry.apply_status(TaskStatus::Cancelled, Some(CANCELLED_RESULT.to_string()));
        info!(task_id = %task_id, "Task cancelled");
        true
    }

    /// Worker pickup: PENDING -> PROCESSING.
    ///
    /// False means the task was cancelled, timed out or discarded before a
    /// worker reached it and must not run.
    pub fn mark_processing(&self, task_id: &TaskId) -> bool {
        match self.tasks.get_mut(task_id) {
            Some(mut entry) if entry.status == TaskStatus::Pending => {
                entry.apply_status(TaskStatus::Processing, None);
                true
            }
            Some(entry) => {
                debug!(
                    task_id = %task_id,
                    status = %entry.status,
                    "Skipping task that left PENDING before pickup"
                );
                false
            }
            None => {
                debug!(task_id = %task_id, "Skipping task missing from registry");
                false
            }
        }
    }

    pub fn update_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        result: Option<String>,
    ) -> Result<AsyncTaskRequest> {
        let mut entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| TaskCoreError::task_not_found(task_id))?;
        if !entry.status.can_transition_to(status) {
            warn!(task_id = %task_id, from = %entry.status, to = %status, "Rejected status update");
            return Err(TaskCoreError::invalid_transition(task_id, entry.status, status));
        }
        entry.apply_status(status, result);
        debug!(task_id = %task_id, status = %status, "Task status updated");
        Ok(entry.value().clone())
    }

    /// Record progress for a live task. Values only move forward and cap at 100.
    pub fn update_progress(&self, task_id: &TaskId, progress: u8) -> bool {
        let Some(mut entry) = self.tasks.get_mut(task_id) else {
            warn!(task_id = %task_id, "Progress update for unknown task");
            return false;
        };
        if entry.status.is_terminal() {
            warn!(
                task_id = %task_id,
                status = %entry.status,
                "Progress update for finished task ignored"
            );
            return false;
        }
        let progress = progress.min(100);
        if progress > entry.progress {
            entry.progress = progress;
        }
        true
    }

    /// Remove terminal tasks completed more than `days_to_keep` days ago.
    pub fn cleanup(&self, days_to_keep: u32) -> usize {
        let Some(cutoff) =
            Utc::now().checked_sub_signed(chrono::Duration::days(i64::from(days_to_keep)))
        else {
            debug!(days_to_keep, "Retention reaches past the earliest date, nothing to clean up");
            return 0;
        };
        let before = self.tasks.len();
        self.tasks.retain(|_, task| {
            !(task.status.is_terminal() && task.completed_at.map_or(false, |at| at < cutoff))
        });
        let removed = before.saturating_sub(self.tasks.len());
        info!(removed, days_to_keep, "Cleaned up old tasks");
        removed
    }

    /// Mark tasks that have waited in PENDING longer than `max_age` as TIMEOUT.
    pub fn sweep_timeouts(&self, max_age: Duration) -> Vec<TaskId> {
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            debug!(?max_age, "Pending timeout reaches past the earliest date, nothing to sweep");
            return Vec::new();
        };
        let mut timed_out = Vec::new();
        for mut entry in self.tasks.iter_mut() {
            if entry.status == TaskStatus::Pending && entry.created_at < cutoff {
                entry.apply_status(TaskStatus::Timeout, Some(PENDING_TIMEOUT_RESULT.to_string()));
                timed_out.push(entry.task_id);
            }
        }
        if !timed_out.is_empty() {
            warn!(count = timed_out.len(), "Pending tasks timed out");
        }
        timed_out
    }

    /// Drop a task that was registered but never reached the worker pool
    pub(crate) fn discard(&self, task_id: &TaskId) -> Option<AsyncTaskRequest> {
        self.tasks
            .remove_if(task_id, |_, task| task.status == TaskStatus::Pending)
            .map(|(_, task)| task)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn backdate(
        &self,
        task_id: &TaskId,
        created: chrono::Duration,
        completed: Option<chrono::Duration>,
    ) {
        if let Some(mut entry) = self.tasks.get_mut(task_id) {
            entry.created_at = entry.created_at - created;
            if let (Some(at), Some(age)) = (entry.completed_at, completed) {
                entry.completed_at = Some(at - age);
            }
        }
    }
}
