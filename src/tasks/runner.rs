use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use super::model::{Task, TaskId};
use super::registry::AsyncTaskService;
use crate::core::errors::{Result, TaskCoreError};

/// What a runner reports back for a task it did not fail on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Completed(String),
    Unrecognized(String),
}

impl RunOutcome {
    pub fn unrecognized(command: &str) -> Self {
        RunOutcome::Unrecognized(format!("Command not recognized: {}", command))
    }

    pub fn message(&self) -> &str {
        match self {
            RunOutcome::Completed(message) | RunOutcome::Unrecognized(message) => message,
        }
    }
}

/// Handle through which a running task publishes its progress
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    registry: Arc<AsyncTaskService>,
}

impl ProgressReporter {
    pub fn new(task_id: TaskId, registry: Arc<AsyncTaskService>) -> Self {
        Self { task_id, registry }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Percentage 0-100; lower values than already reported are ignored
    pub fn report(&self, progress: u8) -> bool {
        self.registry.update_progress(&self.task_id, progress)
    }
}

/// The business callback executed by the worker pool.
///
/// Errors are contained by the worker and turned into a FAILED status.
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    async fn run(&self, task: &Task, progress: ProgressReporter) -> anyhow::Result<RunOutcome>;
}

/// Executes one command's domain operation
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, payload: &Value, progress: &ProgressReporter) -> anyhow::Result<String>;
}

/// Routes a task's command string to the handler registered for it
#[derive(Default)]
pub struct CommandRouter {
    handlers: DashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    pub fn register(&self, command: &str, handler: Arc<dyn CommandHandler>) -> Result<()> {
        match self.handlers.entry(command.to_string()) {
            Entry::Occupied(_) => Err(TaskCoreError::runner(command, "handler already registered")),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                info!(command, "Registered command handler");
                Ok(())
            }
        }
    }

    pub fn with_handler(self, command: &str, handler: Arc<dyn CommandHandler>) -> Result<Self> {
        self.register(command, handler)?;
        Ok(self)
    }

    pub fn commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        commands.sort();
        commands
    }

    fn get(&self, command: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(command).map(|h| Arc::clone(h.value()))
    }
}

#[async_trait]
impl TaskRunner for CommandRouter {
    async fn run(&self, task: &Task, progress: ProgressReporter) -> anyhow::Result<RunOutcome> {
        let Some(handler) = self.get(&task.command) else {
            debug!(task_id = %task.id, command = %task.command, "No handler for command");
            return Ok(RunOutcome::unrecognized(&task.command));
        };
        let message = handler.handle(&task.payload, &progress).await?;
        Ok(RunOutcome::Completed(message))
    }
}
