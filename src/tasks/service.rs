use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::acceptor::{Admission, Authorizer, WorkAcceptor};
use super::idempotency::IdempotencyStore;
use super::model::{Task, TaskId, TaskSnapshot};
use super::registry::AsyncTaskService;
use super::runner::TaskRunner;
use super::worker::{BackgroundWorker, EnqueueOutcome, ShutdownReport, WorkerStats};
use crate::core::config::TaskCoreConfig;
use crate::core::errors::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub command: String,
    pub payload: Value,
    pub submitter: String,
    pub idempotency_key: Option<String>,
}

impl SubmitRequest {
    pub fn new<C: Into<String>, S: Into<String>>(command: C, payload: Value, submitter: S) -> Self {
        Self {
            command: command.into(),
            payload,
            submitter: submitter.into(),
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key<K: Into<String>>(mut self, key: K) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Request queue at capacity; retry later
    QueueFull,
    ShuttingDown,
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubmitOutcome {
    Created(TaskSnapshot),
    /// Same idempotency key seen before; the earlier task's current state
    Duplicate(TaskSnapshot),
    Rejected { reason: RejectReason },
}

impl SubmitOutcome {
    pub fn snapshot(&self) -> Option<&TaskSnapshot> {
        match self {
            SubmitOutcome::Created(snapshot) | SubmitOutcome::Duplicate(snapshot) => Some(snapshot),
            SubmitOutcome::Rejected { .. } => None,
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.snapshot().map(|s| s.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub timed_out: Vec<TaskId>,
    pub removed: usize,
    pub idempotency_purged: usize,
}

/// Entry point used by the HTTP layer: admission, idempotent submission,
/// status queries, cancellation and housekeeping.
pub struct AsyncTaskSystem {
    config: TaskCoreConfig,
    acceptor: WorkAcceptor,
    idempotency: IdempotencyStore,
    registry: Arc<AsyncTaskService>,
    pool: BackgroundWorker,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncTaskSystem {
    pub fn new(
        config: TaskCoreConfig,
        authorizer: Arc<dyn Authorizer>,
        runner: Arc<dyn TaskRunner>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(AsyncTaskService::new());
        let pool = BackgroundWorker::new(&config, Arc::clone(&registry), runner)?;

        Ok(Self {
            acceptor: WorkAcceptor::new(authorizer),
            idempotency: IdempotencyStore::new(config.idempotency_ttl),
            registry,
            pool,
            maintenance: Mutex::new(None),
            config,
        })
    }

    pub fn config(&self) -> &TaskCoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AsyncTaskService> {
        &self.registry
    }

    pub fn submit_work(&self, submitter: Option<&str>, credential: Option<&str>) -> Admission {
        self.acceptor.submit_work(submitter, credential)
    }

    /// Register and enqueue a task, collapsing repeats of an idempotency key.
    ///
    /// Submissions sharing a key are serialized on that key, and the mapping
    /// is written only once the task is accepted by the worker pool. A
    /// `Duplicate` therefore always names a task that was enqueued.
    pub fn submit_task(&self, request: SubmitRequest) -> SubmitOutcome {
        let SubmitRequest {
            command,
            payload,
            submitter,
            idempotency_key,
        } = request;

        let Some(key) = idempotency_key else {
            return self.create_and_enqueue(&command, payload, &submitter);
        };

        if let Some(task) = self
            .idempotency
            .lookup(&submitter, &key)
            .and_then(|existing| self.registry.get_status(&existing))
        {
            debug!(task_id = %task.task_id, key = %key, "Duplicate submission collapsed");
            return SubmitOutcome::Duplicate(task.into());
        }

        self.idempotency
            .resolve_with(
                &submitter,
                &key,
                |existing| {
                    let task = self.registry.get_status(existing)?;
                    debug!(task_id = %existing, key = %key, "Duplicate submission collapsed");
                    Some(SubmitOutcome::Duplicate(task.into()))
                },
                || {
                    let outcome = self.create_and_enqueue(&command, payload, &submitter);
                    let recorded = match &outcome {
                        SubmitOutcome::Created(task) => Some(task.id),
                        _ => None,
                    };
                    (recorded, outcome)
                },
            )
            .into_inner()
    }

    fn create_and_enqueue(&self, command: &str, payload: Value, submitter: &str) -> SubmitOutcome {
        let created = self.registry.submit(command, payload, submitter);
        let task_id = created.task_id;

        match self.pool.enqueue(Task::from_request(&created)) {
            EnqueueOutcome::Accepted => SubmitOutcome::Created(created.into()),
            rejected => {
                self.registry.discard(&task_id);
                let reason = match rejected {
                    EnqueueOutcome::QueueFull => RejectReason::QueueFull,
                    EnqueueOutcome::NotRunning => RejectReason::NotRunning,
                    _ => RejectReason::ShuttingDown,
                };
                warn!(task_id = %task_id, ?reason, "Task submission rejected");
                SubmitOutcome::Rejected { reason }
            }
        }
    }

    pub fn get_task_status(&self, task_id: &TaskId) -> Option<TaskSnapshot> {
        self.registry.get_status(task_id).map(TaskSnapshot::from)
    }

    pub fn get_user_tasks(&self, submitter: &str) -> Vec<TaskSnapshot> {
        self.registry
            .get_tasks_for_user(submitter)
            .into_iter()
            .map(TaskSnapshot::from)
            .collect()
    }

    pub fn cancel_task(&self, task_id: &TaskId, submitter: &str) -> bool {
        self.registry.cancel(task_id, submitter)
    }

    pub fn cleanup_old_tasks(&self, days_to_keep: u32) -> usize {
        self.registry.cleanup(days_to_keep)
    }

    pub fn drain_result(&self) -> Option<String> {
        self.pool.drain_result()
    }

    pub fn worker_stats(&self) -> WorkerStats {
        self.pool.stats()
    }

    /// One pass of housekeeping: pending timeouts, retention, idempotency TTL
    pub fn run_maintenance(&self) -> MaintenanceReport {
        Self::maintain(&self.config, &self.registry, &self.idempotency)
    }

    fn maintain(
        config: &TaskCoreConfig,
        registry: &AsyncTaskService,
        idempotency: &IdempotencyStore,
    ) -> MaintenanceReport {
        MaintenanceReport {
            timed_out: registry.sweep_timeouts(config.pending_timeout),
            removed: registry.cleanup(config.retention_days),
            idempotency_purged: idempotency.purge_expired(),
        }
    }

    /// Run [`Self::run_maintenance`] every `maintenance_interval` until shutdown.
    pub fn start_maintenance(self: &Arc<Self>) -> bool {
        let mut slot = self.maintenance.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return false;
        }
        let system = Arc::downgrade(self);
        let period = self.config.maintenance_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(system) = system.upgrade() else {
                    break;
                };
                match tokio::task::spawn_blocking(move || system.run_maintenance()).await {
                    Ok(report) => debug!(
                        timed_out = report.timed_out.len(),
                        removed = report.removed,
                        purged = report.idempotency_purged,
                        "Maintenance pass finished"
                    ),
                    Err(e) => error!(error = %e, "Maintenance pass failed"),
                }
            }
            info!("Maintenance task terminated");
        }));
        true
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        let maintenance = self.maintenance.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = maintenance {
            handle.abort();
        }
        self.pool.shutdown().await
    }
}

impl Drop for AsyncTaskSystem {
    fn drop(&mut self) {
        let slot = self.maintenance.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}
