use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::model::{Task, TaskId, TaskStatus};
use super::registry::AsyncTaskService;
use super::runner::{ProgressReporter, RunOutcome, TaskRunner};
use crate::core::config::TaskCoreConfig;
use crate::core::errors::{Result, TaskCoreError};

/// Answer to an enqueue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnqueueOutcome {
    Accepted,
    QueueFull,
    ShuttingDown,
    /// Workers could not be started (no async runtime)
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Set when an earlier call already performed the shutdown
    pub already_shut_down: bool,
    pub workers: usize,
    pub finished_gracefully: usize,
    pub aborted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub active_workers: usize,
    pub queue_depth: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub skipped: u64,
    pub rejected: u64,
    pub results_dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    skipped: AtomicU64,
    rejected: AtomicU64,
    results_dropped: AtomicU64,
}

/// Aborts the wrapped task when dropped, so aborting a worker also stops its runner
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// State shared by every worker loop
struct WorkerContext {
    registry: Arc<AsyncTaskService>,
    runner: Arc<dyn TaskRunner>,
    requests: tokio::sync::Mutex<mpsc::Receiver<Task>>,
    results: mpsc::Sender<String>,
    execution_timeout: Option<Duration>,
    counters: Counters,
}

impl WorkerContext {
    async fn next_task(&self) -> Option<Task> {
        self.requests.lock().await.recv().await
    }

    async fn process(&self, task: Task) {
        let task_id = task.id;
        if !self.registry.mark_processing(&task_id) {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        info!("Processing task");

        let progress = ProgressReporter::new(task_id, Arc::clone(&self.registry));
        let runner = Arc::clone(&self.runner);
        let mut execution = AbortOnDrop(tokio::spawn(
            async move { runner.run(&task, progress).await }.in_current_span(),
        ));

        let joined = match self.execution_timeout {
            Some(limit) => timeout(limit, &mut execution.0).await.ok(),
            None => Some((&mut execution.0).await),
        };
        drop(execution);

        let (status, result, entry) = self.classify(task_id, joined);
        match status {
            TaskStatus::Completed => self.counters.completed.fetch_add(1, Ordering::Relaxed),
            TaskStatus::Timeout => self.counters.timed_out.fetch_add(1, Ordering::Relaxed),
            _ => self.counters.failed.fetch_add(1, Ordering::Relaxed),
        };

        if let Err(e) = self.registry.update_status(&task_id, status, Some(result)) {
            error!(error = %e, category = e.category(), "Failed to record task outcome");
        }
        self.publish(entry);
    }

    fn classify(
        &self,
        task_id: TaskId,
        joined: Option<std::result::Result<anyhow::Result<RunOutcome>, JoinError>>,
    ) -> (TaskStatus, String, String) {
        match joined {
            Some(Ok(Ok(RunOutcome::Completed(message)))) => {
                info!("Task completed");
                let entry = format!("{}: {}", task_id, message);
                (TaskStatus::Completed, message, entry)
            }
            Some(Ok(Ok(RunOutcome::Unrecognized(message)))) => {
                warn!(%message, "Task command not recognized");
                let entry = format!("{}: {}", task_id, message);
                (TaskStatus::Failed, message, entry)
            }
            Some(Ok(Err(e))) => {
                let message = format!("{:#}", e);
                error!(error = %message, "Task runner failed");
                let entry = format!("ERROR {}: {}", task_id, message);
                (TaskStatus::Failed, message, entry)
            }
            Some(Err(join_error)) => {
                let message = if join_error.is_panic() {
                    "Task runner panicked".to_string()
                } else {
                    "Task runner was cancelled".to_string()
                };
                error!(%message, "Task runner aborted");
                let entry = format!("ERROR {}: {}", task_id, message);
                (TaskStatus::Failed, message, entry)
            }
            None => {
                let message = format!(
                    "Task execution exceeded {:?}",
                    self.execution_timeout.unwrap_or_default()
                );
                warn!(%message, "Task timed out while processing");
                let entry = format!("ERROR {}: {}", task_id, message);
                (TaskStatus::Timeout, message, entry)
            }
        }
    }

    fn publish(&self, entry: String) {
        match self.results.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(entry)) => {
                self.counters.results_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(%entry, "Result queue full, dropping outcome");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Result queue closed");
            }
        }
    }
}

/// Fixed-size pool of workers draining the request queue
pub struct BackgroundWorker {
    worker_count: usize,
    queue_capacity: usize,
    grace_period: Duration,
    hard_timeout: Duration,
    context: Arc<WorkerContext>,
    requests: mpsc::Sender<Task>,
    results: Mutex<mpsc::Receiver<String>>,
    shutdown_tx: watch::Sender<bool>,
    /// Read by `enqueue` across its check and send, written by `shutdown`
    admission: RwLock<()>,
    started: AtomicBool,
    shutting_down: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundWorker {
    pub fn new(
        config: &TaskCoreConfig,
        registry: Arc<AsyncTaskService>,
        runner: Arc<dyn TaskRunner>,
    ) -> Result<Self> {
        config.validate()?;
        let (request_tx, request_rx) = mpsc::channel(config.queue_capacity);
        let (result_tx, result_rx) = mpsc::channel(config.result_queue_capacity);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            worker_count: config.worker_count,
            queue_capacity: config.queue_capacity,
            grace_period: config.shutdown_grace_period,
            hard_timeout: config.shutdown_hard_timeout,
            context: Arc::new(WorkerContext {
                registry,
                runner,
                requests: tokio::sync::Mutex::new(request_rx),
                results: result_tx,
                execution_timeout: config.task_execution_timeout,
                counters: Counters::default(),
            }),
            requests: request_tx,
            results: Mutex::new(result_rx),
            shutdown_tx,
            admission: RwLock::new(()),
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Queue a registered task, starting the workers on first use.
    pub fn enqueue(&self, task: Task) -> EnqueueOutcome {
        let _admission = self.admission.read().unwrap_or_else(|p| p.into_inner());
        if self.shutting_down.load(Ordering::Acquire) {
            warn!(task_id = %task.id, "Rejecting task, worker pool is shutting down");
            self.context.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return EnqueueOutcome::ShuttingDown;
        }
        if let Err(e) = self.start_workers() {
            error!(error = %e, category = e.category(), "Unable to start workers");
            self.context.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return EnqueueOutcome::NotRunning;
        }

        let task_id = task.id;
        match self.requests.try_send(task) {
            Ok(()) => {
                debug!(task_id = %task_id, "Task enqueued");
                EnqueueOutcome::Accepted
            }
            Err(TrySendError::Full(_)) => {
                warn!(task_id = %task_id, capacity = self.queue_capacity, "Request queue full");
                self.context.counters.rejected.fetch_add(1, Ordering::Relaxed);
                EnqueueOutcome::QueueFull
            }
            Err(TrySendError::Closed(_)) => {
                self.context.counters.rejected.fetch_add(1, Ordering::Relaxed);
                EnqueueOutcome::ShuttingDown
            }
        }
    }

    /// Pop one outcome line without waiting
    pub fn drain_result(&self) -> Option<String> {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .try_recv()
            .ok()
    }

    /// Spawn the worker loops. Returns how many were started by this call.
    pub fn start_workers(&self) -> Result<usize> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Ok(0);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                self.started.store(false, Ordering::Release);
                return Err(TaskCoreError::internal(format!(
                    "worker pool needs a tokio runtime: {}",
                    e
                )));
            }
        };

        let mut handles = self.handles.lock().unwrap_or_else(|p| p.into_inner());
        for worker in 0..self.worker_count {
            let context = Arc::clone(&self.context);
            let shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(runtime.spawn(worker_loop(worker, context, shutdown_rx)));
        }
        info!(workers = self.worker_count, "Started background workers");
        Ok(self.worker_count)
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.shutting_down.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> WorkerStats {
        let counters = &self.context.counters;
        WorkerStats {
            active_workers: self.handles.lock().unwrap_or_else(|p| p.into_inner()).len(),
            queue_depth: self.requests.max_capacity() - self.requests.capacity(),
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            timed_out: counters.timed_out.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            results_dropped: counters.results_dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work, give in-flight tasks the grace period, then abort.
    ///
    /// Tasks still running when aborted keep their PROCESSING status.
    pub async fn shutdown(&self) -> ShutdownReport {
        let already_requested = {
            let _admission = self.admission.write().unwrap_or_else(|p| p.into_inner());
            self.shutting_down.swap(true, Ordering::AcqRel)
        };
        if already_requested {
            debug!("Worker pool shutdown already requested");
            return ShutdownReport {
                already_shut_down: true,
                workers: 0,
                finished_gracefully: 0,
                aborted: 0,
            };
        }
        info!("Shutting down background workers");
        self.shutdown_tx.send_replace(true);

        let mut handles =
            std::mem::take(&mut *self.handles.lock().unwrap_or_else(|p| p.into_inner()));
        let workers = handles.len();

        if timeout(self.grace_period, join_all(handles.iter_mut()))
            .await
            .is_err()
        {
            warn!(grace_period = ?self.grace_period, "Workers did not stop within grace period");
        }

        let (finished, mut remaining): (Vec<_>, Vec<_>) =
            handles.into_iter().partition(|handle| handle.is_finished());
        let aborted = remaining.len();
        if aborted > 0 {
            for handle in &remaining {
                handle.abort();
            }
            if timeout(self.hard_timeout, join_all(remaining.iter_mut()))
                .await
                .is_err()
            {
                error!(aborted, "Aborted workers did not unwind within hard timeout");
            }
        }

        info!(workers, graceful = finished.len(), aborted, "Background workers stopped");
        ShutdownReport {
            already_shut_down: false,
            workers,
            finished_gracefully: finished.len(),
            aborted,
        }
    }
}

async fn stop_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    // A dropped sender also means stop
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

async fn worker_loop(
    worker: usize,
    context: Arc<WorkerContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(worker, "Worker started");
    loop {
        let next = tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown_rx) => break,
            task = context.next_task() => task,
        };
        let Some(task) = next else {
            debug!(worker, "Request queue closed");
            break;
        };
        let span = info_span!("task", worker, task_id = %task.id, command = %task.command);
        context.process(task).instrument(span).await;
    }
    debug!(worker, "Worker stopped");
}
