//! End-to-end tests for the task processing core
//!
//! Exercises admission, idempotent submission, the worker pool, cancellation,
//! cleanup and shutdown through the public API.

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskline::{
    Admission, AsyncTaskSystem, CommandHandler, CommandRouter, PresenceOnly, ProgressReporter,
    RunOutcome, SubmitOutcome, SubmitRequest, Task, TaskCoreConfig, TaskId, TaskRunner,
    TaskSnapshot, TaskStatus,
};
use tokio::sync::Notify;

/// Records every status it observes for a task while it runs
struct UpdateBook {
    seen: Mutex<Vec<TaskStatus>>,
    system: Mutex<Option<std::sync::Weak<AsyncTaskSystem>>>,
}

#[async_trait]
impl CommandHandler for UpdateBook {
    async fn handle(&self, payload: &Value, progress: &ProgressReporter) -> anyhow::Result<String> {
        let system = self.system.lock().unwrap().as_ref().and_then(|w| w.upgrade());
        if let Some(system) = system {
            if let Some(task) = system.get_task_status(&progress.task_id()) {
                self.seen.lock().unwrap().push(task.status);
            }
        }
        let id = payload["id"].as_str().ok_or_else(|| anyhow!("missing id"))?;
        let price = payload["price"].as_u64().ok_or_else(|| anyhow!("missing price"))?;
        progress.report(50);
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(format!("Book {} updated to price {}", id, price))
    }
}

struct Explode;

#[async_trait]
impl CommandHandler for Explode {
    async fn handle(
        &self,
        _payload: &Value,
        _progress: &ProgressReporter,
    ) -> anyhow::Result<String> {
        bail!("database unavailable")
    }
}

struct Panics;

#[async_trait]
impl CommandHandler for Panics {
    async fn handle(
        &self,
        _payload: &Value,
        _progress: &ProgressReporter,
    ) -> anyhow::Result<String> {
        panic!("handler bug")
    }
}

/// Blocks until released, counting how often it ran
struct Gate {
    release: Arc<Notify>,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl CommandHandler for Gate {
    async fn handle(
        &self,
        _payload: &Value,
        _progress: &ProgressReporter,
    ) -> anyhow::Result<String> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok("released".into())
    }
}

/// Counts invocations per task id
struct Counting {
    runs: Mutex<Vec<TaskId>>,
}

#[async_trait]
impl TaskRunner for Counting {
    async fn run(&self, task: &Task, _progress: ProgressReporter) -> anyhow::Result<RunOutcome> {
        self.runs.lock().unwrap().push(task.id);
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(RunOutcome::Completed("counted".into()))
    }
}

fn book_system(config: TaskCoreConfig) -> (Arc<AsyncTaskSystem>, Arc<UpdateBook>) {
    let update = Arc::new(UpdateBook {
        seen: Mutex::new(Vec::new()),
        system: Mutex::new(None),
    });
    let router = CommandRouter::new()
        .with_handler("update_book", update.clone())
        .unwrap()
        .with_handler("explode", Arc::new(Explode))
        .unwrap()
        .with_handler("panic", Arc::new(Panics))
        .unwrap();
    let system =
        Arc::new(AsyncTaskSystem::new(config, Arc::new(PresenceOnly), Arc::new(router)).unwrap());
    *update.system.lock().unwrap() = Some(Arc::downgrade(&system));
    (system, update)
}

async fn wait_for_terminal(system: &AsyncTaskSystem, id: &TaskId) -> TaskSnapshot {
    for _ in 0..300 {
        if let Some(task) = system.get_task_status(id) {
            if task.status.is_terminal() {
                return task;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never reached a terminal status", id);
}

fn created_id(outcome: &SubmitOutcome) -> TaskId {
    match outcome {
        SubmitOutcome::Created(snapshot) => snapshot.id,
        other => panic!("expected a created task, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_update_book_scenario() {
    let (system, update) = book_system(TaskCoreConfig::for_testing());

    let admission = system.submit_work(Some("alice"), Some("token"));
    assert!(admission.is_admitted());

    let outcome = system.submit_task(SubmitRequest::new(
        "update_book",
        json!({"id": "B1", "price": 100}),
        "alice",
    ));
    let id = created_id(&outcome);
    assert_eq!(outcome.snapshot().unwrap().status, TaskStatus::Pending);
    assert!(outcome.snapshot().unwrap().completed_at.is_none());

    let done = wait_for_terminal(&system, &id).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result.as_deref(), Some("Book B1 updated to price 100"));
    assert_eq!(done.progress, 100);
    assert!(done.completed_at.unwrap() >= done.created_at);
    assert_eq!(*update.seen.lock().unwrap(), vec![TaskStatus::Processing]);

    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bogus_command_is_terminal_not_a_crash() {
    let (system, _) = book_system(TaskCoreConfig::for_testing());

    let id = created_id(&system.submit_task(SubmitRequest::new("bogus", json!({}), "alice")));
    let done = wait_for_terminal(&system, &id).await;
    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.result.as_deref(), Some("Command not recognized: bogus"));
    assert!(done.completed_at.is_some());

    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_isolation() {
    let config = TaskCoreConfig {
        worker_count: 1,
        ..TaskCoreConfig::for_testing()
    };
    let (system, _) = book_system(config);

    let a = created_id(&system.submit_task(SubmitRequest::new("explode", json!({}), "alice")));
    let p = created_id(&system.submit_task(SubmitRequest::new("panic", json!({}), "alice")));
    let b = created_id(&system.submit_task(SubmitRequest::new(
        "update_book",
        json!({"id": "B2", "price": 7}),
        "alice",
    )));

    let failed = wait_for_terminal(&system, &a).await;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.result.as_deref(), Some("database unavailable"));
    assert_eq!(wait_for_terminal(&system, &p).await.status, TaskStatus::Failed);
    assert_eq!(wait_for_terminal(&system, &b).await.status, TaskStatus::Completed);

    let mut results = Vec::new();
    while let Some(entry) = system.drain_result() {
        results.push(entry);
    }
    assert!(results.contains(&format!("ERROR {}: database unavailable", a)));
    assert!(results.contains(&format!("ERROR {}: Task runner panicked", p)));
    assert_eq!(system.worker_stats().completed, 1);
    assert_eq!(system.worker_stats().failed, 2);

    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_task_processed_exactly_once() {
    for workers in [1usize, 3] {
        let runner = Arc::new(Counting {
            runs: Mutex::new(Vec::new()),
        });
        let config = TaskCoreConfig {
            worker_count: workers,
            queue_capacity: 256,
            result_queue_capacity: 256,
            ..TaskCoreConfig::for_testing()
        };
        let system = AsyncTaskSystem::new(config, Arc::new(PresenceOnly), runner.clone()).unwrap();

        let ids: Vec<TaskId> = (0..100)
            .map(|i| SubmitRequest::new("count", json!({ "n": i }), "alice"))
            .map(|request| created_id(&system.submit_task(request)))
            .collect();
        for id in &ids {
            assert_eq!(wait_for_terminal(&system, id).await.status, TaskStatus::Completed);
        }

        let runs = runner.runs.lock().unwrap().clone();
        assert_eq!(runs.len(), ids.len());
        let unique: HashSet<TaskId> = runs.into_iter().collect();
        assert_eq!(unique, ids.iter().copied().collect::<HashSet<_>>());
        system.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancellation_rules() {
    let release = Arc::new(Notify::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let router = CommandRouter::new()
        .with_handler(
            "hold",
            Arc::new(Gate {
                release: release.clone(),
                runs: runs.clone(),
            }),
        )
        .unwrap();
    let config = TaskCoreConfig {
        worker_count: 1,
        ..TaskCoreConfig::for_testing()
    };
    let system = AsyncTaskSystem::new(config, Arc::new(PresenceOnly), Arc::new(router)).unwrap();

    // Occupies the only worker
    let busy = created_id(&system.submit_task(SubmitRequest::new("hold", json!({}), "alice")));
    for _ in 0..100 {
        if runs.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let queued = created_id(&system.submit_task(SubmitRequest::new("hold", json!({}), "alice")));

    // In flight: cannot be cancelled
    assert!(!system.cancel_task(&busy, "alice"));
    assert_eq!(system.get_task_status(&busy).unwrap().status, TaskStatus::Processing);

    // Someone else's task: untouched
    let before = system.get_task_status(&queued).unwrap();
    assert!(!system.cancel_task(&queued, "mallory"));
    assert_eq!(system.get_task_status(&queued).unwrap(), before);

    // Owner cancels while still queued
    assert!(system.cancel_task(&queued, "alice"));
    let cancelled = system.get_task_status(&queued).unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());
    assert!(!system.cancel_task(&queued, "alice"));

    release.notify_one();
    assert_eq!(wait_for_terminal(&system, &busy).await.status, TaskStatus::Completed);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1, "cancelled task must never run");
    assert_eq!(system.get_task_status(&queued).unwrap().status, TaskStatus::Cancelled);

    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_submission_observes_first_task() {
    let (system, _) = book_system(TaskCoreConfig::for_testing());
    let request = SubmitRequest::new("update_book", json!({"id": "B1", "price": 5}), "alice")
        .with_idempotency_key("retry-1");

    let first = created_id(&system.submit_task(request.clone()));
    wait_for_terminal(&system, &first).await;

    match system.submit_task(request) {
        SubmitOutcome::Duplicate(snapshot) => {
            assert_eq!(snapshot.id, first);
            assert_eq!(snapshot.status, TaskStatus::Completed);
        }
        other => panic!("expected duplicate, got {:?}", other),
    }
    assert_eq!(system.get_user_tasks("alice").len(), 1);
    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_collapse() {
    let (system, _) = book_system(TaskCoreConfig::for_testing());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let system = Arc::clone(&system);
            tokio::spawn(async move {
                system
                    .submit_task(
                        SubmitRequest::new("update_book", json!({"id": "B9", "price": 1}), "alice")
                            .with_idempotency_key("burst"),
                    )
                    .task_id()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap().expect("accepted"));
    }
    assert_eq!(ids.len(), 1);
    assert_eq!(system.get_user_tasks("alice").len(), 1);
    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_user_tasks_newest_first() {
    let (system, _) = book_system(TaskCoreConfig::for_testing());
    let mut ids = Vec::new();
    for price in 0..3 {
        ids.push(created_id(&system.submit_task(SubmitRequest::new(
            "update_book",
            json!({"id": "B1", "price": price}),
            "alice",
        ))));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    system.submit_task(SubmitRequest::new("update_book", json!({"id": "B2", "price": 1}), "bob"));

    let listed: Vec<TaskId> = system.get_user_tasks("alice").iter().map(|t| t.id).collect();
    ids.reverse();
    assert_eq!(listed, ids);
    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cleanup_keeps_recent_and_live_tasks() {
    let (system, _) = book_system(TaskCoreConfig::for_testing());
    let id = created_id(&system.submit_task(SubmitRequest::new(
        "update_book",
        json!({"id": "B1", "price": 1}),
        "alice",
    )));
    wait_for_terminal(&system, &id).await;

    assert_eq!(system.cleanup_old_tasks(1), 0);
    assert!(system.get_task_status(&id).is_some());
    assert_eq!(system.cleanup_old_tasks(0), 1);
    assert!(system.get_task_status(&id).is_none());
    system.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_processing_after_shutdown() {
    let runner = Arc::new(Counting {
        runs: Mutex::new(Vec::new()),
    });
    let system =
        AsyncTaskSystem::new(TaskCoreConfig::for_testing(), Arc::new(PresenceOnly), runner.clone())
            .unwrap();
    let id = created_id(&system.submit_task(SubmitRequest::new("count", json!({}), "alice")));
    wait_for_terminal(&system, &id).await;

    let report = system.shutdown().await;
    assert_eq!(report.aborted, 0);
    assert!(system.shutdown().await.already_shut_down);

    let outcome = system.submit_task(SubmitRequest::new("count", json!({}), "alice"));
    assert!(matches!(outcome, SubmitOutcome::Rejected { .. }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runner.runs.lock().unwrap().len(), 1);
}

#[test]
fn test_admission_rejections() {
    let (system, _) = book_system(TaskCoreConfig::for_testing());
    assert_eq!(system.submit_work(None, Some("token")), Admission::Unauthorized);
    assert_eq!(system.submit_work(Some("alice"), None), Admission::BadRequest);
    assert!(system.submit_work(Some("alice"), None).correlation_id().is_none());
}
