use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use taskline::{
    init_logging, Admission, AsyncTaskSystem, CommandHandler, CommandRouter, ProgressReporter,
    SubmitOutcome, SubmitRequest, TaskCoreConfig, TaskId, TaskSnapshot,
};
use tracing::{info, Level};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Book {
    id: String,
    title: String,
    price: u64,
}

/// Stand-in for the persistence layer
#[derive(Default)]
struct BookStore {
    books: DashMap<String, Book>,
}

struct AddBook(Arc<BookStore>);

#[async_trait]
impl CommandHandler for AddBook {
    async fn handle(&self, payload: &Value, progress: &ProgressReporter) -> Result<String> {
        let book: Book = serde_json::from_value(payload.clone()).context("invalid book payload")?;
        progress.report(50);
        if self.0.books.contains_key(&book.id) {
            return Err(anyhow!("book {} already exists", book.id));
        }
        let message = format!("Book {} added", book.id);
        self.0.books.insert(book.id.clone(), book);
        Ok(message)
    }
}

struct UpdateBook(Arc<BookStore>);

#[async_trait]
impl CommandHandler for UpdateBook {
    async fn handle(&self, payload: &Value, progress: &ProgressReporter) -> Result<String> {
        let id = payload["id"].as_str().ok_or_else(|| anyhow!("missing book id"))?;
        let price = payload["price"].as_u64().ok_or_else(|| anyhow!("missing price"))?;
        // Pretend the update is slow
        for step in 1..=4u8 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            progress.report(step * 25);
        }
        let mut book = self
            .0
            .books
            .get_mut(id)
            .ok_or_else(|| anyhow!("book {} not found", id))?;
        book.price = price;
        Ok(format!("Book {} updated to price {}", id, price))
    }
}

async fn wait_for(system: &AsyncTaskSystem, id: &TaskId) -> Option<TaskSnapshot> {
    for _ in 0..100 {
        let snapshot = system.get_task_status(id)?;
        if snapshot.status.is_terminal() {
            return Some(snapshot);
        }
        info!(task_id = %id, status = %snapshot.status, progress = snapshot.progress, "Polling");
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    system.get_task_status(id)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(Level::INFO);

    let store = Arc::new(BookStore::default());
    let router = CommandRouter::new()
        .with_handler("add_book", Arc::new(AddBook(store.clone())))?
        .with_handler("update_book", Arc::new(UpdateBook(store.clone())))?;

    let authorizer = |_: &str, credential: &str| credential == "demo-token";
    let system = Arc::new(AsyncTaskSystem::new(
        TaskCoreConfig::default(),
        Arc::new(authorizer),
        Arc::new(router),
    )?);
    system.start_maintenance();

    match system.submit_work(Some("alice"), Some("demo-token")) {
        Admission::Admitted { correlation_id } => info!(%correlation_id, "Alice admitted"),
        other => return Err(anyhow!("admission failed: {:?}", other)),
    }
    info!(admission = ?system.submit_work(Some("mallory"), Some("guess")), "Mallory");

    let requests = vec![
        SubmitRequest::new(
            "add_book",
            json!({"id": "B1", "title": "The Rust Programming Language", "price": 40}),
            "alice",
        )
        .with_idempotency_key("add-B1"),
        SubmitRequest::new("update_book", json!({"id": "B1", "price": 100}), "alice")
            .with_idempotency_key("price-B1"),
        // A client retry carrying the same key
        SubmitRequest::new("update_book", json!({"id": "B1", "price": 100}), "alice")
            .with_idempotency_key("price-B1"),
        SubmitRequest::new("delete_everything", json!({}), "alice"),
    ];

    let mut ids = Vec::new();
    for request in requests {
        match system.submit_task(request) {
            SubmitOutcome::Created(task) => {
                info!(task_id = %task.id, command = %task.command, "Created");
                ids.push(task.id);
            }
            SubmitOutcome::Duplicate(task) => {
                info!(task_id = %task.id, status = %task.status, "Duplicate submission")
            }
            SubmitOutcome::Rejected { reason } => info!(?reason, "Rejected"),
        }
    }

    for id in &ids {
        if let Some(task) = wait_for(&system, id).await {
            println!("{} {} -> {}", task.id, task.command, task.message);
        }
    }
    while let Some(line) = system.drain_result() {
        println!("result: {}", line);
    }
    if let Some(book) = store.books.get("B1") {
        println!("B1 now costs {}", book.price);
    }

    let report = system.shutdown().await;
    info!(?report, "Shut down");
    Ok(())
}
