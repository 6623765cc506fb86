pub mod acceptor;
pub mod idempotency;
pub mod model;
pub mod registry;
pub mod runner;
pub mod service;
pub mod worker;

// Re-export all the key structs and functions
pub use acceptor::{Admission, Authorizer, PresenceOnly, WorkAcceptor};
pub use idempotency::{IdempotencyRecord, IdempotencyStore, RecordOutcome, Resolution};
pub use model::{AsyncTaskRequest, Task, TaskId, TaskSnapshot, TaskStatus};
pub use registry::AsyncTaskService;
pub use runner::{CommandHandler, CommandRouter, ProgressReporter, RunOutcome, TaskRunner};
pub use service::{AsyncTaskSystem, MaintenanceReport, RejectReason, SubmitOutcome, SubmitRequest};
pub use worker::{BackgroundWorker, EnqueueOutcome, ShutdownReport, WorkerStats};
