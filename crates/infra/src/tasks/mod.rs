//! Background task queue backing the migration task runner.
//!
//! - `Task`: one unit of work (`migration.import` / `migration.export`) for a job
//! - `TaskStore`: queue persistence plus the dead-letter queue
//! - `TaskExecutor`: polling worker with per-task retry policy and backoff
//! - `QueuedTaskRunner` / `InlineTaskRunner`: the state machine's view of the queue

pub mod executor;
pub mod runner;
pub mod store;
pub mod types;

pub use executor::{
    ExecuteError, ExecutorStats, TaskExecutor, TaskExecutorConfig, TaskExecutorHandle, TaskHandler,
};
pub use runner::{InlineHandler, InlineTaskRunner, QueuedTaskRunner};
pub use store::{InMemoryTaskStore, TaskQueueError, TaskStats, TaskStore};
pub use types::{
    AttemptLog, Backoff, DeadLetterEntry, RetryPolicy, Task, TaskId, TaskResult, TaskStatus,
};
