//! Task runner adapters the state machine enqueues through.

use std::sync::OnceLock;

use tracing::{debug, warn};

use portage_core::JobId;
use portage_migration::{EnqueueError, MigrationTask, TaskRunner};

use super::store::TaskStore;
use super::types::{RetryPolicy, Task};

/// Enqueues onto a [`TaskStore`] for the background executor.
#[derive(Debug)]
pub struct QueuedTaskRunner<S: TaskStore> {
    store: S,
    retry_policy: RetryPolicy,
}

impl<S: TaskStore> QueuedTaskRunner<S> {
    pub fn new(store: S, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            retry_policy,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: TaskStore> TaskRunner for QueuedTaskRunner<S> {
    fn enqueue(&self, job_id: JobId, task: MigrationTask) -> Result<(), EnqueueError> {
        let record = Task::new(job_id, task).with_retry_policy(self.retry_policy.clone());
        let task_id = self.store.enqueue(record).map_err(|e| EnqueueError {
            job_id,
            task,
            reason: e.to_string(),
        })?;
        debug!(task_id = %task_id, job_id = %job_id, task = %task, "task queued");
        Ok(())
    }
}

pub type InlineHandler = Box<dyn Fn(JobId, MigrationTask) -> Result<(), String> + Send + Sync>;

/// Runs each task on the caller's thread as soon as it is enqueued.
///
/// The handler is bound after construction since it usually needs the state
/// machine that owns this runner.
#[derive(Default)]
pub struct InlineTaskRunner {
    handler: OnceLock<InlineHandler>,
}

impl InlineTaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the handler. Returns `false` if one was already bound.
    pub fn bind<F>(&self, handler: F) -> bool
    where
        F: Fn(JobId, MigrationTask) -> Result<(), String> + Send + Sync + 'static,
    {
        self.handler.set(Box::new(handler)).is_ok()
    }
}

impl TaskRunner for InlineTaskRunner {
    fn enqueue(&self, job_id: JobId, task: MigrationTask) -> Result<(), EnqueueError> {
        let handler = self.handler.get().ok_or_else(|| EnqueueError {
            job_id,
            task,
            reason: "no inline handler bound".to_string(),
        })?;

        // Delivery succeeded; the job records its own processing failure.
        if let Err(error) = handler(job_id, task) {
            warn!(job_id = %job_id, task = %task, error = %error, "inline task failed");
        }
        Ok(())
    }
}

impl std::fmt::Debug for InlineTaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InlineTaskRunner")
            .field("bound", &self.handler.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::store::InMemoryTaskStore;
    use std::sync::{Arc, Mutex};

    #[test]
    fn queued_runner_records_task_with_policy() {
        let store = InMemoryTaskStore::arc();
        let runner = QueuedTaskRunner::new(store.clone(), RetryPolicy::default().with_max_attempts(7));
        let job_id = JobId::new();

        runner.enqueue(job_id, MigrationTask::Export).unwrap();

        let tasks = store.list_for_job(job_id).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task, MigrationTask::Export);
        assert_eq!(tasks[0].retry_policy.max_attempts, 7);
    }

    #[test]
    fn inline_runner_requires_a_bound_handler() {
        let runner = InlineTaskRunner::new();
        assert!(runner.enqueue(JobId::new(), MigrationTask::Import).is_err());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        assert!(runner.bind(move |job_id, task| {
            sink.lock().unwrap().push((job_id, task));
            Err("codec failed".to_string())
        }));
        assert!(!runner.bind(|_, _| Ok(())));

        let job_id = JobId::new();
        assert!(runner.enqueue(job_id, MigrationTask::Import).is_ok());
        assert_eq!(*seen.lock().unwrap(), vec![(job_id, MigrationTask::Import)]);
    }
}
