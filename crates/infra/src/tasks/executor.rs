//! Polling executor with retry and dead-letter handling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::store::{TaskQueueError, TaskStore};
use super::types::{Task, TaskResult, TaskStatus};

pub type TaskHandler = Box<dyn Fn(&Task) -> TaskResult + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TaskExecutorConfig {
    /// How long to sleep when the queue is empty
    pub poll_interval: Duration,
    /// Name for logging and the worker thread
    pub name: String,
}

impl Default for TaskExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "migration-executor".to_string(),
        }
    }
}

impl TaskExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct TaskExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl TaskExecutorHandle {
    /// Stop after the task in flight finishes and wait for the thread.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub tasks_processed: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_dead_lettered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("no handler registered for {0}")]
    NoHandler(&'static str),
    #[error("task failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Store(#[from] TaskQueueError),
}

/// Background executor.
///
/// Polls a task store, runs each claimed task through the handler registered
/// under its name, and applies the task's retry policy on failure.
pub struct TaskExecutor<S: TaskStore> {
    store: S,
    handlers: HashMap<&'static str, TaskHandler>,
}

impl<S: TaskStore + 'static> TaskExecutor<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
        }
    }

    pub fn register_handler<F>(&mut self, name: &'static str, handler: F)
    where
        F: Fn(&Task) -> TaskResult + Send + Sync + 'static,
    {
        self.handlers.insert(name, Box::new(handler));
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Spawn the polling loop on a dedicated thread.
    pub fn spawn(self, config: TaskExecutorConfig) -> std::io::Result<TaskExecutorHandle>
    where
        S: Send,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let loop_stats = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || executor_loop(self, config, shutdown_rx, loop_stats))?;

        Ok(TaskExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    /// Run one claimed task to completion, updating the store.
    pub fn execute_one(&self, task: &mut Task) -> Result<(), ExecuteError> {
        let started = Utc::now();
        let Some(handler) = self.handlers.get(task.name()) else {
            let error = ExecuteError::NoHandler(task.name());
            warn!(task_id = %task.id, error = %error, "no handler for task");
            task.finish(started, Err(error.to_string()));
            self.settle_failure(task, error.to_string())?;
            return Err(error);
        };

        let reason = match handler(task) {
            TaskResult::Success => {
                task.finish(started, Ok(()));
                self.store.update(task)?;
                debug!(task_id = %task.id, job_id = %task.job_id, "task completed");
                return Ok(());
            }
            TaskResult::Failure(error) => {
                task.finish(started, Err(error.clone()));
                error
            }
            TaskResult::RetryAfter(delay) => {
                let reason = format!("retry requested after {}ms", delay.as_millis());
                task.finish(started, Err(reason.clone()));
                task.reschedule(delay);
                reason
            }
        };
        self.settle_failure(task, reason.clone())?;
        Err(ExecuteError::Failed(reason))
    }

    fn settle_failure(&self, task: &Task, error: String) -> Result<(), TaskQueueError> {
        if matches!(task.status, TaskStatus::DeadLettered { .. }) {
            warn!(task_id = %task.id, job_id = %task.job_id, error = %error, "task dead-lettered");
            self.store.dead_letter(task.clone(), error)
        } else {
            self.store.update(task)
        }
    }
}

fn executor_loop<S: TaskStore + 'static>(
    executor: TaskExecutor<S>,
    config: TaskExecutorConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<ExecutorStats>>,
) {
    info!(executor = %config.name, "task executor started");
    let start_time = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        stats.lock().unwrap().uptime_secs = start_time.elapsed().as_secs();

        match executor.store.claim_next() {
            Ok(Some(mut task)) => {
                debug!(
                    executor = %config.name,
                    task_id = %task.id,
                    job_id = %task.job_id,
                    task = %task.task,
                    attempt = task.attempt,
                    "claimed task"
                );
                stats.lock().unwrap().current_running += 1;

                let result = executor.execute_one(&mut task);

                {
                    let mut s = stats.lock().unwrap();
                    s.current_running = s.current_running.saturating_sub(1);
                    s.tasks_processed += 1;
                    match result {
                        Ok(()) => s.tasks_succeeded += 1,
                        Err(_) => {
                            s.tasks_failed += 1;
                            if matches!(task.status, TaskStatus::DeadLettered { .. }) {
                                s.tasks_dead_lettered += 1;
                            }
                        }
                    }
                }

                if let Err(e) = result {
                    debug!(
                        executor = %config.name,
                        task_id = %task.id,
                        error = %e,
                        status = ?task.status,
                        "task execution failed"
                    );
                }
            }
            Ok(None) => thread::sleep(config.poll_interval),
            Err(e) => {
                error!(executor = %config.name, error = %e, "failed to claim task");
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(executor = %config.name, "task executor stopped");
}
