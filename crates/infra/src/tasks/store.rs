//! Task queue storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use portage_core::JobId;

use super::types::{DeadLetterEntry, Task, TaskId, TaskStatus};

/// Durable queue of tasks plus the dead-letter queue.
pub trait TaskStore: Send + Sync {
    fn enqueue(&self, task: Task) -> Result<TaskId, TaskQueueError>;

    fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskQueueError>;

    fn update(&self, task: &Task) -> Result<(), TaskQueueError>;

    /// Claim the oldest ready task, marking it running.
    fn claim_next(&self) -> Result<Option<Task>, TaskQueueError>;

    /// Tasks recorded against one migration job, oldest first.
    fn list_for_job(&self, job_id: JobId) -> Result<Vec<Task>, TaskQueueError>;

    fn dead_letter(&self, task: Task, reason: String) -> Result<(), TaskQueueError>;

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, TaskQueueError>;

    /// Move a dead-lettered task back to pending with a fresh attempt budget.
    fn retry_dead_letter(&self, task_id: TaskId) -> Result<Task, TaskQueueError>;

    fn delete_dead_letter(&self, task_id: TaskId) -> Result<(), TaskQueueError>;

    fn stats(&self) -> Result<TaskStats, TaskQueueError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskQueueError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TaskStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

/// In-memory task store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    dead_letters: RwLock<HashMap<TaskId, DeadLetterEntry>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl TaskStore for InMemoryTaskStore {
    fn enqueue(&self, task: Task) -> Result<TaskId, TaskQueueError> {
        let mut tasks = self.tasks.write().unwrap();
        if tasks.contains_key(&task.id) {
            return Err(TaskQueueError::AlreadyExists(task.id));
        }
        let id = task.id;
        tasks.insert(id, task);
        Ok(id)
    }

    fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskQueueError> {
        Ok(self.tasks.read().unwrap().get(&task_id).cloned())
    }

    fn update(&self, task: &Task) -> Result<(), TaskQueueError> {
        let mut tasks = self.tasks.write().unwrap();
        match tasks.get_mut(&task.id) {
            Some(stored) => {
                *stored = task.clone();
                Ok(())
            }
            None => Err(TaskQueueError::NotFound(task.id)),
        }
    }

    fn claim_next(&self) -> Result<Option<Task>, TaskQueueError> {
        let mut tasks = self.tasks.write().unwrap();

        let now = chrono::Utc::now();
        let Some(task) = tasks
            .values_mut()
            .filter(|t| t.status.is_claimable() && t.is_due(now))
            .min_by_key(|t| (t.enqueued_at, t.id))
        else {
            return Ok(None);
        };

        task.start();
        Ok(Some(task.clone()))
    }

    fn list_for_job(&self, job_id: JobId) -> Result<Vec<Task>, TaskQueueError> {
        let tasks = self.tasks.read().unwrap();
        let mut result: Vec<_> = tasks.values().filter(|t| t.job_id == job_id).cloned().collect();
        result.sort_by_key(|t| (t.enqueued_at, t.id));
        Ok(result)
    }

    fn dead_letter(&self, mut task: Task, reason: String) -> Result<(), TaskQueueError> {
        let mut tasks = self.tasks.write().unwrap();
        let mut dls = self.dead_letters.write().unwrap();

        task.status = TaskStatus::DeadLettered {
            error: reason.clone(),
            attempts: task.attempt,
        };
        task.last_change = chrono::Utc::now();

        tasks.remove(&task.id);
        dls.insert(task.id, DeadLetterEntry::new(task, reason));
        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, TaskQueueError> {
        let dls = self.dead_letters.read().unwrap();
        let mut result: Vec<_> = dls.values().cloned().collect();
        result.sort_by_key(|e| e.dead_lettered_at);
        result.truncate(limit);
        Ok(result)
    }

    fn retry_dead_letter(&self, task_id: TaskId) -> Result<Task, TaskQueueError> {
        let mut tasks = self.tasks.write().unwrap();
        let mut dls = self.dead_letters.write().unwrap();

        let entry = dls.remove(&task_id).ok_or(TaskQueueError::NotFound(task_id))?;

        let mut task = entry.task;
        task.reset();

        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    fn delete_dead_letter(&self, task_id: TaskId) -> Result<(), TaskQueueError> {
        self.dead_letters
            .write()
            .unwrap()
            .remove(&task_id)
            .map(|_| ())
            .ok_or(TaskQueueError::NotFound(task_id))
    }

    fn stats(&self) -> Result<TaskStats, TaskQueueError> {
        let tasks = self.tasks.read().unwrap();
        let dls = self.dead_letters.read().unwrap();

        let mut stats = TaskStats::default();
        for task in tasks.values() {
            match &task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed { .. } => stats.failed += 1,
                TaskStatus::DeadLettered { .. } => stats.dead_lettered += 1,
            }
        }
        stats.dead_lettered += dls.len();
        Ok(stats)
    }
}

impl<T> TaskStore for Arc<T>
where
    T: TaskStore + ?Sized,
{
    fn enqueue(&self, task: Task) -> Result<TaskId, TaskQueueError> {
        (**self).enqueue(task)
    }

    fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskQueueError> {
        (**self).get(task_id)
    }

    fn update(&self, task: &Task) -> Result<(), TaskQueueError> {
        (**self).update(task)
    }

    fn claim_next(&self) -> Result<Option<Task>, TaskQueueError> {
        (**self).claim_next()
    }

    fn list_for_job(&self, job_id: JobId) -> Result<Vec<Task>, TaskQueueError> {
        (**self).list_for_job(job_id)
    }

    fn dead_letter(&self, task: Task, reason: String) -> Result<(), TaskQueueError> {
        (**self).dead_letter(task, reason)
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, TaskQueueError> {
        (**self).list_dead_letters(limit)
    }

    fn retry_dead_letter(&self, task_id: TaskId) -> Result<Task, TaskQueueError> {
        (**self).retry_dead_letter(task_id)
    }

    fn delete_dead_letter(&self, task_id: TaskId) -> Result<(), TaskQueueError> {
        (**self).delete_dead_letter(task_id)
    }

    fn stats(&self) -> Result<TaskStats, TaskQueueError> {
        (**self).stats()
    }
}
