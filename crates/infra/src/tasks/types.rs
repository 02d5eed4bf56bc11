//! Task records and retry policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use portage_core::JobId;
use portage_migration::MigrationTask;

/// Queue-assigned task identifier (UUIDv7, so ids sort by enqueue time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for TaskId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Where a task is in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    /// Last run failed; claimable again once `not_before` passes
    Failed { error: String, attempt: u32 },
    /// Attempt budget spent
    DeadLettered { error: String, attempts: u32 },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::DeadLettered { .. })
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, TaskStatus::Failed { .. })
    }

    /// Whether a worker may pick the task up (subject to its schedule).
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Failed { .. })
    }
}

/// Wait between a failed attempt and the next one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay: Duration },
    /// `step * attempt`, capped.
    Linear { step: Duration, cap: Duration },
    /// `base * 2^(attempt - 1)`, capped, spread by up to `jitter` (0.0-1.0)
    /// around the nominal delay so retries of a batch do not line up.
    Exponential { base: Duration, cap: Duration, jitter: f64 },
}

impl Backoff {
    fn nominal(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay } => delay,
            Backoff::Linear { step, cap } => step.saturating_mul(attempt).min(cap),
            Backoff::Exponential { base, cap, .. } => {
                let factor = 1_u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(cap)
            }
        }
    }
}

/// Attempt budget and backoff for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed in total, the first one included
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(5, Duration::from_millis(500), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    /// One attempt; the first failure dead-letters the task.
    pub fn no_retry() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay },
        }
    }

    pub fn linear(max_attempts: u32, step: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Linear { step, cap },
        }
    }

    /// Exponential backoff with a 10% spread.
    pub fn exponential(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                base,
                cap,
                jitter: 0.1,
            },
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before the attempt following `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let nominal = self.backoff.nominal(attempt);

        match self.backoff {
            Backoff::Exponential { jitter, .. } if jitter > 0.0 => {
                // Deterministic per attempt: position in [-1, 1) from a multiplicative hash.
                let position = f64::from(attempt.wrapping_mul(2_654_435_761) % 1000) / 500.0 - 1.0;
                nominal.mul_f64(1.0 + jitter.min(1.0) * position)
            }
            _ => nominal,
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// A queued unit of work against one migration job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub task: MigrationTask,
    pub status: TaskStatus,
    pub retry_policy: RetryPolicy,
    /// Runs started so far
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_change: DateTime<Utc>,
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: Vec<AttemptLog>,
}

/// One finished run of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptLog {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Absent when the run succeeded
    pub error: Option<String>,
}

impl AttemptLog {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

impl Task {
    pub fn new(job_id: JobId, task: MigrationTask) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::generate(),
            job_id,
            task,
            status: TaskStatus::Pending,
            retry_policy: RetryPolicy::default(),
            attempt: 0,
            enqueued_at: now,
            last_change: now,
            not_before: None,
            attempts: Vec::new(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Hold the task back for `delay` after enqueueing.
    pub fn defer_by(mut self, delay: Duration) -> Self {
        self.not_before = Some(shifted(self.enqueued_at, delay));
        self
    }

    pub fn name(&self) -> &'static str {
        self.task.name()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_none_or(|at| at <= now)
    }

    /// A worker took the task.
    pub fn start(&mut self) {
        self.attempt += 1;
        self.status = TaskStatus::Running;
        self.last_change = Utc::now();
    }

    /// Log the run begun at `started_at` and move to the next status.
    ///
    /// A failure inside the attempt budget is rescheduled with the policy's
    /// backoff; otherwise the task is marked dead-lettered.
    pub fn finish(&mut self, started_at: DateTime<Utc>, outcome: Result<(), String>) {
        let now = Utc::now();
        self.attempts.push(AttemptLog {
            attempt: self.attempt,
            started_at,
            elapsed_ms: u64::try_from((now - started_at).num_milliseconds()).unwrap_or(0),
            error: outcome.as_ref().err().cloned(),
        });
        self.last_change = now;

        self.status = match outcome {
            Ok(()) => TaskStatus::Completed,
            Err(error) if self.retry_policy.should_retry(self.attempt) => {
                let delay = self.retry_policy.delay_for_attempt(self.attempt);
                self.not_before = Some(shifted(now, delay));
                TaskStatus::Failed {
                    error,
                    attempt: self.attempt,
                }
            }
            Err(error) => TaskStatus::DeadLettered {
                error,
                attempts: self.attempt,
            },
        };
    }

    /// Replace the backoff of a retriable task with an explicit delay.
    pub fn reschedule(&mut self, delay: Duration) {
        if self.status.is_retriable() {
            self.not_before = Some(shifted(Utc::now(), delay));
        }
    }

    /// Back to pending with the full attempt budget.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.attempt = 0;
        self.not_before = None;
        self.attempts.clear();
        self.last_change = Utc::now();
    }
}

fn shifted(from: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| from.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// What a handler reports back to the executor.
#[derive(Debug)]
pub enum TaskResult {
    Success,
    /// Retried per the task's policy
    Failure(String),
    /// Retried after the given delay, overriding the policy's backoff
    RetryAfter(Duration),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task: Task,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(task: Task, reason: String) -> Self {
        Self {
            task,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}
