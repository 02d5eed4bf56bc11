//! Collaborators the state machine depends on.
//!
//! Implementations live in `portage-infra`; these traits keep the core free of
//! storage, threading and delivery concerns.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use portage_core::{JobId, ProjectId};

use crate::codec::ExportScope;
use crate::job::MigrationJob;

// ─────────────────────────────────────────────────────────────────────────────
// Blob stage
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob io error for job {job_id}: {source}")]
    Io {
        job_id: JobId,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid blob name: {0}")]
    InvalidName(String),
}

/// Temporary storage for one payload per job.
///
/// `put` supersedes whatever the job had staged before.
pub trait BlobStage: Send + Sync {
    fn put(&self, job_id: JobId, filename: &str, bytes: &[u8]) -> Result<(), BlobError>;

    fn get(&self, job_id: JobId) -> Result<Option<Vec<u8>>, BlobError>;

    /// Whether the job's staged blob exists under `filename`.
    fn contains(&self, job_id: JobId, filename: &str) -> Result<bool, BlobError>;

    /// Release the job's staged blob. Missing blobs are not an error.
    fn delete(&self, job_id: JobId) -> Result<(), BlobError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Async task runner
// ─────────────────────────────────────────────────────────────────────────────

/// Deferred unit of work for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationTask {
    Import,
    Export,
}

impl MigrationTask {
    pub const IMPORT: &'static str = "migration.import";
    pub const EXPORT: &'static str = "migration.export";

    pub fn name(self) -> &'static str {
        match self {
            MigrationTask::Import => Self::IMPORT,
            MigrationTask::Export => Self::EXPORT,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            Self::IMPORT => Some(MigrationTask::Import),
            Self::EXPORT => Some(MigrationTask::Export),
            _ => None,
        }
    }
}

impl core::fmt::Display for MigrationTask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Error)]
#[error("failed to enqueue {task} for job {job_id}: {reason}")]
pub struct EnqueueError {
    pub job_id: JobId,
    pub task: MigrationTask,
    pub reason: String,
}

/// Runs a named unit of work outside the request cycle.
///
/// Delivery is at-least-once with no ordering across jobs; handlers must
/// tolerate duplicates.
pub trait TaskRunner: Send + Sync {
    fn enqueue(&self, job_id: JobId, task: MigrationTask) -> Result<(), EnqueueError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Notification suppressor
// ─────────────────────────────────────────────────────────────────────────────

/// Scoped switch for outbound notification delivery.
///
/// Calls are balanced by [`SuppressionScope`]; implementations only need to
/// track nesting.
pub trait NotificationSuppressor: Send + Sync {
    fn suppress(&self);

    fn release(&self);
}

/// RAII guard: notifications stay suppressed until it is dropped.
#[must_use = "notifications are released as soon as the scope is dropped"]
pub struct SuppressionScope<'a> {
    suppressor: &'a dyn NotificationSuppressor,
}

impl<'a> SuppressionScope<'a> {
    pub fn enter(suppressor: &'a dyn NotificationSuppressor) -> Self {
        suppressor.suppress();
        Self { suppressor }
    }
}

impl Drop for SuppressionScope<'_> {
    fn drop(&mut self) {
        self.suppressor.release();
    }
}

/// Run `scope` with notifications suppressed, restoring the previous state on
/// every exit path.
pub fn with_suppressed<T>(suppressor: &dyn NotificationSuppressor, scope: impl FnOnce() -> T) -> T {
    let _guard = SuppressionScope::enter(suppressor);
    scope()
}

// ─────────────────────────────────────────────────────────────────────────────
// Job repository
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("corrupt job record {0}: {1}")]
    Corrupt(JobId, String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable job records.
pub trait JobRepository: Send + Sync {
    fn insert(&self, job: &MigrationJob) -> Result<(), RepositoryError>;

    fn update(&self, job: &MigrationJob) -> Result<(), RepositoryError>;

    fn get(&self, id: JobId) -> Result<Option<MigrationJob>, RepositoryError>;

    /// Remove a job record. Returns whether a record existed.
    fn delete(&self, id: JobId) -> Result<bool, RepositoryError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Project catalog
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum CatalogError {
    #[error("unknown project: {0}")]
    UnknownProject(ProjectId),
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

/// Resolves a project selection into what an export covers.
pub trait ProjectCatalog: Send + Sync {
    /// Selected projects, the organizations owning them, and the users of
    /// those organizations (members and project participants).
    fn export_scope(&self, project_ids: &[ProjectId]) -> Result<ExportScope, CatalogError>;
}

impl<T> BlobStage for Arc<T>
where
    T: BlobStage + ?Sized,
{
    fn put(&self, job_id: JobId, filename: &str, bytes: &[u8]) -> Result<(), BlobError> {
        (**self).put(job_id, filename, bytes)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Vec<u8>>, BlobError> {
        (**self).get(job_id)
    }

    fn contains(&self, job_id: JobId, filename: &str) -> Result<bool, BlobError> {
        (**self).contains(job_id, filename)
    }

    fn delete(&self, job_id: JobId) -> Result<(), BlobError> {
        (**self).delete(job_id)
    }
}

impl<T> TaskRunner for Arc<T>
where
    T: TaskRunner + ?Sized,
{
    fn enqueue(&self, job_id: JobId, task: MigrationTask) -> Result<(), EnqueueError> {
        (**self).enqueue(job_id, task)
    }
}

impl<T> NotificationSuppressor for Arc<T>
where
    T: NotificationSuppressor + ?Sized,
{
    fn suppress(&self) {
        (**self).suppress()
    }

    fn release(&self) {
        (**self).release()
    }
}

impl<T> JobRepository for Arc<T>
where
    T: JobRepository + ?Sized,
{
    fn insert(&self, job: &MigrationJob) -> Result<(), RepositoryError> {
        (**self).insert(job)
    }

    fn update(&self, job: &MigrationJob) -> Result<(), RepositoryError> {
        (**self).update(job)
    }

    fn get(&self, id: JobId) -> Result<Option<MigrationJob>, RepositoryError> {
        (**self).get(id)
    }

    fn delete(&self, id: JobId) -> Result<bool, RepositoryError> {
        (**self).delete(id)
    }
}

impl<T> ProjectCatalog for Arc<T>
where
    T: ProjectCatalog + ?Sized,
{
    fn export_scope(&self, project_ids: &[ProjectId]) -> Result<ExportScope, CatalogError> {
        (**self).export_scope(project_ids)
    }
}
