//! The job state machine.
//!
//! [`MigrationStateMachine::save`] is the single guarded entry point for
//! creating or updating a job. It validates, advances the status, and either
//! runs the heavy codec work inline or hands it to the task runner. For a
//! job that already exists the stored record decides the status; the
//! submitted copy only contributes the owner's inputs.
//! [`MigrationStateMachine::run_task`] is the worker side of a deferred job.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use portage_auth::{Login, OwnerDirectory};
use portage_core::{DomainError, Entity, JobId};

use crate::codec::{CodecError, Codecs, IdentityMapping};
use crate::job::MigrationJob;
use crate::ports::{
    BlobError, BlobStage, CatalogError, JobRepository, MigrationTask, NotificationSuppressor,
    ProjectCatalog, RepositoryError, TaskRunner, with_suppressed,
};
use crate::status::{Direction, ExportStatus, ImportStatus, JobStatus};
use crate::validation::{ValidationErrors, validate};

/// Whether heavy processing runs inside `save` or on a background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingMode {
    #[default]
    Inline,
    Deferred,
}

impl ProcessingMode {
    pub fn from_delay_flag(delay: bool) -> Self {
        if delay {
            ProcessingMode::Deferred
        } else {
            ProcessingMode::Inline
        }
    }
}

/// Collaborators the state machine drives.
#[derive(Clone)]
pub struct MigrationPorts {
    pub repository: Arc<dyn JobRepository>,
    pub blobs: Arc<dyn BlobStage>,
    pub tasks: Arc<dyn TaskRunner>,
    pub notifications: Arc<dyn NotificationSuppressor>,
    pub directory: Arc<dyn OwnerDirectory>,
    pub catalog: Arc<dyn ProjectCatalog>,
    pub codecs: Codecs,
}

/// Infrastructure failures that keep a transition from reading or writing
/// the job record.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} cannot be retried from {status}")]
    NotRetryable { job_id: JobId, status: JobStatus },
}

/// Why heavy processing failed.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("{0}")]
    Service(DomainError),
    #[error("no staged payload")]
    MissingPayload,
    #[error("no target organization selected")]
    MissingTarget,
}

/// What a call to [`MigrationStateMachine::save`] did with the job.
#[derive(Debug)]
pub enum TransitionOutcome {
    /// The job was persisted in its new status.
    Saved(MigrationJob),
    /// Validation failed; nothing was persisted.
    Rejected {
        job: MigrationJob,
        errors: ValidationErrors,
    },
    /// The upload could not be staged; the job was persisted in `uploading`.
    StagingFailed { job: MigrationJob, error: BlobError },
    /// Processing failed inside the guarded transition and the job was removed.
    Destroyed { job_id: JobId, error: ProcessingError },
    /// The submitted copy was out of date, or the job no longer takes input.
    /// Carries the stored job, untouched.
    Unchanged(MigrationJob),
}

impl TransitionOutcome {
    pub fn job(&self) -> Option<&MigrationJob> {
        match self {
            TransitionOutcome::Saved(job)
            | TransitionOutcome::Rejected { job, .. }
            | TransitionOutcome::StagingFailed { job, .. }
            | TransitionOutcome::Unchanged(job) => Some(job),
            TransitionOutcome::Destroyed { .. } => None,
        }
    }

    pub fn is_saved(&self) -> bool {
        matches!(self, TransitionOutcome::Saved(_))
    }
}

/// What a worker-side run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Processing failed; the job is back in `processing` awaiting a retry.
    RolledBack(String),
    /// The job is gone or no longer waiting for this task.
    Skipped,
}

/// Where a transition is running.
///
/// A failure destroys the job when it happens inside the guarded entry point
/// or on a job that was never persisted.
#[derive(Debug, Clone, Copy)]
struct TransitionContext {
    fresh: bool,
    guarded: bool,
}

impl TransitionContext {
    fn guarded(job: &MigrationJob) -> Self {
        Self {
            fresh: job.is_new(),
            guarded: true,
        }
    }

    fn worker() -> Self {
        Self {
            fresh: false,
            guarded: false,
        }
    }

    fn destroys_on_failure(self) -> bool {
        self.fresh || self.guarded
    }
}

/// Next step `save` takes once `check_state` has run.
enum Step {
    Persist,
    StagingFailed(BlobError),
    Enqueue(MigrationTask),
    Destroyed(ProcessingError),
}

/// A submitted job measured against what is stored.
enum Rebased {
    /// Transition this job.
    Current(MigrationJob),
    /// Leave the stored job as it is.
    Stale(MigrationJob),
}

/// Result of running the heavy work for one job.
enum Processed {
    Completed,
    RolledBack(ProcessingError),
    Destroyed(ProcessingError),
}

pub struct MigrationStateMachine {
    ports: MigrationPorts,
    mode: ProcessingMode,
}

impl MigrationStateMachine {
    pub fn new(ports: MigrationPorts, mode: ProcessingMode) -> Self {
        Self { ports, mode }
    }

    pub fn mode(&self) -> ProcessingMode {
        self.mode
    }

    pub fn ports(&self) -> &MigrationPorts {
        &self.ports
    }

    pub fn load(&self, job_id: JobId) -> Result<Option<MigrationJob>, TransitionError> {
        Ok(self.ports.repository.get(job_id)?)
    }

    /// Create or update a job, advancing its status.
    ///
    /// `upload` is only consulted while an import is `uploading`. An update
    /// is applied to the stored record, and only while its status still
    /// matches the submitted one and the job still needs owner input.
    pub fn save(
        &self,
        job: MigrationJob,
        upload: Option<&[u8]>,
    ) -> Result<TransitionOutcome, TransitionError> {
        let job = match self.rebase(job)? {
            Rebased::Current(job) => job,
            Rebased::Stale(stored) => return Ok(TransitionOutcome::Unchanged(stored)),
        };

        if let Err(errors) = validate(&job, self.ports.directory.as_ref()) {
            debug!(job_id = %job.id_typed(), errors = %errors, "job rejected");
            return Ok(TransitionOutcome::Rejected { job, errors });
        }

        let ctx = TransitionContext::guarded(&job);
        let mut job = job;
        let from = job.status();

        let step = self.check_state(&mut job, upload, ctx)?;
        debug!(
            job_id = %job.id_typed(),
            direction = ?job.direction(),
            from = %from,
            to = %job.status(),
            "transition"
        );

        match step {
            Step::Persist => {
                self.persist(&mut job)?;
                Ok(TransitionOutcome::Saved(job))
            }
            Step::StagingFailed(error) => {
                self.persist(&mut job)?;
                Ok(TransitionOutcome::StagingFailed { job, error })
            }
            Step::Enqueue(task) => {
                self.persist(&mut job)?;
                let job = self.dispatch(job, task)?;
                Ok(TransitionOutcome::Saved(job))
            }
            Step::Destroyed(error) => Ok(TransitionOutcome::Destroyed {
                job_id: job.id_typed(),
                error,
            }),
        }
    }

    /// Run a deferred task. Does nothing unless the job is still waiting
    /// for it, so duplicate deliveries are harmless.
    #[instrument(skip(self))]
    pub fn run_task(&self, job_id: JobId, task: MigrationTask) -> Result<TaskOutcome, TransitionError> {
        let Some(mut job) = self.ports.repository.get(job_id)? else {
            debug!("job gone, skipping task");
            return Ok(TaskOutcome::Skipped);
        };

        let expected = match task {
            MigrationTask::Import => Direction::Import,
            MigrationTask::Export => Direction::Export,
        };
        if job.direction() != expected || !job.is_processing() {
            debug!(status = %job.status(), "job not awaiting task, skipping");
            return Ok(TaskOutcome::Skipped);
        }

        let processed = match task {
            MigrationTask::Import => self.run_import(&mut job, TransitionContext::worker())?,
            MigrationTask::Export => self.run_export(&mut job)?,
        };

        match processed {
            Processed::Completed => {
                self.persist(&mut job)?;
                Ok(TaskOutcome::Completed)
            }
            Processed::RolledBack(error) => {
                self.persist(&mut job)?;
                Ok(TaskOutcome::RolledBack(error.to_string()))
            }
            // Worker runs never destroy; kept exhaustive for the shared helper.
            Processed::Destroyed(error) => Ok(TaskOutcome::RolledBack(error.to_string())),
        }
    }

    /// Re-trigger processing for a job left waiting in `processing` (a
    /// rolled-back run) or `pre_processing` (a task that never ran, e.g.
    /// lost with a restarted queue). A duplicate run is skipped by
    /// [`run_task`](Self::run_task).
    pub fn retry(&self, job_id: JobId) -> Result<TransitionOutcome, TransitionError> {
        let mut job = self
            .ports
            .repository
            .get(job_id)?
            .ok_or(TransitionError::NotFound(job_id))?;

        let task = match job.status() {
            JobStatus::Import(ImportStatus::Processing | ImportStatus::PreProcessing) => {
                MigrationTask::Import
            }
            JobStatus::Export(ExportStatus::Processing | ExportStatus::PreProcessing) => {
                MigrationTask::Export
            }
            status => return Err(TransitionError::NotRetryable { job_id, status }),
        };
        info!(job_id = %job_id, task = %task, "retrying job");

        match self.mode {
            ProcessingMode::Deferred => {
                match task {
                    MigrationTask::Import => job.set_import_status(ImportStatus::PreProcessing),
                    MigrationTask::Export => job.set_export_status(ExportStatus::PreProcessing),
                }
                self.persist(&mut job)?;
                let job = self.dispatch(job, task)?;
                Ok(TransitionOutcome::Saved(job))
            }
            ProcessingMode::Inline => {
                self.run_task(job_id, task)?;
                let job = self
                    .ports
                    .repository
                    .get(job_id)?
                    .ok_or(TransitionError::NotFound(job_id))?;
                Ok(TransitionOutcome::Saved(job))
            }
        }
    }

    fn rebase(&self, submitted: MigrationJob) -> Result<Rebased, TransitionError> {
        if submitted.is_new() {
            return Ok(Rebased::Current(submitted));
        }

        let id = submitted.id_typed();
        let mut stored = self
            .ports
            .repository
            .get(id)?
            .ok_or(TransitionError::NotFound(id))?;

        if stored.status() != submitted.status() || !stored.needs_data() {
            debug!(
                job_id = %id,
                submitted = %submitted.status(),
                stored = %stored.status(),
                "submission does not apply to the stored job"
            );
            return Ok(Rebased::Stale(stored));
        }

        stored.adopt_inputs(&submitted);
        Ok(Rebased::Current(stored))
    }

    fn check_state(
        &self,
        job: &mut MigrationJob,
        upload: Option<&[u8]>,
        ctx: TransitionContext,
    ) -> Result<Step, TransitionError> {
        match job.status() {
            JobStatus::Import(ImportStatus::Uploading) => self.check_upload(job, upload),
            JobStatus::Import(ImportStatus::Mapping) => match self.mode {
                ProcessingMode::Deferred => {
                    job.set_import_status(ImportStatus::PreProcessing);
                    Ok(Step::Enqueue(MigrationTask::Import))
                }
                ProcessingMode::Inline => {
                    job.set_import_status(ImportStatus::Processing);
                    Ok(match self.run_import(job, ctx)? {
                        Processed::Completed | Processed::RolledBack(_) => Step::Persist,
                        Processed::Destroyed(error) => Step::Destroyed(error),
                    })
                }
            },
            JobStatus::Export(ExportStatus::Selecting) => match self.mode {
                ProcessingMode::Deferred => {
                    job.set_export_status(ExportStatus::PreProcessing);
                    Ok(Step::Enqueue(MigrationTask::Export))
                }
                ProcessingMode::Inline => {
                    job.set_export_status(ExportStatus::Processing);
                    self.run_export(job)?;
                    Ok(Step::Persist)
                }
            },
            _ => Ok(Step::Persist),
        }
    }

    fn check_upload(
        &self,
        job: &mut MigrationJob,
        upload: Option<&[u8]>,
    ) -> Result<Step, TransitionError> {
        let id = job.id_typed();

        if let Some(name) = job.payload_file_name() {
            if self.ports.blobs.contains(id, name)? {
                job.set_import_status(ImportStatus::Mapping);
                return Ok(Step::Persist);
            }
        }

        let Some(bytes) = upload else {
            job.set_payload_file_name(None);
            return Ok(Step::Persist);
        };

        let name = staged_name(&job.owner().login, "import");
        match self.ports.blobs.put(id, &name, bytes) {
            Ok(()) => {
                debug!(job_id = %id, file = %name, "payload staged");
                job.set_payload_file_name(Some(name));
                job.record_error(None);
                job.set_import_status(ImportStatus::Mapping);
                Ok(Step::Persist)
            }
            Err(error) => {
                warn!(job_id = %id, error = %error, "failed to stage payload");
                job.set_payload_file_name(None);
                job.record_error(Some(error.to_string()));
                Ok(Step::StagingFailed(error))
            }
        }
    }

    fn run_import(
        &self,
        job: &mut MigrationJob,
        ctx: TransitionContext,
    ) -> Result<Processed, TransitionError> {
        job.mark_processing_started();
        let id = job.id_typed();

        match self.import_payload(job) {
            Ok(()) => {
                job.set_import_status(ImportStatus::Imported);
                if let Err(error) = self.ports.blobs.delete(id) {
                    warn!(job_id = %id, error = %error, "failed to release staged payload");
                }
                job.set_payload_file_name(None);
                job.record_error(None);
                info!(job_id = %id, "import finished");
                Ok(Processed::Completed)
            }
            Err(error) => {
                job.roll_back_to_processing(error.to_string());
                if ctx.destroys_on_failure() {
                    self.destroy(job)?;
                    info!(job_id = %id, error = %error, "import failed, job destroyed");
                    Ok(Processed::Destroyed(error))
                } else {
                    warn!(job_id = %id, error = %error, "import failed, rolled back");
                    Ok(Processed::RolledBack(error))
                }
            }
        }
    }

    fn import_payload(&self, job: &MigrationJob) -> Result<(), ProcessingError> {
        let service = job.service().known().map_err(ProcessingError::Service)?;
        let target = job.target_organization().ok_or(ProcessingError::MissingTarget)?;
        let payload = self
            .ports
            .blobs
            .get(job.id_typed())?
            .ok_or(ProcessingError::MissingPayload)?;

        let codec = self.ports.codecs.for_service(service);
        let organizations = codec.organization_slugs(&payload)?;
        let mapping = IdentityMapping::new(job.user_identity_map().clone(), organizations, target);

        with_suppressed(self.ports.notifications.as_ref(), || {
            codec.unserialize(&payload, &mapping)
        })?;
        Ok(())
    }

    fn run_export(&self, job: &mut MigrationJob) -> Result<Processed, TransitionError> {
        job.mark_processing_started();
        let id = job.id_typed();

        match self.export_payload(job) {
            Ok(name) => {
                job.set_export_status(ExportStatus::Exported);
                job.set_payload_file_name(Some(name));
                job.record_error(None);
                info!(job_id = %id, "export finished");
                Ok(Processed::Completed)
            }
            Err(error) => {
                job.roll_back_to_processing(error.to_string());
                warn!(job_id = %id, error = %error, "export failed, rolled back");
                Ok(Processed::RolledBack(error))
            }
        }
    }

    fn export_payload(&self, job: &MigrationJob) -> Result<String, ProcessingError> {
        let service = job.service().known().map_err(ProcessingError::Service)?;
        let scope = self.ports.catalog.export_scope(job.project_ids())?;
        let bytes = self.ports.codecs.for_service(service).serialize(&scope)?;

        let name = staged_name(&job.owner().login, "export");
        self.ports.blobs.put(job.id_typed(), &name, &bytes)?;
        Ok(name)
    }

    /// Hand a persisted job to the task runner. A failed enqueue leaves the
    /// job in `processing` so it can be retried.
    fn dispatch(&self, mut job: MigrationJob, task: MigrationTask) -> Result<MigrationJob, TransitionError> {
        let id = job.id_typed();
        match self.ports.tasks.enqueue(id, task) {
            Ok(()) => {
                debug!(job_id = %id, task = %task, "task enqueued");
                // The runner may already have picked the job up.
                Ok(self.ports.repository.get(id)?.unwrap_or(job))
            }
            Err(error) => {
                warn!(job_id = %id, error = %error, "failed to enqueue task");
                job.roll_back_to_processing(error.to_string());
                self.persist(&mut job)?;
                Ok(job)
            }
        }
    }

    fn persist(&self, job: &mut MigrationJob) -> Result<(), TransitionError> {
        job.touch();
        if job.is_new() {
            self.ports.repository.insert(job)?;
            job.mark_persisted();
        } else {
            self.ports.repository.update(job)?;
        }
        Ok(())
    }

    fn destroy(&self, job: &MigrationJob) -> Result<(), TransitionError> {
        let id = job.id_typed();
        if !job.is_new() {
            self.ports.repository.delete(id)?;
        }
        if let Err(error) = self.ports.blobs.delete(id) {
            warn!(job_id = %id, error = %error, "failed to release staged payload");
        }
        Ok(())
    }
}

/// `<login>-<kind>.json`, with characters that cannot appear in a single
/// path segment replaced by `_`.
fn staged_name(login: &Login, kind: &str) -> String {
    let login: String = login
        .as_str()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    format!("{login}-{kind}.json")
}

impl core::fmt::Debug for MigrationStateMachine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MigrationStateMachine")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use portage_auth::{InMemoryDirectory, Login, MembershipRole, OrganizationSlug, Owner};
    use portage_core::{ProjectId, UserId};

    use crate::codec::{ExportScope, ExportedProject, FormatCodec};
    use crate::ports::EnqueueError;

    #[derive(Default)]
    struct Repo(Mutex<HashMap<JobId, MigrationJob>>);

    impl JobRepository for Repo {
        fn insert(&self, job: &MigrationJob) -> Result<(), RepositoryError> {
            let mut jobs = self.0.lock().unwrap();
            if jobs.contains_key(&job.id_typed()) {
                return Err(RepositoryError::AlreadyExists(job.id_typed()));
            }
            jobs.insert(job.id_typed(), MigrationJob::restore(job.record().clone()));
            Ok(())
        }

        fn update(&self, job: &MigrationJob) -> Result<(), RepositoryError> {
            let mut jobs = self.0.lock().unwrap();
            match jobs.get_mut(&job.id_typed()) {
                Some(stored) => {
                    *stored = MigrationJob::restore(job.record().clone());
                    Ok(())
                }
                None => Err(RepositoryError::NotFound(job.id_typed())),
            }
        }

        fn get(&self, id: JobId) -> Result<Option<MigrationJob>, RepositoryError> {
            Ok(self.0.lock().unwrap().get(&id).cloned())
        }

        fn delete(&self, id: JobId) -> Result<bool, RepositoryError> {
            Ok(self.0.lock().unwrap().remove(&id).is_some())
        }
    }

    #[derive(Default)]
    struct Blobs {
        staged: Mutex<HashMap<JobId, (String, Vec<u8>)>>,
        fail_puts: AtomicBool,
    }

    impl BlobStage for Blobs {
        fn put(&self, job_id: JobId, filename: &str, bytes: &[u8]) -> Result<(), BlobError> {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(BlobError::Io {
                    job_id,
                    source: std::io::Error::other("disk full"),
                });
            }
            self.staged
                .lock()
                .unwrap()
                .insert(job_id, (filename.to_string(), bytes.to_vec()));
            Ok(())
        }

        fn get(&self, job_id: JobId) -> Result<Option<Vec<u8>>, BlobError> {
            Ok(self.staged.lock().unwrap().get(&job_id).map(|(_, b)| b.clone()))
        }

        fn contains(&self, job_id: JobId, filename: &str) -> Result<bool, BlobError> {
            Ok(self
                .staged
                .lock()
                .unwrap()
                .get(&job_id)
                .is_some_and(|(name, _)| name == filename))
        }

        fn delete(&self, job_id: JobId) -> Result<(), BlobError> {
            self.staged.lock().unwrap().remove(&job_id);
            Ok(())
        }
    }

    /// Records enqueued tasks along with the job status persisted at that moment.
    struct Tasks {
        repository: Arc<Repo>,
        enqueued: Mutex<Vec<(JobId, MigrationTask, Option<JobStatus>)>>,
        fail: AtomicBool,
    }

    impl TaskRunner for Tasks {
        fn enqueue(&self, job_id: JobId, task: MigrationTask) -> Result<(), EnqueueError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(EnqueueError {
                    job_id,
                    task,
                    reason: "queue offline".to_string(),
                });
            }
            let persisted = self.repository.get(job_id).unwrap().map(|j| j.status());
            self.enqueued.lock().unwrap().push((job_id, task, persisted));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Gate {
        depth: AtomicUsize,
    }

    impl NotificationSuppressor for Gate {
        fn suppress(&self) {
            self.depth.fetch_add(1, Ordering::SeqCst);
        }

        fn release(&self) {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct Catalog;

    impl ProjectCatalog for Catalog {
        fn export_scope(&self, project_ids: &[ProjectId]) -> Result<ExportScope, CatalogError> {
            Ok(ExportScope {
                organizations: vec![OrganizationSlug::new("acme")],
                projects: project_ids
                    .iter()
                    .map(|id| ExportedProject {
                        id: *id,
                        permalink: format!("project-{id}"),
                        organization: OrganizationSlug::new("acme"),
                    })
                    .collect(),
                users: vec![Login::new("owner")],
            })
        }
    }

    /// Codec that records the mapping it was handed and the gate depth seen
    /// while unserializing.
    struct Codec {
        gate: Arc<Gate>,
        fail: AtomicBool,
        seen: Mutex<Vec<(IdentityMapping, usize)>>,
    }

    impl FormatCodec for Codec {
        fn organization_slugs(&self, _payload: &[u8]) -> Result<Vec<OrganizationSlug>, CodecError> {
            Ok(vec![OrganizationSlug::new("foreign")])
        }

        fn serialize(&self, scope: &ExportScope) -> Result<Vec<u8>, CodecError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CodecError::Structure("projects".to_string()));
            }
            Ok(format!("{} projects", scope.projects.len()).into_bytes())
        }

        fn unserialize(&self, _payload: &[u8], mapping: &IdentityMapping) -> Result<(), CodecError> {
            self.seen
                .lock()
                .unwrap()
                .push((mapping.clone(), self.gate.depth.load(Ordering::SeqCst)));
            if self.fail.load(Ordering::SeqCst) {
                return Err(CodecError::Malformed("unexpected end of input".to_string()));
            }
            Ok(())
        }
    }

    struct Harness {
        machine: MigrationStateMachine,
        repository: Arc<Repo>,
        blobs: Arc<Blobs>,
        tasks: Arc<Tasks>,
        gate: Arc<Gate>,
        codec: Arc<Codec>,
        owner: Owner,
    }

    fn harness(mode: ProcessingMode) -> Harness {
        let directory = InMemoryDirectory::arc();
        let owner = Owner::new(UserId::new(), "owner");
        directory.add_user(owner.user_id, "owner");
        let acme = OrganizationSlug::new("acme");
        directory.add_organization(acme.clone());
        directory
            .add_member(&acme, owner.user_id, MembershipRole::Admin)
            .unwrap();

        let repository = Arc::new(Repo::default());
        let blobs = Arc::new(Blobs::default());
        let tasks = Arc::new(Tasks {
            repository: repository.clone(),
            enqueued: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        });
        let gate = Arc::new(Gate::default());
        let codec = Arc::new(Codec {
            gate: gate.clone(),
            fail: AtomicBool::new(false),
            seen: Mutex::new(Vec::new()),
        });

        let ports = MigrationPorts {
            repository: repository.clone(),
            blobs: blobs.clone(),
            tasks: tasks.clone(),
            notifications: gate.clone(),
            directory,
            catalog: Arc::new(Catalog),
            codecs: Codecs::new(codec.clone(), codec.clone()),
        };

        Harness {
            machine: MigrationStateMachine::new(ports, mode),
            repository,
            blobs,
            tasks,
            gate,
            codec,
            owner,
        }
    }

    fn saved(outcome: TransitionOutcome) -> MigrationJob {
        match outcome {
            TransitionOutcome::Saved(job) => job,
            other => panic!("expected saved job, got {other:?}"),
        }
    }

    impl Harness {
        /// An import persisted in `mapping` with a staged payload and a valid map.
        fn mapped_import(&self) -> MigrationJob {
            let job = MigrationJob::new_import(self.owner.clone(), None);
            let mut job = saved(self.machine.save(job, Some(b"{}")).unwrap());
            job.set_target_organization("acme").unwrap();
            job.set_user_identity_map([("jordi", "owner")]).unwrap();
            job
        }
    }

    #[test]
    fn upload_is_staged_under_owner_login_and_moves_to_mapping() {
        let h = harness(ProcessingMode::Inline);
        let job = MigrationJob::new_import(h.owner.clone(), None);

        let job = saved(h.machine.save(job, Some(b"payload")).unwrap());

        assert_eq!(job.status(), JobStatus::Import(ImportStatus::Mapping));
        assert_eq!(job.payload_file_name(), Some("owner-import.json"));
        assert!(h.blobs.contains(job.id_typed(), "owner-import.json").unwrap());
        assert!(!job.is_new());
    }

    #[test]
    fn uploading_without_payload_is_stable() {
        let h = harness(ProcessingMode::Inline);
        let job = MigrationJob::new_import(h.owner.clone(), None);

        let job = saved(h.machine.save(job, None).unwrap());
        assert_eq!(job.status(), JobStatus::Import(ImportStatus::Uploading));
        assert!(job.payload_file_name().is_none());

        let job = saved(h.machine.save(job, None).unwrap());
        assert_eq!(job.status(), JobStatus::Import(ImportStatus::Uploading));
        assert!(job.payload_file_name().is_none());
    }

    #[test]
    fn already_staged_payload_advances_without_new_upload() {
        let h = harness(ProcessingMode::Inline);
        let job = MigrationJob::new_import(h.owner.clone(), None);
        let mut job = saved(h.machine.save(job, None).unwrap());
        h.blobs.put(job.id_typed(), "owner-import.json", b"{}").unwrap();
        job.set_payload_file_name(Some("owner-import.json".to_string()));
        h.repository.update(&job).unwrap();

        let job = saved(h.machine.save(job, None).unwrap());
        assert_eq!(job.status(), JobStatus::Import(ImportStatus::Mapping));
    }

    #[test]
    fn staging_failure_keeps_job_uploading_with_error() {
        let h = harness(ProcessingMode::Inline);
        h.blobs.fail_puts.store(true, Ordering::SeqCst);
        let job = MigrationJob::new_import(h.owner.clone(), None);

        let outcome = h.machine.save(job, Some(b"payload")).unwrap();
        let TransitionOutcome::StagingFailed { job, .. } = outcome else {
            panic!("expected staging failure");
        };
        assert_eq!(job.status(), JobStatus::Import(ImportStatus::Uploading));
        assert!(job.payload_file_name().is_none());
        assert!(job.last_error().unwrap().contains("disk full"));
        assert!(h.repository.get(job.id_typed()).unwrap().is_some());
    }

    #[test]
    fn rejected_job_is_not_persisted() {
        let h = harness(ProcessingMode::Inline);
        let job = MigrationJob::new_export(h.owner.clone(), Some("acme"), [1_i64]);
        let id = job.id_typed();

        let outcome = h.machine.save(job, None).unwrap();
        assert!(matches!(outcome, TransitionOutcome::Rejected { .. }));
        assert!(h.repository.get(id).unwrap().is_none());
    }

    #[test]
    fn inline_import_completes_and_releases_payload() {
        let h = harness(ProcessingMode::Inline);
        let job = h.mapped_import();
        let id = job.id_typed();

        let job = saved(h.machine.save(job, None).unwrap());

        assert_eq!(job.status(), JobStatus::Import(ImportStatus::Imported));
        assert!(job.is_imported());
        assert!(job.payload_file_name().is_none());
        assert!(job.processed_at().is_some());
        assert!(h.blobs.get(id).unwrap().is_none());
        assert!(h.tasks.enqueued.lock().unwrap().is_empty());

        let seen = h.codec.seen.lock().unwrap();
        let (mapping, depth) = &seen[0];
        assert_eq!(*depth, 1);
        assert_eq!(
            mapping.organizations,
            BTreeMap::from([(OrganizationSlug::new("foreign"), OrganizationSlug::new("acme"))])
        );
        assert_eq!(mapping.users[&Login::new("jordi")], Login::new("owner"));
        assert_eq!(h.gate.depth.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn inline_import_failure_destroys_job_and_payload() {
        let h = harness(ProcessingMode::Inline);
        let job = h.mapped_import();
        let id = job.id_typed();
        h.codec.fail.store(true, Ordering::SeqCst);

        let outcome = h.machine.save(job, None).unwrap();

        assert!(matches!(outcome, TransitionOutcome::Destroyed { job_id, .. } if job_id == id));
        assert!(h.repository.get(id).unwrap().is_none());
        assert!(h.blobs.get(id).unwrap().is_none());
        assert_eq!(h.gate.depth.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn deferred_import_is_enqueued_after_persisting_pre_processing() {
        let h = harness(ProcessingMode::Deferred);
        let job = h.mapped_import();
        let id = job.id_typed();

        let job = saved(h.machine.save(job, None).unwrap());

        assert_eq!(job.status(), JobStatus::Import(ImportStatus::PreProcessing));
        assert!(job.is_processing());
        assert_eq!(
            *h.tasks.enqueued.lock().unwrap(),
            vec![(
                id,
                MigrationTask::Import,
                Some(JobStatus::Import(ImportStatus::PreProcessing))
            )]
        );
        assert!(h.codec.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn worker_completes_deferred_import_once() {
        let h = harness(ProcessingMode::Deferred);
        let job = h.mapped_import();
        let id = job.id_typed();
        h.machine.save(job, None).unwrap();

        assert_eq!(h.machine.run_task(id, MigrationTask::Import).unwrap(), TaskOutcome::Completed);
        assert_eq!(h.machine.run_task(id, MigrationTask::Import).unwrap(), TaskOutcome::Skipped);

        let job = h.repository.get(id).unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Import(ImportStatus::Imported));
        assert_eq!(h.codec.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn worker_failure_rolls_back_and_keeps_payload_for_retry() {
        let h = harness(ProcessingMode::Deferred);
        let job = h.mapped_import();
        let id = job.id_typed();
        h.machine.save(job, None).unwrap();
        h.codec.fail.store(true, Ordering::SeqCst);

        let outcome = h.machine.run_task(id, MigrationTask::Import).unwrap();
        assert!(matches!(outcome, TaskOutcome::RolledBack(_)));

        let job = h.repository.get(id).unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Import(ImportStatus::Processing));
        assert!(job.processed_at().is_none());
        assert!(job.last_error().unwrap().contains("unexpected end of input"));
        assert!(h.blobs.get(id).unwrap().is_some());
        assert_eq!(h.gate.depth.load(Ordering::SeqCst), 0);

        h.codec.fail.store(false, Ordering::SeqCst);
        let job = saved(h.machine.retry(id).unwrap());
        assert_eq!(job.status(), JobStatus::Import(ImportStatus::PreProcessing));
        assert_eq!(h.machine.run_task(id, MigrationTask::Import).unwrap(), TaskOutcome::Completed);
        let job = h.repository.get(id).unwrap().unwrap();
        assert!(job.is_imported());
        assert!(job.last_error().is_none());
    }

    #[test]
    fn task_for_the_other_direction_is_skipped() {
        let h = harness(ProcessingMode::Deferred);
        let job = MigrationJob::new_export(h.owner.clone(), None, [1_i64]);
        let id = job.id_typed();
        h.machine.save(job, None).unwrap();

        assert_eq!(h.machine.run_task(id, MigrationTask::Import).unwrap(), TaskOutcome::Skipped);
        assert_eq!(
            h.machine.run_task(JobId::new(), MigrationTask::Export).unwrap(),
            TaskOutcome::Skipped
        );
    }

    #[test]
    fn enqueue_failure_leaves_job_in_processing() {
        let h = harness(ProcessingMode::Deferred);
        h.tasks.fail.store(true, Ordering::SeqCst);
        let job = MigrationJob::new_export(h.owner.clone(), None, [1_i64, 2]);
        let id = job.id_typed();

        let job = saved(h.machine.save(job, None).unwrap());

        assert_eq!(job.status(), JobStatus::Export(ExportStatus::Processing));
        assert!(job.last_error().unwrap().contains("queue offline"));
        let stored = h.repository.get(id).unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Export(ExportStatus::Processing));
    }

    #[test]
    fn inline_export_stages_payload_under_owner_login() {
        let h = harness(ProcessingMode::Inline);
        let job = MigrationJob::new_export(h.owner.clone(), None, [1_i64, 2]);
        assert_eq!(job.status(), JobStatus::Export(ExportStatus::Selecting));

        let job = saved(h.machine.save(job, None).unwrap());

        assert_eq!(job.status(), JobStatus::Export(ExportStatus::Exported));
        assert!(job.is_exported());
        assert!(job.processed_at().is_some());
        assert_eq!(job.payload_file_name(), Some("owner-export.json"));
        assert!(h.blobs.contains(job.id_typed(), "owner-export.json").unwrap());
        assert_eq!(h.blobs.get(job.id_typed()).unwrap().unwrap(), b"2 projects".to_vec());
    }

    #[test]
    fn export_failure_rolls_back_without_destroying() {
        let h = harness(ProcessingMode::Inline);
        h.codec.fail.store(true, Ordering::SeqCst);
        let job = MigrationJob::new_export(h.owner.clone(), None, [1_i64]);
        let id = job.id_typed();

        let job = saved(h.machine.save(job, None).unwrap());

        assert_eq!(job.status(), JobStatus::Export(ExportStatus::Processing));
        assert!(job.processed_at().is_none());
        assert!(job.last_error().is_some());
        assert!(h.repository.get(id).unwrap().is_some());

        h.codec.fail.store(false, Ordering::SeqCst);
        let job = saved(h.machine.retry(id).unwrap());
        assert!(job.is_exported());
    }

    #[test]
    fn retry_rejects_jobs_not_waiting_in_processing() {
        let h = harness(ProcessingMode::Inline);
        let job = MigrationJob::new_export(h.owner.clone(), None, [1_i64]);
        let job = saved(h.machine.save(job, None).unwrap());

        assert!(matches!(
            h.machine.retry(job.id_typed()),
            Err(TransitionError::NotRetryable { .. })
        ));
        assert!(matches!(h.machine.retry(JobId::new()), Err(TransitionError::NotFound(_))));
    }

    #[test]
    fn resubmitted_mapping_form_leaves_the_imported_job_alone() {
        let h = harness(ProcessingMode::Inline);
        let job = h.mapped_import();
        let id = job.id_typed();
        let resubmitted = job.clone();

        assert!(saved(h.machine.save(job, None).unwrap()).is_imported());

        let outcome = h.machine.save(resubmitted, None).unwrap();
        let TransitionOutcome::Unchanged(stored) = outcome else {
            panic!("expected the stored job back, got {outcome:?}");
        };
        assert!(stored.is_imported());
        assert!(h.repository.get(id).unwrap().unwrap().is_imported());
        assert_eq!(h.codec.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn stale_copy_never_moves_status_backwards() {
        let h = harness(ProcessingMode::Deferred);
        let job = h.mapped_import();
        let id = job.id_typed();
        let queued = saved(h.machine.save(job, None).unwrap());
        assert_eq!(queued.status(), JobStatus::Import(ImportStatus::PreProcessing));
        assert_eq!(queued.payload_file_name(), Some("owner-import.json"));

        assert_eq!(h.machine.run_task(id, MigrationTask::Import).unwrap(), TaskOutcome::Completed);
        let outcome = h.machine.save(queued, None).unwrap();

        assert!(matches!(outcome, TransitionOutcome::Unchanged(_)));
        let stored = h.repository.get(id).unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Import(ImportStatus::Imported));
        assert!(stored.payload_file_name().is_none());
    }

    #[test]
    fn mapping_inputs_are_applied_to_the_stored_record() {
        let h = harness(ProcessingMode::Deferred);
        let mut job = h.mapped_import();
        let id = job.id_typed();
        // Machine-owned fields on the submitted copy are ignored.
        job.set_payload_file_name(Some("elsewhere.json".to_string()));
        job.record_error(Some("forged".to_string()));

        let job = saved(h.machine.save(job, None).unwrap());

        assert_eq!(job.target_organization(), Some(&OrganizationSlug::new("acme")));
        assert_eq!(job.user_identity_map()[&Login::new("jordi")], Login::new("owner"));
        let stored = h.repository.get(id).unwrap().unwrap();
        assert_eq!(stored.payload_file_name(), Some("owner-import.json"));
        assert!(stored.last_error().is_none());
    }

    #[test]
    fn saving_a_deleted_job_reports_not_found() {
        let h = harness(ProcessingMode::Inline);
        let job = saved(h.machine.save(MigrationJob::new_import(h.owner.clone(), None), None).unwrap());
        h.repository.delete(job.id_typed()).unwrap();

        assert!(matches!(h.machine.save(job, None), Err(TransitionError::NotFound(_))));
    }

    #[test]
    fn retry_requeues_a_job_whose_task_was_lost() {
        let h = harness(ProcessingMode::Deferred);
        let job = h.mapped_import();
        let id = job.id_typed();
        h.machine.save(job, None).unwrap();
        // The queue forgets the task, e.g. across a restart.
        h.tasks.enqueued.lock().unwrap().clear();

        let job = saved(h.machine.retry(id).unwrap());

        assert_eq!(job.status(), JobStatus::Import(ImportStatus::PreProcessing));
        assert_eq!(h.tasks.enqueued.lock().unwrap().len(), 1);
        assert_eq!(h.machine.run_task(id, MigrationTask::Import).unwrap(), TaskOutcome::Completed);
        assert!(h.repository.get(id).unwrap().unwrap().is_imported());
    }

    #[test]
    fn inline_retry_runs_a_pending_job_immediately() {
        let h = harness(ProcessingMode::Deferred);
        let job = MigrationJob::new_export(h.owner.clone(), None, [1_i64]);
        let id = job.id_typed();
        h.machine.save(job, None).unwrap();

        let inline = MigrationStateMachine::new(h.machine.ports().clone(), ProcessingMode::Inline);
        let job = saved(inline.retry(id).unwrap());

        assert!(job.is_exported());
    }

    #[test]
    fn path_separators_in_the_login_are_not_staged() {
        let h = harness(ProcessingMode::Inline);
        let owner = Owner::new(UserId::new(), "ops/lead\\2");

        let import = saved(h.machine.save(MigrationJob::new_import(owner.clone(), None), Some(b"{}")).unwrap());
        assert_eq!(import.payload_file_name(), Some("ops_lead_2-import.json"));

        let export = saved(h.machine.save(MigrationJob::new_export(owner, None, [1_i64]), None).unwrap());
        assert_eq!(export.payload_file_name(), Some("ops_lead_2-export.json"));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: statuses stay in the import sequence and never move backwards
            /// except for a rollback to `processing`; deferred jobs always pass
            /// through `pre_processing`.
            #[test]
            fn import_statuses_only_move_forward(
                deferred in any::<bool>(),
                failures in proptest::collection::vec(any::<bool>(), 1..6),
            ) {
                let mode = ProcessingMode::from_delay_flag(deferred);
                let h = harness(mode);
                let job = h.mapped_import();
                let id = job.id_typed();
                let mut observed = vec![job.status()];

                h.codec.fail.store(failures[0], Ordering::SeqCst);
                if let TransitionOutcome::Saved(job) = h.machine.save(job, None).unwrap() {
                    observed.push(job.status());
                }

                for fail in failures.iter().skip(1) {
                    h.codec.fail.store(*fail, Ordering::SeqCst);
                    h.machine.run_task(id, MigrationTask::Import).unwrap();
                    if let Some(job) = h.repository.get(id).unwrap() {
                        observed.push(job.status());
                    }
                }

                let processing = JobStatus::Import(ImportStatus::Processing);
                for pair in observed.windows(2) {
                    prop_assert!(pair[1].direction() == Direction::Import);
                    prop_assert!(pair[1].rank() >= pair[0].rank() || pair[1] == processing);
                }
                if deferred {
                    prop_assert_eq!(observed[1], JobStatus::Import(ImportStatus::PreProcessing));
                }
                prop_assert_eq!(h.gate.depth.load(Ordering::SeqCst), 0);
            }
        }
    }
}
