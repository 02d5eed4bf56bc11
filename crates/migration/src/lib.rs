//! `portage-migration` : cross-tenant import/export jobs.
//!
//! The job entity, its per-direction status sequences, the validation engine,
//! and the state machine that drives a job from input collection to a
//! terminal status. Storage, background execution and notification delivery
//! are reached through the traits in [`ports`]; this crate does no IO.

pub mod codec;
pub mod job;
pub mod machine;
pub mod ports;
pub mod status;
pub mod validation;

pub use codec::{CodecError, Codecs, ExportScope, ExportedProject, FormatCodec, IdentityMapping};
pub use job::{JobRecord, MigrationJob, RawProjectId, normalize_project_ids};
pub use machine::{
    MigrationPorts, MigrationStateMachine, ProcessingError, ProcessingMode, TaskOutcome,
    TransitionError, TransitionOutcome,
};
pub use ports::{
    BlobError, BlobStage, CatalogError, EnqueueError, JobRepository, MigrationTask,
    NotificationSuppressor, ProjectCatalog, RepositoryError, SuppressionScope, TaskRunner,
    with_suppressed,
};
pub use status::{Direction, ExportStatus, ImportStatus, JobStatus, RequestedService, Service};
pub use validation::{FieldError, ValidationErrors, validate};
