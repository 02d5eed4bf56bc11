//! The migration job entity.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use portage_auth::{Login, OrganizationSlug, Owner};
use portage_core::{DomainError, Entity, JobId, ProjectId};

use crate::status::{Direction, ExportStatus, ImportStatus, JobStatus, RequestedService};

/// A project id as supplied by a caller, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawProjectId {
    Int(i64),
    Text(String),
}

impl From<i64> for RawProjectId {
    fn from(value: i64) -> Self {
        RawProjectId::Int(value)
    }
}

impl From<&str> for RawProjectId {
    fn from(value: &str) -> Self {
        RawProjectId::Text(value.to_string())
    }
}

impl From<String> for RawProjectId {
    fn from(value: String) -> Self {
        RawProjectId::Text(value)
    }
}

impl RawProjectId {
    fn normalize(&self) -> Option<ProjectId> {
        let id = match self {
            RawProjectId::Int(id) => *id,
            RawProjectId::Text(text) => text.trim().parse::<i64>().ok()?,
        };
        (id > 0).then(|| ProjectId::new(id))
    }
}

/// Normalize a project selection to positive integer ids.
///
/// Unparseable and non-positive entries are dropped; duplicates keep their
/// first position.
pub fn normalize_project_ids<I, V>(values: I) -> Vec<ProjectId>
where
    I: IntoIterator<Item = V>,
    V: Into<RawProjectId>,
{
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter_map(|v| v.into().normalize())
        .filter(|id| seen.insert(*id))
        .collect()
}

/// Persisted form of a job, field for field.
///
/// Storage adapters read and write this; everything else goes through
/// [`MigrationJob`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub owner: Owner,
    pub status: JobStatus,
    pub service: RequestedService,
    pub project_ids: Vec<ProjectId>,
    pub target_organization: Option<OrganizationSlug>,
    pub user_identity_map: BTreeMap<Login, Login>,
    pub payload_file_name: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single import or export request and its progress.
///
/// Status and staging fields are only changed by the state machine; owners
/// supply the mapping inputs through the setters below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationJob {
    record: JobRecord,
    persisted: bool,
}

impl MigrationJob {
    fn new(owner: Owner, direction: Direction, service: RequestedService) -> Self {
        let now = Utc::now();
        Self {
            record: JobRecord {
                id: JobId::new(),
                owner,
                status: JobStatus::initial(direction),
                service,
                project_ids: Vec::new(),
                target_organization: None,
                user_identity_map: BTreeMap::new(),
                payload_file_name: None,
                processed_at: None,
                last_error: None,
                created_at: now,
                updated_at: now,
            },
            persisted: false,
        }
    }

    /// A new import job waiting for its payload.
    pub fn new_import(owner: Owner, service: Option<&str>) -> Self {
        Self::new(owner, Direction::Import, RequestedService::resolve(service))
    }

    /// A new export job over the given project selection.
    pub fn new_export<I, V>(owner: Owner, service: Option<&str>, project_ids: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<RawProjectId>,
    {
        let mut job = Self::new(owner, Direction::Export, RequestedService::resolve(service));
        job.record.project_ids = normalize_project_ids(project_ids);
        job
    }

    /// Rehydrate a job loaded from storage.
    pub fn restore(record: JobRecord) -> Self {
        Self {
            record,
            persisted: true,
        }
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn into_record(self) -> JobRecord {
        self.record
    }

    pub fn id_typed(&self) -> JobId {
        self.record.id
    }

    pub fn owner(&self) -> &Owner {
        &self.record.owner
    }

    pub fn direction(&self) -> Direction {
        self.record.status.direction()
    }

    pub fn status(&self) -> JobStatus {
        self.record.status
    }

    pub fn service(&self) -> &RequestedService {
        &self.record.service
    }

    pub fn project_ids(&self) -> &[ProjectId] {
        &self.record.project_ids
    }

    pub fn target_organization(&self) -> Option<&OrganizationSlug> {
        self.record.target_organization.as_ref()
    }

    pub fn user_identity_map(&self) -> &BTreeMap<Login, Login> {
        &self.record.user_identity_map
    }

    pub fn payload_file_name(&self) -> Option<&str> {
        self.record.payload_file_name.as_deref()
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.record.processed_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.record.last_error.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.record.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.record.updated_at
    }

    /// Replace the project selection (export only).
    pub fn set_project_ids<I, V>(&mut self, project_ids: I) -> Result<(), DomainError>
    where
        I: IntoIterator<Item = V>,
        V: Into<RawProjectId>,
    {
        self.require(Direction::Export, "project selection")?;
        self.record.project_ids = normalize_project_ids(project_ids);
        Ok(())
    }

    /// Choose the organization the import lands in (import only).
    pub fn set_target_organization(
        &mut self,
        slug: impl Into<OrganizationSlug>,
    ) -> Result<(), DomainError> {
        self.require(Direction::Import, "target organization")?;
        self.record.target_organization = Some(slug.into());
        Ok(())
    }

    /// Map foreign logins onto local ones (import only).
    pub fn set_user_identity_map<I, K, V>(&mut self, entries: I) -> Result<(), DomainError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Login>,
        V: Into<Login>,
    {
        self.require(Direction::Import, "user identity map")?;
        self.record.user_identity_map = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Ok(())
    }

    /// Take the owner-editable inputs from a submitted copy of this job.
    pub(crate) fn adopt_inputs(&mut self, submitted: &MigrationJob) {
        self.record.project_ids = submitted.record.project_ids.clone();
        self.record.target_organization = submitted.record.target_organization.clone();
        self.record.user_identity_map = submitted.record.user_identity_map.clone();
    }

    fn require(&self, direction: Direction, what: &str) -> Result<(), DomainError> {
        if self.direction() == direction {
            Ok(())
        } else {
            Err(DomainError::invariant(format!(
                "{what} only applies to {direction} jobs"
            )))
        }
    }

    /// Heavy processing is queued or running.
    pub fn is_processing(&self) -> bool {
        self.record.status.is_processing()
    }

    /// Import finished: past the processing phase.
    pub fn is_imported(&self) -> bool {
        self.record.status == JobStatus::Import(ImportStatus::Imported)
    }

    /// Export finished: past the processing phase.
    pub fn is_exported(&self) -> bool {
        self.record.status == JobStatus::Export(ExportStatus::Exported)
    }

    /// More owner input is still required.
    pub fn needs_data(&self) -> bool {
        self.record.status.needs_data()
    }

    pub(crate) fn set_import_status(&mut self, status: ImportStatus) {
        debug_assert_eq!(self.direction(), Direction::Import);
        self.record.status = JobStatus::Import(status);
    }

    pub(crate) fn set_export_status(&mut self, status: ExportStatus) {
        debug_assert_eq!(self.direction(), Direction::Export);
        self.record.status = JobStatus::Export(status);
    }

    /// Roll back to the direction's `processing` status for a retry.
    pub(crate) fn roll_back_to_processing(&mut self, error: String) {
        self.record.status = match self.direction() {
            Direction::Import => JobStatus::Import(ImportStatus::Processing),
            Direction::Export => JobStatus::Export(ExportStatus::Processing),
        };
        self.record.processed_at = None;
        self.record.last_error = Some(error);
    }

    pub(crate) fn set_payload_file_name(&mut self, name: Option<String>) {
        self.record.payload_file_name = name;
    }

    pub(crate) fn mark_processing_started(&mut self) {
        self.record.processed_at = Some(Utc::now());
    }

    pub(crate) fn record_error(&mut self, error: Option<String>) {
        self.record.last_error = error;
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.persisted = true;
    }

    pub(crate) fn touch(&mut self) {
        self.record.updated_at = Utc::now();
    }
}

impl Entity for MigrationJob {
    type Id = JobId;

    fn id(&self) -> &Self::Id {
        &self.record.id
    }

    fn is_new(&self) -> bool {
        !self.persisted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Service;
    use portage_core::UserId;

    fn owner() -> Owner {
        Owner::new(UserId::new(), "pablo")
    }

    #[test]
    fn import_starts_uploading_with_default_service() {
        let job = MigrationJob::new_import(owner(), None);
        assert_eq!(job.status(), JobStatus::Import(ImportStatus::Uploading));
        assert_eq!(job.service(), &RequestedService::Known(Service::Teambox));
        assert!(job.is_new());
        assert!(job.needs_data());
        assert!(job.payload_file_name().is_none());
    }

    #[test]
    fn export_starts_selecting_with_normalized_projects() {
        let job = MigrationJob::new_export(
            owner(),
            Some("basecamp"),
            vec![
                RawProjectId::from(2),
                "1".into(),
                "2".into(),
                "abc".into(),
                RawProjectId::from(-4),
            ],
        );
        assert_eq!(job.status(), JobStatus::Export(ExportStatus::Selecting));
        assert_eq!(job.project_ids(), &[ProjectId::new(2), ProjectId::new(1)]);
    }

    #[test]
    fn import_inputs_are_rejected_on_export_jobs() {
        let mut job = MigrationJob::new_export(owner(), None, [1_i64]);
        assert!(job.set_target_organization("acme").is_err());
        assert!(job.set_user_identity_map([("a", "b")]).is_err());
        assert!(job.set_project_ids(["3"]).is_ok());
        assert_eq!(job.project_ids(), &[ProjectId::new(3)]);
    }

    #[test]
    fn project_selection_is_rejected_on_import_jobs() {
        let mut job = MigrationJob::new_import(owner(), None);
        assert!(job.set_project_ids([1_i64]).is_err());
    }

    #[test]
    fn roll_back_clears_processed_at_and_records_error() {
        let mut job = MigrationJob::new_import(owner(), None);
        job.set_import_status(ImportStatus::PreProcessing);
        job.mark_processing_started();

        job.roll_back_to_processing("boom".to_string());

        assert_eq!(job.status(), JobStatus::Import(ImportStatus::Processing));
        assert!(job.processed_at().is_none());
        assert_eq!(job.last_error(), Some("boom"));
    }

    #[test]
    fn terminal_queries_follow_direction() {
        let mut import = MigrationJob::new_import(owner(), None);
        import.set_import_status(ImportStatus::PreProcessing);
        assert!(import.is_processing());
        assert!(!import.is_imported());
        import.set_import_status(ImportStatus::Imported);
        assert!(import.is_imported());
        assert!(!import.is_exported());

        let mut export = MigrationJob::new_export(owner(), None, [1_i64]);
        export.set_export_status(ExportStatus::Exported);
        assert!(export.is_exported());
        assert!(!export.is_imported());
        assert!(!export.needs_data());
    }

    #[test]
    fn restored_jobs_are_not_new() {
        let job = MigrationJob::new_import(owner(), None);
        let restored = MigrationJob::restore(job.into_record());
        assert!(!restored.is_new());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: normalization yields unique positive ids in first-seen order.
            #[test]
            fn normalization_is_unique_positive_and_ordered(
                raw in proptest::collection::vec(prop_oneof![
                    any::<i64>().prop_map(RawProjectId::Int),
                    "[0-9]{1,4}".prop_map(RawProjectId::Text),
                    "[a-z ]{0,4}".prop_map(RawProjectId::Text),
                ], 0..32)
            ) {
                let ids = normalize_project_ids(raw.clone());

                let unique: HashSet<_> = ids.iter().copied().collect();
                prop_assert_eq!(unique.len(), ids.len());
                prop_assert!(ids.iter().all(|id| id.get() > 0));

                let expected: Vec<_> = raw.iter().filter_map(RawProjectId::normalize).collect();
                let mut first_seen = Vec::new();
                for id in expected {
                    if !first_seen.contains(&id) {
                        first_seen.push(id);
                    }
                }
                prop_assert_eq!(ids, first_seen);
            }
        }
    }
}
