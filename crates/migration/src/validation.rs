//! Validation engine: gates a job before it may leave the input phase.
//!
//! Every check runs; errors are collected per field and returned as data.

use std::collections::BTreeSet;

use serde::Serialize;

use portage_auth::{Login, OwnerDirectory, authorize_organization_admin, reachable_logins};

use crate::job::MigrationJob;
use crate::status::{ImportStatus, JobStatus};

pub const SERVICE_FIELD: &str = "service";
pub const TARGET_ORGANIZATION_FIELD: &str = "target_organization";

/// Field name carrying the error for one identity-map entry.
pub fn user_map_field(source: &Login) -> String {
    format!("user_map_{source}")
}

/// A single field-tagged validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Field-keyed validation failures, in the order they were found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors {
    errors: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.errors.iter()
    }

    /// Messages recorded against one field.
    pub fn on<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.errors
            .iter()
            .filter(move |e| e.field == field)
            .map(|e| e.message.as_str())
    }

    pub fn has(&self, field: &str) -> bool {
        self.on(field).next().is_some()
    }

    fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl core::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("validation failed")?;
        for (idx, e) in self.errors.iter().enumerate() {
            let sep = if idx == 0 { ": " } else { "; " };
            write!(f, "{sep}{} {}", e.field, e.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

/// Validate a job against its owner's authorizations. Never mutates the job.
pub fn validate(job: &MigrationJob, directory: &dyn OwnerDirectory) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::new();

    if let Err(err) = job.service().known() {
        errors.add(SERVICE_FIELD, err.message());
    }

    if job.status() == JobStatus::Import(ImportStatus::Mapping) {
        check_target_organization(job, directory, &mut errors);
        check_user_map(job, directory, &mut errors);
    }

    errors.into_result()
}

fn check_target_organization(
    job: &MigrationJob,
    directory: &dyn OwnerDirectory,
    errors: &mut ValidationErrors,
) {
    match job.target_organization() {
        None => errors.add(TARGET_ORGANIZATION_FIELD, "Should be selected"),
        Some(slug) => {
            if authorize_organization_admin(directory, job.owner(), slug).is_err() {
                errors.add(TARGET_ORGANIZATION_FIELD, "Should be an admin");
            }
        }
    }
}

fn check_user_map(job: &MigrationJob, directory: &dyn OwnerDirectory, errors: &mut ValidationErrors) {
    if job.user_identity_map().is_empty() {
        return;
    }

    let known = reachable_logins(directory, job.owner());
    for (source, destination) in job.user_identity_map() {
        if !known.contains(destination) {
            errors.add(
                user_map_field(source),
                format!(
                    "{destination} is not known to {} (known logins: {})",
                    job.owner().login,
                    format_logins(&known)
                ),
            );
        }
    }
}

fn format_logins(logins: &BTreeSet<Login>) -> String {
    let names: Vec<_> = logins.iter().map(Login::as_str).collect();
    format!("[{}]", names.join(", "))
}
