//! Format codec contract.
//!
//! Codecs turn a staged payload into local records and back. The state
//! machine never looks inside a payload; it only hands codecs the identity
//! mapping and reacts to success or failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use portage_auth::{Login, OrganizationSlug};
use portage_core::ProjectId;

use crate::status::Service;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("unexpected payload structure: {0}")]
    Structure(String),
    #[error("failed to create record: {0}")]
    Record(String),
}

/// Foreign-to-local identifier translation applied while materializing an import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityMapping {
    /// Foreign login -> local login.
    pub users: BTreeMap<Login, Login>,
    /// Foreign organization slug -> local organization slug.
    pub organizations: BTreeMap<OrganizationSlug, OrganizationSlug>,
}

impl IdentityMapping {
    /// Map every payload organization onto the import target.
    pub fn new<I>(
        users: BTreeMap<Login, Login>,
        payload_organizations: I,
        target: &OrganizationSlug,
    ) -> Self
    where
        I: IntoIterator<Item = OrganizationSlug>,
    {
        let organizations = payload_organizations
            .into_iter()
            .map(|slug| (slug, target.clone()))
            .collect();
        Self {
            users,
            organizations,
        }
    }
}

/// A project included in an export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedProject {
    pub id: ProjectId,
    pub permalink: String,
    pub organization: OrganizationSlug,
}

/// Everything an export payload is built from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportScope {
    pub organizations: Vec<OrganizationSlug>,
    pub projects: Vec<ExportedProject>,
    pub users: Vec<Login>,
}

/// Serialization strategy for one service's payload format.
pub trait FormatCodec: Send + Sync {
    /// Organization slugs referenced by a payload.
    fn organization_slugs(&self, payload: &[u8]) -> Result<Vec<OrganizationSlug>, CodecError>;

    /// Build a payload from the export scope.
    fn serialize(&self, scope: &ExportScope) -> Result<Vec<u8>, CodecError>;

    /// Materialize a payload as local records.
    fn unserialize(&self, payload: &[u8], mapping: &IdentityMapping) -> Result<(), CodecError>;
}

/// One codec per service.
#[derive(Clone)]
pub struct Codecs {
    teambox: Arc<dyn FormatCodec>,
    basecamp: Arc<dyn FormatCodec>,
}

impl Codecs {
    pub fn new(teambox: Arc<dyn FormatCodec>, basecamp: Arc<dyn FormatCodec>) -> Self {
        Self { teambox, basecamp }
    }

    pub fn for_service(&self, service: Service) -> &dyn FormatCodec {
        match service {
            Service::Teambox => self.teambox.as_ref(),
            Service::Basecamp => self.basecamp.as_ref(),
        }
    }
}

impl core::fmt::Debug for Codecs {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Codecs").finish_non_exhaustive()
    }
}
