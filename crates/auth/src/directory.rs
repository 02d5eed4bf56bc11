//! Owner directory: who administers what, and which logins an owner can see.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use portage_core::UserId;

use crate::{Login, OrganizationSlug};

/// Directory lookup error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DirectoryError {
    #[error("unknown user: {0}")]
    UnknownUser(UserId),
    #[error("unknown organization: {0}")]
    UnknownOrganization(OrganizationSlug),
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// Read-only authorization queries about a job owner.
pub trait OwnerDirectory: Send + Sync {
    /// Slugs of the organizations the user administers.
    fn administered_organizations(
        &self,
        user_id: UserId,
    ) -> Result<Vec<OrganizationSlug>, DirectoryError>;

    /// Logins reachable from the user: members of the user's organizations and
    /// members of projects within those organizations.
    fn known_logins(&self, user_id: UserId) -> Result<BTreeSet<Login>, DirectoryError>;
}

impl<D> OwnerDirectory for Arc<D>
where
    D: OwnerDirectory + ?Sized,
{
    fn administered_organizations(
        &self,
        user_id: UserId,
    ) -> Result<Vec<OrganizationSlug>, DirectoryError> {
        (**self).administered_organizations(user_id)
    }

    fn known_logins(&self, user_id: UserId) -> Result<BTreeSet<Login>, DirectoryError> {
        (**self).known_logins(user_id)
    }
}

/// Role a user holds inside an organization.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MembershipRole {
    Admin,
    Participant,
}

#[derive(Debug, Default)]
struct OrganizationRecord {
    admins: BTreeSet<UserId>,
    members: BTreeSet<UserId>,
    project_members: BTreeSet<UserId>,
}

impl OrganizationRecord {
    fn has_member(&self, user_id: UserId) -> bool {
        self.admins.contains(&user_id) || self.members.contains(&user_id)
    }
}

/// In-memory directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    users: RwLock<HashMap<UserId, Login>>,
    organizations: RwLock<HashMap<OrganizationSlug, OrganizationRecord>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn add_user(&self, user_id: UserId, login: impl Into<Login>) {
        self.users.write().unwrap().insert(user_id, login.into());
    }

    pub fn add_organization(&self, slug: impl Into<OrganizationSlug>) {
        self.organizations
            .write()
            .unwrap()
            .entry(slug.into())
            .or_default();
    }

    /// Add a user to an organization with the given role.
    pub fn add_member(
        &self,
        slug: &OrganizationSlug,
        user_id: UserId,
        role: MembershipRole,
    ) -> Result<(), DirectoryError> {
        let mut orgs = self.organizations.write().unwrap();
        let org = orgs
            .get_mut(slug)
            .ok_or_else(|| DirectoryError::UnknownOrganization(slug.clone()))?;
        match role {
            MembershipRole::Admin => org.admins.insert(user_id),
            MembershipRole::Participant => org.members.insert(user_id),
        };
        Ok(())
    }

    /// Add a user who participates in one of the organization's projects
    /// without being an organization member.
    pub fn add_project_member(
        &self,
        slug: &OrganizationSlug,
        user_id: UserId,
    ) -> Result<(), DirectoryError> {
        let mut orgs = self.organizations.write().unwrap();
        let org = orgs
            .get_mut(slug)
            .ok_or_else(|| DirectoryError::UnknownOrganization(slug.clone()))?;
        org.project_members.insert(user_id);
        Ok(())
    }

    fn ensure_user(&self, user_id: UserId) -> Result<(), DirectoryError> {
        if self.users.read().unwrap().contains_key(&user_id) {
            Ok(())
        } else {
            Err(DirectoryError::UnknownUser(user_id))
        }
    }
}

impl OwnerDirectory for InMemoryDirectory {
    fn administered_organizations(
        &self,
        user_id: UserId,
    ) -> Result<Vec<OrganizationSlug>, DirectoryError> {
        self.ensure_user(user_id)?;
        let orgs = self.organizations.read().unwrap();
        let mut slugs: Vec<_> = orgs
            .iter()
            .filter(|(_, org)| org.admins.contains(&user_id))
            .map(|(slug, _)| slug.clone())
            .collect();
        slugs.sort();
        Ok(slugs)
    }

    fn known_logins(&self, user_id: UserId) -> Result<BTreeSet<Login>, DirectoryError> {
        self.ensure_user(user_id)?;
        let users = self.users.read().unwrap();
        let orgs = self.organizations.read().unwrap();

        let logins = orgs
            .values()
            .filter(|org| org.has_member(user_id))
            .flat_map(|org| {
                org.admins
                    .iter()
                    .chain(org.members.iter())
                    .chain(org.project_members.iter())
            })
            .filter_map(|id| users.get(id).cloned())
            .collect();

        Ok(logins)
    }
}
