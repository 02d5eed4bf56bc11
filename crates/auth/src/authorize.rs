use std::collections::BTreeSet;

use thiserror::Error;
use tracing::warn;

use crate::{Login, OrganizationSlug, Owner, OwnerDirectory};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("forbidden: not an admin of '{0}'")]
    NotAdmin(OrganizationSlug),
}

/// Check that the owner administers the given organization.
///
/// Directory failures count as "not authorized": a lookup that cannot be
/// answered never grants access.
pub fn authorize_organization_admin(
    directory: &dyn OwnerDirectory,
    owner: &Owner,
    slug: &OrganizationSlug,
) -> Result<(), AuthzError> {
    let administered = match directory.administered_organizations(owner.user_id) {
        Ok(slugs) => slugs,
        Err(err) => {
            warn!(owner = %owner.login, error = %err, "administered organizations lookup failed");
            Vec::new()
        }
    };

    if administered.contains(slug) {
        Ok(())
    } else {
        Err(AuthzError::NotAdmin(slug.clone()))
    }
}

/// Logins the owner is allowed to map foreign users onto.
///
/// Returns an empty set when the directory cannot answer.
pub fn reachable_logins(directory: &dyn OwnerDirectory, owner: &Owner) -> BTreeSet<Login> {
    directory
        .known_logins(owner.user_id)
        .unwrap_or_else(|err| {
            warn!(owner = %owner.login, error = %err, "known logins lookup failed");
            BTreeSet::new()
        })
}
