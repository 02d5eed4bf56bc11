use std::borrow::Borrow;

use serde::{Deserialize, Serialize};

use portage_core::UserId;

/// A user's login handle (unique per instance).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Login(String);

impl Login {
    pub fn new(login: impl Into<String>) -> Self {
        Self(login.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Login {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Login {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Login {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for Login {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Organization permalink (the slug used in URLs and payloads).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganizationSlug(String);

impl OrganizationSlug {
    pub fn new(slug: impl Into<String>) -> Self {
        Self(slug.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for OrganizationSlug {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrganizationSlug {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Borrow<str> for OrganizationSlug {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The user who owns a migration job.
///
/// Jobs hold this as a back-reference only; the user record itself lives in
/// the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub user_id: UserId,
    pub login: Login,
}

impl Owner {
    pub fn new(user_id: UserId, login: impl Into<Login>) -> Self {
        Self {
            user_id,
            login: login.into(),
        }
    }
}
