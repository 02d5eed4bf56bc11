//! `portage-auth`: authorization lookups for migration owners.
//!
//! This crate is intentionally decoupled from HTTP and storage: the directory
//! is a port, and the in-memory implementation serves tests and dev setups.

pub mod authorize;
pub mod directory;
pub mod principal;

pub use authorize::{AuthzError, authorize_organization_admin, reachable_logins};
pub use directory::{DirectoryError, InMemoryDirectory, MembershipRole, OwnerDirectory};
pub use principal::{Login, OrganizationSlug, Owner};
