//! `portage-core`: ids, errors and the entity trait shared by the migration crates.
//!
//! Nothing here does IO.

pub mod entity;
pub mod error;
pub mod id;

pub use entity::Entity;
pub use error::{DomainError, DomainResult, ErrorKind};
pub use id::{JobId, ProjectId, UserId};
