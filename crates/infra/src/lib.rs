//! Infrastructure layer: blob stages, job repositories, task queue, config
//! and runtime wiring for the migration state machine.

pub mod blob;
pub mod config;
pub mod notifications;
pub mod repository;
pub mod runtime;
pub mod tasks;


pub use config::{ConfigError, MigrationConfig};
pub use notifications::{GatedNotifier, InMemoryNotifier, Notification, NotificationGate, Notifier, NullNotifier};
pub use runtime::{MigrationRuntime, bind_inline, task_handler};
