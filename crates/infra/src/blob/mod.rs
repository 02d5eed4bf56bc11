//! Blob stage adapters.

pub mod fs;
pub mod in_memory;

pub use fs::FsBlobStage;
pub use in_memory::InMemoryBlobStage;
