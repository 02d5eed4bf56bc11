//! Job repository adapters.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryJobRepository;
pub use postgres::PostgresJobRepository;
