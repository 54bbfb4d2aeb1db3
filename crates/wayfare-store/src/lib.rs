//! Persistence and notification backends for run orchestration.

pub mod memory;
pub mod notify;
pub mod sqlite;

pub use memory::InMemoryRunStore;
pub use notify::BroadcastNotifier;
pub use sqlite::SqliteRunStore;
