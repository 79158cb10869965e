//! Durable session and run records.

mod memory;
mod sqlite;
mod store;
mod types;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use store::{SessionStore, StoreError};
pub use types::{Lease, RunMeta, RunStatus, Session, SessionAttributes, SessionStatus};
