//! Persistent storage: encrypted message log and attachment store.

mod files;
mod log;
mod schema;

pub use files::{sanitize_filename, FileStore};
pub use log::{Direction, LoggedMessage, MessageLog, PeerRecord};
pub use schema::{CREATE_SCHEMA, SCHEMA_VERSION};

/// Default database file name.
pub const DEFAULT_DB_NAME: &str = "messages.db";

/// Busy timeout for writers, in milliseconds.
pub const BUSY_TIMEOUT_MS: u64 = 10_000;
