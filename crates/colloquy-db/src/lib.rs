//! # colloquy-db
//!
//! Persistence for conversations, descriptors, annotations, invitations
//! and operations, over a single SQLite database.
//!
//! ## Schema
//!
//! - WAL mode, foreign keys enforced
//! - All dates are Unix epoch milliseconds (`i64`)
//! - Schema version stored in `PRAGMA user_version`
//! - UUIDs stored as 16-byte blobs; legacy databases stored text and are
//!   rewritten by the migration

pub mod cache;
pub mod migrations;
pub mod queries;
pub mod schema;
pub mod store;

use rusqlite::Connection;
use std::path::Path;

pub use cache::DescriptorCache;
pub use queries::descriptors::{CallsMode, DateColumn};
pub use queries::operations::OperationRow;
pub use store::{InsertOutcome, MediaDeleteOutcome, ResetOutcome, Store};

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 25;

/// Database error types.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("codec error: {0}")]
    Codec(#[from] colloquy_codec::CodecError),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    Constraint(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Open or create the conversation database at the given path.
///
/// Configures WAL mode, foreign keys, and runs any pending migrations.
/// `subject_peers` resolves a conversation subject to its peer twincode;
/// the repair migration for pre-v25 databases needs it.
pub fn open(
    path: &Path,
    subject_peers: &dyn Fn(uuid::Uuid) -> Option<uuid::Uuid>,
) -> Result<Connection> {
    let mut conn = Connection::open(path)?;
    configure(&conn)?;
    migrations::run(&mut conn, subject_peers)?;
    Ok(conn)
}

/// Open an in-memory database (for testing).
pub fn open_memory() -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    configure(&conn)?;
    migrations::run(&mut conn, &|_| None)?;
    Ok(conn)
}

/// Configure SQLite pragmas.
fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}
