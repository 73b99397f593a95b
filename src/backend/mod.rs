#![forbid(unsafe_code)]

//! Graph backend seam.
//!
//! A backend executes compiled statements and hands back a cursor. Cursors
//! are closed by the executor on every exit path.

use std::collections::BTreeSet;

use tracing::warn;

use crate::query::Statement;
use crate::types::{CollectionRef, KgError, Result, Row, Stage};

/// Idempotent database and collection provisioning with retry.
pub mod bootstrap;
/// In-memory reference backend.
pub mod memory;

pub use bootstrap::{SchemaAdmin, SchemaProvisioner};
pub use memory::MemoryGraph;

/// Backend error number for an exceeded memory ceiling.
pub const ERROR_RESOURCE_LIMIT: i64 = 32;
/// Backend error number for a statement the parser rejected.
pub const ERROR_QUERY_PARSE: i64 = 1501;
/// Backend error number for a dropped server connection.
pub const ERROR_CONNECTION_LOST: i64 = 1497;

/// Server-side result cursor.
pub trait QueryCursor: Send {
    /// Next row, or `None` when exhausted.
    fn next_row(&mut self) -> Option<Result<Row>>;

    /// Number of rows the cursor yields, when the backend reported it.
    fn count(&self) -> Option<u64>;

    /// Row count ignoring `LIMIT`, when requested and reported.
    fn full_count(&self) -> Option<u64>;

    /// Releases server-side resources. Must tolerate repeated calls.
    fn close(&mut self);
}

/// Executes statements against a graph store.
pub trait GraphBackend: Send + Sync {
    /// Runs `statement` against the data of `stage`.
    fn execute(&self, stage: Stage, statement: &Statement) -> Result<Box<dyn QueryCursor>>;

    /// Collections present in `stage`.
    fn known_collections(&self, stage: Stage) -> Result<BTreeSet<CollectionRef>>;
}

/// Maps a numeric backend error to the engine taxonomy.
pub fn classify_backend_error(error_num: i64, message: impl Into<String>) -> KgError {
    let message = message.into();
    warn!(error_num, %message, "backend.error.classified");
    match error_num {
        ERROR_RESOURCE_LIMIT => KgError::LimitExceeded(message),
        ERROR_QUERY_PARSE => KgError::InvalidQuery(message),
        _ => KgError::TransientBackend(format!("backend error {error_num}: {message}")),
    }
}
