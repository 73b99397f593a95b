//! Query-specification compiler and permission-filtered traversal engine for
//! multi-tenant knowledge graphs.
//!
//! Clients submit declarative JSON query specifications. The crate validates
//! them, normalizes them into a [`query::spec::Specification`] tree, compiles
//! that tree into a parameterized graph statement (AQL or Cypher), executes it
//! through a [`backend::GraphBackend`] and returns paginated JSON rows. The
//! [`scope`] module reuses the same pipeline to compute the dependency tree of
//! a single instance.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Permission model and read-access filter resolution.
pub mod access;
/// Graph backend seam, the in-memory reference backend and schema bootstrap.
pub mod backend;
/// Engine configuration loaded from TOML.
pub mod config;
/// Query specification parsing, compilation and execution.
pub mod query;
/// Dependency-tree (scope) computation for single instances.
pub mod scope;
/// High-level facade tying access control, compilation and execution together.
pub mod service;
/// Shared identifiers, stages and the crate error type.
pub mod types;

pub use service::{KgQuery, QueryService};
pub use types::{KgError, Result};
