#![forbid(unsafe_code)]

//! Query specification parsing, compilation and execution.
//!
//! A declarative [`ast::QuerySpecification`] is interpreted into a
//! [`spec::Specification`], planned together with access and pagination
//! inputs into a [`plan::QueryPlan`], rendered into a dialect-specific
//! [`compiler::Statement`] and executed into an [`executor::PaginatedStream`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::KgError;

/// Declarative, client-facing query shape.
///
/// Accepts bare and `query:`-prefixed keys and all path spellings.
pub mod ast;

/// Statement renderers for AQL and Cypher.
pub mod compiler;

/// Runs compiled statements and applies pagination bookkeeping.
pub mod executor;

/// Declarative-to-normalized conversion with alias assignment.
pub mod interpreter;

/// Namespace extraction and prefix rewriting.
pub mod namespace;

/// Dialect-neutral logical plan shared by renderers and evaluators.
pub mod plan;

/// Normalized specification tree.
pub mod spec;

/// Injection-safe statement builder.
pub mod trusted;

pub use compiler::{CompileRequest, CompiledQuery, QueryCompiler, Statement};
pub use executor::{Executor, PaginatedStream};
pub use interpreter::SpecificationInterpreter;
pub use spec::Specification;

/// Requested page of results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationParam {
    /// Rows to skip.
    #[serde(default)]
    pub from: u64,
    /// Page size; `None` means unbounded.
    #[serde(default)]
    pub size: Option<u64>,
    /// Whether the caller wants the total row count.
    #[serde(default)]
    pub return_total: bool,
}

/// Target statement language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Document/edge store query language.
    #[default]
    Aql,
    /// Property-graph pattern language.
    Cypher,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Aql => f.write_str("aql"),
            Dialect::Cypher => f.write_str("cypher"),
        }
    }
}

impl FromStr for Dialect {
    type Err = KgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aql" => Ok(Dialect::Aql),
            "cypher" => Ok(Dialect::Cypher),
            other => Err(KgError::validation(format!("unknown dialect '{other}'"))),
        }
    }
}
