#![forbid(unsafe_code)]

//! Identifiers shared across the engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Crate-wide error type and result alias.
pub mod error;

pub use error::{KgError, KgErrorWithCode, Result};

/// A result row produced by the executor: one JSON object per root instance.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Lifecycle stage of the graph a query runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// Draft data that is still being curated.
    InProgress,
    /// Data that has been released.
    Released,
    /// Raw contributions before inference.
    Native,
}

impl Stage {
    /// Every stage, in declaration order.
    pub const ALL: [Stage; 3] = [Stage::InProgress, Stage::Released, Stage::Native];

    /// Canonical upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::InProgress => "IN_PROGRESS",
            Stage::Released => "RELEASED",
            Stage::Native => "NATIVE",
        }
    }

    /// Node label marking membership in this stage for property-graph backends.
    pub fn label(self) -> &'static str {
        match self {
            Stage::InProgress => "Stage_IN_PROGRESS",
            Stage::Released => "Stage_RELEASED",
            Stage::Native => "Stage_NATIVE",
        }
    }

    /// Database that holds the stage's documents.
    pub fn database_name(self) -> &'static str {
        match self {
            Stage::InProgress => "in_progress",
            Stage::Released => "released",
            Stage::Native => "native",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = KgError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "IN_PROGRESS" => Ok(Stage::InProgress),
            "RELEASED" => Ok(Stage::Released),
            "NATIVE" => Ok(Stage::Native),
            other => Err(KgError::validation(format!("unknown stage '{other}'"))),
        }
    }
}

/// Name of a tenant space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpaceName(String);

impl SpaceName {
    /// Wraps a space name.
    pub fn new(name: impl Into<String>) -> Self {
        SpaceName(name.into())
    }

    /// Borrowed name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpaceName {
    fn from(value: &str) -> Self {
        SpaceName::new(value)
    }
}

/// Fully qualified instance reference: the instance uuid plus its space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId {
    /// Instance uuid.
    pub uuid: Uuid,
    /// Owning space.
    pub space: SpaceName,
}

impl InstanceId {
    /// Creates a reference.
    pub fn new(uuid: Uuid, space: impl Into<SpaceName>) -> Self {
        InstanceId {
            uuid,
            space: space.into(),
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.space, self.uuid)
    }
}

/// Reference to a document or edge collection.
///
/// Names are restricted to `[A-Za-z0-9_-]`; anything else is replaced by `_`
/// so a collection name can be spliced into statement text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionRef {
    name: String,
    edge: bool,
}

impl CollectionRef {
    /// Document collection that stores the instances of a space.
    pub fn for_space(space: &SpaceName) -> Self {
        CollectionRef {
            name: collection_name(space.as_str()),
            edge: false,
        }
    }

    /// Edge collection that stores the relation named by `relation`.
    pub fn for_relation(relation: &str) -> Self {
        CollectionRef {
            name: collection_name(relation),
            edge: true,
        }
    }

    /// Sanitized collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is an edge collection.
    pub fn is_edge(&self) -> bool {
        self.edge
    }
}

impl fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn collection_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
