#![forbid(unsafe_code)]

//! Declarative, client-facing query specification.
//!
//! Every key accepts its bare name (`propertyName`) as well as the
//! `query:`-prefixed JSON-LD spelling (`query:propertyName`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{KgError, Result};

/// A URI reference written either as a bare string or as `{"@id": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdRef {
    /// `"https://schema.org/name"`
    Bare(String),
    /// `{"@id": "https://schema.org/name"}`
    Object {
        /// Referenced URI.
        #[serde(rename = "@id")]
        id: String,
    },
}

impl IdRef {
    /// Referenced URI.
    pub fn id(&self) -> &str {
        match self {
            IdRef::Bare(id) | IdRef::Object { id } => id,
        }
    }

    pub(crate) fn id_mut(&mut self) -> &mut String {
        match self {
            IdRef::Bare(id) | IdRef::Object { id } => id,
        }
    }
}

/// A value that may be written as a single element or as an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// Array form.
    Many(Vec<T>),
    /// Single-element form.
    One(Box<T>),
}

impl<T> OneOrMany<T> {
    /// Borrowed elements in order.
    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => std::slice::from_ref(item.as_ref()),
        }
    }

    /// Mutable elements in order.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => std::slice::from_mut(item.as_mut()),
        }
    }
}

/// Comparison applied by a [`ValueFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterOp {
    /// Value is null, the empty string or the empty list.
    IsEmpty,
    /// Value starts with the operand (case-sensitive).
    StartsWith,
    /// Value ends with the operand (case-sensitive).
    EndsWith,
    /// Value contains the operand (case-sensitive).
    Contains,
    /// Value equals the operand.
    Equals,
    /// Value matches the operand as a regular expression.
    Regex,
}

/// A filter on a property or on the root document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueFilter {
    /// Comparison.
    #[serde(alias = "query:op")]
    pub op: FilterOp,
    /// Name of a runtime filter value that overrides `value`.
    #[serde(default, alias = "query:parameter", skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
    /// Literal operand.
    #[serde(default, alias = "query:value", skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// How a multi-valued leaf collapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SingleValue {
    /// Keep the first match.
    First,
    /// Join all matches with `", "`.
    Concat,
}

/// One traversal hop in object form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathStepObject {
    /// Edge (or, on the last hop of a leaf, attribute) URI.
    #[serde(rename = "@id", alias = "id")]
    pub id: String,
    /// Traverse the edge inbound instead of outbound.
    #[serde(default, alias = "query:reverse")]
    pub reverse: bool,
    /// Types the hop target must carry.
    #[serde(default, alias = "query:typeFilter", skip_serializing_if = "Option::is_none")]
    pub type_filter: Option<OneOrMany<IdRef>>,
}

/// A path step as written by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathStepRepr {
    /// `"hasLanguage"`
    Bare(String),
    /// `{"@id": "hasLanguage", "reverse": true}`
    Object(PathStepObject),
}

/// Canonical traversal hop produced by [`normalize_path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStep {
    /// Edge or attribute URI.
    pub id: String,
    /// Inbound traversal.
    pub reverse: bool,
    /// Allowed target types; empty means any.
    pub type_filter: Vec<String>,
}

/// Normalizes a string, object or array path into a list of steps.
pub fn normalize_path(path: Option<&OneOrMany<PathStepRepr>>) -> Vec<PathStep> {
    let Some(path) = path else {
        return Vec::new();
    };
    path.as_slice()
        .iter()
        .map(|step| match step {
            PathStepRepr::Bare(id) => PathStep {
                id: id.clone(),
                reverse: false,
                type_filter: Vec::new(),
            },
            PathStepRepr::Object(obj) => PathStep {
                id: obj.id.clone(),
                reverse: obj.reverse,
                type_filter: obj
                    .type_filter
                    .as_ref()
                    .map(|tf| tf.as_slice().iter().map(|t| t.id().to_owned()).collect())
                    .unwrap_or_default(),
            },
        })
        .collect()
}

/// A node of the declarative structure tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructureItem {
    /// Output key.
    #[serde(alias = "query:propertyName")]
    pub property_name: IdRef,
    /// Traversal path.
    #[serde(default, alias = "query:path", skip_serializing_if = "Option::is_none")]
    pub path: Option<OneOrMany<PathStepRepr>>,
    /// Nested sub-properties.
    #[serde(default, alias = "query:structure", skip_serializing_if = "Option::is_none")]
    pub structure: Option<OneOrMany<StructureItem>>,
    /// Inner-join semantics.
    #[serde(default, alias = "query:required")]
    pub required: bool,
    /// Sort ascending by this property.
    #[serde(default, alias = "query:sort")]
    pub sort: bool,
    /// Group key of the enclosing grouped property.
    #[serde(default, alias = "query:groupBy")]
    pub group_by: bool,
    /// Key under which grouped rows collapse.
    #[serde(default, alias = "query:groupedInstances", skip_serializing_if = "Option::is_none")]
    pub grouped_instances: Option<String>,
    /// Keep traversal order instead of de-duplicating.
    #[serde(default, alias = "query:ensureOrder")]
    pub ensure_order: bool,
    /// Value filter.
    #[serde(default, alias = "query:filter", skip_serializing_if = "Option::is_none")]
    pub filter: Option<ValueFilter>,
    /// Collapse of multi-valued leaves.
    #[serde(default, alias = "query:singleValue", skip_serializing_if = "Option::is_none")]
    pub single_value: Option<SingleValue>,
}

/// The `meta` block.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMeta {
    /// Root type URI.
    #[serde(default, rename = "type", alias = "query:type", skip_serializing_if = "Option::is_none")]
    pub root_type: Option<IdRef>,
    /// Namespace prefix stripped from and re-applied to output keys.
    #[serde(default, alias = "query:responseVocab", skip_serializing_if = "Option::is_none")]
    pub response_vocab: Option<String>,
    /// Filter on the root document's `@id`.
    #[serde(default, alias = "query:filter", skip_serializing_if = "Option::is_none")]
    pub filter: Option<ValueFilter>,
    /// Human-readable query name.
    #[serde(default, alias = "query:name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A client query specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpecification {
    /// Root type and response options.
    #[serde(default, alias = "query:meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<QueryMeta>,
    /// Output structure.
    #[serde(default, alias = "query:structure", skip_serializing_if = "Option::is_none")]
    pub structure: Option<OneOrMany<StructureItem>>,
}

impl QuerySpecification {
    /// Parses a JSON payload, rejecting empty documents and missing fields.
    pub fn from_value(payload: &Value) -> Result<Self> {
        match payload {
            Value::Object(map) if !map.is_empty() => {}
            _ => return Err(KgError::validation("The provided query is empty")),
        }
        let spec: QuerySpecification = serde_json::from_value(payload.clone())
            .map_err(|err| KgError::validation(format!("malformed query: {err}")))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Checks the fields every query must carry.
    pub fn validate(&self) -> Result<()> {
        let meta = match &self.meta {
            Some(meta) if *meta != QueryMeta::default() => meta,
            _ => {
                return Err(KgError::validation(
                    "The query provided is missing a value for meta",
                ))
            }
        };
        match &meta.root_type {
            Some(ty) if !ty.id().trim().is_empty() => {}
            _ => return Err(KgError::validation("The query provided is missing type in meta")),
        }
        match &self.structure {
            Some(structure) if !structure.as_slice().is_empty() => Ok(()),
            _ => Err(KgError::validation("The query provided is missing structure")),
        }
    }

    /// Top-level structure items.
    pub fn items(&self) -> &[StructureItem] {
        self.structure.as_ref().map(OneOrMany::as_slice).unwrap_or(&[])
    }
}
