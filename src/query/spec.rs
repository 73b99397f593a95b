#![forbid(unsafe_code)]

//! Normalized, alias-resolved query specification.

use serde::Serialize;

use crate::query::ast::{SingleValue, ValueFilter};
use crate::query::trusted::Trusted;

/// One traversal hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Traverse {
    /// Edge name, or attribute key on the final hop of a leaf.
    pub path_name: String,
    /// Follow the edge inbound.
    pub reverse: bool,
    /// Allowed target types; empty means any.
    pub type_filter: Vec<String>,
}

/// A node of the normalized tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpecProperty {
    /// Output key.
    pub property_name: String,
    /// Traversal hops.
    pub path: Vec<Traverse>,
    /// Nested properties.
    pub property: Vec<SpecProperty>,
    /// Inner-join semantics.
    pub required: bool,
    /// Sort ascending by this property.
    pub sort: bool,
    /// Group key of the enclosing grouped property.
    pub group_by: bool,
    /// Keep traversal order instead of de-duplicating.
    pub ensure_order: bool,
    /// Key under which grouped rows collapse.
    pub grouped_instances: Option<String>,
    /// Value filter.
    pub property_filter: Option<ValueFilter>,
    /// Collapse of multi-valued leaves.
    pub single_item: Option<SingleValue>,
    pub(crate) alias_postfix: u32,
}

impl SpecProperty {
    /// Pre-order postfix, unique across the whole tree.
    pub fn alias_postfix(&self) -> u32 {
        self.alias_postfix
    }

    /// Statement alias: `<propertyName>_<postfix>`, sanitized.
    pub fn alias(&self) -> String {
        let base: String = self
            .property_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("{base}_{}", self.alias_postfix)
    }

    /// Key of this property in result objects.
    pub fn output_key(&self) -> String {
        Trusted::sanitize(&self.property_name).as_str().to_owned()
    }

    /// Alias used for the grouped variant of this property.
    pub fn group_alias(&self) -> String {
        format!("{}_grp", self.alias())
    }

    /// No nested properties.
    pub fn is_leaf(&self) -> bool {
        self.property.is_empty()
    }

    /// A plain attribute of the parent document.
    pub fn is_direct_child(&self) -> bool {
        self.is_leaf() && self.path.len() < 2
    }

    /// Children are spliced into the parent object.
    pub fn is_merge(&self) -> bool {
        self.path.is_empty() && !self.is_leaf()
    }

    /// Requires at least one edge hop.
    pub fn needs_traversal(&self) -> bool {
        !self.is_leaf() || self.path.len() > 1
    }

    /// Named grouping with at least one group key child.
    pub fn has_grouping(&self) -> bool {
        self.grouped_instances
            .as_deref()
            .is_some_and(|g| !g.is_empty())
            && self.property.iter().any(|p| p.group_by)
    }

    /// Group keys in the order groups are sorted by: keys marked `sort`
    /// first, then the remaining keys as declared.
    pub fn group_sort_keys(&self) -> Vec<&SpecProperty> {
        let (sorted, rest): (Vec<_>, Vec<_>) = self
            .property
            .iter()
            .filter(|c| c.group_by)
            .partition(|c| c.sort);
        sorted.into_iter().chain(rest).collect()
    }

    /// Non-key children marked `sort`; they order the members of a group.
    pub fn member_sort_keys(&self) -> Vec<&SpecProperty> {
        self.property
            .iter()
            .filter(|c| !c.group_by && c.sort)
            .collect()
    }

    /// Attribute read on the final hop of a leaf.
    pub fn leaf_path(&self) -> Option<&Traverse> {
        if self.is_leaf() {
            self.path.last()
        } else {
            None
        }
    }

    /// Edge hops, excluding the final attribute read of a leaf.
    pub fn edge_steps(&self) -> &[Traverse] {
        if self.is_leaf() {
            &self.path[..self.path.len().saturating_sub(1)]
        } else {
            &self.path
        }
    }

    /// Visits this node and all descendants in pre-order.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a SpecProperty)) {
        visit(self);
        for child in &self.property {
            child.walk(visit);
        }
    }
}

/// The root type of a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootType {
    /// Type URI.
    pub name: String,
}

impl RootType {
    /// Root type by URI.
    pub fn named(name: impl Into<String>) -> Self {
        RootType { name: name.into() }
    }
}

/// Normalized query tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Specification {
    /// Top-level properties.
    pub properties: Vec<SpecProperty>,
    /// Filter on the root document id applied before traversal.
    pub document_filter: Option<ValueFilter>,
    /// Root type.
    pub root_type: RootType,
    /// Prefix applied to output keys by the service layer.
    pub response_vocab: Option<String>,
}

impl Specification {
    /// Visits every property in pre-order.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a SpecProperty)) {
        for prop in &self.properties {
            prop.walk(visit);
        }
    }

    /// Every traversal hop name used by an edge step.
    pub fn edge_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.walk(&mut |p| {
            for step in p.edge_steps() {
                names.push(step.path_name.as_str());
            }
        });
        names
    }
}
