#![forbid(unsafe_code)]

//! Scope tree nodes and same-level merging.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::SpaceName;

/// One node of a scope tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeElement {
    /// Instance uuid.
    pub id: Uuid,
    /// Type URIs.
    pub types: Vec<String>,
    /// Display label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Dependencies; `None` rather than empty when there are none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<ScopeElement>>,
    /// Backend-internal document reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_reference: Option<String>,
    /// Owning space.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space: Option<SpaceName>,
}

impl ScopeElement {
    /// A leaf element.
    pub fn new(id: Uuid, types: Vec<String>) -> Self {
        ScopeElement {
            id,
            types,
            label: None,
            children: None,
            internal_reference: None,
            space: None,
        }
    }

    /// Ids of this element and all descendants.
    pub fn collect_ids(&self) -> BTreeSet<Uuid> {
        let mut ids = BTreeSet::new();
        self.visit(&mut |e| {
            ids.insert(e.id);
        });
        ids
    }

    /// Ids of the tree grouped by type; an element with several types is
    /// listed under each.
    pub fn by_type(&self) -> BTreeMap<String, BTreeSet<Uuid>> {
        let mut index: BTreeMap<String, BTreeSet<Uuid>> = BTreeMap::new();
        self.visit(&mut |e| {
            for ty in &e.types {
                index.entry(ty.clone()).or_default().insert(e.id);
            }
        });
        index
    }

    /// Visits this element and its descendants in pre-order.
    pub fn visit(&self, f: &mut dyn FnMut(&ScopeElement)) {
        f(self);
        for child in self.children.iter().flatten() {
            child.visit(f);
        }
    }

    pub(crate) fn visit_mut(&mut self, f: &mut dyn FnMut(&mut ScopeElement)) {
        f(self);
        for child in self.children.iter_mut().flatten() {
            child.visit_mut(f);
        }
    }

    /// Absorbs `other`: types and children are unioned, missing attributes
    /// are taken over.
    pub fn merge(&mut self, other: ScopeElement) {
        for ty in other.types {
            if !self.types.contains(&ty) {
                self.types.push(ty);
            }
        }
        self.label = self.label.take().or(other.label);
        self.internal_reference = self.internal_reference.take().or(other.internal_reference);
        self.space = self.space.take().or(other.space);
        self.add_children(other.children.unwrap_or_default());
    }

    pub(crate) fn add_children(&mut self, children: Vec<ScopeElement>) {
        if children.is_empty() {
            return;
        }
        self.children.get_or_insert_with(Vec::new).extend(children);
    }
}

/// Merges elements sharing an id on every level of the tree, keeping
/// first-seen order.
pub(crate) fn merge_same_level(elements: Vec<ScopeElement>) -> Vec<ScopeElement> {
    let mut merged: Vec<ScopeElement> = Vec::with_capacity(elements.len());
    for element in elements {
        match merged.iter_mut().find(|e| e.id == element.id) {
            Some(existing) => existing.merge(element),
            None => merged.push(element),
        }
    }
    for element in &mut merged {
        element.children = element
            .children
            .take()
            .map(merge_same_level)
            .filter(|c| !c.is_empty());
    }
    merged
}
