#![forbid(unsafe_code)]

//! Namespace discovery and prefix rewriting on declarative specifications.

use std::collections::{BTreeMap, BTreeSet};

use crate::query::ast::{OneOrMany, PathStepRepr, QuerySpecification, StructureItem};

/// Returns the part of `uri` before its last `/`, if there is one.
pub fn namespace_of(uri: &str) -> Option<&str> {
    uri.rfind('/').map(|idx| &uri[..idx]).filter(|ns| !ns.is_empty())
}

impl QuerySpecification {
    /// Every namespace referenced by the root type, a path step or a type filter.
    pub fn extract_property_and_type_namespaces(&self) -> BTreeSet<String> {
        let mut namespaces = BTreeSet::new();
        let mut record = |uri: &str| {
            if let Some(ns) = namespace_of(uri) {
                namespaces.insert(ns.to_owned());
            }
        };
        if let Some(ty) = self.meta.as_ref().and_then(|m| m.root_type.as_ref()) {
            record(ty.id());
        }
        for item in self.items() {
            visit_item(item, &mut |uri| record(uri));
        }
        namespaces
    }

    /// Rewrites `namespace/` to its mapped prefix in the root type, path
    /// steps and type filters.
    pub fn apply_prefix_map(&mut self, prefixes: &BTreeMap<String, String>) {
        let rewrite = |uri: &mut String| {
            for (namespace, prefix) in prefixes {
                let full = format!("{namespace}/");
                if let Some(rest) = uri.strip_prefix(&full) {
                    *uri = format!("{prefix}{rest}");
                    return;
                }
            }
        };
        if let Some(ty) = self.meta.as_mut().and_then(|m| m.root_type.as_mut()) {
            rewrite(ty.id_mut());
        }
        if let Some(structure) = self.structure.as_mut() {
            for item in structure.as_mut_slice() {
                visit_item_mut(item, &rewrite);
            }
        }
    }
}

fn visit_item(item: &StructureItem, record: &mut dyn FnMut(&str)) {
    if let Some(path) = &item.path {
        for step in path.as_slice() {
            match step {
                PathStepRepr::Bare(id) => record(id),
                PathStepRepr::Object(obj) => {
                    record(&obj.id);
                    if let Some(filter) = &obj.type_filter {
                        for ty in filter.as_slice() {
                            record(ty.id());
                        }
                    }
                }
            }
        }
    }
    if let Some(children) = &item.structure {
        for child in children.as_slice() {
            visit_item(child, record);
        }
    }
}

fn visit_item_mut(item: &mut StructureItem, rewrite: &dyn Fn(&mut String)) {
    if let Some(path) = item.path.as_mut() {
        for step in path.as_mut_slice() {
            match step {
                PathStepRepr::Bare(id) => rewrite(id),
                PathStepRepr::Object(obj) => {
                    rewrite(&mut obj.id);
                    if let Some(filter) = obj.type_filter.as_mut() {
                        for ty in filter.as_mut_slice() {
                            rewrite(ty.id_mut());
                        }
                    }
                }
            }
        }
    }
    if let Some(children) = item.structure.as_mut() {
        for child in OneOrMany::as_mut_slice(children) {
            visit_item_mut(child, rewrite);
        }
    }
}
