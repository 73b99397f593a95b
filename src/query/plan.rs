#![forbid(unsafe_code)]

//! Dialect-neutral query plan.
//!
//! Planning resolves everything that depends on request inputs (filter
//! values, restrictions, pagination, existing edge collections) so renderers
//! and the in-memory evaluator only walk the tree.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use uuid::Uuid;

use crate::access::AccessFilter;
use crate::query::ast::{FilterOp, ValueFilter};
use crate::query::compiler::CompileRequest;
use crate::query::spec::{SpecProperty, Specification, Traverse};
use crate::query::trusted::Trusted;
use crate::query::PaginationParam;
use crate::types::{CollectionRef, InstanceId, SpaceName, Stage};

/// How root documents are selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootSelection {
    /// Every instance carrying the root type.
    TypeScan {
        /// Root type URI.
        type_name: String,
    },
    /// A single instance looked up by key.
    Document(InstanceId),
}

/// A value filter with its operand resolved against runtime values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFilter {
    /// Comparison.
    pub op: FilterOp,
    /// Operand; `None` when neither a runtime value nor a literal was given.
    pub value: Option<String>,
    /// Name the operand is bound under.
    pub bind_name: String,
}

impl ResolvedFilter {
    /// Resolves `filter`, preferring the runtime value named by its parameter.
    ///
    /// Blank operands count as absent.
    pub fn resolve(
        filter: &ValueFilter,
        filter_values: &BTreeMap<String, String>,
        default_name: String,
    ) -> Self {
        let runtime = filter
            .parameter
            .as_ref()
            .and_then(|param| filter_values.get(param));
        let value = runtime
            .or(filter.value.as_ref())
            .filter(|v| !v.trim().is_empty())
            .cloned();
        let bind_name = filter
            .parameter
            .as_deref()
            .map(Trusted::sanitize)
            .filter(|p| !p.is_empty())
            .map(|p| format!("{p}_{default_name}"))
            .unwrap_or(default_name);
        ResolvedFilter {
            op: filter.op,
            value,
            bind_name,
        }
    }

    /// Whether the filter constrains anything.
    pub fn is_active(&self) -> bool {
        self.op == FilterOp::IsEmpty || self.value.is_some()
    }

    /// Operand as bound into an AQL `LIKE` comparison.
    pub fn like_pattern(&self) -> Option<String> {
        let value = self.value.as_deref()?;
        let escaped = value.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        Some(match self.op {
            FilterOp::StartsWith => format!("{escaped}%"),
            FilterOp::EndsWith => format!("%{escaped}"),
            FilterOp::Contains => format!("%{escaped}%"),
            _ => value.to_owned(),
        })
    }
}

/// Everything a renderer or evaluator needs to produce one statement.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    /// Normalized query tree.
    pub spec: Arc<Specification>,
    /// Stage the statement runs against.
    pub stage: Stage,
    /// Root selection.
    pub root: RootSelection,
    /// Read filter; `None` when unrestricted.
    pub access: Option<AccessFilter>,
    /// Spaces every visited document must live in.
    pub space_restriction: Option<BTreeSet<SpaceName>>,
    /// Filter on the root document id.
    pub document_filter: Option<ResolvedFilter>,
    /// Active property filters keyed by alias postfix.
    pub property_filters: BTreeMap<u32, ResolvedFilter>,
    /// Edge names with no backing collection.
    pub missing_edges: BTreeSet<String>,
    /// Requested page.
    pub pagination: Option<PaginationParam>,
    /// Project only the row count.
    pub count_only: bool,
}

impl QueryPlan {
    /// Plans `spec` for a request.
    ///
    /// An id restriction replaces the type scan and drops page size and
    /// total, since at most one root can match.
    pub fn build(spec: Arc<Specification>, request: &CompileRequest) -> Self {
        let root = match &request.id_restriction {
            Some(id) => RootSelection::Document(id.clone()),
            None => RootSelection::TypeScan {
                type_name: spec.root_type.name.clone(),
            },
        };
        let pagination = request.pagination.map(|p| {
            if request.id_restriction.is_some() {
                PaginationParam {
                    from: p.from,
                    size: None,
                    return_total: false,
                }
            } else {
                p
            }
        });

        let mut property_filters = BTreeMap::new();
        spec.walk(&mut |p: &SpecProperty| {
            if let Some(filter) = &p.property_filter {
                let resolved = ResolvedFilter::resolve(
                    filter,
                    &request.filter_values,
                    format!("staticFilter{}", p.alias_postfix()),
                );
                if resolved.is_active() {
                    property_filters.insert(p.alias_postfix(), resolved);
                }
            }
        });
        let document_filter = spec
            .document_filter
            .as_ref()
            .map(|f| ResolvedFilter::resolve(f, &request.filter_values, "documentFilter".into()))
            .filter(ResolvedFilter::is_active);

        let missing_edges = match &request.known_collections {
            Some(known) => spec
                .edge_names()
                .into_iter()
                .filter(|name| !known.contains(&CollectionRef::for_relation(name)))
                .map(str::to_owned)
                .collect(),
            None => BTreeSet::new(),
        };

        QueryPlan {
            root,
            stage: request.stage,
            access: request.access_filter.clone(),
            space_restriction: request
                .space_restriction
                .as_ref()
                .filter(|s| !s.is_empty())
                .map(|s| s.iter().cloned().collect()),
            document_filter,
            property_filters,
            missing_edges,
            pagination,
            count_only: false,
            spec,
        }
    }

    /// Same filtering, projecting only the number of matching roots.
    pub fn as_count(&self) -> QueryPlan {
        QueryPlan {
            pagination: None,
            count_only: true,
            ..self.clone()
        }
    }

    /// Active filter of a property.
    pub fn filter_for(&self, property: &SpecProperty) -> Option<&ResolvedFilter> {
        self.property_filters.get(&property.alias_postfix())
    }

    /// Whether the edge of a hop has a backing collection.
    pub fn edge_exists(&self, step: &Traverse) -> bool {
        !self.missing_edges.contains(&step.path_name)
    }

    /// Whether a document in `space` with `id` passes access and space
    /// restrictions.
    pub fn visible(&self, space: &SpaceName, id: &Uuid) -> bool {
        let accessible = self.access.as_ref().map_or(true, |a| a.permits(space, id));
        let in_restriction = self
            .space_restriction
            .as_ref()
            .map_or(true, |s| s.contains(space));
        accessible && in_restriction
    }
}
