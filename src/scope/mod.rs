#![forbid(unsafe_code)]

//! Scope computation.
//!
//! The scope of an instance is the tree of instances reachable through the
//! scope queries declared for its types. Each query runs restricted to one
//! instance with the access filter suppressed; its `dependency_*` columns
//! hold nested rows that become child elements. Every discovered element is
//! expanded in turn through the queries of its own types. An instance joins
//! the tree at most once, which keeps cyclic graphs finite.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::query::ast::QuerySpecification;
use crate::query::compiler::CompileRequest;
use crate::service::QueryPipeline;
use crate::types::{InstanceId, Result, Row, SpaceName, Stage};

mod element;

pub use element::ScopeElement;
use element::merge_same_level;

/// Column prefix of nested dependency rows.
pub const DEPENDENCY_PREFIX: &str = "dependency_";

/// What the catalog knows about one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSummary {
    /// Instance uuid.
    pub id: Uuid,
    /// Owning space.
    pub space: SpaceName,
    /// Type URIs.
    pub types: Vec<String>,
    /// Display label.
    pub label: Option<String>,
}

/// A scope query together with the space it is stored in.
#[derive(Debug, Clone)]
pub struct RegisteredQuery {
    /// Space holding the query.
    pub space: SpaceName,
    /// Declarative query.
    pub specification: QuerySpecification,
}

/// Instance and type metadata consumed by the scope engine.
pub trait InstanceCatalog: Send + Sync {
    /// Looks up an instance in `stage`.
    fn instance(&self, stage: Stage, id: Uuid) -> Result<Option<InstanceSummary>>;

    /// Scope queries declared for `type_name`.
    fn scope_queries(&self, type_name: &str) -> Result<Vec<RegisteredQuery>>;

    /// Spaces whose scope queries are taken into account.
    fn scope_relevant_spaces(&self) -> Result<BTreeSet<SpaceName>>;

    /// Whether instances of `type_name` may be left out of scopes.
    fn can_be_excluded_from_scope(&self, type_name: &str) -> Result<bool>;

    /// Display labels of `ids` in `stage`; ids without a label are absent.
    fn labels(&self, stage: Stage, ids: &BTreeSet<Uuid>) -> Result<BTreeMap<Uuid, String>>;
}

/// Scope computation switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeOptions {
    /// Resolve display labels for every element without one.
    pub apply_labels: bool,
    /// Leave out instances of excludable types, hoisting their dependencies.
    pub apply_restrictions: bool,
}

/// Computes scope trees.
pub struct ScopeEngine {
    catalog: Arc<dyn InstanceCatalog>,
    pipeline: Arc<QueryPipeline>,
    parallel: bool,
    relevant_spaces: Option<BTreeSet<SpaceName>>,
}

impl fmt::Debug for ScopeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeEngine")
            .field("parallel", &self.parallel)
            .field("relevant_spaces", &self.relevant_spaces)
            .finish_non_exhaustive()
    }
}

struct Walk {
    stage: Stage,
    options: ScopeOptions,
    relevant: BTreeSet<SpaceName>,
    visited: HashSet<Uuid>,
}

impl ScopeEngine {
    /// Engine running scope queries through `pipeline`.
    pub fn new(catalog: Arc<dyn InstanceCatalog>, pipeline: Arc<QueryPipeline>) -> Self {
        ScopeEngine {
            catalog,
            pipeline,
            parallel: true,
            relevant_spaces: None,
        }
    }

    /// Runs the scope queries of one instance concurrently when set.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Overrides the catalog's scope-relevant spaces.
    pub fn with_relevant_spaces(mut self, spaces: Option<BTreeSet<SpaceName>>) -> Self {
        self.relevant_spaces = spaces;
        self
    }

    /// Scope tree of instance `id` in `space`.
    ///
    /// Returns `None` when the instance does not exist in `stage` or lives in
    /// another space. An instance without scope queries yields a single
    /// element.
    pub fn get_scope_for_instance(
        &self,
        space: &SpaceName,
        id: Uuid,
        stage: Stage,
        options: ScopeOptions,
    ) -> Result<Option<ScopeElement>> {
        let Some(instance) = self.catalog.instance(stage, id)? else {
            debug!(%id, %stage, "scope.instance.missing");
            return Ok(None);
        };
        if &instance.space != space {
            debug!(%id, requested = %space, actual = %instance.space, "scope.instance.space_mismatch");
            return Ok(None);
        }
        let relevant = match &self.relevant_spaces {
            Some(spaces) => spaces.clone(),
            None => self.catalog.scope_relevant_spaces()?,
        };
        let mut walk = Walk {
            stage,
            options,
            relevant,
            visited: HashSet::from([id]),
        };

        let rows = self.scope_rows(id, &instance.space, &instance.types, &walk)?;
        let mut elements = Vec::new();
        for row in &rows {
            elements.extend(self.elements_from_row(row, &instance.types, true, &walk)?);
        }
        let mut merged = merge_same_level(elements);
        let mut root = match merged.iter().position(|e| e.id == id) {
            Some(i) => merged.swap_remove(i),
            None => summary_element(&instance),
        };
        root.children = root
            .children
            .take()
            .map(|children| claim(children, &mut walk.visited))
            .filter(|c| !c.is_empty());
        if let Some(children) = root.children.as_mut() {
            self.expand(children, &mut walk)?;
        }
        if options.apply_labels {
            self.apply_labels(&mut root, stage)?;
        }
        info!(
            %id,
            %stage,
            elements = walk.visited.len(),
            types = root.by_type().len(),
            "scope.compute.complete"
        );
        Ok(Some(root))
    }

    fn expand(&self, elements: &mut [ScopeElement], walk: &mut Walk) -> Result<()> {
        for element in elements.iter_mut() {
            let discovered = self.dependencies_of(element, walk)?;
            let claimed = claim(discovered, &mut walk.visited);
            element.add_children(claimed);
            if let Some(children) = element.children.as_mut() {
                self.expand(children, walk)?;
            }
        }
        Ok(())
    }

    /// Children the scope queries of `element`'s own types report for it.
    fn dependencies_of(&self, element: &ScopeElement, walk: &Walk) -> Result<Vec<ScopeElement>> {
        let space = match &element.space {
            Some(space) => space.clone(),
            None => match self.catalog.instance(walk.stage, element.id)? {
                Some(instance) => instance.space,
                None => return Ok(Vec::new()),
            },
        };
        let rows = self.scope_rows(element.id, &space, &element.types, walk)?;
        let mut found = Vec::new();
        for row in &rows {
            found.extend(self.elements_from_row(row, &element.types, true, walk)?);
        }
        Ok(merge_same_level(found)
            .into_iter()
            .filter(|e| e.id == element.id)
            .flat_map(|e| e.children.unwrap_or_default())
            .collect())
    }

    fn scope_rows(&self, id: Uuid, space: &SpaceName, types: &[String], walk: &Walk) -> Result<Vec<Row>> {
        let mut queries = Vec::new();
        for ty in types {
            queries.extend(
                self.catalog
                    .scope_queries(ty)?
                    .into_iter()
                    .filter(|q| walk.relevant.contains(&q.space)),
            );
        }
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        let stage = walk.stage;
        let run = |query: &RegisteredQuery| -> Result<Vec<Row>> {
            let request =
                CompileRequest::new(stage).restrict_to_instance(InstanceId::new(id, space.clone()));
            Ok(self.pipeline.run(&query.specification, request)?.into_page()?.data)
        };
        let results: Vec<Vec<Row>> = if self.parallel && queries.len() > 1 {
            queries.par_iter().map(&run).collect::<Result<_>>()?
        } else {
            queries.iter().map(&run).collect::<Result<_>>()?
        };
        debug!(%id, queries = queries.len(), "scope.queries.executed");
        Ok(results.into_iter().flatten().collect())
    }

    /// Elements a result row stands for.
    ///
    /// Usually one, but an excluded instance yields its dependencies instead.
    fn elements_from_row(
        &self,
        row: &Row,
        root_types: &[String],
        is_root: bool,
        walk: &Walk,
    ) -> Result<Vec<ScopeElement>> {
        if row.get("embedded").and_then(Value::as_bool) == Some(true) {
            return Ok(Vec::new());
        }
        let types = string_list(row.get("type"));
        if !is_root && types.iter().any(|t| root_types.contains(t)) {
            return Ok(Vec::new());
        }
        let restricted = walk.options.apply_restrictions && self.is_excludable(&types)?;

        let mut children = Vec::new();
        if !(is_root && restricted) {
            for (_, value) in row.iter().filter(|(k, _)| k.starts_with(DEPENDENCY_PREFIX)) {
                for nested in objects(value) {
                    for child in self.elements_from_row(nested, root_types, false, walk)? {
                        if !children.contains(&child) {
                            children.push(child);
                        }
                    }
                }
            }
        }
        if !is_root && restricted {
            return Ok(children);
        }

        let raw_id = row.get("id").and_then(Value::as_str);
        let Some(id) = raw_id.and_then(parse_instance_uuid) else {
            warn!(id = ?raw_id, "scope.row.invalid_id");
            return Ok(Vec::new());
        };
        let mut element = ScopeElement::new(id, types);
        element.label = row.get("label").and_then(Value::as_str).map(str::to_owned);
        element.internal_reference = row.get("internalId").and_then(Value::as_str).map(str::to_owned);
        element.space = row.get("space").and_then(Value::as_str).map(SpaceName::from);
        element.add_children(children);
        Ok(vec![element])
    }

    fn is_excludable(&self, types: &[String]) -> Result<bool> {
        for ty in types {
            if self.catalog.can_be_excluded_from_scope(ty)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn apply_labels(&self, root: &mut ScopeElement, stage: Stage) -> Result<()> {
        let mut missing = BTreeSet::new();
        root.visit(&mut |e| {
            if e.label.is_none() {
                missing.insert(e.id);
            }
        });
        if missing.is_empty() {
            return Ok(());
        }
        let labels = self.catalog.labels(stage, &missing)?;
        root.visit_mut(&mut |e| {
            if e.label.is_none() {
                e.label = labels.get(&e.id).cloned();
            }
        });
        Ok(())
    }
}

fn summary_element(instance: &InstanceSummary) -> ScopeElement {
    let mut element = ScopeElement::new(instance.id, instance.types.clone());
    element.label = instance.label.clone();
    element.internal_reference = Some(InstanceId::new(instance.id, instance.space.clone()).to_string());
    element.space = Some(instance.space.clone());
    element
}

/// Keeps only elements not yet in the tree, marking them as seen.
fn claim(elements: Vec<ScopeElement>, visited: &mut HashSet<Uuid>) -> Vec<ScopeElement> {
    elements
        .into_iter()
        .filter_map(|mut element| {
            if !visited.insert(element.id) {
                return None;
            }
            element.children = element
                .children
                .take()
                .map(|children| claim(children, visited))
                .filter(|c| !c.is_empty());
            Some(element)
        })
        .collect()
}

/// Accepts a bare uuid or an id URI ending in one.
fn parse_instance_uuid(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw)
        .ok()
        .or_else(|| raw.rsplit('/').next().and_then(|tail| Uuid::parse_str(tail).ok()))
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        _ => Vec::new(),
    }
}

fn objects(value: &Value) -> Vec<&Row> {
    match value {
        Value::Object(obj) => vec![obj],
        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
        _ => Vec::new(),
    }
}
