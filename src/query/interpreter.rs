#![forbid(unsafe_code)]

//! Converts a declarative [`QuerySpecification`] into a [`Specification`].

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::query::ast::{normalize_path, IdRef, QuerySpecification, StructureItem};
use crate::query::spec::{RootType, SpecProperty, Specification, Traverse};
use crate::types::{KgError, Result};

/// Stateless interpreter.
///
/// Alias postfixes come from a counter passed down the recursion, so one
/// interpreter can serve concurrent callers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpecificationInterpreter;

impl SpecificationInterpreter {
    /// Creates an interpreter.
    pub fn new() -> Self {
        SpecificationInterpreter
    }

    /// Validates and interprets a raw JSON payload.
    pub fn read_json(&self, payload: &Value) -> Result<Specification> {
        let query = QuerySpecification::from_value(payload)?;
        self.interpret(&query)
    }

    /// Interprets an already parsed specification.
    pub fn interpret(&self, query: &QuerySpecification) -> Result<Specification> {
        query.validate()?;
        let meta = query
            .meta
            .as_ref()
            .ok_or_else(|| KgError::validation("The query provided is missing a value for meta"))?;
        let root_type = meta
            .root_type
            .as_ref()
            .map(IdRef::id)
            .ok_or_else(|| KgError::validation("The query provided is missing type in meta"))?;
        let vocab = meta.response_vocab.as_deref().filter(|v| !v.is_empty());

        let mut next_postfix = 0u32;
        let properties = interpret_items(query.items(), vocab, &mut next_postfix)?;
        check_output_keys(&properties)?;
        debug!(
            root_type,
            properties = next_postfix,
            "interpreter.interpret.complete"
        );
        Ok(Specification {
            properties,
            document_filter: meta.filter.clone(),
            root_type: RootType::named(root_type),
            response_vocab: vocab.map(str::to_owned),
        })
    }
}

fn interpret_items(
    items: &[StructureItem],
    vocab: Option<&str>,
    next_postfix: &mut u32,
) -> Result<Vec<SpecProperty>> {
    items
        .iter()
        .map(|item| interpret_item(item, vocab, next_postfix))
        .collect()
}

fn interpret_item(
    item: &StructureItem,
    vocab: Option<&str>,
    next_postfix: &mut u32,
) -> Result<SpecProperty> {
    let property_name = strip_vocab(item.property_name.id(), vocab);
    if property_name.trim().is_empty() {
        return Err(KgError::validation(
            "The query provided contains a structure item without propertyName",
        ));
    }
    let alias_postfix = *next_postfix;
    *next_postfix += 1;

    let path = normalize_path(item.path.as_ref())
        .into_iter()
        .map(|step| Traverse {
            path_name: step.id,
            reverse: step.reverse,
            type_filter: step.type_filter,
        })
        .collect();
    let children = item
        .structure
        .as_ref()
        .map(|s| s.as_slice())
        .unwrap_or(&[]);
    let property = interpret_items(children, vocab, next_postfix)?;

    Ok(SpecProperty {
        property_name,
        path,
        property,
        required: item.required,
        sort: item.sort,
        group_by: item.group_by,
        ensure_order: item.ensure_order,
        grouped_instances: item.grouped_instances.clone(),
        property_filter: item.filter.clone(),
        single_item: item.single_value,
        alias_postfix,
    })
}

/// Every object level needs distinct, non-empty output keys. Merge nodes
/// splice their children into the enclosing level.
fn check_output_keys(props: &[SpecProperty]) -> Result<()> {
    let mut seen: BTreeMap<String, &str> = BTreeMap::new();
    let mut level = Vec::new();
    collect_level(props, &mut level);
    for p in level {
        let key = p.output_key();
        if key.is_empty() {
            return Err(KgError::validation(format!(
                "The query provided contains propertyName '{}' without a usable output key",
                p.property_name
            )));
        }
        if let Some(first) = seen.insert(key.clone(), &p.property_name) {
            return Err(KgError::validation(format!(
                "The query provided maps propertyName '{first}' and '{}' to the same key '{key}'",
                p.property_name
            )));
        }
        if !p.is_leaf() {
            check_output_keys(&p.property)?;
        }
    }
    Ok(())
}

fn collect_level<'a>(props: &'a [SpecProperty], level: &mut Vec<&'a SpecProperty>) {
    for p in props {
        if p.is_merge() {
            collect_level(&p.property, level);
        } else {
            level.push(p);
        }
    }
}

fn strip_vocab(name: &str, vocab: Option<&str>) -> String {
    match vocab {
        Some(vocab) => name.strip_prefix(vocab).unwrap_or(name).to_owned(),
        None => name.to_owned(),
    }
}
