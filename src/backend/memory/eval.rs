//! Direct evaluation of a [`QueryPlan`] over [`StageData`].

use std::cmp::Ordering;
use std::collections::HashMap;

use regex::Regex;
use serde_json::{Map, Value};

use crate::backend::memory::{StageData, StoredDocument};
use crate::backend::{classify_backend_error, ERROR_QUERY_PARSE, ERROR_RESOURCE_LIMIT};
use crate::query::ast::{FilterOp, SingleValue};
use crate::query::plan::{QueryPlan, ResolvedFilter, RootSelection};
use crate::query::spec::{SpecProperty, Traverse};
use crate::types::{Result, Row};

/// Every root row matching the plan, sorted, without pagination.
pub(super) fn evaluate(data: &StageData, plan: &QueryPlan, memory_limit: Option<u64>) -> Result<Vec<Row>> {
    let mut evaluator = Evaluator::new(data, plan, memory_limit)?;
    evaluator.rows()
}

fn output_fields(props: &[SpecProperty]) -> Vec<&SpecProperty> {
    let mut fields = Vec::new();
    for p in props {
        if p.is_merge() {
            fields.extend(output_fields(&p.property));
        } else {
            fields.push(p);
        }
    }
    fields
}

/// Null, the empty string and the empty list.
fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn is_blank_field(value: &Value) -> bool {
    matches!(value, Value::Null) || matches!(value, Value::Array(items) if items.is_empty())
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: null < bool < number < string < array < object.
pub(super) fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(l, r)| compare_values(l, r))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => {
            Value::Object(x.clone()).to_string().cmp(&Value::Object(y.clone()).to_string())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Attribute lookup with the system attributes every document carries.
fn attribute(doc: &StoredDocument, key: &str) -> Value {
    if let Some(value) = doc.properties.get(key) {
        return value.clone();
    }
    match key {
        "@id" | "_key" => Value::String(doc.id.to_string()),
        "@type" => Value::Array(doc.types.iter().cloned().map(Value::String).collect()),
        "_id" => Value::String(format!("{}/{}", doc.space, doc.id)),
        "_space" => Value::String(doc.space.to_string()),
        "_label" => doc.label.clone().map(Value::String).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

struct Evaluator<'a> {
    data: &'a StageData,
    plan: &'a QueryPlan,
    regexes: HashMap<String, Regex>,
    memory_limit: Option<u64>,
    used: u64,
}

impl<'a> Evaluator<'a> {
    fn new(data: &'a StageData, plan: &'a QueryPlan, memory_limit: Option<u64>) -> Result<Self> {
        let mut regexes = HashMap::new();
        let filters = plan
            .property_filters
            .values()
            .chain(plan.document_filter.as_ref());
        for filter in filters {
            if let (FilterOp::Regex, Some(pattern)) = (filter.op, filter.value.as_deref()) {
                let regex = Regex::new(pattern).map_err(|err| {
                    classify_backend_error(
                        ERROR_QUERY_PARSE,
                        format!("invalid regular expression '{pattern}': {err}"),
                    )
                })?;
                regexes.insert(filter.bind_name.clone(), regex);
            }
        }
        Ok(Evaluator {
            data,
            plan,
            regexes,
            memory_limit,
            used: 0,
        })
    }

    fn charge(&mut self, value: &Value) -> Result<()> {
        let Some(limit) = self.memory_limit else {
            return Ok(());
        };
        self.used += serde_json::to_vec(value)?.len() as u64;
        if self.used > limit {
            return Err(classify_backend_error(
                ERROR_RESOURCE_LIMIT,
                format!("statement needs more than {limit} bytes"),
            ));
        }
        Ok(())
    }

    fn rows(&mut self) -> Result<Vec<Row>> {
        let plan = self.plan;
        let data = self.data;
        let candidates: Vec<&StoredDocument> = match &plan.root {
            RootSelection::Document(id) => data
                .get(&id.uuid)
                .filter(|d| d.space == id.space)
                .into_iter()
                .collect(),
            RootSelection::TypeScan { type_name } => data
                .documents
                .iter()
                .filter(|d| d.types.iter().any(|t| t == type_name))
                .collect(),
        };

        let mut rows = Vec::new();
        for doc in candidates {
            if !plan.visible(&doc.space, &doc.id) {
                continue;
            }
            if let Some(filter) = &plan.document_filter {
                if !self.matches(filter, &attribute(doc, "@id")) {
                    continue;
                }
            }
            if let Some(row) = self.object(doc, &plan.spec.properties)? {
                self.charge(&Value::Object(row.clone()))?;
                rows.push(row);
            }
        }

        let sort_keys: Vec<String> = output_fields(&plan.spec.properties)
            .into_iter()
            .filter(|p| p.sort)
            .map(SpecProperty::output_key)
            .collect();
        if !sort_keys.is_empty() {
            rows.sort_by(|a, b| compare_fields(a, b, &sort_keys));
        }
        Ok(rows)
    }

    /// Output object of `props` at `doc`, or `None` when a required property
    /// is empty or a filter rejects it.
    fn object(&mut self, doc: &StoredDocument, props: &[SpecProperty]) -> Result<Option<Row>> {
        let plan = self.plan;
        let mut row = Row::new();
        for p in output_fields(props) {
            let value = self.property(doc, p)?;
            if p.required && is_empty_value(&value) {
                return Ok(None);
            }
            if let Some(filter) = plan.filter_for(p) {
                if !self.matches(filter, &value) {
                    return Ok(None);
                }
            }
            row.insert(p.output_key(), value);
        }
        Ok(Some(row))
    }

    fn property(&mut self, doc: &StoredDocument, p: &SpecProperty) -> Result<Value> {
        if p.is_direct_child() {
            return Ok(p
                .leaf_path()
                .map(|leaf| attribute(doc, &leaf.path_name))
                .unwrap_or(Value::Null));
        }

        let mut frontier: Vec<&StoredDocument> = vec![doc];
        for step in p.edge_steps() {
            let mut next: Vec<&StoredDocument> = Vec::new();
            for current in &frontier {
                for target in self.neighbors(current, step, p.ensure_order) {
                    if p.ensure_order || !next.iter().any(|n| n.id == target.id) {
                        next.push(target);
                    }
                }
            }
            frontier = next;
        }

        let mut values = Vec::new();
        match p.leaf_path() {
            Some(leaf) => {
                for target in frontier {
                    match attribute(target, &leaf.path_name) {
                        Value::Null => {}
                        Value::Array(items) => values.extend(items),
                        value => values.push(value),
                    }
                }
            }
            None => {
                for target in frontier {
                    if let Some(obj) = self.object(target, &p.property)? {
                        if !obj.values().all(is_blank_field) {
                            values.push(Value::Object(obj));
                        }
                    }
                }
            }
        }
        if !p.ensure_order {
            let mut unique: Vec<Value> = Vec::with_capacity(values.len());
            for value in values {
                if !unique.contains(&value) {
                    unique.push(value);
                }
            }
            values = unique;
        }
        if p.sort {
            values.sort_by(compare_values);
        }
        if p.has_grouping() {
            values = group(values, p);
        }
        let collected = Value::Array(values);
        self.charge(&collected)?;
        let Value::Array(values) = collected else {
            return Ok(Value::Null);
        };

        Ok(match p.single_item {
            Some(SingleValue::First) => values.into_iter().next().unwrap_or(Value::Null),
            Some(SingleValue::Concat) => Value::String(
                values
                    .iter()
                    .filter(|v| !v.is_null())
                    .map(display)
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            None => Value::Array(values),
        })
    }

    fn neighbors(&self, doc: &StoredDocument, step: &Traverse, ordered: bool) -> Vec<&'a StoredDocument> {
        if !self.plan.edge_exists(step) {
            return Vec::new();
        }
        let mut edges: Vec<_> = self
            .data
            .edges
            .iter()
            .filter(|e| e.relation == step.path_name)
            .filter(|e| if step.reverse { e.to == doc.id } else { e.from == doc.id })
            .collect();
        if ordered {
            edges.sort_by_key(|e| e.order);
        }
        edges
            .into_iter()
            .filter_map(|e| self.data.get(if step.reverse { &e.from } else { &e.to }))
            .filter(|target| self.plan.visible(&target.space, &target.id))
            .filter(|target| {
                step.type_filter.is_empty()
                    || target.types.iter().any(|t| step.type_filter.contains(t))
            })
            .collect()
    }

    fn matches(&self, filter: &ResolvedFilter, value: &Value) -> bool {
        if filter.op == FilterOp::IsEmpty {
            return is_empty_value(value);
        }
        let Some(operand) = filter.value.as_deref() else {
            return true;
        };
        match value {
            Value::Array(items) => items.iter().any(|item| self.matches_scalar(filter, operand, item)),
            scalar => self.matches_scalar(filter, operand, scalar),
        }
    }

    fn matches_scalar(&self, filter: &ResolvedFilter, operand: &str, value: &Value) -> bool {
        if value.is_null() {
            return false;
        }
        if filter.op == FilterOp::Equals {
            return value.as_str() == Some(operand);
        }
        let text = display(value);
        match filter.op {
            FilterOp::StartsWith => text.starts_with(operand),
            FilterOp::EndsWith => text.ends_with(operand),
            FilterOp::Contains => text.contains(operand),
            FilterOp::Regex => self
                .regexes
                .get(&filter.bind_name)
                .is_some_and(|re| re.is_match(&text)),
            FilterOp::Equals | FilterOp::IsEmpty => false,
        }
    }
}

/// Collapses objects sharing the group-key fields into one object holding
/// the remaining fields under the grouped-instances key.
fn group(values: Vec<Value>, p: &SpecProperty) -> Vec<Value> {
    let keys: Vec<String> = p
        .property
        .iter()
        .filter(|c| c.group_by)
        .map(SpecProperty::output_key)
        .collect();
    let instances_key = p.grouped_instances.clone().unwrap_or_default();
    let mut groups: Vec<(Map<String, Value>, Vec<Value>)> = Vec::new();
    for value in values {
        let Value::Object(mut obj) = value else {
            continue;
        };
        let key: Map<String, Value> = keys
            .iter()
            .map(|k| (k.clone(), obj.remove(k).unwrap_or(Value::Null)))
            .collect();
        match groups.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, members)) => members.push(Value::Object(obj)),
            None => groups.push((key, vec![Value::Object(obj)])),
        }
    }
    let group_order: Vec<String> = p
        .group_sort_keys()
        .into_iter()
        .map(SpecProperty::output_key)
        .collect();
    let member_order: Vec<String> = p
        .member_sort_keys()
        .into_iter()
        .map(SpecProperty::output_key)
        .collect();
    groups.sort_by(|(a, _), (b, _)| compare_fields(a, b, &group_order));
    groups
        .into_iter()
        .map(|(mut key, mut members)| {
            if !member_order.is_empty() {
                members.sort_by(|a, b| match (a, b) {
                    (Value::Object(a), Value::Object(b)) => compare_fields(a, b, &member_order),
                    _ => Ordering::Equal,
                });
            }
            key.insert(instances_key.clone(), Value::Array(members));
            Value::Object(key)
        })
        .collect()
}

/// Lexicographic comparison of two objects over `keys`.
fn compare_fields(a: &Map<String, Value>, b: &Map<String, Value>, keys: &[String]) -> Ordering {
    keys.iter()
        .map(|k| {
            compare_values(
                a.get(k).unwrap_or(&Value::Null),
                b.get(k).unwrap_or(&Value::Null),
            )
        })
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}
