#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use kgquery::query::{CompileRequest, Dialect, QueryCompiler, SpecificationInterpreter};
use kgquery::types::{KgError, Stage};
use proptest::prelude::*;
use serde_json::{json, Value};

fn arb_filter() -> impl Strategy<Value = Option<Value>> {
    prop_oneof![
        3 => Just(None),
        1 => ("[a-z ]{0,6}", prop_oneof![Just("CONTAINS"), Just("EQUALS"), Just("STARTS_WITH"), Just("REGEX")])
            .prop_map(|(value, op)| Some(json!({"op": op, "value": format!("'\u{2603}{value}")}))),
    ]
}

fn arb_leaf() -> impl Strategy<Value = Value> {
    ("[a-z]{1,6}", "[a-z]{1,6}", arb_filter(), any::<bool>()).prop_map(|(name, path, filter, sort)| {
        let mut item = json!({"propertyName": name, "path": path, "sort": sort});
        if let Some(filter) = filter {
            item["filter"] = filter;
        }
        item
    })
}

fn arb_item() -> impl Strategy<Value = Value> {
    arb_leaf().prop_recursive(3, 24, 4, |inner| {
        (
            "[a-z]{1,6}",
            prop::collection::vec("[a-z]{1,6}", 0..3),
            prop::collection::vec(inner, 1..4),
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(name, path, structure, required, reverse)| {
                let path: Vec<Value> = path
                    .into_iter()
                    .map(|step| json!({"@id": step, "reverse": reverse}))
                    .collect();
                json!({
                    "propertyName": name,
                    "path": path,
                    "structure": structure,
                    "required": required
                })
            })
    })
}

/// Suffixes every property name with a running number so no two output
/// keys collide, whatever the nesting.
fn number_names(items: &mut [Value], next: &mut usize) {
    for item in items {
        if let Some(name) = item["propertyName"].as_str() {
            item["propertyName"] = json!(format!("{name}{next}"));
            *next += 1;
        }
        if let Some(children) = item.get_mut("structure").and_then(Value::as_array_mut) {
            number_names(children, next);
        }
    }
}

fn arb_query() -> impl Strategy<Value = Value> {
    prop::collection::vec(arb_item(), 1..5).prop_map(|mut structure| {
        number_names(&mut structure, &mut 0);
        json!({"meta": {"type": "Thing"}, "structure": structure})
    })
}

fn count_items(value: &Value) -> usize {
    value
        .get("structure")
        .and_then(Value::as_array)
        .map(|items| items.iter().map(|item| 1 + count_items(item)).sum())
        .unwrap_or(0)
}

fn sigil(dialect: Dialect) -> char {
    match dialect {
        Dialect::Aql => '@',
        Dialect::Cypher => '$',
    }
}

proptest! {
    #[test]
    fn alias_postfixes_are_unique_across_the_tree(query in arb_query()) {
        let spec = SpecificationInterpreter::new().read_json(&query).expect("interprets");
        let mut postfixes = HashSet::new();
        let mut aliases = HashSet::new();
        let mut nodes = 0;
        spec.walk(&mut |p| {
            nodes += 1;
            postfixes.insert(p.alias_postfix());
            aliases.insert(p.alias());
        });
        prop_assert_eq!(nodes, count_items(&query));
        prop_assert_eq!(postfixes.len(), nodes);
        prop_assert_eq!(aliases.len(), nodes);
    }

    #[test]
    fn compilation_is_deterministic(query in arb_query()) {
        for dialect in [Dialect::Aql, Dialect::Cypher] {
            let compiler = QueryCompiler::new(dialect);
            let compile = || {
                let spec = SpecificationInterpreter::new().read_json(&query).expect("interprets");
                compiler
                    .compile(Arc::new(spec), &CompileRequest::new(Stage::InProgress))
                    .expect("compiles")
            };
            let (first, second) = (compile(), compile());
            prop_assert_eq!(first.statement.text(), second.statement.text());
            prop_assert_eq!(first.statement.bindings(), second.statement.bindings());
        }
    }

    #[test]
    fn filter_operands_only_travel_as_bindings(query in arb_query()) {
        let spec = SpecificationInterpreter::new().read_json(&query).expect("interprets");
        let spec = Arc::new(spec);
        for dialect in [Dialect::Aql, Dialect::Cypher] {
            let compiled = QueryCompiler::new(dialect)
                .compile(Arc::clone(&spec), &CompileRequest::new(Stage::InProgress))
                .expect("compiles");
            let text = compiled.statement.text();
            prop_assert!(!text.contains('\u{2603}'), "operand leaked into {}", text);
            for key in compiled.statement.bindings().keys() {
                let placeholder = format!("{}{key}", sigil(dialect));
                prop_assert!(text.contains(&placeholder), "unused binding {}", key);
            }
        }
    }
}

#[test]
fn incomplete_queries_are_rejected_before_compilation() {
    let interpreter = SpecificationInterpreter::new();
    let missing: Vec<Value> = vec![
        json!({"structure": [{"propertyName": "a", "path": "a"}]}),
        json!({"meta": {"name": "no type"}, "structure": [{"propertyName": "a", "path": "a"}]}),
        json!({"meta": {"type": "Thing"}}),
        json!({"meta": {"type": "Thing"}, "structure": []}),
    ];
    for payload in missing {
        match interpreter.read_json(&payload) {
            Err(KgError::Validation(_)) => {}
            other => panic!("{payload} accepted: {other:?}"),
        }
    }
}

#[test]
fn distinct_parameters_get_distinct_bindings() {
    let query = json!({
        "meta": {"type": "Thing"},
        "structure": [
            {"propertyName": "a", "path": "a", "filter": {"op": "CONTAINS", "parameter": "term"}},
            {"propertyName": "b", "path": "b", "filter": {"op": "CONTAINS", "parameter": "term"}},
            {"propertyName": "c", "path": "c", "filter": {"op": "EQUALS", "value": "x"}}
        ]
    });
    let spec = Arc::new(SpecificationInterpreter::new().read_json(&query).expect("interprets"));
    let request = CompileRequest::new(Stage::InProgress)
        .with_filter_values(BTreeMap::from([("term".to_owned(), "q".to_owned())]));
    let compiled = QueryCompiler::new(Dialect::Aql)
        .compile(spec, &request)
        .expect("compiles");
    let filters: BTreeSet<&String> = compiled
        .statement
        .bindings()
        .keys()
        .filter(|k| k.contains("staticFilter"))
        .collect();
    assert_eq!(filters.len(), 3, "{filters:?}");
    assert!(filters.iter().filter(|k| k.starts_with("term_")).count() == 2);
}
