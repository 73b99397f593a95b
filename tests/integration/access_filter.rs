#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;

use kgquery::access::{Functionality, Permission, StaticAuth, UserWithRoles};
use kgquery::backend::memory::StoredDocument;
use kgquery::backend::MemoryGraph;
use kgquery::config::EngineConfig;
use kgquery::query::Dialect;
use kgquery::types::{SpaceName, Stage};
use kgquery::{KgQuery, QueryService};
use serde_json::{json, Value};
use uuid::Uuid;

const STAGE: Stage = Stage::InProgress;

struct Fixture {
    graph: Arc<MemoryGraph>,
    invited: Uuid,
    hidden: Uuid,
}

/// Two documents per space `a`, `b` and `c`, each linked to the next one.
fn fixture() -> Fixture {
    let graph = Arc::new(MemoryGraph::new());
    let mut ids = Vec::new();
    for space in ["a", "b", "c"] {
        for n in 0..2 {
            let id = Uuid::new_v4();
            graph.insert_document(
                STAGE,
                StoredDocument::new(id, space, &["Doc"]).with_property("name", format!("{space}{n}")),
            );
            ids.push(id);
        }
    }
    for pair in ids.windows(2) {
        graph.link(STAGE, pair[0], "next", pair[1]);
    }
    Fixture {
        graph,
        invited: ids[2],
        hidden: ids[4],
    }
}

fn user(permissions: Vec<Permission>) -> Arc<StaticAuth> {
    Arc::new(StaticAuth(UserWithRoles::new("u", permissions)))
}

fn restricted_user(invited: Uuid) -> Arc<StaticAuth> {
    user(vec![
        Permission::space(Functionality::Read, "a"),
        Permission::instance(Functionality::Read, invited),
    ])
}

fn structures() -> Vec<Value> {
    vec![
        json!([{"propertyName": "name", "path": "name"}]),
        json!([
            {"propertyName": "name", "path": "name"},
            {"propertyName": "next", "path": ["next", "name"]}
        ]),
        json!([
            {"propertyName": "name", "path": "name"},
            {"propertyName": "chain", "path": "next", "structure": [
                {"propertyName": "name", "path": "name"},
                {"propertyName": "after", "path": ["next", "name"]}
            ]}
        ]),
        json!([
            {"propertyName": "name", "path": "name"},
            {"propertyName": "previous", "path": [{"@id": "next", "reverse": true}, {"@id": "name"}]}
        ]),
    ]
}

fn names(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            out.insert(s.clone());
        }
        Value::Array(items) => items.iter().for_each(|v| names(v, out)),
        Value::Object(obj) => obj.values().for_each(|v| names(v, out)),
        _ => {}
    }
}

fn visible_names(service: &QueryService, structure: Value) -> BTreeSet<String> {
    let payload = json!({"meta": {"type": "Doc"}, "structure": structure});
    let page = service
        .query(&KgQuery::new(payload, STAGE), None, false)
        .expect("query runs")
        .into_page()
        .expect("rows");
    let mut out = BTreeSet::new();
    for row in page.data {
        names(&Value::Object(row), &mut out);
    }
    out
}

#[test]
fn unpermitted_documents_never_appear() {
    let f = fixture();
    for dialect in [Dialect::Aql, Dialect::Cypher] {
        let config = EngineConfig {
            dialect,
            ..EngineConfig::default()
        };
        let service = QueryService::in_memory(&config, Arc::clone(&f.graph), restricted_user(f.invited));
        for structure in structures() {
            let seen = visible_names(&service, structure.clone());
            assert!(seen.contains("a0") && seen.contains("a1"), "{structure}");
            assert!(seen.contains("b0"), "invited document visible: {structure}");
            for forbidden in ["b1", "c0", "c1"] {
                assert!(!seen.contains(forbidden), "{forbidden} leaked through {structure}");
            }
        }
    }
}

#[test]
fn global_readers_see_everything() {
    let f = fixture();
    let service = QueryService::in_memory(
        &EngineConfig::default(),
        Arc::clone(&f.graph),
        user(vec![Permission::global(Functionality::Read)]),
    );
    let seen = visible_names(&service, structures()[0].clone());
    assert_eq!(seen.len(), 6);
}

#[test]
fn read_permission_is_stage_specific() {
    let f = fixture();
    f.graph.insert_document(
        Stage::Released,
        StoredDocument::new(f.hidden, "c", &["Doc"]).with_property("name", "released"),
    );
    let service = QueryService::in_memory(
        &EngineConfig::default(),
        Arc::clone(&f.graph),
        user(vec![Permission::global(Functionality::Read)]),
    );
    let payload = json!({"meta": {"type": "Doc"}, "structure": [{"propertyName": "name", "path": "name"}]});
    let page = service
        .query(&KgQuery::new(payload, Stage::Released), None, false)
        .expect("query runs")
        .into_page()
        .expect("rows");
    assert!(page.data.is_empty(), "READ does not grant READ_RELEASED");
}

#[test]
fn native_stage_is_unreadable_but_scope_mode_sees_it() {
    let f = fixture();
    f.graph.insert_document(
        Stage::Native,
        StoredDocument::new(Uuid::new_v4(), "a", &["Doc"]).with_property("name", "raw"),
    );
    let service = QueryService::in_memory(
        &EngineConfig::default(),
        Arc::clone(&f.graph),
        user(vec![Permission::global(Functionality::Read)]),
    );
    let payload = json!({"meta": {"type": "Doc"}, "structure": [{"propertyName": "name", "path": "name"}]});
    let query = KgQuery::new(payload, Stage::Native);
    let filtered = service.query(&query, None, false).expect("runs").into_page().expect("rows");
    assert!(filtered.data.is_empty());
    let scoped = service.query(&query, None, true).expect("runs").into_page().expect("rows");
    assert_eq!(scoped.data.len(), 1);
}

#[test]
fn restriction_without_readable_spaces_is_forbidden() {
    let f = fixture();
    let service = QueryService::in_memory(
        &EngineConfig::default(),
        Arc::clone(&f.graph),
        user(vec![Permission::space(Functionality::Read, "a")]),
    );
    let payload = json!({"meta": {"type": "Doc"}, "structure": [{"propertyName": "name", "path": "name"}]});
    let err = service
        .query(
            &KgQuery::new(payload.clone(), STAGE).with_space_restriction(vec![SpaceName::from("c")]),
            None,
            false,
        )
        .expect_err("nothing readable");
    assert_eq!(err.code(), "Forbidden");

    let page = service
        .query(
            &KgQuery::new(payload, STAGE).with_space_restriction(vec![SpaceName::from("a"), SpaceName::from("c")]),
            None,
            false,
        )
        .expect("space a is readable")
        .into_page()
        .expect("rows");
    assert_eq!(page.data.len(), 2);
}

#[test]
fn compiled_statements_carry_the_filter_as_bindings() {
    let f = fixture();
    let service = QueryService::in_memory(
        &EngineConfig::default(),
        Arc::clone(&f.graph),
        restricted_user(f.invited),
    );
    let spec: kgquery::query::ast::QuerySpecification = serde_json::from_value(json!({
        "meta": {"type": "Doc"},
        "structure": [{"propertyName": "name", "path": "name"}]
    }))
    .expect("parses");
    let request = kgquery::query::CompileRequest::new(STAGE).with_access_filter(Some(
        kgquery::access::AccessFilter {
            allowed_spaces: BTreeSet::from([SpaceName::from("a")]),
            permitted_instances: BTreeSet::from([f.invited]),
        },
    ));
    let compiled = service.pipeline().prepare(&spec, request).expect("compiles");
    let bindings = compiled.statement.bindings();
    assert_eq!(bindings["readAccessBySpace"], json!(["a"]));
    assert!(bindings["readAccessByInvitation"].get(f.invited.to_string()).is_some());
    assert!(!compiled.statement.text().contains(&f.invited.to_string()));
}
