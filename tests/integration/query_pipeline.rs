#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use kgquery::access::{Functionality, Permission, StaticAuth, UserWithRoles};
use kgquery::backend::memory::StoredDocument;
use kgquery::backend::MemoryGraph;
use kgquery::config::EngineConfig;
use kgquery::query::{Dialect, PaginationParam};
use kgquery::types::{InstanceId, Row, Stage};
use kgquery::{KgQuery, QueryService};
use serde_json::{json, Value};
use uuid::Uuid;

const STAGE: Stage = Stage::InProgress;

fn reader() -> Arc<StaticAuth> {
    Arc::new(StaticAuth(UserWithRoles::new(
        "reader",
        vec![Permission::global(Functionality::Read)],
    )))
}

fn service_with(graph: &Arc<MemoryGraph>, config: EngineConfig) -> QueryService {
    QueryService::in_memory(&config, Arc::clone(graph), reader())
}

fn service(graph: &Arc<MemoryGraph>) -> QueryService {
    service_with(graph, EngineConfig::default())
}

/// Switzerland speaks German and French, Atlantis speaks nothing.
fn countries() -> (Arc<MemoryGraph>, Uuid) {
    let graph = Arc::new(MemoryGraph::new());
    let ch = Uuid::new_v4();
    let de = Uuid::new_v4();
    let fr = Uuid::new_v4();
    graph.insert_document(
        STAGE,
        StoredDocument::new(ch, "geo", &["Country"])
            .with_property("name", "Switzerland")
            .with_property("code", "CH"),
    );
    graph.insert_document(
        STAGE,
        StoredDocument::new(Uuid::new_v4(), "geo", &["Country"]).with_property("name", "Atlantis"),
    );
    graph.insert_document(
        STAGE,
        StoredDocument::new(de, "geo", &["Language"])
            .with_property("name", "German")
            .with_property("family", "Germanic"),
    );
    graph.insert_document(
        STAGE,
        StoredDocument::new(fr, "geo", &["Language"])
            .with_property("name", "French")
            .with_property("family", "Romance"),
    );
    graph.link(STAGE, ch, "hasLanguage", de);
    graph.link(STAGE, ch, "hasLanguage", fr);
    (graph, ch)
}

fn rows(service: &QueryService, payload: Value) -> Vec<Row> {
    service
        .query(&KgQuery::new(payload, STAGE), None, false)
        .expect("query runs")
        .into_page()
        .expect("rows")
        .data
}

fn by_name<'a>(rows: &'a [Row], name: &str) -> &'a Row {
    rows.iter()
        .find(|r| r["name"] == json!(name))
        .expect("row present")
}

fn langs_query(single_value: Option<&str>) -> Value {
    let mut langs = json!({
        "propertyName": "langs",
        "path": [{"@id": "hasLanguage"}, {"@id": "name"}]
    });
    if let Some(single) = single_value {
        langs["singleValue"] = json!(single);
    }
    json!({
        "meta": {"type": "Country"},
        "structure": [{"propertyName": "name", "path": "name"}, langs]
    })
}

#[test]
fn multi_valued_leaf_is_a_list_by_default() {
    let (graph, _) = countries();
    let rows = rows(&service(&graph), langs_query(None));
    assert_eq!(rows.len(), 2);
    assert_eq!(by_name(&rows, "Switzerland")["langs"], json!(["German", "French"]));
    assert_eq!(by_name(&rows, "Atlantis")["langs"], json!([]));
}

#[test]
fn first_collapses_to_a_scalar() {
    let (graph, _) = countries();
    let rows = rows(&service(&graph), langs_query(Some("FIRST")));
    assert_eq!(by_name(&rows, "Switzerland")["langs"], json!("German"));
    assert_eq!(by_name(&rows, "Atlantis")["langs"], Value::Null);
}

#[test]
fn concat_joins_all_values() {
    let (graph, _) = countries();
    let rows = rows(&service(&graph), langs_query(Some("CONCAT")));
    assert_eq!(by_name(&rows, "Switzerland")["langs"], json!("German, French"));
}

#[test]
fn required_drops_rows_without_match() {
    let (graph, _) = countries();
    let mut query = langs_query(None);
    query["structure"][1]["required"] = json!(true);
    let rows = rows(&service(&graph), query);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["name"], json!("Switzerland"));
}

#[test]
fn runtime_filter_values_override_literals() {
    let (graph, _) = countries();
    let payload = json!({
        "meta": {"type": "Country"},
        "structure": [{
            "propertyName": "name", "path": "name",
            "filter": {"op": "STARTS_WITH", "parameter": "prefix", "value": "Zz"}
        }]
    });
    let service = service(&graph);
    let literal = rows(&service, payload.clone());
    assert!(literal.is_empty());

    let query = KgQuery::new(payload, STAGE)
        .with_filter_values(BTreeMap::from([("prefix".to_owned(), "Sw".to_owned())]));
    let page = service
        .query(&query, None, false)
        .expect("query runs")
        .into_page()
        .expect("rows");
    assert_eq!(page.data.len(), 1);
    assert_eq!(page.data[0]["name"], json!("Switzerland"));
}

#[test]
fn filters_match_any_element_of_lists() {
    let (graph, _) = countries();
    let mut query = langs_query(None);
    query["structure"][1]["filter"] = json!({"op": "EQUALS", "value": "French"});
    let rows = rows(&service(&graph), query);
    assert_eq!(rows.len(), 1);

    let mut query = langs_query(None);
    query["structure"][1]["filter"] = json!({"op": "REGEX", "value": "^Ger"});
    assert_eq!(self::rows(&service(&graph), query).len(), 1);

    let mut query = langs_query(None);
    query["structure"][1]["filter"] = json!({"op": "IS_EMPTY"});
    let empty = self::rows(&service(&graph), query);
    assert_eq!(empty.len(), 1);
    assert_eq!(empty[0]["name"], json!("Atlantis"));
}

#[test]
fn invalid_regex_is_an_invalid_query() {
    let (graph, _) = countries();
    let payload = json!({
        "meta": {"type": "Country"},
        "structure": [{"propertyName": "name", "path": "name", "filter": {"op": "REGEX", "value": "("}}]
    });
    let err = service(&graph)
        .query(&KgQuery::new(payload, STAGE), None, false)
        .expect_err("bad regex");
    assert_eq!(err.code(), "InvalidQuery");
    assert_eq!(graph.open_cursors(), 0);
}

#[test]
fn nested_structures_group_by_key() {
    let (graph, _) = countries();
    let payload = json!({
        "meta": {"type": "Country"},
        "structure": [
            {"propertyName": "name", "path": "name", "required": true},
            {
                "propertyName": "languages",
                "path": "hasLanguage",
                "groupedInstances": "members",
                "structure": [
                    {"propertyName": "family", "path": "family", "groupBy": true},
                    {"propertyName": "name", "path": "name"}
                ]
            }
        ]
    });
    let rows = rows(&service(&graph), payload);
    assert_eq!(
        by_name(&rows, "Switzerland")["languages"],
        json!([
            {"family": "Germanic", "members": [{"name": "German"}]},
            {"family": "Romance", "members": [{"name": "French"}]}
        ])
    );
}

#[test]
fn grouped_keys_and_members_follow_their_sort_flags() {
    let (graph, ch) = countries();
    for (name, family) in [("Romansh", "Romance"), ("Swabian", "Germanic"), ("Alemannic", "Germanic")] {
        let id = Uuid::new_v4();
        graph.insert_document(
            STAGE,
            StoredDocument::new(id, "geo", &["Language"])
                .with_property("name", name)
                .with_property("family", family),
        );
        graph.link(STAGE, ch, "hasLanguage", id);
    }
    let payload = json!({
        "meta": {"type": "Country"},
        "structure": [
            {"propertyName": "name", "path": "name", "required": true},
            {
                "propertyName": "languages",
                "path": "hasLanguage",
                "groupedInstances": "members",
                "structure": [
                    {"propertyName": "family", "path": "family", "groupBy": true, "sort": true},
                    {"propertyName": "name", "path": "name", "sort": true}
                ]
            }
        ]
    });
    let rows = rows(&service(&graph), payload);
    assert_eq!(
        by_name(&rows, "Switzerland")["languages"],
        json!([
            {"family": "Germanic", "members": [{"name": "Alemannic"}, {"name": "German"}, {"name": "Swabian"}]},
            {"family": "Romance", "members": [{"name": "French"}, {"name": "Romansh"}]}
        ])
    );
}

#[test]
fn unsorted_groups_still_order_by_key() {
    let (graph, ch) = countries();
    let basque = Uuid::new_v4();
    graph.insert_document(
        STAGE,
        StoredDocument::new(basque, "geo", &["Language"])
            .with_property("name", "Basque")
            .with_property("family", "Isolate"),
    );
    graph.link(STAGE, ch, "hasLanguage", basque);
    let payload = json!({
        "meta": {"type": "Country"},
        "structure": [
            {"propertyName": "name", "path": "name", "required": true},
            {
                "propertyName": "languages",
                "path": "hasLanguage",
                "groupedInstances": "members",
                "structure": [
                    {"propertyName": "family", "path": "family", "groupBy": true},
                    {"propertyName": "name", "path": "name"}
                ]
            }
        ]
    });
    let rows = rows(&service(&graph), payload);
    let families: Vec<&Value> = by_name(&rows, "Switzerland")["languages"]
        .as_array()
        .expect("groups")
        .iter()
        .map(|g| &g["family"])
        .collect();
    assert_eq!(families, vec![&json!("Germanic"), &json!("Isolate"), &json!("Romance")]);
}

#[test]
fn merge_nodes_splice_into_the_parent() {
    let (graph, _) = countries();
    let payload = json!({
        "meta": {"type": "Country"},
        "structure": [{
            "propertyName": "identity",
            "structure": [
                {"propertyName": "name", "path": "name", "sort": true},
                {"propertyName": "code", "path": "code"}
            ]
        }]
    });
    let rows = rows(&service(&graph), payload);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["name"], json!("Atlantis"));
    assert_eq!(rows[1]["code"], json!("CH"));
    assert!(rows[0].get("identity").is_none());
}

#[test]
fn response_vocab_prefixes_output_keys() {
    let (graph, _) = countries();
    let payload = json!({
        "meta": {"type": "Country", "responseVocab": "https://schema.example.org/"},
        "structure": [{"propertyName": "https://schema.example.org/name", "path": "name", "required": true}]
    });
    let rows = rows(&service(&graph), payload);
    assert_eq!(rows.len(), 2);
    assert!(rows[0].contains_key("https://schema.example.org/name"));
}

#[test]
fn id_restriction_selects_one_root() {
    let (graph, ch) = countries();
    let query = KgQuery::new(langs_query(None), STAGE).with_id_restriction(InstanceId::new(ch, "geo"));
    let page = service(&graph)
        .query(
            &query,
            Some(PaginationParam {
                from: 0,
                size: Some(5),
                return_total: true,
            }),
            false,
        )
        .expect("query runs")
        .into_page()
        .expect("rows");
    assert_eq!(page.data.len(), 1);
    assert_eq!(page.total, Some(1));

    let wrong_space = KgQuery::new(langs_query(None), STAGE).with_id_restriction(InstanceId::new(ch, "other"));
    let rows = service(&graph)
        .query(&wrong_space, None, false)
        .expect("query runs")
        .into_page()
        .expect("rows");
    assert!(rows.data.is_empty());
}

fn numbered(n: usize) -> Arc<MemoryGraph> {
    let graph = Arc::new(MemoryGraph::new());
    for i in 0..n {
        graph.insert_document(
            STAGE,
            StoredDocument::new(Uuid::new_v4(), "s", &["Item"]).with_property("rank", i as u64),
        );
    }
    graph
}

fn page(service: &QueryService, pagination: PaginationParam) -> kgquery::query::executor::Page<Row> {
    let payload = json!({
        "meta": {"type": "Item"},
        "structure": [{"propertyName": "rank", "path": "rank", "sort": true}]
    });
    service
        .query(&KgQuery::new(payload, STAGE), Some(pagination), false)
        .expect("query runs")
        .into_page()
        .expect("rows")
}

#[test]
fn offset_without_size_is_applied_in_process() {
    let graph = numbered(10);
    let page = page(
        &service(&graph),
        PaginationParam {
            from: 3,
            size: None,
            return_total: true,
        },
    );
    assert_eq!(page.data.len(), 7);
    assert_eq!(page.total, Some(7));
    assert_eq!(page.size, 7);
    assert_eq!(page.data[0]["rank"], json!(3));
    assert_eq!(graph.open_cursors(), 0);
}

#[test]
fn finite_pages_are_limited_by_the_backend() {
    let graph = numbered(10);
    for dialect in [Dialect::Aql, Dialect::Cypher] {
        let config = EngineConfig {
            dialect,
            ..EngineConfig::default()
        };
        let page = page(
            &service_with(&graph, config),
            PaginationParam {
                from: 3,
                size: Some(4),
                return_total: true,
            },
        );
        assert_eq!(page.data.len(), 4, "{dialect}");
        assert_eq!(page.total, Some(10), "{dialect}");
        assert_eq!(page.data[0]["rank"], json!(3), "{dialect}");
    }
}

#[test]
fn memory_ceiling_is_reported_distinctly() {
    let (graph, _) = countries();
    let config = EngineConfig {
        max_memory_bytes: Some(16),
        ..EngineConfig::default()
    };
    let err = service_with(&graph, config)
        .query(&KgQuery::new(langs_query(None), STAGE), None, false)
        .expect_err("ceiling exceeded");
    assert_eq!(err.code(), "LimitExceeded");
    assert!(!err.is_retryable());
}

#[test]
fn dropping_a_stream_releases_the_cursor() {
    let graph = numbered(5);
    let payload = json!({"meta": {"type": "Item"}, "structure": [{"propertyName": "rank", "path": "rank"}]});
    let mut stream = service(&graph)
        .query(&KgQuery::new(payload, STAGE), None, false)
        .expect("query runs");
    assert!(stream.next().is_some());
    assert_eq!(graph.open_cursors(), 1);
    drop(stream);
    assert_eq!(graph.open_cursors(), 0);
}

#[test]
fn missing_edge_collections_yield_empty_traversals() {
    let (graph, _) = countries();
    let payload = json!({
        "meta": {"type": "Country"},
        "structure": [
            {"propertyName": "name", "path": "name"},
            {"propertyName": "capital", "path": ["hasCapital", "name"], "singleValue": "FIRST"}
        ]
    });
    let rows = rows(&service(&graph), payload);
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r["capital"].is_null()));
}

#[test]
fn validation_errors_never_reach_the_backend() {
    let (graph, _) = countries();
    let err = service(&graph)
        .query(&KgQuery::new(json!({"meta": {"type": "Country"}}), STAGE), None, false)
        .expect_err("missing structure");
    assert_eq!(err.code(), "Validation");
    assert_eq!(graph.executions(), 0);
}
