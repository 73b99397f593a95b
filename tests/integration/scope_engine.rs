#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;

use kgquery::access::{StaticAuth, UserWithRoles};
use kgquery::backend::memory::StoredDocument;
use kgquery::backend::MemoryGraph;
use kgquery::config::EngineConfig;
use kgquery::scope::{ScopeElement, ScopeOptions};
use kgquery::types::{SpaceName, Stage};
use kgquery::QueryService;
use serde_json::{json, Value};
use uuid::Uuid;

const STAGE: Stage = Stage::InProgress;

struct Study {
    graph: Arc<MemoryGraph>,
    dataset: Uuid,
    subject: Uuid,
    sample: Uuid,
}

fn columns() -> Vec<Value> {
    vec![
        json!({"propertyName": "id", "path": "@id"}),
        json!({"propertyName": "type", "path": "@type"}),
        json!({"propertyName": "space", "path": "_space"}),
        json!({"propertyName": "embedded", "path": "embedded"}),
    ]
}

fn with_dependency(mut structure: Vec<Value>, name: &str, relation: &str, nested: Vec<Value>) -> Vec<Value> {
    structure.push(json!({
        "propertyName": format!("dependency_{name}"),
        "path": relation,
        "structure": nested
    }));
    structure
}

fn scope_query(ty: &str, structure: Vec<Value>) -> Value {
    json!({"meta": {"type": ty}, "structure": structure})
}

fn put(graph: &MemoryGraph, stage: Stage, id: Uuid, ty: &str, label: &str) {
    graph.insert_document(stage, StoredDocument::new(id, "data", &[ty]).with_label(label));
}

/// Dataset -studies-> Subject -hasSample-> Sample, with scope queries for the
/// dataset and the subject.
fn study() -> Study {
    let graph = Arc::new(MemoryGraph::new());
    let (dataset, subject, sample) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    put(&graph, STAGE, dataset, "Dataset", "Dataset A");
    put(&graph, STAGE, subject, "Subject", "Subject B");
    put(&graph, STAGE, sample, "Sample", "Sample C");
    graph.link(STAGE, dataset, "studies", subject);
    graph.link(STAGE, subject, "hasSample", sample);

    let samples = with_dependency(columns(), "samples", "hasSample", columns());
    let dataset_query = with_dependency(columns(), "subjects", "studies", samples.clone());
    graph
        .register_scope_query("Dataset", "queries", &scope_query("Dataset", dataset_query))
        .expect("dataset query");
    graph
        .register_scope_query("Subject", "queries", &scope_query("Subject", samples))
        .expect("subject query");
    Study {
        graph,
        dataset,
        subject,
        sample,
    }
}

fn service_with(graph: &Arc<MemoryGraph>, config: &EngineConfig) -> QueryService {
    QueryService::in_memory(
        config,
        Arc::clone(graph),
        Arc::new(StaticAuth(UserWithRoles::new("scope", Vec::new()))),
    )
}

fn service(graph: &Arc<MemoryGraph>) -> QueryService {
    service_with(graph, &EngineConfig::default())
}

fn scope(service: &QueryService, id: Uuid, stage: Stage, options: ScopeOptions) -> ScopeElement {
    service
        .scope_for_instance(&SpaceName::from("data"), id, stage, options)
        .expect("scope computes")
        .expect("instance exists")
}

fn child_ids(element: &ScopeElement) -> Vec<Uuid> {
    element.children.iter().flatten().map(|c| c.id).collect()
}

#[test]
fn follows_dependencies_through_every_level() {
    let s = study();
    let root = scope(&service(&s.graph), s.dataset, STAGE, ScopeOptions::default());
    assert_eq!(root.id, s.dataset);
    assert_eq!(root.types, vec!["Dataset".to_owned()]);
    assert_eq!(child_ids(&root), vec![s.subject]);
    let subject = &root.children.as_ref().expect("children")[0];
    assert_eq!(child_ids(subject), vec![s.sample]);
    assert_eq!(subject.children.as_ref().expect("sample")[0].children, None);
    assert_eq!(root.collect_ids(), BTreeSet::from([s.dataset, s.subject, s.sample]));
}

#[test]
fn scope_of_a_dependency_starts_at_that_dependency() {
    let s = study();
    let root = scope(&service(&s.graph), s.subject, STAGE, ScopeOptions::default());
    assert_eq!(root.id, s.subject);
    assert_eq!(child_ids(&root), vec![s.sample]);
}

#[test]
fn stages_are_computed_independently() {
    let s = study();
    put(&s.graph, Stage::Released, s.dataset, "Dataset", "Dataset A");
    put(&s.graph, Stage::Released, s.subject, "Subject", "Subject B");
    s.graph.link(Stage::Released, s.dataset, "studies", s.subject);
    s.graph.link(Stage::Released, s.subject, "hasSample", s.sample);

    let root = scope(&service(&s.graph), s.dataset, Stage::Released, ScopeOptions::default());
    assert_eq!(child_ids(&root), vec![s.subject]);
    assert_eq!(root.children.as_ref().expect("subject")[0].children, None);
}

#[test]
fn cycles_terminate_and_keep_each_instance_once() {
    let s = study();
    s.graph.link(STAGE, s.sample, "partOf", s.dataset);
    s.graph.link(STAGE, s.sample, "partOf", s.subject);
    s.graph
        .register_scope_query(
            "Sample",
            "queries",
            &scope_query("Sample", with_dependency(columns(), "parents", "partOf", columns())),
        )
        .expect("sample query");

    let root = scope(&service(&s.graph), s.dataset, STAGE, ScopeOptions::default());
    let mut count = 0;
    root.visit(&mut |_| count += 1);
    assert_eq!(count, 3);

    let from_sample = scope(&service(&s.graph), s.sample, STAGE, ScopeOptions::default());
    assert_eq!(from_sample.collect_ids(), BTreeSet::from([s.dataset, s.subject, s.sample]));
}

#[test]
fn labels_are_resolved_on_request() {
    let s = study();
    let service = service(&s.graph);
    let plain = scope(&service, s.dataset, STAGE, ScopeOptions::default());
    assert_eq!(plain.label, None);

    let labelled = scope(
        &service,
        s.dataset,
        STAGE,
        ScopeOptions {
            apply_labels: true,
            ..ScopeOptions::default()
        },
    );
    let mut labels = Vec::new();
    labelled.visit(&mut |e| labels.push(e.label.clone()));
    assert_eq!(
        labels,
        vec![
            Some("Dataset A".to_owned()),
            Some("Subject B".to_owned()),
            Some("Sample C".to_owned())
        ]
    );
}

#[test]
fn restricted_dependencies_are_replaced_by_their_own() {
    let s = study();
    s.graph.exclude_from_scope("Subject");
    let restricted = ScopeOptions {
        apply_restrictions: true,
        ..ScopeOptions::default()
    };
    let root = scope(&service(&s.graph), s.dataset, STAGE, restricted);
    assert_eq!(child_ids(&root), vec![s.sample]);

    let unrestricted = scope(&service(&s.graph), s.dataset, STAGE, ScopeOptions::default());
    assert_eq!(child_ids(&unrestricted), vec![s.subject]);
}

#[test]
fn restricted_root_has_no_children() {
    let s = study();
    s.graph.exclude_from_scope("Dataset");
    let root = scope(
        &service(&s.graph),
        s.dataset,
        STAGE,
        ScopeOptions {
            apply_restrictions: true,
            ..ScopeOptions::default()
        },
    );
    assert_eq!(root.id, s.dataset);
    assert_eq!(root.children, None);
}

#[test]
fn unknown_instances_and_foreign_spaces_have_no_scope() {
    let s = study();
    let service = service(&s.graph);
    let missing = service
        .scope_for_instance(&SpaceName::from("data"), Uuid::new_v4(), STAGE, ScopeOptions::default())
        .expect("lookup succeeds");
    assert!(missing.is_none());
    let elsewhere = service
        .scope_for_instance(&SpaceName::from("other"), s.dataset, STAGE, ScopeOptions::default())
        .expect("lookup succeeds");
    assert!(elsewhere.is_none());
}

#[test]
fn instances_without_queries_are_single_elements() {
    let s = study();
    let root = scope(&service(&s.graph), s.sample, STAGE, ScopeOptions::default());
    assert_eq!(root.id, s.sample);
    assert_eq!(root.children, None);
    assert_eq!(root.space, Some(SpaceName::from("data")));
    assert_eq!(root.internal_reference, Some(format!("data/{}", s.sample)));
}

#[test]
fn embedded_rows_are_skipped() {
    let s = study();
    let embedded = Uuid::new_v4();
    s.graph.insert_document(
        STAGE,
        StoredDocument::new(embedded, "data", &["Subject"]).with_property("embedded", true),
    );
    s.graph.link(STAGE, s.dataset, "studies", embedded);
    let root = scope(&service(&s.graph), s.dataset, STAGE, ScopeOptions::default());
    assert_eq!(child_ids(&root), vec![s.subject]);
}

#[test]
fn dependencies_sharing_the_root_type_are_dropped() {
    let s = study();
    let sibling = Uuid::new_v4();
    put(&s.graph, STAGE, sibling, "Dataset", "Sibling");
    s.graph.link(STAGE, s.dataset, "studies", sibling);
    let root = scope(&service(&s.graph), s.dataset, STAGE, ScopeOptions::default());
    assert_eq!(child_ids(&root), vec![s.subject]);
}

fn with_files(s: &Study, space: &str) -> Uuid {
    let file = Uuid::new_v4();
    put(&s.graph, STAGE, file, "File", "File F");
    s.graph.link(STAGE, s.dataset, "hasFile", file);
    s.graph
        .register_scope_query(
            "Dataset",
            space,
            &scope_query("Dataset", with_dependency(columns(), "files", "hasFile", columns())),
        )
        .expect("file query");
    file
}

#[test]
fn results_of_several_queries_merge_on_the_same_level() {
    for parallel in [true, false] {
        let s = study();
        let file = with_files(&s, "queries");
        let mut config = EngineConfig::default();
        config.scope.parallel = parallel;
        let root = scope(&service_with(&s.graph, &config), s.dataset, STAGE, ScopeOptions::default());
        let children: BTreeSet<Uuid> = child_ids(&root).into_iter().collect();
        assert_eq!(children, BTreeSet::from([s.subject, file]), "parallel = {parallel}");
    }
}

#[test]
fn queries_outside_relevant_spaces_are_ignored() {
    let s = study();
    let file = with_files(&s, "scratch");

    let everything = scope(&service(&s.graph), s.dataset, STAGE, ScopeOptions::default());
    assert!(everything.collect_ids().contains(&file));

    let mut config = EngineConfig::default();
    config.scope.relevant_spaces = Some(BTreeSet::from([SpaceName::from("queries")]));
    let relevant = scope(&service_with(&s.graph, &config), s.dataset, STAGE, ScopeOptions::default());
    assert!(!relevant.collect_ids().contains(&file));
}

#[test]
fn elements_serialize_without_empty_fields() {
    let s = study();
    let root = scope(&service(&s.graph), s.sample, STAGE, ScopeOptions::default());
    let value = serde_json::to_value(&root).expect("serializes");
    assert_eq!(value["id"], json!(s.sample.to_string()));
    assert_eq!(value["types"], json!(["Sample"]));
    assert!(value.get("children").is_none());
    assert_eq!(value["internalReference"], json!(format!("data/{}", s.sample)));
}
