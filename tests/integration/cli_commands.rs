#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::{json, Value};
use tempfile::TempDir;

const SWISS: &str = "5b0b3f6c-35b5-4a0f-9c1c-4f7a1d2e0001";
const GERMAN: &str = "5b0b3f6c-35b5-4a0f-9c1c-4f7a1d2e0002";
const FRENCH: &str = "5b0b3f6c-35b5-4a0f-9c1c-4f7a1d2e0003";

struct Workspace {
    dir: TempDir,
    graph: PathBuf,
    query: PathBuf,
}

impl Workspace {
    fn config(&self) -> PathBuf {
        self.dir.path().join("engine.toml")
    }
}

fn workspace() -> Workspace {
    let dir = TempDir::new().expect("tempdir");
    let graph = dir.path().join("graph.json");
    let query = dir.path().join("query.json");
    let fixture = json!({
        "stages": {
            "IN_PROGRESS": {
                "documents": [
                    {"id": SWISS, "space": "geo", "types": ["Country"], "label": "Switzerland",
                     "properties": {"name": "Switzerland"}},
                    {"id": GERMAN, "space": "geo", "types": ["Language"], "label": "German",
                     "properties": {"name": "German"}},
                    {"id": FRENCH, "space": "geo", "types": ["Language"], "label": "French",
                     "properties": {"name": "French"}}
                ],
                "edges": [
                    {"from": SWISS, "to": GERMAN, "relation": "hasLanguage"},
                    {"from": SWISS, "to": FRENCH, "relation": "hasLanguage", "order": 1}
                ]
            }
        },
        "scopeQueries": [{
            "type": "Country",
            "space": "queries",
            "query": {
                "meta": {"type": "Country"},
                "structure": [
                    {"propertyName": "id", "path": "@id"},
                    {"propertyName": "type", "path": "@type"},
                    {"propertyName": "dependency_languages", "path": "hasLanguage", "structure": [
                        {"propertyName": "id", "path": "@id"},
                        {"propertyName": "type", "path": "@type"}
                    ]}
                ]
            }
        }]
    });
    fs::write(&graph, serde_json::to_vec_pretty(&fixture).expect("fixture json")).expect("write graph");
    let spec = json!({
        "meta": {"type": "Country"},
        "structure": [
            {"propertyName": "name", "path": "name"},
            {"propertyName": "langs", "path": ["hasLanguage", "name"], "filter": {"op": "STARTS_WITH", "parameter": "lang"}}
        ]
    });
    fs::write(&query, serde_json::to_vec_pretty(&spec).expect("query json")).expect("write query");
    fs::write(dir.path().join("engine.toml"), "").expect("write config");
    Workspace { dir, graph, query }
}

fn run_json(ws: &Workspace, args: &[&str]) -> Value {
    let output = cargo_bin_cmd!("kgquery")
        .env("KGQUERY_CONFIG", ws.config())
        .args(["--format", "json"])
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("json output")
}

#[test]
fn validate_prints_the_normalized_tree() {
    let ws = workspace();
    let query = ws.query.to_str().expect("utf8 path");
    let spec = run_json(&ws, &["validate", query]);
    assert_eq!(spec["root_type"]["name"], json!("Country"));
    assert_eq!(spec["properties"][1]["property_name"], json!("langs"));

    let text = cargo_bin_cmd!("kgquery")
        .env("KGQUERY_CONFIG", ws.config())
        .args(["validate", query])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(text).expect("utf8");
    assert!(text.contains("== Specification"));
    assert!(text.contains("langs [langs_1] hasLanguage / name"));
}

#[test]
fn compile_reports_statement_and_bindings() {
    let ws = workspace();
    let query = ws.query.to_str().expect("utf8 path");
    let aql = run_json(&ws, &["compile", query, "--filter", "lang=Fr", "--size", "5", "--total"]);
    assert_eq!(aql["dialect"], json!("aql"));
    assert!(aql["statement"]["text"].as_str().expect("text").contains("@lang_staticFilter1"));
    assert_eq!(aql["statement"]["bindings"]["lang_staticFilter1"], json!("Fr%"));
    assert!(aql["statement"].get("debug").is_none());

    let cypher = run_json(&ws, &["compile", query, "--dialect", "cypher", "--size", "5", "--total", "--debug"]);
    assert_eq!(cypher["dialect"], json!("cypher"));
    assert!(cypher["count"].is_object());
    assert!(cypher["statement"]["debug"].is_string());
}

#[test]
fn run_returns_a_page() {
    let ws = workspace();
    let graph = ws.graph.to_str().expect("utf8 path");
    let query = ws.query.to_str().expect("utf8 path");
    let page = run_json(&ws, &["run", graph, query]);
    assert_eq!(page["data"], json!([{"name": "Switzerland", "langs": ["German", "French"]}]));

    let matching = run_json(&ws, &["run", graph, query, "--filter", "lang=Fr", "--total"]);
    assert_eq!(matching["data"][0]["langs"], json!(["German", "French"]));
    assert_eq!(matching["total"], json!(1));

    let none = run_json(&ws, &["run", graph, query, "--filter", "lang=It", "--total"]);
    assert_eq!(none["data"], json!([]));
    assert_eq!(none["total"], json!(0));
}

#[test]
fn run_honours_the_users_permissions() {
    let ws = workspace();
    let user = ws.dir.path().join("user.json");
    fs::write(
        &user,
        serde_json::to_vec(&json!({
            "userId": "guest",
            "permissions": [{"functionality": "READ", "scope": {"space": "elsewhere"}}]
        }))
        .expect("user json"),
    )
    .expect("write user");
    let page = run_json(
        &ws,
        &[
            "run",
            ws.graph.to_str().expect("utf8 path"),
            ws.query.to_str().expect("utf8 path"),
            "--user",
            user.to_str().expect("utf8 path"),
        ],
    );
    assert_eq!(page["data"], json!([]));
}

#[test]
fn scope_prints_the_dependency_tree() {
    let ws = workspace();
    let graph = ws.graph.to_str().expect("utf8 path");
    let scope = run_json(&ws, &["scope", graph, "--space", "geo", "--id", SWISS, "--labels"]);
    assert_eq!(scope["id"], json!(SWISS));
    assert_eq!(scope["label"], json!("Switzerland"));
    let children: Vec<&str> = scope["children"]
        .as_array()
        .expect("children")
        .iter()
        .map(|c| c["id"].as_str().expect("id"))
        .collect();
    assert_eq!(children, vec![GERMAN, FRENCH]);

    let text = cargo_bin_cmd!("kgquery")
        .env("KGQUERY_CONFIG", ws.config())
        .args(["scope", graph, "--space", "geo", "--id", SWISS])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(text).expect("utf8");
    assert!(text.contains("== Types"), "{text}");
    assert!(text.contains("  Country: 1"));
    assert!(text.contains("  Language: 2"));
}

#[test]
fn failures_exit_with_the_error_code() {
    let ws = workspace();
    let broken = ws.dir.path().join("broken.json");
    fs::write(&broken, r#"{"meta": {"type": "Country"}}"#).expect("write query");
    let output = cargo_bin_cmd!("kgquery")
        .env("KGQUERY_CONFIG", ws.config())
        .args(["validate", broken.to_str().expect("utf8 path")])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8(output).expect("utf8");
    assert!(stderr.contains("error[Validation]"), "{stderr}");
    assert!(stderr.contains("missing structure"));

    cargo_bin_cmd!("kgquery")
        .env("KGQUERY_CONFIG", ws.config())
        .args([
            "scope",
            ws.graph.to_str().expect("utf8 path"),
            "--space",
            "geo",
            "--id",
            "00000000-0000-0000-0000-000000000000",
        ])
        .assert()
        .failure();

    let absent = ws.dir.path().join("absent.toml");
    let output = cargo_bin_cmd!("kgquery")
        .args(["--config", absent.to_str().expect("utf8 path")])
        .args(["validate", ws.query.to_str().expect("utf8 path")])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    let stderr = String::from_utf8(output).expect("utf8");
    assert!(stderr.contains("failed to read engine config"), "{stderr}");
    assert!(stderr.contains("absent.toml"));
}
