#![forbid(unsafe_code)]

//! In-memory graph backend.
//!
//! [`MemoryGraph`] keeps documents and edges per stage and evaluates the
//! logical plan behind a compiled statement directly, so it behaves the same
//! for AQL and Cypher statements. It also serves as instance catalog, space
//! directory and schema admin, which makes it the backend of the CLI and of
//! the test suites.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::access::SpaceDirectory;
use crate::backend::bootstrap::SchemaAdmin;
use crate::backend::{classify_backend_error, GraphBackend, QueryCursor, ERROR_CONNECTION_LOST};
use crate::query::ast::QuerySpecification;
use crate::query::{Dialect, Statement};
use crate::scope::{InstanceCatalog, InstanceSummary, RegisteredQuery};
use crate::types::{CollectionRef, Result, Row, SpaceName, Stage};

mod eval;

/// A stored instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDocument {
    /// Instance uuid.
    pub id: Uuid,
    /// Owning space.
    pub space: SpaceName,
    /// Type URIs.
    #[serde(default)]
    pub types: Vec<String>,
    /// Display label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Attributes.
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl StoredDocument {
    /// A document with no attributes.
    pub fn new(id: Uuid, space: impl Into<SpaceName>, types: &[&str]) -> Self {
        StoredDocument {
            id,
            space: space.into(),
            types: types.iter().map(|t| (*t).to_owned()).collect(),
            label: None,
            properties: Map::new(),
        }
    }

    /// Sets an attribute.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Sets the display label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// A directed, named edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEdge {
    /// Source instance.
    pub from: Uuid,
    /// Target instance.
    pub to: Uuid,
    /// Relation URI.
    pub relation: String,
    /// Position among the source's edges, used by ordered traversals.
    #[serde(default)]
    pub order: i64,
}

/// Documents and edges of one stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageData {
    /// Documents in insertion order.
    #[serde(default)]
    pub documents: Vec<StoredDocument>,
    /// Edges in insertion order.
    #[serde(default)]
    pub edges: Vec<StoredEdge>,
    #[serde(skip)]
    index: HashMap<Uuid, usize>,
}

impl StageData {
    fn reindex(&mut self) {
        self.index = self
            .documents
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id, i))
            .collect();
    }

    /// Document by id.
    pub fn get(&self, id: &Uuid) -> Option<&StoredDocument> {
        self.index.get(id).map(|i| &self.documents[*i])
    }

    fn upsert(&mut self, doc: StoredDocument) {
        match self.index.get(&doc.id) {
            Some(i) => self.documents[*i] = doc,
            None => {
                self.index.insert(doc.id, self.documents.len());
                self.documents.push(doc);
            }
        }
    }
}

/// A scope query as written in a fixture.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeQueryFixture {
    /// Type the query is declared for.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Space the query is stored in.
    pub space: SpaceName,
    /// Declarative query.
    pub query: Value,
}

/// JSON fixture describing a whole graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphFixture {
    /// Data per stage.
    #[serde(default)]
    pub stages: BTreeMap<Stage, StageData>,
    /// Registered scope queries.
    #[serde(default)]
    pub scope_queries: Vec<ScopeQueryFixture>,
    /// Types that may be left out of scopes.
    #[serde(default)]
    pub excluded_from_scope: Vec<String>,
    /// Spaces whose queries count for scopes; all query spaces when absent.
    #[serde(default)]
    pub scope_relevant_spaces: Option<Vec<SpaceName>>,
}

#[derive(Debug, Default)]
struct SchemaState {
    databases: BTreeSet<String>,
    collections: BTreeSet<(String, CollectionRef)>,
    pending_failures: u32,
    creations: usize,
}

/// In-memory backend.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    stages: RwLock<HashMap<Stage, StageData>>,
    scope_queries: RwLock<Vec<(String, RegisteredQuery)>>,
    excluded_from_scope: RwLock<BTreeSet<String>>,
    scope_relevant_spaces: RwLock<Option<BTreeSet<SpaceName>>>,
    open_cursors: Arc<AtomicUsize>,
    executions: AtomicUsize,
    schema: Mutex<SchemaState>,
}

impl MemoryGraph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from a fixture.
    pub fn from_fixture(fixture: GraphFixture) -> Result<Self> {
        let graph = MemoryGraph::new();
        {
            let mut stages = graph.stages.write();
            for (stage, mut data) in fixture.stages {
                data.reindex();
                stages.insert(stage, data);
            }
        }
        for q in fixture.scope_queries {
            graph.register_scope_query(&q.type_name, q.space, &q.query)?;
        }
        for ty in fixture.excluded_from_scope {
            graph.exclude_from_scope(ty);
        }
        if let Some(spaces) = fixture.scope_relevant_spaces {
            *graph.scope_relevant_spaces.write() = Some(spaces.into_iter().collect());
        }
        Ok(graph)
    }

    /// Parses a JSON fixture.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Self::from_fixture(serde_json::from_str(json)?)
    }

    /// Reads a JSON fixture file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Inserts or replaces a document.
    pub fn insert_document(&self, stage: Stage, doc: StoredDocument) {
        self.stages.write().entry(stage).or_default().upsert(doc);
    }

    /// Adds an edge `from -[relation]-> to`, ordered after existing edges.
    pub fn link(&self, stage: Stage, from: Uuid, relation: &str, to: Uuid) {
        let mut stages = self.stages.write();
        let data = stages.entry(stage).or_default();
        let order = data
            .edges
            .iter()
            .filter(|e| e.from == from && e.relation == relation)
            .count() as i64;
        data.edges.push(StoredEdge {
            from,
            to,
            relation: relation.to_owned(),
            order,
        });
    }

    /// Declares a scope query for `type_name`, stored in `space`.
    pub fn register_scope_query(&self, type_name: &str, space: impl Into<SpaceName>, query: &Value) -> Result<()> {
        let specification = QuerySpecification::from_value(query)?;
        self.scope_queries.write().push((
            type_name.to_owned(),
            RegisteredQuery {
                space: space.into(),
                specification,
            },
        ));
        Ok(())
    }

    /// Marks a type as removable from scopes.
    pub fn exclude_from_scope(&self, type_name: impl Into<String>) {
        self.excluded_from_scope.write().insert(type_name.into());
    }

    /// Limits the spaces whose queries count for scopes.
    pub fn set_scope_relevant_spaces(&self, spaces: Option<BTreeSet<SpaceName>>) {
        *self.scope_relevant_spaces.write() = spaces;
    }

    /// Cursors not yet closed.
    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }

    /// Statements executed so far.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Makes the next `n` schema calls fail with a transient error.
    pub fn fail_next_schema_calls(&self, n: u32) {
        self.schema.lock().pending_failures = n;
    }

    /// Databases and collections created through [`SchemaAdmin`].
    pub fn schema_creations(&self) -> usize {
        self.schema.lock().creations
    }

    fn schema_call(&self) -> Result<parking_lot::MutexGuard<'_, SchemaState>> {
        let mut state = self.schema.lock();
        if state.pending_failures > 0 {
            state.pending_failures -= 1;
            return Err(classify_backend_error(ERROR_CONNECTION_LOST, "connection refused"));
        }
        Ok(state)
    }
}

impl GraphBackend for MemoryGraph {
    fn execute(&self, stage: Stage, statement: &Statement) -> Result<Box<dyn QueryCursor>> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let stages = self.stages.read();
        let empty = StageData::default();
        let data = stages.get(&stage).unwrap_or(&empty);
        let plan = &statement.plan;
        let matched = eval::evaluate(data, plan, statement.memory_limit)?;
        let full = matched.len() as u64;

        let rows: Vec<Row> = if plan.count_only {
            let mut row = Row::new();
            row.insert("count".into(), Value::from(full));
            vec![row]
        } else {
            match plan.pagination {
                Some(p) if p.size.is_some() => matched
                    .into_iter()
                    .skip(p.from as usize)
                    .take(p.size.unwrap_or(u64::MAX) as usize)
                    .collect(),
                _ => matched,
            }
        };
        let reports_full_count = statement.options().full_count && statement.dialect == Dialect::Aql;
        debug!(%stage, rows = rows.len(), full, "memory.execute.complete");
        Ok(Box::new(MemoryCursor::open(
            rows,
            reports_full_count.then_some(full),
            Arc::clone(&self.open_cursors),
        )))
    }

    fn known_collections(&self, stage: Stage) -> Result<BTreeSet<CollectionRef>> {
        let stages = self.stages.read();
        let mut known = BTreeSet::new();
        if let Some(data) = stages.get(&stage) {
            known.extend(data.documents.iter().map(|d| CollectionRef::for_space(&d.space)));
            known.extend(data.edges.iter().map(|e| CollectionRef::for_relation(&e.relation)));
        }
        let schema = self.schema.lock();
        known.extend(
            schema
                .collections
                .iter()
                .filter(|(db, _)| db == stage.database_name())
                .map(|(_, c)| c.clone()),
        );
        Ok(known)
    }
}

impl SpaceDirectory for MemoryGraph {
    fn all_spaces(&self, stage: Stage) -> Result<BTreeSet<SpaceName>> {
        Ok(self
            .stages
            .read()
            .get(&stage)
            .map(|data| data.documents.iter().map(|d| d.space.clone()).collect())
            .unwrap_or_default())
    }
}

impl InstanceCatalog for MemoryGraph {
    fn instance(&self, stage: Stage, id: Uuid) -> Result<Option<InstanceSummary>> {
        Ok(self.stages.read().get(&stage).and_then(|data| data.get(&id)).map(|d| InstanceSummary {
            id: d.id,
            space: d.space.clone(),
            types: d.types.clone(),
            label: d.label.clone(),
        }))
    }

    fn scope_queries(&self, type_name: &str) -> Result<Vec<RegisteredQuery>> {
        Ok(self
            .scope_queries
            .read()
            .iter()
            .filter(|(ty, _)| ty == type_name)
            .map(|(_, q)| q.clone())
            .collect())
    }

    fn scope_relevant_spaces(&self) -> Result<BTreeSet<SpaceName>> {
        if let Some(spaces) = self.scope_relevant_spaces.read().as_ref() {
            return Ok(spaces.clone());
        }
        Ok(self
            .scope_queries
            .read()
            .iter()
            .map(|(_, q)| q.space.clone())
            .collect())
    }

    fn can_be_excluded_from_scope(&self, type_name: &str) -> Result<bool> {
        Ok(self.excluded_from_scope.read().contains(type_name))
    }

    fn labels(&self, stage: Stage, ids: &BTreeSet<Uuid>) -> Result<BTreeMap<Uuid, String>> {
        let stages = self.stages.read();
        let Some(data) = stages.get(&stage) else {
            return Ok(BTreeMap::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| data.get(id))
            .filter_map(|d| d.label.clone().map(|l| (d.id, l)))
            .collect())
    }
}

impl SchemaAdmin for MemoryGraph {
    fn database_exists(&self, name: &str) -> Result<bool> {
        Ok(self.schema_call()?.databases.contains(name))
    }

    fn create_database(&self, name: &str) -> Result<()> {
        let mut state = self.schema_call()?;
        if state.databases.insert(name.to_owned()) {
            state.creations += 1;
        }
        Ok(())
    }

    fn collection_exists(&self, database: &str, collection: &CollectionRef) -> Result<bool> {
        Ok(self
            .schema_call()?
            .collections
            .contains(&(database.to_owned(), collection.clone())))
    }

    fn create_collection(&self, database: &str, collection: &CollectionRef) -> Result<()> {
        let mut state = self.schema_call()?;
        if state
            .collections
            .insert((database.to_owned(), collection.clone()))
        {
            state.creations += 1;
        }
        Ok(())
    }
}

struct MemoryCursor {
    rows: std::vec::IntoIter<Row>,
    count: u64,
    full_count: Option<u64>,
    open: Arc<AtomicUsize>,
    closed: bool,
}

impl MemoryCursor {
    fn open(rows: Vec<Row>, full_count: Option<u64>, open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        MemoryCursor {
            count: rows.len() as u64,
            rows: rows.into_iter(),
            full_count,
            open,
            closed: false,
        }
    }
}

impl QueryCursor for MemoryCursor {
    fn next_row(&mut self) -> Option<Result<Row>> {
        self.rows.next().map(Ok)
    }

    fn count(&self) -> Option<u64> {
        Some(self.count)
    }

    fn full_count(&self) -> Option<u64> {
        self.full_count
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MemoryCursor {
    fn drop(&mut self) {
        self.close();
    }
}
