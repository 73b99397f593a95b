#![forbid(unsafe_code)]

//! Compiles specifications into backend statements.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, enabled, trace, Level};

use crate::access::AccessFilter;
use crate::query::plan::QueryPlan;
use crate::query::spec::Specification;
use crate::query::trusted::{QueryOptions, TrustedQuery};
use crate::query::{Dialect, PaginationParam};
use crate::types::{CollectionRef, InstanceId, Result, SpaceName, Stage};

/// Edge-traversal-as-join rendering for document stores.
pub mod aql;
/// Pattern-match rendering for property graphs.
pub mod cypher;

pub use aql::AqlRenderer;
pub use cypher::CypherRenderer;

/// Inputs that accompany a specification into compilation.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    /// Stage to query.
    pub stage: Stage,
    /// Requested page.
    pub pagination: Option<PaginationParam>,
    /// Read filter; `None` for unrestricted or scope-mode queries.
    pub access_filter: Option<AccessFilter>,
    /// Spaces every visited document must live in.
    pub space_restriction: Option<Vec<SpaceName>>,
    /// Single root instance.
    pub id_restriction: Option<InstanceId>,
    /// Runtime values for filter parameters.
    pub filter_values: BTreeMap<String, String>,
    /// Collections present in the backend; `None` when unknown.
    pub known_collections: Option<BTreeSet<CollectionRef>>,
    /// Backend memory ceiling for the statement.
    pub max_memory_bytes: Option<u64>,
}

impl CompileRequest {
    /// A request with no pagination, filters or restrictions.
    pub fn new(stage: Stage) -> Self {
        CompileRequest {
            stage,
            pagination: None,
            access_filter: None,
            space_restriction: None,
            id_restriction: None,
            filter_values: BTreeMap::new(),
            known_collections: None,
            max_memory_bytes: None,
        }
    }

    /// Sets the page.
    pub fn with_pagination(mut self, pagination: PaginationParam) -> Self {
        self.pagination = Some(pagination);
        self
    }

    /// Sets the read filter.
    pub fn with_access_filter(mut self, filter: Option<AccessFilter>) -> Self {
        self.access_filter = filter;
        self
    }

    /// Restricts visited documents to `spaces`.
    pub fn restrict_to_spaces(mut self, spaces: Vec<SpaceName>) -> Self {
        self.space_restriction = Some(spaces);
        self
    }

    /// Restricts the root to one instance.
    pub fn restrict_to_instance(mut self, id: InstanceId) -> Self {
        self.id_restriction = Some(id);
        self
    }

    /// Sets runtime filter values.
    pub fn with_filter_values(mut self, values: BTreeMap<String, String>) -> Self {
        self.filter_values = values;
        self
    }

    /// Sets the collections known to exist.
    pub fn with_known_collections(mut self, known: BTreeSet<CollectionRef>) -> Self {
        self.known_collections = Some(known);
        self
    }

    /// Sets the backend memory ceiling.
    pub fn with_memory_limit(mut self, limit: Option<u64>) -> Self {
        self.max_memory_bytes = limit;
        self
    }
}

/// Renders a [`QueryPlan`] in one statement language.
pub trait StatementRenderer: Send + Sync {
    /// Language produced.
    fn dialect(&self) -> Dialect;

    /// Renders the plan. Count-only plans project a single `count` column.
    fn render(&self, plan: &QueryPlan) -> Result<TrustedQuery>;
}

/// A rendered statement ready for execution.
#[derive(Debug, Clone)]
pub struct Statement {
    /// Language of `query`.
    pub dialect: Dialect,
    /// Text and bindings.
    pub query: TrustedQuery,
    /// Plan the statement was rendered from.
    pub plan: Arc<QueryPlan>,
    /// Backend memory ceiling.
    pub memory_limit: Option<u64>,
}

impl Statement {
    /// Statement text.
    pub fn text(&self) -> &str {
        &self.query.text
    }

    /// Bound parameters.
    pub fn bindings(&self) -> &BTreeMap<String, Value> {
        &self.query.bindings
    }

    /// Requested count options.
    pub fn options(&self) -> QueryOptions {
        self.query.options
    }

    /// Whether this statement projects only a row count.
    pub fn is_count(&self) -> bool {
        self.plan.count_only
    }

    /// Page the statement was compiled for.
    pub fn pagination(&self) -> Option<PaginationParam> {
        self.plan.pagination
    }

    /// Text with bindings inlined, for logs only.
    pub fn debug_render(&self) -> String {
        self.query.debug_render()
    }
}

/// Primary statement plus the optional count companion.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    /// Row-producing statement.
    pub statement: Statement,
    /// Count-only statement, present when a total was requested for a finite
    /// page.
    pub count: Option<Statement>,
}

/// Compiles [`Specification`]s with a configured renderer.
#[derive(Clone)]
pub struct QueryCompiler {
    renderer: Arc<dyn StatementRenderer>,
}

impl std::fmt::Debug for QueryCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCompiler")
            .field("dialect", &self.renderer.dialect())
            .finish()
    }
}

impl QueryCompiler {
    /// Compiler for a built-in dialect.
    pub fn new(dialect: Dialect) -> Self {
        match dialect {
            Dialect::Aql => Self::with_renderer(Arc::new(AqlRenderer)),
            Dialect::Cypher => Self::with_renderer(Arc::new(CypherRenderer)),
        }
    }

    /// Compiler for a custom renderer.
    pub fn with_renderer(renderer: Arc<dyn StatementRenderer>) -> Self {
        QueryCompiler { renderer }
    }

    /// Target dialect.
    pub fn dialect(&self) -> Dialect {
        self.renderer.dialect()
    }

    /// Compiles `spec` for `request`.
    pub fn compile(&self, spec: Arc<Specification>, request: &CompileRequest) -> Result<CompiledQuery> {
        let plan = Arc::new(QueryPlan::build(spec, request));
        let statement = self.render(Arc::clone(&plan), request.max_memory_bytes)?;
        let wants_count = plan
            .pagination
            .is_some_and(|p| p.return_total && p.size.is_some());
        let count = if wants_count {
            Some(self.render(Arc::new(plan.as_count()), request.max_memory_bytes)?)
        } else {
            None
        };
        debug!(
            dialect = %self.dialect(),
            bindings = statement.bindings().len(),
            with_count = count.is_some(),
            "compiler.compile.complete"
        );
        Ok(CompiledQuery { statement, count })
    }

    fn render(&self, plan: Arc<QueryPlan>, memory_limit: Option<u64>) -> Result<Statement> {
        let query = self.renderer.render(&plan)?;
        if enabled!(Level::TRACE) {
            trace!(statement = %query.debug_render(), "compiler.render.debug");
        }
        Ok(Statement {
            dialect: self.renderer.dialect(),
            query,
            plan,
            memory_limit,
        })
    }
}
