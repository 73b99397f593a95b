#![forbid(unsafe_code)]

//! Query facade.
//!
//! [`QueryPipeline`] runs a declarative query through interpretation,
//! compilation and execution. [`QueryService`] puts the current user's read
//! filter and the response vocabulary around it, and hosts the scope engine.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::access::{AccessFilterResolver, AuthContext, SpaceDirectory};
use crate::backend::{GraphBackend, MemoryGraph};
use crate::config::EngineConfig;
use crate::query::ast::QuerySpecification;
use crate::query::{
    CompileRequest, CompiledQuery, Executor, PaginatedStream, PaginationParam, QueryCompiler,
    SpecificationInterpreter,
};
use crate::scope::{InstanceCatalog, ScopeElement, ScopeEngine, ScopeOptions};
use crate::types::{InstanceId, KgError, Result, Row, SpaceName, Stage};

/// Interpreter, compiler and executor bound to one backend.
pub struct QueryPipeline {
    interpreter: SpecificationInterpreter,
    compiler: QueryCompiler,
    executor: Executor,
    max_memory_bytes: Option<u64>,
}

impl fmt::Debug for QueryPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryPipeline")
            .field("dialect", &self.compiler.dialect())
            .field("max_memory_bytes", &self.max_memory_bytes)
            .finish_non_exhaustive()
    }
}

impl QueryPipeline {
    /// Pipeline executing through `backend`.
    pub fn new(compiler: QueryCompiler, backend: Arc<dyn GraphBackend>) -> Self {
        QueryPipeline {
            interpreter: SpecificationInterpreter::new(),
            compiler,
            executor: Executor::new(backend),
            max_memory_bytes: None,
        }
    }

    /// Memory ceiling applied to requests that do not carry their own.
    pub fn with_memory_limit(mut self, limit: Option<u64>) -> Self {
        self.max_memory_bytes = limit;
        self
    }

    /// Compiler in use.
    pub fn compiler(&self) -> &QueryCompiler {
        &self.compiler
    }

    /// Interprets and compiles `query` against the collections the backend
    /// currently holds.
    pub fn prepare(&self, query: &QuerySpecification, mut request: CompileRequest) -> Result<CompiledQuery> {
        let spec = self.interpreter.interpret(query)?;
        let known = self.executor.backend().known_collections(request.stage)?;
        request.max_memory_bytes = request.max_memory_bytes.or(self.max_memory_bytes);
        let request = request.with_known_collections(known);
        self.compiler.compile(Arc::new(spec), &request)
    }

    /// Prepares and executes `query`.
    pub fn run(&self, query: &QuerySpecification, request: CompileRequest) -> Result<PaginatedStream<Row>> {
        let stage = request.stage;
        let compiled = self.prepare(query, request)?;
        self.executor.execute_compiled(stage, &compiled)
    }
}

/// A query submission.
#[derive(Debug, Clone)]
pub struct KgQuery {
    /// Declarative query JSON.
    pub payload: Value,
    /// Stage to query.
    pub stage: Stage,
    /// Single root instance.
    pub id_restriction: Option<InstanceId>,
    /// Spaces results must come from; empty means all readable spaces.
    pub restrict_to_spaces: Vec<SpaceName>,
    /// Runtime filter values by parameter name.
    pub filter_values: BTreeMap<String, String>,
}

impl KgQuery {
    /// A query over `stage` without restrictions.
    pub fn new(payload: Value, stage: Stage) -> Self {
        KgQuery {
            payload,
            stage,
            id_restriction: None,
            restrict_to_spaces: Vec::new(),
            filter_values: BTreeMap::new(),
        }
    }

    /// Restricts the root to one instance.
    pub fn with_id_restriction(mut self, id: InstanceId) -> Self {
        self.id_restriction = Some(id);
        self
    }

    /// Restricts results to `spaces`.
    pub fn with_space_restriction(mut self, spaces: Vec<SpaceName>) -> Self {
        self.restrict_to_spaces = spaces;
        self
    }

    /// Supplies runtime filter values.
    pub fn with_filter_values(mut self, values: BTreeMap<String, String>) -> Self {
        self.filter_values = values;
        self
    }
}

/// Permission-aware query and scope entry point.
pub struct QueryService {
    pipeline: Arc<QueryPipeline>,
    resolver: AccessFilterResolver,
    auth: Arc<dyn AuthContext>,
    scope: ScopeEngine,
}

impl fmt::Debug for QueryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryService")
            .field("pipeline", &self.pipeline)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl QueryService {
    /// Wires a service from its collaborators.
    pub fn new(
        config: &EngineConfig,
        backend: Arc<dyn GraphBackend>,
        catalog: Arc<dyn InstanceCatalog>,
        spaces: Arc<dyn SpaceDirectory>,
        auth: Arc<dyn AuthContext>,
    ) -> Self {
        let pipeline = Arc::new(
            QueryPipeline::new(QueryCompiler::new(config.dialect), backend)
                .with_memory_limit(config.max_memory_bytes),
        );
        let scope = ScopeEngine::new(catalog, Arc::clone(&pipeline))
            .with_parallel(config.scope.parallel)
            .with_relevant_spaces(config.scope.relevant_spaces.clone());
        QueryService {
            pipeline,
            resolver: AccessFilterResolver::new(spaces),
            auth,
            scope,
        }
    }

    /// Service whose every collaborator except authentication is `graph`.
    pub fn in_memory(config: &EngineConfig, graph: Arc<MemoryGraph>, auth: Arc<dyn AuthContext>) -> Self {
        Self::new(config, graph.clone(), graph.clone(), graph, auth)
    }

    /// Underlying pipeline.
    pub fn pipeline(&self) -> &Arc<QueryPipeline> {
        &self.pipeline
    }

    /// Runs `query` for the current user.
    ///
    /// In scope mode the read filter is not applied. Otherwise a space
    /// restriction that leaves the user with nothing readable is
    /// [`KgError::Forbidden`].
    pub fn query(
        &self,
        query: &KgQuery,
        pagination: Option<PaginationParam>,
        scope_mode: bool,
    ) -> Result<PaginatedStream<Row>> {
        let specification = QuerySpecification::from_value(&query.payload)?;
        let vocab = specification
            .meta
            .as_ref()
            .and_then(|m| m.response_vocab.clone())
            .filter(|v| !v.is_empty());

        let access = if scope_mode {
            None
        } else {
            let user = self.auth.current_user()?;
            let restriction =
                (!query.restrict_to_spaces.is_empty()).then_some(query.restrict_to_spaces.as_slice());
            let filter = self.resolver.resolve(&user, query.stage, restriction)?;
            if restriction.is_some() && filter.as_ref().is_some_and(|f| f.is_empty()) {
                info!(user = %user.user_id, stage = %query.stage, "service.query.forbidden");
                return Err(KgError::Forbidden(format!(
                    "user {} cannot read any of the requested spaces",
                    user.user_id
                )));
            }
            filter
        };

        let mut request = CompileRequest::new(query.stage)
            .with_access_filter(access)
            .with_filter_values(query.filter_values.clone());
        if let Some(p) = pagination {
            request = request.with_pagination(p);
        }
        if !query.restrict_to_spaces.is_empty() {
            request = request.restrict_to_spaces(query.restrict_to_spaces.clone());
        }
        if let Some(id) = &query.id_restriction {
            request = request.restrict_to_instance(id.clone());
        }
        debug!(stage = %query.stage, scope_mode, "service.query.start");

        let stream = self.pipeline.run(&specification, request)?;
        Ok(match vocab {
            Some(vocab) => stream.map(move |row| apply_response_vocab(row, &vocab)),
            None => stream,
        })
    }

    /// Scope tree of one instance.
    pub fn scope_for_instance(
        &self,
        space: &SpaceName,
        id: Uuid,
        stage: Stage,
        options: ScopeOptions,
    ) -> Result<Option<ScopeElement>> {
        self.scope.get_scope_for_instance(space, id, stage, options)
    }
}

/// Prefixes every key of `row`, nested ones included, with `vocab` unless it
/// already carries it.
pub fn apply_response_vocab(row: Row, vocab: &str) -> Row {
    row.into_iter()
        .map(|(key, value)| {
            let key = if key.starts_with(vocab) {
                key
            } else {
                format!("{vocab}{key}")
            };
            (key, prefix_value(value, vocab))
        })
        .collect()
}

fn prefix_value(value: Value, vocab: &str) -> Value {
    match value {
        Value::Object(obj) => Value::Object(apply_response_vocab(obj, vocab)),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| prefix_value(v, vocab)).collect()),
        other => other,
    }
}
