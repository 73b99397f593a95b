//! Binary entry point for the kgquery administrative CLI.
#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use kgquery::access::{Functionality, Permission, StaticAuth, UserWithRoles};
use kgquery::backend::MemoryGraph;
use kgquery::config::EngineConfig;
use kgquery::query::spec::{SpecProperty, Specification};
use kgquery::query::{CompileRequest, Dialect, PaginationParam, QueryCompiler, SpecificationInterpreter, Statement};
use kgquery::scope::ScopeOptions;
use kgquery::types::{InstanceId, SpaceName, Stage};
use kgquery::{KgError, KgQuery, QueryService};
use nu_ansi_term::{Color, Style};
use serde_json::{json, Value};
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

const LOG_ENV: &str = "KGQUERY_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "kgquery",
    version,
    about = "Compile, run and inspect declarative knowledge-graph queries",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, env = "KGQUERY_CONFIG", help = "Engine config file (TOML)")]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Validate a query and print its normalized tree")]
    Validate {
        #[arg(value_name = "QUERY")]
        query: PathBuf,
    },

    #[command(about = "Compile a query into a backend statement")]
    Compile(CompileCmd),

    #[command(about = "Run a query against a JSON graph fixture")]
    Run(RunCmd),

    #[command(about = "Compute the scope of an instance in a JSON graph fixture")]
    Scope(ScopeCmd),
}

#[derive(Args, Debug)]
struct RequestArgs {
    #[arg(long, help = "Rows to skip")]
    from: Option<u64>,

    #[arg(long, help = "Page size")]
    size: Option<u64>,

    #[arg(long, help = "Request the total row count")]
    total: bool,

    #[arg(long = "restrict-space", value_name = "SPACE", help = "Only return instances of these spaces")]
    restrict_space: Vec<String>,

    #[arg(long, value_name = "UUID", requires = "id_space", help = "Restrict the root to one instance")]
    id: Option<Uuid>,

    #[arg(long = "id-space", value_name = "SPACE", requires = "id", help = "Space of --id")]
    id_space: Option<String>,

    #[arg(long = "filter", value_name = "NAME=VALUE", value_parser = parse_filter, help = "Runtime filter value")]
    filter: Vec<(String, String)>,
}

impl RequestArgs {
    fn pagination(&self) -> Option<PaginationParam> {
        if self.from.is_none() && self.size.is_none() && !self.total {
            return None;
        }
        Some(PaginationParam {
            from: self.from.unwrap_or(0),
            size: self.size,
            return_total: self.total,
        })
    }

    fn id_restriction(&self) -> Option<InstanceId> {
        match (self.id, &self.id_space) {
            (Some(id), Some(space)) => Some(InstanceId::new(id, space.as_str())),
            _ => None,
        }
    }

    fn spaces(&self) -> Vec<SpaceName> {
        self.restrict_space.iter().map(|s| SpaceName::from(s.as_str())).collect()
    }

    fn filter_values(&self) -> BTreeMap<String, String> {
        self.filter.iter().cloned().collect()
    }
}

#[derive(Args, Debug)]
struct CompileCmd {
    #[arg(value_name = "QUERY")]
    query: PathBuf,

    #[arg(long, value_enum, help = "Statement dialect; defaults to the configured one")]
    dialect: Option<DialectArg>,

    #[arg(long, default_value = "in-progress", value_parser = parse_stage, help = "Stage to query")]
    stage: Stage,

    #[arg(long, help = "Print the statement with bind values inlined")]
    debug: bool,

    #[command(flatten)]
    request: RequestArgs,
}

#[derive(Args, Debug)]
struct RunCmd {
    #[arg(value_name = "GRAPH")]
    graph: PathBuf,

    #[arg(value_name = "QUERY")]
    query: PathBuf,

    #[arg(long, default_value = "in-progress", value_parser = parse_stage, help = "Stage to query")]
    stage: Stage,

    #[arg(long, value_name = "FILE", help = "User with roles (JSON); a global reader when absent")]
    user: Option<PathBuf>,

    #[command(flatten)]
    request: RequestArgs,
}

#[derive(Args, Debug)]
struct ScopeCmd {
    #[arg(value_name = "GRAPH")]
    graph: PathBuf,

    #[arg(long, help = "Space of the instance")]
    space: String,

    #[arg(long, help = "Instance uuid")]
    id: Uuid,

    #[arg(long, default_value = "in-progress", value_parser = parse_stage, help = "Stage to inspect")]
    stage: Stage,

    #[arg(long, help = "Resolve display labels")]
    labels: bool,

    #[arg(long, help = "Leave out instances of excludable types")]
    restrictions: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum DialectArg {
    Aql,
    Cypher,
}

impl From<DialectArg> for Dialect {
    fn from(arg: DialectArg) -> Self {
        match arg {
            DialectArg::Aql => Dialect::Aql,
            DialectArg::Cypher => Dialect::Cypher,
        }
    }
}

fn parse_stage(raw: &str) -> Result<Stage, String> {
    raw.parse::<Stage>().map_err(|err| err.to_string())
}

fn parse_filter(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_owned(), value.to_owned())),
        _ => Err(format!("expected NAME=VALUE, got '{raw}'")),
    }
}

fn main() {
    install_tracing_subscriber();
    if let Err(err) = run() {
        let code = err
            .downcast_ref::<KgError>()
            .map(KgError::code)
            .unwrap_or("Error");
        eprintln!("error[{code}]: {err}");
        std::process::exit(1);
    }
}

fn install_tracing_subscriber() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = EngineConfig::load(cli.config.clone())?;
    let ui = Ui::new();

    match cli.command {
        Command::Validate { query } => {
            let spec = SpecificationInterpreter::new().read_json(&read_json(&query)?)?;
            emit(cli.format, &spec, || print_spec_text(&ui, &spec))?;
        }
        Command::Compile(cmd) => {
            let spec = SpecificationInterpreter::new().read_json(&read_json(&cmd.query)?)?;
            let dialect = cmd.dialect.map(Dialect::from).unwrap_or(config.dialect);
            let compiled = QueryCompiler::new(dialect).compile(Arc::new(spec), &compile_request(&cmd, &config))?;
            let report = json!({
                "dialect": dialect.to_string(),
                "statement": statement_json(&compiled.statement, cmd.debug),
                "count": compiled.count.as_ref().map(|c| statement_json(c, cmd.debug)),
            });
            emit(cli.format, &report, || {
                print_statement_text(&ui, "Statement", &compiled.statement, cmd.debug);
                if let Some(count) = &compiled.count {
                    print_statement_text(&ui, "Count statement", count, cmd.debug);
                }
            })?;
        }
        Command::Run(cmd) => {
            let graph = Arc::new(MemoryGraph::load(&cmd.graph)?);
            let user = match &cmd.user {
                Some(path) => serde_json::from_value::<UserWithRoles>(read_json(path)?)?,
                None => global_reader(),
            };
            let service = QueryService::in_memory(&config, graph, Arc::new(StaticAuth(user)));
            let mut query = KgQuery::new(read_json(&cmd.query)?, cmd.stage)
                .with_space_restriction(cmd.request.spaces())
                .with_filter_values(cmd.request.filter_values());
            if let Some(id) = cmd.request.id_restriction() {
                query = query.with_id_restriction(id);
            }
            let page = service.query(&query, cmd.request.pagination(), false)?.into_page()?;
            emit(cli.format, &page, || {
                ui.heading("Result");
                ui.field("from", page.from);
                ui.field("size", page.size);
                ui.field("total", page.total.map_or_else(|| "-".to_owned(), |t| t.to_string()));
                for row in &page.data {
                    println!("{}", Value::Object(row.clone()));
                }
            })?;
        }
        Command::Scope(cmd) => {
            let graph = Arc::new(MemoryGraph::load(&cmd.graph)?);
            let service = QueryService::in_memory(&config, graph, Arc::new(StaticAuth(global_reader())));
            let options = ScopeOptions {
                apply_labels: cmd.labels,
                apply_restrictions: cmd.restrictions,
            };
            let space = SpaceName::from(cmd.space.as_str());
            let scope = service
                .scope_for_instance(&space, cmd.id, cmd.stage, options)?
                .ok_or_else(|| KgError::NotFound(format!("instance {space}/{}", cmd.id)))?;
            emit(cli.format, &scope, || {
                ui.heading("Scope");
                print_scope_text(&scope, 1);
                ui.heading("Types");
                for (ty, ids) in scope.by_type() {
                    ui.field(&ty, ids.len());
                }
            })?;
        }
    }
    Ok(())
}

fn read_json(path: &Path) -> Result<Value, KgError> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn global_reader() -> UserWithRoles {
    UserWithRoles::new(
        "cli",
        vec![
            Permission::global(Functionality::Read),
            Permission::global(Functionality::ReadReleased),
        ],
    )
}

fn compile_request(cmd: &CompileCmd, config: &EngineConfig) -> CompileRequest {
    let mut request = CompileRequest::new(cmd.stage)
        .with_filter_values(cmd.request.filter_values())
        .with_memory_limit(config.max_memory_bytes);
    if let Some(p) = cmd.request.pagination() {
        request = request.with_pagination(p);
    }
    let spaces = cmd.request.spaces();
    if !spaces.is_empty() {
        request = request.restrict_to_spaces(spaces);
    }
    if let Some(id) = cmd.request.id_restriction() {
        request = request.restrict_to_instance(id);
    }
    request
}

fn statement_json(statement: &Statement, debug: bool) -> Value {
    let mut value = json!({
        "text": statement.text(),
        "bindings": statement.bindings(),
    });
    if debug {
        value["debug"] = Value::String(statement.debug_render());
    }
    value
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: FnOnce(),
{
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_spec_text(ui: &Ui, spec: &Specification) {
    ui.heading("Specification");
    ui.field("type", &spec.root_type.name);
    if let Some(vocab) = &spec.response_vocab {
        ui.field("responseVocab", vocab);
    }
    for property in &spec.properties {
        print_property(property, 1);
    }
}

fn print_property(property: &SpecProperty, depth: usize) {
    let path: Vec<String> = property
        .path
        .iter()
        .map(|t| if t.reverse { format!("<-{}", t.path_name) } else { t.path_name.clone() })
        .collect();
    let mut flags = Vec::new();
    for (set, name) in [
        (property.required, "required"),
        (property.sort, "sort"),
        (property.group_by, "groupBy"),
        (property.ensure_order, "ensureOrder"),
    ] {
        if set {
            flags.push(name);
        }
    }
    println!(
        "{}{} [{}] {}{}",
        "  ".repeat(depth),
        property.property_name,
        property.alias(),
        path.join(" / "),
        if flags.is_empty() { String::new() } else { format!(" ({})", flags.join(", ")) }
    );
    for child in &property.property {
        print_property(child, depth + 1);
    }
}

fn print_statement_text(ui: &Ui, title: &str, statement: &Statement, debug: bool) {
    ui.heading(title);
    println!("{}", statement.text());
    if !statement.bindings().is_empty() {
        ui.heading("Bindings");
        for (name, value) in statement.bindings() {
            ui.field(name, value);
        }
    }
    if debug {
        ui.heading("Debug rendering");
        println!("{}", statement.debug_render());
    }
}

fn print_scope_text(element: &kgquery::scope::ScopeElement, depth: usize) {
    println!(
        "{}{} {} {}",
        "  ".repeat(depth),
        element.id,
        element.types.join(","),
        element.label.as_deref().unwrap_or("")
    );
    for child in element.children.iter().flatten() {
        print_scope_text(child, depth + 1);
    }
}

struct Ui {
    paint: bool,
    heading: Style,
    key: Style,
}

impl Ui {
    fn new() -> Self {
        Ui {
            paint: std::io::stdout().is_terminal(),
            heading: Color::Cyan.bold(),
            key: Style::new().fg(Color::LightBlue),
        }
    }

    fn heading(&self, title: &str) {
        let formatted = format!("== {title}");
        if self.paint {
            println!("{}", self.heading.paint(formatted));
        } else {
            println!("{formatted}");
        }
    }

    fn field(&self, key: &str, value: impl std::fmt::Display) {
        if self.paint {
            println!("  {} {value}", self.key.paint(format!("{key}:")));
        } else {
            println!("  {key}: {value}");
        }
    }
}
