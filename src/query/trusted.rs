#![forbid(unsafe_code)]

//! Injection-safe statement assembly.
//!
//! Statement text is built exclusively from [`Trusted`] fragments: either
//! compile-time literals or client strings passed through [`Trusted::sanitize`].
//! Every other client value travels as a bound parameter, so raw input never
//! reaches the statement text.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::query::PaginationParam;

/// Indentation unit used when nesting sub-statements.
const INDENT: &str = "   ";

/// A fragment that is safe to splice into statement text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trusted(String);

impl Trusted {
    /// Wraps a compile-time constant.
    pub fn literal(text: &'static str) -> Self {
        Trusted(text.to_owned())
    }

    /// Keeps only `[A-Za-z0-9-_:.#/@]` of a client-supplied string.
    ///
    /// Input made up entirely of disallowed characters sanitizes to the empty
    /// string rather than failing.
    pub fn sanitize(value: &str) -> Self {
        Trusted(
            value
                .chars()
                .filter(|c| {
                    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.' | '#' | '/' | '@')
                })
                .collect(),
        )
    }

    /// Decimal rendering of a number.
    pub fn number(value: u64) -> Self {
        Trusted(value.to_string())
    }

    /// Concatenates trusted fragments.
    pub fn join(parts: &[&Trusted], separator: &'static str) -> Self {
        Trusted(
            parts
                .iter()
                .map(|p| p.0.as_str())
                .collect::<Vec<_>>()
                .join(separator),
        )
    }

    /// Appends another trusted fragment.
    pub fn concat(mut self, other: &Trusted) -> Self {
        self.0.push_str(&other.0);
        self
    }

    /// Borrowed text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether sanitization removed everything.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Trusted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Placeholder syntax of the target dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamStyle {
    /// `@name`, with `@@name` for collection parameters.
    At,
    /// `$name`.
    Dollar,
}

impl ParamStyle {
    fn sigil(self) -> char {
        match self {
            ParamStyle::At => '@',
            ParamStyle::Dollar => '$',
        }
    }
}

/// Execution options a statement requests from the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Ask the backend for the row count ignoring LIMIT.
    pub full_count: bool,
    /// Ask the backend for the number of rows it returns.
    pub count: bool,
}

/// A finished statement: text plus named bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustedQuery {
    /// Statement text.
    pub text: String,
    /// Bound parameters keyed by name, without the placeholder sigil.
    pub bindings: BTreeMap<String, Value>,
    /// Requested execution options.
    pub options: QueryOptions,
    style: ParamStyle,
}

impl TrustedQuery {
    /// Renders the statement with bindings inlined.
    ///
    /// The output is for logs only and must never be executed.
    pub fn debug_render(&self) -> String {
        debug_render(&self.text, &self.bindings, self.style)
    }
}

/// Incremental builder for [`TrustedQuery`].
#[derive(Debug)]
pub struct TrustedQueryBuilder {
    text: String,
    indent: usize,
    bindings: BTreeMap<String, Value>,
    options: QueryOptions,
    style: ParamStyle,
}

impl TrustedQueryBuilder {
    /// Creates an empty builder for the given placeholder style.
    pub fn new(style: ParamStyle) -> Self {
        TrustedQueryBuilder {
            text: String::new(),
            indent: 0,
            bindings: BTreeMap::new(),
            options: QueryOptions::default(),
            style,
        }
    }

    /// Appends a fragment to the current line.
    pub fn add(&mut self, fragment: &Trusted) -> &mut Self {
        self.text.push_str(fragment.as_str());
        self
    }

    /// Appends a literal to the current line.
    pub fn push(&mut self, text: &'static str) -> &mut Self {
        self.text.push_str(text);
        self
    }

    /// Starts a new, indented line and appends a fragment.
    pub fn add_line(&mut self, fragment: &Trusted) -> &mut Self {
        self.new_line();
        self.add(fragment)
    }

    /// Starts a new, indented line and appends a literal.
    pub fn line(&mut self, text: &'static str) -> &mut Self {
        self.new_line();
        self.push(text)
    }

    fn new_line(&mut self) {
        if !self.text.is_empty() {
            self.text.push('\n');
        }
        for _ in 0..self.indent {
            self.text.push_str(INDENT);
        }
    }

    /// Increases indentation for subsequent lines.
    pub fn indent(&mut self) -> &mut Self {
        self.indent += 1;
        self
    }

    /// Decreases indentation for subsequent lines.
    pub fn outdent(&mut self) -> &mut Self {
        self.indent = self.indent.saturating_sub(1);
        self
    }

    /// Binds `value` under `name` and returns the placeholder to splice in.
    ///
    /// The name is sanitized. Rebinding a name overwrites the earlier value.
    pub fn bind(&mut self, name: &str, value: impl Into<Value>) -> Trusted {
        let key = Trusted::sanitize(name);
        let value = value.into();
        if let Some(previous) = self.bindings.insert(key.0.clone(), value.clone()) {
            if previous != value {
                debug!(name = key.as_str(), "trusted.bind.overwrite");
            }
        }
        Trusted(format!("{}{}", self.style.sigil(), key.0))
    }

    /// Emits `LIMIT from, size` when a page size is set and configures the
    /// count options.
    ///
    /// Without a page size the backend is only asked for the plain row count.
    pub fn add_pagination(&mut self, pagination: Option<&PaginationParam>) -> &mut Self {
        match pagination {
            Some(PaginationParam {
                from,
                size: Some(size),
                return_total,
            }) => {
                let clause = Trusted::literal("LIMIT ")
                    .concat(&Trusted::number(*from))
                    .concat(&Trusted::literal(", "))
                    .concat(&Trusted::number(*size));
                self.add_line(&clause);
                self.options.full_count = *return_total;
                self.options.count = false;
            }
            _ => {
                self.options.count = true;
            }
        }
        self
    }

    /// Sets the execution options directly.
    pub fn set_options(&mut self, options: QueryOptions) -> &mut Self {
        self.options = options;
        self
    }

    /// Current bindings.
    pub fn bindings(&self) -> &BTreeMap<String, Value> {
        &self.bindings
    }

    /// Renders the statement built so far with bindings inlined.
    pub fn debug_render(&self) -> String {
        debug_render(&self.text, &self.bindings, self.style)
    }

    /// Finishes the statement.
    pub fn build(self) -> TrustedQuery {
        TrustedQuery {
            text: self.text,
            bindings: self.bindings,
            options: self.options,
            style: self.style,
        }
    }
}

fn debug_render(text: &str, bindings: &BTreeMap<String, Value>, style: ParamStyle) -> String {
    let sigil = style.sigil();
    let mut rendered = text.to_owned();
    // Longest names first so `@id` does not clobber `@idList`.
    let mut names: Vec<&String> = bindings.keys().collect();
    names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    for name in names {
        let value = &bindings[name];
        let placeholder = format!("{sigil}{name}");
        let inlined = match value {
            Value::String(s) if name.starts_with('@') => format!("`{s}`"),
            Value::String(s) => format!("\"{s}\""),
            other => other.to_string(),
        };
        rendered = rendered.replace(&placeholder, &inlined);
    }
    rendered
}
