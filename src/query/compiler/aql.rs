#![forbid(unsafe_code)]

//! AQL rendering.
//!
//! Every traversed property becomes a `LET` sub-query per hop, nested inside
//! the previous hop, so optional branches never drop the parent row. Required
//! properties and value filters become `FILTER` lines on the parent.

use serde_json::{Map, Value};

use crate::query::ast::{FilterOp, SingleValue};
use crate::query::compiler::StatementRenderer;
use crate::query::plan::{QueryPlan, ResolvedFilter, RootSelection};
use crate::query::spec::SpecProperty;
use crate::query::trusted::{ParamStyle, QueryOptions, Trusted, TrustedQuery, TrustedQueryBuilder};
use crate::query::Dialect;
use crate::types::{CollectionRef, Result};

/// Collection holding type documents.
pub const TYPE_COLLECTION: &str = "types";
/// Edge collection linking type documents to their instances.
pub const TYPE_RELATION: &str = "typeOf";

/// Renders plans as AQL.
#[derive(Debug, Default, Clone, Copy)]
pub struct AqlRenderer;

impl StatementRenderer for AqlRenderer {
    fn dialect(&self) -> Dialect {
        Dialect::Aql
    }

    fn render(&self, plan: &QueryPlan) -> Result<TrustedQuery> {
        let mut writer = AqlWriter {
            plan,
            b: TrustedQueryBuilder::new(ParamStyle::At),
        };
        writer.statement();
        Ok(writer.b.build())
    }
}

fn lit(text: &'static str) -> Trusted {
    Trusted::literal(text)
}

fn cat(parts: &[&Trusted]) -> Trusted {
    Trusted::join(parts, "")
}

fn var(name: &str) -> Trusted {
    Trusted::sanitize(name)
}

fn attr(doc: &Trusted, key: &str) -> Trusted {
    cat(&[doc, &lit(".`"), &Trusted::sanitize(key), &lit("`")])
}

/// Expands merge nodes into their children, recursively.
fn output_fields(props: &[SpecProperty]) -> Vec<&SpecProperty> {
    let mut fields = Vec::new();
    for p in props {
        if p.is_merge() {
            fields.extend(output_fields(&p.property));
        } else {
            fields.push(p);
        }
    }
    fields
}

struct AqlWriter<'p> {
    plan: &'p QueryPlan,
    b: TrustedQueryBuilder,
}

impl AqlWriter<'_> {
    fn statement(&mut self) {
        let plan = self.plan;
        let root = lit("root_doc");
        if let Some(access) = &plan.access {
            let spaces: Vec<Value> = access
                .allowed_spaces
                .iter()
                .map(|s| Value::String(CollectionRef::for_space(s).name().to_owned()))
                .collect();
            let whitelist = self.b.bind("readAccessBySpace", spaces);
            self.b.add_line(&cat(&[&lit("LET whitelist="), &whitelist]));
            let invitations: Map<String, Value> = access
                .permitted_instances
                .iter()
                .map(|id| (id.to_string(), Value::Bool(true)))
                .collect();
            let invitation = self.b.bind("readAccessByInvitation", Value::Object(invitations));
            self.b.add_line(&cat(&[&lit("LET invitation="), &invitation]));
        }

        match &plan.root {
            RootSelection::Document(id) => {
                let coll = self
                    .b
                    .bind("@rootCollection", CollectionRef::for_space(&id.space).name());
                let key = self.b.bind("rootId", id.uuid.to_string());
                self.b.add_line(&cat(&[
                    &lit("LET root_doc = DOCUMENT("),
                    &coll,
                    &lit(", "),
                    &key,
                    &lit(")"),
                ]));
            }
            RootSelection::TypeScan { type_name } => {
                let coll = self.b.bind("@typeCollection", TYPE_COLLECTION);
                let ty = self.b.bind("typeId", type_name.as_str());
                let rel = self.b.bind("@typeRelation", TYPE_RELATION);
                self.b.add_line(&cat(&[
                    &lit("FOR root_doc IN 1..1 OUTBOUND DOCUMENT("),
                    &coll,
                    &lit(", "),
                    &ty,
                    &lit(") "),
                    &rel,
                ]));
            }
        }

        self.restrictions(&root);
        if let Some(filter) = &plan.document_filter {
            let expr = self.filter_expr(&attr(&root, "@id"), filter);
            self.b.add_line(&cat(&[&lit("FILTER "), &expr]));
        }
        self.traversals(&root, &plan.spec.properties);
        self.filters(&root, &plan.spec.properties);

        if plan.count_only {
            self.b.line("COLLECT WITH COUNT INTO length");
            self.b.line("RETURN { \"count\": length }");
            self.b.set_options(QueryOptions::default());
            return;
        }

        let sorted: Vec<Trusted> = output_fields(&plan.spec.properties)
            .into_iter()
            .filter(|p| p.sort)
            .map(|p| cat(&[&self.field(&root, p), &lit(" ASC")]))
            .collect();
        if !sorted.is_empty() {
            let refs: Vec<&Trusted> = sorted.iter().collect();
            self.b.add_line(&cat(&[&lit("SORT "), &Trusted::join(&refs, ", ")]));
        }
        self.b.add_pagination(plan.pagination.as_ref());
        self.returns(&root, &plan.spec.properties, false);
    }

    /// Non-null, access and space restrictions on a visited document.
    fn restrictions(&mut self, doc: &Trusted) {
        self.b.add_line(&cat(&[&lit("FILTER "), doc, &lit(" != NULL")]));
        if self.plan.access.is_some() {
            self.b.add_line(&cat(&[
                &lit("FILTER PARSE_IDENTIFIER("),
                doc,
                &lit(").collection IN whitelist OR HAS(invitation, "),
                doc,
                &lit("._key)"),
            ]));
        }
        if let Some(spaces) = &self.plan.space_restriction {
            let names: Vec<Value> = spaces
                .iter()
                .map(|s| Value::String(CollectionRef::for_space(s).name().to_owned()))
                .collect();
            let p = self.b.bind("spaceRestriction", names);
            self.b.add_line(&cat(&[
                &lit("FILTER PARSE_IDENTIFIER("),
                doc,
                &lit(").collection IN "),
                &p,
            ]));
        }
    }

    fn traversals(&mut self, parent: &Trusted, props: &[SpecProperty]) {
        for p in props {
            if p.is_merge() {
                self.traversals(parent, &p.property);
            } else if p.needs_traversal() {
                self.traversal(parent, p);
            }
        }
    }

    fn traversal(&mut self, parent: &Trusted, p: &SpecProperty) {
        let alias = p.alias();
        let steps = p.edge_steps();
        let mut step_aliases = Vec::with_capacity(steps.len());
        let mut current = parent.clone();

        for (i, step) in steps.iter().enumerate() {
            let step_alias = if i == 0 {
                alias.clone()
            } else {
                format!("{alias}_s{i}")
            };
            let doc = var(&format!("{step_alias}_doc"));
            let edge = var(&format!("{step_alias}_edge"));
            let mut open = cat(&[&lit("LET "), &var(&step_alias), &lit(" = ")]);
            if i == 0 {
                match p.single_item {
                    Some(SingleValue::First) => open = open.concat(&lit("FIRST(")),
                    Some(SingleValue::Concat) => open = open.concat(&lit("CONCAT_SEPARATOR(\", \", ")),
                    None => {}
                }
                if p.sort {
                    open = cat(&[&open, &lit("(FOR "), &var(&format!("{alias}_sort")), &lit(" IN ")]);
                }
            }
            open = open.concat(&lit(if p.ensure_order { "FLATTEN(" } else { "UNIQUE(FLATTEN(" }));
            self.b.add_line(&open).indent();

            let exists = self.plan.edge_exists(step);
            if exists {
                let direction = lit(if step.reverse { " INBOUND " } else { " OUTBOUND " });
                let coll = var(CollectionRef::for_relation(&step.path_name).name());
                let head = if p.ensure_order {
                    cat(&[&lit("FOR "), &doc, &lit(", "), &edge, &lit(" IN 1..1")])
                } else {
                    cat(&[&lit("FOR "), &doc, &lit(" IN 1..1")])
                };
                self.b
                    .add_line(&cat(&[&head, &direction, &current, &lit(" `"), &coll, &lit("`")]));
            } else {
                self.b.add_line(&cat(&[&lit("FOR "), &doc, &lit(" IN []")]));
            }
            self.restrictions(&doc);
            if !step.type_filter.is_empty() {
                let types: Vec<Value> = step.type_filter.iter().cloned().map(Value::String).collect();
                let p_types = self.b.bind(&format!("{step_alias}_types"), types);
                self.b.add_line(&cat(&[
                    &lit("FILTER "),
                    &p_types,
                    &lit(" ANY IN "),
                    &attr(&doc, "@type"),
                ]));
            }
            if p.ensure_order && exists {
                self.b
                    .add_line(&cat(&[&lit("SORT "), &edge, &lit("._orderNumber ASC")]));
            }
            step_aliases.push(step_alias);
            current = doc;
        }

        let distinct = lit(if p.ensure_order { "RETURN " } else { "RETURN DISTINCT " });
        match p.leaf_path() {
            Some(leaf) => {
                let field = attr(&current, &leaf.path_name);
                self.b.add_line(&cat(&[&lit("FILTER "), &field, &lit(" != NULL")]));
                self.b.add_line(&cat(&[&distinct, &field]));
            }
            None => {
                self.traversals(&current, &p.property);
                self.filters(&current, &p.property);
                self.returns(&current, &p.property, true);
            }
        }

        let close = lit(if p.ensure_order { ")" } else { "))" });
        for i in (0..steps.len()).rev() {
            self.b.outdent();
            self.b.add_line(&close);
            if i > 0 {
                self.b.add_line(&cat(&[&distinct, &var(&step_aliases[i])]));
            }
        }
        if p.sort {
            let sort = var(&format!("{alias}_sort"));
            self.b
                .add(&cat(&[&lit(" SORT "), &sort, &lit(" ASC RETURN "), &sort, &lit(")")]));
        }
        if p.single_item.is_some() {
            self.b.push(")");
        }
        if p.has_grouping() {
            self.grouping(p);
        }
    }

    fn grouping(&mut self, p: &SpecProperty) {
        let alias = p.alias();
        let item = var(&format!("{alias}_g"));
        let inner = var(&format!("{alias}_gi"));
        let group = var(&format!("{alias}_group"));
        let instances_key = Trusted::sanitize(p.grouped_instances.as_deref().unwrap_or_default());

        self.b
            .add_line(&cat(&[&lit("LET "), &var(&p.group_alias()), &lit(" = (")]))
            .indent();
        self.b
            .add_line(&cat(&[&lit("FOR "), &item, &lit(" IN "), &var(&alias)]));

        let keys: Vec<(&SpecProperty, Trusted)> = p
            .property
            .iter()
            .filter(|c| c.group_by)
            .enumerate()
            .map(|(i, c)| (c, var(&format!("{alias}_k{i}"))))
            .collect();
        let collect: Vec<Trusted> = keys
            .iter()
            .map(|(c, k)| cat(&[k, &lit(" = "), &attr(&item, &c.output_key())]))
            .collect();
        let collect_refs: Vec<&Trusted> = collect.iter().collect();
        self.b.add_line(&cat(&[
            &lit("COLLECT "),
            &Trusted::join(&collect_refs, ", "),
            &lit(" INTO "),
            &group,
        ]));
        if keys.iter().any(|(c, _)| c.sort) {
            let order: Vec<Trusted> = p
                .group_sort_keys()
                .into_iter()
                .filter_map(|c| keys.iter().find(|(k, _)| k.alias_postfix() == c.alias_postfix()))
                .map(|(_, k)| cat(&[k, &lit(" ASC")]))
                .collect();
            let order_refs: Vec<&Trusted> = order.iter().collect();
            self.b
                .add_line(&cat(&[&lit("SORT "), &Trusted::join(&order_refs, ", ")]));
        }

        let rest: Vec<Trusted> = p
            .property
            .iter()
            .filter(|c| !c.group_by)
            .map(|c| {
                let key = Trusted::sanitize(&c.output_key());
                cat(&[&lit("\""), &key, &lit("\": "), &attr(&inner, &c.output_key())])
            })
            .collect();
        let rest_refs: Vec<&Trusted> = rest.iter().collect();
        let member_order: Vec<Trusted> = p
            .member_sort_keys()
            .into_iter()
            .map(|c| cat(&[&attr(&inner, &c.output_key()), &lit(" ASC")]))
            .collect();
        let member_sort = if member_order.is_empty() {
            lit("")
        } else {
            let refs: Vec<&Trusted> = member_order.iter().collect();
            cat(&[&lit(" SORT "), &Trusted::join(&refs, ", ")])
        };
        self.b.add_line(&cat(&[
            &lit("LET instances = (FOR "),
            &inner,
            &lit(" IN "),
            &group,
            &lit("[*]."),
            &item,
            &member_sort,
            &lit(" RETURN { "),
            &Trusted::join(&rest_refs, ", "),
            &lit(" })"),
        ]));

        let mut fields: Vec<Trusted> = keys
            .iter()
            .map(|(c, k)| cat(&[&lit("\""), &Trusted::sanitize(&c.output_key()), &lit("\": "), k]))
            .collect();
        fields.push(cat(&[&lit("\""), &instances_key, &lit("\": instances")]));
        let field_refs: Vec<&Trusted> = fields.iter().collect();
        self.b.add_line(&cat(&[
            &lit("RETURN { "),
            &Trusted::join(&field_refs, ", "),
            &lit(" }"),
        ]));
        self.b.outdent().line(")");
    }

    fn field(&self, doc: &Trusted, p: &SpecProperty) -> Trusted {
        if p.is_direct_child() {
            match p.leaf_path() {
                Some(leaf) => attr(doc, &leaf.path_name),
                None => lit("null"),
            }
        } else if p.has_grouping() {
            var(&p.group_alias())
        } else {
            var(&p.alias())
        }
    }

    fn filters(&mut self, doc: &Trusted, props: &[SpecProperty]) {
        for p in output_fields(props) {
            let field = self.field(doc, p);
            if p.required {
                self.b.add_line(&cat(&[
                    &lit("FILTER "),
                    &field,
                    &lit(" != NULL AND "),
                    &field,
                    &lit(" != \"\" AND "),
                    &field,
                    &lit(" != []"),
                ]));
            }
            if let Some(filter) = self.plan.filter_for(p) {
                let expr = self.filter_expr(&field, filter);
                self.b.add_line(&cat(&[&lit("FILTER "), &expr]));
            }
        }
    }

    fn filter_expr(&mut self, field: &Trusted, filter: &ResolvedFilter) -> Trusted {
        let (op, operand) = match filter.op {
            FilterOp::IsEmpty => {
                return cat(&[
                    &lit("("),
                    field,
                    &lit(" == NULL OR "),
                    field,
                    &lit(" == \"\" OR "),
                    field,
                    &lit(" == [])"),
                ]);
            }
            FilterOp::Equals => (lit(" == "), filter.value.clone()),
            FilterOp::Regex => (lit(" =~ "), filter.value.clone()),
            FilterOp::StartsWith | FilterOp::EndsWith | FilterOp::Contains => {
                (lit(" LIKE "), filter.like_pattern())
            }
        };
        let param = self
            .b
            .bind(&filter.bind_name, operand.map(Value::String).unwrap_or(Value::Null));
        cat(&[
            &lit("(IS_ARRAY("),
            field,
            &lit(") ? LENGTH("),
            field,
            &lit("[* FILTER CURRENT"),
            &op,
            &param,
            &lit("]) > 0 : "),
            field,
            &op,
            &param,
            &lit(")"),
        ])
    }

    fn returns(&mut self, doc: &Trusted, props: &[SpecProperty], nested: bool) {
        let fields: Vec<(String, Trusted)> = output_fields(props)
            .into_iter()
            .map(|p| (p.output_key(), self.field(doc, p)))
            .collect();
        if nested && !fields.is_empty() {
            let non_empty: Vec<Trusted> = fields
                .iter()
                .map(|(_, f)| cat(&[&lit("("), f, &lit(" != NULL AND "), f, &lit(" != [])")]))
                .collect();
            let refs: Vec<&Trusted> = non_empty.iter().collect();
            self.b
                .add_line(&cat(&[&lit("FILTER "), &Trusted::join(&refs, " OR ")]));
        }
        self.b
            .line(if nested { "RETURN DISTINCT {" } else { "RETURN {" })
            .indent();
        let last = fields.len().saturating_sub(1);
        for (i, (key, field)) in fields.iter().enumerate() {
            let separator = lit(if i == last { "" } else { "," });
            self.b.add_line(&cat(&[
                &lit("\""),
                &Trusted::sanitize(key),
                &lit("\": "),
                field,
                &separator,
            ]));
        }
        self.b.outdent().line("}");
    }
}
