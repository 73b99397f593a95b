#![forbid(unsafe_code)]

//! Cypher rendering.
//!
//! Traversed properties compile to pattern comprehensions, which yield an
//! empty list instead of dropping the row when nothing matches. Multi-hop
//! paths become a single multi-hop pattern. Collection helpers come from APOC.

use serde_json::Value;

use crate::query::ast::{FilterOp, SingleValue};
use crate::query::compiler::StatementRenderer;
use crate::query::plan::{QueryPlan, ResolvedFilter, RootSelection};
use crate::query::spec::SpecProperty;
use crate::query::trusted::{ParamStyle, QueryOptions, Trusted, TrustedQuery, TrustedQueryBuilder};
use crate::query::Dialect;
use crate::types::Result;

/// Renders plans as Cypher.
#[derive(Debug, Default, Clone, Copy)]
pub struct CypherRenderer;

impl StatementRenderer for CypherRenderer {
    fn dialect(&self) -> Dialect {
        Dialect::Cypher
    }

    fn render(&self, plan: &QueryPlan) -> Result<TrustedQuery> {
        let mut writer = CypherWriter {
            plan,
            b: TrustedQueryBuilder::new(ParamStyle::Dollar),
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

fn quoted(name: &str) -> Trusted {
    cat(&[&lit("`"), &Trusted::sanitize(name), &lit("`")])
}

fn attr(node: &Trusted, key: &str) -> Trusted {
    cat(&[node, &lit("."), &quoted(key)])
}

fn and_all(conditions: &[Trusted]) -> Trusted {
    let refs: Vec<&Trusted> = conditions.iter().collect();
    Trusted::join(&refs, " AND ")
}

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

/// Sorts a list of maps ascending by the output keys of `keys`, in order.
fn sort_maps(list: &Trusted, keys: &[&SpecProperty]) -> Trusted {
    if keys.is_empty() {
        return list.clone();
    }
    let fields: Vec<Trusted> = keys
        .iter()
        .map(|c| cat(&[&lit("'^"), &Trusted::sanitize(&c.output_key()), &lit("'")]))
        .collect();
    let refs: Vec<&Trusted> = fields.iter().collect();
    cat(&[
        &lit("apoc.coll.sortMulti("),
        list,
        &lit(", ["),
        &Trusted::join(&refs, ", "),
        &lit("])"),
    ])
}

struct CypherWriter<'p> {
    plan: &'p QueryPlan,
    b: TrustedQueryBuilder,
}

impl CypherWriter<'_> {
    fn statement(&mut self) {
        let plan = self.plan;
        let root = lit("root");
        if let Some(access) = &plan.access {
            let spaces: Vec<Value> = access
                .allowed_spaces
                .iter()
                .map(|s| Value::String(s.as_str().to_owned()))
                .collect();
            let instances: Vec<Value> = access
                .permitted_instances
                .iter()
                .map(|id| Value::String(id.to_string()))
                .collect();
            let spaces = self.b.bind("allowedSpaces", spaces);
            let instances = self.b.bind("allowedInstances", instances);
            self.b.add_line(&cat(&[
                &lit("WITH "),
                &spaces,
                &lit(" AS allowedSpaces, "),
                &instances,
                &lit(" AS allowedInstances"),
            ]));
        }

        let stage = quoted(plan.stage.label());
        let mut root_conditions = Vec::new();
        match &plan.root {
            RootSelection::Document(id) => {
                let key = self.b.bind("rootId", id.uuid.to_string());
                self.b.add_line(&cat(&[
                    &lit("MATCH (root:"),
                    &stage,
                    &lit(" {_id: "),
                    &key,
                    &lit("})"),
                ]));
            }
            RootSelection::TypeScan { type_name } => {
                self.b.add_line(&cat(&[
                    &lit("MATCH (root:"),
                    &stage,
                    &lit(":"),
                    &quoted(type_name),
                    &lit(")"),
                ]));
            }
        }
        root_conditions.extend(self.node_restrictions(&root));
        if let Some(filter) = &plan.document_filter {
            root_conditions.push(self.filter_expr(&attr(&root, "@id"), filter));
        }
        if !root_conditions.is_empty() {
            self.b.add_line(&cat(&[&lit("WHERE "), &and_all(&root_conditions)]));
        }

        let fields = output_fields(&plan.spec.properties);
        let traversed: Vec<Trusted> = fields
            .iter()
            .filter(|p| !p.is_direct_child())
            .map(|p| {
                let expr = self.property_expr(&root, p);
                cat(&[&expr, &lit(" AS "), &var(&p.alias())])
            })
            .collect();
        if !traversed.is_empty() {
            let refs: Vec<&Trusted> = traversed.iter().collect();
            self.b
                .add_line(&cat(&[&lit("WITH root, "), &Trusted::join(&refs, ", ")]));
        }
        let conditions = self.conditions(&root, &plan.spec.properties, true);
        if !conditions.is_empty() {
            self.b.add_line(&cat(&[&lit("WHERE "), &and_all(&conditions)]));
        }

        if plan.count_only {
            self.b.line("RETURN count(root) AS count");
            self.b.set_options(QueryOptions::default());
            return;
        }

        let mut order: Vec<Trusted> = fields
            .iter()
            .filter(|p| p.sort)
            .map(|p| self.top_level_field(&root, p))
            .collect();
        order.push(lit("root._id"));
        let order_refs: Vec<&Trusted> = order.iter().collect();
        self.b
            .add_line(&cat(&[&lit("ORDER BY "), &Trusted::join(&order_refs, ", ")]));
        let size = plan.pagination.and_then(|p| p.size);
        if let (Some(pagination), Some(size)) = (plan.pagination, size) {
            self.b.add_line(&cat(&[
                &lit("SKIP "),
                &Trusted::number(pagination.from),
                &lit(" LIMIT "),
                &Trusted::number(size),
            ]));
        }
        self.b.set_options(QueryOptions {
            full_count: false,
            count: size.is_none(),
        });

        let entries: Vec<Trusted> = fields
            .iter()
            .map(|p| {
                cat(&[
                    &quoted(&p.output_key()),
                    &lit(": "),
                    &self.top_level_field(&root, p),
                ])
            })
            .collect();
        let entry_refs: Vec<&Trusted> = entries.iter().collect();
        self.b.add_line(&cat(&[
            &lit("RETURN {"),
            &Trusted::join(&entry_refs, ", "),
            &lit("} AS row"),
        ]));
    }

    /// Field of a top-level property once the `WITH` stage has run.
    fn top_level_field(&self, root: &Trusted, p: &SpecProperty) -> Trusted {
        if p.is_direct_child() {
            self.direct_field(root, p)
        } else {
            var(&p.alias())
        }
    }

    fn direct_field(&self, node: &Trusted, p: &SpecProperty) -> Trusted {
        match p.leaf_path() {
            Some(leaf) => attr(node, &leaf.path_name),
            None => lit("null"),
        }
    }

    fn node_restrictions(&mut self, node: &Trusted) -> Vec<Trusted> {
        let mut conditions = Vec::new();
        if self.plan.access.is_some() {
            conditions.push(cat(&[
                &lit("("),
                node,
                &lit("._space IN allowedSpaces OR "),
                node,
                &lit("._id IN allowedInstances)"),
            ]));
        }
        if let Some(spaces) = &self.plan.space_restriction {
            let names: Vec<Value> = spaces
                .iter()
                .map(|s| Value::String(s.as_str().to_owned()))
                .collect();
            let p = self.b.bind("spaceRestriction", names);
            conditions.push(cat(&[node, &lit("._space IN "), &p]));
        }
        conditions
    }

    /// Required and filter predicates of `props` evaluated at `node`.
    fn conditions(&mut self, node: &Trusted, props: &[SpecProperty], top_level: bool) -> Vec<Trusted> {
        let plan = self.plan;
        let mut conditions = Vec::new();
        for p in output_fields(props) {
            if !p.required && plan.filter_for(p).is_none() {
                continue;
            }
            let field = if top_level {
                self.top_level_field(node, p)
            } else if p.is_direct_child() {
                self.direct_field(node, p)
            } else {
                self.property_expr(node, p)
            };
            if p.required {
                conditions.push(cat(&[
                    &field,
                    &lit(" IS NOT NULL AND "),
                    &field,
                    &lit(" <> \"\" AND "),
                    &field,
                    &lit(" <> []"),
                ]));
            }
            if let Some(filter) = plan.filter_for(p) {
                conditions.push(self.filter_expr(&field, filter));
            }
        }
        conditions
    }

    fn filter_expr(&mut self, field: &Trusted, filter: &ResolvedFilter) -> Trusted {
        let op = match filter.op {
            FilterOp::IsEmpty => {
                return cat(&[
                    &lit("("),
                    field,
                    &lit(" IS NULL OR "),
                    field,
                    &lit(" = [] OR "),
                    field,
                    &lit(" = \"\")"),
                ]);
            }
            FilterOp::StartsWith => lit(" STARTS WITH "),
            FilterOp::EndsWith => lit(" ENDS WITH "),
            FilterOp::Contains => lit(" CONTAINS "),
            FilterOp::Equals => lit(" = "),
            FilterOp::Regex => lit(" =~ "),
        };
        let operand = filter.value.clone().map(Value::String).unwrap_or(Value::Null);
        let param = self.b.bind(&filter.bind_name, operand);
        cat(&[
            &lit("any(v IN apoc.coll.flatten(["),
            field,
            &lit("]) WHERE v"),
            &op,
            &param,
            &lit(")"),
        ])
    }

    /// List-valued (or collapsed) expression for a traversed property.
    fn property_expr(&mut self, parent: &Trusted, p: &SpecProperty) -> Trusted {
        if p.is_direct_child() {
            return self.direct_field(parent, p);
        }
        let alias = p.alias();
        let item = var(&format!("{alias}_x"));
        let steps = p.edge_steps();
        let plan = self.plan;
        let list = if steps.iter().any(|s| !plan.edge_exists(s)) {
            lit("[]")
        } else {
            let mut pattern = cat(&[&lit("("), parent, &lit(")")]);
            let mut conditions = Vec::new();
            let mut node = parent.clone();
            let last = steps.len().saturating_sub(1);
            let edge = var(&format!("{alias}_edge"));
            for (i, step) in steps.iter().enumerate() {
                node = var(&format!("{alias}_n{i}"));
                let rel = if i == last && p.ensure_order {
                    cat(&[&edge, &lit(":"), &quoted(&step.path_name)])
                } else {
                    cat(&[&lit(":"), &quoted(&step.path_name)])
                };
                let hop = if step.reverse {
                    cat(&[&lit("<-["), &rel, &lit("]-("), &node, &lit(")")])
                } else {
                    cat(&[&lit("-["), &rel, &lit("]->("), &node, &lit(")")])
                };
                pattern = pattern.concat(&hop);
                conditions.extend(self.node_restrictions(&node));
                if !step.type_filter.is_empty() {
                    let types: Vec<Value> = step.type_filter.iter().cloned().map(Value::String).collect();
                    let p_types = self.b.bind(&format!("{alias}_types{i}"), types);
                    conditions.push(cat(&[
                        &lit("any(l IN labels("),
                        &node,
                        &lit(") WHERE l IN "),
                        &p_types,
                        &lit(")"),
                    ]));
                }
            }

            let projection = match p.leaf_path() {
                Some(leaf) => attr(&node, &leaf.path_name),
                None => {
                    conditions.extend(self.conditions(&node, &p.property, false));
                    self.object_expr(&node, &p.property)
                }
            };
            let projection = if p.ensure_order {
                cat(&[&lit("{o: "), &edge, &lit("._orderNumber, v: "), &projection, &lit("}")])
            } else {
                projection
            };
            let where_clause = if conditions.is_empty() {
                lit("")
            } else {
                cat(&[&lit(" WHERE "), &and_all(&conditions)])
            };
            let comprehension = cat(&[&lit("["), &pattern, &where_clause, &lit(" | "), &projection, &lit("]")]);
            let ordered = if p.ensure_order {
                cat(&[
                    &lit("["),
                    &item,
                    &lit(" IN apoc.coll.sortMaps("),
                    &comprehension,
                    &lit(", '^o') | "),
                    &item,
                    &lit(".v]"),
                ])
            } else {
                comprehension
            };
            let shaped = if p.is_leaf() {
                cat(&[&lit("apoc.coll.flatten("), &ordered, &lit(")")])
            } else {
                cat(&[
                    &lit("["),
                    &item,
                    &lit(" IN "),
                    &ordered,
                    &lit(" WHERE any(k IN keys("),
                    &item,
                    &lit(") WHERE "),
                    &item,
                    &lit("[k] IS NOT NULL AND "),
                    &item,
                    &lit("[k] <> [])]"),
                ])
            };
            if p.ensure_order {
                shaped
            } else {
                cat(&[&lit("apoc.coll.toSet("), &shaped, &lit(")")])
            }
        };

        let list = if p.sort {
            cat(&[&lit("apoc.coll.sort("), &list, &lit(")")])
        } else {
            list
        };
        let list = if p.has_grouping() {
            self.grouping_expr(&list, p)
        } else {
            list
        };
        match p.single_item {
            Some(SingleValue::First) => cat(&[&lit("head("), &list, &lit(")")]),
            Some(SingleValue::Concat) => cat(&[
                &lit("apoc.text.join(["),
                &item,
                &lit(" IN "),
                &list,
                &lit(" | toString("),
                &item,
                &lit(")], ', ')"),
            ]),
            None => list,
        }
    }

    fn object_expr(&mut self, node: &Trusted, props: &[SpecProperty]) -> Trusted {
        let entries: Vec<Trusted> = output_fields(props)
            .into_iter()
            .map(|p| {
                let expr = self.property_expr(node, p);
                cat(&[&quoted(&p.output_key()), &lit(": "), &expr])
            })
            .collect();
        let refs: Vec<&Trusted> = entries.iter().collect();
        cat(&[&lit("{"), &Trusted::join(&refs, ", "), &lit("}")])
    }

    fn grouping_expr(&mut self, list: &Trusted, p: &SpecProperty) -> Trusted {
        let alias = p.alias();
        let (g, x, y) = (
            var(&format!("{alias}_g")),
            var(&format!("{alias}_x")),
            var(&format!("{alias}_y")),
        );
        let keys: Vec<&SpecProperty> = p.property.iter().filter(|c| c.group_by).collect();
        let key_map: Vec<Trusted> = keys
            .iter()
            .map(|c| cat(&[&quoted(&c.output_key()), &lit(": "), &x, &lit("."), &quoted(&c.output_key())]))
            .collect();
        let key_refs: Vec<&Trusted> = key_map.iter().collect();
        let same_group: Vec<Trusted> = keys
            .iter()
            .map(|c| {
                let key = quoted(&c.output_key());
                cat(&[&y, &lit("."), &key, &lit(" = "), &g, &lit("."), &key])
            })
            .collect();
        let rest: Vec<Trusted> = p
            .property
            .iter()
            .filter(|c| !c.group_by)
            .map(|c| cat(&[&quoted(&c.output_key()), &lit(": "), &y, &lit("."), &quoted(&c.output_key())]))
            .collect();
        let rest_refs: Vec<&Trusted> = rest.iter().collect();
        let instances = quoted(p.grouped_instances.as_deref().unwrap_or_default());
        let groups = sort_maps(
            &cat(&[
                &lit("apoc.coll.toSet(["),
                &x,
                &lit(" IN "),
                list,
                &lit(" | {"),
                &Trusted::join(&key_refs, ", "),
                &lit("}])"),
            ]),
            &p.group_sort_keys(),
        );
        let members = sort_maps(
            &cat(&[
                &lit("["),
                &y,
                &lit(" IN "),
                list,
                &lit(" WHERE "),
                &and_all(&same_group),
                &lit(" | {"),
                &Trusted::join(&rest_refs, ", "),
                &lit("}]"),
            ]),
            &p.member_sort_keys(),
        );
        cat(&[
            &lit("["),
            &g,
            &lit(" IN "),
            &groups,
            &lit(" | apoc.map.merge("),
            &g,
            &lit(", {"),
            &instances,
            &lit(": "),
            &members,
            &lit("})]"),
        ])
    }
}
