//! structural rewrite passes shared by composition and lowering.
//!
//! - flattening a projection body into named output columns,
//! - rebinding a carried-forward projection against a derived table's alias
//!   after a pushdown,
//! - uniquifying table aliases when one select is cloned into another tree.
//!
//! Flattening and rebinding must agree on column names: rebinding replaces a
//! leaf with a column reference named by the leaf's record path, and
//! flattening emits the derived table's output columns under those same
//! names.

use std::collections::HashMap;

use crate::context::ProcessingContext;
use crate::expr::{self, Expr};
use crate::ir::{Select, Table};
use crate::translate;
use crate::types::ValueType;

/// The column name used for the default-if-empty sentinel.
pub const EMPTY_SENTINEL: &str = "$empty";

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}_{}", prefix, name)
    }
}

fn leaf_name(prefix: &str, e: &Expr) -> String {
    if !prefix.is_empty() {
        return prefix.to_string();
    }
    match e {
        Expr::Column(c) => c.name.clone(),
        _ => "value".to_string(),
    }
}

/// Flattens a projection body into an ordered list of (name, expression)
/// output columns.  Records contribute one column per leaf, named by the
/// field path; groupings contribute their key leaves plus one collection
/// column; the default-if-empty marker contributes its value's leaves plus
/// the sentinel column.
pub fn flatten_leaves(body: &Expr) -> Vec<(String, Expr)> {
    let mut out = vec![];
    flatten_into(body, "", &mut out);
    out
}

fn flatten_into(e: &Expr, prefix: &str, out: &mut Vec<(String, Expr)>) {
    match e {
        Expr::Record(fields) => {
            for (name, v) in fields {
                flatten_into(v, &join_path(prefix, name), out);
            }
        }
        Expr::Grouping { key, elements } => {
            flatten_into(key, &join_path(prefix, "key"), out);
            out.push((join_path(prefix, "items"), (**elements).clone()));
        }
        Expr::DefaultIfEmpty { value, flag } => {
            flatten_into(value, prefix, out);
            out.push((join_path(prefix, EMPTY_SENTINEL), (**flag).clone()));
        }
        leaf => out.push((leaf_name(prefix, leaf), leaf.clone())),
    }
}

/// Rewrites a projection body so every leaf reads from the derived table
/// that now computes it.  The shape (records, groupings, the sentinel
/// marker) survives; only the leaves become column references qualified by
/// `alias`.
pub fn rebind(body: &Expr, alias: &str) -> Expr {
    rebind_prefix(body, alias, "")
}

fn rebind_prefix(e: &Expr, alias: &str, prefix: &str) -> Expr {
    match e {
        Expr::Record(fields) => Expr::Record(
            fields
                .iter()
                .map(|(name, v)| (name.clone(), rebind_prefix(v, alias, &join_path(prefix, name))))
                .collect(),
        ),
        Expr::Grouping { key, elements } => Expr::Grouping {
            key: Box::new(rebind_prefix(key, alias, &join_path(prefix, "key"))),
            elements: Box::new(Expr::column(
                alias,
                join_path(prefix, "items"),
                None,
            )),
        },
        Expr::DefaultIfEmpty { value, .. } => Expr::DefaultIfEmpty {
            value: Box::new(rebind_prefix(value, alias, prefix)),
            // The sentinel column is NULL when a left join missed; absent
            // means empty.
            flag: Box::new(Expr::Coalesce {
                operand: Box::new(Expr::column(
                    alias,
                    join_path(prefix, EMPTY_SENTINEL),
                    Some(ValueType::Bool),
                )),
                fallback: Box::new(Expr::lit(true)),
            }),
        },
        leaf => Expr::Column(crate::expr::ColumnRef {
            table: alias.to_string(),
            name: leaf_name(prefix, leaf),
            ty: translate::infer_type(leaf),
        }),
    }
}

/// Clones a select with every table alias in it replaced by a fresh one, so
/// the clone can live in the same statement as the original.  Returns the
/// old-to-new alias mapping so callers can fix up expressions that still
/// reference the old aliases (join predicates, key selectors).
pub fn uniquify(select: &Select, ctx: &ProcessingContext) -> (Select, HashMap<String, String>) {
    let mut renames = HashMap::new();
    if let Some(table) = &select.table {
        collect_renames(table, ctx, &mut renames);
    }
    (apply_renames(select, &renames), renames)
}

fn collect_renames(table: &Table, ctx: &ProcessingContext, renames: &mut HashMap<String, String>) {
    match table {
        Table::Base { alias, .. } => {
            renames.insert(alias.clone(), ctx.fresh_alias());
        }
        Table::Derived { select, alias } => {
            renames.insert(alias.clone(), ctx.fresh_alias());
            if let Some(inner) = &select.table {
                collect_renames(inner, ctx, renames);
            }
        }
        Table::Join { left, right, .. } => {
            collect_renames(left, ctx, renames);
            collect_renames(right, ctx, renames);
        }
        Table::SetOp { left, right, alias, .. } => {
            renames.insert(alias.clone(), ctx.fresh_alias());
            if let Some(inner) = &left.table {
                collect_renames(inner, ctx, renames);
            }
            if let Some(inner) = &right.table {
                collect_renames(inner, ctx, renames);
            }
        }
    }
}

fn rename_table(table: &Table, renames: &HashMap<String, String>) -> Table {
    let renamed = |alias: &String| renames.get(alias).cloned().unwrap_or_else(|| alias.clone());
    match table {
        Table::Base { name, alias } => Table::Base { name: name.clone(), alias: renamed(alias) },
        Table::Derived { select, alias } => Table::Derived {
            select: Box::new(apply_renames(select, renames)),
            alias: renamed(alias),
        },
        Table::Join { kind, left, right, predicate } => Table::Join {
            kind: *kind,
            left: Box::new(rename_table(left, renames)),
            right: Box::new(rename_table(right, renames)),
            predicate: predicate.as_ref().map(|p| apply_renames_expr(p, renames)),
        },
        Table::SetOp { kind, left, right, alias } => Table::SetOp {
            kind: *kind,
            left: Box::new(apply_renames(left, renames)),
            right: Box::new(apply_renames(right, renames)),
            alias: renamed(alias),
        },
    }
}

/// Rewrites column references per the alias mapping.  References to aliases
/// outside the mapping (correlated references to an enclosing scope) pass
/// through untouched.
pub fn apply_renames_expr(e: &Expr, renames: &HashMap<String, String>) -> Expr {
    expr::transform(e, &mut |node| match node {
        Expr::Column(c) => renames.get(&c.table).map(|new_alias| {
            Expr::column(new_alias.clone(), c.name.clone(), c.ty)
        }),
        _ => None,
    })
}

fn apply_renames(select: &Select, renames: &HashMap<String, String>) -> Select {
    let rewritten = select.map_exprs(&mut |node| match node {
        Expr::Column(c) => renames.get(&c.table).map(|new_alias| {
            Expr::column(new_alias.clone(), c.name.clone(), c.ty)
        }),
        _ => None,
    });
    Select {
        table: rewritten.table.as_ref().map(|t| rename_table(t, renames)),
        ..rewritten
    }
}
