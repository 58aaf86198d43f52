//! normalizes a query expression before planning: captured values become
//! parameter placeholders, then the parameterized tree is hashed.
//!
//! Two invocations that differ only in captured values produce the same
//! parameterized tree and therefore the same hash; that is the whole basis
//! of the plan cache.  The hash walks the tree in preorder and folds in node
//! tags, operator identities, member and column names, and the literals that
//! survive parameterization, so trees of different shape hash differently.
//! XXH64 is not collision-proof; a cache hit is trusted on the hash alone.

use std::hash::Hasher;

use twox_hash::XxHash64;

use crate::expr::{self, Capture, CapturedValue, Expr, Lambda, OpArg};
use crate::ir::{Projection, RelationalQuery, Select, Table};
use crate::value::Value;

/// The structural hash of a parameterized query shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryHash(pub u64);

impl std::fmt::Display for QueryHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        hex::encode(self.0.to_be_bytes()).fmt(f)
    }
}

pub struct Normalized {
    pub expr: Expr,
    pub hash: QueryHash,
    /// Captured values in first-visit order; the compiled plan's parameters
    /// bind to these positions.
    pub params: Vec<Value>,
}

pub fn normalize(e: &Expr) -> Normalized {
    let (expr, params) = parameterize(e);
    let mut hasher = XxHash64::with_seed(0);
    hash_expr(&mut hasher, &expr);
    Normalized { expr, hash: QueryHash(hasher.finish()), params }
}

/// Replaces every plain-value capture with a parameter placeholder, keyed by
/// capture identity, in first-visit order.  Two captures with the same
/// identity share one placeholder.  Query-valued captures are left alone:
/// their shape is part of the plan and the inliner consumes them on a cache
/// miss.
pub fn parameterize(e: &Expr) -> (Expr, Vec<Value>) {
    let mut names: Vec<String> = vec![];
    let mut values: Vec<Value> = vec![];
    let out = parameterize_into(e, &mut names, &mut values);
    (out, values)
}

fn parameterize_into(e: &Expr, names: &mut Vec<String>, values: &mut Vec<Value>) -> Expr {
    expr::transform(e, &mut |node| match node {
        Expr::Capture(Capture { name, value: CapturedValue::Value(v) }) => {
            let index = match names.iter().position(|n| n == name) {
                Some(i) => i,
                None => {
                    names.push(name.clone());
                    values.push(v.clone());
                    names.len() - 1
                }
            };
            Some(Expr::Parameter(index))
        }
        // Captured queries keep their shape but may capture values of
        // their own; those share this plan's parameter list.
        Expr::Capture(Capture { name, value: CapturedValue::Query(q) }) => {
            Some(Expr::Capture(Capture {
                name: name.clone(),
                value: CapturedValue::Query(std::sync::Arc::new(parameterize_into(
                    q, names, values,
                ))),
            }))
        }
        _ => None,
    })
}

fn hash_str(h: &mut XxHash64, s: &str) {
    h.write_usize(s.len());
    h.write(s.as_bytes());
}

fn hash_value(h: &mut XxHash64, v: &Value) {
    match v {
        Value::Null => h.write_u8(0),
        Value::Bool(b) => {
            h.write_u8(1);
            h.write_u8(*b as u8);
        }
        Value::Int(i) => {
            h.write_u8(2);
            h.write_i64(*i);
        }
        Value::Real(x) => {
            h.write_u8(3);
            h.write_u64(x.to_bits());
        }
        Value::Text(s) => {
            h.write_u8(4);
            hash_str(h, s);
        }
        Value::Record(fields) => {
            h.write_u8(5);
            h.write_usize(fields.len());
            for (name, v) in fields {
                hash_str(h, name);
                hash_value(h, v);
            }
        }
        Value::List(items) => {
            h.write_u8(6);
            h.write_usize(items.len());
            for v in items {
                hash_value(h, v);
            }
        }
        Value::Group { key, items } => {
            h.write_u8(7);
            hash_value(h, key);
            h.write_usize(items.len());
            for v in items {
                hash_value(h, v);
            }
        }
    }
}

fn hash_lambda(h: &mut XxHash64, l: &Lambda) {
    h.write_usize(l.params.len());
    for p in &l.params {
        hash_str(h, p);
    }
    hash_expr(h, &l.body);
}

fn hash_projection(h: &mut XxHash64, p: &Projection) {
    match p {
        Projection::Server(e) => {
            h.write_u8(0);
            hash_expr(h, e);
        }
        Projection::Mapped { source, map } => {
            h.write_u8(1);
            hash_projection(h, source);
            hash_lambda(h, map);
        }
        Projection::Composite { outer, inner, combine } => {
            h.write_u8(2);
            hash_projection(h, outer);
            hash_projection(h, inner);
            hash_lambda(h, combine);
        }
    }
}

fn hash_table(h: &mut XxHash64, t: &Table) {
    match t {
        Table::Base { name, alias } => {
            h.write_u8(0);
            hash_str(h, name);
            hash_str(h, alias);
        }
        Table::Derived { select, alias } => {
            h.write_u8(1);
            hash_select(h, select);
            hash_str(h, alias);
        }
        Table::Join { kind, left, right, predicate } => {
            h.write_u8(2);
            h.write_u8(*kind as u8);
            hash_table(h, left);
            hash_table(h, right);
            if let Some(p) = predicate {
                h.write_u8(1);
                hash_expr(h, p);
            } else {
                h.write_u8(0);
            }
        }
        Table::SetOp { kind, left, right, alias } => {
            h.write_u8(3);
            h.write_u8(*kind as u8);
            hash_select(h, left);
            hash_select(h, right);
            hash_str(h, alias);
        }
    }
}

fn hash_select(h: &mut XxHash64, s: &Select) {
    hash_projection(h, &s.projection);
    match &s.table {
        Some(t) => {
            h.write_u8(1);
            hash_table(h, t);
        }
        None => h.write_u8(0),
    }
    for opt in [&s.predicate, &s.offset, &s.limit, &s.grouping] {
        match opt {
            Some(e) => {
                h.write_u8(1);
                hash_expr(h, e);
            }
            None => h.write_u8(0),
        }
    }
    h.write_usize(s.order_by.len());
    for o in &s.order_by {
        hash_expr(h, &o.expr);
        h.write_u8(o.descending as u8);
    }
    h.write_u8(s.distinct as u8);
}

pub fn hash_expr(h: &mut XxHash64, e: &Expr) {
    match e {
        Expr::Literal(v) => {
            h.write_u8(0);
            hash_value(h, v);
        }
        Expr::Capture(c) => {
            // Only query-valued captures survive parameterization; their
            // shape is hashed because it becomes part of the plan.
            h.write_u8(1);
            match &c.value {
                CapturedValue::Query(q) => {
                    h.write_u8(1);
                    hash_expr(h, q);
                }
                CapturedValue::Value(_) => {
                    h.write_u8(0);
                    hash_str(h, &c.name);
                }
            }
        }
        Expr::Var(name) => {
            h.write_u8(2);
            hash_str(h, name);
        }
        Expr::Member { base, name } => {
            h.write_u8(3);
            hash_expr(h, base);
            hash_str(h, name);
        }
        Expr::ClientCall { function, args } => {
            h.write_u8(4);
            hash_str(h, &function.name);
            h.write_usize(args.len());
            for a in args {
                hash_expr(h, a);
            }
        }
        Expr::Source { table } => {
            h.write_u8(5);
            hash_str(h, table);
        }
        Expr::Apply { op, source, args } => {
            h.write_u8(6);
            h.write_u8(*op as u8);
            hash_expr(h, source);
            h.write_usize(args.len());
            for a in args {
                match a {
                    OpArg::Lambda(l) => {
                        h.write_u8(0);
                        hash_lambda(h, l);
                    }
                    OpArg::Value(v) => {
                        h.write_u8(1);
                        hash_expr(h, v);
                    }
                    OpArg::Type(t) => {
                        h.write_u8(2);
                        h.write_u8(*t as u8);
                    }
                }
            }
        }
        Expr::Parameter(i) => {
            h.write_u8(7);
            h.write_usize(*i);
        }
        Expr::Binary { op, left, right } => {
            h.write_u8(8);
            h.write_u8(*op as u8);
            hash_expr(h, left);
            hash_expr(h, right);
        }
        Expr::Unary { op, operand } => {
            h.write_u8(9);
            h.write_u8(*op as u8);
            hash_expr(h, operand);
        }
        Expr::Record(fields) => {
            h.write_u8(10);
            h.write_usize(fields.len());
            for (name, v) in fields {
                hash_str(h, name);
                hash_expr(h, v);
            }
        }
        Expr::Case { test, then, otherwise } => {
            h.write_u8(11);
            hash_expr(h, test);
            hash_expr(h, then);
            hash_expr(h, otherwise);
        }
        Expr::Cast { operand, ty } => {
            h.write_u8(12);
            hash_expr(h, operand);
            h.write_u8(*ty as u8);
        }
        Expr::Coalesce { operand, fallback } => {
            h.write_u8(13);
            hash_expr(h, operand);
            hash_expr(h, fallback);
        }
        Expr::Column(c) => {
            h.write_u8(14);
            hash_str(h, &c.table);
            hash_str(h, &c.name);
        }
        Expr::Aggregate { func, operand } => {
            h.write_u8(15);
            h.write_u8(*func as u8);
            match operand {
                Some(o) => {
                    h.write_u8(1);
                    hash_expr(h, o);
                }
                None => h.write_u8(0),
            }
        }
        Expr::Exists(s) => {
            h.write_u8(16);
            hash_select(h, s);
        }
        Expr::InQuery { needle, select } => {
            h.write_u8(17);
            hash_expr(h, needle);
            hash_select(h, select);
        }
        Expr::Query(q) => {
            h.write_u8(18);
            match q {
                RelationalQuery::Enumerable { select } => {
                    h.write_u8(0);
                    hash_select(h, select);
                }
                RelationalQuery::SingleValue { select } => {
                    h.write_u8(1);
                    hash_select(h, select);
                }
                RelationalQuery::Grouped { select, outer_key, inner_key } => {
                    h.write_u8(2);
                    hash_select(h, select);
                    hash_expr(h, outer_key);
                    hash_expr(h, inner_key);
                }
                RelationalQuery::GroupByResult { select, key, element } => {
                    h.write_u8(3);
                    hash_select(h, select);
                    hash_expr(h, key);
                    hash_expr(h, element);
                }
            }
        }
        Expr::DefaultIfEmpty { value, flag } => {
            h.write_u8(19);
            hash_expr(h, value);
            hash_expr(h, flag);
        }
        Expr::Grouping { key, elements } => {
            h.write_u8(20);
            hash_expr(h, key);
            hash_expr(h, elements);
        }
        Expr::Slot(i) => {
            h.write_u8(21);
            h.write_usize(*i);
        }
        Expr::Exec(_) => {
            // Lowered nodes never appear in a tree being normalized.
            h.write_u8(22);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Lambda;

    fn filter_query(n: i64) -> Expr {
        Expr::source("rows").filter(Lambda::new(
            "x",
            Expr::eq(
                Expr::member(Expr::var("x"), "a"),
                Expr::capture("n", Value::Int(n)),
            ),
        ))
    }

    #[test]
    fn test_same_shape_different_captures_hash_equal() {
        let a = normalize(&filter_query(1));
        let b = normalize(&filter_query(2));
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.expr, b.expr);
        assert_eq!(a.params, vec![Value::Int(1)]);
        assert_eq!(b.params, vec![Value::Int(2)]);
    }

    #[test]
    fn test_different_shapes_hash_distinct() {
        let shapes = vec![
            Expr::source("rows"),
            Expr::source("rows").distinct(),
            Expr::source("rows").take(Expr::lit(1)),
            Expr::source("rows").skip(Expr::lit(1)),
            filter_query(1),
            Expr::source("rows").filter(Lambda::new(
                "x",
                Expr::eq(Expr::member(Expr::var("x"), "b"), Expr::capture("n", Value::Int(1))),
            )),
            Expr::source("other"),
            Expr::source("rows").count(),
        ];
        let hashes: Vec<QueryHash> = shapes.iter().map(|s| normalize(s).hash).collect();
        for i in 0..hashes.len() {
            for j in (i + 1)..hashes.len() {
                assert_ne!(hashes[i], hashes[j], "shapes {} and {} collided", i, j);
            }
        }
    }

    #[test]
    fn test_repeated_capture_shares_placeholder() {
        let n = Expr::capture("n", Value::Int(5));
        let q = Expr::source("rows").filter(Lambda::new(
            "x",
            Expr::and(
                Expr::eq(Expr::member(Expr::var("x"), "a"), n.clone()),
                Expr::eq(Expr::member(Expr::var("x"), "b"), n),
            ),
        ));
        let normalized = normalize(&q);
        assert_eq!(normalized.params, vec![Value::Int(5)]);
        let mut count = 0;
        expr::any_node(&normalized.expr, &mut |e| {
            if matches!(e, Expr::Parameter(0)) {
                count += 1;
            }
            false
        });
        assert_eq!(count, 2);
    }
}
