//! simplifies expression trees between composition steps.
//! - evaluates constant sub-expressions.
//! - reduces member access over known record shapes, which is what makes a
//!   lambda expanded against a projection translatable at all.

use crate::expr::{self, BinaryOp, Expr, UnaryOp};
use crate::ir::RelationalQuery;
use crate::value::{self, ArithOp, Value};

/// Rewrites bottom-up, folding wherever a node's children allow it.
pub fn optimize(e: &Expr) -> Expr {
    let rebuilt = expr::transform(e, &mut |node| {
        if std::ptr::eq(node, e) {
            None
        } else {
            Some(optimize(node))
        }
    });
    fold(rebuilt)
}

fn arith_op(op: BinaryOp) -> Option<ArithOp> {
    match op {
        BinaryOp::Add => Some(ArithOp::Add),
        BinaryOp::Subtract => Some(ArithOp::Subtract),
        BinaryOp::Multiply => Some(ArithOp::Multiply),
        BinaryOp::Divide => Some(ArithOp::Divide),
        BinaryOp::Modulo => Some(ArithOp::Modulo),
        _ => None,
    }
}

fn fold(e: Expr) -> Expr {
    match e {
        Expr::Binary { op, left, right } => fold_binary(op, *left, *right),
        Expr::Unary { op, operand } => match (op, &*operand) {
            (UnaryOp::Not, Expr::Literal(Value::Bool(b))) => Expr::lit(!b),
            (UnaryOp::Neg, Expr::Literal(Value::Int(i))) => Expr::lit(-i),
            (UnaryOp::Neg, Expr::Literal(Value::Real(x))) => Expr::lit(-x),
            _ => Expr::Unary { op, operand },
        },
        Expr::Member { base, name } => fold_member(*base, name),
        Expr::Case { test, then, otherwise } => match &*test {
            Expr::Literal(Value::Bool(true)) => *then,
            Expr::Literal(Value::Bool(false)) => *otherwise,
            _ => Expr::Case { test, then, otherwise },
        },
        Expr::Coalesce { operand, fallback } => match &*operand {
            Expr::Literal(Value::Null) => *fallback,
            Expr::Literal(_) => *operand,
            _ => Expr::Coalesce { operand, fallback },
        },
        Expr::Cast { operand, ty } => match &*operand {
            Expr::Literal(v) => match value::cast(v, ty) {
                Ok(out) => Expr::Literal(out),
                Err(_) => Expr::Cast { operand, ty },
            },
            _ => Expr::Cast { operand, ty },
        },
        other => other,
    }
}

fn fold_binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    if let (Expr::Literal(l), Expr::Literal(r)) = (&left, &right) {
        if let Some(a) = arith_op(op) {
            if let Ok(v) = value::arith(l, a, r) {
                return Expr::Literal(v);
            }
        }
        match op {
            BinaryOp::Eq => return Expr::lit(value::loose_eq(l, r)),
            BinaryOp::Ne => return Expr::lit(!value::loose_eq(l, r)),
            BinaryOp::Lt => return Expr::lit(value::compare(l, r).is_lt()),
            BinaryOp::Le => return Expr::lit(value::compare(l, r).is_le()),
            BinaryOp::Gt => return Expr::lit(value::compare(l, r).is_gt()),
            BinaryOp::Ge => return Expr::lit(value::compare(l, r).is_ge()),
            _ => {}
        }
    }
    match (op, &left, &right) {
        (BinaryOp::And, Expr::Literal(Value::Bool(true)), _) => right,
        (BinaryOp::And, _, Expr::Literal(Value::Bool(true))) => left,
        (BinaryOp::And, Expr::Literal(Value::Bool(false)), _) => Expr::lit(false),
        (BinaryOp::Or, Expr::Literal(Value::Bool(false)), _) => right,
        (BinaryOp::Or, _, Expr::Literal(Value::Bool(false))) => left,
        (BinaryOp::Or, Expr::Literal(Value::Bool(true)), _) => Expr::lit(true),
        _ => Expr::Binary { op, left: Box::new(left), right: Box::new(right) },
    }
}

fn fold_member(base: Expr, name: String) -> Expr {
    match base {
        Expr::Record(fields) => {
            for (n, v) in &fields {
                if *n == name {
                    return v.clone();
                }
            }
            Expr::Member { base: Box::new(Expr::Record(fields)), name }
        }
        Expr::Literal(v) => match v.field(&name) {
            Some(f) => Expr::Literal(f.clone()),
            None => Expr::Member { base: Box::new(Expr::Literal(v)), name },
        },
        Expr::Grouping { key, elements } => {
            if name == "key" {
                *key
            } else {
                Expr::Member { base: Box::new(Expr::Grouping { key, elements }), name }
            }
        }
        // The key of a deferred GROUP BY is known before the group's final
        // shape is; projecting it must not force the group to materialize.
        Expr::Query(RelationalQuery::GroupByResult { select, key, element }) => {
            if name == "key" {
                *key
            } else {
                Expr::Member {
                    base: Box::new(Expr::Query(RelationalQuery::GroupByResult {
                        select,
                        key,
                        element,
                    })),
                    name,
                }
            }
        }
        // Field access through a defaulted row reads the left-joined column,
        // which is already NULL when the join missed.
        Expr::DefaultIfEmpty { value, .. } => fold_member(*value, name),
        other => Expr::Member { base: Box::new(other), name },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_folding() {
        struct Case {
            desc: &'static str,
            input: Expr,
            expected: Expr,
        }
        let cases = vec![
            Case {
                desc: "1 + 1",
                input: Expr::binary(BinaryOp::Add, Expr::lit(1), Expr::lit(1)),
                expected: Expr::lit(2),
            },
            Case {
                desc: "(1 + 1) * 3 folds through children",
                input: Expr::binary(
                    BinaryOp::Multiply,
                    Expr::binary(BinaryOp::Add, Expr::lit(1), Expr::lit(1)),
                    Expr::lit(3),
                ),
                expected: Expr::lit(6),
            },
            Case {
                desc: "true && p reduces to p",
                input: Expr::and(Expr::lit(true), Expr::column("t0", "a", None)),
                expected: Expr::column("t0", "a", None),
            },
            Case {
                desc: "2 < 3",
                input: Expr::binary(BinaryOp::Lt, Expr::lit(2), Expr::lit(3)),
                expected: Expr::lit(true),
            },
        ];
        for case in cases {
            assert_eq!(optimize(&case.input), case.expected, "{}", case.desc);
        }
    }

    #[test]
    fn test_member_over_record_reduces() {
        let rec = Expr::Record(vec![
            ("a".to_string(), Expr::column("t0", "a", None)),
            ("b".to_string(), Expr::column("t0", "b", None)),
        ]);
        let e = Expr::member(rec, "b");
        assert_eq!(optimize(&e), Expr::column("t0", "b", None));
    }

    #[test]
    fn test_member_over_unknown_base_kept() {
        let e = Expr::member(Expr::var("x"), "a");
        assert_eq!(optimize(&e), e);
    }
}
