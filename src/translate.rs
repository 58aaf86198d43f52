//! translatability analysis: decides whether an expression can run on the
//! server.
//!
//! An expression is translatable when every node in it maps to a supported
//! database construct.  Client calls, unexpanded lambda variables, captures
//! that escaped parameterization and unrecognized operator applications all
//! poison the subtree; the composer then degrades that operator to client
//! evaluation instead of failing.

use crate::expr::{AggFn, Expr};
use crate::ir::RelationalQuery;
use crate::types::ValueType;

pub fn is_translatable(e: &Expr) -> bool {
    match e {
        // Structured literals are client-side data, not database constants.
        Expr::Literal(v) => v.value_type().is_some(),
        Expr::Parameter(_) => true,
        Expr::Column(_) => true,
        Expr::Binary { left, right, .. } => is_translatable(left) && is_translatable(right),
        Expr::Unary { operand, .. } => is_translatable(operand),
        Expr::Record(fields) => fields.iter().all(|(_, v)| is_translatable(v)),
        Expr::Case { test, then, otherwise } => {
            is_translatable(test) && is_translatable(then) && is_translatable(otherwise)
        }
        Expr::Cast { operand, .. } => is_translatable(operand),
        Expr::Coalesce { operand, fallback } => is_translatable(operand) && is_translatable(fallback),
        Expr::Aggregate { operand, .. } => operand.as_ref().map_or(true, |o| is_translatable(o)),
        // The embedded selects are already composed; their presence is what
        // translatability means.
        Expr::Exists(_) => true,
        Expr::InQuery { needle, .. } => is_translatable(needle),
        Expr::Query(_) => true,
        Expr::DefaultIfEmpty { value, flag } => is_translatable(value) && is_translatable(flag),
        Expr::Grouping { key, elements } => is_translatable(key) && is_translatable(elements),
        Expr::Member { .. }
        | Expr::Var(_)
        | Expr::Capture(_)
        | Expr::ClientCall { .. }
        | Expr::Source { .. }
        | Expr::Apply { .. }
        | Expr::Slot(_)
        | Expr::Exec(_) => false,
    }
}

/// True when the expression produces one scalar per row, which is what an
/// ordering key or a comparison operand must do.
pub fn is_scalar(e: &Expr) -> bool {
    match e {
        Expr::Record(_) | Expr::Grouping { .. } => false,
        Expr::Literal(v) => v.value_type().is_some(),
        Expr::Query(q) => matches!(q, RelationalQuery::SingleValue { .. }),
        Expr::DefaultIfEmpty { value, .. } => is_scalar(value),
        _ => true,
    }
}

/// Contains-an-aggregate check, used to reject nested aggregation: SQL
/// forbids an aggregate over another aggregate's result.
pub fn contains_aggregate(e: &Expr) -> bool {
    let mut found = false;
    crate::expr::any_node(e, &mut |node| {
        if matches!(node, Expr::Aggregate { .. }) {
            found = true;
        }
        found
    });
    found
}

/// Best-effort scalar type inference, used by filter-by-type pass-through
/// and the AVG input cast.
pub fn infer_type(e: &Expr) -> Option<ValueType> {
    match e {
        Expr::Literal(v) => v.value_type(),
        Expr::Column(c) => c.ty,
        Expr::Cast { ty, .. } => Some(*ty),
        Expr::Binary { op, left, right } => {
            if op.is_comparison() || matches!(op, crate::expr::BinaryOp::And | crate::expr::BinaryOp::Or)
            {
                Some(ValueType::Bool)
            } else {
                match (infer_type(left), infer_type(right)) {
                    (Some(ValueType::Int), Some(ValueType::Int)) => Some(ValueType::Int),
                    (Some(ValueType::Real), Some(_)) | (Some(_), Some(ValueType::Real)) => {
                        Some(ValueType::Real)
                    }
                    _ => None,
                }
            }
        }
        Expr::Unary { operand, .. } => infer_type(operand),
        Expr::Aggregate { func, operand } => match func {
            AggFn::Count => Some(ValueType::Int),
            AggFn::Avg => Some(ValueType::Real),
            _ => operand.as_ref().and_then(|o| infer_type(o)),
        },
        Expr::Coalesce { operand, .. } => infer_type(operand),
        Expr::Case { then, .. } => infer_type(then),
        _ => None,
    }
}
