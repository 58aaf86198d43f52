//! passes that resolve deferred grouping markers.
//!
//! A GROUP BY is not committed to a SQL shape when it is first seen: the
//! operator that eventually consumes the group decides whether it becomes a
//! plain aggregate over the grouped select, a correlated subquery, or a
//! join.  Three passes deal with the possibilities:
//!
//! - `rewrite_aggregates`: an aggregate applied directly to a group marker's
//!   element becomes a true SQL aggregate inside the grouped select.
//! - `key_placeholder`: when a select carrying markers is pushed down into a
//!   derived table, the markers are narrowed to key-only records, since only
//!   the key is re-queryable from outside.
//! - `expand_groups`: run once at the top of the fully composed tree; any
//!   marker that survived unresolved becomes an explicit correlated
//!   subquery, so the executor never sees an unmaterializable marker.

use crate::context::ProcessingContext;
use crate::expr::{self, AggFn, Expr, OpArg, OpKind};
use crate::ir::{Projection, RelationalQuery, Select};
use crate::rewrite;
use crate::translate;
use crate::types::ValueType;

fn agg_fn(op: OpKind) -> Option<AggFn> {
    match op {
        OpKind::Sum => Some(AggFn::Sum),
        OpKind::Average => Some(AggFn::Avg),
        OpKind::Min => Some(AggFn::Min),
        OpKind::Max => Some(AggFn::Max),
        OpKind::Count => Some(AggFn::Count),
        _ => None,
    }
}

/// Rewrites `aggregate(group, selector)` over a deferred GROUP BY marker
/// into a SQL aggregate expression, valid because it will sit in the
/// projection of the select that carries the grouping key.  Leaves the node
/// alone (and therefore on the client-fallback path) when the selector is
/// untranslatable or would nest aggregates.
pub fn rewrite_aggregates(e: &Expr) -> Expr {
    expr::transform(e, &mut |node| {
        let (op, source, args) = match node {
            Expr::Apply { op, source, args } => (*op, source, args),
            _ => return None,
        };
        let func = agg_fn(op)?;
        let element = match &**source {
            Expr::Query(RelationalQuery::GroupByResult { element, .. }) => element,
            _ => return None,
        };
        let selector = match args.first() {
            None => None,
            Some(OpArg::Lambda(l)) => Some(l),
            Some(_) => return None,
        };
        let rewritten = match func {
            AggFn::Count => match selector {
                // COUNT over the group; a predicate becomes a conditional
                // sum so the filter happens inside the aggregate.
                None => Expr::Aggregate { func: AggFn::Count, operand: None },
                Some(predicate) => {
                    let condition =
                        crate::optimize::optimize(&expr::expand_lambda(predicate, &[(**element).clone()]));
                    if !translate::is_translatable(&condition) {
                        return None;
                    }
                    Expr::Aggregate {
                        func: AggFn::Sum,
                        operand: Some(Box::new(Expr::Case {
                            test: Box::new(condition),
                            then: Box::new(Expr::lit(1)),
                            otherwise: Box::new(Expr::lit(0)),
                        })),
                    }
                }
            },
            _ => {
                let operand = match selector {
                    Some(l) => {
                        crate::optimize::optimize(&expr::expand_lambda(l, &[(**element).clone()]))
                    }
                    None => (**element).clone(),
                };
                if !translate::is_translatable(&operand) || translate::contains_aggregate(&operand) {
                    return None;
                }
                let operand = if func == AggFn::Avg {
                    Expr::Cast { operand: Box::new(operand), ty: ValueType::Real }
                } else {
                    operand
                };
                Expr::Aggregate { func, operand: Some(Box::new(operand)) }
            }
        };
        Some(rewritten)
    })
}

/// Narrows grouping markers inside a select to key-only records before the
/// select is wrapped as a derived table.  Only the key survives a pushdown;
/// the member rows are not re-queryable through a subquery boundary.
pub fn key_placeholder(select: &Select) -> Select {
    select.map_exprs(&mut |node| match node {
        Expr::Query(RelationalQuery::GroupByResult { key, .. }) => {
            Some(Expr::Record(vec![("key".to_string(), (**key).clone())]))
        }
        Expr::Query(RelationalQuery::Grouped { inner_key, .. }) => {
            Some(Expr::Record(vec![("key".to_string(), (**inner_key).clone())]))
        }
        _ => None,
    })
}

/// Expands every grouping marker still present after composition into an
/// explicit correlated subquery: the group's key plus an enumerable of the
/// member rows, filtered on key equality.  Equivalent to a group-join.
pub fn expand_groups(e: &Expr, ctx: &ProcessingContext) -> Expr {
    expr::transform(e, &mut |node| match node {
        Expr::Query(RelationalQuery::GroupByResult { select, key, element }) => {
            // Clone the grouped select under fresh aliases so the member
            // subquery can be correlated against the original.
            let (cloned, renames) = rewrite::uniquify(select, ctx);
            let cloned_key = rewrite::apply_renames_expr(key, &renames);
            let cloned_element = rewrite::apply_renames_expr(element, &renames);
            let elements = Select {
                projection: Projection::Server(cloned_element),
                table: cloned.table,
                predicate: cloned.predicate,
                order_by: vec![],
                offset: None,
                limit: None,
                distinct: false,
                grouping: None,
            }
            .add_predicate(Expr::eq(cloned_key, (**key).clone()));
            let expanded = Expr::Grouping {
                key: Box::new((**key).clone()),
                elements: Box::new(RelationalQuery::enumerable(elements)),
            };
            Some(expand_groups(&expanded, ctx))
        }
        Expr::Query(RelationalQuery::Grouped { select, outer_key, inner_key }) => {
            let elements = select.add_predicate(Expr::eq((**inner_key).clone(), (**outer_key).clone()));
            let expanded = Expr::Grouping {
                key: outer_key.clone(),
                elements: Box::new(RelationalQuery::enumerable(elements)),
            };
            Some(expand_groups(&expanded, ctx))
        }
        _ => None,
    })
}
