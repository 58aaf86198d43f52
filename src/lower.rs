//! lowers a composed tree into a directly executable plan.
//!
//! Every relational query node, including those buried inside client-side
//! lambdas, is pre-rendered into an `Exec` node carrying the finalized
//! command text and a materialization shape, so a cache hit never renders
//! SQL again.  The shape is itself an expression over `Slot(i)` references:
//! materializing a row means evaluating the shape with the row's columns
//! bound to the slots.  Composite projections recombine by substituting the
//! two sub-shapes into the client-side combine lambda.

use std::sync::Arc;

use tracing::debug;

use crate::dialect::SqlDialect;
use crate::error::{Error, Result};
use crate::expr::{self, Expr};
use crate::ir::{Projection, RelationalQuery, Select};
use crate::rewrite;

/// One output column of a command: its result-set name, the IR expression
/// the database computes, and whether the value arrives serialized (a
/// structured correlated subquery wrapped into a single JSON column).
#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    pub name: String,
    pub expr: Expr,
    pub serialized: bool,
}

/// A finalized database command: rendered text with `?` placeholders, the
/// plan-parameter index feeding each placeholder in order, the output
/// columns, and the IR it was rendered from (which in-process executors
/// interpret directly).
#[derive(Debug, Clone)]
pub struct Command {
    pub text: String,
    pub param_slots: Vec<usize>,
    pub columns: Vec<OutputColumn>,
    pub select: Arc<Select>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecKind {
    Rows,
    Scalar,
}

/// A lowered relational query: issue the command, then materialize each
/// returned row through the shape.
#[derive(Debug, Clone)]
pub struct ExecNode {
    pub command: Command,
    pub shape: Expr,
    pub kind: ExecKind,
}

impl PartialEq for ExecNode {
    fn eq(&self, other: &Self) -> bool {
        self.command.text == other.command.text && self.shape == other.shape
    }
}

/// The cached, executable form of a query shape.  Invoke with an executor
/// handle and the current captured values, in the order the normalizer
/// recorded them.
#[derive(Debug)]
pub struct CompiledPlan {
    pub root: Expr,
    pub param_count: usize,
}

impl CompiledPlan {
    pub fn invoke(
        &self,
        executor: &dyn crate::engine::CommandExecutor,
        params: &[crate::value::Value],
    ) -> Result<crate::value::Value> {
        if params.len() != self.param_count {
            return Err(Error::ParameterOutOfRange(params.len()));
        }
        crate::client::invoke(&self.root, executor, params)
    }
}

/// Replaces every relational query node in the tree with an `Exec` node.
pub fn lower(e: &Expr, dialect: &dyn SqlDialect, param_count: usize) -> Result<CompiledPlan> {
    let mut err: Option<Error> = None;
    let root = expr::transform(e, &mut |node| match node {
        Expr::Query(q) => match lower_query(q, dialect) {
            Ok(exec) => Some(Expr::Exec(Arc::new(exec))),
            Err(failure) => {
                err = Some(failure);
                Some(node.clone())
            }
        },
        _ => None,
    });
    match err {
        Some(failure) => Err(failure),
        None => Ok(CompiledPlan { root, param_count }),
    }
}

fn lower_query(q: &RelationalQuery, dialect: &dyn SqlDialect) -> Result<ExecNode> {
    let (select, kind) = match q {
        RelationalQuery::Enumerable { select } => (select, ExecKind::Rows),
        RelationalQuery::SingleValue { select } => (select, ExecKind::Scalar),
        RelationalQuery::Grouped { .. } | RelationalQuery::GroupByResult { .. } => {
            // The group expansion pass removes these before lowering runs.
            return Err(Error::NotSupported("unexpanded grouping marker"));
        }
    };
    let mut columns = vec![];
    let shape = project_shape(&select.projection, &mut columns);
    let rendered = dialect.render(select, &columns)?;
    debug!(sql = rendered.text.as_str(), "rendered command");
    Ok(ExecNode {
        command: Command {
            text: rendered.text,
            param_slots: rendered.param_slots,
            columns,
            select: Arc::new((**select).clone()),
        },
        shape,
        kind,
    })
}

/// Flattens a projection into output columns while building the
/// materialization shape over them.  The client-side layers of mapped and
/// composite projections become part of the shape, evaluated per row after
/// the server columns are bound.
pub fn project_shape(projection: &Projection, columns: &mut Vec<OutputColumn>) -> Expr {
    match projection {
        Projection::Server(body) => flatten_shape(body, "", columns),
        Projection::Mapped { source, map } => {
            let source_shape = project_shape(source, columns);
            expr::expand_lambda(map, &[source_shape])
        }
        Projection::Composite { outer, inner, combine } => {
            let outer_shape = project_shape(outer, columns);
            let inner_shape = project_shape(inner, columns);
            expr::expand_lambda(combine, &[outer_shape, inner_shape])
        }
    }
}

// Mirrors `rewrite::flatten_leaves` so column order and names agree between
// the command and the derived-table view of the same projection.
fn flatten_shape(body: &Expr, prefix: &str, columns: &mut Vec<OutputColumn>) -> Expr {
    let path = |name: &str| {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}_{}", prefix, name)
        }
    };
    match body {
        Expr::Record(fields) => Expr::Record(
            fields
                .iter()
                .map(|(name, v)| (name.clone(), flatten_shape(v, &path(name), columns)))
                .collect(),
        ),
        Expr::Grouping { key, elements } => {
            let key_shape = flatten_shape(key, &path("key"), columns);
            let slot = columns.len();
            columns.push(OutputColumn {
                name: path("items"),
                expr: (**elements).clone(),
                serialized: true,
            });
            Expr::Grouping { key: Box::new(key_shape), elements: Box::new(Expr::Slot(slot)) }
        }
        Expr::DefaultIfEmpty { value, flag } => {
            let value_shape = flatten_shape(value, prefix, columns);
            let slot = columns.len();
            columns.push(OutputColumn {
                name: path(rewrite::EMPTY_SENTINEL),
                expr: (**flag).clone(),
                serialized: false,
            });
            Expr::DefaultIfEmpty { value: Box::new(value_shape), flag: Box::new(Expr::Slot(slot)) }
        }
        leaf => {
            let slot = columns.len();
            let serialized = matches!(leaf, Expr::Query(RelationalQuery::Enumerable { .. }));
            let name = if prefix.is_empty() {
                match leaf {
                    Expr::Column(c) => c.name.clone(),
                    _ => "value".to_string(),
                }
            } else {
                prefix.to_string()
            };
            columns.push(OutputColumn { name, expr: leaf.clone(), serialized });
            Expr::Slot(slot)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Lambda;

    #[test]
    fn test_flatten_shape_slots_follow_columns() {
        let body = Expr::Record(vec![
            ("a".to_string(), Expr::column("t0", "a", None)),
            (
                "n".to_string(),
                Expr::Record(vec![("b".to_string(), Expr::column("t0", "b", None))]),
            ),
        ]);
        let mut columns = vec![];
        let shape = flatten_shape(&body, "", &mut columns);
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].name, "a");
        assert_eq!(columns[1].name, "n_b");
        match shape {
            Expr::Record(fields) => {
                assert_eq!(fields[0].1, Expr::Slot(0));
                match &fields[1].1 {
                    Expr::Record(inner) => assert_eq!(inner[0].1, Expr::Slot(1)),
                    _ => panic!("nested record shape lost"),
                }
            }
            _ => panic!("record shape lost"),
        }
    }

    #[test]
    fn test_composite_projection_shape_applies_combine() {
        let outer = Projection::Server(Expr::column("t0", "a", None));
        let inner = Projection::Server(Expr::column("t1", "b", None));
        let combine = Lambda::new2(
            "o",
            "i",
            Expr::Record(vec![
                ("left".to_string(), Expr::var("o")),
                ("right".to_string(), Expr::var("i")),
            ]),
        );
        let projection = Projection::Composite {
            outer: Box::new(outer),
            inner: Box::new(inner),
            combine,
        };
        let mut columns = vec![];
        let shape = project_shape(&projection, &mut columns);
        assert_eq!(columns.len(), 2);
        assert_eq!(
            shape,
            Expr::Record(vec![
                ("left".to_string(), Expr::Slot(0)),
                ("right".to_string(), Expr::Slot(1)),
            ])
        );
    }
}
