//! in-process evaluation: the client half of every compiled plan.
//!
//! Everything the composer could not push to the server survives lowering as
//! plain expression nodes: residual operator applications, client calls,
//! materialization shapes.  This module evaluates them.  `Exec` nodes hand
//! off to the command executor and materialize the returned rows through the
//! plan's shape; operator applications fall back to the in-memory
//! implementations here, which follow the usual sequence-operator contracts
//! (nested-loop joins, stable ordering, cardinality errors from the
//! first/single reducers).

use crate::engine::CommandExecutor;
use crate::error::{Error, Result};
use crate::expr::{BinaryOp, Expr, Lambda, OpArg, OpKind, UnaryOp};
use crate::ir::{RelationalQuery, Select};
use crate::lower::{ExecKind, OutputColumn};
use crate::types::ValueType;
use crate::value::{self, ArithOp, Row, Value};

/// One row's table-alias bindings during IR interpretation.
pub type Scope = Vec<(String, Value)>;

/// Runs correlated selects on behalf of the expression evaluator.  The
/// in-memory executor implements this so EXISTS, IN and embedded subqueries
/// can be evaluated inside command interpretation.
pub trait SelectRunner {
    /// Returns the projected value of each row the select produces,
    /// correlated against the caller's scopes.
    fn run(&self, select: &Select, ctx: &EvalContext) -> Result<Vec<Value>>;
}

pub struct EvalContext<'a> {
    pub params: &'a [Value],
    pub vars: Vec<(String, Value)>,
    /// Table-alias bindings, innermost scope last.
    pub scopes: Scope,
    /// Member rows of the group being aggregated, when inside a grouped
    /// projection.
    pub group: Option<&'a [Scope]>,
    pub executor: Option<&'a dyn CommandExecutor>,
    pub runner: Option<&'a dyn SelectRunner>,
    /// The current result row and its column metadata, bound while a
    /// materialization shape is being evaluated.
    pub row: Option<(&'a Row, &'a [OutputColumn])>,
}

impl<'a> EvalContext<'a> {
    pub fn new(params: &'a [Value]) -> EvalContext<'a> {
        EvalContext {
            params,
            vars: vec![],
            scopes: vec![],
            group: None,
            executor: None,
            runner: None,
            row: None,
        }
    }

    fn child(&self) -> EvalContext<'a> {
        EvalContext {
            params: self.params,
            vars: self.vars.clone(),
            scopes: self.scopes.clone(),
            group: self.group,
            executor: self.executor,
            runner: self.runner,
            row: self.row,
        }
    }
}

/// Entry point used by `CompiledPlan::invoke`.
pub fn invoke(root: &Expr, executor: &dyn CommandExecutor, params: &[Value]) -> Result<Value> {
    let mut ctx = EvalContext::new(params);
    ctx.executor = Some(executor);
    eval(root, &ctx)
}

pub fn eval(e: &Expr, ctx: &EvalContext) -> Result<Value> {
    match e {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Parameter(i) => ctx
            .params
            .get(*i)
            .cloned()
            .ok_or(Error::ParameterOutOfRange(*i)),
        Expr::Var(name) => ctx
            .vars
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| Error::UnboundVariable(name.clone())),
        Expr::Member { base, name } => {
            let base = eval(base, ctx)?;
            match base {
                Value::Null => Ok(Value::Null),
                _ => base
                    .field(name)
                    .cloned()
                    .ok_or_else(|| Error::UnknownColumn(name.clone())),
            }
        }
        Expr::Column(c) => {
            let bound = ctx
                .scopes
                .iter()
                .rev()
                .find(|(alias, _)| *alias == c.table)
                .map(|(_, v)| v);
            match bound {
                Some(Value::Null) => Ok(Value::Null),
                Some(v) => v
                    .field(&c.name)
                    .cloned()
                    .ok_or_else(|| Error::UnknownColumn(format!("{}.{}", c.table, c.name))),
                None => Err(Error::UnknownColumn(format!("{}.{}", c.table, c.name))),
            }
        }
        Expr::ClientCall { function, args } => {
            let mut values = vec![];
            for a in args {
                values.push(eval(a, ctx)?);
            }
            function.call(&values)
        }
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, ctx),
        Expr::Unary { op, operand } => {
            let v = eval(operand, ctx)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!v.is_truthy())),
                UnaryOp::Neg => match v {
                    Value::Int(i) => Ok(Value::Int(-i)),
                    Value::Real(x) => Ok(Value::Real(-x)),
                    Value::Null => Ok(Value::Null),
                    other => Err(Error::Type(format!("cannot negate {}", other))),
                },
            }
        }
        Expr::Record(fields) => {
            let mut out = vec![];
            for (name, v) in fields {
                out.push((name.clone(), eval(v, ctx)?));
            }
            Ok(Value::Record(out))
        }
        Expr::Case { test, then, otherwise } => {
            if eval(test, ctx)?.is_truthy() {
                eval(then, ctx)
            } else {
                eval(otherwise, ctx)
            }
        }
        Expr::Cast { operand, ty } => value::cast(&eval(operand, ctx)?, *ty),
        Expr::Coalesce { operand, fallback } => match eval(operand, ctx)? {
            Value::Null => eval(fallback, ctx),
            v => Ok(v),
        },
        Expr::Aggregate { func, operand } => eval_aggregate(*func, operand.as_deref(), ctx),
        Expr::Exists(select) => {
            let runner = ctx.runner.ok_or(Error::NotSupported("subquery outside command"))?;
            Ok(Value::Bool(!runner.run(select, ctx)?.is_empty()))
        }
        Expr::InQuery { needle, select } => {
            let runner = ctx.runner.ok_or(Error::NotSupported("subquery outside command"))?;
            let needle = eval(needle, ctx)?;
            let rows = runner.run(select, ctx)?;
            Ok(Value::Bool(rows.iter().any(|v| value::loose_eq(v, &needle))))
        }
        Expr::Query(q) => {
            let runner = ctx.runner.ok_or(Error::NotSupported("subquery outside command"))?;
            match q {
                RelationalQuery::Enumerable { select } => {
                    Ok(Value::List(runner.run(select, ctx)?))
                }
                RelationalQuery::SingleValue { select } => {
                    Ok(runner.run(select, ctx)?.into_iter().next().unwrap_or(Value::Null))
                }
                _ => Err(Error::NotSupported("grouping marker at runtime")),
            }
        }
        Expr::DefaultIfEmpty { value, flag } => match eval(flag, ctx)? {
            // An absent sentinel means the joined side produced no row.
            Value::Bool(true) | Value::Null => Ok(Value::Null),
            _ => eval(value, ctx),
        },
        Expr::Grouping { key, elements } => {
            let key = eval(key, ctx)?;
            let items = sequence(eval(elements, ctx)?)?;
            Ok(Value::Group { key: Box::new(key), items })
        }
        Expr::Slot(i) => {
            let (row, columns) = ctx.row.ok_or(Error::NotSupported("slot outside row"))?;
            let v = row
                .items
                .get(*i)
                .cloned()
                .ok_or_else(|| Error::UnknownColumn(format!("slot {}", i)))?;
            if columns.get(*i).map_or(false, |c| c.serialized) {
                if let Value::Text(s) = &v {
                    let parsed: serde_json::Value = serde_json::from_str(s)
                        .map_err(|e| Error::Type(format!("bad serialized column: {}", e)))?;
                    return Ok(value::from_json(&parsed));
                }
            }
            Ok(v)
        }
        Expr::Exec(node) => {
            let executor = ctx.executor.ok_or(Error::NotSupported("no executor bound"))?;
            match node.kind {
                ExecKind::Rows => {
                    let rows = executor.rows(&node.command, ctx.params)?;
                    let mut out = vec![];
                    for row in &rows {
                        out.push(materialize(&node.shape, row, &node.command.columns, ctx)?);
                    }
                    Ok(Value::List(out))
                }
                ExecKind::Scalar => {
                    let v = executor.scalar(&node.command, ctx.params)?;
                    let row = Row { items: vec![v] };
                    materialize(&node.shape, &row, &node.command.columns, ctx)
                }
            }
        }
        Expr::Apply { op, source, args } => eval_apply(*op, source, args, ctx),
        Expr::Capture(_) | Expr::Source { .. } => {
            Err(Error::NotSupported("uncompiled node at runtime"))
        }
    }
}

fn materialize(shape: &Expr, row: &Row, columns: &[OutputColumn], ctx: &EvalContext) -> Result<Value> {
    let child = EvalContext {
        params: ctx.params,
        vars: ctx.vars.clone(),
        scopes: ctx.scopes.clone(),
        group: None,
        executor: ctx.executor,
        runner: ctx.runner,
        row: Some((row, columns)),
    };
    eval(shape, &child)
}

fn eval_binary(op: BinaryOp, left: &Expr, right: &Expr, ctx: &EvalContext) -> Result<Value> {
    match op {
        BinaryOp::And => {
            return Ok(Value::Bool(
                eval(left, ctx)?.is_truthy() && eval(right, ctx)?.is_truthy(),
            ))
        }
        BinaryOp::Or => {
            return Ok(Value::Bool(
                eval(left, ctx)?.is_truthy() || eval(right, ctx)?.is_truthy(),
            ))
        }
        _ => {}
    }
    let l = eval(left, ctx)?;
    let r = eval(right, ctx)?;
    match op {
        BinaryOp::Eq => Ok(Value::Bool(value::loose_eq(&l, &r))),
        BinaryOp::Ne => Ok(Value::Bool(!value::loose_eq(&l, &r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            // Ordering comparisons with NULL are never true.
            if matches!(l, Value::Null) || matches!(r, Value::Null) {
                return Ok(Value::Bool(false));
            }
            let ord = value::compare(&l, &r);
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::Le => ord.is_le(),
                BinaryOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            }))
        }
        BinaryOp::Add => value::arith(&l, ArithOp::Add, &r),
        BinaryOp::Subtract => value::arith(&l, ArithOp::Subtract, &r),
        BinaryOp::Multiply => value::arith(&l, ArithOp::Multiply, &r),
        BinaryOp::Divide => value::arith(&l, ArithOp::Divide, &r),
        BinaryOp::Modulo => value::arith(&l, ArithOp::Modulo, &r),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn eval_aggregate(
    func: crate::expr::AggFn,
    operand: Option<&Expr>,
    ctx: &EvalContext,
) -> Result<Value> {
    use crate::expr::AggFn;
    let group = ctx
        .group
        .ok_or_else(|| Error::Type("aggregate outside grouped context".to_string()))?;
    let operand = match operand {
        None => return Ok(Value::Int(group.len() as i64)),
        Some(o) => o,
    };
    let mut values = vec![];
    for member in group {
        let mut child = ctx.child();
        child.group = None;
        child.scopes = member.clone();
        values.push(eval(operand, &child)?);
    }
    let non_null: Vec<Value> = values.into_iter().filter(|v| !matches!(v, Value::Null)).collect();
    match func {
        AggFn::Count => Ok(Value::Int(non_null.len() as i64)),
        // SQL semantics at the command level: aggregates over no rows are
        // NULL (the client-side operator fallbacks differ; see fold_*).
        AggFn::Sum => {
            if non_null.is_empty() {
                Ok(Value::Null)
            } else {
                sum_values(&non_null)
            }
        }
        AggFn::Avg => {
            if non_null.is_empty() {
                Ok(Value::Null)
            } else {
                avg_values(&non_null)
            }
        }
        AggFn::Min => Ok(non_null
            .into_iter()
            .min_by(|a, b| value::compare(a, b))
            .unwrap_or(Value::Null)),
        AggFn::Max => Ok(non_null
            .into_iter()
            .max_by(|a, b| value::compare(a, b))
            .unwrap_or(Value::Null)),
    }
}

fn sum_values(values: &[Value]) -> Result<Value> {
    let mut acc = Value::Int(0);
    for v in values {
        acc = value::arith(&acc, ArithOp::Add, v)?;
    }
    Ok(acc)
}

fn avg_values(values: &[Value]) -> Result<Value> {
    let total = sum_values(values)?;
    let total = match total {
        Value::Int(i) => i as f64,
        Value::Real(x) => x,
        other => return Err(Error::Type(format!("cannot average {}", other))),
    };
    Ok(Value::Real(total / values.len() as f64))
}

fn sequence(v: Value) -> Result<Vec<Value>> {
    match v {
        Value::List(items) => Ok(items),
        Value::Group { items, .. } => Ok(items),
        other => Err(Error::Type(format!("expected a sequence, got {}", other))),
    }
}

fn call_lambda(l: &Lambda, args: &[Value], ctx: &EvalContext) -> Result<Value> {
    let mut child = ctx.child();
    for (p, v) in l.params.iter().zip(args.iter()) {
        child.vars.push((p.clone(), v.clone()));
    }
    eval(&l.body, &child)
}

fn lambda_arg<'e>(args: &'e [OpArg], index: usize) -> Option<&'e Lambda> {
    match args.get(index) {
        Some(OpArg::Lambda(l)) => Some(l),
        _ => None,
    }
}

fn value_arg<'e>(args: &'e [OpArg], index: usize) -> Option<&'e Expr> {
    match args.get(index) {
        Some(OpArg::Value(v)) => Some(v),
        _ => None,
    }
}

fn int_arg(args: &[OpArg], index: usize, ctx: &EvalContext) -> Result<i64> {
    let e = value_arg(args, index)
        .ok_or(Error::NotSupported("missing count argument"))?;
    match eval(e, ctx)? {
        Value::Int(i) => Ok(i),
        other => Err(Error::Type(format!("expected integer count, got {}", other))),
    }
}

fn eval_apply(op: OpKind, source: &Expr, args: &[OpArg], ctx: &EvalContext) -> Result<Value> {
    use OpKind::*;
    if matches!(op, OrderBy | OrderByDesc | ThenBy | ThenByDesc) {
        return eval_order_chain(op, source, args, ctx);
    }
    let items = sequence(eval(source, ctx)?)?;
    match op {
        Filter => {
            let predicate = lambda_arg(args, 0).ok_or(Error::NotSupported("filter predicate"))?;
            let mut out = vec![];
            for item in items {
                if call_lambda(predicate, &[item.clone()], ctx)?.is_truthy() {
                    out.push(item);
                }
            }
            Ok(Value::List(out))
        }
        Map => {
            let selector = lambda_arg(args, 0).ok_or(Error::NotSupported("map selector"))?;
            let mut out = vec![];
            for item in items {
                out.push(call_lambda(selector, &[item], ctx)?);
            }
            Ok(Value::List(out))
        }
        FlatMap => {
            let collection =
                lambda_arg(args, 0).ok_or(Error::NotSupported("flat_map collection"))?;
            let result = lambda_arg(args, 1).ok_or(Error::NotSupported("flat_map result"))?;
            let mut out = vec![];
            for item in items {
                let inner = sequence(call_lambda(collection, &[item.clone()], ctx)?)?;
                for inner_item in inner {
                    out.push(call_lambda(result, &[item.clone(), inner_item], ctx)?);
                }
            }
            Ok(Value::List(out))
        }
        Join => {
            let inner_expr = value_arg(args, 0).ok_or(Error::NotSupported("join inner"))?;
            let outer_key = lambda_arg(args, 1).ok_or(Error::NotSupported("join outer key"))?;
            let inner_key = lambda_arg(args, 2).ok_or(Error::NotSupported("join inner key"))?;
            let result = lambda_arg(args, 3).ok_or(Error::NotSupported("join result"))?;
            let inner_items = sequence(eval(inner_expr, ctx)?)?;
            // Naive nested loop; both sides are fully in memory by now.
            let mut out = vec![];
            for o in &items {
                let ok = call_lambda(outer_key, &[o.clone()], ctx)?;
                for i in &inner_items {
                    let ik = call_lambda(inner_key, &[i.clone()], ctx)?;
                    if value::loose_eq(&ok, &ik) {
                        out.push(call_lambda(result, &[o.clone(), i.clone()], ctx)?);
                    }
                }
            }
            Ok(Value::List(out))
        }
        GroupJoin => {
            let inner_expr = value_arg(args, 0).ok_or(Error::NotSupported("group_join inner"))?;
            let outer_key = lambda_arg(args, 1).ok_or(Error::NotSupported("group_join key"))?;
            let inner_key = lambda_arg(args, 2).ok_or(Error::NotSupported("group_join key"))?;
            let result = lambda_arg(args, 3).ok_or(Error::NotSupported("group_join result"))?;
            let inner_items = sequence(eval(inner_expr, ctx)?)?;
            let mut out = vec![];
            for o in &items {
                let ok = call_lambda(outer_key, &[o.clone()], ctx)?;
                let mut members = vec![];
                for i in &inner_items {
                    if value::loose_eq(&ok, &call_lambda(inner_key, &[i.clone()], ctx)?) {
                        members.push(i.clone());
                    }
                }
                let group = Value::Group { key: Box::new(ok), items: members };
                out.push(call_lambda(result, &[o.clone(), group], ctx)?);
            }
            Ok(Value::List(out))
        }
        OfType => {
            let target = match args.first() {
                Some(OpArg::Type(t)) => *t,
                _ => return Err(Error::NotSupported("of_type target")),
            };
            Ok(Value::List(
                items.into_iter().filter(|v| matches_type(v, target)).collect(),
            ))
        }
        GroupBy => eval_group_by(items, args, ctx),
        DefaultIfEmpty => {
            if !items.is_empty() {
                return Ok(Value::List(items));
            }
            let default = match value_arg(args, 0) {
                Some(e) => eval(e, ctx)?,
                None => Value::Null,
            };
            Ok(Value::List(vec![default]))
        }
        First | FirstOrDefault | Single | SingleOrDefault | Last | LastOrDefault => {
            eval_element_reducer(op, items, args, ctx)
        }
        ElementAt => {
            let index = int_arg(args, 0, ctx)?;
            items
                .into_iter()
                .nth(index.max(0) as usize)
                .ok_or(Error::NoElement)
        }
        Reverse => Ok(Value::List(items.into_iter().rev().collect())),
        Take => {
            let n = int_arg(args, 0, ctx)?.max(0) as usize;
            Ok(Value::List(items.into_iter().take(n).collect()))
        }
        Skip => {
            let n = int_arg(args, 0, ctx)?.max(0) as usize;
            Ok(Value::List(items.into_iter().skip(n).collect()))
        }
        TakeWhile => {
            let predicate = lambda_arg(args, 0).ok_or(Error::NotSupported("take_while"))?;
            let mut out = vec![];
            for item in items {
                if !call_lambda(predicate, &[item.clone()], ctx)?.is_truthy() {
                    break;
                }
                out.push(item);
            }
            Ok(Value::List(out))
        }
        SkipWhile => {
            let predicate = lambda_arg(args, 0).ok_or(Error::NotSupported("skip_while"))?;
            let mut out = vec![];
            let mut skipping = true;
            for item in items {
                if skipping && call_lambda(predicate, &[item.clone()], ctx)?.is_truthy() {
                    continue;
                }
                skipping = false;
                out.push(item);
            }
            Ok(Value::List(out))
        }
        Distinct => Ok(Value::List(distinct_values(items))),
        Concat => {
            let other = sequence(eval(
                value_arg(args, 0).ok_or(Error::NotSupported("concat source"))?,
                ctx,
            )?)?;
            Ok(Value::List(items.into_iter().chain(other).collect()))
        }
        Union => {
            let other = sequence(eval(
                value_arg(args, 0).ok_or(Error::NotSupported("union source"))?,
                ctx,
            )?)?;
            Ok(Value::List(distinct_values(
                items.into_iter().chain(other).collect(),
            )))
        }
        Except => {
            let other = sequence(eval(
                value_arg(args, 0).ok_or(Error::NotSupported("except source"))?,
                ctx,
            )?)?;
            Ok(Value::List(
                distinct_values(items)
                    .into_iter()
                    .filter(|v| !other.iter().any(|o| value::loose_eq(o, v)))
                    .collect(),
            ))
        }
        Intersect => {
            let other = sequence(eval(
                value_arg(args, 0).ok_or(Error::NotSupported("intersect source"))?,
                ctx,
            )?)?;
            Ok(Value::List(
                distinct_values(items)
                    .into_iter()
                    .filter(|v| other.iter().any(|o| value::loose_eq(o, v)))
                    .collect(),
            ))
        }
        Zip => {
            let other = sequence(eval(
                value_arg(args, 0).ok_or(Error::NotSupported("zip source"))?,
                ctx,
            )?)?;
            let result = lambda_arg(args, 1).ok_or(Error::NotSupported("zip result"))?;
            let mut out = vec![];
            for (a, b) in items.into_iter().zip(other.into_iter()) {
                out.push(call_lambda(result, &[a, b], ctx)?);
            }
            Ok(Value::List(out))
        }
        SequenceEqual => {
            let other = sequence(eval(
                value_arg(args, 0).ok_or(Error::NotSupported("sequence_equal source"))?,
                ctx,
            )?)?;
            let equal = items.len() == other.len()
                && items.iter().zip(other.iter()).all(|(a, b)| value::loose_eq(a, b));
            Ok(Value::Bool(equal))
        }
        Any => match lambda_arg(args, 0) {
            None => Ok(Value::Bool(!items.is_empty())),
            Some(predicate) => {
                for item in items {
                    if call_lambda(predicate, &[item], ctx)?.is_truthy() {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
        },
        All => {
            let predicate = lambda_arg(args, 0).ok_or(Error::NotSupported("all predicate"))?;
            for item in items {
                if !call_lambda(predicate, &[item], ctx)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        Contains => {
            let needle = eval(
                value_arg(args, 0).ok_or(Error::NotSupported("contains value"))?,
                ctx,
            )?;
            Ok(Value::Bool(items.iter().any(|v| value::loose_eq(v, &needle))))
        }
        Count => match lambda_arg(args, 0) {
            None => Ok(Value::Int(items.len() as i64)),
            Some(predicate) => {
                let mut n = 0i64;
                for item in items {
                    if call_lambda(predicate, &[item], ctx)?.is_truthy() {
                        n += 1;
                    }
                }
                Ok(Value::Int(n))
            }
        },
        Sum | Average | Min | Max => {
            let values = match lambda_arg(args, 0) {
                None => items,
                Some(selector) => {
                    let mut out = vec![];
                    for item in items {
                        out.push(call_lambda(selector, &[item], ctx)?);
                    }
                    out
                }
            };
            let non_null: Vec<Value> =
                values.into_iter().filter(|v| !matches!(v, Value::Null)).collect();
            match op {
                Sum => sum_values(&non_null),
                Average => {
                    if non_null.is_empty() {
                        Err(Error::NoElement)
                    } else {
                        avg_values(&non_null)
                    }
                }
                Min => non_null
                    .into_iter()
                    .min_by(|a, b| value::compare(a, b))
                    .ok_or(Error::NoElement),
                Max => non_null
                    .into_iter()
                    .max_by(|a, b| value::compare(a, b))
                    .ok_or(Error::NoElement),
                _ => unreachable!(),
            }
        }
        OrderBy | OrderByDesc | ThenBy | ThenByDesc => unreachable!("handled above"),
    }
}

fn eval_group_by(items: Vec<Value>, args: &[OpArg], ctx: &EvalContext) -> Result<Value> {
    let key_l = lambda_arg(args, 0).ok_or(Error::NotSupported("group_by key"))?;
    let mut element_l: Option<&Lambda> = None;
    let mut result_l: Option<&Lambda> = None;
    for arg in &args[1..] {
        match arg {
            OpArg::Lambda(l) if l.params.len() == 1 && element_l.is_none() => element_l = Some(l),
            OpArg::Lambda(l) if l.params.len() == 2 && result_l.is_none() => result_l = Some(l),
            _ => return Err(Error::NotSupported("group_by arguments")),
        }
    }
    // Keys keep first-occurrence order.
    let mut groups: Vec<(Value, Vec<Value>)> = vec![];
    for item in items {
        let key = call_lambda(key_l, &[item.clone()], ctx)?;
        let element = match element_l {
            Some(l) => call_lambda(l, &[item], ctx)?,
            None => item,
        };
        match groups.iter_mut().find(|(k, _)| value::loose_eq(k, &key)) {
            Some((_, members)) => members.push(element),
            None => groups.push((key, vec![element])),
        }
    }
    let mut out = vec![];
    for (key, members) in groups {
        let group = Value::Group { key: Box::new(key.clone()), items: members };
        out.push(match result_l {
            Some(l) => call_lambda(l, &[key, group], ctx)?,
            None => group,
        });
    }
    Ok(Value::List(out))
}

fn eval_element_reducer(
    op: OpKind,
    items: Vec<Value>,
    args: &[OpArg],
    ctx: &EvalContext,
) -> Result<Value> {
    use OpKind::*;
    let filtered = match lambda_arg(args, 0) {
        None => items,
        Some(predicate) => {
            let mut out = vec![];
            for item in items {
                if call_lambda(predicate, &[item.clone()], ctx)?.is_truthy() {
                    out.push(item);
                }
            }
            out
        }
    };
    let or_default = matches!(op, FirstOrDefault | SingleOrDefault | LastOrDefault);
    if filtered.is_empty() {
        return if or_default { Ok(Value::Null) } else { Err(Error::NoElement) };
    }
    match op {
        First | FirstOrDefault => Ok(filtered.into_iter().next().unwrap()),
        Last | LastOrDefault => Ok(filtered.into_iter().last().unwrap()),
        Single | SingleOrDefault => {
            if filtered.len() > 1 {
                Err(Error::MoreThanOneElement)
            } else {
                Ok(filtered.into_iter().next().unwrap())
            }
        }
        _ => unreachable!("not an element reducer: {:?}", op),
    }
}

/// Order-by chains sort once over the whole key list: the chain of
/// then-by applications is walked down to the innermost order-by, keys are
/// computed per item, and one stable sort applies them most-significant
/// first.
fn eval_order_chain(op: OpKind, source: &Expr, args: &[OpArg], ctx: &EvalContext) -> Result<Value> {
    use OpKind::*;
    let mut specs: Vec<(&Lambda, bool)> = vec![];
    let key = lambda_arg(args, 0).ok_or(Error::NotSupported("ordering key"))?;
    specs.push((key, matches!(op, OrderByDesc | ThenByDesc)));
    let mut base = source;
    if matches!(op, ThenBy | ThenByDesc) {
        loop {
            match base {
                Expr::Apply { op: inner_op, source: inner_source, args: inner_args }
                    if matches!(inner_op, OrderBy | OrderByDesc | ThenBy | ThenByDesc) =>
                {
                    let inner_key =
                        lambda_arg(inner_args, 0).ok_or(Error::NotSupported("ordering key"))?;
                    specs.push((inner_key, matches!(inner_op, OrderByDesc | ThenByDesc)));
                    let stop = matches!(inner_op, OrderBy | OrderByDesc);
                    base = inner_source;
                    if stop {
                        break;
                    }
                }
                _ => break,
            }
        }
    }
    specs.reverse(); // most significant key first
    let items = sequence(eval(base, ctx)?)?;
    let mut keyed: Vec<(Vec<Value>, Value)> = vec![];
    for item in items {
        let mut keys = vec![];
        for (l, _) in &specs {
            keys.push(call_lambda(l, &[item.clone()], ctx)?);
        }
        keyed.push((keys, item));
    }
    keyed.sort_by(|(a, _), (b, _)| {
        for (i, (_, descending)) in specs.iter().enumerate() {
            let ord = value::compare(&a[i], &b[i]);
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
    Ok(Value::List(keyed.into_iter().map(|(_, v)| v).collect()))
}

fn distinct_values(items: Vec<Value>) -> Vec<Value> {
    let mut out: Vec<Value> = vec![];
    for item in items {
        if !out.iter().any(|v| value::loose_eq(v, &item)) {
            out.push(item);
        }
    }
    out
}

/// Filter-by-type uses the runtime tag; NULL matches nothing.
fn matches_type(v: &Value, ty: ValueType) -> bool {
    !matches!(v, Value::Null) && v.value_type() == Some(ty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Lambda;
    use itertools::Itertools;

    fn list(values: Vec<i64>) -> Expr {
        Expr::Literal(Value::List(values.into_iter().map(Value::Int).collect()))
    }

    fn eval_plain(e: &Expr) -> Result<Value> {
        eval(e, &EvalContext::new(&[]))
    }

    #[test]
    fn test_filter_map_chain() {
        let q = list(vec![1, 2, 3, 4])
            .filter(Lambda::new(
                "x",
                Expr::binary(BinaryOp::Gt, Expr::var("x"), Expr::lit(2)),
            ))
            .map(Lambda::new(
                "x",
                Expr::binary(BinaryOp::Multiply, Expr::var("x"), Expr::lit(10)),
            ));
        assert_eq!(
            eval_plain(&q).unwrap(),
            Value::List(vec![Value::Int(30), Value::Int(40)])
        );
    }

    #[test]
    fn test_single_cardinality_errors() {
        struct Case {
            desc: &'static str,
            input: Vec<i64>,
            expected_err: Option<Error>,
        }
        let cases = vec![
            Case { desc: "empty source", input: vec![], expected_err: Some(Error::NoElement) },
            Case { desc: "one row", input: vec![7], expected_err: None },
            Case {
                desc: "two rows",
                input: vec![1, 2],
                expected_err: Some(Error::MoreThanOneElement),
            },
        ];
        for case in cases {
            let q = list(case.input).single();
            let actual = eval_plain(&q);
            match (actual, case.expected_err) {
                (Ok(v), None) => assert_eq!(v, Value::Int(7), "{}", case.desc),
                (Err(Error::NoElement), Some(Error::NoElement)) => {}
                (Err(Error::MoreThanOneElement), Some(Error::MoreThanOneElement)) => {}
                (actual, expected) => {
                    panic!("{}: got {:?}, expected {:?}", case.desc, actual, expected)
                }
            }
        }
    }

    #[test]
    fn test_order_chain_applies_keys_in_significance_order() {
        let items = Value::List(vec![
            Value::Record(vec![("a".into(), Value::Int(1)), ("b".into(), Value::Int(2))]),
            Value::Record(vec![("a".into(), Value::Int(1)), ("b".into(), Value::Int(1))]),
            Value::Record(vec![("a".into(), Value::Int(0)), ("b".into(), Value::Int(9))]),
        ]);
        let q = Expr::Literal(items)
            .order_by(Lambda::new("x", Expr::member(Expr::var("x"), "a")))
            .then_by(Lambda::new("x", Expr::member(Expr::var("x"), "b")));
        match eval_plain(&q).unwrap() {
            Value::List(sorted) => {
                let pairs: Vec<(i64, i64)> = sorted
                    .iter()
                    .map(|r| {
                        (
                            r.field("a").unwrap().as_int().copied().unwrap(),
                            r.field("b").unwrap().as_int().copied().unwrap(),
                        )
                    })
                    .collect();
                assert_eq!(pairs, vec![(0, 9), (1, 1), (1, 2)]);
            }
            _ => panic!("expected list"),
        }
    }

    #[test]
    fn test_set_operators() {
        let union = list(vec![1, 2]).apply(
            OpKind::Union,
            vec![OpArg::Value(list(vec![2, 3]))],
        );
        assert_eq!(
            eval_plain(&union).unwrap(),
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        let except = list(vec![1, 2, 2, 3]).apply(
            OpKind::Except,
            vec![OpArg::Value(list(vec![2]))],
        );
        assert_eq!(
            eval_plain(&except).unwrap(),
            Value::List(vec![Value::Int(1), Value::Int(3)])
        );
    }

    #[test]
    fn test_group_by_preserves_first_occurrence_order() {
        let q = list(vec![3, 1, 3, 2]).group_by(Lambda::new("x", Expr::var("x")));
        match eval_plain(&q).unwrap() {
            Value::List(groups) => {
                let keys: Vec<i64> = groups
                    .iter()
                    .map(|g| match g {
                        Value::Group { key, .. } => *key.as_int().unwrap(),
                        _ => panic!("expected group"),
                    })
                    .collect();
                assert_eq!(keys, vec![3, 1, 2]);
            }
            _ => panic!("expected list"),
        }
    }

    #[test]
    fn test_default_if_empty() {
        let q = list(vec![]).apply(OpKind::DefaultIfEmpty, vec![]);
        assert_eq!(eval_plain(&q).unwrap(), Value::List(vec![Value::Null]));
    }

    #[test]
    fn test_itertools_available_for_pairing() {
        // Zip pairs positionally and stops at the shorter side.
        let q = list(vec![1, 2, 3]).apply(
            OpKind::Zip,
            vec![
                OpArg::Value(list(vec![10, 20])),
                OpArg::Lambda(Lambda::new2(
                    "a",
                    "b",
                    Expr::binary(BinaryOp::Add, Expr::var("a"), Expr::var("b")),
                )),
            ],
        );
        assert_eq!(
            eval_plain(&q).unwrap(),
            Value::List(vec![Value::Int(11), Value::Int(22)])
        );
        let pairs: Vec<(i64, i64)> = vec![1, 2].into_iter().zip(vec![3, 4]).collect_vec();
        assert_eq!(pairs, vec![(1, 3), (2, 4)]);
    }
}
