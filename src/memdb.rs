//! provides an in-memory database that executes finalized relational IR.
//!
//! `MemDb` implements the command-executor contract by interpreting the
//! `Select` carried alongside each command's text: scans, derived tables,
//! joins (including the correlated apply kinds), set operators, grouping
//! with aggregates, distinct, ordering and row windows.  It stands in for a
//! real database in tests and demos; a production executor would send the
//! command text over a wire instead.
//!
//! Tables are plain rust data structures.  Rows are validated on insert so
//! interpretation can assume shapes line up.

use std::collections::HashMap;

use itertools::Itertools;
use streaming_iterator::StreamingIterator;

use crate::client::{self, EvalContext, Scope, SelectRunner};
use crate::engine::CommandExecutor;
use crate::error::{Error, Result};
use crate::expr::{self, Expr};
use crate::ir::{JoinKind, Select, SetOpKind, Table};
use crate::lower::Command;
use crate::rewrite;
use crate::types::ValueType;
use crate::value::{Row, Value};

#[derive(thiserror::Error, Debug)]
pub enum TableError {
    #[error("Row has {0} values but table has {1} columns.")]
    ColumnCountMismatch(usize, usize),
    #[error("Value {1} does not fit column {0} of type {2}.")]
    TypeMismatch(usize, String, ValueType),
}

impl From<TableError> for Error {
    fn from(e: TableError) -> Error {
        Error::Type(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct MemTable {
    pub name: String,
    pub column_names: Vec<String>,
    pub column_types: Vec<ValueType>,
    pub rows: Vec<Row>,
}

impl MemTable {
    pub fn new(name: impl Into<String>, columns: Vec<(&str, ValueType)>) -> MemTable {
        MemTable {
            name: name.into(),
            column_names: columns.iter().map(|(n, _)| n.to_string()).collect(),
            column_types: columns.iter().map(|(_, t)| *t).collect(),
            rows: vec![],
        }
    }

    /// appends a row after checking it against the declared columns.
    /// NULL fits any column.
    pub fn append_row(&mut self, items: Vec<Value>) -> std::result::Result<(), TableError> {
        if items.len() != self.column_names.len() {
            return Err(TableError::ColumnCountMismatch(items.len(), self.column_names.len()));
        }
        for (i, v) in items.iter().enumerate() {
            match v.value_type() {
                Some(ValueType::Null) => {}
                Some(t) if t == self.column_types[i] => {}
                _ => {
                    return Err(TableError::TypeMismatch(
                        i,
                        v.to_string(),
                        self.column_types[i],
                    ))
                }
            }
        }
        self.rows.push(Row { items });
        Ok(())
    }

    pub fn streaming_iterator(&self) -> MemTableStreamingIterator {
        MemTableStreamingIterator::new(self.rows.iter())
    }

    fn row_record(&self, row: &Row) -> Value {
        Value::Record(
            self.column_names
                .iter()
                .cloned()
                .zip(row.items.iter().cloned())
                .collect(),
        )
    }
}

/// iterates over the rows of a MemTable.
/// The lifetime is bound by the lifetime of the table.
pub struct MemTableStreamingIterator<'a> {
    it: std::slice::Iter<'a, Row>,
    item: Option<Row>,
}

impl<'a> MemTableStreamingIterator<'a> {
    fn new(it: std::slice::Iter<'a, Row>) -> MemTableStreamingIterator<'a> {
        MemTableStreamingIterator { it, item: None }
    }
}

impl<'a> StreamingIterator for MemTableStreamingIterator<'a> {
    type Item = Row;

    #[inline]
    fn advance(&mut self) {
        self.item = self.it.next().cloned();
    }

    #[inline]
    fn get(&self) -> Option<&Row> {
        self.item.as_ref()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemDb {
    tables: HashMap<String, MemTable>,
}

impl MemDb {
    pub fn new() -> MemDb {
        MemDb { tables: HashMap::new() }
    }

    pub fn with_table(
        mut self,
        name: &str,
        columns: Vec<(&str, ValueType)>,
        rows: Vec<Vec<Value>>,
    ) -> Result<MemDb> {
        let mut table = MemTable::new(name, columns);
        for items in rows {
            table.append_row(items)?;
        }
        self.tables.insert(name.to_string(), table);
        Ok(self)
    }

    pub fn table(&self, name: &str) -> Result<&MemTable> {
        self.tables
            .get(name)
            .ok_or_else(|| Error::UnknownTable(name.to_string()))
    }
}

impl CommandExecutor for MemDb {
    fn rows(&self, command: &Command, params: &[Value]) -> Result<Vec<Row>> {
        let interp = Interp { db: self };
        let mut ctx = EvalContext::new(params);
        ctx.runner = Some(&interp);
        let units = interp.select_units(&command.select, &ctx)?;
        let mut out = vec![];
        for unit in &units {
            let mut items = vec![];
            for column in &command.columns {
                items.push(interp.eval_in_unit(&column.expr, unit, &ctx)?);
            }
            out.push(Row { items });
        }
        interp.finalize_rows(&command.select, out, &ctx)
    }

    fn scalar(&self, command: &Command, params: &[Value]) -> Result<Value> {
        let rows = self.rows(command, params)?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|r| r.items.into_iter().next())
            .unwrap_or(Value::Null))
    }
}

/// One projected unit: the representative row environment, plus the member
/// environments when the select aggregates.
struct Unit {
    env: Scope,
    group: Option<Vec<Scope>>,
}

struct Interp<'a> {
    db: &'a MemDb,
}

impl<'a> SelectRunner for Interp<'a> {
    fn run(&self, select: &Select, ctx: &EvalContext) -> Result<Vec<Value>> {
        let units = self.select_units(select, ctx)?;
        let mut out = vec![];
        let body = select.projection.body();
        for unit in &units {
            out.push(self.eval_in_unit(&body, unit, ctx)?);
        }
        self.finalize_values(select, out, ctx)
    }
}

impl<'a> Interp<'a> {
    fn eval_in_unit(&self, e: &Expr, unit: &Unit, ctx: &EvalContext) -> Result<Value> {
        let child = EvalContext {
            params: ctx.params,
            vars: ctx.vars.clone(),
            scopes: unit.env.clone(),
            group: unit.group.as_deref(),
            executor: None,
            runner: Some(self),
            row: None,
        };
        client::eval(e, &child)
    }

    fn eval_in_env(&self, e: &Expr, env: &Scope, ctx: &EvalContext) -> Result<Value> {
        let child = EvalContext {
            params: ctx.params,
            vars: ctx.vars.clone(),
            scopes: env.clone(),
            group: None,
            executor: None,
            runner: Some(self),
            row: None,
        };
        client::eval(e, &child)
    }

    /// Produces the per-unit environments for a select: scan/join/filter,
    /// order, then group when the statement aggregates.
    fn select_units(&self, select: &Select, ctx: &EvalContext) -> Result<Vec<Unit>> {
        let base_env: Scope = ctx.scopes.clone();
        let mut envs = match &select.table {
            Some(table) => self.table_envs(table, &base_env, ctx)?,
            None => vec![base_env.clone()],
        };
        if let Some(predicate) = &select.predicate {
            let mut kept = vec![];
            for env in envs {
                if self.eval_in_env(predicate, &env, ctx)?.is_truthy() {
                    kept.push(env);
                }
            }
            envs = kept;
        }
        if !select.order_by.is_empty() {
            let mut keyed = vec![];
            for env in envs {
                let mut keys = vec![];
                for o in &select.order_by {
                    keys.push(self.eval_in_env(&o.expr, &env, ctx)?);
                }
                keyed.push((keys, env));
            }
            keyed.sort_by(|(a, _), (b, _)| {
                for (i, o) in select.order_by.iter().enumerate() {
                    let ord = crate::value::compare(&a[i], &b[i]);
                    let ord = if o.descending { ord.reverse() } else { ord };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                std::cmp::Ordering::Equal
            });
            envs = keyed.into_iter().map(|(_, env)| env).collect();
        }

        if let Some(key) = &select.grouping {
            // Groups keep first-occurrence order.
            let mut groups: Vec<(Value, Vec<Scope>)> = vec![];
            for env in envs {
                let k = self.eval_in_env(key, &env, ctx)?;
                match groups.iter_mut().find(|(gk, _)| crate::value::loose_eq(gk, &k)) {
                    Some((_, members)) => members.push(env),
                    None => groups.push((k, vec![env])),
                }
            }
            return Ok(groups
                .into_iter()
                .map(|(_, members)| Unit { env: members[0].clone(), group: Some(members) })
                .collect());
        }
        if shallow_contains_aggregate(&select.projection.body()) {
            // Aggregation without GROUP BY collapses everything to one row.
            return Ok(vec![Unit { env: base_env, group: Some(envs) }]);
        }
        Ok(envs.into_iter().map(|env| Unit { env, group: None }).collect())
    }

    fn table_envs(&self, table: &Table, outer: &Scope, ctx: &EvalContext) -> Result<Vec<Scope>> {
        match table {
            Table::Base { name, alias } => {
                let t = self.db.table(name)?;
                let mut out = vec![];
                let mut it = t.streaming_iterator();
                while let Some(row) = it.next() {
                    let mut env = outer.clone();
                    env.push((alias.clone(), t.row_record(row)));
                    out.push(env);
                }
                Ok(out)
            }
            Table::Derived { select, alias } => {
                let records = self.run_flat_records(select, outer, ctx)?;
                Ok(records
                    .into_iter()
                    .map(|rec| {
                        let mut env = outer.clone();
                        env.push((alias.clone(), rec));
                        env
                    })
                    .collect())
            }
            Table::SetOp { kind, left, right, alias } => {
                let l = self.run_flat_records(left, outer, ctx)?;
                let r = self.run_flat_records(right, outer, ctx)?;
                let combined = combine_set(*kind, l, r);
                Ok(combined
                    .into_iter()
                    .map(|rec| {
                        let mut env = outer.clone();
                        env.push((alias.clone(), rec));
                        env
                    })
                    .collect())
            }
            Table::Join { kind, left, right, predicate } => {
                let left_envs = self.table_envs(left, outer, ctx)?;
                match kind {
                    JoinKind::Cross => {
                        let right_envs = self.table_envs(right, outer, ctx)?;
                        Ok(left_envs
                            .iter()
                            .cartesian_product(right_envs.iter())
                            .map(|(l, r)| merge_envs(l, r, outer.len()))
                            .collect())
                    }
                    JoinKind::Inner | JoinKind::Left => {
                        let right_envs = self.table_envs(right, outer, ctx)?;
                        let mut out = vec![];
                        for l in &left_envs {
                            let mut matched = false;
                            for r in &right_envs {
                                let env = merge_envs(l, r, outer.len());
                                let keep = match predicate {
                                    Some(p) => self.eval_in_env(p, &env, ctx)?.is_truthy(),
                                    None => true,
                                };
                                if keep {
                                    matched = true;
                                    out.push(env);
                                }
                            }
                            if !matched && matches!(kind, JoinKind::Left) {
                                out.push(null_extend(l, right));
                            }
                        }
                        Ok(out)
                    }
                    JoinKind::CrossApply | JoinKind::OuterApply => {
                        // The right side sees the current left row; it is
                        // re-evaluated per row.
                        let mut out = vec![];
                        for l in &left_envs {
                            let right_envs = self.table_envs(right, l, ctx)?;
                            if right_envs.is_empty() && matches!(kind, JoinKind::OuterApply) {
                                out.push(null_extend(l, right));
                                continue;
                            }
                            for r in right_envs {
                                out.push(r);
                            }
                        }
                        Ok(out)
                    }
                }
            }
        }
    }

    /// Runs a select and shapes each row as a record keyed by the flattened
    /// column names, the view a derived table presents to its consumers.
    fn run_flat_records(&self, select: &Select, outer: &Scope, ctx: &EvalContext) -> Result<Vec<Value>> {
        let leaves = rewrite::flatten_leaves(&select.projection.body());
        let outer_ctx = EvalContext {
            params: ctx.params,
            vars: ctx.vars.clone(),
            scopes: outer.clone(),
            group: None,
            executor: None,
            runner: Some(self),
            row: None,
        };
        let units = self.select_units(select, &outer_ctx)?;
        let mut out = vec![];
        for unit in &units {
            let mut fields = vec![];
            for (name, e) in &leaves {
                fields.push((name.clone(), self.eval_in_unit(e, unit, ctx)?));
            }
            out.push(Value::Record(fields));
        }
        self.finalize_values(select, out, ctx)
    }

    fn eval_count(&self, e: Option<&Expr>, ctx: &EvalContext) -> Result<Option<i64>> {
        match e {
            None => Ok(None),
            Some(e) => match client::eval(e, ctx)? {
                Value::Int(i) => Ok(Some(i.max(0))),
                other => Err(Error::Type(format!("expected integer row count, got {}", other))),
            },
        }
    }

    /// DISTINCT, OFFSET and LIMIT apply to the projected rows, in that
    /// order.
    fn finalize_rows(&self, select: &Select, rows: Vec<Row>, ctx: &EvalContext) -> Result<Vec<Row>> {
        let mut rows = rows;
        if select.distinct {
            let mut kept: Vec<Row> = vec![];
            for row in rows {
                if !kept.iter().any(|k| rows_equal(k, &row)) {
                    kept.push(row);
                }
            }
            rows = kept;
        }
        if let Some(offset) = self.eval_count(select.offset.as_ref(), ctx)? {
            rows = rows.into_iter().skip(offset as usize).collect();
        }
        if let Some(limit) = self.eval_count(select.limit.as_ref(), ctx)? {
            rows = rows.into_iter().take(limit as usize).collect();
        }
        Ok(rows)
    }

    fn finalize_values(&self, select: &Select, values: Vec<Value>, ctx: &EvalContext) -> Result<Vec<Value>> {
        let mut values = values;
        if select.distinct {
            let mut kept: Vec<Value> = vec![];
            for v in values {
                if !kept.iter().any(|k| crate::value::loose_eq(k, &v)) {
                    kept.push(v);
                }
            }
            values = kept;
        }
        if let Some(offset) = self.eval_count(select.offset.as_ref(), ctx)? {
            values = values.into_iter().skip(offset as usize).collect();
        }
        if let Some(limit) = self.eval_count(select.limit.as_ref(), ctx)? {
            values = values.into_iter().take(limit as usize).collect();
        }
        Ok(values)
    }
}

fn rows_equal(a: &Row, b: &Row) -> bool {
    a.items.len() == b.items.len()
        && a.items
            .iter()
            .zip(b.items.iter())
            .all(|(x, y)| crate::value::loose_eq(x, y))
}

fn merge_envs(left: &Scope, right: &Scope, outer_len: usize) -> Scope {
    let mut env = left.clone();
    env.extend(right.iter().skip(outer_len).cloned());
    env
}

/// Extends a left row with NULL bindings for every alias the missing right
/// side would have contributed.
fn null_extend(left: &Scope, right: &Table) -> Scope {
    let mut env = left.clone();
    for alias in right.aliases() {
        env.push((alias, Value::Null));
    }
    env
}

fn combine_set(kind: SetOpKind, left: Vec<Value>, right: Vec<Value>) -> Vec<Value> {
    let distinct = |values: Vec<Value>| {
        let mut out: Vec<Value> = vec![];
        for v in values {
            if !out.iter().any(|k| crate::value::loose_eq(k, &v)) {
                out.push(v);
            }
        }
        out
    };
    match kind {
        SetOpKind::UnionAll => left.into_iter().chain(right).collect(),
        SetOpKind::Union => distinct(left.into_iter().chain(right).collect()),
        SetOpKind::Except => distinct(left)
            .into_iter()
            .filter(|v| !right.iter().any(|r| crate::value::loose_eq(r, v)))
            .collect(),
        SetOpKind::Intersect => distinct(left)
            .into_iter()
            .filter(|v| right.iter().any(|r| crate::value::loose_eq(r, v)))
            .collect(),
    }
}

/// Aggregate detection that stops at subquery boundaries: an aggregate
/// inside a correlated subquery does not make the outer select aggregated.
fn shallow_contains_aggregate(e: &Expr) -> bool {
    let mut found = false;
    expr::transform(e, &mut |node| match node {
        Expr::Aggregate { .. } => {
            found = true;
            Some(node.clone())
        }
        Expr::Exists(_) | Expr::InQuery { .. } | Expr::Query(_) | Expr::Exec(_) => {
            Some(node.clone())
        }
        _ => None,
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::AggFn;
    use crate::ir::{Ordering, Projection};

    fn db() -> MemDb {
        MemDb::new()
            .with_table(
                "nums",
                vec![("a", ValueType::Int), ("b", ValueType::Int)],
                vec![
                    vec![Value::Int(1), Value::Int(10)],
                    vec![Value::Int(2), Value::Int(20)],
                    vec![Value::Int(2), Value::Int(30)],
                ],
            )
            .unwrap()
    }

    fn scan(alias: &str) -> Select {
        Select::new(
            Projection::Server(Expr::Record(vec![
                ("a".to_string(), Expr::column(alias, "a", Some(ValueType::Int))),
                ("b".to_string(), Expr::column(alias, "b", Some(ValueType::Int))),
            ])),
            Some(Table::Base { name: "nums".to_string(), alias: alias.to_string() }),
        )
    }

    fn run(db: &MemDb, select: Select) -> Vec<Value> {
        let interp = Interp { db };
        let mut ctx = EvalContext::new(&[]);
        ctx.runner = Some(&interp);
        interp.run(&select, &ctx).unwrap()
    }

    #[test]
    fn test_append_row_validates() {
        let mut t = MemTable::new("t", vec![("a", ValueType::Int)]);
        assert!(t.append_row(vec![Value::Int(1)]).is_ok());
        assert!(t.append_row(vec![Value::Null]).is_ok());
        assert!(t.append_row(vec![Value::Text("x".to_string())]).is_err());
        assert!(t.append_row(vec![Value::Int(1), Value::Int(2)]).is_err());
    }

    #[test]
    fn test_scan_filter_order() {
        let sel = scan("t0")
            .add_predicate(Expr::binary(
                crate::expr::BinaryOp::Ge,
                Expr::column("t0", "a", None),
                Expr::lit(2),
            ))
            .with_ordering(Ordering {
                expr: Expr::column("t0", "b", None),
                descending: true,
            });
        let rows = run(&db(), sel);
        let bs: Vec<i64> = rows
            .iter()
            .map(|r| *r.field("b").unwrap().as_int().unwrap())
            .collect();
        assert_eq!(bs, vec![30, 20]);
    }

    #[test]
    fn test_grouped_aggregate() {
        let sel = scan("t0")
            .with_projection(Projection::Server(Expr::Record(vec![
                ("key".to_string(), Expr::column("t0", "a", None)),
                (
                    "total".to_string(),
                    Expr::Aggregate {
                        func: AggFn::Sum,
                        operand: Some(Box::new(Expr::column("t0", "b", None))),
                    },
                ),
            ])))
            .with_grouping(Expr::column("t0", "a", None));
        let rows = run(&db(), sel);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].field("total").unwrap(), &Value::Int(10));
        assert_eq!(rows[1].field("total").unwrap(), &Value::Int(50));
    }

    #[test]
    fn test_left_join_null_extends() {
        let db = MemDb::new()
            .with_table("l", vec![("k", ValueType::Int)], vec![vec![Value::Int(1)], vec![Value::Int(2)]])
            .unwrap()
            .with_table("r", vec![("k", ValueType::Int)], vec![vec![Value::Int(1)]])
            .unwrap();
        let sel = Select::new(
            Projection::Server(Expr::Record(vec![
                ("lk".to_string(), Expr::column("a", "k", None)),
                ("rk".to_string(), Expr::column("b", "k", None)),
            ])),
            Some(Table::Join {
                kind: JoinKind::Left,
                left: Box::new(Table::Base { name: "l".to_string(), alias: "a".to_string() }),
                right: Box::new(Table::Base { name: "r".to_string(), alias: "b".to_string() }),
                predicate: Some(Expr::eq(
                    Expr::column("a", "k", None),
                    Expr::column("b", "k", None),
                )),
            }),
        );
        let rows = run(&db, sel);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].field("rk").unwrap(), &Value::Int(1));
        assert_eq!(rows[1].field("rk").unwrap(), &Value::Null);
    }

    #[test]
    fn test_correlated_exists() {
        let db = db();
        // rows of nums where another row has the same a but bigger b
        let inner = scan("t1")
            .add_predicate(Expr::and(
                Expr::eq(Expr::column("t1", "a", None), Expr::column("t0", "a", None)),
                Expr::binary(
                    crate::expr::BinaryOp::Gt,
                    Expr::column("t1", "b", None),
                    Expr::column("t0", "b", None),
                ),
            ))
            .with_projection(Projection::Server(Expr::lit(1)));
        let sel = scan("t0").add_predicate(Expr::Exists(Box::new(inner)));
        let rows = run(&db, sel);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].field("b").unwrap(), &Value::Int(20));
    }

    #[test]
    fn test_set_ops() {
        let l = vec![Value::Int(1), Value::Int(2), Value::Int(2)];
        let r = vec![Value::Int(2), Value::Int(3)];
        assert_eq!(
            combine_set(SetOpKind::Union, l.clone(), r.clone()),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );
        assert_eq!(combine_set(SetOpKind::Except, l.clone(), r.clone()), vec![Value::Int(1)]);
        assert_eq!(combine_set(SetOpKind::Intersect, l, r), vec![Value::Int(2)]);
    }
}
