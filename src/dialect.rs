//! renders finalized relational IR to command text.
//!
//! The core pipeline only depends on the `SqlDialect` trait; the bundled
//! renderer emits a generic ANSI-flavored SQL.  One strategy is required of
//! every dialect: a correlated subquery whose result is structured or
//! collection-valued is wrapped so its rows serialize into a single JSON
//! scalar column, and any default-if-empty sentinel inside it is stripped
//! first, because the wrapping format already encodes absence.

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::error::{Error, Result};
use crate::expr::{BinaryOp, Expr, UnaryOp};
use crate::ir::{JoinKind, RelationalQuery, Select, Table};
use crate::lower::OutputColumn;
use crate::rewrite;
use crate::types::ValueType;
use crate::value::Value;

pub struct RenderedCommand {
    pub text: String,
    /// Plan-parameter index for each `?` placeholder, in placeholder order.
    pub param_slots: Vec<usize>,
}

pub trait SqlDialect: Send + Sync {
    fn render(&self, select: &Select, columns: &[OutputColumn]) -> Result<RenderedCommand>;
}

lazy_static! {
    static ref BINARY_SQL: HashMap<BinaryOp, &'static str> = {
        use BinaryOp::*;
        let mut m = HashMap::new();
        m.insert(Add, "+");
        m.insert(Subtract, "-");
        m.insert(Multiply, "*");
        m.insert(Divide, "/");
        m.insert(Modulo, "%");
        m.insert(Eq, "=");
        m.insert(Ne, "<>");
        m.insert(Lt, "<");
        m.insert(Le, "<=");
        m.insert(Gt, ">");
        m.insert(Ge, ">=");
        m.insert(And, "AND");
        m.insert(Or, "OR");
        m
    };
}

#[derive(Default)]
pub struct AnsiSqlDialect;

impl AnsiSqlDialect {
    pub fn new() -> AnsiSqlDialect {
        AnsiSqlDialect
    }
}

impl SqlDialect for AnsiSqlDialect {
    fn render(&self, select: &Select, columns: &[OutputColumn]) -> Result<RenderedCommand> {
        let mut r = Renderer { slots: vec![] };
        let list = r.column_list(columns)?;
        let text = r.select_with_list(select, &list)?;
        Ok(RenderedCommand { text, param_slots: r.slots })
    }
}

struct Renderer {
    slots: Vec<usize>,
}

impl Renderer {
    fn column_list(&mut self, columns: &[OutputColumn]) -> Result<String> {
        let mut parts = vec![];
        for c in columns {
            let rendered = if c.serialized {
                self.serialized_subquery(&c.expr)?
            } else {
                self.expr(&c.expr)?
            };
            parts.push(format!("{} AS {}", rendered, quote_name(&c.name)));
        }
        Ok(parts.join(", "))
    }

    /// Renders a select around an already-rendered column list.
    fn select_with_list(&mut self, select: &Select, list: &str) -> Result<String> {
        let mut sql = String::from("SELECT ");
        if select.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(list);
        if let Some(table) = &select.table {
            sql.push_str(" FROM ");
            sql.push_str(&self.table(table)?);
        }
        if let Some(predicate) = &select.predicate {
            sql.push_str(" WHERE ");
            sql.push_str(&self.expr(predicate)?);
        }
        if let Some(grouping) = &select.grouping {
            let keys = rewrite::flatten_leaves(grouping)
                .into_iter()
                .map(|(_, e)| self.expr(&e))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(" GROUP BY ");
            sql.push_str(&keys.join(", "));
        }
        if !select.order_by.is_empty() {
            let mut parts = vec![];
            for o in &select.order_by {
                parts.push(format!(
                    "{} {}",
                    self.expr(&o.expr)?,
                    if o.descending { "DESC" } else { "ASC" }
                ));
            }
            sql.push_str(" ORDER BY ");
            sql.push_str(&parts.join(", "));
        }
        if let Some(limit) = &select.limit {
            sql.push_str(" LIMIT ");
            sql.push_str(&self.expr(limit)?);
        }
        if let Some(offset) = &select.offset {
            sql.push_str(" OFFSET ");
            sql.push_str(&self.expr(offset)?);
        }
        Ok(sql)
    }

    /// Renders a nested select, flattening its projection into a column
    /// list the way lowering does for top-level commands.
    fn select(&mut self, select: &Select) -> Result<String> {
        let leaves = rewrite::flatten_leaves(&select.projection.body());
        let mut parts = vec![];
        for (name, e) in &leaves {
            let rendered = match e {
                Expr::Query(RelationalQuery::Enumerable { .. }) => self.serialized_subquery(e)?,
                _ => self.expr(e)?,
            };
            parts.push(format!("{} AS {}", rendered, quote_name(name)));
        }
        let list = if parts.is_empty() { "NULL".to_string() } else { parts.join(", ") };
        self.select_with_list(select, &list)
    }

    fn table(&mut self, table: &Table) -> Result<String> {
        match table {
            Table::Base { name, alias } => Ok(format!("{} AS {}", name, alias)),
            Table::Derived { select, alias } => {
                Ok(format!("({}) AS {}", self.select(select)?, alias))
            }
            Table::SetOp { kind, left, right, alias } => Ok(format!(
                "({} {} {}) AS {}",
                self.select(left)?,
                kind.sql_name(),
                self.select(right)?,
                alias
            )),
            Table::Join { kind, left, right, predicate } => {
                let left_sql = self.table(left)?;
                let right_sql = self.table(right)?;
                let joined = match kind {
                    JoinKind::Inner => format!("{} INNER JOIN {}", left_sql, right_sql),
                    JoinKind::Left => format!("{} LEFT JOIN {}", left_sql, right_sql),
                    JoinKind::Cross => format!("{} CROSS JOIN {}", left_sql, right_sql),
                    JoinKind::CrossApply => format!("{} CROSS APPLY {}", left_sql, right_sql),
                    JoinKind::OuterApply => format!("{} OUTER APPLY {}", left_sql, right_sql),
                };
                match (kind, predicate) {
                    (JoinKind::Inner | JoinKind::Left, Some(p)) => {
                        Ok(format!("{} ON {}", joined, self.expr(p)?))
                    }
                    (JoinKind::Inner | JoinKind::Left, None) => Ok(format!("{} ON 1 = 1", joined)),
                    _ => Ok(joined),
                }
            }
        }
    }

    /// The required structured-subquery strategy: serialize the subquery's
    /// rows into one JSON scalar column, stripping the default-if-empty
    /// sentinel first.
    fn serialized_subquery(&mut self, e: &Expr) -> Result<String> {
        let select = match e {
            Expr::Query(RelationalQuery::Enumerable { select }) => select,
            _ => return Err(Error::NotSupported("serialized column is not a subquery")),
        };
        let stripped = select.map_exprs(&mut |node| match node {
            Expr::DefaultIfEmpty { value, .. } => Some((**value).clone()),
            _ => None,
        });
        let body = stripped.projection.body();
        let encoded = self.json_value(&body)?;
        let list = format!("json_group_array({})", encoded);
        Ok(format!("({})", self.select_with_list(&stripped, &list)?))
    }

    /// JSON encoding of a projected value, preserving the nested shape so
    /// the materializer's decode matches what an in-process executor
    /// produces natively.
    fn json_value(&mut self, body: &Expr) -> Result<String> {
        match body {
            Expr::Record(fields) => {
                let mut parts = vec![];
                for (name, v) in fields {
                    parts.push(format!("'{}', {}", escape_str(name), self.json_value(v)?));
                }
                Ok(format!("json_object({})", parts.join(", ")))
            }
            Expr::Grouping { key, elements } => Ok(format!(
                "json_object('key', {}, 'items', {})",
                self.json_value(key)?,
                self.serialized_subquery(elements)?
            )),
            Expr::Query(RelationalQuery::Enumerable { .. }) => self.serialized_subquery(body),
            Expr::DefaultIfEmpty { value, .. } => self.json_value(value),
            leaf => self.expr(leaf),
        }
    }

    fn expr(&mut self, e: &Expr) -> Result<String> {
        match e {
            Expr::Literal(v) => literal(v),
            Expr::Parameter(i) => {
                self.slots.push(*i);
                Ok("?".to_string())
            }
            Expr::Column(c) => Ok(format!("{}.{}", c.table, quote_name(&c.name))),
            Expr::Binary { op, left, right } => {
                // Composite keys compare pairwise.
                if matches!(op, BinaryOp::Eq) {
                    if let (Expr::Record(l), Expr::Record(r)) = (&**left, &**right) {
                        if l.len() != r.len() {
                            return Err(Error::Type(
                                "record comparison with mismatched shapes".to_string(),
                            ));
                        }
                        let mut parts = vec![];
                        for ((_, lv), (_, rv)) in l.iter().zip(r.iter()) {
                            parts.push(format!("{} = {}", self.expr(lv)?, self.expr(rv)?));
                        }
                        return Ok(format!("({})", parts.join(" AND ")));
                    }
                }
                let symbol = BINARY_SQL
                    .get(op)
                    .ok_or_else(|| Error::NotSupported("binary operator"))?;
                Ok(format!("({} {} {})", self.expr(left)?, symbol, self.expr(right)?))
            }
            Expr::Unary { op, operand } => match op {
                UnaryOp::Not => Ok(format!("(NOT {})", self.expr(operand)?)),
                UnaryOp::Neg => Ok(format!("(-{})", self.expr(operand)?)),
            },
            Expr::Case { test, then, otherwise } => Ok(format!(
                "CASE WHEN {} THEN {} ELSE {} END",
                self.expr(test)?,
                self.expr(then)?,
                self.expr(otherwise)?
            )),
            Expr::Cast { operand, ty } => {
                Ok(format!("CAST({} AS {})", self.expr(operand)?, type_name(*ty)?))
            }
            Expr::Coalesce { operand, fallback } => Ok(format!(
                "COALESCE({}, {})",
                self.expr(operand)?,
                self.expr(fallback)?
            )),
            Expr::Aggregate { func, operand } => match operand {
                None => Ok("COUNT(*)".to_string()),
                Some(o) => Ok(format!("{}({})", func.sql_name(), self.expr(o)?)),
            },
            Expr::Exists(select) => Ok(format!("EXISTS ({})", self.select(select)?)),
            Expr::InQuery { needle, select } => {
                Ok(format!("{} IN ({})", self.expr(needle)?, self.select(select)?))
            }
            Expr::Query(RelationalQuery::SingleValue { select }) => {
                Ok(format!("({})", self.select(select)?))
            }
            Expr::Query(RelationalQuery::Enumerable { .. }) => self.serialized_subquery(e),
            Expr::Record(_) => Err(Error::NotSupported("record outside projection")),
            _ => Err(Error::NotSupported("expression has no SQL rendering")),
        }
    }
}

fn quote_name(name: &str) -> String {
    if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        name.to_string()
    } else {
        format!("\"{}\"", name)
    }
}

fn escape_str(s: &str) -> String {
    s.replace('\'', "''")
}

fn literal(v: &Value) -> Result<String> {
    match v {
        Value::Null => Ok("NULL".to_string()),
        Value::Bool(true) => Ok("TRUE".to_string()),
        Value::Bool(false) => Ok("FALSE".to_string()),
        Value::Int(i) => Ok(i.to_string()),
        Value::Real(x) => Ok(x.to_string()),
        Value::Text(s) => Ok(format!("'{}'", escape_str(s))),
        _ => Err(Error::NotSupported("structured literal in SQL")),
    }
}

fn type_name(ty: ValueType) -> Result<&'static str> {
    match ty {
        ValueType::Int => Ok("INTEGER"),
        ValueType::Real => Ok("REAL"),
        ValueType::Text => Ok("TEXT"),
        ValueType::Bool => Ok("BOOLEAN"),
        ValueType::Null => Err(Error::NotSupported("cast to null type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Projection;

    fn scan() -> Select {
        Select::new(
            Projection::Server(Expr::Record(vec![
                ("a".to_string(), Expr::column("t0", "a", None)),
                ("b".to_string(), Expr::column("t0", "b", None)),
            ])),
            Some(Table::Base { name: "rows".to_string(), alias: "t0".to_string() }),
        )
    }

    fn render(select: &Select) -> RenderedCommand {
        let mut columns = vec![];
        let shape = crate::lower::project_shape(&select.projection, &mut columns);
        let _ = shape;
        AnsiSqlDialect::new().render(select, &columns).unwrap()
    }

    #[test]
    fn test_render_basic_select() {
        let sel = scan()
            .add_predicate(Expr::eq(Expr::column("t0", "a", None), Expr::Parameter(0)))
            .with_limit(Expr::lit(5));
        let cmd = render(&sel);
        assert_eq!(
            cmd.text,
            "SELECT t0.a AS a, t0.b AS b FROM rows AS t0 WHERE (t0.a = ?) LIMIT 5"
        );
        assert_eq!(cmd.param_slots, vec![0]);
    }

    #[test]
    fn test_render_derived_table() {
        let inner = scan().as_distinct();
        let outer = Select::new(
            Projection::Server(Expr::column("d0", "a", None)),
            Some(Table::Derived { select: Box::new(inner), alias: "d0".to_string() }),
        )
        .with_offset(Expr::lit(2));
        let cmd = render(&outer);
        assert_eq!(
            cmd.text,
            "SELECT d0.a AS a FROM (SELECT DISTINCT t0.a AS a, t0.b AS b FROM rows AS t0) AS d0 OFFSET 2"
        );
    }

    #[test]
    fn test_param_slots_follow_placeholder_order() {
        let sel = scan().add_predicate(Expr::and(
            Expr::eq(Expr::column("t0", "a", None), Expr::Parameter(1)),
            Expr::eq(Expr::column("t0", "b", None), Expr::Parameter(0)),
        ));
        let cmd = render(&sel);
        assert_eq!(cmd.param_slots, vec![1, 0]);
    }

    #[test]
    fn test_serialized_subquery_strips_sentinel() {
        let inner = Select::new(
            Projection::Server(Expr::DefaultIfEmpty {
                value: Box::new(Expr::column("t1", "a", None)),
                flag: Box::new(Expr::lit(false)),
            }),
            Some(Table::Base { name: "rows".to_string(), alias: "t1".to_string() }),
        );
        let outer = Select::new(
            Projection::Server(Expr::Record(vec![(
                "items".to_string(),
                Expr::Query(RelationalQuery::Enumerable { select: Box::new(inner) }),
            )])),
            None,
        );
        let cmd = render(&outer);
        assert!(cmd.text.contains("json_group_array"));
        assert!(!cmd.text.contains("$empty"));
    }
}
