//! This module defines the expression tree shared by every stage of the
//! pipeline.
//!
//! One enum covers the whole lifecycle of a query expression.  The front end
//! hands us surface nodes (captures, lambda variables, operator
//! applications); composition rewrites them into relational nodes (column
//! references, aggregates, embedded queries); lowering finally replaces
//! embedded queries with executable nodes and slot references.  Keeping a
//! single tree means every pass is a rewrite from `Expr` to `Expr` and no
//! stage needs a parallel type hierarchy.

use std::sync::Arc;

use enum_as_inner::EnumAsInner;

use crate::error::Result;
use crate::ir::{RelationalQuery, Select};
use crate::lower::ExecNode;
use crate::types::ValueType;
use crate::value::Value;

/// The closed set of recognized relational operators.
///
/// Anything outside this enum never reaches the composer; anything inside it
/// either folds into the relational IR or degrades to the in-process
/// implementation registered in the client strategy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Filter,
    Map,
    FlatMap,
    Join,
    GroupJoin,
    OfType,
    GroupBy,
    DefaultIfEmpty,
    First,
    FirstOrDefault,
    Single,
    SingleOrDefault,
    Last,
    LastOrDefault,
    ElementAt,
    OrderBy,
    OrderByDesc,
    ThenBy,
    ThenByDesc,
    Reverse,
    Take,
    Skip,
    TakeWhile,
    SkipWhile,
    Distinct,
    Concat,
    Union,
    Except,
    Intersect,
    Zip,
    SequenceEqual,
    Any,
    All,
    Contains,
    Count,
    Sum,
    Average,
    Min,
    Max,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Filter => "filter",
            OpKind::Map => "map",
            OpKind::FlatMap => "flat_map",
            OpKind::Join => "join",
            OpKind::GroupJoin => "group_join",
            OpKind::OfType => "of_type",
            OpKind::GroupBy => "group_by",
            OpKind::DefaultIfEmpty => "default_if_empty",
            OpKind::First => "first",
            OpKind::FirstOrDefault => "first_or_default",
            OpKind::Single => "single",
            OpKind::SingleOrDefault => "single_or_default",
            OpKind::Last => "last",
            OpKind::LastOrDefault => "last_or_default",
            OpKind::ElementAt => "element_at",
            OpKind::OrderBy => "order_by",
            OpKind::OrderByDesc => "order_by_desc",
            OpKind::ThenBy => "then_by",
            OpKind::ThenByDesc => "then_by_desc",
            OpKind::Reverse => "reverse",
            OpKind::Take => "take",
            OpKind::Skip => "skip",
            OpKind::TakeWhile => "take_while",
            OpKind::SkipWhile => "skip_while",
            OpKind::Distinct => "distinct",
            OpKind::Concat => "concat",
            OpKind::Union => "union",
            OpKind::Except => "except",
            OpKind::Intersect => "intersect",
            OpKind::Zip => "zip",
            OpKind::SequenceEqual => "sequence_equal",
            OpKind::Any => "any",
            OpKind::All => "all",
            OpKind::Contains => "contains",
            OpKind::Count => "count",
            OpKind::Sum => "sum",
            OpKind::Average => "average",
            OpKind::Min => "min",
            OpKind::Max => "max",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        use BinaryOp::*;
        matches!(self, Eq | Ne | Lt | Le | Gt | Ge)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// SQL aggregate functions.  `operand: None` on the `Aggregate` node means
/// `COUNT(*)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFn {
    pub fn sql_name(&self) -> &'static str {
        match self {
            AggFn::Count => "COUNT",
            AggFn::Sum => "SUM",
            AggFn::Avg => "AVG",
            AggFn::Min => "MIN",
            AggFn::Max => "MAX",
        }
    }
}

/// A column reference qualified by a table alias.  The type is carried when
/// the catalog knows it; computed columns lose it.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    pub table: String,
    pub name: String,
    pub ty: Option<ValueType>,
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.table, self.name)
    }
}

/// A host function the database cannot run.  Identity (for structural
/// comparison and hashing) is the name; the closure is what the client-side
/// evaluator invokes.
#[derive(Clone)]
pub struct ClientFn {
    pub name: String,
    func: Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>,
}

impl ClientFn {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        ClientFn { name: name.into(), func: Arc::new(func) }
    }

    pub fn call(&self, args: &[Value]) -> Result<Value> {
        (self.func)(args)
    }
}

impl std::fmt::Debug for ClientFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientFn({})", self.name)
    }
}

impl PartialEq for ClientFn {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

/// A value captured from the caller's environment.  Plain values become
/// parameters during normalization; captured queries keep their shape (it is
/// part of the plan) and are spliced in by the inliner.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub name: String,
    pub value: CapturedValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CapturedValue {
    Value(Value),
    Query(Arc<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub params: Vec<String>,
    pub body: Box<Expr>,
}

impl Lambda {
    pub fn new(param: impl Into<String>, body: Expr) -> Self {
        Lambda { params: vec![param.into()], body: Box::new(body) }
    }

    pub fn new2(p0: impl Into<String>, p1: impl Into<String>, body: Expr) -> Self {
        Lambda { params: vec![p0.into(), p1.into()], body: Box::new(body) }
    }
}

/// An argument to an operator application.
#[derive(Debug, Clone, PartialEq)]
pub enum OpArg {
    Lambda(Lambda),
    Value(Expr),
    Type(ValueType),
}

#[derive(Debug, Clone, PartialEq, EnumAsInner)]
pub enum Expr {
    // ---- surface nodes, produced by the front end ----
    Literal(Value),
    Capture(Capture),
    Var(String),
    Member { base: Box<Expr>, name: String },
    ClientCall { function: ClientFn, args: Vec<Expr> },
    /// A named base collection from the catalog.
    Source { table: String },
    /// One relational operator applied to a source expression.
    Apply { op: OpKind, source: Box<Expr>, args: Vec<OpArg> },

    // ---- shared scalar nodes ----
    /// A placeholder for a captured value, introduced by the normalizer.
    Parameter(usize),
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    Unary { op: UnaryOp, operand: Box<Expr> },
    Record(Vec<(String, Expr)>),
    Case { test: Box<Expr>, then: Box<Expr>, otherwise: Box<Expr> },
    Cast { operand: Box<Expr>, ty: ValueType },
    Coalesce { operand: Box<Expr>, fallback: Box<Expr> },

    // ---- relational nodes, produced by composition ----
    Column(ColumnRef),
    Aggregate { func: AggFn, operand: Option<Box<Expr>> },
    Exists(Box<Select>),
    InQuery { needle: Box<Expr>, select: Box<Select> },
    Query(RelationalQuery),
    /// Marks a projection that must yield the element default when the
    /// sentinel flag says the joined side produced no row.
    DefaultIfEmpty { value: Box<Expr>, flag: Box<Expr> },
    /// A group shape: key plus member rows, kept after group expansion.
    Grouping { key: Box<Expr>, elements: Box<Expr> },

    // ---- lowered nodes, produced by plan compilation ----
    /// A reference to output column `i` of the enclosing command's rows.
    Slot(usize),
    /// A pre-rendered database command plus the shape its rows materialize
    /// into.
    Exec(Arc<ExecNode>),
}

impl Expr {
    pub fn lit(v: impl Into<Value>) -> Expr {
        Expr::Literal(v.into())
    }

    pub fn var(name: impl Into<String>) -> Expr {
        Expr::Var(name.into())
    }

    pub fn member(base: Expr, name: impl Into<String>) -> Expr {
        Expr::Member { base: Box::new(base), name: name.into() }
    }

    pub fn capture(name: impl Into<String>, value: Value) -> Expr {
        Expr::Capture(Capture { name: name.into(), value: CapturedValue::Value(value) })
    }

    pub fn capture_query(name: impl Into<String>, query: Expr) -> Expr {
        Expr::Capture(Capture { name: name.into(), value: CapturedValue::Query(Arc::new(query)) })
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary { op, left: Box::new(left), right: Box::new(right) }
    }

    pub fn eq(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::Eq, left, right)
    }

    pub fn and(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::And, left, right)
    }

    pub fn column(table: impl Into<String>, name: impl Into<String>, ty: Option<ValueType>) -> Expr {
        Expr::Column(ColumnRef { table: table.into(), name: name.into(), ty })
    }

    pub fn source(table: impl Into<String>) -> Expr {
        Expr::Source { table: table.into() }
    }

    pub fn apply(self, op: OpKind, args: Vec<OpArg>) -> Expr {
        Expr::Apply { op, source: Box::new(self), args }
    }

    // The chaining constructors below are conveniences for building operator
    // chains in code; a richer front end would live outside this crate.

    pub fn filter(self, predicate: Lambda) -> Expr {
        self.apply(OpKind::Filter, vec![OpArg::Lambda(predicate)])
    }

    pub fn map(self, selector: Lambda) -> Expr {
        self.apply(OpKind::Map, vec![OpArg::Lambda(selector)])
    }

    pub fn flat_map(self, collection: Lambda, result: Lambda) -> Expr {
        self.apply(OpKind::FlatMap, vec![OpArg::Lambda(collection), OpArg::Lambda(result)])
    }

    pub fn join(self, inner: Expr, outer_key: Lambda, inner_key: Lambda, result: Lambda) -> Expr {
        self.apply(
            OpKind::Join,
            vec![
                OpArg::Value(inner),
                OpArg::Lambda(outer_key),
                OpArg::Lambda(inner_key),
                OpArg::Lambda(result),
            ],
        )
    }

    pub fn group_join(self, inner: Expr, outer_key: Lambda, inner_key: Lambda, result: Lambda) -> Expr {
        self.apply(
            OpKind::GroupJoin,
            vec![
                OpArg::Value(inner),
                OpArg::Lambda(outer_key),
                OpArg::Lambda(inner_key),
                OpArg::Lambda(result),
            ],
        )
    }

    pub fn group_by(self, key: Lambda) -> Expr {
        self.apply(OpKind::GroupBy, vec![OpArg::Lambda(key)])
    }

    pub fn order_by(self, key: Lambda) -> Expr {
        self.apply(OpKind::OrderBy, vec![OpArg::Lambda(key)])
    }

    pub fn order_by_desc(self, key: Lambda) -> Expr {
        self.apply(OpKind::OrderByDesc, vec![OpArg::Lambda(key)])
    }

    pub fn then_by(self, key: Lambda) -> Expr {
        self.apply(OpKind::ThenBy, vec![OpArg::Lambda(key)])
    }

    pub fn take(self, count: Expr) -> Expr {
        self.apply(OpKind::Take, vec![OpArg::Value(count)])
    }

    pub fn skip(self, count: Expr) -> Expr {
        self.apply(OpKind::Skip, vec![OpArg::Value(count)])
    }

    pub fn distinct(self) -> Expr {
        self.apply(OpKind::Distinct, vec![])
    }

    pub fn first(self) -> Expr {
        self.apply(OpKind::First, vec![])
    }

    pub fn single(self) -> Expr {
        self.apply(OpKind::Single, vec![])
    }

    pub fn count(self) -> Expr {
        self.apply(OpKind::Count, vec![])
    }

    pub fn sum(self, selector: Lambda) -> Expr {
        self.apply(OpKind::Sum, vec![OpArg::Lambda(selector)])
    }

    pub fn any(self) -> Expr {
        self.apply(OpKind::Any, vec![])
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Value {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Value {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Text(v.to_string())
    }
}

/// Rewrites an expression bottom-up through a transformer.
///
/// The transformer sees each node before its children; returning
/// `Some(replacement)` substitutes the node wholesale (the replacement is not
/// revisited), returning `None` keeps the node and recurses into children.
/// Selects embedded in relational nodes are traversed through
/// [`Select::map_exprs`].
pub fn transform(e: &Expr, f: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Expr {
    if let Some(replacement) = f(e) {
        return replacement;
    }
    match e {
        Expr::Literal(_)
        | Expr::Var(_)
        | Expr::Parameter(_)
        | Expr::Column(_)
        | Expr::Source { .. }
        | Expr::Slot(_)
        | Expr::Exec(_)
        | Expr::Capture(_) => e.clone(),
        Expr::Member { base, name } => Expr::Member {
            base: Box::new(transform(base, f)),
            name: name.clone(),
        },
        Expr::ClientCall { function, args } => Expr::ClientCall {
            function: function.clone(),
            args: args.iter().map(|a| transform(a, f)).collect(),
        },
        Expr::Apply { op, source, args } => Expr::Apply {
            op: *op,
            source: Box::new(transform(source, f)),
            args: args
                .iter()
                .map(|a| match a {
                    OpArg::Lambda(l) => OpArg::Lambda(Lambda {
                        params: l.params.clone(),
                        body: Box::new(transform(&l.body, f)),
                    }),
                    OpArg::Value(v) => OpArg::Value(transform(v, f)),
                    OpArg::Type(t) => OpArg::Type(*t),
                })
                .collect(),
        },
        Expr::Binary { op, left, right } => Expr::Binary {
            op: *op,
            left: Box::new(transform(left, f)),
            right: Box::new(transform(right, f)),
        },
        Expr::Unary { op, operand } => Expr::Unary {
            op: *op,
            operand: Box::new(transform(operand, f)),
        },
        Expr::Record(fields) => Expr::Record(
            fields.iter().map(|(n, v)| (n.clone(), transform(v, f))).collect(),
        ),
        Expr::Case { test, then, otherwise } => Expr::Case {
            test: Box::new(transform(test, f)),
            then: Box::new(transform(then, f)),
            otherwise: Box::new(transform(otherwise, f)),
        },
        Expr::Cast { operand, ty } => Expr::Cast {
            operand: Box::new(transform(operand, f)),
            ty: *ty,
        },
        Expr::Coalesce { operand, fallback } => Expr::Coalesce {
            operand: Box::new(transform(operand, f)),
            fallback: Box::new(transform(fallback, f)),
        },
        Expr::Aggregate { func, operand } => Expr::Aggregate {
            func: *func,
            operand: operand.as_ref().map(|o| Box::new(transform(o, f))),
        },
        Expr::Exists(select) => Expr::Exists(Box::new(select.map_exprs(f))),
        Expr::InQuery { needle, select } => Expr::InQuery {
            needle: Box::new(transform(needle, f)),
            select: Box::new(select.map_exprs(f)),
        },
        Expr::Query(q) => Expr::Query(q.map_exprs(f)),
        Expr::DefaultIfEmpty { value, flag } => Expr::DefaultIfEmpty {
            value: Box::new(transform(value, f)),
            flag: Box::new(transform(flag, f)),
        },
        Expr::Grouping { key, elements } => Expr::Grouping {
            key: Box::new(transform(key, f)),
            elements: Box::new(transform(elements, f)),
        },
    }
}

/// Tests whether any node in the expression satisfies the predicate.
/// Traversal covers embedded selects.
pub fn any_node(e: &Expr, pred: &mut dyn FnMut(&Expr) -> bool) -> bool {
    let mut found = false;
    transform(e, &mut |node| {
        if found || pred(node) {
            found = true;
            // Short-circuit by replacing with a leaf; the result is discarded.
            return Some(Expr::Literal(Value::Null));
        }
        None
    });
    found
}

/// Substitutes lambda variables with replacement expressions, respecting
/// shadowing by nested lambda parameters.
pub fn substitute(body: &Expr, bindings: &[(String, Expr)]) -> Expr {
    match body {
        Expr::Var(name) => {
            for (n, replacement) in bindings {
                if n == name {
                    return replacement.clone();
                }
            }
            body.clone()
        }
        Expr::Apply { op, source, args } => Expr::Apply {
            op: *op,
            source: Box::new(substitute(source, bindings)),
            args: args
                .iter()
                .map(|a| match a {
                    OpArg::Lambda(l) => {
                        let visible: Vec<(String, Expr)> = bindings
                            .iter()
                            .filter(|(n, _)| !l.params.contains(n))
                            .cloned()
                            .collect();
                        OpArg::Lambda(Lambda {
                            params: l.params.clone(),
                            body: Box::new(substitute(&l.body, &visible)),
                        })
                    }
                    OpArg::Value(v) => OpArg::Value(substitute(v, bindings)),
                    OpArg::Type(t) => OpArg::Type(*t),
                })
                .collect(),
        },
        // Other variants never bind variables; dispatch any nested Var or
        // Apply back through `substitute` so shadowing stays honored.
        _ => transform(body, &mut |node| match node {
            Expr::Var(_) | Expr::Apply { .. } if !std::ptr::eq(node, body) => {
                Some(substitute(node, bindings))
            }
            _ => None,
        }),
    }
}

/// Applies a lambda to argument expressions by substitution.
pub fn expand_lambda(lambda: &Lambda, args: &[Expr]) -> Expr {
    let bindings: Vec<(String, Expr)> = lambda
        .params
        .iter()
        .cloned()
        .zip(args.iter().cloned())
        .collect();
    substitute(&lambda.body, &bindings)
}

/// True when the expression references the given variable name outside any
/// shadowing lambda.
pub fn uses_var(e: &Expr, name: &str) -> bool {
    match e {
        Expr::Var(n) => n == name,
        Expr::Apply { source, args, .. } => {
            if uses_var(source, name) {
                return true;
            }
            args.iter().any(|a| match a {
                OpArg::Lambda(l) => !l.params.iter().any(|p| p == name) && uses_var(&l.body, name),
                OpArg::Value(v) => uses_var(v, name),
                OpArg::Type(_) => false,
            })
        }
        _ => {
            let mut found = false;
            transform(e, &mut |node| match node {
                Expr::Var(_) | Expr::Apply { .. } if !std::ptr::eq(node, e) => {
                    if uses_var(node, name) {
                        found = true;
                    }
                    Some(node.clone())
                }
                _ => None,
            });
            found
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_replaces_free_vars() {
        // x + 1 with x := c.a
        let body = Expr::binary(BinaryOp::Add, Expr::var("x"), Expr::lit(1));
        let replacement = Expr::column("t0", "a", None);
        let out = substitute(&body, &[("x".to_string(), replacement.clone())]);
        assert_eq!(out, Expr::binary(BinaryOp::Add, replacement, Expr::lit(1)));
    }

    #[test]
    fn test_substitute_respects_shadowing() {
        // filter(s, x => x), substituting outer x must not touch the shadowed body.
        let inner = Lambda::new("x", Expr::var("x"));
        let body = Expr::var("s").filter(inner.clone());
        let out = substitute(&body, &[("x".to_string(), Expr::lit(9))]);
        match out {
            Expr::Apply { args, .. } => match &args[0] {
                OpArg::Lambda(l) => assert_eq!(*l.body, Expr::var("x")),
                _ => panic!("expected lambda arg"),
            },
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn test_uses_var() {
        let e = Expr::member(Expr::var("g"), "key");
        assert!(uses_var(&e, "g"));
        assert!(!uses_var(&e, "x"));
        let shadowed = Expr::var("s").filter(Lambda::new("g", Expr::var("g")));
        assert!(uses_var(&shadowed, "s"));
        assert!(!uses_var(&shadowed, "g"));
    }

    #[test]
    fn test_any_node_sees_nested_args() {
        let e = Expr::source("t").filter(Lambda::new(
            "x",
            Expr::eq(Expr::member(Expr::var("x"), "a"), Expr::capture("n", Value::Int(3))),
        ));
        assert!(any_node(&e, &mut |n| matches!(n, Expr::Capture(_))));
        assert!(!any_node(&e, &mut |n| matches!(n, Expr::Parameter(_))));
    }
}
