//! This module defines the relational intermediate representation (IR).
//!
//! The surface operator chain and the IR are separate layers: the chain says
//! what the caller asked for, the IR says how it maps onto a SELECT
//! statement.  The IR is pure data; every pass that changes it builds new
//! nodes.  Composition folds operator applications into these nodes until
//! nothing translatable remains, then lowering renders them to commands.

use crate::expr::{self, BinaryOp, Expr, Lambda};

/// One SELECT statement.  The projection is never absent.
///
/// Invariant: once `distinct`, `limit` or `offset` is set, further
/// composition that would observe rows outside that window (filters, joins,
/// another limit) must first wrap this node in a derived table; see
/// [`Select::requires_pushdown`].
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub projection: Projection,
    pub table: Option<Table>,
    pub predicate: Option<Expr>,
    pub order_by: Vec<Ordering>,
    pub offset: Option<Expr>,
    pub limit: Option<Expr>,
    pub distinct: bool,
    pub grouping: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ordering {
    pub expr: Expr,
    pub descending: bool,
}

/// What a select produces per row.
///
/// `Server` is computed entirely by the database.  `Mapped` layers one
/// client-side selector over a projection the server computes.  `Composite`
/// recombines the projections of two joined sources with a client-side
/// lambda; it is only the shape the client needs to recombine, not itself
/// re-queryable.  Deferred grouping shapes are not projection variants: they
/// ride inside a `Server` body as [`RelationalQuery::Grouped`] /
/// [`RelationalQuery::GroupByResult`] markers.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Server(Expr),
    Mapped { source: Box<Projection>, map: Lambda },
    Composite { outer: Box<Projection>, inner: Box<Projection>, combine: Lambda },
}

impl Projection {
    pub fn is_server(&self) -> bool {
        matches!(self, Projection::Server(_))
    }

    /// Flattens the projection into a single expression by substituting
    /// sub-projection bodies into the client-side lambdas.  The result may
    /// contain untranslatable nodes; that is what translatability analysis
    /// then sees.
    pub fn body(&self) -> Expr {
        match self {
            Projection::Server(e) => e.clone(),
            Projection::Mapped { source, map } => expr::expand_lambda(map, &[source.body()]),
            Projection::Composite { outer, inner, combine } => {
                expr::expand_lambda(combine, &[outer.body(), inner.body()])
            }
        }
    }

    fn map_exprs(&self, f: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Projection {
        match self {
            Projection::Server(e) => Projection::Server(expr::transform(e, f)),
            Projection::Mapped { source, map } => Projection::Mapped {
                source: Box::new(source.map_exprs(f)),
                map: Lambda {
                    params: map.params.clone(),
                    body: Box::new(expr::transform(&map.body, f)),
                },
            },
            Projection::Composite { outer, inner, combine } => Projection::Composite {
                outer: Box::new(outer.map_exprs(f)),
                inner: Box::new(inner.map_exprs(f)),
                combine: Lambda {
                    params: combine.params.clone(),
                    body: Box::new(expr::transform(&combine.body, f)),
                },
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Cross,
    /// Correlated: the right side is re-evaluated per left row.
    CrossApply,
    /// Correlated with a default: left row survives when the right side is
    /// empty.
    OuterApply,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOpKind {
    Union,
    UnionAll,
    Except,
    Intersect,
}

impl SetOpKind {
    pub fn sql_name(&self) -> &'static str {
        match self {
            SetOpKind::Union => "UNION",
            SetOpKind::UnionAll => "UNION ALL",
            SetOpKind::Except => "EXCEPT",
            SetOpKind::Intersect => "INTERSECT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Table {
    /// A base table under an alias.
    Base { name: String, alias: String },
    /// A nested select under a fresh alias.
    Derived { select: Box<Select>, alias: String },
    Join { kind: JoinKind, left: Box<Table>, right: Box<Table>, predicate: Option<Expr> },
    /// Two selects combined by a set operator, presented under an alias.
    SetOp { kind: SetOpKind, left: Box<Select>, right: Box<Select>, alias: String },
}

impl Table {
    /// The aliases this table contributes to the enclosing scope, leftmost
    /// first.
    pub fn aliases(&self) -> Vec<String> {
        match self {
            Table::Base { alias, .. }
            | Table::Derived { alias, .. }
            | Table::SetOp { alias, .. } => vec![alias.clone()],
            Table::Join { left, right, .. } => {
                let mut out = left.aliases();
                out.extend(right.aliases());
                out
            }
        }
    }

    fn map_exprs(&self, f: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Table {
        match self {
            Table::Base { .. } => self.clone(),
            Table::Derived { select, alias } => Table::Derived {
                select: Box::new(select.map_exprs(f)),
                alias: alias.clone(),
            },
            Table::Join { kind, left, right, predicate } => Table::Join {
                kind: *kind,
                left: Box::new(left.map_exprs(f)),
                right: Box::new(right.map_exprs(f)),
                predicate: predicate.as_ref().map(|p| expr::transform(p, f)),
            },
            Table::SetOp { kind, left, right, alias } => Table::SetOp {
                kind: *kind,
                left: Box::new(left.map_exprs(f)),
                right: Box::new(right.map_exprs(f)),
                alias: alias.clone(),
            },
        }
    }
}

impl Select {
    pub fn new(projection: Projection, table: Option<Table>) -> Select {
        Select {
            projection,
            table,
            predicate: None,
            order_by: vec![],
            offset: None,
            limit: None,
            distinct: false,
            grouping: None,
        }
    }

    pub fn with_projection(&self, projection: Projection) -> Select {
        Select { projection, ..self.clone() }
    }

    pub fn with_table(&self, table: Table) -> Select {
        Select { table: Some(table), ..self.clone() }
    }

    /// ANDs a condition onto the predicate.
    pub fn add_predicate(&self, condition: Expr) -> Select {
        let predicate = match &self.predicate {
            Some(existing) => Expr::binary(BinaryOp::And, existing.clone(), condition),
            None => condition,
        };
        Select { predicate: Some(predicate), ..self.clone() }
    }

    /// Starts a fresh ordering (ORDER BY).
    pub fn with_ordering(&self, ordering: Ordering) -> Select {
        Select { order_by: vec![ordering], ..self.clone() }
    }

    /// Appends a subordinate ordering (THEN BY).
    pub fn add_ordering(&self, ordering: Ordering) -> Select {
        let mut order_by = self.order_by.clone();
        order_by.push(ordering);
        Select { order_by, ..self.clone() }
    }

    pub fn reversed_ordering(&self) -> Select {
        let order_by = self
            .order_by
            .iter()
            .map(|o| Ordering { expr: o.expr.clone(), descending: !o.descending })
            .collect();
        Select { order_by, ..self.clone() }
    }

    pub fn with_limit(&self, limit: Expr) -> Select {
        Select { limit: Some(limit), ..self.clone() }
    }

    pub fn with_offset(&self, offset: Expr) -> Select {
        Select { offset: Some(offset), ..self.clone() }
    }

    pub fn as_distinct(&self) -> Select {
        Select { distinct: true, ..self.clone() }
    }

    pub fn with_grouping(&self, key: Expr) -> Select {
        Select { grouping: Some(key), ..self.clone() }
    }

    /// True when this node cannot be composed into a larger statement
    /// directly: its DISTINCT, row window, active grouping or client-side
    /// projection must be preserved by wrapping it in a derived table first.
    pub fn requires_pushdown(&self) -> bool {
        self.distinct
            || self.limit.is_some()
            || self.offset.is_some()
            || self.grouping.is_some()
            || !self.projection.is_server()
    }

    /// Rewrites every expression in the statement, recursively, through a
    /// transformer.  Used by alias rebinding, parameterization and the group
    /// expansion pass.
    pub fn map_exprs(&self, f: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Select {
        Select {
            projection: self.projection.map_exprs(f),
            table: self.table.as_ref().map(|t| t.map_exprs(f)),
            predicate: self.predicate.as_ref().map(|p| expr::transform(p, f)),
            order_by: self
                .order_by
                .iter()
                .map(|o| Ordering { expr: expr::transform(&o.expr, f), descending: o.descending })
                .collect(),
            offset: self.offset.as_ref().map(|e| expr::transform(e, f)),
            limit: self.limit.as_ref().map(|e| expr::transform(e, f)),
            distinct: self.distinct,
            grouping: self.grouping.as_ref().map(|g| expr::transform(g, f)),
        }
    }
}

/// Wraps a select and presents it to the surrounding expression tree as an
/// enumerable, a single scalar, or a deferred grouping.
///
/// The grouping variants are *markers*: they stand in for a GROUP BY or
/// group-join whose final shape depends on the operator that eventually
/// consumes them.  Whatever survives to the top of the composed tree is
/// expanded into an explicit correlated subquery before lowering, so the
/// executor never sees one.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationalQuery {
    Enumerable { select: Box<Select> },
    SingleValue { select: Box<Select> },
    /// Deferred group-join: the inner select plus the outer/inner key
    /// selectors that will either become a join predicate or a correlated
    /// filter.
    Grouped { select: Box<Select>, outer_key: Box<Expr>, inner_key: Box<Expr> },
    /// Deferred GROUP BY: the grouped select with its key and element
    /// selectors, not yet committed to a SQL shape.
    GroupByResult { select: Box<Select>, key: Box<Expr>, element: Box<Expr> },
}

impl RelationalQuery {
    pub fn enumerable(select: Select) -> Expr {
        Expr::Query(RelationalQuery::Enumerable { select: Box::new(select) })
    }

    pub fn single_value(select: Select) -> Expr {
        Expr::Query(RelationalQuery::SingleValue { select: Box::new(select) })
    }

    pub fn select(&self) -> &Select {
        match self {
            RelationalQuery::Enumerable { select }
            | RelationalQuery::SingleValue { select }
            | RelationalQuery::Grouped { select, .. }
            | RelationalQuery::GroupByResult { select, .. } => select,
        }
    }

    pub fn map_exprs(&self, f: &mut dyn FnMut(&Expr) -> Option<Expr>) -> RelationalQuery {
        match self {
            RelationalQuery::Enumerable { select } => RelationalQuery::Enumerable {
                select: Box::new(select.map_exprs(f)),
            },
            RelationalQuery::SingleValue { select } => RelationalQuery::SingleValue {
                select: Box::new(select.map_exprs(f)),
            },
            RelationalQuery::Grouped { select, outer_key, inner_key } => RelationalQuery::Grouped {
                select: Box::new(select.map_exprs(f)),
                outer_key: Box::new(expr::transform(outer_key, f)),
                inner_key: Box::new(expr::transform(inner_key, f)),
            },
            RelationalQuery::GroupByResult { select, key, element } => {
                RelationalQuery::GroupByResult {
                    select: Box::new(select.map_exprs(f)),
                    key: Box::new(expr::transform(key, f)),
                    element: Box::new(expr::transform(element, f)),
                }
            }
        }
    }
}
