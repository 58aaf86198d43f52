//! the planner: rewrites operator applications into relational IR, deciding
//! server versus client execution per operator.
//!
//! Recursive descent: an application whose source has already become a
//! relational query node is offered to a per-operator handler.  The handler
//! expands the operator's lambdas against the source's current projection,
//! runs the post-expansion rewriters, tests translatability, and answers
//! with one of two outcomes: *translated* (folded into the select) or
//! *fallback* (re-emitted as an in-process operator over the composed
//! source, so everything earlier in the chain still runs server-side).
//! Translation never hard-fails on a supported-but-untranslatable shape.

use tracing::debug;

use crate::context::ProcessingContext;
use crate::error::Result;
use crate::expr::{self, BinaryOp, Expr, Lambda, OpArg, OpKind};
use crate::grouping;
use crate::ir::{JoinKind, Projection, RelationalQuery, Select, SetOpKind, Table};
use crate::optimize::optimize;
use crate::rewrite;
use crate::translate::{contains_aggregate, infer_type, is_scalar, is_translatable};
use crate::types::ValueType;
use crate::value::Value;
use crate::expr::AggFn;

/// The two ways an operator handler can resolve.
enum Composed {
    /// Folded into relational IR; the expression replaces the application.
    Translated(Expr),
    /// Degrades to client evaluation: the application is re-emitted over
    /// this (possibly further-translated) source with these residual
    /// arguments.
    Fallback { source: Expr, args: Vec<OpArg> },
}

pub struct Composer<'a> {
    ctx: &'a ProcessingContext,
}

impl<'a> Composer<'a> {
    pub fn new(ctx: &'a ProcessingContext) -> Composer<'a> {
        Composer { ctx }
    }

    /// Composes a whole tree, then expands any grouping markers that
    /// survived to the top so the executor never sees one.
    pub fn compose(&self, e: &Expr) -> Result<Expr> {
        let visited = self.visit(e)?;
        Ok(grouping::expand_groups(&visited, self.ctx))
    }

    fn visit(&self, e: &Expr) -> Result<Expr> {
        match e {
            Expr::Source { table } => {
                let alias = self.ctx.fresh_alias();
                let select = self.ctx.catalog.source_select(table, &alias)?;
                Ok(RelationalQuery::enumerable(select))
            }
            Expr::Apply { op, source, args } => {
                let source = process_query_source(self.visit(source)?);
                if let Expr::Query(RelationalQuery::Enumerable { select }) = &source {
                    match self.try_compose(*op, select, args)? {
                        Composed::Translated(out) => Ok(out),
                        Composed::Fallback { source, args } => {
                            debug!(op = op.name(), "operator degrades to client evaluation");
                            Ok(Expr::Apply { op: *op, source: Box::new(source), args })
                        }
                    }
                } else {
                    // Not a relational source (already client-side); compose
                    // whatever is reachable inside the arguments and leave
                    // the operator to the client.
                    Ok(Expr::Apply {
                        op: *op,
                        source: Box::new(source),
                        args: self.visit_args(args)?,
                    })
                }
            }
            _ => self.visit_children(e),
        }
    }

    fn visit_children(&self, e: &Expr) -> Result<Expr> {
        let mut err: Option<crate::error::Error> = None;
        let out = expr::transform(e, &mut |node| {
            if std::ptr::eq(node, e) {
                return None;
            }
            match self.visit(node) {
                Ok(v) => Some(v),
                Err(failure) => {
                    err = Some(failure);
                    Some(node.clone())
                }
            }
        });
        match err {
            Some(failure) => Err(failure),
            None => Ok(out),
        }
    }

    fn visit_args(&self, args: &[OpArg]) -> Result<Vec<OpArg>> {
        args.iter()
            .map(|a| {
                Ok(match a {
                    OpArg::Lambda(l) => OpArg::Lambda(Lambda {
                        params: l.params.clone(),
                        body: Box::new(self.visit(&l.body)?),
                    }),
                    OpArg::Value(v) => OpArg::Value(self.visit(v)?),
                    OpArg::Type(t) => OpArg::Type(*t),
                })
            })
            .collect()
    }

    /// Expansion followed by the post-expansion rewriters: member reduction,
    /// nested-source composition, grouping-aggregation rewriting, and a
    /// final simplification.
    fn post_expand(&self, e: &Expr) -> Result<Expr> {
        let reduced = optimize(e);
        let composed = self.visit(&reduced)?;
        let rewritten = grouping::rewrite_aggregates(&composed);
        Ok(optimize(&rewritten))
    }

    fn expand(&self, lambda: &Lambda, args: &[Expr]) -> Result<Expr> {
        self.post_expand(&expr::expand_lambda(lambda, args))
    }

    fn fallback(&self, select: &Select, args: &[OpArg]) -> Result<Composed> {
        Ok(Composed::Fallback {
            source: RelationalQuery::enumerable(select.clone()),
            args: self.visit_args(args)?,
        })
    }

    /// Wraps a select as a derived table under a fresh alias, rebinding its
    /// carried-forward projection to column references on that alias.  Only
    /// server projections survive a pushdown; `None` sends the caller to
    /// the fallback path.
    fn push_down(&self, select: &Select) -> Option<(Select, Expr)> {
        if !select.projection.is_server() {
            return None;
        }
        let narrowed = grouping::key_placeholder(select);
        let alias = self.ctx.fresh_alias();
        let body = narrowed.projection.body();
        let rebound = rewrite::rebind(&body, &alias);
        let table = Table::Derived { select: Box::new(narrowed), alias };
        Some((Select::new(Projection::Server(rebound.clone()), Some(table)), rebound))
    }

    /// Prepares a select for an added predicate or aggregate: when the node
    /// already carries DISTINCT, a row window, or an active grouping, the
    /// addition must not observe rows outside it, so the node is wrapped
    /// first.
    fn isolate(&self, select: &Select) -> Option<(Select, Expr)> {
        if select.distinct
            || select.limit.is_some()
            || select.offset.is_some()
            || select.grouping.is_some()
        {
            self.push_down(select)
        } else {
            Some((select.clone(), select.projection.body()))
        }
    }

    fn try_compose(&self, op: OpKind, select: &Select, args: &[OpArg]) -> Result<Composed> {
        match op {
            OpKind::Filter => self.compose_filter(select, args),
            OpKind::Map => self.compose_map(select, args),
            OpKind::FlatMap => self.compose_flat_map(select, args),
            OpKind::Join => self.compose_join(select, args),
            OpKind::GroupJoin => self.compose_group_join(select, args),
            OpKind::OfType => self.compose_of_type(select, args),
            OpKind::GroupBy => self.compose_group_by(select, args),
            OpKind::DefaultIfEmpty => self.compose_default_if_empty(select, args),
            OpKind::First | OpKind::FirstOrDefault => self.compose_limit_probe(select, args, 1),
            OpKind::Single | OpKind::SingleOrDefault => self.compose_limit_probe(select, args, 2),
            OpKind::OrderBy | OpKind::OrderByDesc | OpKind::ThenBy | OpKind::ThenByDesc => {
                self.compose_order_by(op, select, args)
            }
            OpKind::Reverse => self.compose_reverse(select, args),
            OpKind::Take => self.compose_take(select, args),
            OpKind::Skip => self.compose_skip(select, args),
            OpKind::Distinct => self.compose_distinct(select, args),
            OpKind::Concat | OpKind::Union | OpKind::Except | OpKind::Intersect => {
                self.compose_set_op(op, select, args)
            }
            OpKind::Any => self.compose_any(select, args),
            OpKind::All => self.compose_all(select, args),
            OpKind::Contains => self.compose_contains(select, args),
            OpKind::Count => self.compose_count(select, args),
            OpKind::Sum | OpKind::Average | OpKind::Min | OpKind::Max => {
                self.compose_aggregate(op, select, args)
            }
            // No translation strategy exists for these; they always run on
            // the client.
            OpKind::Last
            | OpKind::LastOrDefault
            | OpKind::ElementAt
            | OpKind::TakeWhile
            | OpKind::SkipWhile
            | OpKind::Zip
            | OpKind::SequenceEqual => self.fallback(select, args),
        }
    }

    fn compose_filter(&self, select: &Select, args: &[OpArg]) -> Result<Composed> {
        let predicate = match lambda_arg(args, 0) {
            Some(l) if l.params.len() == 1 => l,
            _ => return self.fallback(select, args),
        };
        let (sel, body) = match self.isolate(select) {
            Some(pair) => pair,
            None => return self.fallback(select, args),
        };
        let expanded = self.expand(predicate, &[body])?;
        if is_translatable(&expanded) {
            return Ok(Composed::Translated(RelationalQuery::enumerable(
                sel.add_predicate(expanded),
            )));
        }
        // AND-split: a conjunction where only one side translates pushes
        // that side into the select and keeps the other as a client filter.
        if let (
            Expr::Binary { op: BinaryOp::And, left, right },
            Expr::Binary { op: BinaryOp::And, left: raw_left, right: raw_right },
        ) = (&expanded, &*predicate.body)
        {
            if is_translatable(left) {
                debug!("AND-split: left side of predicate pushed to server");
                return Ok(Composed::Fallback {
                    source: RelationalQuery::enumerable(sel.add_predicate((**left).clone())),
                    args: vec![OpArg::Lambda(Lambda {
                        params: predicate.params.clone(),
                        body: Box::new(self.visit(raw_right)?),
                    })],
                });
            }
            if is_translatable(right) {
                debug!("AND-split: right side of predicate pushed to server");
                return Ok(Composed::Fallback {
                    source: RelationalQuery::enumerable(sel.add_predicate((**right).clone())),
                    args: vec![OpArg::Lambda(Lambda {
                        params: predicate.params.clone(),
                        body: Box::new(self.visit(raw_left)?),
                    })],
                });
            }
        }
        self.fallback(&sel, args)
    }

    fn compose_map(&self, select: &Select, args: &[OpArg]) -> Result<Composed> {
        let selector = match lambda_arg(args, 0) {
            Some(l) if l.params.len() == 1 => l,
            _ => return self.fallback(select, args),
        };
        let expanded = self.expand(selector, &[select.projection.body()])?;
        if is_translatable(&expanded) {
            return Ok(Composed::Translated(RelationalQuery::enumerable(
                select.with_projection(Projection::Server(expanded)),
            )));
        }
        // The server part keeps flowing; the selector layers on client-side.
        Ok(Composed::Translated(RelationalQuery::enumerable(
            select.with_projection(Projection::Mapped {
                source: Box::new(select.projection.clone()),
                map: selector.clone(),
            }),
        )))
    }

    fn compose_flat_map(&self, select: &Select, args: &[OpArg]) -> Result<Composed> {
        let collection = match lambda_arg(args, 0) {
            Some(l) if l.params.len() == 1 => l,
            _ => return self.fallback(select, args),
        };
        let result = match lambda_arg(args, 1) {
            Some(l) if l.params.len() == 2 => l,
            _ => return self.fallback(select, args),
        };

        let mut outer_sel = select.clone();
        let mut outer_proj = outer_sel.projection.body();
        if outer_sel.requires_pushdown() {
            match self.push_down(&outer_sel) {
                Some((sel, proj)) => {
                    outer_sel = sel;
                    outer_proj = proj;
                }
                None => return self.fallback(select, args),
            }
        }
        let outer_table = match &outer_sel.table {
            Some(t) => t.clone(),
            None => return self.fallback(select, args),
        };

        let mut handle_as_correlated = expr::uses_var(&collection.body, &collection.params[0]);
        let mut handle_as_join = false;
        let mut grouped_keys: Option<(Expr, Expr)> = None;
        let mut default_if_empty = false;

        let mut inner_source = optimize(&expr::expand_lambda(collection, &[outer_proj.clone()]));
        inner_source = match inner_source {
            Expr::Apply { op: OpKind::DefaultIfEmpty, source, args: inner_args }
                if inner_args.is_empty() =>
            {
                default_if_empty = true;
                *source
            }
            other => other,
        };
        inner_source = match inner_source {
            Expr::Query(RelationalQuery::Grouped { select, outer_key, inner_key }) => {
                // A group-join marker consumed by a flat-map resolves to a
                // real join; default-if-empty decides left versus inner.
                handle_as_correlated = false;
                handle_as_join = true;
                grouped_keys = Some((*outer_key, *inner_key));
                RelationalQuery::enumerable(*select)
            }
            other => other,
        };
        let inner_source = self.post_expand(&process_query_source(inner_source))?;

        let inner_query = match inner_source {
            Expr::Query(RelationalQuery::Enumerable { select }) => *select,
            _ => return self.fallback(select, args),
        };
        let (mut inner_sel, renames) = rewrite::uniquify(&inner_query, self.ctx);
        if let Some((outer_key, inner_key)) = grouped_keys.take() {
            grouped_keys = Some((outer_key, rewrite::apply_renames_expr(&inner_key, &renames)));
        }
        let mut inner_proj = inner_sel.projection.body();

        let inner_needs_pushdown =
            right_requires_pushdown(&inner_sel) || handle_as_correlated || default_if_empty;
        if inner_needs_pushdown {
            if !inner_sel.projection.is_server() {
                return self.fallback(select, args);
            }
            if default_if_empty {
                inner_sel = inner_sel.with_projection(Projection::Server(Expr::DefaultIfEmpty {
                    value: Box::new(inner_proj.clone()),
                    flag: Box::new(Expr::lit(false)),
                }));
            }
            let narrowed = grouping::key_placeholder(&inner_sel);
            let alias = self.ctx.fresh_alias();
            let narrowed_body = narrowed.projection.body();
            // A join key built against the pre-pushdown projection now has
            // to read from the derived table's columns instead.
            if let Some((outer_key, inner_key)) = grouped_keys.take() {
                grouped_keys =
                    Some((outer_key, remap_through_pushdown(&inner_key, &narrowed_body, &alias)));
            }
            inner_proj = rewrite::rebind(&narrowed_body, &alias);
            inner_sel = Select::new(
                Projection::Server(inner_proj.clone()),
                Some(Table::Derived { select: Box::new(narrowed), alias }),
            );
        }
        let inner_table = match &inner_sel.table {
            Some(t) => t.clone(),
            None => return self.fallback(select, args),
        };
        let join_predicate =
            grouped_keys.map(|(outer_key, inner_key)| Expr::eq(outer_key, inner_key));

        let selector = self.post_expand(&expr::expand_lambda(
            result,
            &[outer_proj.clone(), inner_proj.clone()],
        ))?;
        let projection = if is_translatable(&selector) {
            Projection::Server(selector)
        } else {
            Projection::Composite {
                outer: Box::new(outer_sel.projection.clone()),
                inner: Box::new(inner_sel.projection.clone()),
                combine: result.clone(),
            }
        };

        let kind = if handle_as_join {
            if default_if_empty { JoinKind::Left } else { JoinKind::Inner }
        } else if handle_as_correlated {
            if default_if_empty { JoinKind::OuterApply } else { JoinKind::CrossApply }
        } else {
            JoinKind::Cross
        };
        let table = Table::Join {
            kind,
            left: Box::new(outer_table),
            right: Box::new(inner_table),
            predicate: join_predicate,
        };
        Ok(Composed::Translated(RelationalQuery::enumerable(
            outer_sel.with_projection(projection).with_table(table),
        )))
    }

    fn compose_join(&self, select: &Select, args: &[OpArg]) -> Result<Composed> {
        let inner_expr = match value_arg(args, 0) {
            Some(v) => v,
            None => return self.fallback(select, args),
        };
        let (outer_key_l, inner_key_l, result) =
            match (lambda_arg(args, 1), lambda_arg(args, 2), lambda_arg(args, 3)) {
                (Some(a), Some(b), Some(c)) if c.params.len() == 2 => (a, b, c),
                _ => return self.fallback(select, args),
            };
        let inner_source = process_query_source(self.visit(inner_expr)?);
        let inner_query = match inner_source {
            Expr::Query(RelationalQuery::Enumerable { select }) => *select,
            _ => return self.fallback(select, args),
        };

        let mut outer_sel = select.clone();
        let mut outer_proj = outer_sel.projection.body();
        if outer_sel.requires_pushdown() {
            match self.push_down(&outer_sel) {
                Some((sel, proj)) => {
                    outer_sel = sel;
                    outer_proj = proj;
                }
                None => return self.fallback(select, args),
            }
        }
        let outer_key = self.expand(outer_key_l, &[outer_proj.clone()])?;
        if !is_translatable(&outer_key) {
            return self.fallback(select, args);
        }

        let mut inner_sel = inner_query;
        let mut inner_proj = inner_sel.projection.body();
        if right_requires_pushdown(&inner_sel) {
            match self.push_down(&inner_sel) {
                Some((sel, proj)) => {
                    inner_sel = sel;
                    inner_proj = proj;
                }
                None => return self.fallback(select, args),
            }
        }
        let inner_key = self.expand(inner_key_l, &[inner_proj.clone()])?;
        if !is_translatable(&inner_key) {
            return self.fallback(select, args);
        }

        let (outer_table, inner_table) = match (&outer_sel.table, &inner_sel.table) {
            (Some(o), Some(i)) => (o.clone(), i.clone()),
            _ => return self.fallback(select, args),
        };

        let selector =
            self.post_expand(&expr::expand_lambda(result, &[outer_proj, inner_proj.clone()]))?;
        let projection = if is_translatable(&selector) {
            Projection::Server(selector)
        } else {
            Projection::Composite {
                outer: Box::new(outer_sel.projection.clone()),
                inner: Box::new(Projection::Server(inner_proj)),
                combine: result.clone(),
            }
        };
        let table = Table::Join {
            kind: JoinKind::Inner,
            left: Box::new(outer_table),
            right: Box::new(inner_table),
            predicate: Some(Expr::eq(outer_key, inner_key)),
        };
        Ok(Composed::Translated(RelationalQuery::enumerable(
            outer_sel.with_projection(projection).with_table(table),
        )))
    }

    fn compose_group_join(&self, select: &Select, args: &[OpArg]) -> Result<Composed> {
        let inner_expr = match value_arg(args, 0) {
            Some(v) => v,
            None => return self.fallback(select, args),
        };
        let (outer_key_l, inner_key_l, result) =
            match (lambda_arg(args, 1), lambda_arg(args, 2), lambda_arg(args, 3)) {
                (Some(a), Some(b), Some(c)) if c.params.len() == 2 => (a, b, c),
                _ => return self.fallback(select, args),
            };
        let inner_source = process_query_source(self.visit(inner_expr)?);
        let inner_query = match inner_source {
            Expr::Query(RelationalQuery::Enumerable { select }) => select,
            _ => return self.fallback(select, args),
        };

        let outer_proj = select.projection.body();
        let outer_key = self.expand(outer_key_l, &[outer_proj.clone()])?;
        if !is_translatable(&outer_key) {
            return self.fallback(select, args);
        }
        let inner_proj = inner_query.projection.body();
        let inner_key = self.expand(inner_key_l, &[inner_proj])?;
        if !is_translatable(&inner_key) {
            return self.fallback(select, args);
        }

        // The join shape is deferred: the marker records everything the
        // eventual consumer needs to pick one.
        let marker = Expr::Query(RelationalQuery::Grouped {
            select: inner_query,
            outer_key: Box::new(outer_key),
            inner_key: Box::new(inner_key),
        });
        let selector = self.post_expand(&expr::expand_lambda(result, &[outer_proj, marker.clone()]))?;
        let projection = if is_translatable(&selector) {
            Projection::Server(selector)
        } else {
            Projection::Composite {
                outer: Box::new(select.projection.clone()),
                inner: Box::new(Projection::Server(marker)),
                combine: result.clone(),
            }
        };
        Ok(Composed::Translated(RelationalQuery::enumerable(
            select.with_projection(projection),
        )))
    }

    fn compose_of_type(&self, select: &Select, args: &[OpArg]) -> Result<Composed> {
        let target = match args.first() {
            Some(OpArg::Type(t)) => *t,
            _ => return self.fallback(select, args),
        };
        if infer_type(&select.projection.body()) == Some(target) {
            return Ok(Composed::Translated(RelationalQuery::enumerable(select.clone())));
        }
        self.fallback(select, args)
    }

    fn compose_group_by(&self, select: &Select, args: &[OpArg]) -> Result<Composed> {
        let key_l = match lambda_arg(args, 0) {
            Some(l) if l.params.len() == 1 => l,
            _ => return self.fallback(select, args),
        };
        // Optional element selector (one parameter) and result selector (two
        // parameters: key, group) are told apart by arity.
        let mut element_l: Option<&Lambda> = None;
        let mut result_l: Option<&Lambda> = None;
        for arg in &args[1..] {
            match arg {
                OpArg::Lambda(l) if l.params.len() == 1 && element_l.is_none() => {
                    element_l = Some(l)
                }
                OpArg::Lambda(l) if l.params.len() == 2 && result_l.is_none() => result_l = Some(l),
                _ => return self.fallback(select, args),
            }
        }

        let proj = select.projection.body();
        let key = self.expand(key_l, &[proj.clone()])?;
        if !is_translatable(&key) {
            return self.fallback(select, args);
        }
        let element = match element_l {
            Some(l) => self.expand(l, &[proj.clone()])?,
            None => proj,
        };
        if !is_translatable(&element) {
            return self.fallback(select, args);
        }

        let marker = Expr::Query(RelationalQuery::GroupByResult {
            select: Box::new(select.clone()),
            key: Box::new(key.clone()),
            element: Box::new(element),
        });
        let result_selector = match result_l {
            Some(l) => self.post_expand(&expr::expand_lambda(l, &[key.clone(), marker.clone()]))?,
            None => marker,
        };
        if is_translatable(&result_selector) {
            return Ok(Composed::Translated(RelationalQuery::enumerable(
                select
                    .with_projection(Projection::Server(result_selector))
                    .with_grouping(key),
            )));
        }
        self.fallback(select, args)
    }

    fn compose_default_if_empty(&self, select: &Select, args: &[OpArg]) -> Result<Composed> {
        if !args.is_empty() || !select.projection.is_server() {
            // The explicit-default-value overload stays on the client.
            return self.fallback(select, args);
        }
        let body = select.projection.body();

        // A single-row anchor left-joined to the source; the sentinel column
        // tells materialization when to substitute the default.
        let anchor_alias = self.ctx.fresh_alias();
        let anchor = Table::Derived {
            select: Box::new(Select::new(
                Projection::Server(Expr::Record(vec![(
                    "empty".to_string(),
                    Expr::Literal(Value::Null),
                )])),
                None,
            )),
            alias: anchor_alias,
        };
        let flagged = Expr::DefaultIfEmpty {
            value: Box::new(body),
            flag: Box::new(Expr::lit(false)),
        };
        let inner_alias = self.ctx.fresh_alias();
        let inner = Table::Derived {
            select: Box::new(select.with_projection(Projection::Server(flagged.clone()))),
            alias: inner_alias.clone(),
        };
        let rebound = rewrite::rebind(&flagged, &inner_alias);
        let join = Table::Join {
            kind: JoinKind::Left,
            left: Box::new(anchor),
            right: Box::new(inner),
            predicate: Some(Expr::eq(Expr::lit(1), Expr::lit(1))),
        };
        Ok(Composed::Translated(RelationalQuery::enumerable(Select::new(
            Projection::Server(rebound),
            Some(join),
        ))))
    }

    /// First/Single family: fold the predicate, bound the result with a
    /// limit probe (1 is enough for first; 2 detects "more than one" without
    /// counting the whole set), and leave the cardinality-enforcing reducer
    /// on the client.
    fn compose_limit_probe(&self, select: &Select, args: &[OpArg], probe: i64) -> Result<Composed> {
        let mut sel = select.clone();
        if sel.limit.is_some() || sel.offset.is_some() {
            // Re-limiting inside an existing window would widen it.
            match self.push_down(&sel) {
                Some((wrapped, _)) => sel = wrapped,
                None => return self.fallback(select, args),
            }
        }
        match args.first() {
            None => {}
            Some(OpArg::Lambda(predicate)) if predicate.params.len() == 1 => {
                let expanded = self.expand(predicate, &[sel.projection.body()])?;
                if !is_translatable(&expanded) {
                    return self.fallback(select, args);
                }
                sel = sel.add_predicate(expanded);
            }
            Some(_) => return self.fallback(select, args),
        }
        Ok(Composed::Fallback {
            source: RelationalQuery::enumerable(sel.with_limit(Expr::lit(probe))),
            args: vec![],
        })
    }

    fn compose_order_by(&self, op: OpKind, select: &Select, args: &[OpArg]) -> Result<Composed> {
        let key_l = match lambda_arg(args, 0) {
            Some(l) if l.params.len() == 1 => l,
            _ => return self.fallback(select, args),
        };
        let mut sel = select.clone();
        if sel.limit.is_some() || sel.offset.is_some() || sel.grouping.is_some() {
            // Sorting must not reorder rows outside an established window,
            // and a grouped select's rows are groups, not source rows.
            match self.push_down(&sel) {
                Some((wrapped, _)) => sel = wrapped,
                None => return self.fallback(select, args),
            }
        }
        let key = self.expand(key_l, &[sel.projection.body()])?;
        if !is_translatable(&key) || !is_scalar(&key) {
            return self.fallback(select, args);
        }
        let descending = matches!(op, OpKind::OrderByDesc | OpKind::ThenByDesc);
        let ordering = crate::ir::Ordering { expr: key, descending };
        let sel = match op {
            OpKind::ThenBy | OpKind::ThenByDesc => sel.add_ordering(ordering),
            _ => sel.with_ordering(ordering),
        };
        Ok(Composed::Translated(RelationalQuery::enumerable(sel)))
    }

    fn compose_reverse(&self, select: &Select, args: &[OpArg]) -> Result<Composed> {
        if select.order_by.is_empty() || select.limit.is_some() || select.offset.is_some() {
            // Without a server ordering there is nothing deterministic to
            // reverse.
            return self.fallback(select, args);
        }
        Ok(Composed::Translated(RelationalQuery::enumerable(
            select.reversed_ordering(),
        )))
    }

    fn compose_take(&self, select: &Select, args: &[OpArg]) -> Result<Composed> {
        let count = match value_arg(args, 0) {
            Some(v) => self.visit(v)?,
            None => return self.fallback(select, args),
        };
        let mut sel = select.clone();
        if sel.distinct || sel.limit.is_some() {
            match self.push_down(&sel) {
                Some((wrapped, _)) => sel = wrapped,
                None => return self.fallback(select, args),
            }
        }
        if matches!(count, Expr::Literal(_) | Expr::Parameter(_)) {
            return Ok(Composed::Translated(RelationalQuery::enumerable(
                sel.with_limit(count),
            )));
        }
        self.fallback(select, args)
    }

    fn compose_skip(&self, select: &Select, args: &[OpArg]) -> Result<Composed> {
        let count = match value_arg(args, 0) {
            Some(v) => self.visit(v)?,
            None => return self.fallback(select, args),
        };
        let mut sel = select.clone();
        if sel.distinct || sel.offset.is_some() || sel.limit.is_some() {
            match self.push_down(&sel) {
                Some((wrapped, _)) => sel = wrapped,
                None => return self.fallback(select, args),
            }
        }
        if matches!(count, Expr::Literal(_) | Expr::Parameter(_)) {
            return Ok(Composed::Translated(RelationalQuery::enumerable(
                sel.with_offset(count),
            )));
        }
        self.fallback(select, args)
    }

    fn compose_distinct(&self, select: &Select, args: &[OpArg]) -> Result<Composed> {
        if !args.is_empty() {
            return self.fallback(select, args);
        }
        let mut sel = select.clone();
        if sel.limit.is_some() || sel.offset.is_some() {
            match self.push_down(&sel) {
                Some((wrapped, _)) => sel = wrapped,
                None => return self.fallback(select, args),
            }
        }
        Ok(Composed::Translated(RelationalQuery::enumerable(sel.as_distinct())))
    }

    fn compose_set_op(&self, op: OpKind, select: &Select, args: &[OpArg]) -> Result<Composed> {
        let inner_expr = match value_arg(args, 0) {
            Some(v) => v,
            None => return self.fallback(select, args),
        };
        let inner_source = process_query_source(self.visit(inner_expr)?);
        let inner_query = match inner_source {
            Expr::Query(RelationalQuery::Enumerable { select }) => select,
            _ => return self.fallback(select, args),
        };
        if !select.projection.is_server() || !inner_query.projection.is_server() {
            return self.fallback(select, args);
        }
        let kind = match op {
            OpKind::Concat => SetOpKind::UnionAll,
            OpKind::Union => SetOpKind::Union,
            OpKind::Except => SetOpKind::Except,
            OpKind::Intersect => SetOpKind::Intersect,
            _ => unreachable!("not a set operator: {:?}", op),
        };
        let alias = self.ctx.fresh_alias();
        let rebound = rewrite::rebind(&select.projection.body(), &alias);
        let table = Table::SetOp {
            kind,
            left: Box::new(select.clone()),
            right: inner_query,
            alias,
        };
        Ok(Composed::Translated(RelationalQuery::enumerable(Select::new(
            Projection::Server(rebound),
            Some(table),
        ))))
    }

    fn compose_any(&self, select: &Select, args: &[OpArg]) -> Result<Composed> {
        let (mut sel, body) = match self.isolate(select) {
            Some(pair) => pair,
            None => return self.fallback(select, args),
        };
        match args.first() {
            None => {}
            Some(OpArg::Lambda(predicate)) if predicate.params.len() == 1 => {
                let expanded = self.expand(predicate, &[body])?;
                if !is_translatable(&expanded) {
                    return self.fallback(select, args);
                }
                sel = sel.add_predicate(expanded);
            }
            Some(_) => return self.fallback(select, args),
        }
        if !sel.projection.is_server() {
            return self.fallback(select, args);
        }
        let probe = sel.with_projection(Projection::Server(Expr::lit(1)));
        let body = Expr::Case {
            test: Box::new(Expr::Exists(Box::new(probe))),
            then: Box::new(Expr::lit(true)),
            otherwise: Box::new(Expr::lit(false)),
        };
        Ok(Composed::Translated(RelationalQuery::single_value(Select::new(
            Projection::Server(body),
            None,
        ))))
    }

    /// SQL has no universal quantifier; ALL compares the total row count
    /// with a conditional-sum count of rows satisfying the predicate.
    fn compose_all(&self, select: &Select, args: &[OpArg]) -> Result<Composed> {
        let predicate = match lambda_arg(args, 0) {
            Some(l) if l.params.len() == 1 => l,
            _ => return self.fallback(select, args),
        };
        let (sel, body) = match self.isolate(select) {
            Some(pair) => pair,
            None => return self.fallback(select, args),
        };
        let expanded = self.expand(predicate, &[body])?;
        if !is_translatable(&expanded) {
            return self.fallback(select, args);
        }
        let matching = Expr::Coalesce {
            operand: Box::new(Expr::Aggregate {
                func: AggFn::Sum,
                operand: Some(Box::new(Expr::Case {
                    test: Box::new(expanded),
                    then: Box::new(Expr::lit(1)),
                    otherwise: Box::new(Expr::lit(0)),
                })),
            }),
            fallback: Box::new(Expr::lit(0)),
        };
        let comparison = Expr::Case {
            test: Box::new(Expr::eq(
                Expr::Aggregate { func: AggFn::Count, operand: None },
                matching,
            )),
            then: Box::new(Expr::lit(true)),
            otherwise: Box::new(Expr::lit(false)),
        };
        Ok(Composed::Translated(RelationalQuery::single_value(
            sel.with_projection(Projection::Server(comparison)),
        )))
    }

    fn compose_contains(&self, select: &Select, args: &[OpArg]) -> Result<Composed> {
        let needle = match value_arg(args, 0) {
            Some(v) => self.visit(v)?,
            None => return self.fallback(select, args),
        };
        if !select.projection.is_server() || !is_translatable(&needle) || !is_scalar(&needle) {
            return self.fallback(select, args);
        }
        let body = Expr::Case {
            test: Box::new(Expr::InQuery {
                needle: Box::new(needle),
                select: Box::new(select.clone()),
            }),
            then: Box::new(Expr::lit(true)),
            otherwise: Box::new(Expr::lit(false)),
        };
        Ok(Composed::Translated(RelationalQuery::single_value(Select::new(
            Projection::Server(body),
            None,
        ))))
    }

    fn compose_count(&self, select: &Select, args: &[OpArg]) -> Result<Composed> {
        let (mut sel, body) = match self.isolate(select) {
            Some(pair) => pair,
            None => return self.fallback(select, args),
        };
        match args.first() {
            None => {}
            Some(OpArg::Lambda(predicate)) if predicate.params.len() == 1 => {
                let expanded = self.expand(predicate, &[body])?;
                if !is_translatable(&expanded) {
                    return self.fallback(select, args);
                }
                sel = sel.add_predicate(expanded);
            }
            Some(_) => return self.fallback(select, args),
        }
        Ok(Composed::Translated(RelationalQuery::single_value(
            sel.with_projection(Projection::Server(Expr::Aggregate {
                func: AggFn::Count,
                operand: None,
            })),
        )))
    }

    fn compose_aggregate(&self, op: OpKind, select: &Select, args: &[OpArg]) -> Result<Composed> {
        let func = match op {
            OpKind::Sum => AggFn::Sum,
            OpKind::Average => AggFn::Avg,
            OpKind::Min => AggFn::Min,
            OpKind::Max => AggFn::Max,
            _ => unreachable!("not an aggregate: {:?}", op),
        };
        let (sel, body) = match self.isolate(select) {
            Some(pair) => pair,
            None => return self.fallback(select, args),
        };
        let operand = match args.first() {
            None => body,
            Some(OpArg::Lambda(selector)) if selector.params.len() == 1 => {
                let expanded = self.expand(selector, &[body])?;
                if !is_translatable(&expanded) {
                    return self.fallback(select, args);
                }
                expanded
            }
            Some(_) => return self.fallback(select, args),
        };
        if !is_translatable(&operand) || contains_aggregate(&operand) {
            // SQL forbids an aggregate over another aggregate's result.
            return self.fallback(select, args);
        }
        let operand = if func == AggFn::Avg {
            Expr::Cast { operand: Box::new(operand), ty: ValueType::Real }
        } else {
            operand
        };
        Ok(Composed::Translated(RelationalQuery::single_value(
            sel.with_projection(Projection::Server(Expr::Aggregate {
                func,
                operand: Some(Box::new(operand)),
            })),
        )))
    }
}

/// A deferred group used directly as a query source flattens into an
/// enumerable by predicating the inner select on key equality.
fn process_query_source(e: Expr) -> Expr {
    match e {
        Expr::Query(RelationalQuery::Grouped { select, outer_key, inner_key }) => {
            RelationalQuery::enumerable(select.add_predicate(Expr::eq(*outer_key, *inner_key)))
        }
        other => other,
    }
}

/// The right side of a join cannot carry its own WHERE, ordering, window or
/// grouping; such a select must be wrapped before joining.
fn right_requires_pushdown(select: &Select) -> bool {
    select.requires_pushdown() || select.predicate.is_some() || !select.order_by.is_empty()
}

/// Rewrites an expression built against a projection body so it reads from
/// the derived table now computing that body: any subtree equal to one of
/// the body's leaves becomes the matching derived-table column.
fn remap_through_pushdown(e: &Expr, body: &Expr, alias: &str) -> Expr {
    // Columns match on alias and name; the type annotation is advisory and
    // may have been dropped on one side.
    fn leaves_match(a: &Expr, b: &Expr) -> bool {
        match (a, b) {
            (Expr::Column(x), Expr::Column(y)) => x.table == y.table && x.name == y.name,
            _ => a == b,
        }
    }
    let leaves = rewrite::flatten_leaves(body);
    expr::transform(e, &mut |node| {
        if matches!(node, Expr::Literal(_)) {
            return None;
        }
        leaves
            .iter()
            .find(|(_, leaf)| leaves_match(leaf, node))
            .map(|(name, leaf)| Expr::column(alias, name.clone(), infer_type(leaf)))
    })
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::ClientFn;
    use crate::metadata::{Catalog, TableShape};
    use std::sync::Arc;

    fn catalog() -> Arc<Catalog> {
        Arc::new(
            Catalog::new()
                .with_table(TableShape::new(
                    "rows",
                    vec![("a", ValueType::Int), ("b", ValueType::Int), ("c", ValueType::Text)],
                ))
                .with_table(TableShape::new(
                    "others",
                    vec![("a", ValueType::Int), ("d", ValueType::Text)],
                )),
        )
    }

    fn compose_query(e: &Expr) -> Expr {
        let ctx = ProcessingContext::new(catalog());
        Composer::new(&ctx).compose(e).unwrap()
    }

    fn client_true() -> ClientFn {
        ClientFn::new("client_true", |_| Ok(Value::Bool(true)))
    }

    #[test]
    fn test_translatable_filter_folds_into_predicate() {
        let q = Expr::source("rows").filter(Lambda::new(
            "x",
            Expr::eq(Expr::member(Expr::var("x"), "a"), Expr::lit(1)),
        ));
        match compose_query(&q) {
            Expr::Query(RelationalQuery::Enumerable { select }) => {
                assert!(select.predicate.is_some());
                assert!(select.projection.is_server());
            }
            other => panic!("expected enumerable query, got {:?}", other),
        }
    }

    #[test]
    fn test_and_split_pushes_translatable_side() {
        let q = Expr::source("rows").filter(Lambda::new(
            "x",
            Expr::and(
                Expr::eq(Expr::member(Expr::var("x"), "a"), Expr::lit(1)),
                Expr::ClientCall { function: client_true(), args: vec![Expr::var("x")] },
            ),
        ));
        match compose_query(&q) {
            Expr::Apply { op: OpKind::Filter, source, args } => {
                // Server side got the translatable conjunct.
                match &*source {
                    Expr::Query(RelationalQuery::Enumerable { select }) => {
                        let pred = select.predicate.as_ref().expect("server predicate");
                        assert!(matches!(pred, Expr::Binary { op: BinaryOp::Eq, .. }));
                    }
                    other => panic!("expected query source, got {:?}", other),
                }
                // Client side keeps the rest, still in terms of the lambda
                // parameter.
                match &args[0] {
                    OpArg::Lambda(l) => {
                        assert!(matches!(&*l.body, Expr::ClientCall { .. }));
                    }
                    other => panic!("expected residual lambda, got {:?}", other),
                }
            }
            other => panic!("expected client filter, got {:?}", other),
        }
    }

    #[test]
    fn test_distinct_skip_take_wraps_window() {
        let q = Expr::source("rows")
            .distinct()
            .skip(Expr::lit(2))
            .take(Expr::lit(5));
        match compose_query(&q) {
            Expr::Query(RelationalQuery::Enumerable { select }) => {
                assert_eq!(select.limit, Some(Expr::lit(5)));
                assert_eq!(select.offset, Some(Expr::lit(2)));
                assert!(!select.distinct);
                match select.table.as_ref().unwrap() {
                    Table::Derived { select: inner, .. } => assert!(inner.distinct),
                    other => panic!("expected derived table, got {:?}", other),
                }
            }
            other => panic!("expected enumerable query, got {:?}", other),
        }
    }

    #[test]
    fn test_first_leaves_client_reducer_over_limit_probe() {
        let q = Expr::source("rows").first();
        match compose_query(&q) {
            Expr::Apply { op: OpKind::First, source, args } => {
                assert!(args.is_empty());
                match &*source {
                    Expr::Query(RelationalQuery::Enumerable { select }) => {
                        assert_eq!(select.limit, Some(Expr::lit(1)));
                    }
                    other => panic!("expected query source, got {:?}", other),
                }
            }
            other => panic!("expected client reducer, got {:?}", other),
        }
    }

    #[test]
    fn test_single_probes_two_rows() {
        let q = Expr::source("rows").single();
        match compose_query(&q) {
            Expr::Apply { op: OpKind::Single, source, .. } => match &*source {
                Expr::Query(RelationalQuery::Enumerable { select }) => {
                    assert_eq!(select.limit, Some(Expr::lit(2)));
                }
                other => panic!("expected query source, got {:?}", other),
            },
            other => panic!("expected client reducer, got {:?}", other),
        }
    }

    #[test]
    fn test_join_with_client_key_falls_back_whole() {
        let q = Expr::source("rows").join(
            Expr::source("others"),
            Lambda::new("x", Expr::ClientCall {
                function: client_true(),
                args: vec![Expr::member(Expr::var("x"), "a")],
            }),
            Lambda::new("y", Expr::member(Expr::var("y"), "a")),
            Lambda::new2("x", "y", Expr::var("x")),
        );
        match compose_query(&q) {
            Expr::Apply { op: OpKind::Join, source, args } => {
                assert!(matches!(&*source, Expr::Query(_)));
                // The inner source argument composed to a query as well, so
                // both sides stream fully into the client join.
                assert!(matches!(&args[0], OpArg::Value(Expr::Query(_))));
            }
            other => panic!("expected client join, got {:?}", other),
        }
    }

    #[test]
    fn test_aggregate_over_server_selector_translates() {
        let q = Expr::source("rows").sum(Lambda::new("x", Expr::member(Expr::var("x"), "a")));
        match compose_query(&q) {
            Expr::Query(RelationalQuery::SingleValue { select }) => match &select.projection {
                Projection::Server(Expr::Aggregate { func: AggFn::Sum, operand }) => {
                    assert!(operand.is_some());
                }
                other => panic!("expected aggregate projection, got {:?}", other),
            },
            other => panic!("expected scalar query, got {:?}", other),
        }
    }

    #[test]
    fn test_group_by_with_aggregate_result_selector() {
        let q = Expr::source("rows").apply(
            OpKind::GroupBy,
            vec![
                OpArg::Lambda(Lambda::new("x", Expr::member(Expr::var("x"), "b"))),
                OpArg::Lambda(Lambda::new2(
                    "k",
                    "g",
                    Expr::Record(vec![
                        ("key".to_string(), Expr::var("k")),
                        (
                            "total".to_string(),
                            Expr::Apply {
                                op: OpKind::Sum,
                                source: Box::new(Expr::var("g")),
                                args: vec![OpArg::Lambda(Lambda::new(
                                    "x",
                                    Expr::member(Expr::var("x"), "a"),
                                ))],
                            },
                        ),
                    ]),
                )),
            ],
        );
        match compose_query(&q) {
            Expr::Query(RelationalQuery::Enumerable { select }) => {
                assert!(select.grouping.is_some());
                match &select.projection {
                    Projection::Server(Expr::Record(fields)) => {
                        assert!(matches!(fields[1].1, Expr::Aggregate { func: AggFn::Sum, .. }));
                    }
                    other => panic!("expected record projection, got {:?}", other),
                }
            }
            other => panic!("expected enumerable query, got {:?}", other),
        }
    }

    #[test]
    fn test_unresolved_group_by_expands_to_correlated_subquery() {
        let q = Expr::source("rows").group_by(Lambda::new("x", Expr::member(Expr::var("x"), "b")));
        match compose_query(&q) {
            Expr::Query(RelationalQuery::Enumerable { select }) => {
                assert!(select.grouping.is_some());
                match &select.projection {
                    Projection::Server(Expr::Grouping { elements, .. }) => {
                        assert!(matches!(&**elements, Expr::Query(_)));
                    }
                    other => panic!("expected expanded grouping, got {:?}", other),
                }
            }
            other => panic!("expected enumerable query, got {:?}", other),
        }
    }

    #[test]
    fn test_any_builds_exists_scalar() {
        let q = Expr::source("rows").any();
        match compose_query(&q) {
            Expr::Query(RelationalQuery::SingleValue { select }) => match &select.projection {
                Projection::Server(Expr::Case { test, .. }) => {
                    assert!(matches!(&**test, Expr::Exists(_)));
                }
                other => panic!("expected exists case, got {:?}", other),
            },
            other => panic!("expected scalar query, got {:?}", other),
        }
    }

    #[test]
    fn test_element_at_always_degrades() {
        let q = Expr::source("rows").apply(OpKind::ElementAt, vec![OpArg::Value(Expr::lit(1))]);
        assert!(matches!(
            compose_query(&q),
            Expr::Apply { op: OpKind::ElementAt, .. }
        ));
    }
}
