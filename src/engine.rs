//! the compile-and-execute pipeline.
//!
//! One call to [`QueryEngine::execute`] runs the ordered stages: normalize
//! (parameterize + hash), cache lookup, and on a miss: inline captured
//! sub-queries, the interleaved optimize/compose passes, lowering to a
//! compiled plan, cache insert.  The compiled plan is then invoked with the
//! executor handle and the current captured values, in the order the
//! normalizer recorded them on *this* call.  Executor failures surface with
//! their original cause; invocation adds no wrapper of its own.

use std::sync::Arc;

use tracing::debug;

use crate::cache::{MemoryCache, PlanCache};
use crate::compose::Composer;
use crate::context::ProcessingContext;
use crate::dialect::{AnsiSqlDialect, SqlDialect};
use crate::error::Result;
use crate::expr::Expr;
use crate::inline;
use crate::lower::{self, Command};
use crate::metadata::Catalog;
use crate::normalize;
use crate::optimize;
use crate::value::{Row, Value};

/// The database boundary: accepts a finalized command plus the plan's
/// current parameter values, returns rows or a scalar.  Retries, pooling,
/// timeouts and cancellation all live behind this trait, not in the core.
pub trait CommandExecutor {
    fn rows(&self, command: &Command, params: &[Value]) -> Result<Vec<Row>>;
    fn scalar(&self, command: &Command, params: &[Value]) -> Result<Value>;
}

pub struct QueryEngine {
    catalog: Arc<Catalog>,
    cache: Arc<dyn PlanCache>,
    dialect: Arc<dyn SqlDialect>,
}

impl QueryEngine {
    pub fn new(catalog: Arc<Catalog>) -> QueryEngine {
        QueryEngine {
            catalog,
            cache: Arc::new(MemoryCache::new()),
            dialect: Arc::new(AnsiSqlDialect::new()),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn PlanCache>) -> QueryEngine {
        self.cache = cache;
        self
    }

    pub fn with_dialect(mut self, dialect: Arc<dyn SqlDialect>) -> QueryEngine {
        self.dialect = dialect;
        self
    }

    /// Compiles (or fetches) the plan for a query expression and invokes it.
    pub fn execute(&self, query: &Expr, executor: &dyn CommandExecutor) -> Result<Value> {
        let normalized = normalize::normalize(query);
        if let Some(plan) = self.cache.lookup(normalized.hash) {
            debug!(hash = %normalized.hash, "plan cache hit");
            return plan.invoke(executor, &normalized.params);
        }
        debug!(hash = %normalized.hash, "plan cache miss; compiling");
        let plan = self.compile(&normalized.expr, normalized.params.len())?;
        let plan = Arc::new(plan);
        self.cache.insert(normalized.hash, plan.clone());
        plan.invoke(executor, &normalized.params)
    }

    fn compile(&self, parameterized: &Expr, param_count: usize) -> Result<lower::CompiledPlan> {
        let ctx = ProcessingContext::new(self.catalog.clone());

        // Expand captured sub-queries so cross-source composition can see
        // through them.
        let mut expr = inline::inline(parameterized);

        // Each composing pass is preceded by every optimizing pass, and the
        // optimizing passes run once more at the end.
        let optimize_pass = |e: &Expr| optimize::optimize(e);
        let optimizing: Vec<&dyn Fn(&Expr) -> Expr> = vec![&optimize_pass];
        let composer = Composer::new(&ctx);
        let compose_pass = |e: &Expr| composer.compose(e);
        let composing: Vec<&dyn Fn(&Expr) -> Result<Expr>> = vec![&compose_pass];
        for compose_pass in &composing {
            for optimize_pass in &optimizing {
                expr = optimize_pass(&expr);
            }
            expr = compose_pass(&expr)?;
        }
        for optimize_pass in &optimizing {
            expr = optimize_pass(&expr);
        }

        lower::lower(&expr, self.dialect.as_ref(), param_count)
    }
}
