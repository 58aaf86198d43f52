//! the plan cache: structural hash to compiled plan.
//!
//! Lookups and inserts must be thread-safe, but concurrent misses for the
//! same hash are allowed to race; both threads compile and whichever insert
//! lands last is retained.  Nothing blocks across threads while a plan
//! compiles.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::lower::CompiledPlan;
use crate::normalize::QueryHash;

/// Pluggable plan store.  The default keeps everything for the life of the
/// process; a bounded or evicting policy can be swapped in here.
pub trait PlanCache: Send + Sync {
    fn lookup(&self, hash: QueryHash) -> Option<Arc<CompiledPlan>>;
    fn insert(&self, hash: QueryHash, plan: Arc<CompiledPlan>);
}

#[derive(Default)]
pub struct MemoryCache {
    plans: RwLock<HashMap<u64, Arc<CompiledPlan>>>,
}

impl MemoryCache {
    pub fn new() -> MemoryCache {
        MemoryCache { plans: RwLock::new(HashMap::new()) }
    }

    pub fn len(&self) -> usize {
        self.plans.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.read().is_empty()
    }
}

impl PlanCache for MemoryCache {
    fn lookup(&self, hash: QueryHash) -> Option<Arc<CompiledPlan>> {
        self.plans.read().get(&hash.0).cloned()
    }

    fn insert(&self, hash: QueryHash, plan: Arc<CompiledPlan>) {
        self.plans.write().insert(hash.0, plan);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    fn dummy_plan() -> Arc<CompiledPlan> {
        Arc::new(CompiledPlan { root: Expr::lit(1), param_count: 0 })
    }

    #[test]
    fn test_lookup_insert() {
        let cache = MemoryCache::new();
        let hash = QueryHash(42);
        assert!(cache.lookup(hash).is_none());
        cache.insert(hash, dummy_plan());
        assert!(cache.lookup(hash).is_some());
        assert_eq!(cache.len(), 1);
        // Racing insert for the same hash: last one wins, still one entry.
        cache.insert(hash, dummy_plan());
        assert_eq!(cache.len(), 1);
    }
}
