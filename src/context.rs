//! per-compilation state threaded through the composer and rewrite passes.
//!
//! A context lives for exactly one compilation and is discarded once the
//! plan exists.  Passes that need fresh table aliases draw them from here so
//! no two sources in one plan collide; nothing in the context is shared
//! between concurrent compilations.

use std::cell::Cell;
use std::sync::Arc;

use crate::metadata::Catalog;

pub struct ProcessingContext {
    pub catalog: Arc<Catalog>,
    next_alias: Cell<u32>,
}

impl ProcessingContext {
    pub fn new(catalog: Arc<Catalog>) -> ProcessingContext {
        ProcessingContext { catalog, next_alias: Cell::new(0) }
    }

    /// Returns a table alias unused anywhere in this compilation.
    pub fn fresh_alias(&self) -> String {
        let n = self.next_alias.get();
        self.next_alias.set(n + 1);
        format!("t{}", n)
    }
}

#[test]
fn test_fresh_alias_is_sequential() {
    let ctx = ProcessingContext::new(Arc::new(Catalog::new()));
    assert_eq!(ctx.fresh_alias(), "t0");
    assert_eq!(ctx.fresh_alias(), "t1");
    assert_eq!(ctx.fresh_alias(), "t2");
}
