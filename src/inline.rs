//! splices captured sub-queries into the main tree.
//!
//! A lambda body can reference another query captured from the caller's
//! environment (the inner side of a flat-map, a join source built
//! elsewhere).  Before composition, those captures are replaced by the
//! captured query's own operator chain so cross-source rules can see through
//! them.  Runs only on a cache miss; on a hit the spliced shape is already
//! baked into the plan.

use crate::expr::{self, Capture, CapturedValue, Expr};

pub fn inline(e: &Expr) -> Expr {
    expr::transform(e, &mut |node| match node {
        Expr::Capture(Capture { value: CapturedValue::Query(q), .. }) => {
            // The spliced tree may itself capture further queries.
            Some(inline(q))
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Lambda;

    #[test]
    fn test_inline_replaces_query_captures() {
        let inner = Expr::source("orders");
        let q = Expr::source("customers").flat_map(
            Lambda::new("c", Expr::capture_query("orders_q", inner.clone())),
            Lambda::new2("c", "o", Expr::var("o")),
        );
        let out = inline(&q);
        match out {
            Expr::Apply { args, .. } => match &args[0] {
                expr::OpArg::Lambda(l) => assert_eq!(*l.body, inner),
                _ => panic!("expected lambda arg"),
            },
            _ => panic!("expected apply"),
        }
    }
}
