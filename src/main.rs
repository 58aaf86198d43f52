use std::sync::Arc;

use relq::{Catalog, Expr, Lambda, QueryEngine, TableShape, Value, ValueType};

// TODO: grow this into a small REPL over an attached database.
fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let catalog = Arc::new(Catalog::new().with_table(TableShape::new(
        "orders",
        vec![("id", ValueType::Int), ("region", ValueType::Text), ("amount", ValueType::Int)],
    )));
    let db = relq::memdb::MemDb::new().with_table(
        "orders",
        vec![("id", ValueType::Int), ("region", ValueType::Text), ("amount", ValueType::Int)],
        vec![
            vec![Value::Int(1), Value::Text("north".into()), Value::Int(120)],
            vec![Value::Int(2), Value::Text("south".into()), Value::Int(80)],
            vec![Value::Int(3), Value::Text("north".into()), Value::Int(45)],
        ],
    )?;
    let engine = QueryEngine::new(catalog);

    let threshold = |n: i64| {
        Expr::source("orders")
            .filter(Lambda::new(
                "o",
                Expr::binary(
                    relq::expr::BinaryOp::Ge,
                    Expr::member(Expr::var("o"), "amount"),
                    Expr::capture("n", Value::Int(n)),
                ),
            ))
            .map(Lambda::new("o", Expr::member(Expr::var("o"), "region")))
    };

    println!("regions with an order of at least 100:");
    println!("  {}", engine.execute(&threshold(100), &db)?);
    // Same shape, different captured value: served from the plan cache.
    println!("regions with an order of at least 50:");
    println!("  {}", engine.execute(&threshold(50), &db)?);
    Ok(())
}
