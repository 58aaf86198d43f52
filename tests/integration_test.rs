use std::sync::Arc;

use parking_lot::Mutex;

use relq::expr::BinaryOp;
use relq::lower::Command;
use relq::memdb::MemDb;
use relq::{
    Catalog, ClientFn, CommandExecutor, Error, Expr, Lambda, OpArg, OpKind, QueryEngine,
    TableShape, Value, ValueType,
};

fn catalog() -> Arc<Catalog> {
    Arc::new(
        Catalog::new()
            .with_table(TableShape::new(
                "items",
                vec![("a", ValueType::Int), ("b", ValueType::Int), ("c", ValueType::Text)],
            ))
            .with_table(TableShape::new(
                "customers",
                vec![("id", ValueType::Int), ("name", ValueType::Text)],
            ))
            .with_table(TableShape::new(
                "orders",
                vec![("cid", ValueType::Int), ("item", ValueType::Text)],
            )),
    )
}

fn items_db() -> MemDb {
    MemDb::new()
        .with_table(
            "items",
            vec![("a", ValueType::Int), ("b", ValueType::Int), ("c", ValueType::Text)],
            vec![
                vec![Value::Int(1), Value::Int(1), Value::Text("x".into())],
                vec![Value::Int(1), Value::Int(2), Value::Text("y".into())],
                vec![Value::Int(2), Value::Int(3), Value::Text("z".into())],
            ],
        )
        .unwrap()
}

fn joined_db() -> MemDb {
    MemDb::new()
        .with_table(
            "customers",
            vec![("id", ValueType::Int), ("name", ValueType::Text)],
            vec![
                vec![Value::Int(1), Value::Text("ann".into())],
                vec![Value::Int(2), Value::Text("bob".into())],
                vec![Value::Int(3), Value::Text("cid".into())],
            ],
        )
        .unwrap()
        .with_table(
            "orders",
            vec![("cid", ValueType::Int), ("item", ValueType::Text)],
            vec![
                vec![Value::Int(1), Value::Text("apples".into())],
                vec![Value::Int(1), Value::Text("pears".into())],
                vec![Value::Int(2), Value::Text("plums".into())],
            ],
        )
        .unwrap()
}

/// Delegates to MemDb while remembering every command text it saw, so tests
/// can check what actually went to the "server".
struct RecordingExecutor {
    db: MemDb,
    commands: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    fn new(db: MemDb) -> RecordingExecutor {
        RecordingExecutor { db, commands: Mutex::new(vec![]) }
    }

    fn texts(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

impl CommandExecutor for RecordingExecutor {
    fn rows(&self, command: &Command, params: &[Value]) -> relq::Result<Vec<relq::Row>> {
        self.commands.lock().push(command.text.clone());
        self.db.rows(command, params)
    }

    fn scalar(&self, command: &Command, params: &[Value]) -> relq::Result<Value> {
        self.commands.lock().push(command.text.clone());
        self.db.scalar(command, params)
    }
}

fn text_list(v: &Value) -> Vec<String> {
    match v {
        Value::List(items) => items
            .iter()
            .map(|i| i.as_text().expect("expected text").clone())
            .collect(),
        other => panic!("expected list, got {}", other),
    }
}

fn int_list(v: &Value) -> Vec<i64> {
    match v {
        Value::List(items) => items
            .iter()
            .map(|i| *i.as_int().expect("expected int"))
            .collect(),
        other => panic!("expected list, got {}", other),
    }
}

#[test]
fn test_end_to_end_and_split() {
    // a == 1 pushes to the server; the client-only predicate runs in
    // process; the result is the c values of the matching rows, in source
    // order.
    let client_only = ClientFn::new("client_only", |args| {
        Ok(Value::Bool(matches!(args[0].field("b"), Some(Value::Int(n)) if *n <= 2)))
    });
    let q = Expr::source("items")
        .filter(Lambda::new(
            "x",
            Expr::and(
                Expr::eq(Expr::member(Expr::var("x"), "a"), Expr::lit(1)),
                Expr::ClientCall { function: client_only, args: vec![Expr::var("x")] },
            ),
        ))
        .map(Lambda::new("x", Expr::member(Expr::var("x"), "c")));

    let executor = RecordingExecutor::new(items_db());
    let engine = QueryEngine::new(catalog());
    let result = engine.execute(&q, &executor).unwrap();
    assert_eq!(text_list(&result), vec!["x".to_string(), "y".to_string()]);

    // The server really saw the translatable half of the predicate.
    let texts = executor.texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("WHERE"), "no server predicate in: {}", texts[0]);
    assert!(texts[0].contains("= 1"), "a = 1 not pushed down in: {}", texts[0]);
}

#[test]
fn test_pushdown_window_applies_after_distinct() {
    // Duplicates collapse first; the window reads the distinct sequence.
    let db = MemDb::new()
        .with_table(
            "items",
            vec![("a", ValueType::Int), ("b", ValueType::Int), ("c", ValueType::Text)],
            (1..=6)
                .flat_map(|n| {
                    vec![
                        vec![Value::Int(n), Value::Int(0), Value::Text("d".into())],
                        vec![Value::Int(n), Value::Int(0), Value::Text("d".into())],
                    ]
                })
                .collect(),
        )
        .unwrap();
    let q = Expr::source("items")
        .map(Lambda::new("x", Expr::member(Expr::var("x"), "a")))
        .distinct()
        .skip(Expr::lit(2))
        .take(Expr::lit(3));
    let engine = QueryEngine::new(catalog());
    let result = engine.execute(&q, &db).unwrap();
    assert_eq!(int_list(&result), vec![3, 4, 5]);
}

#[test]
fn test_single_cardinality() {
    let engine = QueryEngine::new(catalog());
    let db = items_db();

    let one = Expr::source("items")
        .filter(Lambda::new(
            "x",
            Expr::eq(Expr::member(Expr::var("x"), "a"), Expr::lit(2)),
        ))
        .single();
    let row = engine.execute(&one, &db).unwrap();
    assert_eq!(row.field("c").unwrap(), &Value::Text("z".into()));

    let none = Expr::source("items")
        .filter(Lambda::new(
            "x",
            Expr::eq(Expr::member(Expr::var("x"), "a"), Expr::lit(9)),
        ))
        .single();
    assert!(matches!(engine.execute(&none, &db), Err(Error::NoElement)));

    let two = Expr::source("items")
        .filter(Lambda::new(
            "x",
            Expr::eq(Expr::member(Expr::var("x"), "a"), Expr::lit(1)),
        ))
        .single();
    assert!(matches!(engine.execute(&two, &db), Err(Error::MoreThanOneElement)));

    let defaulted = Expr::source("items")
        .filter(Lambda::new(
            "x",
            Expr::eq(Expr::member(Expr::var("x"), "a"), Expr::lit(9)),
        ))
        .apply(OpKind::FirstOrDefault, vec![]);
    assert_eq!(engine.execute(&defaulted, &db).unwrap(), Value::Null);
}

#[test]
fn test_join_with_client_key_matches_nested_loop() {
    // A client-only key selector forces the whole join into memory; the
    // pairing must equal a naive nested loop.
    let ident = ClientFn::new("ident", |args| Ok(args[0].clone()));
    let q = Expr::source("customers").join(
        Expr::source("orders"),
        Lambda::new(
            "c",
            Expr::ClientCall {
                function: ident.clone(),
                args: vec![Expr::member(Expr::var("c"), "id")],
            },
        ),
        Lambda::new("o", Expr::member(Expr::var("o"), "cid")),
        Lambda::new2(
            "c",
            "o",
            Expr::Record(vec![
                ("name".to_string(), Expr::member(Expr::var("c"), "name")),
                ("item".to_string(), Expr::member(Expr::var("o"), "item")),
            ]),
        ),
    );
    let engine = QueryEngine::new(catalog());
    let result = engine.execute(&q, &joined_db()).unwrap();
    let pairs: Vec<(String, String)> = match &result {
        Value::List(items) => items
            .iter()
            .map(|r| {
                (
                    r.field("name").unwrap().as_text().unwrap().clone(),
                    r.field("item").unwrap().as_text().unwrap().clone(),
                )
            })
            .collect(),
        other => panic!("expected list, got {}", other),
    };
    assert_eq!(
        pairs,
        vec![
            ("ann".to_string(), "apples".to_string()),
            ("ann".to_string(), "pears".to_string()),
            ("bob".to_string(), "plums".to_string()),
        ]
    );
}

#[test]
fn test_server_join_pairs_on_server() {
    let q = Expr::source("customers").join(
        Expr::source("orders"),
        Lambda::new("c", Expr::member(Expr::var("c"), "id")),
        Lambda::new("o", Expr::member(Expr::var("o"), "cid")),
        Lambda::new2(
            "c",
            "o",
            Expr::Record(vec![
                ("name".to_string(), Expr::member(Expr::var("c"), "name")),
                ("item".to_string(), Expr::member(Expr::var("o"), "item")),
            ]),
        ),
    );
    let executor = RecordingExecutor::new(joined_db());
    let engine = QueryEngine::new(catalog());
    let result = engine.execute(&q, &executor).unwrap();
    match result {
        Value::List(items) => assert_eq!(items.len(), 3),
        other => panic!("expected list, got {}", other),
    }
    let texts = executor.texts();
    assert_eq!(texts.len(), 1, "server join must be a single command");
    assert!(texts[0].contains("INNER JOIN"), "no join in: {}", texts[0]);
}

#[test]
fn test_group_by_with_aggregates() {
    let q = Expr::source("items").apply(
        OpKind::GroupBy,
        vec![
            OpArg::Lambda(Lambda::new("x", Expr::member(Expr::var("x"), "a"))),
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
                                Expr::member(Expr::var("x"), "b"),
                            ))],
                        },
                    ),
                    (
                        "n".to_string(),
                        Expr::Apply {
                            op: OpKind::Count,
                            source: Box::new(Expr::var("g")),
                            args: vec![],
                        },
                    ),
                ]),
            )),
        ],
    );
    let engine = QueryEngine::new(catalog());
    let result = engine.execute(&q, &items_db()).unwrap();
    match result {
        Value::List(groups) => {
            assert_eq!(groups.len(), 2);
            assert_eq!(groups[0].field("key").unwrap(), &Value::Int(1));
            assert_eq!(groups[0].field("total").unwrap(), &Value::Int(3));
            assert_eq!(groups[0].field("n").unwrap(), &Value::Int(2));
            assert_eq!(groups[1].field("key").unwrap(), &Value::Int(2));
            assert_eq!(groups[1].field("total").unwrap(), &Value::Int(3));
            assert_eq!(groups[1].field("n").unwrap(), &Value::Int(1));
        }
        other => panic!("expected list, got {}", other),
    }
}

#[test]
fn test_group_join_with_default_becomes_left_join() {
    // customers flat-mapped over their group of orders with a default:
    // every customer appears; customers without orders pair with NULL.
    let q = Expr::source("customers")
        .group_join(
            Expr::source("orders"),
            Lambda::new("c", Expr::member(Expr::var("c"), "id")),
            Lambda::new("o", Expr::member(Expr::var("o"), "cid")),
            Lambda::new2(
                "c",
                "gs",
                Expr::Record(vec![
                    ("c".to_string(), Expr::var("c")),
                    ("gs".to_string(), Expr::var("gs")),
                ]),
            ),
        )
        .flat_map(
            Lambda::new(
                "p",
                Expr::member(Expr::var("p"), "gs").apply(OpKind::DefaultIfEmpty, vec![]),
            ),
            Lambda::new2(
                "p",
                "o",
                Expr::Record(vec![
                    (
                        "name".to_string(),
                        Expr::member(Expr::member(Expr::var("p"), "c"), "name"),
                    ),
                    ("item".to_string(), Expr::member(Expr::var("o"), "item")),
                ]),
            ),
        );
    let executor = RecordingExecutor::new(joined_db());
    let engine = QueryEngine::new(catalog());
    let result = engine.execute(&q, &executor).unwrap();
    let pairs: Vec<(String, Value)> = match &result {
        Value::List(items) => items
            .iter()
            .map(|r| {
                (
                    r.field("name").unwrap().as_text().unwrap().clone(),
                    r.field("item").unwrap().clone(),
                )
            })
            .collect(),
        other => panic!("expected list, got {}", other),
    };
    assert_eq!(
        pairs,
        vec![
            ("ann".to_string(), Value::Text("apples".into())),
            ("ann".to_string(), Value::Text("pears".into())),
            ("bob".to_string(), Value::Text("plums".into())),
            ("cid".to_string(), Value::Null),
        ]
    );
    let texts = executor.texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("LEFT JOIN"), "no left join in: {}", texts[0]);
}

#[test]
fn test_scalar_operators() {
    let engine = QueryEngine::new(catalog());
    let db = items_db();

    let count = Expr::source("items").count();
    assert_eq!(engine.execute(&count, &db).unwrap(), Value::Int(3));

    let sum = Expr::source("items").sum(Lambda::new("x", Expr::member(Expr::var("x"), "b")));
    assert_eq!(engine.execute(&sum, &db).unwrap(), Value::Int(6));

    let any = Expr::source("items")
        .filter(Lambda::new(
            "x",
            Expr::eq(Expr::member(Expr::var("x"), "a"), Expr::lit(2)),
        ))
        .any();
    assert_eq!(engine.execute(&any, &db).unwrap(), Value::Bool(true));

    let all = Expr::source("items").apply(
        OpKind::All,
        vec![OpArg::Lambda(Lambda::new(
            "x",
            Expr::binary(BinaryOp::Lt, Expr::member(Expr::var("x"), "b"), Expr::lit(10)),
        ))],
    );
    assert_eq!(engine.execute(&all, &db).unwrap(), Value::Bool(true));

    let all_no = Expr::source("items").apply(
        OpKind::All,
        vec![OpArg::Lambda(Lambda::new(
            "x",
            Expr::binary(BinaryOp::Lt, Expr::member(Expr::var("x"), "b"), Expr::lit(3)),
        ))],
    );
    assert_eq!(engine.execute(&all_no, &db).unwrap(), Value::Bool(false));

    let contains = Expr::source("items")
        .map(Lambda::new("x", Expr::member(Expr::var("x"), "a")))
        .apply(OpKind::Contains, vec![OpArg::Value(Expr::lit(2))]);
    assert_eq!(engine.execute(&contains, &db).unwrap(), Value::Bool(true));
}

#[test]
fn test_captured_count_parameterizes() {
    let engine = QueryEngine::new(catalog());
    let db = items_db();
    let take = |n: i64| {
        Expr::source("items")
            .map(Lambda::new("x", Expr::member(Expr::var("x"), "b")))
            .take(Expr::capture("n", Value::Int(n)))
    };
    assert_eq!(int_list(&engine.execute(&take(2), &db).unwrap()), vec![1, 2]);
    // Same shape, new captured value: the cached plan must honor it.
    assert_eq!(int_list(&engine.execute(&take(1), &db).unwrap()), vec![1]);
}

#[test]
fn test_ordering_with_then_by() {
    let q = Expr::source("items")
        .order_by_desc(Lambda::new("x", Expr::member(Expr::var("x"), "a")))
        .then_by(Lambda::new("x", Expr::member(Expr::var("x"), "b")))
        .map(Lambda::new("x", Expr::member(Expr::var("x"), "c")));
    let engine = QueryEngine::new(catalog());
    let result = engine.execute(&q, &items_db()).unwrap();
    assert_eq!(
        text_list(&result),
        vec!["z".to_string(), "x".to_string(), "y".to_string()]
    );
}

#[test]
fn test_union_dedups_concat_does_not() {
    let engine = QueryEngine::new(catalog());
    let db = items_db();
    let a = Expr::source("items").map(Lambda::new("x", Expr::member(Expr::var("x"), "a")));

    let union = a.clone().apply(OpKind::Union, vec![OpArg::Value(a.clone())]);
    assert_eq!(int_list(&engine.execute(&union, &db).unwrap()), vec![1, 2]);

    let concat = a.clone().apply(OpKind::Concat, vec![OpArg::Value(a)]);
    assert_eq!(
        int_list(&engine.execute(&concat, &db).unwrap()),
        vec![1, 1, 2, 1, 1, 2]
    );
}

#[test]
fn test_captured_subquery_inlines() {
    // The inner query is captured from the environment, spliced in by the
    // inliner, and still composes server-side.
    let inner = Expr::source("orders");
    let q = Expr::source("customers").flat_map(
        Lambda::new("c", Expr::capture_query("inner_q", inner)),
        Lambda::new2("c", "o", Expr::member(Expr::var("o"), "item")),
    );
    let executor = RecordingExecutor::new(joined_db());
    let engine = QueryEngine::new(catalog());
    let result = engine.execute(&q, &executor).unwrap();
    match result {
        // Cross join: 3 customers x 3 orders.
        Value::List(items) => assert_eq!(items.len(), 9),
        other => panic!("expected list, got {}", other),
    }
    assert_eq!(executor.texts().len(), 1);
}

#[test]
fn test_unresolved_group_by_materializes_groups() {
    // No result selector consumes the group, so the marker survives to the
    // top and expands into a correlated member subquery.
    let q = Expr::source("items").group_by(Lambda::new("x", Expr::member(Expr::var("x"), "a")));
    let engine = QueryEngine::new(catalog());
    let result = engine.execute(&q, &items_db()).unwrap();
    match result {
        Value::List(groups) => {
            assert_eq!(groups.len(), 2);
            match &groups[0] {
                Value::Group { key, items } => {
                    assert_eq!(**key, Value::Int(1));
                    assert_eq!(items.len(), 2);
                    assert_eq!(items[0].field("c").unwrap(), &Value::Text("x".into()));
                }
                other => panic!("expected group, got {}", other),
            }
            match &groups[1] {
                Value::Group { key, items } => {
                    assert_eq!(**key, Value::Int(2));
                    assert_eq!(items.len(), 1);
                }
                other => panic!("expected group, got {}", other),
            }
        }
        other => panic!("expected list, got {}", other),
    }
}
